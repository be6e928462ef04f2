//! Ring slot access
//!
//! `PACKET_RX_RING` with `TPACKET_V2`: the region is `block_count` blocks of
//! `block_size` bytes, each block holding `block_size / frame_size` slots.
//! A slot starts with a `tpacket2_hdr`, followed by the `sockaddr_ll` and then
//! the packet at `tp_mac`. The status word at offset 0 is the only field
//! shared with the kernel while the slot is kernel-owned.
//!
//! ```text
//!  0        4        8        12   14   16       20       24         32        42
//!  ┌────────┬────────┬────────┬────┬────┬────────┬────────┬───//────┬───//───┬──┬──...──┬────────────┐
//!  │ status │  len   │snaplen │mac │net │  sec   │  nsec  │ vlan/pad │  sll_* │pt│       │ can_frame  │
//!  └────────┴────────┴────────┴────┴────┴────────┴────────┴───//────┴───//───┴──┴──...──┴────────────┘
//!                                                                                        ^ tp_mac
//! ```

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::config::RingConfig;
use crate::error::{CanBusError, Result};
use crate::wire::{WireFrame, WIRE_FRAME_SIZE};

pub(crate) const TP_STATUS_KERNEL: u32 = 0;
pub(crate) const TP_STATUS_USER: u32 = 1 << 0;
pub(crate) const TP_STATUS_LOSING: u32 = 1 << 2;

/// `sizeof(struct tpacket2_hdr)`
pub(crate) const TPACKET2_HDRLEN: usize = 32;

const OFFSET_SNAPLEN: usize = 8;
const OFFSET_MAC: usize = 12;
/// `sockaddr_ll` follows the header at `TPACKET_ALIGN(sizeof(tpacket2_hdr))`
const OFFSET_SLL: usize = TPACKET2_HDRLEN;
const OFFSET_PKTTYPE: usize = OFFSET_SLL + 10;

/// Kernel-shared slot array
///
/// Owns no memory: it borrows a region that outlives it (the mapping held by
/// the same `RingResources`, or a test buffer).
#[derive(Debug)]
pub(crate) struct SlotRegion {
    base: NonNull<u8>,
    len: usize,
    block_size: usize,
    frame_size: usize,
    frames_per_block: usize,
    slot_count: usize,
}

// SAFETY: the region is plain shared memory; slot ownership is arbitrated by
// the atomic status word and only the reception task reads or releases slots
unsafe impl Send for SlotRegion {}
unsafe impl Sync for SlotRegion {}

/// One received packet copied out of a user-owned slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotPacket {
    /// A full wire frame and its `sll_pkttype`
    Frame { raw: WireFrame, pkttype: u8 },
    /// A packet that is not a classic CAN frame (e.g. CAN FD)
    Unsupported { len: usize },
}

impl SlotRegion {
    /// Describe `len` bytes at `base` with the given ring geometry
    ///
    /// # Safety
    ///
    /// `base` must be valid for reads and writes of `len` bytes, aligned to at
    /// least 4 bytes, for the whole lifetime of the returned value.
    pub(crate) unsafe fn new(base: *mut u8, len: usize, ring: &RingConfig) -> Result<Self> {
        let base = NonNull::new(base)
            .ok_or_else(|| CanBusError::config("ring region base is null"))?;
        if base.as_ptr() as usize % std::mem::align_of::<AtomicU32>() != 0 {
            return Err(CanBusError::config("ring region is not 4-byte aligned"));
        }
        if ring.frame_size < TPACKET2_HDRLEN + WIRE_FRAME_SIZE
            || ring.frames_per_block() == 0
            || len < ring.region_size()
        {
            return Err(CanBusError::config(format!(
                "ring geometry does not fit a region of {len} bytes"
            )));
        }
        Ok(Self {
            base,
            len,
            block_size: ring.block_size,
            frame_size: ring.frame_size,
            frames_per_block: ring.frames_per_block(),
            slot_count: ring.frame_count(),
        })
    }

    pub(crate) fn slot_count(&self) -> usize {
        self.slot_count
    }

    fn offset(&self, index: usize) -> usize {
        let index = index % self.slot_count;
        (index / self.frames_per_block) * self.block_size
            + (index % self.frames_per_block) * self.frame_size
    }

    /// Slot at `index`, wrapping at the region end
    pub(crate) fn slot(&self, index: usize) -> Slot<'_> {
        let offset = self.offset(index);
        debug_assert!(offset + self.frame_size <= self.len);
        Slot {
            region: self,
            offset,
        }
    }
}

/// One cell of the ring
pub(crate) struct Slot<'a> {
    region: &'a SlotRegion,
    offset: usize,
}

impl Slot<'_> {
    fn ptr(&self, at: usize) -> *mut u8 {
        // SAFETY: offset + at stays within the slot, inside the region
        unsafe { self.region.base.as_ptr().add(self.offset + at) }
    }

    fn status_word(&self) -> &AtomicU32 {
        // SAFETY: slot offsets are multiples of 16 from a 4-aligned base, and
        // AtomicU32 has the layout of u32
        unsafe { &*self.ptr(0).cast::<AtomicU32>() }
    }

    /// Status word, with acquire ordering so slot contents are visible
    pub(crate) fn status(&self) -> u32 {
        self.status_word().load(Ordering::Acquire)
    }

    pub(crate) fn is_user_owned(&self) -> bool {
        self.status() & TP_STATUS_USER != 0
    }

    fn read_u16(&self, at: usize) -> u16 {
        // SAFETY: in-bounds, read only while the slot is user-owned
        unsafe { self.ptr(at).cast::<u16>().read_unaligned() }
    }

    fn read_u32(&self, at: usize) -> u32 {
        // SAFETY: in-bounds, read only while the slot is user-owned
        unsafe { self.ptr(at).cast::<u32>().read_unaligned() }
    }

    /// Copy the packet out of a user-owned slot
    ///
    /// Returns `None` when the header points outside the slot.
    pub(crate) fn packet(&self) -> Option<SlotPacket> {
        debug_assert!(self.is_user_owned());
        let snaplen = self.read_u32(OFFSET_SNAPLEN) as usize;
        let mac = self.read_u16(OFFSET_MAC) as usize;
        if mac < OFFSET_PKTTYPE || mac + snaplen > self.region.frame_size {
            return None;
        }
        if snaplen != WIRE_FRAME_SIZE {
            return Some(SlotPacket::Unsupported { len: snaplen });
        }
        // SAFETY: in-bounds byte read
        let pkttype = unsafe { self.ptr(OFFSET_PKTTYPE).read() };
        let mut raw = [0u8; WIRE_FRAME_SIZE];
        // SAFETY: mac + 16 <= frame_size was checked above; raw is a distinct buffer
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr(mac), raw.as_mut_ptr(), WIRE_FRAME_SIZE);
        }
        Some(SlotPacket::Frame { raw, pkttype })
    }

    /// Hand the slot back to the kernel; contents must not be read afterwards
    pub(crate) fn release(self) {
        self.status_word().store(TP_STATUS_KERNEL, Ordering::Release);
    }
}

/// Result of one sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Sweep {
    /// Slots consumed and returned to the kernel
    pub consumed: usize,
    /// Whether any consumed slot carried the kernel's loss marker
    pub losing: bool,
}

/// Walk user-owned slots from `cursor` in ring order until a kernel-owned slot
///
/// At most one full revolution per call, so the caller regains control under
/// sustained load. Every consumed slot is released before the cursor advances.
pub(crate) fn sweep<F>(region: &SlotRegion, cursor: &mut usize, mut on_packet: F) -> Sweep
where
    F: FnMut(Option<SlotPacket>),
{
    let mut outcome = Sweep::default();
    while outcome.consumed < region.slot_count() {
        let slot = region.slot(*cursor);
        let status = slot.status();
        if status & TP_STATUS_USER == 0 {
            break;
        }
        outcome.losing |= status & TP_STATUS_LOSING != 0;
        on_packet(slot.packet());
        slot.release();
        *cursor = (*cursor + 1) % region.slot_count();
        outcome.consumed += 1;
    }
    outcome
}
