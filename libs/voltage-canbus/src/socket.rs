//! SocketCAN raw socket
//!
//! Wraps a `socketcan::CanSocket` bound to one interface. Socket options go
//! through the `socketcan` option traits; frame I/O moves whole 16-byte wire
//! frames through `socket2`, so serialization stays in [`crate::wire`] and the
//! frame flags byte survives the trip.

use socket2::SockRef;
use socketcan::{Socket, SocketOptions};
use std::ffi::CString;
use std::fmt;
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::error::{CanBusError, Result};
use crate::frame::Frame;
use crate::wire::{self, WireFrame, WIRE_FRAME_SIZE};

/// Resolve an interface name to its kernel index
pub fn interface_index(name: &str) -> Result<u32> {
    let c_name = CString::new(name)
        .map_err(|_| CanBusError::config(format!("invalid interface name: {name:?}")))?;
    // SAFETY: c_name is a valid NUL-terminated string for the duration of the call
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if index == 0 {
        return Err(CanBusError::InterfaceNotFound {
            name: name.to_string(),
            source: io::Error::last_os_error(),
        });
    }
    Ok(index)
}

/// Raw CAN socket bound to one interface
///
/// `close` marks the socket closed for every holder; the descriptor itself is
/// released when the last owner drops it, so a reader never races a reused
/// descriptor number.
pub struct CanSocket {
    inner: socketcan::CanSocket,
    interface: String,
    closed: AtomicBool,
}

impl CanSocket {
    /// Open a raw CAN socket bound to the named interface ("can0", "vcan0")
    pub fn open(interface: &str) -> Result<Self> {
        let if_index = interface_index(interface)?;
        let inner = socketcan::CanSocket::open(interface)
            .map_err(|e| CanBusError::resource("open CAN socket", e))?;

        debug!("Opened CAN socket on {} (ifindex {})", interface, if_index);
        Ok(Self {
            inner,
            interface: interface.to_string(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Bound every blocking read; a timed-out read fails with `WouldBlock`
    pub fn set_read_timeout(&self, timeout: Duration) -> Result<()> {
        self.inner
            .set_read_timeout(timeout)
            .map_err(|e| CanBusError::resource("set SO_RCVTIMEO", e))
    }

    /// Deliver frames sent on this socket back to it
    pub fn set_recv_own_msgs(&self, enabled: bool) -> Result<()> {
        self.inner
            .set_recv_own_msgs(enabled)
            .map_err(|e| CanBusError::resource("set CAN_RAW_RECV_OWN_MSGS", e))
    }

    /// Loop sent frames back to other sockets on this host
    pub fn set_loopback(&self, enabled: bool) -> Result<()> {
        self.inner
            .set_loopback(enabled)
            .map_err(|e| CanBusError::resource("set CAN_RAW_LOOPBACK", e))
    }

    /// Install an empty filter list so the socket receives nothing (send-only)
    pub fn disable_reception(&self) -> Result<()> {
        self.inner
            .set_filter_drop_all()
            .map_err(|e| CanBusError::resource("set CAN_RAW_FILTER", e))
    }

    /// Mark the socket closed for every holder
    ///
    /// A read already blocked in the kernel is not interrupted; it returns at
    /// its read timeout and the reader then sees the closed flag. Later reads
    /// fail with `NotConnected` and later writes with `CanBusError::NotConnected`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Run `op` on a `socket2` view of the descriptor
    fn with_sock<R>(&self, op: impl FnOnce(SockRef<'_>) -> io::Result<R>) -> io::Result<R> {
        // SAFETY: the descriptor is owned by `inner` and outlives this call
        let fd = unsafe { BorrowedFd::borrow_raw(self.inner.as_raw_fd()) };
        op(SockRef::from(&fd))
    }

    /// Receive one record into `buf`, returning its length
    pub(crate) fn recv_raw(&self, buf: &mut WireFrame, flags: libc::c_int) -> io::Result<usize> {
        if self.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "CAN socket closed",
            ));
        }
        // SAFETY: MaybeUninit<u8> has the layout of u8 and recv only writes
        // initialised bytes into the buffer
        let uninit = unsafe {
            &mut *(buf as *mut WireFrame).cast::<[MaybeUninit<u8>; WIRE_FRAME_SIZE]>()
        };
        self.with_sock(|sock| sock.recv_with_flags(uninit, flags))
    }

    /// Blocking read of exactly one wire frame (bounded by the read timeout)
    pub fn read_wire(&self) -> Result<WireFrame> {
        let mut buf = [0u8; WIRE_FRAME_SIZE];
        let n = self.recv_raw(&mut buf, 0)?;
        if n != WIRE_FRAME_SIZE {
            return Err(CanBusError::ShortRead {
                read: n,
                expected: WIRE_FRAME_SIZE,
            });
        }
        Ok(buf)
    }

    /// Write exactly one wire frame
    pub fn write_wire(&self, buf: &WireFrame) -> Result<()> {
        if self.is_closed() {
            return Err(CanBusError::NotConnected);
        }
        let n = self.with_sock(|sock| sock.send(buf))?;
        if n != WIRE_FRAME_SIZE {
            return Err(CanBusError::ShortWrite {
                written: n,
                expected: WIRE_FRAME_SIZE,
            });
        }
        Ok(())
    }

    /// Serialize and write one frame
    pub fn write_frame(&self, frame: &Frame) -> Result<()> {
        self.write_wire(&wire::encode(frame))
    }
}

impl AsRawFd for CanSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

impl fmt::Debug for CanSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CanSocket")
            .field("interface", &self.interface)
            .field("fd", &self.as_raw_fd())
            .field("closed", &self.is_closed())
            .finish()
    }
}
