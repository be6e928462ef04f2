//! Ring-Buffer transport (`socketcan-ring`)
//!
//! Reception goes through an `AF_PACKET` socket with a `TPACKET_V2`
//! `PACKET_RX_RING`: the kernel writes each arriving frame into a slot of a
//! region mapped into this process and flips the slot's status word. The
//! reception task sweeps user-owned slots in ring order, hands them back, and
//! sleeps `ring.poll_interval_ms` once the ring is drained. Sends go through an
//! ordinary raw CAN socket that is configured to receive nothing.
//!
//! The packet socket sees every frame on the interface, including the copies
//! of local transmissions. Outgoing taps are always skipped. The local echo of
//! a send arrives like any received frame (`PACKET_BROADCAST`), so every
//! incoming frame is matched against a queue of this transport's recent sends
//! and a match is skipped unless `receive_own_messages` is set.

mod region;

use async_trait::async_trait;
use memmap2::{MmapOptions, MmapRaw};
use parking_lot::{Mutex as SyncMutex, RwLock};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::collections::VecDeque;
use std::io;
use std::mem::size_of;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::region::{sweep, SlotPacket, SlotRegion};
use super::task::{deliver_wire, ReceptionTask};
use crate::bus::{Bus, BusStats, FrameListener, Reception, ReceptionState};
use crate::config::{BusConfig, RingConfig};
use crate::error::{CanBusError, Result};
use crate::frame::Frame;
use crate::socket::{self, CanSocket};
use crate::wire::{self, WireFrame};

// constants from linux/if_packet.h and linux/if_ether.h
const SOL_PACKET: libc::c_int = 263;
const PACKET_RX_RING: libc::c_int = 5;
const PACKET_STATISTICS: libc::c_int = 6;
const PACKET_VERSION: libc::c_int = 10;
const TPACKET_V2: libc::c_int = 1;
const ETH_P_CAN: u16 = 0x000C;

const PACKET_OUTGOING: u8 = 4;

/// Sends remembered for own-echo matching
const OWN_ECHO_CAPACITY: usize = 1024;

#[repr(C)]
struct TpacketReq {
    block_size: u32,
    block_nr: u32,
    frame_size: u32,
    frame_nr: u32,
}

#[repr(C)]
#[derive(Default)]
struct TpacketStats {
    packets: u32,
    drops: u32,
}

/// Mapped ring plus both sockets; dropped only after the reception task exits
struct RingResources {
    region: SlotRegion,
    // Unmapped before the packet socket closes
    _map: MmapRaw,
    packet: Socket,
    sender: CanSocket,
}

impl RingResources {
    fn open(channel: &str, config: &BusConfig) -> Result<Self> {
        let if_index = socket::interface_index(channel)?;
        let ring = &config.ring;

        let packet = Socket::new(
            Domain::from(libc::AF_PACKET),
            Type::RAW,
            Some(Protocol::from(libc::c_int::from(ETH_P_CAN.to_be()))),
        )
        .map_err(|e| CanBusError::resource("create packet socket", e))?;

        set_option(&packet, PACKET_VERSION, &TPACKET_V2)
            .map_err(|e| CanBusError::resource("set PACKET_VERSION", e))?;

        let req = ring_request(ring)?;
        set_option(&packet, PACKET_RX_RING, &req)
            .map_err(|e| CanBusError::resource("set PACKET_RX_RING", e))?;

        let map = MmapOptions::new()
            .len(ring.region_size())
            .map_raw(packet.as_raw_fd())
            .map_err(|e| CanBusError::resource("map packet ring", e))?;

        // SAFETY: the mapping is page-aligned, region_size bytes long and is
        // kept alive next to the region in this struct
        let region = unsafe { SlotRegion::new(map.as_mut_ptr(), map.len(), ring)? };

        packet
            .bind(&link_address(if_index)?)
            .map_err(|e| CanBusError::resource("bind packet socket", e))?;

        let sender = super::open_raw_socket(channel, config, config.read_timeout())?;
        sender.disable_reception()?;

        debug!(
            "Mapped {} byte ring on {} ({} slots of {} bytes)",
            ring.region_size(),
            channel,
            region.slot_count(),
            ring.frame_size
        );
        Ok(Self {
            region,
            _map: map,
            packet,
            sender,
        })
    }

    /// Read and reset the kernel's drop counter for this socket
    fn take_kernel_drops(&self) -> io::Result<u32> {
        let mut stats = TpacketStats::default();
        let mut len = size_of::<TpacketStats>() as libc::socklen_t;
        // SAFETY: stats is a writable tpacket_stats of len bytes
        let rv = unsafe {
            libc::getsockopt(
                self.packet.as_raw_fd(),
                SOL_PACKET,
                PACKET_STATISTICS,
                (&mut stats as *mut TpacketStats).cast::<libc::c_void>(),
                &mut len,
            )
        };
        if rv == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(stats.drops)
    }
}

/// Set a `SOL_PACKET` option from a plain value
fn set_option<T>(packet: &Socket, name: libc::c_int, value: &T) -> io::Result<()> {
    // SAFETY: value points to size_of::<T>() readable bytes
    let rv = unsafe {
        libc::setsockopt(
            packet.as_raw_fd(),
            SOL_PACKET,
            name,
            (value as *const T).cast::<libc::c_void>(),
            size_of::<T>() as libc::socklen_t,
        )
    };
    if rv == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// `sockaddr_ll` selecting CAN traffic on one interface
fn link_address(if_index: u32) -> Result<SockAddr> {
    let if_index = libc::c_int::try_from(if_index)
        .map_err(|_| CanBusError::config(format!("interface index {if_index} out of range")))?;
    // SAFETY: sockaddr_storage is plain data; all-zero is a valid starting value
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    // SAFETY: sockaddr_storage is large and aligned enough for any sockaddr
    let link = unsafe { &mut *(&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr_ll>() };
    link.sll_family = libc::AF_PACKET as libc::c_ushort;
    link.sll_protocol = ETH_P_CAN.to_be();
    link.sll_ifindex = if_index;
    // SAFETY: storage holds an initialised sockaddr_ll of the given length
    Ok(unsafe { SockAddr::new(storage, size_of::<libc::sockaddr_ll>() as libc::socklen_t) })
}

fn ring_request(ring: &RingConfig) -> Result<TpacketReq> {
    let field = |value: usize, name: &str| {
        u32::try_from(value).map_err(|_| CanBusError::config(format!("ring.{name} {value} is too large")))
    };
    Ok(TpacketReq {
        block_size: field(ring.block_size, "block_size")?,
        block_nr: field(ring.block_count, "block_count")?,
        frame_size: field(ring.frame_size, "frame_size")?,
        frame_nr: field(ring.frame_count(), "frame_count")?,
    })
}

/// Recent own sends, matched against incoming echoes in send order
#[derive(Debug)]
struct OwnEchoes {
    enabled: bool,
    pending: SyncMutex<VecDeque<WireFrame>>,
}

impl OwnEchoes {
    fn new(config: &BusConfig) -> Self {
        Self {
            // Echoes only exist with loopback, and only need filtering without self-reception
            enabled: config.loopback && !config.receive_own_messages,
            pending: SyncMutex::new(VecDeque::new()),
        }
    }

    fn record(&self, raw: WireFrame) {
        if !self.enabled {
            return;
        }
        let mut pending = self.pending.lock();
        if pending.len() == OWN_ECHO_CAPACITY {
            pending.pop_front();
        }
        pending.push_back(raw);
    }

    fn forget(&self, raw: &WireFrame) {
        if !self.enabled {
            return;
        }
        let mut pending = self.pending.lock();
        if let Some(pos) = pending.iter().rposition(|sent| sent == raw) {
            pending.remove(pos);
        }
    }

    /// Whether `raw` is the echo of an own send; consumes it and any older
    /// sends whose echoes were lost
    fn take(&self, raw: &WireFrame) -> bool {
        if !self.enabled {
            return false;
        }
        let mut pending = self.pending.lock();
        match pending.iter().position(|sent| sent == raw) {
            Some(pos) => {
                pending.drain(..=pos);
                true
            },
            None => false,
        }
    }

    fn clear(&self) {
        self.pending.lock().clear();
    }
}

fn handle_packet(reception: &Reception, own: &OwnEchoes, packet: Option<SlotPacket>) {
    match packet {
        Some(SlotPacket::Frame { raw, pkttype }) => {
            if pkttype == PACKET_OUTGOING {
                return;
            }
            if own.take(&raw) {
                return;
            }
            deliver_wire(reception, &raw);
        },
        Some(SlotPacket::Unsupported { len }) => {
            debug!("Skipping {} byte packet in ring slot", len);
            reception.stats.record_dropped(1);
        },
        None => {
            warn!("Skipping ring slot with an out-of-bounds header");
            reception.stats.record_dropped(1);
        },
    }
}

async fn reception_loop(
    resources: Arc<RingResources>,
    reception: Arc<Reception>,
    own: Arc<OwnEchoes>,
    poll_interval: Duration,
    token: CancellationToken,
) -> Result<()> {
    let region = &resources.region;
    let mut cursor = 0usize;
    loop {
        if token.is_cancelled() {
            return Ok(());
        }

        let outcome = sweep(region, &mut cursor, |packet| {
            handle_packet(&reception, &own, packet)
        });

        if outcome.losing {
            match resources.take_kernel_drops() {
                Ok(drops) => {
                    warn!("Ring overrun: kernel dropped {} frames", drops);
                    reception.stats.record_dropped(u64::from(drops));
                },
                Err(e) => warn!("Ring overrun; drop statistics unavailable: {}", e),
            }
        }

        // A full revolution means more may already be waiting
        if outcome.consumed == region.slot_count() {
            tokio::task::yield_now().await;
            continue;
        }

        tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            _ = tokio::time::sleep(poll_interval) => {},
        }
    }
}

struct Connection {
    task: ReceptionTask,
}

/// SocketCAN transport receiving through a memory-mapped kernel ring
pub struct RingCanBus {
    channel: String,
    config: BusConfig,
    reception: Arc<Reception>,
    own: Arc<OwnEchoes>,
    /// Resources ready for the next connect; acquired at construction
    idle: SyncMutex<Option<Arc<RingResources>>>,
    /// Resources in use by a running connection
    active: RwLock<Option<Arc<RingResources>>>,
    connection: Mutex<Option<Connection>>,
}

impl RingCanBus {
    /// Map the ring and open both sockets; nothing is returned on failure
    pub fn new(channel: &str, config: &BusConfig) -> Result<Self> {
        config.validate()?;
        let resources = RingResources::open(channel, config)?;
        debug!("Created ring CAN transport on {}", channel);
        Ok(Self {
            channel: channel.to_string(),
            config: config.clone(),
            reception: Reception::new(),
            own: Arc::new(OwnEchoes::new(config)),
            idle: SyncMutex::new(Some(Arc::new(resources))),
            active: RwLock::new(None),
            connection: Mutex::new(None),
        })
    }

    async fn teardown(&self, conn: Connection) -> Result<()> {
        // The task must exit before the ring is unmapped
        let joined = conn.task.stop().await;
        let resources = self.active.write().take();
        drop(resources);
        self.own.clear();
        joined
    }
}

#[async_trait]
impl Bus for RingCanBus {
    fn transport_type(&self) -> &str {
        super::SOCKETCAN_RING
    }

    fn channel(&self) -> &str {
        &self.channel
    }

    async fn connect(&self) -> Result<()> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            if !conn.task.is_finished() {
                return Ok(());
            }
        }
        if let Some(stale) = guard.take() {
            self.teardown(stale).await?;
        }

        let idle = self.idle.lock().take();
        let resources = match idle {
            Some(resources) => resources,
            None => Arc::new(RingResources::open(&self.channel, &self.config)?),
        };

        let ring = resources.clone();
        let reception = self.reception.clone();
        let own = self.own.clone();
        let poll_interval = self.config.ring.poll_interval();
        let task = ReceptionTask::spawn(super::SOCKETCAN_RING, self.reception.clone(), move |token| {
            reception_loop(ring, reception, own, poll_interval, token)
        });

        *self.active.write() = Some(resources);
        *guard = Some(Connection { task });
        info!("Ring CAN transport connected to {}", self.channel);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.take() {
            self.teardown(conn).await?;
            info!("Ring CAN transport disconnected from {}", self.channel);
        }
        // A never-connected transport still holds the resources from construction
        self.idle.lock().take();
        Ok(())
    }

    async fn send(&self, frame: &Frame) -> Result<()> {
        let resources = self.active.read().clone().ok_or(CanBusError::NotConnected)?;
        let raw = wire::encode(frame);
        // Recorded first so the echo can never overtake the record
        self.own.record(raw);
        if let Err(e) = resources.sender.write_wire(&raw) {
            self.own.forget(&raw);
            return Err(e);
        }
        self.reception.stats.record_sent();
        Ok(())
    }

    fn subscribe(&self, listener: Box<dyn FrameListener>) {
        self.reception.listener.replace(listener);
    }

    fn is_connected(&self) -> bool {
        self.active.read().is_some()
    }

    fn stats(&self) -> BusStats {
        self.reception.stats.snapshot()
    }

    fn reception_state(&self) -> watch::Receiver<ReceptionState> {
        self.reception.watch()
    }
}

impl std::fmt::Debug for RingCanBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingCanBus")
            .field("channel", &self.channel)
            .field("ring", &self.config.ring)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::region::tests::TestRing;
    use super::region::{TP_STATUS_KERNEL, TP_STATUS_USER};
    use super::*;

    const PACKET_HOST: u8 = 0;
    const PACKET_BROADCAST: u8 = 1;

    fn echo_config(receive_own_messages: bool) -> BusConfig {
        BusConfig {
            receive_own_messages,
            ..Default::default()
        }
    }

    #[test]
    fn test_tpacket_struct_sizes() {
        assert_eq!(size_of::<TpacketReq>(), 16);
        assert_eq!(size_of::<TpacketStats>(), 8);
    }

    #[test]
    fn test_ring_request_from_defaults() {
        let req = ring_request(&RingConfig::default()).unwrap();
        assert_eq!(req.block_size, 4096);
        assert_eq!(req.block_nr, 64);
        assert_eq!(req.frame_size, 128);
        assert_eq!(req.frame_nr, 2048);
    }

    #[test]
    fn test_unknown_interface_is_config_error() {
        let err = RingCanBus::new("nosuchcan9", &BusConfig::default()).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_own_echo_matching() {
        let own = OwnEchoes::new(&echo_config(false));
        let a = wire::encode(&Frame::new(0x1, &[1]).unwrap());
        let b = wire::encode(&Frame::new(0x1, &[2]).unwrap());
        let peer = wire::encode(&Frame::new(0x2, &[9]).unwrap());

        own.record(a);
        own.record(b);
        assert!(!own.take(&peer));
        // Echo of `a` lost; `b` clears it too
        assert!(own.take(&b));
        assert!(!own.take(&a));

        let own = OwnEchoes::new(&echo_config(true));
        own.record(a);
        assert!(!own.take(&a));
    }

    #[test]
    fn test_own_echo_capacity_bounded() {
        let own = OwnEchoes::new(&echo_config(false));
        let raw = wire::encode(&Frame::new(0x1, &[]).unwrap());
        for _ in 0..OWN_ECHO_CAPACITY + 10 {
            own.record(raw);
        }
        assert_eq!(own.pending.lock().len(), OWN_ECHO_CAPACITY);
    }

    fn capture(reception: &Reception) -> Arc<SyncMutex<Vec<Frame>>> {
        let seen = Arc::new(SyncMutex::new(Vec::new()));
        let sink = seen.clone();
        reception
            .listener
            .replace(Box::new(move |frame: Frame| sink.lock().push(frame)));
        seen
    }

    #[test]
    fn test_sweep_filters_outgoing_and_own_echo() {
        let reception = Reception::new();
        let seen = capture(&reception);

        let own = OwnEchoes::new(&echo_config(false));
        let mine = Frame::new(0x100, &[1]).unwrap();
        let peer = Frame::new(0x200, &[2]).unwrap();
        own.record(wire::encode(&mine));

        // A local send shows up as an outgoing tap plus a broadcast echo
        let mut ring = TestRing::new(512, 1, 128);
        ring.fill(0, &mine, PACKET_OUTGOING, TP_STATUS_USER);
        ring.fill(1, &mine, PACKET_BROADCAST, TP_STATUS_USER);
        ring.fill(2, &peer, PACKET_BROADCAST, TP_STATUS_USER);
        let region = ring.region();

        let mut cursor = 0;
        let outcome = sweep(&region, &mut cursor, |p| handle_packet(&reception, &own, p));
        assert_eq!(outcome.consumed, 3);
        assert_eq!(*seen.lock(), vec![peer]);
        assert!(own.pending.lock().is_empty());
        drop(region);
        assert_eq!(ring.status(1), TP_STATUS_KERNEL);
    }

    #[test]
    fn test_peer_frame_identical_to_consumed_echo_is_delivered() {
        let reception = Reception::new();
        let seen = capture(&reception);

        let own = OwnEchoes::new(&echo_config(false));
        let frame = Frame::new(0x321, &[0xAA]).unwrap();
        own.record(wire::encode(&frame));

        // Own echo first, then a peer sending the same bytes with no send pending
        let mut ring = TestRing::new(512, 1, 128);
        ring.fill(0, &frame, PACKET_BROADCAST, TP_STATUS_USER);
        ring.fill(1, &frame, PACKET_BROADCAST, TP_STATUS_USER);
        let region = ring.region();

        let mut cursor = 0;
        sweep(&region, &mut cursor, |p| handle_packet(&reception, &own, p));
        assert_eq!(*seen.lock(), vec![frame]);
        assert_eq!(reception.stats.snapshot().frames_received, 1);
    }

    #[test]
    fn test_own_echo_host_packet_type_matched() {
        let reception = Reception::new();
        let own = OwnEchoes::new(&echo_config(false));
        let mine = Frame::new(0x7, &[7]).unwrap();
        own.record(wire::encode(&mine));

        let mut ring = TestRing::new(512, 1, 128);
        ring.fill(0, &mine, PACKET_HOST, TP_STATUS_USER);
        let region = ring.region();

        let mut cursor = 0;
        sweep(&region, &mut cursor, |p| handle_packet(&reception, &own, p));
        assert_eq!(reception.stats.snapshot().frames_received, 0);
    }

    #[test]
    fn test_self_reception_delivers_echo() {
        let reception = Reception::new();
        let own = OwnEchoes::new(&echo_config(true));
        let mine = Frame::new(0x100, &[1]).unwrap();
        own.record(wire::encode(&mine));

        let mut ring = TestRing::new(512, 1, 128);
        ring.fill(0, &mine, PACKET_OUTGOING, TP_STATUS_USER);
        ring.fill(1, &mine, PACKET_BROADCAST, TP_STATUS_USER);
        let region = ring.region();

        let mut cursor = 0;
        sweep(&region, &mut cursor, |p| handle_packet(&reception, &own, p));
        assert_eq!(reception.stats.snapshot().frames_received, 1);
    }
}
