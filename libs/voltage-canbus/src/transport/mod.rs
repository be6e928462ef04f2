//! Transport implementations
//!
//! Every transport implements [`crate::bus::Bus`] and registers itself under
//! one registry name:
//!
//! | Name                 | Reception strategy                           |
//! |----------------------|----------------------------------------------|
//! | `socketcan-blocking` | one blocking `recv` per frame                |
//! | `socketcan`          | readiness-driven loop with cancellation      |
//! | `socketcan-batch`    | `recvmmsg` of up to `batch.size` frames      |
//! | `socketcan-ring`     | `PACKET_RX_RING` sweep over mapped slots     |
//! | `virtual`            | in-process broadcast, no OS resources        |

pub(crate) mod task;
pub mod virtual_bus;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod batched;
#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod blocking;
#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod cancellable;
#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod ring;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub use batched::BatchedCanBus;
#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub use blocking::BlockingCanBus;
#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub use cancellable::SocketCanBus;
#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub use ring::RingCanBus;
pub use virtual_bus::VirtualBus;

use crate::bus::Bus;
use crate::config::BusConfig;
use crate::registry::BusRegistry;

pub const SOCKETCAN_BLOCKING: &str = "socketcan-blocking";
pub const SOCKETCAN: &str = "socketcan";
pub const SOCKETCAN_BATCH: &str = "socketcan-batch";
pub const SOCKETCAN_RING: &str = "socketcan-ring";
pub const VIRTUAL: &str = "virtual";

/// Register every transport compiled into this build
pub(crate) fn register_builtin(registry: &BusRegistry) {
    registry.register(VIRTUAL, |channel: &str, config: &BusConfig| {
        Ok(Box::new(VirtualBus::new(channel, config)?) as Box<dyn Bus>)
    });

    #[cfg(all(target_os = "linux", feature = "socketcan"))]
    {
        registry.register(SOCKETCAN_BLOCKING, |channel: &str, config: &BusConfig| {
            Ok(Box::new(BlockingCanBus::new(channel, config)?) as Box<dyn Bus>)
        });
        registry.register(SOCKETCAN, |channel: &str, config: &BusConfig| {
            Ok(Box::new(SocketCanBus::new(channel, config)?) as Box<dyn Bus>)
        });
        registry.register(SOCKETCAN_BATCH, |channel: &str, config: &BusConfig| {
            Ok(Box::new(BatchedCanBus::new(channel, config)?) as Box<dyn Bus>)
        });
        registry.register(SOCKETCAN_RING, |channel: &str, config: &BusConfig| {
            Ok(Box::new(RingCanBus::new(channel, config)?) as Box<dyn Bus>)
        });
    }
}

/// Open a raw socket with the options shared by the SocketCAN transports
#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub(crate) fn open_raw_socket(
    channel: &str,
    config: &BusConfig,
    read_timeout: std::time::Duration,
) -> crate::error::Result<crate::socket::CanSocket> {
    let socket = crate::socket::CanSocket::open(channel)?;
    socket.set_loopback(config.loopback)?;
    socket.set_recv_own_msgs(config.receive_own_messages)?;
    socket.set_read_timeout(read_timeout)?;
    Ok(socket)
}
