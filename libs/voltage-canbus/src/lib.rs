//! Voltage CAN Bus Transport Library
//!
//! Hardware-agnostic CAN transport layer for VoltageEMS. Protocol layers
//! depend on the [`Bus`] trait only; transports bind it to SocketCAN (or to an
//! in-process virtual bus) and are selected by name through the
//! [`BusRegistry`].
//!
//! # Quick Start
//!
//! ```no_run
//! use voltage_canbus::{registry, Frame};
//!
//! # async fn run() -> voltage_canbus::Result<()> {
//! voltage_canbus::register_default_transports();
//! let bus = registry::create("socketcan", "can0")?;
//! bus.subscribe(Box::new(|frame: Frame| println!("{frame}")));
//! bus.connect().await?;
//! bus.send(&Frame::new(0x100, &[0, 1, 2, 3])?).await?;
//! bus.disconnect().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - `socketcan` - SocketCAN transports on Linux (default)

pub mod bus;
pub mod config;
pub mod error;
pub mod frame;
pub mod registry;
#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socket;
pub mod transport;
pub mod wire;

// Re-export core types
pub use bus::{Bus, BusStats, FrameListener, NoopListener, ReceptionState};
pub use config::{BatchConfig, BusConfig, RingConfig};
pub use error::{CanBusError, Result};
pub use frame::Frame;
pub use registry::BusRegistry;
pub use wire::{WireFrame, WIRE_FRAME_SIZE};

/// Register every built-in transport in the process-wide registry
///
/// Call once at start-up, before the first `registry::create`. Calling it
/// again re-registers the same constructors.
pub fn register_default_transports() {
    transport::register_builtin(registry::global());
    tracing::debug!(
        "Registered CAN transports: {}",
        registry::global().names().join(", ")
    );
}
