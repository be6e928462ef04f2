//! Bus Configuration
//!
//! Tunables shared by all transports. Loaded with figment from defaults, an
//! optional YAML/TOML/JSON file and `CANBUS_`-prefixed environment variables
//! (nested keys separated by `__`, e.g. `CANBUS_RING__BLOCK_COUNT=128`).

use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::error::{CanBusError, Result};

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "CANBUS_";

/// Smallest ring slot able to hold a TPACKET_V2 header, the link-layer
/// address and one wire frame at the kernel's 16-byte alignment
pub const RING_MIN_FRAME_SIZE: usize = 96;

/// Ring slot alignment required by the kernel (`TPACKET_ALIGNMENT`)
pub const RING_FRAME_ALIGNMENT: usize = 16;

/// Maximum frames requested per batched receive call
pub const MAX_BATCH_SIZE: usize = 1024;

/// Batched-receive tunables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Frames requested per receive call
    pub size: usize,
    /// Upper bound of one receive call when fewer frames are available
    pub timeout_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size: 64,
            timeout_ms: 10,
        }
    }
}

/// Ring-buffer tunables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    /// Bytes per ring block (multiple of the page size)
    pub block_size: usize,
    /// Number of blocks in the region
    pub block_count: usize,
    /// Bytes per slot (multiple of 16, divides `block_size`)
    pub frame_size: usize,
    /// Wait between sweeps once the ring is drained
    pub poll_interval_ms: u64,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            block_count: 64,
            frame_size: 128,
            poll_interval_ms: 10,
        }
    }
}

impl RingConfig {
    pub fn frames_per_block(&self) -> usize {
        self.block_size / self.frame_size
    }

    pub fn frame_count(&self) -> usize {
        self.frames_per_block() * self.block_count
    }

    pub fn region_size(&self) -> usize {
        self.block_size * self.block_count
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    fn validate(&self) -> Result<()> {
        let page = page_size();
        if self.block_size == 0 || self.block_size % page != 0 {
            return Err(CanBusError::config(format!(
                "ring.block_size {} must be a non-zero multiple of the page size {page}",
                self.block_size
            )));
        }
        if self.block_count == 0 {
            return Err(CanBusError::config("ring.block_count must be greater than zero"));
        }
        if self.frame_size < RING_MIN_FRAME_SIZE || self.frame_size % RING_FRAME_ALIGNMENT != 0 {
            return Err(CanBusError::config(format!(
                "ring.frame_size {} must be a multiple of {RING_FRAME_ALIGNMENT} and at least {RING_MIN_FRAME_SIZE}",
                self.frame_size
            )));
        }
        if self.block_size % self.frame_size != 0 {
            return Err(CanBusError::config(format!(
                "ring.frame_size {} must divide ring.block_size {}",
                self.frame_size, self.block_size
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(CanBusError::config(
                "ring.poll_interval_ms must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Transport configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Per-call read bound of the blocking and cancellable transports
    pub read_timeout_ms: u64,
    /// Deliver frames sent by this transport to its own listener
    pub receive_own_messages: bool,
    /// Loop sent frames back to other sockets on the same host
    pub loopback: bool,
    /// Batched-receive settings
    pub batch: BatchConfig,
    /// Ring-buffer settings
    pub ring: RingConfig,
    /// Per-subscriber queue of the virtual bus
    pub listener_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 100,
            receive_own_messages: false,
            loopback: true,
            batch: BatchConfig::default(),
            ring: RingConfig::default(),
            listener_capacity: 1024,
        }
    }
}

impl BusConfig {
    /// Load configuration: defaults < file (by extension) < environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(BusConfig::default()));

        if let Some(path) = path {
            if !path.exists() {
                return Err(CanBusError::config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            figment = match path.extension().and_then(|ext| ext.to_str()) {
                Some("yaml") | Some("yml") => figment.merge(Yaml::file(path)),
                Some("toml") => figment.merge(Toml::file(path)),
                Some("json") => figment.merge(Json::file(path)),
                _ => {
                    return Err(CanBusError::config(format!(
                        "unsupported config format: {}",
                        path.display()
                    )))
                },
            };
        }

        let config: BusConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| CanBusError::config(e.to_string()))?;

        config.validate()?;
        debug!("Loaded bus config: {:?}", config);
        Ok(config)
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.read_timeout_ms == 0 {
            return Err(CanBusError::config(
                "read_timeout_ms must be greater than zero",
            ));
        }
        if self.batch.size == 0 || self.batch.size > MAX_BATCH_SIZE {
            return Err(CanBusError::config(format!(
                "batch.size {} must be within 1..={MAX_BATCH_SIZE}",
                self.batch.size
            )));
        }
        if self.batch.timeout_ms == 0 {
            return Err(CanBusError::config(
                "batch.timeout_ms must be greater than zero",
            ));
        }
        if self.listener_capacity == 0 {
            return Err(CanBusError::config(
                "listener_capacity must be greater than zero",
            ));
        }
        self.ring.validate()
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch.timeout_ms)
    }
}

fn page_size() -> usize {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: sysconf has no memory-safety preconditions
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            return size as usize;
        }
    }
    4096
}
