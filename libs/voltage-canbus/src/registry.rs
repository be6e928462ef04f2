//! Bus Registry
//!
//! Maps transport names to constructors. Transports register themselves at
//! start-up (see [`crate::register_default_transports`]); callers then ask for a
//! named transport bound to a channel without knowing its concrete type.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

use crate::bus::Bus;
use crate::config::BusConfig;
use crate::error::{CanBusError, Result};

/// Constructor stored per transport name
pub type BusConstructor = Arc<dyn Fn(&str, &BusConfig) -> Result<Box<dyn Bus>> + Send + Sync>;

/// Registry of transport constructors
#[derive(Default)]
pub struct BusRegistry {
    constructors: RwLock<HashMap<String, BusConstructor>>,
}

impl BusRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding every built-in transport
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        crate::transport::register_builtin(&registry);
        registry
    }

    /// Store a constructor; re-registering a name overwrites it
    pub fn register<F>(&self, name: impl Into<String>, constructor: F)
    where
        F: Fn(&str, &BusConfig) -> Result<Box<dyn Bus>> + Send + Sync + 'static,
    {
        let name = name.into();
        let previous = self
            .constructors
            .write()
            .insert(name.clone(), Arc::new(constructor));
        if previous.is_some() {
            debug!("Replaced transport constructor: {}", name);
        } else {
            debug!("Registered transport: {}", name);
        }
    }

    /// Create a named transport on `channel` with default configuration
    pub fn create(&self, name: &str, channel: &str) -> Result<Box<dyn Bus>> {
        self.create_with(name, channel, &BusConfig::default())
    }

    /// Create a named transport on `channel`
    pub fn create_with(
        &self,
        name: &str,
        channel: &str,
        config: &BusConfig,
    ) -> Result<Box<dyn Bus>> {
        config.validate()?;

        // Clone out so the constructor runs without holding the lock
        let constructor = self
            .constructors
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CanBusError::UnknownTransport(name.to_string()))?;

        let bus = constructor(channel, config)?;
        info!("Created {} transport on {}", name, channel);
        Ok(bus)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.read().contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for BusRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusRegistry")
            .field("transports", &self.names())
            .finish()
    }
}

static GLOBAL: OnceLock<BusRegistry> = OnceLock::new();

/// Process-wide registry
pub fn global() -> &'static BusRegistry {
    GLOBAL.get_or_init(BusRegistry::new)
}

/// Register a constructor in the process-wide registry
pub fn register<F>(name: impl Into<String>, constructor: F)
where
    F: Fn(&str, &BusConfig) -> Result<Box<dyn Bus>> + Send + Sync + 'static,
{
    global().register(name, constructor);
}

/// Create a transport from the process-wide registry
pub fn create(name: &str, channel: &str) -> Result<Box<dyn Bus>> {
    global().create(name, channel)
}

/// Create a transport from the process-wide registry with explicit configuration
pub fn create_with(name: &str, channel: &str, config: &BusConfig) -> Result<Box<dyn Bus>> {
    global().create_with(name, channel, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::virtual_bus::VirtualBus;

    #[test]
    fn test_unknown_transport() {
        let registry = BusRegistry::new();
        let result = registry.create("doesnotexist", "chan");
        assert!(matches!(result, Err(CanBusError::UnknownTransport(ref name)) if name == "doesnotexist"));
        assert!(result.unwrap_err().is_config());
    }

    #[test]
    fn test_register_and_create() {
        let registry = BusRegistry::new();
        registry.register("virtual", |channel: &str, config: &BusConfig| {
            Ok(Box::new(VirtualBus::new(channel, config)?) as Box<dyn Bus>)
        });

        assert!(registry.contains("virtual"));
        let bus = registry.create("virtual", "registry-test").unwrap();
        assert_eq!(bus.channel(), "registry-test");
        assert_eq!(bus.transport_type(), "virtual");
    }

    #[test]
    fn test_reregister_overwrites() {
        let registry = BusRegistry::new();
        registry.register("t", |_: &str, _: &BusConfig| {
            Err(CanBusError::config("first"))
        });
        registry.register("t", |_: &str, _: &BusConfig| {
            Err(CanBusError::config("second"))
        });

        let err = registry.create("t", "x").unwrap_err();
        assert!(err.to_string().contains("second"));
        assert_eq!(registry.names(), vec!["t".to_string()]);
    }

    #[test]
    fn test_create_validates_config() {
        let registry = BusRegistry::with_defaults();
        let config = BusConfig {
            read_timeout_ms: 0,
            ..Default::default()
        };
        assert!(registry.create_with("virtual", "x", &config).is_err());
    }

    #[test]
    fn test_with_defaults_names() {
        let registry = BusRegistry::with_defaults();
        assert!(registry.contains("virtual"));
        #[cfg(all(target_os = "linux", feature = "socketcan"))]
        {
            for name in [
                "socketcan",
                "socketcan-batch",
                "socketcan-blocking",
                "socketcan-ring",
            ] {
                assert!(registry.contains(name), "missing {name}");
            }
        }
    }
}
