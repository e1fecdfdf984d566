//! Configuration management for the KNX signal bridge
//!
//! The bridge reads one JSON document with a `sys` section, a `bus` section
//! (`linknx` is accepted too) and a list of `devices` (or `plugins`). Scalar
//! settings of `sys` and `bus` can be overridden from the environment, e.g.
//! `KNX_BRIDGE__BUS__HOST=10.0.0.2`.

pub mod device_config;

pub use device_config::{
    ApcUpsConfig, DeviceConfig, DeviceKind, EnabledSpec, HysteresisSpec, InitialValue,
    LineDeviceConfig, LineTransport, SignalConfig, WeatherStationConfig,
};

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "KNX_BRIDGE";

/// Bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BridgeConfig {
    #[serde(default)]
    pub sys: SysConfig,

    #[serde(default, alias = "linknx")]
    pub bus: BusConfig,

    #[serde(default, alias = "plugins")]
    pub devices: Vec<DeviceConfig>,
}

/// Process wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SysConfig {
    /// Log level (debug, info, warning, error)
    #[serde(default = "default_verbosity")]
    pub verbosity: String,

    /// Address the inbound listener and HTTP receivers bind to
    #[serde(default = "default_listen_host", alias = "listenHost")]
    pub listen_host: String,

    /// Time sessions get to close on shutdown
    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,

    /// Optional log file, rotated daily
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for SysConfig {
    fn default() -> Self {
        Self {
            verbosity: default_verbosity(),
            listen_host: default_listen_host(),
            shutdown_grace: default_shutdown_grace(),
            log_file: None,
        }
    }
}

fn default_verbosity() -> String {
    "info".to_string()
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(5)
}

/// linknx connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_bus_host")]
    pub host: String,

    #[serde(default = "default_bus_port")]
    pub port: u16,

    /// Port of the inbound command listener
    #[serde(default = "default_listen_port", alias = "listenPort")]
    pub listen_port: u16,

    /// Bound on the wait for a write acknowledgement
    #[serde(default = "default_ack_timeout", with = "humantime_serde")]
    pub ack_timeout: Duration,

    /// Forward published values to the other sessions
    #[serde(default)]
    pub local_echo: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: default_bus_host(),
            port: default_bus_port(),
            listen_port: default_listen_port(),
            ack_timeout: default_ack_timeout(),
            local_echo: false,
        }
    }
}

impl BusConfig {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_bus_host() -> String {
    "localhost".to_string()
}

fn default_bus_port() -> u16 {
    1028
}

fn default_listen_port() -> u16 {
    1029
}

fn default_ack_timeout() -> Duration {
    Duration::from_secs(30)
}

/// The part of the configuration open to environment overrides
#[derive(Debug, Serialize, Deserialize)]
struct Overridable {
    sys: SysConfig,
    bus: BusConfig,
}

impl BridgeConfig {
    /// Load, overlay environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            BridgeError::config(format!("Couldn't open the config file {}: {e}", path.display()))
        })?;

        let mut config = Self::parse(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON document without environment overrides or validation
    pub fn parse(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| BridgeError::config(format!("Failed to parse config: {e}")))
    }

    /// Overlay `KNX_BRIDGE__SYS__*` and `KNX_BRIDGE__BUS__*` variables
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        let current = Overridable {
            sys: self.sys.clone(),
            bus: self.bus.clone(),
        };

        let layered = ::config::Config::builder()
            .add_source(::config::Config::try_from(&current)?)
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let merged: Overridable = layered.try_deserialize()?;
        self.sys = merged.sys;
        self.bus = merged.bus;
        Ok(())
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.bus.host.trim().is_empty() {
            return Err(BridgeError::config("bus host must not be empty"));
        }
        if self.bus.ack_timeout.is_zero() {
            return Err(BridgeError::config("bus ack_timeout must be positive"));
        }

        let mut names = HashSet::new();
        for device in &self.devices {
            if device.name.trim().is_empty() {
                return Err(BridgeError::config("device name must not be empty"));
            }
            if !names.insert(device.name.as_str()) {
                return Err(BridgeError::config(format!(
                    "duplicate device name '{}'",
                    device.name
                )));
            }
            device.validate()?;
        }
        Ok(())
    }

    /// Devices that should run
    pub fn enabled_devices(&self) -> impl Iterator<Item = &DeviceConfig> {
        self.devices.iter().filter(|d| d.enabled)
    }

    pub fn get_device(&self, name: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.name == name)
    }

    /// Address the inbound listener binds to
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.sys.listen_host, self.bus.listen_port)
    }
}
