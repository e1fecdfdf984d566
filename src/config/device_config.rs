//! Per-device configuration
//!
//! Each entry names a device class and its connection fields plus the list of
//! signals (`objects`) it exchanges with the bus. Hysteresis settings are
//! resolved here, once, into [`Hysteresis`] values.

use crate::error::{BridgeError, Result};
use crate::session::ReconnectionConfig;
use crate::signal::{Hysteresis, Signal, SignalDirection, SignalValue, DEFAULT_PRECISION};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Hysteresis as written in configuration: `0.5`, `"0.5"` or `"5%"`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HysteresisSpec {
    Number(f64),
    Text(String),
}

impl Default for HysteresisSpec {
    fn default() -> Self {
        HysteresisSpec::Number(0.0)
    }
}

impl HysteresisSpec {
    pub fn resolve(&self) -> Result<Hysteresis> {
        match self {
            HysteresisSpec::Number(n) => Hysteresis::try_from(*n),
            HysteresisSpec::Text(s) => Hysteresis::try_from(s.as_str()),
        }
    }
}

/// `true`/`false`, or a mode string such as `"receive,send"`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnabledSpec {
    Flag(bool),
    Modes(String),
}

impl Default for EnabledSpec {
    fn default() -> Self {
        EnabledSpec::Flag(true)
    }
}

impl EnabledSpec {
    /// Whether the signal is active and which way it flows
    pub fn resolve(&self) -> (bool, SignalDirection) {
        match self {
            EnabledSpec::Flag(enabled) => (*enabled, SignalDirection::Both),
            EnabledSpec::Modes(modes) => {
                let modes = modes.to_ascii_lowercase();
                match (modes.contains("receive"), modes.contains("send")) {
                    (true, true) => (true, SignalDirection::Both),
                    (true, false) => (true, SignalDirection::Read),
                    (false, true) => (true, SignalDirection::Write),
                    (false, false) => (false, SignalDirection::Both),
                }
            }
        }
    }
}

/// Starting value of every signal of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InitialValue {
    #[default]
    Zero,
    Unset,
}

/// One signal of a device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    /// Bus address
    #[serde(alias = "knx_group")]
    pub address: String,

    #[serde(default)]
    pub enabled: EnabledSpec,

    /// Overrides the device default
    #[serde(default)]
    pub hysteresis: Option<HysteresisSpec>,

    #[serde(default)]
    pub precision: Option<usize>,

    /// Overrides the direction implied by `enabled`
    #[serde(default)]
    pub direction: Option<SignalDirection>,

    /// Device symbol to bus symbol
    #[serde(default)]
    pub valmap: HashMap<String, String>,

    /// Adapter specific key
    #[serde(default, alias = "ups_expr", alias = "rs485key", alias = "sensor")]
    pub key: Option<String>,

    /// Unit conversion applied by the adapter before change detection
    #[serde(default)]
    pub conversion: Option<String>,
}

impl SignalConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            enabled: EnabledSpec::default(),
            hysteresis: None,
            precision: None,
            direction: None,
            valmap: HashMap::new(),
            key: None,
            conversion: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// apcupsd network information server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApcUpsConfig {
    pub host: String,

    #[serde(default = "default_apcupsd_port")]
    pub port: u16,
}

fn default_apcupsd_port() -> u16 {
    3551
}

/// `key=value` line device reachable over TCP or a serial device file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineDeviceConfig {
    #[serde(default)]
    pub host: Option<String>,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default, alias = "serialDevice")]
    pub serial_device: Option<PathBuf>,

    /// Terminator appended to written commands
    #[serde(default = "default_line_ending")]
    pub line_ending: String,
}

fn default_line_ending() -> String {
    "\r\n".to_string()
}

/// Where a line device is reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineTransport {
    Tcp { host: String, port: u16 },
    Serial { path: PathBuf },
}

impl LineDeviceConfig {
    pub fn transport(&self) -> Result<LineTransport> {
        match (&self.host, self.port, &self.serial_device) {
            (Some(host), Some(port), None) => Ok(LineTransport::Tcp {
                host: host.clone(),
                port,
            }),
            (None, None, Some(path)) => Ok(LineTransport::Serial { path: path.clone() }),
            _ => Err(BridgeError::config(
                "line device needs either host and port or serial_device",
            )),
        }
    }
}

/// HTTP receiver for weather station uploads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherStationConfig {
    #[serde(alias = "listenPort")]
    pub listen_port: u16,
}

/// Device class with its connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum DeviceKind {
    ApcUps(ApcUpsConfig),
    LineDevice(LineDeviceConfig),
    WeatherStation(WeatherStationConfig),
    /// Class this build does not know; skipped at startup
    #[serde(other)]
    Unsupported,
}

impl DeviceKind {
    pub fn class_name(&self) -> &'static str {
        match self {
            DeviceKind::ApcUps(_) => "apc_ups",
            DeviceKind::LineDevice(_) => "line_device",
            DeviceKind::WeatherStation(_) => "weather_station",
            DeviceKind::Unsupported => "unsupported",
        }
    }
}

/// Device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,

    #[serde(flatten)]
    pub kind: DeviceKind,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default, with = "humantime_serde")]
    pub poll_interval: Option<Duration>,

    #[serde(default)]
    pub default_hysteresis: HysteresisSpec,

    #[serde(default = "default_precision")]
    pub default_precision: usize,

    #[serde(default)]
    pub initial_value: InitialValue,

    /// Reconnect after a lost link; without it the session ends
    #[serde(default)]
    pub reconnect: Option<ReconnectionConfig>,

    #[serde(default)]
    pub objects: Vec<SignalConfig>,
}

fn default_true() -> bool {
    true
}

fn default_precision() -> usize {
    DEFAULT_PRECISION
}

impl DeviceConfig {
    pub fn new(name: impl Into<String>, kind: DeviceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            enabled: true,
            poll_interval: None,
            default_hysteresis: HysteresisSpec::default(),
            default_precision: DEFAULT_PRECISION,
            initial_value: InitialValue::Zero,
            reconnect: None,
            objects: Vec::new(),
        }
    }

    pub fn with_objects(mut self, objects: Vec<SignalConfig>) -> Self {
        self.objects = objects;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let mut addresses = HashSet::new();
        for object in &self.objects {
            if object.address.trim().is_empty() {
                return Err(BridgeError::config(format!(
                    "device '{}' has an object without address",
                    self.name
                )));
            }
            if !addresses.insert(object.address.as_str()) {
                return Err(BridgeError::config(format!(
                    "device '{}' lists address {} twice",
                    self.name, object.address
                )));
            }
        }

        if let DeviceKind::LineDevice(line) = &self.kind {
            line.transport()?;
        }
        Ok(())
    }

    /// Build the signals of this device
    ///
    /// A signal with an unusable hysteresis is kept but disabled.
    pub fn build_signals(&self) -> Vec<Signal> {
        let default_policy = match self.default_hysteresis.resolve() {
            Ok(policy) => Some(policy),
            Err(e) => {
                warn!(device = %self.name, "Invalid default_hysteresis: {}", e);
                None
            }
        };

        self.objects
            .iter()
            .map(|object| {
                let policy = match &object.hysteresis {
                    Some(spec) => spec.resolve().ok(),
                    None => default_policy,
                };
                let (enabled, implied_direction) = object.enabled.resolve();

                let mut signal = Signal::new(object.address.clone())
                    .with_precision(object.precision.unwrap_or(self.default_precision))
                    .with_direction(object.direction.unwrap_or(implied_direction))
                    .with_translation(object.valmap.clone());
                if self.initial_value == InitialValue::Unset {
                    signal = signal.with_value(SignalValue::Unset);
                }
                if let Some(key) = &object.key {
                    signal = signal.with_key(key.clone());
                }
                signal.enabled = enabled;

                match policy {
                    Some(policy) => signal.with_policy(policy),
                    None => {
                        warn!(
                            device = %self.name,
                            address = %object.address,
                            "Invalid hysteresis, signal disabled"
                        );
                        signal.disabled()
                    }
                }
            })
            .collect()
    }
}
