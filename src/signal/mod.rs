//! Signal model shared by every device integration
//!
//! A [`Signal`] is one value exchanged with the bus. Its stored value is only
//! ever changed through [`Signal::commit`] with an update the debounce engine
//! accepted, which keeps replays of unchanged readings from reaching the bus.

pub mod debounce;
pub mod registry;

pub use debounce::{Accepted, Decision, RejectReason, Sample};
pub use registry::SignalRegistry;

use crate::error::BridgeError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Decimals used when formatting numeric values for the bus
pub const DEFAULT_PRECISION: usize = 2;

/// Last known value of a signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum SignalValue {
    Numeric(f64),
    Symbolic(String),
    #[default]
    Unset,
}

impl SignalValue {
    pub fn as_numeric(&self) -> Option<f64> {
        match self {
            SignalValue::Numeric(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_symbolic(&self) -> Option<&str> {
        match self {
            SignalValue::Symbolic(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_unset(&self) -> bool {
        matches!(self, SignalValue::Unset)
    }
}

impl fmt::Display for SignalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalValue::Numeric(v) => write!(f, "{v}"),
            SignalValue::Symbolic(s) => f.write_str(s),
            SignalValue::Unset => f.write_str("<unset>"),
        }
    }
}

/// Noise suppression policy for numeric samples
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Hysteresis {
    /// Any value unequal to the previous one is a change
    #[default]
    None,
    /// Accepted only if `|new - prev| > delta`
    Absolute(f64),
    /// Accepted only if `|new - prev| > pct / 100 * new`
    Percentage(f64),
}

impl Hysteresis {
    /// Whether `new` is within the suppression band around `previous`
    pub fn suppresses(&self, previous: f64, new: f64) -> bool {
        let delta = (new - previous).abs();
        match *self {
            Hysteresis::None => false,
            Hysteresis::Absolute(threshold) => delta <= threshold,
            Hysteresis::Percentage(pct) => delta <= pct / 100.0 * new,
        }
    }
}

impl fmt::Display for Hysteresis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hysteresis::None => f.write_str("none"),
            Hysteresis::Absolute(d) => write!(f, "{d}"),
            Hysteresis::Percentage(p) => write!(f, "{p}%"),
        }
    }
}

impl TryFrom<f64> for Hysteresis {
    type Error = BridgeError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        if !value.is_finite() || value < 0.0 {
            return Err(BridgeError::policy(format!(
                "hysteresis must be a non-negative number, got {value}"
            )));
        }
        if value == 0.0 {
            Ok(Hysteresis::None)
        } else {
            Ok(Hysteresis::Absolute(value))
        }
    }
}

impl TryFrom<&str> for Hysteresis {
    type Error = BridgeError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") {
            return Ok(Hysteresis::None);
        }

        if let Some(pct) = trimmed.strip_suffix('%') {
            let pct: f64 = pct.trim().parse().map_err(|_| {
                BridgeError::policy(format!("invalid percentage hysteresis '{value}'"))
            })?;
            if !pct.is_finite() || pct < 0.0 {
                return Err(BridgeError::policy(format!(
                    "percentage hysteresis must be non-negative, got '{value}'"
                )));
            }
            return Ok(if pct == 0.0 {
                Hysteresis::None
            } else {
                Hysteresis::Percentage(pct)
            });
        }

        let delta: f64 = trimmed
            .parse()
            .map_err(|_| BridgeError::policy(format!("invalid hysteresis '{value}'")))?;
        Hysteresis::try_from(delta)
    }
}

/// Which way values of a signal flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SignalDirection {
    /// Device to bus only
    Read,
    /// Bus to device only
    Write,
    #[default]
    Both,
}

impl SignalDirection {
    pub fn reports(&self) -> bool {
        matches!(self, SignalDirection::Read | SignalDirection::Both)
    }

    pub fn accepts_commands(&self) -> bool {
        matches!(self, SignalDirection::Write | SignalDirection::Both)
    }
}

/// A single named value exchanged with the bus
#[derive(Debug, Clone)]
pub struct Signal {
    pub address: String,
    pub value: SignalValue,
    pub policy: Hysteresis,
    pub enabled: bool,
    pub direction: SignalDirection,
    pub precision: usize,
    /// Device symbol to bus symbol (`"ONBATT" -> "false"`)
    pub translation: HashMap<String, String>,
    /// Adapter specific key (line key, sensor name, extraction pattern)
    pub device_key: Option<String>,
}

impl Signal {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            value: SignalValue::Numeric(0.0),
            policy: Hysteresis::None,
            enabled: true,
            direction: SignalDirection::Both,
            precision: DEFAULT_PRECISION,
            translation: HashMap::new(),
            device_key: None,
        }
    }

    pub fn with_policy(mut self, policy: Hysteresis) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_value(mut self, value: SignalValue) -> Self {
        self.value = value;
        self
    }

    pub fn with_translation<I, K, V>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.translation = entries
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.device_key = Some(key.into());
        self
    }

    pub fn with_direction(mut self, direction: SignalDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_precision(mut self, precision: usize) -> Self {
        self.precision = precision;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Store an accepted value
    pub fn commit(&mut self, accepted: &Accepted) {
        self.value = accepted.value.clone();
    }

    /// Evaluate a sample and commit it immediately when accepted
    ///
    /// Only for callers with no bus write between decision and commit.
    pub fn apply(&mut self, raw: &str) -> Decision {
        let decision = debounce::evaluate(self, raw);
        if let Decision::Accept(accepted) = &decision {
            self.commit(accepted);
        }
        decision
    }

    /// Map a bus value back to the device symbol, if translated
    pub fn untranslate<'a>(&'a self, bus_value: &'a str) -> &'a str {
        self.translation
            .iter()
            .find(|(_, v)| v.as_str() == bus_value)
            .map(|(k, _)| k.as_str())
            .unwrap_or(bus_value)
    }
}

/// One `address = value` pair ready for the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalUpdate {
    pub address: String,
    pub value: String,
}

impl SignalUpdate {
    pub fn new(address: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            value: value.into(),
        }
    }
}
