//! Change detection for device samples
//!
//! Pure decision layer: given a signal's stored value and policy and a raw
//! sample, decide whether the sample is a reportable change. Nothing here
//! mutates a signal; committing is the caller's job once the bus accepted the
//! write.

use super::{Hysteresis, Signal, SignalUpdate, SignalValue};
use crate::error::{BridgeError, Result};
use std::collections::HashMap;

/// Interpretation of one raw sample
#[derive(Debug, Clone, PartialEq)]
pub enum Sample {
    Numeric(f64),
    Symbolic(String),
}

/// A sample that is a reportable change
#[derive(Debug, Clone, PartialEq)]
pub struct Accepted {
    pub address: String,
    pub value: SignalValue,
    /// Value as written to the bus
    pub formatted: String,
}

impl Accepted {
    pub fn to_update(&self) -> SignalUpdate {
        SignalUpdate::new(self.address.clone(), self.formatted.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    /// Equal to the stored value
    Unchanged,
    /// Numeric change inside the hysteresis band
    WithinHysteresis { previous: f64, policy: Hysteresis },
    /// Signal is not active
    Disabled,
    /// Sample could not be interpreted
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Accept(Accepted),
    Reject(RejectReason),
}

impl Decision {
    pub fn is_accept(&self) -> bool {
        matches!(self, Decision::Accept(_))
    }

    pub fn accepted(self) -> Option<Accepted> {
        match self {
            Decision::Accept(accepted) => Some(accepted),
            Decision::Reject(_) => None,
        }
    }
}

/// Interpret a raw sample as a number or a symbol
pub fn parse_sample(raw: &str) -> Result<Sample> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(BridgeError::value("empty sample"));
    }
    if trimmed.chars().any(char::is_control) {
        return Err(BridgeError::value(format!(
            "sample {trimmed:?} contains control characters"
        )));
    }

    match trimmed.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(Sample::Numeric(v)),
        Ok(_) => Err(BridgeError::value(format!(
            "sample {trimmed:?} is not a finite number"
        ))),
        Err(_) => Ok(Sample::Symbolic(trimmed.to_string())),
    }
}

/// Format a numeric value with a fixed number of decimals
pub fn format_numeric(value: f64, precision: usize) -> String {
    format!("{value:.precision$}")
}

/// Decide whether `raw` is a reportable change for `signal`
pub fn evaluate(signal: &Signal, raw: &str) -> Decision {
    evaluate_against(signal, &signal.value, raw)
}

/// Like [`evaluate`], but compared with a value not yet committed
pub fn evaluate_against(signal: &Signal, previous: &SignalValue, raw: &str) -> Decision {
    if !signal.enabled {
        return Decision::Reject(RejectReason::Disabled);
    }
    decide(
        &signal.address,
        signal.policy,
        previous,
        raw,
        &signal.translation,
        signal.precision,
    )
}

/// Interpret an inbound bus command for `signal`
///
/// Bus values are already in bus vocabulary, so no translation is applied and
/// hysteresis is ignored. Every well-formed command is accepted, including one
/// equal to the known state: the device may have drifted from it.
pub fn evaluate_command(signal: &Signal, raw: &str) -> Decision {
    if !signal.enabled {
        return Decision::Reject(RejectReason::Disabled);
    }
    match parse_sample(raw) {
        Ok(Sample::Numeric(value)) => accept_numeric(&signal.address, value, signal.precision),
        Ok(Sample::Symbolic(symbol)) => accept_symbolic(&signal.address, symbol),
        Err(e) => Decision::Reject(RejectReason::Malformed(e.to_string())),
    }
}

/// Core decision on plain values
///
/// The translation table only applies to samples that are not numbers.
pub fn decide(
    address: &str,
    policy: Hysteresis,
    previous: &SignalValue,
    raw: &str,
    translation: &HashMap<String, String>,
    precision: usize,
) -> Decision {
    let sample = match parse_sample(raw) {
        Ok(sample) => sample,
        Err(e) => return Decision::Reject(RejectReason::Malformed(e.to_string())),
    };

    match sample {
        Sample::Numeric(new) => {
            let previous = match previous {
                SignalValue::Numeric(prev) => *prev,
                // type change or first value
                _ => return accept_numeric(address, new, precision),
            };
            if previous == new {
                Decision::Reject(RejectReason::Unchanged)
            } else if policy.suppresses(previous, new) {
                Decision::Reject(RejectReason::WithinHysteresis { previous, policy })
            } else {
                accept_numeric(address, new, precision)
            }
        }
        Sample::Symbolic(symbol) => {
            let symbol = translation.get(&symbol).cloned().unwrap_or(symbol);
            if previous.as_symbolic() == Some(symbol.as_str()) {
                Decision::Reject(RejectReason::Unchanged)
            } else {
                accept_symbolic(address, symbol)
            }
        }
    }
}

fn accept_numeric(address: &str, value: f64, precision: usize) -> Decision {
    Decision::Accept(Accepted {
        address: address.to_string(),
        value: SignalValue::Numeric(value),
        formatted: format_numeric(value, precision),
    })
}

fn accept_symbolic(address: &str, symbol: String) -> Decision {
    Decision::Accept(Accepted {
        address: address.to_string(),
        formatted: symbol.clone(),
        value: SignalValue::Symbolic(symbol),
    })
}
