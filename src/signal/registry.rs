//! Signal registry
//!
//! Owns the signals of one device session. It is a plain container without
//! interior mutability; the owning session is the only writer.

use super::Signal;
use crate::error::{BridgeError, Result};

#[derive(Debug, Clone, Default)]
pub struct SignalRegistry {
    signals: Vec<Signal>,
}

impl SignalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a signal, replacing an existing one with the same address
    pub fn register(&mut self, signal: Signal) {
        match self.signals.iter_mut().find(|s| s.address == signal.address) {
            Some(existing) => *existing = signal,
            None => self.signals.push(signal),
        }
    }

    pub fn lookup(&self, address: &str) -> Result<&Signal> {
        self.signals
            .iter()
            .find(|s| s.address == address)
            .ok_or_else(|| BridgeError::not_found(format!("signal {address}")))
    }

    pub fn lookup_mut(&mut self, address: &str) -> Result<&mut Signal> {
        self.signals
            .iter_mut()
            .find(|s| s.address == address)
            .ok_or_else(|| BridgeError::not_found(format!("signal {address}")))
    }

    pub fn lookup_all_by<P>(&self, predicate: P) -> Vec<&Signal>
    where
        P: Fn(&Signal) -> bool,
    {
        self.signals.iter().filter(|s| predicate(s)).collect()
    }

    /// Find the signal bound to an adapter specific key
    pub fn lookup_by_key(&self, key: &str) -> Result<&Signal> {
        self.signals
            .iter()
            .find(|s| s.device_key.as_deref() == Some(key))
            .ok_or_else(|| BridgeError::not_found(format!("signal with key {key}")))
    }

    pub fn contains(&self, address: &str) -> bool {
        self.signals.iter().any(|s| s.address == address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Signal> {
        self.signals.iter()
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }
}

impl FromIterator<Signal> for SignalRegistry {
    fn from_iter<I: IntoIterator<Item = Signal>>(iter: I) -> Self {
        let mut registry = SignalRegistry::new();
        for signal in iter {
            registry.register(signal);
        }
        registry
    }
}

impl<'a> IntoIterator for &'a SignalRegistry {
    type Item = &'a Signal;
    type IntoIter = std::slice::Iter<'a, Signal>;

    fn into_iter(self) -> Self::IntoIter {
        self.signals.iter()
    }
}
