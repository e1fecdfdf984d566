//! Test fixtures for consistent setup

use knx_signal_bridge::config::BridgeConfig;
use knx_signal_bridge::signal::{Hysteresis, Signal, SignalDirection, SignalRegistry, SignalValue};
use rstest::*;
use serde_json::{json, Value};
use std::time::Duration;

use super::fake_linknx::FakeLinknx;

/// Signals of a UPS: mains voltage, status and a writable test switch
#[fixture]
pub fn ups_registry() -> SignalRegistry {
    [
        Signal::new("1/0/1").with_policy(Hysteresis::Absolute(0.5)),
        Signal::new("1/0/2")
            .with_value(SignalValue::Unset)
            .with_translation([("ONBATT", "false"), ("ONLINE", "true")]),
        Signal::new("1/2/3").with_direction(SignalDirection::Write),
    ]
    .into_iter()
    .collect()
}

/// A bridge configuration talking to `bus` with the given devices
pub fn bridge_config(bus: &FakeLinknx, devices: Value) -> BridgeConfig {
    let document = json!({
        "sys": {
            "verbosity": "debug",
            "listenHost": "127.0.0.1",
            "shutdown_grace": "2s"
        },
        "linknx": {
            "host": bus.addr().ip().to_string(),
            "port": bus.addr().port(),
            "listenPort": 0,
            "ack_timeout": "1s"
        },
        "plugins": devices
    });
    let config = BridgeConfig::parse(&document.to_string()).expect("valid test config");
    config.validate().expect("consistent test config");
    config
}

/// Line device entry with a switched light and a temperature reading
pub fn line_device(name: &str, port: u16) -> Value {
    json!({
        "name": name,
        "class": "line_device",
        "host": "127.0.0.1",
        "port": port,
        "objects": [
            {
                "knx_group": "2/0/1",
                "rs485key": "light",
                "enabled": "receive,send",
                "valmap": { "1": "on", "0": "off" }
            },
            { "knx_group": "2/0/2", "rs485key": "temp", "hysteresis": 0.5 }
        ]
    })
}

pub const SHORT_ACK: Duration = Duration::from_millis(200);
