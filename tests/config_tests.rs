//! Loading bridge configuration files

use knx_signal_bridge::config::{BridgeConfig, DeviceKind, LineTransport};
use knx_signal_bridge::signal::{Hysteresis, SignalDirection, SignalValue};
use knx_signal_bridge::BridgeError;
use pretty_assertions::assert_eq;
use serial_test::serial;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

const FULL: &str = r#"{
    "sys": { "verbosity": "debug", "listenHost": "127.0.0.1" },
    "linknx": { "host": "linknx.local", "port": 1028, "listenPort": 1031, "ack_timeout": "10s" },
    "plugins": [
        {
            "name": "ups",
            "class": "apc_ups",
            "host": "127.0.0.1",
            "poll_interval": "30s",
            "default_hysteresis": "2%",
            "objects": [
                { "knx_group": "1/0/1", "ups_expr": "LINEV\\s*:\\s*(\\S+)", "hysteresis": 0.5 },
                { "knx_group": "1/0/2", "ups_expr": "STATUS\\s*:\\s*(\\S+)",
                  "valmap": { "ONBATT": "false", "ONLINE": "true" } },
                { "knx_group": "1/0/3", "ups_expr": "BCHARGE\\s*:\\s*(\\S+)" }
            ]
        },
        {
            "name": "rs485",
            "class": "line_device",
            "serialDevice": "/dev/ttyUSB0",
            "initial_value": "unset",
            "reconnect": { "initial_delay": "500ms", "max_attempts": 3 },
            "objects": [
                { "knx_group": "2/0/1", "rs485key": "relay1", "enabled": "send" },
                {
                    "knx_group": "2/0/2",
                    "rs485key": "temp",
                    "enabled": "receive",
                    "hysteresis": "bogus"
                }
            ]
        },
        {
            "name": "garden",
            "class": "weather_station",
            "listenPort": 8080,
            "enabled": false,
            "objects": [
                { "knx_group": "5/0/1", "sensor": "tempf", "conversion": "F_to_C" }
            ]
        }
    ]
}"#;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
#[serial]
fn test_load_full_configuration() {
    let file = write_config(FULL);
    let config = BridgeConfig::load(file.path()).unwrap();

    assert_eq!(config.bus.endpoint(), "linknx.local:1028");
    assert_eq!(config.bus.ack_timeout, Duration::from_secs(10));
    assert_eq!(config.listen_addr(), "127.0.0.1:1031");
    assert_eq!(config.devices.len(), 3);
    assert_eq!(
        config.enabled_devices().map(|d| d.name.as_str()).collect::<Vec<_>>(),
        vec!["ups", "rs485"]
    );

    let ups = config.get_device("ups").unwrap();
    assert!(matches!(&ups.kind, DeviceKind::ApcUps(apc) if apc.port == 3551));
    assert_eq!(ups.poll_interval, Some(Duration::from_secs(30)));
    let signals = ups.build_signals();
    assert_eq!(signals[0].policy, Hysteresis::Absolute(0.5));
    assert_eq!(signals[1].translation.get("ONBATT").map(String::as_str), Some("false"));
    assert_eq!(signals[2].policy, Hysteresis::Percentage(2.0));
    assert_eq!(signals[2].value, SignalValue::Numeric(0.0));

    let rs485 = config.get_device("rs485").unwrap();
    let DeviceKind::LineDevice(line) = &rs485.kind else {
        panic!("rs485 should be a line device");
    };
    assert_eq!(
        line.transport().unwrap(),
        LineTransport::Serial {
            path: "/dev/ttyUSB0".into()
        }
    );
    let reconnect = rs485.reconnect.clone().unwrap();
    assert_eq!(reconnect.initial_delay, Duration::from_millis(500));
    assert_eq!(reconnect.max_attempts, Some(3));

    let signals = rs485.build_signals();
    assert_eq!(signals[0].direction, SignalDirection::Write);
    assert!(signals[0].value.is_unset());
    // an unusable hysteresis switches the signal off instead of failing the load
    assert_eq!(signals[1].direction, SignalDirection::Read);
    assert!(!signals[1].enabled);
}

#[test]
#[serial]
fn test_environment_overrides_file_values() {
    let file = write_config(FULL);
    let config = temp_env::with_vars(
        [
            ("KNX_BRIDGE__BUS__PORT", Some("2028")),
            ("KNX_BRIDGE__SYS__SHUTDOWN_GRACE", Some("1s")),
        ],
        || BridgeConfig::load(file.path()).unwrap(),
    );

    assert_eq!(config.bus.port, 2028);
    assert_eq!(config.bus.host, "linknx.local");
    assert_eq!(config.sys.shutdown_grace, Duration::from_secs(1));
    assert_eq!(config.devices.len(), 3);
}

#[test]
#[serial]
fn test_duplicate_addresses_rejected() {
    let file = write_config(
        r#"{ "plugins": [ { "name": "ups", "class": "apc_ups", "host": "localhost",
             "objects": [ { "knx_group": "1/0/1" }, { "knx_group": "1/0/1" } ] } ] }"#,
    );
    let err = BridgeConfig::load(file.path()).unwrap_err();
    assert!(matches!(err, BridgeError::Config(ref msg) if msg.contains("1/0/1")));
}

#[test]
#[serial]
fn test_line_device_needs_one_transport() {
    let file = write_config(
        r#"{ "plugins": [ { "name": "rs485", "class": "line_device",
             "host": "localhost", "port": 4000, "serialDevice": "/dev/ttyS0" } ] }"#,
    );
    assert!(matches!(
        BridgeConfig::load(file.path()),
        Err(BridgeError::Config(_))
    ));
}

#[test]
fn test_malformed_json() {
    let file = write_config("{ \"linknx\": ");
    assert!(matches!(
        BridgeConfig::load(file.path()),
        Err(BridgeError::Config(_))
    ));
}
