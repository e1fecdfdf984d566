//! Device integrations
//!
//! Adapters are picked by a static match on the configured class.

pub mod apc_ups;
pub mod line_device;
#[cfg(feature = "http-server")]
pub mod weather_station;

pub use apc_ups::ApcUpsAdapter;
pub use line_device::LineDeviceAdapter;
#[cfg(feature = "http-server")]
pub use weather_station::WeatherStationAdapter;

use crate::config::{DeviceConfig, DeviceKind, SysConfig};
use crate::error::{BridgeError, Result};
use crate::session::DeviceAdapter;

/// Build the adapter for a configured device
pub fn build_adapter(device: &DeviceConfig, sys: &SysConfig) -> Result<Box<dyn DeviceAdapter>> {
    match &device.kind {
        DeviceKind::ApcUps(ups) => Ok(Box::new(ApcUpsAdapter::new(device, ups)?)),
        DeviceKind::LineDevice(line) => Ok(Box::new(LineDeviceAdapter::new(device, line)?)),
        #[cfg(feature = "http-server")]
        DeviceKind::WeatherStation(station) => Ok(Box::new(WeatherStationAdapter::new(
            device,
            station,
            &sys.listen_host,
        )?)),
        #[cfg(not(feature = "http-server"))]
        DeviceKind::WeatherStation(_) => {
            let _ = sys;
            Err(BridgeError::config(format!(
                "device '{}': weather_station needs the http-server feature",
                device.name
            )))
        }
        DeviceKind::Unsupported => Err(BridgeError::config(format!(
            "device '{}' has an unsupported class",
            device.name
        ))),
    }
}
