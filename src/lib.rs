//! KNX signal bridge
//!
//! Connects field devices (UPS monitors, RS-485 gateways, weather stations)
//! to a KNX bus reached through a linknx daemon. Device readings become bus
//! writes after change detection; bus writes become device commands.
//!
//! # Layout
//!
//! - [`signal`]: signal registry and change detection
//! - [`bus`]: outbound write gateway and inbound command listener
//! - [`session`]: per-device session loop with reconnection
//! - [`devices`]: concrete device adapters
//! - [`supervisor`]: startup, signal handling and graceful shutdown

pub mod bus;
pub mod config;
pub mod devices;
pub mod error;
pub mod logging;
pub mod session;
pub mod signal;
pub mod supervisor;

// Test support modules - available for both unit tests and integration tests
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use bus::{BusCommand, BusGateway, CommandDispatcher, InboundListener};
pub use config::BridgeConfig;
pub use error::{BridgeError, BusError, Result};
pub use supervisor::Bridge;
