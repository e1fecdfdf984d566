//! Bus side of the bridge: the serialized outbound writer, the inbound command
//! listener and the wire format they share.

pub mod gateway;
pub mod listener;
pub mod protocol;

pub use gateway::{BusGateway, GatewayStats};
pub use listener::{
    BusCommand, CommandDispatcher, CommandOrigin, CommandSubscriber, InboundListener,
};
