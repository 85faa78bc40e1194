//! roost-core - MQTT packet types and wire codec.
//!
//! Bit-exact encoders and decoders for every control packet of MQTT 3.1.1
//! and MQTT 5.0, including the variable byte integer remaining-length
//! prefix and the MQTT 5 property system. Shared by the client crate and
//! by persistence backends that dump packets to storage.

pub mod error;
pub mod packet;
pub mod properties;
pub mod varint;

pub use error::{CodecError, Result};
pub use packet::*;
pub use properties::{
    AckProperties, AuthProperties, ConnackProperties, ConnectProperties, DisconnectProperties,
    PublishProperties, SubscribeProperties, UnsubscribeProperties, UserProperties, WillProperties,
};
