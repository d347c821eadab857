//! Wire protocol for the proxvoice coordination server: typed packets,
//! their binary codec, and the datagram framing used by the transport.

pub mod codec;
pub mod error;
pub mod frame;
pub mod packets;
pub mod types;
