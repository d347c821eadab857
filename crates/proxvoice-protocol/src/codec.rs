use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::ProtocolError;

/// Maximum encoded size of a single packet payload.
/// Must fit a data frame header plus payload into one datagram.
pub const MAX_PACKET_SIZE: usize = 1024;

/// Encode a typed packet into its compact binary payload.
pub fn encode_packet<T: Serialize>(packet: &T) -> Result<Vec<u8>, ProtocolError> {
    let payload = postcard::to_allocvec(packet)?;
    if payload.len() > MAX_PACKET_SIZE {
        return Err(ProtocolError::DatagramTooLarge(payload.len()));
    }
    Ok(payload)
}

/// Decode a typed packet from a payload received on its channel.
pub fn decode_packet<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ProtocolError> {
    Ok(postcard::from_bytes(payload)?)
}
