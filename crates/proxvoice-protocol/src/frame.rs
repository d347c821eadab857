use bytes::{Buf, BufMut};

use crate::error::ProtocolError;

/// Frame kinds carried in the first byte of every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Client requests a connection.
    Connect = 0x01,
    /// Server accepts a connection.
    ConnectAck = 0x02,
    /// Either side closes the connection, with a user code.
    Disconnect = 0x03,
    /// Channelised application payload.
    Data = 0x04,
    /// Acknowledgement for a reliable data frame.
    Ack = 0x05,
    /// Keepalive probe for a quiet peer.
    Ping = 0x06,
    /// Keepalive answer.
    Pong = 0x07,
}

impl FrameKind {
    pub fn from_byte(b: u8) -> Result<Self, ProtocolError> {
        match b {
            0x01 => Ok(Self::Connect),
            0x02 => Ok(Self::ConnectAck),
            0x03 => Ok(Self::Disconnect),
            0x04 => Ok(Self::Data),
            0x05 => Ok(Self::Ack),
            0x06 => Ok(Self::Ping),
            0x07 => Ok(Self::Pong),
            other => Err(ProtocolError::UnknownFrameKind(other)),
        }
    }
}

/// Data frame flag: deliver reliably and in order.
pub const FLAG_RELIABLE: u8 = 0x01;

/// Header size of a data frame:
/// 1 (kind) + 1 (channel) + 1 (flags) + 4 (sequence) = 7 bytes.
pub const DATA_HEADER_SIZE: usize = 7;

/// Maximum datagram size, well under the usual 1472-byte MTU limit.
pub const MAX_DATAGRAM_SIZE: usize = 1200;

/// One parsed datagram.
///
/// Wire format (all integers little-endian):
/// ```text
/// connect:     [0x01]
/// connect-ack: [0x02]
/// disconnect:  [0x03] [code: u32]
/// data:        [0x04] [channel: u8] [flags: u8] [sequence: u32] [payload...]
/// ack:         [0x05] [channel: u8] [sequence: u32]
/// ping:        [0x06]
/// pong:        [0x07]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Connect,
    ConnectAck,
    Disconnect {
        code: u32,
    },
    Data {
        channel: u8,
        reliable: bool,
        sequence: u32,
        payload: Vec<u8>,
    },
    Ack {
        channel: u8,
        sequence: u32,
    },
    Ping,
    Pong,
}

impl Frame {
    /// Serialize for UDP transmission.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Frame::Connect => vec![FrameKind::Connect as u8],
            Frame::ConnectAck => vec![FrameKind::ConnectAck as u8],
            Frame::Disconnect { code } => {
                let mut buf = Vec::with_capacity(5);
                buf.put_u8(FrameKind::Disconnect as u8);
                buf.put_u32_le(*code);
                buf
            }
            Frame::Data {
                channel,
                reliable,
                sequence,
                payload,
            } => {
                let mut buf = Vec::with_capacity(DATA_HEADER_SIZE + payload.len());
                buf.put_u8(FrameKind::Data as u8);
                buf.put_u8(*channel);
                buf.put_u8(if *reliable { FLAG_RELIABLE } else { 0 });
                buf.put_u32_le(*sequence);
                buf.put_slice(payload);
                buf
            }
            Frame::Ack { channel, sequence } => {
                let mut buf = Vec::with_capacity(6);
                buf.put_u8(FrameKind::Ack as u8);
                buf.put_u8(*channel);
                buf.put_u32_le(*sequence);
                buf
            }
            Frame::Ping => vec![FrameKind::Ping as u8],
            Frame::Pong => vec![FrameKind::Pong as u8],
        }
    }

    /// Deserialize from raw UDP bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(ProtocolError::DatagramTooLarge(data.len()));
        }

        let mut buf = data;
        if !buf.has_remaining() {
            return Err(ProtocolError::FrameTooShort {
                expected: 1,
                got: 0,
            });
        }

        let kind = FrameKind::from_byte(buf.get_u8())?;
        match kind {
            FrameKind::Connect => Ok(Frame::Connect),
            FrameKind::ConnectAck => Ok(Frame::ConnectAck),
            FrameKind::Disconnect => {
                if buf.remaining() < 4 {
                    return Err(ProtocolError::FrameTooShort {
                        expected: 5,
                        got: data.len(),
                    });
                }
                Ok(Frame::Disconnect {
                    code: buf.get_u32_le(),
                })
            }
            FrameKind::Data => {
                if buf.remaining() < DATA_HEADER_SIZE - 1 {
                    return Err(ProtocolError::FrameTooShort {
                        expected: DATA_HEADER_SIZE,
                        got: data.len(),
                    });
                }
                let channel = buf.get_u8();
                let flags = buf.get_u8();
                let sequence = buf.get_u32_le();
                Ok(Frame::Data {
                    channel,
                    reliable: flags & FLAG_RELIABLE != 0,
                    sequence,
                    payload: buf.to_vec(),
                })
            }
            FrameKind::Ack => {
                if buf.remaining() < 5 {
                    return Err(ProtocolError::FrameTooShort {
                        expected: 6,
                        got: data.len(),
                    });
                }
                let channel = buf.get_u8();
                Ok(Frame::Ack {
                    channel,
                    sequence: buf.get_u32_le(),
                })
            }
            FrameKind::Ping => Ok(Frame::Ping),
            FrameKind::Pong => Ok(Frame::Pong),
        }
    }
}
