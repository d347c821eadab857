use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::types::*;

/// First packet a client sends, on the protocol channel.
/// Carries its own version and the oldest server version it accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolPacket {
    pub version_major: u8,
    pub version_minor: u8,
    pub minimum_version_major: u8,
    pub minimum_version_minor: u8,
}

/// Server answer on the protocol channel: `STATUS_CODE_OK` or
/// `STATUS_CODE_OUTDATED_PROTOCOL_VERSION`, plus the server's version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolResponsePacket {
    pub status_code: u8,
    pub version_major: u8,
    pub version_minor: u8,
}

/// Authorization request on the handshake channel.
///
/// `teamspeak_id == 0` means the voice backend has not associated the
/// client yet; the server answers with the backend coordinates so the
/// client can join the channel, and no session is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakePacket {
    pub status_code: u8,
    pub game_id: GameId,
    pub teamspeak_id: TeamspeakId,
    pub teamspeak_client_unique_identity: String,
}

/// Server answer on the handshake channel, carrying the voice-backend
/// coordinates the client needs to join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponsePacket {
    pub status_code: u8,
    pub reason: String,
    pub teamspeak_server_unique_identifier: String,
    pub channel_id: u64,
    pub channel_password: String,
}

/// Client status mirror, sent whenever one of the flags flips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPacket {
    pub talking: bool,
    pub microphone_muted: bool,
    pub speakers_muted: bool,
}

/// Metadata for one speaker entering or leaving a listener's audible set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientUpdateEntry {
    pub game_id: GameId,
    pub teamspeak_id: TeamspeakId,
    pub nickname: String,
    pub muted: bool,
}

/// Per-listener audibility delta for one tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePacket {
    pub added: Vec<ClientUpdateEntry>,
    pub removed: Vec<ClientUpdateEntry>,
}

/// Position of one audible speaker.
///
/// `is_relative` marks an override: `position` is then expressed in the
/// listener's local frame and `rotation` carries no meaning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientPositionEntry {
    pub game_id: GameId,
    pub position: Vec3,
    pub rotation: f32,
    pub is_relative: bool,
}

/// Current positions of every speaker a listener can hear.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionPacket {
    pub entries: Vec<ClientPositionEntry>,
}

/// Envelope for the update channel, which carries both audibility
/// deltas and position snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UpdateChannelMessage {
    Update(UpdatePacket),
    Positions(PositionPacket),
}
