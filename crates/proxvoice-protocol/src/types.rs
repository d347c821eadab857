/// Player identifier assigned by the embedding game host.
/// Unique among connected clients.
pub type GameId = u16;

/// Client identifier assigned by the TeamSpeak backend.
/// 0 means the backend has not associated the client yet.
pub type TeamspeakId = u16;

/// Current protocol version.
pub const PROTOCOL_VERSION_MAJOR: u8 = 1;
pub const PROTOCOL_VERSION_MINOR: u8 = 0;

/// Oldest client protocol version this server still accepts.
pub const PROTOCOL_MIN_VERSION_MAJOR: u8 = 1;
pub const PROTOCOL_MIN_VERSION_MINOR: u8 = 0;

// ── Status codes ──────────────────────────────────────────────────────

pub const STATUS_CODE_OK: u8 = 0;
pub const STATUS_CODE_OUTDATED_PROTOCOL_VERSION: u8 = 1;

// ── Disconnect user codes ─────────────────────────────────────────────

pub const DISCONNECT_STATUS_DEFAULT: u32 = 0;
pub const DISCONNECT_STATUS_OUTDATED_CLIENT: u32 = 1;
pub const DISCONNECT_STATUS_OUTDATED_SERVER: u32 = 2;
pub const DISCONNECT_STATUS_REJECTED: u32 = 3;

// ── Logical channels ──────────────────────────────────────────────────

/// Protocol version negotiation.
pub const PROTOCOL_CHANNEL: u8 = 0;
/// Handshake and authorization.
pub const HANDSHAKE_CHANNEL: u8 = 1;
/// Client status (talking / microphone / speakers).
pub const STATUS_CHANNEL: u8 = 2;
/// Audibility deltas and positions.
pub const UPDATE_CHANNEL: u8 = 3;

pub const CHANNEL_COUNT: usize = 4;

/// One side of the two-sided version negotiation: `(major, minor)` is
/// acceptable against a declared minimum iff the major matches exactly
/// and the minor is at least the minimum minor.
pub fn protocol_version_compatible(major: u8, minor: u8, min_major: u8, min_minor: u8) -> bool {
    major == min_major && minor >= min_minor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_exact_match() {
        assert!(protocol_version_compatible(1, 0, 1, 0));
    }

    #[test]
    fn version_newer_minor_accepted() {
        assert!(protocol_version_compatible(1, 3, 1, 1));
    }

    #[test]
    fn version_older_minor_rejected() {
        assert!(!protocol_version_compatible(1, 0, 1, 2));
    }

    #[test]
    fn version_major_mismatch_rejected() {
        assert!(!protocol_version_compatible(2, 0, 1, 0));
        assert!(!protocol_version_compatible(0, 9, 1, 0));
    }
}
