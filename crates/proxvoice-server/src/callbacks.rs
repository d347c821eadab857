use std::sync::{Arc, RwLock};

use tracing::error;

use proxvoice_protocol::packets::StatusPacket;
use proxvoice_protocol::types::GameId;

use crate::state::StatusDiff;

/// Decides whether a handshaking client may join. The session
/// controller blocks on the answer, so the host must return promptly.
pub type ConnectingCallback = Arc<dyn Fn(GameId, &str) -> bool + Send + Sync>;
pub type ClientCallback = Arc<dyn Fn(GameId) + Send + Sync>;
pub type RejectedCallback = Arc<dyn Fn(GameId, u8) + Send + Sync>;
pub type StatusCallback = Arc<dyn Fn(GameId, bool) + Send + Sync>;

/// Host-registered event callbacks.
///
/// All notifications except the connecting gate are handed to the
/// blocking thread pool: the session task never waits on them, but the
/// work is retained and driven to completion.
#[derive(Default)]
pub struct CallbackRegistry {
    connecting: RwLock<Option<ConnectingCallback>>,
    connected: RwLock<Option<ClientCallback>>,
    rejected: RwLock<Option<RejectedCallback>>,
    disconnected: RwLock<Option<ClientCallback>>,
    talking_changed: RwLock<Option<StatusCallback>>,
    microphone_mute_changed: RwLock<Option<StatusCallback>>,
    speakers_mute_changed: RwLock<Option<StatusCallback>>,
}

fn load<T: Clone>(slot: &RwLock<Option<T>>) -> Option<T> {
    slot.read().ok().and_then(|guard| guard.clone())
}

fn store<T>(slot: &RwLock<Option<T>>, value: T) {
    if let Ok(mut guard) = slot.write() {
        *guard = Some(value);
    }
}

impl CallbackRegistry {
    pub fn set_connecting(&self, cb: impl Fn(GameId, &str) -> bool + Send + Sync + 'static) {
        store(&self.connecting, Arc::new(cb) as ConnectingCallback);
    }

    pub fn set_connected(&self, cb: impl Fn(GameId) + Send + Sync + 'static) {
        store(&self.connected, Arc::new(cb) as ClientCallback);
    }

    pub fn set_rejected(&self, cb: impl Fn(GameId, u8) + Send + Sync + 'static) {
        store(&self.rejected, Arc::new(cb) as RejectedCallback);
    }

    pub fn set_disconnected(&self, cb: impl Fn(GameId) + Send + Sync + 'static) {
        store(&self.disconnected, Arc::new(cb) as ClientCallback);
    }

    pub fn set_talking_changed(&self, cb: impl Fn(GameId, bool) + Send + Sync + 'static) {
        store(&self.talking_changed, Arc::new(cb) as StatusCallback);
    }

    pub fn set_microphone_mute_changed(&self, cb: impl Fn(GameId, bool) + Send + Sync + 'static) {
        store(&self.microphone_mute_changed, Arc::new(cb) as StatusCallback);
    }

    pub fn set_speakers_mute_changed(&self, cb: impl Fn(GameId, bool) + Send + Sync + 'static) {
        store(&self.speakers_mute_changed, Arc::new(cb) as StatusCallback);
    }

    /// The synchronous authorization gate. Absent callback accepts
    /// everyone; a panicking callback counts as a rejection.
    pub async fn client_connecting(&self, game_id: GameId, unique_identity: &str) -> bool {
        let Some(cb) = load(&self.connecting) else {
            return true;
        };
        let identity = unique_identity.to_owned();
        match tokio::task::spawn_blocking(move || cb(game_id, &identity)).await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(game_id, "connecting callback failed: {}", e);
                false
            }
        }
    }

    pub fn fire_connected(&self, game_id: GameId) {
        if let Some(cb) = load(&self.connected) {
            tokio::task::spawn_blocking(move || cb(game_id));
        }
    }

    pub fn fire_rejected(&self, game_id: GameId, status_code: u8) {
        if let Some(cb) = load(&self.rejected) {
            tokio::task::spawn_blocking(move || cb(game_id, status_code));
        }
    }

    pub fn fire_disconnected(&self, game_id: GameId) {
        if let Some(cb) = load(&self.disconnected) {
            tokio::task::spawn_blocking(move || cb(game_id));
        }
    }

    /// Fire the changed status callbacks in one blocking task so the
    /// order is fixed: talking, then microphone, then speakers.
    pub fn fire_status_changes(&self, game_id: GameId, status: StatusPacket, diff: StatusDiff) {
        let talking = diff.talking.then(|| load(&self.talking_changed)).flatten();
        let microphone = diff
            .microphone
            .then(|| load(&self.microphone_mute_changed))
            .flatten();
        let speakers = diff
            .speakers
            .then(|| load(&self.speakers_mute_changed))
            .flatten();

        if talking.is_none() && microphone.is_none() && speakers.is_none() {
            return;
        }

        tokio::task::spawn_blocking(move || {
            if let Some(cb) = talking {
                cb(game_id, status.talking);
            }
            if let Some(cb) = microphone {
                cb(game_id, status.microphone_muted);
            }
            if let Some(cb) = speakers {
                cb(game_id, status.speakers_muted);
            }
        });
    }
}
