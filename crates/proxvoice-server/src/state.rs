use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use glam::Vec3;
use tracing::warn;

use proxvoice_protocol::packets::{
    ClientPositionEntry, ClientUpdateEntry, PositionPacket, StatusPacket, UpdatePacket,
};
use proxvoice_protocol::types::{GameId, TeamspeakId};

/// One connected voice client.
pub struct Client {
    peer: SocketAddr,
    game_id: GameId,
    teamspeak_id: TeamspeakId,
    unique_identity: String,
    nickname: String,
    position: Vec3,
    rotation: f32,
    voice_range: f32,
    /// Set on every spatial mutation, cleared at the end of a tick.
    position_changed: bool,
    /// Nobody hears this client while set (overrides excepted).
    muted: bool,
    /// Speakers this client, as a listener, has muted individually.
    muted_clients: HashSet<GameId>,
    /// Speakers this client currently hears.
    audible: HashSet<GameId>,
    /// Speakers this client has been told about and not yet told to drop.
    known: HashSet<GameId>,
    /// Forced-audible speakers, rendered at a listener-relative position.
    relative_audible: HashMap<GameId, Vec3>,
    /// Removal entries queued by `cleanup_known_client` for the next tick.
    pending_removals: HashSet<GameId>,
    talking: bool,
    microphone_muted: bool,
    speakers_muted: bool,
    connected: bool,
}

/// Which status flags changed when applying a status packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusDiff {
    pub talking: bool,
    pub microphone: bool,
    pub speakers: bool,
}

impl StatusDiff {
    pub fn any(&self) -> bool {
        self.talking || self.microphone || self.speakers
    }
}

impl Client {
    pub fn new(
        peer: SocketAddr,
        game_id: GameId,
        teamspeak_id: TeamspeakId,
        unique_identity: String,
    ) -> Self {
        Self {
            peer,
            game_id,
            teamspeak_id,
            unique_identity,
            nickname: String::new(),
            position: Vec3::ZERO,
            rotation: 0.0,
            voice_range: 0.0,
            // Evaluated on the first tick even if nobody moves.
            position_changed: true,
            muted: false,
            muted_clients: HashSet::new(),
            audible: HashSet::new(),
            known: HashSet::new(),
            relative_audible: HashMap::new(),
            pending_removals: HashSet::new(),
            talking: false,
            microphone_muted: false,
            speakers_muted: false,
            connected: true,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn game_id(&self) -> GameId {
        self.game_id
    }

    pub fn teamspeak_id(&self) -> TeamspeakId {
        self.teamspeak_id
    }

    pub fn unique_identity(&self) -> &str {
        &self.unique_identity
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn set_nickname(&mut self, nickname: String) {
        self.nickname = nickname;
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn set_position(&mut self, position: Vec3) {
        self.position = position;
        self.position_changed = true;
    }

    pub fn rotation(&self) -> f32 {
        self.rotation
    }

    pub fn set_rotation(&mut self, rotation: f32) {
        self.rotation = rotation;
        self.position_changed = true;
    }

    pub fn voice_range(&self) -> f32 {
        self.voice_range
    }

    /// A range change alters the audibility predicate for every pair
    /// involving this client, so it re-arms the tick evaluation.
    pub fn set_voice_range(&mut self, voice_range: f32) {
        self.voice_range = voice_range;
        self.position_changed = true;
    }

    pub fn position_changed(&self) -> bool {
        self.position_changed
    }

    pub fn reset_position_changed(&mut self) {
        self.position_changed = false;
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    pub fn set_muted_client(&mut self, speaker: GameId, muted: bool) {
        if muted {
            self.muted_clients.insert(speaker);
        } else {
            self.muted_clients.remove(&speaker);
        }
    }

    pub fn is_muted_client(&self, speaker: GameId) -> bool {
        self.muted_clients.contains(&speaker)
    }

    pub fn is_audible(&self, speaker: GameId) -> bool {
        self.audible.contains(&speaker)
    }

    pub fn knows(&self, speaker: GameId) -> bool {
        self.known.contains(&speaker)
    }

    pub fn add_audible_client(&mut self, speaker: GameId) {
        if speaker != self.game_id {
            self.audible.insert(speaker);
        }
    }

    pub fn remove_audible_client(&mut self, speaker: GameId) {
        self.audible.remove(&speaker);
    }

    /// Force a speaker audible at a position in this listener's frame.
    pub fn add_relative_audible_client(&mut self, speaker: GameId, position: Vec3) {
        if speaker == self.game_id {
            return;
        }
        self.relative_audible.insert(speaker, position);
        self.audible.insert(speaker);
    }

    pub fn remove_relative_audible_client(&mut self, speaker: GameId) {
        self.relative_audible.remove(&speaker);
    }

    pub fn relative_position_of(&self, speaker: GameId) -> Option<Vec3> {
        self.relative_audible.get(&speaker).copied()
    }

    pub fn relative_audible_clients(&self) -> Vec<GameId> {
        self.relative_audible.keys().copied().collect()
    }

    /// Evict a departing client from every per-client set and queue a
    /// removal entry for the next update packet.
    pub fn cleanup_known_client(&mut self, other: GameId) {
        self.audible.remove(&other);
        self.muted_clients.remove(&other);
        self.relative_audible.remove(&other);
        if self.known.remove(&other) {
            self.pending_removals.insert(other);
        }
    }

    pub fn is_talking(&self) -> bool {
        self.talking
    }

    pub fn has_microphone_muted(&self) -> bool {
        self.microphone_muted
    }

    pub fn has_speakers_muted(&self) -> bool {
        self.speakers_muted
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Apply a status packet, returning which flags actually changed.
    pub fn apply_status(&mut self, packet: &StatusPacket) -> StatusDiff {
        let diff = StatusDiff {
            talking: self.talking != packet.talking,
            microphone: self.microphone_muted != packet.microphone_muted,
            speakers: self.speakers_muted != packet.speakers_muted,
        };
        self.talking = packet.talking;
        self.microphone_muted = packet.microphone_muted;
        self.speakers_muted = packet.speakers_muted;
        diff
    }
}

/// Read-only view of a speaker used while listeners are borrowed mutably.
#[derive(Clone)]
struct SpeakerView {
    game_id: GameId,
    teamspeak_id: TeamspeakId,
    nickname: String,
    position: Vec3,
    rotation: f32,
    voice_range: f32,
    muted: bool,
    position_changed: bool,
}

/// Packets produced for one listener by a tick.
pub struct ClientPackets {
    pub peer: SocketAddr,
    pub update: Option<UpdatePacket>,
    pub positions: Option<PositionPacket>,
}

/// The client table: single owner of every client record, indexed by
/// game id with a peer-address lookup on the side.
pub struct ClientTable {
    clients: HashMap<GameId, Client>,
    peers: HashMap<SocketAddr, GameId>,
    max_clients: usize,
}

impl ClientTable {
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: HashMap::new(),
            peers: HashMap::new(),
            max_clients,
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn contains(&self, game_id: GameId) -> bool {
        self.clients.contains_key(&game_id)
    }

    pub fn get(&self, game_id: GameId) -> Option<&Client> {
        self.clients.get(&game_id)
    }

    pub fn get_mut(&mut self, game_id: GameId) -> Option<&mut Client> {
        self.clients.get_mut(&game_id)
    }

    pub fn by_peer(&self, peer: &SocketAddr) -> Option<&Client> {
        self.peers.get(peer).and_then(|id| self.clients.get(id))
    }

    pub fn by_peer_mut(&mut self, peer: &SocketAddr) -> Option<&mut Client> {
        let id = *self.peers.get(peer)?;
        self.clients.get_mut(&id)
    }

    pub fn by_teamspeak_id(&self, teamspeak_id: TeamspeakId) -> Option<&Client> {
        self.clients
            .values()
            .find(|c| c.teamspeak_id == teamspeak_id)
    }

    /// Insert a freshly handshaken client.
    pub fn insert(&mut self, client: Client) -> anyhow::Result<()> {
        if self.clients.len() >= self.max_clients {
            anyhow::bail!("client table is full");
        }
        if self.clients.contains_key(&client.game_id) {
            anyhow::bail!("game id {} is already connected", client.game_id);
        }
        if self.peers.contains_key(&client.peer) {
            anyhow::bail!("peer {} already owns a session", client.peer);
        }

        self.peers.insert(client.peer, client.game_id);
        self.clients.insert(client.game_id, client);
        Ok(())
    }

    /// Remove a client and evict its id from every other record.
    pub fn remove(&mut self, game_id: GameId) -> Option<Client> {
        let client = self.clients.remove(&game_id)?;
        self.peers.remove(&client.peer);
        for other in self.clients.values_mut() {
            other.cleanup_known_client(game_id);
        }
        Some(client)
    }

    pub fn remove_by_peer(&mut self, peer: &SocketAddr) -> Option<Client> {
        let game_id = *self.peers.get(peer)?;
        self.remove(game_id)
    }

    /// Remove every client at once. No cross-eviction is needed since
    /// all records go away together.
    pub fn drain_all(&mut self) -> Vec<Client> {
        self.peers.clear();
        self.clients.drain().map(|(_, c)| c).collect()
    }

    pub fn game_ids(&self) -> Vec<GameId> {
        let mut ids: Vec<GameId> = self.clients.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Can `listener` hear `speaker` right now? Overrides dominate,
    /// then mutes, then strict range proximity.
    fn audibility(listener: &Client, speaker: &SpeakerView) -> bool {
        if listener.relative_audible.contains_key(&speaker.game_id) {
            return true;
        }
        if speaker.muted || listener.muted_clients.contains(&speaker.game_id) {
            return false;
        }
        listener.position.distance(speaker.position) < speaker.voice_range
    }

    fn speaker_view(&self, game_id: GameId) -> Option<SpeakerView> {
        self.clients.get(&game_id).map(|c| SpeakerView {
            game_id: c.game_id,
            teamspeak_id: c.teamspeak_id,
            nickname: c.nickname.clone(),
            position: c.position,
            rotation: c.rotation,
            voice_range: c.voice_range,
            muted: c.muted,
            position_changed: c.position_changed,
        })
    }

    /// Re-evaluate one directed pair immediately (mute and override
    /// commands must not wait for the next tick).
    pub fn refresh_pair(&mut self, listener_id: GameId, speaker_id: GameId) {
        if listener_id == speaker_id {
            return;
        }
        let Some(speaker) = self.speaker_view(speaker_id) else {
            return;
        };
        let Some(listener) = self.clients.get_mut(&listener_id) else {
            return;
        };
        if Self::audibility(listener, &speaker) {
            listener.audible.insert(speaker_id);
        } else {
            listener.audible.remove(&speaker_id);
        }
    }

    /// Re-evaluate a speaker against every listener immediately.
    pub fn refresh_speaker(&mut self, speaker_id: GameId) {
        let Some(speaker) = self.speaker_view(speaker_id) else {
            return;
        };
        for listener in self.clients.values_mut() {
            if listener.game_id == speaker_id {
                continue;
            }
            if Self::audibility(listener, &speaker) {
                listener.audible.insert(speaker_id);
            } else {
                listener.audible.remove(&speaker_id);
            }
        }
    }

    /// One audibility pass: update every listener's audible set, build
    /// the per-listener delta and position packets, and clear the
    /// position-changed flags.
    pub fn tick(&mut self) -> Vec<ClientPackets> {
        let speakers: Vec<SpeakerView> = self
            .game_ids()
            .iter()
            .filter_map(|id| self.speaker_view(*id))
            .collect();
        let by_id: HashMap<GameId, usize> = speakers
            .iter()
            .enumerate()
            .map(|(i, s)| (s.game_id, i))
            .collect();

        let mut outbound = Vec::new();

        for listener_view in &speakers {
            let Some(listener) = self.clients.get_mut(&listener_view.game_id) else {
                continue;
            };
            if !listener.connected {
                warn!(game_id = listener.game_id, "client is not connected but in table");
                continue;
            }

            for speaker in &speakers {
                if speaker.game_id == listener.game_id {
                    continue;
                }
                // Unless a range or position changed on either side,
                // this pair cannot have flipped since the last tick.
                if !listener.position_changed && !speaker.position_changed {
                    continue;
                }
                if Self::audibility(listener, speaker) {
                    listener.audible.insert(speaker.game_id);
                } else {
                    listener.audible.remove(&speaker.game_id);
                }
            }

            // Delta against what the client has been told so far.
            let mut added: Vec<GameId> = listener
                .audible
                .difference(&listener.known)
                .copied()
                .collect();
            let mut removed: Vec<GameId> = listener
                .known
                .difference(&listener.audible)
                .copied()
                .collect();
            removed.extend(listener.pending_removals.drain());
            added.sort_unstable();
            removed.sort_unstable();
            removed.dedup();

            for id in &added {
                listener.known.insert(*id);
            }
            for id in &removed {
                listener.known.remove(id);
            }

            let update = if added.is_empty() && removed.is_empty() {
                None
            } else {
                let entry = |id: &GameId| match by_id.get(id).map(|i| &speakers[*i]) {
                    Some(s) => ClientUpdateEntry {
                        game_id: s.game_id,
                        teamspeak_id: s.teamspeak_id,
                        nickname: s.nickname.clone(),
                        muted: s.muted,
                    },
                    // Speaker already left the table; the id is enough
                    // for the client to drop it.
                    None => ClientUpdateEntry {
                        game_id: *id,
                        teamspeak_id: 0,
                        nickname: String::new(),
                        muted: false,
                    },
                };
                Some(UpdatePacket {
                    added: added.iter().map(entry).collect(),
                    removed: removed.iter().map(entry).collect(),
                })
            };

            let mut audible: Vec<GameId> = listener.audible.iter().copied().collect();
            audible.sort_unstable();
            let mut entries = Vec::with_capacity(audible.len());
            for id in audible {
                if let Some(relative) = listener.relative_audible.get(&id) {
                    entries.push(ClientPositionEntry {
                        game_id: id,
                        position: *relative,
                        rotation: 0.0,
                        is_relative: true,
                    });
                } else if let Some(s) = by_id.get(&id).map(|i| &speakers[*i]) {
                    entries.push(ClientPositionEntry {
                        game_id: id,
                        position: s.position,
                        rotation: s.rotation,
                        is_relative: false,
                    });
                }
            }
            let positions = if entries.is_empty() {
                None
            } else {
                Some(PositionPacket { entries })
            };

            if update.is_some() || positions.is_some() {
                outbound.push(ClientPackets {
                    peer: listener.peer,
                    update,
                    positions,
                });
            }
        }

        for client in self.clients.values_mut() {
            client.reset_position_changed();
        }

        outbound
    }
}
