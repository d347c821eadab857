use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use glam::Vec3;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use zeroize::Zeroizing;

use proxvoice_protocol::types::{GameId, DISCONNECT_STATUS_DEFAULT};

use crate::callbacks::CallbackRegistry;
use crate::config::ServerConfig;
use crate::engine;
use crate::session;
use crate::state::{Client, ClientTable};
use crate::transport::Transport;

/// Hard cap on concurrently connected clients.
pub const MAX_CLIENTS: usize = 256;

/// Time clients get to receive their disconnect during shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// One position update in a batch.
#[derive(Debug, Clone, Copy)]
pub struct ClientPositionUpdate {
    pub game_id: GameId,
    pub position: Vec3,
    pub rotation: f32,
}

/// Audio rendering hints forwarded to clients.
/// Stored but not yet propagated; no packet carries them so far.
struct AudioSettings {
    distance_factor: f32,
    rolloff_factor: f32,
}

pub(crate) struct ServerInner {
    pub(crate) transport: Arc<Transport>,
    pub(crate) clients: RwLock<ClientTable>,
    pub(crate) callbacks: CallbackRegistry,
    pub(crate) teamspeak_server_id: String,
    pub(crate) teamspeak_channel_id: u64,
    pub(crate) teamspeak_channel_password: Zeroizing<String>,
    audio: std::sync::Mutex<AudioSettings>,
}

/// The coordination server: command surface for the embedding game
/// host. All mutating commands answer `false` when the server is not
/// running or the addressed client is unknown.
pub struct VoiceServer {
    inner: Arc<ServerInner>,
    running: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl VoiceServer {
    /// Bind the transport and start the network and tick tasks.
    pub async fn create(config: &ServerConfig) -> anyhow::Result<Self> {
        let (transport, events) = Transport::bind(&config.host, config.port, MAX_CLIENTS)
            .context("unable to create voice server host")?;

        let inner = Arc::new(ServerInner {
            transport: transport.clone(),
            clients: RwLock::new(ClientTable::new(MAX_CLIENTS)),
            callbacks: CallbackRegistry::default(),
            teamspeak_server_id: config.teamspeak_server_id.clone(),
            teamspeak_channel_id: config.teamspeak_channel_id,
            teamspeak_channel_password: Zeroizing::new(config.teamspeak_channel_password.clone()),
            audio: std::sync::Mutex::new(AudioSettings {
                distance_factor: 1.0,
                rolloff_factor: 1.0,
            }),
        });

        let (running, running_rx) = watch::channel(true);

        let tasks = vec![
            tokio::spawn(transport.run(running_rx.clone())),
            tokio::spawn(session::run_session_loop(
                inner.clone(),
                events,
                running_rx.clone(),
            )),
            tokio::spawn(engine::run_update_loop(inner.clone(), running_rx)),
        ];

        info!(addr = %inner.transport.local_addr(), "voice server started");

        Ok(Self {
            inner,
            running,
            tasks: Mutex::new(tasks),
        })
    }

    /// Disconnect everyone, wait out the grace period, stop the tasks.
    pub async fn close(&self) {
        if !self.is_running() {
            return;
        }

        if self.remove_all_clients().await {
            // Give the disconnect frames time to reach the clients.
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        }

        let _ = self.running.send(false);

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }

        info!("voice server closed");
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Actual bound port (relevant when configured with port 0).
    pub fn port(&self) -> u16 {
        self.inner.transport.local_addr().port()
    }

    pub fn teamspeak_server_id(&self) -> &str {
        &self.inner.teamspeak_server_id
    }

    pub fn teamspeak_channel_id(&self) -> u64 {
        self.inner.teamspeak_channel_id
    }

    pub fn teamspeak_channel_password(&self) -> String {
        self.inner.teamspeak_channel_password.to_string()
    }

    pub async fn number_of_clients(&self) -> usize {
        self.inner.clients.read().await.len()
    }

    // ── Position and range commands ────────────────────────────────────

    pub async fn set_client_position(
        &self,
        game_id: GameId,
        position: Vec3,
        rotation: f32,
    ) -> bool {
        if !self.is_running() {
            return false;
        }
        let mut clients = self.inner.clients.write().await;
        let Some(client) = clients.get_mut(game_id) else {
            warn!(game_id, "unable to find client for position");
            return false;
        };
        client.set_position(position);
        client.set_rotation(rotation);
        true
    }

    /// Batched position update under one lock acquisition.
    /// Answers false if any entry addressed an unknown client.
    pub async fn set_client_positions(&self, updates: &[ClientPositionUpdate]) -> bool {
        if !self.is_running() {
            return false;
        }
        let mut clients = self.inner.clients.write().await;
        let mut success = true;
        for update in updates {
            let Some(client) = clients.get_mut(update.game_id) else {
                success = false;
                continue;
            };
            client.set_position(update.position);
            client.set_rotation(update.rotation);
        }
        success
    }

    pub async fn set_client_voice_range(&self, game_id: GameId, voice_range: f32) -> bool {
        if !self.is_running() {
            return false;
        }
        let mut clients = self.inner.clients.write().await;
        let Some(client) = clients.get_mut(game_id) else {
            warn!(game_id, "unable to find client for voice range");
            return false;
        };
        client.set_voice_range(voice_range);
        true
    }

    pub async fn set_client_nickname(&self, game_id: GameId, nickname: &str) -> bool {
        if !self.is_running() {
            return false;
        }
        let mut clients = self.inner.clients.write().await;
        let Some(client) = clients.get_mut(game_id) else {
            warn!(game_id, "unable to find client for nickname");
            return false;
        };
        client.set_nickname(nickname.to_owned());
        true
    }

    // ── Relative position overrides ────────────────────────────────────

    pub async fn set_relative_position_for_client(
        &self,
        listener_id: GameId,
        speaker_id: GameId,
        position: Vec3,
    ) -> bool {
        if !self.is_running() {
            return false;
        }
        let mut clients = self.inner.clients.write().await;
        if !clients.contains(speaker_id) {
            warn!(speaker_id, "unable to find speaker for relative position");
            return false;
        }
        let Some(listener) = clients.get_mut(listener_id) else {
            warn!(listener_id, "unable to find listener for relative position");
            return false;
        };
        listener.add_relative_audible_client(speaker_id, position);
        true
    }

    pub async fn reset_relative_position_for_client(
        &self,
        listener_id: GameId,
        speaker_id: GameId,
    ) -> bool {
        if !self.is_running() {
            return false;
        }
        let mut clients = self.inner.clients.write().await;
        if !clients.contains(speaker_id) {
            warn!(speaker_id, "unable to find speaker for relative position reset");
            return false;
        }
        let Some(listener) = clients.get_mut(listener_id) else {
            warn!(listener_id, "unable to find listener for relative position reset");
            return false;
        };
        listener.remove_relative_audible_client(speaker_id);
        // Without the override the pair falls back to the distance
        // rule, effective immediately.
        clients.refresh_pair(listener_id, speaker_id);
        true
    }

    pub async fn reset_all_relative_positions(&self, listener_id: GameId) -> bool {
        if !self.is_running() {
            return false;
        }
        let mut clients = self.inner.clients.write().await;
        let Some(listener) = clients.get_mut(listener_id) else {
            warn!(listener_id, "unable to find client for relative position reset");
            return false;
        };
        let speakers = listener.relative_audible_clients();
        for speaker_id in &speakers {
            listener.remove_relative_audible_client(*speaker_id);
        }
        for speaker_id in speakers {
            clients.refresh_pair(listener_id, speaker_id);
        }
        true
    }

    // ── Mutes ──────────────────────────────────────────────────────────

    /// Mute or unmute a client for every listener, recomputing the
    /// affected audibility immediately instead of waiting for a tick.
    pub async fn mute_client_for_all(&self, game_id: GameId, muted: bool) -> bool {
        if !self.is_running() {
            return false;
        }
        let mut clients = self.inner.clients.write().await;
        let Some(client) = clients.get_mut(game_id) else {
            warn!(game_id, "unable to find client for mute");
            return false;
        };
        client.set_muted(muted);
        clients.refresh_speaker(game_id);
        true
    }

    pub async fn is_client_muted_for_all(&self, game_id: GameId) -> bool {
        match self.inner.clients.read().await.get(game_id) {
            Some(client) => client.is_muted(),
            None => {
                warn!(game_id, "unable to find client for mute query");
                false
            }
        }
    }

    pub async fn mute_client_for_client(
        &self,
        speaker_id: GameId,
        listener_id: GameId,
        muted: bool,
    ) -> bool {
        if !self.is_running() {
            return false;
        }
        let mut clients = self.inner.clients.write().await;
        if !clients.contains(speaker_id) {
            warn!(speaker_id, "unable to find speaker for mute");
            return false;
        }
        let Some(listener) = clients.get_mut(listener_id) else {
            warn!(listener_id, "unable to find listener for mute");
            return false;
        };
        listener.set_muted_client(speaker_id, muted);
        clients.refresh_pair(listener_id, speaker_id);
        true
    }

    pub async fn is_client_muted_for_client(
        &self,
        speaker_id: GameId,
        listener_id: GameId,
    ) -> bool {
        match self.inner.clients.read().await.get(listener_id) {
            Some(listener) => listener.is_muted_client(speaker_id),
            None => false,
        }
    }

    // ── Status accessors ───────────────────────────────────────────────

    pub async fn is_client_connected(&self, game_id: GameId) -> bool {
        self.inner.clients.read().await.contains(game_id)
    }

    pub async fn is_client_talking(&self, game_id: GameId) -> bool {
        self.inner
            .clients
            .read()
            .await
            .get(game_id)
            .map(Client::is_talking)
            .unwrap_or(false)
    }

    pub async fn is_client_microphone_muted(&self, game_id: GameId) -> bool {
        self.inner
            .clients
            .read()
            .await
            .get(game_id)
            .map(Client::has_microphone_muted)
            .unwrap_or(false)
    }

    pub async fn is_client_speakers_muted(&self, game_id: GameId) -> bool {
        self.inner
            .clients
            .read()
            .await
            .get(game_id)
            .map(Client::has_speakers_muted)
            .unwrap_or(false)
    }

    // ── Audio hints ────────────────────────────────────────────────────

    pub fn set_3d_settings(&self, distance_factor: f32, rolloff_factor: f32) {
        if let Ok(mut audio) = self.inner.audio.lock() {
            audio.distance_factor = distance_factor;
            audio.rolloff_factor = rolloff_factor;
        }
    }

    pub fn distance_factor(&self) -> f32 {
        self.inner
            .audio
            .lock()
            .map(|a| a.distance_factor)
            .unwrap_or(1.0)
    }

    pub fn rolloff_factor(&self) -> f32 {
        self.inner
            .audio
            .lock()
            .map(|a| a.rolloff_factor)
            .unwrap_or(1.0)
    }

    // ── Removal ────────────────────────────────────────────────────────

    /// Forceful removal, equivalent to a disconnect.
    pub async fn remove_client(&self, game_id: GameId) -> bool {
        if !self.is_running() {
            return false;
        }
        let removed = {
            let mut clients = self.inner.clients.write().await;
            clients.remove(game_id)
        };
        let Some(client) = removed else {
            warn!(game_id, "client to be removed not found");
            return false;
        };

        info!(endpoint = %client.peer(), game_id, "client disconnected");
        self.inner
            .transport
            .disconnect(client.peer(), DISCONNECT_STATUS_DEFAULT)
            .await;
        self.inner.callbacks.fire_disconnected(game_id);
        true
    }

    /// Disconnect every client at once. Fires no callbacks.
    pub async fn remove_all_clients(&self) -> bool {
        let drained = {
            let mut clients = self.inner.clients.write().await;
            clients.drain_all()
        };
        if drained.is_empty() {
            return false;
        }
        for client in &drained {
            self.inner
                .transport
                .disconnect(client.peer(), DISCONNECT_STATUS_DEFAULT)
                .await;
        }
        true
    }

    // ── Callback registration ──────────────────────────────────────────

    pub fn register_client_connecting_callback(
        &self,
        callback: impl Fn(GameId, &str) -> bool + Send + Sync + 'static,
    ) {
        self.inner.callbacks.set_connecting(callback);
    }

    pub fn register_client_connected_callback(
        &self,
        callback: impl Fn(GameId) + Send + Sync + 'static,
    ) {
        self.inner.callbacks.set_connected(callback);
    }

    pub fn register_client_rejected_callback(
        &self,
        callback: impl Fn(GameId, u8) + Send + Sync + 'static,
    ) {
        self.inner.callbacks.set_rejected(callback);
    }

    pub fn register_client_disconnected_callback(
        &self,
        callback: impl Fn(GameId) + Send + Sync + 'static,
    ) {
        self.inner.callbacks.set_disconnected(callback);
    }

    pub fn register_client_talking_changed_callback(
        &self,
        callback: impl Fn(GameId, bool) + Send + Sync + 'static,
    ) {
        self.inner.callbacks.set_talking_changed(callback);
    }

    pub fn register_client_microphone_mute_changed_callback(
        &self,
        callback: impl Fn(GameId, bool) + Send + Sync + 'static,
    ) {
        self.inner.callbacks.set_microphone_mute_changed(callback);
    }

    pub fn register_client_speakers_mute_changed_callback(
        &self,
        callback: impl Fn(GameId, bool) + Send + Sync + 'static,
    ) {
        self.inner.callbacks.set_speakers_mute_changed(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    use tokio::net::UdpSocket;
    use tokio::time::timeout;

    use proxvoice_protocol::codec::{decode_packet, encode_packet};
    use proxvoice_protocol::frame::{Frame, MAX_DATAGRAM_SIZE};
    use proxvoice_protocol::packets::*;
    use proxvoice_protocol::types::*;

    const WAIT: Duration = Duration::from_secs(3);

    async fn start_server() -> VoiceServer {
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            teamspeak_server_id: "ServerUid=".into(),
            teamspeak_channel_id: 64,
            teamspeak_channel_password: "secret".into(),
        };
        VoiceServer::create(&config).await.unwrap()
    }

    /// Minimal voice-client stand-in speaking the datagram protocol.
    struct TestClient {
        socket: UdpSocket,
        next_seq: [u32; CHANNEL_COUNT],
    }

    impl TestClient {
        async fn connect(server: &VoiceServer) -> Self {
            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            socket
                .connect(("127.0.0.1", server.port()))
                .await
                .unwrap();
            socket.send(&Frame::Connect.to_bytes()).await.unwrap();

            let client = Self {
                socket,
                next_seq: [0; CHANNEL_COUNT],
            };
            loop {
                if let Frame::ConnectAck = client.recv_raw().await {
                    break;
                }
            }
            client
        }

        async fn recv_raw(&self) -> Frame {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            let len = timeout(WAIT, self.socket.recv(&mut buf))
                .await
                .expect("timed out waiting for frame")
                .unwrap();
            Frame::from_bytes(&buf[..len]).unwrap()
        }

        async fn send_reliable<T: serde::Serialize>(&mut self, channel: u8, packet: &T) {
            let payload = encode_packet(packet).unwrap();
            let sequence = self.next_seq[channel as usize];
            self.next_seq[channel as usize] += 1;
            let frame = Frame::Data {
                channel,
                reliable: true,
                sequence,
                payload,
            };
            self.socket.send(&frame.to_bytes()).await.unwrap();
        }

        /// Receive the next data payload, acking reliable frames.
        async fn recv_payload(&self) -> (u8, Vec<u8>) {
            loop {
                match self.recv_raw().await {
                    Frame::Data {
                        channel,
                        reliable,
                        sequence,
                        payload,
                    } => {
                        if reliable {
                            let ack = Frame::Ack { channel, sequence };
                            self.socket.send(&ack.to_bytes()).await.unwrap();
                        }
                        return (channel, payload);
                    }
                    _ => continue,
                }
            }
        }

        /// Wait for a frame matching the predicate, acking data frames
        /// along the way.
        async fn wait_for<T>(&self, mut matcher: impl FnMut(Frame) -> Option<T>) -> T {
            let deadline = tokio::time::Instant::now() + WAIT;
            loop {
                assert!(
                    tokio::time::Instant::now() < deadline,
                    "timed out waiting for expected frame"
                );
                let frame = self.recv_raw().await;
                if let Frame::Data {
                    channel,
                    reliable: true,
                    sequence,
                    ..
                } = &frame
                {
                    let ack = Frame::Ack {
                        channel: *channel,
                        sequence: *sequence,
                    };
                    self.socket.send(&ack.to_bytes()).await.unwrap();
                }
                if let Some(result) = matcher(frame) {
                    return result;
                }
            }
        }

        async fn negotiate_protocol(&mut self) {
            self.send_reliable(
                PROTOCOL_CHANNEL,
                &ProtocolPacket {
                    version_major: PROTOCOL_VERSION_MAJOR,
                    version_minor: PROTOCOL_VERSION_MINOR,
                    minimum_version_major: PROTOCOL_MIN_VERSION_MAJOR,
                    minimum_version_minor: PROTOCOL_MIN_VERSION_MINOR,
                },
            )
            .await;

            let (channel, payload) = self.recv_payload().await;
            assert_eq!(channel, PROTOCOL_CHANNEL);
            let response: ProtocolResponsePacket = decode_packet(&payload).unwrap();
            assert_eq!(response.status_code, STATUS_CODE_OK);
        }

        /// Turn into a well-behaved idle client: ack everything the
        /// server sends so reliable delivery never gives up on it.
        fn spawn_ack_loop(self) -> tokio::task::JoinHandle<()> {
            tokio::spawn(async move {
                let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
                loop {
                    let Ok(len) = self.socket.recv(&mut buf).await else {
                        break;
                    };
                    match Frame::from_bytes(&buf[..len]) {
                        Ok(Frame::Data {
                            channel,
                            reliable: true,
                            sequence,
                            ..
                        }) => {
                            let ack = Frame::Ack { channel, sequence };
                            let _ = self.socket.send(&ack.to_bytes()).await;
                        }
                        Ok(Frame::Ping) => {
                            let _ = self.socket.send(&Frame::Pong.to_bytes()).await;
                        }
                        _ => {}
                    }
                }
            })
        }

        async fn handshake(&mut self, game_id: GameId, teamspeak_id: TeamspeakId) {
            self.send_reliable(
                HANDSHAKE_CHANNEL,
                &HandshakePacket {
                    status_code: STATUS_CODE_OK,
                    game_id,
                    teamspeak_id,
                    teamspeak_client_unique_identity: format!("identity-{game_id}"),
                },
            )
            .await;
        }
    }

    async fn wait_until(mut condition: impl std::ops::AsyncFnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while !condition().await {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached in time"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn create_and_close() {
        let server = start_server().await;
        assert!(server.is_running());
        assert_ne!(server.port(), 0);
        server.close().await;
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn commands_fail_when_closed() {
        let server = start_server().await;
        server.close().await;
        assert!(!server.set_client_position(1, Vec3::ZERO, 0.0).await);
        assert!(!server.mute_client_for_all(1, true).await);
        assert!(!server.remove_client(1).await);
    }

    #[tokio::test]
    async fn commands_fail_for_unknown_client() {
        let server = start_server().await;
        assert!(!server.set_client_position(9, Vec3::ZERO, 0.0).await);
        assert!(!server.set_client_voice_range(9, 5.0).await);
        assert!(!server.set_client_nickname(9, "ghost").await);
        assert!(!server.is_client_connected(9).await);
        server.close().await;
    }

    #[tokio::test]
    async fn happy_handshake_establishes_client() {
        let server = start_server().await;

        let connecting_args: Arc<StdMutex<Vec<(GameId, String)>>> =
            Arc::new(StdMutex::new(Vec::new()));
        let seen = connecting_args.clone();
        server.register_client_connecting_callback(move |game_id, identity| {
            seen.lock().unwrap().push((game_id, identity.to_owned()));
            true
        });
        let connected = Arc::new(AtomicBool::new(false));
        let flag = connected.clone();
        server.register_client_connected_callback(move |game_id| {
            assert_eq!(game_id, 7);
            flag.store(true, Ordering::SeqCst);
        });

        let mut client = TestClient::connect(&server).await;
        client.negotiate_protocol().await;

        // First handshake: backend id unknown, server hands out the
        // coordinates and keeps no record.
        client.handshake(7, 0).await;
        let (channel, payload) = client.recv_payload().await;
        assert_eq!(channel, HANDSHAKE_CHANNEL);
        let response: HandshakeResponsePacket = decode_packet(&payload).unwrap();
        assert_eq!(response.status_code, STATUS_CODE_OK);
        assert_eq!(response.reason, "OK");
        assert_eq!(response.teamspeak_server_unique_identifier, "ServerUid=");
        assert_eq!(response.channel_id, 64);
        assert_eq!(response.channel_password, "secret");
        assert_eq!(server.number_of_clients().await, 0);

        // Second handshake with the backend id: session established.
        client.handshake(7, 42).await;
        wait_until(async || server.is_client_connected(7).await).await;
        assert_eq!(server.number_of_clients().await, 1);
        wait_until(async || connected.load(Ordering::SeqCst)).await;
        assert_eq!(
            connecting_args.lock().unwrap().as_slice(),
            &[(7, "identity-7".to_owned())]
        );

        server.close().await;
    }

    #[tokio::test]
    async fn outdated_client_is_rejected() {
        let server = start_server().await;
        let mut client = TestClient::connect(&server).await;

        client
            .send_reliable(
                PROTOCOL_CHANNEL,
                &ProtocolPacket {
                    version_major: 0,
                    version_minor: 9,
                    minimum_version_major: 0,
                    minimum_version_minor: 9,
                },
            )
            .await;

        let response = client
            .wait_for(|frame| match frame {
                Frame::Data {
                    channel: PROTOCOL_CHANNEL,
                    payload,
                    ..
                } => decode_packet::<ProtocolResponsePacket>(&payload).ok(),
                _ => None,
            })
            .await;
        assert_eq!(response.status_code, STATUS_CODE_OUTDATED_PROTOCOL_VERSION);
        assert_eq!(response.version_major, PROTOCOL_VERSION_MAJOR);

        let code = client
            .wait_for(|frame| match frame {
                Frame::Disconnect { code } => Some(code),
                _ => None,
            })
            .await;
        assert_eq!(code, DISCONNECT_STATUS_OUTDATED_CLIENT);
        assert_eq!(server.number_of_clients().await, 0);

        server.close().await;
    }

    #[tokio::test]
    async fn rejected_handshake_disconnects_and_notifies() {
        let server = start_server().await;
        server.register_client_connecting_callback(|_, _| false);

        let mut client = TestClient::connect(&server).await;
        client.negotiate_protocol().await;
        client.handshake(9, 42).await;

        let code = client
            .wait_for(|frame| match frame {
                Frame::Disconnect { code } => Some(code),
                _ => None,
            })
            .await;
        assert_eq!(code, DISCONNECT_STATUS_REJECTED);
        assert_eq!(server.number_of_clients().await, 0);

        server.close().await;
    }

    #[tokio::test]
    async fn handshake_error_status_fires_rejected_callback() {
        let server = start_server().await;
        let rejected: Arc<StdMutex<Vec<(GameId, u8)>>> = Arc::new(StdMutex::new(Vec::new()));
        let seen = rejected.clone();
        server.register_client_rejected_callback(move |game_id, status| {
            seen.lock().unwrap().push((game_id, status));
        });

        let mut client = TestClient::connect(&server).await;
        client.negotiate_protocol().await;
        client
            .send_reliable(
                HANDSHAKE_CHANNEL,
                &HandshakePacket {
                    status_code: 77,
                    game_id: 5,
                    teamspeak_id: 0,
                    teamspeak_client_unique_identity: String::new(),
                },
            )
            .await;

        wait_until(async || rejected.lock().unwrap().as_slice() == [(5, 77)]).await;
        server.close().await;
    }

    #[tokio::test]
    async fn proximity_flip_end_to_end() {
        let server = start_server().await;

        let mut alice = TestClient::connect(&server).await;
        alice.negotiate_protocol().await;
        alice.handshake(1, 11).await;
        wait_until(async || server.is_client_connected(1).await).await;

        let mut bob = TestClient::connect(&server).await;
        bob.negotiate_protocol().await;
        bob.handshake(2, 12).await;
        wait_until(async || server.is_client_connected(2).await).await;
        let bob_ack = bob.spawn_ack_loop();

        assert!(server.set_client_voice_range(1, 10.0).await);
        assert!(server.set_client_voice_range(2, 10.0).await);
        assert!(server.set_client_nickname(2, "bob").await);
        assert!(
            server
                .set_client_positions(&[
                    ClientPositionUpdate {
                        game_id: 1,
                        position: Vec3::ZERO,
                        rotation: 0.0,
                    },
                    ClientPositionUpdate {
                        game_id: 2,
                        position: Vec3::new(5.0, 0.0, 0.0),
                        rotation: 0.0,
                    },
                ])
                .await
        );

        // Alice learns about bob.
        let update = alice
            .wait_for(|frame| match frame {
                Frame::Data {
                    channel: UPDATE_CHANNEL,
                    payload,
                    ..
                } => match decode_packet::<UpdateChannelMessage>(&payload) {
                    Ok(UpdateChannelMessage::Update(update)) if !update.added.is_empty() => {
                        Some(update)
                    }
                    _ => None,
                },
                _ => None,
            })
            .await;
        assert_eq!(update.added.len(), 1);
        assert_eq!(update.added[0].game_id, 2);
        assert_eq!(update.added[0].teamspeak_id, 12);
        assert_eq!(update.added[0].nickname, "bob");

        // And receives bob's position.
        let positions = alice
            .wait_for(|frame| match frame {
                Frame::Data {
                    channel: UPDATE_CHANNEL,
                    payload,
                    ..
                } => match decode_packet::<UpdateChannelMessage>(&payload) {
                    Ok(UpdateChannelMessage::Positions(positions)) => Some(positions),
                    _ => None,
                },
                _ => None,
            })
            .await;
        assert_eq!(positions.entries.len(), 1);
        assert_eq!(positions.entries[0].game_id, 2);
        assert_eq!(positions.entries[0].position, Vec3::new(5.0, 0.0, 0.0));
        assert!(!positions.entries[0].is_relative);

        // Bob walks away; alice is told to drop him.
        assert!(
            server
                .set_client_position(2, Vec3::new(20.0, 0.0, 0.0), 0.0)
                .await
        );
        let update = alice
            .wait_for(|frame| match frame {
                Frame::Data {
                    channel: UPDATE_CHANNEL,
                    payload,
                    ..
                } => match decode_packet::<UpdateChannelMessage>(&payload) {
                    Ok(UpdateChannelMessage::Update(update)) if !update.removed.is_empty() => {
                        Some(update)
                    }
                    _ => None,
                },
                _ => None,
            })
            .await;
        assert_eq!(update.removed[0].game_id, 2);

        bob_ack.abort();
        server.close().await;
    }

    #[tokio::test]
    async fn status_packet_fires_callbacks_in_order() {
        let server = start_server().await;
        let calls: Arc<StdMutex<Vec<(&'static str, bool)>>> = Arc::new(StdMutex::new(Vec::new()));

        let seen = calls.clone();
        server.register_client_talking_changed_callback(move |_, v| {
            seen.lock().unwrap().push(("talking", v));
        });
        let seen = calls.clone();
        server.register_client_microphone_mute_changed_callback(move |_, v| {
            seen.lock().unwrap().push(("microphone", v));
        });
        let seen = calls.clone();
        server.register_client_speakers_mute_changed_callback(move |_, v| {
            seen.lock().unwrap().push(("speakers", v));
        });

        let mut client = TestClient::connect(&server).await;
        client.negotiate_protocol().await;
        client.handshake(3, 33).await;
        wait_until(async || server.is_client_connected(3).await).await;

        client
            .send_reliable(
                STATUS_CHANNEL,
                &StatusPacket {
                    talking: true,
                    microphone_muted: true,
                    speakers_muted: false,
                },
            )
            .await;

        wait_until(async || {
            calls.lock().unwrap().as_slice() == [("talking", true), ("microphone", true)]
        })
        .await;
        assert!(server.is_client_talking(3).await);
        assert!(server.is_client_microphone_muted(3).await);
        assert!(!server.is_client_speakers_muted(3).await);

        server.close().await;
    }

    #[tokio::test]
    async fn global_mute_is_immediate() {
        let server = start_server().await;

        let mut alice = TestClient::connect(&server).await;
        alice.negotiate_protocol().await;
        alice.handshake(1, 11).await;
        let mut bob = TestClient::connect(&server).await;
        bob.negotiate_protocol().await;
        bob.handshake(2, 12).await;
        wait_until(async || server.number_of_clients().await == 2).await;
        let alice_ack = alice.spawn_ack_loop();
        let bob_ack = bob.spawn_ack_loop();

        for id in [1, 2] {
            assert!(server.set_client_voice_range(id, 10.0).await);
        }
        assert!(server.set_client_position(1, Vec3::ZERO, 0.0).await);
        assert!(
            server
                .set_client_position(2, Vec3::new(5.0, 0.0, 0.0), 0.0)
                .await
        );
        wait_until(async || {
            server.inner.clients.read().await.get(1).map(|c| c.is_audible(2)) == Some(true)
        })
        .await;

        assert!(server.mute_client_for_all(2, true).await);
        assert!(server.is_client_muted_for_all(2).await);
        // Effective before the next tick has run.
        assert_eq!(
            server.inner.clients.read().await.get(1).map(|c| c.is_audible(2)),
            Some(false)
        );

        alice_ack.abort();
        bob_ack.abort();
        server.close().await;
    }

    #[tokio::test]
    async fn relative_override_defeats_mute_end_to_end() {
        let server = start_server().await;

        let mut alice = TestClient::connect(&server).await;
        alice.negotiate_protocol().await;
        alice.handshake(1, 11).await;
        let mut bob = TestClient::connect(&server).await;
        bob.negotiate_protocol().await;
        bob.handshake(2, 12).await;
        wait_until(async || server.number_of_clients().await == 2).await;

        for id in [1, 2] {
            assert!(server.set_client_voice_range(id, 10.0).await);
        }
        assert!(server.set_client_position(1, Vec3::ZERO, 0.0).await);
        assert!(
            server
                .set_client_position(2, Vec3::new(1000.0, 0.0, 0.0), 0.0)
                .await
        );
        assert!(server.mute_client_for_all(2, true).await);
        assert!(
            server
                .set_relative_position_for_client(1, 2, Vec3::new(0.0, 1.0, 0.0))
                .await
        );

        let positions = alice
            .wait_for(|frame| match frame {
                Frame::Data {
                    channel: UPDATE_CHANNEL,
                    payload,
                    ..
                } => match decode_packet::<UpdateChannelMessage>(&payload) {
                    Ok(UpdateChannelMessage::Positions(positions)) => Some(positions),
                    _ => None,
                },
                _ => None,
            })
            .await;
        let entry = &positions.entries[0];
        assert_eq!(entry.game_id, 2);
        assert!(entry.is_relative);
        assert_eq!(entry.position, Vec3::new(0.0, 1.0, 0.0));

        drop(bob);
        server.close().await;
    }

    #[tokio::test]
    async fn disconnect_cleanup_fires_callback_once() {
        let server = start_server().await;
        let disconnected: Arc<StdMutex<Vec<GameId>>> = Arc::new(StdMutex::new(Vec::new()));
        let seen = disconnected.clone();
        server.register_client_disconnected_callback(move |game_id| {
            seen.lock().unwrap().push(game_id);
        });

        let mut client = TestClient::connect(&server).await;
        client.negotiate_protocol().await;
        client.handshake(4, 44).await;
        wait_until(async || server.is_client_connected(4).await).await;

        client
            .socket
            .send(&Frame::Disconnect { code: 0 }.to_bytes())
            .await
            .unwrap();

        wait_until(async || !server.is_client_connected(4).await).await;
        wait_until(async || disconnected.lock().unwrap().as_slice() == [4]).await;

        server.close().await;
    }

    #[tokio::test]
    async fn remove_client_disconnects_peer() {
        let server = start_server().await;

        let mut client = TestClient::connect(&server).await;
        client.negotiate_protocol().await;
        client.handshake(6, 66).await;
        wait_until(async || server.is_client_connected(6).await).await;

        assert!(server.remove_client(6).await);
        assert!(!server.is_client_connected(6).await);

        let code = client
            .wait_for(|frame| match frame {
                Frame::Disconnect { code } => Some(code),
                _ => None,
            })
            .await;
        assert_eq!(code, DISCONNECT_STATUS_DEFAULT);

        server.close().await;
    }

    #[tokio::test]
    async fn audio_settings_are_stored() {
        let server = start_server().await;
        assert_eq!(server.distance_factor(), 1.0);
        assert_eq!(server.rolloff_factor(), 1.0);
        server.set_3d_settings(2.0, 0.5);
        assert_eq!(server.distance_factor(), 2.0);
        assert_eq!(server.rolloff_factor(), 0.5);
        server.close().await;
    }
}
