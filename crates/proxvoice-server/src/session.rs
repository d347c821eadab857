use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use proxvoice_protocol::codec::{decode_packet, encode_packet};
use proxvoice_protocol::packets::{
    HandshakePacket, HandshakeResponsePacket, ProtocolPacket, ProtocolResponsePacket, StatusPacket,
};
use proxvoice_protocol::types::*;

use crate::server::ServerInner;
use crate::state::Client;
use crate::transport::TransportEvent;

/// Consume transport events until shutdown. Drives the per-peer
/// state machine: protocol check, handshake, status, disconnect.
pub(crate) async fn run_session_loop(
    inner: Arc<ServerInner>,
    mut events: mpsc::Receiver<TransportEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            maybe_event = events.recv() => match maybe_event {
                Some(event) => handle_event(&inner, event).await,
                None => break,
            },
            _ = shutdown.changed() => break,
        }
    }
    debug!("session loop stopped");
}

async fn handle_event(inner: &Arc<ServerInner>, event: TransportEvent) {
    match event {
        TransportEvent::Connected { peer } => {
            info!(%peer, "new client connected");
        }
        TransportEvent::Disconnected { peer, code } => {
            on_disconnect(inner, peer, code).await;
        }
        TransportEvent::Received {
            peer,
            channel,
            payload,
        } => match channel {
            PROTOCOL_CHANNEL => handle_protocol(inner, peer, &payload).await,
            HANDSHAKE_CHANNEL => handle_handshake(inner, peer, &payload).await,
            _ => handle_client_message(inner, peer, channel, &payload).await,
        },
    }
}

/// Two-sided version negotiation. A mismatch answers with the outdated
/// status and parts ways once the response is flushed.
async fn handle_protocol(inner: &Arc<ServerInner>, peer: SocketAddr, payload: &[u8]) {
    let packet: ProtocolPacket = match decode_packet(payload) {
        Ok(p) => p,
        Err(e) => {
            warn!(%peer, "failed to decode protocol packet: {}", e);
            return;
        }
    };

    let client_matches = protocol_version_compatible(
        packet.version_major,
        packet.version_minor,
        PROTOCOL_MIN_VERSION_MAJOR,
        PROTOCOL_MIN_VERSION_MINOR,
    );
    let server_matches = protocol_version_compatible(
        PROTOCOL_VERSION_MAJOR,
        PROTOCOL_VERSION_MINOR,
        packet.minimum_version_major,
        packet.minimum_version_minor,
    );

    if !client_matches || !server_matches {
        let disconnect_status = if !client_matches {
            warn!(
                %peer,
                "client uses an outdated protocol version: {}.{}",
                packet.version_major, packet.version_minor
            );
            DISCONNECT_STATUS_OUTDATED_CLIENT
        } else {
            warn!(
                %peer,
                "server uses an outdated protocol version: {}.{}",
                PROTOCOL_VERSION_MAJOR, PROTOCOL_VERSION_MINOR
            );
            DISCONNECT_STATUS_OUTDATED_SERVER
        };

        send_protocol_response(inner, peer, STATUS_CODE_OUTDATED_PROTOCOL_VERSION).await;
        inner.transport.disconnect_later(peer, disconnect_status).await;
        return;
    }

    send_protocol_response(inner, peer, STATUS_CODE_OK).await;
}

async fn handle_handshake(inner: &Arc<ServerInner>, peer: SocketAddr, payload: &[u8]) {
    let packet: HandshakePacket = match decode_packet(payload) {
        Ok(p) => p,
        Err(e) => {
            warn!(%peer, "failed to decode handshake packet: {}", e);
            return;
        }
    };

    if packet.status_code != STATUS_CODE_OK {
        info!(%peer, status = packet.status_code, "handshake error");
        inner
            .transport
            .disconnect(peer, DISCONNECT_STATUS_DEFAULT)
            .await;
        inner
            .callbacks
            .fire_rejected(packet.game_id, packet.status_code);
        return;
    }

    // The voice backend has not associated the client yet: hand out the
    // backend coordinates so it can join the channel. No session yet.
    if packet.teamspeak_id == 0 {
        send_handshake_response(inner, peer, STATUS_CODE_OK, "OK").await;
        return;
    }

    {
        let clients = inner.clients.read().await;
        if clients.by_peer(&peer).is_some() {
            warn!(%peer, "client with that peer is already connected");
            return;
        }
    }

    // The one synchronous gate: the host decides, the session waits.
    let accepted = inner
        .callbacks
        .client_connecting(packet.game_id, &packet.teamspeak_client_unique_identity)
        .await;
    if !accepted {
        inner
            .transport
            .disconnect(peer, DISCONNECT_STATUS_REJECTED)
            .await;
        return;
    }

    let client = Client::new(
        peer,
        packet.game_id,
        packet.teamspeak_id,
        packet.teamspeak_client_unique_identity,
    );
    let inserted = {
        let mut clients = inner.clients.write().await;
        clients.insert(client)
    };

    match inserted {
        Ok(()) => {
            info!(
                game_id = packet.game_id,
                teamspeak_id = packet.teamspeak_id,
                "new client established"
            );
            inner.callbacks.fire_connected(packet.game_id);
        }
        Err(e) => {
            warn!(%peer, game_id = packet.game_id, "handshake refused: {}", e);
            inner
                .transport
                .disconnect(peer, DISCONNECT_STATUS_REJECTED)
                .await;
        }
    }
}

/// Post-handshake traffic: resolve the client first, then dispatch on
/// the channel.
async fn handle_client_message(
    inner: &Arc<ServerInner>,
    peer: SocketAddr,
    channel: u8,
    payload: &[u8],
) {
    match channel {
        STATUS_CHANNEL => handle_status(inner, peer, payload).await,
        _ => {
            let known = inner.clients.read().await.by_peer(&peer).is_some();
            if known {
                warn!(%peer, channel, "unhandled message received");
            } else {
                warn!(%peer, channel, "message from unknown client");
            }
        }
    }
}

async fn handle_status(inner: &Arc<ServerInner>, peer: SocketAddr, payload: &[u8]) {
    let packet: StatusPacket = match decode_packet(payload) {
        Ok(p) => p,
        Err(e) => {
            warn!(%peer, "failed to decode status packet: {}", e);
            return;
        }
    };

    let (game_id, diff) = {
        let mut clients = inner.clients.write().await;
        let Some(client) = clients.by_peer_mut(&peer) else {
            warn!(%peer, "status from unknown client");
            return;
        };
        (client.game_id(), client.apply_status(&packet))
    };
    if diff.any() {
        inner.callbacks.fire_status_changes(game_id, packet, diff);
    }
}

async fn on_disconnect(inner: &Arc<ServerInner>, peer: SocketAddr, code: u32) {
    let removed = {
        let mut clients = inner.clients.write().await;
        clients.remove_by_peer(&peer)
    };

    match removed {
        Some(client) => {
            info!(endpoint = %peer, code, "client disconnected");
            inner.callbacks.fire_disconnected(client.game_id());
        }
        None => {
            // Peers that never finished the handshake have no record.
            debug!(%peer, code, "disconnect from peer without session");
        }
    }
}

async fn send_protocol_response(inner: &Arc<ServerInner>, peer: SocketAddr, status_code: u8) {
    let packet = ProtocolResponsePacket {
        status_code,
        version_major: PROTOCOL_VERSION_MAJOR,
        version_minor: PROTOCOL_VERSION_MINOR,
    };
    match encode_packet(&packet) {
        Ok(payload) => {
            inner
                .transport
                .send(peer, PROTOCOL_CHANNEL, payload, true)
                .await;
        }
        Err(e) => warn!(%peer, "failed to encode protocol response: {}", e),
    }
}

async fn send_handshake_response(
    inner: &Arc<ServerInner>,
    peer: SocketAddr,
    status_code: u8,
    reason: &str,
) {
    let packet = HandshakeResponsePacket {
        status_code,
        reason: reason.into(),
        teamspeak_server_unique_identifier: inner.teamspeak_server_id.clone(),
        channel_id: inner.teamspeak_channel_id,
        channel_password: inner.teamspeak_channel_password.to_string(),
    };
    match encode_packet(&packet) {
        Ok(payload) => {
            inner
                .transport
                .send(peer, HANDSHAKE_CHANNEL, payload, true)
                .await;
        }
        Err(e) => warn!(%peer, "failed to encode handshake response: {}", e),
    }
}
