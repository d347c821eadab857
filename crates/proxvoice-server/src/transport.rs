use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, trace, warn};

use proxvoice_protocol::frame::{Frame, MAX_DATAGRAM_SIZE};
use proxvoice_protocol::types::CHANNEL_COUNT;

/// How long a peer may stay silent before it is considered gone.
const PEER_TIMEOUT: Duration = Duration::from_secs(10);

/// Silence after which a peer is probed with a keepalive ping.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(3);

/// Resend interval for unacknowledged reliable frames.
const RETRANSMIT_INTERVAL: Duration = Duration::from_millis(200);

/// Retransmit attempts before a peer is declared unreachable.
const MAX_RETRANSMITS: u8 = 10;

/// How long a draining disconnect waits for outstanding acks.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Out-of-order reliable frames buffered per channel before dropping.
const MAX_REORDER_BUFFER: usize = 64;

/// Events surfaced to the session controller.
#[derive(Debug)]
pub enum TransportEvent {
    /// A new peer completed the connect exchange.
    Connected { peer: SocketAddr },
    /// A peer sent a disconnect frame or went silent.
    Disconnected { peer: SocketAddr, code: u32 },
    /// An in-order application payload arrived on a channel.
    Received {
        peer: SocketAddr,
        channel: u8,
        payload: Vec<u8>,
    },
}

struct PendingSend {
    bytes: Vec<u8>,
    last_sent: Instant,
    retries: u8,
}

/// Per-peer reliability bookkeeping.
///
/// Reliable and unreliable frames use separate sequence spaces per
/// channel, so a lost unreliable frame can never stall reliable
/// in-order delivery.
struct PeerState {
    next_reliable_seq: [u32; CHANNEL_COUNT],
    next_unreliable_seq: [u32; CHANNEL_COUNT],
    /// Next reliable sequence to hand to the application, per channel.
    next_delivery: [u32; CHANNEL_COUNT],
    /// Newest unreliable sequence seen, per channel. Older arrivals are stale.
    newest_unreliable: [Option<u32>; CHANNEL_COUNT],
    reorder: [BTreeMap<u32, Vec<u8>>; CHANNEL_COUNT],
    unacked: HashMap<(u8, u32), PendingSend>,
    last_seen: Instant,
    last_ping: Instant,
    /// Set by `disconnect_later`: user code and deadline for the flush.
    draining: Option<(u32, Instant)>,
}

impl PeerState {
    fn new() -> Self {
        Self {
            next_reliable_seq: [0; CHANNEL_COUNT],
            next_unreliable_seq: [0; CHANNEL_COUNT],
            next_delivery: [0; CHANNEL_COUNT],
            newest_unreliable: [None; CHANNEL_COUNT],
            reorder: std::array::from_fn(|_| BTreeMap::new()),
            unacked: HashMap::new(),
            last_seen: Instant::now(),
            last_ping: Instant::now(),
            draining: None,
        }
    }
}

/// Channelised, connection-oriented datagram host over a single UDP
/// socket. Peers are identified by their remote address.
pub struct Transport {
    socket: UdpSocket,
    peers: Mutex<HashMap<SocketAddr, PeerState>>,
    event_tx: mpsc::Sender<TransportEvent>,
    max_peers: usize,
    local_addr: SocketAddr,
}

impl Transport {
    /// Bind the UDP socket and create the host.
    pub fn bind(
        host: &str,
        port: u16,
        max_peers: usize,
    ) -> anyhow::Result<(Arc<Self>, mpsc::Receiver<TransportEvent>)> {
        use anyhow::Context;

        let addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", host, port))?;

        let sock = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )
        .context("failed to create UDP socket")?;
        let _ = sock.set_recv_buffer_size(256 * 1024);
        let _ = sock.set_send_buffer_size(256 * 1024);
        sock.bind(&addr.into())
            .with_context(|| format!("failed to bind UDP on {}:{}", host, port))?;
        sock.set_nonblocking(true)
            .context("failed to set non-blocking")?;

        let std_sock: std::net::UdpSocket = sock.into();
        let socket =
            UdpSocket::from_std(std_sock).context("failed to wrap UDP socket in tokio")?;
        let local_addr = socket.local_addr().context("failed to read local address")?;

        let (event_tx, event_rx) = mpsc::channel(256);

        let transport = Arc::new(Self {
            socket,
            peers: Mutex::new(HashMap::new()),
            event_tx,
            max_peers,
            local_addr,
        });

        Ok((transport, event_rx))
    }

    /// Address the socket is bound on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Receive/housekeeping loop. Runs until shutdown is signalled.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE + 1];
        let mut housekeeping = tokio::time::interval(Duration::from_millis(50));

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok((len, addr)) => self.handle_datagram(&buf[..len], addr).await,
                    Err(e) => error!("UDP recv error: {}", e),
                },
                _ = housekeeping.tick() => self.housekeeping().await,
                _ = shutdown.changed() => break,
            }
        }

        debug!("transport loop stopped");
    }

    /// Send an application payload to a peer on a channel.
    /// Returns false if the peer is unknown or the socket send fails.
    pub async fn send(
        &self,
        peer: SocketAddr,
        channel: u8,
        payload: Vec<u8>,
        reliable: bool,
    ) -> bool {
        let idx = channel as usize;
        if idx >= CHANNEL_COUNT {
            warn!(channel, "send on invalid channel");
            return false;
        }

        let bytes = {
            let mut peers = self.peers.lock().await;
            let Some(state) = peers.get_mut(&peer) else {
                warn!(%peer, "send to unknown peer");
                return false;
            };

            let sequence = if reliable {
                let seq = state.next_reliable_seq[idx];
                state.next_reliable_seq[idx] = seq.wrapping_add(1);
                seq
            } else {
                let seq = state.next_unreliable_seq[idx];
                state.next_unreliable_seq[idx] = seq.wrapping_add(1);
                seq
            };

            let frame = Frame::Data {
                channel,
                reliable,
                sequence,
                payload,
            };
            let bytes = frame.to_bytes();
            if bytes.len() > MAX_DATAGRAM_SIZE {
                warn!(%peer, channel, len = bytes.len(), "payload exceeds datagram size");
                return false;
            }

            if reliable {
                state.unacked.insert(
                    (channel, sequence),
                    PendingSend {
                        bytes: bytes.clone(),
                        last_sent: Instant::now(),
                        retries: 0,
                    },
                );
            }
            bytes
        };

        match self.socket.send_to(&bytes, peer).await {
            Ok(_) => true,
            Err(e) => {
                warn!(%peer, channel, "send failed: {}", e);
                false
            }
        }
    }

    /// Drop a peer immediately, notifying it with a disconnect frame.
    /// No local event is emitted; the caller owns the cleanup.
    pub async fn disconnect(&self, peer: SocketAddr, code: u32) {
        let known = self.peers.lock().await.remove(&peer).is_some();
        if known {
            let _ = self
                .socket
                .send_to(&Frame::Disconnect { code }.to_bytes(), peer)
                .await;
        }
    }

    /// Drop a peer once its outstanding reliable traffic is flushed
    /// (bounded by the drain timeout). No local event is emitted.
    pub async fn disconnect_later(&self, peer: SocketAddr, code: u32) {
        let finish_now = {
            let mut peers = self.peers.lock().await;
            match peers.get_mut(&peer) {
                None => return,
                Some(state) if state.unacked.is_empty() => {
                    peers.remove(&peer);
                    true
                }
                Some(state) => {
                    state.draining = Some((code, Instant::now() + DRAIN_TIMEOUT));
                    false
                }
            }
        };

        if finish_now {
            let _ = self
                .socket
                .send_to(&Frame::Disconnect { code }.to_bytes(), peer)
                .await;
        }
    }

    /// Number of tracked peers.
    pub async fn peer_count(&self) -> usize {
        self.peers.lock().await.len()
    }

    async fn handle_datagram(&self, data: &[u8], addr: SocketAddr) {
        let frame = match Frame::from_bytes(data) {
            Ok(f) => f,
            Err(e) => {
                warn!(src = %addr, "invalid datagram: {}", e);
                return;
            }
        };

        match frame {
            Frame::Connect => self.handle_connect(addr).await,
            Frame::ConnectAck => debug!(src = %addr, "unexpected connect-ack"),
            Frame::Disconnect { code } => {
                let known = self.peers.lock().await.remove(&addr).is_some();
                if known {
                    self.emit(TransportEvent::Disconnected { peer: addr, code })
                        .await;
                }
            }
            Frame::Ping => {
                let known = {
                    let mut peers = self.peers.lock().await;
                    match peers.get_mut(&addr) {
                        Some(state) => {
                            state.last_seen = Instant::now();
                            true
                        }
                        None => false,
                    }
                };
                if known {
                    let _ = self.socket.send_to(&Frame::Pong.to_bytes(), addr).await;
                }
            }
            Frame::Pong => {
                let mut peers = self.peers.lock().await;
                if let Some(state) = peers.get_mut(&addr) {
                    state.last_seen = Instant::now();
                }
            }
            Frame::Ack { channel, sequence } => self.handle_ack(addr, channel, sequence).await,
            Frame::Data {
                channel,
                reliable,
                sequence,
                payload,
            } => {
                self.handle_data(addr, channel, reliable, sequence, payload)
                    .await
            }
        }
    }

    async fn handle_connect(&self, addr: SocketAddr) {
        let accepted = {
            let mut peers = self.peers.lock().await;
            if peers.contains_key(&addr) {
                // Duplicate connect: the ack got lost, answer again.
                None
            } else if peers.len() >= self.max_peers {
                warn!(src = %addr, "connect refused: peer limit reached");
                return;
            } else {
                peers.insert(addr, PeerState::new());
                Some(())
            }
        };

        let _ = self
            .socket
            .send_to(&Frame::ConnectAck.to_bytes(), addr)
            .await;

        if accepted.is_some() {
            self.emit(TransportEvent::Connected { peer: addr }).await;
        }
    }

    async fn handle_ack(&self, addr: SocketAddr, channel: u8, sequence: u32) {
        let finish_drain = {
            let mut peers = self.peers.lock().await;
            let Some(state) = peers.get_mut(&addr) else {
                return;
            };
            state.last_seen = Instant::now();
            state.unacked.remove(&(channel, sequence));

            match state.draining {
                Some((code, _)) if state.unacked.is_empty() => {
                    peers.remove(&addr);
                    Some(code)
                }
                _ => None,
            }
        };

        if let Some(code) = finish_drain {
            let _ = self
                .socket
                .send_to(&Frame::Disconnect { code }.to_bytes(), addr)
                .await;
        }
    }

    async fn handle_data(
        &self,
        addr: SocketAddr,
        channel: u8,
        reliable: bool,
        sequence: u32,
        payload: Vec<u8>,
    ) {
        let idx = channel as usize;
        if idx >= CHANNEL_COUNT {
            warn!(src = %addr, channel, "data on invalid channel");
            return;
        }

        let mut deliveries: Vec<Vec<u8>> = Vec::new();
        let mut send_ack = false;

        {
            let mut peers = self.peers.lock().await;
            let Some(state) = peers.get_mut(&addr) else {
                warn!(src = %addr, channel, "data from unknown peer");
                return;
            };
            state.last_seen = Instant::now();

            if reliable {
                // Always ack, including duplicates: the first ack may be lost.
                send_ack = true;

                if sequence < state.next_delivery[idx] {
                    trace!(src = %addr, channel, sequence, "duplicate reliable frame");
                } else if sequence == state.next_delivery[idx] {
                    deliveries.push(payload);
                    state.next_delivery[idx] = state.next_delivery[idx].wrapping_add(1);
                    while let Some(buffered) =
                        state.reorder[idx].remove(&state.next_delivery[idx])
                    {
                        deliveries.push(buffered);
                        state.next_delivery[idx] = state.next_delivery[idx].wrapping_add(1);
                    }
                } else if state.reorder[idx].len() < MAX_REORDER_BUFFER {
                    state.reorder[idx].insert(sequence, payload);
                } else {
                    warn!(src = %addr, channel, "reorder buffer full, dropping frame");
                }
            } else {
                let stale = matches!(state.newest_unreliable[idx], Some(n) if sequence <= n);
                if stale {
                    trace!(src = %addr, channel, sequence, "stale unreliable frame");
                } else {
                    state.newest_unreliable[idx] = Some(sequence);
                    deliveries.push(payload);
                }
            }
        }

        if send_ack {
            let ack = Frame::Ack { channel, sequence };
            let _ = self.socket.send_to(&ack.to_bytes(), addr).await;
        }

        for payload in deliveries {
            self.emit(TransportEvent::Received {
                peer: addr,
                channel,
                payload,
            })
            .await;
        }
    }

    /// Retransmits, silence timeouts, and drain deadlines.
    async fn housekeeping(&self) {
        let now = Instant::now();
        let mut resend: Vec<(SocketAddr, Vec<u8>)> = Vec::new();
        let mut closed: Vec<(SocketAddr, u32, bool)> = Vec::new();

        {
            let mut peers = self.peers.lock().await;

            for (addr, state) in peers.iter_mut() {
                if now.duration_since(state.last_seen) > PEER_TIMEOUT {
                    closed.push((*addr, 0, true));
                    continue;
                }

                let mut exhausted = false;
                for pending in state.unacked.values_mut() {
                    if now.duration_since(pending.last_sent) < RETRANSMIT_INTERVAL {
                        continue;
                    }
                    if pending.retries >= MAX_RETRANSMITS {
                        exhausted = true;
                        break;
                    }
                    pending.retries += 1;
                    pending.last_sent = now;
                    resend.push((*addr, pending.bytes.clone()));
                }
                if exhausted {
                    warn!(peer = %addr, "peer unreachable, dropping");
                    closed.push((*addr, 0, true));
                    continue;
                }

                if let Some((code, deadline)) = state.draining {
                    if state.unacked.is_empty() || now >= deadline {
                        resend.push((*addr, Frame::Disconnect { code }.to_bytes()));
                        closed.push((*addr, code, false));
                        continue;
                    }
                }

                if now.duration_since(state.last_seen) > KEEPALIVE_INTERVAL
                    && now.duration_since(state.last_ping) > KEEPALIVE_INTERVAL
                {
                    state.last_ping = now;
                    resend.push((*addr, Frame::Ping.to_bytes()));
                }
            }

            for (addr, _, _) in &closed {
                peers.remove(addr);
            }
        }

        for (addr, bytes) in resend {
            let _ = self.socket.send_to(&bytes, addr).await;
        }

        for (addr, code, emit) in closed {
            if emit {
                self.emit(TransportEvent::Disconnected { peer: addr, code })
                    .await;
            }
        }
    }

    async fn emit(&self, event: TransportEvent) {
        if self.event_tx.send(event).await.is_err() {
            trace!("event receiver dropped");
        }
    }
}
