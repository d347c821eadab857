use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use proxvoice_protocol::codec::encode_packet;
use proxvoice_protocol::packets::UpdateChannelMessage;
use proxvoice_protocol::types::UPDATE_CHANNEL;

use crate::server::ServerInner;

/// Audibility passes per second.
const TICK_INTERVAL: Duration = Duration::from_millis(50);

/// Run the periodic audibility recomputation.
///
/// Each pass takes the client table write lock once, computes the new
/// audible sets and the per-listener packets, and sends them after the
/// lock is released. Deltas go out reliably; positions are superseded
/// by the next tick anyway, so their loss is absorbed.
pub(crate) async fn run_update_loop(inner: Arc<ServerInner>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let outbound = {
                    let mut clients = inner.clients.write().await;
                    clients.tick()
                };

                for packets in outbound {
                    if let Some(update) = packets.update {
                        let message = UpdateChannelMessage::Update(update);
                        match encode_packet(&message) {
                            Ok(payload) => {
                                inner
                                    .transport
                                    .send(packets.peer, UPDATE_CHANNEL, payload, true)
                                    .await;
                            }
                            Err(e) => warn!(peer = %packets.peer, "failed to encode update packet: {}", e),
                        }
                    }
                    if let Some(positions) = packets.positions {
                        let message = UpdateChannelMessage::Positions(positions);
                        match encode_packet(&message) {
                            Ok(payload) => {
                                inner
                                    .transport
                                    .send(packets.peer, UPDATE_CHANNEL, payload, false)
                                    .await;
                            }
                            Err(e) => warn!(peer = %packets.peer, "failed to encode position packet: {}", e),
                        }
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    debug!("update loop stopped");
}
