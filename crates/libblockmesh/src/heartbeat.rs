// UDP liveness: a sender ticking every 3 s and a receiver answering every
// datagram. The timeout sweep that consumes the timestamps lives in the
// session supervision loop.

use std::net::SocketAddr;
use std::sync::Arc;

use blockmesh_core::constants::HEARTBEAT_INTERVAL;
use peer_wire_protocol as wire;
use peer_wire_protocol::MessageBody;
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use crate::session::Shared;

pub(crate) async fn sender_loop(
    shared: Arc<Shared>,
    socket: Arc<UdpSocket>,
) -> anyhow::Result<()> {
    let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
    loop {
        interval.tick().await;
        let self_id = shared.self_id();
        let envelope = shared.envelope(MessageBody::Heartbeat(wire::Heartbeat {
            node_id: self_id,
        }));
        let body = match wire::encode_datagram(&envelope) {
            Ok(body) => body,
            Err(e) => {
                warn!("error encoding heartbeat: {e}");
                continue;
            }
        };
        for entry in shared.nodes.online() {
            if entry.info.node_id == self_id {
                continue;
            }
            let dst = SocketAddr::new(entry.info.ip, entry.info.udp_port);
            if let Err(e) = socket.send_to(&body, dst).await {
                debug!(node_id = entry.info.node_id, %dst, "heartbeat not sent: {e}");
            }
        }
    }
}

pub(crate) async fn receiver_loop(
    shared: Arc<Shared>,
    socket: Arc<UdpSocket>,
) -> anyhow::Result<()> {
    let mut buf = [0u8; 2048];
    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!("heartbeat recv error: {e}");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                continue;
            }
        };
        let envelope = match wire::decode_datagram(&buf[..len]) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(%src, "dropping malformed datagram: {e}");
                continue;
            }
        };
        match envelope.body {
            MessageBody::Heartbeat(hb) => {
                note_alive(&shared, hb.node_id);
                let ack = shared.envelope(MessageBody::HeartbeatAck(wire::Heartbeat {
                    node_id: shared.self_id(),
                }));
                match wire::encode_datagram(&ack) {
                    Ok(body) => {
                        if let Err(e) = socket.send_to(&body, src).await {
                            debug!(%src, "heartbeat ack not sent: {e}");
                        }
                    }
                    Err(e) => warn!("error encoding heartbeat ack: {e}"),
                }
            }
            MessageBody::HeartbeatAck(hb) => note_alive(&shared, hb.node_id),
            other => debug!(%src, msg = other.name(), "unexpected datagram"),
        }
    }
}

fn note_alive(shared: &Arc<Shared>, node_id: blockmesh_core::NodeId) {
    trace!(node_id, "heartbeat");
    if shared.nodes.update_heartbeat(node_id) {
        // The owner is back, its blocks are readable again.
        shared.table.mark_node_available(node_id);
    }
}
