// TCP side of the mesh: one listener, one live framed connection per peer id
// (newest wins), a reader task per socket, and the join/reconnect handshake
// that assigns node ids and replicates full state.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use blockmesh_core::spawn_utils::spawn;
use blockmesh_core::{NodeId, NodeInfo};
use parking_lot::Mutex;
use peer_wire_protocol as wire;
use peer_wire_protocol::{Envelope, MessageBody};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::pipeline;
use crate::session::Shared;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
struct PeerHandle {
    generation: u64,
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    cancel: CancellationToken,
}

/// The connection map: at most one live socket per peer id. Dialing or
/// accepting a second connection for the same id replaces (and cancels) the
/// older one.
pub(crate) struct PeerMap {
    inner: Mutex<HashMap<NodeId, PeerHandle>>,
    next_generation: AtomicU64,
    session_cancel: CancellationToken,
}

impl PeerMap {
    pub fn new(session_cancel: CancellationToken) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            session_cancel,
        }
    }

    fn insert(&self, node_id: NodeId, writer: OwnedWriteHalf) -> (u64, CancellationToken) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = self.session_cancel.child_token();
        let handle = PeerHandle {
            generation,
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
            cancel: token.clone(),
        };
        let old = self.inner.lock().insert(node_id, handle);
        if let Some(old) = old {
            debug!(node_id, "replacing existing connection");
            old.cancel.cancel();
        }
        (generation, token)
    }

    fn remove_if(&self, node_id: NodeId, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.get(&node_id).map(|h| h.generation) == Some(generation) {
            if let Some(handle) = inner.remove(&node_id) {
                handle.cancel.cancel();
            }
        }
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.inner.lock().contains_key(&node_id)
    }

    pub async fn send_to(&self, node_id: NodeId, envelope: &Envelope) -> Result<()> {
        let handle = self
            .inner
            .lock()
            .get(&node_id)
            .cloned()
            .ok_or(Error::SendFailure { node_id })?;
        let mut writer = handle.writer.lock().await;
        match wire::write_frame(&mut *writer, envelope).await {
            Ok(()) => Ok(()),
            Err(e) => {
                drop(writer);
                debug!(node_id, "send failed, dropping connection: {e}");
                self.remove_if(node_id, handle.generation);
                Err(Error::SendFailure { node_id })
            }
        }
    }

    /// Best-effort fan-out; failed peers are dropped from the map.
    pub async fn broadcast(&self, envelope: &Envelope, exclude: &[NodeId]) {
        let targets: Vec<NodeId> = self
            .inner
            .lock()
            .keys()
            .copied()
            .filter(|id| !exclude.contains(id))
            .collect();
        for node_id in targets {
            if let Err(e) = self.send_to(node_id, envelope).await {
                debug!(node_id, "broadcast send failed: {e}");
            }
        }
    }

    pub fn clear(&self) {
        for (_, handle) in self.inner.lock().drain() {
            handle.cancel.cancel();
        }
    }
}

pub(crate) async fn accept_loop(shared: Arc<Shared>, listener: TcpListener) -> anyhow::Result<()> {
    loop {
        let (stream, addr) = listener.accept().await.context("error accepting TCP")?;
        debug!(%addr, "new connection");
        let shared = shared.clone();
        spawn(debug_span!("incoming", %addr), async move {
            handle_incoming(shared, stream, addr).await
        });
    }
}

async fn handle_incoming(
    shared: Arc<Shared>,
    stream: TcpStream,
    addr: SocketAddr,
) -> anyhow::Result<()> {
    let (mut read, write) = stream.into_split();
    let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, wire::read_frame(&mut read))
        .await
        .context("handshake timed out")?
        .context("error reading handshake")?;
    match first.body {
        MessageBody::Connect(connect) => {
            handle_connect(shared, read, write, addr, connect).await
        }
        MessageBody::Reconnect(reconnect) => {
            handle_reconnect(shared, read, write, addr, reconnect).await
        }
        other => {
            warn!(%addr, msg = other.name(), "peer spoke before handshaking, closing");
            Ok(())
        }
    }
}

/// The join table. The listener resolves the group, assigns the initiator an
/// id, answers with full state, and keeps servicing the socket.
async fn handle_connect(
    shared: Arc<Shared>,
    read: OwnedReadHalf,
    write: OwnedWriteHalf,
    addr: SocketAddr,
    connect: wire::Connect,
) -> anyhow::Result<()> {
    let (assigned_id, group_id, forced) = {
        let existing = shared.nodes.ids();
        let mut identity = shared.identity.write();
        match (identity.group_id, connect.group_id) {
            (None, None) => {
                let group = Uuid::new_v4();
                identity.group_id = Some(group);
                info!(%group, "formed a fresh group");
                (identity.next_free_id(&existing), group, false)
            }
            (None, Some(group)) => {
                identity.group_id = Some(group);
                info!(%group, "adopting the initiator's group");
                (identity.next_free_id(&existing), group, false)
            }
            (Some(group), None) => (identity.next_free_id(&existing), group, false),
            (Some(group), Some(remote)) if group == remote => {
                (identity.next_free_id(&existing), group, false)
            }
            (Some(group), Some(remote)) => {
                // Two pre-existing groups: ours wins, the initiator is
                // force-joined. Its previously placed data is orphaned.
                warn!(%group, %remote, "group mismatch, force-joining initiator into ours");
                (identity.next_free_id(&existing), group, true)
            }
        }
    };
    shared.persist_identity().await;

    shared.nodes.upsert(NodeInfo {
        node_id: assigned_id,
        ip: addr.ip(),
        tcp_port: connect.tcp_port,
        udp_port: connect.udp_port,
        capacity_mb: connect.capacity_mb,
        free_space_mb: connect.free_space_mb,
    });

    let (generation, token) = shared.peers.insert(assigned_id, write);
    let ack = shared.build_state_ack(assigned_id, group_id).await;
    shared
        .peers
        .send_to(assigned_id, &shared.envelope(MessageBody::ConnectAck(ack)))
        .await
        .map_err(|e| anyhow::anyhow!("error sending CONNECT_ACK: {e}"))?;
    send_discovery(&shared, assigned_id).await;
    shared
        .table
        .resize(shared.nodes.total_online_capacity_mb() as usize);
    info!(node_id = assigned_id, %addr, forced, "peer joined");

    read_loop(shared, read, assigned_id, generation, token).await
}

/// A returning peer asserts its persisted identity; only the group id is
/// verified. A mismatch closes the socket without touching any state.
async fn handle_reconnect(
    shared: Arc<Shared>,
    read: OwnedReadHalf,
    write: OwnedWriteHalf,
    addr: SocketAddr,
    reconnect: wire::Reconnect,
) -> anyhow::Result<()> {
    let group_id = match shared.identity.read().group_id {
        Some(group) if group == reconnect.group_id => group,
        _ => {
            warn!(%addr, node_id = reconnect.node_id, "reconnect rejected: group mismatch");
            return Ok(());
        }
    };
    if shared.peers.contains(reconnect.node_id) {
        warn!(
            node_id = reconnect.node_id,
            "reconnect clobbers a live connection for the same id"
        );
    }

    shared.nodes.upsert(NodeInfo {
        node_id: reconnect.node_id,
        ip: addr.ip(),
        tcp_port: reconnect.tcp_port,
        udp_port: reconnect.udp_port,
        capacity_mb: reconnect.capacity_mb,
        free_space_mb: reconnect.free_space_mb,
    });
    // Its blocks are readable again, and the ack below should say so.
    shared.table.mark_node_available(reconnect.node_id);

    let (generation, token) = shared.peers.insert(reconnect.node_id, write);
    let ack = shared.build_state_ack(reconnect.node_id, group_id).await;
    shared
        .peers
        .send_to(
            reconnect.node_id,
            &shared.envelope(MessageBody::ReconnectAck(ack)),
        )
        .await
        .map_err(|e| anyhow::anyhow!("error sending RECONNECT_ACK: {e}"))?;
    send_discovery(&shared, reconnect.node_id).await;
    shared
        .table
        .resize(shared.nodes.total_online_capacity_mb() as usize);
    info!(node_id = reconnect.node_id, %addr, "peer reconnected");

    read_loop(shared, read, reconnect.node_id, generation, token).await
}

async fn send_discovery(shared: &Arc<Shared>, to: NodeId) {
    let discovery = shared.envelope(MessageBody::NodeDiscovery(wire::NodeDiscovery {
        nodes: shared.nodes.snapshot_infos(),
    }));
    if let Err(e) = shared.peers.send_to(to, &discovery).await {
        debug!(to, "discovery not sent: {e}");
    }
}

/// Dials a peer. With a persisted identity this is a RECONNECT, otherwise a
/// plain CONNECT; either way the ack's full state replaces ours.
pub(crate) async fn connect_to_addr(shared: &Arc<Shared>, addr: SocketAddr) -> Result<NodeId> {
    let unreachable = |reason: String| Error::PeerUnreachable {
        addr: addr.to_string(),
        reason,
    };

    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| unreachable("connect timed out".to_owned()))?
        .map_err(|e| unreachable(e.to_string()))?;
    let (mut read, mut write) = stream.into_split();

    let capacity_mb = shared.config.read().capacity_mb;
    let free_space_mb = shared.store.free_space_mb().await;
    let identity = {
        let identity = shared.identity.read();
        identity.group_id.map(|group| (identity.node_id, group))
    };
    let reconnecting = identity.is_some();
    let handshake = match identity {
        Some((node_id, group_id)) => MessageBody::Reconnect(wire::Reconnect {
            node_id,
            group_id,
            capacity_mb,
            free_space_mb,
            tcp_port: shared.tcp_port,
            udp_port: shared.udp_port,
        }),
        None => MessageBody::Connect(wire::Connect {
            group_id: None,
            capacity_mb,
            free_space_mb,
            tcp_port: shared.tcp_port,
            udp_port: shared.udp_port,
        }),
    };
    wire::write_frame(&mut write, &shared.envelope(handshake))
        .await
        .map_err(|e| unreachable(format!("error sending handshake: {e}")))?;

    let ack_envelope = match tokio::time::timeout(HANDSHAKE_TIMEOUT, wire::read_frame(&mut read))
        .await
    {
        Ok(Ok(envelope)) => envelope,
        Ok(Err(_)) if reconnecting => {
            // The listener closes a reconnect whose group does not match. A
            // peer that just never answers is a timeout, not a refusal.
            return Err(Error::GroupMismatch);
        }
        Ok(Err(e)) => return Err(unreachable(format!("error reading ack: {e}"))),
        Err(_) => return Err(unreachable("handshake timed out".to_owned())),
    };
    let listener_id = ack_envelope.sender_id;
    let ack = match ack_envelope.body {
        MessageBody::ConnectAck(ack) | MessageBody::ReconnectAck(ack) => ack,
        other => {
            return Err(unreachable(format!(
                "unexpected handshake reply {}",
                other.name()
            )))
        }
    };

    shared.apply_full_state(ack, listener_id, addr).await;
    let (generation, token) = shared.peers.insert(listener_id, write);
    let shared_clone = shared.clone();
    spawn(debug_span!("peer", node_id = listener_id), async move {
        read_loop(shared_clone, read, listener_id, generation, token).await
    });
    info!(node_id = listener_id, %addr, "connected to peer");
    Ok(listener_id)
}

/// Per-socket service loop: frames are handled in order; a broken frame is
/// dropped, a broken connection removes the peer from the map.
async fn read_loop(
    shared: Arc<Shared>,
    mut read: OwnedReadHalf,
    peer_id: NodeId,
    generation: u64,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        let envelope = tokio::select! {
            _ = cancel.cancelled() => break,
            res = wire::read_frame(&mut read) => match res {
                Ok(envelope) => envelope,
                Err(e) if e.is_recoverable() => {
                    warn!(peer_id, "dropping malformed message: {e}");
                    continue;
                }
                Err(e) => {
                    debug!(peer_id, "connection closed: {e}");
                    break;
                }
            },
        };
        dispatch(&shared, peer_id, envelope).await;
    }
    shared.peers.remove_if(peer_id, generation);
    Ok(())
}

async fn dispatch(shared: &Arc<Shared>, from: NodeId, envelope: Envelope) {
    match envelope.body {
        MessageBody::BlockSend(msg) => pipeline::handle_block_send(shared, msg).await,
        MessageBody::BlockRequest(msg) => {
            pipeline::handle_block_request(shared, from, msg).await
        }
        MessageBody::MetadataSync(msg) => {
            // Table first: anything polling the file registry may resolve
            // slots right away.
            shared.table.replace_from_sync(msg.blocks);
            shared.files.replace_from_sync(msg.files);
            shared.persist_metadata().await;
            debug!(from, "metadata synchronized");
        }
        MessageBody::DeleteFile(msg) => pipeline::handle_delete_file(shared, msg).await,
        MessageBody::NodeDiscovery(msg) => handle_node_discovery(shared, msg),
        other => debug!(from, msg = other.name(), "ignoring message"),
    }
}

/// Dial everyone in the advertised list we are not yet meshed with.
fn handle_node_discovery(shared: &Arc<Shared>, discovery: wire::NodeDiscovery) {
    let self_id = shared.self_id();
    for node in discovery.nodes {
        if node.node_id == self_id || shared.peers.contains(node.node_id) {
            continue;
        }
        if !shared.nodes.contains(node.node_id) {
            shared.nodes.upsert(node.clone());
        }
        let addr = SocketAddr::new(node.ip, node.tcp_port);
        let shared = shared.clone();
        spawn(
            debug_span!("discovery_dial", node_id = node.node_id),
            async move {
                if let Err(e) = connect_to_addr(&shared, addr).await {
                    debug!("discovery dial failed: {e}");
                }
                Ok(())
            },
        );
    }
}
