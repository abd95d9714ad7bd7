// Wires the registries, the transport, and the supervision loops into one
// long-running node, and exposes the operation surface the front-ends call.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use blockmesh_core::constants::{
    HEARTBEAT_TIMEOUT, MESH_REPAIR_INTERVAL, TIMEOUT_SWEEP_INTERVAL,
};
use blockmesh_core::spawn_utils::{spawn, spawn_with_cancel};
use blockmesh_core::{BlockSlot, FileRecord, NodeId, NodeInfo};
use parking_lot::RwLock;
use peer_wire_protocol as wire;
use peer_wire_protocol::{Envelope, MessageBody};
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, debug_span, error_span, info, warn};
use uuid::Uuid;

use crate::block_store::BlockStore;
use crate::block_table::BlockTable;
use crate::config::{NodeConfig, NodePaths};
use crate::error::{Error, Result};
use crate::file_registry::FileRegistry;
use crate::heartbeat;
use crate::node_registry::{NodeEntry, NodeRegistry};
use crate::persistence::{self, MetadataStore, PersistedIdentity};
use crate::pipeline::{self, PendingBlocks};
use crate::placement::PlacementPlanner;
use crate::transport::{self, PeerMap};

#[derive(Debug, Default, Clone, Copy)]
pub struct SessionOptions {
    /// Overrides the configured TCP port; 0 binds an ephemeral one.
    pub listen_port: Option<u16>,
    /// Overrides (and persists) the configured capacity.
    pub capacity_mb: Option<u32>,
}

pub(crate) struct Identity {
    pub node_id: NodeId,
    pub group_id: Option<Uuid>,
    next_node_id: NodeId,
}

impl Identity {
    /// Smallest id not taken by us or anyone in the registry; the counter
    /// then moves past it.
    pub fn next_free_id(&mut self, existing: &[NodeId]) -> NodeId {
        let mut id = self.next_node_id.max(1);
        while id == self.node_id || existing.contains(&id) {
            id += 1;
        }
        self.next_node_id = id + 1;
        id
    }
}

pub(crate) struct Shared {
    pub(crate) paths: NodePaths,
    pub(crate) config: RwLock<NodeConfig>,
    pub(crate) identity: RwLock<Identity>,
    pub(crate) store: BlockStore,
    pub(crate) nodes: NodeRegistry,
    pub(crate) table: BlockTable,
    pub(crate) files: FileRegistry,
    pub(crate) metadata: MetadataStore,
    pub(crate) planner: PlacementPlanner,
    pub(crate) peers: PeerMap,
    pub(crate) pending_blocks: PendingBlocks,
    pub(crate) cancel: CancellationToken,
    pub(crate) tcp_port: u16,
    pub(crate) udp_port: u16,
}

impl Shared {
    pub fn self_id(&self) -> NodeId {
        self.identity.read().node_id
    }

    pub fn envelope(&self, body: MessageBody) -> Envelope {
        Envelope::new(self.self_id(), body)
    }

    pub fn is_connected(&self) -> bool {
        let self_id = self.self_id();
        self.nodes
            .online()
            .iter()
            .any(|e| e.info.node_id != self_id)
    }

    pub async fn persist_identity(&self) {
        let snapshot = {
            let identity = self.identity.read();
            identity.group_id.map(|group_id| PersistedIdentity {
                node_id: identity.node_id,
                group_id,
            })
        };
        if let Some(identity) = snapshot {
            if let Err(e) = persistence::save_identity(&self.paths, &identity).await {
                warn!("error persisting node state: {e:#}");
            }
        }
    }

    pub async fn persist_metadata(&self) {
        if let Err(e) = self.metadata.save(self.files.all()).await {
            warn!("error persisting metadata: {e:#}");
        }
    }

    pub async fn refresh_own_free_space(&self) {
        let free = self.store.free_space_mb().await;
        self.nodes.update_free_space(self.self_id(), free);
    }

    pub async fn build_state_ack(&self, node_id: NodeId, group_id: Uuid) -> wire::ConnectAck {
        let capacity_mb = self.config.read().capacity_mb;
        wire::ConnectAck {
            node_id,
            group_id,
            capacity_mb,
            free_space_mb: self.store.free_space_mb().await,
            all_nodes: self.nodes.snapshot_infos(),
            all_files: self.files.all(),
            all_blocks: self.table.snapshot(),
        }
    }

    /// The initiator's side of a handshake: adopt the assigned identity and
    /// replace every registry with the advertised state.
    pub async fn apply_full_state(
        &self,
        ack: wire::ConnectAck,
        listener_id: NodeId,
        dialed: SocketAddr,
    ) {
        {
            let mut identity = self.identity.write();
            identity.node_id = ack.node_id;
            identity.group_id = Some(ack.group_id);
        }
        self.persist_identity().await;

        self.nodes.replace_from_infos(ack.all_nodes);
        // The listener records itself as loopback; we know where we really
        // reached it. Our own advertised entry may be stale too.
        self.nodes.update_ip(listener_id, dialed.ip());
        let capacity_mb = self.config.read().capacity_mb;
        let free = self.store.free_space_mb().await;
        self.nodes.update_capacity(ack.node_id, capacity_mb, free);

        self.table.replace_from_sync(ack.all_blocks);
        self.table
            .resize(self.nodes.total_online_capacity_mb() as usize);
        self.files.replace_from_sync(ack.all_files);
        self.persist_metadata().await;
        info!(
            node_id = ack.node_id,
            group_id = %ack.group_id,
            "joined group with replicated state"
        );
    }

    pub async fn broadcast_metadata_sync(&self) {
        let envelope = self.envelope(MessageBody::MetadataSync(wire::MetadataSync {
            files: self.files.all(),
            blocks: self.table.snapshot(),
        }));
        self.peers.broadcast(&envelope, &[]).await;
    }
}

pub struct Session {
    shared: Arc<Shared>,
    // Stops every loop when the session is dropped.
    _cancel_guard: DropGuard,
}

impl Session {
    pub async fn new(paths: NodePaths) -> anyhow::Result<Arc<Self>> {
        Self::with_opts(paths, SessionOptions::default()).await
    }

    pub async fn with_opts(paths: NodePaths, opts: SessionOptions) -> anyhow::Result<Arc<Self>> {
        let mut config = NodeConfig::load_or_init(&paths).await?;
        if let Some(capacity_mb) = opts.capacity_mb {
            if config.capacity_mb != capacity_mb {
                config.capacity_mb = capacity_mb;
                config.save(&paths).await?;
            }
        }

        let persisted = persistence::load_identity(&paths).await?;
        let identity = Identity {
            node_id: persisted.map(|p| p.node_id).unwrap_or(1),
            group_id: persisted.map(|p| p.group_id),
            next_node_id: 1,
        };
        if let Some(p) = &persisted {
            info!(node_id = p.node_id, group_id = %p.group_id, "resuming persisted identity");
        }

        let store = BlockStore::new(paths.blocks_dir.clone(), config.capacity_mb).await?;
        let metadata = MetadataStore::new(&paths);
        let files = FileRegistry::new(metadata.load().await?);
        let table = BlockTable::new();
        table.resize(config.capacity_mb as usize);

        let listen_port = opts.listen_port.unwrap_or(config.port);
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, listen_port))
            .await
            .with_context(|| format!("error binding TCP listener on port {listen_port}"))?;
        let tcp_port = listener.local_addr()?.port();
        // The UDP port rides one above TCP; with an ephemeral TCP port the
        // pairing is advertised through the handshake instead.
        let udp_port_wanted = if listen_port == 0 { 0 } else { tcp_port + 1 };
        let udp_socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, udp_port_wanted))
            .await
            .with_context(|| format!("error binding UDP socket on port {udp_port_wanted}"))?;
        let udp_port = udp_socket.local_addr()?.port();

        let cancel = CancellationToken::new();
        let nodes = NodeRegistry::new();
        let free = store.free_space_mb().await;
        nodes.upsert(NodeInfo {
            node_id: identity.node_id,
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            tcp_port,
            udp_port,
            capacity_mb: config.capacity_mb,
            free_space_mb: free,
        });

        info!(
            node_id = identity.node_id,
            tcp_port, udp_port, "node listening"
        );

        let shared = Arc::new(Shared {
            paths,
            config: RwLock::new(config),
            identity: RwLock::new(identity),
            store,
            nodes,
            table,
            files,
            metadata,
            planner: PlacementPlanner::new(),
            peers: PeerMap::new(cancel.clone()),
            pending_blocks: PendingBlocks::default(),
            cancel: cancel.clone(),
            tcp_port,
            udp_port,
        });

        let udp_socket = Arc::new(udp_socket);
        spawn_with_cancel(
            error_span!("accept", port = tcp_port),
            cancel.clone(),
            transport::accept_loop(shared.clone(), listener),
        );
        spawn_with_cancel(
            error_span!("heartbeat_send"),
            cancel.clone(),
            heartbeat::sender_loop(shared.clone(), udp_socket.clone()),
        );
        spawn_with_cancel(
            error_span!("heartbeat_recv"),
            cancel.clone(),
            heartbeat::receiver_loop(shared.clone(), udp_socket),
        );
        spawn_with_cancel(
            error_span!("timeout_sweep"),
            cancel.clone(),
            sweep_loop(shared.clone()),
        );
        spawn_with_cancel(
            error_span!("mesh_repair"),
            cancel.clone(),
            mesh_repair_loop(shared.clone()),
        );

        Ok(Arc::new(Self {
            shared,
            _cancel_guard: cancel.drop_guard(),
        }))
    }

    /// Stops every loop and drops all peer sockets. Best-effort: in-flight
    /// operations fail rather than drain.
    pub fn stop(&self) {
        info!("stopping node");
        self.shared.cancel.cancel();
        self.shared.peers.clear();
    }

    // --- the operation surface ---

    /// Dials `(ip, configured port)` and joins (or merges into) that peer's
    /// group.
    pub async fn connect(&self, ip: &str) -> Result<()> {
        let ip = ip.trim();
        if ip.is_empty() {
            return Err(Error::PeerUnreachable {
                addr: "<empty>".to_owned(),
                reason: "no address given".to_owned(),
            });
        }
        let parsed: IpAddr = ip.parse().map_err(|e| Error::PeerUnreachable {
            addr: ip.to_owned(),
            reason: format!("invalid address: {e}"),
        })?;
        if parsed.is_loopback() {
            return Err(Error::PeerUnreachable {
                addr: ip.to_owned(),
                reason: "refusing to dial loopback, that is this node".to_owned(),
            });
        }
        let port = self.shared.config.read().port;
        self.connect_to_addr(SocketAddr::new(parsed, port)).await
    }

    /// Like [`Session::connect`] but with an explicit port and no loopback
    /// guard. This is what discovery and tests use.
    pub async fn connect_to_addr(&self, addr: SocketAddr) -> Result<()> {
        transport::connect_to_addr(&self.shared, addr).await.map(|_| ())
    }

    pub async fn upload(&self, file_path: impl AsRef<Path>) -> Result<()> {
        pipeline::upload(&self.shared, file_path.as_ref()).await
    }

    pub async fn download(&self, file_name: &str, save_path: impl AsRef<Path>) -> Result<()> {
        pipeline::download(&self.shared, file_name, save_path.as_ref()).await
    }

    pub async fn delete(&self, file_name: &str) -> Result<()> {
        pipeline::delete(&self.shared, file_name).await
    }

    /// Only allowed within [50, 100] MiB, above the space already used, and
    /// while not connected to any group.
    pub async fn set_capacity(&self, capacity_mb: u32) -> Result<()> {
        if !NodeConfig::capacity_in_range(capacity_mb) {
            return Err(Error::ConfigInvalid(format!(
                "capacity {capacity_mb} MiB outside the allowed 50..=100"
            )));
        }
        let used = self.shared.store.used_space_mb().await;
        if capacity_mb < used {
            return Err(Error::ConfigInvalid(format!(
                "capacity {capacity_mb} MiB below the {used} MiB already in use"
            )));
        }
        if self.shared.is_connected() {
            return Err(Error::ConfigInvalid(
                "cannot change capacity while connected to a group".to_owned(),
            ));
        }

        let snapshot = {
            let mut config = self.shared.config.write();
            config.capacity_mb = capacity_mb;
            *config
        };
        if let Err(e) = snapshot.save(&self.shared.paths).await {
            warn!("error persisting configuration: {e:#}");
        }
        self.shared.store.set_capacity_mb(capacity_mb);
        self.shared.table.resize(capacity_mb as usize);
        let free = self.shared.store.free_space_mb().await;
        self.shared
            .nodes
            .update_capacity(self.shared.self_id(), capacity_mb, free);
        info!(capacity_mb, "capacity changed");
        Ok(())
    }

    // --- snapshots ---

    pub fn node_id(&self) -> NodeId {
        self.shared.self_id()
    }

    pub fn group_id(&self) -> Option<Uuid> {
        self.shared.identity.read().group_id
    }

    pub fn tcp_port(&self) -> u16 {
        self.shared.tcp_port
    }

    pub fn udp_port(&self) -> u16 {
        self.shared.udp_port
    }

    pub fn list_nodes(&self) -> Vec<NodeEntry> {
        let mut nodes = self.shared.nodes.all();
        nodes.sort_by_key(|e| e.info.node_id);
        nodes
    }

    pub fn list_files(&self) -> HashMap<String, FileRecord> {
        self.shared.files.all()
    }

    pub fn list_blocks(&self) -> Vec<BlockSlot> {
        self.shared.table.snapshot()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    pub async fn used_space_mb(&self) -> u32 {
        self.shared.store.used_space_mb().await
    }

    pub async fn free_space_mb(&self) -> u32 {
        self.shared.store.free_space_mb().await
    }
}

/// Marks silent peers offline, keeps the table sized to the online capacity,
/// and parks the blocks of dead owners.
async fn sweep_loop(shared: Arc<Shared>) -> anyhow::Result<()> {
    let mut interval = tokio::time::interval(TIMEOUT_SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        let self_id = shared.self_id();
        shared.nodes.sweep_timeouts(HEARTBEAT_TIMEOUT, self_id);

        let total = shared.nodes.total_online_capacity_mb() as usize;
        if total != shared.table.len() {
            shared.table.resize(total);
        }
        for node_id in shared.nodes.offline_ids() {
            if node_id != self_id {
                shared.table.mark_node_unavailable(node_id);
            }
        }
    }
}

/// Dials any online peer we have no open connection to.
async fn mesh_repair_loop(shared: Arc<Shared>) -> anyhow::Result<()> {
    let mut interval = tokio::time::interval(MESH_REPAIR_INTERVAL);
    loop {
        interval.tick().await;
        let self_id = shared.self_id();
        for entry in shared.nodes.online() {
            let node_id = entry.info.node_id;
            if node_id == self_id || shared.peers.contains(node_id) {
                continue;
            }
            let addr = SocketAddr::new(entry.info.ip, entry.info.tcp_port);
            debug!(node_id, %addr, "mesh repair dialing");
            let shared = shared.clone();
            spawn(debug_span!("repair_dial", node_id), async move {
                if let Err(e) = transport::connect_to_addr(&shared, addr).await {
                    debug!("mesh repair dial failed: {e}");
                }
                Ok(())
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_free_id_skips_taken() {
        let mut identity = Identity {
            node_id: 1,
            group_id: None,
            next_node_id: 1,
        };
        assert_eq!(identity.next_free_id(&[1]), 2);
        assert_eq!(identity.next_free_id(&[1, 2]), 3);

        // The counter never goes backwards, even if earlier ids free up.
        assert_eq!(identity.next_free_id(&[]), 4);
    }

    #[test]
    fn test_next_free_id_skips_own() {
        let mut identity = Identity {
            node_id: 3,
            group_id: None,
            next_node_id: 3,
        };
        assert_eq!(identity.next_free_id(&[]), 4);
    }
}
