// The replicated view of group membership. A peer is online iff we heard a
// heartbeat from it within the timeout window; the sweep in the session is
// what enforces the transition.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use blockmesh_core::{NodeId, NodeInfo};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub info: NodeInfo,
    pub status: NodeStatus,
    pub last_heartbeat: Instant,
}

#[derive(Default)]
pub struct NodeRegistry {
    nodes: RwLock<HashMap<NodeId, NodeEntry>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Adds or refreshes a peer; either way it comes out online.
    pub fn upsert(&self, info: NodeInfo) {
        let mut nodes = self.nodes.write();
        let node_id = info.node_id;
        nodes.insert(
            node_id,
            NodeEntry {
                info,
                status: NodeStatus::Online,
                last_heartbeat: Instant::now(),
            },
        );
        info!(node_id, "added/updated node");
    }

    /// Returns true if the node was offline and just came back.
    pub fn update_heartbeat(&self, node_id: NodeId) -> bool {
        let mut nodes = self.nodes.write();
        if let Some(entry) = nodes.get_mut(&node_id) {
            entry.last_heartbeat = Instant::now();
            if entry.status == NodeStatus::Offline {
                entry.status = NodeStatus::Online;
                info!(node_id, "node came back online");
                return true;
            }
        }
        false
    }

    /// Marks every online node (except `keep_alive`, normally ourselves)
    /// that has been silent longer than `timeout` offline. Returns the ids
    /// that flipped.
    pub fn sweep_timeouts(&self, timeout: Duration, keep_alive: NodeId) -> Vec<NodeId> {
        let now = Instant::now();
        let mut flipped = Vec::new();
        let mut nodes = self.nodes.write();
        for (node_id, entry) in nodes.iter_mut() {
            if *node_id == keep_alive || entry.status != NodeStatus::Online {
                continue;
            }
            let silent_for = now.duration_since(entry.last_heartbeat);
            if silent_for > timeout {
                entry.status = NodeStatus::Offline;
                warn!(node_id, ?silent_for, "node timed out, marked offline");
                flipped.push(*node_id);
            }
        }
        flipped
    }

    pub fn get(&self, node_id: NodeId) -> Option<NodeEntry> {
        self.nodes.read().get(&node_id).cloned()
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.nodes.read().contains_key(&node_id)
    }

    pub fn all(&self) -> Vec<NodeEntry> {
        self.nodes.read().values().cloned().collect()
    }

    pub fn online(&self) -> Vec<NodeEntry> {
        self.nodes
            .read()
            .values()
            .filter(|e| e.status == NodeStatus::Online)
            .cloned()
            .collect()
    }

    pub fn offline_ids(&self) -> Vec<NodeId> {
        self.nodes
            .read()
            .iter()
            .filter(|(_, e)| e.status == NodeStatus::Offline)
            .map(|(id, _)| *id)
            .collect()
    }

    /// The advertised view sent in handshakes and discovery.
    pub fn snapshot_infos(&self) -> Vec<NodeInfo> {
        let mut infos: Vec<NodeInfo> =
            self.nodes.read().values().map(|e| e.info.clone()).collect();
        infos.sort_by_key(|i| i.node_id);
        infos
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.read().keys().copied().collect()
    }

    /// Aggregate capacity of online nodes, in MiB. The block table is sized
    /// to this.
    pub fn total_online_capacity_mb(&self) -> u64 {
        self.nodes
            .read()
            .values()
            .filter(|e| e.status == NodeStatus::Online)
            .map(|e| e.info.capacity_mb as u64)
            .sum()
    }

    pub fn update_free_space(&self, node_id: NodeId, free_space_mb: u32) {
        if let Some(entry) = self.nodes.write().get_mut(&node_id) {
            entry.info.free_space_mb = free_space_mb;
        }
    }

    pub fn update_capacity(&self, node_id: NodeId, capacity_mb: u32, free_space_mb: u32) {
        if let Some(entry) = self.nodes.write().get_mut(&node_id) {
            entry.info.capacity_mb = capacity_mb;
            entry.info.free_space_mb = free_space_mb;
        }
    }

    /// Fixes up the recorded address of a peer, e.g. after we learn where it
    /// really lives from a dial.
    pub fn update_ip(&self, node_id: NodeId, ip: IpAddr) {
        if let Some(entry) = self.nodes.write().get_mut(&node_id) {
            entry.info.ip = ip;
        }
    }

    /// Replaces the whole table from an advertised view, everything online.
    pub fn replace_from_infos(&self, infos: Vec<NodeInfo>) {
        let now = Instant::now();
        let mut nodes = self.nodes.write();
        nodes.clear();
        for info in infos {
            nodes.insert(
                info.node_id,
                NodeEntry {
                    info,
                    status: NodeStatus::Online,
                    last_heartbeat: now,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(node_id: NodeId, capacity_mb: u32) -> NodeInfo {
        NodeInfo {
            node_id,
            ip: "10.0.0.1".parse().unwrap(),
            tcp_port: 8888,
            udp_port: 8889,
            capacity_mb,
            free_space_mb: capacity_mb,
        }
    }

    #[test]
    fn test_upsert_and_capacity() {
        let reg = NodeRegistry::new();
        reg.upsert(info(1, 50));
        reg.upsert(info(2, 60));
        assert_eq!(reg.total_online_capacity_mb(), 110);

        // Updating the same id does not duplicate.
        reg.upsert(info(2, 70));
        assert_eq!(reg.total_online_capacity_mb(), 120);
        assert_eq!(reg.all().len(), 2);
    }

    #[test]
    fn test_sweep_marks_silent_nodes_offline() {
        let reg = NodeRegistry::new();
        reg.upsert(info(1, 50));
        reg.upsert(info(2, 60));

        // Nothing is stale yet.
        assert!(reg.sweep_timeouts(Duration::from_secs(9), 1).is_empty());

        // With a zero timeout everything but the kept id flips.
        let flipped = reg.sweep_timeouts(Duration::ZERO, 1);
        assert_eq!(flipped, vec![2]);
        assert_eq!(reg.get(2).unwrap().status, NodeStatus::Offline);
        assert_eq!(reg.get(1).unwrap().status, NodeStatus::Online);
        assert_eq!(reg.total_online_capacity_mb(), 50);
    }

    #[test]
    fn test_heartbeat_revives_offline_node() {
        let reg = NodeRegistry::new();
        reg.upsert(info(2, 60));
        reg.sweep_timeouts(Duration::ZERO, 1);
        assert_eq!(reg.get(2).unwrap().status, NodeStatus::Offline);

        assert!(reg.update_heartbeat(2));
        assert_eq!(reg.get(2).unwrap().status, NodeStatus::Online);
        // A second heartbeat is not a transition.
        assert!(!reg.update_heartbeat(2));
    }

    #[test]
    fn test_replace_from_infos() {
        let reg = NodeRegistry::new();
        reg.upsert(info(9, 50));
        reg.replace_from_infos(vec![info(1, 50), info(2, 60)]);
        assert!(reg.get(9).is_none());
        assert_eq!(reg.snapshot_infos().len(), 2);
        assert_eq!(reg.snapshot_infos()[0].node_id, 1);
    }
}
