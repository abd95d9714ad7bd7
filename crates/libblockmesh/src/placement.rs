// Decides where the replicas of an upload go: round-robin over the online
// peers that still have room, one original plus one copy per chunk, never on
// the same owner. The free-space arithmetic here is bookkeeping local to one
// plan; it is not written back to the node registry.

use std::collections::{BTreeMap, HashMap};

use blockmesh_core::{BlockId, BlockRole, NodeId};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::block_table::BlockTable;
use crate::node_registry::NodeRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedBlock {
    pub block_id: BlockId,
    pub node_id: NodeId,
    pub role: BlockRole,
    pub file_block_index: u32,
}

#[derive(Debug, Default)]
pub struct PlacementPlan {
    pub entries: Vec<PlannedBlock>,
    /// Chunk indices that got an original but no copy.
    pub degraded: Vec<u32>,
}

impl PlacementPlan {
    /// A plan is only usable if every chunk got its original.
    pub fn has_all_originals(&self, num_blocks: u32) -> bool {
        (0..num_blocks).all(|i| {
            self.entries
                .iter()
                .any(|e| e.file_block_index == i && e.role == BlockRole::Original)
        })
    }

    pub fn block_ids(&self) -> Vec<BlockId> {
        self.entries.iter().map(|e| e.block_id).collect()
    }

    pub fn by_index(&self) -> BTreeMap<u32, Vec<PlannedBlock>> {
        let mut out: BTreeMap<u32, Vec<PlannedBlock>> = BTreeMap::new();
        for entry in &self.entries {
            out.entry(entry.file_block_index).or_default().push(*entry);
        }
        out
    }
}

#[derive(Default)]
pub struct PlacementPlanner {
    // Process-wide round-robin cursor, advanced once per selection.
    cursor: Mutex<usize>,
}

impl PlacementPlanner {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn plan(
        &self,
        nodes: &NodeRegistry,
        table: &BlockTable,
        num_blocks: u32,
        file_name: &str,
    ) -> PlacementPlan {
        let mut candidates: Vec<NodeId> = nodes
            .online()
            .iter()
            .filter(|e| e.info.free_space_mb > 0)
            .map(|e| e.info.node_id)
            .collect();
        candidates.sort_unstable();

        let mut plan = PlacementPlan::default();
        if candidates.is_empty() {
            warn!("no online node with free space, cannot place anything");
            return plan;
        }

        let mut spaces: HashMap<NodeId, i64> = nodes
            .online()
            .iter()
            .map(|e| (e.info.node_id, e.info.free_space_mb as i64))
            .collect();

        for file_block_index in 0..num_blocks {
            let original = match self.select_node(&candidates, &spaces, &[]) {
                Some(n) => n,
                None => {
                    warn!(file_block_index, "no candidate left for an original");
                    break;
                }
            };
            let original_id =
                match table.allocate(original, file_name, file_block_index, BlockRole::Original) {
                    Some(id) => id,
                    None => {
                        warn!(file_block_index, "block table has no free slot left");
                        break;
                    }
                };
            plan.entries.push(PlannedBlock {
                block_id: original_id,
                node_id: original,
                role: BlockRole::Original,
                file_block_index,
            });
            *spaces.entry(original).or_default() -= 1;

            // The copy must land somewhere else.
            match self.select_node(&candidates, &spaces, &[original]) {
                Some(copy) => {
                    match table.allocate(copy, file_name, file_block_index, BlockRole::Copy) {
                        Some(copy_id) => {
                            plan.entries.push(PlannedBlock {
                                block_id: copy_id,
                                node_id: copy,
                                role: BlockRole::Copy,
                                file_block_index,
                            });
                            *spaces.entry(copy).or_default() -= 1;
                        }
                        None => {
                            warn!(file_block_index, "no free slot for a copy, chunk is degraded");
                            plan.degraded.push(file_block_index);
                        }
                    }
                }
                None => {
                    warn!(file_block_index, "no candidate for a copy, chunk is degraded");
                    plan.degraded.push(file_block_index);
                }
            }

            *spaces.entry(original).or_default() += 1;
        }

        debug!(
            file_name,
            entries = plan.entries.len(),
            degraded = plan.degraded.len(),
            "placement planned"
        );
        plan
    }

    fn select_node(
        &self,
        candidates: &[NodeId],
        spaces: &HashMap<NodeId, i64>,
        exclude: &[NodeId],
    ) -> Option<NodeId> {
        let eligible: Vec<NodeId> = candidates
            .iter()
            .copied()
            .filter(|n| !exclude.contains(n))
            .collect();
        if eligible.is_empty() {
            return None;
        }
        let start = {
            let mut cursor = self.cursor.lock();
            let start = *cursor % eligible.len();
            *cursor += 1;
            start
        };
        for offset in 0..eligible.len() {
            let node_id = eligible[(start + offset) % eligible.len()];
            if spaces.get(&node_id).copied().unwrap_or(0) > 0 {
                return Some(node_id);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use blockmesh_core::{NodeInfo, SlotStatus};

    use super::*;

    fn registry(nodes: &[(NodeId, u32)]) -> NodeRegistry {
        let reg = NodeRegistry::new();
        for (node_id, free) in nodes {
            reg.upsert(NodeInfo {
                node_id: *node_id,
                ip: "10.0.0.1".parse().unwrap(),
                tcp_port: 8888,
                udp_port: 8889,
                capacity_mb: 100,
                free_space_mb: *free,
            });
        }
        reg
    }

    #[test]
    fn test_two_nodes_alternating_roles() {
        let reg = registry(&[(1, 50), (2, 60)]);
        let table = BlockTable::new();
        table.resize(110);
        let planner = PlacementPlanner::new();

        let plan = planner.plan(&reg, &table, 5, "hello.txt");
        assert!(plan.has_all_originals(5));
        assert!(plan.degraded.is_empty());
        assert_eq!(plan.entries.len(), 10);

        for (_, replicas) in plan.by_index() {
            assert_eq!(replicas.len(), 2);
            let original = replicas.iter().find(|e| e.role == BlockRole::Original).unwrap();
            let copy = replicas.iter().find(|e| e.role == BlockRole::Copy).unwrap();
            assert_ne!(original.node_id, copy.node_id);
        }

        // With two candidates the rotation parks all originals on one node
        // and all copies on the other.
        let original_owners: Vec<_> = plan
            .entries
            .iter()
            .filter(|e| e.role == BlockRole::Original)
            .map(|e| e.node_id)
            .collect();
        assert!(original_owners.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_allocations_land_in_table() {
        let reg = registry(&[(1, 50), (2, 50)]);
        let table = BlockTable::new();
        table.resize(100);
        let planner = PlacementPlanner::new();

        let plan = planner.plan(&reg, &table, 2, "f.bin");
        for entry in &plan.entries {
            let slot = table.get(entry.block_id).unwrap();
            assert_eq!(slot.status, SlotStatus::Used);
            assert_eq!(slot.owner, Some(entry.node_id));
            assert_eq!(slot.file_name.as_deref(), Some("f.bin"));
            assert_eq!(slot.file_block_index, Some(entry.file_block_index));
        }
    }

    #[test]
    fn test_single_node_is_degraded() {
        let reg = registry(&[(1, 50)]);
        let table = BlockTable::new();
        table.resize(50);
        let planner = PlacementPlanner::new();

        let plan = planner.plan(&reg, &table, 3, "f.bin");
        assert!(plan.has_all_originals(3));
        assert_eq!(plan.degraded, vec![0, 1, 2]);
        assert_eq!(plan.entries.len(), 3);
    }

    #[test]
    fn test_no_candidates_yields_empty_plan() {
        let reg = registry(&[(1, 0)]);
        let table = BlockTable::new();
        table.resize(10);
        let planner = PlacementPlanner::new();

        let plan = planner.plan(&reg, &table, 2, "f.bin");
        assert!(plan.entries.is_empty());
        assert!(!plan.has_all_originals(2));
    }

    #[test]
    fn test_table_exhaustion_stops_short() {
        let reg = registry(&[(1, 50), (2, 50)]);
        let table = BlockTable::new();
        table.resize(3);
        let planner = PlacementPlanner::new();

        // 5 chunks want 10 slots but only 3 exist.
        let plan = planner.plan(&reg, &table, 5, "f.bin");
        assert!(!plan.has_all_originals(5));
        assert!(plan.entries.len() <= 3);
    }

    #[test]
    fn test_free_space_limits_copies() {
        // Node 2 has room for a single block; after it fills up the copies
        // have nowhere to go.
        let reg = registry(&[(1, 50), (2, 1)]);
        let table = BlockTable::new();
        table.resize(51);
        let planner = PlacementPlanner::new();

        let plan = planner.plan(&reg, &table, 3, "f.bin");
        assert!(plan.has_all_originals(3));
        assert!(!plan.degraded.is_empty());
    }
}
