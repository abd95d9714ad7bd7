// The replicated data model shared by the wire protocol and the registries.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

pub type NodeId = u32;
pub type BlockId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockRole {
    Original,
    Copy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotStatus {
    Used,
    Free,
    Unavailable,
}

/// One entry of the global block table. A free slot carries only its id;
/// a used slot pins one replica of one logical chunk to one owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockSlot {
    pub block_id: BlockId,
    #[serde(default)]
    pub role: Option<BlockRole>,
    #[serde(default)]
    pub owner: Option<NodeId>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_block_index: Option<u32>,
    pub status: SlotStatus,
}

impl BlockSlot {
    pub fn free(block_id: BlockId) -> Self {
        Self {
            block_id,
            role: None,
            owner: None,
            file_name: None,
            file_block_index: None,
            status: SlotStatus::Free,
        }
    }

    pub fn clear(&mut self) {
        self.role = None;
        self.owner = None;
        self.file_name = None;
        self.file_block_index = None;
        self.status = SlotStatus::Free;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub size: u64,
    pub num_blocks: u32,
    /// Unix timestamp (seconds).
    pub upload_date: f64,
    pub blocks: Vec<BlockId>,
}

/// What one peer advertises about another in handshakes and discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub ip: IpAddr,
    pub tcp_port: u16,
    pub udp_port: u16,
    pub capacity_mb: u32,
    pub free_space_mb: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_serde_shape() {
        let slot = BlockSlot {
            block_id: 7,
            role: Some(BlockRole::Original),
            owner: Some(2),
            file_name: Some("a.bin".into()),
            file_block_index: Some(0),
            status: SlotStatus::Used,
        };
        let v = serde_json::to_value(&slot).unwrap();
        assert_eq!(v["role"], "original");
        assert_eq!(v["status"], "used");

        let free = BlockSlot::free(8);
        let v = serde_json::to_value(&free).unwrap();
        assert_eq!(v["status"], "free");
        assert!(v["owner"].is_null());
    }

    #[test]
    fn test_clear_resets_everything_but_id() {
        let mut slot = BlockSlot {
            block_id: 3,
            role: Some(BlockRole::Copy),
            owner: Some(1),
            file_name: Some("x".into()),
            file_block_index: Some(4),
            status: SlotStatus::Used,
        };
        slot.clear();
        assert_eq!(slot, BlockSlot::free(3));
    }
}
