pub mod constants;
pub mod lengths;
pub mod meta;
pub mod spawn_utils;

pub use meta::{BlockId, BlockRole, BlockSlot, FileRecord, NodeId, NodeInfo, SlotStatus};
