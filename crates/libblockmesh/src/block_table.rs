// The global block table: an ordered slot vector sized to the group's
// aggregate online capacity in MiB. Block ids are stamped from a counter
// that only moves forward within a process lifetime.

use blockmesh_core::{BlockId, BlockRole, BlockSlot, NodeId, SlotStatus};
use parking_lot::RwLock;
use tracing::{debug, info};

#[derive(Default)]
struct Inner {
    slots: Vec<BlockSlot>,
    next_block_id: BlockId,
}

pub struct BlockTable {
    inner: RwLock<Inner>,
}

impl Default for BlockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockTable {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                slots: Vec::new(),
                next_block_id: 1,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Grows by appending free slots, each stamped with a fresh id. A shrink
    /// drops free slots past the new size; used slots there are kept with
    /// their placement metadata but flip to unavailable.
    pub fn resize(&self, new_size: usize) {
        let mut inner = self.inner.write();
        let current = inner.slots.len();
        if new_size > current {
            for _ in current..new_size {
                let block_id = inner.next_block_id;
                inner.next_block_id += 1;
                inner.slots.push(BlockSlot::free(block_id));
            }
            info!(from = current, to = new_size, "block table grown");
        } else if new_size < current {
            let mut flipped = 0usize;
            let mut index = 0usize;
            inner.slots.retain_mut(|slot| {
                let in_tail = index >= new_size;
                index += 1;
                if !in_tail {
                    return true;
                }
                match slot.status {
                    SlotStatus::Free => false,
                    SlotStatus::Used => {
                        slot.status = SlotStatus::Unavailable;
                        flipped += 1;
                        true
                    }
                    SlotStatus::Unavailable => true,
                }
            });
            let after = inner.slots.len();
            // The sweep retries the resize every tick while occupied tail
            // slots keep the table oversized; stay quiet when nothing moved.
            if after != current || flipped > 0 {
                info!(from = current, to = after, flipped, "block table shrunk");
            }
        }
    }

    /// Claims the first free slot for one replica of one chunk. The slot is
    /// re-stamped with a fresh block id so ids are never reused.
    pub fn allocate(
        &self,
        owner: NodeId,
        file_name: &str,
        file_block_index: u32,
        role: BlockRole,
    ) -> Option<BlockId> {
        let mut inner = self.inner.write();
        let block_id = inner.next_block_id;
        let slot = inner
            .slots
            .iter_mut()
            .find(|s| s.status == SlotStatus::Free)?;
        slot.block_id = block_id;
        slot.role = Some(role);
        slot.owner = Some(owner);
        slot.file_name = Some(file_name.to_owned());
        slot.file_block_index = Some(file_block_index);
        slot.status = SlotStatus::Used;
        inner.next_block_id += 1;
        debug!(block_id, owner, file_name, file_block_index, "allocated block");
        Some(block_id)
    }

    pub fn mark_free(&self, block_id: BlockId) {
        let mut inner = self.inner.write();
        if let Some(slot) = inner.slots.iter_mut().find(|s| s.block_id == block_id) {
            slot.clear();
            debug!(block_id, "marked block free");
        }
    }

    pub fn get(&self, block_id: BlockId) -> Option<BlockSlot> {
        self.inner
            .read()
            .slots
            .iter()
            .find(|s| s.block_id == block_id)
            .cloned()
    }

    pub fn blocks_for_file(&self, file_name: &str) -> Vec<BlockSlot> {
        self.inner
            .read()
            .slots
            .iter()
            .filter(|s| s.file_name.as_deref() == Some(file_name))
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> Vec<BlockSlot> {
        self.inner.read().slots.clone()
    }

    /// Used slots of a peer that went dark keep their metadata but stop
    /// counting as readable.
    pub fn mark_node_unavailable(&self, node_id: NodeId) -> usize {
        let mut inner = self.inner.write();
        let mut count = 0;
        for slot in &mut inner.slots {
            if slot.owner == Some(node_id) && slot.status == SlotStatus::Used {
                slot.status = SlotStatus::Unavailable;
                count += 1;
            }
        }
        if count > 0 {
            info!(node_id, count, "marked blocks unavailable");
        }
        count
    }

    /// The reverse transition, when the owner is heard from again.
    pub fn mark_node_available(&self, node_id: NodeId) -> usize {
        let mut inner = self.inner.write();
        let mut count = 0;
        for slot in &mut inner.slots {
            if slot.owner == Some(node_id) && slot.status == SlotStatus::Unavailable {
                slot.status = SlotStatus::Used;
                count += 1;
            }
        }
        if count > 0 {
            info!(node_id, count, "marked blocks available again");
        }
        count
    }

    /// Wholesale overwrite from a METADATA_SYNC or handshake payload. The id
    /// counter continues past the highest id seen so it stays monotonic.
    pub fn replace_from_sync(&self, slots: Vec<BlockSlot>) {
        let mut inner = self.inner.write();
        let max_id = slots.iter().map(|s| s.block_id).max().unwrap_or(0);
        inner.next_block_id = inner.next_block_id.max(max_id + 1);
        inner.slots = slots;
        debug!(len = inner.slots.len(), "block table synchronized");
    }

    /// (free, used, unavailable) counts.
    pub fn status_counts(&self) -> (usize, usize, usize) {
        let inner = self.inner.read();
        let mut counts = (0, 0, 0);
        for slot in &inner.slots {
            match slot.status {
                SlotStatus::Free => counts.0 += 1,
                SlotStatus::Used => counts.1 += 1,
                SlotStatus::Unavailable => counts.2 += 1,
            }
        }
        counts
    }
}
