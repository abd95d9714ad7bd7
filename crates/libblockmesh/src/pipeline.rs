// The file pipeline: split-and-place on upload, gather-and-rebuild on
// download. Remote fetches are correlated through a waiter table instead of
// a polled cache: the downloader registers a oneshot keyed by block id and
// the TCP receive path fulfills it directly.

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use blockmesh_core::constants::BLOCK_FETCH_TIMEOUT;
use blockmesh_core::lengths::FileLengths;
use blockmesh_core::{BlockId, FileRecord, SlotStatus};
use bytes::Bytes;
use dashmap::DashMap;
use peer_wire_protocol as wire;
use peer_wire_protocol::MessageBody;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::session::Shared;

#[derive(Default)]
pub(crate) struct PendingBlocks {
    waiters: DashMap<BlockId, oneshot::Sender<Bytes>>,
}

impl PendingBlocks {
    pub fn register(&self, block_id: BlockId) -> oneshot::Receiver<Bytes> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(block_id, tx);
        rx
    }

    /// Hands incoming bytes to a waiting downloader, if any.
    pub fn fulfill(&self, block_id: BlockId, data: Bytes) -> bool {
        match self.waiters.remove(&block_id) {
            Some((_, tx)) => tx.send(data).is_ok(),
            None => false,
        }
    }

    pub fn cancel(&self, block_id: BlockId) {
        self.waiters.remove(&block_id);
    }
}

fn now_unix() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub(crate) async fn upload(shared: &Arc<Shared>, file_path: &Path) -> Result<()> {
    let file_io = |source: std::io::Error| Error::FileIo {
        path: file_path.display().to_string(),
        source,
    };

    let meta = tokio::fs::metadata(file_path).await.map_err(file_io)?;
    let file_name = file_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            file_io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "path has no file name",
            ))
        })?;
    let lengths = FileLengths::new(meta.len());
    let num_blocks = lengths.num_blocks();
    info!(
        file_name,
        size = meta.len(),
        num_blocks,
        "uploading file"
    );

    let plan = shared
        .planner
        .plan(&shared.nodes, &shared.table, num_blocks, &file_name);
    if !plan.has_all_originals(num_blocks) {
        // Nothing was transferred yet; give the claimed slots back.
        for block_id in plan.block_ids() {
            shared.table.mark_free(block_id);
        }
        return Err(Error::PlanInsufficient {
            needed: num_blocks,
            planned: plan
                .entries
                .iter()
                .filter(|e| e.role == blockmesh_core::BlockRole::Original)
                .count() as u32,
        });
    }

    let buckets = plan.by_index();
    let self_id = shared.self_id();
    let mut file = tokio::fs::File::open(file_path).await.map_err(file_io)?;

    for info in lengths.iter_block_infos() {
        let mut chunk = vec![0u8; info.len as usize];
        file.read_exact(&mut chunk).await.map_err(file_io)?;

        for planned in buckets.get(&info.index).into_iter().flatten() {
            if planned.node_id == self_id {
                shared
                    .store
                    .write_block(planned.block_id, &chunk)
                    .await
                    .map_err(|error| Error::BlockIoLocal {
                        block_id: planned.block_id,
                        error,
                    })?;
                shared.refresh_own_free_space().await;
            } else {
                let envelope = shared.envelope(MessageBody::BlockSend(wire::BlockSend {
                    block_id: planned.block_id,
                    file_name: Some(file_name.clone()),
                    file_block_index: Some(info.index),
                    block_type: Some(planned.role),
                    data: chunk.clone(),
                }));
                // A failed send aborts the upload; blocks already written
                // stay where they are.
                shared.peers.send_to(planned.node_id, &envelope).await?;
            }
        }
    }

    shared.files.register(
        file_name.clone(),
        FileRecord {
            size: meta.len(),
            num_blocks,
            upload_date: now_unix(),
            blocks: plan.block_ids(),
        },
    );
    shared.persist_metadata().await;
    shared.broadcast_metadata_sync().await;
    info!(file_name, "upload complete");
    Ok(())
}

pub(crate) async fn download(
    shared: &Arc<Shared>,
    file_name: &str,
    save_path: &Path,
) -> Result<()> {
    let record = shared
        .files
        .get(file_name)
        .ok_or_else(|| Error::UnknownFile(file_name.to_owned()))?;

    // Accept either a target file path or a directory to drop the file into.
    let target = if tokio::fs::metadata(save_path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
    {
        save_path.join(file_name)
    } else {
        save_path.to_owned()
    };
    let file_io = |source: std::io::Error| Error::FileIo {
        path: target.display().to_string(),
        source,
    };

    let buckets = {
        let mut buckets: std::collections::BTreeMap<u32, Vec<blockmesh_core::BlockSlot>> =
            Default::default();
        for slot in shared.table.blocks_for_file(file_name) {
            if let Some(index) = slot.file_block_index {
                buckets.entry(index).or_default().push(slot);
            }
        }
        buckets
    };

    let self_id = shared.self_id();
    let mut out = tokio::fs::File::create(&target).await.map_err(file_io)?;

    for index in 0..record.num_blocks {
        let mut replicas: Vec<_> = buckets
            .get(&index)
            .map(|v| {
                v.iter()
                    .filter(|s| s.status == SlotStatus::Used)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if replicas.is_empty() {
            return Err(Error::BlockMissing {
                file_name: file_name.to_owned(),
                file_block_index: index,
            });
        }
        // Local replicas first.
        replicas.sort_by_key(|s| s.owner != Some(self_id));

        let mut data: Option<Bytes> = None;
        let mut last_remote: Option<BlockId> = None;
        for slot in &replicas {
            let owner = match slot.owner {
                Some(owner) => owner,
                None => continue,
            };
            if owner == self_id {
                match shared.store.read_block(slot.block_id).await {
                    Ok(Some(bytes)) => {
                        data = Some(bytes);
                        break;
                    }
                    Ok(None) => {
                        warn!(block_id = slot.block_id, "local block missing on disk");
                    }
                    Err(e) => {
                        warn!(block_id = slot.block_id, "local block unreadable: {e:#}");
                    }
                }
                continue;
            }

            // Register the waiter before asking, so the answer can't race us.
            let rx = shared.pending_blocks.register(slot.block_id);
            let request = shared.envelope(MessageBody::BlockRequest(wire::BlockRequest {
                block_id: slot.block_id,
            }));
            if let Err(e) = shared.peers.send_to(owner, &request).await {
                shared.pending_blocks.cancel(slot.block_id);
                debug!(owner, block_id = slot.block_id, "request not sent: {e}");
                continue;
            }
            last_remote = Some(slot.block_id);
            match tokio::time::timeout(BLOCK_FETCH_TIMEOUT, rx).await {
                Ok(Ok(bytes)) => {
                    data = Some(bytes);
                    break;
                }
                _ => {
                    shared.pending_blocks.cancel(slot.block_id);
                    warn!(
                        owner,
                        block_id = slot.block_id,
                        "timed out waiting for block, trying next replica"
                    );
                }
            }
        }

        match data {
            Some(bytes) => out.write_all(&bytes).await.map_err(file_io)?,
            None => {
                return Err(match last_remote {
                    Some(block_id) => Error::BlockTimeout { block_id },
                    None => Error::BlockMissing {
                        file_name: file_name.to_owned(),
                        file_block_index: index,
                    },
                });
            }
        }
    }

    out.flush().await.map_err(file_io)?;
    info!(file_name, target = %target.display(), "download complete");
    Ok(())
}

pub(crate) async fn delete(shared: &Arc<Shared>, file_name: &str) -> Result<()> {
    if shared.files.get(file_name).is_none() {
        return Err(Error::UnknownFile(file_name.to_owned()));
    }

    let self_id = shared.self_id();
    for slot in shared.table.blocks_for_file(file_name) {
        shared.table.mark_free(slot.block_id);
        if slot.owner == Some(self_id) {
            if let Err(e) = shared.store.delete_block(slot.block_id).await {
                warn!(block_id = slot.block_id, "error deleting block file: {e:#}");
            }
        }
    }
    shared.files.remove(file_name);
    shared.persist_metadata().await;
    shared.refresh_own_free_space().await;

    // Tell owners to drop their physical blocks, then converge the tables.
    let notice = shared.envelope(MessageBody::DeleteFile(wire::DeleteFile {
        file_name: file_name.to_owned(),
    }));
    shared.peers.broadcast(&notice, &[]).await;
    shared.broadcast_metadata_sync().await;
    info!(file_name, "deleted file");
    Ok(())
}

/// Incoming BLOCK_SEND: either the answer to one of our BLOCK_REQUESTs, or a
/// placement from someone's upload.
pub(crate) async fn handle_block_send(shared: &Arc<Shared>, msg: wire::BlockSend) {
    let data = Bytes::from(msg.data);
    if shared.pending_blocks.fulfill(msg.block_id, data.clone()) {
        debug!(block_id = msg.block_id, "fulfilled block waiter");
        return;
    }
    if shared.store.has_block(msg.block_id).await {
        debug!(block_id = msg.block_id, "duplicate block send, ignoring");
        return;
    }
    match shared.store.write_block(msg.block_id, &data).await {
        Ok(()) => shared.refresh_own_free_space().await,
        Err(e) => warn!(block_id = msg.block_id, "error storing block: {e:#}"),
    }
}

pub(crate) async fn handle_block_request(
    shared: &Arc<Shared>,
    from: blockmesh_core::NodeId,
    msg: wire::BlockRequest,
) {
    match shared.store.read_block(msg.block_id).await {
        Ok(Some(data)) => {
            let envelope = shared.envelope(MessageBody::BlockSend(wire::BlockSend {
                block_id: msg.block_id,
                file_name: None,
                file_block_index: None,
                block_type: None,
                data: data.to_vec(),
            }));
            if let Err(e) = shared.peers.send_to(from, &envelope).await {
                debug!(to = from, block_id = msg.block_id, "block answer not sent: {e}");
            }
        }
        Ok(None) => warn!(block_id = msg.block_id, "requested block not found locally"),
        Err(e) => warn!(block_id = msg.block_id, "error reading requested block: {e:#}"),
    }
}

/// Incoming DELETE_FILE: drop what we own; the sync that follows fixes the
/// rest of the table.
pub(crate) async fn handle_delete_file(shared: &Arc<Shared>, msg: wire::DeleteFile) {
    let self_id = shared.self_id();
    for slot in shared.table.blocks_for_file(&msg.file_name) {
        if slot.owner == Some(self_id) {
            if let Err(e) = shared.store.delete_block(slot.block_id).await {
                warn!(block_id = slot.block_id, "error deleting block file: {e:#}");
            }
            shared.table.mark_free(slot.block_id);
        }
    }
    shared.files.remove(&msg.file_name);
    shared.persist_metadata().await;
    shared.refresh_own_free_space().await;
    info!(file_name = msg.file_name, "file deleted on peer notice");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_waiter_fulfill_and_cancel() {
        let pending = PendingBlocks::default();
        let rx = pending.register(5);
        assert!(pending.fulfill(5, Bytes::from_static(b"abc")));
        assert_eq!(rx.await.unwrap(), Bytes::from_static(b"abc"));

        // Nobody is waiting anymore.
        assert!(!pending.fulfill(5, Bytes::new()));

        let rx = pending.register(6);
        pending.cancel(6);
        assert!(rx.await.is_err());
    }
}
