// Physical block storage: one `block_<id>.dat` file per slot under the
// shared-space directory.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Context;
use blockmesh_core::BlockId;
use bytes::Bytes;
use tracing::debug;

pub struct BlockStore {
    base_dir: PathBuf,
    capacity_mb: AtomicU32,
}

impl BlockStore {
    pub async fn new(base_dir: PathBuf, capacity_mb: u32) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&base_dir)
            .await
            .with_context(|| format!("error creating blocks directory {base_dir:?}"))?;
        debug!(?base_dir, capacity_mb, "block store ready");
        Ok(Self {
            base_dir,
            capacity_mb: AtomicU32::new(capacity_mb),
        })
    }

    pub fn capacity_mb(&self) -> u32 {
        self.capacity_mb.load(Ordering::Relaxed)
    }

    pub fn set_capacity_mb(&self, capacity_mb: u32) {
        self.capacity_mb.store(capacity_mb, Ordering::Relaxed);
    }

    pub fn block_path(&self, block_id: BlockId) -> PathBuf {
        self.base_dir.join(format!("block_{block_id}.dat"))
    }

    pub async fn write_block(&self, block_id: BlockId, data: &[u8]) -> anyhow::Result<()> {
        let path = self.block_path(block_id);
        tokio::fs::write(&path, data)
            .await
            .with_context(|| format!("error writing block file {path:?}"))?;
        debug!(block_id, len = data.len(), "wrote block");
        Ok(())
    }

    pub async fn read_block(&self, block_id: BlockId) -> anyhow::Result<Option<Bytes>> {
        let path = self.block_path(block_id);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(data.into())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("error reading block file {path:?}")),
        }
    }

    pub async fn has_block(&self, block_id: BlockId) -> bool {
        tokio::fs::try_exists(self.block_path(block_id))
            .await
            .unwrap_or(false)
    }

    pub async fn delete_block(&self, block_id: BlockId) -> anyhow::Result<bool> {
        let path = self.block_path(block_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(block_id, "deleted block");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("error deleting block file {path:?}")),
        }
    }

    /// MiB occupied by block files, rounded down.
    pub async fn used_space_mb(&self) -> u32 {
        let mut total_bytes: u64 = 0;
        let mut entries = match tokio::fs::read_dir(&self.base_dir).await {
            Ok(e) => e,
            Err(_) => return 0,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with("block_") || !name.ends_with(".dat") {
                continue;
            }
            if let Ok(meta) = entry.metadata().await {
                total_bytes += meta.len();
            }
        }
        (total_bytes / (1024 * 1024)) as u32
    }

    pub async fn free_space_mb(&self) -> u32 {
        self.capacity_mb().saturating_sub(self.used_space_mb().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store(dir: &tempfile::TempDir) -> BlockStore {
        BlockStore::new(dir.path().join("blocks"), 50).await.unwrap()
    }

    #[tokio::test]
    async fn test_write_read_delete() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir).await;

        assert_eq!(s.read_block(1).await.unwrap(), None);
        s.write_block(1, b"hello").await.unwrap();
        assert!(s.has_block(1).await);
        assert_eq!(s.read_block(1).await.unwrap().unwrap().as_ref(), b"hello");

        assert!(s.delete_block(1).await.unwrap());
        assert!(!s.delete_block(1).await.unwrap());
        assert_eq!(s.read_block(1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_space_accounting() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir).await;
        assert_eq!(s.used_space_mb().await, 0);
        assert_eq!(s.free_space_mb().await, 50);

        s.write_block(7, &vec![0u8; 2 * 1024 * 1024]).await.unwrap();
        assert_eq!(s.used_space_mb().await, 2);
        assert_eq!(s.free_space_mb().await, 48);

        // Files that are not block files don't count.
        tokio::fs::write(dir.path().join("blocks").join("notes.txt"), b"x")
            .await
            .unwrap();
        assert_eq!(s.used_space_mb().await, 2);
    }
}
