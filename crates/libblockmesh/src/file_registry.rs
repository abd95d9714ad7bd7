use std::collections::HashMap;

use blockmesh_core::FileRecord;
use parking_lot::RwLock;
use tracing::info;

/// In-memory file registry. Callers persist a snapshot through the
/// [`crate::persistence::MetadataStore`] after every mutation.
#[derive(Default)]
pub struct FileRegistry {
    files: RwLock<HashMap<String, FileRecord>>,
}

impl FileRegistry {
    pub fn new(files: HashMap<String, FileRecord>) -> Self {
        Self {
            files: RwLock::new(files),
        }
    }

    pub fn register(&self, file_name: String, record: FileRecord) {
        info!(
            file_name,
            size = record.size,
            num_blocks = record.num_blocks,
            "registered file"
        );
        self.files.write().insert(file_name, record);
    }

    pub fn get(&self, file_name: &str) -> Option<FileRecord> {
        self.files.read().get(file_name).cloned()
    }

    pub fn remove(&self, file_name: &str) -> bool {
        let removed = self.files.write().remove(file_name).is_some();
        if removed {
            info!(file_name, "removed file");
        }
        removed
    }

    pub fn all(&self) -> HashMap<String, FileRecord> {
        self.files.read().clone()
    }

    pub fn replace_from_sync(&self, files: HashMap<String, FileRecord>) {
        let mut guard = self.files.write();
        *guard = files;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> FileRecord {
        FileRecord {
            size: 100,
            num_blocks: 1,
            upload_date: 0.0,
            blocks: vec![1, 2],
        }
    }

    #[test]
    fn test_register_get_remove() {
        let reg = FileRegistry::default();
        reg.register("a.txt".into(), record());
        assert_eq!(reg.get("a.txt").unwrap().blocks, vec![1, 2]);
        assert!(reg.remove("a.txt"));
        assert!(!reg.remove("a.txt"));
        assert!(reg.get("a.txt").is_none());
    }

    #[test]
    fn test_sync_overwrites() {
        let reg = FileRegistry::default();
        reg.register("old.txt".into(), record());

        let mut incoming = HashMap::new();
        incoming.insert("new.txt".to_owned(), record());
        reg.replace_from_sync(incoming.clone());
        assert!(reg.get("old.txt").is_none());
        assert_eq!(reg.all(), incoming);

        // Applying the same payload twice changes nothing.
        reg.replace_from_sync(incoming.clone());
        assert_eq!(reg.all(), incoming);
    }
}
