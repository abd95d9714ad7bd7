// On-disk state that survives restarts: the node's group identity and the
// file metadata registry.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Context;
use blockmesh_core::{FileRecord, NodeId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{write_json_atomic, NodePaths};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PersistedIdentity {
    pub node_id: NodeId,
    pub group_id: Uuid,
}

pub async fn load_identity(paths: &NodePaths) -> anyhow::Result<Option<PersistedIdentity>> {
    let path = paths.node_state_file();
    match tokio::fs::read(&path).await {
        Ok(data) => Ok(Some(
            serde_json::from_slice(&data).with_context(|| format!("error parsing {path:?}"))?,
        )),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("error reading {path:?}")),
    }
}

pub async fn save_identity(paths: &NodePaths, identity: &PersistedIdentity) -> anyhow::Result<()> {
    write_json_atomic(&paths.node_state_file(), identity).await
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MetadataFile {
    files: HashMap<String, FileRecord>,
}

/// Backing store for the file registry (`metadata.json`).
#[derive(Debug, Clone)]
pub struct MetadataStore {
    path: PathBuf,
}

impl MetadataStore {
    pub fn new(paths: &NodePaths) -> Self {
        Self {
            path: paths.metadata_file(),
        }
    }

    pub async fn load(&self) -> anyhow::Result<HashMap<String, FileRecord>> {
        match tokio::fs::read(&self.path).await {
            Ok(data) => {
                let parsed: MetadataFile = serde_json::from_slice(&data)
                    .with_context(|| format!("error parsing {:?}", self.path))?;
                Ok(parsed.files)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e).with_context(|| format!("error reading {:?}", self.path)),
        }
    }

    pub async fn save(&self, files: HashMap<String, FileRecord>) -> anyhow::Result<()> {
        write_json_atomic(&self.path, &MetadataFile { files }).await
    }
}
