use std::path::{Path, PathBuf};

use anyhow::Context;
use blockmesh_core::constants::{
    BLOCKS_DIR_NAME, DEFAULT_CAPACITY_MB, DEFAULT_TCP_PORT, MAX_CAPACITY_MB, MIN_CAPACITY_MB,
};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Where one node keeps its state. Passed explicitly everywhere; nothing is
/// ever derived from the binary's install location.
#[derive(Debug, Clone)]
pub struct NodePaths {
    pub config_dir: PathBuf,
    pub blocks_dir: PathBuf,
}

impl NodePaths {
    pub fn new(config_dir: PathBuf, blocks_dir: PathBuf) -> Self {
        Self {
            config_dir,
            blocks_dir,
        }
    }

    /// Default locations: the platform config dir and `$HOME/espacioCompartido`.
    pub fn default_dirs() -> anyhow::Result<Self> {
        let project_dirs = directories::ProjectDirs::from("io", "blockmesh", "blockmesh")
            .context("cannot determine the platform configuration directory")?;
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .context("cannot determine home directory")?;
        Ok(Self {
            config_dir: project_dirs.config_dir().to_owned(),
            blocks_dir: home.join(BLOCKS_DIR_NAME),
        })
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.json")
    }

    pub fn node_state_file(&self) -> PathBuf {
        self.config_dir.join("node_state.json")
    }

    pub fn metadata_file(&self) -> PathBuf {
        self.config_dir.join("metadata.json")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NodeConfig {
    pub capacity_mb: u32,
    pub port: u16,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            capacity_mb: DEFAULT_CAPACITY_MB,
            port: DEFAULT_TCP_PORT,
        }
    }
}

impl NodeConfig {
    pub fn capacity_in_range(capacity_mb: u32) -> bool {
        (MIN_CAPACITY_MB..=MAX_CAPACITY_MB).contains(&capacity_mb)
    }

    /// Loads `config.json`, writing the defaults on first run.
    pub async fn load_or_init(paths: &NodePaths) -> anyhow::Result<Self> {
        let path = paths.config_file();
        match tokio::fs::read(&path).await {
            Ok(data) => serde_json::from_slice(&data)
                .with_context(|| format!("error parsing {path:?}")),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.save(paths).await?;
                info!(?path, "wrote default configuration");
                Ok(config)
            }
            Err(e) => Err(e).with_context(|| format!("error reading {path:?}")),
        }
    }

    pub async fn save(&self, paths: &NodePaths) -> anyhow::Result<()> {
        let path = paths.config_file();
        write_json_atomic(&path, self).await
    }
}

/// Serializes to a temp file then renames over the target, so readers never
/// see a half-written document.
pub(crate) async fn write_json_atomic<T: Serialize>(
    path: &Path,
    value: &T,
) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("error creating directory {parent:?}"))?;
    }
    let tmp = path.with_extension("tmp");
    let data = serde_json::to_vec_pretty(value).context("error serializing")?;
    tokio::fs::write(&tmp, &data)
        .await
        .with_context(|| format!("error writing {tmp:?}"))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("error renaming {tmp:?} to {path:?}"))?;
    Ok(())
}
