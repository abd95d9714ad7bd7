use std::time::Duration;

/// The unit of storage and transfer. Every block except possibly the last
/// of a file is exactly this long.
pub const BLOCK_SIZE: u32 = 1024 * 1024;

pub const DEFAULT_TCP_PORT: u16 = 8888;
pub const DEFAULT_CAPACITY_MB: u32 = 50;
pub const MIN_CAPACITY_MB: u32 = 50;
pub const MAX_CAPACITY_MB: u32 = 100;

/// Name of the directory under $HOME where block files live.
pub const BLOCKS_DIR_NAME: &str = "espacioCompartido";

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);
/// Three missed heartbeats.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(9);
pub const TIMEOUT_SWEEP_INTERVAL: Duration = Duration::from_secs(3);
pub const MESH_REPAIR_INTERVAL: Duration = Duration::from_secs(5);
/// How long a downloader waits for one replica before trying the next.
pub const BLOCK_FETCH_TIMEOUT: Duration = Duration::from_secs(5);
