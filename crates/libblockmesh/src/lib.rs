//!
//! The core of a symmetric peer-to-peer block-storage node: a full-mesh TCP
//! overlay with UDP failure detection, a replicated view of nodes, files and
//! block placement, and a pipeline that splits files into 1 MiB blocks
//! replicated across the group.
//!
//! The main type to start off with is [`Session`].

mod block_store;
mod block_table;
mod config;
mod error;
mod file_registry;
mod heartbeat;
mod node_registry;
mod persistence;
mod pipeline;
mod placement;
mod session;
mod transport;

pub use config::{NodeConfig, NodePaths};
pub use error::{Error, Result};
pub use node_registry::{NodeEntry, NodeStatus};
pub use persistence::PersistedIdentity;
pub use session::{Session, SessionOptions};

pub use blockmesh_core::{BlockId, BlockRole, BlockSlot, FileRecord, NodeId, NodeInfo, SlotStatus};

/// The cargo version of libblockmesh.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
