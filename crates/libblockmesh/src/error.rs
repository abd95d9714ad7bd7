use blockmesh_core::{BlockId, NodeId};
use peer_wire_protocol::WireError;

/// Failures the operation surface distinguishes, so front-ends can render
/// causes instead of a bare boolean.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("capacity configuration rejected: {0}")]
    ConfigInvalid(String),

    #[error("peer {addr} unreachable: {reason}")]
    PeerUnreachable { addr: String, reason: String },

    #[error("peer refused reconnect: group id does not match")]
    GroupMismatch,

    #[error("placement planned originals for {planned} of {needed} blocks")]
    PlanInsufficient { needed: u32, planned: u32 },

    #[error("local I/O on block {block_id}: {error:#}")]
    BlockIoLocal {
        block_id: BlockId,
        error: anyhow::Error,
    },

    #[error("no replica answered for block {block_id} in time")]
    BlockTimeout { block_id: BlockId },

    #[error("no live replica of block {file_block_index} of {file_name}")]
    BlockMissing {
        file_name: String,
        file_block_index: u32,
    },

    #[error("failed sending to node {node_id}")]
    SendFailure { node_id: NodeId },

    #[error("malformed message: {0}")]
    Deserialize(#[from] WireError),

    #[error("unknown file {0:?}")]
    UnknownFile(String),

    #[error("file I/O on {path}: {source}")]
    FileIo {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
