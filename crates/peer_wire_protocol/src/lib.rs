// Mesh peer protocol: a closed set of message variants carried as
// `u32 BE length || JSON` frames over TCP, and as bare JSON bodies in UDP
// datagrams (heartbeats only).

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use blockmesh_core::{BlockId, BlockRole, BlockSlot, FileRecord, NodeId, NodeInfo};
use byteorder::{ByteOrder, BE};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

pub const FRAME_HEADER_LEN: usize = 4;

// A block is 1 MiB and travels hex-encoded inside the JSON body, so the
// largest legal frame is a bit over 2 MiB.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Heartbeats are the only datagram traffic and must stay tiny.
pub const MAX_DATAGRAM_LEN: usize = 1024;

#[derive(thiserror::Error, Debug)]
pub enum WireError {
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge(usize),
    #[error("datagram of {0} bytes exceeds the {MAX_DATAGRAM_LEN} byte limit")]
    DatagramTooLarge(usize),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl WireError {
    /// A malformed body is dropped but the length-prefixed framing is still
    /// in sync, so the connection can keep going.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, WireError::Json(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub sender_id: NodeId,
    /// Unix timestamp (seconds) stamped by the sender.
    pub timestamp: f64,
    #[serde(flatten)]
    pub body: MessageBody,
}

impl Envelope {
    pub fn new(sender_id: NodeId, body: MessageBody) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        Self {
            sender_id,
            timestamp,
            body,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum MessageBody {
    #[serde(rename = "CONNECT")]
    Connect(Connect),
    #[serde(rename = "CONNECT_ACK")]
    ConnectAck(ConnectAck),
    #[serde(rename = "RECONNECT")]
    Reconnect(Reconnect),
    #[serde(rename = "RECONNECT_ACK")]
    ReconnectAck(ConnectAck),
    #[serde(rename = "NODE_DISCOVERY")]
    NodeDiscovery(NodeDiscovery),
    #[serde(rename = "BLOCK_REQUEST")]
    BlockRequest(BlockRequest),
    #[serde(rename = "BLOCK_SEND")]
    BlockSend(BlockSend),
    #[serde(rename = "METADATA_SYNC")]
    MetadataSync(MetadataSync),
    #[serde(rename = "DELETE_FILE")]
    DeleteFile(DeleteFile),
    #[serde(rename = "HEARTBEAT")]
    Heartbeat(Heartbeat),
    #[serde(rename = "HEARTBEAT_ACK")]
    HeartbeatAck(Heartbeat),
}

impl MessageBody {
    pub const fn name(&self) -> &'static str {
        match self {
            MessageBody::Connect(_) => "CONNECT",
            MessageBody::ConnectAck(_) => "CONNECT_ACK",
            MessageBody::Reconnect(_) => "RECONNECT",
            MessageBody::ReconnectAck(_) => "RECONNECT_ACK",
            MessageBody::NodeDiscovery(_) => "NODE_DISCOVERY",
            MessageBody::BlockRequest(_) => "BLOCK_REQUEST",
            MessageBody::BlockSend(_) => "BLOCK_SEND",
            MessageBody::MetadataSync(_) => "METADATA_SYNC",
            MessageBody::DeleteFile(_) => "DELETE_FILE",
            MessageBody::Heartbeat(_) => "HEARTBEAT",
            MessageBody::HeartbeatAck(_) => "HEARTBEAT_ACK",
        }
    }
}

/// First message of a fresh join. The sender advertises its listening ports
/// so the rest of the group can dial it back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connect {
    #[serde(default)]
    pub group_id: Option<Uuid>,
    pub capacity_mb: u32,
    pub free_space_mb: u32,
    pub tcp_port: u16,
    pub udp_port: u16,
}

/// First message of a returning peer that still holds its persisted identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reconnect {
    pub node_id: NodeId,
    pub group_id: Uuid,
    pub capacity_mb: u32,
    pub free_space_mb: u32,
    pub tcp_port: u16,
    pub udp_port: u16,
}

/// Full-state response to both CONNECT and RECONNECT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectAck {
    pub node_id: NodeId,
    pub group_id: Uuid,
    pub capacity_mb: u32,
    pub free_space_mb: u32,
    pub all_nodes: Vec<NodeInfo>,
    pub all_files: HashMap<String, FileRecord>,
    pub all_blocks: Vec<BlockSlot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDiscovery {
    pub nodes: Vec<NodeInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRequest {
    pub block_id: BlockId,
}

/// Carries block bytes, both for upload placement and as the answer to a
/// BLOCK_REQUEST. The placement metadata is absent on request answers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockSend {
    pub block_id: BlockId,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_block_index: Option<u32>,
    #[serde(default)]
    pub block_type: Option<BlockRole>,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataSync {
    pub files: HashMap<String, FileRecord>,
    pub blocks: Vec<BlockSlot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteFile {
    pub file_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub node_id: NodeId,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(D::Error::custom)
    }
}

/// Writes one `u32 BE length || JSON` frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
) -> Result<(), WireError> {
    let body = serde_json::to_vec(envelope)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(body.len()));
    }
    let mut header = [0u8; FRAME_HEADER_LEN];
    BE::write_u32(&mut header, body.len() as u32);
    writer.write_all(&header).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. An I/O error (including EOF mid-frame) means the
/// connection is gone; a JSON error means only this message is garbage.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Envelope, WireError> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let len = BE::read_u32(&header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Encodes a UDP body: the same JSON, no length prefix.
pub fn encode_datagram(envelope: &Envelope) -> Result<Vec<u8>, WireError> {
    let body = serde_json::to_vec(envelope)?;
    if body.len() > MAX_DATAGRAM_LEN {
        return Err(WireError::DatagramTooLarge(body.len()));
    }
    Ok(body)
}

pub fn decode_datagram(data: &[u8]) -> Result<Envelope, WireError> {
    Ok(serde_json::from_slice(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect_envelope() -> Envelope {
        Envelope::new(
            1,
            MessageBody::Connect(Connect {
                group_id: None,
                capacity_mb: 50,
                free_space_mb: 50,
                tcp_port: 8888,
                udp_port: 8889,
            }),
        )
    }

    #[test]
    fn test_wire_shape() {
        let v = serde_json::to_value(connect_envelope()).unwrap();
        assert_eq!(v["type"], "CONNECT");
        assert_eq!(v["sender_id"], 1);
        assert_eq!(v["payload"]["capacity_mb"], 50);
        assert!(v["timestamp"].is_f64());
    }

    #[test]
    fn test_block_send_data_is_lowercase_hex() {
        let env = Envelope::new(
            2,
            MessageBody::BlockSend(BlockSend {
                block_id: 9,
                file_name: None,
                file_block_index: None,
                block_type: None,
                data: vec![0xde, 0xad, 0xbe, 0xef],
            }),
        );
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["payload"]["data"], "deadbeef");

        let back: Envelope = serde_json::from_value(v).unwrap();
        match back.body {
            MessageBody::BlockSend(b) => assert_eq!(b.data, vec![0xde, 0xad, 0xbe, 0xef]),
            other => panic!("unexpected body {}", other.name()),
        }
    }

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &connect_envelope()).await.unwrap();
        assert_eq!(
            BE::read_u32(&buf[..4]) as usize,
            buf.len() - FRAME_HEADER_LEN
        );

        let mut reader = &buf[..];
        let env = read_frame(&mut reader).await.unwrap();
        assert_eq!(env.sender_id, 1);
        assert!(matches!(env.body, MessageBody::Connect(_)));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_io_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &connect_envelope()).await.unwrap();
        buf.truncate(buf.len() - 1);
        let mut reader = &buf[..];
        match read_frame(&mut reader).await {
            Err(WireError::Io(_)) => {}
            other => panic!("expected io error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_garbage_body_is_recoverable() {
        let body = b"not json at all";
        let mut buf = vec![0u8; 4];
        BE::write_u32(&mut buf, body.len() as u32);
        buf.extend_from_slice(body);
        let mut reader = &buf[..];
        let err = read_frame(&mut reader).await.unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_heartbeat_fits_datagram() {
        let env = Envelope::new(3, MessageBody::Heartbeat(Heartbeat { node_id: 3 }));
        let data = encode_datagram(&env).unwrap();
        assert!(data.len() <= MAX_DATAGRAM_LEN);
        let back = decode_datagram(&data).unwrap();
        match back.body {
            MessageBody::Heartbeat(h) => assert_eq!(h.node_id, 3),
            other => panic!("unexpected body {}", other.name()),
        }
    }

    #[test]
    fn test_oversized_datagram_rejected() {
        let env = Envelope::new(
            1,
            MessageBody::BlockSend(BlockSend {
                block_id: 1,
                file_name: None,
                file_block_index: None,
                block_type: None,
                data: vec![0u8; 2048],
            }),
        );
        assert!(matches!(
            encode_datagram(&env),
            Err(WireError::DatagramTooLarge(_))
        ));
    }
}
