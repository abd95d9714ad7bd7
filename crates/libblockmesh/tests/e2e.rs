// End-to-end scenarios on loopback sockets with ephemeral ports: group
// formation, upload/download round-trips, failure detection, reconnect and
// delete propagation.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use libblockmesh::{
    BlockRole, Error, NodePaths, NodeStatus, Session, SessionOptions, SlotStatus,
};
use tempfile::TempDir;

struct TestNode {
    session: Arc<Session>,
    dir: TempDir,
}

impl TestNode {
    async fn spawn(capacity_mb: u32) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::with_opts(
            paths_in(&dir),
            SessionOptions {
                listen_port: Some(0),
                capacity_mb: Some(capacity_mb),
            },
        )
        .await
        .unwrap();
        Self { session, dir }
    }

    /// Starts a fresh session over the same directories, as after a process
    /// restart.
    async fn respawn(&self) -> Arc<Session> {
        Session::with_opts(
            paths_in(&self.dir),
            SessionOptions {
                listen_port: Some(0),
                capacity_mb: None,
            },
        )
        .await
        .unwrap()
    }

    fn addr(&self) -> SocketAddr {
        SocketAddr::new(Ipv4Addr::LOCALHOST.into(), self.session.tcp_port())
    }

    fn blocks_dir(&self) -> PathBuf {
        self.dir.path().join("blocks")
    }

    fn block_file_count(&self) -> usize {
        match std::fs::read_dir(self.blocks_dir()) {
            Ok(entries) => entries
                .flatten()
                .filter(|e| {
                    let name = e.file_name();
                    let name = name.to_string_lossy().into_owned();
                    name.starts_with("block_") && name.ends_with(".dat")
                })
                .count(),
            Err(_) => 0,
        }
    }
}

fn paths_in(dir: &TempDir) -> NodePaths {
    NodePaths::new(dir.path().join("cfg"), dir.path().join("blocks"))
}

async fn wait_for(what: &str, timeout: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn test_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn write_test_file(dir: &TempDir, name: &str, len: usize) -> PathBuf {
    let path = dir.path().join(name);
    tokio::fs::write(&path, test_bytes(len)).await.unwrap();
    path
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fresh_group_forms() {
    let a = TestNode::spawn(50).await;
    let b = TestNode::spawn(60).await;

    b.session.connect_to_addr(a.addr()).await.unwrap();

    assert_eq!(a.session.node_id(), 1);
    assert_eq!(b.session.node_id(), 2);
    let group = a.session.group_id().expect("listener minted a group");
    assert_eq!(b.session.group_id(), Some(group));

    wait_for("both block tables at 110", Duration::from_secs(5), || {
        a.session.list_blocks().len() == 110 && b.session.list_blocks().len() == 110
    })
    .await;

    assert!(a.session.is_connected());
    assert!(b.session.is_connected());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_upload_download_roundtrip() {
    let a = TestNode::spawn(50).await;
    let b = TestNode::spawn(60).await;
    b.session.connect_to_addr(a.addr()).await.unwrap();

    // Three blocks, the last one truncated.
    let len = 2 * 1024 * 1024 + 512 * 1024;
    let src = write_test_file(&b.dir, "hello.bin", len).await;
    b.session.upload(&src).await.unwrap();

    let record = b.session.list_files().remove("hello.bin").unwrap();
    assert_eq!(record.size, len as u64);
    assert_eq!(record.num_blocks, 3);

    wait_for("file record replicated to A", Duration::from_secs(5), || {
        a.session.list_files().contains_key("hello.bin")
    })
    .await;

    // One original and one copy per chunk, never on the same owner.
    let slots: Vec<_> = b
        .session
        .list_blocks()
        .into_iter()
        .filter(|s| s.file_name.as_deref() == Some("hello.bin"))
        .collect();
    assert_eq!(slots.len(), 6);
    for index in 0..3u32 {
        let replicas: Vec<_> = slots
            .iter()
            .filter(|s| s.file_block_index == Some(index))
            .collect();
        assert_eq!(replicas.len(), 2);
        let originals = replicas
            .iter()
            .filter(|s| s.role == Some(BlockRole::Original))
            .count();
        assert_eq!(originals, 1);
        assert!(replicas.iter().all(|s| s.status == SlotStatus::Used));
        assert_ne!(replicas[0].owner, replicas[1].owner);
    }

    // Either peer can rebuild the file.
    let out_a = a.dir.path().join("out");
    tokio::fs::create_dir_all(&out_a).await.unwrap();
    a.session.download("hello.bin", &out_a).await.unwrap();
    let bytes = tokio::fs::read(out_a.join("hello.bin")).await.unwrap();
    assert_eq!(bytes, test_bytes(len));

    let out_b = b.dir.path().join("rebuilt.bin");
    b.session.download("hello.bin", &out_b).await.unwrap();
    let bytes = tokio::fs::read(&out_b).await.unwrap();
    assert_eq!(bytes, test_bytes(len));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_file_download_and_delete() {
    let a = TestNode::spawn(50).await;
    match a.session.download("nope.bin", a.dir.path()).await {
        Err(Error::UnknownFile(name)) => assert_eq!(name, "nope.bin"),
        other => panic!("expected UnknownFile, got {other:?}"),
    }
    assert!(matches!(
        a.session.delete("nope.bin").await,
        Err(Error::UnknownFile(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_solo_upload_is_degraded() {
    let a = TestNode::spawn(50).await;
    let src = write_test_file(&a.dir, "solo.bin", 1024).await;

    // A lone node is its own only candidate: the original lands locally and
    // the copy has nowhere to go.
    a.session.upload(&src).await.unwrap();
    assert!(a.session.list_files().contains_key("solo.bin"));
    let slots: Vec<_> = a
        .session
        .list_blocks()
        .into_iter()
        .filter(|s| s.file_name.as_deref() == Some("solo.bin"))
        .collect();
    assert_eq!(slots.len(), 1);
    assert_eq!(slots[0].role, Some(BlockRole::Original));
    assert_eq!(slots[0].owner, Some(1));

    // And the single replica still serves a download.
    let out = a.dir.path().join("solo-out.bin");
    a.session.download("solo.bin", &out).await.unwrap();
    assert_eq!(tokio::fs::read(&out).await.unwrap(), test_bytes(1024));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_delete_propagates() {
    let a = TestNode::spawn(50).await;
    let b = TestNode::spawn(60).await;
    b.session.connect_to_addr(a.addr()).await.unwrap();

    let len = 2 * 1024 * 1024;
    let src = write_test_file(&b.dir, "gone.bin", len).await;
    b.session.upload(&src).await.unwrap();
    wait_for("file replicated to A", Duration::from_secs(5), || {
        a.session.list_files().contains_key("gone.bin") && a.block_file_count() > 0
    })
    .await;

    b.session.delete("gone.bin").await.unwrap();

    wait_for("registries and disks drained", Duration::from_secs(5), || {
        !a.session.list_files().contains_key("gone.bin")
            && !b.session.list_files().contains_key("gone.bin")
            && a.block_file_count() == 0
            && b.block_file_count() == 0
    })
    .await;

    // Every slot the file occupied is free again on both peers.
    for session in [&a.session, &b.session] {
        assert!(session
            .list_blocks()
            .iter()
            .all(|s| s.file_name.is_none() && s.status != SlotStatus::Unavailable));
    }
}

// Covers the offline and rejoin scenarios end to end: the timeout sweep, the
// unavailable flip, a download that survives on local replicas, and a
// RECONNECT that restores the peer's identity and its blocks.
#[tokio::test(flavor = "multi_thread")]
async fn test_peer_offline_then_reconnect() {
    let a = TestNode::spawn(50).await;
    let b = TestNode::spawn(60).await;
    b.session.connect_to_addr(a.addr()).await.unwrap();

    let len = 2 * 1024 * 1024;
    let src = write_test_file(&b.dir, "survivor.bin", len).await;
    b.session.upload(&src).await.unwrap();
    wait_for("file replicated to A", Duration::from_secs(5), || {
        a.session.list_files().contains_key("survivor.bin")
    })
    .await;

    let group = a.session.group_id().unwrap();
    a.session.stop();

    // Three missed heartbeats plus a sweep tick.
    wait_for("A marked offline on B", Duration::from_secs(20), || {
        b.session
            .list_nodes()
            .iter()
            .any(|e| e.info.node_id == 1 && e.status == NodeStatus::Offline)
    })
    .await;
    wait_for("A's blocks parked", Duration::from_secs(5), || {
        let blocks = b.session.list_blocks();
        let a_owned: Vec<_> = blocks.iter().filter(|s| s.owner == Some(1)).collect();
        !a_owned.is_empty() && a_owned.iter().all(|s| s.status == SlotStatus::Unavailable)
    })
    .await;

    // B still holds one replica of every chunk.
    let out = b.dir.path().join("rebuilt.bin");
    b.session.download("survivor.bin", &out).await.unwrap();
    assert_eq!(tokio::fs::read(&out).await.unwrap(), test_bytes(len));

    // Restart A from its persisted state and rejoin.
    let a2 = a.respawn().await;
    assert_eq!(a2.node_id(), 1);
    assert_eq!(a2.group_id(), Some(group));
    a2.connect_to_addr(b.addr()).await.unwrap();

    wait_for("A online again on B", Duration::from_secs(5), || {
        b.session
            .list_nodes()
            .iter()
            .any(|e| e.info.node_id == 1 && e.status == NodeStatus::Online)
    })
    .await;
    wait_for("A's blocks usable again", Duration::from_secs(5), || {
        b.session
            .list_blocks()
            .iter()
            .filter(|s| s.owner == Some(1))
            .all(|s| s.status == SlotStatus::Used)
    })
    .await;

    // The rejoined node can serve downloads again.
    let out = a2
        .download("survivor.bin", a.dir.path())
        .await;
    out.unwrap();
    a2.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reconnect_group_mismatch_rejected() {
    let a = TestNode::spawn(50).await;
    let b = TestNode::spawn(50).await;
    b.session.connect_to_addr(a.addr()).await.unwrap();

    let c = TestNode::spawn(50).await;
    let d = TestNode::spawn(50).await;
    d.session.connect_to_addr(c.addr()).await.unwrap();

    // D belongs to another group; its reconnect must be refused with no
    // state change on A.
    let nodes_before = a.session.list_nodes().len();
    match d.session.connect_to_addr(a.addr()).await {
        Err(Error::GroupMismatch) => {}
        other => panic!("expected GroupMismatch, got {other:?}"),
    }
    assert_eq!(a.session.list_nodes().len(), nodes_before);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reconnect_to_silent_peer_times_out() {
    let a = TestNode::spawn(50).await;
    let b = TestNode::spawn(50).await;
    b.session.connect_to_addr(a.addr()).await.unwrap();

    // A peer that accepts the socket but never answers the handshake. That
    // is a timeout, not a reconnect refusal.
    let silent = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .unwrap();
    let silent_addr = silent.local_addr().unwrap();
    tokio::spawn(async move {
        let (_stream, _) = silent.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
    });

    assert!(b.session.group_id().is_some());
    match b.session.connect_to_addr(silent_addr).await {
        Err(Error::PeerUnreachable { reason, .. }) => {
            assert!(reason.contains("timed out"), "unexpected reason {reason:?}");
        }
        other => panic!("expected PeerUnreachable, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_third_node_meshes_via_discovery() {
    let a = TestNode::spawn(50).await;
    let b = TestNode::spawn(50).await;
    b.session.connect_to_addr(a.addr()).await.unwrap();

    let c = TestNode::spawn(50).await;
    c.session.connect_to_addr(a.addr()).await.unwrap();
    assert_eq!(c.session.node_id(), 3);

    // Discovery makes C dial B directly; B learns about C from that dial.
    wait_for("full mesh of three", Duration::from_secs(10), || {
        b.session.list_nodes().len() == 3 && c.session.list_nodes().len() == 3
    })
    .await;
    wait_for("tables sized to 150 everywhere", Duration::from_secs(10), || {
        [&a.session, &b.session, &c.session]
            .iter()
            .all(|s| s.list_blocks().len() == 150)
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_capacity_guard() {
    let a = TestNode::spawn(50).await;

    assert!(matches!(
        a.session.set_capacity(49).await,
        Err(Error::ConfigInvalid(_))
    ));
    assert!(matches!(
        a.session.set_capacity(101).await,
        Err(Error::ConfigInvalid(_))
    ));

    a.session.set_capacity(80).await.unwrap();
    assert_eq!(a.session.list_blocks().len(), 80);

    // While connected the capacity is frozen.
    let b = TestNode::spawn(50).await;
    b.session.connect_to_addr(a.addr()).await.unwrap();
    match a.session.set_capacity(90).await {
        Err(Error::ConfigInvalid(reason)) => assert!(reason.contains("connected")),
        other => panic!("expected ConfigInvalid, got {other:?}"),
    }
}
