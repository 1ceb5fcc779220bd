//! Recovery tests: restart nodes on their existing stores

mod common;

use common::{build_node, signed_peers, CallCollector, Cluster};
use kayak::storage::{
    DiskStore, Log, LogStore, StableStore, KEY_LAST_COMMITTED, KEY_PEERS_TERM,
};
use kayak::transport::MemoryRouter;
use kayak::{Error, NodeId};
use tempfile::TempDir;

#[test]
fn test_disk_store_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store");

    {
        let store = DiskStore::open(&path).unwrap();
        for i in 1..=3u64 {
            store.append(&Log::new(i, 1, vec![i as u8])).unwrap();
        }
        store.set_u64(KEY_LAST_COMMITTED, 3).unwrap();
        store.sync().unwrap();
    }

    let store = DiskStore::open(&path).unwrap();
    assert_eq!(store.first_index().unwrap(), 1);
    assert_eq!(store.last_index().unwrap(), 3);
    assert_eq!(store.get_u64(KEY_LAST_COMMITTED).unwrap(), 3);
    store.get_log(2).unwrap().verify_hash().unwrap();
    assert!(matches!(
        store.append(&Log::new(5, 1, vec![])),
        Err(Error::NonMonotonicIndex {
            expected: 4,
            got: 5
        })
    ));
}

#[tokio::test]
async fn test_cluster_restart_continues_log() {
    let dir = TempDir::new().unwrap();

    {
        let cluster = Cluster::start(dir.path(), signed_peers(1, 2)).await;
        for i in 1..=3 {
            cluster.leader().runtime.apply(format!("before {}", i)).await.unwrap();
        }
        cluster.shutdown().await;
    }

    let cluster = Cluster::start(dir.path(), signed_peers(1, 2)).await;
    for node in &cluster.nodes {
        let store = node.runtime.store().await.unwrap();
        assert_eq!(store.last_index().unwrap(), 3);
        assert_eq!(store.get_log(1).unwrap().data, b"before 1");
        assert_eq!(store.get_u64(KEY_PEERS_TERM).unwrap(), 1);
    }

    let applied = cluster.leader().runtime.apply("after").await.unwrap();
    assert_eq!(applied.log.index, 4);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_uncommitted_tail_is_dropped_on_restart() {
    let dir = TempDir::new().unwrap();

    {
        let cluster = Cluster::start(dir.path(), signed_peers(1, 2)).await;
        cluster.leader().runtime.apply("committed").await.unwrap();
        cluster.shutdown().await;
    }

    // a crash between propose and commit leaves an entry above last committed
    {
        let store = DiskStore::open(dir.path().join("leader").join("kayak.db")).unwrap();
        store.append(&Log::new(2, 1, b"torn".to_vec())).unwrap();
        store.sync().unwrap();
    }

    let cluster = Cluster::start(dir.path(), signed_peers(1, 2)).await;
    let store = cluster.leader().runtime.store().await.unwrap();
    assert_eq!(store.last_index().unwrap(), 1);
    drop(store);

    let applied = cluster.leader().runtime.apply("next").await.unwrap();
    assert_eq!(applied.log.index, 2);
    assert_eq!(applied.log.data, b"next");
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_stale_peer_set_rejected() {
    let dir = TempDir::new().unwrap();

    {
        let cluster = Cluster::start(dir.path(), signed_peers(2, 1)).await;
        cluster.shutdown().await;
    }

    let router = MemoryRouter::new();
    let collector = CallCollector::new();
    let leader = NodeId::from("leader");

    // older term
    let node = build_node(&router, dir.path(), &leader, signed_peers(1, 1), &collector);
    assert!(matches!(
        node.runtime.init().await,
        Err(Error::StaleConfig {
            accepted: 2,
            got: 1
        })
    ));

    // same term, different membership
    let node = build_node(&router, dir.path(), &leader, signed_peers(2, 2), &collector);
    assert!(matches!(
        node.runtime.init().await,
        Err(Error::StaleConfig {
            accepted: 2,
            got: 2
        })
    ));

    // newer term is accepted
    let node = build_node(&router, dir.path(), &leader, signed_peers(3, 1), &collector);
    node.runtime.init().await.unwrap();
    let store = node.runtime.store().await.unwrap();
    assert_eq!(store.get_u64(KEY_PEERS_TERM).unwrap(), 3);
    drop(store);
    node.runtime.shutdown().await.unwrap();
}
