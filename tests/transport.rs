//! Transport tests over TCP and the in-memory router

mod common;

use common::{signed_peers, CallCollector, RecordingWorker, PROCESS_TIMEOUT};
use kayak::common::{Context, Error, NodeId};
use kayak::storage::Log;
use kayak::transport::{
    MemoryRouter, NetworkTransport, StreamLayer, TcpStreamLayer, Transport, TransportConfig,
};
use kayak::{Runtime, RuntimeConfig, TwoPcConfig};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

async fn bind(id: &str) -> TcpStreamLayer {
    TcpStreamLayer::bind(
        NodeId::from(id),
        "127.0.0.1:0".parse().unwrap(),
        HashMap::new(),
    )
    .await
    .unwrap()
}

/// Bind one TCP layer per id and give each the full address book.
async fn tcp_layers(ids: &[&str]) -> Vec<TcpStreamLayer> {
    let mut layers = Vec::new();
    for id in ids {
        layers.push(bind(id).await);
    }
    let book: Vec<_> = layers
        .iter()
        .map(|l| (l.local_id().clone(), l.local_addr().unwrap()))
        .collect();
    for layer in &mut layers {
        for (id, addr) in &book {
            layer.add_address(id.clone(), *addr);
        }
    }
    layers
}

#[tokio::test]
async fn test_tcp_request_response() {
    let mut layers = tcp_layers(&["id1", "id2"]).await;
    let t2 = NetworkTransport::new(TransportConfig::new("id2", layers.pop().unwrap()));
    let t1 = NetworkTransport::new(TransportConfig::new("id1", layers.pop().unwrap()));
    t1.init().await.unwrap();
    t2.init().await.unwrap();

    let mut inbound = t2.process().unwrap();
    tokio::spawn(async move {
        while let Some(req) = inbound.recv().await {
            assert_eq!(req.peer_node_id(), &NodeId::from("id1"));
            let mut reply = req.method().as_bytes().to_vec();
            reply.extend_from_slice(&req.log().data);
            req.send_response(Ok(reply));
        }
    });

    let ctx = Context::background();
    for i in 1..=5u64 {
        let log = Log::new(i, 1, format!("payload {}", i).into_bytes());
        let res = t1
            .request(&ctx, &NodeId::from("id2"), "prepare", &log)
            .await
            .unwrap();
        assert_eq!(res, format!("preparepayload {}", i).into_bytes());
    }

    t1.shutdown().await.unwrap();
    t2.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_tcp_expired_deadline() {
    let mut layers = tcp_layers(&["id1", "id2"]).await;
    let t2 = NetworkTransport::new(TransportConfig::new("id2", layers.pop().unwrap()));
    let t1 = NetworkTransport::new(TransportConfig::new("id1", layers.pop().unwrap()));
    t2.init().await.unwrap();
    let _inbound = t2.process().unwrap();

    let ctx = Context::background().with_timeout(Duration::from_millis(1));
    tokio::time::sleep(Duration::from_millis(5)).await;
    let res = t1
        .request(&ctx, &NodeId::from("id2"), "prepare", &Log::new(1, 1, vec![]))
        .await;
    assert!(matches!(res, Err(Error::DeadlineExceeded)));

    t2.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_tcp_unreachable_peer() {
    let layer = bind("id1").await;
    let dead = {
        let gone = bind("gone").await;
        gone.local_addr().unwrap()
    };
    let mut layer = layer;
    layer.add_address(NodeId::from("gone"), dead);
    let t1 = NetworkTransport::new(TransportConfig::new("id1", layer));

    let ctx = Context::background().with_timeout(Duration::from_secs(2));
    let res = t1
        .request(&ctx, &NodeId::from("gone"), "prepare", &Log::new(1, 1, vec![]))
        .await;
    assert!(matches!(res, Err(Error::ConnectionFailed(_))));
    assert!(res.unwrap_err().is_retryable());
}

#[tokio::test]
async fn test_memory_shutdown_during_pending_accept_and_process() {
    let router = MemoryRouter::new();
    let transport = NetworkTransport::new(TransportConfig::new("id1", router.get("id1")));
    transport.init().await.unwrap();
    let mut inbound = transport.process().unwrap();

    let consumer = tokio::spawn(async move { inbound.recv().await.is_none() });
    tokio::time::sleep(Duration::from_millis(20)).await;

    tokio::time::timeout(Duration::from_secs(1), transport.shutdown())
        .await
        .expect("shutdown must not hang")
        .unwrap();
    assert!(tokio::time::timeout(Duration::from_secs(1), consumer)
        .await
        .unwrap()
        .unwrap());
}

#[tokio::test]
async fn test_cluster_over_tcp() {
    let dir = TempDir::new().unwrap();
    let peers = signed_peers(1, 2);
    let collector = CallCollector::new();
    let layers = tcp_layers(&["leader", "follower1", "follower2"]).await;

    let mut runtimes = Vec::new();
    for layer in layers {
        let id = layer.local_id().clone();
        let transport = Arc::new(NetworkTransport::new(TransportConfig::new(id.clone(), layer)));
        let mut config = RuntimeConfig::new(dir.path().join(id.as_str()), id.clone(), transport);
        config.process_timeout = PROCESS_TIMEOUT;
        let runtime = Runtime::new(
            TwoPcConfig {
                runtime: config,
                storage: RecordingWorker::new(id.as_str(), Arc::clone(&collector)),
            },
            peers.clone(),
        )
        .unwrap();
        runtime.init().await.unwrap();
        runtimes.push(runtime);
    }

    let leader = &runtimes[0];
    assert!(leader.is_leader());
    for i in 1..=3u64 {
        let applied = leader.apply(format!("tcp {}", i)).await.unwrap();
        assert_eq!(applied.log.index, i);
        assert_eq!(applied.result, format!("leader:tcp {}", i).into_bytes());
    }
    assert_eq!(collector.count("prepare"), 9);
    assert_eq!(collector.count("commit"), 9);

    for runtime in &runtimes {
        runtime.shutdown().await.unwrap();
    }
}
