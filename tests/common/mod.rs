//! Shared harness: an in-memory cluster whose workers record every call

#![allow(dead_code)]

use async_trait::async_trait;
use kayak::common::{Context, Error, NodeId, Result};
use kayak::peers::{Peers, PrivateKey, Server};
use kayak::transport::{MemoryRouter, NetworkTransport, TransportConfig};
use kayak::{Runtime, RuntimeConfig, TwoPcConfig, Worker};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const PROCESS_TIMEOUT: Duration = Duration::from_secs(5);

/// Ordered record of worker calls across every node
#[derive(Default)]
pub struct CallCollector {
    calls: Mutex<Vec<String>>,
}

impl CallCollector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn append(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }

    pub fn get(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn reset(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn count(&self, call: &str) -> usize {
        self.get().iter().filter(|c| *c == call).count()
    }
}

pub struct RecordingWorker {
    node: String,
    collector: Arc<CallCollector>,
    fail_prepare: AtomicBool,
    fail_commit: AtomicBool,
    prepare_delay: Mutex<Option<Duration>>,
    commit_delay: Mutex<Option<Duration>>,
    /// This node's own calls, with payloads
    calls: Mutex<Vec<(String, Vec<u8>)>>,
}

impl RecordingWorker {
    pub fn new(node: &str, collector: Arc<CallCollector>) -> Arc<Self> {
        Arc::new(Self {
            node: node.to_string(),
            collector,
            fail_prepare: AtomicBool::new(false),
            fail_commit: AtomicBool::new(false),
            prepare_delay: Mutex::new(None),
            commit_delay: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn fail_prepare(&self, fail: bool) {
        self.fail_prepare.store(fail, Ordering::SeqCst);
    }

    pub fn fail_commit(&self, fail: bool) {
        self.fail_commit.store(fail, Ordering::SeqCst);
    }

    pub fn delay_prepare(&self, delay: Duration) {
        *self.prepare_delay.lock().unwrap() = Some(delay);
    }

    /// Commit sleeps after recording, then records "committed" once done
    pub fn delay_commit(&self, delay: Duration) {
        *self.commit_delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> Vec<(String, Vec<u8>)> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: &str, data: &[u8]) {
        self.collector.append(call);
        self.calls
            .lock()
            .unwrap()
            .push((call.to_string(), data.to_vec()));
    }
}

#[async_trait]
impl Worker for RecordingWorker {
    async fn prepare(&self, _ctx: &Context, data: &[u8]) -> Result<()> {
        self.record("prepare", data);
        let delay = *self.prepare_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_prepare.load(Ordering::SeqCst) {
            return Err(Error::Other(format!("{} refused", self.node)));
        }
        Ok(())
    }

    async fn commit(&self, _ctx: &Context, data: &[u8]) -> Result<Vec<u8>> {
        self.record("commit", data);
        let delay = *self.commit_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
            self.record("committed", data);
        }
        if self.fail_commit.load(Ordering::SeqCst) {
            return Err(Error::Other(format!("{} cannot commit", self.node)));
        }
        let mut result = format!("{}:", self.node).into_bytes();
        result.extend_from_slice(data);
        Ok(result)
    }

    async fn rollback(&self, _ctx: &Context, data: &[u8]) -> Result<()> {
        self.record("rollback", data);
        Ok(())
    }
}

/// Fixed operator key so peer digests are stable across restarts
pub fn operator_key() -> PrivateKey {
    PrivateKey::from_bytes(&[
        0xea, 0xf0, 0x2c, 0xa3, 0x48, 0xc5, 0x24, 0xe6, 0x39, 0x26, 0x55, 0xba, 0x4d, 0x29, 0x60,
        0x3c, 0xd1, 0xa7, 0x34, 0x7d, 0x9d, 0x65, 0xcf, 0xe9, 0x3c, 0xe1, 0xeb, 0xff, 0xdc, 0xa2,
        0x26, 0x94,
    ])
}

/// "leader" plus "follower1".."followerN", signed with `operator_key`
pub fn signed_peers(term: u64, followers: usize) -> Peers {
    let mut servers = vec![Server::leader("leader")];
    servers.extend((1..=followers).map(|i| Server::follower(format!("follower{}", i))));
    let mut peers = Peers::new(term, servers);
    peers.sign(&operator_key()).unwrap();
    peers
}

pub struct TestNode {
    pub id: NodeId,
    pub runtime: Runtime,
    pub worker: Arc<RecordingWorker>,
    pub dir: PathBuf,
}

pub fn build_node(
    router: &Arc<MemoryRouter>,
    root: &Path,
    id: &NodeId,
    peers: Peers,
    collector: &Arc<CallCollector>,
) -> TestNode {
    build_node_with_timeout(router, root, id, peers, collector, PROCESS_TIMEOUT)
}

pub fn build_node_with_timeout(
    router: &Arc<MemoryRouter>,
    root: &Path,
    id: &NodeId,
    peers: Peers,
    collector: &Arc<CallCollector>,
    process_timeout: Duration,
) -> TestNode {
    let dir = root.join(id.as_str());
    let transport = Arc::new(NetworkTransport::new(TransportConfig::new(
        id.clone(),
        router.get(id.clone()),
    )));
    let mut config = RuntimeConfig::new(&dir, id.clone(), transport);
    config.process_timeout = process_timeout;

    let worker = RecordingWorker::new(id.as_str(), Arc::clone(collector));
    let runtime = Runtime::new(
        TwoPcConfig {
            runtime: config,
            storage: worker.clone(),
        },
        peers,
    )
    .unwrap();

    TestNode {
        id: id.clone(),
        runtime,
        worker,
        dir,
    }
}

pub struct Cluster {
    pub router: Arc<MemoryRouter>,
    pub collector: Arc<CallCollector>,
    pub nodes: Vec<TestNode>,
}

impl Cluster {
    /// Start every member of `peers`, each under `root/<id>`
    pub async fn start(root: &Path, peers: Peers) -> Cluster {
        Self::start_with_timeout(root, peers, PROCESS_TIMEOUT).await
    }

    pub async fn start_with_timeout(
        root: &Path,
        peers: Peers,
        process_timeout: Duration,
    ) -> Cluster {
        let router = MemoryRouter::new();
        let collector = CallCollector::new();
        let nodes: Vec<TestNode> = peers
            .servers
            .iter()
            .map(|server| {
                build_node_with_timeout(
                    &router,
                    root,
                    &server.id,
                    peers.clone(),
                    &collector,
                    process_timeout,
                )
            })
            .collect();

        for node in &nodes {
            node.runtime.init().await.unwrap();
        }

        Cluster {
            router,
            collector,
            nodes,
        }
    }

    pub fn node(&self, id: &str) -> &TestNode {
        self.nodes
            .iter()
            .find(|n| n.id.as_str() == id)
            .unwrap_or_else(|| panic!("no node {}", id))
    }

    pub fn leader(&self) -> &TestNode {
        self.node("leader")
    }

    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.runtime.shutdown().await.unwrap();
        }
    }
}
