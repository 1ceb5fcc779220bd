//! Node runtime
//!
//! Owns the node's store (opened under `root_dir`), validates the peer set,
//! and wires transport, runner and worker together.

use super::runner::{Applied, Runner, RunnerEnv, TwoPcRunner};
use super::worker::Worker;
use crate::common::{Error, NodeId, Result};
use crate::peers::Peers;
use crate::storage::{DiskStore, StableStore, KEY_PEERS_DIGEST, KEY_PEERS_TERM};
use crate::transport::Transport;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Store directory under the runtime's root dir
pub const STORE_DIR: &str = "kayak.db";

pub const DEFAULT_PROCESS_TIMEOUT: Duration = Duration::from_millis(800);

pub struct RuntimeConfig {
    pub root_dir: PathBuf,
    pub local_id: NodeId,
    pub runner: Arc<dyn Runner>,
    pub transport: Arc<dyn Transport>,
    /// Bound on each 2PC phase
    pub process_timeout: Duration,
}

impl RuntimeConfig {
    /// Config with a `TwoPcRunner` and the default phase timeout
    pub fn new(
        root_dir: impl Into<PathBuf>,
        local_id: impl Into<NodeId>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            root_dir: root_dir.into(),
            local_id: local_id.into(),
            runner: Arc::new(TwoPcRunner::new()),
            transport,
            process_timeout: DEFAULT_PROCESS_TIMEOUT,
        }
    }
}

pub struct TwoPcConfig {
    pub runtime: RuntimeConfig,
    /// Local state machine
    pub storage: Arc<dyn Worker>,
}

enum State {
    Created,
    Running(Arc<DiskStore>),
    Stopped,
}

pub struct Runtime {
    config: TwoPcConfig,
    peers: Arc<Peers>,
    state: Mutex<State>,
}

impl Runtime {
    pub fn new(config: TwoPcConfig, peers: Peers) -> Result<Self> {
        if config.runtime.local_id.is_empty() {
            return Err(Error::InvalidConfig("local node id is empty".into()));
        }
        if config.runtime.process_timeout.is_zero() {
            return Err(Error::InvalidConfig("process timeout must be positive".into()));
        }
        Ok(Self {
            config,
            peers: Arc::new(peers),
            state: Mutex::new(State::Created),
        })
    }

    pub fn local_id(&self) -> &NodeId {
        &self.config.runtime.local_id
    }

    pub fn peers(&self) -> &Peers {
        &self.peers
    }

    pub fn is_leader(&self) -> bool {
        self.peers.is_leader(self.local_id())
    }

    /// Verify membership, open the store and start serving. Idempotent.
    pub async fn init(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        match *state {
            State::Running(_) => return Ok(()),
            State::Stopped => return Err(Error::ShuttingDown),
            State::Created => {}
        }

        let runtime = &self.config.runtime;
        self.peers.verify()?;
        let role = self
            .peers
            .find(&runtime.local_id)
            .map(|server| server.role)
            .ok_or_else(|| {
                Error::MalformedConfig(format!(
                    "{} is not a member of term {}",
                    runtime.local_id, self.peers.term
                ))
            })?;

        std::fs::create_dir_all(&runtime.root_dir)?;
        let store = Arc::new(DiskStore::open(runtime.root_dir.join(STORE_DIR))?);
        accept_peers(&*store, &self.peers)?;

        runtime.transport.init().await?;
        let env = RunnerEnv {
            local_id: runtime.local_id.clone(),
            peers: Arc::clone(&self.peers),
            log_store: store.clone(),
            stable_store: store.clone(),
            transport: Arc::clone(&runtime.transport),
            worker: Arc::clone(&self.config.storage),
            process_timeout: runtime.process_timeout,
        };
        if let Err(e) = runtime.runner.init(env).await {
            if let Err(se) = runtime.transport.shutdown().await {
                tracing::warn!("Transport shutdown after failed init: {}", se);
            }
            return Err(e);
        }

        tracing::info!(
            "Runtime {} ready: {} of term {} ({} servers)",
            runtime.local_id,
            role,
            self.peers.term,
            self.peers.len()
        );
        *state = State::Running(store);
        Ok(())
    }

    /// Replicate `data` to every server. Leader only.
    pub async fn apply(&self, data: impl Into<Vec<u8>>) -> Result<Applied> {
        match *self.state.lock().await {
            State::Running(_) => {}
            State::Created => return Err(Error::Internal("runtime not initialized".into())),
            State::Stopped => return Err(Error::ShuttingDown),
        }
        self.config.runtime.runner.apply(data.into()).await
    }

    /// The node's store, while running
    pub async fn store(&self) -> Option<Arc<DiskStore>> {
        match &*self.state.lock().await {
            State::Running(store) => Some(Arc::clone(store)),
            _ => None,
        }
    }

    /// Stop the runner and transport, then flush the store. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let State::Running(store) = std::mem::replace(&mut *state, State::Stopped) else {
            return Ok(());
        };

        let runtime = &self.config.runtime;
        let runner_res = runtime.runner.shutdown().await;
        let transport_res = runtime.transport.shutdown().await;
        store.sync()?;

        tracing::info!("Runtime {} stopped", runtime.local_id);
        runner_res.and(transport_res)
    }
}

/// Persist `peers` as the accepted config unless an older or conflicting one
/// is presented. Restarting with the accepted config is allowed.
fn accept_peers(store: &dyn StableStore, peers: &Peers) -> Result<()> {
    let digest = peers.digest()?;
    match store.get_u64(KEY_PEERS_TERM) {
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e),
        Ok(accepted) if peers.term < accepted => {
            return Err(Error::StaleConfig {
                accepted,
                got: peers.term,
            })
        }
        Ok(accepted) if peers.term == accepted => {
            let stored = store.get(KEY_PEERS_DIGEST)?;
            if stored.as_slice() != &digest.as_bytes()[..] {
                return Err(Error::StaleConfig {
                    accepted,
                    got: peers.term,
                });
            }
            return Ok(());
        }
        Ok(accepted) => {
            tracing::info!("Accepting peer set term {} (was {})", peers.term, accepted)
        }
    }

    store.set(KEY_PEERS_DIGEST, digest.as_bytes())?;
    store.set_u64(KEY_PEERS_TERM, peers.term)
}
