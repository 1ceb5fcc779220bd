//! Two-phase-commit runner
//!
//! Coordinator side (leader only), one apply at a time:
//!   1. Propose: append the next entry to the local log
//!   2. Prepare: ask every server to stage it; any failure rolls back everywhere
//!   3. Commit: ask every server to apply it; the local result is returned
//!
//! Participant side (every node): a single consumer drains the transport's
//! inbound queue and answers prepare/commit/rollback for the leader.

use super::worker::{Method, Worker};
use crate::common::{Canceller, Context, Error, NodeId, Result};
use crate::peers::Peers;
use crate::storage::{get_u64_or, Log, LogStore, StableStore, KEY_LAST_COMMITTED};
use crate::transport::{InboundRequest, Transport};
use async_trait::async_trait;
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Resources a runner drives, handed over by the runtime at init
#[derive(Clone)]
pub struct RunnerEnv {
    pub local_id: NodeId,
    pub peers: Arc<Peers>,
    pub log_store: Arc<dyn LogStore>,
    pub stable_store: Arc<dyn StableStore>,
    pub transport: Arc<dyn Transport>,
    pub worker: Arc<dyn Worker>,
    pub process_timeout: Duration,
}

/// Outcome of a successful apply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    /// What the local worker returned from commit
    pub result: Vec<u8>,
    pub log: Log,
}

#[async_trait]
pub trait Runner: Send + Sync {
    async fn init(&self, env: RunnerEnv) -> Result<()>;

    async fn apply(&self, data: Vec<u8>) -> Result<Applied>;

    async fn shutdown(&self) -> Result<()>;
}

enum State {
    Created,
    Running {
        shared: Arc<Shared>,
        consumer: JoinHandle<()>,
    },
    Stopped,
}

pub struct TwoPcRunner {
    state: Mutex<State>,
}

impl Default for TwoPcRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl TwoPcRunner {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::Created),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn shared(&self) -> Result<Arc<Shared>> {
        match &*self.state() {
            State::Running { shared, .. } => Ok(Arc::clone(shared)),
            State::Created => Err(Error::Internal("runner not initialized".into())),
            State::Stopped => Err(Error::ShuttingDown),
        }
    }
}

#[async_trait]
impl Runner for TwoPcRunner {
    async fn init(&self, env: RunnerEnv) -> Result<()> {
        let mut state = self.state();
        match *state {
            State::Created => {}
            State::Running { .. } => {
                return Err(Error::Internal("runner already initialized".into()))
            }
            State::Stopped => return Err(Error::ShuttingDown),
        }

        let last_index = recover_log(&env)?;
        let inbound = env.transport.process()?;
        let (closed, closer) = Context::background().with_cancel();
        let shared = Arc::new(Shared {
            env,
            apply_lock: tokio::sync::Mutex::new(last_index),
            closed,
            closer,
        });

        let consumer = tokio::spawn(serve_inbound(Arc::clone(&shared), inbound));
        tracing::debug!(
            "Runner on {} started at log {}",
            shared.env.local_id,
            last_index
        );
        *state = State::Running { shared, consumer };
        Ok(())
    }

    async fn apply(&self, data: Vec<u8>) -> Result<Applied> {
        let shared = self.shared()?;
        shared.apply(data).await
    }

    async fn shutdown(&self) -> Result<()> {
        let previous = std::mem::replace(&mut *self.state(), State::Stopped);
        let State::Running { shared, consumer } = previous else {
            return Ok(());
        };

        shared.closer.cancel();
        if let Err(e) = consumer.await {
            tracing::warn!("Inbound consumer ended abnormally: {}", e);
        }
        // let an in-flight apply unwind before the stores go away
        drop(shared.apply_lock.lock().await);

        tracing::debug!("Runner on {} stopped", shared.env.local_id);
        Ok(())
    }
}

/// Drop any log tail above the last committed index.
fn recover_log(env: &RunnerEnv) -> Result<u64> {
    let last_committed = get_u64_or(env.stable_store.as_ref(), KEY_LAST_COMMITTED, 0)?;
    let last_index = env.log_store.last_index()?;
    if last_index > last_committed {
        tracing::warn!(
            "Truncating uncommitted logs {}..={} on {}",
            last_committed + 1,
            last_index,
            env.local_id
        );
        env.log_store.delete_range(last_committed + 1, last_index)?;
    }
    env.log_store.last_index()
}

struct Shared {
    env: RunnerEnv,
    /// Last proposed index. Held for the whole apply.
    apply_lock: tokio::sync::Mutex<u64>,
    closed: Context,
    closer: Canceller,
}

impl Shared {
    #[tracing::instrument(skip_all, fields(node = %self.env.local_id))]
    async fn apply(&self, data: Vec<u8>) -> Result<Applied> {
        if !self.env.peers.is_leader(&self.env.local_id) {
            return Err(self.not_leader());
        }

        let mut last_index = tokio::select! {
            biased;
            _ = self.closed.done() => return Err(Error::ShuttingDown),
            guard = self.apply_lock.lock() => guard,
        };

        let log = Log::new(*last_index + 1, self.env.peers.term, data);
        self.env.log_store.append(&log)?;
        *last_index = log.index;
        tracing::debug!("Proposed log {}", log.index);

        if let Err(e) = self.prepare(&log).await {
            self.rollback(&log).await;
            match self.truncate_from(log.index) {
                Ok(()) => *last_index = log.index - 1,
                Err(te) => tracing::error!("Failed to truncate log {}: {}", log.index, te),
            }
            if self.closed.err().is_some() {
                return Err(Error::ShuttingDown);
            }
            return Err(e);
        }

        let result = self.commit(&log).await?;
        Ok(Applied { result, log })
    }

    async fn prepare(&self, log: &Log) -> Result<()> {
        let ctx = self.closed.with_timeout(self.env.process_timeout);
        for (node, res) in self.broadcast(&ctx, Method::Prepare, log).await {
            if let Err(e) = res {
                tracing::warn!("Prepare of log {} failed on {}: {}", log.index, node, e);
                return Err(Error::PrepareFailed {
                    index: log.index,
                    node: node.to_string(),
                    reason: e.to_string(),
                });
            }
        }
        tracing::debug!(
            "Log {} prepared on {} servers",
            log.index,
            self.env.peers.len()
        );
        Ok(())
    }

    /// Best effort, sent to every server. Not tied to `closed`: the transport
    /// outlives the runner, and `process_timeout` bounds the wait.
    async fn rollback(&self, log: &Log) {
        let ctx = Context::background().with_timeout(self.env.process_timeout);
        for (node, res) in self.broadcast(&ctx, Method::Rollback, log).await {
            if let Err(e) = res {
                tracing::warn!("Rollback of log {} failed on {}: {}", log.index, node, e);
            }
        }
    }

    /// Runs to completion even when shutdown starts mid-commit.
    async fn commit(&self, log: &Log) -> Result<Vec<u8>> {
        let ctx = Context::background().with_timeout(self.env.process_timeout);
        let mut local = None;
        let mut failure = None;

        for (node, res) in self.broadcast(&ctx, Method::Commit, log).await {
            match res {
                Ok(result) if node == self.env.local_id => local = Some(result),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("Commit of log {} failed on {}: {}", log.index, node, e);
                    if failure.is_none() {
                        failure = Some(Error::CommitFailed {
                            index: log.index,
                            node: node.to_string(),
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }
        tracing::debug!("Log {} committed", log.index);
        local.ok_or_else(|| {
            Error::Internal(format!("{} is not in the peer set", self.env.local_id))
        })
    }

    /// Send `method` to every server concurrently. Results come back in
    /// completion order.
    async fn broadcast(
        &self,
        ctx: &Context,
        method: Method,
        log: &Log,
    ) -> Vec<(NodeId, Result<Vec<u8>>)> {
        let mut calls = self
            .env
            .peers
            .servers
            .iter()
            .map(|server| async move {
                let res = self.call(ctx, &server.id, method, log).await;
                (server.id.clone(), res)
            })
            .collect::<FuturesUnordered<_>>();

        let mut results = Vec::with_capacity(calls.len());
        while let Some(result) = calls.next().await {
            results.push(result);
        }
        results
    }

    async fn call(
        &self,
        ctx: &Context,
        node: &NodeId,
        method: Method,
        log: &Log,
    ) -> Result<Vec<u8>> {
        if *node == self.env.local_id {
            ctx.run(self.handle_local(ctx, method, log)).await
        } else {
            self.env
                .transport
                .request(ctx, node, method.as_str(), log)
                .await
        }
    }

    /// Leader's own participation. The entry is already in the local log.
    async fn handle_local(&self, ctx: &Context, method: Method, log: &Log) -> Result<Vec<u8>> {
        let worker = &self.env.worker;
        match method {
            Method::Prepare => worker.prepare(ctx, &log.data).await.map(|()| Vec::new()),
            Method::Commit => {
                let result = worker.commit(ctx, &log.data).await?;
                self.env
                    .stable_store
                    .set_u64(KEY_LAST_COMMITTED, log.index)?;
                Ok(result)
            }
            Method::Rollback => worker.rollback(ctx, &log.data).await.map(|()| Vec::new()),
        }
    }

    async fn handle_remote(&self, ctx: &Context, req: &InboundRequest) -> Result<Vec<u8>> {
        let method: Method = req.method().parse()?;
        let log = req.log();

        if !self.env.peers.is_leader(req.peer_node_id()) {
            return Err(self.not_leader());
        }
        if log.term != self.env.peers.term {
            return Err(Error::StaleConfig {
                accepted: self.env.peers.term,
                got: log.term,
            });
        }
        log.verify_hash()?;

        let worker = &self.env.worker;
        match method {
            Method::Prepare => {
                self.stage(log)?;
                worker.prepare(ctx, &log.data).await?;
                Ok(Vec::new())
            }
            Method::Commit => {
                let staged = self.env.log_store.get_log(log.index)?;
                if staged.hash != log.hash {
                    return Err(Error::Corrupted(format!(
                        "log {} differs from the prepared entry",
                        log.index
                    )));
                }
                let result = worker.commit(ctx, &log.data).await?;
                self.env
                    .stable_store
                    .set_u64(KEY_LAST_COMMITTED, log.index)?;
                Ok(result)
            }
            Method::Rollback => {
                let res = worker.rollback(ctx, &log.data).await;
                self.truncate_from(log.index)?;
                res.map(|()| Vec::new())
            }
        }
    }

    /// Append a leader's entry, replacing any uncommitted tail at or above it.
    fn stage(&self, log: &Log) -> Result<()> {
        let last_committed = get_u64_or(self.env.stable_store.as_ref(), KEY_LAST_COMMITTED, 0)?;
        if log.index <= last_committed {
            return Err(Error::NonMonotonicIndex {
                expected: last_committed + 1,
                got: log.index,
            });
        }

        let last = self.env.log_store.last_index()?;
        if last >= log.index {
            tracing::warn!(
                "Replacing uncommitted logs {}..={} on {}",
                log.index,
                last,
                self.env.local_id
            );
            self.env.log_store.delete_range(log.index, last)?;
        }
        self.env.log_store.append(log)
    }

    fn truncate_from(&self, index: u64) -> Result<()> {
        let last_committed = get_u64_or(self.env.stable_store.as_ref(), KEY_LAST_COMMITTED, 0)?;
        if index <= last_committed {
            return Err(Error::Internal(format!("log {} is already committed", index)));
        }
        let last = self.env.log_store.last_index()?;
        if last >= index {
            self.env.log_store.delete_range(index, last)?;
        }
        Ok(())
    }

    fn not_leader(&self) -> Error {
        let leader = self
            .env
            .peers
            .leader_id()
            .map(|id| id.to_string())
            .unwrap_or_default();
        Error::NotLeader(leader)
    }
}

async fn serve_inbound(shared: Arc<Shared>, mut inbound: mpsc::Receiver<InboundRequest>) {
    loop {
        let req = tokio::select! {
            biased;
            _ = shared.closed.done() => break,
            req = inbound.recv() => match req {
                Some(req) => req,
                None => break,
            },
        };

        let ctx = shared.closed.with_timeout(shared.env.process_timeout);
        let res = ctx.run(shared.handle_remote(&ctx, &req)).await;
        if let Err(e) = &res {
            tracing::warn!(
                "{} of log {} from {} failed: {}",
                req.method(),
                req.log().index,
                req.peer_node_id(),
                e
            );
        }
        req.send_response(res);
    }
    tracing::debug!("Inbound consumer on {} stopped", shared.env.local_id);
}
