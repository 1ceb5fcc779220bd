//! In-process stream layer
//!
//! `MemoryRouter` is a registry mapping each node ID to its inbound queue.
//! `dial` hands one end of a duplex pipe to the target's queue and waits until
//! the target accepts it, so both sides block until matched. Dialing a node
//! that never registered or has closed fails with `ConnectionFailed`.

use super::{Connection, StreamLayer};
use crate::common::{Canceller, Context, Error, NodeId, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};

const PIPE_BUFFER: usize = 64 * 1024;

struct PendingConn {
    conn: Connection,
    accepted: oneshot::Sender<()>,
}

struct InboundQueue {
    tx: mpsc::UnboundedSender<PendingConn>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<PendingConn>>,
    /// The owning endpoint's close signal
    closed: Context,
}

impl InboundQueue {
    fn new(closed: Context) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            closed,
        }
    }
}

/// Registry of in-process nodes
#[derive(Default)]
pub struct MemoryRouter {
    queues: Mutex<HashMap<NodeId, Arc<InboundQueue>>>,
}

impl MemoryRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<NodeId, Arc<InboundQueue>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inbound queue of a registered, open endpoint
    fn route(&self, id: &NodeId) -> Option<Arc<InboundQueue>> {
        self.queues()
            .get(id)
            .filter(|queue| queue.closed.err().is_none())
            .cloned()
    }

    fn unregister(&self, id: &NodeId, queue: &Arc<InboundQueue>) {
        let mut queues = self.queues();
        if queues.get(id).is_some_and(|current| Arc::ptr_eq(current, queue)) {
            queues.remove(id);
        }
    }

    /// Register a new endpoint for `id`, replacing any earlier one.
    pub fn get(self: &Arc<Self>, id: impl Into<NodeId>) -> MemoryStream {
        let local = id.into();
        let (closed, closer) = Context::background().with_cancel();
        let queue = Arc::new(InboundQueue::new(closed.clone()));
        if self
            .queues()
            .insert(local.clone(), Arc::clone(&queue))
            .is_some()
        {
            tracing::debug!("Replaced in-memory endpoint {}", local);
        }
        MemoryStream {
            local,
            router: Arc::clone(self),
            queue,
            closed,
            closer,
        }
    }
}

/// One node's endpoint on a `MemoryRouter`
pub struct MemoryStream {
    local: NodeId,
    router: Arc<MemoryRouter>,
    queue: Arc<InboundQueue>,
    closed: Context,
    closer: Canceller,
}

#[async_trait]
impl StreamLayer for MemoryStream {
    fn local_id(&self) -> &NodeId {
        &self.local
    }

    async fn dial(&self, ctx: &Context, node_id: &NodeId) -> Result<Connection> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        if self.closed.err().is_some() {
            return Err(Error::ShuttingDown);
        }

        let target = self
            .router
            .route(node_id)
            .ok_or_else(|| Error::ConnectionFailed(format!("no route to {}", node_id)))?;

        let (client, server) = tokio::io::duplex(PIPE_BUFFER);
        let (accepted_tx, accepted_rx) = oneshot::channel();
        target
            .tx
            .send(PendingConn {
                conn: Connection::new(self.local.clone(), server),
                accepted: accepted_tx,
            })
            .map_err(|_| Error::ConnectionFailed(format!("no route to {}", node_id)))?;

        ctx.run(async {
            tokio::select! {
                biased;
                _ = self.closed.done() => Err(Error::ShuttingDown),
                accepted = accepted_rx => accepted
                    .map_err(|_| Error::ConnectionFailed(format!("{} dropped the dial", node_id))),
                _ = target.closed.done() => Err(Error::ConnectionFailed(format!("{} closed", node_id))),
            }
        })
        .await?;

        Ok(Connection::new(node_id.clone(), client))
    }

    async fn accept(&self) -> Result<Connection> {
        let mut rx = tokio::select! {
            biased;
            _ = self.closed.done() => return Err(Error::ShuttingDown),
            rx = self.queue.rx.lock() => rx,
        };

        loop {
            let pending = tokio::select! {
                biased;
                _ = self.closed.done() => return Err(Error::ShuttingDown),
                pending = rx.recv() => pending,
            };

            let Some(pending) = pending else {
                return Err(Error::ShuttingDown);
            };
            // a failed send means the dialer gave up before we got here
            if pending.accepted.send(()).is_ok() {
                return Ok(pending.conn);
            }
        }
    }

    fn close(&self) {
        self.closer.cancel();
        self.router.unregister(&self.local, &self.queue);
    }
}
