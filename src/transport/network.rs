//! Request/response transport over a `StreamLayer`
//!
//! Outbound: every `request` dials a fresh stream, writes one request frame
//! and waits for the matching response frame.
//! Inbound: an accept loop spawns one task per connection; each decoded
//! request is pushed to the `process` queue and the task waits for the
//! handler's `send_response` before writing the response frame back.

use super::codec::{self, WireRequest, WireRequestRef, WireResponse};
use super::{Connection, InboundRequest, Reply, StreamLayer, Transport};
use crate::common::{Canceller, Context, Error, NodeId, Result};
use crate::storage::Log;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

const DEFAULT_QUEUE_SIZE: usize = 64;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Transport configuration
pub struct TransportConfig {
    pub local_id: NodeId,
    pub stream: Arc<dyn StreamLayer>,
    /// Inbound requests buffered before connection tasks wait on the consumer
    pub queue_size: usize,
}

impl TransportConfig {
    pub fn new(local_id: impl Into<NodeId>, stream: impl StreamLayer + 'static) -> Self {
        Self {
            local_id: local_id.into(),
            stream: Arc::new(stream),
            queue_size: DEFAULT_QUEUE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Created,
    Running,
    Stopped,
}

struct Inner {
    state: State,
    inbound_tx: Option<mpsc::Sender<InboundRequest>>,
    inbound_rx: Option<mpsc::Receiver<InboundRequest>>,
    accept_task: Option<JoinHandle<()>>,
}

pub struct NetworkTransport {
    config: TransportConfig,
    inner: Mutex<Inner>,
    shutdown: Context,
    stopper: Canceller,
}

impl NetworkTransport {
    pub fn new(config: TransportConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        let (shutdown, stopper) = Context::background().with_cancel();
        Self {
            config,
            inner: Mutex::new(Inner {
                state: State::Created,
                inbound_tx: Some(tx),
                inbound_rx: Some(rx),
                accept_task: None,
            }),
            shutdown,
            stopper,
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.config.local_id
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Transport for NetworkTransport {
    async fn init(&self) -> Result<()> {
        let mut inner = self.inner();
        match inner.state {
            State::Running => return Ok(()),
            State::Stopped => return Err(Error::ShuttingDown),
            State::Created => {}
        }

        let tx = inner
            .inbound_tx
            .clone()
            .ok_or_else(|| Error::Internal("inbound queue closed".into()))?;
        let stream = Arc::clone(&self.config.stream);
        let shutdown = self.shutdown.clone();
        inner.accept_task = Some(tokio::spawn(accept_loop(stream, tx, shutdown)));
        inner.state = State::Running;

        tracing::debug!("Transport {} started", self.config.local_id);
        Ok(())
    }

    async fn request(
        &self,
        ctx: &Context,
        node_id: &NodeId,
        method: &str,
        log: &Log,
    ) -> Result<Vec<u8>> {
        if self.shutdown.err().is_some() {
            return Err(Error::ShuttingDown);
        }

        let call = async {
            let mut conn = self.config.stream.dial(ctx, node_id).await?;
            codec::write_frame(&mut conn, &WireRequestRef { method, log }).await?;
            match codec::read_frame::<_, WireResponse>(&mut conn).await? {
                Some(WireResponse::Ok(payload)) => Ok(payload),
                Some(WireResponse::Err(message)) => Err(Error::Remote(message)),
                None => Err(Error::ConnectionFailed(format!(
                    "{} closed the stream before responding",
                    node_id
                ))),
            }
        };

        tokio::select! {
            biased;
            _ = self.shutdown.done() => Err(Error::ShuttingDown),
            res = ctx.run(call) => res,
        }
    }

    fn process(&self) -> Result<mpsc::Receiver<InboundRequest>> {
        self.inner()
            .inbound_rx
            .take()
            .ok_or_else(|| Error::Internal("inbound queue already has a consumer".into()))
    }

    async fn shutdown(&self) -> Result<()> {
        let accept_task = {
            let mut inner = self.inner();
            if inner.state == State::Stopped {
                return Ok(());
            }
            inner.state = State::Stopped;
            inner.inbound_tx = None;
            inner.accept_task.take()
        };

        self.stopper.cancel();
        self.config.stream.close();

        if let Some(task) = accept_task {
            if let Err(e) = task.await {
                tracing::warn!("Transport accept loop ended abnormally: {}", e);
            }
        }

        tracing::debug!("Transport {} stopped", self.config.local_id);
        Ok(())
    }
}

async fn accept_loop(
    stream: Arc<dyn StreamLayer>,
    tx: mpsc::Sender<InboundRequest>,
    shutdown: Context,
) {
    let mut conns = JoinSet::new();

    loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown.done() => break,
            accepted = stream.accept() => accepted,
        };

        match accepted {
            Ok(conn) => {
                conns.spawn(serve_connection(conn, tx.clone(), shutdown.clone()));
            }
            Err(Error::ShuttingDown) => break,
            Err(e) => {
                tracing::warn!("Accept failed on {}: {}", stream.local_id(), e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }

        while let Some(finished) = conns.try_join_next() {
            if let Err(e) = finished {
                tracing::warn!("Connection task failed: {}", e);
            }
        }
    }

    conns.shutdown().await;
}

async fn serve_connection(
    mut conn: Connection,
    tx: mpsc::Sender<InboundRequest>,
    shutdown: Context,
) {
    let peer = conn.peer_node_id().clone();
    if let Err(e) = serve_requests(&mut conn, &peer, &tx, &shutdown).await {
        tracing::debug!("Connection from {} closed: {}", peer, e);
    }
}

async fn serve_requests(
    conn: &mut Connection,
    peer: &NodeId,
    tx: &mpsc::Sender<InboundRequest>,
    shutdown: &Context,
) -> Result<()> {
    loop {
        let request = tokio::select! {
            biased;
            _ = shutdown.done() => return Ok(()),
            req = codec::read_frame::<_, WireRequest>(conn) => req?,
        };
        let Some(WireRequest { method, log }) = request else {
            return Ok(());
        };

        let (inbound, reply_rx) = InboundRequest::new(peer.clone(), method, log);
        let reply: Reply = tokio::select! {
            biased;
            _ = shutdown.done() => Err(Error::ShuttingDown.to_string()),
            reply = async {
                if tx.send(inbound).await.is_err() {
                    return Err(Error::ShuttingDown.to_string());
                }
                reply_rx
                    .await
                    .unwrap_or_else(|_| Err("request dropped without response".to_string()))
            } => reply,
        };

        codec::write_frame(conn, &WireResponse::from(reply)).await?;
    }
}
