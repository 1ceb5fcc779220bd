//! Node-addressable transport
//!
//! Two layers:
//! - `StreamLayer`: raw connection establishment (`dial` / `accept`), keyed by
//!   `NodeId`. Implemented in-process (`memory`) and over TCP (`tcp`).
//! - `Transport`: correlated request/response on top of a stream layer. The
//!   outbound side is `request`, the inbound side is the `process` queue of
//!   `InboundRequest`s, each answered exactly once with `send_response`.
//!
//! A node is both coordinator and participant, so every runtime uses both
//! halves of the same transport.

pub mod codec;
pub mod memory;
pub mod network;
pub mod tcp;

use crate::common::{Context, NodeId, Result};
use crate::storage::Log;
use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot};

pub use memory::{MemoryRouter, MemoryStream};
pub use network::{NetworkTransport, TransportConfig};
pub use tcp::TcpStreamLayer;

/// Response payload as carried back to the requester
pub type Reply = std::result::Result<Vec<u8>, String>;

/// Byte stream usable as a connection
pub trait AsyncConn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncConn for T {}

/// A byte stream tagged with the node on the other end
pub struct Connection {
    peer: NodeId,
    io: Box<dyn AsyncConn>,
}

impl Connection {
    pub fn new(peer: NodeId, io: impl AsyncConn + 'static) -> Self {
        Self {
            peer,
            io: Box::new(io),
        }
    }

    pub fn peer_node_id(&self) -> &NodeId {
        &self.peer
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("peer", &self.peer).finish()
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

/// Connection establishment between nodes
#[async_trait]
pub trait StreamLayer: Send + Sync {
    fn local_id(&self) -> &NodeId;

    /// Open a stream to `node_id`. A context that is already done fails
    /// immediately and the remote side never sees the attempt.
    async fn dial(&self, ctx: &Context, node_id: &NodeId) -> Result<Connection>;

    /// Wait for the next inbound stream. Fails with `ShuttingDown` once closed.
    async fn accept(&self) -> Result<Connection>;

    /// Stop accepting; pending and future `accept`/`dial` calls fail.
    fn close(&self);
}

/// Request/response transport between nodes
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start serving inbound connections. Idempotent.
    async fn init(&self) -> Result<()>;

    /// Send `method` + `log` to `node_id` and wait for its response.
    /// Not retried; fails with the context error once `ctx` is done.
    async fn request(
        &self,
        ctx: &Context,
        node_id: &NodeId,
        method: &str,
        log: &Log,
    ) -> Result<Vec<u8>>;

    /// Inbound request queue. Has a single consumer: the first call takes it.
    /// The queue ends (`recv` yields `None`) after shutdown.
    fn process(&self) -> Result<mpsc::Receiver<InboundRequest>>;

    /// Stop serving, fail pending requests. Idempotent.
    async fn shutdown(&self) -> Result<()>;
}

/// A request received from a peer, waiting for its response
#[derive(Debug)]
pub struct InboundRequest {
    peer: NodeId,
    method: String,
    log: Log,
    responder: oneshot::Sender<Reply>,
}

impl InboundRequest {
    pub fn new(peer: NodeId, method: String, log: Log) -> (Self, oneshot::Receiver<Reply>) {
        let (responder, rx) = oneshot::channel();
        (
            Self {
                peer,
                method,
                log,
                responder,
            },
            rx,
        )
    }

    pub fn peer_node_id(&self) -> &NodeId {
        &self.peer
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    /// Answer the request. Consumes it, so a request is answered at most once.
    pub fn send_response(self, result: Result<Vec<u8>>) {
        let reply = result.map_err(|e| e.to_string());
        if self.responder.send(reply).is_err() {
            tracing::debug!(
                "Requester {} went away before response to {}",
                self.peer,
                self.method
            );
        }
    }
}
