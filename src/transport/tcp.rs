//! TCP stream layer
//!
//! Nodes are reached through a static address book. The dialer opens every
//! stream with a hello frame naming itself, which the acceptor uses as the
//! connection's peer ID. Handshakes run concurrently, so a silent client
//! cannot hold up the ones behind it.

use super::{codec, Connection, StreamLayer};
use crate::common::{Canceller, Context, Error, NodeId, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinSet;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

type Handshake = (SocketAddr, Result<Connection>);

pub struct TcpStreamLayer {
    local: NodeId,
    listener: TcpListener,
    /// Accepted streams still waiting for their hello frame
    handshakes: Mutex<JoinSet<Handshake>>,
    addresses: HashMap<NodeId, SocketAddr>,
    closed: Context,
    closer: Canceller,
}

impl TcpStreamLayer {
    pub async fn bind(
        local: NodeId,
        bind_addr: SocketAddr,
        addresses: HashMap<NodeId, SocketAddr>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        let (closed, closer) = Context::background().with_cancel();
        tracing::info!(
            "Node {} listening on {}",
            local,
            listener.local_addr()?
        );
        Ok(Self {
            local,
            listener,
            handshakes: Mutex::new(JoinSet::new()),
            addresses,
            closed,
            closer,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn add_address(&mut self, node_id: NodeId, addr: SocketAddr) {
        self.addresses.insert(node_id, addr);
    }

    async fn handshake(mut stream: TcpStream) -> Result<Connection> {
        let ctx = Context::background().with_timeout(HANDSHAKE_TIMEOUT);
        let peer = ctx.run(codec::read_hello(&mut stream)).await?;
        Ok(Connection::new(peer, stream))
    }
}

#[async_trait]
impl StreamLayer for TcpStreamLayer {
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
        let addr = *self
            .addresses
            .get(node_id)
            .ok_or_else(|| Error::ConnectionFailed(format!("no address for {}", node_id)))?;

        ctx.run(async {
            let mut stream = TcpStream::connect(addr)
                .await
                .map_err(|e| Error::ConnectionFailed(format!("{} ({}): {}", node_id, addr, e)))?;
            stream.set_nodelay(true)?;
            codec::write_hello(&mut stream, &self.local).await?;
            Ok(Connection::new(node_id.clone(), stream))
        })
        .await
    }

    async fn accept(&self) -> Result<Connection> {
        let mut pending = self.handshakes.lock().await;
        loop {
            let (stream, remote) = tokio::select! {
                biased;
                _ = self.closed.done() => return Err(Error::ShuttingDown),
                Some(done) = pending.join_next(), if !pending.is_empty() => {
                    match done {
                        Ok((remote, Ok(conn))) => {
                            tracing::debug!("Accepted {} from {}", conn.peer_node_id(), remote);
                            return Ok(conn);
                        }
                        Ok((remote, Err(e))) => {
                            tracing::warn!("Handshake with {} failed: {}", remote, e)
                        }
                        Err(e) => tracing::warn!("Handshake task failed: {}", e),
                    }
                    continue;
                }
                res = self.listener.accept() => res?,
            };

            pending.spawn(async move { (remote, Self::handshake(stream).await) });
        }
    }

    fn close(&self) {
        self.closer.cancel();
    }
}
