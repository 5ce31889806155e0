//! Raft networking
//!
//! Peers talk over TCP with length-prefixed bincode frames, one request and
//! one response per exchange. [`MemoryRouter`] delivers the same requests
//! in process for tests.

use crate::codec::RaftCodec;
use crate::error::{RaftError, Result};
use crate::message::{RaftMessage, RaftRequest, RaftResponse};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tracing::{debug, error, info};

/// Something that answers Raft RPCs
pub trait RaftRpcHandler: Send + Sync + 'static {
    fn handle(&self, request: RaftRequest) -> RaftResponse;
}

/// Delivers a request to the node listening at `address`
#[async_trait]
pub trait RaftTransport: Send + Sync + 'static {
    async fn send(&self, address: &str, request: RaftRequest) -> Result<RaftResponse>;
}

/// TCP transport, one connection per request
#[derive(Debug, Clone)]
pub struct TcpTransport {
    timeout: Duration,
}

impl TcpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn exchange(&self, address: &str, request: RaftRequest) -> Result<RaftResponse> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| RaftError::Transport(format!("failed to connect to {}: {}", address, e)))?;
        let mut framed = Framed::new(stream, RaftCodec);

        framed.send(RaftMessage::Request(request)).await?;

        match framed.next().await {
            Some(Ok(RaftMessage::Response(RaftResponse::Error(msg)))) => {
                Err(RaftError::Transport(msg))
            }
            Some(Ok(RaftMessage::Response(response))) => Ok(response),
            Some(Ok(RaftMessage::Request(_))) => {
                Err(RaftError::Transport("peer answered with a request".to_string()))
            }
            Some(Err(e)) => Err(e),
            None => Err(RaftError::Transport(format!("{} closed the connection", address))),
        }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl RaftTransport for TcpTransport {
    async fn send(&self, address: &str, request: RaftRequest) -> Result<RaftResponse> {
        tokio::time::timeout(self.timeout, self.exchange(address, request))
            .await
            .map_err(|_| RaftError::Transport(format!("request to {} timed out", address)))?
    }
}

/// Raft RPC server - handles incoming RPC requests from peers
pub struct RaftRpcServer {
    listener: TcpListener,
    handler: Arc<dyn RaftRpcHandler>,
}

impl RaftRpcServer {
    /// The listener is bound by the caller so that bind errors surface
    /// before anything is spawned.
    pub fn new(listener: TcpListener, handler: Arc<dyn RaftRpcHandler>) -> Self {
        Self { listener, handler }
    }

    pub async fn serve(self) {
        if let Ok(addr) = self.listener.local_addr() {
            info!("Raft RPC server listening on {}", addr);
        }

        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let handler = self.handler.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, handler).await {
                            debug!("Error handling raft connection from {}: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept raft connection: {}", e);
                }
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, handler: Arc<dyn RaftRpcHandler>) -> Result<()> {
    let mut framed = Framed::new(stream, RaftCodec);

    while let Some(frame) = framed.next().await {
        let response = match frame? {
            RaftMessage::Request(request) => handler.handle(request),
            RaftMessage::Response(_) => RaftResponse::Error("expected a request".to_string()),
        };
        framed.send(RaftMessage::Response(response)).await?;
    }

    Ok(())
}

/// In-process transport connecting handlers registered under addresses.
#[derive(Clone, Default)]
pub struct MemoryRouter {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn RaftRpcHandler>>>>,
    isolated: Arc<RwLock<HashSet<String>>>,
}

impl MemoryRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, address: impl Into<String>, handler: Arc<dyn RaftRpcHandler>) {
        self.handlers.write().insert(address.into(), handler);
    }

    /// Drop all traffic to and from `address` until [`MemoryRouter::heal`].
    pub fn isolate(&self, address: &str) {
        self.isolated.write().insert(address.to_string());
    }

    pub fn heal(&self, address: &str) {
        self.isolated.write().remove(address);
    }

    /// A transport that sends as the node at `from`.
    pub fn transport(&self, from: impl Into<String>) -> MemoryTransport {
        MemoryTransport {
            router: self.clone(),
            from: from.into(),
        }
    }
}

/// One node's view of a [`MemoryRouter`].
#[derive(Clone)]
pub struct MemoryTransport {
    router: MemoryRouter,
    from: String,
}

#[async_trait]
impl RaftTransport for MemoryTransport {
    async fn send(&self, address: &str, request: RaftRequest) -> Result<RaftResponse> {
        tokio::task::yield_now().await;
        {
            let isolated = self.router.isolated.read();
            if isolated.contains(address) || isolated.contains(&self.from) {
                return Err(RaftError::Transport(format!("{} is unreachable", address)));
            }
        }
        let handler = self
            .router
            .handlers
            .read()
            .get(address)
            .cloned()
            .ok_or_else(|| RaftError::Transport(format!("nothing listening at {}", address)))?;
        Ok(handler.handle(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl RaftRpcHandler for Echo {
        fn handle(&self, request: RaftRequest) -> RaftResponse {
            match request {
                RaftRequest::Ping => RaftResponse::Pong {
                    node_id: "echo".to_string(),
                    term: 4,
                },
                _ => RaftResponse::Error("unsupported".to_string()),
            }
        }
    }

    #[tokio::test]
    async fn test_tcp_ping_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(RaftRpcServer::new(listener, Arc::new(Echo)).serve());

        let transport = TcpTransport::default();
        match transport.send(&addr, RaftRequest::Ping).await.unwrap() {
            RaftResponse::Pong { node_id, term } => {
                assert_eq!(node_id, "echo");
                assert_eq!(term, 4);
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_tcp_error_response_becomes_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(RaftRpcServer::new(listener, Arc::new(Echo)).serve());

        let request = RaftRequest::RequestVote(crate::message::RequestVoteRequest {
            term: 1,
            candidate_id: "x".to_string(),
            last_log_index: 0,
            last_log_term: 0,
        });
        let result = TcpTransport::default().send(&addr, request).await;
        assert!(matches!(result, Err(RaftError::Transport(_))));
    }

    #[tokio::test]
    async fn test_tcp_unreachable() {
        // Bind then drop to get a port with nothing listening.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let result = TcpTransport::new(Duration::from_millis(500))
            .send(&addr, RaftRequest::Ping)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_memory_router_isolation() {
        let router = MemoryRouter::new();
        router.register("a", Arc::new(Echo));
        let transport = router.transport("b");

        assert!(transport.send("a", RaftRequest::Ping).await.is_ok());

        router.isolate("a");
        assert!(transport.send("a", RaftRequest::Ping).await.is_err());

        router.heal("a");
        assert!(transport.send("a", RaftRequest::Ping).await.is_ok());
        assert!(transport.send("missing", RaftRequest::Ping).await.is_err());
    }
}
