//! TCP server for collaborative editing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌── forwarder ──▶ Client A
//!            ├── Session ── DocModel ──┤
//! Client B ──┘      │          │       └── forwarder ──▶ Client B
//!                   │          │
//!                   │          └── per-document snapshot + version
//!                   │              + bounded op history
//!                   │
//!                   └── one task per connection, writer behind mpsc
//! ```
//!
//! The server accepts connections, assigns each an incrementing id, and
//! hands the socket to a [`Session`](crate::session). All document state
//! lives in the shared [`DocModel`].

use crate::model::{DocModel, ModelConfig};
use crate::session::Session;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// Document model tuning.
    pub model: ModelConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8765".to_string(),
            model: ModelConfig::default(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub messages_received: u64,
    pub ops_committed: u64,
}

/// The collaboration server.
pub struct CollabServer {
    config: ServerConfig,
    model: Arc<DocModel>,
    stats: Arc<RwLock<ServerStats>>,
    /// Next connection id. Ids start at 1; 0 is never assigned.
    next_id: AtomicU64,
}

impl CollabServer {
    pub fn new(config: ServerConfig) -> Self {
        let model = Arc::new(DocModel::new(config.model.clone()));
        Self {
            config,
            model,
            stats: Arc::new(RwLock::new(ServerStats::default())),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Binds the configured address and serves forever.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serves connections from an already-bound listener. Useful when the
    /// caller bound port 0 and needs the actual address.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            log::info!("connection {id} accepted from {addr}");

            let model = self.model.clone();
            let stats = self.stats.clone();
            {
                let mut s = stats.write().await;
                s.total_connections += 1;
                s.active_connections += 1;
            }

            tokio::spawn(async move {
                Session::run(stream, id, model, stats.clone()).await;
                stats.write().await.active_connections -= 1;
                log::info!("connection {id} finished");
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// The shared document model, for embedding servers that seed or
    /// inspect documents directly.
    pub fn model(&self) -> &Arc<DocModel> {
        &self.model
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:8765");
        assert_eq!(config.model.num_cached_ops, 128);
        assert_eq!(config.model.maximum_age, 64);
    }

    #[test]
    fn server_creation() {
        let server = CollabServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:8765");
    }

    #[tokio::test]
    async fn stats_initial() {
        let server = CollabServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.messages_received, 0);
        assert_eq!(stats.ops_committed, 0);
    }

    #[tokio::test]
    async fn model_accessible_for_embedding() {
        let server = CollabServer::with_defaults();
        server.model().create("seeded", "content").await.unwrap();
        assert_eq!(server.model().snapshot("seeded").await.unwrap(), "content");
    }
}
