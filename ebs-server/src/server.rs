//! WebSocket request/response server.
//!
//! ```text
//! Client ──ws──┐
//!              ├── connection task ── decode Envelope<Request>
//! Client ──ws──┘          │
//!                         ▼
//!                  Service (spawn_blocking)
//!                         │
//!                         ▼
//!              Repository (RocksDB TransactionDB)
//! ```
//!
//! Each connection is served in order: one request frame in, one response
//! frame out, carrying the same `seq`. A frame that does not decode is
//! answered with a 400 on `seq` 0.

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ebs_store::{Repository, StoreConfig, StoreError};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{Envelope, Request, Response, FRAME_ERROR_SEQ};
use crate::service::Service;

/// Server startup failures.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// RocksDB directory
    pub storage_path: PathBuf,
    /// Replays slower than this write a snapshot back
    pub snapshot_threshold: Duration,
    /// Fsync on every commit
    pub sync_writes: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:50051".to_string(),
            storage_path: PathBuf::from("ebs_data"),
            snapshot_threshold: Duration::from_secs(1),
            sync_writes: true,
        }
    }
}

impl ServerConfig {
    /// Read overrides from the environment.
    ///
    /// `EBS_BIND_ADDR` wins over `PORT` (which binds `0.0.0.0`).
    /// `EBS_DATA_DIR` and `EBS_SNAPSHOT_THRESHOLD_MS` adjust storage.
    pub fn from_env() -> Result<Self, ServerError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ServerError> {
        let mut config = Self::default();
        if let Some(addr) = lookup("EBS_BIND_ADDR") {
            config.bind_addr = addr;
        } else if let Some(port) = lookup("PORT") {
            let port: u16 = port
                .parse()
                .map_err(|_| ServerError::Config(format!("PORT is not a port number: {port}")))?;
            config.bind_addr = format!("0.0.0.0:{port}");
        }
        if let Some(dir) = lookup("EBS_DATA_DIR") {
            config.storage_path = PathBuf::from(dir);
        }
        if let Some(ms) = lookup("EBS_SNAPSHOT_THRESHOLD_MS") {
            let ms: u64 = ms.parse().map_err(|_| {
                ServerError::Config(format!("EBS_SNAPSHOT_THRESHOLD_MS is not a number: {ms}"))
            })?;
            config.snapshot_threshold = Duration::from_millis(ms);
        }
        Ok(config)
    }

    fn store_config(&self) -> StoreConfig {
        StoreConfig {
            path: self.storage_path.clone(),
            sync_writes: self.sync_writes,
            snapshot_threshold: self.snapshot_threshold,
            ..StoreConfig::default()
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_requests: u64,
    pub failed_requests: u64,
    /// Bytes received plus bytes sent
    pub total_bytes: u64,
}

/// The document and sync server.
pub struct ApiServer {
    config: ServerConfig,
    service: Service,
    stats: Arc<RwLock<ServerStats>>,
}

impl ApiServer {
    /// Open storage and prepare the server.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let repo = Repository::open(config.store_config())?;
        log::info!("Opened store at {}", config.storage_path.display());
        Ok(Self {
            config,
            service: Service::new(repo),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        })
    }

    /// Listen until the process is stopped.
    pub async fn run(&self) -> Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Listen until `shutdown` resolves. In-flight connections are left to
    /// finish on their own tasks.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Server listening on {}", listener.local_addr()?);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("New TCP connection from {addr}");

                    let service = self.service.clone();
                    let stats = self.stats.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, addr, service, stats).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = &mut shutdown => {
                    log::info!("Shutdown requested, no longer accepting connections");
                    return Ok(());
                }
            }
        }
    }

    /// Serve one WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        service: Service,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = async {
            while let Some(msg) = ws_receiver.next().await {
                match msg? {
                    Message::Binary(data) => {
                        let bytes: Vec<u8> = data.into();
                        let (seq, response) = match Envelope::<Request>::decode(&bytes) {
                            Ok(request) => {
                                log::debug!("{addr} -> {} (seq {})", request.body.name(), request.seq);
                                (request.seq, service.handle(request.body).await)
                            }
                            Err(e) => {
                                log::warn!("Undecodable frame from {addr}: {e}");
                                let response = Response::Error {
                                    status: 400,
                                    message: e.to_string(),
                                };
                                (FRAME_ERROR_SEQ, response)
                            }
                        };

                        let encoded = Envelope::new(seq, response.clone()).encode()?;
                        {
                            let mut s = stats.write().await;
                            s.total_requests += 1;
                            s.total_bytes += (bytes.len() + encoded.len()) as u64;
                            if matches!(response, Response::Error { .. }) {
                                s.failed_requests += 1;
                            }
                        }
                        ws_sender.send(Message::Binary(encoded.into())).await?;
                    }
                    Message::Ping(payload) => {
                        ws_sender.send(Message::Pong(payload)).await?;
                    }
                    Message::Close(_) => {
                        log::info!("Client {addr} closed connection");
                        break;
                    }
                    _ => {}
                }
            }
            Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
        }
        .await;

        stats.write().await.active_connections -= 1;
        result
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn repository(&self) -> &Repository {
        self.service.repository()
    }
}
