//! Request/response client for the document and sync server.
//!
//! One WebSocket, one request in flight at a time. Typed helpers turn
//! `Response::Error` into [`ProtocolError::Server`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use ebs_store::PatchKey;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::protocol::{
    Envelope, ProtocolError, Request, Response, WireNewPatch, WirePatch, FRAME_ERROR_SEQ,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Result of a conditional head move by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadIdOutcome {
    Updated { value: u64, updated_at: u64 },
    /// 412: the head was not at the expected id.
    PreconditionFailed { current: u64, updated_at: u64 },
}

/// Current head as seen by a syncing client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadInfo {
    pub key: PatchKey,
    pub patch: u64,
    pub created_at: u64,
    pub name: String,
}

pub struct ApiClient {
    server_url: String,
    ws: Mutex<Option<WsStream>>,
    state: RwLock<ConnectionState>,
    seq: AtomicU64,
    timeout: Duration,
}

impl ApiClient {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ws: Mutex::new(None),
            state: RwLock::new(ConnectionState::Disconnected),
            seq: AtomicU64::new(0),
            timeout: Duration::from_secs(10),
        }
    }

    /// Per-request response timeout (default: 10s).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn connect(&self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;
        match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => {
                *self.ws.lock().await = Some(ws_stream);
                *self.state.write().await = ConnectionState::Connected;
                log::info!("Connected to {}", self.server_url);
                Ok(())
            }
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                Err(ProtocolError::Transport(e.to_string()))
            }
        }
    }

    pub async fn disconnect(&self) {
        if let Some(mut ws) = self.ws.lock().await.take() {
            let _ = ws.close(None).await;
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Send one request and wait for the response with the same `seq`.
    pub async fn request(&self, request: Request) -> Result<Response, ProtocolError> {
        let mut guard = self.ws.lock().await;
        let ws = guard.as_mut().ok_or(ProtocolError::ConnectionClosed)?;

        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let encoded = Envelope::new(seq, request).encode()?;
        ws.send(Message::Binary(encoded.into()))
            .await
            .map_err(|e| ProtocolError::Transport(e.to_string()))?;

        let outcome = tokio::time::timeout(self.timeout, Self::await_response(ws, seq)).await;
        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::Timeout),
        };
        if matches!(result, Err(ProtocolError::ConnectionClosed)) {
            *guard = None;
            *self.state.write().await = ConnectionState::Disconnected;
        }
        result
    }

    async fn await_response(ws: &mut WsStream, seq: u64) -> Result<Response, ProtocolError> {
        while let Some(msg) = ws.next().await {
            match msg.map_err(|e| ProtocolError::Transport(e.to_string()))? {
                Message::Binary(data) => {
                    let bytes: Vec<u8> = data.into();
                    let envelope = Envelope::<Response>::decode(&bytes)?;
                    // seq 0: the server could not decode the request in flight
                    if envelope.seq == seq || envelope.seq == FRAME_ERROR_SEQ {
                        return Ok(envelope.body);
                    }
                    log::warn!("Dropping stale response seq {} (waiting for {seq})", envelope.seq);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        Err(ProtocolError::ConnectionClosed)
    }

    // ── document surface ────────────────────────────────────────

    pub async fn health(&self) -> Result<String, ProtocolError> {
        match self.request(Request::Health).await? {
            Response::Health { status } => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    /// Returns `(owner_id, head)`.
    pub async fn create_owner(&self, name: &str) -> Result<(u64, u64), ProtocolError> {
        let request = Request::CreateOwner {
            name: name.to_string(),
        };
        match self.request(request).await? {
            Response::Owner { owner_id, head, .. } => Ok((owner_id, head)),
            other => Err(unexpected(other)),
        }
    }

    /// Append a JSON-Patch body below `parent_id`; returns the new id.
    pub async fn create_patch(
        &self,
        owner_id: u64,
        parent_id: u64,
        patch: &str,
    ) -> Result<u64, ProtocolError> {
        let request = Request::CreatePatch {
            owner_id,
            parent_id,
            patch: patch.to_string(),
        };
        match self.request(request).await? {
            Response::PatchCreated { etag, .. } => Ok(etag),
            other => Err(unexpected(other)),
        }
    }

    /// Returns `(body, etag)`.
    pub async fn get_data(&self, patch_id: u64) -> Result<(String, u64), ProtocolError> {
        match self.request(Request::GetData { patch_id }).await? {
            Response::Data { body, etag, .. } => Ok((body, etag)),
            other => Err(unexpected(other)),
        }
    }

    /// Returns `(body, etag)` for the owner's head.
    pub async fn get_owner_data(&self, owner_id: u64) -> Result<(String, u64), ProtocolError> {
        match self.request(Request::GetOwnerData { owner_id }).await? {
            Response::Data { body, etag, .. } => Ok((body, etag)),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_head_id(&self, owner_id: u64) -> Result<u64, ProtocolError> {
        match self.request(Request::GetHeadId { owner_id }).await? {
            Response::HeadId { value, .. } => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    pub async fn put_head_id(
        &self,
        owner_id: u64,
        value: u64,
        if_match: Option<u64>,
    ) -> Result<HeadIdOutcome, ProtocolError> {
        let request = Request::PutHeadId {
            owner_id,
            value,
            if_match,
        };
        match self.request(request).await? {
            Response::HeadId { value, updated_at } => Ok(HeadIdOutcome::Updated { value, updated_at }),
            Response::PreconditionFailed {
                current,
                updated_at,
            } => Ok(HeadIdOutcome::PreconditionFailed {
                current,
                updated_at,
            }),
            other => Err(unexpected(other)),
        }
    }

    // ── sync surface ────────────────────────────────────────────

    pub async fn create_client(&self, owner_id: u64, name: &str) -> Result<u64, ProtocolError> {
        let request = Request::CreateClient {
            owner_id,
            name: name.to_string(),
        };
        match self.request(request).await? {
            Response::ClientCreated { client_id } => Ok(client_id),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_pending(
        &self,
        owner_id: u64,
        client_id: u64,
        size: u64,
    ) -> Result<Vec<WirePatch>, ProtocolError> {
        let request = Request::GetPendingPatches {
            owner_id,
            client_id,
            size,
        };
        match self.request(request).await? {
            Response::Patches { patches } => Ok(patches),
            other => Err(unexpected(other)),
        }
    }

    pub async fn delete_pending(
        &self,
        owner_id: u64,
        client_id: u64,
        keys: Vec<PatchKey>,
    ) -> Result<u64, ProtocolError> {
        let request = Request::DeletePendingPatches {
            owner_id,
            client_id,
            keys,
        };
        match self.request(request).await? {
            Response::Deleted { removed } => Ok(removed),
            other => Err(unexpected(other)),
        }
    }

    pub async fn create_patches(
        &self,
        owner_id: u64,
        patches: Vec<WireNewPatch>,
    ) -> Result<Vec<u64>, ProtocolError> {
        match self.request(Request::CreatePatches { owner_id, patches }).await? {
            Response::PatchesCreated { ids } => Ok(ids),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_head(&self, owner_id: u64) -> Result<HeadInfo, ProtocolError> {
        match self.request(Request::GetHead { owner_id }).await? {
            Response::Head {
                key,
                patch,
                created_at,
                name,
            } => Ok(HeadInfo {
                key,
                patch,
                created_at,
                name,
            }),
            other => Err(unexpected(other)),
        }
    }

    pub async fn update_head(&self, owner_id: u64, key: PatchKey) -> Result<bool, ProtocolError> {
        match self.request(Request::UpdateHead { owner_id, key }).await? {
            Response::HeadUpdated { updated } => Ok(updated),
            other => Err(unexpected(other)),
        }
    }

    pub async fn update_head_if_not_modified(
        &self,
        owner_id: u64,
        key: PatchKey,
        prev_key: PatchKey,
    ) -> Result<bool, ProtocolError> {
        let request = Request::UpdateHeadIfNotModified {
            owner_id,
            key,
            prev_key,
        };
        match self.request(request).await? {
            Response::HeadUpdated { updated } => Ok(updated),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: Response) -> ProtocolError {
    match response {
        Response::Error { status, message } => ProtocolError::Server { status, message },
        other => ProtocolError::UnexpectedResponse(format!("{other:?}")),
    }
}
