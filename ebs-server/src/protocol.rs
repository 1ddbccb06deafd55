//! Binary request/response protocol.
//!
//! Every WebSocket binary frame carries one bincode-encoded [`Envelope`]:
//! ```text
//! ┌──────────┬───────────────────────────────┐
//! │ seq      │ body (Request | Response)     │
//! │ varint   │ enum tag + fields             │
//! └──────────┴───────────────────────────────┘
//! ```
//! A response echoes the `seq` of its request. JSON payloads (patch bodies,
//! documents) travel as compact JSON text because bincode is not
//! self-describing.

use ebs_store::PatchKey;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// `seq` of the error sent for a frame that could not be decoded. Clients
/// number their requests from 1.
pub const FRAME_ERROR_SEQ: u64 = 0;

/// One frame on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub seq: u64,
    pub body: T,
}

impl<T: Serialize + DeserializeOwned> Envelope<T> {
    pub fn new(seq: u64, body: T) -> Self {
        Self { seq, body }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (envelope, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(envelope)
    }
}

/// A patch as delivered to a syncing client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WirePatch {
    pub id: u64,
    pub key: PatchKey,
    pub parent_key: PatchKey,
    /// JSON-Patch operation list as JSON text
    pub patch: String,
    pub created_at: u64,
}

/// A patch uploaded by a syncing client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireNewPatch {
    pub key: PatchKey,
    pub parent_key: PatchKey,
    pub patch: String,
}

/// Client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Health,

    // Document surface
    CreateOwner {
        name: String,
    },
    CreatePatch {
        owner_id: u64,
        parent_id: u64,
        patch: String,
    },
    GetData {
        patch_id: u64,
    },
    GetOwnerData {
        owner_id: u64,
    },
    GetHeadId {
        owner_id: u64,
    },
    PutHeadId {
        owner_id: u64,
        value: u64,
        if_match: Option<u64>,
    },

    // Sync surface
    CreateClient {
        owner_id: u64,
        name: String,
    },
    GetPendingPatches {
        owner_id: u64,
        client_id: u64,
        size: u64,
    },
    DeletePendingPatches {
        owner_id: u64,
        client_id: u64,
        keys: Vec<PatchKey>,
    },
    CreatePatches {
        owner_id: u64,
        patches: Vec<WireNewPatch>,
    },
    GetHead {
        owner_id: u64,
    },
    UpdateHead {
        owner_id: u64,
        key: PatchKey,
    },
    UpdateHeadIfNotModified {
        owner_id: u64,
        key: PatchKey,
        prev_key: PatchKey,
    },
}

impl Request {
    /// Short label for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Health => "Health",
            Request::CreateOwner { .. } => "CreateOwner",
            Request::CreatePatch { .. } => "CreatePatch",
            Request::GetData { .. } => "GetData",
            Request::GetOwnerData { .. } => "GetOwnerData",
            Request::GetHeadId { .. } => "GetHeadId",
            Request::PutHeadId { .. } => "PutHeadId",
            Request::CreateClient { .. } => "CreateClient",
            Request::GetPendingPatches { .. } => "GetPendingPatches",
            Request::DeletePendingPatches { .. } => "DeletePendingPatches",
            Request::CreatePatches { .. } => "CreatePatches",
            Request::GetHead { .. } => "GetHead",
            Request::UpdateHead { .. } => "UpdateHead",
            Request::UpdateHeadIfNotModified { .. } => "UpdateHeadIfNotModified",
        }
    }
}

/// Server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Health {
        status: String,
    },
    Owner {
        owner_id: u64,
        head: u64,
        path: String,
    },
    PatchCreated {
        etag: u64,
        path: String,
    },
    Data {
        /// Materialized document as JSON text
        body: String,
        etag: u64,
        path: String,
    },
    HeadId {
        value: u64,
        updated_at: u64,
    },
    PreconditionFailed {
        current: u64,
        updated_at: u64,
    },
    ClientCreated {
        client_id: u64,
    },
    Patches {
        patches: Vec<WirePatch>,
    },
    Deleted {
        removed: u64,
    },
    PatchesCreated {
        ids: Vec<u64>,
    },
    Head {
        key: PatchKey,
        patch: u64,
        created_at: u64,
        name: String,
    },
    HeadUpdated {
        updated: bool,
    },
    Error {
        status: u16,
        message: String,
    },
}

impl Response {
    /// HTTP-style status of this response.
    pub fn status(&self) -> u16 {
        match self {
            Response::PreconditionFailed { .. } => 412,
            Response::Error { status, .. } => *status,
            _ => 200,
        }
    }
}

/// Protocol and transport errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Request timed out")]
    Timeout,
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let req = Envelope::new(
            7,
            Request::PutHeadId {
                owner_id: 1,
                value: 5,
                if_match: Some(1),
            },
        );
        let decoded = Envelope::<Request>::decode(&req.encode().unwrap()).unwrap();
        assert_eq!(decoded, req);
        assert_eq!(decoded.body.name(), "PutHeadId");
    }

    #[test]
    fn test_sync_payload_roundtrip() {
        let req = Envelope::new(
            1,
            Request::CreatePatches {
                owner_id: 3,
                patches: vec![WireNewPatch {
                    key: PatchKey::new(1, 2, 3),
                    parent_key: PatchKey::ROOT,
                    patch: r#"[{"op":"remove","path":"/data"}]"#.into(),
                }],
            },
        );
        assert_eq!(Envelope::<Request>::decode(&req.encode().unwrap()).unwrap(), req);
    }

    #[test]
    fn test_response_status() {
        assert_eq!(Response::HeadUpdated { updated: false }.status(), 200);
        assert_eq!(
            Response::PreconditionFailed {
                current: 2,
                updated_at: 0
            }
            .status(),
            412
        );
        assert_eq!(
            Response::Error {
                status: 404,
                message: "gone".into()
            }
            .status(),
            404
        );
    }

    #[test]
    fn test_decode_garbage() {
        let result = Envelope::<Response>::decode(&[0xFF, 0xFF, 0xFF]);
        assert!(matches!(result, Err(ProtocolError::Deserialization(_))));
    }
}
