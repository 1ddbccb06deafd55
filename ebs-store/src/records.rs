//! Plain data records shared by every component.
//!
//! Public types carry decoded JSON. The `*Record` types are the persisted
//! forms: bincode framing with the JSON payloads kept as compressed bytes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::SystemTime;

use crate::codec;
use crate::error::StoreError;
use crate::json_patch::{self, Op};

/// Id of the system client that authors root patches and single-writer edits.
pub const SYSTEM_CLIENT_ID: u64 = 0;

/// Display name of the system client.
pub const SYSTEM_CLIENT_NAME: &str = "System";

/// Document every owner starts from.
pub fn initial_document() -> Value {
    serde_json::json!({ "data": null })
}

/// Operation list stored on every root patch.
pub fn initial_ops() -> Vec<Op> {
    vec![Op::replace("", initial_document())]
}

/// Milliseconds since the unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Client-assigned identity of a patch within one owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PatchKey {
    pub client_id: u64,
    pub session_id: u64,
    pub patch_id: u64,
}

impl PatchKey {
    /// Identity of every owner's root patch.
    pub const ROOT: PatchKey = PatchKey {
        client_id: 0,
        session_id: 0,
        patch_id: 0,
    };

    pub fn new(client_id: u64, session_id: u64, patch_id: u64) -> Self {
        Self {
            client_id,
            session_id,
            patch_id,
        }
    }

    /// Key given to patches created through the single-writer path.
    pub fn system(patch_id: u64) -> Self {
        Self::new(SYSTEM_CLIENT_ID, 0, patch_id)
    }
}

impl fmt::Display for PatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.client_id, self.session_id, self.patch_id)
    }
}

/// A user account; the unit of isolation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub id: u64,
    pub name: String,
    pub enabled: bool,
    /// Id of the current head patch.
    pub head: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Owner {
    pub(crate) fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (owner, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(owner)
    }
}

/// A registered device of one owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub owner_id: u64,
    pub id: u64,
    pub name: String,
    pub created_at: u64,
}

impl Client {
    pub(crate) fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (client, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(client)
    }
}

/// An immutable patch, decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct Patch {
    pub id: u64,
    pub owner_id: u64,
    pub parent_id: u64,
    pub key: PatchKey,
    pub parent_key: PatchKey,
    pub ops: Vec<Op>,
    /// Fully materialized document, if one has been attached.
    pub snapshot: Option<Value>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Patch {
    pub fn is_root(&self) -> bool {
        self.id == self.parent_id
    }
}

/// A patch submitted by a client through the multi-client protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPatch {
    pub key: PatchKey,
    pub parent_key: PatchKey,
    pub ops: Vec<Op>,
}

/// Persisted form of a patch. The snapshot lives in its own column family
/// so that this record is never rewritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PatchRecord {
    pub owner_id: u64,
    pub parent_id: u64,
    pub key: PatchKey,
    pub parent_key: PatchKey,
    /// LZ4-compressed compact JSON operation list.
    pub body: Vec<u8>,
    pub created_at: u64,
}

impl PatchRecord {
    pub fn new(
        owner_id: u64,
        parent_id: u64,
        key: PatchKey,
        parent_key: PatchKey,
        ops: &[Op],
        created_at: u64,
    ) -> Result<Self, StoreError> {
        let value = json_patch::ops_to_value(ops)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(Self {
            owner_id,
            parent_id,
            key,
            parent_key,
            body: codec::encode_json(&value)?,
            created_at,
        })
    }

    pub fn ops(&self) -> Result<Vec<Op>, StoreError> {
        let value: Value = codec::decode_json(&self.body)?;
        json_patch::ops_from_value(value).map_err(|e| StoreError::Deserialization(e.to_string()))
    }

    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(record)
    }

    /// Decode into the public form, attaching a snapshot and its fill time.
    pub fn into_patch(
        self,
        id: u64,
        snapshot: Option<(Value, u64)>,
    ) -> Result<Patch, StoreError> {
        let ops = self.ops()?;
        let (snapshot, updated_at) = match snapshot {
            Some((doc, filled_at)) => (Some(doc), filled_at.max(self.created_at)),
            None => (None, self.created_at),
        };
        Ok(Patch {
            id,
            owner_id: self.owner_id,
            parent_id: self.parent_id,
            key: self.key,
            parent_key: self.parent_key,
            ops,
            snapshot,
            created_at: self.created_at,
            updated_at,
        })
    }
}

/// Persisted snapshot: fill time followed by the compressed document.
pub(crate) fn encode_snapshot(doc: &Value, filled_at: u64) -> Result<Vec<u8>, StoreError> {
    let body = codec::encode_json(doc)?;
    let mut bytes = Vec::with_capacity(8 + body.len());
    bytes.extend_from_slice(&filled_at.to_be_bytes());
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

pub(crate) fn decode_snapshot(bytes: &[u8]) -> Result<(Value, u64), StoreError> {
    if bytes.len() < 8 {
        return Err(StoreError::Deserialization("Truncated snapshot".into()));
    }
    let mut ts = [0u8; 8];
    ts.copy_from_slice(&bytes[..8]);
    let doc = codec::decode_json(&bytes[8..])?;
    Ok((doc, u64::from_be_bytes(ts)))
}
