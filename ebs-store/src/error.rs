//! Error taxonomy for the patch store.
//!
//! A refused compare-and-swap on the head pointer is not an error: it is
//! reported through [`crate::HeadUpdate::Refused`].

use thiserror::Error;

use crate::codec::CodecError;
use crate::json_patch::PatchError;
use crate::records::PatchKey;

/// Storage and domain errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Owner not found: {0}")]
    OwnerNotFound(u64),

    #[error("Patch not found: {0}")]
    PatchNotFound(u64),

    #[error("Client not found: owner {owner_id}, client {client_id}")]
    ClientNotFound { owner_id: u64, client_id: u64 },

    #[error("Invalid parent {parent_id} for owner {owner_id}")]
    InvalidParent { owner_id: u64, parent_id: u64 },

    #[error("Invalid parent key {key} for owner {owner_id}")]
    InvalidParentKey { owner_id: u64, key: PatchKey },

    #[error("Invalid patch {patch_id} for owner {owner_id}")]
    InvalidPatch { owner_id: u64, patch_id: u64 },

    #[error("Invalid patch key {key} for owner {owner_id}")]
    InvalidPatchKey { owner_id: u64, key: PatchKey },

    #[error("Corrupted chain at patch {patch_id}: {reason}")]
    Corrupted { patch_id: u64, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Coarse classification used by callers to pick a response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidParent,
    InvalidPatch,
    Corrupted,
    Internal,
}

impl ErrorKind {
    /// HTTP-style status code for this kind.
    pub fn status(self) -> u16 {
        match self {
            ErrorKind::NotFound => 404,
            ErrorKind::InvalidParent | ErrorKind::InvalidPatch => 400,
            ErrorKind::Corrupted | ErrorKind::Internal => 500,
        }
    }
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::OwnerNotFound(_)
            | StoreError::PatchNotFound(_)
            | StoreError::ClientNotFound { .. } => ErrorKind::NotFound,
            StoreError::InvalidParent { .. } | StoreError::InvalidParentKey { .. } => {
                ErrorKind::InvalidParent
            }
            StoreError::InvalidPatch { .. } | StoreError::InvalidPatchKey { .. } => {
                ErrorKind::InvalidPatch
            }
            StoreError::Corrupted { .. } => ErrorKind::Corrupted,
            StoreError::Database(_)
            | StoreError::Serialization(_)
            | StoreError::Deserialization(_)
            | StoreError::Codec(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn corrupted(patch_id: u64, reason: impl Into<String>) -> Self {
        StoreError::Corrupted {
            patch_id,
            reason: reason.into(),
        }
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}
