//! # ebs-store: versioned document store for a personal task tracker
//!
//! Every user (owner) has one JSON document whose history is an append-only
//! tree of JSON-Patch records. The current version is selected by a head
//! pointer that only moves through compare-and-swap, and each registered
//! device has a queue of patches it has not acknowledged yet.
//!
//! ## Architecture
//!
//! ```text
//!            ┌──────────────────────── Repository ────────────────────────┐
//!            │                                                           │
//!  ┌─────────┴──┐   ┌───────────────┐   ┌──────────────┐   ┌────────────┴┐
//!  │ PatchStore │◄──│ Reconstructor │   │ HeadRegistry │   │  SyncQueue  │
//!  │ (append)   │   │ (replay+memo) │   │ (CAS head)   │   │ (fan-out)   │
//!  └─────┬──────┘   └───────┬───────┘   └──────┬───────┘   └──────┬──────┘
//!        └──────────────────┴──── Arc<Store> ──┴──────────────────┘
//!                                     │
//!                       RocksDB TransactionDB + LZ4 codec
//! ```
//!
//! ## Modules
//!
//! - [`codec`]: LZ4-compressed compact JSON payloads
//! - [`json_patch`]: RFC 6902 operations over `serde_json::Value`
//! - [`storage`]: column families, keys and transactions
//! - [`patches`]: owners, root bootstrap and patch append
//! - [`reconstruct`]: ancestor walk, replay and snapshot write-back
//! - [`heads`]: head lookup and compare-and-swap
//! - [`queue`]: device registration and pending-patch delivery

pub mod codec;
pub mod error;
pub mod heads;
pub mod json_patch;
pub mod patches;
pub mod queue;
pub mod reconstruct;
pub mod records;
pub mod storage;

use serde_json::Value;
use std::sync::Arc;

pub use error::{ErrorKind, StoreError};
pub use heads::{HeadRef, HeadRegistry, HeadUpdate};
pub use json_patch::{Op, PatchError};
pub use patches::PatchStore;
pub use queue::{SyncQueue, MAX_PENDING_BATCH};
pub use reconstruct::{Reconstruction, Reconstructor};
pub use records::{Client, NewPatch, Owner, Patch, PatchKey};
pub use storage::{Store, StoreConfig};

/// The four components over one shared storage handle.
#[derive(Clone)]
pub struct Repository {
    store: Arc<Store>,
    pub patches: PatchStore,
    pub reconstructor: Reconstructor,
    pub heads: HeadRegistry,
    pub queue: SyncQueue,
}

impl Repository {
    /// Open the store and wire up every component.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        Ok(Self::new(Arc::new(Store::open(config)?)))
    }

    pub fn new(store: Arc<Store>) -> Self {
        Self {
            patches: PatchStore::new(store.clone()),
            reconstructor: Reconstructor::new(store.clone()),
            heads: HeadRegistry::new(store.clone()),
            queue: SyncQueue::new(store.clone()),
            store,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Resolve the owner's head and materialize it.
    pub fn owner_data(&self, owner_id: u64) -> Result<(u64, Value), StoreError> {
        let owner = self.patches.get_owner(owner_id)?;
        let document = self.reconstructor.get_data(owner.head)?;
        Ok((owner.head, document))
    }
}
