//! Per-owner head pointer with compare-and-swap advancement.
//!
//! The owner row is read with an exclusive `get_for_update` lock, compared,
//! and rewritten in one transaction. Of several writers presenting the same
//! expected head, the first to take the lock wins and the rest observe the
//! new head once they get it, so they are refused.

use std::sync::Arc;

use crate::error::StoreError;
use crate::records::{self, PatchKey};
use crate::storage::{Store, Txn};

/// The current head of an owner, resolved for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadRef {
    pub owner_id: u64,
    pub patch_id: u64,
    pub key: PatchKey,
    /// Name of the client that authored the head patch
    pub name: String,
    /// Creation time of the head patch
    pub created_at: u64,
    /// When the head last moved
    pub updated_at: u64,
}

/// Result of a head update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadUpdate {
    Updated { patch_id: u64, updated_at: u64 },
    /// The expected head did not match; nothing was written.
    Refused {
        current: u64,
        current_key: PatchKey,
        updated_at: u64,
    },
}

impl HeadUpdate {
    pub fn is_updated(&self) -> bool {
        matches!(self, HeadUpdate::Updated { .. })
    }
}

/// Reads and advances owner heads.
#[derive(Clone)]
pub struct HeadRegistry {
    store: Arc<Store>,
}

impl HeadRegistry {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn get_head(&self, owner_id: u64) -> Result<HeadRef, StoreError> {
        let store = &self.store;
        let db = store.db();
        let owner = store.owner_in(db, owner_id)?;
        let record = store
            .patch_record_in(db, owner.head)?
            .ok_or_else(|| StoreError::corrupted(owner.head, "head points at a missing patch"))?;
        let name = store
            .client_in(db, owner_id, record.key.client_id)?
            .map(|client| client.name)
            .unwrap_or_default();

        Ok(HeadRef {
            owner_id,
            patch_id: owner.head,
            key: record.key,
            name,
            created_at: record.created_at,
            updated_at: owner.updated_at,
        })
    }

    /// Point the head at `new_patch_id`.
    ///
    /// With `if_match`, the update only happens if the current head equals
    /// it; otherwise the current head is reported back as `Refused`.
    pub fn update_head(
        &self,
        owner_id: u64,
        new_patch_id: u64,
        if_match: Option<u64>,
    ) -> Result<HeadUpdate, StoreError> {
        let store = &self.store;
        let txn = store.begin();
        let owner = store.owner_for_update(&txn, owner_id)?;

        // A stale precondition is reported before the target is looked at.
        let matches = if_match.map_or(true, |expected| expected == owner.head);
        if matches {
            match store.patch_record_in(&txn, new_patch_id)? {
                Some(record) if record.owner_id == owner_id => {}
                _ => {
                    return Err(StoreError::InvalidPatch {
                        owner_id,
                        patch_id: new_patch_id,
                    })
                }
            }
        }
        self.finish(txn, owner, new_patch_id, matches)
    }

    /// Key-addressed variant used by syncing clients.
    ///
    /// An unknown `prev_key` can never equal the current head and is
    /// reported as a refusal.
    pub fn update_head_if_not_modified(
        &self,
        owner_id: u64,
        key: PatchKey,
        prev_key: PatchKey,
    ) -> Result<HeadUpdate, StoreError> {
        let store = &self.store;
        let txn = store.begin();
        let owner = store.owner_for_update(&txn, owner_id)?;

        let new_patch_id = store
            .find_key_in(&txn, owner_id, &key)?
            .ok_or(StoreError::InvalidPatchKey { owner_id, key })?;
        let prev = store.find_key_in(&txn, owner_id, &prev_key)?;
        let matches = prev == Some(owner.head);

        self.finish(txn, owner, new_patch_id, matches)
    }

    fn finish(
        &self,
        txn: Txn<'_>,
        mut owner: records::Owner,
        new_patch_id: u64,
        matches: bool,
    ) -> Result<HeadUpdate, StoreError> {
        let store = &self.store;
        if !matches {
            let current_key = store
                .patch_record_in(&txn, owner.head)?
                .map(|record| record.key)
                .ok_or_else(|| StoreError::corrupted(owner.head, "head points at a missing patch"))?;
            log::debug!(
                "Refused head update for owner {}: head is {}",
                owner.id,
                owner.head
            );
            return Ok(HeadUpdate::Refused {
                current: owner.head,
                current_key,
                updated_at: owner.updated_at,
            });
        }

        owner.head = new_patch_id;
        owner.updated_at = records::now_millis().max(owner.updated_at);
        store.put_owner(&txn, &owner)?;
        txn.commit()?;

        log::debug!("Owner {} head -> {new_patch_id}", owner.id);
        Ok(HeadUpdate::Updated {
            patch_id: new_patch_id,
            updated_at: owner.updated_at,
        })
    }
}
