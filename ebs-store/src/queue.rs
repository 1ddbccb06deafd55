//! Per-client delivery queues for the multi-client sync protocol.
//!
//! Each registered device of an owner has a queue of patch ids it has not
//! acknowledged yet. Storing a patch queues it for every device except its
//! author, in the same transaction as the patch row. Reads never consume;
//! entries leave the queue only through [`SyncQueue::delete_pending`].

use std::sync::Arc;

use crate::error::StoreError;
use crate::patches::PatchStore;
use crate::records::{self, Client, NewPatch, Patch, PatchKey, PatchRecord, SYSTEM_CLIENT_ID};
use crate::storage::Store;

/// Upper bound on patches returned by one `get_pending` call.
pub const MAX_PENDING_BATCH: usize = 10_000;

/// Device registration, batch upload and pending-patch delivery.
#[derive(Clone)]
pub struct SyncQueue {
    store: Arc<Store>,
    patches: PatchStore,
}

impl SyncQueue {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            patches: PatchStore::new(store.clone()),
            store,
        }
    }

    /// Register a device and return its id (1, 2, ... per owner).
    ///
    /// The new queue starts with every patch the owner already has, so a
    /// fresh device receives the full history including the root.
    pub fn create_client(&self, owner_id: u64, name: &str) -> Result<u64, StoreError> {
        let store = &self.store;
        let txn = store.begin();
        store.owner_in(&txn, owner_id)?;

        let client_id = store.lock_client_seq(&txn, owner_id)? + 1;
        store.put_client(
            &txn,
            &Client {
                owner_id,
                id: client_id,
                name: name.to_string(),
                created_at: records::now_millis(),
            },
        )?;
        store.put_client_seq(&txn, owner_id, client_id)?;

        let mut seeded = 0usize;
        for (patch_id, author) in store.owner_patches_in(&txn, owner_id)? {
            if author != client_id {
                store.enqueue(&txn, owner_id, client_id, patch_id)?;
                seeded += 1;
            }
        }
        txn.commit()?;

        log::info!("Registered client {client_id} ({name}) for owner {owner_id}, {seeded} patches queued");
        Ok(client_id)
    }

    pub fn get_client(&self, owner_id: u64, client_id: u64) -> Result<Client, StoreError> {
        self.store
            .client_in(self.store.db(), owner_id, client_id)?
            .ok_or(StoreError::ClientNotFound { owner_id, client_id })
    }

    /// Store a batch of client-authored patches atomically.
    ///
    /// Parents are resolved by key and may be earlier entries of the same
    /// batch. A patch whose key is already stored is skipped, so a client
    /// can safely retry an upload. Returns the ids of the patches written.
    pub fn create_patches(
        &self,
        owner_id: u64,
        batch: &[NewPatch],
    ) -> Result<Vec<u64>, StoreError> {
        let store = &self.store;
        let txn = store.begin();
        store.owner_in(&txn, owner_id)?;
        store.lock_client_seq(&txn, owner_id)?;

        let now = records::now_millis();
        let mut created = Vec::with_capacity(batch.len());
        for new in batch {
            let author = new.key.client_id;
            if author == SYSTEM_CLIENT_ID || store.client_in(&txn, owner_id, author)?.is_none() {
                return Err(StoreError::InvalidPatchKey {
                    owner_id,
                    key: new.key,
                });
            }
            if store.find_key_for_update(&txn, owner_id, &new.key)?.is_some() {
                log::debug!("Skipping already stored patch {} for owner {owner_id}", new.key);
                continue;
            }
            let parent_id = store
                .find_key_in(&txn, owner_id, &new.parent_key)?
                .ok_or(StoreError::InvalidParentKey {
                    owner_id,
                    key: new.parent_key,
                })?;

            let patch_id = store.allocate_patch_id();
            let record =
                PatchRecord::new(owner_id, parent_id, new.key, new.parent_key, &new.ops, now)?;
            self.patches.insert(&txn, patch_id, &record)?;
            created.push(patch_id);
        }
        txn.commit()?;

        log::debug!(
            "Stored {} of {} uploaded patches for owner {owner_id}",
            created.len(),
            batch.len()
        );
        Ok(created)
    }

    /// Up to `size` (capped at [`MAX_PENDING_BATCH`]) unacknowledged patches
    /// for a device, oldest first. Repeatable until acknowledged.
    ///
    /// Patch ids of one owner commit in ascending order, so a later poll
    /// only ever extends what an earlier poll returned.
    pub fn get_pending(
        &self,
        owner_id: u64,
        client_id: u64,
        size: usize,
    ) -> Result<Vec<Patch>, StoreError> {
        self.get_client(owner_id, client_id)?;
        let db = self.store.db();
        let limit = size.min(MAX_PENDING_BATCH);
        self.store
            .pending_in(db, owner_id, client_id, limit)?
            .into_iter()
            .map(|patch_id| self.patches.load(db, patch_id))
            .collect()
    }

    /// Acknowledge delivered patches. Unknown or already acknowledged keys
    /// are ignored. Returns how many entries were actually removed.
    pub fn delete_pending(
        &self,
        owner_id: u64,
        client_id: u64,
        keys: &[PatchKey],
    ) -> Result<usize, StoreError> {
        self.get_client(owner_id, client_id)?;
        let store = &self.store;
        let txn = store.begin();
        let mut removed = 0;
        for key in keys {
            if let Some(patch_id) = store.find_key_in(&txn, owner_id, key)? {
                if store.dequeue(&txn, owner_id, client_id, patch_id)? {
                    removed += 1;
                }
            }
        }
        txn.commit()?;
        Ok(removed)
    }

    /// Number of entries waiting for a device.
    pub fn pending_count(&self, owner_id: u64, client_id: u64) -> Result<usize, StoreError> {
        Ok(self
            .store
            .pending_in(self.store.db(), owner_id, client_id, usize::MAX)?
            .len())
    }
}
