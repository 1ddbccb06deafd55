//! Append-only patch storage.
//!
//! Every owner's patches form a tree rooted at a self-referencing root patch
//! that carries the initial snapshot. Records are immutable once written;
//! the only later write against a patch is a snapshot fill.

use serde_json::Value;
use std::sync::Arc;

use crate::error::StoreError;
use crate::json_patch::Op;
use crate::records::{
    self, Client, Owner, Patch, PatchKey, PatchRecord, SYSTEM_CLIENT_ID, SYSTEM_CLIENT_NAME,
};
use crate::storage::{Reader, Store, Txn};

/// Creation and lookup of owners and patches.
#[derive(Clone)]
pub struct PatchStore {
    store: Arc<Store>,
}

impl PatchStore {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Create an owner together with its system client and root patch.
    ///
    /// All rows are written in one transaction. The root id is allocated
    /// before anything is written, so the root's self-reference and the
    /// owner's head are correct in the first and only write.
    pub fn create_owner(&self, name: &str) -> Result<Owner, StoreError> {
        let store = &self.store;
        let owner_id = store.allocate_owner_id();
        let root_id = store.allocate_patch_id();
        let now = records::now_millis();

        let owner = Owner {
            id: owner_id,
            name: name.to_string(),
            enabled: true,
            head: root_id,
            created_at: now,
            updated_at: now,
        };
        let system = Client {
            owner_id,
            id: SYSTEM_CLIENT_ID,
            name: SYSTEM_CLIENT_NAME.to_string(),
            created_at: now,
        };
        let root = PatchRecord::new(
            owner_id,
            root_id,
            PatchKey::ROOT,
            PatchKey::ROOT,
            &records::initial_ops(),
            now,
        )?;

        let txn = store.begin();
        store.put_owner(&txn, &owner)?;
        store.put_client(&txn, &system)?;
        store.put_client_seq(&txn, owner_id, SYSTEM_CLIENT_ID)?;
        store.put_patch(&txn, root_id, &root)?;
        store.put_snapshot(&txn, root_id, &records::initial_document(), now)?;
        txn.commit()?;

        log::info!("Created owner {owner_id} with root patch {root_id}");
        Ok(owner)
    }

    pub fn get_owner(&self, owner_id: u64) -> Result<Owner, StoreError> {
        self.store.owner_in(self.store.db(), owner_id)
    }

    /// Append a patch on top of `parent_id`.
    ///
    /// The patch is attributed to the system client and queued for every
    /// registered device in the same transaction.
    pub fn create_patch(
        &self,
        owner_id: u64,
        parent_id: u64,
        ops: Vec<Op>,
        snapshot: Option<Value>,
    ) -> Result<Patch, StoreError> {
        let store = &self.store;
        let txn = store.begin();
        store.owner_in(&txn, owner_id)?;
        store.lock_client_seq(&txn, owner_id)?;

        let parent = match store.patch_record_in(&txn, parent_id)? {
            Some(parent) if parent.owner_id == owner_id => parent,
            _ => return Err(StoreError::InvalidParent { owner_id, parent_id }),
        };

        let patch_id = store.allocate_patch_id();
        let now = records::now_millis();
        let record = PatchRecord::new(
            owner_id,
            parent_id,
            PatchKey::system(patch_id),
            parent.key,
            &ops,
            now,
        )?;
        self.insert(&txn, patch_id, &record)?;
        if let Some(doc) = &snapshot {
            store.put_snapshot(&txn, patch_id, doc, now)?;
        }
        txn.commit()?;

        log::debug!("Created patch {patch_id} on {parent_id} for owner {owner_id}");
        Ok(Patch {
            id: patch_id,
            owner_id,
            parent_id,
            key: record.key,
            parent_key: record.parent_key,
            ops,
            snapshot,
            created_at: now,
            updated_at: now,
        })
    }

    /// Fetch a patch, including its snapshot if one was attached.
    pub fn get_patch(&self, patch_id: u64) -> Result<Patch, StoreError> {
        self.load(self.store.db(), patch_id)
    }

    /// Resolve a client-assigned key to a patch id.
    pub fn find_by_key(&self, owner_id: u64, key: &PatchKey) -> Result<Option<u64>, StoreError> {
        self.store.find_key_in(self.store.db(), owner_id, key)
    }

    /// Attach a materialized document to an existing patch.
    ///
    /// Idempotent: the document for a given patch id is always the same.
    pub fn attach_snapshot(&self, patch_id: u64, doc: &Value) -> Result<(), StoreError> {
        let store = &self.store;
        let txn = store.begin();
        if store.patch_record_in(&txn, patch_id)?.is_none() {
            return Err(StoreError::PatchNotFound(patch_id));
        }
        store.put_snapshot(&txn, patch_id, doc, records::now_millis())?;
        txn.commit()?;
        Ok(())
    }

    /// The owner's root patch.
    pub fn root_of(&self, owner_id: u64) -> Result<Patch, StoreError> {
        let store = &self.store;
        store.owner_in(store.db(), owner_id)?;
        let first = store
            .owner_patches_in(store.db(), owner_id)?
            .first()
            .map(|(id, _)| *id)
            .ok_or_else(|| StoreError::corrupted(0, format!("owner {owner_id} has no patches")))?;
        let root = self.get_patch(first)?;
        if !root.is_root() {
            return Err(StoreError::corrupted(first, "oldest patch is not self-referencing"));
        }
        Ok(root)
    }

    // ─── Transaction helpers ──────────────────────────────────────────

    pub(crate) fn load(&self, r: &impl Reader, patch_id: u64) -> Result<Patch, StoreError> {
        let record = self
            .store
            .patch_record_in(r, patch_id)?
            .ok_or(StoreError::PatchNotFound(patch_id))?;
        let snapshot = self.store.snapshot_in(r, patch_id)?;
        record.into_patch(patch_id, snapshot)
    }

    /// Write a patch row and queue it for every device except its author.
    ///
    /// The caller must hold the owner's client sequence lock.
    pub(crate) fn insert(
        &self,
        txn: &Txn<'_>,
        patch_id: u64,
        record: &PatchRecord,
    ) -> Result<(), StoreError> {
        let store = &self.store;
        store.put_patch(txn, patch_id, record)?;

        let author = record.key.client_id;
        for client_id in store.client_ids_in(txn, record.owner_id)? {
            if client_id != SYSTEM_CLIENT_ID && client_id != author {
                store.enqueue(txn, record.owner_id, client_id, patch_id)?;
            }
        }
        Ok(())
    }
}
