//! Document materialization by patch replay.
//!
//! ```text
//!  snapshot ──► p1 ──► p2 ──► ... ──► target
//!  (base)       ops    ops            ops
//! ```
//!
//! The walk follows parent links from the target back to the nearest patch
//! carrying a snapshot, then replays the collected operation lists forward.
//! When walk plus replay takes longer than the configured threshold, the
//! result is written back as the target's snapshot so the next read of this
//! id (or any descendant) starts from there.

use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::StoreError;
use crate::json_patch::{self, Op};
use crate::patches::PatchStore;
use crate::storage::Store;

/// Outcome of one reconstruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconstruction {
    pub patch_id: u64,
    pub document: Value,
    /// Number of patches whose operations were replayed
    pub replayed: usize,
    pub elapsed: Duration,
    /// Whether the document was written back as a snapshot
    pub snapshot_written: bool,
}

/// Materializes the document as of any patch id.
#[derive(Clone)]
pub struct Reconstructor {
    store: Arc<Store>,
    patches: PatchStore,
    threshold: Duration,
}

impl Reconstructor {
    /// Create with the threshold from the store configuration.
    pub fn new(store: Arc<Store>) -> Self {
        let threshold = store.config().snapshot_threshold;
        Self::with_threshold(store, threshold)
    }

    pub fn with_threshold(store: Arc<Store>, threshold: Duration) -> Self {
        Self {
            patches: PatchStore::new(store.clone()),
            store,
            threshold,
        }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// The document as of `patch_id`.
    pub fn get_data(&self, patch_id: u64) -> Result<Value, StoreError> {
        Ok(self.reconstruct(patch_id)?.document)
    }

    /// Reconstruct with timing and write-back details.
    pub fn reconstruct(&self, patch_id: u64) -> Result<Reconstruction, StoreError> {
        let started = Instant::now();
        let (base, chain) = self.walk(patch_id)?;

        let mut document = base;
        for (id, ops) in chain.iter().rev() {
            json_patch::apply(&mut document, ops)
                .map_err(|e| StoreError::corrupted(*id, e.to_string()))?;
        }
        let elapsed = started.elapsed();

        let replayed = chain.len();
        let mut snapshot_written = false;
        if replayed > 0 && elapsed >= self.threshold {
            match self.patches.attach_snapshot(patch_id, &document) {
                Ok(()) => {
                    snapshot_written = true;
                    log::info!(
                        "Wrote snapshot for patch {patch_id} after replaying {replayed} patches in {elapsed:?}"
                    );
                }
                Err(e) => log::warn!("Snapshot write-back for patch {patch_id} failed: {e}"),
            }
        }

        Ok(Reconstruction {
            patch_id,
            document,
            replayed,
            elapsed,
            snapshot_written,
        })
    }

    /// Walk back to the nearest snapshot.
    ///
    /// Returns the snapshot document and the operation lists to replay,
    /// target first. Each node is visited at most once.
    fn walk(&self, patch_id: u64) -> Result<(Value, Vec<(u64, Vec<Op>)>), StoreError> {
        let db = self.store.db();
        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        let mut current = patch_id;

        loop {
            if !visited.insert(current) {
                return Err(StoreError::corrupted(current, "cycle in parent links"));
            }
            // Snapshots are only ever attached to existing patches.
            if let Some((doc, _)) = self.store.snapshot_in(db, current)? {
                return Ok((doc, chain));
            }

            let record = match self.store.patch_record_in(db, current)? {
                Some(record) => record,
                None if current == patch_id => return Err(StoreError::PatchNotFound(patch_id)),
                None => return Err(StoreError::corrupted(current, "missing ancestor")),
            };
            if record.parent_id == current {
                return Err(StoreError::corrupted(current, "root without snapshot"));
            }
            let next = record.parent_id;
            chain.push((current, record.ops()?));
            current = next;
        }
    }
}
