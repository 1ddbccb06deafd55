//! Column family names and big-endian key layouts.
//!
//! Every id is a `u64` written big-endian so lexicographic key order equals
//! numeric order, and prefix scans by owner (or owner + client) return rows
//! in creation order.

use crate::records::PatchKey;

/// `owner_id` → Owner
pub const CF_OWNERS: &str = "owners";
/// `patch_id` → PatchRecord
pub const CF_PATCHES: &str = "patches";
/// `patch_id` → fill time + compressed document
pub const CF_SNAPSHOTS: &str = "snapshots";
/// `owner_id | patch_id` → author client id
pub const CF_OWNER_PATCHES: &str = "owner_patches";
/// `owner_id | client | session | patch` → patch_id
pub const CF_PATCH_KEYS: &str = "patch_keys";
/// `owner_id | client_id` → Client
pub const CF_CLIENTS: &str = "clients";
/// `owner_id` → last assigned client id
pub const CF_CLIENT_SEQS: &str = "client_seqs";
/// `owner_id | consumer client_id | patch_id` → empty
pub const CF_PENDING: &str = "pending";

pub const COLUMN_FAMILIES: &[&str] = &[
    CF_OWNERS,
    CF_PATCHES,
    CF_SNAPSHOTS,
    CF_OWNER_PATCHES,
    CF_PATCH_KEYS,
    CF_CLIENTS,
    CF_CLIENT_SEQS,
    CF_PENDING,
];

pub fn id_key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

pub fn pair_key(a: u64, b: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&a.to_be_bytes());
    key.extend_from_slice(&b.to_be_bytes());
    key
}

pub fn pending_key(owner_id: u64, client_id: u64, patch_id: u64) -> Vec<u8> {
    let mut key = pair_key(owner_id, client_id);
    key.extend_from_slice(&patch_id.to_be_bytes());
    key
}

pub fn patch_key_index(owner_id: u64, key: &PatchKey) -> Vec<u8> {
    let mut out = Vec::with_capacity(32);
    out.extend_from_slice(&owner_id.to_be_bytes());
    out.extend_from_slice(&key.client_id.to_be_bytes());
    out.extend_from_slice(&key.session_id.to_be_bytes());
    out.extend_from_slice(&key.patch_id.to_be_bytes());
    out
}

/// Read the big-endian `u64` at word `index` of a key or value.
pub fn read_u64(bytes: &[u8], index: usize) -> Option<u64> {
    let start = index * 8;
    let word = bytes.get(start..start + 8)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(word);
    Some(u64::from_be_bytes(buf))
}
