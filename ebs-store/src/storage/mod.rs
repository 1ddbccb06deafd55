//! Persistent storage layer.
//!
//! ```text
//! ┌──────────────┐ ┌───────────────┐ ┌─────────────┐ ┌──────────┐
//! │ PatchStore   │ │ Reconstructor │ │ HeadRegistry│ │ SyncQueue│
//! └──────┬───────┘ └───────┬───────┘ └──────┬──────┘ └────┬─────┘
//!        └─────────────────┴───── Arc<Store> ┴─────────────┘
//!                                    │
//!        ┌───────────────────────────┴───────────────────────────┐
//!        │ TransactionDB (RocksDB, pessimistic row locks)        │
//!        │  owners · patches · snapshots · owner_patches         │
//!        │  patch_keys · clients · client_seqs · pending         │
//!        └───────────────────────────────────────────────────────┘
//! ```

pub(crate) mod keys;
pub mod rocks;

pub use rocks::{Store, StoreConfig};
pub(crate) use rocks::{Reader, Txn};
