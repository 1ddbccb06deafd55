//! RocksDB-backed storage handle.
//!
//! One `TransactionDB` is opened per process and shared by every component
//! through an `Arc<Store>`. Mutations run inside pessimistic transactions;
//! row locks taken with `get_for_update` serialize the few places that need
//! it (head compare-and-swap, client registration versus patch fan-out).
//!
//! Reference: Kleppmann, DDIA, Chapter 7 (Transactions)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    Direction, IteratorMode, Options, SingleThreaded, Transaction, TransactionDB,
    TransactionDBOptions, TransactionOptions, WriteOptions,
};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::keys::{self, *};
use crate::error::StoreError;
use crate::records::{self, Client, Owner, PatchKey, PatchRecord};

pub(crate) type Txn<'a> = Transaction<'a, TransactionDB<SingleThreaded>>;

type Row = (Box<[u8]>, Box<[u8]>);

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Fsync on every commit (default: true)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
    /// Replays slower than this write a snapshot back (default: 1s)
    pub snapshot_threshold: Duration,
    /// How long a transaction waits on a row lock (default: 5s)
    pub lock_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("ebs_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
            snapshot_threshold: Duration::from_secs(1),
            lock_timeout: Duration::from_secs(5),
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
            snapshot_threshold: Duration::from_secs(1),
            lock_timeout: Duration::from_secs(5),
        }
    }
}

/// Point reads and prefix scans, shared by the database and by open
/// transactions (which also see their own uncommitted writes).
pub(crate) trait Reader {
    fn get(&self, cf: &ColumnFamily, key: &[u8]) -> Result<Option<Vec<u8>>, rocksdb::Error>;

    /// Up to `limit` rows whose key starts with `prefix`, in key order.
    fn scan(
        &self,
        cf: &ColumnFamily,
        prefix: &[u8],
        limit: usize,
    ) -> Result<Vec<Row>, rocksdb::Error>;
}

fn take_prefix<I>(iter: I, prefix: &[u8], limit: usize) -> Result<Vec<Row>, rocksdb::Error>
where
    I: Iterator<Item = Result<Row, rocksdb::Error>>,
{
    let mut rows = Vec::new();
    for item in iter {
        if rows.len() >= limit {
            break;
        }
        let (key, value) = item?;
        if !key.starts_with(prefix) {
            break;
        }
        rows.push((key, value));
    }
    Ok(rows)
}

impl Reader for TransactionDB<SingleThreaded> {
    fn get(&self, cf: &ColumnFamily, key: &[u8]) -> Result<Option<Vec<u8>>, rocksdb::Error> {
        self.get_cf(cf, key)
    }

    fn scan(
        &self,
        cf: &ColumnFamily,
        prefix: &[u8],
        limit: usize,
    ) -> Result<Vec<Row>, rocksdb::Error> {
        take_prefix(
            self.iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward)),
            prefix,
            limit,
        )
    }
}

impl Reader for Txn<'_> {
    fn get(&self, cf: &ColumnFamily, key: &[u8]) -> Result<Option<Vec<u8>>, rocksdb::Error> {
        self.get_cf(cf, key)
    }

    fn scan(
        &self,
        cf: &ColumnFamily,
        prefix: &[u8],
        limit: usize,
    ) -> Result<Vec<Row>, rocksdb::Error> {
        take_prefix(
            self.iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward)),
            prefix,
            limit,
        )
    }
}

/// Shared storage handle.
pub struct Store {
    db: TransactionDB<SingleThreaded>,
    config: StoreConfig,
    /// Next owner id to hand out
    next_owner: AtomicU64,
    /// Next patch id to hand out (global across owners)
    next_patch: AtomicU64,
}

impl Store {
    /// Open the store at the configured path.
    ///
    /// Creates the database and column families if they don't exist, then
    /// recovers the id sequences from the highest stored keys.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let mut txn_db_opts = TransactionDBOptions::default();
        txn_db_opts.set_txn_lock_timeout(config.lock_timeout.as_millis() as i64);

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config, &cache)))
            .collect();

        let db = TransactionDB::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &txn_db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let next_owner = Self::recover_sequence(&db, CF_OWNERS);
        let next_patch = Self::recover_sequence(&db, CF_PATCHES);
        log::info!(
            "Opened store at {} (next owner {next_owner}, next patch {next_patch})",
            config.path.display()
        );

        Ok(Self {
            db,
            config,
            next_owner: AtomicU64::new(next_owner),
            next_patch: AtomicU64::new(next_patch),
        })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig, cache: &Cache) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            // Payloads are already LZ4 blocks
            CF_PATCHES | CF_SNAPSHOTS => {
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            // Many small inserts and deletes, scanned by prefix
            CF_PENDING | CF_OWNER_PATCHES => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(4);
            }
            _ => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
            }
        }

        opts
    }

    /// Id following the highest key of an id-keyed column family (ids start at 1).
    fn recover_sequence(db: &TransactionDB<SingleThreaded>, cf_name: &str) -> u64 {
        let cf = match db.cf_handle(cf_name) {
            Some(cf) => cf,
            None => return 1,
        };

        let mut iter = db.iterator_cf(cf, IteratorMode::End);
        match iter.next() {
            Some(Ok((key, _))) => keys::read_u64(&key, 0).map_or(1, |id| id + 1),
            _ => 1,
        }
    }

    // ─── Transactions ─────────────────────────────────────────────────

    /// Begin a pessimistic transaction honouring the configured lock timeout.
    pub(crate) fn begin(&self) -> Txn<'_> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        let mut txn_opts = TransactionOptions::default();
        txn_opts.set_lock_timeout(self.config.lock_timeout.as_millis() as i64);
        txn_opts.set_deadlock_detect(true);
        self.db.transaction_opt(&write_opts, &txn_opts)
    }

    pub(crate) fn db(&self) -> &TransactionDB<SingleThreaded> {
        &self.db
    }

    pub(crate) fn allocate_owner_id(&self) -> u64 {
        self.next_owner.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn allocate_patch_id(&self) -> u64 {
        self.next_patch.fetch_add(1, Ordering::SeqCst)
    }

    /// Get a column family handle.
    pub(crate) fn cf(&self, name: &str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    // ─── Row access ───────────────────────────────────────────────────

    pub(crate) fn owner_in(&self, r: &impl Reader, owner_id: u64) -> Result<Owner, StoreError> {
        match r.get(self.cf(CF_OWNERS)?, &id_key(owner_id))? {
            Some(bytes) => Owner::decode(&bytes),
            None => Err(StoreError::OwnerNotFound(owner_id)),
        }
    }

    /// Read the owner row under an exclusive lock held until commit.
    pub(crate) fn owner_for_update(&self, txn: &Txn<'_>, owner_id: u64) -> Result<Owner, StoreError> {
        match txn.get_for_update_cf(self.cf(CF_OWNERS)?, id_key(owner_id), true)? {
            Some(bytes) => Owner::decode(&bytes),
            None => Err(StoreError::OwnerNotFound(owner_id)),
        }
    }

    pub(crate) fn put_owner(&self, txn: &Txn<'_>, owner: &Owner) -> Result<(), StoreError> {
        txn.put_cf(self.cf(CF_OWNERS)?, id_key(owner.id), owner.encode()?)?;
        Ok(())
    }

    pub(crate) fn patch_record_in(
        &self,
        r: &impl Reader,
        patch_id: u64,
    ) -> Result<Option<PatchRecord>, StoreError> {
        r.get(self.cf(CF_PATCHES)?, &id_key(patch_id))?
            .map(|bytes| PatchRecord::decode(&bytes))
            .transpose()
    }

    /// Insert a patch row plus its owner and key index entries.
    pub(crate) fn put_patch(
        &self,
        txn: &Txn<'_>,
        patch_id: u64,
        record: &PatchRecord,
    ) -> Result<(), StoreError> {
        txn.put_cf(self.cf(CF_PATCHES)?, id_key(patch_id), record.encode()?)?;
        txn.put_cf(
            self.cf(CF_OWNER_PATCHES)?,
            pair_key(record.owner_id, patch_id),
            id_key(record.key.client_id),
        )?;
        txn.put_cf(
            self.cf(CF_PATCH_KEYS)?,
            patch_key_index(record.owner_id, &record.key),
            id_key(patch_id),
        )?;
        Ok(())
    }

    pub(crate) fn snapshot_in(
        &self,
        r: &impl Reader,
        patch_id: u64,
    ) -> Result<Option<(Value, u64)>, StoreError> {
        r.get(self.cf(CF_SNAPSHOTS)?, &id_key(patch_id))?
            .map(|bytes| records::decode_snapshot(&bytes))
            .transpose()
    }

    pub(crate) fn put_snapshot(
        &self,
        txn: &Txn<'_>,
        patch_id: u64,
        doc: &Value,
        filled_at: u64,
    ) -> Result<(), StoreError> {
        txn.put_cf(
            self.cf(CF_SNAPSHOTS)?,
            id_key(patch_id),
            records::encode_snapshot(doc, filled_at)?,
        )?;
        Ok(())
    }

    pub(crate) fn find_key_in(
        &self,
        r: &impl Reader,
        owner_id: u64,
        key: &PatchKey,
    ) -> Result<Option<u64>, StoreError> {
        Ok(r
            .get(self.cf(CF_PATCH_KEYS)?, &patch_key_index(owner_id, key))?
            .and_then(|bytes| keys::read_u64(&bytes, 0)))
    }

    /// Resolve a key under an exclusive lock on its index row, held until
    /// commit. A concurrent writer of the same key waits and then sees the
    /// committed row.
    pub(crate) fn find_key_for_update(
        &self,
        txn: &Txn<'_>,
        owner_id: u64,
        key: &PatchKey,
    ) -> Result<Option<u64>, StoreError> {
        Ok(txn
            .get_for_update_cf(self.cf(CF_PATCH_KEYS)?, patch_key_index(owner_id, key), true)?
            .and_then(|bytes| keys::read_u64(&bytes, 0)))
    }

    /// `(patch_id, author client id)` of every patch of an owner, oldest first.
    pub(crate) fn owner_patches_in(
        &self,
        r: &impl Reader,
        owner_id: u64,
    ) -> Result<Vec<(u64, u64)>, StoreError> {
        let rows = r.scan(self.cf(CF_OWNER_PATCHES)?, &id_key(owner_id), usize::MAX)?;
        Ok(rows
            .iter()
            .filter_map(|(key, value)| Some((keys::read_u64(key, 1)?, keys::read_u64(value, 0)?)))
            .collect())
    }

    pub(crate) fn client_in(
        &self,
        r: &impl Reader,
        owner_id: u64,
        client_id: u64,
    ) -> Result<Option<Client>, StoreError> {
        r.get(self.cf(CF_CLIENTS)?, &pair_key(owner_id, client_id))?
            .map(|bytes| Client::decode(&bytes))
            .transpose()
    }

    pub(crate) fn put_client(&self, txn: &Txn<'_>, client: &Client) -> Result<(), StoreError> {
        txn.put_cf(
            self.cf(CF_CLIENTS)?,
            pair_key(client.owner_id, client.id),
            client.encode()?,
        )?;
        Ok(())
    }

    /// Client ids registered for an owner, ascending.
    pub(crate) fn client_ids_in(&self, r: &impl Reader, owner_id: u64) -> Result<Vec<u64>, StoreError> {
        let rows = r.scan(self.cf(CF_CLIENTS)?, &id_key(owner_id), usize::MAX)?;
        Ok(rows.iter().filter_map(|(key, _)| keys::read_u64(key, 1)).collect())
    }

    /// Exclusively lock the owner's client sequence row until commit.
    ///
    /// Every patch writer and every client registration of an owner takes
    /// it, so a fan-out never misses a concurrently created client and patch
    /// ids allocated under it commit in ascending order.
    pub(crate) fn lock_client_seq(&self, txn: &Txn<'_>, owner_id: u64) -> Result<u64, StoreError> {
        let last = txn.get_for_update_cf(self.cf(CF_CLIENT_SEQS)?, id_key(owner_id), true)?;
        Ok(last.and_then(|bytes| keys::read_u64(&bytes, 0)).unwrap_or(0))
    }

    pub(crate) fn put_client_seq(&self, txn: &Txn<'_>, owner_id: u64, last: u64) -> Result<(), StoreError> {
        txn.put_cf(self.cf(CF_CLIENT_SEQS)?, id_key(owner_id), id_key(last))?;
        Ok(())
    }

    pub(crate) fn enqueue(
        &self,
        txn: &Txn<'_>,
        owner_id: u64,
        client_id: u64,
        patch_id: u64,
    ) -> Result<(), StoreError> {
        txn.put_cf(self.cf(CF_PENDING)?, pending_key(owner_id, client_id, patch_id), b"")?;
        Ok(())
    }

    /// Remove one queue entry; `false` if it was already gone.
    pub(crate) fn dequeue(
        &self,
        txn: &Txn<'_>,
        owner_id: u64,
        client_id: u64,
        patch_id: u64,
    ) -> Result<bool, StoreError> {
        let cf = self.cf(CF_PENDING)?;
        let key = pending_key(owner_id, client_id, patch_id);
        if txn.get_for_update_cf(cf, &key, true)?.is_none() {
            return Ok(false);
        }
        txn.delete_cf(cf, &key)?;
        Ok(true)
    }

    /// Patch ids queued for a client, oldest first.
    pub(crate) fn pending_in(
        &self,
        r: &impl Reader,
        owner_id: u64,
        client_id: u64,
        limit: usize,
    ) -> Result<Vec<u64>, StoreError> {
        let rows = r.scan(self.cf(CF_PENDING)?, &pair_key(owner_id, client_id), limit)?;
        Ok(rows.iter().filter_map(|(key, _)| keys::read_u64(key, 2)).collect())
    }

    // ─── Accessors ────────────────────────────────────────────────────

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
