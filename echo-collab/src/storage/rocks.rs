//! RocksDB-backed change store.
//!
//! Column families:
//! - `changes`   — Signed changes (LZ4 compressed, keyed by space:actor:seq)
//! - `snapshots` — Latest space snapshot (already compressed by the space)
//! - `metadata`  — Per-space counters and timestamps (bincode)
//!
//! Keys of `changes` sort by `(space, actor, seq)`, so loading a space is a
//! single prefix scan that yields changes in the order a change log replays
//! them.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use echo_core::{Change, ChangeStore, SpaceId, StorageError};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode, Direction, IteratorMode,
    Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const CF_CHANGES: &str = "changes";
const CF_SNAPSHOTS: &str = "snapshots";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_CHANGES, CF_SNAPSHOTS, CF_METADATA];

/// space (16) + actor (32) + seq (8, big-endian)
const CHANGE_KEY_LEN: usize = 16 + 32 + 8;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    pub create_if_missing: bool,
    /// fsync every write; a change must be durable before it is acknowledged
    pub sync_writes: bool,
    /// LZ4 block compression inside RocksDB
    pub compression: bool,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("echo_data"),
            create_if_missing: true,
            sync_writes: true,
            compression: true,
            block_cache_size: 64 * 1024 * 1024, // 64MB
            bloom_filter_bits: 10,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024, // 32MB
        }
    }
}

impl StoreConfig {
    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            create_if_missing: true,
            sync_writes: false,
            compression: true,
            block_cache_size: 8 * 1024 * 1024, // 8MB
            bloom_filter_bits: 10,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024, // 4MB
        }
    }
}

/// Bookkeeping stored next to each space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceMetadata {
    pub space: Uuid,
    pub change_count: u64,
    /// Size of the stored snapshot in bytes
    pub snapshot_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl SpaceMetadata {
    fn new(space: SpaceId) -> Self {
        let now = unix_now();
        Self {
            space: space.0,
            change_count: 0,
            snapshot_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Space has no records
    NotFound(SpaceId),
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
    /// Column family missing from an opened database
    MissingColumnFamily(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Space not found: {id}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::MissingColumnFamily(name) => write!(f, "Column family '{name}' not found"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

impl From<StoreError> for StorageError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DatabaseError(e) => StorageError::Io(e),
            other => StorageError::Corrupt(other.to_string()),
        }
    }
}

/// Durable [`ChangeStore`] on RocksDB.
pub struct RocksStore {
    /// Single-threaded column family mode; every column family is created at open
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Opens (or creates) the database and its column families.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(config.create_if_missing);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        log::info!("Opened change store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024); // 16KB blocks
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(if config.compression {
            DBCompressionType::Lz4
        } else {
            DBCompressionType::None
        });
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_CHANGES => {
                // Many small appends, prefix-scanned by space
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            CF_SNAPSHOTS => {
                // Large values, already LZ4 compressed
                opts.set_max_write_buffer_number(2);
                opts.set_compression_type(DBCompressionType::None);
            }
            CF_METADATA => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    // ─── Changes ──────────────────────────────────────────────────────

    fn put_change(&self, space: SpaceId, change: &Change) -> Result<(), StoreError> {
        let cf_changes = self.cf(CF_CHANGES)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let encoded = change
            .encode()
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&encoded);
        let key = Self::change_key(space, change);

        // Rewrites of an existing key keep the count stable.
        let exists = self.db.get_pinned_cf(&cf_changes, &key)?.is_some();
        let mut meta = self.load_metadata(space)?.unwrap_or_else(|| SpaceMetadata::new(space));
        if !exists {
            meta.change_count += 1;
        }
        meta.updated_at = unix_now();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_changes, &key, &compressed);
        batch.put_cf(&cf_meta, space.0.as_bytes(), meta.encode()?);
        self.write(batch)
    }

    fn scan_changes(&self, space: SpaceId) -> Result<Vec<Change>, StoreError> {
        let cf = self.cf(CF_CHANGES)?;
        let prefix = space.0.as_bytes();

        let mut changes = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if key.len() != CHANGE_KEY_LEN || &key[..16] != prefix {
                break;
            }
            let decompressed = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::CompressionError(e.to_string()))?;
            let change =
                Change::decode(&decompressed).map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            changes.push(change);
        }
        Ok(changes)
    }

    /// Number of changes stored for a space.
    pub fn change_count(&self, space: SpaceId) -> Result<u64, StoreError> {
        Ok(self.load_metadata(space)?.map_or(0, |m| m.change_count))
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    fn put_snapshot(&self, space: SpaceId, snapshot: &[u8]) -> Result<(), StoreError> {
        let cf_snap = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut meta = self.load_metadata(space)?.unwrap_or_else(|| SpaceMetadata::new(space));
        meta.snapshot_size = snapshot.len() as u64;
        meta.updated_at = unix_now();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_snap, space.0.as_bytes(), snapshot);
        batch.put_cf(&cf_meta, space.0.as_bytes(), meta.encode()?);
        self.write(batch)
    }

    fn get_snapshot(&self, space: SpaceId) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        Ok(self.db.get_cf(&cf, space.0.as_bytes())?)
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn load_metadata(&self, space: SpaceId) -> Result<Option<SpaceMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, space.0.as_bytes())? {
            Some(bytes) => Ok(Some(SpaceMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Metadata of a space that must exist.
    pub fn metadata(&self, space: SpaceId) -> Result<SpaceMetadata, StoreError> {
        self.load_metadata(space)?.ok_or(StoreError::NotFound(space))
    }

    fn spaces(&self) -> Result<Vec<SpaceId>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let bytes: [u8; 16] = key
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::DeserializationError("Invalid space key".into()))?;
            ids.push(SpaceId(Uuid::from_bytes(bytes)));
        }
        Ok(ids)
    }

    /// Deletes every record of a space in one batch.
    fn remove_space(&self, space: SpaceId) -> Result<(), StoreError> {
        let cf_changes = self.cf(CF_CHANGES)?;
        let cf_snap = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let prefix = space.0.as_bytes();

        let mut batch = WriteBatch::default();
        let mut removed = 0u64;
        for item in self
            .db
            .iterator_cf(&cf_changes, IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, _) = item?;
            if key.len() != CHANGE_KEY_LEN || &key[..16] != prefix {
                break;
            }
            batch.delete_cf(&cf_changes, &key);
            removed += 1;
        }
        batch.delete_cf(&cf_snap, prefix);
        batch.delete_cf(&cf_meta, prefix);
        self.write(batch)?;
        log::debug!("Deleted space {space} from store ({removed} changes)");
        Ok(())
    }

    /// Flushes memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::MissingColumnFamily(name.to_string()))
    }

    fn change_key(space: SpaceId, change: &Change) -> Vec<u8> {
        let mut key = Vec::with_capacity(CHANGE_KEY_LEN);
        key.extend_from_slice(space.0.as_bytes());
        key.extend_from_slice(change.actor.as_bytes());
        key.extend_from_slice(&change.seq.to_be_bytes());
        key
    }
}

impl ChangeStore for RocksStore {
    fn append_change(&self, space: SpaceId, change: &Change) -> Result<(), StorageError> {
        Ok(self.put_change(space, change)?)
    }

    fn load_changes(&self, space: SpaceId) -> Result<Vec<Change>, StorageError> {
        Ok(self.scan_changes(space)?)
    }

    fn save_snapshot(&self, space: SpaceId, snapshot: &[u8]) -> Result<(), StorageError> {
        Ok(self.put_snapshot(space, snapshot)?)
    }

    fn load_snapshot(&self, space: SpaceId) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.get_snapshot(space)?)
    }

    fn delete_space(&self, space: SpaceId) -> Result<(), StorageError> {
        Ok(self.remove_space(space)?)
    }

    fn list_spaces(&self) -> Result<Vec<SpaceId>, StorageError> {
        Ok(self.spaces()?)
    }

    fn flush(&self) -> Result<(), StorageError> {
        Ok(self.sync()?)
    }
}

impl std::fmt::Debug for RocksStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksStore").field("path", &self.config.path).finish()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
