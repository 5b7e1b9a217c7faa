//! RocksDB-backed operation log and version authority.
//!
//! Column families:
//! - `operations` — committed operations (LZ4-compressed bincode, keyed by
//!   `doc_id:16 bytes || base_version:8 bytes big-endian`)
//! - `versions`   — authoritative version counter per document (u64 BE)
//! - `metadata`   — per-document bookkeeping (operation count, byte totals,
//!   timestamps)
//!
//! `append_committed` is the only write path for operations; it verifies
//! the caller's base version against the counter and advances both the log
//! and the counter in a single write batch. Callers must hold the
//! document's lock — the version check here is the backstop against a
//! misbehaving peer process, not a substitute for the lock.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use uuid::Uuid;

use crate::transform::Operation;

/// Column family names.
const CF_OPERATIONS: &str = "operations";
const CF_VERSIONS: &str = "versions";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_OPERATIONS, CF_VERSIONS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 128MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false — RocksDB WAL covers
    /// crash atomicity, periodic flush covers durability)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("chorus_data"),
            block_cache_size: 128 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Per-document bookkeeping stored alongside the version counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentLogMetadata {
    pub document_id: Uuid,
    /// Mirror of the version counter at last write.
    pub version: u64,
    /// Committed operations currently stored.
    pub operation_count: u64,
    /// Compressed bytes stored for this document's operations.
    pub stored_bytes: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last append timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl DocumentLogMetadata {
    fn new(document_id: Uuid) -> Self {
        let now = epoch_secs();
        Self {
            document_id,
            version: 0,
            operation_count: 0,
            stored_bytes: 0,
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
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Document not found
    NotFound(Uuid),
    /// Append base version does not match the authoritative counter.
    /// The log and counter are untouched; re-read and rebase, then retry.
    VersionConflict {
        document_id: Uuid,
        expected: u64,
        actual: u64,
    },
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Document not found: {id}"),
            StoreError::VersionConflict {
                document_id,
                expected,
                actual,
            } => write!(
                f,
                "Version conflict on {document_id}: append base {actual}, authority at {expected}"
            ),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// RocksDB-backed operation log.
///
/// Single-threaded RocksDB mode — cross-task concurrency is handled by
/// tokio, cross-process serialization by the lock manager.
pub struct OperationLog {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl OperationLog {
    /// Open the log at the configured path, creating the database and
    /// column families as needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| {
                let cf_opts = Self::cf_options(name, &config);
                ColumnFamilyDescriptor::new(*name, cf_opts)
            })
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_OPERATIONS => {
                // Many small writes, prefix-scanned by doc_id during
                // catch-up and rebase.
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            CF_VERSIONS | CF_METADATA => {
                // Tiny values, point-read on every submit.
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    // ─── Version Authority ────────────────────────────────────────────

    /// Current authoritative committed version; 0 when the document has no
    /// committed operations yet.
    pub fn latest_version(&self, document_id: Uuid) -> Result<u64, StoreError> {
        let cf = self.cf(CF_VERSIONS)?;
        match self.db.get_cf(&cf, document_id.as_bytes())? {
            Some(bytes) => decode_u64(&bytes),
            None => Ok(0),
        }
    }

    // ─── Committed Operations ─────────────────────────────────────────

    /// Durably append a committed operation and advance the version
    /// counter, atomically.
    ///
    /// Callers must hold the document's lock and have already rebased the
    /// operation onto the latest version. A base-version mismatch returns
    /// [`StoreError::VersionConflict`] and leaves both the log and counter
    /// untouched, so the caller can re-read, rebase again, and retry.
    ///
    /// Returns the new authoritative version.
    pub fn append_committed(&self, op: &Operation) -> Result<u64, StoreError> {
        let cf_ops = self.cf(CF_OPERATIONS)?;
        let cf_versions = self.cf(CF_VERSIONS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let current = self.latest_version(op.document_id)?;
        if op.base_version != current {
            return Err(StoreError::VersionConflict {
                document_id: op.document_id,
                expected: current,
                actual: op.base_version,
            });
        }

        let encoded = bincode::serde::encode_to_vec(op, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&encoded);

        let new_version = current + 1;
        let mut meta = self
            .load_metadata(op.document_id)
            .unwrap_or_else(|_| DocumentLogMetadata::new(op.document_id));
        meta.version = new_version;
        meta.operation_count += 1;
        meta.stored_bytes += compressed.len() as u64;
        meta.updated_at = epoch_secs();

        // One batch: operation row, version counter, metadata. Either all
        // three land or none do.
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_ops, operation_key(op.document_id, op.base_version), &compressed);
        batch.put_cf(&cf_versions, op.document_id.as_bytes(), new_version.to_be_bytes());
        batch.put_cf(&cf_meta, op.document_id.as_bytes(), meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(new_version)
    }

    /// All committed operations a holder of `version` has not seen, in
    /// ascending base-version order.
    ///
    /// Operations are keyed by the version they were based on, so "since
    /// version N" returns every operation with `base_version >= N` — the
    /// ops that moved the document from N to its current version.
    pub fn operations_since(
        &self,
        document_id: Uuid,
        version: u64,
    ) -> Result<Vec<Operation>, StoreError> {
        let cf = self.cf(CF_OPERATIONS)?;
        let start_key = operation_key(document_id, version);

        let mut operations = Vec::new();
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );

        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if key.len() < 24 || &key[..16] != document_id.as_bytes() {
                break;
            }

            let decompressed = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::CompressionError(e.to_string()))?;
            let (op, _): (Operation, _) =
                bincode::serde::decode_from_slice(&decompressed, bincode::config::standard())
                    .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            operations.push(op);
        }

        Ok(operations)
    }

    /// Number of committed operations stored for a document.
    pub fn operation_count(&self, document_id: Uuid) -> Result<u64, StoreError> {
        Ok(self.load_metadata(document_id)?.operation_count)
    }

    // ─── Metadata & Maintenance ───────────────────────────────────────

    /// Load per-document bookkeeping.
    pub fn load_metadata(&self, document_id: Uuid) -> Result<DocumentLogMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, document_id.as_bytes())? {
            Some(bytes) => DocumentLogMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(document_id)),
        }
    }

    /// All documents with log state, from the version counter CF.
    pub fn list_documents(&self) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_VERSIONS)?;
        let mut document_ids = Vec::new();

        let iter = self.db.iterator_cf(&cf, IteratorMode::Start);
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if key.len() == 16 {
                let id = Uuid::from_bytes(
                    key.as_ref()
                        .try_into()
                        .map_err(|_| StoreError::DeserializationError("Invalid UUID key".into()))?,
                );
                document_ids.push(id);
            }
        }

        Ok(document_ids)
    }

    /// Reclaim all log storage for a document: operations, version counter
    /// and metadata in one batch. Used by the cleanup sweeper once no
    /// session references the document.
    pub fn delete_document(&self, document_id: Uuid) -> Result<u64, StoreError> {
        let cf_ops = self.cf(CF_OPERATIONS)?;
        let cf_versions = self.cf(CF_VERSIONS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_versions, document_id.as_bytes());
        batch.delete_cf(&cf_meta, document_id.as_bytes());

        let mut removed = 0u64;
        let start_key = operation_key(document_id, 0);
        let iter = self.db.iterator_cf(
            &cf_ops,
            IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if key.len() < 24 || &key[..16] != document_id.as_bytes() {
                break;
            }
            batch.delete_cf(&cf_ops, &key);
            removed += 1;
        }

        self.db.write(batch)?;
        Ok(removed)
    }

    /// Force a flush to disk (called periodically by the owner).
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db
            .flush()
            .map_err(|e| StoreError::DatabaseError(e.to_string()))
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

/// Build an operation key: doc_id (16 bytes) + base_version (8 bytes BE).
fn operation_key(document_id: Uuid, base_version: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(document_id.as_bytes());
    key.extend_from_slice(&base_version.to_be_bytes());
    key
}

fn decode_u64(bytes: &[u8]) -> Result<u64, StoreError> {
    let buf: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::DeserializationError("Invalid version counter".into()))?;
    Ok(u64::from_be_bytes(buf))
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
