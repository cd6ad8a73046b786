//! RocksDB-backed durable op log and checkpoints.
//!
//! Column families:
//! - `ops`         — Accepted operations (LZ4-compressed JSON, keyed by doc_id + version)
//! - `checkpoints` — Full document checkpoints (LZ4-compressed JSON)
//! - `meta`        — Per-document metadata (JSON: versions, timestamps, sizes)
//!
//! A checkpoint is the complete serialized [`Document`] — registers, element
//! clocks, op log — not just its visible snapshot. A value-only snapshot
//! cannot seed a replica: without the stored clocks, later concurrent writes
//! would arbitrate against nothing.
//!
//! Recovery path: load the latest checkpoint, then replay ops with a version
//! greater than the checkpoint's. Replay is idempotent, so an op that was
//! both checkpointed and still in the log is a silent no-op.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::document::Document;
use crate::op::Operation;

const CF_OPS: &str = "ops";
const CF_CHECKPOINTS: &str = "checkpoints";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_OPS, CF_CHECKPOINTS, CF_META];

/// Separator between document id and version in op keys. Document ids must
/// not contain NUL.
const KEY_SEP: u8 = 0x00;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("canvas_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Config for testing (small caches, temp directory).
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

/// Per-document bookkeeping stored alongside the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub document_id: String,
    /// Version of the latest persisted op.
    pub version: u64,
    /// Version captured by the latest checkpoint (0 = none).
    pub checkpoint_version: u64,
    /// Ops currently in the log (post-compaction).
    pub op_count: u64,
    /// Uncompressed size of the latest checkpoint in bytes.
    pub checkpoint_size: u64,
    /// Seconds since epoch.
    pub created_at: u64,
    pub updated_at: u64,
}

impl DocumentMeta {
    fn new(document_id: &str) -> Self {
        let now = epoch_secs();
        Self {
            document_id: document_id.to_string(),
            version: 0,
            checkpoint_version: 0,
            op_count: 0,
            checkpoint_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(self).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Deserialization(e.to_string()))
    }
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    Database(String),
    NotFound(String),
    Serialization(String),
    Deserialization(String),
    Compression(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Document not found: {id}"),
            StoreError::Serialization(e) => write!(f, "Serialization error: {e}"),
            StoreError::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            StoreError::Compression(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Durable op log with periodic checkpoints.
pub struct OpLogStore {
    /// Single-threaded mode — concurrency comes from tokio, not RocksDB.
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl OpLogStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // LZ4 at the SST level on top of per-value LZ4 is near-free and
        // catches cross-value redundancy.
        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_OPS => {
                // Many small sequential writes, range-scanned on recovery
                opts.set_max_write_buffer_number(4);
            }
            CF_CHECKPOINTS | CF_META => {
                // Point lookups only
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    // ─── Op log ───────────────────────────────────────────────────────

    /// Append one accepted operation at the given document version.
    ///
    /// Key format: `<doc_id bytes><0x00><version:8 bytes big-endian>`, so a
    /// forward scan from version 0 yields ops in apply order.
    pub fn append_op(
        &self,
        document_id: &str,
        version: u64,
        op: &Operation,
    ) -> Result<(), StoreError> {
        let cf_ops = self.cf(CF_OPS)?;
        let cf_meta = self.cf(CF_META)?;

        let encoded =
            serde_json::to_vec(op).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&encoded);

        let mut meta = self
            .load_meta(document_id)
            .unwrap_or_else(|_| DocumentMeta::new(document_id));
        meta.version = meta.version.max(version);
        meta.op_count += 1;
        meta.updated_at = epoch_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_ops, op_key(document_id, version), &compressed);
        batch.put_cf(&cf_meta, document_id.as_bytes(), &meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(())
    }

    /// Load ops with version strictly greater than `after_version`, in order.
    pub fn load_ops_since(
        &self,
        document_id: &str,
        after_version: u64,
    ) -> Result<Vec<(u64, Operation)>, StoreError> {
        let cf = self.cf(CF_OPS)?;
        let prefix = key_prefix(document_id);
        let start_key = op_key(document_id, after_version.saturating_add(1));

        let mut ops = Vec::new();
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );

        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            let version = version_from_key(&key, prefix.len())?;

            let decompressed = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::Compression(e.to_string()))?;
            let op: Operation = serde_json::from_slice(&decompressed)
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;

            ops.push((version, op));
        }

        Ok(ops)
    }

    /// Load the full op log for a document.
    pub fn load_ops(&self, document_id: &str) -> Result<Vec<(u64, Operation)>, StoreError> {
        self.load_ops_since(document_id, 0)
    }

    /// Delete ops with version ≤ `up_to_version`. Called after a checkpoint
    /// has made them redundant. Returns how many were removed.
    pub fn compact_ops(&self, document_id: &str, up_to_version: u64) -> Result<u64, StoreError> {
        let cf = self.cf(CF_OPS)?;
        let prefix = key_prefix(document_id);
        let start_key = op_key(document_id, 0);

        let mut count = 0u64;
        let mut batch = WriteBatch::default();
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );

        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            if version_from_key(&key, prefix.len())? > up_to_version {
                break;
            }
            batch.delete_cf(&cf, &key);
            count += 1;
        }

        if count > 0 {
            self.db.write(batch)?;
            if let Ok(mut meta) = self.load_meta(document_id) {
                meta.op_count = meta.op_count.saturating_sub(count);
                meta.updated_at = epoch_secs();
                let cf_meta = self.cf(CF_META)?;
                self.db
                    .put_cf(&cf_meta, document_id.as_bytes(), meta.encode()?)?;
            }
        }

        Ok(count)
    }

    // ─── Checkpoints ──────────────────────────────────────────────────

    /// Persist a full document checkpoint (LZ4-compressed JSON).
    pub fn save_checkpoint(&self, doc: &Document) -> Result<DocumentMeta, StoreError> {
        let cf_ckpt = self.cf(CF_CHECKPOINTS)?;
        let cf_meta = self.cf(CF_META)?;

        let encoded =
            serde_json::to_vec(doc).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&encoded);

        let mut meta = self
            .load_meta(doc.document_id())
            .unwrap_or_else(|_| DocumentMeta::new(doc.document_id()));
        meta.version = meta.version.max(doc.version());
        meta.checkpoint_version = doc.version();
        meta.checkpoint_size = encoded.len() as u64;
        meta.updated_at = epoch_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_ckpt, doc.document_id().as_bytes(), &compressed);
        batch.put_cf(&cf_meta, doc.document_id().as_bytes(), &meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(meta)
    }

    /// Load the latest checkpoint, if any.
    pub fn load_checkpoint(&self, document_id: &str) -> Result<Option<Document>, StoreError> {
        let cf = self.cf(CF_CHECKPOINTS)?;
        match self.db.get_cf(&cf, document_id.as_bytes())? {
            Some(compressed) => {
                let decompressed = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::Compression(e.to_string()))?;
                let doc = serde_json::from_slice(&decompressed)
                    .map_err(|e| StoreError::Deserialization(e.to_string()))?;
                Ok(Some(doc))
            }
            None => Ok(None),
        }
    }

    /// Rebuild a document: latest checkpoint plus replay of newer ops.
    pub fn restore(&self, document_id: &str) -> Result<Option<Document>, StoreError> {
        let meta = match self.load_meta(document_id) {
            Ok(meta) => meta,
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut doc = self
            .load_checkpoint(document_id)?
            .unwrap_or_else(|| Document::new(document_id));

        for (_, op) in self.load_ops_since(document_id, meta.checkpoint_version)? {
            doc.apply(&op);
        }

        Ok(Some(doc))
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn load_meta(&self, document_id: &str) -> Result<DocumentMeta, StoreError> {
        let cf = self.cf(CF_META)?;
        match self.db.get_cf(&cf, document_id.as_bytes())? {
            Some(bytes) => DocumentMeta::decode(&bytes),
            None => Err(StoreError::NotFound(document_id.to_string())),
        }
    }

    pub fn document_exists(&self, document_id: &str) -> Result<bool, StoreError> {
        let cf = self.cf(CF_META)?;
        Ok(self.db.get_cf(&cf, document_id.as_bytes())?.is_some())
    }

    /// All document ids known to the store.
    pub fn list_documents(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_META)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            let id = String::from_utf8(key.to_vec())
                .map_err(|_| StoreError::Deserialization("Non-UTF8 document id key".into()))?;
            ids.push(id);
        }
        Ok(ids)
    }

    /// Delete a document: checkpoint, metadata, and its whole op log.
    pub fn delete_document(&self, document_id: &str) -> Result<(), StoreError> {
        let cf_ckpt = self.cf(CF_CHECKPOINTS)?;
        let cf_meta = self.cf(CF_META)?;
        let cf_ops = self.cf(CF_OPS)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_ckpt, document_id.as_bytes());
        batch.delete_cf(&cf_meta, document_id.as_bytes());

        let prefix = key_prefix(document_id);
        let iter = self.db.iterator_cf(
            &cf_ops,
            IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            batch.delete_cf(&cf_ops, &key);
        }

        self.db.write(batch)?;
        Ok(())
    }

    /// Force a flush of memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db
            .flush()
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }
}

fn op_key(document_id: &str, version: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(document_id.len() + 1 + 8);
    key.extend_from_slice(document_id.as_bytes());
    key.push(KEY_SEP);
    key.extend_from_slice(&version.to_be_bytes());
    key
}

fn key_prefix(document_id: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(document_id.len() + 1);
    prefix.extend_from_slice(document_id.as_bytes());
    prefix.push(KEY_SEP);
    prefix
}

fn version_from_key(key: &[u8], prefix_len: usize) -> Result<u64, StoreError> {
    let bytes: [u8; 8] = key
        .get(prefix_len..prefix_len + 8)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| StoreError::Deserialization("Truncated op key".into()))?;
    Ok(u64::from_be_bytes(bytes))
}

fn epoch_secs() -> u64 {
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
