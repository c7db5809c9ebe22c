//! RocksDB-backed persistent document store.
//!
//! Column families:
//! - `documents`  — Latest checkpoint per document (content + CRDT state, LZ4 compressed)
//! - `operations` — Append-only operations log (LZ4 compressed, keyed by doc hash + sequence)
//! - `metadata`   — Per-document bookkeeping (bincode)
//!
//! Performance targets:
//! - Open (10k docs): <100ms (bloom filters + block cache)
//! - Snapshot load (1MB, cache hit): <1ms
//! - Operation append (1KB): <50μs
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

use cobrief_core::{CollabError, DocumentBackend, Operation, StoredDocument};
use log::{debug, info};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};

const CF_DOCUMENTS: &str = "documents";
const CF_OPERATIONS: &str = "operations";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_OPERATIONS, CF_METADATA];

/// Operation keys: 8-byte document hash followed by an 8-byte sequence.
const OP_PREFIX_LEN: usize = 8;
const OP_KEY_LEN: usize = 16;

/// Store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
    /// Log length at which a checkpoint also drops the operations it
    /// covers. 0 keeps the whole log.
    pub compaction_threshold: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("cobrief_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
            compaction_threshold: 1_000,
        }
    }
}

impl StoreConfig {
    /// Small caches, given directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
            compaction_threshold: 0,
        }
    }
}

/// Bookkeeping stored next to each document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub document_id: String,
    /// Sequence the next appended operation receives.
    pub next_sequence: u64,
    /// Operations currently in the log.
    pub operation_count: u64,
    /// Uncompressed checkpoint size in bytes
    pub snapshot_size: u64,
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(document_id: &str) -> Self {
        let now = unix_seconds();
        Self {
            document_id: document_id.to_string(),
            next_sequence: 0,
            operation_count: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        encode(self)
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        decode(bytes)
    }
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    NotFound(String),
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Document not found: {id}"),
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

impl From<StoreError> for CollabError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::SerializationError(_) | StoreError::DeserializationError(_) => {
                CollabError::Serialization(e.to_string())
            }
            other => CollabError::Storage(other.to_string()),
        }
    }
}

/// RocksDB-backed document store.
///
/// Writes that touch metadata go through a single writer lock so sequence
/// numbers stay dense when several replicas share one store.
pub struct DocumentStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    writer: Mutex<()>,
}

impl DocumentStore {
    /// Open the store, creating the database and column families if missing.
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
        info!("Opened document store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            writer: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Values are LZ4-compressed already.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS | CF_METADATA => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_OPERATIONS => {
                // Many small writes, prefix-scanned per document
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(
                    OP_PREFIX_LEN,
                ));
            }
            _ => {}
        }

        opts
    }

    // ─── Checkpoints ──────────────────────────────────────────────────

    /// Replace the document's checkpoint.
    pub fn save_snapshot(
        &self,
        document_id: &str,
        document: &StoredDocument,
    ) -> Result<DocumentMetadata, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let raw = encode(document)?;
        let compressed = lz4_flex::compress_prepend_size(&raw);

        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut meta = self.metadata_or_new(document_id)?;
        meta.snapshot_size = raw.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_seconds();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_docs, document_id.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, document_id.as_bytes(), meta.encode()?);
        self.write(batch)?;

        Ok(meta)
    }

    pub fn load_snapshot(&self, document_id: &str) -> Result<StoredDocument, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(&cf, document_id.as_bytes())? {
            Some(compressed) => {
                let raw = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::CompressionError(e.to_string()))?;
                decode(&raw)
            }
            None => Err(StoreError::NotFound(document_id.to_string())),
        }
    }

    pub fn document_exists(&self, document_id: &str) -> Result<bool, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        Ok(self.db.get_cf(&cf, document_id.as_bytes())?.is_some())
    }

    // ─── Operations log ───────────────────────────────────────────────

    /// Append to the document's log. Returns the sequence assigned.
    pub fn append_operation(&self, operation: &Operation) -> Result<u64, StoreError> {
        let cf_ops = self.cf(CF_OPERATIONS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let document_id = operation.document_id.as_str();

        let compressed = lz4_flex::compress_prepend_size(&encode(operation)?);

        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut meta = self.metadata_or_new(document_id)?;
        let sequence = meta.next_sequence;
        meta.next_sequence += 1;
        meta.operation_count += 1;
        meta.updated_at = unix_seconds();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_ops, operation_key(document_id, sequence), &compressed);
        batch.put_cf(&cf_meta, document_id.as_bytes(), meta.encode()?);
        self.write(batch)?;

        Ok(sequence)
    }

    /// Operations with sequence >= `since`, in log order.
    pub fn load_operations_since(
        &self,
        document_id: &str,
        since: u64,
    ) -> Result<Vec<(u64, Operation)>, StoreError> {
        let mut operations = Vec::new();
        self.scan_operations(document_id, since, |sequence, value| {
            let raw = lz4_flex::decompress_size_prepended(value)
                .map_err(|e| StoreError::CompressionError(e.to_string()))?;
            let operation: Operation = decode(&raw)?;
            // Hash prefixes can collide across documents.
            if operation.document_id == document_id {
                operations.push((sequence, operation));
            }
            Ok(())
        })?;
        Ok(operations)
    }

    /// Drop log entries with sequence <= `up_to`. Returns how many went.
    pub fn compact_operations(&self, document_id: &str, up_to: u64) -> Result<u64, StoreError> {
        let cf_ops = self.cf(CF_OPERATIONS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let stale: Vec<(u64, Vec<u8>)> = self
            .load_operations_since(document_id, 0)?
            .into_iter()
            .take_while(|(sequence, _)| *sequence <= up_to)
            .map(|(sequence, _)| (sequence, operation_key(document_id, sequence)))
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }

        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut batch = WriteBatch::default();
        for (_, key) in &stale {
            batch.delete_cf(&cf_ops, key);
        }
        let mut meta = self.metadata_or_new(document_id)?;
        meta.operation_count = meta.operation_count.saturating_sub(stale.len() as u64);
        batch.put_cf(&cf_meta, document_id.as_bytes(), meta.encode()?);
        self.write(batch)?;

        info!("Compacted {} operations of {}", stale.len(), document_id);
        Ok(stale.len() as u64)
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn load_metadata(&self, document_id: &str) -> Result<DocumentMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, document_id.as_bytes())? {
            Some(bytes) => DocumentMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(document_id.to_string())),
        }
    }

    fn metadata_or_new(&self, document_id: &str) -> Result<DocumentMetadata, StoreError> {
        match self.load_metadata(document_id) {
            Err(StoreError::NotFound(_)) => Ok(DocumentMetadata::new(document_id)),
            other => other,
        }
    }

    pub fn list_documents(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let id = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            ids.push(id);
        }
        Ok(ids)
    }

    /// Remove the checkpoint, log and metadata of a document.
    pub fn delete_document(&self, document_id: &str) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let cf_ops = self.cf(CF_OPERATIONS)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_docs, document_id.as_bytes());
        batch.delete_cf(&cf_meta, document_id.as_bytes());
        for (sequence, _) in self.load_operations_since(document_id, 0)? {
            batch.delete_cf(&cf_ops, operation_key(document_id, sequence));
        }

        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        self.write(batch)?;
        Ok(())
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn scan_operations<F>(&self, document_id: &str, since: u64, mut visit: F) -> Result<(), StoreError>
    where
        F: FnMut(u64, &[u8]) -> Result<(), StoreError>,
    {
        let cf = self.cf(CF_OPERATIONS)?;
        let prefix = document_hash(document_id).to_be_bytes();
        let start = operation_key(document_id, since);

        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if key.len() != OP_KEY_LEN || key[..OP_PREFIX_LEN] != prefix {
                break;
            }
            let mut seq_buf = [0u8; 8];
            seq_buf.copy_from_slice(&key[OP_PREFIX_LEN..]);
            visit(u64::from_be_bytes(seq_buf), &value)?;
        }
        Ok(())
    }
}

impl DocumentBackend for DocumentStore {
    async fn load_document(&self, document_id: &str) -> cobrief_core::Result<Option<StoredDocument>> {
        match self.load_snapshot(document_id) {
            Ok(document) => Ok(Some(document)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Checkpoints that carry CRDT state cover the whole log so far, which
    /// lets long logs be compacted.
    async fn save_document(
        &self,
        document_id: &str,
        document: StoredDocument,
    ) -> cobrief_core::Result<()> {
        let covers_log = document.crdt_state.is_some();
        let meta = self.save_snapshot(document_id, &document)?;
        let threshold = self.config.compaction_threshold;
        if covers_log && threshold > 0 && meta.operation_count >= threshold && meta.next_sequence > 0 {
            self.compact_operations(document_id, meta.next_sequence - 1)?;
        }
        debug!("Saved checkpoint of {} ({} bytes)", document_id, meta.snapshot_size);
        Ok(())
    }

    async fn publish_operation(&self, operation: Operation) -> cobrief_core::Result<()> {
        self.append_operation(&operation)?;
        Ok(())
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok(value)
}

/// FNV-1a over the document id.
fn document_hash(document_id: &str) -> u64 {
    document_id
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
            (hash ^ byte as u64).wrapping_mul(0x0100_0000_01b3)
        })
}

fn operation_key(document_id: &str, sequence: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(OP_KEY_LEN);
    key.extend_from_slice(&document_hash(document_id).to_be_bytes());
    key.extend_from_slice(&sequence.to_be_bytes());
    key
}

fn unix_seconds() -> u64 {
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
