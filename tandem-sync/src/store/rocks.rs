//! RocksDB-backed document store.
//!
//! Column families:
//! - `documents`: path → `revision (8 bytes BE) ‖ LZ4(bytes)`
//! - `meta`: store-wide counters (last assigned revision)
//!
//! Commits are applied as one atomic `WriteBatch`, so this store always
//! supports transactional multi-chunk snapshot writes. Change notices are
//! delivered in-process to watchers of the same `RocksStore`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use tokio::sync::{broadcast, Mutex};

use super::{notify_committed, ChangeNotice, DocumentStore, Revision, StoredDocument, Watch, WriteOp};
use crate::error::StoreError;

const CF_DOCUMENTS: &str = "documents";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_META];

/// Key in `meta` holding the last assigned revision.
const REVISION_KEY: &[u8] = b"revision";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct RocksConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every commit (default: true)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
    /// Largest single document accepted (default: 1MB)
    pub max_document_size: usize,
    /// Change notices buffered per watcher (default: 1024)
    pub notify_capacity: usize,
}

impl Default for RocksConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tandem_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
            max_document_size: 1024 * 1024,
            notify_capacity: 1024,
        }
    }
}

impl RocksConfig {
    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
            max_document_size: 64 * 1024,
            notify_capacity: 256,
        }
    }
}

pub struct RocksStore {
    /// Single-threaded mode; no column families are created after open
    db: DBWithThreadMode<SingleThreaded>,
    config: RocksConfig,
    /// Last assigned revision; held for the duration of a commit
    revision: Mutex<Revision>,
    notifier: broadcast::Sender<ChangeNotice>,
}

impl RocksStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: RocksConfig) -> Result<Self, StoreError> {
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

        let revision = Self::recover_revision(&db)?;
        log::info!(
            "opened rocks store at {} (revision {revision})",
            config.path.display()
        );

        let (notifier, _) = broadcast::channel(config.notify_capacity.max(1));
        Ok(Self {
            db,
            config,
            revision: Mutex::new(revision),
            notifier,
        })
    }

    fn cf_options(name: &str, config: &RocksConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS => {
                // Values are already LZ4 compressed
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            CF_META => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    fn recover_revision(db: &DBWithThreadMode<SingleThreaded>) -> Result<Revision, StoreError> {
        let cf = db
            .cf_handle(CF_META)
            .ok_or_else(|| StoreError::Database(format!("column family '{CF_META}' not found")))?;
        match db.get_cf(&cf, REVISION_KEY)? {
            Some(bytes) => {
                let buf: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    StoreError::Serialization("revision counter is not 8 bytes".into())
                })?;
                Ok(u64::from_be_bytes(buf))
            }
            None => Ok(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Force memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }

    fn encode_value(revision: Revision, bytes: &[u8]) -> Vec<u8> {
        let compressed = lz4_flex::compress_prepend_size(bytes);
        let mut value = Vec::with_capacity(8 + compressed.len());
        value.extend_from_slice(&revision.to_be_bytes());
        value.extend_from_slice(&compressed);
        value
    }

    fn decode_value(path: &str, value: &[u8]) -> Result<StoredDocument, StoreError> {
        if value.len() < 8 {
            return Err(StoreError::Serialization(format!(
                "value at {path} is truncated"
            )));
        }
        let mut rev_buf = [0u8; 8];
        rev_buf.copy_from_slice(&value[..8]);
        let bytes = lz4_flex::decompress_size_prepended(&value[8..])
            .map_err(|e| StoreError::Serialization(format!("{path}: {e}")))?;
        Ok(StoredDocument {
            path: path.to_string(),
            bytes,
            revision: u64::from_be_bytes(rev_buf),
        })
    }
}

#[async_trait]
impl DocumentStore for RocksStore {
    async fn get(&self, path: &str) -> Result<Option<StoredDocument>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(&cf, path.as_bytes())? {
            Some(value) => Ok(Some(Self::decode_value(path, &value)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<StoredDocument>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(prefix.as_bytes(), Direction::Forward),
        );

        let mut docs = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            let path = std::str::from_utf8(&key)
                .map_err(|e| StoreError::Serialization(format!("non-utf8 key: {e}")))?;
            docs.push(Self::decode_value(path, &value)?);
        }
        Ok(docs)
    }

    async fn commit(&self, ops: Vec<WriteOp>) -> Result<Revision, StoreError> {
        for op in &ops {
            if let WriteOp::Put { path, bytes } = op {
                if bytes.len() > self.config.max_document_size {
                    return Err(StoreError::TooLarge {
                        path: path.clone(),
                        size: bytes.len(),
                        limit: self.config.max_document_size,
                    });
                }
            }
        }

        let mut last = self.revision.lock().await;
        let revision = *last + 1;
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_META)?;

        let mut batch = WriteBatch::default();
        let mut applied = Vec::with_capacity(ops.len());
        for op in ops {
            let changed = match &op {
                WriteOp::Put { path, bytes } => {
                    batch.put_cf(&cf_docs, path.as_bytes(), Self::encode_value(revision, bytes));
                    true
                }
                WriteOp::Delete { path } => {
                    let exists = self.db.get_pinned_cf(&cf_docs, path.as_bytes())?.is_some();
                    batch.delete_cf(&cf_docs, path.as_bytes());
                    exists
                }
            };
            if changed {
                applied.push(op);
            }
        }
        batch.put_cf(&cf_meta, REVISION_KEY, revision.to_be_bytes());

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        *last = revision;

        notify_committed(&self.notifier, &applied, revision);
        Ok(revision)
    }

    fn watch(&self, prefix: &str) -> Watch {
        Watch::new(prefix, self.notifier.subscribe())
    }

    fn supports_transactions(&self) -> bool {
        true
    }

    fn max_document_size(&self) -> usize {
        self.config.max_document_size
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
