//! In-process document store.
//!
//! Several providers can share one `MemoryStore` to simulate clients
//! editing the same document. Test hooks inject commit failures, count
//! writes per path and remove documents behind the providers' backs.

use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};

use super::{notify_committed, DocumentStore, Revision, StoredDocument, Watch, WriteOp};
use crate::error::StoreError;

/// Memory store configuration.
#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
    /// Largest single document accepted (default: 1MB)
    pub max_document_size: usize,
    /// Apply multi-op commits atomically (default: true). When false,
    /// commits with more than one op are rejected.
    pub transactional: bool,
    /// Change notices buffered per subscriber before it lags (default: 1024)
    pub notify_capacity: usize,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            max_document_size: 1024 * 1024,
            transactional: true,
            notify_capacity: 1024,
        }
    }
}

impl MemoryStoreConfig {
    pub fn for_testing() -> Self {
        Self {
            max_document_size: 64 * 1024,
            transactional: true,
            notify_capacity: 256,
        }
    }
}

#[derive(Default)]
struct Inner {
    docs: BTreeMap<String, (Vec<u8>, Revision)>,
    revision: Revision,
    /// Outcomes of upcoming commits, front first; `None` lets one through
    failures: VecDeque<Option<StoreError>>,
    write_counts: HashMap<String, u64>,
    commits: u64,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    notifier: broadcast::Sender<super::ChangeNotice>,
    config: MemoryStoreConfig,
}

impl MemoryStore {
    pub fn new(config: MemoryStoreConfig) -> Self {
        let (notifier, _) = broadcast::channel(config.notify_capacity.max(1));
        Self {
            inner: Mutex::new(Inner::default()),
            notifier,
            config,
        }
    }

    /// Make the next `times` commits fail with `error`.
    pub async fn fail_next_commits(&self, error: StoreError, times: usize) {
        let mut inner = self.inner.lock().await;
        inner
            .failures
            .extend(std::iter::repeat(Some(error)).take(times));
    }

    /// Let the next `skip` commits through, then fail one with `error`.
    pub async fn fail_commit_after(&self, skip: usize, error: StoreError) {
        let mut inner = self.inner.lock().await;
        inner.failures.extend(std::iter::repeat(None).take(skip));
        inner.failures.push_back(Some(error));
    }

    /// Successful puts and deletes committed to exactly `path`.
    pub async fn write_count(&self, path: &str) -> u64 {
        self.inner
            .lock()
            .await
            .write_counts
            .get(path)
            .copied()
            .unwrap_or(0)
    }

    /// Successful commits since creation.
    pub async fn commit_count(&self) -> u64 {
        self.inner.lock().await.commits
    }

    /// Current store revision.
    pub async fn revision(&self) -> Revision {
        self.inner.lock().await.revision
    }

    /// Remove a document and everything beneath it, as another party would.
    ///
    /// Bypasses failure injection and write counters.
    pub async fn remove_document(&self, path: &str) -> Revision {
        let mut inner = self.inner.lock().await;
        let nested = format!("{path}/");
        let doomed: Vec<String> = inner
            .docs
            .keys()
            .filter(|p| p.as_str() == path || p.starts_with(&nested))
            .cloned()
            .collect();

        inner.revision += 1;
        let revision = inner.revision;
        let ops: Vec<WriteOp> = doomed
            .into_iter()
            .map(|p| {
                inner.docs.remove(&p);
                WriteOp::delete(p)
            })
            .collect();
        notify_committed(&self.notifier, &ops, revision);
        revision
    }

    /// Write raw bytes to a path, bypassing failure injection and counters.
    pub async fn insert_raw(&self, path: &str, bytes: Vec<u8>) -> Revision {
        let mut inner = self.inner.lock().await;
        inner.revision += 1;
        let revision = inner.revision;
        inner.docs.insert(path.to_string(), (bytes.clone(), revision));
        notify_committed(&self.notifier, &[WriteOp::put(path, bytes)], revision);
        revision
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(MemoryStoreConfig::default())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Option<StoredDocument>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.docs.get(path).map(|(bytes, revision)| StoredDocument {
            path: path.to_string(),
            bytes: bytes.clone(),
            revision: *revision,
        }))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<StoredDocument>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .docs
            .range(prefix.to_string()..)
            .take_while(|(path, _)| path.starts_with(prefix))
            .map(|(path, (bytes, revision))| StoredDocument {
                path: path.clone(),
                bytes: bytes.clone(),
                revision: *revision,
            })
            .collect())
    }

    async fn commit(&self, ops: Vec<WriteOp>) -> Result<Revision, StoreError> {
        let mut inner = self.inner.lock().await;

        if let Some(Some(error)) = inner.failures.pop_front() {
            return Err(error);
        }
        if ops.len() > 1 && !self.config.transactional {
            return Err(StoreError::Database(format!(
                "batch of {} ops on a non-transactional store",
                ops.len()
            )));
        }
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

        inner.revision += 1;
        inner.commits += 1;
        let revision = inner.revision;

        let mut applied = Vec::with_capacity(ops.len());
        for op in ops {
            *inner.write_counts.entry(op.path().to_string()).or_default() += 1;
            let changed = match &op {
                WriteOp::Put { path, bytes } => {
                    inner.docs.insert(path.clone(), (bytes.clone(), revision));
                    true
                }
                WriteOp::Delete { path } => inner.docs.remove(path).is_some(),
            };
            if changed {
                applied.push(op);
            }
        }

        notify_committed(&self.notifier, &applied, revision);
        Ok(revision)
    }

    fn watch(&self, prefix: &str) -> Watch {
        Watch::new(prefix, self.notifier.subscribe())
    }

    fn supports_transactions(&self) -> bool {
        self.config.transactional
    }

    fn max_document_size(&self) -> usize {
        self.config.max_document_size
    }
}
