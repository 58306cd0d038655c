//! Backing store abstraction.
//!
//! The provider only needs four capabilities from a document store: point
//! reads, prefix listings, committed writes and change notifications.
//!
//! ```text
//!  provider ──get/list──► ┌───────────────┐
//!           ──commit────► │ DocumentStore │ ──ChangeNotice──► Watch (per subscriber)
//!                         └───────────────┘
//!                            │         │
//!                      MemoryStore  RocksStore
//! ```
//!
//! Every commit is assigned a store-wide, monotonically increasing
//! [`Revision`]; each document written by that commit carries it.

pub mod memory;
pub mod rocks;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::StoreError;

pub use memory::{MemoryStore, MemoryStoreConfig};
pub use rocks::{RocksConfig, RocksStore};

/// Commit sequence number assigned by the store.
pub type Revision = u64;

/// A document as read from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDocument {
    pub path: String,
    pub bytes: Vec<u8>,
    /// Revision of the commit that last wrote this document
    pub revision: Revision,
}

/// One mutation inside a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put { path: String, bytes: Vec<u8> },
    Delete { path: String },
}

impl WriteOp {
    pub fn put(path: impl Into<String>, bytes: Vec<u8>) -> Self {
        WriteOp::Put {
            path: path.into(),
            bytes,
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        WriteOp::Delete { path: path.into() }
    }

    pub fn path(&self) -> &str {
        match self {
            WriteOp::Put { path, .. } | WriteOp::Delete { path } => path,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Upserted,
    Removed,
}

/// A committed change to one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotice {
    pub path: String,
    pub kind: ChangeKind,
    pub revision: Revision,
}

/// What a [`Watch`] yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Change(ChangeNotice),
    /// The subscriber fell behind and notices were dropped; re-read
    /// everything under the prefix.
    Resync,
}

/// Change subscription for one path prefix.
pub struct Watch {
    prefix: String,
    rx: broadcast::Receiver<ChangeNotice>,
}

impl Watch {
    pub fn new(prefix: impl Into<String>, rx: broadcast::Receiver<ChangeNotice>) -> Self {
        Self {
            prefix: prefix.into(),
            rx,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Next change under the prefix. `None` once the store is gone.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        loop {
            match self.rx.recv().await {
                Ok(notice) if notice.path.starts_with(&self.prefix) => {
                    return Some(WatchEvent::Change(notice));
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    log::warn!("watch on {} lagged by {missed} notices", self.prefix);
                    return Some(WatchEvent::Resync);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// A request/response document store with change notifications.
///
/// `commit` applies all of its operations atomically when
/// [`supports_transactions`](DocumentStore::supports_transactions) is true;
/// otherwise callers must commit one operation at a time.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<Option<StoredDocument>, StoreError>;

    /// All documents whose path starts with `prefix`, in path order.
    async fn list(&self, prefix: &str) -> Result<Vec<StoredDocument>, StoreError>;

    async fn commit(&self, ops: Vec<WriteOp>) -> Result<Revision, StoreError>;

    fn watch(&self, prefix: &str) -> Watch;

    fn supports_transactions(&self) -> bool;

    /// Largest single document the store accepts, in bytes.
    fn max_document_size(&self) -> usize;
}

/// Publish the notices for a committed batch.
pub(crate) fn notify_committed(
    tx: &broadcast::Sender<ChangeNotice>,
    ops: &[WriteOp],
    revision: Revision,
) {
    for op in ops {
        let kind = match op {
            WriteOp::Put { .. } => ChangeKind::Upserted,
            WriteOp::Delete { .. } => ChangeKind::Removed,
        };
        // No subscribers is fine
        let _ = tx.send(ChangeNotice {
            path: op.path().to_string(),
            kind,
            revision,
        });
    }
}
