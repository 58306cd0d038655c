//! Remote change listener.
//!
//! Turns store notices for the document path into `apply_remote` calls on
//! the replica. Notices are deduplicated by revision; correctness never
//! depends on their order since the CRDT merge is idempotent and
//! commutative.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tandem_core::DocumentReplica;

use crate::codec::{self, ChunkRecord, SnapshotCodec, SnapshotHeader};
use crate::error::SyncError;
use crate::store::{ChangeKind, ChangeNotice, DocumentStore, Revision};

/// Highest snapshot revision merged into the replica, shared by the
/// listener and the synchronizer.
#[derive(Debug, Default)]
pub(crate) struct RevisionTracker {
    applied: AtomicU64,
    /// The document has existed at some point during this session
    seen: AtomicBool,
}

impl RevisionTracker {
    pub(crate) fn is_new(&self, revision: Revision) -> bool {
        revision > self.applied.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_applied(&self, revision: Revision) {
        self.applied.fetch_max(revision, Ordering::SeqCst);
        self.seen.store(true, Ordering::SeqCst);
    }

    pub(crate) fn applied(&self) -> Revision {
        self.applied.load(Ordering::SeqCst)
    }

    pub(crate) fn seen(&self) -> bool {
        self.seen.load(Ordering::SeqCst)
    }
}

/// A snapshot read back from the store and fully reassembled.
#[derive(Debug, Clone)]
pub struct RemoteSnapshot {
    pub header: SnapshotHeader,
    /// Revision of the header record
    pub revision: Revision,
    /// Decoded CRDT state
    pub state: Vec<u8>,
    /// Store paths of the chunks this header's generation owns
    pub chunk_paths: Vec<String>,
}

/// Read the header and chunks at `path` and reassemble the full state.
///
/// Only the header's generation is listed; chunks of other generations
/// never take part in the read. `Ok(None)` means there is no document at
/// `path`.
pub async fn read_snapshot(
    store: &dyn DocumentStore,
    path: &str,
) -> Result<Option<RemoteSnapshot>, SyncError> {
    let Some(doc) = store.get(path).await? else {
        return Ok(None);
    };
    let header = SnapshotHeader::decode(&doc.bytes)?;
    let count = header.chunk_count();

    let mut chunk_paths = Vec::with_capacity(count as usize);
    let mut chunks = Vec::with_capacity(count as usize);
    if count > 0 {
        let prefix = codec::generation_prefix(path, header.generation);
        for entry in store.list(&prefix).await? {
            let Some((_, index)) = codec::parse_chunk_path(path, &entry.path) else {
                continue;
            };
            if index < count {
                chunks.push(ChunkRecord::decode(&entry.bytes)?);
            }
            chunk_paths.push(entry.path);
        }
    }

    let state = SnapshotCodec::decode(&header, &chunks)?;
    Ok(Some(RemoteSnapshot {
        header,
        revision: doc.revision,
        state,
        chunk_paths,
    }))
}

/// Result of handling one notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListenOutcome {
    Applied(Revision),
    Skipped,
    /// A previously seen document is gone.
    Deleted,
}

pub(crate) struct RemoteListener {
    store: Arc<dyn DocumentStore>,
    replica: Arc<DocumentReplica>,
    path: String,
    tracker: Arc<RevisionTracker>,
}

impl RemoteListener {
    pub(crate) fn new(
        store: Arc<dyn DocumentStore>,
        replica: Arc<DocumentReplica>,
        path: String,
        tracker: Arc<RevisionTracker>,
    ) -> Self {
        Self {
            store,
            replica,
            path,
            tracker,
        }
    }

    /// Initial read before the provider is ready.
    ///
    /// Every error propagates. The caller retries and, if the snapshot stays
    /// unreadable, disconnects with [`DisconnectReason::CorruptSnapshot`]
    /// rather than reporting ready on top of a snapshot no write could merge.
    ///
    /// [`DisconnectReason::CorruptSnapshot`]: crate::lifecycle::DisconnectReason::CorruptSnapshot
    pub(crate) async fn hydrate(&self) -> Result<Option<Revision>, SyncError> {
        let Some(snapshot) = read_snapshot(self.store.as_ref(), &self.path).await? else {
            log::debug!("{} does not exist yet", self.path);
            return Ok(None);
        };
        self.replica.apply_remote(&snapshot.state)?;
        self.tracker.mark_applied(snapshot.revision);
        log::info!("hydrated {} at revision {}", self.path, snapshot.revision);
        Ok(Some(snapshot.revision))
    }

    pub(crate) async fn handle_notice(&self, notice: &ChangeNotice) -> ListenOutcome {
        if notice.path != self.path {
            // Chunk and presence traffic; the header write is the signal
            return ListenOutcome::Skipped;
        }
        match notice.kind {
            ChangeKind::Removed => ListenOutcome::Deleted,
            ChangeKind::Upserted if !self.tracker.is_new(notice.revision) => {
                log::debug!(
                    "skipping revision {} of {}, already at {}",
                    notice.revision,
                    self.path,
                    self.tracker.applied()
                );
                ListenOutcome::Skipped
            }
            ChangeKind::Upserted => self.refresh().await,
        }
    }

    /// Re-read the snapshot and merge it if it is newer than what we have.
    pub(crate) async fn refresh(&self) -> ListenOutcome {
        let snapshot = match read_snapshot(self.store.as_ref(), &self.path).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) if self.tracker.seen() => return ListenOutcome::Deleted,
            Ok(None) => return ListenOutcome::Skipped,
            Err(SyncError::Store(e)) => {
                log::warn!("failed to read {}: {e}", self.path);
                return ListenOutcome::Skipped;
            }
            Err(e) => {
                // Usually the header moved on and its old generation was
                // deleted mid-read; the newer header's notice reads again
                log::warn!("discarding notification for {}: {e}", self.path);
                return ListenOutcome::Skipped;
            }
        };

        if !self.tracker.is_new(snapshot.revision) {
            return ListenOutcome::Skipped;
        }
        if let Err(e) = self.replica.apply_remote(&snapshot.state) {
            log::warn!("discarding corrupt snapshot of {}: {e}", self.path);
            return ListenOutcome::Skipped;
        }
        self.tracker.mark_applied(snapshot.revision);
        log::debug!("applied revision {} of {}", snapshot.revision, self.path);

        // A peer that read before our last write can overwrite it
        match self.replica.restore_missing(&snapshot.state) {
            Ok(true) => log::info!(
                "revision {} of {} lacks local edits, rewriting",
                snapshot.revision,
                self.path
            ),
            Ok(false) => {}
            Err(e) => log::warn!("could not compare with {}: {e}", self.path),
        }
        ListenOutcome::Applied(snapshot.revision)
    }
}
