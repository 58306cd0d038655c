//! Persistence synchronizer: read-merge-write of the document snapshot.
//!
//! ```text
//!  pending local updates
//!          │ take
//!          ▼
//!  read header + chunks ──► reassemble ──► merge(remote, local) in scratch doc
//!                                                   │
//!                                                   ▼
//!          commit ◄── new-generation chunk puts, header put, replaced chunk deletes
//!            │
//!   ok ──► acknowledge state vector, record revision
//!   err ─► requeue updates, backoff (transient) or give up (permanent)
//! ```
//!
//! Writes never replace the stored snapshot without first merging it, so
//! concurrent writers can only add history, never drop it.
//!
//! Chunks go under a path scoped to their generation, so a write never
//! touches the chunks the current header points at. Those are deleted only
//! after the new header has landed.
//!
//! When the store cannot commit several documents atomically the snapshot
//! is written one record at a time: chunks, then the header, then the
//! replaced generation's deletes. Readers keep seeing the old, complete
//! snapshot until the header lands. If a chunk put fails, the chunks
//! already written are discarded and the live snapshot is untouched.
//!
//! A deletion by another party can race a write. On the sequential path the
//! header is checked right before it is put, and a write whose document
//! vanished is dropped instead of recreating it. A single transactional
//! commit cannot be made conditional through [`DocumentStore`], so a
//! deletion landing between its read and its commit is overwritten; the
//! deletion notice still stops the provider.

use std::sync::{Arc, Mutex, PoisonError};

use tandem_core::{merge_states, CaptureMode, DocumentReplica};
use tokio::sync::watch;

use crate::codec::{self, Compression, EncodedSnapshot, SnapshotCodec};
use crate::config::{ProviderConfig, RetryPolicy};
use crate::error::SyncError;
use crate::lifecycle::{DisconnectReason, Lifecycle};
use crate::listener::{read_snapshot, RevisionTracker};
use crate::store::{DocumentStore, Revision, WriteOp};

/// Save status as reported through `on_saving`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveStatus {
    Idle,
    Saving,
    Retrying,
}

/// How a flush ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushOutcome {
    /// Nothing was pending.
    Clean,
    Persisted(Revision),
    /// The document disappeared; pending updates stay queued.
    Deleted,
    /// Writes must stop.
    Failed(DisconnectReason),
    /// Shutdown arrived while waiting to retry.
    Cancelled,
}

/// Result of one read-merge-write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Attempt {
    Clean,
    Written(Revision),
    Deleted,
}

pub(crate) struct PersistenceSynchronizer {
    store: Arc<dyn DocumentStore>,
    replica: Arc<DocumentReplica>,
    path: String,
    codec: SnapshotCodec,
    retry: RetryPolicy,
    tracker: Arc<RevisionTracker>,
    lifecycle: Arc<Lifecycle>,
    status: Mutex<SaveStatus>,
}

impl PersistenceSynchronizer {
    pub(crate) fn new(
        config: &ProviderConfig,
        store: Arc<dyn DocumentStore>,
        replica: Arc<DocumentReplica>,
        tracker: Arc<RevisionTracker>,
        lifecycle: Arc<Lifecycle>,
    ) -> Result<Self, SyncError> {
        let compression = if config.compress {
            Compression::Lz4
        } else {
            Compression::None
        };
        let codec = match config.chunk_size {
            Some(size) => SnapshotCodec::new(size, compression)?,
            None => SnapshotCodec::for_store_limit(store.max_document_size(), compression)?,
        };

        Ok(Self {
            store,
            replica,
            path: config.path.clone(),
            codec,
            retry: config.retry.clone(),
            tracker,
            lifecycle,
            status: Mutex::new(SaveStatus::Idle),
        })
    }

    pub(crate) fn status(&self) -> SaveStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Change status, reporting the transition.
    fn transition(&self, next: SaveStatus) {
        {
            let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            if *status == next {
                return;
            }
            *status = next;
        }
        self.lifecycle.saving(next != SaveStatus::Idle);
    }

    /// Back to idle without a report; the lifecycle reports instead.
    fn reset_status(&self) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = SaveStatus::Idle;
    }

    /// Flush pending updates, retrying transient failures per the policy.
    ///
    /// Returns early with `Cancelled` if `shutdown` fires while waiting to
    /// retry; the in-flight attempt itself is never interrupted.
    pub(crate) async fn flush(&self, shutdown: &mut watch::Receiver<bool>) -> FlushOutcome {
        let mut failures = 0u32;
        loop {
            if self.replica.pending_len() == 0 {
                self.transition(SaveStatus::Idle);
                return FlushOutcome::Clean;
            }
            if self.status() == SaveStatus::Idle {
                self.transition(SaveStatus::Saving);
            }

            let error = match self.flush_once().await {
                Ok(Attempt::Written(revision)) => {
                    // Edits made during the write get their own debounced flush
                    if self.replica.pending_len() == 0 {
                        self.transition(SaveStatus::Idle);
                    }
                    return FlushOutcome::Persisted(revision);
                }
                Ok(Attempt::Clean) => {
                    self.transition(SaveStatus::Idle);
                    return FlushOutcome::Clean;
                }
                Ok(Attempt::Deleted) => {
                    self.reset_status();
                    return FlushOutcome::Deleted;
                }
                Err(e) => e,
            };

            if error.is_permission_denied() {
                log::error!("write to {} denied: {error}", self.path);
                self.reset_status();
                return FlushOutcome::Failed(DisconnectReason::PermissionDenied);
            }
            if !error.is_transient() {
                log::error!("write to {} rejected: {error}", self.path);
                self.reset_status();
                return FlushOutcome::Failed(DisconnectReason::StoreRejected);
            }

            failures += 1;
            if failures >= self.retry.max_attempts {
                log::error!(
                    "giving up on {} after {failures} attempts: {error}",
                    self.path
                );
                self.reset_status();
                let reason = if error.is_corruption() {
                    DisconnectReason::CorruptSnapshot
                } else {
                    DisconnectReason::RetriesExhausted
                };
                return FlushOutcome::Failed(reason);
            }

            let delay = self.retry.backoff(failures);
            log::warn!(
                "flush of {} failed (attempt {failures}), retrying in {delay:?}: {error}",
                self.path
            );
            self.transition(SaveStatus::Retrying);

            if *shutdown.borrow() {
                return FlushOutcome::Cancelled;
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return FlushOutcome::Cancelled,
            }
        }
    }

    /// One read-merge-write attempt. Pending updates are restored on any
    /// outcome other than a successful write.
    pub(crate) async fn flush_once(&self) -> Result<Attempt, SyncError> {
        let batch = self.replica.take_pending();
        if batch.is_empty() {
            return Ok(Attempt::Clean);
        }
        log::debug!("flushing {} local updates to {}", batch.len(), self.path);

        match self.merge_and_write().await {
            Ok(Attempt::Written(revision)) => Ok(Attempt::Written(revision)),
            Ok(other) => {
                self.replica.requeue(batch);
                Ok(other)
            }
            Err(e) => {
                self.replica.requeue(batch);
                Err(e)
            }
        }
    }

    async fn merge_and_write(&self) -> Result<Attempt, SyncError> {
        let (remote_state, replaced) = match read_snapshot(self.store.as_ref(), &self.path).await? {
            None if self.tracker.seen() => return Ok(Attempt::Deleted),
            None => (None, Vec::new()),
            Some(snapshot) => {
                if self.tracker.is_new(snapshot.revision) {
                    self.replica.apply_remote(&snapshot.state)?;
                    self.tracker.mark_applied(snapshot.revision);
                }
                (Some(snapshot.state), snapshot.chunk_paths)
            }
        };

        let local = self.replica.capture_local_update(CaptureMode::FullState);
        let merged = match &remote_state {
            Some(remote) => merge_states([remote.as_slice(), local.as_slice()])?,
            None => merge_states([local.as_slice()])?,
        };

        let encoded = self.codec.encode(&merged.update);
        let count = encoded.chunks.len();

        let Some(revision) = self.write_snapshot(encoded, &replaced).await? else {
            return Ok(Attempt::Deleted);
        };
        self.tracker.mark_applied(revision);
        self.replica.acknowledge(merged.state_vector);
        log::debug!(
            "wrote {} at revision {revision} ({count} chunks, {} replaced)",
            self.path,
            replaced.len()
        );
        Ok(Attempt::Written(revision))
    }

    /// Commit a snapshot, then delete the `replaced` chunks.
    ///
    /// Returns the revision of the header write, or `None` if the document
    /// was deleted while a sequential write was in flight.
    async fn write_snapshot(
        &self,
        encoded: EncodedSnapshot,
        replaced: &[String],
    ) -> Result<Option<Revision>, SyncError> {
        let generation = encoded.header.generation;
        let mut chunk_ops = Vec::with_capacity(encoded.chunks.len());
        for chunk in &encoded.chunks {
            chunk_ops.push(WriteOp::put(
                codec::chunk_path(&self.path, generation, chunk.index),
                chunk.encode()?,
            ));
        }
        let header_op = WriteOp::put(self.path.clone(), encoded.header.encode()?);
        let delete_ops: Vec<WriteOp> = replaced.iter().map(WriteOp::delete).collect();

        if self.store.supports_transactions() {
            let mut ops = chunk_ops;
            ops.push(header_op);
            ops.extend(delete_ops);
            return Ok(Some(self.store.commit(ops).await?));
        }

        let mut written = Vec::with_capacity(chunk_ops.len());
        for op in chunk_ops {
            let path = op.path().to_string();
            if let Err(e) = self.store.commit(vec![op]).await {
                self.discard_chunks(&written).await;
                return Err(e.into());
            }
            written.push(path);
        }

        if self.tracker.seen() {
            match self.store.get(&self.path).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    log::warn!("{} was deleted mid-write, not recreating it", self.path);
                    self.discard_chunks(&written).await;
                    return Ok(None);
                }
                Err(e) => {
                    self.discard_chunks(&written).await;
                    return Err(e.into());
                }
            }
        }

        let revision = self.store.commit(vec![header_op]).await?;
        for op in delete_ops {
            // Replaced chunks are never read again; a failed delete only leaks
            if let Err(e) = self.store.commit(vec![op]).await {
                log::warn!("failed to delete replaced chunk of {}: {e}", self.path);
            }
        }
        Ok(Some(revision))
    }

    /// Best-effort removal of chunks no header points at.
    async fn discard_chunks(&self, paths: &[String]) {
        for path in paths {
            if let Err(e) = self.store.commit(vec![WriteOp::delete(path.as_str())]).await {
                log::warn!("failed to discard unused chunk {path}: {e}");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::events::{EventSink, ProviderEvent};
    use crate::store::{MemoryStore, MemoryStoreConfig, StoredDocument, Watch};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        store: Arc<MemoryStore>,
        replica: Arc<DocumentReplica>,
        sync: PersistenceSynchronizer,
        events: UnboundedReceiver<ProviderEvent>,
    }

    fn synchronizer(
        store: Arc<dyn DocumentStore>,
        replica: Arc<DocumentReplica>,
        chunk_size: Option<usize>,
    ) -> (PersistenceSynchronizer, UnboundedReceiver<ProviderEvent>) {
        let (sink, events) = EventSink::channel();
        let lifecycle = Arc::new(Lifecycle::new(sink));
        lifecycle.ready();

        let mut config = ProviderConfig::for_testing("docs/a");
        config.compress = false;
        config.chunk_size = chunk_size;
        let sync = PersistenceSynchronizer::new(
            &config,
            store,
            replica,
            Arc::new(RevisionTracker::default()),
            lifecycle,
        )
        .unwrap();
        (sync, events)
    }

    fn fixture(store_config: MemoryStoreConfig, chunk_size: Option<usize>) -> Fixture {
        let store = Arc::new(MemoryStore::new(store_config));
        let replica = Arc::new(DocumentReplica::with_client_id(7).unwrap());
        let (sync, events) = synchronizer(store.clone(), replica.clone(), chunk_size);
        Fixture {
            store,
            replica,
            sync,
            events,
        }
    }

    fn sequential() -> MemoryStoreConfig {
        MemoryStoreConfig {
            transactional: false,
            ..MemoryStoreConfig::for_testing()
        }
    }

    /// Removes `docs/a` right after the first chunk of an armed write lands.
    struct DeletesMidWrite {
        inner: Arc<MemoryStore>,
        armed: AtomicBool,
    }

    #[async_trait]
    impl DocumentStore for DeletesMidWrite {
        async fn get(&self, path: &str) -> Result<Option<StoredDocument>, StoreError> {
            self.inner.get(path).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<StoredDocument>, StoreError> {
            self.inner.list(prefix).await
        }

        async fn commit(&self, ops: Vec<WriteOp>) -> Result<Revision, StoreError> {
            let chunk = ops.iter().any(|op| op.path().contains("/chunks/"));
            let revision = self.inner.commit(ops).await?;
            if chunk && self.armed.swap(false, Ordering::SeqCst) {
                self.inner.remove_document("docs/a").await;
            }
            Ok(revision)
        }

        fn watch(&self, prefix: &str) -> Watch {
            self.inner.watch(prefix)
        }

        fn supports_transactions(&self) -> bool {
            false
        }

        fn max_document_size(&self) -> usize {
            self.inner.max_document_size()
        }
    }

    fn saving_events(rx: &mut UnboundedReceiver<ProviderEvent>) -> Vec<bool> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ProviderEvent::Saving(saving) = event {
                out.push(saving);
            }
        }
        out
    }

    async fn stored_text(store: &MemoryStore) -> String {
        let snapshot = read_snapshot(store, "docs/a").await.unwrap().unwrap();
        let check = DocumentReplica::with_client_id(99).unwrap();
        check.apply_remote(&snapshot.state).unwrap();
        check.text()
    }

    #[tokio::test]
    async fn test_flush_writes_and_acknowledges() {
        let mut fx = fixture(MemoryStoreConfig::for_testing(), None);
        let (_tx, mut shutdown) = watch::channel(false);

        fx.replica.push("hello");
        let outcome = fx.sync.flush(&mut shutdown).await;
        assert!(matches!(outcome, FlushOutcome::Persisted(_)));
        assert_eq!(fx.replica.pending_len(), 0);
        assert_eq!(stored_text(&fx.store).await, "hello");
        assert_eq!(saving_events(&mut fx.events), vec![true, false]);

        // Nothing pending: no write, no status change
        assert_eq!(fx.sync.flush(&mut shutdown).await, FlushOutcome::Clean);
        assert_eq!(fx.store.write_count("docs/a").await, 1);
        assert!(saving_events(&mut fx.events).is_empty());
    }

    #[tokio::test]
    async fn test_merges_instead_of_overwriting() {
        let fx = fixture(MemoryStoreConfig::for_testing(), None);
        let (_tx, mut shutdown) = watch::channel(false);

        // Another client's snapshot already in the store
        let other = DocumentReplica::with_client_id(8).unwrap();
        other.push("theirs ");
        let theirs = other.capture_local_update(CaptureMode::FullState);
        let encoded = SnapshotCodec::new(1024, Compression::None).unwrap().encode(&theirs);
        fx.store
            .commit(vec![WriteOp::put("docs/a", encoded.header.encode().unwrap())])
            .await
            .unwrap();

        fx.replica.push("mine");
        fx.sync.flush(&mut shutdown).await;

        let text = stored_text(&fx.store).await;
        assert!(text.contains("theirs "));
        assert!(text.contains("mine"));
        assert_eq!(fx.replica.text(), text);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_retry_then_succeed() {
        let mut fx = fixture(MemoryStoreConfig::for_testing(), None);
        let (_tx, mut shutdown) = watch::channel(false);
        fx.store
            .fail_next_commits(StoreError::Unavailable("blip".into()), 2)
            .await;

        fx.replica.push("once");
        let outcome = fx.sync.flush(&mut shutdown).await;

        assert!(matches!(outcome, FlushOutcome::Persisted(_)));
        assert_eq!(saving_events(&mut fx.events), vec![true, true, false]);
        assert_eq!(stored_text(&fx.store).await, "once");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_keeps_updates() {
        let fx = fixture(MemoryStoreConfig::for_testing(), None);
        let (_tx, mut shutdown) = watch::channel(false);
        fx.store
            .fail_next_commits(StoreError::Throttled("busy".into()), 100)
            .await;

        fx.replica.push("kept");
        let outcome = fx.sync.flush(&mut shutdown).await;
        assert_eq!(outcome, FlushOutcome::Failed(DisconnectReason::RetriesExhausted));
        assert_eq!(fx.replica.pending_len(), 1);
        assert_eq!(fx.sync.status(), SaveStatus::Idle);
    }

    #[tokio::test]
    async fn test_permission_denied_is_permanent() {
        let fx = fixture(MemoryStoreConfig::for_testing(), None);
        let (_tx, mut shutdown) = watch::channel(false);
        fx.store
            .fail_next_commits(StoreError::PermissionDenied("docs/a".into()), 1)
            .await;

        fx.replica.push("x");
        assert_eq!(
            fx.sync.flush(&mut shutdown).await,
            FlushOutcome::Failed(DisconnectReason::PermissionDenied)
        );
        assert_eq!(fx.store.commit_count().await, 0);
        assert_eq!(fx.replica.pending_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_retry_wait() {
        let fx = fixture(MemoryStoreConfig::for_testing(), None);
        let (tx, mut shutdown) = watch::channel(false);
        fx.store
            .fail_next_commits(StoreError::Unavailable("down".into()), 1)
            .await;
        tx.send(true).unwrap();

        fx.replica.push("x");
        assert_eq!(fx.sync.flush(&mut shutdown).await, FlushOutcome::Cancelled);
        assert_eq!(fx.replica.pending_len(), 1);
    }

    #[tokio::test]
    async fn test_shrinking_snapshot_removes_stale_chunks() {
        let fx = fixture(MemoryStoreConfig::for_testing(), Some(4096));
        let (_tx, mut shutdown) = watch::channel(false);

        // A previous writer with tiny chunks left three of them behind
        fx.replica.push("some text that was written before");
        let state = fx.replica.capture_local_update(CaptureMode::FullState);
        let tiny = SnapshotCodec::new(state.len() / 3 + 1, Compression::None).unwrap();
        let old = tiny.encode(&state);
        assert_eq!(old.chunks.len(), 3);
        let mut ops: Vec<WriteOp> = old
            .chunks
            .iter()
            .map(|c| {
                let path = codec::chunk_path("docs/a", old.header.generation, c.index);
                WriteOp::put(path, c.encode().unwrap())
            })
            .collect();
        ops.push(WriteOp::put("docs/a", old.header.encode().unwrap()));
        fx.store.commit(ops).await.unwrap();

        fx.replica.push("!");
        fx.sync.flush(&mut shutdown).await;

        assert!(fx.store.list(&codec::chunk_prefix("docs/a")).await.unwrap().is_empty());
        let snapshot = read_snapshot(fx.store.as_ref(), "docs/a").await.unwrap().unwrap();
        assert_eq!(snapshot.header.chunk_count(), 0);
        assert_eq!(stored_text(&fx.store).await, "some text that was written before!");
    }

    #[tokio::test]
    async fn test_sequential_fallback_writes_chunks_then_header() {
        let fx = fixture(sequential(), Some(16));
        let (_tx, mut shutdown) = watch::channel(false);

        fx.replica.push("a document long enough to need several chunks");
        let outcome = fx.sync.flush(&mut shutdown).await;
        let FlushOutcome::Persisted(revision) = outcome else {
            panic!("unexpected {outcome:?}");
        };

        let header = fx.store.get("docs/a").await.unwrap().unwrap();
        assert_eq!(header.revision, revision);
        let chunks = fx.store.list(&codec::chunk_prefix("docs/a")).await.unwrap();
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.revision < revision));
        assert_eq!(
            stored_text(&fx.store).await,
            "a document long enough to need several chunks"
        );
    }

    #[tokio::test]
    async fn test_missing_document_after_seen_is_deletion() {
        let fx = fixture(MemoryStoreConfig::for_testing(), None);
        let (_tx, mut shutdown) = watch::channel(false);

        fx.replica.push("first");
        fx.sync.flush(&mut shutdown).await;
        fx.store.remove_document("docs/a").await;

        fx.replica.push(" second");
        assert_eq!(fx.sync.flush(&mut shutdown).await, FlushOutcome::Deleted);
        assert!(fx.store.get("docs/a").await.unwrap().is_none());
        assert_eq!(fx.replica.pending_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_chunk_write_keeps_live_snapshot() {
        let fx = fixture(sequential(), Some(16));
        let (_tx, mut shutdown) = watch::channel(false);

        fx.replica.push("the first version, several chunks long");
        fx.sync.flush(&mut shutdown).await;
        let live = read_snapshot(fx.store.as_ref(), "docs/a").await.unwrap().unwrap();
        assert!(live.header.chunk_count() > 2);

        // Chunk 0 of the next write lands, chunk 1 does not
        fx.replica.push(" and an edit");
        fx.store
            .fail_commit_after(1, StoreError::Unavailable("blip".into()))
            .await;
        assert!(fx.sync.flush_once().await.is_err());
        assert_eq!(fx.replica.pending_len(), 1);

        let after = read_snapshot(fx.store.as_ref(), "docs/a").await.unwrap().unwrap();
        assert_eq!(after.header, live.header);
        assert_eq!(after.state, live.state);
        let listed = fx.store.list(&codec::chunk_prefix("docs/a")).await.unwrap();
        assert_eq!(listed.len(), live.chunk_paths.len());

        // The retry reads the intact snapshot and replaces it
        assert!(matches!(
            fx.sync.flush(&mut shutdown).await,
            FlushOutcome::Persisted(_)
        ));
        assert_eq!(
            stored_text(&fx.store).await,
            "the first version, several chunks long and an edit"
        );
        let current = read_snapshot(fx.store.as_ref(), "docs/a").await.unwrap().unwrap();
        let listed = fx.store.list(&codec::chunk_prefix("docs/a")).await.unwrap();
        let live_prefix = codec::generation_prefix("docs/a", current.header.generation);
        assert!(listed.iter().all(|c| c.path.starts_with(&live_prefix)));
    }

    #[tokio::test]
    async fn test_deleted_mid_write_is_not_recreated() {
        let memory = Arc::new(MemoryStore::new(sequential()));
        let store = Arc::new(DeletesMidWrite {
            inner: memory.clone(),
            armed: AtomicBool::new(false),
        });
        let replica = Arc::new(DocumentReplica::with_client_id(7).unwrap());
        let (sync, _events) = synchronizer(store.clone(), replica.clone(), Some(16));
        let (_tx, mut shutdown) = watch::channel(false);

        replica.push("a document long enough to need several chunks");
        assert!(matches!(sync.flush(&mut shutdown).await, FlushOutcome::Persisted(_)));

        store.armed.store(true, Ordering::SeqCst);
        replica.push(" and more");
        assert_eq!(sync.flush(&mut shutdown).await, FlushOutcome::Deleted);
        assert!(memory.get("docs/a").await.unwrap().is_none());
        assert!(memory.list(&codec::chunk_prefix("docs/a")).await.unwrap().is_empty());
        assert_eq!(replica.pending_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreadable_snapshot_is_corruption() {
        let fx = fixture(MemoryStoreConfig::for_testing(), None);
        let (_tx, mut shutdown) = watch::channel(false);
        fx.store.insert_raw("docs/a", vec![0xFF; 12]).await;

        fx.replica.push("x");
        assert_eq!(
            fx.sync.flush(&mut shutdown).await,
            FlushOutcome::Failed(DisconnectReason::CorruptSnapshot)
        );
        assert_eq!(fx.store.write_count("docs/a").await, 0);
        assert_eq!(fx.replica.pending_len(), 1);
    }
}
