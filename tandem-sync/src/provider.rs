//! Document provider: binds one replica to one document path.
//!
//! ```text
//!  replica edits ──signal──► debounce ──► PersistenceSynchronizer ──► store
//!                                                                       │
//!  replica ◄── apply_remote ◄── RemoteListener ◄── watch(<doc>) ◄───────┤
//!                                                                       │
//!  on_awareness ◄── AwarenessChannel ◄── watch(<doc>/presence) ◄────────┘
//! ```
//!
//! Every callback goes through a single dispatcher task, so handlers run
//! in order and never on the caller's stack.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tandem_core::{ClientId, DocumentReplica, Subscription};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::awareness::{AwarenessChannel, AwarenessField, PeerMap};
use crate::config::ProviderConfig;
use crate::error::SyncError;
use crate::events::{spawn_dispatcher, EventSink, ProviderEvent, ProviderHandler};
use crate::lifecycle::{DisconnectReason, Lifecycle, ProviderState};
use crate::listener::{ListenOutcome, RemoteListener, RevisionTracker};
use crate::persistence::{FlushOutcome, PersistenceSynchronizer, SaveStatus};
use crate::store::{DocumentStore, Watch, WatchEvent};

/// Receivers held until `start()` hands them to their tasks.
struct Startup {
    handler: Arc<dyn ProviderHandler>,
    events: mpsc::UnboundedReceiver<ProviderEvent>,
    signals: mpsc::UnboundedReceiver<()>,
}

struct ProviderInner {
    config: ProviderConfig,
    store: Arc<dyn DocumentStore>,
    replica: Arc<DocumentReplica>,
    lifecycle: Arc<Lifecycle>,
    persistence: PersistenceSynchronizer,
    listener: RemoteListener,
    awareness: AwarenessChannel,
    shutdown: watch::Sender<bool>,
    /// Wakes the debounce worker.
    signals: mpsc::UnboundedSender<()>,
    deleted: AtomicBool,
    /// Serializes flushes from the debounce worker, `flush_now` and
    /// `destroy`.
    flush_lock: tokio::sync::Mutex<()>,
}

impl ProviderInner {
    /// Initial read, retried per the policy. Errors that survive the
    /// retries are returned, unreadable snapshots included.
    async fn hydrate(&self) -> Result<(), SyncError> {
        let retry = &self.config.retry;
        let mut failures = 0u32;
        loop {
            let error = match self.listener.hydrate().await {
                Ok(_) => return Ok(()),
                Err(e) => e,
            };
            failures += 1;
            if !error.is_transient() || failures >= retry.max_attempts {
                return Err(error);
            }
            let delay = retry.backoff(failures);
            log::warn!(
                "loading {} failed (attempt {failures}), retrying in {delay:?}: {error}",
                self.config.path
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Flush pending edits. Returns false once writes must stop.
    async fn flush(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let _guard = self.flush_lock.lock().await;
        if self.lifecycle.is_terminal() {
            return false;
        }
        match self.persistence.flush(shutdown).await {
            FlushOutcome::Clean | FlushOutcome::Persisted(_) => true,
            FlushOutcome::Deleted => {
                self.handle_deleted();
                false
            }
            FlushOutcome::Failed(reason) => {
                self.stop(reason);
                false
            }
            FlushOutcome::Cancelled => false,
        }
    }

    fn signal(&self) {
        let _ = self.signals.send(());
    }

    fn handle_deleted(&self) {
        if self.deleted.swap(true, Ordering::SeqCst) {
            return;
        }
        log::warn!("{} was deleted from the store", self.config.path);
        self.stop(DisconnectReason::Deleted);
    }

    fn stop(&self, reason: DisconnectReason) {
        let _ = self.shutdown.send(true);
        self.lifecycle.disconnect(reason);
    }
}

/// Keeps a [`DocumentReplica`] in sync with a document in a
/// [`DocumentStore`].
///
/// Local edits are debounced and written as a merged snapshot; remote
/// snapshots are merged into the replica as their notices arrive; presence
/// is exchanged through per-client entries next to the document.
pub struct DocumentProvider {
    inner: Arc<ProviderInner>,
    startup: Mutex<Option<Startup>>,
    observer: Mutex<Option<Subscription>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl DocumentProvider {
    /// Create a provider. Nothing is read or spawned until [`start`].
    ///
    /// [`start`]: DocumentProvider::start
    pub fn new(
        config: ProviderConfig,
        store: Arc<dyn DocumentStore>,
        replica: Arc<DocumentReplica>,
        handler: impl ProviderHandler,
    ) -> Result<Self, SyncError> {
        let (sink, events) = EventSink::channel();
        let lifecycle = Arc::new(Lifecycle::new(sink));
        let tracker = Arc::new(RevisionTracker::default());

        let persistence = PersistenceSynchronizer::new(
            &config,
            store.clone(),
            replica.clone(),
            tracker.clone(),
            lifecycle.clone(),
        )?;
        let listener = RemoteListener::new(
            store.clone(),
            replica.clone(),
            config.path.clone(),
            tracker,
        );
        let awareness = AwarenessChannel::new(
            store.clone(),
            config.path.clone(),
            replica.client_id(),
            config.awareness.clone(),
            lifecycle.clone(),
        );
        let (shutdown, _) = watch::channel(false);
        let (signal_tx, signals) = mpsc::unbounded_channel();

        Ok(Self {
            inner: Arc::new(ProviderInner {
                config,
                store,
                replica,
                lifecycle,
                persistence,
                listener,
                awareness,
                shutdown,
                signals: signal_tx,
                deleted: AtomicBool::new(false),
                flush_lock: tokio::sync::Mutex::new(()),
            }),
            startup: Mutex::new(Some(Startup {
                handler: Arc::new(handler),
                events,
                signals,
            })),
            observer: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
        })
    }

    /// Load the stored document, then begin syncing.
    ///
    /// `on_ready` fires once the stored state has been merged into the
    /// replica. A load that keeps failing disconnects the provider and
    /// returns the last error.
    pub async fn start(&self) -> Result<(), SyncError> {
        let Startup {
            handler,
            events,
            signals,
        } = self
            .startup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| {
                if self.destroyed.load(Ordering::SeqCst) {
                    SyncError::Disconnected
                } else {
                    SyncError::AlreadyStarted
                }
            })?;
        let inner = &self.inner;
        // Runs until the Disconnected event, so it outlives the other tasks
        let _ = spawn_dispatcher(handler, events);

        if inner.lifecycle.is_terminal() {
            return Err(SyncError::Disconnected);
        }

        // Subscribe before reading so no write between the two is missed
        let doc_watch = inner.store.watch(&inner.config.path);
        let presence_watch = inner.store.watch(&inner.awareness.prefix());

        if let Err(e) = inner.hydrate().await {
            let reason = if e.is_permission_denied() {
                DisconnectReason::PermissionDenied
            } else if e.is_corruption() {
                DisconnectReason::CorruptSnapshot
            } else if e.is_transient() {
                DisconnectReason::RetriesExhausted
            } else {
                DisconnectReason::StoreRejected
            };
            log::error!("could not load {}: {e}", inner.config.path);
            inner.stop(reason);
            return Err(e);
        }
        if let Err(e) = inner.awareness.reload().await {
            log::warn!("could not load presence for {}: {e}", inner.config.path);
        }

        let signal_tx = inner.signals.clone();
        if inner.replica.pending_len() > 0 {
            // Edits made before start
            inner.signal();
        }
        let subscription = inner.replica.observe_local_updates(move |_| {
            let _ = signal_tx.send(());
        })?;
        *self.observer.lock().unwrap_or_else(PoisonError::into_inner) = Some(subscription);

        if !inner.lifecycle.ready() {
            // Destroyed while loading
            return Err(SyncError::Disconnected);
        }

        let tasks = vec![
            tokio::spawn(run_debounce(
                inner.clone(),
                signals,
                inner.shutdown.subscribe(),
            )),
            tokio::spawn(run_listener(
                inner.clone(),
                doc_watch,
                inner.shutdown.subscribe(),
            )),
            tokio::spawn(run_presence(
                inner.clone(),
                presence_watch,
                inner.shutdown.subscribe(),
            )),
        ];
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(tasks);
        log::info!(
            "syncing {} as client {}",
            inner.config.path,
            inner.replica.client_id()
        );
        Ok(())
    }

    pub fn state(&self) -> ProviderState {
        self.inner.lifecycle.state()
    }

    pub fn save_status(&self) -> SaveStatus {
        self.inner.persistence.status()
    }

    pub fn path(&self) -> &str {
        &self.inner.config.path
    }

    pub fn replica(&self) -> &Arc<DocumentReplica> {
        &self.inner.replica
    }

    pub fn client_id(&self) -> ClientId {
        self.inner.replica.client_id()
    }

    /// Current presence map, including the local entry once one is set.
    pub async fn peers(&self) -> Arc<PeerMap> {
        self.inner.awareness.peers().await
    }

    /// Update one field of the local presence entry and publish it.
    pub async fn set_awareness_field(&self, field: AwarenessField) -> Result<(), SyncError> {
        if self.inner.lifecycle.is_terminal() {
            return Err(SyncError::Disconnected);
        }
        self.inner.awareness.set_local_field(field).await
    }

    /// Flush pending edits now instead of waiting for the debounce.
    pub async fn flush_now(&self) -> Result<(), SyncError> {
        if self
            .startup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
        {
            return Err(SyncError::NotStarted);
        }
        let mut shutdown = self.inner.shutdown.subscribe();
        if self.inner.flush(&mut shutdown).await {
            Ok(())
        } else {
            Err(SyncError::Disconnected)
        }
    }

    /// Stop syncing. Pending edits get one final write attempt and the
    /// local presence entry is removed. Safe to call more than once, and
    /// before [`start`](Self::start), which then fails with
    /// [`SyncError::Disconnected`].
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = &self.inner;
        let _ = inner.shutdown.send(true);
        let unstarted = self
            .startup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let started = unstarted.is_none();
        if let Some(Startup {
            handler, events, ..
        }) = unstarted
        {
            // Never started: the handler still hears about the disconnect
            let _ = spawn_dispatcher(handler, events);
        }

        if started {
            let _guard = inner.flush_lock.lock().await;
            if !inner.lifecycle.is_terminal() && inner.replica.pending_len() > 0 {
                match inner.persistence.flush_once().await {
                    Ok(_) => log::debug!("final flush of {} done", inner.config.path),
                    Err(e) => log::warn!("final flush of {} failed: {e}", inner.config.path),
                }
            }
        }
        if started && !inner.deleted.load(Ordering::SeqCst) {
            inner.awareness.remove_local().await;
        }

        self.observer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
            let _ = task.await;
        }

        inner.lifecycle.disconnect(DisconnectReason::Destroyed);
    }
}

impl Drop for DocumentProvider {
    fn drop(&mut self) {
        let _ = self.inner.shutdown.send(true);
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for DocumentProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentProvider")
            .field("path", &self.inner.config.path)
            .field("client_id", &self.client_id())
            .field("state", &self.state())
            .finish()
    }
}

/// Wait for edits to go quiet, then flush. A burst is cut off after
/// `max_debounce_wait` so continuous typing still gets saved.
async fn run_debounce(
    inner: Arc<ProviderInner>,
    mut signals: mpsc::UnboundedReceiver<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    let debounce = inner.config.debounce;
    let max_wait = inner.config.max_debounce_wait;
    loop {
        if *shutdown.borrow() {
            return;
        }
        tokio::select! {
            _ = shutdown.changed() => return,
            signal = signals.recv() => {
                if signal.is_none() {
                    return;
                }
            }
        }

        let cap = Instant::now() + max_wait;
        let mut deadline = (Instant::now() + debounce).min(cap);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep_until(deadline) => break,
                signal = signals.recv() => match signal {
                    Some(()) => deadline = (Instant::now() + debounce).min(cap),
                    None => return,
                },
            }
        }
        // Signals that arrived during the wait are covered by this flush;
        // edits made while it is in flight signal again
        while signals.try_recv().is_ok() {}

        if !inner.flush(&mut shutdown).await {
            return;
        }
    }
}

async fn run_listener(
    inner: Arc<ProviderInner>,
    mut watch: Watch,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => return,
            event = watch.next() => event,
        };
        let outcome = match event {
            Some(WatchEvent::Change(notice)) => inner.listener.handle_notice(&notice).await,
            Some(WatchEvent::Resync) => {
                log::warn!("missed notices for {}, re-reading", watch.prefix());
                inner.listener.refresh().await
            }
            None => {
                log::warn!("change feed for {} closed", watch.prefix());
                return;
            }
        };
        match outcome {
            ListenOutcome::Deleted => {
                inner.handle_deleted();
                return;
            }
            ListenOutcome::Applied(_) if inner.replica.pending_len() > 0 => inner.signal(),
            ListenOutcome::Applied(_) | ListenOutcome::Skipped => {}
        }
    }
}

async fn run_presence(
    inner: Arc<ProviderInner>,
    mut watch: Watch,
    mut shutdown: watch::Receiver<bool>,
) {
    let config = inner.awareness.config().clone();
    let heartbeat_every = config.heartbeat_interval.max(MIN_TICK);
    let sweep_every = config.sweep_interval.max(MIN_TICK);
    let mut heartbeat = tokio::time::interval_at(Instant::now() + heartbeat_every, heartbeat_every);
    let mut sweep = tokio::time::interval_at(Instant::now() + sweep_every, sweep_every);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = heartbeat.tick() => inner.awareness.heartbeat().await,
            _ = sweep.tick() => {
                let expired = inner.awareness.sweep().await;
                if !expired.is_empty() {
                    log::debug!("expired peers {expired:?} on {}", inner.config.path);
                }
            }
            event = watch.next() => match event {
                Some(WatchEvent::Change(notice)) => inner.awareness.handle_notice(&notice).await,
                Some(WatchEvent::Resync) => {
                    if let Err(e) = inner.awareness.reload().await {
                        log::warn!("could not reload presence for {}: {e}", inner.config.path);
                    }
                }
                None => return,
            },
        }
    }
}

const MIN_TICK: std::time::Duration = std::time::Duration::from_millis(10);
