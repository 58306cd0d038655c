//! The CRDT adapter: one yrs `Doc` with a rich-text `content` field.
//!
//! Local edits made through this type (or natively through [`DocumentReplica::doc`])
//! raise update events and land in the pending queue. Remote bytes go through
//! [`DocumentReplica::apply_remote`], which tags the transaction with
//! [`REMOTE_ORIGIN`] so the resulting update event is never echoed back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::{
    Doc, GetString, Origin, ReadTxn, StateVector, Subscription, Text, TextRef, Transact,
    TransactionMut, Update,
};

use crate::error::ReplicaError;
use crate::pending::PendingQueue;

pub use yrs::types::Attrs;

/// Replica identity inside the CRDT.
pub type ClientId = u64;

/// Origin tag for transactions that merge bytes received from the store.
pub const REMOTE_ORIGIN: &str = "tandem/remote";

/// Name of the shared rich-text field.
const CONTENT_FIELD: &str = "content";

/// Client ids stay within 53 bits so they survive a round-trip through
/// JavaScript peers.
const MAX_CLIENT_ID: u64 = (1 << 53) - 1;

/// What `capture_local_update` should encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// Everything not yet acknowledged as persisted.
    Delta,
    /// The entire document state.
    FullState,
}

/// Random client id for a new provider instance.
pub fn random_client_id() -> ClientId {
    (Uuid::new_v4().as_u128() as u64) & MAX_CLIENT_ID
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn is_remote(txn: &TransactionMut) -> bool {
    txn.origin() == Some(&Origin::from(REMOTE_ORIGIN))
}

/// A document replica owned by exactly one provider.
pub struct DocumentReplica {
    doc: Doc,
    content: TextRef,
    /// Local updates captured since the last successful flush.
    pending: Arc<Mutex<PendingQueue>>,
    /// State known to be persisted; baseline for delta capture.
    acknowledged: Mutex<StateVector>,
    _capture: Subscription,
}

impl DocumentReplica {
    /// Create an empty replica with a random client id.
    pub fn new() -> Result<Self, ReplicaError> {
        Self::with_client_id(random_client_id())
    }

    /// Create an empty replica with an explicit client id (for testing).
    pub fn with_client_id(client_id: ClientId) -> Result<Self, ReplicaError> {
        let doc = Doc::with_client_id(client_id);
        let content = doc.get_or_insert_text(CONTENT_FIELD);
        let pending = Arc::new(Mutex::new(PendingQueue::new()));

        let queue = Arc::clone(&pending);
        let capture = doc
            .observe_update_v1(move |txn, event| {
                if is_remote(txn) {
                    return;
                }
                lock(&queue).enqueue(event.update.clone());
            })
            .map_err(|e| ReplicaError::Observe(e.to_string()))?;

        Ok(Self {
            doc,
            content,
            pending,
            acknowledged: Mutex::new(StateVector::default()),
            _capture: capture,
        })
    }

    pub fn client_id(&self) -> ClientId {
        self.doc.client_id()
    }

    /// Underlying yrs document, for editors that bind natively.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// The shared rich-text field.
    pub fn content(&self) -> &TextRef {
        &self.content
    }

    // ─── Remote side ─────────────────────────────────────────────────

    /// Merge an encoded update received from the store.
    ///
    /// The payload is fully decoded before the document is touched, so a
    /// malformed payload leaves the replica unchanged.
    pub fn apply_remote(&self, update: &[u8]) -> Result<(), ReplicaError> {
        let update = Update::decode_v1(update)?;
        let mut txn = self.doc.transact_mut_with(REMOTE_ORIGIN);
        txn.apply_update(update)
            .map_err(|e| ReplicaError::Integrate(e.to_string()))
    }

    /// Encode local state for persistence.
    pub fn capture_local_update(&self, mode: CaptureMode) -> Vec<u8> {
        let txn = self.doc.transact();
        match mode {
            CaptureMode::FullState => txn.encode_state_as_update_v1(&StateVector::default()),
            CaptureMode::Delta => {
                let baseline = lock(&self.acknowledged).clone();
                txn.encode_state_as_update_v1(&baseline)
            }
        }
    }

    /// Record that everything covered by `state` is durably stored.
    pub fn acknowledge(&self, state: StateVector) {
        *lock(&self.acknowledged) = state;
    }

    pub fn state_vector(&self) -> StateVector {
        self.doc.transact().state_vector()
    }

    /// Queue whatever this replica holds beyond `remote_state` so the next
    /// flush writes it back. Call after merging `remote_state`; a snapshot
    /// written by a peer that read before our last write lands here.
    ///
    /// Deletions do not advance clocks, so comparing state vectors is not
    /// enough: the local diff is replayed onto a copy of `remote_state` and
    /// counts as missing only if it changes that copy.
    ///
    /// Returns true if anything was queued.
    pub fn restore_missing(&self, remote_state: &[u8]) -> Result<bool, ReplicaError> {
        let remote = Doc::new();
        remote
            .transact_mut()
            .apply_update(Update::decode_v1(remote_state)?)
            .map_err(|e| ReplicaError::Integrate(e.to_string()))?;

        let missing = {
            let remote_sv = remote.transact().state_vector();
            self.doc.transact().encode_state_as_update_v1(&remote_sv)
        };

        let changed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&changed);
        let _watch = remote
            .observe_update_v1(move |_, _| flag.store(true, Ordering::SeqCst))
            .map_err(|e| ReplicaError::Observe(e.to_string()))?;
        remote
            .transact_mut()
            .apply_update(Update::decode_v1(&missing)?)
            .map_err(|e| ReplicaError::Integrate(e.to_string()))?;
        if !changed.load(Ordering::SeqCst) {
            return Ok(false);
        }

        log::debug!(
            "client {} queued {} bytes missing from remote state",
            self.client_id(),
            missing.len()
        );
        lock(&self.pending).enqueue(missing);
        Ok(true)
    }

    // ─── Local update events ─────────────────────────────────────────

    /// Register a callback for local (non-`REMOTE`) update events.
    ///
    /// The callback runs inside the committing transaction and must not
    /// open another transaction on this replica. Dropping the returned
    /// subscription unregisters it.
    pub fn observe_local_updates<F>(&self, callback: F) -> Result<Subscription, ReplicaError>
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.doc
            .observe_update_v1(move |txn, event| {
                if !is_remote(txn) {
                    callback(&event.update);
                }
            })
            .map_err(|e| ReplicaError::Observe(e.to_string()))
    }

    /// Take all captured local updates for a flush.
    pub fn take_pending(&self) -> Vec<Vec<u8>> {
        lock(&self.pending).drain()
    }

    /// Return a batch from a failed flush.
    pub fn requeue(&self, batch: Vec<Vec<u8>>) {
        if !batch.is_empty() {
            log::debug!("requeued {} unflushed updates", batch.len());
            lock(&self.pending).requeue(batch);
        }
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.pending).len()
    }

    // ─── Rich text ───────────────────────────────────────────────────

    pub fn insert(&self, index: u32, chunk: &str) {
        let mut txn = self.doc.transact_mut();
        self.content.insert(&mut txn, index, chunk);
    }

    /// Append at the end of the document.
    pub fn push(&self, chunk: &str) {
        let mut txn = self.doc.transact_mut();
        let end = self.content.len(&txn);
        self.content.insert(&mut txn, end, chunk);
    }

    pub fn insert_with_attributes(&self, index: u32, chunk: &str, attributes: Attrs) {
        let mut txn = self.doc.transact_mut();
        self.content
            .insert_with_attributes(&mut txn, index, chunk, attributes);
    }

    /// Apply formatting attributes to a range.
    pub fn format(&self, index: u32, len: u32, attributes: Attrs) {
        let mut txn = self.doc.transact_mut();
        self.content.format(&mut txn, index, len, attributes);
    }

    pub fn remove_range(&self, index: u32, len: u32) {
        let mut txn = self.doc.transact_mut();
        self.content.remove_range(&mut txn, index, len);
    }

    /// Plain text of the document.
    pub fn text(&self) -> String {
        let txn = self.doc.transact();
        self.content.get_string(&txn)
    }

    pub fn len(&self) -> u32 {
        let txn = self.doc.transact();
        self.content.len(&txn)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for DocumentReplica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentReplica")
            .field("client_id", &self.client_id())
            .field("len", &self.len())
            .field("pending", &self.pending_len())
            .finish_non_exhaustive()
    }
}

/// Result of merging several encoded states in a scratch document.
#[derive(Debug, Clone)]
pub struct MergedState {
    /// Full-state encoding of the merge.
    pub update: Vec<u8>,
    /// State vector of the merge.
    pub state_vector: StateVector,
}

/// Merge encoded updates into a detached scratch document.
///
/// Every input is decoded before anything is applied; one corrupt input
/// rejects the whole merge.
pub fn merge_states<I, B>(updates: I) -> Result<MergedState, ReplicaError>
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    let decoded = updates
        .into_iter()
        .map(|bytes| Update::decode_v1(bytes.as_ref()))
        .collect::<Result<Vec<_>, _>>()?;

    let scratch = Doc::new();
    {
        let mut txn = scratch.transact_mut();
        for update in decoded {
            txn.apply_update(update)
                .map_err(|e| ReplicaError::Integrate(e.to_string()))?;
        }
    }

    let txn = scratch.transact();
    Ok(MergedState {
        update: txn.encode_state_as_update_v1(&StateVector::default()),
        state_vector: txn.state_vector(),
    })
}
