//! Presence: who else has the document open.
//!
//! ```text
//! set_local_field() ──put──► <doc>/presence/<client_id>
//! heartbeat timer  ──put──►          │
//!                                    ▼ ChangeNotice
//!                            peers: client_id → entry ──► ProviderEvent::Awareness(full map)
//! sweep timer ── drop peers silent for > TTL ─┘
//! ```
//!
//! Expiry is measured against the local receipt time of a peer's last
//! heartbeat, so peers with skewed wall clocks are not dropped early. The
//! wall-clock `heartbeat_at` is only used to skip long-dead entries on the
//! initial load and to order updates from the same peer.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tandem_core::ClientId;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::codec::{decode_record, encode_record};
use crate::config::AwarenessConfig;
use crate::error::{CodecError, SyncError};
use crate::events::ProviderEvent;
use crate::lifecycle::Lifecycle;
use crate::store::{ChangeKind, ChangeNotice, DocumentStore, WriteOp};
use crate::unix_millis;

/// Sub-path segment holding presence entries.
pub const PRESENCE_SEGMENT: &str = "presence";

/// Identity shown to other collaborators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserFields {
    pub name: String,
    /// CSS-style color string, e.g. `#ff8800`
    pub color: String,
    pub avatar: Option<String>,
}

/// Selection in the shared text, in character offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRange {
    pub anchor: u32,
    pub head: u32,
}

/// One settable presence field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AwarenessField {
    User(UserFields),
    Name(String),
    Color(String),
    Avatar(Option<String>),
    Cursor(Option<CursorRange>),
}

/// Presence record stored at `<doc>/presence/<client_id>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessEntry {
    pub client_id: ClientId,
    pub user: UserFields,
    pub cursor: Option<CursorRange>,
    /// Milliseconds since the Unix epoch
    pub heartbeat_at: u64,
}

impl AwarenessEntry {
    pub fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            user: UserFields::default(),
            cursor: None,
            heartbeat_at: unix_millis(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        encode_record(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        decode_record(bytes)
    }

    fn apply(&mut self, field: AwarenessField) {
        match field {
            AwarenessField::User(user) => self.user = user,
            AwarenessField::Name(name) => self.user.name = name,
            AwarenessField::Color(color) => self.user.color = color,
            AwarenessField::Avatar(avatar) => self.user.avatar = avatar,
            AwarenessField::Cursor(cursor) => self.cursor = cursor,
        }
    }

    /// Same visible presence, ignoring the heartbeat.
    fn same_presence(&self, other: &AwarenessEntry) -> bool {
        self.user == other.user && self.cursor == other.cursor
    }
}

/// Every known collaborator, including the local one.
pub type PeerMap = BTreeMap<ClientId, AwarenessEntry>;

pub fn presence_prefix(doc_path: &str) -> String {
    format!("{doc_path}/{PRESENCE_SEGMENT}/")
}

pub fn presence_path(doc_path: &str, client_id: ClientId) -> String {
    format!("{doc_path}/{PRESENCE_SEGMENT}/{client_id}")
}

fn parse_presence_client(doc_path: &str, path: &str) -> Option<ClientId> {
    path.strip_prefix(&presence_prefix(doc_path))?.parse().ok()
}

struct TrackedPeer {
    entry: AwarenessEntry,
    received_at: Instant,
}

#[derive(Default)]
struct PresenceState {
    local: Option<AwarenessEntry>,
    peers: HashMap<ClientId, TrackedPeer>,
    /// Last heartbeat seen from peers dropped by the sweep
    expired: HashMap<ClientId, u64>,
}

impl PresenceState {
    /// Merge a peer entry. Returns true if the visible map changed.
    fn admit(&mut self, entry: AwarenessEntry, now: Instant) -> bool {
        let id = entry.client_id;
        if let Some(&last) = self.expired.get(&id) {
            if entry.heartbeat_at <= last {
                return false;
            }
            self.expired.remove(&id);
        }

        match self.peers.get_mut(&id) {
            Some(tracked) => {
                if entry.heartbeat_at < tracked.entry.heartbeat_at {
                    return false;
                }
                tracked.received_at = now;
                let changed = !tracked.entry.same_presence(&entry);
                tracked.entry = entry;
                changed
            }
            None => {
                self.peers.insert(
                    id,
                    TrackedPeer {
                        entry,
                        received_at: now,
                    },
                );
                true
            }
        }
    }

    fn snapshot(&self) -> PeerMap {
        let mut map: PeerMap = self
            .peers
            .iter()
            .map(|(id, tracked)| (*id, tracked.entry.clone()))
            .collect();
        if let Some(local) = &self.local {
            map.insert(local.client_id, local.clone());
        }
        map
    }
}

pub(crate) struct AwarenessChannel {
    store: Arc<dyn DocumentStore>,
    doc_path: String,
    client_id: ClientId,
    config: AwarenessConfig,
    lifecycle: Arc<Lifecycle>,
    state: Mutex<PresenceState>,
}

impl AwarenessChannel {
    pub(crate) fn new(
        store: Arc<dyn DocumentStore>,
        doc_path: String,
        client_id: ClientId,
        config: AwarenessConfig,
        lifecycle: Arc<Lifecycle>,
    ) -> Self {
        Self {
            store,
            doc_path,
            client_id,
            config,
            lifecycle,
            state: Mutex::new(PresenceState::default()),
        }
    }

    pub(crate) fn prefix(&self) -> String {
        presence_prefix(&self.doc_path)
    }

    pub(crate) fn config(&self) -> &AwarenessConfig {
        &self.config
    }

    fn publish(&self, map: PeerMap) {
        self.lifecycle.emit(ProviderEvent::Awareness(Arc::new(map)));
    }

    pub(crate) async fn peers(&self) -> Arc<PeerMap> {
        Arc::new(self.state.lock().await.snapshot())
    }

    /// Read every presence entry and rebuild the peer map.
    ///
    /// Entries whose wall-clock heartbeat is already older than the TTL are
    /// skipped. Emits the map if anything changed.
    pub(crate) async fn reload(&self) -> Result<(), SyncError> {
        let listed = self.store.list(&self.prefix()).await?;
        let cutoff = unix_millis().saturating_sub(ttl_millis(self.config.ttl));
        let now = Instant::now();

        let mut fresh = Vec::new();
        for doc in listed {
            let Some(id) = parse_presence_client(&self.doc_path, &doc.path) else {
                continue;
            };
            if id == self.client_id {
                continue;
            }
            match AwarenessEntry::decode(&doc.bytes) {
                Ok(entry) if entry.client_id != id => {
                    log::warn!("presence entry at {} claims client {}", doc.path, entry.client_id);
                }
                Ok(entry) if entry.heartbeat_at < cutoff => {
                    log::debug!("skipping stale presence entry for {id}");
                }
                Ok(entry) => fresh.push(entry),
                Err(e) => log::warn!("discarding presence entry at {}: {e}", doc.path),
            }
        }

        let mut state = self.state.lock().await;
        let listed_ids: Vec<ClientId> = fresh.iter().map(|e| e.client_id).collect();
        let before = state.peers.len();
        state.peers.retain(|id, _| listed_ids.contains(id));
        let mut changed = state.peers.len() != before;
        for entry in fresh {
            changed |= state.admit(entry, now);
        }
        if changed {
            let map = state.snapshot();
            drop(state);
            self.publish(map);
        }
        Ok(())
    }

    /// React to a change under the presence prefix.
    pub(crate) async fn handle_notice(&self, notice: &ChangeNotice) {
        let Some(id) = parse_presence_client(&self.doc_path, &notice.path) else {
            return;
        };
        if id == self.client_id {
            return;
        }

        match notice.kind {
            ChangeKind::Removed => {
                let mut state = self.state.lock().await;
                if state.peers.remove(&id).is_some() {
                    log::debug!("peer {id} left");
                    let map = state.snapshot();
                    drop(state);
                    self.publish(map);
                }
            }
            ChangeKind::Upserted => {
                let entry = match self.store.get(&notice.path).await {
                    Ok(Some(doc)) => match AwarenessEntry::decode(&doc.bytes) {
                        Ok(entry) if entry.client_id == id => entry,
                        Ok(_) => {
                            log::warn!("presence entry at {} has a foreign client id", notice.path);
                            return;
                        }
                        Err(e) => {
                            log::warn!("discarding presence entry at {}: {e}", notice.path);
                            return;
                        }
                    },
                    // Removed again before we got to it
                    Ok(None) => return,
                    Err(e) => {
                        log::warn!("failed to read presence for {id}: {e}");
                        return;
                    }
                };

                let mut state = self.state.lock().await;
                if state.admit(entry, Instant::now()) {
                    let map = state.snapshot();
                    drop(state);
                    self.publish(map);
                }
            }
        }
    }

    /// Drop peers whose last heartbeat arrived more than one TTL ago.
    pub(crate) async fn sweep(&self) -> Vec<ClientId> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let ttl = self.config.ttl;

        let expired: Vec<ClientId> = state
            .peers
            .iter()
            .filter(|(_, tracked)| now.duration_since(tracked.received_at) > ttl)
            .map(|(id, _)| *id)
            .collect();
        if expired.is_empty() {
            return expired;
        }

        for id in &expired {
            if let Some(tracked) = state.peers.remove(id) {
                state.expired.insert(*id, tracked.entry.heartbeat_at);
            }
        }
        log::debug!("expired {} silent peers", expired.len());
        let map = state.snapshot();
        drop(state);
        self.publish(map);
        expired
    }

    /// Update one local field and write the entry immediately.
    pub(crate) async fn set_local_field(&self, field: AwarenessField) -> Result<(), SyncError> {
        let (entry, map) = {
            let mut state = self.state.lock().await;
            let local = state
                .local
                .get_or_insert_with(|| AwarenessEntry::new(self.client_id));
            local.apply(field);
            local.heartbeat_at = unix_millis();
            let entry = local.clone();
            (entry, state.snapshot())
        };

        self.publish(map);
        self.write_local(&entry).await
    }

    /// Re-write the local entry with a fresh heartbeat, if one exists.
    pub(crate) async fn heartbeat(&self) {
        let entry = {
            let mut state = self.state.lock().await;
            match state.local.as_mut() {
                Some(local) => {
                    local.heartbeat_at = unix_millis();
                    local.clone()
                }
                None => return,
            }
        };
        if let Err(e) = self.write_local(&entry).await {
            log::warn!("presence heartbeat failed: {e}");
        }
    }

    /// Delete the local entry. Failures are logged; peers fall back to TTL.
    pub(crate) async fn remove_local(&self) {
        let had_local = self.state.lock().await.local.take().is_some();
        if !had_local {
            return;
        }
        let path = presence_path(&self.doc_path, self.client_id);
        if let Err(e) = self.store.commit(vec![WriteOp::delete(path)]).await {
            log::warn!("failed to remove presence entry: {e}");
        }
    }

    async fn write_local(&self, entry: &AwarenessEntry) -> Result<(), SyncError> {
        let path = presence_path(&self.doc_path, self.client_id);
        self.store
            .commit(vec![WriteOp::put(path, entry.encode()?)])
            .await?;
        Ok(())
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}
