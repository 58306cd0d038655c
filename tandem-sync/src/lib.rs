//! # tandem-sync: keep a CRDT document in a document store
//!
//! Synchronizes a [`tandem_core::DocumentReplica`] with any store that can
//! get, list, commit and watch small documents by path.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐   local updates   ┌─────────────────────────┐
//! │ DocumentReplica  │ ─────────────────► │ PersistenceSynchronizer │
//! │ (yrs Doc)        │                    │ read ► merge ► write    │
//! └────────▲─────────┘                    └────────────┬────────────┘
//!          │ apply_remote                              │ commit
//! ┌────────┴─────────┐   change notices  ┌─────────────▼───────────┐
//! │ RemoteListener   │ ◄───────────────── │ DocumentStore           │
//! └──────────────────┘                    │ <doc>                   │
//! ┌──────────────────┐                    │ <doc>/chunks/<gen>/..   │
//! │ AwarenessChannel │ ◄────────────────► │ <doc>/presence/<client> │
//! └──────────────────┘                    └─────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`provider`]: the `DocumentProvider` that wires everything together
//! - [`persistence`]: read-merge-write with retry and save status
//! - [`listener`]: remote change handling
//! - [`awareness`]: presence entries with heartbeat and TTL
//! - [`codec`]: snapshot header and chunk records
//! - [`store`]: the `DocumentStore` trait with in-memory and RocksDB backends
//! - [`events`]: caller-facing events and handler trait

pub mod awareness;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod listener;
pub mod persistence;
pub mod provider;
pub mod store;

pub use awareness::{AwarenessEntry, AwarenessField, CursorRange, PeerMap, UserFields};
pub use codec::{Compression, SnapshotCodec, SnapshotHeader};
pub use config::{AwarenessConfig, ProviderConfig, RetryPolicy};
pub use error::{CodecError, StoreError, SyncError};
pub use events::{NoopHandler, ProviderEvent, ProviderHandler};
pub use lifecycle::{DisconnectReason, ProviderState};
pub use listener::{read_snapshot, RemoteSnapshot};
pub use persistence::SaveStatus;
pub use provider::DocumentProvider;
pub use store::{
    ChangeKind, ChangeNotice, DocumentStore, MemoryStore, MemoryStoreConfig, Revision, RocksConfig,
    RocksStore, StoredDocument, Watch, WatchEvent, WriteOp,
};

/// Milliseconds since the Unix epoch; zero if the clock is before it.
pub(crate) fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
