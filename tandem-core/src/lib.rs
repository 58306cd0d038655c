//! # tandem-core: the document replica behind a Tandem provider
//!
//! Wraps a yrs `Doc` holding one rich-text field and exposes the narrow
//! capability the synchronizer needs from a CRDT:
//!
//! ```text
//!   editor ──► DocumentReplica ──► local update event ──► PendingQueue
//!                    ▲                                          │
//!                    │ apply_remote (REMOTE origin)             ▼
//!             remote snapshot                           synchronizer flush
//! ```
//!
//! The synchronizer treats every update as opaque bytes; only this crate
//! knows they are yrs v1 updates.

pub mod error;
pub mod pending;
pub mod replica;

pub use error::ReplicaError;
pub use pending::PendingQueue;
pub use replica::{
    merge_states, random_client_id, Attrs, CaptureMode, ClientId, DocumentReplica, MergedState,
    REMOTE_ORIGIN,
};
pub use yrs::{StateVector, Subscription};
