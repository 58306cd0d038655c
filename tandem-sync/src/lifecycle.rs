//! Provider lifecycle state machine.
//!
//! ```text
//!  Initializing ──ready──► Ready ◄──► Saving
//!        │                   │          │
//!        └───────────────────┴──────────┴──► Disconnected (terminal)
//! ```
//!
//! All caller-visible events pass through [`Lifecycle`], which drops them
//! once the provider is disconnected so `Disconnected` is always last.

use std::sync::{PoisonError, RwLock};

use crate::events::{EventSink, ProviderEvent};

/// Why a provider stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `destroy()` was called.
    Destroyed,
    /// The document disappeared from the store.
    Deleted,
    /// The store refused access.
    PermissionDenied,
    /// A flush kept failing transiently.
    RetriesExhausted,
    /// The store permanently rejected a request (size limit, internal error).
    StoreRejected,
    /// The stored snapshot could not be decoded on any attempt.
    CorruptSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderState {
    Initializing,
    Ready,
    Saving,
    Disconnected(DisconnectReason),
}

impl ProviderState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProviderState::Disconnected(_))
    }
}

pub(crate) struct Lifecycle {
    state: RwLock<ProviderState>,
    events: EventSink,
}

impl Lifecycle {
    pub(crate) fn new(events: EventSink) -> Self {
        Self {
            state: RwLock::new(ProviderState::Initializing),
            events,
        }
    }

    pub(crate) fn state(&self) -> ProviderState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// `Initializing → Ready`. Returns false if already past initialization.
    pub(crate) fn ready(&self) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *state != ProviderState::Initializing {
            return false;
        }
        *state = ProviderState::Ready;
        log::info!("provider ready");
        self.events.emit(ProviderEvent::Ready);
        true
    }

    /// Report a save-status transition.
    pub(crate) fn saving(&self, saving: bool) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match *state {
            ProviderState::Disconnected(_) => return,
            ProviderState::Ready | ProviderState::Saving => {
                *state = if saving {
                    ProviderState::Saving
                } else {
                    ProviderState::Ready
                };
            }
            // Final flush during a failed start
            ProviderState::Initializing => {}
        }
        self.events.emit(ProviderEvent::Saving(saving));
    }

    /// Queue a non-lifecycle event unless already disconnected.
    pub(crate) fn emit(&self, event: ProviderEvent) {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        if !state.is_terminal() {
            self.events.emit(event);
        }
    }

    /// Enter the terminal state. `Deleted` is announced before the
    /// disconnect. Returns false if already disconnected.
    pub(crate) fn disconnect(&self, reason: DisconnectReason) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.is_terminal() {
            return false;
        }
        *state = ProviderState::Disconnected(reason);
        match reason {
            DisconnectReason::Destroyed | DisconnectReason::Deleted => {
                log::info!("provider disconnected: {reason:?}");
            }
            DisconnectReason::PermissionDenied
            | DisconnectReason::RetriesExhausted
            | DisconnectReason::StoreRejected
            | DisconnectReason::CorruptSnapshot => {
                log::error!("provider disconnected: {reason:?}");
            }
        }
        if reason == DisconnectReason::Deleted {
            self.events.emit(ProviderEvent::Deleted);
        }
        self.events.emit(ProviderEvent::Disconnected(reason));
        true
    }
}
