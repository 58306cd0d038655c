//! Caller-facing notifications.
//!
//! Each provider owns one [`ProviderHandler`], injected at construction.
//! Components never call the handler directly: they queue a
//! [`ProviderEvent`] and a dispatcher task delivers it, so callbacks always
//! run off the call stack that produced them.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::awareness::PeerMap;
use crate::lifecycle::DisconnectReason;

/// Notification delivered to a [`ProviderHandler`].
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    /// Hydrated and subscribed.
    Ready,
    /// Save status changed.
    Saving(bool),
    /// The document was removed from the store.
    Deleted,
    /// Full peer map after any presence change.
    Awareness(Arc<PeerMap>),
    /// Terminal transition. Always the last event.
    Disconnected(DisconnectReason),
}

/// Per-instance callbacks. Every method defaults to a no-op.
pub trait ProviderHandler: Send + Sync + 'static {
    fn on_ready(&self) {}

    fn on_saving(&self, _saving: bool) {}

    fn on_deleted(&self) {}

    fn on_awareness(&self, _peers: Arc<PeerMap>) {}

    fn on_disconnected(&self, _reason: DisconnectReason) {}
}

/// Forward every callback into a channel.
impl ProviderHandler for mpsc::UnboundedSender<ProviderEvent> {
    fn on_ready(&self) {
        let _ = self.send(ProviderEvent::Ready);
    }

    fn on_saving(&self, saving: bool) {
        let _ = self.send(ProviderEvent::Saving(saving));
    }

    fn on_deleted(&self) {
        let _ = self.send(ProviderEvent::Deleted);
    }

    fn on_awareness(&self, peers: Arc<PeerMap>) {
        let _ = self.send(ProviderEvent::Awareness(peers));
    }

    fn on_disconnected(&self, reason: DisconnectReason) {
        let _ = self.send(ProviderEvent::Disconnected(reason));
    }
}

/// A handler that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;

impl ProviderHandler for NoopHandler {}

fn deliver(handler: &dyn ProviderHandler, event: ProviderEvent) {
    match event {
        ProviderEvent::Ready => handler.on_ready(),
        ProviderEvent::Saving(saving) => handler.on_saving(saving),
        ProviderEvent::Deleted => handler.on_deleted(),
        ProviderEvent::Awareness(peers) => handler.on_awareness(peers),
        ProviderEvent::Disconnected(reason) => handler.on_disconnected(reason),
    }
}

/// Queue side of the dispatcher.
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    tx: mpsc::UnboundedSender<ProviderEvent>,
}

impl EventSink {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<ProviderEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub(crate) fn emit(&self, event: ProviderEvent) {
        if self.tx.send(event).is_err() {
            log::debug!("event dropped, dispatcher gone");
        }
    }
}

/// Deliver queued events in order until the terminal event or until every
/// sink is dropped.
pub(crate) fn spawn_dispatcher(
    handler: Arc<dyn ProviderHandler>,
    mut rx: mpsc::UnboundedReceiver<ProviderEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let terminal = matches!(event, ProviderEvent::Disconnected(_));
            deliver(handler.as_ref(), event);
            if terminal {
                break;
            }
        }
    })
}
