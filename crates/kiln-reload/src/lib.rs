//! Reload notifications for connected clients.
//!
//! [`ReloadNotifier`] is a minimal publish/subscribe fan-out: the rebuild
//! coordinator broadcasts a [`ReloadEvent`] after every successful build,
//! and connected listeners (typically browser clients holding an open
//! socket) pick it up and refresh. Subscribers attach and detach at any
//! time without affecting in-flight builds; closed subscribers are dropped
//! on the next broadcast.
//!
//! Delivery is best effort: a subscriber whose queue is full simply misses
//! that event (a reload is not a durable message; the next one supersedes
//! it), and send errors never propagate to the build loop.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

/// Events can pile up only if a subscriber stops draining its queue; cap it
/// so a stuck client cannot grow memory without bound.
const SUBSCRIBER_QUEUE_CAPACITY: usize = 1024;

/// The wire message sent to listeners.
///
/// Serializes as `{"type":"reload","timestamp":<epoch-ms>}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ReloadEvent {
    Reload { timestamp: u64 },
}

impl ReloadEvent {
    pub fn now() -> Self {
        Self::Reload {
            timestamp: kiln_core::now_millis(),
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            Self::Reload { timestamp } => *timestamp,
        }
    }

    /// The JSON form written to a subscriber's transport.
    pub fn to_wire_json(&self) -> String {
        // Serialization of this enum cannot fail: it has no maps or
        // non-string keys.
        serde_json::to_string(self).expect("reload event serialization is infallible")
    }
}

/// Handle held by a connected listener. Dropping it detaches the listener.
pub type ReloadReceiver = async_channel::Receiver<ReloadEvent>;

/// Fan-out of reload events to currently-connected listeners.
#[derive(Clone, Default)]
pub struct ReloadNotifier {
    subscribers: Arc<Mutex<Vec<async_channel::Sender<ReloadEvent>>>>,
}

impl ReloadNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a listener and returns its event stream.
    pub fn subscribe(&self) -> ReloadReceiver {
        let (tx, rx) = async_channel::bounded(SUBSCRIBER_QUEUE_CAPACITY);
        self.subscribers
            .lock()
            .expect("reload subscriber mutex poisoned")
            .push(tx);
        rx
    }

    /// Sends `event` to every connected listener.
    ///
    /// Listeners that have disconnected are removed; listeners with a full
    /// queue miss this event but stay connected. Returns the number of
    /// listeners the event was delivered to.
    pub fn broadcast(&self, event: ReloadEvent) -> usize {
        let mut delivered = 0_usize;
        let mut subscribers = self
            .subscribers
            .lock()
            .expect("reload subscriber mutex poisoned");
        subscribers.retain(|tx| match tx.try_send(event) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(async_channel::TrySendError::Full(_)) => true,
            Err(async_channel::TrySendError::Closed(_)) => false,
        });
        tracing::debug!(
            target = "kiln.reload",
            delivered,
            subscribers = subscribers.len(),
            "broadcast reload event"
        );
        delivered
    }

    /// Number of currently-connected listeners.
    ///
    /// Counts listeners that disconnected since the last broadcast too;
    /// they are only reaped when a broadcast notices the closed channel.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("reload subscriber mutex poisoned")
            .len()
    }
}
