//! Relay<T> - fire-and-forget event streaming
//!
//! The store uses relays to hand value changes to its dispatcher loop and to
//! deliver notifications to subscribers.

use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use std::sync::Arc;

/// Type-safe event relay backed by an unbounded channel.
///
/// Relay names follow the `{source}_{event}_relay` pattern used across the
/// crate, e.g. `value_changed_relay`.
///
/// ```rust,ignore
/// let (value_changed_relay, mut value_changed_stream) = relay();
///
/// value_changed_relay.send(change);
///
/// while let Some(change) = value_changed_stream.next().await {
///     // propagate
/// }
/// ```
pub struct Relay<T> {
    sender: Arc<UnboundedSender<T>>,
}

impl<T> Clone for Relay<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<T> Relay<T>
where
    T: Send + 'static,
{
    /// Creates a relay together with the receiving end of its channel.
    ///
    /// Use the `relay()` function instead for creating Relay+Stream pairs.
    pub(crate) fn with_receiver() -> (Self, UnboundedReceiver<T>) {
        let (sender, receiver) = mpsc::unbounded();
        let relay = Relay {
            sender: Arc::new(sender),
        };
        (relay, receiver)
    }

    /// Sends an event through this relay.
    ///
    /// If the receiver has been dropped the event is silently discarded.
    pub fn send(&self, value: T) {
        // Fire-and-forget semantics - if no receivers, event is dropped
        let _ = self.sender.unbounded_send(value);
    }

    /// Checks if this relay is closed (receiver dropped).
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

// Debug implementation that doesn't expose internal channel details
impl<T> std::fmt::Debug for Relay<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

/// Creates a new Relay with an associated receiver stream.
pub fn relay<T>() -> (Relay<T>, UnboundedReceiver<T>)
where
    T: Send + 'static,
{
    Relay::with_receiver()
}
