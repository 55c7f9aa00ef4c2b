//! Event system for asynchronous state notifications
//!
//! Applications subscribe to route, message, stream, and affinity events
//! rather than polling the router. Handlers are plain callbacks; a panicking
//! handler is isolated and logged without affecting the others.

use crate::address::VertexId;
use crate::protocol::Cost;
use parking_lot::RwLock;
use std::sync::Arc;
use uuid::Uuid;

/// Why a packet could not be forwarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteFailure {
    /// No routing entry for the destination
    NoRoute,
    /// The route points back at the peer the packet arrived from
    Bounce,
    /// The inbound and outbound links are not associated
    NotBridged,
}

/// Events delivered to application handlers
#[derive(Debug, Clone)]
pub enum Event {
    /// A destination became reachable
    RouteAvailable {
        /// The destination
        dest: VertexId,
        /// Cost of the route
        cost: Cost,
    },

    /// The route to a known destination changed (cost or next hop)
    RouteChange {
        /// The destination
        dest: VertexId,
        /// New cost
        cost: Cost,
    },

    /// A destination is no longer reachable
    RouteUnavailable {
        /// The destination
        dest: VertexId,
    },

    /// A packet was dropped at this instance
    RouterError {
        /// Intended destination, when the packet named one
        dest: Option<VertexId>,
        /// Why forwarding failed
        reason: RouteFailure,
    },

    /// A messenger request failed (no route, or retries exhausted)
    MessageError {
        /// Correlation id of the failed request
        id: Uuid,
        /// Human-readable failure description
        reason: String,
    },

    /// A multiplexed stream failed outside its normal lifecycle
    StreamError {
        /// The stream
        id: Uuid,
        /// Human-readable failure description
        reason: String,
    },

    /// An affinity chain this instance participated in was closed
    AffinityRemoved {
        /// The affinity
        id: Uuid,
        /// True when closed by failure (route loss, expiry, rejection)
        /// rather than an orderly remove
        forced: bool,
    },

    /// The instance finished starting
    Started,

    /// The instance stopped
    Stopped,
}

/// Handle for unsubscribing from events.
///
/// Dropping the handle does not unsubscribe; call
/// [`EventHandlers::unsubscribe`] explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }
}

/// Type alias for event handler callbacks
pub type EventCallback = Arc<dyn Fn(Event) + Send + Sync + 'static>;

/// Manages event subscriptions and delivery
pub struct EventHandlers {
    handlers: Arc<RwLock<Vec<(SubscriptionHandle, EventCallback)>>>,
    next_id: Arc<RwLock<u64>>,
}

impl EventHandlers {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(Vec::new())),
            next_id: Arc::new(RwLock::new(0)),
        }
    }

    /// Register a handler; it is called for every future event until
    /// unsubscribed.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        let mut next_id = self.next_id.write();
        let id = *next_id;
        *next_id += 1;

        let handle = SubscriptionHandle::new(id);
        self.handlers.write().push((handle, Arc::new(callback)));
        handle
    }

    /// Remove the handler for `handle`; unknown handles are a no-op
    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.handlers.write().retain(|(h, _)| *h != handle);
    }

    /// Deliver `event` to every handler in subscription order.
    ///
    /// A panicking handler is caught and logged; the remaining handlers
    /// still run.
    pub fn dispatch(&self, event: Event) {
        let handlers = self.handlers.read();
        for (handle, callback) in handlers.iter() {
            let event_clone = event.clone();
            if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(event_clone);
            })) {
                tracing::error!(
                    "event handler {:?} panicked: {:?}",
                    handle,
                    e.downcast_ref::<&str>()
                        .copied()
                        .or_else(|| e.downcast_ref::<String>().map(|s| s.as_str()))
                        .unwrap_or("unknown panic")
                );
            }
        }
    }

    /// Number of registered handlers
    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }
}

impl Default for EventHandlers {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for EventHandlers {
    fn clone(&self) -> Self {
        Self {
            handlers: Arc::clone(&self.handlers),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[test]
    fn test_subscribe_and_dispatch() {
        let handlers = EventHandlers::new();
        let called = Arc::new(AtomicBool::new(false));
        let called_clone = Arc::clone(&called);

        let _handle = handlers.subscribe(move |_event| {
            called_clone.store(true, Ordering::SeqCst);
        });

        handlers.dispatch(Event::Started);
        assert!(called.load(Ordering::SeqCst));
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let handlers = EventHandlers::new();
        let called = Arc::new(AtomicBool::new(false));
        let called_clone = Arc::clone(&called);

        let handle = handlers.subscribe(move |_event| {
            called_clone.store(true, Ordering::SeqCst);
        });
        handlers.unsubscribe(handle);
        handlers.dispatch(Event::Started);

        assert!(!called.load(Ordering::SeqCst));
        assert_eq!(handlers.handler_count(), 0);
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let handlers = EventHandlers::new();
        let count = Arc::new(AtomicUsize::new(0));

        let _h1 = handlers.subscribe(|_event| {
            panic!("handler panic");
        });
        let count_clone = Arc::clone(&count);
        let _h2 = handlers.subscribe(move |_event| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        handlers.dispatch(Event::Stopped);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
