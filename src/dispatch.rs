//! Typed message dispatch fan-out.
//!
//! Maps each [`EventType`] to an ordered list of handlers. Dispatch
//! snapshots the list before iterating, so handlers may register or remove
//! handlers (including themselves) mid-dispatch without corrupting the
//! iteration. Each handler runs inside an isolated failure boundary: a
//! panicking handler is caught and logged and does not block the handlers
//! after it, nor future events.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::envelope::{Envelope, EventType};

/// Handle returned by [`EventDispatcher::on`], used to remove the
/// registration later. Closures are not comparable, so removal is by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Callback invoked with each dispatched envelope.
pub type EventHandler = Arc<dyn Fn(&Envelope) + Send + Sync>;

struct RegisteredHandler {
    id: HandlerId,
    callback: EventHandler,
}

/// Per-message-type handler lists with isolated fan-out dispatch.
pub struct EventDispatcher {
    handlers: RwLock<HashMap<EventType, Vec<RegisteredHandler>>>,
    next_id: AtomicU64,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDispatcher {
    /// Create a dispatcher with the default internal handlers for the
    /// reserved types installed (PONG and AUTH_ERROR logging). Caller
    /// registrations for the same types run in addition to these.
    pub fn new() -> Self {
        let dispatcher = Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        };
        dispatcher.on(EventType::Pong, |_env| {
            log::debug!("Heartbeat pong received");
        });
        dispatcher.on(EventType::AuthError, |env| {
            log::warn!("Auth error from server: {}", env.payload);
        });
        dispatcher
    }

    /// Append a handler to the list for `event_type`.
    pub fn on(
        &self,
        event_type: EventType,
        handler: impl Fn(&Envelope) + Send + Sync + 'static,
    ) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut handlers = self.handlers.write().unwrap();
        handlers.entry(event_type).or_default().push(RegisteredHandler {
            id,
            callback: Arc::new(handler),
        });
        id
    }

    /// Remove a previously registered handler. Returns `true` if it was
    /// still registered.
    pub fn off(&self, event_type: &EventType, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write().unwrap();
        if let Some(list) = handlers.get_mut(event_type) {
            if let Some(idx) = list.iter().position(|h| h.id == id) {
                list.remove(idx);
                if list.is_empty() {
                    handlers.remove(event_type);
                }
                return true;
            }
        }
        false
    }

    /// Fan an envelope out to every handler registered for its type.
    ///
    /// With no handlers registered the event is logged and dropped; this is
    /// not an error. Handler panics are contained and logged.
    pub fn dispatch(&self, envelope: &Envelope) {
        // Snapshot under the lock, invoke outside it.
        let snapshot: Vec<EventHandler> = {
            let handlers = self.handlers.read().unwrap();
            match handlers.get(&envelope.event_type) {
                Some(list) => list.iter().map(|h| h.callback.clone()).collect(),
                None => Vec::new(),
            }
        };

        if snapshot.is_empty() {
            log::debug!(
                "No handlers registered for '{}', dropping event",
                envelope.event_type
            );
            return;
        }

        for callback in snapshot {
            if catch_unwind(AssertUnwindSafe(|| callback(envelope))).is_err() {
                log::error!(
                    "Handler for '{}' panicked; continuing with remaining handlers",
                    envelope.event_type
                );
            }
        }
    }

    /// Number of handlers currently registered for a type.
    #[cfg(test)]
    fn handler_count(&self, event_type: &EventType) -> usize {
        self.handlers
            .read()
            .unwrap()
            .get(event_type)
            .map_or(0, |list| list.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn event(tag: &str) -> Envelope {
        Envelope::new(EventType::from(tag), json!({"n": 1}))
    }

    #[test]
    fn test_dispatch_with_no_handlers_is_silent() {
        let dispatcher = EventDispatcher::new();
        dispatcher.dispatch(&event("JOB_PROGRESS"));
        // A later event with a handler still goes through
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        dispatcher.on(EventType::from("JOB_PROGRESS"), move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });
        dispatcher.dispatch(&event("JOB_PROGRESS"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let dispatcher = EventDispatcher::new();
        let order = Arc::new(RwLock::new(Vec::new()));
        for label in ["first", "second", "third"] {
            let order = order.clone();
            dispatcher.on(EventType::from("MEMBER_JOINED"), move |_| {
                order.write().unwrap().push(label);
            });
        }
        dispatcher.dispatch(&event("MEMBER_JOINED"));
        assert_eq!(*order.read().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_panicking_handler_does_not_block_others() {
        let dispatcher = EventDispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));

        dispatcher.on(EventType::from("JOB_FAILED"), |_| {
            panic!("handler bug");
        });
        let hits_clone = hits.clone();
        dispatcher.on(EventType::from("JOB_FAILED"), move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.dispatch(&event("JOB_FAILED"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Future events keep flowing through the same lists
        dispatcher.dispatch(&event("JOB_FAILED"));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_off_removes_only_the_given_registration() {
        let dispatcher = EventDispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_a = hits.clone();
        let a = dispatcher.on(EventType::from("DECK_UPDATED"), move |_| {
            hits_a.fetch_add(1, Ordering::SeqCst);
        });
        let hits_b = hits.clone();
        let _b = dispatcher.on(EventType::from("DECK_UPDATED"), move |_| {
            hits_b.fetch_add(10, Ordering::SeqCst);
        });

        assert!(dispatcher.off(&EventType::from("DECK_UPDATED"), a));
        assert!(!dispatcher.off(&EventType::from("DECK_UPDATED"), a));
        dispatcher.dispatch(&event("DECK_UPDATED"));
        assert_eq!(hits.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_handler_may_mutate_registrations_during_dispatch() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let dispatcher_clone = dispatcher.clone();
        let hits_clone = hits.clone();
        let id = dispatcher.on(EventType::from("MEMBER_LEFT"), move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
            // Register another handler for the same type from inside dispatch
            let inner_hits = hits_clone.clone();
            dispatcher_clone.on(EventType::from("MEMBER_LEFT"), move |_| {
                inner_hits.fetch_add(100, Ordering::SeqCst);
            });
        });

        // First dispatch sees only the original handler
        dispatcher.dispatch(&event("MEMBER_LEFT"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Detach the self-registering handler; the one it added remains
        assert!(dispatcher.off(&EventType::from("MEMBER_LEFT"), id));
        dispatcher.dispatch(&event("MEMBER_LEFT"));
        assert_eq!(hits.load(Ordering::SeqCst), 101);
    }

    #[test]
    fn test_reserved_types_have_default_handlers() {
        let dispatcher = EventDispatcher::new();
        assert_eq!(dispatcher.handler_count(&EventType::Pong), 1);
        assert_eq!(dispatcher.handler_count(&EventType::AuthError), 1);
        // Caller registrations stack on top of the defaults
        dispatcher.on(EventType::AuthError, |_| {});
        assert_eq!(dispatcher.handler_count(&EventType::AuthError), 2);
    }
}
