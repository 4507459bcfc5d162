//! Event Bus — fan-out dispatcher for request/response/error/SSE/tunnel
//! events, consumed by the Traffic Store and Live Subscription layer.

use crate::model::Event;
use std::sync::{Arc, RwLock};
use tracing::trace;

/// An observer registered on the Event Bus. Implementations must not
/// block — offload heavy work (disk writes, network calls) onto their
/// own task.
pub trait EventObserver: Send + Sync {
    fn on_event(&self, event: &Event);
}

/// Fan-out dispatcher holding an ordered list of observers. Each event is
/// delivered to every observer synchronously, in registration order.
#[derive(Clone, Default)]
pub struct EventBus {
    observers: Arc<RwLock<Vec<Arc<dyn EventObserver>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, observer: Arc<dyn EventObserver>) {
        self.observers.write().expect("event bus lock poisoned").push(observer);
    }

    /// Dispatch `event` to every registered observer, in registration
    /// order. Panicking observers are not caught — a misbehaving
    /// observer is a programming error, not a runtime condition to
    /// swallow silently.
    pub fn emit(&self, event: Event) {
        trace!(?event, "dispatching event");
        let observers = self.observers.read().expect("event bus lock poisoned");
        for observer in observers.iter() {
            observer.on_event(&event);
        }
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::RequestObserved { id, entry } => f
                .debug_struct("RequestObserved")
                .field("id", id)
                .field("method", &entry.method)
                .field("url", &entry.url)
                .finish(),
            Event::ResponseObserved {
                id,
                status_code,
                terminal,
                ..
            } => f
                .debug_struct("ResponseObserved")
                .field("id", id)
                .field("status_code", status_code)
                .field("terminal", terminal)
                .finish(),
            Event::SSELine { id, line } => f
                .debug_struct("SSELine")
                .field("id", id)
                .field("len", &line.len())
                .finish(),
            Event::Error {
                id,
                message,
                is_timeout,
            } => f
                .debug_struct("Error")
                .field("id", id)
                .field("message", message)
                .field("is_timeout", is_timeout)
                .finish(),
            Event::TunnelEstablished { host, intercepted } => f
                .debug_struct("TunnelEstablished")
                .field("host", host)
                .field("intercepted", intercepted)
                .finish(),
        }
    }
}
