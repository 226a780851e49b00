//! Event fan-out for queue lifecycle events.

use conductor_core::{EventKind, QueueEvent};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::{trace, warn};

type Listener = Arc<dyn Fn(&QueueEvent) + Send + Sync>;

/// Delivers events to broadcast subscribers and registered listeners.
pub(crate) struct EventBus {
    sender: broadcast::Sender<QueueEvent>,
    listeners: Mutex<Vec<(Option<EventKind>, Listener)>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }

    /// Register a listener for one kind of event.
    pub fn on<F>(&self, kind: EventKind, listener: F)
    where
        F: Fn(&QueueEvent) + Send + Sync + 'static,
    {
        self.register(Some(kind), Arc::new(listener));
    }

    /// Register a listener for every event.
    pub fn on_any<F>(&self, listener: F)
    where
        F: Fn(&QueueEvent) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(listener));
    }

    /// Deliver an event. Must not be called with queue state locked.
    pub fn emit(&self, event: QueueEvent) {
        let kind = event.kind();
        trace!("emitting {:?}", kind);

        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(filter, _)| filter.map_or(true, |k| k == kind))
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener(&event))) {
                warn!("event listener panicked on {:?}: {}", kind, panic_message(payload.as_ref()));
            }
        }

        // no subscribers is fine
        let _ = self.sender.send(event);
    }

    fn register(&self, kind: Option<EventKind>, listener: Listener) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((kind, listener));
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
