use dashmap::DashMap;
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

pub type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

/// Named-event observer registry.
///
/// Dispatch is synchronous. A panicking handler is logged and the remaining
/// handlers still run.
#[derive(Default)]
pub struct EventEmitter {
    listeners: DashMap<String, Vec<Listener>>,
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("events", &self.listeners.len())
            .finish()
    }
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, event: &str, listener: Listener) {
        self.listeners
            .entry(event.to_string())
            .or_default()
            .push(listener);
    }

    /// Remove one registration of `listener`, matched by identity.
    pub fn remove_listener(&self, event: &str, listener: &Listener) -> bool {
        let Some(mut entry) = self.listeners.get_mut(event) else {
            return false;
        };
        match entry.iter().position(|l| Arc::ptr_eq(l, listener)) {
            Some(pos) => {
                entry.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.get(event).map(|l| l.len()).unwrap_or(0)
    }

    /// Returns how many handlers ran to completion.
    pub fn emit(&self, event: &str, payload: &Value) -> usize {
        // Snapshot so handlers may register or remove listeners
        let handlers: Vec<Listener> = match self.listeners.get(event) {
            Some(list) => list.clone(),
            None => return 0,
        };

        handlers
            .iter()
            .filter(|handler| {
                let outcome = catch_unwind(AssertUnwindSafe(|| handler(payload)));
                if outcome.is_err() {
                    error!(%event, "Event handler panicked");
                }
                outcome.is_ok()
            })
            .count()
    }
}
