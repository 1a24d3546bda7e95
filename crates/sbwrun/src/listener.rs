//! # Event Listeners
//!
//! Local observers of module lifecycle events. Each broker and each module owns its own
//! `ListenerRegistry`; there is no process-wide registry.
//!
//! ## Invariants
//! - Dispatch iterates a snapshot, so listeners may add or remove listeners from inside
//!   a callback.
//! - A failing or panicking listener is logged and skipped; later listeners still run.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use sbwrpc::Event;

/// Receives lifecycle events.
pub trait Listener: Send + Sync + 'static {
    fn on_event(&self, event: &Event) -> anyhow::Result<()>;
}

impl<F> Listener for F
where
    F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn on_event(&self, event: &Event) -> anyhow::Result<()> {
        self(event)
    }
}

/// Strong type for listener registrations.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct ListenerId(pub u64);

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

#[derive(Default)]
pub struct ListenerRegistry {
    entries: Mutex<Vec<(ListenerId, Arc<dyn Listener>)>>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: impl Listener) -> ListenerId {
        self.add_arc(Arc::new(listener))
    }

    pub fn add_arc(&self, listener: Arc<dyn Listener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).push((id, listener));
        id
    }

    /// Returns false if no listener had this id.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers `event` to every listener and returns how many of them failed.
    pub fn dispatch(&self, event: &Event) -> usize {
        let snapshot: Vec<(ListenerId, Arc<dyn Listener>)> =
            self.entries.lock().unwrap_or_else(PoisonError::into_inner).clone();

        let mut failures = 0;
        for (id, listener) in snapshot {
            match std::panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    tracing::warn!(%id, %event, error = %e, "listener failed");
                }
                Err(_) => {
                    failures += 1;
                    tracing::warn!(%id, %event, "listener panicked");
                }
            }
        }
        failures
    }
}
