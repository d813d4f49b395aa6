use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use crate::domain::ProviderEventKind;
use crate::ports::ListenerId;

pub type BroadcastCallback = Arc<dyn Fn(&Value) + Send + Sync>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Subscription {
    callback: BroadcastCallback,
    once: bool,
}

/// Named in-process events; callbacks fire in insertion order.
#[derive(Default)]
pub struct ListenerRegistry {
    inner: Mutex<HashMap<ProviderEventKind, Vec<Subscription>>>,
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let g = lock(&self.inner);
        let counts: HashMap<&str, usize> = g.iter().map(|(k, v)| (k.as_str(), v.len())).collect();
        f.debug_struct("ListenerRegistry")
            .field("listeners", &counts)
            .finish()
    }
}

impl ListenerRegistry {
    pub fn on(&self, kind: ProviderEventKind, callback: BroadcastCallback) {
        self.subscribe(kind, callback, false);
    }

    pub fn once(&self, kind: ProviderEventKind, callback: BroadcastCallback) {
        self.subscribe(kind, callback, true);
    }

    fn subscribe(&self, kind: ProviderEventKind, callback: BroadcastCallback, once: bool) {
        lock(&self.inner)
            .entry(kind)
            .or_default()
            .push(Subscription { callback, once });
    }

    /// Returns how many callbacks fired.
    pub fn emit(&self, kind: ProviderEventKind, payload: &Value) -> usize {
        // Callbacks run outside the lock; they may subscribe or emit again.
        let callbacks: Vec<BroadcastCallback> = {
            let mut g = lock(&self.inner);
            let Some(subs) = g.get_mut(&kind) else {
                return 0;
            };
            let callbacks = subs.iter().map(|s| Arc::clone(&s.callback)).collect();
            subs.retain(|s| !s.once);
            callbacks
        };
        for callback in &callbacks {
            callback(payload);
        }
        callbacks.len()
    }

    pub fn remove_all(&self, kind: Option<ProviderEventKind>) {
        let mut g = lock(&self.inner);
        match kind {
            Some(kind) => {
                g.remove(&kind);
            }
            None => g.clear(),
        }
    }

    pub fn listener_count(&self, kind: ProviderEventKind) -> usize {
        lock(&self.inner).get(&kind).map_or(0, Vec::len)
    }
}

/// Listener ids this instance attached to a shared source, per wire event.
///
/// Detaching walks this table only, so listeners owned by other code on the
/// same source are never touched.
#[derive(Debug, Default)]
pub struct ScopedListeners {
    inner: Mutex<Vec<(String, ListenerId)>>,
}

impl ScopedListeners {
    pub fn track(&self, event: &str, id: ListenerId) {
        lock(&self.inner).push((event.to_owned(), id));
    }

    /// False when the id was already released.
    pub fn untrack(&self, id: ListenerId) -> bool {
        let mut g = lock(&self.inner);
        match g.iter().position(|(_, tracked)| *tracked == id) {
            Some(index) => {
                g.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn drain(&self) -> Vec<(String, ListenerId)> {
        std::mem::take(&mut *lock(&self.inner))
    }

    pub fn count(&self) -> usize {
        lock(&self.inner).len()
    }
}
