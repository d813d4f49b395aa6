use std::sync::Mutex;

use serde_json::Value;

use wallet_bridge_core::{ListenerId, SocketAnyHandler, SocketHandler};

/// Events the transport raises itself; catch-all handlers never see them.
pub const RESERVED_EVENTS: &[&str] = &["connect", "connect_error", "disconnect"];

enum Entry {
    Named {
        event: String,
        handler: SocketHandler,
        once: bool,
    },
    Any(SocketAnyHandler),
}

#[derive(Default)]
struct Table {
    next_id: ListenerId,
    entries: Vec<(ListenerId, Entry)>,
}

/// Listener bookkeeping shared by socket channel implementations.
#[derive(Default)]
pub struct SocketListenerSet {
    table: Mutex<Table>,
}

impl std::fmt::Debug for SocketListenerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketListenerSet")
            .field("listeners", &self.len())
            .finish()
    }
}

impl SocketListenerSet {
    fn insert(&self, entry: Entry) -> ListenerId {
        let Ok(mut g) = self.table.lock() else {
            return 0;
        };
        g.next_id = g.next_id.saturating_add(1);
        let id = g.next_id;
        g.entries.push((id, entry));
        id
    }

    pub fn on(&self, event: &str, handler: SocketHandler) -> ListenerId {
        self.insert(Entry::Named {
            event: event.to_owned(),
            handler,
            once: false,
        })
    }

    pub fn once(&self, event: &str, handler: SocketHandler) -> ListenerId {
        self.insert(Entry::Named {
            event: event.to_owned(),
            handler,
            once: true,
        })
    }

    pub fn on_any(&self, handler: SocketAnyHandler) -> ListenerId {
        self.insert(Entry::Any(handler))
    }

    pub fn off(&self, id: ListenerId) -> bool {
        let Ok(mut g) = self.table.lock() else {
            return false;
        };
        let before = g.entries.len();
        g.entries.retain(|(entry_id, _)| *entry_id != id);
        g.entries.len() != before
    }

    pub fn clear(&self) {
        if let Ok(mut g) = self.table.lock() {
            g.entries.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.table.lock().map(|g| g.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invokes the handlers registered for `event` outside the lock, so they
    /// may register or remove listeners. Returns how many ran.
    pub fn dispatch(&self, event: &str, payload: &Value) -> usize {
        let reserved = RESERVED_EVENTS.contains(&event);
        let (named, any) = {
            let Ok(mut g) = self.table.lock() else {
                return 0;
            };
            let mut named = Vec::new();
            let mut any = Vec::new();
            for (_, entry) in &g.entries {
                match entry {
                    Entry::Named {
                        event: name,
                        handler,
                        ..
                    } if name == event => named.push(handler.clone()),
                    Entry::Any(handler) if !reserved => any.push(handler.clone()),
                    _ => {}
                }
            }
            g.entries.retain(|(_, entry)| {
                !matches!(entry, Entry::Named { event: name, once: true, .. } if name == event)
            });
            (named, any)
        };
        for handler in &named {
            handler(payload);
        }
        for handler in &any {
            handler(event, payload);
        }
        named.len() + any.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn once_handlers_are_dropped_after_dispatch() {
        let set = SocketListenerSet::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        set.once(
            "connect",
            Arc::new(move |_: &Value| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(set.dispatch("connect", &Value::Null), 1);
        assert_eq!(set.dispatch("connect", &Value::Null), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(set.is_empty());
    }

    #[test]
    fn catch_all_skips_reserved_events() {
        let set = SocketListenerSet::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = set.on_any(Arc::new(move |event: &str, _: &Value| {
            sink.lock().expect("lock").push(event.to_owned());
        }));
        set.dispatch("connect", &Value::Null);
        set.dispatch("eth_accounts", &Value::Null);
        assert_eq!(*seen.lock().expect("lock"), vec!["eth_accounts".to_owned()]);
        assert!(set.off(id));
        assert!(!set.off(id));
    }
}
