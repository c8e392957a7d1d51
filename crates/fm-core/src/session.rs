//! Per-session dashboard preferences.
//!
//! The only preference is the numeric display mode used on opcode, failure
//! and signal-error pages. A request may carry `numeric_display=dec|bin|hex`;
//! a valid value is stored for the session and used from then on. Anything
//! else falls back to the stored value, then to `dec`.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use fm_common::{DisplayMode, SessionId};

/// Session key under which the display mode is stored.
pub const NUMERIC_DISPLAY_KEY: &str = "numeric_display";

/// Sessions kept by [`MemorySessionStore`] before the oldest is evicted.
pub const DEFAULT_SESSION_CAPACITY: usize = 10_000;

/// Key/value storage scoped to a browser session.
pub trait SessionStore: Send + Sync {
    fn get(&self, session: &SessionId, key: &str) -> Option<String>;
    fn set(&self, session: &SessionId, key: &str, value: String);
}

#[derive(Default)]
struct Sessions {
    values: HashMap<SessionId, HashMap<String, String>>,
    order: VecDeque<SessionId>,
}

/// In-process session store with FIFO eviction.
pub struct MemorySessionStore {
    capacity: usize,
    inner: Mutex<Sessions>,
}

impl MemorySessionStore {
    pub fn new(capacity: usize) -> Self {
        MemorySessionStore {
            capacity: capacity.max(1),
            inner: Mutex::new(Sessions::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // A panic while holding the lock cannot leave the maps inconsistent, so
    // a poisoned lock is still usable.
    fn lock(&self) -> std::sync::MutexGuard<'_, Sessions> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        MemorySessionStore::new(DEFAULT_SESSION_CAPACITY)
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, session: &SessionId, key: &str) -> Option<String> {
        self.lock()
            .values
            .get(session)
            .and_then(|values| values.get(key).cloned())
    }

    fn set(&self, session: &SessionId, key: &str, value: String) {
        let mut sessions = self.lock();
        if !sessions.values.contains_key(session) {
            while sessions.values.len() >= self.capacity {
                match sessions.order.pop_front() {
                    Some(oldest) => {
                        sessions.values.remove(&oldest);
                    }
                    None => break,
                }
            }
            sessions.order.push_back(session.clone());
        }
        sessions
            .values
            .entry(session.clone())
            .or_default()
            .insert(key.to_string(), value);
    }
}

/// Pick the display mode for a request and remember it for the session.
pub fn resolve_display_mode(
    store: &dyn SessionStore,
    session: &SessionId,
    requested: Option<&str>,
) -> DisplayMode {
    let mode = requested
        .and_then(|raw| raw.parse::<DisplayMode>().ok())
        .or_else(|| {
            store
                .get(session, NUMERIC_DISPLAY_KEY)
                .and_then(|raw| raw.parse().ok())
        })
        .unwrap_or_default();

    store.set(session, NUMERIC_DISPLAY_KEY, mode.as_str().to_string());
    mode
}
