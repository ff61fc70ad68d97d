//! In-flight request table shared by the downstream transports
//!
//! Responses can arrive out of order, so every outgoing request registers a
//! oneshot keyed by its JSON-RPC id and a reader task routes replies back.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::{debug, warn};

type Waiters = HashMap<u64, oneshot::Sender<Value>>;

#[derive(Clone, Default)]
pub struct PendingRequests {
    next_id: Arc<AtomicU64>,
    waiters: Arc<Mutex<Waiters>>,
}

/// Removes its entry when the waiting future is dropped (timeout or cancel)
pub struct PendingGuard {
    id: u64,
    waiters: Arc<Mutex<Waiters>>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        lock(&self.waiters).remove(&self.id);
    }
}

fn lock(waiters: &Mutex<Waiters>) -> MutexGuard<'_, Waiters> {
    waiters.lock().unwrap_or_else(|poisoned| {
        warn!("Pending request mutex was poisoned, recovering");
        poisoned.into_inner()
    })
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id and a receiver for its response
    pub fn register(&self) -> (u64, oneshot::Receiver<Value>, PendingGuard) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        lock(&self.waiters).insert(id, tx);
        let guard = PendingGuard {
            id,
            waiters: Arc::clone(&self.waiters),
        };
        (id, rx, guard)
    }

    /// Route a message from the server. Returns false when nobody was waiting.
    pub fn resolve(&self, msg: Value) -> bool {
        let Some(id) = msg.get("id").and_then(|i| i.as_u64()) else {
            debug!("MCP notification: {}", truncate(&msg.to_string(), 200));
            return false;
        };

        match lock(&self.waiters).remove(&id) {
            Some(tx) => {
                let _ = tx.send(msg);
                true
            }
            None => {
                debug!("MCP response for unknown id={}, ignoring", id);
                false
            }
        }
    }

    /// Drop every waiter so their receivers error out (connection lost)
    pub fn fail_all(&self) {
        let dropped = {
            let mut waiters = lock(&self.waiters);
            let n = waiters.len();
            waiters.clear();
            n
        };
        if dropped > 0 {
            debug!("Failed {} pending MCP requests", dropped);
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.waiters).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub(crate) fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
