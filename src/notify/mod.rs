//! Cache-invalidation signal for the read path.
//!
//! After a successful apply, one [`CollectionChanged`] event fires per touched
//! collection. The engine does not know or care how the read path reacts.
//!
//! Snapshot-on-emit semantics:
//!   - A listener removed *during* emission is still called in that round.
//!   - A listener added *during* emission is NOT called until the next emit.
//!
//! All methods take `&self` (interior mutability via `parking_lot::Mutex`);
//! the lock is never held during callbacks, so listeners may call
//! `on()`/`off()` from inside a callback without deadlocking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// "Collection X of parent Y changed" — emitted once per touched collection
/// after a successful apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionChanged {
    pub parent_id: String,
    pub collection: String,
}

/// A listener ID returned by [`ChangeEmitter::on`] that can be passed to
/// [`ChangeEmitter::off`] to remove the listener.
pub type ListenerId = u64;

/// Closure type for change listeners.
pub type ChangeListenerFn = dyn Fn(&CollectionChanged) + Send + Sync;

/// Synchronous pub/sub for [`CollectionChanged`] events.
pub struct ChangeEmitter {
    listeners: Mutex<Vec<(ListenerId, Arc<ChangeListenerFn>)>>,
    next_id: AtomicU64,
}

impl ChangeEmitter {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `callback` and return its [`ListenerId`].
    pub fn on(&self, callback: impl Fn(&CollectionChanged) + Send + Sync + 'static) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, Arc::new(callback)));
        id
    }

    /// Remove the listener identified by `id`.
    ///
    /// Does nothing if `id` is not present (safe to call multiple times).
    pub fn off(&self, id: ListenerId) {
        self.listeners.lock().retain(|(lid, _)| *lid != id);
    }

    /// Emit `event` to all currently registered listeners.
    ///
    /// A snapshot of the listener list is taken before iteration so that
    /// additions or removals during a callback do not affect the current
    /// round. The lock is released before calling any callbacks.
    pub fn emit(&self, event: &CollectionChanged) {
        let snapshot: Vec<Arc<ChangeListenerFn>> = {
            let guard = self.listeners.lock();
            guard.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        for cb in snapshot {
            cb(event);
        }
    }

    /// Number of currently registered listeners.
    pub fn size(&self) -> usize {
        self.listeners.lock().len()
    }
}

impl Default for ChangeEmitter {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
