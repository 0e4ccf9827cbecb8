//! Observer registry with snapshot fan-out.
//!
//! `emit` copies the callback list before invoking anything, so a callback
//! may unsubscribe itself (or anyone else) mid fan-out without the
//! iteration skipping or crashing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    entries: Vec<(u64, Callback<T>)>,
}

trait Unsubscribe: Send + Sync {
    fn remove(&self, id: u64);
}

impl<T: 'static> Unsubscribe for Mutex<Registry<T>> {
    fn remove(&self, id: u64) {
        lock(self).entries.retain(|(entry_id, _)| *entry_id != id);
    }
}

pub struct Listeners<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T: 'static> Listeners<T> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut registry = lock(&self.registry);
            let id = registry.next_id;
            registry.next_id += 1;
            registry.entries.push((id, Arc::new(callback)));
            id
        };

        let registry: Arc<dyn Unsubscribe> = self.registry.clone();
        Subscription {
            id,
            registry: Arc::downgrade(&registry),
            active: AtomicBool::new(true),
        }
    }

    /// Invoke every callback registered at the time of the call.
    pub fn emit(&self, value: &T) {
        let snapshot: Vec<Callback<T>> = lock(&self.registry)
            .entries
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        for callback in snapshot {
            callback(value);
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.registry).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: 'static> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by `subscribe`. Dropping it does NOT unsubscribe.
pub struct Subscription {
    id: u64,
    registry: Weak<dyn Unsubscribe>,
    active: AtomicBool,
}

impl Subscription {
    /// Remove the callback. Safe to call any number of times.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Lock a mutex, recovering the data if a callback panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
