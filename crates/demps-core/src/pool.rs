//! Registry of singleton, closeable resources keyed by role.
//!
//! Every long-lived resource a run creates (the root watcher, each
//! dataset watcher, the simulator process) is registered here under a
//! fixed role key. Registering under an occupied key closes the previous
//! occupant first, so a page reload or reconnect never leaves a stale
//! watcher or a second simulator writing into the same directories.
//!
//! The pool is an owned service: the server creates one and shares it by
//! [`Arc`] with every run. All operations take a single mutex and are
//! synchronous.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

/// Pool key of the watcher on the simulator's output directory.
pub const ROOT_WATCHER_KEY: &str = "root_watcher";

/// Pool key of the simulator process.
pub const PROCESS_KEY: &str = "demps";

/// A resource that can be shut down without awaiting.
///
/// `close` must be idempotent and must never touch the pool it is stored
/// in (it runs while the pool lock is held).
pub trait Closeable: Send + Sync + 'static {
    /// Release the resource. Errors are logged by the implementation.
    fn close(&self);
}

/// A stored resource, kept both as a trait object (for closing) and as
/// [`Any`] (for typed retrieval).
struct Entry {
    resource: Arc<dyn Closeable>,
    any: Arc<dyn Any + Send + Sync>,
}

/// Mutex-guarded map from role key to resource.
#[derive(Default)]
pub struct ResourcePool {
    entries: Mutex<BTreeMap<String, Entry>>,
}

impl ResourcePool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Entry>> {
        // A panic while holding the lock leaves the map itself intact.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `resource` under `key`, closing any previous occupant first.
    ///
    /// The previous occupant's `close` has returned before the new
    /// resource becomes visible to other callers.
    pub fn add<T: Closeable>(&self, key: &str, resource: Arc<T>) {
        let mut entries = self.lock();
        if let Some(previous) = entries.remove(key) {
            debug!(key, "Closing superseded pool resource");
            previous.resource.close();
        }
        let any: Arc<dyn Any + Send + Sync> = Arc::clone(&resource) as Arc<dyn Any + Send + Sync>;
        entries.insert(
            key.to_owned(),
            Entry {
                resource: resource as Arc<dyn Closeable>,
                any,
            },
        );
    }

    /// Whether a resource is registered under `key`.
    pub fn has(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    /// Remove and return the resource under `key` without closing it.
    ///
    /// Returns `None` when the key is empty, or when the stored resource
    /// is not a `T` (in which case it stays registered). The caller owns
    /// the returned resource and is responsible for closing it.
    pub fn pop<T: Closeable>(&self, key: &str) -> Option<Arc<T>> {
        let mut entries = self.lock();
        let matches = entries.get(key).is_some_and(|entry| entry.any.is::<T>());
        if !matches {
            return None;
        }
        entries
            .remove(key)
            .and_then(|entry| entry.any.downcast::<T>().ok())
    }

    /// Return a shared handle to the resource under `key`, leaving it
    /// registered.
    pub fn get<T: Closeable>(&self, key: &str) -> Option<Arc<T>> {
        self.lock()
            .get(key)
            .and_then(|entry| Arc::clone(&entry.any).downcast::<T>().ok())
    }

    /// Remove the entry under `key` only if it is still `resource`.
    ///
    /// Used by resources deregistering themselves, so that a successor
    /// registered in the meantime is left alone. Does not close anything.
    pub fn remove_if_same<T: Closeable>(&self, key: &str, resource: &Arc<T>) -> bool {
        let mut entries = self.lock();
        let same = entries.get(key).is_some_and(|entry| {
            Arc::clone(&entry.any)
                .downcast::<T>()
                .is_ok_and(|stored| Arc::ptr_eq(&stored, resource))
        });
        if same {
            entries.remove(key);
        }
        same
    }

    /// Close and remove every registered resource.
    pub fn close_all(&self) {
        let drained = std::mem::take(&mut *self.lock());
        for (key, entry) in drained {
            debug!(key, "Closing pool resource");
            entry.resource.close();
        }
    }

    /// Registered keys in sorted order.
    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Number of registered resources.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl Drop for ResourcePool {
    fn drop(&mut self) {
        let entries = std::mem::take(
            self.entries
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for entry in entries.into_values() {
            entry.resource.close();
        }
    }
}

impl core::fmt::Debug for ResourcePool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ResourcePool")
            .field("keys", &self.keys())
            .finish()
    }
}
