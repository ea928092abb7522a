//! Host-side ownership of native resources keyed by bridge handle.
//!
//! The table, not the engine's collector, decides when a resource is torn
//! down. Transports look their resource up by handle on every action.

use crate::error::{Error, Result};
use crate::runtime::registry::OpHandle;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Mutex-guarded map from handle to resource, cheap to clone.
pub struct ResourceTable<R> {
    inner: Arc<Mutex<HashMap<OpHandle, R>>>,
}

impl<R> Clone for ResourceTable<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R> Default for ResourceTable<R> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<R> ResourceTable<R> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<OpHandle, R>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store a resource, replacing (and returning) any previous one.
    pub fn insert(&self, handle: OpHandle, resource: R) -> Option<R> {
        self.lock().insert(handle, resource)
    }

    /// Act on a resource the caller expects to exist.
    pub fn with<T>(&self, handle: OpHandle, f: impl FnOnce(&mut R) -> T) -> Result<T> {
        let mut table = self.lock();
        let resource = table.get_mut(&handle).ok_or(Error::HandleNotFound(handle))?;
        Ok(f(resource))
    }

    /// Remove a resource, handing ownership back to the caller.
    pub fn take(&self, handle: OpHandle) -> Option<R> {
        self.lock().remove(&handle)
    }

    /// Remove every resource.
    pub fn drain(&self) -> Vec<(OpHandle, R)> {
        self.lock().drain().collect()
    }

    pub fn contains(&self, handle: OpHandle) -> bool {
        self.lock().contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
