//! Per-runtime bookkeeping of outstanding asynchronous operations.
//!
//! Every timer, HTTP request, WebSocket connection and in-flight async host
//! call owns exactly one [`OpHandle`] entry here. Entries are removed exactly
//! once; a second [`OperationRegistry::unregister`] is a silent no-op so racing
//! completion and error paths never trip over each other.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Opaque identifier for an outstanding operation.
///
/// The raw value is what script sees as a timer id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpHandle(u64);

impl OpHandle {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OpHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// Kind of operation a handle stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Timer,
    Interval,
    Http,
    WebSocket,
    /// Future returned by an async host function.
    HostAsync,
}

impl OpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Timer => "timer",
            OpKind::Interval => "interval",
            OpKind::Http => "http",
            OpKind::WebSocket => "websocket",
            OpKind::HostAsync => "host_async",
        }
    }
}

/// Best-effort cancellation signal run when a handle is cancelled.
pub type CancelHook = Box<dyn FnOnce() + Send>;

struct OpEntry {
    kind: OpKind,
    cancel: Option<CancelHook>,
}

/// Statistics about registered operations.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of operations currently registered
    pub pending_count: usize,
    /// Total operations registered
    pub total_registered: u64,
    /// Total operations removed (completion, error or cancellation)
    pub total_completed: u64,
}

#[derive(Default)]
struct RegistryInner {
    entries: HashMap<OpHandle, OpEntry>,
    next_id: u64,
    total_registered: u64,
    total_completed: u64,
}

/// Thread-safe registry shared by the runtime handle, the execution thread and
/// the transports feeding it.
#[derive(Clone, Default)]
pub struct OperationRegistry {
    shared: Arc<(Mutex<RegistryInner>, Condvar)>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.shared
            .0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a new operation and mint its handle.
    pub fn register(&self, kind: OpKind) -> OpHandle {
        self.insert(kind, None)
    }

    /// Register a new operation with a cancellation hook.
    pub fn register_cancellable(&self, kind: OpKind, cancel: CancelHook) -> OpHandle {
        self.insert(kind, Some(cancel))
    }

    fn insert(&self, kind: OpKind, cancel: Option<CancelHook>) -> OpHandle {
        let mut inner = self.lock();
        inner.next_id += 1;
        let handle = OpHandle(inner.next_id);
        inner.entries.insert(handle, OpEntry { kind, cancel });
        inner.total_registered += 1;
        tracing::trace!(target: "jsbridge::registry", %handle, kind = kind.as_str(), "registered");
        handle
    }

    /// Attach or replace the cancellation hook of a live handle.
    ///
    /// If the handle is already gone the hook runs immediately, so a transport
    /// that finished starting after a cancellation still gets torn down.
    pub fn set_cancel_hook(&self, handle: OpHandle, cancel: CancelHook) {
        let mut inner = self.lock();
        match inner.entries.get_mut(&handle) {
            Some(entry) => entry.cancel = Some(cancel),
            None => {
                drop(inner);
                cancel();
            }
        }
    }

    /// Remove a handle. Returns `false` if it was already removed.
    pub fn unregister(&self, handle: OpHandle) -> bool {
        self.remove(handle).is_some()
    }

    fn remove(&self, handle: OpHandle) -> Option<OpEntry> {
        let mut inner = self.lock();
        let entry = inner.entries.remove(&handle)?;
        inner.total_completed += 1;
        let now_empty = inner.entries.is_empty();
        drop(inner);
        tracing::trace!(target: "jsbridge::registry", %handle, kind = entry.kind.as_str(), "unregistered");
        if now_empty {
            self.shared.1.notify_all();
        }
        Some(entry)
    }

    /// Cancel a handle: run its hook (outside the lock) and remove it.
    ///
    /// Returns `false` if the handle was not registered.
    pub fn cancel(&self, handle: OpHandle) -> bool {
        match self.remove(handle) {
            Some(entry) => {
                if let Some(cancel) = entry.cancel {
                    cancel();
                }
                true
            }
            None => false,
        }
    }

    /// Cancel every registered operation. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<(OpHandle, OpEntry)> = {
            let mut inner = self.lock();
            let drained: Vec<_> = inner.entries.drain().collect();
            inner.total_completed += drained.len() as u64;
            drained
        };
        let count = drained.len();
        for (handle, entry) in drained {
            tracing::debug!(target: "jsbridge::registry", %handle, kind = entry.kind.as_str(), "cancelled on close");
            if let Some(cancel) = entry.cancel {
                cancel();
            }
        }
        self.shared.1.notify_all();
        count
    }

    pub fn contains(&self, handle: OpHandle) -> bool {
        self.lock().entries.contains_key(&handle)
    }

    /// Look up a handle a caller explicitly wants to act on.
    pub fn require(&self, handle: OpHandle) -> Result<OpKind> {
        self.lock()
            .entries
            .get(&handle)
            .map(|entry| entry.kind)
            .ok_or(Error::HandleNotFound(handle))
    }

    pub fn count(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn count_kind(&self, kind: OpKind) -> usize {
        self.lock()
            .entries
            .values()
            .filter(|entry| entry.kind == kind)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Registered handles with their kinds, sorted by handle.
    pub fn snapshot(&self) -> Vec<(OpHandle, OpKind)> {
        let mut items: Vec<_> = self
            .lock()
            .entries
            .iter()
            .map(|(handle, entry)| (*handle, entry.kind))
            .collect();
        items.sort_by_key(|(handle, _)| *handle);
        items
    }

    pub fn stats(&self) -> RegistryStats {
        let inner = self.lock();
        RegistryStats {
            pending_count: inner.entries.len(),
            total_registered: inner.total_registered,
            total_completed: inner.total_completed,
        }
    }

    /// Block until no operations remain or the timeout elapses.
    ///
    /// Returns `true` if the registry is empty.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        while !inner.entries.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            inner = match self.shared.1.wait_timeout(inner, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

impl fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_register_mints_unique_handles() {
        let registry = OperationRegistry::new();
        let a = registry.register(OpKind::Timer);
        let b = registry.register(OpKind::Http);
        assert_ne!(a, b);
        assert_eq!(registry.count(), 2);
        assert_eq!(registry.count_kind(OpKind::Http), 1);
        assert!(!registry.is_empty());
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = OperationRegistry::new();
        let keep = registry.register(OpKind::Timer);
        let handle = registry.register(OpKind::WebSocket);
        assert_eq!(registry.count(), 2);

        assert!(registry.unregister(handle));
        assert!(!registry.unregister(handle));
        assert_eq!(registry.count(), 1);
        assert!(registry.contains(keep));
        assert_eq!(registry.stats().total_completed, 1);
    }

    #[test]
    fn test_require_missing_handle() {
        let registry = OperationRegistry::new();
        let handle = registry.register(OpKind::WebSocket);
        assert_eq!(registry.require(handle).unwrap(), OpKind::WebSocket);
        registry.unregister(handle);
        assert!(matches!(
            registry.require(handle),
            Err(Error::HandleNotFound(h)) if h == handle
        ));
    }

    #[test]
    fn test_cancel_runs_hook_once() {
        let registry = OperationRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let handle = registry.register_cancellable(
            OpKind::Http,
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(registry.cancel(handle));
        assert!(!registry.cancel(handle));
        assert!(!registry.unregister(handle));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_set_cancel_hook_on_removed_handle_runs_immediately() {
        let registry = OperationRegistry::new();
        let handle = registry.register(OpKind::Http);
        registry.unregister(handle);

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        registry.set_cancel_hook(
            handle,
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_all() {
        let registry = OperationRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let counter = hits.clone();
            registry.register_cancellable(
                OpKind::Interval,
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        registry.register(OpKind::Timer);

        assert_eq!(registry.cancel_all(), 4);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_unregister_counts_once() {
        let registry = OperationRegistry::new();
        let handle = registry.register(OpKind::Http);

        let removed = Arc::new(AtomicUsize::new(0));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let removed = removed.clone();
                thread::spawn(move || {
                    if registry.unregister(handle) {
                        removed.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(removed.load(Ordering::SeqCst), 1);
        assert_eq!(registry.stats().total_completed, 1);
    }

    #[test]
    fn test_wait_idle() {
        let registry = OperationRegistry::new();
        assert!(registry.wait_idle(Duration::from_millis(1)));

        let handle = registry.register(OpKind::Timer);
        assert!(!registry.wait_idle(Duration::from_millis(20)));

        let remote = registry.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.unregister(handle);
        });
        assert!(registry.wait_idle(Duration::from_secs(5)));
        t.join().unwrap();
    }

    #[test]
    fn test_snapshot_sorted() {
        let registry = OperationRegistry::new();
        let a = registry.register(OpKind::Timer);
        let b = registry.register(OpKind::Http);
        assert_eq!(
            registry.snapshot(),
            vec![(a, OpKind::Timer), (b, OpKind::Http)]
        );
        assert_eq!(a.to_string(), format!("op#{}", a.as_raw()));
    }
}
