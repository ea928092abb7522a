//! Execution timeout enforcement.
//!
//! A helper thread watches the deadline of the outermost script entry and
//! terminates execution through the isolate's thread-safe handle once it
//! passes. Nested entries (script calling a host function that runs more
//! script) share the outer deadline.

use deno_core::v8;
use std::cell::Cell;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Default)]
struct WatchState {
    deadline: Option<Instant>,
    fired: bool,
    stop: bool,
}

struct WatchShared {
    state: Mutex<WatchState>,
    cond: Condvar,
    isolate: v8::IsolateHandle,
}

impl WatchShared {
    fn lock(&self) -> MutexGuard<'_, WatchState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub(crate) struct Watchdog {
    shared: Arc<WatchShared>,
    timeout: Duration,
    depth: Cell<usize>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub(crate) fn spawn(isolate: v8::IsolateHandle, timeout: Duration, name: &str) -> std::io::Result<Self> {
        let shared = Arc::new(WatchShared {
            state: Mutex::new(WatchState::default()),
            cond: Condvar::new(),
            isolate,
        });
        let worker = shared.clone();
        let thread = thread::Builder::new()
            .name(format!("{}-watchdog", name))
            .spawn(move || watch(worker))?;
        Ok(Self {
            shared,
            timeout,
            depth: Cell::new(0),
            thread: Some(thread),
        })
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Start the clock unless an outer entry already did.
    pub(crate) fn arm(&self) -> WatchGuard<'_> {
        let depth = self.depth.get();
        self.depth.set(depth + 1);
        if depth == 0 {
            let mut state = self.shared.lock();
            state.deadline = Some(Instant::now() + self.timeout);
            state.fired = false;
            drop(state);
            self.shared.cond.notify_all();
        }
        WatchGuard { dog: self }
    }

    fn disarm(&self) {
        let depth = self.depth.get().saturating_sub(1);
        self.depth.set(depth);
        if depth > 0 {
            return;
        }
        let mut state = self.shared.lock();
        state.deadline = None;
        let fired = std::mem::take(&mut state.fired);
        drop(state);
        if fired {
            // The outermost entry has unwound; let the isolate run again.
            self.shared.isolate.cancel_terminate_execution();
            tracing::warn!(
                target: "jsbridge::runtime",
                timeout_ms = self.timeout.as_millis() as u64,
                "script execution terminated after timeout"
            );
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.shared.lock().stop = true;
        self.shared.cond.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

pub(crate) struct WatchGuard<'a> {
    dog: &'a Watchdog,
}

impl Drop for WatchGuard<'_> {
    fn drop(&mut self) {
        self.dog.disarm();
    }
}

fn watch(shared: Arc<WatchShared>) {
    let mut state = shared.lock();
    loop {
        if state.stop {
            return;
        }
        state = match state.deadline {
            None => match shared.cond.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            },
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    state.deadline = None;
                    state.fired = true;
                    shared.isolate.terminate_execution();
                    continue;
                }
                match shared.cond.wait_timeout(state, deadline - now) {
                    Ok((guard, _)) => guard,
                    Err(poisoned) => poisoned.into_inner().0,
                }
            }
        };
    }
}
