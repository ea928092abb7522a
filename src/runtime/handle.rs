//! Host-facing handle for interacting with the execution thread.

use crate::error::{Error, Result};
use crate::runtime::config::RuntimeConfig;
use crate::runtime::facade::HostObjectRef;
use crate::runtime::fetch::HttpTransport;
use crate::runtime::function::HostFunction;
use crate::runtime::registry::OperationRegistry;
use crate::runtime::runner::{spawn_runtime_thread, Job, RuntimeCommand};
use crate::runtime::scope::{self, BridgeScope, ThreadGuard};
use crate::runtime::value::HostValue;
use crate::runtime::websocket::SocketTransport;
use deno_core::v8;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tokio::sync::mpsc as async_mpsc;
use tokio::sync::oneshot;

/// Lifecycle of one engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    Uninitialized = 0,
    Running = 1,
    Closing = 2,
    Closed = 3,
}

impl Lifecycle {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Lifecycle::Uninitialized,
            1 => Lifecycle::Running,
            2 => Lifecycle::Closing,
            _ => Lifecycle::Closed,
        }
    }
}

/// Host services the script-visible surface forwards to.
#[derive(Clone, Default)]
pub struct RuntimeServices {
    pub http: Option<Arc<dyn HttpTransport>>,
    pub sockets: Option<Arc<dyn SocketTransport>>,
}

impl RuntimeServices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_http(mut self, transport: impl HttpTransport) -> Self {
        self.http = Some(Arc::new(transport));
        self
    }

    pub fn with_sockets(mut self, transport: impl SocketTransport) -> Self {
        self.sockets = Some(Arc::new(transport));
        self
    }
}

impl fmt::Debug for RuntimeServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeServices")
            .field("http", &self.http.is_some())
            .field("sockets", &self.sockets.is_some())
            .finish()
    }
}

static NEXT_RUNTIME_ID: AtomicU64 = AtomicU64::new(1);

struct HandleInner {
    id: u64,
    tx: async_mpsc::UnboundedSender<RuntimeCommand>,
    lifecycle: AtomicU8,
    owner: OnceLock<ThreadId>,
    isolate: OnceLock<v8::IsolateHandle>,
    registry: OperationRegistry,
    thread: Mutex<Option<JoinHandle<()>>>,
    close_timeout: Duration,
    execution_timeout: Option<Duration>,
}

/// Cloneable, thread-safe handle to one execution thread.
#[derive(Clone)]
pub struct RuntimeHandle {
    inner: Arc<HandleInner>,
}

impl RuntimeHandle {
    pub(crate) fn new(tx: async_mpsc::UnboundedSender<RuntimeCommand>, config: &RuntimeConfig) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: NEXT_RUNTIME_ID.fetch_add(1, Ordering::Relaxed),
                tx,
                lifecycle: AtomicU8::new(Lifecycle::Uninitialized as u8),
                owner: OnceLock::new(),
                isolate: OnceLock::new(),
                registry: OperationRegistry::new(),
                thread: Mutex::new(None),
                close_timeout: config.close_timeout,
                execution_timeout: config.execution_timeout,
            }),
        }
    }

    /// Record the execution thread and its isolate.
    pub(crate) fn bind(&self, owner: ThreadId, isolate: v8::IsolateHandle) {
        let _ = self.inner.owner.set(owner);
        let _ = self.inner.isolate.set(isolate);
    }

    pub(crate) fn set_thread(&self, thread: JoinHandle<()>) {
        if let Ok(mut slot) = self.inner.thread.lock() {
            *slot = Some(thread);
        }
    }

    pub(crate) fn set_lifecycle(&self, lifecycle: Lifecycle) {
        self.inner.lifecycle.store(lifecycle as u8, Ordering::SeqCst);
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.inner.registry
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.inner.lifecycle.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle() == Lifecycle::Running
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.lifecycle(), Lifecycle::Closing | Lifecycle::Closed)
    }

    pub(crate) fn owner_thread(&self) -> Option<ThreadId> {
        self.inner.owner.get().copied()
    }

    pub fn is_execution_thread(&self) -> bool {
        self.owner_thread() == Some(thread::current().id())
    }

    /// Guard bound to the execution thread.
    pub fn thread_guard(&self) -> Result<ThreadGuard> {
        self.owner_thread()
            .map(ThreadGuard::new)
            .ok_or_else(|| Error::runtime("Runtime thread has not started"))
    }

    /// Number of asynchronous operations still in flight.
    pub fn pending_ops(&self) -> usize {
        self.inner.registry.count()
    }

    /// Block until no operation is pending; `false` on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.inner.registry.wait_idle(timeout)
    }

    fn submit(&self, job: Job) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.inner
            .tx
            .send(RuntimeCommand::Work(job))
            .map_err(|_| Error::Closed)
    }

    /// Queue `f` to run on the execution thread.
    ///
    /// Valid from any thread; on the execution thread it runs after the
    /// current work item.
    pub fn call_async<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut BridgeScope<'_, '_>) + Send + 'static,
    {
        self.submit(Box::new(f))
    }

    /// Run `f` on the execution thread and wait for its result.
    ///
    /// Inside a host callback or work item this runs `f` immediately on a
    /// child scope. On the execution thread outside any scope it fails with
    /// [`Error::ThreadViolation`].
    pub fn call_sync<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut BridgeScope<'_, '_>) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        if self.is_execution_thread() {
            let current = thread::current().id();
            return scope::with_current(f)
                .unwrap_or_else(|| Err(Error::thread_violation(current, current)));
        }

        let (tx, rx) = mpsc::channel();
        self.submit(Box::new(move |cx: &mut BridgeScope<'_, '_>| {
            let _ = tx.send(f(cx));
        }))?;
        rx.recv().map_err(|_| Error::Closed)?
    }

    /// Run `f` on the execution thread and await its result.
    pub async fn call<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut BridgeScope<'_, '_>) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.submit(Box::new(move |cx: &mut BridgeScope<'_, '_>| {
            let _ = tx.send(f(cx));
        }))?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Evaluate a classic script and convert its completion value.
    pub fn eval(&self, code: &str) -> Result<HostValue> {
        let code = code.to_string();
        self.call_sync(move |cx| cx.eval(&code))
    }

    /// Evaluate a script and await its completion value.
    ///
    /// A promise completion is awaited until it settles, bounded by the
    /// configured execution timeout.
    pub async fn eval_async(&self, code: &str) -> Result<HostValue> {
        type Reply = Arc<Mutex<Option<oneshot::Sender<Result<HostValue>>>>>;
        fn send(reply: &Reply, result: Result<HostValue>) {
            if let Some(tx) = reply.lock().ok().and_then(|mut slot| slot.take()) {
                let _ = tx.send(result);
            }
        }

        let (tx, rx) = oneshot::channel();
        let reply: Reply = Arc::new(Mutex::new(Some(tx)));
        let code = code.to_string();
        self.call_async(move |cx| {
            let settle = {
                let reply = reply.clone();
                move |result| send(&reply, result)
            };
            let outcome = cx
                .run_script(&code)
                .and_then(|value| cx.await_value(value, settle));
            if let Err(err) = outcome {
                send(&reply, Err(err));
            }
        })?;

        let received = match self.inner.execution_timeout {
            Some(timeout) => tokio::time::timeout(timeout, rx)
                .await
                .map_err(|_| Error::Timeout(timeout))?,
            None => rx.await,
        };
        received.map_err(|_| Error::Closed)?
    }

    /// Define a global binding.
    pub fn set_global(&self, name: &str, value: HostValue) -> Result<()> {
        let name = name.to_string();
        self.call_sync(move |cx| cx.set_global(&name, value))
    }

    /// Expose a live host object as a global.
    pub fn expose(&self, name: &str, object: HostObjectRef) -> Result<()> {
        self.set_global(name, HostValue::HostObject(object))
    }

    /// Install a host function as a global under its own name.
    pub fn register_function(&self, function: HostFunction) -> Result<()> {
        let name = function.name().to_string();
        self.set_global(&name, HostValue::Function(function))
    }

    fn join_thread(&self) {
        let thread = self.inner.thread.lock().ok().and_then(|mut slot| slot.take());
        if let Some(thread) = thread {
            if thread.join().is_err() {
                tracing::error!(target: "jsbridge::runtime", id = self.id(), "execution thread panicked");
            }
        }
    }

    /// Shut the runtime down.
    ///
    /// Pending operations are cancelled, queued work drains (bounded by the
    /// close timeout) and the engine is released. Closing twice is a no-op.
    /// Called from the execution thread it only schedules the shutdown.
    pub fn close(&self) -> Result<()> {
        let transition = self.inner.lifecycle.compare_exchange(
            Lifecycle::Running as u8,
            Lifecycle::Closing as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        match transition.map_err(Lifecycle::from_u8) {
            Ok(_) => {}
            Err(Lifecycle::Uninitialized) => return Ok(()),
            Err(_) => {
                if !self.is_execution_thread() {
                    self.join_thread();
                }
                return Ok(());
            }
        }

        let cancelled = self.inner.registry.cancel_all();
        tracing::debug!(target: "jsbridge::runtime", id = self.id(), cancelled, "closing runtime");

        let (tx, rx) = mpsc::channel();
        if self.inner.tx.send(RuntimeCommand::Shutdown { responder: tx }).is_err() {
            self.set_lifecycle(Lifecycle::Closed);
            return Ok(());
        }
        if self.is_execution_thread() {
            return Ok(());
        }

        let timeout = self.inner.close_timeout;
        if let Err(RecvTimeoutError::Timeout) = rx.recv_timeout(timeout) {
            tracing::warn!(
                target: "jsbridge::runtime",
                id = self.id(),
                timeout_ms = timeout.as_millis() as u64,
                "queued work did not drain in time, terminating script"
            );
            if let Some(isolate) = self.inner.isolate.get() {
                isolate.terminate_execution();
            }
            if let Err(RecvTimeoutError::Timeout) = rx.recv_timeout(timeout) {
                self.set_lifecycle(Lifecycle::Closed);
                return Err(Error::runtime("Execution thread did not shut down"));
            }
        }

        self.join_thread();
        self.set_lifecycle(Lifecycle::Closed);
        tracing::debug!(target: "jsbridge::runtime", id = self.id(), "runtime closed");
        Ok(())
    }
}

impl fmt::Debug for RuntimeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeHandle")
            .field("id", &self.inner.id)
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}

/// Owning handle; closes the runtime when dropped.
#[derive(Debug)]
pub struct Runtime {
    handle: RuntimeHandle,
}

impl Runtime {
    /// Start an engine on its own execution thread.
    pub fn spawn(config: RuntimeConfig) -> Result<Self> {
        Self::spawn_with(config, RuntimeServices::default())
    }

    /// Start an engine wired to host transports.
    pub fn spawn_with(config: RuntimeConfig, services: RuntimeServices) -> Result<Self> {
        let handle = spawn_runtime_thread(config, services)?;
        Ok(Self { handle })
    }

    pub fn handle(&self) -> &RuntimeHandle {
        &self.handle
    }
}

impl Deref for Runtime {
    type Target = RuntimeHandle;

    fn deref(&self) -> &RuntimeHandle {
        &self.handle
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if let Err(err) = self.handle.close() {
            tracing::warn!(target: "jsbridge::runtime", id = self.handle.id(), %err, "runtime did not close cleanly");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::init_tracing;

    #[test]
    fn test_close_is_idempotent() {
        init_tracing();
        let runtime = Runtime::spawn(RuntimeConfig::default()).unwrap();
        assert_eq!(runtime.lifecycle(), Lifecycle::Running);

        runtime.close().unwrap();
        assert_eq!(runtime.lifecycle(), Lifecycle::Closed);
        runtime.close().unwrap();
        assert!(runtime.is_closed());
    }

    #[test]
    fn test_calls_after_close_fail() {
        let runtime = Runtime::spawn(RuntimeConfig::default()).unwrap();
        let handle = runtime.handle().clone();
        drop(runtime);

        assert!(matches!(handle.eval("1"), Err(Error::Closed)));
        assert!(matches!(handle.call_async(|_| {}), Err(Error::Closed)));
        assert!(matches!(
            handle.set_global("x", HostValue::Null),
            Err(Error::Closed)
        ));
    }

    #[test]
    fn test_close_cancels_pending_operations() {
        let runtime = Runtime::spawn(RuntimeConfig::default()).unwrap();
        runtime
            .eval("setTimeout(() => {}, 60000); setInterval(() => {}, 60000);")
            .unwrap();
        assert_eq!(runtime.pending_ops(), 2);

        runtime.close().unwrap();
        assert_eq!(runtime.pending_ops(), 0);
    }

    #[test]
    fn test_close_from_execution_thread_schedules_shutdown() {
        let runtime = Runtime::spawn(RuntimeConfig::default()).unwrap();
        let handle = runtime.handle().clone();
        runtime
            .register_function(HostFunction::new("quit", 0, move |_| {
                handle.close()?;
                Ok(HostValue::Bool(true))
            }))
            .unwrap();

        assert_eq!(runtime.eval("quit()").unwrap(), HostValue::Bool(true));
        // The owning handle waits for the thread to finish.
        runtime.close().unwrap();
        assert!(runtime.is_closed());
        assert!(matches!(runtime.eval("1"), Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_call_sync_outside_scope_on_execution_thread() {
        let runtime = Runtime::spawn(RuntimeConfig::default()).unwrap();
        let handle = runtime.handle().clone();
        runtime
            .register_function(HostFunction::new_async("probe", 0, move |_| {
                let handle = handle.clone();
                async move {
                    let err = handle.call_sync(|_| Ok(())).unwrap_err();
                    Ok(HostValue::from(err.code()))
                }
            }))
            .unwrap();

        let guard = runtime.thread_guard().unwrap();
        assert!(!guard.is_owner());
        let code = runtime.eval_async("probe()").await.unwrap();
        assert_eq!(code, HostValue::from("ERR_THREAD_VIOLATION"));
    }

    #[tokio::test]
    async fn test_eval_async_awaits_promise() {
        let runtime = Runtime::spawn(RuntimeConfig::default()).unwrap();
        let value = runtime
            .eval_async("new Promise(resolve => setTimeout(() => resolve({ done: true }), 5))")
            .await
            .unwrap();
        assert_eq!(value, HostValue::object([("done", HostValue::Bool(true))]));

        let plain = runtime.eval_async("6 * 7").await.unwrap();
        assert_eq!(plain, HostValue::Int(42));
    }

    #[tokio::test]
    async fn test_eval_async_rejection_is_script_error() {
        let runtime = Runtime::spawn(RuntimeConfig::default()).unwrap();
        let err = runtime
            .eval_async("Promise.reject(new TypeError('nope'))")
            .await
            .unwrap_err();
        let script = err.as_script().expect("script error");
        assert_eq!(script.name.as_deref(), Some("TypeError"));
        assert_eq!(script.message, "nope");

        let err = runtime
            .eval_async("(async () => { await null; throw new Error('later'); })()")
            .await
            .unwrap_err();
        assert_eq!(err.as_script().map(|s| s.message.as_str()), Some("later"));
    }

    #[tokio::test]
    async fn test_eval_async_timeout() {
        let config = RuntimeConfig::new().with_execution_timeout(Duration::from_millis(50));
        let runtime = Runtime::spawn(config).unwrap();
        let err = runtime.eval_async("new Promise(() => {})").await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[test]
    fn test_execution_timeout_terminates_busy_script() {
        let config = RuntimeConfig::new().with_execution_timeout(Duration::from_millis(100));
        let runtime = Runtime::spawn(config).unwrap();

        let err = runtime.eval("while (true) {}").unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(err.to_string(), "Execution timed out after 100ms");

        // The isolate stays usable.
        assert_eq!(runtime.eval("1 + 1").unwrap(), HostValue::Int(2));
    }

    #[test]
    fn test_wait_idle() {
        let runtime = Runtime::spawn(RuntimeConfig::default()).unwrap();
        runtime.eval("setTimeout(() => {}, 20)").unwrap();
        assert!(runtime.wait_idle(Duration::from_secs(5)));
        assert_eq!(runtime.pending_ops(), 0);
    }
}
