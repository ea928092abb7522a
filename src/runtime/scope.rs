//! Execution-thread context for engine value work.
//!
//! A [`BridgeScope`] pairs the active V8 handle scope with the runtime's
//! exec-thread-only [`BridgeState`]. Every conversion, pin and call goes through
//! one, and one can only exist on the execution thread.
//!
//! Host callbacks entered from script register their handle scope on a
//! thread-local stack so that `call_sync` issued from inside a callback runs
//! immediately on a child scope instead of deadlocking on the work queue.

use crate::error::{Error, Result, ScriptError};
use crate::runtime::facade::FacadeTable;
use crate::runtime::function::{FunctionTable, HostFunction};
use crate::runtime::handle::{RuntimeHandle, RuntimeServices};
use crate::runtime::pins::{EngineRef, JsFunction, PendingPromise, PinTable, WeakCallback};
use crate::runtime::registry::OperationRegistry;
use crate::runtime::resources::ResourceTable;
use crate::runtime::value::{HostValue, LimitTracker};
use crate::runtime::watchdog::Watchdog;
use crate::runtime::websocket::SocketConnection;
use deno_core::v8;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

/// Records which thread owns an engine and rejects access from any other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadGuard {
    owner: ThreadId,
}

impl ThreadGuard {
    pub fn new(owner: ThreadId) -> Self {
        Self { owner }
    }

    /// Guard owned by the calling thread.
    pub fn current() -> Self {
        Self::new(thread::current().id())
    }

    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    pub fn is_owner(&self) -> bool {
        thread::current().id() == self.owner
    }

    /// Fail with [`Error::ThreadViolation`] when called off the owning thread.
    pub fn check(&self) -> Result<()> {
        let actual = thread::current().id();
        if actual == self.owner {
            Ok(())
        } else {
            Err(Error::thread_violation(self.owner, actual))
        }
    }
}

/// Exec-thread-only state shared by every scope of one runtime.
pub(crate) struct BridgeState {
    pub(crate) handle: RuntimeHandle,
    pub(crate) registry: OperationRegistry,
    pub(crate) guard: ThreadGuard,
    pub(crate) services: RuntimeServices,
    pub(crate) pins: RefCell<PinTable>,
    pub(crate) functions: RefCell<FunctionTable>,
    pub(crate) facades: RefCell<FacadeTable>,
    /// Open socket connections, shared with transport threads.
    pub(crate) sockets: ResourceTable<Box<dyn SocketConnection>>,
    pub(crate) watchdog: Option<Watchdog>,
    pub(crate) console_enabled: bool,
    context: RefCell<Option<v8::Global<v8::Context>>>,
    max_depth: usize,
    max_bytes: usize,
    next_id: Cell<u64>,
}

pub(crate) struct StateOptions {
    pub(crate) context: v8::Global<v8::Context>,
    pub(crate) services: RuntimeServices,
    pub(crate) watchdog: Option<Watchdog>,
    pub(crate) console_enabled: bool,
    pub(crate) max_depth: usize,
    pub(crate) max_bytes: usize,
}

impl BridgeState {
    pub(crate) fn new(handle: RuntimeHandle, options: StateOptions) -> Self {
        Self {
            registry: handle.registry().clone(),
            handle,
            guard: ThreadGuard::current(),
            services: options.services,
            pins: RefCell::new(PinTable::default()),
            functions: RefCell::new(FunctionTable::default()),
            facades: RefCell::new(FacadeTable::default()),
            sockets: ResourceTable::new(),
            watchdog: options.watchdog,
            console_enabled: options.console_enabled,
            context: RefCell::new(Some(options.context)),
            max_depth: options.max_depth,
            max_bytes: options.max_bytes,
            next_id: Cell::new(0),
        }
    }

    pub(crate) fn runtime_id(&self) -> u64 {
        self.handle.id()
    }

    pub(crate) fn next_id(&self) -> u64 {
        let id = self.next_id.get() + 1;
        self.next_id.set(id);
        id
    }

    pub(crate) fn limit_tracker(&self) -> LimitTracker {
        LimitTracker::new(self.max_depth, self.max_bytes)
    }

    /// Drop every engine handle held on behalf of host code.
    ///
    /// Must run while the isolate is still alive.
    pub(crate) fn clear(&self) -> usize {
        let pins = self.pins.borrow_mut().clear();
        let functions = self.functions.borrow_mut().clear();
        let facades = self.facades.borrow_mut().clear();
        let sockets = self.sockets.drain().len();
        self.context.borrow_mut().take();
        pins + functions + facades + sockets
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<BridgeState>>> = const { RefCell::new(None) };
    static SCOPES: RefCell<Vec<*mut v8::Isolate>> = const { RefCell::new(Vec::new()) };
}

pub(crate) fn set_current(state: Rc<BridgeState>) {
    CURRENT.with(|current| *current.borrow_mut() = Some(state));
}

pub(crate) fn clear_current() -> Option<Rc<BridgeState>> {
    CURRENT.with(|current| current.borrow_mut().take())
}

pub(crate) fn current_state() -> Option<Rc<BridgeState>> {
    CURRENT.with(|current| current.borrow().clone())
}

/// State of the runtime owning this thread, if it is `runtime_id`.
pub(crate) fn current_state_for(runtime_id: u64) -> Option<Rc<BridgeState>> {
    current_state().filter(|state| state.runtime_id() == runtime_id)
}

/// Run `f` with `scope` registered as the innermost active scope.
pub(crate) fn enter<'s, R>(
    scope: &mut v8::HandleScope<'s>,
    f: impl FnOnce(&mut v8::HandleScope<'s>) -> R,
) -> R {
    struct Pop;
    impl Drop for Pop {
        fn drop(&mut self) {
            SCOPES.with(|scopes| {
                scopes.borrow_mut().pop();
            });
        }
    }

    let isolate: &mut v8::Isolate = scope;
    let isolate = isolate as *mut v8::Isolate;
    SCOPES.with(|scopes| scopes.borrow_mut().push(isolate));
    let _pop = Pop;
    f(scope)
}

/// Run `f` on a new scope nested inside the innermost active one.
///
/// Returns `None` when no scope is active on this thread (for example inside
/// a background task between work items).
pub(crate) fn with_current<R>(f: impl FnOnce(&mut BridgeScope<'_, '_>) -> R) -> Option<R> {
    let isolate = SCOPES.with(|scopes| scopes.borrow().last().copied())?;
    let state = current_state()?;
    let context = state.context.borrow().clone()?;
    // SAFETY: `enter` pushed this pointer on the current thread and pops it
    // before its frame returns, so the isolate is alive. Suspended frames reach
    // the isolate only through V8 scopes, which hold it by raw pointer, so no
    // other `&mut Isolate` is live here. The reference is consumed by the new
    // handle scope, which V8 chains onto its current scope and which is
    // dropped before this function returns.
    let isolate: &mut v8::Isolate = unsafe { &mut *isolate };
    let scope = &mut v8::HandleScope::new(isolate);
    let context = v8::Local::new(scope, context);
    let scope = &mut v8::ContextScope::new(scope, context);
    Some(enter(scope, |scope| {
        let mut cx = BridgeScope::new(scope, state);
        f(&mut cx)
    }))
}

/// Handle to the engine valid for the duration of one unit of work.
pub struct BridgeScope<'a, 's> {
    pub(crate) scope: &'a mut v8::HandleScope<'s>,
    pub(crate) state: Rc<BridgeState>,
}

impl<'a, 's> BridgeScope<'a, 's> {
    pub(crate) fn new(scope: &'a mut v8::HandleScope<'s>, state: Rc<BridgeState>) -> Self {
        Self { scope, state }
    }

    /// Raw access to the underlying V8 scope.
    pub fn v8(&mut self) -> &mut v8::HandleScope<'s> {
        self.scope
    }

    pub fn handle(&self) -> &RuntimeHandle {
        &self.state.handle
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.state.registry
    }

    pub fn thread_guard(&self) -> ThreadGuard {
        self.state.guard
    }

    pub fn global(&mut self) -> v8::Local<'s, v8::Object> {
        let context = self.scope.get_current_context();
        context.global(self.scope)
    }

    pub(crate) fn string(&mut self, value: &str) -> Result<v8::Local<'s, v8::String>> {
        v8::String::new(self.scope, value)
            .ok_or_else(|| Error::conversion("String exceeds the engine's maximum length"))
    }

    /// Define a property on the global object.
    pub fn set_global(&mut self, name: &str, value: HostValue) -> Result<()> {
        let value = self.to_engine(value)?;
        self.set_global_value(name, value)
    }

    pub(crate) fn set_global_value(&mut self, name: &str, value: v8::Local<'s, v8::Value>) -> Result<()> {
        let global = self.global();
        let key = self.string(name)?;
        global
            .set(self.scope, key.into(), value)
            .filter(|ok| *ok)
            .map(|_| ())
            .ok_or_else(|| Error::runtime(format!("Failed to set global '{}'", name)))
    }

    /// Read a property of the global object.
    pub fn get_global(&mut self, name: &str) -> Result<HostValue> {
        let global = self.global();
        let key = self.string(name)?;
        let value = global
            .get(self.scope, key.into())
            .ok_or_else(|| Error::runtime(format!("Failed to read global '{}'", name)))?;
        self.to_host(value)
    }

    /// Compile and run a classic script, returning its completion value.
    pub fn run_script(&mut self, code: &str) -> Result<v8::Local<'s, v8::Value>> {
        let state = self.state.clone();
        let _watch = state.watchdog.as_ref().map(Watchdog::arm);
        let source = self.string(code)?;
        let timeout = state.watchdog.as_ref().map(Watchdog::timeout);

        let tc = &mut v8::TryCatch::new(&mut *self.scope);
        let result = v8::Script::compile(tc, source, None).and_then(|script| script.run(tc));
        match result {
            Some(value) => Ok(value),
            None => Err(capture_exception(tc, timeout)),
        }
    }

    /// Evaluate a script and convert its completion value.
    pub fn eval(&mut self, code: &str) -> Result<HostValue> {
        let value = self.run_script(code)?;
        self.to_host(value)
    }

    /// Call a function, capturing anything it throws as [`Error::Script`].
    pub fn call_function(
        &mut self,
        function: v8::Local<'s, v8::Function>,
        receiver: v8::Local<'s, v8::Value>,
        args: &[v8::Local<'s, v8::Value>],
    ) -> Result<v8::Local<'s, v8::Value>> {
        let state = self.state.clone();
        let _watch = state.watchdog.as_ref().map(Watchdog::arm);
        let timeout = state.watchdog.as_ref().map(Watchdog::timeout);

        let tc = &mut v8::TryCatch::new(&mut *self.scope);
        match function.call(tc, receiver, args) {
            Some(value) => Ok(value),
            None => Err(capture_exception(tc, timeout)),
        }
    }

    /// Keep an engine value reachable from host code.
    pub fn pin(&mut self, value: v8::Local<'s, v8::Value>) -> EngineRef {
        let id = self.state.next_id();
        let global = v8::Global::new(self.scope, value);
        self.state.pins.borrow_mut().insert_strong(id, global, None);
        EngineRef::new(id, self.state.handle.clone())
    }

    /// Pin a function together with the receiver it should be called on.
    pub fn pin_function(
        &mut self,
        function: v8::Local<'s, v8::Function>,
        receiver: Option<v8::Local<'s, v8::Value>>,
    ) -> JsFunction {
        let id = self.state.next_id();
        let value: v8::Local<v8::Value> = function.into();
        let global = v8::Global::new(self.scope, value);
        let receiver = receiver.map(|r| v8::Global::new(self.scope, r));
        self.state.pins.borrow_mut().insert_strong(id, global, receiver);
        JsFunction::new(id, self.state.handle.clone())
    }

    /// Observe a function without keeping it alive.
    pub fn pin_weak(&mut self, function: v8::Local<'s, v8::Function>) -> WeakCallback {
        let id = self.state.next_id();
        let weak = v8::Weak::new(self.scope, function);
        self.state.pins.borrow_mut().insert_weak(id, weak);
        WeakCallback::new(id, self.state.handle.clone())
    }

    /// Create a promise whose settlement is driven from host code.
    pub fn create_promise(&mut self) -> Result<(PendingPromise, v8::Local<'s, v8::Promise>)> {
        let resolver = v8::PromiseResolver::new(self.scope)
            .ok_or_else(|| Error::runtime("Failed to create promise"))?;
        let promise = resolver.get_promise(self.scope);
        let id = self.state.next_id();
        let global = v8::Global::new(self.scope, resolver);
        self.state.pins.borrow_mut().insert_resolver(id, global);
        Ok((PendingPromise::new(id, self.state.handle.clone()), promise))
    }

    /// Deliver the settled value of `value` to `on_settle`.
    ///
    /// Non-promises settle immediately. Pending promises are observed with
    /// `then`; the callback runs during a later microtask checkpoint.
    pub fn await_value<F>(&mut self, value: v8::Local<'s, v8::Value>, on_settle: F) -> Result<()>
    where
        F: FnOnce(Result<HostValue>) + Send + 'static,
    {
        let promise = match v8::Local::<v8::Promise>::try_from(value) {
            Ok(promise) => promise,
            Err(_) => {
                on_settle(self.to_host(value));
                return Ok(());
            }
        };

        match promise.state() {
            v8::PromiseState::Fulfilled => {
                let result = promise.result(self.scope);
                on_settle(self.to_host(result));
                Ok(())
            }
            v8::PromiseState::Rejected => {
                promise.mark_as_handled();
                let reason = promise.result(self.scope);
                on_settle(Err(Error::Script(self.script_error(reason))));
                Ok(())
            }
            v8::PromiseState::Pending => {
                type Settle = Box<dyn FnOnce(Result<HostValue>) + Send>;
                let slot: Arc<Mutex<Option<Settle>>> = Arc::new(Mutex::new(Some(Box::new(on_settle))));
                let take = |slot: &Arc<Mutex<Option<Settle>>>| {
                    slot.lock().ok().and_then(|mut guard| guard.take())
                };

                let fulfilled_slot = slot.clone();
                let on_fulfilled = HostFunction::with_scope("onFulfilled", 1, move |cx, args| {
                    if let Some(settle) = take(&fulfilled_slot) {
                        settle(cx.to_host(args[0]));
                    }
                    Ok(v8::undefined(cx.scope).into())
                });
                let on_rejected = HostFunction::with_scope("onRejected", 1, move |cx, args| {
                    if let Some(settle) = take(&slot) {
                        let error = cx.script_error(args[0]);
                        settle(Err(Error::Script(error)));
                    }
                    Ok(v8::undefined(cx.scope).into())
                });

                let on_fulfilled = self.function_value(on_fulfilled)?;
                let on_rejected = self.function_value(on_rejected)?;
                promise
                    .then2(self.scope, on_fulfilled, on_rejected)
                    .ok_or_else(|| Error::runtime("Failed to attach promise handlers"))?;
                Ok(())
            }
        }
    }

    /// Build a structured error from a thrown or rejected value.
    pub(crate) fn script_error(&mut self, exception: v8::Local<'s, v8::Value>) -> ScriptError {
        exception_to_script_error(self.scope, exception, None)
    }

    /// Engine error object mirroring a host error.
    pub fn error_value(&mut self, err: &Error) -> v8::Local<'s, v8::Value> {
        let message = match err {
            Error::Script(script) => script.message.clone(),
            other => other.to_string(),
        };
        let message = v8::String::new(self.scope, &message).unwrap_or_else(|| v8::String::empty(self.scope));
        let exception = match err {
            Error::Conversion(_) => v8::Exception::type_error(self.scope, message),
            Error::Closed | Error::HandleNotFound(_) => v8::Exception::range_error(self.scope, message),
            _ => v8::Exception::error(self.scope, message),
        };

        if let Ok(object) = v8::Local::<v8::Object>::try_from(exception) {
            if let (Some(key), Some(code)) = (
                v8::String::new(self.scope, "code"),
                v8::String::new(self.scope, err.code()),
            ) {
                object.set(self.scope, key.into(), code.into());
            }
            if let Error::Script(ScriptError { name: Some(name), .. }) = err {
                if let (Some(key), Some(name)) =
                    (v8::String::new(self.scope, "name"), v8::String::new(self.scope, name))
                {
                    object.set(self.scope, key.into(), name.into());
                }
            }
        }
        exception
    }

    /// Throw a host error into the running script.
    pub fn throw(&mut self, err: &Error) {
        let exception = self.error_value(err);
        self.scope.throw_exception(exception);
    }

    pub fn run_microtasks(&mut self) {
        self.scope.perform_microtask_checkpoint();
    }

    /// Force a full collection cycle.
    pub fn collect_garbage(&mut self) {
        self.scope.low_memory_notification();
    }
}

fn capture_exception(tc: &mut v8::TryCatch<v8::HandleScope>, timeout: Option<Duration>) -> Error {
    if tc.has_terminated() || tc.is_execution_terminating() {
        return Error::Timeout(timeout.unwrap_or_default());
    }
    match tc.exception() {
        Some(exception) => {
            let stack = tc
                .stack_trace()
                .filter(|value| value.is_string())
                .map(|value| value.to_rust_string_lossy(tc));
            Error::Script(exception_to_script_error(tc, exception, stack))
        }
        None => Error::runtime("Script execution failed without an exception"),
    }
}

fn read_string_property<'s>(
    scope: &mut v8::HandleScope<'s>,
    object: v8::Local<'s, v8::Object>,
    name: &str,
) -> Option<String> {
    let key = v8::String::new(scope, name)?;
    let value = object.get(scope, key.into())?;
    if value.is_null_or_undefined() {
        None
    } else {
        Some(value.to_rust_string_lossy(scope))
    }
}

fn exception_to_script_error<'s>(
    scope: &mut v8::HandleScope<'s>,
    exception: v8::Local<'s, v8::Value>,
    stack: Option<String>,
) -> ScriptError {
    if exception.is_object() && !exception.is_proxy() {
        if let Ok(object) = v8::Local::<v8::Object>::try_from(exception) {
            let message = read_string_property(scope, object, "message");
            if exception.is_native_error() || message.is_some() {
                return ScriptError {
                    name: read_string_property(scope, object, "name"),
                    message: message.unwrap_or_default(),
                    stack: read_string_property(scope, object, "stack").or(stack),
                };
            }
        }
    }
    ScriptError {
        name: None,
        message: exception.to_rust_string_lossy(scope),
        stack,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::function::HostFunction;
    use crate::runtime::handle::Runtime;
    use crate::runtime::RuntimeConfig;
    use crate::test_support::init_tracing;

    #[test]
    fn test_thread_guard_detects_foreign_thread() {
        let guard = ThreadGuard::current();
        assert!(guard.check().is_ok());
        assert!(guard.is_owner());

        let err = thread::spawn(move || guard.check())
            .join()
            .unwrap()
            .unwrap_err();
        match err {
            Error::ThreadViolation { expected, actual } => {
                assert_eq!(expected, guard.owner());
                assert_ne!(actual, expected);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_engine_guard_confines_to_execution_thread() {
        init_tracing();
        let runtime = Runtime::spawn(RuntimeConfig::default()).unwrap();
        let guard = runtime.thread_guard().unwrap();

        assert!(guard.check().unwrap_err().is_thread_violation());
        let inside = runtime
            .call_sync(|cx| Ok(cx.thread_guard().check().is_ok()))
            .unwrap();
        assert!(inside);
        assert_eq!(runtime.call_sync(|cx| Ok(cx.thread_guard())).unwrap(), guard);
    }

    #[test]
    fn test_nested_entries_share_the_context() {
        let runtime = Runtime::spawn(RuntimeConfig::default()).unwrap();
        let handle = runtime.handle().clone();
        runtime
            .register_function(HostFunction::new("descend", 1, move |args| {
                let level = args[0].as_i64().unwrap_or_default();
                if level == 0 {
                    return handle.call_sync(|cx| cx.get_global("marker"));
                }
                let inner = handle.eval(&format!("[descend({}), {}]", level - 1, level))?;
                Ok(HostValue::Array(vec![inner]))
            }))
            .unwrap();
        runtime.eval("globalThis.marker = { depth: 'bottom' }").unwrap();

        let result = runtime.eval("JSON.stringify(descend(3))").unwrap();
        assert_eq!(
            result,
            HostValue::from(r#"[[[[[[{"depth":"bottom"},1]],2]],3]]"#)
        );
        // Scopes unwound cleanly; plain work items still run.
        assert_eq!(runtime.eval("1 + 1").unwrap(), HostValue::Int(2));
        let nested = runtime.call_sync(|cx| {
            let handle = cx.handle().clone();
            handle.call_sync(|inner| inner.eval("typeof marker"))
        });
        assert_eq!(nested.unwrap(), HostValue::from("object"));
    }

    #[test]
    fn test_script_error_carries_name_and_stack() {
        let runtime = Runtime::spawn(RuntimeConfig::default()).unwrap();
        let err = runtime
            .eval("function boom() { throw new TypeError('bad input'); }\nboom();")
            .unwrap_err();
        let script = err.as_script().expect("script error");
        assert_eq!(script.name.as_deref(), Some("TypeError"));
        assert_eq!(script.message, "bad input");
        assert!(script.stack.as_deref().unwrap_or_default().contains("boom"));
    }

    #[test]
    fn test_thrown_primitive_becomes_message() {
        let runtime = Runtime::spawn(RuntimeConfig::default()).unwrap();
        let err = runtime.eval("throw 'plain'").unwrap_err();
        let script = err.as_script().expect("script error");
        assert_eq!(script.message, "plain");
        assert!(script.name.is_none());
    }

    #[test]
    fn test_syntax_error_is_script_error() {
        let runtime = Runtime::spawn(RuntimeConfig::default()).unwrap();
        let err = runtime.eval("let = ;").unwrap_err();
        assert_eq!(err.as_script().and_then(|s| s.name.clone()).as_deref(), Some("SyntaxError"));
    }

    #[test]
    fn test_globals_round_trip() {
        let runtime = Runtime::spawn(RuntimeConfig::default()).unwrap();
        runtime
            .call_sync(|cx| cx.set_global("answer", HostValue::Int(42)))
            .unwrap();
        assert_eq!(runtime.eval("answer + 1").unwrap(), HostValue::Int(43));
        let read = runtime
            .call_sync(|cx| cx.get_global("answer"))
            .unwrap();
        assert_eq!(read, HostValue::Int(42));
    }

    #[test]
    fn test_host_error_thrown_into_script_has_code() {
        let runtime = Runtime::spawn(RuntimeConfig::default()).unwrap();
        runtime
            .register_function(HostFunction::new("fail", 0, |_| {
                Err(Error::transport("socket reset"))
            }))
            .unwrap();
        let code = runtime
            .eval("try { fail(); 'no' } catch (e) { e.code + ':' + e.message }")
            .unwrap();
        assert_eq!(
            code,
            HostValue::from("ERR_TRANSPORT:Transport error: socket reset")
        );
    }
}
