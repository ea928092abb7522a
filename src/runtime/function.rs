//! Host functions callable from script.
//!
//! A [`HostFunction`] converts into a V8 function whose data slot carries an
//! id into the runtime's function table. The shared callback looks the entry
//! up, converts the arguments and dispatches on the function's flavor.

use crate::error::{Error, Result};
use crate::runtime::pins::report_callback_error;
use crate::runtime::registry::OpKind;
use crate::runtime::scope::{self, BridgeScope};
use crate::runtime::value::HostValue;
use deno_core::v8;
use futures::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

type SyncBody = dyn Fn(Vec<HostValue>) -> Result<HostValue> + Send + Sync;
type AsyncBody = dyn Fn(Vec<HostValue>) -> BoxFuture<'static, Result<HostValue>> + Send + Sync;
type ScopedBody = dyn for<'a, 's, 't> Fn(&'t mut BridgeScope<'a, 's>, &'t [v8::Local<'s, v8::Value>]) -> Result<v8::Local<'s, v8::Value>>
    + Send
    + Sync;

enum HostFnKind {
    Sync(Box<SyncBody>),
    Async(Box<AsyncBody>),
    Scoped(Box<ScopedBody>),
}

/// A host function exposed to script.
#[derive(Clone)]
pub struct HostFunction {
    name: Arc<str>,
    arity: usize,
    variadic: bool,
    body: Arc<HostFnKind>,
}

impl HostFunction {
    /// Synchronous function over converted arguments.
    ///
    /// Script arguments are padded with `Null` or truncated to `arity`.
    pub fn new<F>(name: impl Into<Arc<str>>, arity: usize, f: F) -> Self
    where
        F: Fn(Vec<HostValue>) -> Result<HostValue> + Send + Sync + 'static,
    {
        Self::from_kind(name, arity, HostFnKind::Sync(Box::new(f)))
    }

    /// Asynchronous function; script receives a promise.
    ///
    /// The future runs on the execution thread's executor and must not touch
    /// the engine. Its result settles the promise through the work queue.
    pub fn new_async<F, Fut>(name: impl Into<Arc<str>>, arity: usize, f: F) -> Self
    where
        F: Fn(Vec<HostValue>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HostValue>> + Send + 'static,
    {
        let body = move |args: Vec<HostValue>| f(args).boxed();
        Self::from_kind(name, arity, HostFnKind::Async(Box::new(body)))
    }

    /// Function working directly on engine values.
    pub fn with_scope<F>(name: impl Into<Arc<str>>, arity: usize, f: F) -> Self
    where
        F: for<'a, 's, 't> Fn(
                &'t mut BridgeScope<'a, 's>,
                &'t [v8::Local<'s, v8::Value>],
            ) -> Result<v8::Local<'s, v8::Value>>
            + Send
            + Sync
            + 'static,
    {
        Self::from_kind(name, arity, HostFnKind::Scoped(Box::new(f)))
    }

    fn from_kind(name: impl Into<Arc<str>>, arity: usize, kind: HostFnKind) -> Self {
        Self {
            name: name.into(),
            arity,
            variadic: false,
            body: Arc::new(kind),
        }
    }

    /// Pass every script argument through instead of padding to the arity.
    pub fn variadic(mut self) -> Self {
        self.variadic = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn is_variadic(&self) -> bool {
        self.variadic
    }

    /// Whether both values wrap the same function body.
    pub fn same_function(&self, other: &HostFunction) -> bool {
        Arc::ptr_eq(&self.body, &other.body)
    }

    fn key(&self) -> usize {
        Arc::as_ptr(&self.body) as usize
    }

    fn invoke<'s>(
        &self,
        cx: &mut BridgeScope<'_, 's>,
        args: &[v8::Local<'s, v8::Value>],
    ) -> Result<v8::Local<'s, v8::Value>> {
        match &*self.body {
            HostFnKind::Scoped(body) => body(cx, args),
            HostFnKind::Sync(body) => {
                let values = convert_args(cx, args)?;
                let result = body(values)?;
                cx.to_engine(result)
            }
            HostFnKind::Async(body) => {
                let values = convert_args(cx, args)?;
                let future = body(values);
                spawn_host_future(cx, self.name.clone(), future)
            }
        }
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &*self.body {
            HostFnKind::Sync(_) => "sync",
            HostFnKind::Async(_) => "async",
            HostFnKind::Scoped(_) => "scoped",
        };
        f.debug_struct("HostFunction")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .field("variadic", &self.variadic)
            .field("kind", &kind)
            .finish()
    }
}

fn convert_args<'s>(
    cx: &mut BridgeScope<'_, 's>,
    args: &[v8::Local<'s, v8::Value>],
) -> Result<Vec<HostValue>> {
    args.iter().map(|arg| cx.to_host(*arg)).collect()
}

/// Run an async host function body and hand script a promise for its result.
fn spawn_host_future<'s>(
    cx: &mut BridgeScope<'_, 's>,
    name: Arc<str>,
    future: BoxFuture<'static, Result<HostValue>>,
) -> Result<v8::Local<'s, v8::Value>> {
    let executor = tokio::runtime::Handle::try_current()
        .map_err(|_| Error::runtime("No async executor on the execution thread"))?;
    let (pending, promise) = cx.create_promise()?;
    let registry = cx.registry().clone();
    let runtime = cx.handle().clone();
    let op = registry.register(OpKind::HostAsync);

    let task_registry = registry.clone();
    let task = executor.spawn(async move {
        let result = future.await;
        if !task_registry.contains(op) {
            return;
        }
        let delivered = runtime.call_async(move |cx| {
            if !cx.registry().contains(op) {
                return;
            }
            if let Err(err) = pending.settle(cx, result) {
                report_callback_error(&name, &err);
            }
            cx.registry().unregister(op);
        });
        if delivered.is_err() {
            task_registry.unregister(op);
        }
    });
    let abort = task.abort_handle();
    registry.set_cancel_hook(op, Box::new(move || abort.abort()));

    Ok(promise.into())
}

struct FunctionEntry {
    function: HostFunction,
    handle: v8::Weak<v8::Function>,
}

/// Host functions currently reachable from script, keyed by id.
#[derive(Default)]
pub(crate) struct FunctionTable {
    entries: HashMap<u64, FunctionEntry>,
    by_body: HashMap<usize, u64>,
    sweep_at: usize,
}

const MIN_SWEEP: usize = 64;

impl FunctionTable {
    fn get(&self, id: u64) -> Option<HostFunction> {
        self.entries.get(&id).map(|entry| entry.function.clone())
    }

    fn live<'s>(
        &self,
        function: &HostFunction,
        scope: &mut v8::HandleScope<'s>,
    ) -> Option<v8::Local<'s, v8::Function>> {
        let id = self.by_body.get(&function.key())?;
        self.entries.get(id)?.handle.to_local(scope)
    }

    fn insert(&mut self, id: u64, function: HostFunction, handle: v8::Weak<v8::Function>) {
        if self.entries.len() >= self.sweep_at {
            self.sweep();
        }
        self.by_body.insert(function.key(), id);
        self.entries.insert(id, FunctionEntry { function, handle });
    }

    /// Drop entries whose engine function was collected.
    fn sweep(&mut self) {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.handle.is_empty());
        let entries = &self.entries;
        self.by_body.retain(|_, id| entries.contains_key(id));
        self.sweep_at = (self.entries.len() * 2).max(MIN_SWEEP);
        tracing::trace!(
            target: "jsbridge::runtime",
            swept = before - self.entries.len(),
            live = self.entries.len(),
            "swept host function table"
        );
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        self.by_body.clear();
        count
    }
}

impl<'a, 's> BridgeScope<'a, 's> {
    /// Engine function for `function`, reusing a live one for the same body.
    pub fn function_value(&mut self, function: HostFunction) -> Result<v8::Local<'s, v8::Function>> {
        if let Some(existing) = self.state.functions.borrow().live(&function, self.scope) {
            return Ok(existing);
        }

        let id = self.state.next_id();
        let data = v8::Number::new(self.scope, id as f64);
        let length = if function.variadic { 0 } else { function.arity };
        let func = v8::Function::builder(host_function_callback)
            .data(data.into())
            .length(i32::try_from(length).unwrap_or(i32::MAX))
            .build(self.scope)
            .ok_or_else(|| Error::runtime(format!("Failed to create function '{}'", function.name)))?;
        let name = self.string(&function.name)?;
        func.set_name(name);

        let weak = v8::Weak::new(self.scope, func);
        self.state.functions.borrow_mut().insert(id, function, weak);
        Ok(func)
    }

    /// Install `function` on the `__bridge` namespace used by bootstrap code.
    pub(crate) fn set_native(&mut self, function: HostFunction) -> Result<()> {
        let global = self.global();
        let key = self.string(NATIVE_NAMESPACE)?;
        let existing = global
            .get(self.scope, key.into())
            .and_then(|value| v8::Local::<v8::Object>::try_from(value).ok());
        let namespace = match existing {
            Some(namespace) => namespace,
            None => {
                let namespace = v8::Object::new(self.scope);
                self.set_global_value(NATIVE_NAMESPACE, namespace.into())?;
                namespace
            }
        };

        let name = self.string(function.name())?;
        let value = self.function_value(function)?;
        namespace
            .set(self.scope, name.into(), value.into())
            .filter(|ok| *ok)
            .map(|_| ())
            .ok_or_else(|| Error::runtime("Failed to install native function"))
    }
}

const NATIVE_NAMESPACE: &str = "__bridge";

fn host_function_callback<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    mut rv: v8::ReturnValue,
) {
    let Some(state) = scope::current_state() else {
        let message = v8::String::new(scope, "Host function called outside a bridge runtime");
        if let Some(message) = message {
            let exception = v8::Exception::error(scope, message);
            scope.throw_exception(exception);
        }
        return;
    };

    let function = v8::Local::<v8::Number>::try_from(args.data())
        .ok()
        .map(|id| id.value() as u64)
        .and_then(|id| state.functions.borrow().get(id));

    let raw: Vec<v8::Local<'s, v8::Value>> = match &function {
        Some(function) if function.variadic => (0..args.length()).map(|i| args.get(i)).collect(),
        Some(function) => (0..function.arity)
            .map(|i| match i32::try_from(i) {
                Ok(i) if i < args.length() => args.get(i),
                _ => v8::undefined(scope).into(),
            })
            .collect(),
        None => Vec::new(),
    };

    scope::enter(scope, |scope| {
        let mut cx = BridgeScope::new(scope, state);
        let Some(function) = function else {
            cx.throw(&Error::runtime("Host function was released"));
            return;
        };
        match function.invoke(&mut cx, &raw) {
            Ok(value) => rv.set(value),
            Err(err) => {
                if cx.scope.is_execution_terminating() {
                    return;
                }
                if !matches!(err, Error::Script(_)) {
                    tracing::debug!(
                        target: "jsbridge::callback",
                        function = function.name(),
                        %err,
                        "host function failed"
                    );
                }
                cx.throw(&err);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::handle::Runtime;
    use crate::runtime::RuntimeConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_arguments_padded_and_truncated() {
        let runtime = Runtime::spawn(RuntimeConfig::default()).unwrap();
        runtime
            .register_function(HostFunction::new("pair", 2, |args| {
                assert_eq!(args.len(), 2);
                Ok(HostValue::Array(args))
            }))
            .unwrap();

        assert_eq!(
            runtime.eval("pair(1)").unwrap(),
            HostValue::Array(vec![HostValue::Int(1), HostValue::Null])
        );
        assert_eq!(
            runtime.eval("pair(1, 2, 3)").unwrap(),
            HostValue::Array(vec![HostValue::Int(1), HostValue::Int(2)])
        );
        assert_eq!(runtime.eval("pair.length").unwrap(), HostValue::Int(2));
        assert_eq!(runtime.eval("pair.name").unwrap(), HostValue::from("pair"));
    }

    #[test]
    fn test_variadic_receives_all_arguments() {
        let runtime = Runtime::spawn(RuntimeConfig::default()).unwrap();
        runtime
            .register_function(
                HostFunction::new("count", 0, |args| Ok(HostValue::from(args.len()))).variadic(),
            )
            .unwrap();
        assert_eq!(runtime.eval("count(1, 'a', null, [])").unwrap(), HostValue::Int(4));
    }

    #[test]
    fn test_conversion_error_becomes_type_error() {
        let runtime = Runtime::spawn(RuntimeConfig::default()).unwrap();
        runtime
            .register_function(HostFunction::new("echo", 1, |mut args| Ok(args.remove(0))))
            .unwrap();
        let result = runtime
            .eval("try { echo(Symbol('s')); 'no' } catch (e) { e instanceof TypeError }")
            .unwrap();
        assert_eq!(result, HostValue::Bool(true));
    }

    #[test]
    fn test_same_host_function_keeps_identity() {
        let runtime = Runtime::spawn(RuntimeConfig::default()).unwrap();
        let f = HostFunction::new("ident", 1, |mut args| Ok(args.remove(0)));
        runtime
            .call_sync(move |cx| {
                cx.set_global("a", HostValue::Function(f.clone()))?;
                cx.set_global("b", HostValue::Function(f))
            })
            .unwrap();
        assert_eq!(runtime.eval("a === b").unwrap(), HostValue::Bool(true));
    }

    #[test]
    fn test_reentrant_call_sync_from_host_function() {
        let runtime = Runtime::spawn(RuntimeConfig::default()).unwrap();
        let handle = runtime.handle().clone();
        runtime
            .register_function(HostFunction::new("nested", 1, move |args| {
                let n = args[0].as_i64().unwrap_or_default();
                handle.eval(&format!("base * {}", n))
            }))
            .unwrap();

        runtime.eval("globalThis.base = 7").unwrap();
        assert_eq!(runtime.eval("nested(6)").unwrap(), HostValue::Int(42));
    }

    #[test]
    fn test_host_function_calls_back_into_script() {
        let runtime = Runtime::spawn(RuntimeConfig::default()).unwrap();
        runtime
            .register_function(HostFunction::new("apply", 2, |args| {
                let callback = args[0]
                    .as_js_function()
                    .ok_or_else(|| Error::conversion("expected a function"))?;
                callback.call(vec![args[1].clone()])
            }))
            .unwrap();
        assert_eq!(
            runtime.eval("apply(x => x + '!', 'hi')").unwrap(),
            HostValue::from("hi!")
        );
    }

    #[tokio::test]
    async fn test_async_host_function_resolves_promise() {
        let runtime = Runtime::spawn(RuntimeConfig::default()).unwrap();
        runtime
            .register_function(HostFunction::new_async("later", 1, |args| async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(HostValue::from(format!("got {}", args[0].display_string())))
            }))
            .unwrap();

        let result = runtime.eval_async("later(1)").await.unwrap();
        assert_eq!(result, HostValue::from("got 1"));
        assert_eq!(runtime.pending_ops(), 0);
    }

    #[tokio::test]
    async fn test_async_host_function_rejects() {
        let runtime = Runtime::spawn(RuntimeConfig::default()).unwrap();
        runtime
            .register_function(HostFunction::new_async("broken", 0, |_| async {
                Err(Error::transport("unreachable"))
            }))
            .unwrap();

        let result = runtime
            .eval_async("broken().then(() => 'ok', e => e.code)")
            .await
            .unwrap();
        assert_eq!(result, HostValue::from("ERR_TRANSPORT"));
    }

    #[test]
    fn test_async_host_function_tracked_while_in_flight() {
        let runtime = Runtime::spawn(RuntimeConfig::default()).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        runtime
            .register_function(HostFunction::new_async("slow", 0, move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(HostValue::Null)
                }
            }))
            .unwrap();

        runtime.eval("slow(); slow();").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(runtime.registry().count_kind(OpKind::HostAsync), 2);
        assert_eq!(runtime.registry().cancel_all(), 2);
        assert!(runtime.registry().is_empty());
    }
}
