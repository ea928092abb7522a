//! Host-side tokens for engine values.
//!
//! Engine values never leave the execution thread. Host code holds tokens
//! that name an entry in the runtime's pin table instead; the entry owns the
//! actual V8 handle. Tokens are `Send + Sync`, and dropping the last clone
//! releases the entry (directly on the execution thread, otherwise through
//! the work queue).

use crate::error::{Error, Result};
use crate::runtime::handle::RuntimeHandle;
use crate::runtime::scope::{self, BridgeScope};
use crate::runtime::value::HostValue;
use deno_core::v8;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

struct StrongPin {
    value: v8::Global<v8::Value>,
    receiver: Option<v8::Global<v8::Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PinKind {
    Strong,
    Weak,
    Resolver,
}

/// Arena of pinned engine values, keyed by token id.
#[derive(Default)]
pub(crate) struct PinTable {
    strong: HashMap<u64, StrongPin>,
    weak: HashMap<u64, v8::Weak<v8::Function>>,
    resolvers: HashMap<u64, v8::Global<v8::PromiseResolver>>,
}

impl PinTable {
    pub(crate) fn insert_strong(
        &mut self,
        id: u64,
        value: v8::Global<v8::Value>,
        receiver: Option<v8::Global<v8::Value>>,
    ) {
        self.strong.insert(id, StrongPin { value, receiver });
    }

    pub(crate) fn insert_weak(&mut self, id: u64, weak: v8::Weak<v8::Function>) {
        self.weak.insert(id, weak);
    }

    pub(crate) fn insert_resolver(&mut self, id: u64, resolver: v8::Global<v8::PromiseResolver>) {
        self.resolvers.insert(id, resolver);
    }

    fn take_resolver(&mut self, id: u64) -> Option<v8::Global<v8::PromiseResolver>> {
        self.resolvers.remove(&id)
    }

    pub(crate) fn release(&mut self, kind: PinKind, id: u64) {
        match kind {
            PinKind::Strong => {
                self.strong.remove(&id);
            }
            PinKind::Weak => {
                self.weak.remove(&id);
            }
            PinKind::Resolver => {
                self.resolvers.remove(&id);
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.strong.len() + self.weak.len() + self.resolvers.len()
    }

    pub(crate) fn clear(&mut self) -> usize {
        let count = self.len();
        if count > 0 {
            tracing::debug!(
                target: "jsbridge::runtime",
                strong = self.strong.len(),
                weak = self.weak.len(),
                promises = self.resolvers.len(),
                "releasing pinned values at shutdown"
            );
        }
        self.strong.clear();
        self.weak.clear();
        self.resolvers.clear();
        count
    }
}

/// Shared release-on-drop core of every token.
struct Pin {
    id: u64,
    kind: PinKind,
    runtime: RuntimeHandle,
}

impl Pin {
    fn new(id: u64, kind: PinKind, runtime: RuntimeHandle) -> Arc<Self> {
        Arc::new(Self { id, kind, runtime })
    }

    /// Reject tokens minted by another runtime.
    fn check_runtime(&self, cx: &BridgeScope<'_, '_>) -> Result<()> {
        if cx.state.runtime_id() == self.runtime.id() {
            return Ok(());
        }
        let actual = std::thread::current().id();
        let expected = self.runtime.owner_thread().unwrap_or(actual);
        Err(Error::thread_violation(expected, actual))
    }
}

impl Drop for Pin {
    fn drop(&mut self) {
        let (id, kind) = (self.id, self.kind);
        if let Some(state) = scope::current_state_for(self.runtime.id()) {
            if let Ok(mut pins) = state.pins.try_borrow_mut() {
                pins.release(kind, id);
                return;
            }
        }
        if self.runtime.is_running() {
            let _ = self.runtime.call_async(move |cx| {
                cx.state.pins.borrow_mut().release(kind, id);
            });
        }
    }
}

/// Strong pin of an arbitrary engine value.
#[derive(Clone)]
pub struct EngineRef {
    pin: Arc<Pin>,
}

impl EngineRef {
    pub(crate) fn new(id: u64, runtime: RuntimeHandle) -> Self {
        Self {
            pin: Pin::new(id, PinKind::Strong, runtime),
        }
    }

    pub fn id(&self) -> u64 {
        self.pin.id
    }

    pub fn runtime(&self) -> &RuntimeHandle {
        &self.pin.runtime
    }

    /// Materialize the value in `cx`.
    pub fn local<'s>(&self, cx: &mut BridgeScope<'_, 's>) -> Result<v8::Local<'s, v8::Value>> {
        self.pin.check_runtime(cx)?;
        let pins = cx.state.pins.borrow();
        let pin = pins
            .strong
            .get(&self.pin.id)
            .ok_or_else(|| Error::runtime(format!("Engine value {} was released", self.pin.id)))?;
        Ok(v8::Local::new(cx.scope, &pin.value))
    }

    pub fn is_promise(&self, cx: &mut BridgeScope<'_, '_>) -> Result<bool> {
        Ok(self.local(cx)?.is_promise())
    }
}

impl fmt::Debug for EngineRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineRef").field("id", &self.pin.id).finish()
    }
}

/// Callable token for a script function.
///
/// Holds the function strongly, plus the receiver it was read from when it
/// came out of an object property.
#[derive(Clone)]
pub struct JsFunction {
    pin: Arc<Pin>,
}

impl JsFunction {
    pub(crate) fn new(id: u64, runtime: RuntimeHandle) -> Self {
        Self {
            pin: Pin::new(id, PinKind::Strong, runtime),
        }
    }

    pub fn id(&self) -> u64 {
        self.pin.id
    }

    pub fn runtime(&self) -> &RuntimeHandle {
        &self.pin.runtime
    }

    pub(crate) fn locals<'s>(
        &self,
        cx: &mut BridgeScope<'_, 's>,
    ) -> Result<(v8::Local<'s, v8::Function>, v8::Local<'s, v8::Value>)> {
        self.pin.check_runtime(cx)?;
        let (function, receiver) = {
            let pins = cx.state.pins.borrow();
            let pin = pins
                .strong
                .get(&self.pin.id)
                .ok_or_else(|| Error::runtime(format!("Function {} was released", self.pin.id)))?;
            let function = v8::Local::new(&mut *cx.scope, &pin.value);
            let receiver = pin
                .receiver
                .as_ref()
                .map(|r| v8::Local::new(&mut *cx.scope, r));
            (function, receiver)
        };
        let function = v8::Local::<v8::Function>::try_from(function)
            .map_err(|_| Error::conversion("Pinned value is not a function"))?;
        let receiver = match receiver {
            Some(receiver) => receiver,
            None => v8::undefined(cx.scope).into(),
        };
        Ok((function, receiver))
    }

    /// Materialize the function in `cx`.
    pub fn local<'s>(&self, cx: &mut BridgeScope<'_, 's>) -> Result<v8::Local<'s, v8::Function>> {
        Ok(self.locals(cx)?.0)
    }

    /// Invoke on the execution thread that `cx` belongs to.
    pub fn call_in(&self, cx: &mut BridgeScope<'_, '_>, args: Vec<HostValue>) -> Result<HostValue> {
        let (function, receiver) = self.locals(cx)?;
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(cx.to_engine(arg)?);
        }
        let result = cx.call_function(function, receiver, &values)?;
        cx.to_host(result)
    }

    /// Invoke and block until the result is available.
    ///
    /// Runs immediately when already inside a callback on the execution thread.
    pub fn call(&self, args: Vec<HostValue>) -> Result<HostValue> {
        let this = self.clone();
        self.pin.runtime.call_sync(move |cx| this.call_in(cx, args))
    }

    /// Invoke and await the result.
    pub async fn call_future(&self, args: Vec<HostValue>) -> Result<HostValue> {
        let this = self.clone();
        self.pin.runtime.call(move |cx| this.call_in(cx, args)).await
    }

    /// Fire-and-forget invocation; errors thrown by the function are logged.
    pub fn call_async(&self, args: Vec<HostValue>) -> Result<()> {
        let this = self.clone();
        self.pin.runtime.call_async(move |cx| {
            if let Err(err) = this.call_in(cx, args) {
                report_callback_error("callback", &err);
            }
        })
    }

    /// Weak pin of the same function.
    pub fn downgrade(&self, cx: &mut BridgeScope<'_, '_>) -> Result<WeakCallback> {
        let function = self.local(cx)?;
        Ok(cx.pin_weak(function))
    }
}

impl fmt::Debug for JsFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsFunction").field("id", &self.pin.id).finish()
    }
}

/// Weak pin of a script function.
///
/// Does not keep the function alive. Every invocation checks liveness first
/// and silently skips a function the collector already reclaimed.
#[derive(Clone)]
pub struct WeakCallback {
    pin: Arc<Pin>,
}

impl WeakCallback {
    pub(crate) fn new(id: u64, runtime: RuntimeHandle) -> Self {
        Self {
            pin: Pin::new(id, PinKind::Weak, runtime),
        }
    }

    pub fn id(&self) -> u64 {
        self.pin.id
    }

    fn upgrade<'s>(&self, cx: &mut BridgeScope<'_, 's>) -> Result<Option<v8::Local<'s, v8::Function>>> {
        self.pin.check_runtime(cx)?;
        let pins = cx.state.pins.borrow();
        Ok(pins
            .weak
            .get(&self.pin.id)
            .and_then(|weak| weak.to_local(cx.scope)))
    }

    /// Whether the function is still reachable.
    pub fn is_alive(&self, cx: &mut BridgeScope<'_, '_>) -> bool {
        matches!(self.upgrade(cx), Ok(Some(_)))
    }

    /// Invoke if still alive; `Ok(None)` when the function was collected.
    pub fn call_in(&self, cx: &mut BridgeScope<'_, '_>, args: Vec<HostValue>) -> Result<Option<HostValue>> {
        let Some(function) = self.upgrade(cx)? else {
            tracing::trace!(target: "jsbridge::callback", id = self.pin.id, "weak callback collected, skipping");
            return Ok(None);
        };
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(cx.to_engine(arg)?);
        }
        let receiver = v8::undefined(cx.scope).into();
        let result = cx.call_function(function, receiver, &values)?;
        cx.to_host(result).map(Some)
    }
}

impl fmt::Debug for WeakCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakCallback").field("id", &self.pin.id).finish()
    }
}

/// Resolver of a promise handed to script, settled exactly once.
pub struct PendingPromise {
    pin: Arc<Pin>,
}

impl PendingPromise {
    pub(crate) fn new(id: u64, runtime: RuntimeHandle) -> Self {
        Self {
            pin: Pin::new(id, PinKind::Resolver, runtime),
        }
    }

    fn resolver<'s>(&self, cx: &mut BridgeScope<'_, 's>) -> Result<v8::Local<'s, v8::PromiseResolver>> {
        self.pin.check_runtime(cx)?;
        let global = cx
            .state
            .pins
            .borrow_mut()
            .take_resolver(self.pin.id)
            .ok_or_else(|| Error::runtime("Promise was already settled"))?;
        Ok(v8::Local::new(cx.scope, global))
    }

    pub fn resolve(self, cx: &mut BridgeScope<'_, '_>, value: HostValue) -> Result<()> {
        let resolver = self.resolver(cx)?;
        let value = match cx.to_engine(value) {
            Ok(value) => value,
            Err(err) => {
                let reason = cx.error_value(&err);
                resolver.reject(cx.scope, reason);
                return Err(err);
            }
        };
        resolver.resolve(cx.scope, value);
        Ok(())
    }

    pub fn reject(self, cx: &mut BridgeScope<'_, '_>, err: &Error) -> Result<()> {
        let resolver = self.resolver(cx)?;
        let reason = cx.error_value(err);
        resolver.reject(cx.scope, reason);
        Ok(())
    }

    /// Resolve with a value already living in the engine.
    pub fn resolve_value<'s>(self, cx: &mut BridgeScope<'_, 's>, value: v8::Local<'s, v8::Value>) -> Result<()> {
        let resolver = self.resolver(cx)?;
        resolver.resolve(cx.scope, value);
        Ok(())
    }

    /// Reject with a value already living in the engine.
    pub fn reject_value<'s>(self, cx: &mut BridgeScope<'_, 's>, reason: v8::Local<'s, v8::Value>) -> Result<()> {
        let resolver = self.resolver(cx)?;
        resolver.reject(cx.scope, reason);
        Ok(())
    }

    pub fn settle(self, cx: &mut BridgeScope<'_, '_>, result: Result<HostValue>) -> Result<()> {
        match result {
            Ok(value) => self.resolve(cx, value),
            Err(err) => self.reject(cx, &err),
        }
    }

    /// Settle from any thread by posting to the execution thread.
    pub fn settle_later(self, result: Result<HostValue>) -> Result<()> {
        let runtime = self.pin.runtime.clone();
        runtime.call_async(move |cx| {
            if let Err(err) = self.settle(cx, result) {
                tracing::debug!(target: "jsbridge::callback", %err, "promise settlement failed");
            }
        })
    }
}

impl fmt::Debug for PendingPromise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingPromise").field("id", &self.pin.id).finish()
    }
}

/// Log an error thrown by a script callback invoked from an async completion.
pub(crate) fn report_callback_error(source: &str, err: &Error) {
    match err.as_script() {
        Some(script) => tracing::error!(
            target: "jsbridge::callback",
            source,
            message = %script,
            stack = script.stack.as_deref().unwrap_or(""),
            "uncaught error in script callback"
        ),
        None => tracing::error!(target: "jsbridge::callback", source, %err, "script callback failed"),
    }
}
