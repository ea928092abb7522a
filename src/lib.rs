//! Embed a V8 engine behind a thread-confined value bridge.
//!
//! A [`Runtime`] owns one isolate on a dedicated thread. Host code exchanges
//! [`HostValue`]s with script, exposes live host objects and functions, and
//! drives timers, streaming HTTP and WebSockets through host-provided
//! transports. Every outstanding asynchronous operation is tracked in the
//! runtime's [`OperationRegistry`] until its terminal event.
//!
//! ```no_run
//! use jsbridge::{HostFunction, HostValue, Runtime, RuntimeConfig};
//!
//! let runtime = Runtime::spawn(RuntimeConfig::default())?;
//! runtime.register_function(HostFunction::new("double", 1, |args| {
//!     Ok(HostValue::from(args[0].as_i64().unwrap_or(0) * 2))
//! }))?;
//! assert_eq!(runtime.eval("double(21)")?, HostValue::Int(42));
//! # Ok::<(), jsbridge::Error>(())
//! ```

pub mod error;
pub mod runtime;

#[cfg(test)]
mod test_support;

pub use error::{Error, Result, ScriptError};
pub use runtime::{
    BridgeScope, CancelHook, EngineRef, HostClass, HostFunction, HostList, HostObject, HostObjectRef,
    HostValue, HttpRequest, HttpResponseHead, HttpSink, HttpTransport, JsFunction, Lifecycle, Member,
    MemberKind, OpHandle, OpKind, OperationRegistry, PendingPromise, Reflected, ResourceTable, Runtime,
    RuntimeConfig, RuntimeHandle, RuntimeServices, SocketConnection, SocketEvents, SocketMessage,
    SocketRequest, SocketTransport, ThreadGuard, WeakCallback,
};
