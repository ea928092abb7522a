//! Thread-confined JavaScript runtime with a host value bridge.
//!
//! Each runtime owns a single V8 isolate running on a dedicated OS thread with
//! a Tokio event loop. Host code talks to it through [`RuntimeHandle`]; engine
//! values only ever exist inside a [`BridgeScope`] on that thread.

pub mod config;
pub mod console;
pub mod conversion;
pub mod facade;
pub mod fetch;
pub mod function;
pub mod handle;
pub mod pins;
pub mod reflect;
pub mod registry;
pub mod resources;
pub mod runner;
pub mod scope;
pub mod timers;
pub mod value;
pub mod watchdog;
pub mod websocket;

use once_cell::sync::OnceCell;

/// Process-wide V8 flag setup.
///
/// Flags must be set before the first isolate is created; `deno_core`
/// initializes the platform itself when the first `JsRuntime` is built.
static V8_FLAGS: OnceCell<()> = OnceCell::new();

/// Set V8 flags exactly once.
///
/// This function is safe to call multiple times; subsequent calls are no-ops.
pub fn initialize_v8_once() {
    V8_FLAGS.get_or_init(|| {
        // Enable GC exposure for testing and debugging
        deno_core::v8::V8::set_flags_from_string("--expose-gc");
    });
}

/// Check if the V8 flags have been applied.
pub fn is_v8_initialized() -> bool {
    V8_FLAGS.get().is_some()
}

// Re-export key types for convenience
pub use config::RuntimeConfig;
pub use facade::{HostObject, HostObjectRef, Member, MemberKind};
pub use fetch::{HttpRequest, HttpResponseHead, HttpSink, HttpTransport};
pub use function::HostFunction;
pub use handle::{Lifecycle, Runtime, RuntimeHandle, RuntimeServices};
pub use pins::{EngineRef, JsFunction, PendingPromise, WeakCallback};
pub use reflect::{HostClass, HostList, Reflected};
pub use registry::{CancelHook, OpHandle, OpKind, OperationRegistry, RegistryStats};
pub use resources::ResourceTable;
pub use scope::{BridgeScope, ThreadGuard};
pub use value::HostValue;
pub use websocket::{SocketConnection, SocketEvents, SocketMessage, SocketRequest, SocketTransport};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::init_tracing;
    use std::thread;

    #[test]
    fn test_v8_initialization() {
        initialize_v8_once();
        assert!(is_v8_initialized());

        // Should be safe to call again
        initialize_v8_once();
        assert!(is_v8_initialized());
    }

    #[test]
    fn test_runtime_lifecycle() {
        init_tracing();
        let config = RuntimeConfig::default();
        let runtime = Runtime::spawn(config).unwrap();

        assert!(!runtime.is_closed());

        // Evaluate some code
        let result = runtime.eval("40 + 2");
        assert_eq!(result.unwrap(), HostValue::Int(42));

        // Shutdown
        runtime.close().unwrap();
        assert!(runtime.is_closed());
    }

    #[test]
    fn test_multiple_runtimes_sequential() {
        for i in 0..3 {
            let config = RuntimeConfig::default();
            let runtime = Runtime::spawn(config).unwrap();

            let code = format!("{} * 2", i);
            let result = runtime.eval(&code);
            assert_eq!(result.unwrap(), HostValue::Int(i * 2));

            runtime.close().unwrap();
        }
    }

    #[test]
    fn test_concurrent_runtimes() {
        let mut runtimes = vec![];

        // Spawn multiple runtimes
        for _ in 0..3 {
            let config = RuntimeConfig::default();
            runtimes.push(Runtime::spawn(config).unwrap());
        }

        // Use them concurrently
        let mut threads = vec![];
        for (i, runtime) in runtimes.into_iter().enumerate() {
            let t = thread::spawn(move || {
                let code = format!("{} + 100", i);
                let result = runtime.eval(&code);
                assert_eq!(result.unwrap(), HostValue::from(i + 100));
            });
            threads.push(t);
        }

        // Wait for all threads
        for t in threads {
            t.join().unwrap();
        }
    }

    #[test]
    fn test_runtime_with_heap_limits() {
        let config = RuntimeConfig::new()
            .with_max_heap_size(10 * 1024 * 1024) // 10 MB
            .with_initial_heap_size(1024 * 1024); // 1 MB

        let runtime = Runtime::spawn(config).unwrap();

        let result = runtime.eval("'hello'");
        assert_eq!(result.unwrap(), HostValue::from("hello"));
    }

    #[test]
    fn test_invalid_config_rejected_at_spawn() {
        let config = RuntimeConfig::new().with_initial_heap_size(1024);
        let err = Runtime::spawn(config).unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }

    #[test]
    fn test_runtime_with_bootstrap() {
        let config = RuntimeConfig::new().with_bootstrap("globalThis.VERSION = '1.0.0';");

        let runtime = Runtime::spawn(config).unwrap();

        let result = runtime.eval("globalThis.VERSION");
        assert_eq!(result.unwrap(), HostValue::from("1.0.0"));
    }

    #[test]
    fn test_failing_bootstrap_reports_script_error() {
        let config = RuntimeConfig::new().with_bootstrap("throw new Error('bad bootstrap')");
        let err = Runtime::spawn(config).unwrap_err();
        assert_eq!(err.as_script().map(|s| s.message.as_str()), Some("bad bootstrap"));
    }

    #[test]
    fn test_runtime_state_persistence() {
        let config = RuntimeConfig::default();
        let runtime = Runtime::spawn(config).unwrap();

        // Set a variable
        let result1 = runtime.eval("var counter = 0; counter");
        assert_eq!(result1.unwrap(), HostValue::Int(0));

        // Increment it
        let result2 = runtime.eval("++counter");
        assert_eq!(result2.unwrap(), HostValue::Int(1));

        // Verify persistence
        let result3 = runtime.eval("counter");
        assert_eq!(result3.unwrap(), HostValue::Int(1));
    }

    #[test]
    fn test_work_runs_in_submission_order() {
        let runtime = Runtime::spawn(RuntimeConfig::default()).unwrap();
        runtime.eval("globalThis.log = []").unwrap();
        for i in 0..20 {
            runtime
                .call_async(move |cx| {
                    let code = format!("log.push({})", i);
                    let _ = cx.run_script(&code);
                })
                .unwrap();
        }
        let log = runtime.eval("log.join(',')").unwrap();
        let expected: Vec<String> = (0..20).map(|i| i.to_string()).collect();
        assert_eq!(log, HostValue::from(expected.join(",")));
    }

    #[test]
    fn test_microtasks_run_after_each_item() {
        let runtime = Runtime::spawn(RuntimeConfig::default()).unwrap();
        runtime
            .eval("globalThis.flag = 'pending'; Promise.resolve().then(() => { flag = 'done'; })")
            .unwrap();
        assert_eq!(runtime.eval("flag").unwrap(), HostValue::from("done"));
    }
}
