//! Execution thread backed by `deno_core::JsRuntime`.
//!
//! This module hosts the JavaScript engine on a dedicated OS thread with a
//! single-threaded Tokio runtime. Work from other threads is forwarded through
//! [`RuntimeCommand`] and executed sequentially on that thread; background
//! tasks (timers, async host functions) share the same executor and re-enter
//! the engine only through the queue.

use crate::error::{Error, Result};
use crate::runtime::config::RuntimeConfig;
use crate::runtime::handle::{Lifecycle, RuntimeHandle, RuntimeServices};
use crate::runtime::scope::{self, BridgeScope, BridgeState, StateOptions};
use crate::runtime::watchdog::Watchdog;
use crate::runtime::{console, fetch, initialize_v8_once, timers, websocket};
use deno_core::{v8, JsRuntime, RuntimeOptions};
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::mpsc::Receiver as StdReceiver;
use std::sync::mpsc::Sender as StdSender;
use std::thread;
use tokio::sync::mpsc;

type InitSignalChannel = (StdSender<Result<()>>, StdReceiver<Result<()>>);

/// Unit of work executed on the execution thread.
pub(crate) type Job = Box<dyn FnOnce(&mut BridgeScope<'_, '_>) + Send>;

/// Commands sent to the execution thread.
pub(crate) enum RuntimeCommand {
    Work(Job),
    Shutdown { responder: StdSender<()> },
}

const BOOTSTRAP_JS: &str = include_str!("js/bootstrap.js");

pub(crate) fn spawn_runtime_thread(config: RuntimeConfig, services: RuntimeServices) -> Result<RuntimeHandle> {
    config.validate()?;

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<RuntimeCommand>();
    let (init_tx, init_rx): InitSignalChannel = std::sync::mpsc::channel();
    let handle = RuntimeHandle::new(cmd_tx, &config);
    let thread_handle = handle.clone();

    let thread = thread::Builder::new()
        .name(config.thread_name.clone())
        .spawn(move || {
            let tokio_rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(err) => {
                    let _ = init_tx.send(Err(Error::runtime(format!("Failed to build executor: {}", err))));
                    return;
                }
            };
            let _enter = tokio_rt.enter();

            let mut core = match RuntimeCore::new(config, services, thread_handle.clone()) {
                Ok(core) => {
                    let _ = init_tx.send(Ok(()));
                    core
                }
                Err(err) => {
                    scope::clear_current();
                    thread_handle.set_lifecycle(Lifecycle::Closed);
                    let _ = init_tx.send(Err(err));
                    return;
                }
            };

            tokio_rt.block_on(core.run(cmd_rx));
            drop(core);
            thread_handle.set_lifecycle(Lifecycle::Closed);
        })
        .map_err(|e| Error::runtime(format!("Failed to spawn runtime thread: {}", e)))?;
    handle.set_thread(thread);

    match init_rx.recv() {
        Ok(Ok(())) => {
            tracing::debug!(target: "jsbridge::runtime", id = handle.id(), "runtime started");
            Ok(handle)
        }
        Ok(Err(err)) => {
            let _ = handle.close();
            Err(err)
        }
        Err(_) => Err(Error::runtime("Runtime thread initialization failed")),
    }
}

struct RuntimeCore {
    // Dropped before the isolate.
    state: Rc<BridgeState>,
    js_runtime: JsRuntime,
}

impl RuntimeCore {
    fn new(config: RuntimeConfig, services: RuntimeServices, handle: RuntimeHandle) -> Result<Self> {
        initialize_v8_once();

        let RuntimeConfig {
            max_heap_size,
            initial_heap_size,
            execution_timeout,
            bootstrap_script,
            enable_console,
            thread_name,
            max_conversion_depth,
            max_conversion_bytes,
            ..
        } = config;

        let create_params = match (max_heap_size, initial_heap_size) {
            (Some(max), initial) => {
                let initial_bytes = initial.unwrap_or(0);
                Some(v8::CreateParams::default().heap_limits(initial_bytes, max))
            }
            (None, _) => None,
        };

        let mut js_runtime = JsRuntime::new(RuntimeOptions {
            create_params,
            ..Default::default()
        });

        let isolate = js_runtime.v8_isolate().thread_safe_handle();
        handle.bind(thread::current().id(), isolate.clone());

        let watchdog = match execution_timeout {
            Some(timeout) => Some(
                Watchdog::spawn(isolate, timeout, &thread_name)
                    .map_err(|e| Error::runtime(format!("Failed to spawn watchdog: {}", e)))?,
            ),
            None => None,
        };

        let context = js_runtime.main_context();
        let state = Rc::new(BridgeState::new(
            handle.clone(),
            StateOptions {
                context,
                services,
                watchdog,
                console_enabled: enable_console,
                max_depth: max_conversion_depth,
                max_bytes: max_conversion_bytes,
            },
        ));
        scope::set_current(state.clone());

        let mut core = Self { state, js_runtime };
        let installed = core.with_scope(|cx| -> Result<()> {
            console::install(cx)?;
            timers::install(cx)?;
            fetch::install(cx)?;
            websocket::install(cx)?;
            cx.run_script(BOOTSTRAP_JS)?;
            if let Some(script) = &bootstrap_script {
                cx.run_script(script)?;
            }
            cx.run_microtasks();
            Ok(())
        });
        if let Err(err) = installed {
            core.state.clear();
            scope::clear_current();
            return Err(err);
        }

        handle.set_lifecycle(Lifecycle::Running);
        Ok(core)
    }

    fn with_scope<R>(&mut self, f: impl FnOnce(&mut BridgeScope<'_, '_>) -> R) -> R {
        let state = self.state.clone();
        let scope = &mut self.js_runtime.handle_scope();
        scope::enter(scope, |scope| {
            let mut cx = BridgeScope::new(scope, state);
            f(&mut cx)
        })
    }

    async fn run(&mut self, mut rx: mpsc::UnboundedReceiver<RuntimeCommand>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                RuntimeCommand::Work(job) => self.run_job(job),
                RuntimeCommand::Shutdown { responder } => {
                    self.shutdown();
                    let _ = responder.send(());
                    break;
                }
            }
        }
    }

    fn run_job(&mut self, job: Job) {
        self.with_scope(|cx| {
            if panic::catch_unwind(AssertUnwindSafe(|| job(cx))).is_err() {
                tracing::error!(target: "jsbridge::runtime", "work item panicked");
            }
            cx.run_microtasks();
        });
    }

    fn shutdown(&mut self) {
        let cancelled = self.state.registry.cancel_all();
        let released = self.state.clear();
        if released > 0 || cancelled > 0 {
            tracing::debug!(
                target: "jsbridge::runtime",
                released,
                cancelled,
                "released bridge state at shutdown"
            );
        }
        scope::clear_current();
        self.state.handle.set_lifecycle(Lifecycle::Closed);
    }
}
