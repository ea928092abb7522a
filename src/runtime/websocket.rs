//! WebSocket surface backed by a host [`SocketTransport`].
//!
//! A connection attempt registers an `OpKind::WebSocket` handle and stores the
//! transport's [`SocketConnection`] in the runtime's resource table under that
//! handle. Transport events are posted to a weakly pinned dispatch function of
//! the script-side socket; the first terminal event (`close`, or a failed
//! connection) removes the resource and the handle exactly once.
//!
//! The script-side `WebSocket` object keeps its dispatch function alive and
//! is itself kept reachable by bootstrap code until its close event.

use crate::error::{Error, Result};
use crate::runtime::function::HostFunction;
use crate::runtime::handle::RuntimeHandle;
use crate::runtime::pins::{report_callback_error, WeakCallback};
use crate::runtime::registry::{OpHandle, OpKind};
use crate::runtime::resources::ResourceTable;
use crate::runtime::scope::BridgeScope;
use crate::runtime::value::HostValue;
use deno_core::v8;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Close code reported when a connection fails or drops abnormally.
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Close code sent to the peer when the runtime shuts down.
pub const CLOSE_GOING_AWAY: u16 = 1001;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketRequest {
    pub url: String,
    pub protocols: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketMessage {
    Text(String),
    Binary(Vec<u8>),
}

impl SocketMessage {
    fn into_value(self) -> HostValue {
        match self {
            SocketMessage::Text(text) => HostValue::String(text),
            SocketMessage::Binary(bytes) => HostValue::Bytes(bytes),
        }
    }
}

/// An open connection owned by the runtime's resource table.
pub trait SocketConnection: Send + 'static {
    fn send(&mut self, message: SocketMessage) -> Result<()>;

    /// Start the closing handshake. Completion is reported through
    /// [`SocketEvents::closed`].
    fn close(&mut self, code: u16, reason: &str) -> Result<()>;
}

/// Host-provided WebSocket client.
pub trait SocketTransport: Send + Sync + 'static {
    /// Begin connecting. An `Err` is reported to script as a failed
    /// connection, not thrown.
    fn connect(&self, request: SocketRequest, events: SocketEvents) -> Result<Box<dyn SocketConnection>>;
}

enum SocketEvent {
    Open(String),
    Message(SocketMessage),
    Error(String),
    Close { code: u16, reason: String, clean: bool },
    Failed(String),
}

impl SocketEvent {
    fn is_terminal(&self) -> bool {
        matches!(self, SocketEvent::Close { .. } | SocketEvent::Failed(_))
    }
}

fn close_value(code: u16, reason: String, clean: bool) -> HostValue {
    HostValue::object([
        ("code", HostValue::from(u32::from(code))),
        ("reason", HostValue::from(reason)),
        ("wasClean", HostValue::Bool(clean)),
    ])
}

struct EventsShared {
    runtime: RuntimeHandle,
    op: OpHandle,
    connections: ResourceTable<Box<dyn SocketConnection>>,
    dispatch: WeakCallback,
    finished: AtomicBool,
}

/// Event channel from a [`SocketTransport`] back into script.
///
/// Cheap to clone and usable from any thread. Everything after the first
/// terminal event is ignored and reported as `false`.
#[derive(Clone)]
pub struct SocketEvents {
    shared: Arc<EventsShared>,
}

impl SocketEvents {
    pub fn op(&self) -> OpHandle {
        self.shared.op
    }

    pub fn is_open(&self) -> bool {
        !self.shared.finished.load(Ordering::SeqCst) && self.shared.runtime.registry().contains(self.shared.op)
    }

    /// Handshake completed; `protocol` is the negotiated subprotocol.
    pub fn opened(&self, protocol: impl Into<String>) -> bool {
        self.post(SocketEvent::Open(protocol.into()))
    }

    pub fn message(&self, message: SocketMessage) -> bool {
        self.post(SocketEvent::Message(message))
    }

    /// Non-terminal error; a `closed` call is expected to follow.
    pub fn error(&self, message: impl Into<String>) -> bool {
        self.post(SocketEvent::Error(message.into()))
    }

    /// Connection closed. Terminal.
    pub fn closed(&self, code: u16, reason: impl Into<String>, clean: bool) -> bool {
        self.post(SocketEvent::Close {
            code,
            reason: reason.into(),
            clean,
        })
    }

    /// Connection failed before or after opening. Terminal; script sees an
    /// `error` event followed by an abnormal `close`.
    pub fn failed(&self, message: impl Into<String>) -> bool {
        self.post(SocketEvent::Failed(message.into()))
    }

    fn post(&self, event: SocketEvent) -> bool {
        let shared = &self.shared;
        let terminal = event.is_terminal();
        if terminal {
            if shared.finished.swap(true, Ordering::SeqCst) {
                return false;
            }
        } else if shared.finished.load(Ordering::SeqCst) {
            return false;
        }
        let op = shared.op;
        if !shared.runtime.registry().contains(op) {
            return false;
        }

        let dispatch = shared.dispatch.clone();
        let connections = shared.connections.clone();
        let posted = shared.runtime.call_async(move |cx| {
            if !cx.registry().contains(op) {
                return;
            }
            // The connection goes first so `send` from a close handler fails;
            // the handle stays registered until the handlers have run.
            if terminal {
                drop(connections.take(op));
            }
            let calls = match event {
                SocketEvent::Open(protocol) => vec![("open", HostValue::from(protocol))],
                SocketEvent::Message(message) => vec![("message", message.into_value())],
                SocketEvent::Error(message) => vec![("error", HostValue::from(message))],
                SocketEvent::Close { code, reason, clean } => vec![("close", close_value(code, reason, clean))],
                SocketEvent::Failed(message) => vec![
                    ("error", HostValue::from(message)),
                    ("close", close_value(CLOSE_ABNORMAL, String::new(), false)),
                ],
            };
            for (kind, payload) in calls {
                if let Err(err) = dispatch.call_in(cx, vec![HostValue::from(kind), payload]) {
                    report_callback_error("websocket", &err);
                }
            }
            if terminal {
                cx.registry().unregister(op);
                tracing::debug!(target: "jsbridge::runtime", %op, "WebSocket finished");
            }
        });
        if posted.is_err() && terminal {
            drop(shared.connections.take(op));
            shared.runtime.registry().unregister(op);
        }
        posted.is_ok()
    }
}

impl fmt::Debug for SocketEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketEvents")
            .field("op", &self.shared.op)
            .field("finished", &self.shared.finished.load(Ordering::SeqCst))
            .finish()
    }
}

fn op_arg(cx: &BridgeScope<'_, '_>, arg: v8::Local<'_, v8::Value>) -> Result<OpHandle> {
    let op = v8::Local::<v8::Number>::try_from(arg)
        .ok()
        .map(|n| OpHandle::from_raw(n.value() as u64))
        .ok_or_else(|| Error::conversion("Socket id must be a number"))?;
    match cx.registry().require(op)? {
        OpKind::WebSocket => Ok(op),
        _ => Err(Error::HandleNotFound(op)),
    }
}

fn parse_protocols(value: HostValue) -> Result<Vec<String>> {
    match value {
        HostValue::Null => Ok(Vec::new()),
        HostValue::String(protocol) => Ok(vec![protocol]),
        HostValue::Array(items) => items
            .into_iter()
            .map(|item| match item {
                HostValue::String(protocol) => Ok(protocol),
                other => Err(Error::conversion(format!(
                    "WebSocket protocols must be strings, got {}",
                    other.type_name()
                ))),
            })
            .collect(),
        other => Err(Error::conversion(format!(
            "WebSocket protocols must be a string or array, got {}",
            other.type_name()
        ))),
    }
}

fn socket_connect() -> HostFunction {
    HostFunction::with_scope("socketConnect", 3, |cx, args| {
        let url = match cx.to_host(args[0])? {
            HostValue::String(url) => url,
            other => {
                return Err(Error::conversion(format!(
                    "WebSocket URL must be a string, got {}",
                    other.type_name()
                )))
            }
        };
        let protocols = parse_protocols(cx.to_host(args[1])?)?;
        let dispatch = v8::Local::<v8::Function>::try_from(args[2])
            .map_err(|_| Error::conversion("WebSocket dispatch must be a function"))?;
        let transport = cx
            .state
            .services
            .sockets
            .clone()
            .ok_or_else(|| Error::transport("No WebSocket transport configured"))?;

        let registry = cx.registry().clone();
        let connections = cx.state.sockets.clone();
        let op = registry.register(OpKind::WebSocket);
        let events = SocketEvents {
            shared: Arc::new(EventsShared {
                runtime: cx.handle().clone(),
                op,
                connections: connections.clone(),
                dispatch: cx.pin_weak(dispatch),
                finished: AtomicBool::new(false),
            }),
        };

        let request = SocketRequest {
            url: url.clone(),
            protocols,
        };
        match transport.connect(request, events.clone()) {
            Ok(connection) => {
                connections.insert(op, connection);
                let shared: Weak<EventsShared> = Arc::downgrade(&events.shared);
                registry.set_cancel_hook(
                    op,
                    Box::new(move || {
                        if let Some(shared) = shared.upgrade() {
                            shared.finished.store(true, Ordering::SeqCst);
                        }
                        if let Some(mut connection) = connections.take(op) {
                            if let Err(err) = connection.close(CLOSE_GOING_AWAY, "") {
                                tracing::debug!(target: "jsbridge::runtime", %op, %err, "WebSocket close on cancel failed");
                            }
                        }
                    }),
                );
                tracing::debug!(target: "jsbridge::runtime", %op, %url, "WebSocket connecting");
            }
            Err(err) => {
                tracing::debug!(target: "jsbridge::runtime", %op, %url, %err, "WebSocket connect failed");
                events.failed(err.to_string());
            }
        }
        Ok(v8::Number::new(cx.scope, op.as_raw() as f64).into())
    })
}

fn socket_send() -> HostFunction {
    HostFunction::with_scope("socketSend", 2, |cx, args| {
        let op = op_arg(cx, args[0])?;
        let message = match cx.to_host(args[1])? {
            HostValue::String(text) => SocketMessage::Text(text),
            HostValue::Bytes(bytes) => SocketMessage::Binary(bytes),
            other => SocketMessage::Text(other.display_string()),
        };
        cx.state.sockets.with(op, |connection| connection.send(message))??;
        Ok(v8::undefined(cx.scope).into())
    })
}

fn socket_close() -> HostFunction {
    HostFunction::with_scope("socketClose", 3, |cx, args| {
        // Closing a finished socket is a no-op.
        if let Ok(op) = op_arg(cx, args[0]) {
            let code = match cx.to_host(args[1])? {
                HostValue::Null => 1000,
                value => value
                    .as_i64()
                    .and_then(|code| u16::try_from(code).ok())
                    .ok_or_else(|| Error::conversion("Close code must be an integer"))?,
            };
            let reason = match cx.to_host(args[2])? {
                HostValue::Null => String::new(),
                value => value.display_string(),
            };
            cx.state.sockets.with(op, |connection| connection.close(code, &reason))??;
        }
        Ok(v8::undefined(cx.scope).into())
    })
}

pub(crate) fn install(cx: &mut BridgeScope<'_, '_>) -> Result<()> {
    cx.set_native(socket_connect())?;
    cx.set_native(socket_send())?;
    cx.set_native(socket_close())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::handle::{Runtime, RuntimeServices};
    use crate::runtime::RuntimeConfig;
    use crate::test_support::init_tracing;
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;

    /// Echoes every message back from a helper thread.
    #[derive(Clone, Default)]
    struct EchoSockets {
        closes: Arc<Mutex<Vec<(u16, String)>>>,
        requests: Arc<Mutex<Vec<SocketRequest>>>,
    }

    struct EchoConnection {
        events: SocketEvents,
        closes: Arc<Mutex<Vec<(u16, String)>>>,
    }

    impl SocketConnection for EchoConnection {
        fn send(&mut self, message: SocketMessage) -> Result<()> {
            let events = self.events.clone();
            thread::spawn(move || {
                events.message(message);
            });
            Ok(())
        }

        fn close(&mut self, code: u16, reason: &str) -> Result<()> {
            self.closes.lock().unwrap().push((code, reason.to_string()));
            let events = self.events.clone();
            let reason = reason.to_string();
            thread::spawn(move || {
                events.closed(code, reason, true);
            });
            Ok(())
        }
    }

    impl SocketTransport for EchoSockets {
        fn connect(&self, request: SocketRequest, events: SocketEvents) -> Result<Box<dyn SocketConnection>> {
            let protocol = request.protocols.first().cloned().unwrap_or_default();
            self.requests.lock().unwrap().push(request);
            let opener = events.clone();
            thread::spawn(move || {
                opener.opened(protocol);
            });
            Ok(Box::new(EchoConnection {
                events,
                closes: self.closes.clone(),
            }))
        }
    }

    struct Refusing;

    impl SocketTransport for Refusing {
        fn connect(&self, _request: SocketRequest, _events: SocketEvents) -> Result<Box<dyn SocketConnection>> {
            Err(Error::transport("connection refused"))
        }
    }

    fn spawn_with(transport: impl SocketTransport) -> Runtime {
        init_tracing();
        Runtime::spawn_with(RuntimeConfig::default(), RuntimeServices::new().with_sockets(transport)).unwrap()
    }

    fn wait_for(runtime: &Runtime, expr: &str) -> HostValue {
        for _ in 0..200 {
            let value = runtime.eval(expr).unwrap();
            if value != HostValue::Null {
                return value;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("timed out waiting for {expr}");
    }

    #[test]
    fn test_lifecycle_open_echo_close() {
        let transport = EchoSockets::default();
        let closes = transport.closes.clone();
        let requests = transport.requests.clone();
        let runtime = spawn_with(transport);
        runtime
            .eval(
                "globalThis.log = []; globalThis.done = null;
                 const ws = new WebSocket('wss://example.test/chat', ['v1']);
                 ws.onopen = () => { log.push('open:' + ws.protocol + ':' + ws.readyState); ws.send('hi'); };
                 ws.addEventListener('message', e => { log.push('message:' + e.data); ws.close(1000, 'bye'); });
                 ws.onclose = e => { log.push('close:' + e.code + ':' + e.reason + ':' + e.wasClean); done = ws.readyState; };",
            )
            .unwrap();

        assert_eq!(wait_for(&runtime, "done"), HostValue::Int(3));
        assert_eq!(
            runtime.eval("log.join(',')").unwrap(),
            HostValue::from("open:v1:1,message:hi,close:1000:bye:true")
        );
        assert!(runtime.wait_idle(Duration::from_secs(5)));
        assert_eq!(closes.lock().unwrap().as_slice(), &[(1000, "bye".to_string())]);
        assert_eq!(requests.lock().unwrap()[0].protocols, vec!["v1".to_string()]);
        assert!(runtime.call_sync(|cx| Ok(cx.state.sockets.is_empty())).unwrap());
    }

    #[test]
    fn test_binary_messages_arrive_as_bytes() {
        let runtime = spawn_with(EchoSockets::default());
        runtime
            .eval(
                "globalThis.got = null;
                 const ws = new WebSocket('wss://example.test/bin');
                 ws.onopen = () => ws.send(new Uint8Array([1, 2, 3]));
                 ws.onmessage = e => { got = ws.binaryType + ':' + (e.data instanceof Uint8Array) + ':' + e.data.join('-'); ws.close(); };",
            )
            .unwrap();
        assert_eq!(wait_for(&runtime, "got"), HostValue::from("uint8array:true:1-2-3"));
        assert!(runtime.wait_idle(Duration::from_secs(5)));
    }

    #[test]
    fn test_send_after_close_throws_handle_not_found() {
        let runtime = spawn_with(EchoSockets::default());
        runtime
            .eval(
                "globalThis.code = null;
                 const ws = new WebSocket('wss://example.test/');
                 ws.onopen = () => ws.close();
                 ws.onclose = () => { try { ws.send('late'); code = 'sent'; } catch (e) { code = e.code; } };",
            )
            .unwrap();
        assert_eq!(wait_for(&runtime, "code"), HostValue::from("ERR_HANDLE_NOT_FOUND"));
        assert_eq!(runtime.pending_ops(), 0);
    }

    #[test]
    fn test_failed_connection_reports_error_then_close() {
        let runtime = spawn_with(Refusing);
        runtime
            .eval(
                "globalThis.log = []; globalThis.done = null;
                 const ws = new WebSocket('wss://example.test/');
                 ws.onerror = e => log.push('error:' + e.message);
                 ws.onclose = e => { log.push('close:' + e.code + ':' + e.wasClean); done = true; };",
            )
            .unwrap();
        assert_eq!(wait_for(&runtime, "done"), HostValue::Bool(true));
        assert_eq!(
            runtime.eval("log.join(',')").unwrap(),
            HostValue::from("error:Transport error: connection refused,close:1006:false")
        );
        assert_eq!(runtime.pending_ops(), 0);
    }

    #[test]
    fn test_events_after_close_are_ignored() {
        let runtime = spawn_with(Refusing);
        let events = runtime
            .call_sync(|cx| {
                let dispatch = cx.run_script("(function () {})")?;
                let dispatch = v8::Local::<v8::Function>::try_from(dispatch)
                    .map_err(|_| Error::conversion("not a function"))?;
                let op = cx.registry().register(OpKind::WebSocket);
                Ok(SocketEvents {
                    shared: Arc::new(EventsShared {
                        runtime: cx.handle().clone(),
                        op,
                        connections: cx.state.sockets.clone(),
                        dispatch: cx.pin_weak(dispatch),
                        finished: AtomicBool::new(false),
                    }),
                })
            })
            .unwrap();
        assert!(events.is_open());
        assert!(events.closed(1000, "", true));
        assert!(!events.closed(1000, "", true));
        assert!(!events.message(SocketMessage::Text("late".into())));
        assert!(runtime.wait_idle(Duration::from_secs(5)));
        assert!(!events.is_open());
    }

    #[test]
    fn test_runtime_close_closes_open_sockets() {
        let transport = EchoSockets::default();
        let closes = transport.closes.clone();
        let runtime = spawn_with(transport);
        runtime
            .eval("globalThis.opened = null; const ws = new WebSocket('wss://example.test/'); ws.onopen = () => { opened = true; };")
            .unwrap();
        assert_eq!(wait_for(&runtime, "opened"), HostValue::Bool(true));
        assert_eq!(runtime.registry().count_kind(OpKind::WebSocket), 1);

        runtime.close().unwrap();
        assert_eq!(closes.lock().unwrap().as_slice(), &[(CLOSE_GOING_AWAY, String::new())]);
    }

    #[test]
    fn test_missing_transport_throws() {
        init_tracing();
        let runtime = Runtime::spawn(RuntimeConfig::default()).unwrap();
        let code = runtime
            .eval("try { new WebSocket('wss://example.test/'); 'no' } catch (e) { e.code }")
            .unwrap();
        assert_eq!(code, HostValue::from("ERR_TRANSPORT"));
        assert_eq!(runtime.pending_ops(), 0);
    }

    #[test]
    fn test_parse_protocols() {
        assert_eq!(parse_protocols(HostValue::Null).unwrap(), Vec::<String>::new());
        assert_eq!(parse_protocols(HostValue::from("a")).unwrap(), vec!["a".to_string()]);
        assert!(parse_protocols(HostValue::Array(vec![HostValue::Int(1)])).is_err());
    }
}
