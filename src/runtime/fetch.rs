//! Streaming HTTP surface behind `fetch` and `fetchStream`.
//!
//! The runtime performs no network I/O itself. Requests are handed to the
//! [`HttpTransport`] supplied in [`RuntimeServices`](crate::runtime::RuntimeServices),
//! which reports progress through an [`HttpSink`] from any thread. Each
//! request owns one `OpKind::Http` handle from start until its terminal event
//! (a zero-length chunk or an error) has been delivered to script.

use crate::error::{Error, Result};
use crate::runtime::function::HostFunction;
use crate::runtime::handle::RuntimeHandle;
use crate::runtime::pins::{report_callback_error, JsFunction};
use crate::runtime::registry::{CancelHook, OpHandle, OpKind};
use crate::runtime::scope::BridgeScope;
use crate::runtime::value::HostValue;
use deno_core::v8;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Request as assembled by script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Status line and headers of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponseHead {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    /// Final URL after redirects.
    pub url: String,
}

impl HttpResponseHead {
    pub fn new(status: u16, url: impl Into<String>) -> Self {
        Self {
            status,
            status_text: String::new(),
            headers: Vec::new(),
            url: url.into(),
        }
    }

    pub fn with_status_text(mut self, text: impl Into<String>) -> Self {
        self.status_text = text.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    fn into_value(self) -> HostValue {
        let headers = self
            .headers
            .into_iter()
            .map(|(name, value)| HostValue::Array(vec![HostValue::from(name), HostValue::from(value)]))
            .collect::<Vec<_>>();
        HostValue::object([
            ("status", HostValue::from(u32::from(self.status))),
            ("statusText", HostValue::from(self.status_text)),
            ("headers", HostValue::Array(headers)),
            ("url", HostValue::from(self.url)),
        ])
    }
}

/// Host-provided HTTP client.
///
/// `start` must not block; it hands the request to the client and returns.
/// The returned hook, if any, runs when the request is cancelled (by script or
/// because the runtime is closing).
pub trait HttpTransport: Send + Sync + 'static {
    fn start(&self, request: HttpRequest, sink: HttpSink) -> Result<Option<CancelHook>>;
}

enum HttpEvent {
    Head(HttpResponseHead),
    Chunk(Vec<u8>),
    End,
    Error(String),
}

impl HttpEvent {
    fn is_terminal(&self) -> bool {
        matches!(self, HttpEvent::End | HttpEvent::Error(_))
    }

    fn into_args(self) -> Vec<HostValue> {
        match self {
            HttpEvent::Head(head) => vec![HostValue::from("head"), head.into_value()],
            HttpEvent::Chunk(bytes) => vec![HostValue::from("chunk"), HostValue::Bytes(bytes)],
            HttpEvent::End => vec![HostValue::from("end"), HostValue::Bytes(Vec::new())],
            HttpEvent::Error(message) => vec![HostValue::from("error"), HostValue::from(message)],
        }
    }
}

struct SinkShared {
    runtime: RuntimeHandle,
    op: OpHandle,
    finished: AtomicBool,
    callback: Mutex<Option<JsFunction>>,
}

impl SinkShared {
    fn callback(&self, take: bool) -> Option<JsFunction> {
        let mut slot = self.callback.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if take {
            slot.take()
        } else {
            slot.clone()
        }
    }

    /// Drop the script callback without delivering anything.
    fn release(&self) {
        self.finished.store(true, Ordering::SeqCst);
        drop(self.callback(true));
    }
}

impl Drop for SinkShared {
    fn drop(&mut self) {
        if *self.finished.get_mut() {
            return;
        }
        let callback = self
            .callback
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(callback) = callback {
            tracing::warn!(target: "jsbridge::runtime", op = %self.op, "HTTP transport dropped an unfinished request");
            deliver(
                &self.runtime,
                self.op,
                callback,
                HttpEvent::Error("HTTP transport dropped the request".into()),
            );
        }
    }
}

/// Delivery channel from an [`HttpTransport`] back into script.
///
/// Cheap to clone and usable from any thread. Events after the first
/// terminal event, or after the request was cancelled, are dropped and the
/// method returns `false`.
#[derive(Clone)]
pub struct HttpSink {
    shared: Arc<SinkShared>,
}

impl HttpSink {
    fn new(runtime: RuntimeHandle, op: OpHandle, callback: JsFunction) -> Self {
        Self {
            shared: Arc::new(SinkShared {
                runtime,
                op,
                finished: AtomicBool::new(false),
                callback: Mutex::new(Some(callback)),
            }),
        }
    }

    pub fn op(&self) -> OpHandle {
        self.shared.op
    }

    /// Whether script still wants events for this request.
    pub fn is_open(&self) -> bool {
        !self.shared.finished.load(Ordering::SeqCst) && self.shared.runtime.registry().contains(self.shared.op)
    }

    pub fn head(&self, head: HttpResponseHead) -> bool {
        self.post(HttpEvent::Head(head))
    }

    /// Body chunk. An empty chunk completes the response.
    pub fn chunk(&self, bytes: Vec<u8>) -> bool {
        if bytes.is_empty() {
            self.post(HttpEvent::End)
        } else {
            self.post(HttpEvent::Chunk(bytes))
        }
    }

    pub fn finish(&self) -> bool {
        self.chunk(Vec::new())
    }

    pub fn fail(&self, message: impl Into<String>) -> bool {
        self.post(HttpEvent::Error(message.into()))
    }

    fn post(&self, event: HttpEvent) -> bool {
        let shared = &self.shared;
        let callback = if event.is_terminal() {
            if shared.finished.swap(true, Ordering::SeqCst) {
                return false;
            }
            shared.callback(true)
        } else {
            if shared.finished.load(Ordering::SeqCst) {
                return false;
            }
            shared.callback(false)
        };
        match callback {
            Some(callback) => deliver(&shared.runtime, shared.op, callback, event),
            None => false,
        }
    }
}

impl fmt::Debug for HttpSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSink")
            .field("op", &self.shared.op)
            .field("finished", &self.shared.finished.load(Ordering::SeqCst))
            .finish()
    }
}

/// Post one event to the script callback.
///
/// The terminal event is handed to script before the handle is removed, so
/// the callback still observes its own request as pending.
fn deliver(runtime: &RuntimeHandle, op: OpHandle, callback: JsFunction, event: HttpEvent) -> bool {
    let registry = runtime.registry().clone();
    if !registry.contains(op) {
        return false;
    }
    let terminal = event.is_terminal();
    let posted = runtime.call_async(move |cx| {
        if !cx.registry().contains(op) {
            return;
        }
        if let Err(err) = callback.call_in(cx, event.into_args()) {
            report_callback_error("fetch", &err);
        }
        if terminal {
            cx.registry().unregister(op);
            tracing::trace!(target: "jsbridge::runtime", %op, "HTTP request finished");
        }
    });
    if posted.is_err() && terminal {
        registry.unregister(op);
    }
    posted.is_ok()
}

fn parse_request(value: &HostValue) -> Result<HttpRequest> {
    let url = value
        .get("url")
        .and_then(HostValue::as_str)
        .ok_or_else(|| Error::conversion("fetch requires a URL string"))?
        .to_string();
    let method = value
        .get("method")
        .and_then(HostValue::as_str)
        .map(str::to_ascii_uppercase)
        .unwrap_or_else(|| "GET".to_string());

    let headers = match value.get("headers") {
        None | Some(HostValue::Null) => Vec::new(),
        Some(HostValue::Array(entries)) => entries
            .iter()
            .map(|entry| match entry.as_array() {
                Some([name, value]) => Ok((name.display_string(), value.display_string())),
                _ => Err(Error::conversion("Header entries must be [name, value] pairs")),
            })
            .collect::<Result<Vec<_>>>()?,
        Some(other) => {
            return Err(Error::conversion(format!(
                "Headers must be an array of pairs, got {}",
                other.type_name()
            )))
        }
    };

    let body = match value.get("body") {
        None | Some(HostValue::Null) => None,
        Some(HostValue::Bytes(bytes)) => Some(bytes.clone()),
        Some(HostValue::String(text)) => Some(text.clone().into_bytes()),
        Some(other) => {
            return Err(Error::conversion(format!(
                "Unsupported request body type: {}",
                other.type_name()
            )))
        }
    };

    Ok(HttpRequest {
        url,
        method,
        headers,
        body,
    })
}

/// Start a request and return its handle.
fn start_request(
    runtime: &RuntimeHandle,
    transport: &dyn HttpTransport,
    request: HttpRequest,
    callback: JsFunction,
) -> Result<OpHandle> {
    let registry = runtime.registry().clone();
    let op = registry.register(OpKind::Http);
    let sink = HttpSink::new(runtime.clone(), op, callback);
    let (method, url) = (request.method.clone(), request.url.clone());

    match transport.start(request, sink.clone()) {
        Ok(hook) => {
            let shared: Weak<SinkShared> = Arc::downgrade(&sink.shared);
            registry.set_cancel_hook(
                op,
                Box::new(move || {
                    if let Some(shared) = shared.upgrade() {
                        shared.release();
                    }
                    if let Some(hook) = hook {
                        hook();
                    }
                }),
            );
            tracing::debug!(target: "jsbridge::runtime", %op, %method, %url, "HTTP request started");
            Ok(op)
        }
        Err(err) => {
            sink.shared.release();
            registry.unregister(op);
            Err(err)
        }
    }
}

fn fetch_start() -> HostFunction {
    HostFunction::with_scope("fetchStart", 2, |cx, args| {
        let request = cx.to_host(args[0])?;
        let request = parse_request(&request)?;
        let callback = match cx.to_host(args[1])? {
            HostValue::JsFunction(callback) => callback,
            other => {
                return Err(Error::conversion(format!(
                    "fetch callback must be a function, got {}",
                    other.type_name()
                )))
            }
        };
        let transport = cx
            .state
            .services
            .http
            .clone()
            .ok_or_else(|| Error::transport("No HTTP transport configured"))?;
        let runtime = cx.handle().clone();
        let op = start_request(&runtime, transport.as_ref(), request, callback)?;
        Ok(v8::Number::new(cx.scope, op.as_raw() as f64).into())
    })
}

fn fetch_abort() -> HostFunction {
    HostFunction::with_scope("fetchAbort", 1, |cx, args| {
        let aborted = v8::Local::<v8::Number>::try_from(args[0])
            .ok()
            .map(|n| OpHandle::from_raw(n.value() as u64))
            .filter(|op| matches!(cx.registry().require(*op), Ok(OpKind::Http)))
            .map(|op| cx.registry().cancel(op))
            .unwrap_or(false);
        Ok(v8::Boolean::new(cx.scope, aborted).into())
    })
}

pub(crate) fn install(cx: &mut BridgeScope<'_, '_>) -> Result<()> {
    cx.set_native(fetch_start())?;
    cx.set_native(fetch_abort())?;
    cx.set_native(HostFunction::with_scope("pendingOps", 0, |cx, _| {
        let count = cx.registry().count() as f64;
        Ok(v8::Number::new(cx.scope, count).into())
    }))?;
    cx.set_native(HostFunction::new("decodeUtf8", 1, |args| match &args[0] {
        HostValue::Bytes(bytes) => Ok(HostValue::from(String::from_utf8_lossy(bytes).into_owned())),
        HostValue::Null => Ok(HostValue::from("")),
        other => Err(Error::conversion(format!("Cannot decode {} as UTF-8", other.type_name()))),
    }))?;
    cx.set_native(HostFunction::new("encodeUtf8", 1, |args| {
        let text = match &args[0] {
            HostValue::Null => String::new(),
            other => other.display_string(),
        };
        Ok(HostValue::Bytes(text.into_bytes()))
    }))?;
    Ok(())
}
