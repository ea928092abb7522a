//! `setTimeout` / `setInterval` on top of the operation registry.
//!
//! Each timer is a Tokio task on the execution thread's executor that posts
//! its callback through the work queue. The timer id script sees is the raw
//! [`OpHandle`]; clearing a timer cancels the handle, which aborts the task.
//! A fire whose handle is already gone is skipped, both before posting and
//! again when the posted item runs.

use crate::error::{Error, Result};
use crate::runtime::function::HostFunction;
use crate::runtime::handle::RuntimeHandle;
use crate::runtime::pins::{report_callback_error, EngineRef, JsFunction};
use crate::runtime::registry::{OpHandle, OpKind};
use crate::runtime::scope::BridgeScope;
use crate::runtime::value::HostValue;
use deno_core::v8;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

/// Longest delay accepted; larger values are clamped.
const MAX_DELAY_MS: f64 = i32::MAX as f64;

/// Clamp a script-provided delay to at least one millisecond.
pub(crate) fn clamp_delay(ms: f64) -> Duration {
    let ms = if ms.is_nan() || ms < 1.0 { 1.0 } else { ms.min(MAX_DELAY_MS) };
    Duration::from_millis(ms as u64)
}

pub(crate) fn install(cx: &mut BridgeScope<'_, '_>) -> Result<()> {
    cx.set_global("setTimeout", HostValue::Function(schedule_function("setTimeout", false)))?;
    cx.set_global("setInterval", HostValue::Function(schedule_function("setInterval", true)))?;
    cx.set_global("clearTimeout", HostValue::Function(clear_function("clearTimeout")))?;
    cx.set_global("clearInterval", HostValue::Function(clear_function("clearInterval")))?;
    Ok(())
}

fn schedule_function(name: &'static str, repeat: bool) -> HostFunction {
    HostFunction::with_scope(name, 2, move |cx, args| {
        let callback = args
            .first()
            .and_then(|arg| v8::Local::<v8::Function>::try_from(*arg).ok())
            .ok_or_else(|| Error::conversion(format!("{} requires a function callback", name)))?;
        let delay = match args.get(1) {
            Some(arg) if !arg.is_undefined() => arg.number_value(cx.scope).unwrap_or(f64::NAN),
            _ => 0.0,
        };
        let delay = clamp_delay(delay);

        let callback = cx.pin_function(callback, None);
        let extra: Vec<EngineRef> = args.iter().skip(2).map(|arg| cx.pin(*arg)).collect();

        let op = schedule(cx, name, repeat, delay, callback, extra)?;
        Ok(v8::Number::new(cx.scope, op.as_raw() as f64).into())
    })
    .variadic()
}

fn schedule(
    cx: &mut BridgeScope<'_, '_>,
    name: &'static str,
    repeat: bool,
    delay: Duration,
    callback: JsFunction,
    args: Vec<EngineRef>,
) -> Result<OpHandle> {
    let executor = tokio::runtime::Handle::try_current()
        .map_err(|_| Error::runtime("No async executor on the execution thread"))?;
    let registry = cx.registry().clone();
    let runtime = cx.handle().clone();
    let kind = if repeat { OpKind::Interval } else { OpKind::Timer };
    let op = registry.register(kind);

    let task = if repeat {
        executor.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + delay, delay);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !fire(&runtime, op, name, &callback, &args, false) {
                    break;
                }
            }
        })
    } else {
        executor.spawn(async move {
            tokio::time::sleep(delay).await;
            fire(&runtime, op, name, &callback, &args, true);
        })
    };
    let abort = task.abort_handle();
    registry.set_cancel_hook(op, Box::new(move || abort.abort()));

    tracing::trace!(target: "jsbridge::runtime", %op, delay_ms = delay.as_millis() as u64, name, "timer scheduled");
    Ok(op)
}

/// Post one timer callback. Returns `false` once the timer is finished.
fn fire(
    runtime: &RuntimeHandle,
    op: OpHandle,
    name: &'static str,
    callback: &JsFunction,
    args: &[EngineRef],
    one_shot: bool,
) -> bool {
    if !runtime.registry().contains(op) {
        return false;
    }
    let callback = callback.clone();
    let args = args.to_vec();
    let posted = runtime.call_async(move |cx| {
        if !cx.registry().contains(op) {
            tracing::trace!(target: "jsbridge::runtime", %op, "timer cleared before delivery");
            return;
        }
        let args = args.into_iter().map(HostValue::Engine).collect();
        if let Err(err) = callback.call_in(cx, args) {
            report_callback_error(name, &err);
        }
        if one_shot {
            cx.registry().unregister(op);
        }
    });
    if posted.is_err() {
        runtime.registry().unregister(op);
        return false;
    }
    !one_shot
}

fn clear_function(name: &'static str) -> HostFunction {
    HostFunction::with_scope(name, 1, |cx, args| {
        let raw = v8::Local::<v8::Number>::try_from(args[0])
            .ok()
            .map(|n| n.value())
            .filter(|n| n.is_finite() && *n >= 1.0 && n.fract() == 0.0);
        if let Some(raw) = raw {
            let op = OpHandle::from_raw(raw as u64);
            // Ids of other operation kinds are ignored.
            if matches!(cx.registry().require(op), Ok(OpKind::Timer | OpKind::Interval)) {
                cx.registry().cancel(op);
            }
        }
        Ok(v8::undefined(cx.scope).into())
    })
}
