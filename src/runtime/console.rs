//! `console.*` routed into `tracing`.

use crate::error::Result;
use crate::runtime::function::HostFunction;
use crate::runtime::scope::BridgeScope;
use crate::runtime::value::HostValue;
use deno_core::v8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConsoleLevel {
    Log,
    Info,
    Warn,
    Error,
    Debug,
    Trace,
}

impl ConsoleLevel {
    const ALL: [ConsoleLevel; 6] = [
        ConsoleLevel::Log,
        ConsoleLevel::Info,
        ConsoleLevel::Warn,
        ConsoleLevel::Error,
        ConsoleLevel::Debug,
        ConsoleLevel::Trace,
    ];

    fn method(self) -> &'static str {
        match self {
            ConsoleLevel::Log => "log",
            ConsoleLevel::Info => "info",
            ConsoleLevel::Warn => "warn",
            ConsoleLevel::Error => "error",
            ConsoleLevel::Debug => "debug",
            ConsoleLevel::Trace => "trace",
        }
    }

    fn emit(self, message: &str) {
        match self {
            ConsoleLevel::Log | ConsoleLevel::Info => {
                tracing::info!(target: "jsbridge::console", "{}", message)
            }
            ConsoleLevel::Warn => tracing::warn!(target: "jsbridge::console", "{}", message),
            ConsoleLevel::Error => tracing::error!(target: "jsbridge::console", "{}", message),
            ConsoleLevel::Debug => tracing::debug!(target: "jsbridge::console", "{}", message),
            ConsoleLevel::Trace => tracing::trace!(target: "jsbridge::console", "{}", message),
        }
    }
}

/// Join console arguments the way script consoles print them.
pub(crate) fn format_console_args(args: &[HostValue]) -> String {
    args.iter()
        .map(HostValue::display_string)
        .collect::<Vec<_>>()
        .join(" ")
}

fn console_function(level: ConsoleLevel, enabled: bool) -> HostFunction {
    HostFunction::with_scope(level.method(), 0, move |cx, args| {
        if enabled {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                let value = match cx.to_host(*arg) {
                    Ok(value) => value,
                    // Symbols and cyclic values still print something useful.
                    Err(_) => {
                        let type_name = arg.type_of(cx.scope);
                        HostValue::String(format!("[{}]", type_name.to_rust_string_lossy(cx.scope)))
                    }
                };
                values.push(value);
            }
            level.emit(&format_console_args(&values));
        }
        Ok(v8::undefined(cx.scope).into())
    })
    .variadic()
}

pub(crate) fn install(cx: &mut BridgeScope<'_, '_>) -> Result<()> {
    let enabled = cx.state.console_enabled;
    let console = HostValue::object(
        ConsoleLevel::ALL
            .iter()
            .map(|level| (level.method(), HostValue::Function(console_function(*level, enabled)))),
    );
    cx.set_global("console", console)
}
