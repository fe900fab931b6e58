//! Native functions exposed to scripts.
//!
//! Each session keeps a [`BridgeState`] in an isolate slot. The callbacks
//! below are plain function items that fetch that state from the scope they
//! are invoked with.
//!
//! | Global                       | Purpose                                   |
//! |------------------------------|-------------------------------------------|
//! | `nativeRequire`              | evaluate a bundle module on demand        |
//! | `nativeCallSyncHook`         | synchronous native method call            |
//! | `nativeFlushQueueImmediate`  | hand queued native calls to the host      |
//! | `nativeLoggingHook`          | forward a log line to the logging sink    |
//! | `nativePerformanceNow`       | milliseconds since the session started    |
//! | `console.*`                  | stringified logging through the sink      |

use crate::runtime::bundle::ModuleBundle;
use crate::runtime::engine::{
    evaluate_script, parse_json, set_function, throw_error, to_json_text, v8_string,
};
use crate::runtime::error::{EngineError, HostError};
use crate::runtime::logging::{LogLevel, LoggingSink};
use crate::runtime::stringify::ValueStringifier;
use deno_core::v8;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

/// Handler behind `nativeCallSyncHook(moduleId, methodId, args)`.
///
/// Receives the arguments as JSON text and returns JSON text. An `Err`
/// becomes a script `Error` carrying the returned message.
pub type SyncHook = Arc<dyn Fn(u32, u32, &str) -> Result<String, String> + Send + Sync>;

/// Handler behind `nativeFlushQueueImmediate(queue)`.
pub type FlushHook = Arc<dyn Fn(&str) -> Result<(), String> + Send + Sync>;

const SYNC_HOOK_NOT_SET: &str = "Sync hook has not been set.";
const FLUSH_HOOK_NOT_SET: &str = "Flush queue hook has not been set.";
const NO_BUNDLE: &str = "nativeRequire called without an installed bundle";
const LOGGING_HOOK_BAD_MESSAGE: &str = "nativeLoggingHook called with a non-string message";

/// Per-session state shared with the native callbacks.
pub struct BridgeState {
    sync_hook: RefCell<Option<SyncHook>>,
    flush_hook: RefCell<Option<FlushHook>>,
    bundle: RefCell<Option<Box<dyn ModuleBundle>>>,
    sink: RefCell<LoggingSink>,
    next_script_id: Cell<i32>,
    started: Instant,
}

impl BridgeState {
    pub fn new(sink: LoggingSink) -> Self {
        Self {
            sync_hook: RefCell::new(None),
            flush_hook: RefCell::new(None),
            bundle: RefCell::new(None),
            sink: RefCell::new(sink),
            next_script_id: Cell::new(1),
            started: Instant::now(),
        }
    }

    /// Next per-execution script id. Never reused within a session.
    pub fn next_script_id(&self) -> i32 {
        let id = self.next_script_id.get();
        self.next_script_id.set(id.wrapping_add(1).max(1));
        id
    }

    pub fn set_sync_hook(&self, hook: SyncHook) -> Result<(), HostError> {
        let mut slot = self.sync_hook.borrow_mut();
        if slot.is_some() {
            return Err(HostError::HookAlreadySet("sync"));
        }
        *slot = Some(hook);
        Ok(())
    }

    pub fn set_flush_hook(&self, hook: FlushHook) -> Result<(), HostError> {
        let mut slot = self.flush_hook.borrow_mut();
        if slot.is_some() {
            return Err(HostError::HookAlreadySet("flush"));
        }
        *slot = Some(hook);
        Ok(())
    }

    pub fn has_sync_hook(&self) -> bool {
        self.sync_hook.borrow().is_some()
    }

    pub fn has_flush_hook(&self) -> bool {
        self.flush_hook.borrow().is_some()
    }

    /// Install a bundle, dropping any previous one.
    pub fn install_bundle(&self, bundle: Box<dyn ModuleBundle>) {
        *self.bundle.borrow_mut() = Some(bundle);
    }

    pub fn has_bundle(&self) -> bool {
        self.bundle.borrow().is_some()
    }

    pub fn clear_bundle(&self) {
        self.bundle.borrow_mut().take();
    }

    pub fn sink(&self) -> LoggingSink {
        self.sink.borrow().clone()
    }

    pub fn set_sink(&self, sink: LoggingSink) {
        *self.sink.borrow_mut() = sink;
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        self.sink().log(level, message);
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }
}

/// Options controlling which optional globals are installed.
#[derive(Debug, Clone, Copy, Default)]
pub struct BridgeOptions {
    pub console: bool,
    pub performance_now: bool,
}

/// Install the native globals on `global`.
pub fn install(
    scope: &mut v8::HandleScope,
    global: v8::Local<v8::Object>,
    options: BridgeOptions,
) -> Result<(), EngineError> {
    set_function(scope, global, "nativeRequire", native_require)?;
    set_function(scope, global, "nativeCallSyncHook", native_call_sync_hook)?;
    set_function(scope, global, "nativeFlushQueueImmediate", native_flush_queue_immediate)?;
    set_function(scope, global, "nativeLoggingHook", native_logging_hook)?;

    if options.performance_now {
        set_function(scope, global, "nativePerformanceNow", native_performance_now)?;
    }

    if options.console {
        let console = v8::Object::new(scope);
        set_function(scope, console, "log", console_log)?;
        set_function(scope, console, "info", console_info)?;
        set_function(scope, console, "warn", console_warn)?;
        set_function(scope, console, "error", console_error)?;
        set_function(scope, console, "debug", console_debug)?;
        set_function(scope, console, "trace", console_debug)?;
        let key = v8_string(scope, "console")?;
        global.set(scope, key.into(), console.into());
    }

    Ok(())
}

fn state(scope: &mut v8::HandleScope) -> Option<Rc<BridgeState>> {
    scope.get_slot::<Rc<BridgeState>>().cloned()
}

fn u32_arg(
    scope: &mut v8::HandleScope,
    value: v8::Local<v8::Value>,
    name: &str,
) -> Result<u32, String> {
    let number = value
        .number_value(scope)
        .filter(|n| n.is_finite() && *n >= 0.0 && *n <= u32::MAX as f64 && n.fract() == 0.0)
        .ok_or_else(|| format!("{name} must be a non-negative integer"))?;
    Ok(number as u32)
}

fn native_require(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    _rv: v8::ReturnValue,
) {
    let Some(state) = state(scope) else {
        return;
    };
    let index = match u32_arg(scope, args.get(0), "module index") {
        Ok(index) if index > 0 => index,
        Ok(_) => {
            throw_error(scope, "module index must be greater than zero");
            return;
        }
        Err(message) => {
            throw_error(scope, &message);
            return;
        }
    };

    // The borrow ends with this statement; modules may require other modules.
    let record = state
        .bundle
        .borrow()
        .as_ref()
        .map(|bundle| bundle.module(index));
    let record = match record {
        Some(Ok(record)) => record,
        Some(Err(err)) => {
            throw_error(scope, &err.to_string());
            return;
        }
        None => {
            throw_error(scope, NO_BUNDLE);
            return;
        }
    };

    let script_id = state.next_script_id();
    if let Err(err) = evaluate_script(scope, &record.source_text, &record.source_url, script_id) {
        let message = format!("failed to evaluate {}: {}", record.source_url, err);
        state.log(LogLevel::Error, &message);
        throw_error(scope, &message);
    }
}

fn native_call_sync_hook(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    let Some(state) = state(scope) else {
        return;
    };
    let Some(hook) = state.sync_hook.borrow().clone() else {
        throw_error(scope, SYNC_HOOK_NOT_SET);
        return;
    };

    let ids = u32_arg(scope, args.get(0), "moduleId")
        .and_then(|module| u32_arg(scope, args.get(1), "methodId").map(|method| (module, method)));
    let (module_id, method_id) = match ids {
        Ok(ids) => ids,
        Err(message) => {
            throw_error(scope, &message);
            return;
        }
    };
    let json_args = match to_json_text(scope, args.get(2)) {
        Ok(text) => text,
        Err(err) => {
            throw_error(scope, &err.to_string());
            return;
        }
    };

    match hook(module_id, method_id, &json_args) {
        Ok(result) if result.is_empty() => {}
        Ok(result) => match parse_json(scope, &result) {
            Ok(value) => rv.set(value),
            Err(err) => throw_error(scope, &err.to_string()),
        },
        Err(message) => throw_error(scope, &message),
    }
}

fn native_flush_queue_immediate(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    _rv: v8::ReturnValue,
) {
    let Some(state) = state(scope) else {
        return;
    };
    let Some(hook) = state.flush_hook.borrow().clone() else {
        throw_error(scope, FLUSH_HOOK_NOT_SET);
        return;
    };

    let queue = match to_json_text(scope, args.get(0)) {
        Ok(text) => text,
        Err(err) => {
            throw_error(scope, &err.to_string());
            return;
        }
    };
    if let Err(message) = hook(&queue) {
        throw_error(scope, &message);
    }
}

fn native_logging_hook(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    _rv: v8::ReturnValue,
) {
    let Some(state) = state(scope) else {
        return;
    };
    let sink = state.sink();
    if !sink.is_enabled() {
        return;
    }

    let message = args.get(0);
    if !message.is_string() {
        sink.log(LogLevel::Error, LOGGING_HOOK_BAD_MESSAGE);
        return;
    }
    let message = message.to_rust_string_lossy(scope);

    let level = args.get(1);
    let level = if level.is_undefined() {
        LogLevel::Trace
    } else {
        level
            .integer_value(scope)
            .map(LogLevel::from_code)
            .unwrap_or(LogLevel::Log)
    };
    sink.log(level, &message);
}

fn native_performance_now(
    scope: &mut v8::HandleScope,
    _args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    if let Some(state) = state(scope) {
        rv.set_double(state.elapsed_ms());
    }
}

fn console_write(
    scope: &mut v8::HandleScope,
    args: &v8::FunctionCallbackArguments,
    level: LogLevel,
) {
    let Some(state) = state(scope) else {
        return;
    };
    let sink = state.sink();
    if !sink.is_enabled() {
        return;
    }
    let line = (0..args.length())
        .map(|i| ValueStringifier::render(scope, args.get(i)))
        .collect::<Vec<_>>()
        .join(" ");
    sink.log(level, &line);
}

fn console_log(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    _rv: v8::ReturnValue,
) {
    console_write(scope, &args, LogLevel::Log);
}

fn console_info(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    _rv: v8::ReturnValue,
) {
    console_write(scope, &args, LogLevel::Info);
}

fn console_warn(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    _rv: v8::ReturnValue,
) {
    console_write(scope, &args, LogLevel::Warn);
}

fn console_error(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    _rv: v8::ReturnValue,
) {
    console_write(scope, &args, LogLevel::Error);
}

fn console_debug(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    _rv: v8::ReturnValue,
) {
    console_write(scope, &args, LogLevel::Trace);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo() -> SyncHook {
        Arc::new(|_, _, args: &str| Ok(args.to_string()))
    }

    #[test]
    fn test_script_ids_increase() {
        let state = BridgeState::new(LoggingSink::new());
        let first = state.next_script_id();
        let second = state.next_script_id();
        assert!(second > first);
    }

    #[test]
    fn test_sync_hook_registers_once() {
        let state = BridgeState::new(LoggingSink::new());
        assert!(!state.has_sync_hook());
        state.set_sync_hook(echo()).unwrap();
        assert!(state.has_sync_hook());

        let err = state.set_sync_hook(echo()).unwrap_err();
        assert!(matches!(err, HostError::HookAlreadySet("sync")));
    }

    #[test]
    fn test_flush_hook_registers_once() {
        let state = BridgeState::new(LoggingSink::new());
        let hook: FlushHook = Arc::new(|_| Ok(()));
        state.set_flush_hook(hook.clone()).unwrap();
        assert!(state.has_flush_hook());
        assert!(matches!(
            state.set_flush_hook(hook),
            Err(HostError::HookAlreadySet("flush"))
        ));
    }

    #[test]
    fn test_sink_replacement() {
        let first = LoggingSink::new();
        let second = LoggingSink::new();
        let state = BridgeState::new(first.clone());
        assert!(state.sink().same_as(&first));
        state.set_sink(second.clone());
        assert!(state.sink().same_as(&second));
    }
}
