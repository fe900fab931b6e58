//! Script session backed by `deno_core::JsRuntime`.
//!
//! A session owns one isolate and its context, a handle to the global
//! object and the [`BridgeState`] the native callbacks read. It is not
//! `Send`; use [`SessionHandle`](crate::runtime::handle::SessionHandle) to
//! drive a session from other threads.

use crate::runtime::bridge::{self, BridgeOptions, BridgeState};
use crate::runtime::bundle::{self, BundleKind, IndexedBundle, ModuleBundle, PathBundle};
use crate::runtime::cache::BytecodeCache;
use crate::runtime::config::SessionConfig;
use crate::runtime::engine;
use crate::runtime::error::{HostError, RunError};
use crate::runtime::initialize_platform_once;
use crate::runtime::io::read_text_file;
use crate::runtime::logging::LoggingSink;
use crate::runtime::stringify::ValueStringifier;
use deno_core::{v8, JsRuntime, RuntimeOptions};
use serde_json::json;
use std::fmt;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;

const BATCHED_BRIDGE: &str = "__fbBatchedBridge";

/// Opaque handle to a value living in a session's isolate.
///
/// Only meaningful to the session that produced it.
#[derive(Clone)]
pub struct ScriptValue(v8::Global<v8::Value>);

impl fmt::Debug for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ScriptValue(..)")
    }
}

pub struct ScriptRuntimeSession {
    // Handles into the isolate are released before the runtime drops.
    global: v8::Global<v8::Object>,
    bridge: Rc<BridgeState>,
    runtime: JsRuntime,
}

impl ScriptRuntimeSession {
    /// Create a session logging through the process-wide sink.
    pub fn new(config: SessionConfig) -> Result<Self, HostError> {
        Self::with_logging_sink(config, LoggingSink::process())
    }

    pub fn with_logging_sink(config: SessionConfig, sink: LoggingSink) -> Result<Self, HostError> {
        config.validate()?;

        let SessionConfig {
            max_heap_size,
            initial_heap_size,
            bootstrap_script,
            enable_console,
            enable_native_performance_now,
            logging_enabled,
        } = config;

        if let Some(enabled) = logging_enabled {
            sink.set_enabled(enabled);
        }

        let create_params = max_heap_size.map(|max| {
            v8::CreateParams::default().heap_limits(initial_heap_size.unwrap_or(0), max)
        });

        let mut runtime = JsRuntime::new(RuntimeOptions {
            create_params,
            v8_platform: Some(initialize_platform_once()),
            ..Default::default()
        });

        let bridge = Rc::new(BridgeState::new(sink));
        runtime.v8_isolate().set_slot(bridge.clone());

        let global = {
            let scope = &mut runtime.handle_scope();
            let global = scope.get_current_context().global(scope);
            bridge::install(
                scope,
                global,
                BridgeOptions {
                    console: enable_console,
                    performance_now: enable_native_performance_now,
                },
            )?;
            v8::Global::new(scope, global)
        };

        let mut session = Self {
            global,
            bridge,
            runtime,
        };

        if let Some(script) = bootstrap_script {
            session.run_script(&script, "<bootstrap>")?;
        }

        Ok(session)
    }

    /// Tear the session down. Equivalent to dropping it.
    pub fn destroy(self) {
        drop(self);
    }

    /// Evaluate source text.
    pub fn run_script(&mut self, source: &str, source_url: &str) -> Result<ScriptValue, HostError> {
        let script_id = self.bridge.next_script_id();
        let scope = &mut self.runtime.handle_scope();
        let value = engine::evaluate_script(scope, source, source_url, script_id)?;
        Ok(ScriptValue(value))
    }

    /// Run a file, installing it as the session's bundle when it is one.
    pub fn run_from_path(
        &mut self,
        path: impl AsRef<Path>,
        source_url: &str,
    ) -> Result<ScriptValue, HostError> {
        let path = path.as_ref();
        let kind = bundle::classify(path);
        log::debug!("running {} as {:?}", path.display(), kind);

        let startup = match kind {
            BundleKind::Plain => read_text_file(path)?,
            BundleKind::PathBundle => self.install_bundle(PathBundle::open(path))?,
            BundleKind::IndexedBundle => self.install_bundle(IndexedBundle::open(path)?)?,
        };
        self.run_script(&startup, source_url)
    }

    fn install_bundle<B>(&mut self, bundle: B) -> Result<String, HostError>
    where
        B: ModuleBundle + 'static,
    {
        let startup = bundle.startup_code()?;
        self.bridge.install_bundle(Box::new(bundle));
        Ok(startup)
    }

    pub fn has_bundle(&self) -> bool {
        self.bridge.has_bundle()
    }

    /// Write a bytecode cache for `source_path` unless a fresh one exists.
    pub fn compile_cache(
        &mut self,
        source_path: impl AsRef<Path>,
        cache_path: impl AsRef<Path>,
    ) -> Result<(), HostError> {
        let cache = BytecodeCache::new(source_path.as_ref(), cache_path.as_ref());
        let script_id = self.bridge.next_script_id();
        let scope = &mut self.runtime.handle_scope();
        cache.compile(scope, script_id)?;
        Ok(())
    }

    /// Execute from a bytecode cache.
    pub fn run_from_cache(
        &mut self,
        source_path: impl AsRef<Path>,
        cache_path: impl AsRef<Path>,
        source_url: &str,
    ) -> Result<ScriptValue, HostError> {
        let cache = BytecodeCache::new(source_path.as_ref(), cache_path.as_ref());
        let script_id = self.bridge.next_script_id();
        let scope = &mut self.runtime.handle_scope();
        let value = cache.run(scope, source_url, script_id)?;
        Ok(ScriptValue(value))
    }

    /// Execute from the cache, rebuilding it first when it is stale or was
    /// rejected.
    pub fn run_with_cache(
        &mut self,
        source_path: impl AsRef<Path>,
        cache_path: impl AsRef<Path>,
        source_url: &str,
    ) -> Result<ScriptValue, HostError> {
        let (source_path, cache_path) = (source_path.as_ref(), cache_path.as_ref());

        match self.run_from_cache(source_path, cache_path, source_url) {
            Err(HostError::Run(RunError::Stale { .. }))
            | Err(HostError::Run(RunError::FatalCorruption { .. })) => {}
            other => return other,
        }

        self.compile_cache(source_path, cache_path)?;
        match self.run_from_cache(source_path, cache_path, source_url) {
            Err(HostError::Run(RunError::Stale { .. })) => {
                // Source and cache share a timestamp; run the source directly.
                let source = read_text_file(source_path)?;
                self.run_script(&source, source_url)
            }
            other => other,
        }
    }

    /// Read a global as JSON text. `undefined` reads as `null`.
    pub fn get_global(&mut self, name: &str) -> Result<String, HostError> {
        let scope = &mut self.runtime.handle_scope();
        let global = v8::Local::new(scope, &self.global);
        let value = engine::get_named(scope, global, name)?;
        Ok(engine::to_json_text(scope, value)?)
    }

    /// Assign a global from JSON text.
    pub fn set_global(&mut self, name: &str, json: &str) -> Result<(), HostError> {
        let scope = &mut self.runtime.handle_scope();
        let global = v8::Local::new(scope, &self.global);
        let value = engine::parse_json(scope, json)?;
        let key = engine::v8_string(scope, name)?;
        global.set(scope, key.into(), value);
        Ok(())
    }

    /// Register the handler behind `nativeCallSyncHook`. Only one per session.
    pub fn register_sync_hook<F>(&self, handler: F) -> Result<(), HostError>
    where
        F: Fn(u32, u32, &str) -> Result<String, String> + Send + Sync + 'static,
    {
        self.bridge.set_sync_hook(Arc::new(handler))
    }

    /// Register the handler behind `nativeFlushQueueImmediate`. Only one per session.
    pub fn register_flush_hook<F>(&self, handler: F) -> Result<(), HostError>
    where
        F: Fn(&str) -> Result<(), String> + Send + Sync + 'static,
    {
        self.bridge.set_flush_hook(Arc::new(handler))
    }

    pub fn set_logging_sink(&self, sink: LoggingSink) {
        self.bridge.set_sink(sink);
    }

    pub fn logging_sink(&self) -> LoggingSink {
        self.bridge.sink()
    }

    /// `__fbBatchedBridge.callFunctionReturnFlushedQueue(module, method, args)`.
    pub fn call_function_return_flushed_queue(
        &mut self,
        module: &str,
        method: &str,
        args: &serde_json::Value,
    ) -> Result<serde_json::Value, HostError> {
        self.call_batched_bridge(
            "callFunctionReturnFlushedQueue",
            &[json!(module), json!(method), args.clone()],
        )
    }

    /// `__fbBatchedBridge.invokeCallbackAndReturnFlushedQueue(id, args)`.
    pub fn invoke_callback_and_return_flushed_queue(
        &mut self,
        callback_id: i64,
        args: &serde_json::Value,
    ) -> Result<serde_json::Value, HostError> {
        self.call_batched_bridge(
            "invokeCallbackAndReturnFlushedQueue",
            &[json!(callback_id), args.clone()],
        )
    }

    /// `__fbBatchedBridge.flushedQueue()`.
    pub fn flushed_queue(&mut self) -> Result<serde_json::Value, HostError> {
        self.call_batched_bridge("flushedQueue", &[])
    }

    fn call_batched_bridge(
        &mut self,
        method: &str,
        args: &[serde_json::Value],
    ) -> Result<serde_json::Value, HostError> {
        let scope = &mut self.runtime.handle_scope();
        let global = v8::Local::new(scope, &self.global);

        let bridge = engine::get_named(scope, global, BATCHED_BRIDGE)?;
        let bridge =
            v8::Local::<v8::Object>::try_from(bridge).map_err(|_| HostError::BridgeNotFound)?;
        let function = engine::get_named(scope, bridge, method)?;
        let function = v8::Local::<v8::Function>::try_from(function)
            .map_err(|_| HostError::NotCallable(format!("{BATCHED_BRIDGE}.{method}")))?;

        let mut v8_args = Vec::with_capacity(args.len());
        for arg in args {
            let text = serde_json::to_string(arg)?;
            v8_args.push(engine::parse_json(scope, &text)?);
        }

        let result = engine::call_function(scope, function, bridge.into(), &v8_args)?;
        let result = v8::Local::new(scope, result);
        let text = engine::to_json_text(scope, result)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn global_object(&mut self) -> ScriptValue {
        let scope = &mut self.runtime.handle_scope();
        let global = v8::Local::new(scope, &self.global);
        let value: v8::Local<v8::Value> = global.into();
        ScriptValue(v8::Global::new(scope, value))
    }

    /// Build a value from JSON text.
    pub fn value_from_json(&mut self, json: &str) -> Result<ScriptValue, HostError> {
        let scope = &mut self.runtime.handle_scope();
        let value = engine::parse_json(scope, json)?;
        Ok(ScriptValue(v8::Global::new(scope, value)))
    }

    /// Debug rendering, bounded in depth and size.
    pub fn describe(&mut self, value: &ScriptValue) -> String {
        let scope = &mut self.runtime.handle_scope();
        let local = v8::Local::new(scope, &value.0);
        ValueStringifier::render(scope, local)
    }

    pub fn to_json(&mut self, value: &ScriptValue) -> Result<String, HostError> {
        let scope = &mut self.runtime.handle_scope();
        let local = v8::Local::new(scope, &value.0);
        Ok(engine::to_json_text(scope, local)?)
    }

    pub fn to_json_value(&mut self, value: &ScriptValue) -> Result<serde_json::Value, HostError> {
        let text = self.to_json(value)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn as_string(&mut self, value: &ScriptValue) -> Option<String> {
        let scope = &mut self.runtime.handle_scope();
        let local = v8::Local::new(scope, &value.0);
        local.is_string().then(|| local.to_rust_string_lossy(scope))
    }

    pub fn as_number(&mut self, value: &ScriptValue) -> Option<f64> {
        let scope = &mut self.runtime.handle_scope();
        let local = v8::Local::new(scope, &value.0);
        if local.is_number() {
            local.number_value(scope)
        } else {
            None
        }
    }

    pub fn as_bool(&mut self, value: &ScriptValue) -> Option<bool> {
        let scope = &mut self.runtime.handle_scope();
        let local = v8::Local::new(scope, &value.0);
        local.is_boolean().then(|| local.boolean_value(scope))
    }

    pub fn is_nullish(&mut self, value: &ScriptValue) -> bool {
        let scope = &mut self.runtime.handle_scope();
        v8::Local::new(scope, &value.0).is_null_or_undefined()
    }

    /// Read `value[name]`.
    pub fn get_property(
        &mut self,
        value: &ScriptValue,
        name: &str,
    ) -> Result<ScriptValue, HostError> {
        let scope = &mut self.runtime.handle_scope();
        let local = v8::Local::new(scope, &value.0);
        let object = v8::Local::<v8::Object>::try_from(local)
            .map_err(|_| HostError::NotAnObject(name.to_string()))?;
        let property = engine::get_named(scope, object, name)?;
        Ok(ScriptValue(v8::Global::new(scope, property)))
    }

    /// Call `function` with `receiver` as `this` (the global object if `None`).
    pub fn call_function(
        &mut self,
        function: &ScriptValue,
        receiver: Option<&ScriptValue>,
        args: &[ScriptValue],
    ) -> Result<ScriptValue, HostError> {
        let scope = &mut self.runtime.handle_scope();
        let local = v8::Local::new(scope, &function.0);
        let function = v8::Local::<v8::Function>::try_from(local)
            .map_err(|_| HostError::NotCallable(ValueStringifier::render(scope, local)))?;

        let receiver = match receiver {
            Some(receiver) => v8::Local::new(scope, &receiver.0),
            None => v8::Local::new(scope, &self.global).into(),
        };
        let args = args
            .iter()
            .map(|arg| v8::Local::new(scope, &arg.0))
            .collect::<Vec<_>>();

        let result = engine::call_function(scope, function, receiver, &args)?;
        Ok(ScriptValue(result))
    }
}

impl Drop for ScriptRuntimeSession {
    fn drop(&mut self) {
        // Bundles may hold mappings; release them before the isolate goes.
        self.bridge.clear_bundle();
        log::debug!("script session destroyed");
    }
}
