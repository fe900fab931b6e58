//! Embedded V8 script host.
//!
//! A [`ScriptRuntimeSession`](session::ScriptRuntimeSession) owns one isolate
//! and one context. It loads plain scripts and module bundles, caches
//! compiled bytecode on disk and exposes a small set of native functions to
//! the script. [`SessionHandle`](handle::SessionHandle) moves a session onto
//! its own thread so it can be driven from anywhere.

pub mod bridge;
pub mod bundle;
pub mod cache;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod handle;
pub mod io;
pub mod logging;
pub mod session;
pub mod stringify;

use deno_core::v8;
use once_cell::sync::OnceCell;

/// Process-wide V8 platform.
///
/// V8 allows exactly one platform per process. `JsRuntime` initializes V8
/// with it the first time a session is created.
static V8_PLATFORM: OnceCell<v8::SharedRef<v8::Platform>> = OnceCell::new();

/// Flags applied before V8 starts. Release builds of V8 only verify code
/// cache checksums when this is set.
const V8_FLAGS: &str = "--verify-snapshot-checksum";

/// Get the shared platform, creating it on first use.
pub fn initialize_platform_once() -> v8::SharedRef<v8::Platform> {
    V8_PLATFORM
        .get_or_init(|| {
            v8::V8::set_flags_from_string(V8_FLAGS);
            v8::new_default_platform(0, false).make_shared()
        })
        .clone()
}

/// Check if the V8 platform has been created.
pub fn is_platform_initialized() -> bool {
    V8_PLATFORM.get().is_some()
}

pub use config::SessionConfig;
pub use handle::SessionHandle;
pub use session::{ScriptRuntimeSession, ScriptValue};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::logging::LoggingSink;

    #[test]
    fn test_sessions_share_one_platform() {
        for i in 0..3 {
            let mut session = ScriptRuntimeSession::with_logging_sink(
                SessionConfig::default(),
                LoggingSink::new(),
            )
            .unwrap();
            assert!(is_platform_initialized());

            let value = session.run_script(&format!("{} * 2", i), "eval.js").unwrap();
            assert_eq!(session.as_number(&value), Some((i * 2) as f64));
            session.destroy();
        }
    }

    #[test]
    fn test_handle_with_heap_limits() {
        let config = SessionConfig::new()
            .with_max_heap_size(10 * 1024 * 1024)
            .with_initial_heap_size(1024 * 1024);

        let mut handle =
            SessionHandle::spawn_with_logging_sink(config, LoggingSink::new()).unwrap();
        assert_eq!(
            handle.run_script_sync("'hello'", "eval.js").unwrap(),
            serde_json::json!("hello")
        );
        handle.close().unwrap();
    }

    #[test]
    fn test_handle_with_bootstrap() {
        let config = SessionConfig::new().with_bootstrap("globalThis.VERSION = '1.0.0';");
        let handle = SessionHandle::spawn_with_logging_sink(config, LoggingSink::new()).unwrap();
        assert_eq!(handle.get_global_sync("VERSION").unwrap(), "\"1.0.0\"");
    }
}
