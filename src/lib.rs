//! script-host
//!
//! Hosts a V8 engine for running application bundles. Sessions load plain
//! scripts or module bundles, execute from on-disk bytecode caches and talk
//! to the embedder through a handful of native globals.

pub mod runtime;

pub use runtime::bundle::{BundleKind, IndexedBundle, ModuleBundle, ModuleRecord, PathBundle};
pub use runtime::cache::BytecodeCache;
pub use runtime::config::SessionConfig;
pub use runtime::error::{BundleError, CompileError, EngineError, HostError, IoError, RunError};
pub use runtime::handle::SessionHandle;
pub use runtime::logging::{LogLevel, LoggingSink};
pub use runtime::session::{ScriptRuntimeSession, ScriptValue};
