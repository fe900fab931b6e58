//! Error taxonomy for the script host.
//!
//! Each layer returns its own error type; [`HostError`] is the umbrella the
//! session surfaces to callers.

use std::path::PathBuf;
use thiserror::Error;

/// File access failures.
#[derive(Debug, Error)]
pub enum IoError {
    #[error("unable to open '{}': {source}", path.display())]
    NotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to map '{}': {source}", path.display())]
    Map {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to read '{}': {reason}", path.display())]
    Fatal { path: PathBuf, reason: String },
}

/// Failures while decoding a module bundle.
#[derive(Debug, Error)]
pub enum BundleError {
    #[error(transparent)]
    Io(#[from] IoError),
    #[error("bundle '{}' is truncated: {what}", path.display())]
    Truncated { path: PathBuf, what: String },
    #[error("bundle '{}' does not start with the bundle magic number", path.display())]
    BadMagic { path: PathBuf },
    #[error("module {index} not found in bundle")]
    ModuleNotFound { index: u32 },
    #[error("{what} is not valid UTF-8")]
    InvalidUtf8 { what: String },
}

/// Failures reported by the script engine itself.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("{message}")]
    Exception {
        message: String,
        stack: Option<String>,
    },
    #[error("engine allocation failed: {0}")]
    Allocation(&'static str),
    #[error("JSON conversion failed: {0}")]
    Json(String),
    #[error("execution terminated without an exception")]
    Terminated,
}

/// Failures while producing a bytecode cache.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Io(#[from] IoError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("engine produced no bytecode for '{}'", path.display())]
    Serialize { path: PathBuf },
    #[error("unable to write '{}': {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failures while executing from a bytecode cache.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("bytecode cache '{}' is older than its source", cache.display())]
    Stale { cache: PathBuf },
    #[error("bytecode cache '{}' was rejected by the engine and has been removed", cache.display())]
    FatalCorruption { cache: PathBuf },
    #[error(transparent)]
    Io(#[from] IoError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Errors surfaced by [`crate::ScriptRuntimeSession`] and [`crate::SessionHandle`].
#[derive(Debug, Error)]
pub enum HostError {
    #[error(transparent)]
    Io(#[from] IoError),
    #[error(transparent)]
    Bundle(#[from] BundleError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Run(#[from] RunError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("{0} hook is already registered")]
    HookAlreadySet(&'static str),
    #[error("Could not resolve '__fbBatchedBridge' object. Check the JavaScript bundle to ensure it is generated correctly.")]
    BridgeNotFound,
    #[error("'{0}' is not a function")]
    NotCallable(String),
    #[error("cannot read '{0}' from a non-object value")]
    NotAnObject(String),
    #[error("session has been shut down")]
    Shutdown,
    #[error("session thread error: {0}")]
    Thread(String),
}
