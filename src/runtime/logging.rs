//! Script-side logging sink.
//!
//! Scripts log through `nativeLoggingHook` and the redirected `console`
//! object. Both land in a [`LoggingSink`], which forwards to a replaceable
//! writer while logging is enabled and drops output otherwise.

use once_cell::sync::Lazy;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// `log` target used by the default writer.
pub const SCRIPT_LOG_TARGET: &str = "script_host::js";

/// Severity attached to a script log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogLevel {
    Trace,
    Info,
    Warn,
    Error,
    Log,
}

impl LogLevel {
    /// Map the numeric level scripts pass to `nativeLoggingHook`.
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => LogLevel::Trace,
            1 => LogLevel::Info,
            2 => LogLevel::Warn,
            3 => LogLevel::Error,
            _ => LogLevel::Log,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Log => "log",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Writer invoked for every enabled log line.
pub type LogWriter = dyn Fn(LogLevel, &str) + Send + Sync;

struct SinkInner {
    writer: RwLock<Arc<LogWriter>>,
    enabled: AtomicBool,
}

static PROCESS_SINK: Lazy<LoggingSink> = Lazy::new(LoggingSink::new);

/// Shared handle to a log writer plus its enable flag.
///
/// Clones share state: replacing the writer through one clone is visible
/// through all of them.
#[derive(Clone)]
pub struct LoggingSink {
    inner: Arc<SinkInner>,
}

impl LoggingSink {
    /// A fresh sink using the default writer. Enabled in debug builds only.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SinkInner {
                writer: RwLock::new(Arc::new(default_writer)),
                enabled: AtomicBool::new(cfg!(debug_assertions)),
            }),
        }
    }

    /// The process-wide sink sessions use unless given their own.
    pub fn process() -> Self {
        PROCESS_SINK.clone()
    }

    /// Swap in a new writer.
    pub fn replace<F>(&self, writer: F)
    where
        F: Fn(LogLevel, &str) + Send + Sync + 'static,
    {
        match self.inner.writer.write() {
            Ok(mut guard) => *guard = Arc::new(writer),
            Err(poisoned) => *poisoned.into_inner() = Arc::new(writer),
        }
    }

    /// Restore the default writer.
    pub fn reset(&self) {
        self.replace(default_writer);
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Forward one line to the writer. Dropped while disabled.
    pub fn log(&self, level: LogLevel, message: &str) {
        if !self.is_enabled() {
            return;
        }
        // Release the lock before calling out so writers may replace themselves.
        let writer = match self.inner.writer.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        writer(level, message);
    }

    pub fn same_as(&self, other: &LoggingSink) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for LoggingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LoggingSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoggingSink")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

fn default_writer(level: LogLevel, message: &str) {
    log::debug!(target: SCRIPT_LOG_TARGET, "[{}] {}", level, message);
}
