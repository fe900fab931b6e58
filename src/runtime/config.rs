//! Session configuration.
//!
//! This module defines the options a [`ScriptRuntimeSession`] is created
//! with: heap limits, a bootstrap script and which optional globals are
//! installed.
//!
//! [`ScriptRuntimeSession`]: crate::runtime::session::ScriptRuntimeSession

use crate::runtime::error::HostError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration for a single script session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum heap size in bytes (None = V8 default)
    pub max_heap_size: Option<usize>,

    /// Initial heap size in bytes (None = V8 default)
    pub initial_heap_size: Option<usize>,

    /// Script run once when the session is created
    pub bootstrap_script: Option<String>,

    /// Replace `console` with the native logging console (default: true)
    pub enable_console: bool,

    /// Install `nativePerformanceNow` (default: true)
    pub enable_native_performance_now: bool,

    /// Override the logging sink's enabled flag. `None` leaves it as is.
    pub logging_enabled: Option<bool>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_heap_size: None,
            initial_heap_size: None,
            bootstrap_script: None,
            enable_console: true,
            enable_native_performance_now: true,
            logging_enabled: None,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_heap_size(mut self, bytes: usize) -> Self {
        self.max_heap_size = Some(bytes);
        self
    }

    pub fn with_initial_heap_size(mut self, bytes: usize) -> Self {
        self.initial_heap_size = Some(bytes);
        self
    }

    pub fn with_bootstrap(mut self, source: impl Into<String>) -> Self {
        self.bootstrap_script = Some(source.into());
        self
    }

    pub fn with_console(mut self, enabled: bool) -> Self {
        self.enable_console = enabled;
        self
    }

    pub fn with_native_performance_now(mut self, enabled: bool) -> Self {
        self.enable_native_performance_now = enabled;
        self
    }

    pub fn with_logging(mut self, enabled: bool) -> Self {
        self.logging_enabled = Some(enabled);
        self
    }

    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, HostError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, HostError> {
        let text = crate::runtime::io::read_text_file(path)?;
        Self::from_json_str(&text)
    }

    /// Check that the heap settings are coherent.
    pub fn validate(&self) -> Result<(), HostError> {
        if self.initial_heap_size.is_some() && self.max_heap_size.is_none() {
            return Err(HostError::Config(
                "initial_heap_size requires max_heap_size to be set as well".to_string(),
            ));
        }

        if let (Some(initial), Some(max)) = (self.initial_heap_size, self.max_heap_size) {
            if initial > max {
                return Err(HostError::Config(format!(
                    "initial_heap_size ({}) cannot exceed max_heap_size ({})",
                    initial, max
                )));
            }
        }

        Ok(())
    }
}
