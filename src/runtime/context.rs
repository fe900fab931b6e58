//! Resources backing one execution from a bytecode cache.

use crate::runtime::io::MappedBuffer;
use std::cell::Cell;

/// Owns the mapped bytecode and the source text for a single serialized
/// execution.
///
/// The engine may ask for the source at any point while the bytecode is in
/// use, so both live here until [`dispose`](Self::dispose). Disposal is
/// idempotent and does not require that the source was ever handed out.
pub struct SerializedExecutionContext {
    bytecode: Option<MappedBuffer>,
    source: Option<String>,
    source_url: String,
    loaded: Cell<bool>,
    disposed: bool,
}

impl SerializedExecutionContext {
    pub fn new(bytecode: MappedBuffer, source: String, source_url: impl Into<String>) -> Self {
        Self {
            bytecode: Some(bytecode),
            source: Some(source),
            source_url: source_url.into(),
            loaded: Cell::new(false),
            disposed: false,
        }
    }

    /// Mapped bytecode. Empty once disposed.
    pub fn bytecode(&self) -> &[u8] {
        self.bytecode
            .as_ref()
            .map(MappedBuffer::as_bytes)
            .unwrap_or_default()
    }

    /// Hand the source text to the engine.
    pub fn load_source(&self) -> Option<&str> {
        let source = self.source.as_deref()?;
        self.loaded.set(true);
        Some(source)
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn was_loaded(&self) -> bool {
        self.loaded.get()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Release the mapping, then the source text.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        if !self.loaded.get() {
            log::debug!("disposing {} before its source was loaded", self.source_url);
        }
        self.bytecode = None;
        self.source = None;
        self.disposed = true;
    }
}

impl Drop for SerializedExecutionContext {
    fn drop(&mut self) {
        self.dispose();
    }
}
