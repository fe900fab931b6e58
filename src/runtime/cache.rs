//! Bytecode caches backed by V8 code caches.
//!
//! A cache is fresh only while its modification time is strictly newer than
//! its source's. New caches are staged next to the target as `<cache>.tmp`
//! and renamed into place, so an interrupted write never clobbers a good
//! cache. A cache the engine refuses to consume is deleted.

use crate::runtime::context::SerializedExecutionContext;
use crate::runtime::engine::{caught_exception, script_origin, v8_string};
use crate::runtime::error::{CompileError, EngineError, RunError};
use crate::runtime::io::{map_file_read_only, read_text_file};
use deno_core::v8;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// A source file paired with the cache compiled from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BytecodeCache {
    source_path: PathBuf,
    cache_path: PathBuf,
}

impl BytecodeCache {
    pub fn new(source_path: impl Into<PathBuf>, cache_path: impl Into<PathBuf>) -> Self {
        Self {
            source_path: source_path.into(),
            cache_path: cache_path.into(),
        }
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    /// Where a new cache is written before it replaces the old one.
    pub fn staging_path(&self) -> PathBuf {
        let mut name = OsString::from(self.cache_path.as_os_str());
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// True when the cache exists and is strictly newer than the source.
    pub fn is_fresh(&self) -> bool {
        match (modified(&self.cache_path), modified(&self.source_path)) {
            (Some(cache), Some(source)) => cache > source,
            _ => false,
        }
    }

    /// Serialize the source into the cache unless the cache is already fresh.
    ///
    /// Returns `true` when a new cache was written.
    pub fn compile(
        &self,
        scope: &mut v8::HandleScope,
        script_id: i32,
    ) -> Result<bool, CompileError> {
        let source = read_text_file(&self.source_path)?;
        if self.is_fresh() {
            log::debug!("{} is up to date", self.cache_path.display());
            return Ok(false);
        }

        let bytecode = self.serialize(scope, &source, script_id)?;
        let staged = StagedCache::write(self.staging_path(), &bytecode)?;
        staged.commit(&self.cache_path)?;
        log::debug!(
            "wrote {} bytes of bytecode to {}",
            bytecode.len(),
            self.cache_path.display()
        );
        Ok(true)
    }

    fn serialize(
        &self,
        scope: &mut v8::HandleScope,
        source: &str,
        script_id: i32,
    ) -> Result<Vec<u8>, CompileError> {
        let tc = &mut v8::TryCatch::new(scope);
        let code = v8_string(tc, source)?;
        let url = self.source_path.to_string_lossy();
        let origin = script_origin(tc, &url, script_id)?;
        let mut source = v8::script_compiler::Source::new(code, Some(&origin));

        let unbound = v8::script_compiler::compile_unbound_script(
            tc,
            &mut source,
            v8::script_compiler::CompileOptions::EagerCompile,
            v8::script_compiler::NoCacheReason::NoReason,
        )
        .ok_or_else(|| caught_exception(tc))?;

        let cache = unbound
            .create_code_cache()
            .ok_or_else(|| CompileError::Serialize {
                path: self.source_path.clone(),
            })?;
        Ok(cache.to_vec())
    }

    /// Execute from the cache.
    ///
    /// Fails with [`RunError::Stale`] without touching anything when the
    /// cache is not fresh. A cache the engine rejects is removed and
    /// reported as [`RunError::FatalCorruption`].
    pub fn run(
        &self,
        scope: &mut v8::HandleScope,
        source_url: &str,
        script_id: i32,
    ) -> Result<v8::Global<v8::Value>, RunError> {
        if !self.is_fresh() {
            return Err(RunError::Stale {
                cache: self.cache_path.clone(),
            });
        }

        let bytecode = map_file_read_only(&self.cache_path)?;
        let source = read_text_file(&self.source_path)?;
        let mut context = SerializedExecutionContext::new(bytecode, source, source_url);

        let outcome = consume(scope, &context, script_id);
        context.dispose();

        match outcome {
            Ok(value) => Ok(value),
            Err(CachedRun::Rejected) => {
                log::warn!("engine rejected {}, deleting it", self.cache_path.display());
                if let Err(err) = fs::remove_file(&self.cache_path) {
                    log::error!("failed to delete {}: {}", self.cache_path.display(), err);
                }
                Err(RunError::FatalCorruption {
                    cache: self.cache_path.clone(),
                })
            }
            Err(CachedRun::Engine(err)) => Err(RunError::Engine(err)),
        }
    }
}

enum CachedRun {
    Rejected,
    Engine(EngineError),
}

impl From<EngineError> for CachedRun {
    fn from(err: EngineError) -> Self {
        CachedRun::Engine(err)
    }
}

fn consume(
    scope: &mut v8::HandleScope,
    context: &SerializedExecutionContext,
    script_id: i32,
) -> Result<v8::Global<v8::Value>, CachedRun> {
    let tc = &mut v8::TryCatch::new(scope);
    let text = context.load_source().unwrap_or_default();
    let code = v8_string(tc, text)?;
    let origin = script_origin(tc, context.source_url(), script_id)?;

    let cached = v8::script_compiler::CachedData::new(context.bytecode());
    let mut source =
        v8::script_compiler::Source::new_with_cached_data(code, Some(&origin), cached);
    let compiled = v8::script_compiler::compile_unbound_script(
        tc,
        &mut source,
        v8::script_compiler::CompileOptions::ConsumeCodeCache,
        v8::script_compiler::NoCacheReason::NoReason,
    );

    let rejected = source
        .get_cached_data()
        .map(|data| data.rejected())
        .unwrap_or(false);
    if rejected {
        return Err(CachedRun::Rejected);
    }

    let unbound = compiled.ok_or_else(|| caught_exception(tc))?;
    let script = unbound.bind_to_current_context(tc);
    match script.run(tc) {
        Some(value) => Ok(v8::Global::new(tc, value)),
        None => Err(caught_exception(tc).into()),
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

/// A cache written to its staging path but not yet moved into place.
///
/// Dropping without [`commit`](Self::commit) removes the staging file.
pub struct StagedCache {
    path: PathBuf,
    committed: bool,
}

impl StagedCache {
    pub fn write(path: impl Into<PathBuf>, bytes: &[u8]) -> Result<Self, CompileError> {
        let path = path.into();
        let write_err = |source| CompileError::Write {
            path: path.clone(),
            source,
        };

        let mut file = File::create(&path).map_err(write_err)?;
        // From here on the staging file exists and is cleaned up on drop.
        let staged = Self {
            path: path.clone(),
            committed: false,
        };
        file.write_all(bytes).map_err(write_err)?;
        file.sync_all().map_err(write_err)?;
        Ok(staged)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace `target` with the staged file.
    pub fn commit(mut self, target: &Path) -> Result<(), CompileError> {
        match fs::remove_file(target) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(source) => {
                return Err(CompileError::Write {
                    path: target.to_path_buf(),
                    source,
                })
            }
        }
        fs::rename(&self.path, target).map_err(|source| CompileError::Write {
            path: target.to_path_buf(),
            source,
        })?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for StagedCache {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != ErrorKind::NotFound {
                log::warn!("failed to remove {}: {}", self.path.display(), err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::initialize_platform_once;
    use deno_core::{JsRuntime, RuntimeOptions};
    use std::time::Duration;

    fn runtime() -> JsRuntime {
        JsRuntime::new(RuntimeOptions {
            v8_platform: Some(initialize_platform_once()),
            ..Default::default()
        })
    }

    /// Write `source` with a modification time well in the past so a cache
    /// written afterwards is strictly newer.
    fn write_source(path: &Path, source: &str) {
        fs::write(path, source).unwrap();
        backdate(path, 60);
    }

    fn backdate(path: &Path, seconds: u64) {
        let file = File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(seconds))
            .unwrap();
    }

    fn number(runtime: &mut JsRuntime, value: v8::Global<v8::Value>) -> f64 {
        let scope = &mut runtime.handle_scope();
        let local = v8::Local::new(scope, value);
        local.number_value(scope).unwrap()
    }

    #[test]
    fn test_staging_path() {
        let cache = BytecodeCache::new("/tmp/app.js", "/tmp/app.js.cache");
        assert_eq!(cache.staging_path(), PathBuf::from("/tmp/app.js.cache.tmp"));
    }

    #[test]
    fn test_freshness() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("app.js");
        let cache_path = dir.path().join("app.cache");
        let cache = BytecodeCache::new(&source, &cache_path);

        assert!(!cache.is_fresh());

        write_source(&source, "1");
        assert!(!cache.is_fresh());

        fs::write(&cache_path, b"bytes").unwrap();
        assert!(cache.is_fresh());

        // Equal timestamps are not fresh.
        let now = SystemTime::now();
        File::options()
            .write(true)
            .open(&source)
            .unwrap()
            .set_modified(now)
            .unwrap();
        File::options()
            .write(true)
            .open(&cache_path)
            .unwrap()
            .set_modified(now)
            .unwrap();
        assert!(!cache.is_fresh());
    }

    #[test]
    fn test_compile_then_run() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("app.js");
        let cache_path = dir.path().join("app.cache");
        write_source(&source, "var base = 40; base + 2");

        let mut runtime = runtime();
        let cache = BytecodeCache::new(&source, &cache_path);
        {
            let scope = &mut runtime.handle_scope();
            assert!(cache.compile(scope, 1).unwrap());
            assert!(!cache.compile(scope, 2).unwrap());
        }
        assert!(cache_path.exists());
        assert!(!cache.staging_path().exists());

        let value = {
            let scope = &mut runtime.handle_scope();
            cache.run(scope, "app.js", 3).unwrap()
        };
        assert_eq!(number(&mut runtime, value), 42.0);
    }

    #[test]
    fn test_compile_reports_syntax_errors() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("broken.js");
        write_source(&source, "var = ;");

        let mut runtime = runtime();
        let cache = BytecodeCache::new(&source, dir.path().join("broken.cache"));
        let scope = &mut runtime.handle_scope();
        let err = cache.compile(scope, 1).unwrap_err();
        assert!(matches!(err, CompileError::Engine(EngineError::Exception { .. })));
        assert!(!cache.staging_path().exists());
    }

    #[test]
    fn test_compile_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let mut runtime = runtime();
        let cache = BytecodeCache::new(dir.path().join("absent.js"), dir.path().join("a.cache"));
        let scope = &mut runtime.handle_scope();
        assert!(matches!(
            cache.compile(scope, 1),
            Err(CompileError::Io(_))
        ));
    }

    #[test]
    fn test_stale_cache_is_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("app.js");
        let cache_path = dir.path().join("app.cache");
        fs::write(&cache_path, b"old bytecode").unwrap();
        backdate(&cache_path, 120);
        write_source(&source, "1 + 1");

        let mut runtime = runtime();
        let cache = BytecodeCache::new(&source, &cache_path);
        let scope = &mut runtime.handle_scope();
        let err = cache.run(scope, "app.js", 1).unwrap_err();

        assert!(matches!(err, RunError::Stale { .. }));
        assert_eq!(fs::read(&cache_path).unwrap(), b"old bytecode");
    }

    #[test]
    fn test_interrupted_write_keeps_original() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("app.js");
        let cache_path = dir.path().join("app.cache");
        fs::write(&cache_path, b"original").unwrap();
        let cache = BytecodeCache::new(&source, &cache_path);

        let staged = StagedCache::write(cache.staging_path(), b"replacement").unwrap();
        assert_eq!(fs::read(staged.path()).unwrap(), b"replacement");
        // Simulate a crash between the temp write and the rename.
        std::mem::forget(staged);

        assert_eq!(fs::read(&cache_path).unwrap(), b"original");
        assert!(cache.staging_path().exists());
    }

    #[test]
    fn test_abandoned_stage_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("app.cache");
        fs::write(&target, b"original").unwrap();

        let staged = StagedCache::write(dir.path().join("app.cache.tmp"), b"new").unwrap();
        drop(staged);

        assert!(!dir.path().join("app.cache.tmp").exists());
        assert_eq!(fs::read(&target).unwrap(), b"original");
    }

    #[test]
    fn test_commit_replaces_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("app.cache");
        fs::write(&target, b"original").unwrap();

        let staged = StagedCache::write(dir.path().join("app.cache.tmp"), b"new").unwrap();
        staged.commit(&target).unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"new");
        assert!(!dir.path().join("app.cache.tmp").exists());
    }

    #[test]
    fn test_corrupted_cache_heals() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("heal.js");
        let cache_path = dir.path().join("heal.cache");
        write_source(&source, "var healed = 'corruption' + 'test'; healed.length");
        let garbage = (0..4096u32)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
            .collect::<Vec<_>>();
        fs::write(&cache_path, garbage).unwrap();

        let cache = BytecodeCache::new(&source, &cache_path);
        assert!(cache.is_fresh());

        let mut runtime = runtime();
        let err = {
            let scope = &mut runtime.handle_scope();
            cache.run(scope, "heal.js", 1).unwrap_err()
        };
        assert!(matches!(err, RunError::FatalCorruption { .. }));
        assert!(!cache_path.exists());

        let value = {
            let scope = &mut runtime.handle_scope();
            assert!(cache.compile(scope, 2).unwrap());
            cache.run(scope, "heal.js", 3).unwrap()
        };
        assert_eq!(number(&mut runtime, value), 14.0);
    }

    #[test]
    fn test_damaged_payload_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("payload.js");
        let cache_path = dir.path().join("payload.cache");
        write_source(
            &source,
            "function square(x) { return x * x; }\n\
             function total(items) { return items.map(square).reduce((a, b) => a + b, 0); }\n\
             total([1, 2, 3, 4])",
        );

        let mut runtime = runtime();
        let cache = BytecodeCache::new(&source, &cache_path);
        {
            let scope = &mut runtime.handle_scope();
            assert!(cache.compile(scope, 1).unwrap());
        }

        // Header stays intact; one byte in the middle of the payload flips.
        let mut bytes = fs::read(&cache_path).unwrap();
        assert!(bytes.len() > 128);
        let middle = bytes.len() / 2;
        bytes[middle] ^= 0xff;
        fs::write(&cache_path, &bytes).unwrap();
        assert!(cache.is_fresh());

        let err = {
            let scope = &mut runtime.handle_scope();
            cache.run(scope, "payload.js", 2).unwrap_err()
        };
        assert!(matches!(err, RunError::FatalCorruption { .. }));
        assert!(!cache_path.exists());

        let value = {
            let scope = &mut runtime.handle_scope();
            assert!(cache.compile(scope, 3).unwrap());
            cache.run(scope, "payload.js", 4).unwrap()
        };
        assert_eq!(number(&mut runtime, value), 30.0);
    }

    #[test]
    fn test_runtime_errors_propagate() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("throws.js");
        let cache_path = dir.path().join("throws.cache");
        write_source(&source, "throw new Error('from cache')");

        let mut runtime = runtime();
        let cache = BytecodeCache::new(&source, &cache_path);
        let scope = &mut runtime.handle_scope();
        cache.compile(scope, 1).unwrap();
        let err = cache.run(scope, "throws.js", 2).unwrap_err();

        match err {
            RunError::Engine(EngineError::Exception { message, .. }) => {
                assert!(message.contains("from cache"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(cache_path.exists());
    }
}
