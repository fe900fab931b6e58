//! Module bundle formats.
//!
//! Two layouts are understood:
//!
//! * **Indexed**: one binary file holding a little-endian header
//!   `[magic, module_count, startup_length]`, a table of `{offset, length}`
//!   entries, the startup code and then every module blob. Module offsets are
//!   relative to the end of the table.
//! * **Path**: a plain startup file next to a `js-modules/` directory that
//!   contains an `UNBUNDLE` marker and one `<index>.js` file per module.

use crate::runtime::error::{BundleError, IoError};
use crate::runtime::io::{map_file_read_only, read_text_file, MappedBuffer};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Magic number leading both the indexed bundle and the `UNBUNDLE` marker.
pub const MAGIC_FILE_HEADER: u32 = 0xFB0B_D1E5;

const WORD: usize = 4;
const HEADER_SIZE: usize = 3 * WORD;
const TABLE_ENTRY_SIZE: usize = 2 * WORD;

const MODULES_DIR: &str = "js-modules";
const UNBUNDLE_MARKER: &str = "UNBUNDLE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleKind {
    Plain,
    PathBundle,
    IndexedBundle,
}

/// Decide how the file at `path` should be loaded.
///
/// Unreadable files classify as [`BundleKind::Plain`]; the subsequent read
/// reports the real error.
pub fn classify(path: impl AsRef<Path>) -> BundleKind {
    let path = path.as_ref();
    if has_magic_file_header(unbundle_marker_path(path)) {
        BundleKind::PathBundle
    } else if has_magic_file_header(path) {
        BundleKind::IndexedBundle
    } else {
        BundleKind::Plain
    }
}

/// True if the file begins with [`MAGIC_FILE_HEADER`] in little-endian order.
pub fn has_magic_file_header(path: impl AsRef<Path>) -> bool {
    let mut header = [0u8; WORD];
    match File::open(path.as_ref()) {
        Ok(mut file) => {
            file.read_exact(&mut header).is_ok()
                && u32::from_le_bytes(header) == MAGIC_FILE_HEADER
        }
        Err(_) => false,
    }
}

fn modules_dir(path: &Path) -> PathBuf {
    path.parent()
        .unwrap_or_else(|| Path::new(""))
        .join(MODULES_DIR)
}

fn unbundle_marker_path(path: &Path) -> PathBuf {
    modules_dir(path).join(UNBUNDLE_MARKER)
}

/// A module's source with the URL it should be evaluated under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRecord {
    pub source_text: String,
    pub source_url: String,
}

impl ModuleRecord {
    fn new(index: u32, source_text: String) -> Self {
        Self {
            source_text,
            source_url: format!("{index}.js"),
        }
    }
}

/// Source of startup code and lazily required modules.
pub trait ModuleBundle {
    /// Code executed first when the bundle is run.
    fn startup_code(&self) -> Result<String, BundleError>;

    /// Fetch one module by index.
    fn module(&self, index: u32) -> Result<ModuleRecord, BundleError>;
}

/// Directory-of-files bundle. Nothing is read until asked for.
#[derive(Debug, Clone)]
pub struct PathBundle {
    startup_path: PathBuf,
    modules_dir: PathBuf,
}

impl PathBundle {
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        Self {
            startup_path: path.to_path_buf(),
            modules_dir: modules_dir(path),
        }
    }

    pub fn modules_dir(&self) -> &Path {
        &self.modules_dir
    }
}

impl ModuleBundle for PathBundle {
    fn startup_code(&self) -> Result<String, BundleError> {
        Ok(read_text_file(&self.startup_path)?)
    }

    fn module(&self, index: u32) -> Result<ModuleRecord, BundleError> {
        let path = self.modules_dir.join(format!("{index}.js"));
        match read_text_file(&path) {
            Ok(text) => Ok(ModuleRecord::new(index, text)),
            Err(IoError::NotFound { .. }) => Err(BundleError::ModuleNotFound { index }),
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TableEntry {
    offset: u32,
    length: u32,
}

/// Single-file bundle backed by a read-only mapping.
#[derive(Debug)]
pub struct IndexedBundle {
    table: Vec<TableEntry>,
    base_offset: usize,
    startup_code: String,
    buffer: MappedBuffer,
}

impl IndexedBundle {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BundleError> {
        let path = path.as_ref();
        let buffer = map_file_read_only(path)?;
        let bytes = buffer.as_bytes();

        let truncated = |what: &str| BundleError::Truncated {
            path: path.to_path_buf(),
            what: what.to_string(),
        };

        let header = bytes.get(..HEADER_SIZE).ok_or_else(|| truncated("header"))?;
        if read_u32(header, 0) != MAGIC_FILE_HEADER {
            return Err(BundleError::BadMagic {
                path: path.to_path_buf(),
            });
        }
        let count = read_u32(header, 1) as usize;
        let startup_len = read_u32(header, 2) as usize;

        let table_size = count
            .checked_mul(TABLE_ENTRY_SIZE)
            .ok_or_else(|| truncated("module table"))?;
        let base_offset = HEADER_SIZE + table_size;
        let table_bytes = bytes
            .get(HEADER_SIZE..base_offset)
            .ok_or_else(|| truncated("module table"))?;
        let table = table_bytes
            .chunks_exact(TABLE_ENTRY_SIZE)
            .map(|entry| TableEntry {
                offset: read_u32(entry, 0),
                length: read_u32(entry, 1),
            })
            .collect::<Vec<_>>();

        let startup_bytes = bytes
            .get(base_offset..base_offset + startup_len)
            .ok_or_else(|| truncated("startup code"))?;
        let startup_code = decode(startup_bytes, "startup code")?;

        Ok(Self {
            table,
            base_offset,
            startup_code,
            buffer,
        })
    }

    pub fn module_count(&self) -> usize {
        self.table.len()
    }
}

impl ModuleBundle for IndexedBundle {
    fn startup_code(&self) -> Result<String, BundleError> {
        Ok(self.startup_code.clone())
    }

    fn module(&self, index: u32) -> Result<ModuleRecord, BundleError> {
        let entry = self
            .table
            .get(index as usize)
            .filter(|entry| entry.length > 0)
            .ok_or(BundleError::ModuleNotFound { index })?;

        let start = self.base_offset + entry.offset as usize;
        let end = start + entry.length as usize;
        let bytes = self
            .buffer
            .as_bytes()
            .get(start..end)
            .ok_or_else(|| BundleError::Truncated {
                path: self.buffer.path().to_path_buf(),
                what: format!("module {index}"),
            })?;

        let text = decode(bytes, &format!("module {index}"))?;
        Ok(ModuleRecord::new(index, text))
    }
}

fn read_u32(bytes: &[u8], word: usize) -> u32 {
    let mut raw = [0u8; WORD];
    raw.copy_from_slice(&bytes[word * WORD..(word + 1) * WORD]);
    u32::from_le_bytes(raw)
}

// Packagers terminate each blob with a single NUL.
fn decode(bytes: &[u8], what: &str) -> Result<String, BundleError> {
    let bytes = bytes.strip_suffix(&[0]).unwrap_or(bytes);
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| BundleError::InvalidUtf8 {
            what: what.to_string(),
        })
}

/// Serialize an indexed bundle. `modules[i]` becomes module `i`; `None`
/// leaves an empty table entry.
pub fn write_indexed_bundle(startup_code: &str, modules: &[Option<&str>]) -> Vec<u8> {
    let startup = nul_terminated(startup_code);
    let blobs = modules
        .iter()
        .map(|module| module.map(nul_terminated).unwrap_or_default())
        .collect::<Vec<_>>();

    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC_FILE_HEADER.to_le_bytes());
    out.extend_from_slice(&(blobs.len() as u32).to_le_bytes());
    out.extend_from_slice(&(startup.len() as u32).to_le_bytes());

    let mut offset = startup.len() as u32;
    for blob in &blobs {
        let entry_offset = if blob.is_empty() { 0 } else { offset };
        out.extend_from_slice(&entry_offset.to_le_bytes());
        out.extend_from_slice(&(blob.len() as u32).to_le_bytes());
        offset += blob.len() as u32;
    }

    out.extend_from_slice(&startup);
    for blob in blobs {
        out.extend_from_slice(&blob);
    }
    out
}

fn nul_terminated(text: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(text.len() + 1);
    bytes.extend_from_slice(text.as_bytes());
    bytes.push(0);
    bytes
}
