//! File access helpers: whole-file text reads and memory-mapped views.

use crate::runtime::error::IoError;
use memmap2::{Mmap, MmapMut};
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};

/// Read a whole file and decode it as UTF-8.
pub fn read_text_file(path: impl AsRef<Path>) -> Result<String, IoError> {
    let path = path.as_ref();
    let mut file = File::open(path).map_err(|source| IoError::NotFound {
        path: path.to_path_buf(),
        source,
    })?;

    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).map_err(|err| IoError::Fatal {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;

    String::from_utf8(bytes).map_err(|err| IoError::Fatal {
        path: path.to_path_buf(),
        reason: format!("invalid UTF-8 at byte {}", err.utf8_error().valid_up_to()),
    })
}

enum MappedView {
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

/// A file mapped into memory.
///
/// Fields drop in declaration order, so the view is unmapped before the
/// file handle closes.
pub struct MappedBuffer {
    view: MappedView,
    _file: File,
    path: PathBuf,
}

impl MappedBuffer {
    pub fn as_bytes(&self) -> &[u8] {
        match &self.view {
            MappedView::ReadOnly(map) => map,
            MappedView::ReadWrite(map) => map,
        }
    }

    /// Mutable access, only for read-write mappings.
    pub fn as_bytes_mut(&mut self) -> Option<&mut [u8]> {
        match &mut self.view {
            MappedView::ReadOnly(_) => None,
            MappedView::ReadWrite(map) => Some(map),
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_writable(&self) -> bool {
        matches!(self.view, MappedView::ReadWrite(_))
    }

    /// Flush a writable view back to disk. No-op for read-only views.
    pub fn flush(&self) -> Result<(), IoError> {
        match &self.view {
            MappedView::ReadOnly(_) => Ok(()),
            MappedView::ReadWrite(map) => map.flush().map_err(|err| IoError::Fatal {
                path: self.path.clone(),
                reason: err.to_string(),
            }),
        }
    }
}

impl std::fmt::Debug for MappedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedBuffer")
            .field("path", &self.path)
            .field("len", &self.len())
            .field("writable", &self.is_writable())
            .finish()
    }
}

/// Map a file read-only.
pub fn map_file_read_only(path: impl AsRef<Path>) -> Result<MappedBuffer, IoError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| IoError::NotFound {
        path: path.to_path_buf(),
        source,
    })?;

    // SAFETY: the mapping is private to this process and the file handle is
    // held for the mapping's lifetime. Concurrent truncation by another
    // process is outside what this host guards against.
    let map = unsafe { Mmap::map(&file) }.map_err(|source| {
        log::error!("mapping {} failed, closing handle", path.display());
        IoError::Map {
            path: path.to_path_buf(),
            source,
        }
    })?;

    Ok(MappedBuffer {
        view: MappedView::ReadOnly(map),
        _file: file,
        path: path.to_path_buf(),
    })
}

/// Map a file for reading and writing.
pub fn map_file_read_write(path: impl AsRef<Path>) -> Result<MappedBuffer, IoError> {
    let path = path.as_ref();
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|source| IoError::NotFound {
            path: path.to_path_buf(),
            source,
        })?;

    // SAFETY: see `map_file_read_only`.
    let map = unsafe { MmapMut::map_mut(&file) }.map_err(|source| {
        log::error!("mapping {} failed, closing handle", path.display());
        IoError::Map {
            path: path.to_path_buf(),
            source,
        }
    })?;

    Ok(MappedBuffer {
        view: MappedView::ReadWrite(map),
        _file: file,
        path: path.to_path_buf(),
    })
}
