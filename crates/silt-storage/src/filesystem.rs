use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use silt_common::{SiltError, SiltResult};

/// Abstract file system consumed by the buffer manager.
///
/// Implementations include:
/// - `OsFileSystem`: the host file system
/// - `MemoryFileSystem`: in-memory files for testing
pub trait FileSystem: Send + Sync {
    /// Open `path` for reading and writing, creating it when absent.
    fn open(&self, path: &Path) -> SiltResult<Arc<dyn FileHandle>>;
}

/// An open backing file. Closed when the last reference drops.
pub trait FileHandle: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`, returning the number of
    /// bytes actually read. Short reads happen only at end of file.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> SiltResult<usize>;

    /// Write all of `buf` at `offset`, extending the file when
    /// `offset + buf.len()` exceeds its size.
    fn write_at(&self, offset: u64, buf: &[u8]) -> SiltResult<()>;

    /// Current size in bytes.
    fn size(&self) -> SiltResult<u64>;

    /// Grow or shrink the file to exactly `new_size` bytes.
    fn truncate(&self, new_size: u64) -> SiltResult<()>;
}

/// Host file system backed by `std::fs`.
pub struct OsFileSystem;

impl FileSystem for OsFileSystem {
    fn open(&self, path: &Path) -> SiltResult<Arc<dyn FileHandle>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|err| {
                SiltError::Storage(format!("failed to open {}: {err}", path.display()))
            })?;
        Ok(Arc::new(OsFile {
            file: Mutex::new(file),
        }))
    }
}

struct OsFile {
    file: Mutex<File>,
}

impl FileHandle for OsFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> SiltResult<usize> {
        let mut file = self.file.lock().unwrap();
        let len = file.seek(SeekFrom::End(0))?;
        if offset >= len {
            return Ok(0);
        }
        file.seek(SeekFrom::Start(offset))?;
        let available = ((len - offset) as usize).min(buf.len());
        file.read_exact(&mut buf[..available])?;
        Ok(available)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> SiltResult<()> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(())
    }

    fn size(&self) -> SiltResult<u64> {
        Ok(self.file.lock().unwrap().metadata()?.len())
    }

    fn truncate(&self, new_size: u64) -> SiltResult<()> {
        self.file.lock().unwrap().set_len(new_size)?;
        Ok(())
    }
}

/// In-memory file system for tests and benches. Files are byte vectors
/// shared between every handle opened on the same path.
pub struct MemoryFileSystem {
    files: Mutex<HashMap<PathBuf, Arc<Mutex<Vec<u8>>>>>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem for MemoryFileSystem {
    fn open(&self, path: &Path) -> SiltResult<Arc<dyn FileHandle>> {
        let mut files = self.files.lock().unwrap();
        let bytes = files
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone();
        Ok(Arc::new(MemoryFile { bytes }))
    }
}

struct MemoryFile {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl FileHandle for MemoryFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> SiltResult<usize> {
        let bytes = self.bytes.lock().unwrap();
        let len = bytes.len() as u64;
        if offset >= len {
            return Ok(0);
        }
        let available = ((len - offset) as usize).min(buf.len());
        let start = offset as usize;
        buf[..available].copy_from_slice(&bytes[start..start + available]);
        Ok(available)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> SiltResult<()> {
        let mut bytes = self.bytes.lock().unwrap();
        let end = offset as usize + buf.len();
        if bytes.len() < end {
            bytes.resize(end, 0);
        }
        bytes[offset as usize..end].copy_from_slice(buf);
        Ok(())
    }

    fn size(&self) -> SiltResult<u64> {
        Ok(self.bytes.lock().unwrap().len() as u64)
    }

    fn truncate(&self, new_size: u64) -> SiltResult<()> {
        self.bytes.lock().unwrap().resize(new_size as usize, 0);
        Ok(())
    }
}
