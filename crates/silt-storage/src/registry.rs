use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use silt_common::{SiltError, SiltResult};

use crate::filesystem::{FileHandle, FileSystem};
use crate::page_id::FileId;

/// An open backing file, shared by every `FileRef` to the same path. Pins
/// and in-flight write-backs hold an `Arc` on the entry, so the OS handle
/// outlives the registry slot when pages are still in use.
pub(crate) struct FileEntry {
    pub file_id: FileId,
    pub path: PathBuf,
    pub handle: Arc<dyn FileHandle>,
    /// Logical size in bytes. Can exceed the on-disk size after a growing
    /// truncate until the tail pages are materialised.
    size: AtomicU64,
    /// Live `FileRef` handles.
    refs: AtomicUsize,
    /// Live `PageRef` pins into this file's frames. A `PageRef` may outlive
    /// every `FileRef`, so the id lookup stays until this reaches zero.
    pins: AtomicUsize,
    /// Set once the last `FileRef` dropped.
    closed: AtomicBool,
}

impl FileEntry {
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn set_size(&self, new_size: u64) {
        self.size.store(new_size, Ordering::Release);
    }

    pub fn pin_count(&self) -> usize {
        self.pins.load(Ordering::Acquire)
    }

    pub fn add_pin(&self) {
        self.pins.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one pin; returns the remaining count.
    pub fn drop_pin(&self) -> usize {
        let prev = self.pins.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "drop_pin of an unpinned file");
        prev - 1
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Maps paths to stable file ids and tracks open entries.
///
/// Reference counts are adjusted only while holding the `by_path` entry for
/// the file, which serialises concurrent opens and closes of one path.
pub(crate) struct FileRegistry {
    fs: Arc<dyn FileSystem>,
    by_path: DashMap<PathBuf, FileId>,
    entries: DashMap<FileId, Arc<FileEntry>>,
    /// Wider than the id space on purpose, so exhaustion is detectable
    /// instead of wrapping into live ids.
    next_file_id: AtomicU32,
}

impl FileRegistry {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self {
            fs,
            by_path: DashMap::new(),
            entries: DashMap::new(),
            next_file_id: AtomicU32::new(0),
        }
    }

    /// Open `path`, assigning the next file id on first open. Reopening a
    /// path that is already open shares its entry and id.
    pub fn open(&self, path: &Path) -> SiltResult<Arc<FileEntry>> {
        match self.by_path.entry(path.to_path_buf()) {
            Entry::Occupied(occupied) => {
                let entry = Arc::clone(
                    self.entries
                        .get(occupied.get())
                        .expect("registered file has an entry")
                        .value(),
                );
                entry.refs.fetch_add(1, Ordering::AcqRel);
                Ok(entry)
            }
            Entry::Vacant(vacant) => {
                let handle = self.fs.open(path)?;
                let size = handle.size()?;
                let raw_id = self.next_file_id.fetch_add(1, Ordering::Relaxed);
                if raw_id > u16::MAX as u32 {
                    return Err(SiltError::Storage("file id space exhausted".into()));
                }
                let entry = Arc::new(FileEntry {
                    file_id: FileId(raw_id as u16),
                    path: path.to_path_buf(),
                    handle,
                    size: AtomicU64::new(size),
                    refs: AtomicUsize::new(1),
                    pins: AtomicUsize::new(0),
                    closed: AtomicBool::new(false),
                });
                self.entries.insert(entry.file_id, Arc::clone(&entry));
                vacant.insert(entry.file_id);
                Ok(entry)
            }
        }
    }

    /// Look up an open file by id. Write-back paths use this instead of a
    /// stored handle, so file release stays explicit.
    pub fn get(&self, file_id: FileId) -> Option<Arc<FileEntry>> {
        self.entries.get(&file_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Drop one `FileRef`'s reference. The last one removes the path
    /// mapping (a later reopen gets a fresh id), marks the entry closed and
    /// returns true. The id lookup stays until `retire`, so write-backs of
    /// still-pinned pages can reach the handle.
    pub fn release(&self, entry: &Arc<FileEntry>) -> bool {
        let mut last = false;
        self.by_path.remove_if(&entry.path, |_, _| {
            last = entry.refs.fetch_sub(1, Ordering::AcqRel) == 1;
            if last {
                entry.closed.store(true, Ordering::Release);
            }
            last
        });
        last
    }

    /// Drop the id lookup of a closed file once its last pin is gone.
    /// Idempotent; the id is never reused.
    pub fn retire(&self, entry: &Arc<FileEntry>) {
        self.entries.remove(&entry.file_id);
    }
}
