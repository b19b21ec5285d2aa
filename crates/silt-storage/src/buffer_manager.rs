use std::path::Path;
use std::sync::{Arc, Mutex};

use hashbrown::HashMap;

use silt_common::{BufferConfig, SiltError, SiltResult};

use crate::filesystem::FileSystem;
use crate::frame::{Frame, FrameState};
use crate::page_id::{FileId, FrameId, MAX_PAGE_NO, PageAddr};
use crate::registry::{FileEntry, FileRegistry};
use crate::replacer::TwoQueueReplacer;

/// Directory state guarded by the directory latch. Bookkeeping only; the
/// latch is never held across I/O.
struct Directory {
    /// Resident and loading frames, keyed by encoded page address.
    frames: HashMap<FrameId, Arc<Frame>>,
    replacer: TwoQueueReplacer,
    /// Evicted dirty frames whose write-back has not landed yet. A miss on
    /// one of these pages waits on the old frame's io lock before loading,
    /// so the reload cannot observe pre-write-back bytes.
    writeback: HashMap<FrameId, Arc<Frame>>,
}

/// A fixed-capacity cache of fixed-size pages drawn from backing files.
///
/// All page-granular reads and writes go through pins: `FileRef::fix_page`
/// returns a `PageRef` whose frame stays resident, with stable bytes, until
/// release. Unpinned frames wait in two replacement queues, FIFO on their
/// first visit and LRU once re-pinned after queueing; eviction pops the
/// FIFO head first.
///
/// Lock order is directory latch, then a frame's io lock, then its access
/// latch, never the reverse.
pub struct BufferManager {
    page_size: usize,
    page_capacity: usize,
    registry: FileRegistry,
    dir: Mutex<Directory>,
}

impl BufferManager {
    pub fn new(filesystem: Arc<dyn FileSystem>, config: BufferConfig) -> Self {
        Self {
            page_size: config.page_size(),
            page_capacity: config.page_capacity,
            registry: FileRegistry::new(filesystem),
            dir: Mutex::new(Directory {
                frames: HashMap::new(),
                replacer: TwoQueueReplacer::new(),
                writeback: HashMap::new(),
            }),
        }
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Open `path`, creating it when absent. Reopening a path that is
    /// already open returns a handle sharing the same file id.
    pub fn open_file(&self, path: &Path) -> SiltResult<FileRef<'_>> {
        let entry = self.registry.open(path)?;
        Ok(FileRef {
            buffer: self,
            entry,
        })
    }

    /// Write every dirty resident page back to its backing file. The
    /// calling thread must not hold an exclusive pin.
    pub fn flush(&self) -> SiltResult<()> {
        for frame in self.collect_dirty(None, false) {
            let addr = frame.frame_id().page_addr();
            // A file closed since the sweep began flushes its own pages.
            let Some(entry) = self.registry.get(addr.file_id) else {
                continue;
            };
            self.flush_frame(&frame, &entry)?;
        }
        Ok(())
    }

    /// Number of frames in the directory.
    pub fn frame_count(&self) -> usize {
        self.dir.lock().unwrap().frames.len()
    }

    /// Snapshot of every frame in the directory.
    pub fn frames(&self) -> Vec<FrameInfo> {
        let dir = self.dir.lock().unwrap();
        dir.frames
            .values()
            .map(|frame| FrameInfo {
                addr: frame.frame_id().page_addr(),
                frame_id: frame.frame_id(),
                users: frame.users(),
                dirty: frame.is_dirty(),
            })
            .collect()
    }

    /// FIFO queue contents, eviction candidates first.
    pub fn fifo_list(&self) -> Vec<FrameId> {
        self.dir.lock().unwrap().replacer.fifo_ids()
    }

    /// LRU queue contents, eviction candidates first.
    pub fn lru_list(&self) -> Vec<FrameId> {
        self.dir.lock().unwrap().replacer.lru_ids()
    }

    fn fix_page<'b>(
        &'b self,
        entry: &Arc<FileEntry>,
        page_no: u64,
        exclusive: bool,
    ) -> SiltResult<PageRef<'b>> {
        if page_no > MAX_PAGE_NO {
            return Err(SiltError::Storage(format!(
                "page number {page_no} out of range"
            )));
        }
        let offset = page_no * self.page_size as u64;
        let file_size = entry.size();
        if offset >= file_size {
            return Err(SiltError::OutOfBounds {
                file_id: entry.file_id.0,
                page_no,
                file_size,
            });
        }
        let frame_id = PageAddr::new(entry.file_id, page_no).frame_id();

        loop {
            let mut dir = self.dir.lock().unwrap();

            // Hit: the page is resident or being loaded by another thread.
            if let Some(frame) = dir.frames.get(&frame_id) {
                let frame = Arc::clone(frame);
                frame.pin();
                dir.replacer.remove(frame_id);
                drop(dir);

                if frame.state() == FrameState::Loading {
                    // The loader holds the io lock for the whole read.
                    drop(frame.io().lock().unwrap());
                }
                if frame.state() != FrameState::Resident {
                    // The load failed and the frame was withdrawn; retry.
                    self.unpin(&frame);
                    continue;
                }
                self.lock_access(&frame, exclusive);
                entry.add_pin();
                return Ok(PageRef {
                    buffer: self,
                    file: Arc::clone(entry),
                    frame,
                    exclusive,
                    released: false,
                });
            }

            // A dirty copy of this page may still be on its way to disk.
            if let Some(old) = dir.writeback.get(&frame_id) {
                let old = Arc::clone(old);
                drop(dir);
                drop(old.io().lock().unwrap());
                continue;
            }

            // Miss: reserve a frame, evicting when the pool is full.
            let victim = if dir.frames.len() < self.page_capacity {
                None
            } else {
                let victim_id = dir.replacer.pop_victim().ok_or(SiltError::NoFreeFrame)?;
                let victim = dir
                    .frames
                    .remove(&victim_id)
                    .expect("queued frame is in the directory");
                victim.set_state(FrameState::Evicting);
                if victim.is_dirty() {
                    // Resolve the backing handle now, while the victim's
                    // file cannot retire under us.
                    let victim_entry = self.registry.get(victim_id.page_addr().file_id);
                    dir.writeback.insert(victim_id, Arc::clone(&victim));
                    Some((victim, victim_entry))
                } else {
                    None
                }
            };

            let frame = Arc::new(Frame::new(frame_id, self.page_size));
            dir.frames.insert(frame_id, Arc::clone(&frame));
            // Taken under the directory latch, but contention is impossible
            // on a frame nobody else has seen. Held across the load so hits
            // on this frame and misses on the victim's page can wait on it.
            let io_guard = frame.io().lock().unwrap();
            drop(dir);

            if let Some((victim, victim_entry)) = victim {
                let written = match victim_entry {
                    Some(victim_entry) => self.write_back(&victim, &victim_entry),
                    None => Err(SiltError::FileClosed),
                };
                self.dir.lock().unwrap().writeback.remove(&victim.frame_id());
                if let Err(err) = written {
                    self.withdraw_loading(&frame);
                    drop(io_guard);
                    return Err(err);
                }
            }

            match self.load(entry, offset, &frame) {
                Ok(()) => {
                    frame.set_state(FrameState::Resident);
                    drop(io_guard);
                }
                Err(err) => {
                    self.withdraw_loading(&frame);
                    drop(io_guard);
                    return Err(err);
                }
            }

            self.lock_access(&frame, exclusive);
            entry.add_pin();
            return Ok(PageRef {
                buffer: self,
                file: Arc::clone(entry),
                frame,
                exclusive,
                released: false,
            });
        }
    }

    /// Read one page into a loading frame. Short reads at end of file leave
    /// the tail zeroed.
    fn load(&self, entry: &FileEntry, offset: u64, frame: &Frame) -> SiltResult<()> {
        // SAFETY: the frame is Loading and this thread holds its io lock;
        // no other thread touches the bytes until it becomes Resident.
        let buf = unsafe { frame.data_mut() };
        let read = entry.handle.read_at(offset, buf)?;
        buf[read..].fill(0);
        Ok(())
    }

    /// Write an evicted dirty frame out. The frame has no users, so its
    /// bytes are stable without the access latch.
    fn write_back(&self, frame: &Frame, entry: &FileEntry) -> SiltResult<()> {
        let addr = frame.frame_id().page_addr();
        let _io = frame.io().lock().unwrap();
        if !frame.is_dirty() {
            return Ok(());
        }
        // SAFETY: no users and no directory entry; nobody else can reach
        // the bytes.
        let data = unsafe { frame.data() };
        entry.handle.write_at(addr.page_no * self.page_size as u64, data)?;
        frame.clear_dirty();
        Ok(())
    }

    /// Flush one resident frame in place. Possibly-pinned frames are written
    /// out under a shared access latch, so a concurrent exclusive writer
    /// cannot race the bytes to disk.
    fn flush_frame(&self, frame: &Frame, entry: &FileEntry) -> SiltResult<()> {
        let _io = frame.io().lock().unwrap();
        if !frame.is_dirty() {
            return Ok(());
        }
        frame.latch().lock_shared();
        // SAFETY: shared access latch held; writers are excluded.
        let data = unsafe { frame.data() };
        let result = entry
            .handle
            .write_at(frame.frame_id().page_addr().page_no * self.page_size as u64, data);
        if result.is_ok() {
            frame.clear_dirty();
        }
        frame.latch().unlock_shared();
        result
    }

    /// Dirty resident frames, optionally restricted to one file and to
    /// frames without users.
    fn collect_dirty(&self, file_id: Option<FileId>, unpinned_only: bool) -> Vec<Arc<Frame>> {
        let dir = self.dir.lock().unwrap();
        dir.frames
            .values()
            .filter(|frame| frame.state() == FrameState::Resident && frame.is_dirty())
            .filter(|frame| !unpinned_only || frame.users() == 0)
            .filter(|frame| {
                file_id.is_none_or(|id| frame.frame_id().page_addr().file_id == id)
            })
            .map(Arc::clone)
            .collect()
    }

    fn flush_file_frames(&self, entry: &FileEntry) -> SiltResult<()> {
        for frame in self.collect_dirty(Some(entry.file_id), false) {
            self.flush_frame(&frame, entry)?;
        }
        Ok(())
    }

    fn lock_access(&self, frame: &Frame, exclusive: bool) {
        if exclusive {
            frame.latch().lock_exclusive();
        } else {
            frame.latch().lock_shared();
        }
    }

    /// Drop one pin taken without a `PageRef` (a failed load's waiter).
    fn unpin(&self, frame: &Arc<Frame>) {
        let mut dir = self.dir.lock().unwrap();
        if frame.unpin() > 0 {
            return;
        }
        let frame_id = frame.frame_id();
        let still_ours = dir
            .frames
            .get(&frame_id)
            .is_some_and(|current| Arc::ptr_eq(current, frame));
        if still_ours && frame.state() == FrameState::Resident {
            let requeued = frame.mark_seen();
            dir.replacer.insert(frame_id, requeued);
        }
    }

    /// Drop one `PageRef`. The last pin of a frame queues it, FIFO on its
    /// first visit and LRU afterwards; when the file's handles are all gone
    /// the frame is dropped instead, written out first if it was dirtied
    /// after close, and the file's id lookup retires with its last pin.
    fn unpin_page(&self, frame: &Arc<Frame>, entry: &Arc<FileEntry>) {
        let (discarded, retire) = {
            let mut dir = self.dir.lock().unwrap();
            let mut discarded = false;
            if frame.unpin() == 0 {
                let frame_id = frame.frame_id();
                let still_ours = dir
                    .frames
                    .get(&frame_id)
                    .is_some_and(|current| Arc::ptr_eq(current, frame));
                if still_ours {
                    if entry.is_closed() {
                        dir.frames.remove(&frame_id);
                        frame.set_state(FrameState::Evicting);
                        discarded = true;
                    } else if frame.state() == FrameState::Resident {
                        let requeued = frame.mark_seen();
                        dir.replacer.insert(frame_id, requeued);
                    }
                }
            }
            // Pin counts change only under the directory latch, so exactly
            // one of the last unpin and the close path observes both the
            // closed flag and a zero count.
            (discarded, entry.drop_pin() == 0 && entry.is_closed())
        };

        if discarded && frame.is_dirty() {
            // Close wrote the unpinned pages; only bytes dirtied since
            // are left, and there is no caller to hand an error to.
            if let Err(err) = self.flush_frame(frame, entry) {
                tracing::warn!(
                    "write-back of page {} after close failed: {err}",
                    frame.frame_id().page_addr()
                );
            }
        }
        if retire {
            self.registry.retire(entry);
        }
    }

    /// Remove a frame whose load failed so waiters retry, and drop the
    /// loading thread's pin. Called while holding the frame's io lock;
    /// that is safe because nobody blocks on an io lock while holding the
    /// directory latch.
    fn withdraw_loading(&self, frame: &Arc<Frame>) {
        let mut dir = self.dir.lock().unwrap();
        frame.set_state(FrameState::Evicting);
        let frame_id = frame.frame_id();
        if dir
            .frames
            .get(&frame_id)
            .is_some_and(|current| Arc::ptr_eq(current, frame))
        {
            dir.frames.remove(&frame_id);
        }
        frame.unpin();
    }

    /// Update the logical size. Shrinking discards resident pages past the
    /// new end without writing them back, then shrinks the backing file.
    fn truncate_file(&self, entry: &Arc<FileEntry>, new_size: u64) -> SiltResult<()> {
        let old_size = entry.size();
        entry.set_size(new_size);
        if new_size < old_size {
            let first_dead = new_size / self.page_size as u64;
            let mut dir = self.dir.lock().unwrap();
            let dead: Vec<FrameId> = dir
                .frames
                .keys()
                .copied()
                .filter(|id| {
                    let addr = id.page_addr();
                    addr.file_id == entry.file_id && addr.page_no >= first_dead
                })
                .collect();
            for frame_id in dead {
                if let Some(frame) = dir.frames.remove(&frame_id) {
                    frame.set_state(FrameState::Evicting);
                    frame.clear_dirty();
                }
                dir.replacer.remove(frame_id);
            }
        }
        entry.handle.truncate(new_size)?;
        Ok(())
    }

    /// Called when a `FileRef` drops. The last handle flushes the file's
    /// unpinned dirty pages, purges its unpinned frames, and only then
    /// retires the id lookup, and only once no pins remain: a surviving
    /// `PageRef` keeps the entry reachable and writes its own page out at
    /// final release. The file id is not reused.
    fn close_file(&self, entry: &Arc<FileEntry>) {
        if !self.registry.release(entry) {
            return;
        }
        // Pinned frames are skipped: flushing them in place would wait on
        // their access latches, possibly held by this very thread.
        for frame in self.collect_dirty(Some(entry.file_id), true) {
            if let Err(err) = self.flush_frame(&frame, entry) {
                tracing::warn!(
                    "flush of {} during close failed: {err}",
                    entry.path.display()
                );
            }
        }
        let retire = {
            let mut dir = self.dir.lock().unwrap();
            let stale: Vec<FrameId> = dir
                .frames
                .iter()
                .filter(|(id, frame)| {
                    id.page_addr().file_id == entry.file_id && frame.users() == 0
                })
                .map(|(id, _)| *id)
                .collect();
            for frame_id in stale {
                if let Some(frame) = dir.frames.remove(&frame_id) {
                    frame.set_state(FrameState::Evicting);
                }
                dir.replacer.remove(frame_id);
            }
            entry.pin_count() == 0
        };
        if retire {
            self.registry.retire(entry);
        }
    }
}

impl Drop for BufferManager {
    fn drop(&mut self) {
        // Write-back failures cannot propagate out of drop; log and keep
        // going so the remaining pages still reach disk.
        for frame in self.collect_dirty(None, false) {
            let addr = frame.frame_id().page_addr();
            match self.registry.get(addr.file_id) {
                Some(entry) => {
                    if let Err(err) = self.flush_frame(&frame, &entry) {
                        tracing::warn!("write-back of page {addr} failed during shutdown: {err}");
                    }
                }
                None => {
                    tracing::warn!("dirty page {addr} dropped during shutdown: file is closed");
                }
            }
        }
    }
}

/// Snapshot of one directory frame, for inspection and tests.
#[derive(Clone, Debug)]
pub struct FrameInfo {
    pub addr: PageAddr,
    pub frame_id: FrameId,
    pub users: u32,
    pub dirty: bool,
}

/// Shared handle to an open backing file.
///
/// Dropping the last handle for a path flushes the file's unpinned dirty
/// pages and closes it; a later reopen gets a fresh file id. Pages still
/// pinned through a `PageRef` keep the backing file reachable and are
/// written out when their last pin releases.
pub struct FileRef<'b> {
    buffer: &'b BufferManager,
    entry: Arc<FileEntry>,
}

impl<'b> FileRef<'b> {
    pub fn file_id(&self) -> FileId {
        self.entry.file_id
    }

    /// Logical file size in bytes.
    pub fn size(&self) -> u64 {
        self.entry.size()
    }

    /// Pin a page, loading it on a miss. An exclusive pin gets mutable
    /// access to the bytes; shared pins coexist. Fails with `OutOfBounds`
    /// when the page lies beyond the logical file size and with
    /// `NoFreeFrame` when a miss finds every frame pinned.
    pub fn fix_page(&self, page_no: u64, exclusive: bool) -> SiltResult<PageRef<'b>> {
        self.buffer.fix_page(&self.entry, page_no, exclusive)
    }

    /// Write all of this file's dirty pages; returns once the I/O landed.
    /// Pinned pages are flushed in place, so the calling thread must not
    /// hold an exclusive pin on this file.
    pub fn flush(&self) -> SiltResult<()> {
        self.buffer.flush_file_frames(&self.entry)
    }

    /// Set the logical size. Shrinking discards resident pages beyond the
    /// new end without write-back; growing makes the new tail pinnable as
    /// zero-filled pages.
    pub fn truncate(&self, new_size: u64) -> SiltResult<()> {
        self.buffer.truncate_file(&self.entry, new_size)
    }
}

impl Drop for FileRef<'_> {
    fn drop(&mut self) {
        self.buffer.close_file(&self.entry);
    }
}

/// A pinned page. The frame stays resident and its bytes stay stable until
/// release; release happens on drop at the latest.
///
/// Holders may stack shared pins, but must release every other pin before
/// taking an exclusive one, or two threads can block on each other's
/// access latches.
pub struct PageRef<'b> {
    buffer: &'b BufferManager,
    file: Arc<FileEntry>,
    frame: Arc<Frame>,
    exclusive: bool,
    released: bool,
}

impl PageRef<'_> {
    /// The page bytes; always exactly one page long.
    pub fn data(&self) -> &[u8] {
        // SAFETY: the access latch is held in shared or exclusive mode for
        // the lifetime of this pin.
        unsafe { self.frame.data() }
    }

    /// Mutable page bytes; marks the page dirty. Panics on a shared pin.
    pub fn data_mut(&mut self) -> &mut [u8] {
        assert!(self.exclusive, "data_mut requires an exclusive pin");
        self.frame.set_dirty();
        // SAFETY: the access latch is held exclusively.
        unsafe { self.frame.data_mut() }
    }

    /// Record that the page was modified and must be written back.
    pub fn mark_dirty(&self) {
        self.frame.set_dirty();
    }

    pub fn is_dirty(&self) -> bool {
        self.frame.is_dirty()
    }

    /// Explicit unpin; equivalent to dropping the handle.
    pub fn release(mut self) {
        self.unfix();
    }

    fn unfix(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if self.exclusive {
            self.frame.latch().unlock_exclusive();
        } else {
            self.frame.latch().unlock_shared();
        }
        self.buffer.unpin_page(&self.frame, &self.file);
    }
}

impl Drop for PageRef<'_> {
    fn drop(&mut self) {
        self.unfix();
    }
}
