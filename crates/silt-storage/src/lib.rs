//! silt-storage: a paged buffer manager over an abstract file system.
//!
//! Pages live in fixed-size frames handed out through pins: a `PageRef`
//! keeps its frame resident and its bytes stable until release. Unpinned
//! frames wait in two replacement queues, FIFO for pages queued for the
//! first time and LRU for pages re-pinned after queueing.
//!
//! Unsafe boundary: `frame.rs` and `latch.rs` contain the only `unsafe`
//! code. All other modules are safe Rust.

pub mod buffer_manager;
pub mod filesystem;
pub mod frame;
pub mod latch;
pub mod page_id;
mod registry;
pub mod replacer;

pub use buffer_manager::{BufferManager, FileRef, FrameInfo, PageRef};
pub use filesystem::{FileHandle, FileSystem, MemoryFileSystem, OsFileSystem};
pub use frame::{Frame, FrameState};
pub use latch::RwLatch;
pub use page_id::{FileId, FrameId, MAX_PAGE_NO, PageAddr};
pub use replacer::TwoQueueReplacer;
