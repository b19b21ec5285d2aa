use std::path::PathBuf;
use std::sync::Arc;

use silt_common::BufferConfig;
use silt_storage::{BufferManager, FileId, FrameId, OsFileSystem};

fn config() -> BufferConfig {
    BufferConfig {
        page_capacity: 10,
        page_size_bits: 13,
    }
}

fn make_buffer() -> BufferManager {
    BufferManager::new(Arc::new(OsFileSystem), config())
}

fn frame_ids(raw: impl IntoIterator<Item = u64>) -> Vec<FrameId> {
    raw.into_iter().map(FrameId).collect()
}

fn read_u64(data: &[u8]) -> u64 {
    u64::from_ne_bytes(data[..8].try_into().unwrap())
}

fn write_u64(data: &mut [u8], value: u64) {
    data[..8].copy_from_slice(&value.to_ne_bytes());
}

/// Deterministic generator for the parallel workloads.
struct SplitMix64(u64);

impl SplitMix64 {
    fn new(seed: u64) -> Self {
        Self(seed)
    }

    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9E3779B97F4A7C15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
        z ^ (z >> 31)
    }

    fn below(&mut self, bound: u64) -> u64 {
        self.next() % bound
    }
}

/// Pick one of four files: 12/5/2/1 weights out of 20 accesses.
fn weighted_pick(rng: &mut SplitMix64) -> usize {
    match rng.below(20) {
        0..=11 => 0,
        12..=16 => 1,
        17..=18 => 2,
        _ => 3,
    }
}

/// Zero out `page_count` pages in each of the given files, then drop the
/// buffer so the caches are cold for the test proper.
fn prepare_zeroed_files(paths: &[PathBuf], page_count: u64) {
    let buffer = make_buffer();
    for path in paths {
        let file = buffer.open_file(path).unwrap();
        file.truncate(page_count * buffer.page_size() as u64).unwrap();
        for page_no in 0..page_count {
            let mut page = file.fix_page(page_no, true).unwrap();
            page.data_mut().fill(0);
            page.mark_dirty();
        }
    }
}

#[test]
fn fix_single_page_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = make_buffer();
    let page_size = buffer.page_size();
    let file = buffer.open_file(&dir.path().join("single")).unwrap();
    file.truncate(page_size as u64).unwrap();
    assert_eq!(file.file_id(), FileId(0));

    // Fill the page with a recognisable value.
    {
        let mut page = file.fix_page(0, true).unwrap();
        assert_eq!(page.data().len(), page_size);
        for chunk in page.data_mut().chunks_exact_mut(8) {
            chunk.copy_from_slice(&123u64.to_ne_bytes());
        }
        page.mark_dirty();
    }
    file.flush().unwrap();

    assert_eq!(buffer.frame_count(), 1);
    assert_eq!(buffer.frames()[0].users, 0);
    assert_eq!(buffer.fifo_list(), frame_ids([0]));
    assert!(buffer.lru_list().is_empty());

    // Read it back through a shared pin.
    {
        let page = file.fix_page(0, false).unwrap();
        assert_eq!(page.data().len(), page_size);
        assert!(
            page.data()
                .chunks_exact(8)
                .all(|chunk| read_u64(chunk) == 123)
        );
    }

    assert!(buffer.fifo_list().is_empty());
    assert_eq!(buffer.lru_list(), frame_ids([0]));
}

#[test]
fn written_pages_survive_a_restart() {
    const PAGE_COUNT: u64 = 10;
    let dir = tempfile::tempdir().unwrap();
    let paths: Vec<PathBuf> = (0..3).map(|i| dir.path().join(format!("seg{i}"))).collect();

    let page_size = config().page_size() as u64;
    {
        let buffer = make_buffer();
        let files: Vec<_> = paths
            .iter()
            .map(|path| buffer.open_file(path).unwrap())
            .collect();
        for (i, file) in files.iter().enumerate() {
            assert_eq!(file.file_id(), FileId(i as u16));
            file.truncate(PAGE_COUNT * page_size).unwrap();
        }
        for (i, file) in files.iter().enumerate() {
            for page_no in 0..PAGE_COUNT {
                let mut page = file.fix_page(page_no, true).unwrap();
                write_u64(page.data_mut(), i as u64 * 10 + page_no);
                page.mark_dirty();
            }
        }
        buffer.flush().unwrap();
    }

    for path in &paths {
        assert_eq!(
            std::fs::metadata(path).unwrap().len(),
            PAGE_COUNT * page_size
        );
    }

    // A fresh buffer manager re-assigns the same ids in open order and
    // observes every write.
    let buffer = make_buffer();
    let files: Vec<_> = paths
        .iter()
        .map(|path| buffer.open_file(path).unwrap())
        .collect();
    for (i, file) in files.iter().enumerate() {
        assert_eq!(file.file_id(), FileId(i as u16));
        for page_no in 0..PAGE_COUNT {
            let page = file.fix_page(page_no, false).unwrap();
            assert_eq!(read_u64(page.data()), i as u64 * 10 + page_no);
        }
    }
}

#[test]
fn fifo_eviction_cycles_pages_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = make_buffer();
    let file = buffer.open_file(&dir.path().join("scan")).unwrap();
    file.truncate(11 * buffer.page_size() as u64).unwrap();

    // First ten pages fill the pool.
    for page_no in 0..10 {
        file.fix_page(page_no, false).unwrap();
        assert_eq!(buffer.frame_count(), page_no as usize + 1);
    }
    assert_eq!(buffer.fifo_list(), frame_ids(0..10));
    assert!(buffer.lru_list().is_empty());

    // Page 10 evicts the FIFO head.
    file.fix_page(10, false).unwrap();
    assert_eq!(buffer.fifo_list(), frame_ids(1..11));
    assert!(buffer.lru_list().is_empty());

    // Cycling the first ten pages again keeps everything in FIFO: every
    // page comes back as a fresh load after its earlier eviction.
    for page_no in 0..10 {
        file.fix_page(page_no, false).unwrap();
    }
    assert_eq!(buffer.fifo_list(), frame_ids(0..10));
    assert!(buffer.lru_list().is_empty());
}

#[test]
fn lru_eviction_protects_repinned_pages() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = make_buffer();
    let file = buffer.open_file(&dir.path().join("hot")).unwrap();
    file.truncate(11 * buffer.page_size() as u64).unwrap();

    for page_no in 0..10 {
        file.fix_page(page_no, false).unwrap();
        assert_eq!(buffer.frame_count(), page_no as usize + 1);
    }
    assert_eq!(buffer.fifo_list(), frame_ids(0..10));
    assert!(buffer.lru_list().is_empty());

    // A second pin of page 0 promotes it to LRU.
    file.fix_page(0, false).unwrap();
    assert_eq!(buffer.fifo_list(), frame_ids(1..10));
    assert_eq!(buffer.lru_list(), frame_ids([0]));

    // Page 10 evicts from FIFO, not from LRU.
    file.fix_page(10, false).unwrap();
    assert_eq!(buffer.fifo_list(), frame_ids(2..11));
    assert_eq!(buffer.lru_list(), frame_ids([0]));

    // Cycle pages 1..10 through FIFO once.
    for page_no in 1..10 {
        file.fix_page(page_no, false).unwrap();
    }
    assert_eq!(buffer.fifo_list(), frame_ids(1..10));
    assert_eq!(buffer.lru_list(), frame_ids([0]));

    // A second pass promotes all of them.
    for page_no in 1..10 {
        file.fix_page(page_no, false).unwrap();
    }
    assert!(buffer.fifo_list().is_empty());
    assert_eq!(buffer.lru_list(), frame_ids(0..10));

    // With FIFO empty, eviction falls back to the LRU head.
    file.fix_page(10, false).unwrap();
    assert_eq!(buffer.fifo_list(), frame_ids([10]));
    assert_eq!(buffer.lru_list(), frame_ids(1..10));

    file.fix_page(0, false).unwrap();
    assert_eq!(buffer.fifo_list(), frame_ids([0]));
    assert_eq!(buffer.lru_list(), frame_ids(1..10));
}

#[test]
fn parallel_exclusive_pins_are_serialised() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = make_buffer();
    let file = buffer.open_file(&dir.path().join("counter")).unwrap();
    file.truncate(buffer.page_size() as u64).unwrap();

    {
        let mut page = file.fix_page(0, true).unwrap();
        page.data_mut().fill(0);
        page.mark_dirty();
    }

    std::thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..1000 {
                    let mut page = file.fix_page(0, true).unwrap();
                    let value = read_u64(page.data());
                    write_u64(page.data_mut(), value + 1);
                    page.mark_dirty();
                }
            });
        }
    });

    assert!(buffer.fifo_list().is_empty());
    assert_eq!(buffer.lru_list(), frame_ids([0]));

    let page = file.fix_page(0, false).unwrap();
    assert_eq!(read_u64(page.data()), 4000);
}

#[test]
fn parallel_fix_of_disjoint_pages() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = make_buffer();
    let file = buffer.open_file(&dir.path().join("disjoint")).unwrap();
    file.truncate(10 * buffer.page_size() as u64).unwrap();

    std::thread::scope(|s| {
        for i in 0..4u64 {
            let file = &file;
            s.spawn(move || {
                let first = file.fix_page(i, false).unwrap();
                let second = file.fix_page(i + 4, false).unwrap();
                second.release();
                first.release();
            });
        }
    });

    let mut fifo = buffer.fifo_list();
    fifo.sort();
    assert_eq!(fifo, frame_ids(0..8));
    assert!(buffer.lru_list().is_empty());
}

#[test]
fn parallel_scans_observe_zeroed_files() {
    const PAGE_COUNT: u64 = 100;
    const JOB_COUNT: usize = 20;

    let dir = tempfile::tempdir().unwrap();
    let paths: Vec<PathBuf> = (0..4).map(|i| dir.path().join(format!("scan{i}"))).collect();
    prepare_zeroed_files(&paths, PAGE_COUNT);

    let buffer = make_buffer();
    std::thread::scope(|s| {
        for t in 0..2u64 {
            let buffer = &buffer;
            let paths = &paths;
            s.spawn(move || {
                let mut rng = SplitMix64::new(t + 1);
                for _ in 0..JOB_COUNT {
                    let file = buffer.open_file(&paths[weighted_pick(&mut rng)]).unwrap();
                    for page_no in 0..PAGE_COUNT {
                        let page = file.fix_page(page_no, false).unwrap();
                        assert!(page.data().iter().all(|&b| b == 0));
                    }
                }
            });
        }
    });
}

#[test]
fn parallel_readers_and_writers_keep_sums_monotonic() {
    const PAGE_COUNT: u64 = 50;
    const THREAD_COUNT: u64 = 4;
    const JOB_COUNT: usize = 40;

    let dir = tempfile::tempdir().unwrap();
    let paths: Vec<PathBuf> = (0..4).map(|i| dir.path().join(format!("mix{i}"))).collect();
    prepare_zeroed_files(&paths, PAGE_COUNT);

    let buffer = make_buffer();
    std::thread::scope(|s| {
        for t in 0..THREAD_COUNT {
            let buffer = &buffer;
            let paths = &paths;
            s.spawn(move || {
                let mut rng = SplitMix64::new(0xC0FFEE + t);
                // Per-file sums seen by this thread's scans; writers only
                // ever increment, so the sums must never shrink.
                let mut scan_sums = [0u64; 4];
                for _ in 0..JOB_COUNT {
                    let which = weighted_pick(&mut rng);
                    let file = buffer.open_file(&paths[which]).unwrap();
                    if rng.below(20) == 0 {
                        let mut sum = 0u64;
                        for page_no in 0..PAGE_COUNT {
                            let page = file.fix_page(page_no, false).unwrap();
                            sum += read_u64(page.data());
                        }
                        assert!(sum >= scan_sums[which]);
                        scan_sums[which] = sum;
                    } else {
                        // Point query: maybe hold a couple of shared pins,
                        // and release them before the final, possibly
                        // exclusive, pin to keep the access latches
                        // deadlock-free.
                        if rng.below(2) == 0 {
                            let first = file.fix_page(rng.below(PAGE_COUNT), false).unwrap();
                            let second = file.fix_page(rng.below(PAGE_COUNT), false).unwrap();
                            second.release();
                            first.release();
                        }
                        if rng.below(5) < 3 {
                            file.fix_page(rng.below(PAGE_COUNT), false).unwrap();
                        } else {
                            let mut page =
                                file.fix_page(rng.below(PAGE_COUNT), true).unwrap();
                            let value = read_u64(page.data());
                            write_u64(page.data_mut(), value + 1);
                            page.mark_dirty();
                        }
                    }
                }
            });
        }
    });
}
