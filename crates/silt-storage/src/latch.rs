use std::sync::atomic::{AtomicU32, Ordering};

/// A reader-writer spinlock over a single `AtomicU32`, guarding one frame's
/// page bytes for the duration of a pin.
///
/// Encoding:
/// - `0` = unlocked
/// - `u32::MAX` = exclusively locked
/// - anything else = number of concurrent readers
pub struct RwLatch {
    state: AtomicU32,
}

const UNLOCKED: u32 = 0;
const EXCLUSIVE: u32 = u32::MAX;

impl RwLatch {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
        }
    }

    /// Acquire shared access, spinning while a writer holds the latch.
    pub fn lock_shared(&self) {
        let mut current = self.state.load(Ordering::Relaxed);
        loop {
            if current == EXCLUSIVE {
                std::hint::spin_loop();
                current = self.state.load(Ordering::Relaxed);
                continue;
            }
            match self.state.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Release shared access.
    pub fn unlock_shared(&self) {
        let prev = self.state.fetch_sub(1, Ordering::Release);
        debug_assert!(prev != UNLOCKED && prev != EXCLUSIVE);
    }

    /// Acquire exclusive access, spinning out readers and writers.
    pub fn lock_exclusive(&self) {
        while self
            .state
            .compare_exchange_weak(UNLOCKED, EXCLUSIVE, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    /// Release exclusive access.
    pub fn unlock_exclusive(&self) {
        let prev = self.state.swap(UNLOCKED, Ordering::Release);
        debug_assert_eq!(prev, EXCLUSIVE);
    }

    /// True when no reader or writer holds the latch.
    pub fn is_unlocked(&self) -> bool {
        self.state.load(Ordering::Relaxed) == UNLOCKED
    }
}

impl Default for RwLatch {
    fn default() -> Self {
        Self::new()
    }
}
