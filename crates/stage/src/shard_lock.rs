//! Sharded test-and-set locks guarding per-run access.
//!
//! A fixed, power-of-two array of atomic flags. Run `i` maps to flag
//! `i & (len - 1)`, so the array stays smaller than the number of runs it
//! can guard and two distinct runs may share a flag. Collisions reduce
//! concurrency but never correctness; the expected run count is small.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Debug)]
pub(crate) struct RunLockArray {
    flags: Box<[AtomicBool]>,
    mask: usize,
    spin_budget: u32,
    max_backoff: Duration,
}

impl RunLockArray {
    /// Creates `shard_count` cleared flags. `shard_count` must be a nonzero
    /// power of two; the sequencer validates this at construction.
    pub(crate) fn new(shard_count: usize, spin_budget: u32, max_backoff: Duration) -> Self {
        debug_assert!(shard_count.is_power_of_two());
        let flags: Box<[AtomicBool]> = (0..shard_count).map(|_| AtomicBool::new(false)).collect();
        Self {
            flags,
            mask: shard_count - 1,
            spin_budget,
            max_backoff,
        }
    }

    /// The flag slot guarding run index `ix`.
    pub(crate) fn slot(&self, ix: usize) -> usize {
        ix & self.mask
    }

    /// Locks the shard for run index `ix`.
    ///
    /// Spins `spin_budget` times on contention, then sleeps with a linear
    /// backoff growing one millisecond per attempt up to `max_backoff`.
    pub(crate) fn lock(&self, ix: usize) -> ShardGuard<'_> {
        let slot = self.slot(ix);
        self.acquire(slot);
        ShardGuard { locks: self, slot }
    }

    /// Locks every shard in index order, quiescing all per-run access.
    pub(crate) fn lock_all(&self) -> AllShardsGuard<'_> {
        for slot in 0..self.flags.len() {
            self.acquire(slot);
        }
        AllShardsGuard { locks: self }
    }

    fn acquire(&self, slot: usize) {
        let flag = &self.flags[slot];
        let mut spins = self.spin_budget;
        let mut backoff = Duration::ZERO;
        while flag.swap(true, Ordering::Acquire) {
            if spins > 0 {
                spins -= 1;
                std::hint::spin_loop();
            } else {
                std::thread::sleep(backoff);
                if backoff < self.max_backoff {
                    backoff += Duration::from_millis(1);
                }
            }
        }
    }

    fn release(&self, slot: usize) {
        self.flags[slot].store(false, Ordering::Release);
    }
}

/// Holds one shard locked; releases on drop.
pub(crate) struct ShardGuard<'a> {
    locks: &'a RunLockArray,
    slot: usize,
}

impl Drop for ShardGuard<'_> {
    fn drop(&mut self) {
        self.locks.release(self.slot);
    }
}

/// Holds every shard locked; releases all in index order on drop.
pub(crate) struct AllShardsGuard<'a> {
    locks: &'a RunLockArray,
}

impl Drop for AllShardsGuard<'_> {
    fn drop(&mut self) {
        for slot in 0..self.locks.flags.len() {
            self.locks.release(slot);
        }
    }
}
