//! The staging sequencer: run-based insertion, checkpoint promotion, and
//! ordered drain/search.
//!
//! # Architecture
//!
//! ```text
//! producers ──add──▶ active runs ──checkpoint──▶ ready ──merge──▶ flusher
//!                         │
//! searchers ──search──────┘  (filtered, k-way merged view)
//! ```
//!
//! Incoming samples are near-ordered by timestamp. Insertion keeps a small
//! collection of sorted runs, patience-sorting style: each sample appends to
//! the youngest run whose tail it extends, found by a lower-bound search
//! over run tails, so a near-ordered stream produces few runs. When the
//! high-water mark crosses a window boundary, every sample older than the
//! previous boundary is promoted into the ready list and handed to the
//! flusher as one forward-ordered stream. Runs straddling the boundary are
//! split so both halves stay monotone.
//!
//! # Locking
//!
//! Three layers, always acquired in this order:
//!
//! 1. the checkpoint mutex, whose data is the ready list itself; promotion,
//!    drain and search serialize on it, and a populated ready list is only
//!    ever observable while it is held,
//! 2. the `active` list lock, read for appends and write for structural
//!    changes,
//! 3. the per-run shard locks, which fence appends and filtered reads of a
//!    run's samples.
//!
//! Producers never wait for a checkpoint: the mutex is taken with try-lock
//! semantics and a lost race surfaces as [`SequencerError::Busy`].

use crate::cursor::Cursor;
use crate::error::{Result, SequencerError};
use crate::merge::{kway_merge, Direction};
use crate::query::SearchQuery;
use crate::run::Run;
use crate::sample::{Sample, SampleKey, Timestamp};
use crate::shard_lock::RunLockArray;
use std::fmt;
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock, TryLockError};
use std::time::Duration;
use tracing::{debug, warn};

/// Default number of shard locks.
pub const DEFAULT_SHARD_COUNT: usize = 256;

/// Default busy-spin iterations before a contended shard lock sleeps.
pub const DEFAULT_SPIN_BUDGET: u32 = 0x1000;

/// Default cap on the shard-lock sleep backoff.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_millis(20);

/// Configuration for the sequencer. Immutable after construction.
#[derive(Debug, Clone)]
pub struct SequencerConfig {
    /// Out-of-order tolerance, in timestamp units. Must be positive.
    ///
    /// Samples more than one window below the high-water mark are rejected
    /// with [`SequencerError::LateWrite`].
    pub window_size: u64,
    /// Number of shard locks. Must be a nonzero power of two; runs map onto
    /// shards by index masking, so the array may be smaller than the number
    /// of live runs.
    pub shard_count: usize,
    /// Busy-spin iterations before a contended shard lock falls back to
    /// sleeping.
    pub spin_budget: u32,
    /// Upper bound on the shard lock's linear sleep backoff.
    pub max_backoff: Duration,
}

impl SequencerConfig {
    /// Configuration with the given window and default lock tuning.
    pub fn new(window_size: u64) -> Self {
        Self {
            window_size,
            shard_count: DEFAULT_SHARD_COUNT,
            spin_budget: DEFAULT_SPIN_BUDGET,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

/// Point-in-time snapshot of the sequencer's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequencerStats {
    /// Number of live runs.
    pub active_runs: usize,
    /// Total samples staged across live runs.
    pub staged_samples: usize,
    /// Current checkpoint id.
    pub checkpoint_id: u32,
    /// Largest timestamp ever accepted.
    pub high_water: Timestamp,
}

/// Ownership of the checkpoint critical section.
///
/// A held token is returned by [`Sequencer::add`] when the call started a
/// checkpoint, and by [`Sequencer::close`]. Hand it to [`Sequencer::merge`]
/// on the same thread to drain the promoted runs and release the section.
///
/// Dropping a held token without merging leaves the promoted runs in place;
/// the next promotion then fails with [`SequencerError::InvariantBroken`].
pub struct CheckpointToken<'seq> {
    guard: Option<MutexGuard<'seq, Vec<Run>>>,
}

impl CheckpointToken<'_> {
    fn empty() -> Self {
        Self { guard: None }
    }

    /// Whether this token owns the checkpoint critical section.
    pub fn is_held(&self) -> bool {
        self.guard.is_some()
    }

    #[cfg(test)]
    fn ready_snapshot(&mut self) -> Vec<Vec<Sample>> {
        self.guard
            .as_mut()
            .map(|ready| ready.iter_mut().map(|run| run.samples_mut().clone()).collect())
            .unwrap_or_default()
    }
}

impl fmt::Debug for CheckpointToken<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointToken")
            .field("held", &self.is_held())
            .finish()
    }
}

/// The in-memory staging sequencer.
///
/// Absorbs a near-ordered sample stream into sorted runs, promotes
/// completed windows for draining, and serves merged ordered range queries
/// over everything staged. All methods take `&self`; the sequencer is meant
/// to be shared across producer, flusher and searcher threads.
#[derive(Debug)]
pub struct Sequencer {
    window_size: u64,
    /// Live runs, ordered by descending tail key. This ordering is what
    /// makes "find the run that absorbs this sample" a lower-bound search.
    active: RwLock<Vec<Run>>,
    /// The checkpoint mutex. Its data is the ready list, so ready runs are
    /// only ever reachable through a held guard.
    ready: Mutex<Vec<Run>>,
    checkpoint_id: AtomicU32,
    high_water: AtomicU64,
    run_locks: RunLockArray,
}

impl Sequencer {
    /// Creates a sequencer from `config`.
    ///
    /// # Errors
    ///
    /// [`SequencerError::InvariantBroken`] when `window_size` is zero or
    /// `shard_count` is not a nonzero power of two.
    pub fn new(config: SequencerConfig) -> Result<Self> {
        if config.window_size == 0 {
            return Err(SequencerError::InvariantBroken(
                "window size must be greater than zero",
            ));
        }
        if config.shard_count == 0 || !config.shard_count.is_power_of_two() {
            return Err(SequencerError::InvariantBroken(
                "shard count must be a nonzero power of two",
            ));
        }
        Ok(Self {
            window_size: config.window_size,
            active: RwLock::new(Vec::new()),
            ready: Mutex::new(Vec::new()),
            checkpoint_id: AtomicU32::new(0),
            high_water: AtomicU64::new(0),
            run_locks: RunLockArray::new(
                config.shard_count,
                config.spin_budget,
                config.max_backoff,
            ),
        })
    }

    /// The configured out-of-order tolerance, in timestamp units.
    pub fn window_size(&self) -> u64 {
        self.window_size
    }

    /// Stages one sample.
    ///
    /// When the sample's timestamp crosses a window boundary, runs older
    /// than the previous boundary are promoted and the returned token is
    /// held; pass it to [`merge`](Sequencer::merge) to drain them.
    /// Otherwise the token is empty.
    ///
    /// # Errors
    ///
    /// - [`SequencerError::LateWrite`]: the sample is more than one window
    ///   below the high-water mark. Nothing changed.
    /// - [`SequencerError::Busy`]: the call needed a checkpoint but one is
    ///   already in progress. Nothing changed; the producer may retry.
    /// - [`SequencerError::InvariantBroken`]: a previous checkpoint was
    ///   never merged. Fatal.
    pub fn add(&self, sample: Sample) -> Result<CheckpointToken<'_>> {
        let ts = sample.timestamp;
        let high_water = self.high_water.load(Ordering::Acquire);
        if ts < high_water {
            if high_water - ts > self.window_size {
                return Err(SequencerError::LateWrite {
                    timestamp: ts,
                    high_water,
                });
            }
            // out of order but within the window
            self.insert(sample);
            return Ok(CheckpointToken::empty());
        }

        let mut token = CheckpointToken::empty();
        let next_checkpoint = (ts / self.window_size) as u32;
        if next_checkpoint > self.checkpoint_id.load(Ordering::Acquire) {
            let mut ready = match self.ready.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::WouldBlock) => return Err(SequencerError::Busy),
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            };
            self.promote(next_checkpoint, &mut ready)?;
            token = CheckpointToken { guard: Some(ready) };
        }
        self.high_water.fetch_max(ts, Ordering::AcqRel);
        self.insert(sample);
        Ok(token)
    }

    /// Seals everything for shutdown: moves every live run into the ready
    /// list and returns the held token for the final [`merge`](Sequencer::merge).
    ///
    /// Returns an empty token when a checkpoint is already in progress.
    ///
    /// # Errors
    ///
    /// [`SequencerError::InvariantBroken`] when a previous checkpoint was
    /// never merged.
    pub fn close(&self) -> Result<CheckpointToken<'_>> {
        let mut ready = match self.ready.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Ok(CheckpointToken::empty()),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        if !ready.is_empty() {
            warn!("close found ready runs left over from an unmerged checkpoint");
            return Err(SequencerError::InvariantBroken(
                "ready runs left over from an unmerged checkpoint",
            ));
        }
        {
            let mut active = self.active.write().unwrap_or_else(|e| e.into_inner());
            let all_shards = self.run_locks.lock_all();
            ready.append(&mut active);
            drop(all_shards);
        }
        fence(Ordering::AcqRel);
        debug!("sequencer closed, {} runs sealed", ready.len());
        Ok(CheckpointToken { guard: Some(ready) })
    }

    /// Drains the promoted runs into `cursor` as one forward-ordered stream
    /// of page offsets, then releases the checkpoint critical section.
    ///
    /// Errors are reported through the cursor: [`SequencerError::Busy`] for
    /// an empty token, [`SequencerError::NoData`] when nothing was
    /// promoted. The token is consumed either way.
    pub fn merge(&self, cursor: &mut dyn Cursor, token: CheckpointToken<'_>) {
        let Some(mut ready) = token.guard else {
            cursor.set_error(SequencerError::Busy);
            return;
        };
        if ready.is_empty() {
            cursor.set_error(SequencerError::NoData);
            return;
        }
        let runs: Vec<&[Sample]> = ready
            .iter_mut()
            .map(|run| &run.samples_mut()[..])
            .collect();
        kway_merge(&runs, Direction::Forward, cursor);
        let drained = runs.len();
        drop(runs);
        ready.clear();
        fence(Ordering::AcqRel);
        debug!("merge drained {} ready runs", drained);
        cursor.complete();
    }

    /// Serves a merged, ordered view of the staged samples matching `query`.
    ///
    /// Blocks while a checkpoint is in progress; search and checkpoint are
    /// mutually exclusive. Bounds are strict on both sides. Results arrive
    /// in the query direction and end with `complete` on the cursor.
    pub fn search(&self, query: &SearchQuery, cursor: &mut dyn Cursor) {
        if query.upper_bound <= query.lower_bound {
            cursor.complete();
            return;
        }
        let ready = self.ready.lock().unwrap_or_else(|e| e.into_inner());
        debug_assert!(ready.is_empty(), "ready runs outside a checkpoint");
        let active = self.active.read().unwrap_or_else(|e| e.into_inner());
        let mut filtered: Vec<Vec<Sample>> = Vec::with_capacity(active.len());
        for (run_ix, run) in active.iter().enumerate() {
            let shard = self.run_locks.lock(run_ix);
            // Safety: the shard lock for this run is held for the read.
            let samples = unsafe { run.samples() };
            let lo = samples.partition_point(|s| s.timestamp <= query.lower_bound);
            let hi = samples.partition_point(|s| s.timestamp < query.upper_bound);
            let matched: Vec<Sample> = samples[lo..hi]
                .iter()
                .filter(|s| query.matches_param(s.param_id))
                .copied()
                .collect();
            drop(shard);
            if !matched.is_empty() {
                filtered.push(matched);
            }
        }
        let runs: Vec<&[Sample]> = filtered.iter().map(|run| run.as_slice()).collect();
        kway_merge(&runs, query.direction, cursor);
        cursor.complete();
    }

    /// A snapshot of the sequencer's internal counters.
    pub fn stats(&self) -> SequencerStats {
        let active = self.active.read().unwrap_or_else(|e| e.into_inner());
        let mut staged_samples = 0;
        for (run_ix, run) in active.iter().enumerate() {
            let _shard = self.run_locks.lock(run_ix);
            // Safety: the shard lock for this run is held.
            staged_samples += unsafe { run.samples() }.len();
        }
        SequencerStats {
            active_runs: active.len(),
            staged_samples,
            checkpoint_id: self.checkpoint_id.load(Ordering::Acquire),
            high_water: self.high_water.load(Ordering::Acquire),
        }
    }

    /// Moves every sample older than the previous checkpoint boundary into
    /// `ready`, splitting runs that straddle it. Called with the checkpoint
    /// mutex held.
    fn promote(&self, next_checkpoint: u32, ready: &mut Vec<Run>) -> Result<()> {
        let mut active = self.active.write().unwrap_or_else(|e| e.into_inner());
        let all_shards = self.run_locks.lock_all();
        if !ready.is_empty() {
            warn!("checkpoint found ready runs left over from an unmerged checkpoint");
            return Err(SequencerError::InvariantBroken(
                "ready runs left over from an unmerged checkpoint",
            ));
        }
        let split_ts = u64::from(self.checkpoint_id.load(Ordering::Acquire)) * self.window_size;
        self.checkpoint_id.store(next_checkpoint, Ordering::Release);
        let boundary = SampleKey::boundary(split_ts);
        let mut kept = Vec::with_capacity(active.len());
        for mut run in active.drain(..) {
            let (split_at, len) = {
                let samples = run.samples_mut();
                (samples.partition_point(|s| s.key() < boundary), samples.len())
            };
            if split_at == 0 {
                // everything is newer than the boundary
                kept.push(run);
            } else if split_at == len {
                ready.push(run);
            } else {
                let suffix = run.split_off(split_at);
                ready.push(run);
                kept.push(suffix);
            }
        }
        *active = kept;
        drop(all_shards);
        fence(Ordering::AcqRel);
        debug!(
            "checkpoint {}: promoted {} runs, kept {}",
            next_checkpoint,
            ready.len(),
            active.len()
        );
        Ok(())
    }

    /// Places an accepted sample into the run structure.
    ///
    /// Optimistic path: locate the youngest absorbing run under the read
    /// guard and append under its shard lock. Tails only grow, so the
    /// target is re-verified under the lock and the search retried when a
    /// competing append got there first. A sample no run absorbs takes the
    /// write guard and opens a new run.
    fn insert(&self, sample: Sample) {
        let key = sample.key();
        loop {
            let active = self.active.read().unwrap_or_else(|e| e.into_inner());
            match self.absorbing_run(&active, key) {
                Some(run_ix) => {
                    let shard = self.run_locks.lock(run_ix);
                    let run = &active[run_ix];
                    // Safety: the shard lock for this run is held.
                    let tail = unsafe { run.tail() };
                    if tail.map_or(false, |t| t.key() <= key) {
                        // Safety: shard lock held; tail order re-verified.
                        unsafe { run.push(sample) };
                        return;
                    }
                    // the tail grew past this sample while we were locking
                    drop(shard);
                }
                None => {
                    drop(active);
                    self.insert_with_new_run(sample);
                    return;
                }
            }
        }
    }

    /// Lower-bound over descending run tails: index of the first run whose
    /// tail does not exceed `key`, if any.
    fn absorbing_run(&self, active: &[Run], key: SampleKey) -> Option<usize> {
        let mut lo = 0;
        let mut hi = active.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let shard = self.run_locks.lock(mid);
            // Safety: the shard lock for run `mid` is held.
            let tail = unsafe { active[mid].tail() };
            drop(shard);
            if tail.map_or(false, |t| t.key() > key) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        (lo < active.len()).then_some(lo)
    }

    /// Re-runs placement under the write guard, appending if a competing
    /// insert re-opened an absorbing run and otherwise inserting a fresh
    /// single-sample run at the position that keeps tails descending.
    fn insert_with_new_run(&self, sample: Sample) {
        let key = sample.key();
        let mut active = self.active.write().unwrap_or_else(|e| e.into_inner());
        // Safety: the write guard excludes every shard-locked accessor, so
        // tails are readable without their shard locks.
        let pos = active
            .partition_point(|run| unsafe { run.tail() }.map_or(false, |t| t.key() > key));
        if let Some(run) = active.get_mut(pos) {
            run.samples_mut().push(sample);
        } else {
            active.insert(pos, Run::new(sample));
        }
    }

    #[cfg(test)]
    fn active_snapshot(&self) -> Vec<Vec<Sample>> {
        let active = self.active.read().unwrap_or_else(|e| e.into_inner());
        active
            .iter()
            .enumerate()
            .map(|(run_ix, run)| {
                let _shard = self.run_locks.lock(run_ix);
                // Safety: the shard lock for this run is held.
                unsafe { run.samples() }.to_vec()
            })
            .collect()
    }
}
