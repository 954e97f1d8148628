//! Error and Result types for sequencer operations.

use crate::sample::Timestamp;
use thiserror::Error;

/// A convenience `Result` type for sequencer operations.
pub type Result<T> = std::result::Result<T, SequencerError>;

/// The error type for staging-sequencer operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SequencerError {
    /// Sample is older than one window below the high-water mark.
    #[error("late write: timestamp {timestamp} is more than one window below high-water {high_water}")]
    LateWrite {
        /// Timestamp of the rejected sample.
        timestamp: Timestamp,
        /// High-water mark at the time of rejection.
        high_water: Timestamp,
    },

    /// A checkpoint is already in progress.
    #[error("checkpoint already in progress")]
    Busy,

    /// Merge was called with nothing promoted.
    #[error("no runs staged for drain")]
    NoData,

    /// A structural invariant failed; the sequencer is unsafe to continue.
    #[error("sequencer invariant broken: {0}")]
    InvariantBroken(&'static str),
}
