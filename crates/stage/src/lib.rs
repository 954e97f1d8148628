//! Alopex Stage: the in-memory staging sequencer of a time-series storage
//! engine.
//!
//! Incoming samples, triples of `(timestamp, parameter id, page offset)`,
//! arrive roughly but not strictly in timestamp order. The sequencer
//! absorbs the stream into a small set of sorted runs (patience-sorting
//! style), promotes fully-ordered prefixes to a ready batch when the
//! high-water mark crosses a window boundary, and serves merged, globally
//! ordered range queries over everything staged.
//!
//! The sequencer is volatile by design: durability belongs to the page
//! store the offsets point into.
//!
//! # Components
//!
//! - [`Sequencer`]: run-based insertion, checkpoint promotion, ordered
//!   drain and search
//! - [`Sample`] / [`SampleKey`]: the staged value type and its total order
//! - [`Cursor`] / [`VecCursor`]: sink for merged offset streams
//! - [`SearchQuery`]: time-range plus parameter filtering, either direction
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_stage::{Sample, Sequencer, SequencerConfig, VecCursor};
//!
//! let sequencer = Sequencer::new(SequencerConfig::new(1_000))?;
//!
//! // Producers stage samples; a window crossing hands back a held token.
//! let token = sequencer.add(Sample::new(42, 7, 0))?;
//! if token.is_held() {
//!     let mut cursor = VecCursor::new();
//!     sequencer.merge(&mut cursor, token);
//!     // cursor.offsets now holds the promoted window in order
//! }
//! ```

#![deny(missing_docs)]

pub mod cursor;
pub mod error;
pub mod merge;
pub mod query;
pub mod sample;
pub mod sequencer;

mod run;
mod shard_lock;

pub use cursor::{Cursor, VecCursor};
pub use error::{Result, SequencerError};
pub use merge::Direction;
pub use query::{ParamPredicate, SearchQuery};
pub use sample::{PageOffset, ParamId, Sample, SampleKey, Timestamp};
pub use sequencer::{CheckpointToken, Sequencer, SequencerConfig, SequencerStats};
