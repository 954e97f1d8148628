//! Cursor sinks for merged offset streams.

use crate::error::SequencerError;
use crate::sample::PageOffset;

/// Single-threaded sink for the ordered page-offset stream produced by
/// [`merge`](crate::Sequencer::merge) and [`search`](crate::Sequencer::search).
///
/// The sequencer writes to a cursor from exactly one thread at a time. A
/// stream ends with either `complete` or `set_error`, never both.
pub trait Cursor {
    /// Receives the next page offset in merge order.
    fn put(&mut self, offset: PageOffset);

    /// Reports a terminal error; no more offsets will follow.
    fn set_error(&mut self, error: SequencerError);

    /// Signals that the stream finished successfully.
    fn complete(&mut self);
}

/// A [`Cursor`] that collects offsets into a vector.
#[derive(Debug, Default)]
pub struct VecCursor {
    /// Offsets received so far, in arrival order.
    pub offsets: Vec<PageOffset>,
    /// Terminal error, if the producer reported one.
    pub error: Option<SequencerError>,
    /// Whether `complete` was signalled.
    pub completed: bool,
}

impl VecCursor {
    /// Creates an empty cursor.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Cursor for VecCursor {
    fn put(&mut self, offset: PageOffset) {
        self.offsets.push(offset);
    }

    fn set_error(&mut self, error: SequencerError) {
        self.error = Some(error);
    }

    fn complete(&mut self) {
        self.completed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_cursor_collects_in_order() {
        let mut cursor = VecCursor::new();
        cursor.put(3);
        cursor.put(1);
        cursor.complete();
        assert_eq!(cursor.offsets, vec![3, 1]);
        assert!(cursor.completed);
        assert_eq!(cursor.error, None);
    }

    #[test]
    fn test_vec_cursor_records_error() {
        let mut cursor = VecCursor::new();
        cursor.set_error(SequencerError::NoData);
        assert_eq!(cursor.error, Some(SequencerError::NoData));
        assert!(!cursor.completed);
    }
}
