//! Accumulates a voltage history from a stream of GATT indications.
//!
//! The monitor transmits each history in reverse chronological order (newest
//! value first, one value per indication) and signals the end of the stream
//! with the sentinel value -1. Incoming values are therefore inserted at the
//! head of the buffer so that the completed sequence reads oldest to newest.

use std::collections::VecDeque;

/// End-of-history marker sent by the device. Not a data point.
pub const HISTORY_TERMINATOR: i16 = -1;

/// Nominal maximum history length, used to scale progress display. Longer
/// transfers are still accepted; only the reported ratio saturates.
pub const MAX_HISTORY_LEN: usize = 128;

/// Outcome of feeding one indication value to the accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accepted {
    /// The value was added; `received` values have been collected so far.
    Value { received: usize },
    /// The terminator was seen, the history is complete.
    Complete,
}

/// Buffer collecting one history transfer. Lives for the duration of a single
/// history task and is consumed when the terminator arrives.
#[derive(Debug, Default)]
pub struct HistoryAccumulator {
    values: VecDeque<i16>,
}

impl HistoryAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next indication value.
    pub fn accept(&mut self, value: i16) -> Accepted {
        if value == HISTORY_TERMINATOR {
            return Accepted::Complete;
        }
        self.values.push_front(value);
        Accepted::Value {
            received: self.values.len(),
        }
    }

    /// Number of values collected so far.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The completed history in chronological order, oldest first.
    pub fn into_values(self) -> Vec<i16> {
        self.values.into()
    }
}
