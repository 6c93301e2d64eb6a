//! Sequential slot selection
//!
//! Hands out 0, 1, 2, ... and wraps back to 0 at the end of the range.

use crate::distribution::Distribution;

/// Rotating cursor over a job's slots
#[derive(Debug, Default)]
pub struct SequentialDistribution {
    cursor: u64,
}

impl SequentialDistribution {
    pub fn new() -> Self {
        Self { cursor: 0 }
    }

    /// Slot the next call will return
    pub fn position(&self) -> u64 {
        self.cursor
    }
}

impl Distribution for SequentialDistribution {
    fn next_slot(&mut self, size_in_ios: u64) -> u64 {
        if size_in_ios == 0 {
            return 0;
        }

        let slot = self.cursor;
        self.cursor += 1;
        if self.cursor >= size_in_ios {
            self.cursor = 0;
        }
        slot
    }
}
