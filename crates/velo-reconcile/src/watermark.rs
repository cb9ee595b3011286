//! Sequence watermark for at-least-once log delivery.
//!
//! The log may redeliver entries after a crash between delivery and commit.
//! The watermark is seeded from the consumer's durable checkpoint and
//! classifies each delivered entry before it reaches the diff engine.
//!
//! # Invariants
//!
//! - **Strictly increasing**: an entry is fresh only if its `sequence_id` is
//!   greater than the last committed one.
//! - **Advances only on commit**: the caller calls
//!   [`advance`][SequenceWatermark::advance] after the entry's writes are
//!   durable, never on delivery.
//! - **Pure, no IO.**

use velo_schemas::SequenceId;

/// Classification of a delivered log entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Not yet processed; diff and apply it.
    Fresh,
    /// At or below the committed position; already reflected in state.
    Replayed {
        watermark: SequenceId,
        got: SequenceId,
    },
}

impl Delivery {
    pub fn is_fresh(&self) -> bool {
        matches!(self, Delivery::Fresh)
    }
}

#[derive(Clone, Debug)]
pub struct SequenceWatermark {
    last_committed: SequenceId,
}

impl SequenceWatermark {
    /// Start from a durable checkpoint. `0` means nothing has been committed.
    pub fn from_checkpoint(last_committed: SequenceId) -> Self {
        Self { last_committed }
    }

    pub fn check(&self, sequence_id: SequenceId) -> Delivery {
        if sequence_id <= self.last_committed {
            return Delivery::Replayed {
                watermark: self.last_committed,
                got: sequence_id,
            };
        }
        Delivery::Fresh
    }

    /// Record a durable commit. Never moves backwards.
    pub fn advance(&mut self, sequence_id: SequenceId) {
        if sequence_id > self.last_committed {
            self.last_committed = sequence_id;
        }
    }

    pub fn last_committed(&self) -> SequenceId {
        self.last_committed
    }

    /// First sequence id the consumer still needs.
    pub fn next_wanted(&self) -> SequenceId {
        self.last_committed + 1
    }
}
