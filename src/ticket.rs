// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Monotone, non-zero op tickets stamped on segments participating in a
//! merge or flush, so overlapping ops never pick the same segment twice.

use std::sync::{atomic::{AtomicU64, Ordering::{AcqRel, Acquire}}, Arc};

/// An op ticket: `0` means "not participating in any op".
pub type OpTicket = u64;

/// Thread-safe generator of monotonically increasing, non-zero op tickets.
#[derive(Clone, Default, Debug)]
pub struct TicketCounter(Arc<AtomicU64>);

impl TicketCounter {
    /// Returns the next ticket. Tickets start at `1`; `0` is reserved to
    /// mean "no op".
    #[must_use]
    pub fn next(&self) -> OpTicket {
        self.0.fetch_add(1, AcqRel) + 1
    }

    /// Gets the most recently issued ticket without advancing the counter.
    #[must_use]
    pub fn get(&self) -> OpTicket {
        self.0.load(Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn tickets_are_monotonic_and_nonzero() {
        let counter = TicketCounter::default();
        let a = counter.next();
        let b = counter.next();
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert!(b > a);
    }
}
