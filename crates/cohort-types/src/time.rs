//! Lamport time
//!
//! This module provides the Lamport timestamp carried by every causal message.
//! The mutable per-process clock built on top of it lives in `cohort::clock`.

use serde::{Deserialize, Serialize};

/// Lamport timestamp for causal ordering
///
/// If send event A happens-before send event B, then `ts(A) < ts(B)`.
/// The converse does not hold: concurrent events may be ordered either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub struct LamportTimestamp(pub u64);

impl LamportTimestamp {
    /// Create a new timestamp with value 0
    pub fn zero() -> Self {
        Self(0)
    }

    /// Create a new timestamp with a specific value
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the inner value
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Increment timestamp (for local events and sends)
    pub fn increment(&mut self) {
        self.0 += 1;
    }

    /// Merge with a received timestamp and increment
    ///
    /// Used when receiving causal messages:
    /// local_clock = max(local_clock, message_clock) + 1
    pub fn merge_and_increment(&mut self, other: LamportTimestamp) {
        self.0 = self.0.max(other.0) + 1;
    }
}

impl Default for LamportTimestamp {
    fn default() -> Self {
        Self::zero()
    }
}

impl From<u64> for LamportTimestamp {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<LamportTimestamp> for u64 {
    fn from(timestamp: LamportTimestamp) -> u64 {
        timestamp.0
    }
}

impl std::fmt::Display for LamportTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn merge_takes_max_plus_one() {
        let mut local = LamportTimestamp::new(3);
        local.merge_and_increment(LamportTimestamp::new(10));
        assert_eq!(local.value(), 11);

        local.merge_and_increment(LamportTimestamp::new(2));
        assert_eq!(local.value(), 12);
    }

    proptest! {
        #[test]
        fn prop_merge_exceeds_both_inputs(local in 0u64..1_000_000, remote in 0u64..1_000_000) {
            let mut ts = LamportTimestamp::new(local);
            ts.merge_and_increment(LamportTimestamp::new(remote));
            prop_assert!(ts.value() > local);
            prop_assert!(ts.value() > remote);
        }
    }
}
