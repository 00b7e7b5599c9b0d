//! Per-process Lamport clock

use cohort_types::LamportTimestamp;
use parking_lot::Mutex;

/// Lamport clock owned by one member
///
/// `tick` and `observe` share one lock, so every value they return is strictly
/// greater than any value returned before on this member.
#[derive(Debug, Default)]
pub struct LogicalClock {
    value: Mutex<LamportTimestamp>,
}

impl LogicalClock {
    /// Clock starting at 0
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance for a local event or before a send
    pub fn tick(&self) -> LamportTimestamp {
        let mut value = self.value.lock();
        value.increment();
        *value
    }

    /// Advance past a timestamp received on a causal message
    pub fn observe(&self, remote: LamportTimestamp) -> LamportTimestamp {
        let mut value = self.value.lock();
        value.merge_and_increment(remote);
        *value
    }

    /// Current value, without advancing
    pub fn now(&self) -> LamportTimestamp {
        *self.value.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    #[test]
    fn observe_jumps_past_remote() {
        let clock = LogicalClock::new();
        assert_eq!(clock.tick().value(), 1);
        assert_eq!(clock.observe(LamportTimestamp::new(7)).value(), 8);
        assert_eq!(clock.observe(LamportTimestamp::new(2)).value(), 9);
        assert_eq!(clock.now().value(), 9);
    }

    #[test]
    fn concurrent_ticks_are_unique() {
        let clock = Arc::new(LogicalClock::new());
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let clock = Arc::clone(&clock);
                std::thread::spawn(move || (0..250).map(|_| clock.tick().value()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<u64> = threads
            .into_iter()
            .flat_map(|t| t.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 1000);
        assert_eq!(clock.now().value(), 1000);
    }

    proptest! {
        #[test]
        fn prop_successive_values_strictly_increase(
            events in prop::collection::vec(prop::option::of(0u64..500), 1..64),
        ) {
            let clock = LogicalClock::new();
            let mut previous = clock.now();
            for event in events {
                let next = match event {
                    Some(remote) => clock.observe(LamportTimestamp::new(remote)),
                    None => clock.tick(),
                };
                prop_assert!(next > previous);
                previous = next;
            }
        }
    }
}
