//! Centralized barrier
//!
//! The coordinator (id 0) counts arrivals for the current round: its own
//! `synchronize()` directly, everyone else's through `SyncRequest`. When the
//! count reaches N it resets to 0 and the coordinator publishes `SyncRelease`.
//!
//! Each member numbers its own rounds and waits for the matching release
//! generation, so a release for round k can never satisfy a wait for round
//! k + 1.

use cohort_types::{CohortError, ProcessId, Result};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default)]
struct Releases {
    generation: u64,
    closed: bool,
}

/// Barrier bookkeeping of one member
#[derive(Debug)]
pub struct Barrier {
    me: ProcessId,
    group_size: usize,
    /// Arrivals in the current round; only the coordinator counts
    arrivals: Mutex<usize>,
    /// Rounds this member has entered
    entered: Mutex<u64>,
    /// Releases this member has observed
    released: watch::Sender<Releases>,
}

impl Barrier {
    /// Barrier state for `me` in a group of `group_size`
    pub fn new(me: ProcessId, group_size: usize) -> Self {
        let (released, _) = watch::channel(Releases::default());
        Self {
            me,
            group_size,
            arrivals: Mutex::new(0),
            entered: Mutex::new(0),
            released,
        }
    }

    /// Whether this member counts arrivals
    pub fn is_coordinator(&self) -> bool {
        self.me.is_coordinator()
    }

    /// Arrivals counted so far in the current round (always 0 off the coordinator)
    pub fn arrivals(&self) -> usize {
        *self.arrivals.lock()
    }

    /// Start a new round; returns the release generation to wait for
    pub fn enter(&self) -> u64 {
        let mut entered = self.entered.lock();
        *entered += 1;
        *entered
    }

    /// Count one arrival at the coordinator
    ///
    /// Returns `true` when the arrival completes the round; the counter is
    /// already back at 0 by then.
    pub fn record_arrival(&self, from: ProcessId) -> Result<bool> {
        if !self.is_coordinator() {
            return Err(CohortError::protocol_violation(format!(
                "barrier arrival from {from} sent to non-coordinator {}",
                self.me
            )));
        }
        let mut arrivals = self.arrivals.lock();
        *arrivals += 1;
        debug!(from = %from, arrivals = *arrivals, group_size = self.group_size, "barrier arrival");
        if *arrivals > self.group_size {
            return Err(CohortError::invariant_violation(format!(
                "barrier counted {} arrivals in a group of {}",
                *arrivals, self.group_size
            )));
        }
        if *arrivals == self.group_size {
            *arrivals = 0;
            return Ok(true);
        }
        Ok(false)
    }

    /// Record that the current round has been released
    pub fn on_release(&self) {
        self.released.send_modify(|releases| releases.generation += 1);
    }

    /// Wait until release generation `round` has been observed
    ///
    /// Fails with `Shutdown` if the barrier is closed before that.
    pub async fn wait_release(&self, round: u64) -> Result<()> {
        let mut released = self.released.subscribe();
        let releases = *released
            .wait_for(|releases| releases.generation >= round || releases.closed)
            .await
            .map_err(|_| CohortError::shutdown("barrier release channel closed"))?;
        if releases.generation >= round {
            Ok(())
        } else {
            Err(CohortError::shutdown("barrier closed before release"))
        }
    }

    /// Fail every wait for a round that has not been released
    pub fn close(&self) {
        self.released.send_modify(|releases| releases.closed = true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn counter_resets_when_group_is_complete() {
        let barrier = Barrier::new(ProcessId(0), 3);
        assert!(!barrier.record_arrival(ProcessId(1)).unwrap());
        assert!(!barrier.record_arrival(ProcessId(0)).unwrap());
        assert_eq!(barrier.arrivals(), 2);

        assert!(barrier.record_arrival(ProcessId(2)).unwrap());
        assert_eq!(barrier.arrivals(), 0);
    }

    #[test]
    fn non_coordinator_refuses_arrivals() {
        let barrier = Barrier::new(ProcessId(1), 3);
        let err = barrier.record_arrival(ProcessId(2)).unwrap_err();
        assert!(matches!(err, CohortError::ProtocolViolation { .. }));
    }

    #[tokio::test]
    async fn wait_completes_only_for_its_own_round() {
        let barrier = Arc::new(Barrier::new(ProcessId(2), 3));
        assert_eq!(barrier.enter(), 1);
        barrier.on_release();
        barrier.wait_release(1).await.unwrap();

        let round = barrier.enter();
        assert_eq!(round, 2);
        let waiter = {
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move { barrier.wait_release(round).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        barrier.on_release();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn close_fails_unreleased_round() {
        let barrier = Arc::new(Barrier::new(ProcessId(1), 2));
        barrier.enter();
        barrier.on_release();
        let round = barrier.enter();
        let waiter = {
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move { barrier.wait_release(round).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        barrier.close();
        let err = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, CohortError::Shutdown { .. }));
        // A round released before closing still completes.
        barrier.wait_release(1).await.unwrap();
    }
}
