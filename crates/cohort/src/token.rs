//! Token ring mutual exclusion
//!
//! A single token circulates among members in increasing id order, modulo N.
//! Only the member holding the token may be inside the critical section.
//!
//! ```text
//!            request()                 token arrives, request pending
//!   Idle ───────────────▶ Requesting ─────────────────────────────────▶ Holding
//!    ▲                                                                     │
//!    └──────────────────── release(): forward to self + 1 mod N ───────────┘
//!
//!   token arrives, no request pending: stay, forward to self + 1 mod N
//!   request dropped before the grant was seen: back to Idle, forward
//! ```
//!
//! This module owns the state machine only. Moving the token between members
//! is done by the communicator, which publishes `Message::Token` to whatever
//! successor a transition returns.

use cohort_types::{CohortError, ProcessId, Result};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Where a member stands with respect to the critical section
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenPhase {
    /// Not interested in the critical section
    Idle,
    /// Waiting for the token
    Requesting,
    /// Inside the critical section
    Holding,
}

/// What to do with a token that just arrived
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenArrival {
    /// A local request was pending; the token stays here
    Granted,
    /// Nobody here wants it; pass it to the successor
    Forward(ProcessId),
}

#[derive(Debug)]
struct TokenState {
    phase: TokenPhase,
    /// `acquire` calls currently waiting for the token
    waiters: usize,
    /// Some waiter has returned from the current grant
    grant_observed: bool,
    closed: bool,
}

/// Token state of one member
#[derive(Debug)]
pub struct TokenRing {
    me: ProcessId,
    group_size: usize,
    state: Mutex<TokenState>,
    granted: Notify,
}

/// Live `acquire` call; undoes its request if dropped before completing
struct PendingRequest<'a, F: FnOnce(ProcessId)> {
    ring: &'a TokenRing,
    on_abandoned_grant: Option<F>,
    completed: bool,
}

impl<F: FnOnce(ProcessId)> Drop for PendingRequest<'_, F> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        if let Some(next) = self.ring.abandon() {
            if let Some(forward) = self.on_abandoned_grant.take() {
                forward(next);
            }
        }
    }
}

impl TokenRing {
    /// Idle ring position for `me` in a group of `group_size`
    pub fn new(me: ProcessId, group_size: usize) -> Self {
        Self {
            me,
            group_size,
            state: Mutex::new(TokenState {
                phase: TokenPhase::Idle,
                waiters: 0,
                grant_observed: false,
                closed: false,
            }),
            granted: Notify::new(),
        }
    }

    /// Current phase
    pub fn phase(&self) -> TokenPhase {
        self.state.lock().phase
    }

    /// Whether an `acquire` call is waiting for the token
    pub fn request_pending(&self) -> bool {
        self.state.lock().waiters > 0
    }

    /// Next member on the ring
    pub fn successor(&self) -> ProcessId {
        self.me.next_in_ring(self.group_size)
    }

    /// Wait until this member holds the token
    ///
    /// Returns at once if the token is already held here. Otherwise completes
    /// only when the token reaches this member, so it never returns if the
    /// token was never originated or has been lost. Every concurrent caller is
    /// woken by the same grant.
    ///
    /// Dropping the call before it completes withdraws the request. If the
    /// token was granted to it but no caller observed the grant, the member
    /// goes back to `Idle` and `on_abandoned_grant` receives the successor the
    /// token must be passed to.
    ///
    /// Fails with `Shutdown` once [`close`](Self::close) has been called.
    pub async fn acquire(&self, on_abandoned_grant: impl FnOnce(ProcessId)) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(CohortError::shutdown("token ring closed"));
            }
            if state.phase == TokenPhase::Holding {
                return Ok(());
            }
            state.phase = TokenPhase::Requesting;
            state.waiters += 1;
        }
        debug!(process = %self.me, "requesting token");

        let mut pending = PendingRequest {
            ring: self,
            on_abandoned_grant: Some(on_abandoned_grant),
            completed: false,
        };
        loop {
            let notified = self.granted.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if state.closed {
                    state.waiters -= 1;
                    pending.completed = true;
                    return Err(CohortError::shutdown("token ring closed"));
                }
                if state.phase == TokenPhase::Holding {
                    state.waiters -= 1;
                    state.grant_observed = true;
                    pending.completed = true;
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Withdraw one waiting request; returns where an unclaimed token must go
    fn abandon(&self) -> Option<ProcessId> {
        let mut state = self.state.lock();
        state.waiters = state.waiters.saturating_sub(1);
        if state.waiters > 0 {
            return None;
        }
        match state.phase {
            TokenPhase::Requesting => {
                state.phase = TokenPhase::Idle;
                debug!(process = %self.me, "token request withdrawn");
                None
            }
            TokenPhase::Holding if !state.grant_observed => {
                state.phase = TokenPhase::Idle;
                warn!(process = %self.me, "token granted to a withdrawn request, passing it on");
                Some(self.successor())
            }
            _ => None,
        }
    }

    /// Handle a token addressed to this member
    pub fn on_token(&self) -> Result<TokenArrival> {
        let mut state = self.state.lock();
        if state.phase == TokenPhase::Holding {
            return Err(CohortError::invariant_violation(format!(
                "{} received a token while already holding one",
                self.me
            )));
        }
        if state.waiters > 0 {
            state.phase = TokenPhase::Holding;
            state.grant_observed = false;
            drop(state);
            self.granted.notify_waiters();
            debug!(process = %self.me, "token granted");
            Ok(TokenArrival::Granted)
        } else {
            Ok(TokenArrival::Forward(self.successor()))
        }
    }

    /// Leave the critical section; returns the member the token must go to
    pub fn release(&self) -> Result<ProcessId> {
        let mut state = self.state.lock();
        if state.phase != TokenPhase::Holding {
            return Err(CohortError::protocol_violation(format!(
                "{} released a token it does not hold ({:?})",
                self.me, state.phase
            )));
        }
        state.phase = if state.waiters > 0 {
            TokenPhase::Requesting
        } else {
            TokenPhase::Idle
        };
        state.grant_observed = false;
        Ok(self.successor())
    }

    /// Fail every waiting and future `acquire`
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.granted.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn no_forward(_: ProcessId) {}

    #[test]
    fn idle_member_forwards_to_successor() {
        let ring = TokenRing::new(ProcessId(2), 3);
        assert_eq!(ring.on_token().unwrap(), TokenArrival::Forward(ProcessId(0)));
        assert_eq!(ring.phase(), TokenPhase::Idle);
    }

    #[tokio::test]
    async fn pending_request_is_granted_on_arrival() {
        let ring = Arc::new(TokenRing::new(ProcessId(1), 3));
        let waiter = {
            let ring = Arc::clone(&ring);
            tokio::spawn(async move { ring.acquire(no_forward).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ring.phase(), TokenPhase::Requesting);
        assert!(ring.request_pending());
        assert!(!waiter.is_finished());

        assert_eq!(ring.on_token().unwrap(), TokenArrival::Granted);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(ring.phase(), TokenPhase::Holding);
        assert!(!ring.request_pending());
    }

    #[tokio::test]
    async fn acquire_while_holding_returns_immediately() {
        let ring = TokenRing::new(ProcessId(0), 2);
        let acquire = ring.acquire(no_forward);
        tokio::pin!(acquire);
        assert!(futures::poll!(acquire.as_mut()).is_pending());
        ring.on_token().unwrap();
        acquire.await.unwrap();

        tokio::time::timeout(Duration::from_millis(100), ring.acquire(no_forward))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn one_grant_wakes_every_concurrent_caller() {
        let ring = Arc::new(TokenRing::new(ProcessId(1), 3));
        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let ring = Arc::clone(&ring);
                tokio::spawn(async move { ring.acquire(no_forward).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;

        ring.on_token().unwrap();
        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test]
    async fn dropped_request_returns_to_idle_and_forwards_arrivals() {
        let ring = TokenRing::new(ProcessId(1), 3);
        {
            let acquire = ring.acquire(no_forward);
            tokio::pin!(acquire);
            assert!(futures::poll!(acquire.as_mut()).is_pending());
            assert_eq!(ring.phase(), TokenPhase::Requesting);
        }
        assert_eq!(ring.phase(), TokenPhase::Idle);
        assert!(!ring.request_pending());
        assert_eq!(ring.on_token().unwrap(), TokenArrival::Forward(ProcessId(2)));
    }

    #[tokio::test]
    async fn grant_to_a_dropped_request_is_passed_on() {
        let ring = TokenRing::new(ProcessId(1), 3);
        let forwarded = Mutex::new(None);
        {
            let acquire = ring.acquire(|next| *forwarded.lock() = Some(next));
            tokio::pin!(acquire);
            assert!(futures::poll!(acquire.as_mut()).is_pending());
            // Granted, but the caller goes away before it observes the grant.
            assert_eq!(ring.on_token().unwrap(), TokenArrival::Granted);
        }
        assert_eq!(*forwarded.lock(), Some(ProcessId(2)));
        assert_eq!(ring.phase(), TokenPhase::Idle);
        assert!(ring.release().is_err());
    }

    #[tokio::test]
    async fn release_clears_request_and_names_successor() {
        let ring = TokenRing::new(ProcessId(1), 3);
        let acquire = ring.acquire(no_forward);
        tokio::pin!(acquire);
        assert!(futures::poll!(acquire.as_mut()).is_pending());
        ring.on_token().unwrap();
        acquire.await.unwrap();

        assert_eq!(ring.release().unwrap(), ProcessId(2));
        assert_eq!(ring.phase(), TokenPhase::Idle);
        assert_eq!(ring.on_token().unwrap(), TokenArrival::Forward(ProcessId(2)));
    }

    #[test]
    fn release_without_token_is_rejected() {
        let ring = TokenRing::new(ProcessId(0), 3);
        let err = ring.release().unwrap_err();
        assert!(matches!(err, CohortError::ProtocolViolation { .. }));
    }

    #[tokio::test]
    async fn second_token_while_holding_is_an_invariant_violation() {
        let ring = TokenRing::new(ProcessId(0), 3);
        let acquire = ring.acquire(no_forward);
        tokio::pin!(acquire);
        assert!(futures::poll!(acquire.as_mut()).is_pending());
        ring.on_token().unwrap();
        acquire.await.unwrap();

        let err = ring.on_token().unwrap_err();
        assert!(matches!(err, CohortError::InvariantViolation { .. }));
        assert_eq!(ring.phase(), TokenPhase::Holding);
    }

    #[tokio::test]
    async fn close_fails_waiting_and_later_requests() {
        let ring = Arc::new(TokenRing::new(ProcessId(1), 3));
        let waiter = {
            let ring = Arc::clone(&ring);
            tokio::spawn(async move { ring.acquire(no_forward).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        ring.close();
        let err = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, CohortError::Shutdown { .. }));
        assert!(matches!(
            ring.acquire(no_forward).await,
            Err(CohortError::Shutdown { .. })
        ));
    }
}
