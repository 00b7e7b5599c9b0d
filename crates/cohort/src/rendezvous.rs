//! Rendezvous wait table for synchronous messaging
//!
//! Synchronous calls register interest under a typed [`RendezvousKey`]; the
//! dispatch task resolves them. A key is consumed exactly once: the entry is
//! removed under the table lock before its handle is signalled, so a late
//! duplicate finds nothing to wake.
//!
//! Deliveries that arrive before anyone waits are buffered under the same key
//! and handed to the next registration. The buffer keeps at most
//! [`EARLY_DELIVERY_LIMIT`] messages per key and evicts the oldest beyond that;
//! every synchronous delivery also reaches the mailbox, so a member that only
//! reads its mailbox does not accumulate an unbounded backlog here.
//!
//! A plain receive (`UnicastDelivery`) also accepts a synchronous broadcast
//! from the same peer, buffered or live.

use cohort_types::{CohortError, LamportTimestamp, Message, ProcessId, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Buffered early deliveries kept per key
pub const EARLY_DELIVERY_LIMIT: usize = 32;

/// What a wait is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RendezvousRole {
    /// Receiver side of a synchronous broadcast
    BroadcastDelivery,
    /// Receiver waiting for any synchronous message from a peer
    UnicastDelivery,
    /// Sender of a synchronous broadcast collecting N-1 acknowledgments
    BroadcastAcks,
    /// Sender of a synchronous unicast waiting for its acknowledgment
    UnicastAck,
}

/// Typed key of one wait: role, the waiting member and the peer it waits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RendezvousKey {
    /// What is awaited
    pub role: RendezvousRole,
    /// Member that waits
    pub local: ProcessId,
    /// Member whose message or acknowledgment is awaited
    pub peer: ProcessId,
}

impl RendezvousKey {
    /// `local` waiting for a synchronous broadcast from `sender`
    pub fn broadcast_from(local: ProcessId, sender: ProcessId) -> Self {
        Self {
            role: RendezvousRole::BroadcastDelivery,
            local,
            peer: sender,
        }
    }

    /// `local` waiting for any synchronous message from `sender`
    pub fn unicast_from(local: ProcessId, sender: ProcessId) -> Self {
        Self {
            role: RendezvousRole::UnicastDelivery,
            local,
            peer: sender,
        }
    }

    /// `local` collecting acknowledgments of its own synchronous broadcast
    pub fn broadcast_acks(local: ProcessId) -> Self {
        Self {
            role: RendezvousRole::BroadcastAcks,
            local,
            peer: local,
        }
    }

    /// `local` waiting for `dest` to acknowledge a synchronous unicast
    pub fn unicast_ack(local: ProcessId, dest: ProcessId) -> Self {
        Self {
            role: RendezvousRole::UnicastAck,
            local,
            peer: dest,
        }
    }

    /// Plain receive wait that a delivery under this key may also satisfy
    fn receive_alternative(&self) -> Option<RendezvousKey> {
        match self.role {
            RendezvousRole::BroadcastDelivery => Some(Self::unicast_from(self.local, self.peer)),
            _ => None,
        }
    }

    /// Buffer a registration under this key may also consume
    fn buffered_alternative(&self) -> Option<RendezvousKey> {
        match self.role {
            RendezvousRole::UnicastDelivery => Some(Self::broadcast_from(self.local, self.peer)),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct AckWait {
    /// Timestamp of the send being acknowledged
    sent: LamportTimestamp,
    expected: usize,
    ackers: HashSet<ProcessId>,
    done: oneshot::Sender<()>,
}

#[derive(Debug, Default)]
struct TableState {
    closed: bool,
    deliveries: HashMap<RendezvousKey, oneshot::Sender<Message>>,
    early: HashMap<RendezvousKey, VecDeque<Message>>,
    acks: HashMap<RendezvousKey, AckWait>,
    last_delivered: HashMap<RendezvousKey, LamportTimestamp>,
}

impl TableState {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(CohortError::shutdown("rendezvous table closed"));
        }
        Ok(())
    }

    /// Pop the oldest buffered message among `keys`
    fn take_buffered(&mut self, keys: &[RendezvousKey]) -> Option<Message> {
        let key = keys
            .iter()
            .filter_map(|key| {
                let front = self.early.get(key)?.front()?;
                Some((front.timestamp(), *key))
            })
            .min_by_key(|(ts, _)| *ts)
            .map(|(_, key)| key)?;

        let buffered = self.early.get_mut(&key)?;
        let message = buffered.pop_front();
        if buffered.is_empty() {
            self.early.remove(&key);
        }
        message
    }
}

/// Guarded table of pending synchronous waits
#[derive(Debug, Default)]
pub struct RendezvousTable {
    state: Mutex<TableState>,
}

impl RendezvousTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the delivery identified by `key`
    ///
    /// A delivery buffered before this call resolves the handle at once. A
    /// second wait on a key that already has a live waiter is rejected.
    pub fn register(&self, key: RendezvousKey) -> Result<oneshot::Receiver<Message>> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        state.ensure_open()?;

        let mut sources = vec![key];
        sources.extend(key.buffered_alternative());
        if let Some(message) = state.take_buffered(&sources) {
            trace!(?key, "rendezvous satisfied from early buffer");
            let _ = tx.send(message);
            return Ok(rx);
        }

        if let Some(existing) = state.deliveries.get(&key) {
            if !existing.is_closed() {
                return Err(CohortError::protocol_violation(format!(
                    "{key:?} already has a pending wait"
                )));
            }
        }
        state.deliveries.insert(key, tx);
        Ok(rx)
    }

    /// Accept a synchronous delivery stamped `ts` for `key`
    ///
    /// Returns `false` when `ts` is not newer than the last delivery accepted
    /// for `key`; the caller must then drop the message without side effects.
    pub fn admit(&self, key: RendezvousKey, ts: LamportTimestamp) -> bool {
        let mut state = self.state.lock();
        if let Some(last) = state.last_delivered.get(&key) {
            if ts <= *last {
                debug!(?key, ts = %ts, last = %last, "duplicate synchronous delivery ignored");
                return false;
            }
        }
        state.last_delivered.insert(key, ts);
        true
    }

    /// Hand an admitted delivery to its waiter, or buffer it until one registers
    pub fn deliver(&self, key: RendezvousKey, message: Message) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }

        let mut message = message;
        let targets = std::iter::once(key).chain(key.receive_alternative());
        for target in targets {
            let Some(waiter) = state.deliveries.remove(&target) else {
                continue;
            };
            match waiter.send(message) {
                Ok(()) => return,
                // The waiting call was dropped; try the next waiter or buffer.
                Err(returned) => message = returned,
            }
        }

        let buffered = state.early.entry(key).or_default();
        if buffered.len() == EARLY_DELIVERY_LIMIT {
            buffered.pop_front();
            debug!(?key, limit = EARLY_DELIVERY_LIMIT, "early buffer full, oldest delivery evicted");
        }
        buffered.push_back(message);
        trace!(?key, "synchronous delivery buffered");
    }

    /// Start collecting `expected` acknowledgments of the send stamped `sent`
    ///
    /// Must be called before the acknowledged message is published.
    /// Acknowledgments of any earlier send under the same key are ignored.
    pub fn expect_acks(
        &self,
        key: RendezvousKey,
        expected: usize,
        sent: LamportTimestamp,
    ) -> Result<oneshot::Receiver<()>> {
        let (done, rx) = oneshot::channel();
        let mut state = self.state.lock();
        state.ensure_open()?;
        if expected == 0 {
            let _ = done.send(());
            return Ok(rx);
        }
        if let Some(existing) = state.acks.get(&key) {
            if !existing.done.is_closed() {
                return Err(CohortError::protocol_violation(format!(
                    "{key:?} is already collecting acknowledgments"
                )));
            }
        }
        state.acks.insert(
            key,
            AckWait {
                sent,
                expected,
                ackers: HashSet::new(),
                done,
            },
        );
        Ok(rx)
    }

    /// Count an acknowledgment from `from` of the send stamped `acked`
    ///
    /// Returns `true` when it completed the wait. Repeated acknowledgments from
    /// the same member, acknowledgments of another send, and acknowledgments
    /// nobody waits for are ignored.
    pub fn acknowledge(&self, key: RendezvousKey, from: ProcessId, acked: LamportTimestamp) -> bool {
        let mut state = self.state.lock();
        let Some(wait) = state.acks.get_mut(&key) else {
            trace!(?key, from = %from, "acknowledgment without a waiting sender");
            return false;
        };
        if wait.sent != acked {
            debug!(?key, from = %from, acked = %acked, waiting_for = %wait.sent, "stale acknowledgment ignored");
            return false;
        }
        wait.ackers.insert(from);
        if wait.ackers.len() < wait.expected {
            return false;
        }
        if let Some(wait) = state.acks.remove(&key) {
            let _ = wait.done.send(());
        }
        true
    }

    /// Drop any wait registered under `key`
    pub fn cancel(&self, key: RendezvousKey) {
        let mut state = self.state.lock();
        state.deliveries.remove(&key);
        state.acks.remove(&key);
    }

    /// Refuse new waits and fail every pending one
    ///
    /// Dropping the wake handles makes each waiting call observe a closed
    /// channel.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.deliveries.clear();
        state.acks.clear();
        state.early.clear();
    }

    /// Number of registered waits that have not been resolved
    pub fn pending(&self) -> usize {
        let state = self.state.lock();
        state.deliveries.len() + state.acks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cohort_types::Payload;

    fn sync_unicast(sender: u32, ts: u64) -> Message {
        Message::SyncUnicast {
            sender: ProcessId(sender),
            ts: LamportTimestamp::new(ts),
            payload: Payload::text("ping"),
            to: ProcessId(0),
        }
    }

    #[tokio::test]
    async fn wait_is_signalled_once_and_removed() {
        let table = RendezvousTable::new();
        let key = RendezvousKey::unicast_from(ProcessId(0), ProcessId(1));
        let rx = table.register(key).unwrap();
        assert_eq!(table.pending(), 1);

        assert!(table.admit(key, LamportTimestamp::new(3)));
        table.deliver(key, sync_unicast(1, 3));
        assert_eq!(rx.await.unwrap(), sync_unicast(1, 3));
        assert_eq!(table.pending(), 0);
    }

    #[tokio::test]
    async fn duplicate_delivery_is_a_no_op() {
        let table = RendezvousTable::new();
        let key = RendezvousKey::unicast_from(ProcessId(0), ProcessId(1));
        let rx = table.register(key).unwrap();
        assert!(table.admit(key, LamportTimestamp::new(3)));
        table.deliver(key, sync_unicast(1, 3));
        rx.await.unwrap();

        assert!(!table.admit(key, LamportTimestamp::new(3)));
        assert!(!table.admit(key, LamportTimestamp::new(2)));
        // Nothing was buffered, so a new wait stays pending.
        let mut rx = table.register(key).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn early_delivery_satisfies_later_wait() {
        let table = RendezvousTable::new();
        let key = RendezvousKey::broadcast_from(ProcessId(2), ProcessId(1));
        assert!(table.admit(key, LamportTimestamp::new(5)));
        table.deliver(key, sync_unicast(1, 5));
        assert_eq!(table.pending(), 0);

        let rx = table.register(key).unwrap();
        assert_eq!(rx.await.unwrap(), sync_unicast(1, 5));
    }

    #[test]
    fn second_live_wait_on_same_key_is_rejected() {
        let table = RendezvousTable::new();
        let key = RendezvousKey::unicast_from(ProcessId(0), ProcessId(1));
        let _rx = table.register(key).unwrap();
        let err = table.register(key).unwrap_err();
        assert!(matches!(err, CohortError::ProtocolViolation { .. }));
    }

    #[test]
    fn abandoned_wait_keeps_delivery_for_next_caller() {
        let table = RendezvousTable::new();
        let key = RendezvousKey::unicast_from(ProcessId(0), ProcessId(1));
        drop(table.register(key).unwrap());

        table.deliver(key, sync_unicast(1, 2));
        let mut rx = table.register(key).unwrap();
        assert_eq!(rx.try_recv().unwrap(), sync_unicast(1, 2));
    }

    #[tokio::test]
    async fn acks_are_counted_per_distinct_member() {
        let table = RendezvousTable::new();
        let key = RendezvousKey::broadcast_acks(ProcessId(0));
        let sent = LamportTimestamp::new(4);
        let rx = table.expect_acks(key, 2, sent).unwrap();

        assert!(!table.acknowledge(key, ProcessId(1), sent));
        assert!(!table.acknowledge(key, ProcessId(1), sent));
        assert!(table.acknowledge(key, ProcessId(2), sent));
        rx.await.unwrap();

        assert!(!table.acknowledge(key, ProcessId(2), sent));
        assert_eq!(table.pending(), 0);
    }

    #[tokio::test]
    async fn zero_expected_acks_complete_immediately() {
        let table = RendezvousTable::new();
        let rx = table
            .expect_acks(RendezvousKey::broadcast_acks(ProcessId(0)), 0, LamportTimestamp::new(1))
            .unwrap();
        rx.await.unwrap();
        assert_eq!(table.pending(), 0);
    }

    #[tokio::test]
    async fn acknowledgment_of_an_abandoned_send_is_ignored() {
        let table = RendezvousTable::new();
        let key = RendezvousKey::unicast_ack(ProcessId(0), ProcessId(1));
        drop(table.expect_acks(key, 1, LamportTimestamp::new(2)).unwrap());

        let mut retry = table.expect_acks(key, 1, LamportTimestamp::new(5)).unwrap();
        assert!(!table.acknowledge(key, ProcessId(1), LamportTimestamp::new(2)));
        assert!(retry.try_recv().is_err());

        assert!(table.acknowledge(key, ProcessId(1), LamportTimestamp::new(5)));
        retry.await.unwrap();
    }

    fn sync_broadcast(sender: u32, ts: u64) -> Message {
        Message::SyncBroadcast {
            sender: ProcessId(sender),
            ts: LamportTimestamp::new(ts),
            payload: Payload::text("all"),
            original_sender: ProcessId(sender),
        }
    }

    #[tokio::test]
    async fn plain_receive_accepts_a_live_broadcast() {
        let table = RendezvousTable::new();
        let rx = table
            .register(RendezvousKey::unicast_from(ProcessId(1), ProcessId(0)))
            .unwrap();

        table.deliver(RendezvousKey::broadcast_from(ProcessId(1), ProcessId(0)), sync_broadcast(0, 3));
        assert_eq!(rx.await.unwrap(), sync_broadcast(0, 3));
        assert_eq!(table.pending(), 0);
    }

    #[tokio::test]
    async fn plain_receive_takes_oldest_buffered_message_of_either_kind() {
        let table = RendezvousTable::new();
        let receive = RendezvousKey::unicast_from(ProcessId(0), ProcessId(1));
        let broadcast = RendezvousKey::broadcast_from(ProcessId(0), ProcessId(1));
        table.deliver(receive, sync_unicast(1, 7));
        table.deliver(broadcast, sync_broadcast(1, 4));

        assert_eq!(table.register(receive).unwrap().await.unwrap(), sync_broadcast(1, 4));
        assert_eq!(table.register(receive).unwrap().await.unwrap(), sync_unicast(1, 7));

        // Consumed once: the broadcast wait no longer finds it.
        let mut rx = table.register(broadcast).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_wait_does_not_take_buffered_unicast() {
        let table = RendezvousTable::new();
        table.deliver(RendezvousKey::unicast_from(ProcessId(0), ProcessId(1)), sync_unicast(1, 2));

        let mut rx = table
            .register(RendezvousKey::broadcast_from(ProcessId(0), ProcessId(1)))
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn early_buffer_evicts_oldest_beyond_limit() {
        let table = RendezvousTable::new();
        let key = RendezvousKey::unicast_from(ProcessId(0), ProcessId(1));
        for ts in 1..=(EARLY_DELIVERY_LIMIT as u64 + 3) {
            table.deliver(key, sync_unicast(1, ts));
        }

        let mut rx = table.register(key).unwrap();
        assert_eq!(rx.try_recv().unwrap(), sync_unicast(1, 4));
    }

    #[tokio::test]
    async fn close_fails_pending_and_future_waits() {
        let table = RendezvousTable::new();
        let delivery = table
            .register(RendezvousKey::unicast_from(ProcessId(0), ProcessId(1)))
            .unwrap();
        let acks = table
            .expect_acks(RendezvousKey::broadcast_acks(ProcessId(0)), 2, LamportTimestamp::new(1))
            .unwrap();

        table.close();
        assert!(delivery.await.is_err());
        assert!(acks.await.is_err());
        assert_eq!(table.pending(), 0);

        let err = table
            .register(RendezvousKey::unicast_from(ProcessId(0), ProcessId(2)))
            .unwrap_err();
        assert!(matches!(err, CohortError::Shutdown { .. }));
    }
}
