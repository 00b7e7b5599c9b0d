//! Receive side: one handler per message kind
//!
//! The dispatch task drains a member's transport subscription and runs the
//! handler matching each message. Handlers never wait on anything a later
//! inbound message would have to resolve; the only thing they await is a
//! publish. Errors are logged and the offending message is dropped.

use crate::communicator::Inner;
use crate::rendezvous::RendezvousKey;
use crate::token::TokenArrival;
use cohort_transport::Subscription;
use cohort_types::{AckKind, CohortError, LamportTimestamp, Message, ProcessId, Result};
use std::sync::Weak;
use tracing::{debug, error, trace, warn};

/// Drain `subscription` until it closes or the member is gone
pub(crate) async fn run(member: Weak<Inner>, mut subscription: Subscription) {
    while let Some(message) = subscription.recv().await {
        let Some(inner) = member.upgrade() else {
            break;
        };
        let kind = message.kind();
        if let Err(e) = inner.handle(message).await {
            match e {
                CohortError::InvariantViolation { .. } => {
                    error!(process = %inner.id, ?kind, error = %e, "invariant violated, message dropped")
                }
                _ => warn!(process = %inner.id, ?kind, error = %e, "message dropped"),
            }
        }
    }
    trace!("dispatch loop finished");
}

impl Inner {
    /// Route one inbound message to its handler
    pub(crate) async fn handle(&self, message: Message) -> Result<()> {
        message.validate(self.group_size)?;

        match message {
            Message::Broadcast { sender, ts, .. } => {
                if sender != self.id {
                    self.deliver_async(sender, ts, message);
                }
                Ok(())
            }
            Message::Unicast { sender, ts, to, .. } => {
                if to == self.id {
                    self.deliver_async(sender, ts, message);
                }
                Ok(())
            }
            Message::Token { to } => {
                if to == self.id {
                    self.on_token().await?;
                }
                Ok(())
            }
            Message::SyncRequest { sender, to, .. } => {
                if to == self.id {
                    self.on_barrier_arrival(sender, &message).await?;
                }
                Ok(())
            }
            Message::SyncRelease { sender, .. } => {
                // The coordinator releases its own wait when it publishes.
                if sender != self.id {
                    debug!(process = %self.id, "barrier released");
                    self.barrier.on_release();
                }
                Ok(())
            }
            Message::SyncBroadcast {
                sender,
                ts,
                original_sender,
                ..
            } => {
                if sender == self.id {
                    return Ok(());
                }
                let key = RendezvousKey::broadcast_from(self.id, original_sender);
                self.deliver_sync(key, ts, message, original_sender, AckKind::Broadcast)
                    .await
            }
            Message::SyncUnicast { sender, ts, to, .. } => {
                if to != self.id {
                    return Ok(());
                }
                let key = RendezvousKey::unicast_from(self.id, sender);
                self.deliver_sync(key, ts, message, sender, AckKind::Unicast)
                    .await
            }
            Message::SyncAck {
                sender,
                kind,
                acked,
                to,
                ..
            } => {
                if to != self.id {
                    return Ok(());
                }
                let key = match kind {
                    AckKind::Broadcast => RendezvousKey::broadcast_acks(self.id),
                    AckKind::Unicast => RendezvousKey::unicast_ack(self.id, sender),
                };
                if self.rendezvous.acknowledge(key, sender, acked) {
                    trace!(process = %self.id, ?kind, "acknowledgments complete");
                }
                Ok(())
            }
        }
    }

    /// Merge the timestamp of a causal message into the local clock
    ///
    /// Returns the clock after the update; non-causal kinds leave it untouched.
    fn observe(&self, message: &Message) -> LamportTimestamp {
        match message.timestamp() {
            Some(ts) if message.is_causal() => self.clock.observe(ts),
            _ => self.clock.now(),
        }
    }

    fn deliver_async(&self, sender: ProcessId, ts: LamportTimestamp, message: Message) {
        let now = self.observe(&message);
        debug!(process = %self.id, from = %sender, ts = %ts, clock = %now, "message delivered");
        self.mailbox.push(message);
    }

    async fn deliver_sync(
        &self,
        key: RendezvousKey,
        ts: LamportTimestamp,
        message: Message,
        ack_to: ProcessId,
        kind: AckKind,
    ) -> Result<()> {
        if !self.rendezvous.admit(key, ts) {
            return Ok(());
        }
        let now = self.observe(&message);
        debug!(process = %self.id, from = %ack_to, ts = %ts, clock = %now, ?kind, "synchronous message delivered");
        self.mailbox.push(message.clone());
        self.rendezvous.deliver(key, message);

        self.publish(Message::SyncAck {
            sender: self.id,
            ts: self.clock.now(),
            kind,
            acked: ts,
            to: ack_to,
        })
        .await
    }

    async fn on_token(&self) -> Result<()> {
        match self.token.on_token()? {
            TokenArrival::Granted => Ok(()),
            TokenArrival::Forward(next) => {
                trace!(process = %self.id, to = %next, "forwarding idle token");
                self.forward_token(next, true).await
            }
        }
    }

    async fn on_barrier_arrival(&self, sender: ProcessId, message: &Message) -> Result<()> {
        self.observe(message);
        if self.barrier.record_arrival(sender)? {
            self.release_barrier().await?;
        }
        Ok(())
    }
}
