//! Group communicator
//!
//! [`Communicator`] is the handle an application uses to take part in a group.
//! Joining assigns an id, registers with the transport, starts the dispatch
//! task and, on the coordinator, schedules the first token.
//!
//! # Blocking calls
//!
//! Several methods only complete once other members have acted. None of them
//! has a deadline; wrap them in `tokio::time::timeout` when a bound is needed.
//!
//! | Call | Completes when |
//! |------|----------------|
//! | [`Communicator::request`] | the token reaches this member |
//! | [`Communicator::synchronize`] | all N members called `synchronize` for the round |
//! | [`Communicator::broadcast_sync`] (sender) | every other member received the broadcast |
//! | [`Communicator::broadcast_sync`] (receiver) | the named sender called `broadcast_sync` |
//! | [`Communicator::unicast_sync`] | the destination received the message |
//! | [`Communicator::receive_sync`] | the named sender sent us a synchronous message |
//! | [`Mailbox::pop`] | a user message was delivered |
//!
//! After [`Communicator::shutdown`] every call in the table except
//! [`Mailbox::pop`] fails with `Shutdown`, including calls already waiting.

use crate::barrier::Barrier;
use crate::clock::LogicalClock;
use crate::dispatch;
use crate::identity::IdentityRegistry;
use crate::mailbox::Mailbox;
use crate::rendezvous::{RendezvousKey, RendezvousTable};
use crate::tasks::TaskRegistry;
use crate::token::{TokenPhase, TokenRing};
use cohort_transport::Transport;
use cohort_types::{
    CohortError, GroupConfig, LamportTimestamp, Message, Payload, ProcessId, Result, TokenConfig,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// State shared by a communicator handle and its dispatch task
pub(crate) struct Inner {
    pub(crate) id: ProcessId,
    pub(crate) group_size: usize,
    pub(crate) token_config: TokenConfig,
    pub(crate) clock: LogicalClock,
    pub(crate) mailbox: Mailbox,
    pub(crate) token: TokenRing,
    pub(crate) barrier: Barrier,
    pub(crate) rendezvous: RendezvousTable,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) tasks: TaskRegistry,
}

impl Inner {
    pub(crate) async fn publish(&self, message: Message) -> Result<()> {
        self.transport.publish(message).await
    }

    /// Send the token to `to`, now or after the configured idle delay
    pub(crate) async fn forward_token(&self, to: ProcessId, idle: bool) -> Result<()> {
        let delay = self.token_config.idle_hop_delay;
        if !idle || delay.is_zero() {
            return self.publish(Message::Token { to }).await;
        }
        let transport = Arc::clone(&self.transport);
        let from = self.id;
        self.tasks.spawn_after(delay, async move {
            if let Err(e) = transport.publish(Message::Token { to }).await {
                warn!(process = %from, to = %to, error = %e, "delayed token hop failed");
            }
        });
        Ok(())
    }

    /// Pass a token granted to an abandoned request on to `to`
    fn pass_unclaimed_token(&self, to: ProcessId) {
        if tokio::runtime::Handle::try_current().is_err() {
            warn!(process = %self.id, to = %to, "no runtime to pass the token on, token lost");
            return;
        }
        let transport = Arc::clone(&self.transport);
        let from = self.id;
        self.tasks.spawn_cancellable(async move {
            if let Err(e) = transport.publish(Message::Token { to }).await {
                warn!(process = %from, to = %to, error = %e, "passing unclaimed token failed");
            }
        });
    }

    /// Publish the release of the current barrier round and unblock ourselves
    pub(crate) async fn release_barrier(&self) -> Result<()> {
        let ts = self.clock.now();
        info!(process = %self.id, ts = %ts, "barrier round complete");
        self.publish(Message::SyncRelease {
            sender: self.id,
            ts,
        })
        .await?;
        self.barrier.on_release();
        Ok(())
    }
}

/// A member's handle on its group
///
/// Cloning yields another handle on the same member. Background tasks stop
/// when [`Communicator::shutdown`] is called or the last handle is dropped.
#[derive(Clone)]
pub struct Communicator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Communicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Communicator")
            .field("id", &self.inner.id)
            .field("group_size", &self.inner.group_size)
            .field("transport", &self.inner.transport.transport_type())
            .finish()
    }
}

impl Communicator {
    /// Join the group described by `config`
    ///
    /// Fails with `Configuration` if the config is invalid or disagrees with the
    /// registry about the group size, and with `IdentityAssignment` if no id
    /// could be obtained. Must be called inside a tokio runtime.
    pub async fn join(
        config: &GroupConfig,
        registry: &dyn IdentityRegistry,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        if registry.group_size() != config.group_size {
            return Err(CohortError::configuration(format!(
                "registry group size {} differs from configured {}",
                registry.group_size(),
                config.group_size
            )));
        }

        let id = registry.assign().await?;
        let subscription = transport.register(id).await?;
        let group_size = config.group_size;

        let inner = Arc::new(Inner {
            id,
            group_size,
            token_config: config.token.clone(),
            clock: LogicalClock::new(),
            mailbox: Mailbox::new(),
            token: TokenRing::new(id, group_size),
            barrier: Barrier::new(id, group_size),
            rendezvous: RendezvousTable::new(),
            transport,
            tasks: TaskRegistry::new(),
        });

        inner
            .tasks
            .spawn_cancellable(dispatch::run(Arc::downgrade(&inner), subscription));

        if id.is_coordinator() {
            let transport = Arc::clone(&inner.transport);
            let delay = config.token.bootstrap_delay;
            inner.tasks.spawn_after(delay, async move {
                info!(process = %id, "originating token");
                if let Err(e) = transport.publish(Message::Token { to: id }).await {
                    warn!(process = %id, error = %e, "token origination failed");
                }
            });
        }

        info!(
            process = %id,
            group_size,
            transport = inner.transport.transport_type(),
            "joined group"
        );
        Ok(Self { inner })
    }

    /// This member's id
    pub fn id(&self) -> ProcessId {
        self.inner.id
    }

    /// Number of members in the group
    pub fn group_size(&self) -> usize {
        self.inner.group_size
    }

    /// Advance the clock for a local event
    pub fn tick(&self) -> LamportTimestamp {
        self.inner.clock.tick()
    }

    /// Current clock value, without advancing it
    pub fn clock(&self) -> LamportTimestamp {
        self.inner.clock.now()
    }

    /// Messages delivered to this member
    pub fn mailbox(&self) -> &Mailbox {
        &self.inner.mailbox
    }

    /// Where this member stands with respect to the critical section
    pub fn token_phase(&self) -> TokenPhase {
        self.inner.token.phase()
    }

    /// Barrier arrivals counted in the current round; always 0 off the coordinator
    pub fn barrier_arrivals(&self) -> usize {
        self.inner.barrier.arrivals()
    }

    /// Send `payload` to every other member; returns the message timestamp
    pub async fn broadcast(&self, payload: impl Into<Payload>) -> Result<LamportTimestamp> {
        let ts = self.inner.clock.tick();
        self.inner
            .publish(Message::Broadcast {
                sender: self.inner.id,
                ts,
                payload: payload.into(),
            })
            .await?;
        debug!(process = %self.inner.id, ts = %ts, "broadcast sent");
        Ok(ts)
    }

    /// Send `payload` to `dest` only; returns the message timestamp
    pub async fn unicast(&self, payload: impl Into<Payload>, dest: ProcessId) -> Result<LamportTimestamp> {
        self.check_member(dest)?;
        let ts = self.inner.clock.tick();
        self.inner
            .publish(Message::Unicast {
                sender: self.inner.id,
                ts,
                payload: payload.into(),
                to: dest,
            })
            .await?;
        debug!(process = %self.inner.id, to = %dest, ts = %ts, "unicast sent");
        Ok(ts)
    }

    /// Enter the critical section
    ///
    /// Completes when the circulating token reaches this member, or at once if
    /// it is already held here. Never completes if the token was lost or the
    /// current holder never calls [`release`](Self::release).
    ///
    /// Dropping the returned future withdraws the request; a token that was
    /// granted to it in the meantime is passed on to the next member.
    pub async fn request(&self) -> Result<()> {
        let inner = &self.inner;
        inner
            .token
            .acquire(|next| inner.pass_unclaimed_token(next))
            .await
    }

    /// Leave the critical section and pass the token to the next member
    ///
    /// Fails with `ProtocolViolation`, forwarding nothing, if the token is not
    /// held here.
    pub async fn release(&self) -> Result<()> {
        let next = self.inner.token.release()?;
        debug!(process = %self.inner.id, to = %next, "token released");
        self.inner.forward_token(next, false).await
    }

    /// Wait until every member has called `synchronize` for this round
    ///
    /// Blocks the whole group if any member never calls it.
    pub async fn synchronize(&self) -> Result<()> {
        let inner = &self.inner;
        let round = inner.barrier.enter();
        debug!(process = %inner.id, round, "entering barrier");

        if inner.barrier.is_coordinator() {
            if inner.barrier.record_arrival(inner.id)? {
                inner.release_barrier().await?;
            }
        } else {
            let ts = inner.clock.tick();
            inner
                .publish(Message::SyncRequest {
                    sender: inner.id,
                    ts,
                    to: ProcessId::COORDINATOR,
                })
                .await?;
        }

        inner.barrier.wait_release(round).await?;
        debug!(process = %inner.id, round, "leaving barrier");
        Ok(())
    }

    /// Synchronous broadcast
    ///
    /// On the member named by `sender`, publishes `payload` and completes once
    /// every other member has acknowledged it; returns `None`. On every other
    /// member, `payload` is ignored and the call completes with the broadcast
    /// published by `sender`. Each member of the group must make the matching
    /// call, or the sender blocks.
    pub async fn broadcast_sync(
        &self,
        payload: impl Into<Payload>,
        sender: ProcessId,
    ) -> Result<Option<Message>> {
        self.check_member(sender)?;
        let inner = &self.inner;

        if sender != inner.id {
            let key = RendezvousKey::broadcast_from(inner.id, sender);
            let message = Self::wait_delivery(inner.rendezvous.register(key)?).await?;
            return Ok(Some(message));
        }

        let key = RendezvousKey::broadcast_acks(inner.id);
        let ts = inner.clock.tick();
        let acked = inner.rendezvous.expect_acks(key, inner.group_size - 1, ts)?;
        let published = inner
            .publish(Message::SyncBroadcast {
                sender: inner.id,
                ts,
                payload: payload.into(),
                original_sender: inner.id,
            })
            .await;
        if let Err(e) = published {
            inner.rendezvous.cancel(key);
            return Err(e);
        }
        acked
            .await
            .map_err(|_| CohortError::shutdown("acknowledgment wait dropped"))?;
        debug!(process = %inner.id, ts = %ts, "synchronous broadcast acknowledged");
        Ok(None)
    }

    /// Send `payload` to `dest` and wait for its acknowledgment
    ///
    /// `dest` acknowledges on delivery, whether or not it is inside
    /// [`receive_sync`](Self::receive_sync).
    pub async fn unicast_sync(&self, payload: impl Into<Payload>, dest: ProcessId) -> Result<()> {
        self.check_member(dest)?;
        let inner = &self.inner;

        let key = RendezvousKey::unicast_ack(inner.id, dest);
        let ts = inner.clock.tick();
        let acked = inner.rendezvous.expect_acks(key, 1, ts)?;
        let published = inner
            .publish(Message::SyncUnicast {
                sender: inner.id,
                ts,
                payload: payload.into(),
                to: dest,
            })
            .await;
        if let Err(e) = published {
            inner.rendezvous.cancel(key);
            return Err(e);
        }
        acked
            .await
            .map_err(|_| CohortError::shutdown("acknowledgment wait dropped"))?;
        debug!(process = %inner.id, to = %dest, ts = %ts, "synchronous unicast acknowledged");
        Ok(())
    }

    /// Wait for a synchronous message from `sender`
    ///
    /// Accepts a synchronous unicast from `sender` to us or a synchronous
    /// broadcast originated by `sender`. A message that arrived before this
    /// call is returned at once, oldest first; each message is returned by at
    /// most one call. Every synchronous delivery is also pushed to the mailbox,
    /// so an application should read one or the other for a given sender.
    pub async fn receive_sync(&self, sender: ProcessId) -> Result<Message> {
        self.check_member(sender)?;
        let key = RendezvousKey::unicast_from(self.inner.id, sender);
        Self::wait_delivery(self.inner.rendezvous.register(key)?).await
    }

    /// Leave the group
    ///
    /// Cancels background work, fails every pending blocking call with
    /// `Shutdown` and unregisters from the transport. A token held at this
    /// point leaves the group with us. [`Mailbox::pop`] is not interrupted.
    pub async fn shutdown(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.token.phase() == TokenPhase::Holding {
            warn!(process = %inner.id, "shutting down while holding the token");
        }
        inner.tasks.shutdown();
        inner.token.close();
        inner.barrier.close();
        inner.rendezvous.close();
        inner.transport.unregister(inner.id).await?;
        info!(process = %inner.id, "left group");
        Ok(())
    }

    fn check_member(&self, id: ProcessId) -> Result<()> {
        if id.in_group(self.inner.group_size) {
            Ok(())
        } else {
            Err(CohortError::protocol_violation(format!(
                "{id} is not a member of a group of {}",
                self.inner.group_size
            )))
        }
    }

    async fn wait_delivery(handle: tokio::sync::oneshot::Receiver<Message>) -> Result<Message> {
        handle
            .await
            .map_err(|_| CohortError::shutdown("rendezvous wait dropped"))
    }
}
