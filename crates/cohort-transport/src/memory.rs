//! In-memory publish/subscribe bus

use crate::traits::{Subscription, Transport};
use async_trait::async_trait;
use cohort_types::{CohortError, Message, ProcessId, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// In-memory transport for testing and single-host groups
///
/// Cloning the bus shares the member table, so every communicator of a group
/// is handed a clone of the same bus.
#[derive(Clone, Default)]
pub struct MemoryBus {
    members: Arc<RwLock<BTreeMap<ProcessId, mpsc::UnboundedSender<Message>>>>,
}

impl MemoryBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently registered members, in id order
    pub fn members(&self) -> Vec<ProcessId> {
        self.members.read().keys().copied().collect()
    }
}

#[async_trait]
impl Transport for MemoryBus {
    async fn register(&self, member: ProcessId) -> Result<Subscription> {
        let mut members = self.members.write();
        if members.get(&member).is_some_and(|tx| !tx.is_closed()) {
            return Err(CohortError::transport(format!(
                "{member} is already registered"
            )));
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        members.insert(member, sender);
        debug!(process = %member, "registered on memory bus");
        Ok(receiver)
    }

    async fn unregister(&self, member: ProcessId) -> Result<()> {
        if self.members.write().remove(&member).is_some() {
            debug!(process = %member, "unregistered from memory bus");
        }
        Ok(())
    }

    async fn publish(&self, message: Message) -> Result<()> {
        let mut closed = Vec::new();
        {
            let members = self.members.read();
            for (member, sender) in members.iter() {
                if sender.send(message.clone()).is_err() {
                    closed.push(*member);
                }
            }
        }
        trace!(kind = ?message.kind(), "published on memory bus");

        if !closed.is_empty() {
            let mut members = self.members.write();
            for member in closed {
                if members.get(&member).is_some_and(|tx| tx.is_closed()) {
                    members.remove(&member);
                    debug!(process = %member, "dropped closed subscription");
                }
            }
        }
        Ok(())
    }

    fn transport_type(&self) -> &'static str {
        "memory"
    }
}
