//! Core transport trait definitions

use async_trait::async_trait;
use cohort_types::{Message, ProcessId, Result};
use tokio::sync::mpsc;

/// Stream of messages delivered to one registered member
///
/// Messages from a single publisher arrive in publish order.
pub type Subscription = mpsc::UnboundedReceiver<Message>;

/// Publish/subscribe interface every group transport provides
#[async_trait]
pub trait Transport: Send + Sync {
    /// Register a member and obtain its delivery stream
    async fn register(&self, member: ProcessId) -> Result<Subscription>;

    /// Stop delivering to a member
    async fn unregister(&self, member: ProcessId) -> Result<()>;

    /// Fire-and-forget delivery to every registered member
    async fn publish(&self, message: Message) -> Result<()>;

    /// Get transport type identifier
    fn transport_type(&self) -> &'static str;
}
