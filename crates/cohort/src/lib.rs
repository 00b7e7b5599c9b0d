//! # Cohort - Group Coordination Middleware
//!
//! Lets independent processes communicate and synchronize as members of one
//! logical group, without shared memory, over any publish/subscribe
//! [`Transport`](cohort_transport::Transport).
//!
//! ## Purpose
//!
//! - Group-unique identity assignment through an [`IdentityRegistry`]
//! - A Lamport [`LogicalClock`] per member
//! - Asynchronous broadcast and unicast into a per-member [`Mailbox`]
//! - Mutual exclusion through a token circulating on a ring
//! - A centralized barrier coordinated by member 0
//! - Synchronous (rendezvous) send and receive with acknowledgments
//!
//! ## Architecture
//!
//! Each [`Communicator`] owns one dispatch task that drains its transport
//! subscription and runs the handler for each message kind. Application calls
//! and handlers share per-member state (clock, mailbox, token, barrier,
//! rendezvous table), each behind its own short lock. Background work is
//! tracked so leaving the group cancels it.
//!
//! ## Non-goals
//!
//! - Surviving a member crash while it holds the token or waits at a barrier
//! - Timeouts or retries for blocking calls; callers add their own deadlines
//! - Message persistence and authentication
//!
//! ## Usage
//!
//! ```rust,ignore
//! use cohort::{Communicator, MemoryIdentityRegistry};
//! use cohort_transport::MemoryBus;
//! use cohort_types::GroupConfig;
//! use std::sync::Arc;
//!
//! let config = GroupConfig::with_group_size(3);
//! let registry = MemoryIdentityRegistry::new(3)?;
//! let bus = Arc::new(MemoryBus::new());
//!
//! let member = Communicator::join(&config, &registry, bus.clone()).await?;
//! member.broadcast("hi").await?;
//! member.synchronize().await?;
//! ```

pub mod barrier;
pub mod clock;
pub mod communicator;
mod dispatch;
pub mod identity;
pub mod mailbox;
pub mod rendezvous;
pub(crate) mod tasks;
pub mod token;

pub use clock::LogicalClock;
pub use communicator::Communicator;
pub use identity::{FileIdentityRegistry, IdentityRegistry, MemoryIdentityRegistry};
pub use mailbox::Mailbox;
pub use token::{TokenPhase, TokenRing};

pub use cohort_types::{CohortError, GroupConfig, Message, Payload, ProcessId, Result};
