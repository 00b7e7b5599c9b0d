//! Shared types for cohort process groups
//!
//! This crate holds everything members of a group must agree on: process
//! identifiers, Lamport timestamps, the message model, the unified error type,
//! and the group configuration. It has no runtime dependencies on tokio so the
//! transport and protocol crates can both build on it.

pub mod config;
pub mod errors;
pub mod identifiers;
pub mod message;
pub mod payload;
pub mod time;

pub use config::{GroupConfig, TokenConfig};
pub use errors::{CohortError, Result};
pub use identifiers::ProcessId;
pub use message::{AckKind, Message, MessageKind};
pub use payload::Payload;
pub use time::LamportTimestamp;
