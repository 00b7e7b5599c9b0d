//! Group transport
//!
//! The middleware only needs a publish/subscribe fabric: every published
//! message reaches every registered member, which decides for itself whether
//! the message concerns it. This crate defines that interface and ships an
//! in-process implementation for tests and single-host simulations.

pub mod memory;
pub mod traits;

pub use memory::MemoryBus;
pub use traits::{Subscription, Transport};
