//! Process identifiers
//!
//! A `ProcessId` is handed out once by an identity registry and stays fixed for
//! the lifetime of the member. Ids are dense in `[0, N)` so the token ring can be
//! walked with modular arithmetic.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Group-unique identifier of one member process
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcessId(pub u32);

impl ProcessId {
    /// The member that coordinates barriers and originates the first token
    pub const COORDINATOR: ProcessId = ProcessId(0);

    /// Create an identifier from its raw value
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    /// Get the raw value
    pub fn value(&self) -> u32 {
        self.0
    }

    /// Whether this member is the coordinator
    pub fn is_coordinator(&self) -> bool {
        *self == Self::COORDINATOR
    }

    /// Whether the id is a valid member of a group of `group_size`
    pub fn in_group(&self, group_size: usize) -> bool {
        (self.0 as usize) < group_size
    }

    /// Successor on the token ring (`self + 1 mod N`)
    pub fn next_in_ring(&self, group_size: usize) -> ProcessId {
        debug_assert!(group_size > 0);
        let next = (self.0 as usize + 1) % group_size.max(1);
        ProcessId(next as u32)
    }
}

impl From<u32> for ProcessId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}
