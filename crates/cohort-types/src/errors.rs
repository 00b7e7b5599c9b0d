//! Unified error system for cohort
//!
//! One error type shared by every crate in the workspace. Construction-time
//! failures (configuration, identity) are fatal to the member that hits them;
//! protocol violations raised inside message handlers are logged and the
//! offending message dropped.

use serde::{Deserialize, Serialize};

/// Unified error type for all cohort operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum CohortError {
    /// Group configuration missing or invalid
    #[error("Configuration error: {message}")]
    Configuration {
        /// Error message describing the configuration problem
        message: String,
    },

    /// A unique process id could not be assigned
    #[error("Identity assignment failed: {message}")]
    IdentityAssignment {
        /// Error message describing why no id was handed out
        message: String,
    },

    /// Malformed message or misuse of a protocol operation
    #[error("Protocol violation: {message}")]
    ProtocolViolation {
        /// Error message describing the violation
        message: String,
    },

    /// An internal invariant no longer holds
    #[error("Invariant violation: {message}")]
    InvariantViolation {
        /// Error message describing the broken invariant
        message: String,
    },

    /// Transport publish or registration failed
    #[error("Transport error: {message}")]
    Transport {
        /// Error message describing the transport failure
        message: String,
    },

    /// Filesystem failure underneath a registry
    #[error("Storage error: {message}")]
    Storage {
        /// Error message describing the storage failure
        message: String,
    },

    /// Payload serialization/deserialization error
    #[error("Serialization error: {message}")]
    Serialization {
        /// Error message describing the serialization failure
        message: String,
    },

    /// The communicator shut down while a call was waiting
    #[error("Communicator shut down: {message}")]
    Shutdown {
        /// Error message naming the interrupted operation
        message: String,
    },
}

impl CohortError {
    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an identity assignment error
    pub fn identity_assignment(message: impl Into<String>) -> Self {
        Self::IdentityAssignment {
            message: message.into(),
        }
    }

    /// Create a protocol violation error
    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            message: message.into(),
        }
    }

    /// Create an invariant violation error
    pub fn invariant_violation(message: impl Into<String>) -> Self {
        Self::InvariantViolation {
            message: message.into(),
        }
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a shutdown error
    pub fn shutdown(message: impl Into<String>) -> Self {
        Self::Shutdown {
            message: message.into(),
        }
    }
}

/// Standard Result type for cohort operations
pub type Result<T> = std::result::Result<T, CohortError>;

impl From<std::io::Error> for CohortError {
    fn from(err: std::io::Error) -> Self {
        Self::storage(err.to_string())
    }
}

impl From<toml::de::Error> for CohortError {
    fn from(err: toml::de::Error) -> Self {
        Self::configuration(format!("Invalid TOML: {err}"))
    }
}
