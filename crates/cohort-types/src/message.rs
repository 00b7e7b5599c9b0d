//! Group message model
//!
//! Every message exchanged by a group is one variant of [`Message`]. Each
//! variant carries only the fields its protocol needs; dispatch matches on the
//! variant instead of inspecting runtime types.
//!
//! ```text
//! user, causal:    Broadcast  Unicast  SyncBroadcast  SyncUnicast
//! system, causal:  SyncRequest
//! system, exempt:  Token  SyncRelease  SyncAck
//! ```
//!
//! Exempt kinds carry a timestamp for uniformity (except `Token`, which has
//! none) but never advance the receiver's clock.

use crate::errors::{CohortError, Result};
use crate::identifiers::ProcessId;
use crate::payload::Payload;
use crate::time::LamportTimestamp;
use serde::{Deserialize, Serialize};

/// Which synchronous send an acknowledgment answers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AckKind {
    /// Acknowledges a `SyncBroadcast`
    Broadcast,
    /// Acknowledges a `SyncUnicast`
    Unicast,
}

/// Discriminant of a [`Message`], used for logging and routing tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Asynchronous broadcast
    Broadcast,
    /// Asynchronous point-to-point message
    Unicast,
    /// Mutual exclusion token
    Token,
    /// Barrier arrival sent to the coordinator
    SyncRequest,
    /// Barrier release broadcast by the coordinator
    SyncRelease,
    /// Synchronous broadcast
    SyncBroadcast,
    /// Synchronous point-to-point message
    SyncUnicast,
    /// Acknowledgment of a synchronous send
    SyncAck,
}

/// A message published on the group transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Delivered to every member except the sender
    Broadcast {
        /// Sending member
        sender: ProcessId,
        /// Sender clock after tick
        ts: LamportTimestamp,
        /// Application data
        payload: Payload,
    },
    /// Delivered only to `to`
    Unicast {
        /// Sending member
        sender: ProcessId,
        /// Sender clock after tick
        ts: LamportTimestamp,
        /// Application data
        payload: Payload,
        /// Destination member
        to: ProcessId,
    },
    /// Permission to enter the critical section, travelling around the ring
    Token {
        /// Member receiving the token
        to: ProcessId,
    },
    /// Barrier arrival, addressed to the coordinator
    SyncRequest {
        /// Arriving member
        sender: ProcessId,
        /// Sender clock after tick
        ts: LamportTimestamp,
        /// Coordinator
        to: ProcessId,
    },
    /// Barrier release for the current round
    SyncRelease {
        /// Coordinator
        sender: ProcessId,
        /// Coordinator clock, not ticked
        ts: LamportTimestamp,
    },
    /// Synchronous broadcast; the sender waits for N-1 acknowledgments
    SyncBroadcast {
        /// Publishing member
        sender: ProcessId,
        /// Sender clock after tick
        ts: LamportTimestamp,
        /// Application data
        payload: Payload,
        /// Member whose call originated the broadcast
        original_sender: ProcessId,
    },
    /// Synchronous point-to-point message; the sender waits for one acknowledgment
    SyncUnicast {
        /// Sending member
        sender: ProcessId,
        /// Sender clock after tick
        ts: LamportTimestamp,
        /// Application data
        payload: Payload,
        /// Destination member
        to: ProcessId,
    },
    /// Acknowledgment of a synchronous send
    SyncAck {
        /// Acknowledging member
        sender: ProcessId,
        /// Acknowledger clock, not ticked
        ts: LamportTimestamp,
        /// Which send is acknowledged
        kind: AckKind,
        /// Timestamp of the acknowledged send
        acked: LamportTimestamp,
        /// Member that performed the synchronous send
        to: ProcessId,
    },
}

impl Message {
    /// Variant discriminant
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Broadcast { .. } => MessageKind::Broadcast,
            Message::Unicast { .. } => MessageKind::Unicast,
            Message::Token { .. } => MessageKind::Token,
            Message::SyncRequest { .. } => MessageKind::SyncRequest,
            Message::SyncRelease { .. } => MessageKind::SyncRelease,
            Message::SyncBroadcast { .. } => MessageKind::SyncBroadcast,
            Message::SyncUnicast { .. } => MessageKind::SyncUnicast,
            Message::SyncAck { .. } => MessageKind::SyncAck,
        }
    }

    /// Sending member; `None` for the token, which has no sender
    pub fn sender(&self) -> Option<ProcessId> {
        match self {
            Message::Token { .. } => None,
            Message::Broadcast { sender, .. }
            | Message::Unicast { sender, .. }
            | Message::SyncRequest { sender, .. }
            | Message::SyncRelease { sender, .. }
            | Message::SyncBroadcast { sender, .. }
            | Message::SyncUnicast { sender, .. }
            | Message::SyncAck { sender, .. } => Some(*sender),
        }
    }

    /// Timestamp field; `None` for the token
    pub fn timestamp(&self) -> Option<LamportTimestamp> {
        match self {
            Message::Token { .. } => None,
            Message::Broadcast { ts, .. }
            | Message::Unicast { ts, .. }
            | Message::SyncRequest { ts, .. }
            | Message::SyncRelease { ts, .. }
            | Message::SyncBroadcast { ts, .. }
            | Message::SyncUnicast { ts, .. }
            | Message::SyncAck { ts, .. } => Some(*ts),
        }
    }

    /// Application payload of user messages
    pub fn payload(&self) -> Option<&Payload> {
        match self {
            Message::Broadcast { payload, .. }
            | Message::Unicast { payload, .. }
            | Message::SyncBroadcast { payload, .. }
            | Message::SyncUnicast { payload, .. } => Some(payload),
            _ => None,
        }
    }

    /// Addressed recipient; `None` for messages delivered to the whole group
    pub fn recipient(&self) -> Option<ProcessId> {
        match self {
            Message::Unicast { to, .. }
            | Message::Token { to }
            | Message::SyncRequest { to, .. }
            | Message::SyncUnicast { to, .. }
            | Message::SyncAck { to, .. } => Some(*to),
            Message::Broadcast { .. }
            | Message::SyncRelease { .. }
            | Message::SyncBroadcast { .. } => None,
        }
    }

    /// Whether the message is application data that lands in a mailbox
    pub fn is_user(&self) -> bool {
        self.payload().is_some()
    }

    /// Whether receiving this message advances the receiver's clock
    pub fn is_causal(&self) -> bool {
        matches!(
            self,
            Message::Broadcast { .. }
                | Message::Unicast { .. }
                | Message::SyncBroadcast { .. }
                | Message::SyncUnicast { .. }
                | Message::SyncRequest { .. }
        )
    }

    /// Check that every id the message names belongs to a group of `group_size`
    pub fn validate(&self, group_size: usize) -> Result<()> {
        let ids = [self.sender(), self.recipient()];
        for id in ids.into_iter().flatten() {
            if !id.in_group(group_size) {
                return Err(CohortError::protocol_violation(format!(
                    "{:?} names {id}, outside a group of {group_size}",
                    self.kind()
                )));
            }
        }
        if let Message::SyncBroadcast {
            sender,
            original_sender,
            ..
        } = self
        {
            if sender != original_sender {
                return Err(CohortError::protocol_violation(format!(
                    "SyncBroadcast published by {sender} on behalf of {original_sender}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unicast(to: u32) -> Message {
        Message::Unicast {
            sender: ProcessId(0),
            ts: LamportTimestamp::new(1),
            payload: Payload::text("hello"),
            to: ProcessId(to),
        }
    }

    #[test]
    fn only_user_and_barrier_requests_are_causal() {
        assert!(unicast(1).is_causal());
        assert!(Message::SyncRequest {
            sender: ProcessId(1),
            ts: LamportTimestamp::new(4),
            to: ProcessId(0),
        }
        .is_causal());
        assert!(!Message::Token { to: ProcessId(1) }.is_causal());
        assert!(!Message::SyncRelease {
            sender: ProcessId(0),
            ts: LamportTimestamp::new(9),
        }
        .is_causal());
        assert!(!Message::SyncAck {
            sender: ProcessId(1),
            ts: LamportTimestamp::new(2),
            kind: AckKind::Unicast,
            acked: LamportTimestamp::new(1),
            to: ProcessId(0),
        }
        .is_causal());
    }

    #[test]
    fn accessors_expose_envelope_fields() {
        let msg = unicast(2);
        assert_eq!(msg.kind(), MessageKind::Unicast);
        assert_eq!(msg.sender(), Some(ProcessId(0)));
        assert_eq!(msg.recipient(), Some(ProcessId(2)));
        assert_eq!(msg.timestamp(), Some(LamportTimestamp::new(1)));
        assert_eq!(msg.payload().and_then(Payload::as_text), Some("hello"));
        assert!(msg.is_user());

        let token = Message::Token { to: ProcessId(1) };
        assert_eq!(token.sender(), None);
        assert_eq!(token.timestamp(), None);
        assert!(!token.is_user());
    }

    #[test]
    fn validate_rejects_out_of_range_destination() {
        assert!(unicast(2).validate(3).is_ok());
        let err = unicast(3).validate(3).unwrap_err();
        assert!(matches!(err, CohortError::ProtocolViolation { .. }));
    }

    #[test]
    fn validate_rejects_relayed_sync_broadcast() {
        let msg = Message::SyncBroadcast {
            sender: ProcessId(1),
            ts: LamportTimestamp::new(3),
            payload: Payload::text("end of game"),
            original_sender: ProcessId(2),
        };
        assert!(msg.validate(3).is_err());
    }
}
