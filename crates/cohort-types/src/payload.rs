//! Opaque application payloads
//!
//! The middleware never looks inside a payload. Applications either send text
//! or any serde type, encoded with bincode.

use crate::errors::{CohortError, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;

/// Application bytes carried by user messages
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Payload(Vec<u8>);

impl Payload {
    /// Wrap raw bytes
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// UTF-8 text payload
    pub fn text(text: impl Into<String>) -> Self {
        Self(text.into().into_bytes())
    }

    /// Encode a serde value with bincode
    pub fn encode<T: Serialize>(value: &T) -> Result<Self> {
        bincode::serialize(value)
            .map(Self)
            .map_err(|e| CohortError::serialization(e.to_string()))
    }

    /// Decode a serde value previously written with [`Payload::encode`]
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        bincode::deserialize(&self.0).map_err(|e| CohortError::serialization(e.to_string()))
    }

    /// View the payload as text, if it is valid UTF-8
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::text(text)
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::text(text)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_text() {
            Some(text) => write!(f, "Payload({text:?})"),
            None => write!(f, "Payload({} bytes)", self.0.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Roll {
        player: u32,
        value: u8,
    }

    #[test]
    fn text_payload_reads_back() {
        let payload = Payload::text("hi");
        assert_eq!(payload.as_text(), Some("hi"));
        assert_eq!(format!("{payload:?}"), "Payload(\"hi\")");
    }

    #[test]
    fn typed_payload_decodes() {
        let payload = Payload::encode(&Roll { player: 2, value: 6 }).unwrap();
        let roll: Roll = payload.decode().unwrap();
        assert_eq!(roll, Roll { player: 2, value: 6 });
    }

    #[test]
    fn truncated_payload_is_a_serialization_error() {
        let payload = Payload::from_bytes(vec![1u8]);
        let err = payload.decode::<Roll>().unwrap_err();
        assert!(matches!(err, CohortError::Serialization { .. }));
    }
}
