//! Type-safe row identifier.
//!
//! [`RecordId`] is a newtype over the string form of a backend-assigned
//! primary key. Rows created locally carry an unassigned id until the
//! gateway returns the confirmed record.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// Unique identifier of a row within one collection.
///
/// Backends hand out UUIDs, but any string key is accepted, and integer
/// keys (serial columns) are decoded into their decimal form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Wraps an existing key.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Creates a fresh random id (UUID v4), as a backend would on insert.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// The placeholder id carried by records that have not been inserted yet.
    #[must_use]
    pub const fn unassigned() -> Self {
        Self(String::new())
    }

    /// Returns `true` if no backend has assigned this id yet.
    #[must_use]
    pub fn is_unassigned(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RecordId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Key {
            Text(String),
            Serial(i64),
        }

        Ok(match Key::deserialize(deserializer)? {
            Key::Text(text) => Self(text),
            Key::Serial(n) => Self(n.to_string()),
        })
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RecordId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<uuid::Uuid> for RecordId {
    fn from(uuid: uuid::Uuid) -> Self {
        Self(uuid.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn generate_yields_unique_ids() {
        let a = RecordId::generate();
        let b = RecordId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn unassigned_is_empty() {
        assert!(RecordId::unassigned().is_unassigned());
        assert!(RecordId::default().is_unassigned());
        assert!(!RecordId::from("p1").is_unassigned());
    }

    #[test]
    fn serializes_as_plain_string() {
        let Ok(json) = serde_json::to_string(&RecordId::from("p1")) else {
            panic!("serialization failed");
        };
        assert_eq!(json, "\"p1\"");
    }

    #[test]
    fn serial_keys_decode_to_decimal_text() {
        let Ok(id) = serde_json::from_str::<RecordId>("42") else {
            panic!("deserialization failed");
        };
        assert_eq!(id.as_str(), "42");
    }

    #[test]
    fn boolean_keys_are_rejected() {
        assert!(serde_json::from_str::<RecordId>("true").is_err());
    }
}
