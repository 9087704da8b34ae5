//! Strongly-typed identifiers.
//!
//! Identifiers are ULIDs: lexicographically sortable by creation time and
//! globally unique without coordination.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

/// Tags every log line and cluster object produced by one pipeline attempt.
///
/// A fresh ID is minted each time the watcher emits a work item, so retries
/// of the same artifact are distinguishable in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Ulid);

impl CorrelationId {
    /// Generates a new unique correlation ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates a correlation ID from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the creation timestamp encoded in the ID.
    #[must_use]
    pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        let ms = i64::try_from(self.0.timestamp_ms()).unwrap_or(i64::MAX);
        chrono::DateTime::from_timestamp_millis(ms).unwrap_or_else(chrono::Utc::now)
    }

    /// Returns the ID in lowercase, usable as a cluster label value.
    #[must_use]
    pub fn to_label_value(&self) -> String {
        self.0.to_string().to_ascii_lowercase()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CorrelationId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::InvalidId {
                message: format!("invalid correlation ID '{s}': {e}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_id_roundtrip() {
        let id = CorrelationId::generate();
        let parsed: CorrelationId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn label_value_is_lowercase() {
        let id = CorrelationId::generate();
        let label = id.to_label_value();
        assert_eq!(label, label.to_ascii_lowercase());
        assert_eq!(label.len(), 26);
    }

    #[test]
    fn invalid_id_returns_error() {
        let result: Result<CorrelationId> = "not-a-valid-ulid".parse();
        assert!(result.is_err());
    }
}
