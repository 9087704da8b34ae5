//! Error types for the pipeline domain.
//!
//! Build and apply failures are not errors here: they are ordinary outcomes
//! ([`crate::build::BuildFailure`], [`crate::apply::ApplyFailure`]) that the
//! reconciler records in the ledger. This enum covers everything that stops a
//! component from doing its job at all.

use dockyard_core::ArtifactKey;

/// The result type used throughout dockyard-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The bucket could not be listed. Retried on the next poll tick.
    #[error("listing failed: {message}")]
    Listing {
        /// Description of the listing failure.
        message: String,
        /// The underlying storage error.
        #[source]
        source: dockyard_core::Error,
    },

    /// Another writer changed a ledger entry between our read and our write.
    ///
    /// The in-process ledger serializes its own writes, so this means a second
    /// process is writing to the same ledger location.
    #[error("ledger write conflict on {key}: stored version is {current_version}")]
    LedgerWriteConflict {
        /// Entry that was being written.
        key: ArtifactKey,
        /// Version token found in storage.
        current_version: String,
    },

    /// No ledger entry exists for the key.
    #[error("ledger entry not found: {key}")]
    EntryNotFound {
        /// The missing key.
        key: ArtifactKey,
    },

    /// An invalid phase transition was attempted.
    #[error("invalid phase transition: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// The current phase.
        from: String,
        /// The attempted target phase.
        to: String,
        /// The reason the transition is invalid.
        reason: String,
    },

    /// A call to the cluster API failed.
    #[error("cluster API error: {message}")]
    Cluster {
        /// Description of the failure.
        message: String,
        /// HTTP status code, when the API answered.
        status: Option<u16>,
    },

    /// The build executor rejected or lost a build execution.
    #[error("build executor error: {message}")]
    Executor {
        /// Description of the failure.
        message: String,
    },

    /// A component was configured with unusable settings.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An error from dockyard-core.
    #[error("core error: {0}")]
    Core(#[from] dockyard_core::Error),
}

impl Error {
    /// Creates a cluster API error without an HTTP status.
    #[must_use]
    pub fn cluster(message: impl Into<String>) -> Self {
        Self::Cluster {
            message: message.into(),
            status: None,
        }
    }

    /// Creates a cluster API error carrying the HTTP status the API returned.
    #[must_use]
    pub fn cluster_status(status: u16, message: impl Into<String>) -> Self {
        Self::Cluster {
            message: message.into(),
            status: Some(status),
        }
    }

    /// Creates a build executor error.
    #[must_use]
    pub fn executor(message: impl Into<String>) -> Self {
        Self::Executor {
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Returns true if this is a ledger write conflict.
    #[must_use]
    pub const fn is_write_conflict(&self) -> bool {
        matches!(self, Self::LedgerWriteConflict { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn listing_error_keeps_source() {
        let err = Error::Listing {
            message: "gs://uploads".into(),
            source: dockyard_core::Error::storage("permission denied"),
        };
        assert!(err.to_string().contains("listing failed"));
        assert!(StdError::source(&err).is_some());
    }

    #[test]
    fn write_conflict_display() {
        let key = ArtifactKey::new("widgets", "v1.0").expect("valid key");
        let err = Error::LedgerWriteConflict {
            key,
            current_version: "7".into(),
        };
        assert!(err.is_write_conflict());
        assert!(err.to_string().contains("widgets/v1.0"));
    }

    #[test]
    fn state_transition_error_display() {
        let err = Error::InvalidStateTransition {
            from: "SUCCEEDED".into(),
            to: "BUILDING".into(),
            reason: "terminal phase".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("SUCCEEDED"));
        assert!(msg.contains("BUILDING"));
    }

    #[test]
    fn cluster_status_is_recorded() {
        let err = Error::cluster_status(403, "forbidden");
        assert!(matches!(err, Error::Cluster { status: Some(403), .. }));
    }
}
