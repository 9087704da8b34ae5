//! Ledger entries and the phase state machine.
//!
//! ```text
//!                 ┌──────────────────────────────────────┐
//!                 │                                      ▼
//!   (none) ──► PENDING ──► BUILDING ──► DEPLOYING ──► SUCCEEDED
//!                 │           │             │
//!                 ▼           ▼             ▼
//!               FAILED ◄──────┴─────────────┘
//!                 │
//!                 └──► PENDING   (re-emitted while attempts < ceiling)
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dockyard_core::{ArtifactIdentity, ArtifactKey};

/// Processing phase of one artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// Claimed by the dispatcher, waiting for a pipeline slot.
    Pending,
    /// A build execution has been (or is being) submitted.
    Building,
    /// The image exists; manifests are being applied.
    Deploying,
    /// All three resources were applied.
    Succeeded,
    /// The last attempt failed; see `last_error`.
    Failed,
}

impl Phase {
    /// Returns true for phases that mean a pipeline owns the entry.
    #[must_use]
    pub const fn is_in_flight(&self) -> bool {
        matches!(self, Self::Pending | Self::Building | Self::Deploying)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub const fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Pending => matches!(target, Self::Building | Self::Failed),
            Self::Building => matches!(target, Self::Deploying | Self::Failed),
            Self::Deploying => matches!(target, Self::Succeeded | Self::Failed),
            Self::Failed => matches!(target, Self::Pending),
            Self::Succeeded => false,
        }
    }

    /// Returns all valid target phases from the current phase.
    #[must_use]
    pub fn valid_transitions(&self) -> Vec<Self> {
        match self {
            Self::Pending => vec![Self::Building, Self::Failed],
            Self::Building => vec![Self::Deploying, Self::Failed],
            Self::Deploying => vec![Self::Succeeded, Self::Failed],
            Self::Failed => vec![Self::Pending],
            Self::Succeeded => vec![],
        }
    }

    /// Returns the wire name, also used as a metric label.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Building => "BUILDING",
            Self::Deploying => "DEPLOYING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Durable processing record for one `(application, version)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    /// Identity of the artifact most recently claimed under this key.
    pub identity: ArtifactIdentity,
    /// Current phase.
    pub phase: Phase,
    /// Number of attempts that reached `BUILDING`.
    pub attempts: u32,
    /// Reason of the most recent failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Time of the last write.
    pub updated_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Creates a `PENDING` entry for a first discovery.
    #[must_use]
    pub fn pending(identity: ArtifactIdentity) -> Self {
        Self {
            identity,
            phase: Phase::Pending,
            attempts: 0,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    /// Returns the ledger key.
    #[must_use]
    pub fn key(&self) -> ArtifactKey {
        self.identity.key()
    }

    /// Returns the storage path of this entry, relative to the ledger root.
    #[must_use]
    pub fn path(&self) -> String {
        entry_path(&self.key())
    }
}

/// Storage path of the entry for `key`.
#[must_use]
pub fn entry_path(key: &ArtifactKey) -> String {
    format!(
        "entries/{}/{}.json",
        key.application_name(),
        key.version()
    )
}

/// What the watcher should do with an identity, given its ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    /// Never seen: emit.
    New,
    /// Failed below the attempt ceiling: emit.
    Retry {
        /// Attempts already made.
        attempts: u32,
    },
    /// A pipeline owns the entry: skip.
    InFlight(Phase),
    /// Already deployed: skip permanently.
    Succeeded,
    /// Failed at the attempt ceiling: skip, needs an operator.
    Exhausted {
        /// Attempts made.
        attempts: u32,
    },
}

impl Eligibility {
    /// Classifies an entry against the attempt ceiling.
    #[must_use]
    pub fn of(entry: Option<&LedgerEntry>, max_attempts: u32) -> Self {
        let Some(entry) = entry else {
            return Self::New;
        };
        match entry.phase {
            Phase::Pending | Phase::Building | Phase::Deploying => Self::InFlight(entry.phase),
            Phase::Succeeded => Self::Succeeded,
            Phase::Failed if entry.attempts < max_attempts => Self::Retry {
                attempts: entry.attempts,
            },
            Phase::Failed => Self::Exhausted {
                attempts: entry.attempts,
            },
        }
    }

    /// Returns true if a work item should be emitted.
    #[must_use]
    pub const fn should_emit(&self) -> bool {
        matches!(self, Self::New | Self::Retry { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dockyard_core::identify;

    fn entry(phase: Phase, attempts: u32) -> LedgerEntry {
        LedgerEntry {
            phase,
            attempts,
            ..LedgerEntry::pending(identify("widgets/v1.0.tar").expect("valid"))
        }
    }

    #[test]
    fn phase_lifecycle() {
        assert!(Phase::Pending.can_transition_to(Phase::Building));
        assert!(Phase::Building.can_transition_to(Phase::Deploying));
        assert!(Phase::Deploying.can_transition_to(Phase::Succeeded));
        assert!(Phase::Failed.can_transition_to(Phase::Pending));

        assert!(!Phase::Succeeded.can_transition_to(Phase::Pending));
        assert!(!Phase::Pending.can_transition_to(Phase::Deploying));
        assert!(!Phase::Failed.can_transition_to(Phase::Building));
        assert!(Phase::Succeeded.valid_transitions().is_empty());
    }

    #[test]
    fn eligibility_follows_phase_and_ceiling() {
        assert_eq!(Eligibility::of(None, 3), Eligibility::New);
        assert_eq!(
            Eligibility::of(Some(&entry(Phase::Building, 1)), 3),
            Eligibility::InFlight(Phase::Building)
        );
        assert_eq!(
            Eligibility::of(Some(&entry(Phase::Succeeded, 1)), 3),
            Eligibility::Succeeded
        );
        assert_eq!(
            Eligibility::of(Some(&entry(Phase::Failed, 2)), 3),
            Eligibility::Retry { attempts: 2 }
        );
        assert_eq!(
            Eligibility::of(Some(&entry(Phase::Failed, 3)), 3),
            Eligibility::Exhausted { attempts: 3 }
        );
        assert!(Eligibility::Retry { attempts: 1 }.should_emit());
        assert!(!Eligibility::Exhausted { attempts: 3 }.should_emit());
    }

    #[test]
    fn entry_serializes_camel_case() {
        let mut e = entry(Phase::Failed, 1);
        e.last_error = Some("no Dockerfile".into());
        let json = serde_json::to_value(&e).expect("serialize");
        assert_eq!(json["phase"], "FAILED");
        assert_eq!(json["lastError"], "no Dockerfile");
        assert_eq!(json["identity"]["applicationName"], "widgets");
        assert!(json.get("updatedAt").is_some());

        let parsed: LedgerEntry = serde_json::from_value(json).expect("deserialize");
        assert_eq!(parsed, e);
    }

    #[test]
    fn entry_path_layout() {
        assert_eq!(entry(Phase::Pending, 0).path(), "entries/widgets/v1.0.json");
    }
}
