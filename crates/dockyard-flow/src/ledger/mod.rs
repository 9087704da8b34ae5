//! Durable processing ledger.
//!
//! One JSON document per `(application, version)` at
//! `entries/<application>/<version>.json`. The ledger is the only "has this been
//! seen" record: the watcher reads it to decide what to emit, the dispatcher
//! claims entries, and the reconciler advances them.
//!
//! ## Concurrency
//!
//! Every mutation takes one async mutex, re-reads the cached entry, checks the
//! transition and writes with compare-and-swap. The claim check and the
//! `PENDING` write therefore happen atomically, which is what keeps two poll
//! ticks from starting two pipelines for the same artifact. The CAS only fails
//! when some other process writes to the same location
//! ([`Error::LedgerWriteConflict`]).
//!
//! ## Restart
//!
//! [`Ledger::open`] reloads every entry. Entries left `PENDING`, `BUILDING` or
//! `DEPLOYING` belonged to pipelines that died with the process; they are
//! marked `FAILED` so the normal retry path picks them up.
//!
//! A pipeline that aborts on a ledger error does the same without a restart
//! through [`Ledger::abandon`]. Keys it cannot release yet are held by
//! [`Ledger::strand`] until [`Ledger::recover_stranded`] succeeds.

mod entry;

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::Mutex;

use dockyard_core::{
    ArtifactIdentity, ArtifactKey, StorageBackend, WritePrecondition, WriteResult,
};

pub use entry::{entry_path, Eligibility, LedgerEntry, Phase};

use crate::error::{Error, Result};
use crate::metrics::PipelineMetrics;

/// Prefix under which entries are stored.
pub const ENTRIES_PREFIX: &str = "entries/";

/// Reason recorded on entries recovered at startup.
pub const INTERRUPTED_BY_RESTART: &str = "interrupted by restart";

/// Result of trying to claim an identity for processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The entry is now `PENDING` and owned by the caller.
    Claimed(LedgerEntry),
    /// The identity is not eligible; nothing was written.
    Skipped(Eligibility),
}

#[derive(Debug, Clone)]
struct Stored {
    entry: LedgerEntry,
    version: String,
}

/// Reads all parseable entries, ordered by path.
async fn load(storage: &dyn StorageBackend) -> Result<Vec<Stored>> {
    let mut objects = storage.list(ENTRIES_PREFIX).await?;
    objects.sort_by(|a, b| a.path.cmp(&b.path));

    let mut loaded = Vec::with_capacity(objects.len());
    for object in objects {
        let body = storage.get(&object.path).await?;
        let entry: LedgerEntry = match serde_json::from_slice(&body) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(path = %object.path, error = %e, "ignoring unreadable ledger entry");
                continue;
            }
        };
        if entry.path() != object.path {
            tracing::warn!(
                path = %object.path,
                expected = %entry.path(),
                "ignoring ledger entry stored under the wrong path"
            );
            continue;
        }
        loaded.push(Stored {
            entry,
            version: object.version,
        });
    }
    Ok(loaded)
}

/// Durable per-identity processing state.
pub struct Ledger {
    storage: Arc<dyn StorageBackend>,
    max_attempts: u32,
    entries: Mutex<BTreeMap<ArtifactKey, Stored>>,
    stranded: Mutex<BTreeMap<ArtifactKey, String>>,
    metrics: PipelineMetrics,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl Ledger {
    /// Loads the ledger from storage and recovers interrupted entries.
    ///
    /// Documents that cannot be parsed are logged and ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if `max_attempts` is zero, if listing or reading
    /// storage fails, or if a recovered entry cannot be written back.
    #[tracing::instrument(skip(storage))]
    pub async fn open(storage: Arc<dyn StorageBackend>, max_attempts: u32) -> Result<Self> {
        if max_attempts == 0 {
            return Err(Error::configuration("max_attempts must be at least 1"));
        }

        let entries: BTreeMap<ArtifactKey, Stored> = load(storage.as_ref())
            .await?
            .into_iter()
            .map(|stored| (stored.entry.key(), stored))
            .collect();

        let ledger = Self {
            storage,
            max_attempts,
            entries: Mutex::new(entries),
            stranded: Mutex::new(BTreeMap::new()),
            metrics: PipelineMetrics::new(),
        };
        let recovered = ledger.recover_interrupted().await?;
        let loaded = ledger.entries.lock().await.len();
        tracing::info!(entries = loaded, recovered, "ledger loaded");
        Ok(ledger)
    }

    async fn recover_interrupted(&self) -> Result<usize> {
        let mut entries = self.entries.lock().await;
        let interrupted: Vec<ArtifactKey> = entries
            .iter()
            .filter(|(_, stored)| stored.entry.phase.is_in_flight())
            .map(|(key, _)| key.clone())
            .collect();

        for key in &interrupted {
            let Some(stored) = entries.get(key) else {
                continue;
            };
            tracing::warn!(
                key = %key,
                phase = %stored.entry.phase,
                attempts = stored.entry.attempts,
                "recovering entry interrupted by restart"
            );
            let mut next = stored.entry.clone();
            next.phase = Phase::Failed;
            next.last_error = Some(INTERRUPTED_BY_RESTART.to_string());
            self.write(&mut entries, next).await?;
        }
        Ok(interrupted.len())
    }

    /// Reads every entry without taking ownership of the ledger.
    ///
    /// Nothing is recovered or written, so this is safe to call while a
    /// manager is running against the same storage.
    ///
    /// # Errors
    ///
    /// Returns an error if listing or reading storage fails.
    pub async fn read_all(storage: &dyn StorageBackend) -> Result<Vec<LedgerEntry>> {
        Ok(load(storage)
            .await?
            .into_iter()
            .map(|stored| stored.entry)
            .collect())
    }

    /// Returns the retry-attempt ceiling.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns the entry for `key`, if any.
    pub async fn entry(&self, key: &ArtifactKey) -> Option<LedgerEntry> {
        self.entries
            .lock()
            .await
            .get(key)
            .map(|stored| stored.entry.clone())
    }

    /// Returns all entries ordered by key.
    pub async fn entries(&self) -> Vec<LedgerEntry> {
        self.entries
            .lock()
            .await
            .values()
            .map(|stored| stored.entry.clone())
            .collect()
    }

    /// Classifies `key` for the watcher. Read-only.
    pub async fn eligibility(&self, key: &ArtifactKey) -> Eligibility {
        let entries = self.entries.lock().await;
        Eligibility::of(entries.get(key).map(|s| &s.entry), self.max_attempts)
    }

    /// Atomically checks eligibility and, if eligible, writes `PENDING`.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger write fails.
    pub async fn claim(&self, identity: &ArtifactIdentity) -> Result<ClaimOutcome> {
        let key = identity.key();
        let mut entries = self.entries.lock().await;
        let current = entries.get(&key).map(|s| &s.entry);
        let eligibility = Eligibility::of(current, self.max_attempts);
        if !eligibility.should_emit() {
            return Ok(ClaimOutcome::Skipped(eligibility));
        }

        let next = match current {
            None => LedgerEntry::pending(identity.clone()),
            Some(current) => LedgerEntry {
                identity: identity.clone(),
                phase: Phase::Pending,
                ..current.clone()
            },
        };
        let entry = self.write(&mut entries, next).await?;
        Ok(ClaimOutcome::Claimed(entry))
    }

    /// `PENDING → BUILDING`, incrementing `attempts`.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry is missing, not `PENDING`, or the write fails.
    pub async fn begin_build(&self, key: &ArtifactKey) -> Result<LedgerEntry> {
        self.transition(key, Phase::Building, |entry| {
            entry.attempts = entry.attempts.saturating_add(1);
        })
        .await
    }

    /// `BUILDING → DEPLOYING`.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry is missing, not `BUILDING`, or the write fails.
    pub async fn begin_deploy(&self, key: &ArtifactKey) -> Result<LedgerEntry> {
        self.transition(key, Phase::Deploying, |_| {}).await
    }

    /// `DEPLOYING → SUCCEEDED`, clearing `last_error`.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry is missing, not `DEPLOYING`, or the write fails.
    pub async fn succeed(&self, key: &ArtifactKey) -> Result<LedgerEntry> {
        self.transition(key, Phase::Succeeded, |entry| entry.last_error = None)
            .await
    }

    /// Any in-flight phase `→ FAILED` with `reason`.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry is missing, not in flight, or the write fails.
    pub async fn fail(&self, key: &ArtifactKey, reason: impl Into<String>) -> Result<LedgerEntry> {
        let reason = reason.into();
        self.transition(key, Phase::Failed, |entry| entry.last_error = Some(reason))
            .await
    }

    /// Clears the attempt counter of a `FAILED` entry so the watcher emits it again.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry is missing, not `FAILED`, or the write fails.
    pub async fn reset_attempts(&self, key: &ArtifactKey) -> Result<LedgerEntry> {
        let mut entries = self.entries.lock().await;
        let current = entries
            .get(key)
            .map(|s| s.entry.clone())
            .ok_or_else(|| Error::EntryNotFound { key: key.clone() })?;
        if current.phase != Phase::Failed {
            return Err(Error::InvalidStateTransition {
                from: current.phase.to_string(),
                to: Phase::Failed.to_string(),
                reason: "only FAILED entries can have their attempts reset".into(),
            });
        }

        let next = LedgerEntry {
            attempts: 0,
            ..current
        };
        let entry = self.write(&mut entries, next).await?;
        tracing::info!(key = %key, "attempt counter reset");
        Ok(entry)
    }

    /// Marks the in-flight entry for `key` `FAILED` after its pipeline aborted
    /// on a ledger error, so the next poll retries it.
    ///
    /// The aborted write may still have reached storage, so the entry is
    /// re-read first. Returns `None` when there is no stored entry or it is
    /// no longer in flight.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be read or the `FAILED` write fails.
    pub async fn abandon(
        &self,
        key: &ArtifactKey,
        reason: impl Into<String>,
    ) -> Result<Option<LedgerEntry>> {
        let mut entries = self.entries.lock().await;
        self.reload(&mut entries, key).await?;
        let Some(current) = entries.get(key).map(|s| s.entry.clone()) else {
            return Ok(None);
        };
        if !current.phase.is_in_flight() {
            return Ok(None);
        }

        let next = LedgerEntry {
            phase: Phase::Failed,
            last_error: Some(reason.into()),
            ..current
        };
        self.write(&mut entries, next).await.map(Some)
    }

    /// Holds `key` for [`Ledger::recover_stranded`] after [`Ledger::abandon`]
    /// kept failing.
    pub async fn strand(&self, key: &ArtifactKey, reason: impl Into<String>) {
        self.stranded.lock().await.insert(key.clone(), reason.into());
    }

    /// Returns the keys waiting for [`Ledger::recover_stranded`].
    pub async fn stranded(&self) -> Vec<ArtifactKey> {
        self.stranded.lock().await.keys().cloned().collect()
    }

    /// Retries [`Ledger::abandon`] for every stranded key and returns how many
    /// were released. Keys that fail again stay stranded.
    pub async fn recover_stranded(&self) -> usize {
        let pending = std::mem::take(&mut *self.stranded.lock().await);
        let mut released = 0;
        for (key, reason) in pending {
            match self.abandon(&key, reason.as_str()).await {
                Ok(_) => {
                    released += 1;
                    tracing::info!(key = %key, "stranded entry released for retry");
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "stranded entry still cannot be written");
                    self.stranded.lock().await.insert(key, reason);
                }
            }
        }
        released
    }

    /// Replaces the cached entry for `key` with what storage holds.
    async fn reload(
        &self,
        entries: &mut BTreeMap<ArtifactKey, Stored>,
        key: &ArtifactKey,
    ) -> Result<()> {
        let path = entry_path(key);
        let Some(meta) = self.storage.head(&path).await? else {
            entries.remove(key);
            return Ok(());
        };
        let body = self.storage.get(&path).await?;
        let entry: LedgerEntry = serde_json::from_slice(&body)?;
        entries.insert(
            key.clone(),
            Stored {
                entry,
                version: meta.version,
            },
        );
        Ok(())
    }

    async fn transition(
        &self,
        key: &ArtifactKey,
        target: Phase,
        mutate: impl FnOnce(&mut LedgerEntry),
    ) -> Result<LedgerEntry> {
        let mut entries = self.entries.lock().await;
        let mut next = entries
            .get(key)
            .map(|s| s.entry.clone())
            .ok_or_else(|| Error::EntryNotFound { key: key.clone() })?;

        if !next.phase.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: next.phase.to_string(),
                to: target.to_string(),
                reason: format!(
                    "valid transitions from {}: {:?}",
                    next.phase,
                    next.phase.valid_transitions()
                ),
            });
        }

        next.phase = target;
        mutate(&mut next);
        self.write(&mut entries, next).await
    }

    /// Persists `next` with compare-and-swap and updates the cache.
    ///
    /// Caller holds the entries lock.
    async fn write(
        &self,
        entries: &mut BTreeMap<ArtifactKey, Stored>,
        mut next: LedgerEntry,
    ) -> Result<LedgerEntry> {
        let key = next.key();
        let previous = entries.get(&key);
        let from = previous.map_or("none", |s| s.entry.phase.as_label());
        let precondition = previous.map_or(WritePrecondition::DoesNotExist, |s| {
            WritePrecondition::MatchesVersion(s.version.clone())
        });

        next.updated_at = Utc::now();
        let body = serde_json::to_vec(&next)?;

        match self
            .storage
            .put(&next.path(), Bytes::from(body), precondition)
            .await?
        {
            WriteResult::Success { version } => {
                self.metrics.record_transition(from, next.phase.as_label());
                tracing::debug!(
                    key = %key,
                    from,
                    to = %next.phase,
                    attempts = next.attempts,
                    "ledger entry written"
                );
                entries.insert(
                    key,
                    Stored {
                        entry: next.clone(),
                        version,
                    },
                );
                Ok(next)
            }
            WriteResult::PreconditionFailed { current_version } => {
                tracing::error!(
                    key = %key,
                    current_version = %current_version,
                    "ledger write conflict: another process is writing this ledger"
                );
                Err(Error::LedgerWriteConflict {
                    key,
                    current_version,
                })
            }
        }
    }
}
