//! Point-in-time snapshots of backup storage and their retention.
//!
//! Retention has two tiers:
//! - age: any snapshot of this source older than `daily_retention_days`
//! - weekly count: on the designated weekly day, only the newest
//!   `weekly_full_keep_count` full snapshots survive
//!
//! The age pass never touches the newest `weekly_full_keep_count` full
//! snapshots, so the weekly tier can outlive the daily window. The count
//! pass runs second, over whatever the age pass did not select. Nothing the
//! age pass deleted is brought back.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::block_storage::{BlockStorage, SnapshotFilter, SnapshotStatus};
use crate::error::{RepokeepError, Result};
use crate::types::BackupType;

// ---------------------------------------------------------------------------
// Data model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotTags {
    pub source: String,
    pub backup_type: BackupType,
    pub stanza: String,
    pub day_of_week: String,
}

impl SnapshotTags {
    pub const SOURCE: &'static str = "source";
    pub const BACKUP_TYPE: &'static str = "backupType";
    pub const STANZA: &'static str = "stanza";
    pub const DAY_OF_WEEK: &'static str = "dayOfWeek";

    pub fn pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            (Self::SOURCE, self.source.clone()),
            (Self::BACKUP_TYPE, self.backup_type.as_str().to_string()),
            (Self::STANZA, self.stanza.clone()),
            (Self::DAY_OF_WEEK, self.day_of_week.clone()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub volume_id: String,
    pub created_at: DateTime<Utc>,
    pub tags: SnapshotTags,
}

impl Snapshot {
    pub fn is_full(&self) -> bool {
        self.tags.backup_type == BackupType::Full
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub daily_retention_days: u32,
    pub weekly_full_keep_count: u32,
}

/// How `create` treats completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Poll until the provider reports the snapshot complete. There is no
    /// upper bound on the wait.
    Synchronous { poll_interval: Duration },
    /// Return once the create call is accepted.
    Background,
}

// ---------------------------------------------------------------------------
// Retention planning
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionRule {
    Age,
    WeeklyCount,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionCandidate {
    pub snapshot: Snapshot,
    pub rule: RetentionRule,
}

/// Decide which snapshots to delete. `snapshots` should already be limited
/// to one source; anything tagged for another source is ignored anyway.
pub fn plan_retention(
    policy: &RetentionPolicy,
    snapshots: &[Snapshot],
    source: &str,
    now: DateTime<Utc>,
    is_weekly_day: bool,
) -> Vec<RetentionCandidate> {
    let mut owned: Vec<&Snapshot> = snapshots.iter().filter(|s| s.tags.source == source).collect();
    owned.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

    let keep = policy.weekly_full_keep_count as usize;
    let fulls: Vec<&Snapshot> = owned.iter().copied().filter(|s| s.is_full()).collect();
    let protected: Vec<&str> = fulls
        .iter()
        .rev()
        .take(keep)
        .map(|s| s.id.as_str())
        .collect();

    let cutoff = now - chrono::Duration::days(i64::from(policy.daily_retention_days));
    let mut candidates = Vec::new();
    for snap in &owned {
        if snap.created_at < cutoff && !protected.contains(&snap.id.as_str()) {
            candidates.push(RetentionCandidate {
                snapshot: (*snap).clone(),
                rule: RetentionRule::Age,
            });
        }
    }

    if is_weekly_day {
        let remaining: Vec<&Snapshot> = fulls
            .iter()
            .copied()
            .filter(|s| !candidates.iter().any(|c| c.snapshot.id == s.id))
            .collect();
        let excess = remaining.len().saturating_sub(keep);
        for snap in remaining.into_iter().take(excess) {
            candidates.push(RetentionCandidate {
                snapshot: snap.clone(),
                rule: RetentionRule::WeeklyCount,
            });
        }
    }

    candidates
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionFailure {
    pub snapshot_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionReport {
    pub examined: usize,
    pub deleted: Vec<String>,
    pub failures: Vec<DeletionFailure>,
}

impl RetentionReport {
    pub fn deleted_count(&self) -> usize {
        self.deleted.len()
    }
}

// ---------------------------------------------------------------------------
// SnapshotLifecycleManager
// ---------------------------------------------------------------------------

pub struct SnapshotLifecycleManager<'a> {
    storage: &'a dyn BlockStorage,
    source: String,
}

impl<'a> SnapshotLifecycleManager<'a> {
    pub fn new(storage: &'a dyn BlockStorage, source: impl Into<String>) -> Self {
        Self {
            storage,
            source: source.into(),
        }
    }

    pub fn create(&self, volume_id: &str, tags: &SnapshotTags, wait: WaitMode) -> Result<String> {
        let id = self.storage.create_snapshot(volume_id, tags)?;
        info!(snapshot = %id, volume = volume_id, backup_type = %tags.backup_type, "snapshot requested");
        self.await_completion(&id, wait)?;
        Ok(id)
    }

    /// A snapshot of `volume_id` carrying `tags`, taken at or after `since`,
    /// that is not `recorded` and has not failed. An interrupted run leaves
    /// one of these behind once the create call was accepted.
    pub fn find_unrecorded(
        &self,
        volume_id: &str,
        tags: &SnapshotTags,
        since: DateTime<Utc>,
        recorded: Option<&str>,
    ) -> Result<Option<Snapshot>> {
        let mut matches: Vec<Snapshot> = self
            .storage
            .list_snapshots(&SnapshotFilter {
                source: self.source.clone(),
            })?
            .into_iter()
            .filter(|s| {
                s.volume_id == volume_id
                    && s.tags == *tags
                    && s.created_at >= since
                    && Some(s.id.as_str()) != recorded
            })
            .collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));

        for snap in matches {
            match self.storage.describe_snapshot(&snap.id)? {
                SnapshotStatus::Error(message) => {
                    warn!(snapshot = %snap.id, %message, "earlier snapshot failed; not adopting it");
                }
                _ => return Ok(Some(snap)),
            }
        }
        Ok(None)
    }

    /// Reuse an unrecorded snapshot from an interrupted run if there is one,
    /// otherwise request a new snapshot.
    pub fn adopt_or_create(
        &self,
        volume_id: &str,
        tags: &SnapshotTags,
        since: DateTime<Utc>,
        recorded: Option<&str>,
        wait: WaitMode,
    ) -> Result<String> {
        match self.find_unrecorded(volume_id, tags, since, recorded)? {
            Some(existing) => {
                info!(snapshot = %existing.id, volume = volume_id, "adopting snapshot from an interrupted run");
                self.await_completion(&existing.id, wait)?;
                Ok(existing.id)
            }
            None => self.create(volume_id, tags, wait),
        }
    }

    fn await_completion(&self, id: &str, wait: WaitMode) -> Result<()> {
        let WaitMode::Synchronous { poll_interval } = wait else {
            return Ok(());
        };

        let started = Instant::now();
        loop {
            match self.storage.describe_snapshot(id)? {
                SnapshotStatus::Completed => {
                    info!(snapshot = %id, elapsed_secs = started.elapsed().as_secs(), "snapshot completed");
                    return Ok(());
                }
                SnapshotStatus::Error(message) => {
                    return Err(RepokeepError::snapshot(id, message));
                }
                SnapshotStatus::Pending => {}
            }
            std::thread::sleep(poll_interval);
        }
    }

    /// List this source's snapshots, then delete what the policy selects.
    /// A failed deletion is recorded and the pass continues.
    pub fn apply_retention(
        &self,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
        is_weekly_day: bool,
    ) -> Result<RetentionReport> {
        let snapshots = self.storage.list_snapshots(&SnapshotFilter {
            source: self.source.clone(),
        })?;
        let plan = plan_retention(policy, &snapshots, &self.source, now, is_weekly_day);

        let mut report = RetentionReport {
            examined: snapshots.len(),
            ..RetentionReport::default()
        };
        for candidate in plan {
            let id = &candidate.snapshot.id;
            match self.storage.delete_snapshot(id) {
                Ok(()) => {
                    info!(snapshot = %id, rule = ?candidate.rule, created_at = %candidate.snapshot.created_at, "snapshot deleted");
                    report.deleted.push(id.clone());
                }
                Err(e) => {
                    warn!(snapshot = %id, error = %e, "snapshot deletion failed; continuing");
                    report.failures.push(DeletionFailure {
                        snapshot_id: id.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
