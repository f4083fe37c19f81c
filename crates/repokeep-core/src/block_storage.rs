//! Cloud block-storage snapshots through the `aws` CLI.
//!
//! The CLI is run directly (no shell) with `--output json`; responses are
//! decoded with serde. Credentials and default region come from the usual
//! AWS environment / profile resolution.

use std::process::{Command, Stdio};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::error::{RepokeepError, Result};
use crate::snapshot::{Snapshot, SnapshotTags};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotStatus {
    Pending,
    Completed,
    Error(String),
}

/// Tag filter for listing. Only snapshots tagged with this source are returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFilter {
    pub source: String,
}

pub trait BlockStorage {
    fn create_snapshot(&self, volume_id: &str, tags: &SnapshotTags) -> Result<String>;
    fn describe_snapshot(&self, id: &str) -> Result<SnapshotStatus>;
    fn delete_snapshot(&self, id: &str) -> Result<()>;
    fn list_snapshots(&self, filter: &SnapshotFilter) -> Result<Vec<Snapshot>>;
}

// ---------------------------------------------------------------------------
// Response shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateResponse {
    snapshot_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeResponse {
    #[serde(default)]
    snapshots: Vec<RawSnapshot>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawSnapshot {
    snapshot_id: String,
    #[serde(default)]
    volume_id: String,
    state: String,
    #[serde(default)]
    state_message: Option<String>,
    start_time: DateTime<Utc>,
    #[serde(default)]
    tags: Vec<RawTag>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawTag {
    key: String,
    value: String,
}

impl RawSnapshot {
    fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.key == key)
            .map(|t| t.value.as_str())
    }

    fn status(&self) -> SnapshotStatus {
        match self.state.as_str() {
            "completed" => SnapshotStatus::Completed,
            "error" | "recoverable" => SnapshotStatus::Error(
                self.state_message
                    .clone()
                    .unwrap_or_else(|| format!("snapshot in state '{}'", self.state)),
            ),
            _ => SnapshotStatus::Pending,
        }
    }

    /// Convert to the domain type. Snapshots missing our tags are not ours.
    fn into_snapshot(self) -> Option<Snapshot> {
        let tags = SnapshotTags {
            source: self.tag(SnapshotTags::SOURCE)?.to_string(),
            backup_type: self.tag(SnapshotTags::BACKUP_TYPE)?.parse().ok()?,
            stanza: self.tag(SnapshotTags::STANZA).unwrap_or_default().to_string(),
            day_of_week: self
                .tag(SnapshotTags::DAY_OF_WEEK)
                .unwrap_or_default()
                .to_string(),
        };
        Some(Snapshot {
            id: self.snapshot_id,
            volume_id: self.volume_id,
            created_at: self.start_time,
            tags,
        })
    }
}

/// Parse a `describe-snapshots` response into tagged snapshots.
pub fn parse_snapshot_list(json: &str) -> Result<Vec<Snapshot>> {
    let resp: DescribeResponse = serde_json::from_str(json)?;
    Ok(resp
        .snapshots
        .into_iter()
        .filter_map(RawSnapshot::into_snapshot)
        .collect())
}

// ---------------------------------------------------------------------------
// AwsCliStorage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct AwsCliStorage {
    region: Option<String>,
}

impl AwsCliStorage {
    pub fn new(region: Option<String>) -> Self {
        Self { region }
    }

    /// Fail early when the CLI is missing rather than at the first snapshot.
    pub fn ensure_available() -> Result<()> {
        which::which("aws").map(|_| ()).map_err(|_| {
            RepokeepError::Configuration("snapshots enabled but no 'aws' executable on PATH".into())
        })
    }

    pub fn args(&self, subcommand: &str, rest: Vec<String>) -> Vec<String> {
        let mut args = vec!["ec2".to_string(), subcommand.to_string()];
        args.extend(rest);
        if let Some(region) = &self.region {
            args.push("--region".to_string());
            args.push(region.clone());
        }
        args.push("--output".to_string());
        args.push("json".to_string());
        args
    }

    fn run(&self, target: &str, subcommand: &str, rest: Vec<String>) -> Result<String> {
        let args = self.args(subcommand, rest);
        debug!(?args, "aws");
        let output = Command::new("aws")
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| RepokeepError::snapshot(target, format!("failed to run aws: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RepokeepError::snapshot(
                target,
                format!(
                    "aws ec2 {subcommand} failed: {}",
                    stderr.trim().chars().take(500).collect::<String>()
                ),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// `--tag-specifications` value in the CLI's JSON form.
pub fn tag_specification(tags: &SnapshotTags) -> String {
    let tags: Vec<serde_json::Value> = tags
        .pairs()
        .into_iter()
        .map(|(k, v)| serde_json::json!({ "Key": k, "Value": v }))
        .collect();
    serde_json::json!([{ "ResourceType": "snapshot", "Tags": tags }]).to_string()
}

impl BlockStorage for AwsCliStorage {
    fn create_snapshot(&self, volume_id: &str, tags: &SnapshotTags) -> Result<String> {
        let description = format!(
            "repokeep {} backup of stanza {} from {}",
            tags.backup_type, tags.stanza, tags.source
        );
        let json = self.run(
            volume_id,
            "create-snapshot",
            vec![
                "--volume-id".to_string(),
                volume_id.to_string(),
                "--description".to_string(),
                description,
                "--tag-specifications".to_string(),
                tag_specification(tags),
            ],
        )?;
        let resp: CreateResponse = serde_json::from_str(&json)?;
        Ok(resp.snapshot_id)
    }

    fn describe_snapshot(&self, id: &str) -> Result<SnapshotStatus> {
        let json = self.run(
            id,
            "describe-snapshots",
            vec!["--snapshot-ids".to_string(), id.to_string()],
        )?;
        let resp: DescribeResponse = serde_json::from_str(&json)?;
        resp.snapshots
            .into_iter()
            .find(|s| s.snapshot_id == id)
            .map(|s| s.status())
            .ok_or_else(|| RepokeepError::snapshot(id, "snapshot not found"))
    }

    fn delete_snapshot(&self, id: &str) -> Result<()> {
        self.run(
            id,
            "delete-snapshot",
            vec!["--snapshot-id".to_string(), id.to_string()],
        )?;
        Ok(())
    }

    fn list_snapshots(&self, filter: &SnapshotFilter) -> Result<Vec<Snapshot>> {
        let json = self.run(
            &filter.source,
            "describe-snapshots",
            vec![
                "--owner-ids".to_string(),
                "self".to_string(),
                "--filters".to_string(),
                format!("Name=tag:{},Values={}", SnapshotTags::SOURCE, filter.source),
            ],
        )?;
        parse_snapshot_list(&json)
    }
}
