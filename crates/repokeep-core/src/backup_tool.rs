//! Backup tool invocation (pgBackRest) over the remote channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{RepokeepError, Result};
use crate::remote::{RemoteChannel, RemoteCommand};
use crate::types::BackupType;

/// One catalog entry as reported by the backup tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Backup {
    pub label: String,
    pub backup_type: BackupType,
    pub stanza: String,
    pub taken_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CatalogInfo {
    pub stanza: String,
    pub backups: Vec<Backup>,
}

impl CatalogInfo {
    pub fn has_full_backup(&self) -> bool {
        self.backups
            .iter()
            .any(|b| b.backup_type == BackupType::Full)
    }

    pub fn last_backup(&self) -> Option<&Backup> {
        self.backups.iter().max_by_key(|b| b.taken_at)
    }
}

pub trait BackupTool {
    fn create_stanza(&self, stanza: &str) -> Result<()>;
    fn run_backup(&self, stanza: &str, backup_type: BackupType) -> Result<()>;
    fn info(&self, stanza: &str) -> Result<CatalogInfo>;
}

// ---------------------------------------------------------------------------
// Info JSON
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawStanza {
    name: String,
    #[serde(default)]
    backup: Vec<RawBackup>,
}

#[derive(Debug, Deserialize)]
struct RawBackup {
    label: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    timestamp: Option<RawTimestamp>,
}

#[derive(Debug, Deserialize)]
struct RawTimestamp {
    #[serde(default)]
    stop: i64,
}

/// Parse `info --output=json` output for `stanza`. A stanza absent from the
/// output has an empty catalog.
pub fn parse_info(json: &str, stanza: &str) -> Result<CatalogInfo> {
    let stanzas: Vec<RawStanza> = serde_json::from_str(json)?;
    let Some(raw) = stanzas.into_iter().find(|s| s.name == stanza) else {
        return Ok(CatalogInfo {
            stanza: stanza.to_string(),
            backups: Vec::new(),
        });
    };

    let mut backups = Vec::with_capacity(raw.backup.len());
    for b in raw.backup {
        let backup_type = match b.kind.as_str() {
            "full" => BackupType::Full,
            // Differential backups also depend on a prior full.
            "incr" | "diff" => BackupType::Incremental,
            other => {
                return Err(RepokeepError::backup(
                    stanza,
                    format!("unknown backup type '{other}' in catalog"),
                ))
            }
        };
        let stop = b.timestamp.map(|t| t.stop).unwrap_or(0);
        let taken_at = DateTime::<Utc>::from_timestamp(stop, 0).unwrap_or_default();
        backups.push(Backup {
            label: b.label,
            backup_type,
            stanza: stanza.to_string(),
            taken_at,
        });
    }
    Ok(CatalogInfo {
        stanza: stanza.to_string(),
        backups,
    })
}

// ---------------------------------------------------------------------------
// PgBackRest
// ---------------------------------------------------------------------------

/// pgBackRest driven through a `RemoteChannel` on the source host.
pub struct PgBackRest<'a> {
    channel: &'a dyn RemoteChannel,
    host: String,
}

impl<'a> PgBackRest<'a> {
    pub fn new(channel: &'a dyn RemoteChannel, host: impl Into<String>) -> Self {
        Self {
            channel,
            host: host.into(),
        }
    }

    fn run(&self, stanza: &str, args: Vec<String>) -> Result<String> {
        let cmd = RemoteCommand::BackupTool { args };
        debug!(host = %self.host, command = %cmd.label(), "backup tool");
        let out = self.channel.execute(&self.host, &cmd)?;
        if !out.success() {
            return Err(RepokeepError::backup(
                stanza,
                format!(
                    "{} exited with {} on {}: {}",
                    cmd.label(),
                    out.exit_code,
                    self.host,
                    out.diagnostic()
                ),
            ));
        }
        Ok(out.stdout)
    }
}

impl BackupTool for PgBackRest<'_> {
    fn create_stanza(&self, stanza: &str) -> Result<()> {
        self.run(
            stanza,
            vec!["stanza-create".to_string(), format!("--stanza={stanza}")],
        )?;
        info!(stanza, "stanza created");
        Ok(())
    }

    fn run_backup(&self, stanza: &str, backup_type: BackupType) -> Result<()> {
        self.run(
            stanza,
            vec![
                "backup".to_string(),
                format!("--stanza={stanza}"),
                format!("--type={}", backup_type.tool_arg()),
            ],
        )?;
        info!(stanza, %backup_type, "backup finished");
        Ok(())
    }

    fn info(&self, stanza: &str) -> Result<CatalogInfo> {
        let json = self.run(
            stanza,
            vec![
                "info".to_string(),
                format!("--stanza={stanza}"),
                "--output=json".to_string(),
            ],
        )?;
        parse_info(&json, stanza)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::ExecOutput;
    use crate::testing::FakeChannel;

    const INFO: &str = r#"[
      {
        "name": "main",
        "backup": [
          {"label": "20261011-020000F", "type": "full", "timestamp": {"start": 1791684000, "stop": 1791685800}},
          {"label": "20261012-020000F_20261012-020000I", "type": "incr", "timestamp": {"start": 1791770400, "stop": 1791770700}}
        ],
        "status": {"code": 0, "message": "ok"}
      },
      {"name": "other", "backup": []}
    ]"#;

    #[test]
    fn parse_info_reads_types_and_times() {
        let info = parse_info(INFO, "main").unwrap();
        assert_eq!(info.backups.len(), 2);
        assert!(info.has_full_backup());
        let last = info.last_backup().unwrap();
        assert_eq!(last.backup_type, BackupType::Incremental);
        assert_eq!(last.taken_at.timestamp(), 1791770700);
    }

    #[test]
    fn parse_info_empty_or_missing_stanza() {
        assert!(!parse_info(INFO, "other").unwrap().has_full_backup());
        assert!(parse_info(INFO, "absent").unwrap().backups.is_empty());
        assert!(parse_info("[]", "main").unwrap().backups.is_empty());
    }

    #[test]
    fn parse_info_rejects_garbage() {
        assert!(parse_info("not json", "main").is_err());
    }

    #[test]
    fn run_backup_sends_typed_arguments() {
        let channel = FakeChannel::new();
        let tool = PgBackRest::new(&channel, "replica-1");
        tool.run_backup("main", BackupType::Incremental).unwrap();

        let log = channel.commands();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0, "replica-1");
        assert_eq!(
            log[0].1,
            RemoteCommand::backup_tool(["backup", "--stanza=main", "--type=incr"])
        );
    }

    #[test]
    fn failed_backup_surfaces_host_and_output() {
        let channel = FakeChannel::new();
        channel.respond(
            "pgbackrest backup",
            ExecOutput {
                exit_code: 56,
                stdout: String::new(),
                stderr: "ERROR: [056]: unable to find primary cluster".to_string(),
            },
        );
        let tool = PgBackRest::new(&channel, "replica-1");
        let err = tool.run_backup("main", BackupType::Full).unwrap_err();
        let msg = err.to_string();
        assert!(matches!(err, RepokeepError::Backup { .. }));
        assert!(msg.contains("replica-1"));
        assert!(msg.contains("unable to find primary cluster"));
    }
}
