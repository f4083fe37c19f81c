//! Role and catalog inspection.

use tracing::debug;

use crate::backup_tool::BackupTool;
use crate::error::{RepokeepError, Result};
use crate::remote::{RemoteChannel, RemoteCommand};

pub trait CatalogQuery {
    /// True when `host` is running as a replica (in recovery).
    fn is_replica_role(&self, host: &str) -> Result<bool>;
    fn catalog_has_full_backup(&self, stanza: &str) -> Result<bool>;
}

/// Role via `psql`, catalog via the backup tool's `info`.
pub struct RemoteCatalog<'a> {
    channel: &'a dyn RemoteChannel,
    backup_tool: &'a dyn BackupTool,
}

impl<'a> RemoteCatalog<'a> {
    pub fn new(channel: &'a dyn RemoteChannel, backup_tool: &'a dyn BackupTool) -> Self {
        Self {
            channel,
            backup_tool,
        }
    }
}

impl CatalogQuery for RemoteCatalog<'_> {
    fn is_replica_role(&self, host: &str) -> Result<bool> {
        let out = self.channel.execute(
            host,
            &RemoteCommand::Psql {
                query: "SELECT pg_is_in_recovery()".to_string(),
            },
        )?;
        if !out.success() {
            return Err(RepokeepError::connectivity(
                host,
                format!("role query failed: {}", out.diagnostic()),
            ));
        }
        debug!(host, answer = out.stdout.trim(), "pg_is_in_recovery");
        parse_pg_bool(out.stdout.trim()).ok_or_else(|| {
            RepokeepError::connectivity(
                host,
                format!("unexpected role query answer '{}'", out.stdout.trim()),
            )
        })
    }

    fn catalog_has_full_backup(&self, stanza: &str) -> Result<bool> {
        Ok(self.backup_tool.info(stanza)?.has_full_backup())
    }
}

fn parse_pg_bool(s: &str) -> Option<bool> {
    match s {
        "t" | "true" | "on" => Some(true),
        "f" | "false" | "off" => Some(false),
        _ => None,
    }
}
