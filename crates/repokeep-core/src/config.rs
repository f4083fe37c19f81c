use crate::error::{RepokeepError, Result};
use crate::paths;
use crate::snapshot::RetentionPolicy;
use crate::types::BackupMode;
use chrono::Weekday;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// SourceConfig
// ---------------------------------------------------------------------------

/// The backup source this installation runs on behalf of.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Owner identity recorded in the shared destination (usually the host address).
    pub identity: String,
    /// Host where the backup tool and catalog queries run (a replica).
    pub host: String,
    /// Primary database host; must be reachable before any run.
    pub primary: String,
}

// ---------------------------------------------------------------------------
// DestinationConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub host: String,
    /// Path of the backup tool's configuration file on the destination host.
    #[serde(default = "default_destination_config_path")]
    pub config_path: String,
    #[serde(default = "default_slot_prefix")]
    pub slot_prefix: String,
    #[serde(default = "default_owner_attribute")]
    pub owner_attribute: String,
    /// INI section receiving new slot entries. Defaults to the stanza name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    /// Value written as `<prefix><N>-path` for a newly registered slot.
    #[serde(default = "default_data_path")]
    pub data_path: String,
}

fn default_destination_config_path() -> String {
    "/etc/pgbackrest/pgbackrest.conf".to_string()
}

fn default_slot_prefix() -> String {
    "pg".to_string()
}

fn default_owner_attribute() -> String {
    "host".to_string()
}

fn default_data_path() -> String {
    "/var/lib/postgresql/data".to_string()
}

// ---------------------------------------------------------------------------
// BackupConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default)]
    pub mode: BackupMode,
    #[serde(default = "default_weekly_full_day")]
    pub weekly_full_day: Weekday,
}

fn default_weekly_full_day() -> Weekday {
    Weekday::Sun
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            mode: BackupMode::Auto,
            weekly_full_day: default_weekly_full_day(),
        }
    }
}

// ---------------------------------------------------------------------------
// SnapshotConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Block until the snapshot completes during setup runs.
    #[serde(default = "default_true")]
    pub wait_on_setup: bool,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    15
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            volume_id: None,
            region: None,
            wait_on_setup: true,
            poll_interval_secs: default_poll_interval(),
        }
    }
}

// ---------------------------------------------------------------------------
// RetentionConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_daily_days")]
    pub daily_retention_days: u32,
    #[serde(default = "default_weekly_keep")]
    pub weekly_full_keep_count: u32,
}

fn default_daily_days() -> u32 {
    7
}

fn default_weekly_keep() -> u32 {
    4
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            daily_retention_days: default_daily_days(),
            weekly_full_keep_count: default_weekly_keep(),
        }
    }
}

impl RetentionConfig {
    pub fn policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            daily_retention_days: self.daily_retention_days,
            weekly_full_keep_count: self.weekly_full_keep_count,
        }
    }
}

// ---------------------------------------------------------------------------
// TransportConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[default]
    Ssh,
    Local,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub kind: TransportKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_port: Option<u16>,
    /// Extra `-o` options passed to ssh (e.g. `ConnectTimeout=10`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_options: Vec<String>,
}

// ---------------------------------------------------------------------------
// StateConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateBackend {
    #[default]
    File,
    Redb,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default)]
    pub backend: StateBackend,
}

// ---------------------------------------------------------------------------
// ConfigOverrides
// ---------------------------------------------------------------------------

/// Per-invocation overrides supplied on the command line.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub primary: Option<String>,
    pub source_host: Option<String>,
    pub source_identity: Option<String>,
    pub stanza: Option<String>,
    pub backup_mode: Option<BackupMode>,
    pub retention_enabled: Option<bool>,
    pub region: Option<String>,
    pub volume_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    pub source: SourceConfig,
    #[serde(default = "default_stanza")]
    pub stanza: String,
    pub destination: DestinationConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub state: StateConfig,
}

fn default_version() -> u32 {
    1
}

fn default_stanza() -> String {
    "main".to_string()
}

impl Config {
    pub fn new(
        identity: impl Into<String>,
        source_host: impl Into<String>,
        primary: impl Into<String>,
        destination_host: impl Into<String>,
    ) -> Self {
        Self {
            version: 1,
            source: SourceConfig {
                identity: identity.into(),
                host: source_host.into(),
                primary: primary.into(),
            },
            stanza: default_stanza(),
            destination: DestinationConfig {
                host: destination_host.into(),
                config_path: default_destination_config_path(),
                slot_prefix: default_slot_prefix(),
                owner_attribute: default_owner_attribute(),
                section: None,
                data_path: default_data_path(),
            },
            backup: BackupConfig::default(),
            snapshot: SnapshotConfig::default(),
            retention: RetentionConfig::default(),
            transport: TransportConfig::default(),
            state: StateConfig::default(),
        }
    }

    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(RepokeepError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    /// INI section that receives this source's slot entries.
    pub fn destination_section(&self) -> &str {
        self.destination.section.as_deref().unwrap_or(&self.stanza)
    }

    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(primary) = &overrides.primary {
            self.source.primary = primary.clone();
        }
        if let Some(host) = &overrides.source_host {
            self.source.host = host.clone();
        }
        if let Some(identity) = &overrides.source_identity {
            self.source.identity = identity.clone();
        }
        if let Some(stanza) = &overrides.stanza {
            self.stanza = stanza.clone();
        }
        if let Some(mode) = overrides.backup_mode {
            self.backup.mode = mode;
        }
        if let Some(enabled) = overrides.retention_enabled {
            self.retention.enabled = enabled;
        }
        if let Some(region) = &overrides.region {
            self.snapshot.region = Some(region.clone());
        }
        if let Some(volume) = &overrides.volume_id {
            self.snapshot.volume_id = Some(volume.clone());
        }
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut error = |message: String| {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message,
            })
        };

        for (field, value) in [
            ("source.identity", &self.source.identity),
            ("source.host", &self.source.host),
            ("source.primary", &self.source.primary),
            ("destination.host", &self.destination.host),
            ("destination.config_path", &self.destination.config_path),
        ] {
            if value.trim().is_empty() {
                error(format!("{field} must not be empty"));
            }
        }

        if let Err(e) = paths::validate_stanza(&self.stanza) {
            error(e.to_string());
        }

        if self.destination.slot_prefix.is_empty()
            || !self
                .destination
                .slot_prefix
                .chars()
                .all(|c| c.is_ascii_alphabetic())
        {
            error(format!(
                "destination.slot_prefix '{}' must be non-empty and alphabetic",
                self.destination.slot_prefix
            ));
        }

        if self.destination.owner_attribute.trim().is_empty() {
            error("destination.owner_attribute must not be empty".to_string());
        }

        if self.retention.enabled {
            if self.retention.daily_retention_days == 0 {
                error("retention.daily_retention_days must be at least 1".to_string());
            }
            if self.retention.weekly_full_keep_count == 0 {
                error("retention.weekly_full_keep_count must be at least 1".to_string());
            }
        }

        if self.snapshot.enabled
            && self
                .snapshot
                .volume_id
                .as_deref()
                .map_or(true, |v| v.trim().is_empty())
        {
            error("snapshot.enabled requires snapshot.volume_id".to_string());
        }

        if self.snapshot.enabled && self.snapshot.poll_interval_secs == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "snapshot.poll_interval_secs is 0; status will be polled in a tight loop"
                    .to_string(),
            });
        }

        if !self.retention.enabled && self.snapshot.enabled {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "retention is disabled; snapshots will accumulate".to_string(),
            });
        }

        warnings
    }

    /// Fail with a `Configuration` error if any validation error is present.
    pub fn ensure_valid(&self) -> Result<()> {
        let errors: Vec<String> = self
            .validate()
            .into_iter()
            .filter(|w| w.level == WarnLevel::Error)
            .map(|w| w.message)
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(RepokeepError::Configuration(errors.join("; ")))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
