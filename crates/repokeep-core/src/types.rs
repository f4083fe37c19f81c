use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::RepokeepError;

// ---------------------------------------------------------------------------
// RunMode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// First-time setup followed by the recurring steps.
    Setup,
    /// Recurring steps only; requires a completed setup.
    Scheduled,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::Setup => "setup",
            RunMode::Scheduled => "scheduled",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunMode {
    type Err = RepokeepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "setup" => Ok(RunMode::Setup),
            "scheduled" => Ok(RunMode::Scheduled),
            _ => Err(RepokeepError::Configuration(format!(
                "unknown run mode '{s}' (expected setup or scheduled)"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// BackupMode
// ---------------------------------------------------------------------------

/// Operator-requested backup mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupMode {
    #[default]
    Auto,
    Full,
    Incremental,
    /// Initial backup of a setup run.
    Setup,
}

impl BackupMode {
    pub fn as_str(self) -> &'static str {
        match self {
            BackupMode::Auto => "auto",
            BackupMode::Full => "full",
            BackupMode::Incremental => "incremental",
            BackupMode::Setup => "setup",
        }
    }
}

impl fmt::Display for BackupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackupMode {
    type Err = RepokeepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(BackupMode::Auto),
            "full" => Ok(BackupMode::Full),
            "incremental" | "incr" => Ok(BackupMode::Incremental),
            "setup" => Ok(BackupMode::Setup),
            _ => Err(RepokeepError::Configuration(format!(
                "unknown backup mode '{s}' (expected auto, full, incremental or setup)"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// BackupType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    Full,
    Incremental,
}

impl BackupType {
    pub fn as_str(self) -> &'static str {
        match self {
            BackupType::Full => "full",
            BackupType::Incremental => "incremental",
        }
    }

    /// Argument value understood by the backup tool's `--type` option.
    pub fn tool_arg(self) -> &'static str {
        match self {
            BackupType::Full => "full",
            BackupType::Incremental => "incr",
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackupType {
    type Err = RepokeepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(BackupType::Full),
            "incremental" | "incr" => Ok(BackupType::Incremental),
            _ => Err(RepokeepError::Configuration(format!(
                "unknown backup type '{s}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// BackupDecision
// ---------------------------------------------------------------------------

/// Outcome of backup type selection for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupDecision {
    Full,
    Incremental,
    Skip,
}

impl BackupDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            BackupDecision::Full => "full",
            BackupDecision::Incremental => "incremental",
            BackupDecision::Skip => "skip",
        }
    }

    pub fn backup_type(self) -> Option<BackupType> {
        match self {
            BackupDecision::Full => Some(BackupType::Full),
            BackupDecision::Incremental => Some(BackupType::Incremental),
            BackupDecision::Skip => None,
        }
    }
}

impl fmt::Display for BackupDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
