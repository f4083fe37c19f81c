//! Full / incremental / skip decision for a backup run.

use serde::{Deserialize, Serialize};

use crate::types::{BackupDecision, BackupMode};

/// Everything the decision depends on. Nothing here reads the clock or the
/// catalog; callers resolve those first so the result is reproducible for a
/// given calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorInput {
    pub explicit_mode: BackupMode,
    pub skip_requested: bool,
    pub is_designated_weekly_day: bool,
    pub catalog_has_full_backup: bool,
}

/// Rules, first match wins:
/// 1. skip requested
/// 2. explicit full / incremental / setup (setup takes a full)
/// 3. auto: weekly day → full, existing full → incremental, otherwise full
pub fn select_backup_type(input: SelectorInput) -> BackupDecision {
    if input.skip_requested {
        return BackupDecision::Skip;
    }
    match input.explicit_mode {
        BackupMode::Full | BackupMode::Setup => BackupDecision::Full,
        BackupMode::Incremental => BackupDecision::Incremental,
        BackupMode::Auto => {
            if input.is_designated_weekly_day {
                BackupDecision::Full
            } else if input.catalog_has_full_backup {
                BackupDecision::Incremental
            } else {
                BackupDecision::Full
            }
        }
    }
}

/// Whether the decision needs the catalog at all. Lets callers avoid a
/// remote round-trip when an earlier rule already decides.
pub fn needs_catalog(explicit_mode: BackupMode, skip_requested: bool, weekly_day: bool) -> bool {
    !skip_requested && explicit_mode == BackupMode::Auto && !weekly_day
}
