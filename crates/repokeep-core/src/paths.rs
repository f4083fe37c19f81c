use crate::error::{RepokeepError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const REPOKEEP_DIR: &str = ".repokeep";
pub const CONFIG_FILE: &str = ".repokeep/config.yaml";
pub const STATE_FILE: &str = ".repokeep/state.env";
pub const STATE_DB_FILE: &str = ".repokeep/state.redb";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn repokeep_dir(root: &Path) -> PathBuf {
    root.join(REPOKEEP_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn state_path(root: &Path) -> PathBuf {
    root.join(STATE_FILE)
}

pub fn state_db_path(root: &Path) -> PathBuf {
    root.join(STATE_DB_FILE)
}

// ---------------------------------------------------------------------------
// Name validation
// ---------------------------------------------------------------------------

static STANZA_RE: OnceLock<Regex> = OnceLock::new();

fn stanza_re() -> &'static Regex {
    STANZA_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_\-]*$").unwrap())
}

/// Stanza names end up in remote command arguments and snapshot tags.
pub fn validate_stanza(stanza: &str) -> Result<()> {
    if stanza.is_empty() || stanza.len() > 64 || !stanza_re().is_match(stanza) {
        return Err(RepokeepError::Configuration(format!(
            "invalid stanza '{stanza}': must be alphanumeric with '-' or '_'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_stanzas() {
        for stanza in ["main", "pg-cluster_1", "A"] {
            validate_stanza(stanza).unwrap_or_else(|_| panic!("expected valid: {stanza}"));
        }
    }

    #[test]
    fn invalid_stanzas() {
        for stanza in ["", "-leading", "has space", "semi;colon", "a/b"] {
            assert!(validate_stanza(stanza).is_err(), "expected invalid: {stanza}");
        }
    }

    #[test]
    fn path_helpers() {
        let root = Path::new("/srv/backup");
        assert_eq!(
            config_path(root),
            PathBuf::from("/srv/backup/.repokeep/config.yaml")
        );
        assert_eq!(
            state_path(root),
            PathBuf::from("/srv/backup/.repokeep/state.env")
        );
    }
}
