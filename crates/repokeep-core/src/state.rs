//! Durable step-completion markers and derived artifacts.
//!
//! All backends share "read everything at open, upsert one key at a time"
//! semantics. `FileStateStore` keeps the `KEY=VALUE` line format and
//! rewrites the file atomically on every upsert; `RedbStateStore` commits
//! one write transaction per upsert.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::config::StateBackend;
use crate::error::{RepokeepError, Result};
use crate::paths;

// ---------------------------------------------------------------------------
// Well-known keys
// ---------------------------------------------------------------------------

pub mod keys {
    pub const SETUP_COMPLETE: &str = "SETUP_COMPLETE";
    pub const REPO_SLOT: &str = "REPO_SLOT";
    pub const LAST_BACKUP_TYPE: &str = "LAST_BACKUP_TYPE";
    pub const LAST_BACKUP_DATE: &str = "LAST_BACKUP_DATE";
    pub const LAST_SNAPSHOT_ID: &str = "LAST_SNAPSHOT_ID";
    pub const LAST_RETENTION_DELETED: &str = "LAST_RETENTION_DELETED";

    pub const STEP_PREFIX: &str = "STEP_";
    /// Separates a recurring step marker from its run date.
    pub const DATE_SEPARATOR: char = '@';
}

/// Completion marker key for a one-time step.
pub fn step_key(step: &str) -> String {
    format!("{}{}", keys::STEP_PREFIX, step.to_uppercase())
}

/// Completion marker key for a recurring step, scoped to one calendar day.
pub fn dated_step_key(step: &str, date: NaiveDate) -> String {
    format!(
        "{}{}{}",
        step_key(step),
        keys::DATE_SEPARATOR,
        date.format("%Y-%m-%d")
    )
}

pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "done" | "complete"
    )
}

fn validate_key(key: &str) -> Result<()> {
    let ok = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '@'));
    if ok {
        Ok(())
    } else {
        Err(RepokeepError::State(format!("invalid state key '{key}'")))
    }
}

fn validate_value(key: &str, value: &str) -> Result<()> {
    if value.contains('\n') || value.contains('\r') {
        return Err(RepokeepError::State(format!(
            "value for '{key}' must be a single line"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// StateRecord / StateStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    pub key: String,
    pub value: String,
}

pub trait StateStore {
    fn get(&self, key: &str) -> Option<String>;

    /// Insert or overwrite `key`. Durable once this returns `Ok`.
    fn set(&mut self, key: &str, value: &str) -> Result<()>;

    /// All records, ordered by key.
    fn list(&self) -> Vec<StateRecord>;

    /// Remove one key. Returns whether it existed.
    fn remove(&mut self, key: &str) -> Result<bool>;

    /// Explicit reset: drop every record.
    fn clear(&mut self) -> Result<()>;

    fn is_set(&self, key: &str) -> bool {
        self.get(key).is_some_and(|v| is_truthy(&v))
    }
}

// ---------------------------------------------------------------------------
// MemoryStateStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    records: BTreeMap<String, String>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, key: &str) -> Option<String> {
        self.records.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        validate_key(key)?;
        validate_value(key, value)?;
        self.records.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn list(&self) -> Vec<StateRecord> {
        to_records(&self.records)
    }

    fn remove(&mut self, key: &str) -> Result<bool> {
        Ok(self.records.remove(key).is_some())
    }

    fn clear(&mut self) -> Result<()> {
        self.records.clear();
        Ok(())
    }
}

fn to_records(map: &BTreeMap<String, String>) -> Vec<StateRecord> {
    map.iter()
        .map(|(k, v)| StateRecord {
            key: k.clone(),
            value: v.clone(),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// FileStateStore
// ---------------------------------------------------------------------------

/// `KEY=VALUE` file, one record per line.
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    records: BTreeMap<String, String>,
}

impl FileStateStore {
    /// Read every record in `path`. A missing file is an empty store.
    pub fn open(path: &Path) -> Result<Self> {
        let records = if path.exists() {
            parse_records(&std::fs::read_to_string(path)?)?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            records,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> Result<()> {
        let mut out = String::new();
        for (k, v) in &self.records {
            out.push_str(k);
            out.push('=');
            out.push_str(v);
            out.push('\n');
        }
        crate::io::atomic_write(&self.path, out.as_bytes())
    }
}

/// Parse `KEY=VALUE` lines. Later lines win over earlier ones.
pub fn parse_records(text: &str) -> Result<BTreeMap<String, String>> {
    let mut records = BTreeMap::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(RepokeepError::State(format!(
                "line {}: expected KEY=VALUE, got '{line}'",
                idx + 1
            )));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(RepokeepError::State(format!("line {}: empty key", idx + 1)));
        }
        records.insert(key.to_string(), value.trim().to_string());
    }
    Ok(records)
}

impl StateStore for FileStateStore {
    fn get(&self, key: &str) -> Option<String> {
        self.records.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        validate_key(key)?;
        validate_value(key, value)?;
        if self.records.get(key).map(String::as_str) == Some(value) {
            return Ok(());
        }
        self.records.insert(key.to_string(), value.to_string());
        self.flush()
    }

    fn list(&self) -> Vec<StateRecord> {
        to_records(&self.records)
    }

    fn remove(&mut self, key: &str) -> Result<bool> {
        if self.records.remove(key).is_none() {
            return Ok(false);
        }
        self.flush()?;
        Ok(true)
    }

    fn clear(&mut self) -> Result<()> {
        self.records.clear();
        self.flush()
    }
}

// ---------------------------------------------------------------------------
// RedbStateStore
// ---------------------------------------------------------------------------

const STATE: TableDefinition<&str, &str> = TableDefinition::new("state");

fn db_err(e: impl std::fmt::Display) -> RepokeepError {
    RepokeepError::State(e.to_string())
}

/// State kept in a redb database. Records are cached in memory at open.
pub struct RedbStateStore {
    db: Database,
    records: BTreeMap<String, String>,
}

impl RedbStateStore {
    /// Open or create the database at `path` and load every record.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            crate::io::ensure_dir(parent)?;
        }
        let db = Database::create(path).map_err(db_err)?;
        let wt = db.begin_write().map_err(db_err)?;
        wt.open_table(STATE).map_err(db_err)?;
        wt.commit().map_err(db_err)?;

        let mut records = BTreeMap::new();
        {
            let rt = db.begin_read().map_err(db_err)?;
            let table = rt.open_table(STATE).map_err(db_err)?;
            for entry in table.iter().map_err(db_err)? {
                let (k, v) = entry.map_err(db_err)?;
                records.insert(k.value().to_string(), v.value().to_string());
            }
        }
        Ok(Self { db, records })
    }
}

impl StateStore for RedbStateStore {
    fn get(&self, key: &str) -> Option<String> {
        self.records.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        validate_key(key)?;
        validate_value(key, value)?;
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = wt.open_table(STATE).map_err(db_err)?;
            table.insert(key, value).map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        self.records.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn list(&self) -> Vec<StateRecord> {
        to_records(&self.records)
    }

    fn remove(&mut self, key: &str) -> Result<bool> {
        let wt = self.db.begin_write().map_err(db_err)?;
        let existed = {
            let mut table = wt.open_table(STATE).map_err(db_err)?;
            let removed = table.remove(key).map_err(db_err)?;
            removed.is_some()
        };
        wt.commit().map_err(db_err)?;
        self.records.remove(key);
        Ok(existed)
    }

    fn clear(&mut self) -> Result<()> {
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = wt.open_table(STATE).map_err(db_err)?;
            for key in self.records.keys() {
                table.remove(key.as_str()).map_err(db_err)?;
            }
        }
        wt.commit().map_err(db_err)?;
        self.records.clear();
        Ok(())
    }
}

impl<T: StateStore + ?Sized> StateStore for Box<T> {
    fn get(&self, key: &str) -> Option<String> {
        (**self).get(key)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        (**self).set(key, value)
    }

    fn list(&self) -> Vec<StateRecord> {
        (**self).list()
    }

    fn remove(&mut self, key: &str) -> Result<bool> {
        (**self).remove(key)
    }

    fn clear(&mut self) -> Result<()> {
        (**self).clear()
    }
}

impl<T: StateStore + ?Sized> StateStore for &mut T {
    fn get(&self, key: &str) -> Option<String> {
        (**self).get(key)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        (**self).set(key, value)
    }

    fn list(&self) -> Vec<StateRecord> {
        (**self).list()
    }

    fn remove(&mut self, key: &str) -> Result<bool> {
        (**self).remove(key)
    }

    fn clear(&mut self) -> Result<()> {
        (**self).clear()
    }
}

/// Open the configured backend under `root`.
pub fn open_store(root: &Path, backend: StateBackend) -> Result<Box<dyn StateStore>> {
    match backend {
        StateBackend::File => Ok(Box::new(FileStateStore::open(&paths::state_path(root))?)),
        StateBackend::Redb => Ok(Box::new(RedbStateStore::open(&paths::state_db_path(root))?)),
    }
}

/// Remove recurring step markers dated before `today`. Returns the removed keys.
pub fn prune_stale_markers(store: &mut dyn StateStore, today: NaiveDate) -> Result<Vec<String>> {
    let stale: Vec<String> = store
        .list()
        .into_iter()
        .map(|r| r.key)
        .filter(|key| {
            key.strip_prefix(keys::STEP_PREFIX)
                .and_then(|rest| rest.split_once(keys::DATE_SEPARATOR))
                .and_then(|(_, date)| NaiveDate::parse_from_str(date, "%Y-%m-%d").ok())
                .is_some_and(|date| date < today)
        })
        .collect();
    for key in &stale {
        store.remove(key)?;
    }
    Ok(stale)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
