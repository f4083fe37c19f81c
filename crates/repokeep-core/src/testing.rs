//! In-memory collaborators for unit tests.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use crate::backup_tool::{Backup, BackupTool, CatalogInfo};
use crate::block_storage::{BlockStorage, SnapshotFilter, SnapshotStatus};
use crate::catalog::CatalogQuery;
use crate::error::{RepokeepError, Result};
use crate::remote::{ExecOutput, RemoteChannel, RemoteCommand};
use crate::snapshot::{Snapshot, SnapshotTags};
use crate::types::BackupType;

// ---------------------------------------------------------------------------
// FakeChannel
// ---------------------------------------------------------------------------

/// Files keyed by `(host, path)`; canned responses keyed by command label.
/// Unmatched commands succeed with empty output.
#[derive(Default)]
pub struct FakeChannel {
    files: RefCell<BTreeMap<(String, String), String>>,
    responses: RefCell<HashMap<String, ExecOutput>>,
    unreachable: RefCell<BTreeSet<String>>,
    log: RefCell<Vec<(String, RemoteCommand)>>,
}

impl FakeChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_file(&self, host: &str, path: &str, text: &str) {
        self.files
            .borrow_mut()
            .insert((host.to_string(), path.to_string()), text.to_string());
    }

    pub fn file(&self, host: &str, path: &str) -> Option<String> {
        self.files
            .borrow()
            .get(&(host.to_string(), path.to_string()))
            .cloned()
    }

    pub fn respond(&self, label: &str, output: ExecOutput) {
        self.responses.borrow_mut().insert(label.to_string(), output);
    }

    pub fn unreachable(&self, host: &str) {
        self.unreachable.borrow_mut().insert(host.to_string());
    }

    pub fn commands(&self) -> Vec<(String, RemoteCommand)> {
        self.log.borrow().clone()
    }

    pub fn writes(&self) -> usize {
        self.log
            .borrow()
            .iter()
            .filter(|(_, c)| matches!(c, RemoteCommand::WriteFile { .. }))
            .count()
    }
}

impl RemoteChannel for FakeChannel {
    fn execute(&self, host: &str, cmd: &RemoteCommand) -> Result<ExecOutput> {
        self.log.borrow_mut().push((host.to_string(), cmd.clone()));
        if self.unreachable.borrow().contains(host) {
            return Err(RepokeepError::connectivity(host, "connection refused"));
        }
        match cmd {
            RemoteCommand::ReadFile { path } => Ok(match self.file(host, path) {
                Some(stdout) => ExecOutput {
                    exit_code: 0,
                    stdout,
                    stderr: String::new(),
                },
                None => ExecOutput {
                    exit_code: 1,
                    stdout: String::new(),
                    stderr: format!("cat: {path}: No such file or directory"),
                },
            }),
            RemoteCommand::WriteFile { path, contents } => {
                self.put_file(host, path, contents);
                Ok(ExecOutput::default())
            }
            other => Ok(self
                .responses
                .borrow()
                .get(&other.label())
                .cloned()
                .unwrap_or_default()),
        }
    }
}

// ---------------------------------------------------------------------------
// FakeStorage
// ---------------------------------------------------------------------------

pub struct FakeStorage {
    snapshots: RefCell<Vec<Snapshot>>,
    failing: RefCell<BTreeSet<String>>,
    pending: Cell<usize>,
    describe_calls: Cell<usize>,
    describe_error: RefCell<Option<String>>,
    describe_failures: Cell<usize>,
    list_error: RefCell<Option<String>>,
    next_id: Cell<u32>,
    now: Cell<DateTime<Utc>>,
}

impl Default for FakeStorage {
    fn default() -> Self {
        Self {
            snapshots: RefCell::default(),
            failing: RefCell::default(),
            pending: Cell::new(0),
            describe_calls: Cell::new(0),
            describe_error: RefCell::default(),
            describe_failures: Cell::new(0),
            list_error: RefCell::default(),
            next_id: Cell::new(1),
            now: Cell::new(Utc::now()),
        }
    }
}

impl FakeStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, snapshot: Snapshot) {
        self.snapshots.borrow_mut().push(snapshot);
    }

    pub fn fail_delete(&self, id: &str) {
        self.failing.borrow_mut().insert(id.to_string());
    }

    /// Describe reports `Pending` this many times before `Completed`.
    /// `usize::MAX` never completes.
    pub fn pending_polls(&self, n: usize) {
        self.pending.set(n);
    }

    pub fn error_on_describe(&self, message: &str) {
        *self.describe_error.borrow_mut() = Some(message.to_string());
    }

    /// The next `n` describe calls fail as if the provider were unreachable.
    pub fn fail_describes(&self, n: usize) {
        self.describe_failures.set(n);
    }

    pub fn error_on_list(&self, message: &str) {
        *self.list_error.borrow_mut() = Some(message.to_string());
    }

    /// Creation time stamped on new snapshots.
    pub fn set_time(&self, now: DateTime<Utc>) {
        self.now.set(now);
    }

    pub fn describe_calls(&self) -> usize {
        self.describe_calls.get()
    }

    /// Remaining snapshot ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.snapshots.borrow().iter().map(|s| s.id.clone()).collect();
        ids.sort();
        ids
    }

    pub fn get(&self, id: &str) -> Option<Snapshot> {
        self.snapshots.borrow().iter().find(|s| s.id == id).cloned()
    }
}

impl BlockStorage for FakeStorage {
    fn create_snapshot(&self, volume_id: &str, tags: &SnapshotTags) -> Result<String> {
        let n = self.next_id.get();
        self.next_id.set(n + 1);
        let id = format!("snap-{n:04}");
        self.insert(Snapshot {
            id: id.clone(),
            volume_id: volume_id.to_string(),
            created_at: self.now.get(),
            tags: tags.clone(),
        });
        Ok(id)
    }

    fn describe_snapshot(&self, id: &str) -> Result<SnapshotStatus> {
        self.describe_calls.set(self.describe_calls.get() + 1);
        if self.describe_failures.get() > 0 {
            self.describe_failures.set(self.describe_failures.get() - 1);
            return Err(RepokeepError::connectivity("ec2", "request timed out"));
        }
        if let Some(message) = self.describe_error.borrow().clone() {
            return Ok(SnapshotStatus::Error(message));
        }
        if self.get(id).is_none() {
            return Err(RepokeepError::snapshot(id, "snapshot not found"));
        }
        match self.pending.get() {
            0 => Ok(SnapshotStatus::Completed),
            usize::MAX => Ok(SnapshotStatus::Pending),
            n => {
                self.pending.set(n - 1);
                Ok(SnapshotStatus::Pending)
            }
        }
    }

    fn delete_snapshot(&self, id: &str) -> Result<()> {
        if self.failing.borrow().contains(id) {
            return Err(RepokeepError::snapshot(id, "InvalidSnapshot.InUse"));
        }
        self.snapshots.borrow_mut().retain(|s| s.id != id);
        Ok(())
    }

    fn list_snapshots(&self, filter: &SnapshotFilter) -> Result<Vec<Snapshot>> {
        if let Some(message) = self.list_error.borrow().clone() {
            return Err(RepokeepError::snapshot(&filter.source, message));
        }
        Ok(self
            .snapshots
            .borrow()
            .iter()
            .filter(|s| s.tags.source == filter.source)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// FakeCatalog
// ---------------------------------------------------------------------------

pub struct FakeCatalog {
    pub replica: Cell<bool>,
    pub has_full: Cell<bool>,
    pub role_calls: Cell<usize>,
    pub catalog_calls: Cell<usize>,
}

impl FakeCatalog {
    pub fn new(replica: bool, has_full: bool) -> Self {
        Self {
            replica: Cell::new(replica),
            has_full: Cell::new(has_full),
            role_calls: Cell::new(0),
            catalog_calls: Cell::new(0),
        }
    }
}

impl CatalogQuery for FakeCatalog {
    fn is_replica_role(&self, _host: &str) -> Result<bool> {
        self.role_calls.set(self.role_calls.get() + 1);
        Ok(self.replica.get())
    }

    fn catalog_has_full_backup(&self, _stanza: &str) -> Result<bool> {
        self.catalog_calls.set(self.catalog_calls.get() + 1);
        Ok(self.has_full.get())
    }
}

// ---------------------------------------------------------------------------
// FakeBackupTool
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeBackupTool {
    pub stanzas: RefCell<Vec<String>>,
    pub backups: RefCell<Vec<(String, BackupType)>>,
    fail_stanza: RefCell<Option<String>>,
    fail_backup: RefCell<Option<String>>,
}

impl FakeBackupTool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_stanza_create(&self, message: Option<&str>) {
        *self.fail_stanza.borrow_mut() = message.map(str::to_string);
    }

    pub fn fail_backups(&self, message: Option<&str>) {
        *self.fail_backup.borrow_mut() = message.map(str::to_string);
    }

    pub fn backup_types(&self) -> Vec<BackupType> {
        self.backups.borrow().iter().map(|(_, t)| *t).collect()
    }
}

impl BackupTool for FakeBackupTool {
    fn create_stanza(&self, stanza: &str) -> Result<()> {
        if let Some(message) = self.fail_stanza.borrow().clone() {
            return Err(RepokeepError::backup(stanza, message));
        }
        self.stanzas.borrow_mut().push(stanza.to_string());
        Ok(())
    }

    fn run_backup(&self, stanza: &str, backup_type: BackupType) -> Result<()> {
        if let Some(message) = self.fail_backup.borrow().clone() {
            return Err(RepokeepError::backup(stanza, message));
        }
        self.backups
            .borrow_mut()
            .push((stanza.to_string(), backup_type));
        Ok(())
    }

    fn info(&self, stanza: &str) -> Result<CatalogInfo> {
        let backups = self
            .backups
            .borrow()
            .iter()
            .filter(|(s, _)| s == stanza)
            .enumerate()
            .map(|(i, (s, t))| Backup {
                label: format!("backup-{i}"),
                backup_type: *t,
                stanza: s.clone(),
                taken_at: DateTime::<Utc>::from_timestamp(i as i64, 0).unwrap_or_default(),
            })
            .collect();
        Ok(CatalogInfo {
            stanza: stanza.to_string(),
            backups,
        })
    }
}
