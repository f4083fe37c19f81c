//! The backup orchestrator: prerequisites, the step list, and the run loop.
//!
//! Setup mode runs every step; scheduled mode runs only the recurring tail.
//!
//! | step                  | phase     | produces                  |
//! |-----------------------|-----------|---------------------------|
//! | `allocate_slot`       | setup     | `REPO_SLOT`               |
//! | `register_slot`       | setup     |                           |
//! | `create_stanza`       | setup     |                           |
//! | `mark_setup_complete` | setup     | `SETUP_COMPLETE`          |
//! | `backup`              | recurring | `LAST_BACKUP_TYPE`/`_DATE` |
//! | `snapshot`            | recurring | `LAST_SNAPSHOT_ID`        |
//! | `retention`           | recurring | `LAST_RETENTION_DELETED`  |

use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::{info, info_span, warn};
use uuid::Uuid;

use crate::backup_tool::BackupTool;
use crate::block_storage::BlockStorage;
use crate::catalog::CatalogQuery;
use crate::clock::{weekday_tag, Clock, WeeklyDayPolicy};
use crate::config::Config;
use crate::error::{RepokeepError, Result};
use crate::remote::{RemoteChannel, RemoteCommand};
use crate::runner::{
    active_steps, RunOptions, Step, StepContext, StepPhase, StepReport, StepResult, StepRunner,
};
use crate::selector::{needs_catalog, select_backup_type, SelectorInput};
use crate::slot::RepositorySlotAllocator;
use crate::snapshot::{RetentionReport, SnapshotLifecycleManager, SnapshotTags, WaitMode};
use crate::state::{keys, prune_stale_markers, StateStore};
use crate::types::{BackupDecision, BackupMode, BackupType, RunMode};

pub mod step_names {
    /// Reported as the failing step when a prerequisite check fails.
    pub const PREREQUISITES: &str = "prerequisites";
    pub const ALLOCATE_SLOT: &str = "allocate_slot";
    pub const REGISTER_SLOT: &str = "register_slot";
    pub const CREATE_STANZA: &str = "create_stanza";
    pub const MARK_SETUP_COMPLETE: &str = "mark_setup_complete";
    pub const BACKUP: &str = "backup";
    pub const SNAPSHOT: &str = "snapshot";
    pub const RETENTION: &str = "retention";
}

use step_names::*;

// ---------------------------------------------------------------------------
// Collaborators / requests
// ---------------------------------------------------------------------------

/// External systems the orchestrator talks to.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub channel: &'a dyn RemoteChannel,
    pub catalog: &'a dyn CatalogQuery,
    pub backup_tool: &'a dyn BackupTool,
    pub storage: &'a dyn BlockStorage,
    pub clock: &'a dyn Clock,
    pub weekly: &'a dyn WeeklyDayPolicy,
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub mode: RunMode,
    pub skip_backup: bool,
    pub skip_snapshot: bool,
    /// Take a full backup even if today's backup step already completed.
    pub force_full: bool,
    pub force_step: Option<String>,
}

impl RunRequest {
    pub fn new(mode: RunMode) -> Self {
        Self {
            mode,
            skip_backup: false,
            skip_snapshot: false,
            force_full: false,
            force_step: None,
        }
    }

    /// The single step whose completion marker is bypassed, if any.
    fn forced_step(&self) -> Result<Option<String>> {
        match (&self.force_step, self.force_full) {
            (Some(step), true) if step != BACKUP => Err(RepokeepError::Configuration(format!(
                "--force-full forces the backup step and cannot be combined with forcing '{step}'"
            ))),
            (_, true) => Ok(Some(BACKUP.to_string())),
            (step, false) => Ok(step.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub mode: RunMode,
    pub run_date: NaiveDate,
    pub steps: Vec<StepReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupDecision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention: Option<RetentionReport>,
}

impl RunReport {
    pub fn did_work(&self) -> bool {
        self.steps.iter().any(StepReport::did_work)
    }
}

/// One row of `plan` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedStep {
    pub name: &'static str,
    pub phase: StepPhase,
    pub marker: String,
    pub will_run: bool,
}

// ---------------------------------------------------------------------------
// Run context and step actions
// ---------------------------------------------------------------------------

struct RunContext<'r> {
    config: &'r Config,
    collab: Collaborators<'r>,
    request: &'r RunRequest,
    run_date: NaiveDate,
    now: DateTime<Utc>,
    is_weekly_day: bool,
    decision: Option<BackupDecision>,
    snapshot_id: Option<String>,
    retention: Option<RetentionReport>,
}

impl StepContext for RunContext<'_> {
    fn target_host(&self, step: &str) -> String {
        match step {
            ALLOCATE_SLOT | REGISTER_SLOT => self.config.destination.host.clone(),
            CREATE_STANZA | BACKUP => self.config.source.host.clone(),
            SNAPSHOT | RETENTION => match &self.config.snapshot.region {
                Some(region) => format!("block storage ({region})"),
                None => "block storage".to_string(),
            },
            _ => "local".to_string(),
        }
    }
}

impl RunContext<'_> {
    fn allocator(&self) -> Result<RepositorySlotAllocator> {
        RepositorySlotAllocator::new(
            &self.config.destination.slot_prefix,
            &self.config.destination.owner_attribute,
        )
    }

    fn explicit_mode(&self) -> BackupMode {
        if self.request.force_full {
            BackupMode::Full
        } else if self.request.mode == RunMode::Setup {
            BackupMode::Setup
        } else {
            self.config.backup.mode
        }
    }

    /// Type of the backup taken today: from this run, or from state when the
    /// backup step completed in an earlier run.
    fn todays_backup(&self, state: &dyn StateStore) -> Option<BackupDecision> {
        if let Some(decision) = self.decision {
            return Some(decision);
        }
        let date = state.get(keys::LAST_BACKUP_DATE);
        let kind = state.get(keys::LAST_BACKUP_TYPE)?;
        if kind == BackupDecision::Skip.as_str() {
            return Some(BackupDecision::Skip);
        }
        if date.as_deref() != Some(self.run_date.to_string().as_str()) {
            return None;
        }
        match kind.parse::<BackupType>().ok()? {
            BackupType::Full => Some(BackupDecision::Full),
            BackupType::Incremental => Some(BackupDecision::Incremental),
        }
    }
}

fn allocate_slot(ctx: &mut RunContext<'_>, _state: &dyn StateStore) -> Result<StepResult> {
    let dest = &ctx.config.destination;
    let assignment = ctx.allocator()?.allocate(
        ctx.collab.channel,
        &dest.host,
        &dest.config_path,
        &ctx.config.source.identity,
    )?;
    Ok(StepResult::artifact(
        keys::REPO_SLOT,
        assignment.slot_number.to_string(),
    ))
}

fn register_slot(ctx: &mut RunContext<'_>, state: &dyn StateStore) -> Result<StepResult> {
    let slot: u32 = state
        .get(keys::REPO_SLOT)
        .and_then(|v| v.trim().parse().ok())
        .filter(|n| *n > 0)
        .ok_or_else(|| {
            RepokeepError::Allocation(format!(
                "{} is missing or invalid; allocate again with \
                 'repokeep run setup --force-step {ALLOCATE_SLOT}'",
                keys::REPO_SLOT
            ))
        })?;
    let dest = &ctx.config.destination;
    let written = ctx.allocator()?.register(
        ctx.collab.channel,
        &dest.host,
        &dest.config_path,
        ctx.config.destination_section(),
        slot,
        &ctx.config.source.identity,
        &[("path", dest.data_path.as_str())],
    )?;
    if !written {
        info!(slot, "slot entries already present");
    }
    Ok(StepResult::done())
}

fn create_stanza(ctx: &mut RunContext<'_>, _state: &dyn StateStore) -> Result<StepResult> {
    ctx.collab.backup_tool.create_stanza(&ctx.config.stanza)?;
    Ok(StepResult::done())
}

fn mark_setup_complete(_ctx: &mut RunContext<'_>, _state: &dyn StateStore) -> Result<StepResult> {
    Ok(StepResult::artifact(keys::SETUP_COMPLETE, "true"))
}

fn backup(ctx: &mut RunContext<'_>, _state: &dyn StateStore) -> Result<StepResult> {
    let explicit_mode = ctx.explicit_mode();
    let skip_requested = ctx.request.skip_backup;
    let catalog_has_full_backup =
        if needs_catalog(explicit_mode, skip_requested, ctx.is_weekly_day) {
            ctx.collab
                .catalog
                .catalog_has_full_backup(&ctx.config.stanza)?
        } else {
            false
        };
    let decision = select_backup_type(SelectorInput {
        explicit_mode,
        skip_requested,
        is_designated_weekly_day: ctx.is_weekly_day,
        catalog_has_full_backup,
    });
    info!(%explicit_mode, weekly_day = ctx.is_weekly_day, %decision, "backup type selected");
    ctx.decision = Some(decision);

    let Some(backup_type) = decision.backup_type() else {
        return Ok(StepResult::artifact(keys::LAST_BACKUP_TYPE, decision.as_str()));
    };
    ctx.collab
        .backup_tool
        .run_backup(&ctx.config.stanza, backup_type)?;
    Ok(StepResult::Done(vec![
        (keys::LAST_BACKUP_TYPE.to_string(), backup_type.as_str().to_string()),
        (keys::LAST_BACKUP_DATE.to_string(), ctx.run_date.to_string()),
    ]))
}

fn snapshot(ctx: &mut RunContext<'_>, state: &dyn StateStore) -> Result<StepResult> {
    let cfg = &ctx.config.snapshot;
    if !cfg.enabled {
        return Ok(StepResult::NotApplicable("snapshots disabled".into()));
    }
    if ctx.request.skip_snapshot {
        return Ok(StepResult::NotApplicable("snapshot skipped by request".into()));
    }
    let backup_type = match ctx.todays_backup(state) {
        Some(BackupDecision::Skip) => {
            return Ok(StepResult::NotApplicable("backup was skipped".into()))
        }
        Some(decision) => decision.backup_type(),
        None => None,
    };
    let Some(backup_type) = backup_type else {
        return Ok(StepResult::NotApplicable("no backup recorded for this run date".into()));
    };
    let volume_id = cfg
        .volume_id
        .as_deref()
        .ok_or_else(|| RepokeepError::Configuration("snapshot.volume_id is not set".into()))?;

    let tags = SnapshotTags {
        source: ctx.config.source.identity.clone(),
        backup_type,
        stanza: ctx.config.stanza.clone(),
        day_of_week: weekday_tag(ctx.run_date),
    };
    let wait = if ctx.request.mode == RunMode::Setup && cfg.wait_on_setup {
        WaitMode::Synchronous {
            poll_interval: Duration::from_secs(cfg.poll_interval_secs),
        }
    } else {
        WaitMode::Background
    };
    let manager = SnapshotLifecycleManager::new(ctx.collab.storage, &ctx.config.source.identity);
    let recorded = state.get(keys::LAST_SNAPSHOT_ID);
    let id = manager.adopt_or_create(
        volume_id,
        &tags,
        ctx.now - chrono::Duration::days(1),
        recorded.as_deref(),
        wait,
    )?;
    ctx.snapshot_id = Some(id.clone());
    Ok(StepResult::artifact(keys::LAST_SNAPSHOT_ID, id))
}

fn retention(ctx: &mut RunContext<'_>, _state: &dyn StateStore) -> Result<StepResult> {
    if !ctx.config.retention.enabled {
        return Ok(StepResult::NotApplicable("retention disabled".into()));
    }
    if !ctx.config.snapshot.enabled {
        return Ok(StepResult::NotApplicable("snapshots disabled".into()));
    }
    let manager = SnapshotLifecycleManager::new(ctx.collab.storage, &ctx.config.source.identity);
    let report =
        manager.apply_retention(&ctx.config.retention.policy(), ctx.now, ctx.is_weekly_day)?;
    if !report.failures.is_empty() {
        warn!(
            deleted = report.deleted_count(),
            failed = report.failures.len(),
            "retention finished with failures"
        );
    }
    let deleted = report.deleted_count();
    ctx.retention = Some(report);
    Ok(StepResult::artifact(
        keys::LAST_RETENTION_DELETED,
        deleted.to_string(),
    ))
}

fn steps<'r>() -> Vec<Step<RunContext<'r>>> {
    vec![
        Step::setup(ALLOCATE_SLOT, allocate_slot),
        Step::setup(REGISTER_SLOT, register_slot),
        Step::setup(CREATE_STANZA, create_stanza),
        Step::setup(MARK_SETUP_COMPLETE, mark_setup_complete),
        Step::recurring(BACKUP, backup),
        Step::recurring(SNAPSHOT, snapshot),
        Step::recurring(RETENTION, retention),
    ]
}

/// Which steps a run in `mode` on `date` would execute, from state alone.
pub fn plan(
    state: &dyn StateStore,
    mode: RunMode,
    date: NaiveDate,
    force_step: Option<&str>,
) -> Vec<PlannedStep> {
    let all = steps();
    active_steps(&all, mode)
        .map(|step| {
            let marker = step.marker_key(date);
            let will_run = force_step == Some(step.name) || !state.is_set(&marker);
            PlannedStep {
                name: step.name,
                phase: step.phase,
                marker,
                will_run,
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

fn prerequisite_failed(host: &str, source: RepokeepError) -> RepokeepError {
    RepokeepError::Step {
        step: PREREQUISITES.to_string(),
        host: host.to_string(),
        source: Box::new(source),
    }
}

pub struct Orchestrator<'a> {
    config: Config,
    collab: Collaborators<'a>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(config: Config, collab: Collaborators<'a>) -> Self {
        Self { config, collab }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Fatal checks that run before any state is read or written. Failures
    /// are reported as the `prerequisites` step on the host that failed.
    pub fn check_prerequisites(&self) -> Result<()> {
        self.config
            .ensure_valid()
            .map_err(|e| prerequisite_failed("local", e))?;

        let source = &self.config.source.host;
        let is_replica = self
            .collab
            .catalog
            .is_replica_role(source)
            .map_err(|e| prerequisite_failed(source, e))?;
        if !is_replica {
            return Err(prerequisite_failed(
                source,
                RepokeepError::Configuration(format!(
                    "{source} is not running as a replica; backups must be taken from a replica"
                )),
            ));
        }

        let primary = &self.config.source.primary;
        let out = self
            .collab
            .channel
            .execute(primary, &RemoteCommand::Ping)
            .map_err(|e| prerequisite_failed(primary, e))?;
        if !out.success() {
            return Err(prerequisite_failed(
                primary,
                RepokeepError::connectivity(
                    primary,
                    format!("primary did not answer: {}", out.diagnostic()),
                ),
            ));
        }
        Ok(())
    }

    /// Run every applicable step. `open_state` is called only after the
    /// prerequisites pass.
    pub fn run<S, F>(&self, request: &RunRequest, open_state: F) -> Result<RunReport>
    where
        S: StateStore,
        F: FnOnce() -> Result<S>,
    {
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("run", run_id = %run_id, mode = %request.mode);
        let _enter = span.enter();

        let force_step = request.forced_step()?;
        self.check_prerequisites()?;

        let mut state = open_state()?;
        let now = self.collab.clock.now();
        let run_date = self.collab.clock.today();

        if request.mode == RunMode::Setup || state.is_set(keys::SETUP_COMPLETE) {
            let pruned = prune_stale_markers(&mut state, run_date)?;
            if !pruned.is_empty() {
                info!(count = pruned.len(), "pruned step markers from earlier days");
            }
        }

        let mut ctx = RunContext {
            config: &self.config,
            collab: self.collab,
            request,
            run_date,
            now,
            is_weekly_day: self.collab.weekly.is_designated(run_date),
            decision: None,
            snapshot_id: None,
            retention: None,
        };
        let opts = RunOptions {
            mode: request.mode,
            run_date,
            force_step,
        };
        info!(%run_date, weekly_day = ctx.is_weekly_day, "run started");
        let reports = StepRunner::new(&mut state).run(&steps(), &mut ctx, &opts)?;
        info!(
            completed = reports.iter().filter(|r| r.did_work()).count(),
            "run finished"
        );

        Ok(RunReport {
            run_id,
            mode: request.mode,
            run_date,
            steps: reports,
            backup: ctx.decision,
            snapshot_id: ctx.snapshot_id,
            retention: ctx.retention,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{FixedClock, WeeklySchedule};
    use crate::runner::StepStatus;
    use crate::snapshot::Snapshot;
    use crate::state::MemoryStateStore;
    use crate::testing::{FakeBackupTool, FakeCatalog, FakeChannel, FakeStorage};
    use chrono::{TimeZone, Weekday};
    use std::cell::Cell;

    const DEST_CONF: &str = "/etc/pgbackrest/pgbackrest.conf";

    struct Env {
        channel: FakeChannel,
        catalog: FakeCatalog,
        tool: FakeBackupTool,
        storage: FakeStorage,
        clock: FixedClock,
        weekly: WeeklySchedule,
    }

    impl Env {
        /// Thursday 2026-10-15, weekly day Sunday.
        fn new() -> Self {
            let clock = FixedClock(Utc.with_ymd_and_hms(2026, 10, 15, 2, 0, 0).unwrap());
            let storage = FakeStorage::new();
            storage.set_time(clock.0);
            let channel = FakeChannel::new();
            channel.put_file(
                "repo-host",
                DEST_CONF,
                "[global]\nrepo1-path=/var/lib/pgbackrest\n\n[main]\npg1-host=10.0.0.11\npg2-host=10.0.0.13\n",
            );
            Self {
                channel,
                catalog: FakeCatalog::new(true, false),
                tool: FakeBackupTool::new(),
                storage,
                clock,
                weekly: WeeklySchedule::new(Weekday::Sun),
            }
        }

        fn on(mut self, y: i32, m: u32, d: u32) -> Self {
            self.clock = FixedClock(Utc.with_ymd_and_hms(y, m, d, 2, 0, 0).unwrap());
            self.storage.set_time(self.clock.0);
            self
        }

        fn orchestrator(&self) -> Orchestrator<'_> {
            let mut config = Config::new("10.0.0.12", "replica-1", "primary-1", "repo-host");
            config.snapshot.volume_id = Some("vol-1".into());
            config.snapshot.poll_interval_secs = 0;
            Orchestrator::new(
                config,
                Collaborators {
                    channel: &self.channel,
                    catalog: &self.catalog,
                    backup_tool: &self.tool,
                    storage: &self.storage,
                    clock: &self.clock,
                    weekly: &self.weekly,
                },
            )
        }

        fn run(&self, state: &mut MemoryStateStore, request: &RunRequest) -> Result<RunReport> {
            self.orchestrator().run(request, || Ok(&mut *state))
        }
    }

    fn statuses(report: &RunReport) -> Vec<(&str, &StepStatus)> {
        report
            .steps
            .iter()
            .map(|s| (s.name.as_str(), &s.status))
            .collect()
    }

    #[test]
    fn setup_allocates_next_slot_and_takes_full_backup() {
        let env = Env::new();
        let mut state = MemoryStateStore::new();
        let report = env.run(&mut state, &RunRequest::new(RunMode::Setup)).unwrap();

        assert_eq!(state.get(keys::REPO_SLOT).as_deref(), Some("3"));
        let conf = env.channel.file("repo-host", DEST_CONF).unwrap();
        assert!(conf.contains("pg3-host=10.0.0.12"));
        assert!(conf.contains("pg3-path=/var/lib/postgresql/data"));

        assert_eq!(env.tool.stanzas.borrow().as_slice(), ["main"]);
        assert_eq!(env.tool.backup_types(), [BackupType::Full]);
        assert_eq!(report.backup, Some(BackupDecision::Full));
        // Setup waits for the snapshot.
        assert!(env.storage.describe_calls() >= 1);
        assert_eq!(state.get(keys::LAST_SNAPSHOT_ID), report.snapshot_id);
        assert!(state.is_set(keys::SETUP_COMPLETE));
        assert!(state.is_set("STEP_BACKUP@2026-10-15"));
        assert!(report.did_work());
    }

    #[test]
    fn second_run_same_day_does_nothing() {
        let env = Env::new();
        let mut state = MemoryStateStore::new();
        env.run(&mut state, &RunRequest::new(RunMode::Setup)).unwrap();
        let writes = env.channel.writes();
        let snapshots = env.storage.ids();

        let report = env.run(&mut state, &RunRequest::new(RunMode::Setup)).unwrap();
        assert!(!report.did_work());
        assert!(statuses(&report)
            .iter()
            .all(|(_, s)| **s == StepStatus::Skipped));
        assert_eq!(env.channel.writes(), writes);
        assert_eq!(env.tool.stanzas.borrow().len(), 1);
        assert_eq!(env.tool.backups.borrow().len(), 1);
        assert_eq!(env.storage.ids(), snapshots);
    }

    #[test]
    fn not_a_replica_fails_before_state_is_opened() {
        let env = Env::new();
        env.catalog.replica.set(false);
        let opened = Cell::new(false);
        let err = env
            .orchestrator()
            .run(&RunRequest::new(RunMode::Scheduled), || {
                opened.set(true);
                Ok(MemoryStateStore::new())
            })
            .unwrap_err();
        match &err {
            RepokeepError::Step { step, host, .. } => {
                assert_eq!(step, PREREQUISITES);
                assert_eq!(host, "replica-1");
            }
            other => panic!("expected Step error, got {other:?}"),
        }
        assert!(matches!(err.root_cause(), RepokeepError::Configuration(_)));
        assert!(err.to_string().contains("step 'prerequisites' failed on replica-1"));
        assert!(!opened.get());
        assert!(env.channel.commands().is_empty());
    }

    #[test]
    fn unreachable_primary_is_connectivity_error() {
        let env = Env::new();
        env.channel.unreachable("primary-1");
        let opened = Cell::new(false);
        let err = env
            .orchestrator()
            .run(&RunRequest::new(RunMode::Setup), || {
                opened.set(true);
                Ok(MemoryStateStore::new())
            })
            .unwrap_err();
        assert_eq!(err.category(), "connectivity");
        assert!(matches!(
            &err,
            RepokeepError::Step { step, host, .. } if step == PREREQUISITES && host == "primary-1"
        ));
        assert!(!opened.get());
    }

    #[test]
    fn failed_step_resumes_where_it_stopped() {
        let env = Env::new();
        env.tool.fail_stanza_create(Some("repo not writable"));
        let mut state = MemoryStateStore::new();
        let err = env
            .run(&mut state, &RunRequest::new(RunMode::Setup))
            .unwrap_err();
        match &err {
            RepokeepError::Step { step, host, .. } => {
                assert_eq!(step, CREATE_STANZA);
                assert_eq!(host, "replica-1");
            }
            other => panic!("expected Step error, got {other:?}"),
        }
        assert!(state.is_set("STEP_REGISTER_SLOT"));
        assert!(!state.is_set("STEP_CREATE_STANZA"));
        assert_eq!(env.channel.writes(), 1);

        env.tool.fail_stanza_create(None);
        let report = env.run(&mut state, &RunRequest::new(RunMode::Setup)).unwrap();
        let s = statuses(&report);
        assert_eq!(s[0], (ALLOCATE_SLOT, &StepStatus::Skipped));
        assert_eq!(s[1], (REGISTER_SLOT, &StepStatus::Skipped));
        assert!(report.steps[2].did_work());
        assert_eq!(env.channel.writes(), 1);
        assert!(state.is_set(keys::SETUP_COMPLETE));
    }

    #[test]
    fn scheduled_before_setup_fails() {
        let env = Env::new();
        let mut state = MemoryStateStore::new();
        let err = env
            .run(&mut state, &RunRequest::new(RunMode::Scheduled))
            .unwrap_err();
        assert!(err.to_string().contains("setup has not completed"));
        assert!(env.tool.backups.borrow().is_empty());
        assert!(state.list().is_empty());
    }

    #[test]
    fn scheduled_weekday_with_full_in_catalog_is_incremental_and_async() {
        let env = Env::new();
        let mut state = MemoryStateStore::new();
        env.run(&mut state, &RunRequest::new(RunMode::Setup)).unwrap();

        let env = env.on(2026, 10, 16);
        env.catalog.has_full.set(true);
        let describes = env.storage.describe_calls();
        let report = env
            .run(&mut state, &RunRequest::new(RunMode::Scheduled))
            .unwrap();
        assert_eq!(report.backup, Some(BackupDecision::Incremental));
        assert_eq!(
            env.tool.backup_types(),
            [BackupType::Full, BackupType::Incremental]
        );
        assert_eq!(env.storage.describe_calls(), describes);
        assert_eq!(report.steps.len(), 3);
        // Yesterday's recurring markers are gone.
        assert!(state.get("STEP_BACKUP@2026-10-15").is_none());
    }

    #[test]
    fn weekly_day_takes_full_without_consulting_catalog() {
        let env = Env::new();
        let mut state = MemoryStateStore::new();
        env.run(&mut state, &RunRequest::new(RunMode::Setup)).unwrap();

        let env = env.on(2026, 10, 18);
        env.catalog.has_full.set(true);
        let report = env
            .run(&mut state, &RunRequest::new(RunMode::Scheduled))
            .unwrap();
        assert_eq!(report.backup, Some(BackupDecision::Full));
        assert_eq!(env.catalog.catalog_calls.get(), 0);

        // Same day again: still full, nothing redone.
        let report = env
            .run(&mut state, &RunRequest::new(RunMode::Scheduled))
            .unwrap();
        assert!(!report.did_work());
        assert_eq!(state.get(keys::LAST_BACKUP_TYPE).as_deref(), Some("full"));
        assert_eq!(env.tool.backups.borrow().len(), 2);
    }

    #[test]
    fn force_full_reruns_todays_backup() {
        let env = Env::new();
        env.catalog.has_full.set(true);
        let mut state = MemoryStateStore::new();
        env.run(&mut state, &RunRequest::new(RunMode::Setup)).unwrap();

        let mut request = RunRequest::new(RunMode::Scheduled);
        request.force_full = true;
        let report = env.run(&mut state, &request).unwrap();
        assert_eq!(report.backup, Some(BackupDecision::Full));
        assert_eq!(env.tool.backup_types(), [BackupType::Full, BackupType::Full]);
        // Only the backup step was forced.
        assert_eq!(report.steps[1].status, StepStatus::Skipped);
    }

    #[test]
    fn force_full_conflicts_with_other_forced_step() {
        let env = Env::new();
        let mut request = RunRequest::new(RunMode::Setup);
        request.force_full = true;
        request.force_step = Some(RETENTION.to_string());
        let mut state = MemoryStateStore::new();
        let err = env.run(&mut state, &request).unwrap_err();
        assert!(matches!(err, RepokeepError::Configuration(_)));
    }

    #[test]
    fn skipped_backup_means_no_snapshot() {
        let env = Env::new();
        let mut state = MemoryStateStore::new();
        env.run(&mut state, &RunRequest::new(RunMode::Setup)).unwrap();

        let env = env.on(2026, 10, 16);
        let snapshots = env.storage.ids();
        let mut request = RunRequest::new(RunMode::Scheduled);
        request.skip_backup = true;
        let report = env.run(&mut state, &request).unwrap();
        assert_eq!(report.backup, Some(BackupDecision::Skip));
        assert_eq!(state.get(keys::LAST_BACKUP_TYPE).as_deref(), Some("skip"));
        assert!(matches!(
            report.steps[1].status,
            StepStatus::NotApplicable { .. }
        ));
        assert_eq!(env.storage.ids(), snapshots);
        assert_eq!(env.tool.backups.borrow().len(), 1);
    }

    #[test]
    fn retention_failures_do_not_fail_the_run() {
        let env = Env::new();
        let old = |id: &str, days: i64| Snapshot {
            id: id.to_string(),
            volume_id: "vol-1".into(),
            created_at: env.clock.0 - chrono::Duration::days(days),
            tags: SnapshotTags {
                source: "10.0.0.12".into(),
                backup_type: BackupType::Incremental,
                stanza: "main".into(),
                day_of_week: "mon".into(),
            },
        };
        env.storage.insert(old("old-a", 20));
        env.storage.insert(old("old-b", 21));
        env.storage.fail_delete("old-b");

        let mut state = MemoryStateStore::new();
        let report = env.run(&mut state, &RunRequest::new(RunMode::Setup)).unwrap();
        let retention = report.retention.unwrap();
        assert_eq!(retention.deleted, ["old-a"]);
        assert_eq!(retention.failures.len(), 1);
        assert_eq!(state.get(keys::LAST_RETENTION_DELETED).as_deref(), Some("1"));
        assert!(state.is_set("STEP_RETENTION@2026-10-15"));
    }

    #[test]
    fn interrupted_snapshot_wait_resumes_without_second_snapshot() {
        let env = Env::new();
        env.storage.pending_polls(2);
        env.storage.fail_describes(1);
        let mut state = MemoryStateStore::new();
        let err = env
            .run(&mut state, &RunRequest::new(RunMode::Setup))
            .unwrap_err();
        assert!(matches!(&err, RepokeepError::Step { step, .. } if step == SNAPSHOT));
        assert_eq!(env.storage.ids(), ["snap-0001"]);
        assert!(state.get(keys::LAST_SNAPSHOT_ID).is_none());

        let report = env.run(&mut state, &RunRequest::new(RunMode::Setup)).unwrap();
        assert_eq!(report.snapshot_id.as_deref(), Some("snap-0001"));
        assert_eq!(env.storage.ids(), ["snap-0001"]);
        assert_eq!(state.get(keys::LAST_SNAPSHOT_ID).as_deref(), Some("snap-0001"));
        assert_eq!(env.tool.backups.borrow().len(), 1);
    }

    #[test]
    fn forced_snapshot_takes_a_new_one() {
        let env = Env::new();
        let mut state = MemoryStateStore::new();
        env.run(&mut state, &RunRequest::new(RunMode::Setup)).unwrap();

        let mut request = RunRequest::new(RunMode::Setup);
        request.force_step = Some(SNAPSHOT.to_string());
        let report = env.run(&mut state, &request).unwrap();
        assert_eq!(report.snapshot_id.as_deref(), Some("snap-0002"));
        assert_eq!(env.storage.ids(), ["snap-0001", "snap-0002"]);
    }

    #[test]
    fn slot_claimed_by_another_source_recovers_by_forcing_allocation() {
        let env = Env::new();
        env.channel.put_file(
            "repo-host",
            DEST_CONF,
            "[main]\npg1-host=10.0.0.11\npg2-host=10.0.0.13\npg3-host=racer\n",
        );
        let mut state = MemoryStateStore::new();
        state.set("STEP_ALLOCATE_SLOT", "true").unwrap();
        state.set(keys::REPO_SLOT, "3").unwrap();

        let err = env
            .run(&mut state, &RunRequest::new(RunMode::Setup))
            .unwrap_err();
        assert!(matches!(&err, RepokeepError::Step { step, .. } if step == REGISTER_SLOT));
        assert_eq!(err.category(), "allocation");
        assert!(err.to_string().contains("claimed by 'racer'"));
        assert!(err.to_string().contains("--force-step allocate_slot"));

        let mut request = RunRequest::new(RunMode::Setup);
        request.force_step = Some(ALLOCATE_SLOT.to_string());
        env.run(&mut state, &request).unwrap();
        assert_eq!(state.get(keys::REPO_SLOT).as_deref(), Some("4"));
        let conf = env.channel.file("repo-host", DEST_CONF).unwrap();
        assert!(conf.contains("pg3-host=racer"));
        assert!(conf.contains("pg4-host=10.0.0.12"));
        assert!(state.is_set(keys::SETUP_COMPLETE));
    }

    #[test]
    fn plan_reports_pending_steps() {
        let mut state = MemoryStateStore::new();
        let date = NaiveDate::from_ymd_opt(2026, 10, 15).unwrap();
        state.set("STEP_ALLOCATE_SLOT", "true").unwrap();
        state.set("STEP_BACKUP@2026-10-15", "true").unwrap();

        let planned = plan(&state, RunMode::Setup, date, None);
        let will_run: Vec<&str> = planned
            .iter()
            .filter(|p| p.will_run)
            .map(|p| p.name)
            .collect();
        assert_eq!(
            will_run,
            [REGISTER_SLOT, CREATE_STANZA, MARK_SETUP_COMPLETE, SNAPSHOT, RETENTION]
        );

        let planned = plan(&state, RunMode::Scheduled, date, Some(BACKUP));
        assert_eq!(planned.len(), 3);
        assert!(planned[0].will_run);
    }
}
