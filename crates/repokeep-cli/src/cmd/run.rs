use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Args;
use repokeep_core::{
    backup_tool::PgBackRest,
    block_storage::AwsCliStorage,
    catalog::RemoteCatalog,
    clock::{SystemClock, WeeklySchedule},
    config::{Config, ConfigOverrides, WarnLevel},
    orchestrator::{Collaborators, Orchestrator, RunReport, RunRequest},
    remote::channel_for,
    runner::StepStatus,
    state,
    types::{BackupMode, RunMode},
};
use std::path::Path;

#[derive(Args)]
pub struct RunArgs {
    /// setup (first-time, all steps) or scheduled (backup, snapshot, retention)
    mode: RunMode,

    /// Primary database host
    #[arg(long)]
    primary: Option<String>,

    /// Host where the backup tool runs
    #[arg(long)]
    source_host: Option<String>,

    /// Owner identity used for slot allocation and snapshot tags
    #[arg(long)]
    identity: Option<String>,

    #[arg(long)]
    stanza: Option<String>,

    /// auto, full, or incremental
    #[arg(long)]
    backup_mode: Option<BackupMode>,

    /// Take a full backup now, even if today's backup already ran
    #[arg(long)]
    force_full: bool,

    #[arg(long)]
    skip_backup: bool,

    #[arg(long)]
    skip_snapshot: bool,

    /// Enable or disable snapshot retention for this run
    #[arg(long, value_name = "BOOL")]
    retention: Option<bool>,

    #[arg(long)]
    region: Option<String>,

    #[arg(long)]
    volume_id: Option<String>,

    /// Re-run this step even if it is marked complete
    #[arg(long)]
    force_step: Option<String>,
}

impl RunArgs {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            primary: self.primary.clone(),
            source_host: self.source_host.clone(),
            source_identity: self.identity.clone(),
            stanza: self.stanza.clone(),
            backup_mode: self.backup_mode,
            retention_enabled: self.retention,
            region: self.region.clone(),
            volume_id: self.volume_id.clone(),
        }
    }

    fn request(&self) -> RunRequest {
        RunRequest {
            mode: self.mode,
            skip_backup: self.skip_backup,
            skip_snapshot: self.skip_snapshot,
            force_full: self.force_full,
            force_step: self.force_step.clone(),
        }
    }
}

pub fn run(root: &Path, args: RunArgs, json: bool) -> anyhow::Result<()> {
    let mut config = Config::load(root).context("failed to load config")?;
    config.apply_overrides(&args.overrides());

    for w in config.validate() {
        if w.level == WarnLevel::Warning {
            tracing::warn!("{}", w.message);
        }
    }
    config.ensure_valid()?;
    if config.snapshot.enabled {
        AwsCliStorage::ensure_available()?;
    }

    let channel = channel_for(&config.transport)?;
    let backup_tool = PgBackRest::new(channel.as_ref(), config.source.host.clone());
    let catalog = RemoteCatalog::new(channel.as_ref(), &backup_tool);
    let storage = AwsCliStorage::new(config.snapshot.region.clone());
    let weekly = WeeklySchedule::new(config.backup.weekly_full_day);
    let backend = config.state.backend;

    let orchestrator = Orchestrator::new(
        config,
        Collaborators {
            channel: channel.as_ref(),
            catalog: &catalog,
            backup_tool: &backup_tool,
            storage: &storage,
            clock: &SystemClock,
            weekly: &weekly,
        },
    );
    let report = orchestrator.run(&args.request(), || state::open_store(root, backend))?;

    if json {
        print_json(&report)?;
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    println!(
        "{} run {} ({})",
        report.mode, report.run_id, report.run_date
    );
    let rows = report
        .steps
        .iter()
        .map(|s| {
            let (status, detail) = match &s.status {
                StepStatus::Skipped => ("skipped", "already complete".to_string()),
                StepStatus::Completed { artifacts } => (
                    "done",
                    artifacts
                        .iter()
                        .map(|(k, v)| format!("{k}={v}"))
                        .collect::<Vec<_>>()
                        .join(" "),
                ),
                StepStatus::NotApplicable { reason } => ("n/a", reason.clone()),
            };
            vec![s.name.clone(), status.to_string(), detail]
        })
        .collect();
    print_table(&["STEP", "STATUS", "DETAIL"], rows);

    if let Some(retention) = &report.retention {
        println!(
            "\nretention: examined {}, deleted {}, failed {}",
            retention.examined,
            retention.deleted_count(),
            retention.failures.len()
        );
        for f in &retention.failures {
            println!("  {}: {}", f.snapshot_id, f.message);
        }
    }
}
