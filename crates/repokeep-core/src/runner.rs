//! Ordered, resumable step execution.
//!
//! A step has two durable states: absent and complete. There is no
//! in-progress marker; a process that dies mid-step leaves it absent and the
//! next run repeats it, so every action must be safe to repeat.
//!
//! On success the runner writes the step's artifacts first and its
//! completion marker last. On failure it stops, leaves earlier markers
//! alone, and returns `RepokeepError::Step` naming the step and target host.

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{info, info_span};

use crate::error::{RepokeepError, Result};
use crate::state::{dated_step_key, keys, step_key, StateStore};
use crate::types::RunMode;

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    /// Runs once per installation.
    Setup,
    /// Runs once per calendar day.
    Recurring,
}

/// What an action produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    /// Work done; persist these artifacts then mark complete.
    Done(Vec<(String, String)>),
    /// Nothing to do this run. The step is left unmarked.
    NotApplicable(String),
}

impl StepResult {
    pub fn done() -> Self {
        Self::Done(Vec::new())
    }

    pub fn artifact(key: &str, value: impl Into<String>) -> Self {
        Self::Done(vec![(key.to_string(), value.into())])
    }
}

pub type StepAction<C> = fn(&mut C, &dyn StateStore) -> Result<StepResult>;

pub struct Step<C> {
    pub name: &'static str,
    pub phase: StepPhase,
    pub action: StepAction<C>,
}

impl<C> Step<C> {
    pub fn setup(name: &'static str, action: StepAction<C>) -> Self {
        Self {
            name,
            phase: StepPhase::Setup,
            action,
        }
    }

    pub fn recurring(name: &'static str, action: StepAction<C>) -> Self {
        Self {
            name,
            phase: StepPhase::Recurring,
            action,
        }
    }

    /// State key of this step's completion marker for a run on `date`.
    pub fn marker_key(&self, date: NaiveDate) -> String {
        match self.phase {
            StepPhase::Setup => step_key(self.name),
            StepPhase::Recurring => dated_step_key(self.name, date),
        }
    }
}

/// Context passed to every action. Supplies the host a step talks to, for
/// error reporting.
pub trait StepContext {
    fn target_host(&self, step: &str) -> String;
}

// ---------------------------------------------------------------------------
// Options / report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub mode: RunMode,
    pub run_date: NaiveDate,
    /// Bypass the completion check for this one step.
    pub force_step: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepStatus {
    Skipped,
    Completed { artifacts: Vec<(String, String)> },
    NotApplicable { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub name: String,
    pub phase: StepPhase,
    #[serde(flatten)]
    pub status: StepStatus,
}

impl StepReport {
    pub fn did_work(&self) -> bool {
        matches!(self.status, StepStatus::Completed { .. })
    }
}

/// Steps that `mode` executes, in order.
pub fn active_steps<C>(steps: &[Step<C>], mode: RunMode) -> impl Iterator<Item = &Step<C>> {
    steps
        .iter()
        .filter(move |s| mode == RunMode::Setup || s.phase == StepPhase::Recurring)
}

// ---------------------------------------------------------------------------
// StepRunner
// ---------------------------------------------------------------------------

pub struct StepRunner<'s> {
    state: &'s mut dyn StateStore,
}

impl<'s> StepRunner<'s> {
    pub fn new(state: &'s mut dyn StateStore) -> Self {
        Self { state }
    }

    pub fn run<C: StepContext>(
        &mut self,
        steps: &[Step<C>],
        ctx: &mut C,
        opts: &RunOptions,
    ) -> Result<Vec<StepReport>> {
        if opts.mode == RunMode::Scheduled && !self.state.is_set(keys::SETUP_COMPLETE) {
            return Err(RepokeepError::Configuration(
                "setup has not completed; run 'repokeep run setup' first".to_string(),
            ));
        }

        if let Some(forced) = &opts.force_step {
            if !active_steps(steps, opts.mode).any(|s| s.name == forced.as_str()) {
                return Err(RepokeepError::Configuration(format!(
                    "cannot force unknown step '{forced}' in {} mode",
                    opts.mode
                )));
            }
        }

        let mut reports = Vec::new();
        for step in active_steps(steps, opts.mode) {
            let marker = step.marker_key(opts.run_date);
            let forced = opts.force_step.as_deref() == Some(step.name);

            if !forced && self.state.is_set(&marker) {
                info!(step = step.name, "already complete; skipping");
                reports.push(StepReport {
                    name: step.name.to_string(),
                    phase: step.phase,
                    status: StepStatus::Skipped,
                });
                continue;
            }

            let span = info_span!("step", name = step.name);
            let _enter = span.enter();
            info!(forced, "running");

            let result = (step.action)(ctx, &*self.state).map_err(|e| RepokeepError::Step {
                step: step.name.to_string(),
                host: ctx.target_host(step.name),
                source: Box::new(e),
            })?;

            let status = match result {
                StepResult::Done(artifacts) => {
                    for (key, value) in &artifacts {
                        self.state.set(key, value)?;
                    }
                    self.state.set(&marker, "true")?;
                    info!(artifacts = artifacts.len(), "complete");
                    StepStatus::Completed { artifacts }
                }
                StepResult::NotApplicable(reason) => {
                    info!(%reason, "not applicable");
                    StepStatus::NotApplicable { reason }
                }
            };
            reports.push(StepReport {
                name: step.name.to_string(),
                phase: step.phase,
                status,
            });
        }
        Ok(reports)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
