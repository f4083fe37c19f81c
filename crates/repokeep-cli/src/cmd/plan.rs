use crate::output::{print_json, print_table};
use anyhow::Context;
use repokeep_core::{
    clock::{Clock, SystemClock},
    config::Config,
    orchestrator::plan,
    state::{self, keys},
    types::RunMode,
};
use std::path::Path;

pub fn run(root: &Path, mode: RunMode, force_step: Option<&str>, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let store = state::open_store(root, config.state.backend).context("failed to open state")?;
    let date = SystemClock.today();
    let setup_complete = store.is_set(keys::SETUP_COMPLETE);
    let steps = plan(&*store, mode, date, force_step);

    if json {
        let value = serde_json::json!({
            "mode": mode,
            "date": date,
            "setup_complete": setup_complete,
            "steps": steps,
        });
        return print_json(&value);
    }

    println!("{mode} plan for {date}");
    if mode == RunMode::Scheduled && !setup_complete {
        println!("setup has not completed; a scheduled run would stop before any step");
    }
    let rows = steps
        .iter()
        .map(|s| {
            vec![
                s.name.to_string(),
                format!("{:?}", s.phase).to_lowercase(),
                if s.will_run { "run" } else { "skip" }.to_string(),
                s.marker.clone(),
            ]
        })
        .collect();
    print_table(&["STEP", "PHASE", "ACTION", "MARKER"], rows);
    Ok(())
}
