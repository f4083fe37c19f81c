use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use repokeep_core::{config::Config, state};
use std::path::Path;

#[derive(Subcommand)]
pub enum StateSubcommand {
    /// List every persisted record
    Show,

    /// Remove one key, or every record when no key is given
    Reset {
        #[arg(long)]
        key: Option<String>,
    },
}

pub fn run(root: &Path, subcmd: StateSubcommand, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let mut store = state::open_store(root, config.state.backend).context("failed to open state")?;

    match subcmd {
        StateSubcommand::Show => {
            let records = store.list();
            if json {
                print_json(&records)?;
            } else if records.is_empty() {
                println!("No state recorded.");
            } else {
                let rows = records.into_iter().map(|r| vec![r.key, r.value]).collect();
                print_table(&["KEY", "VALUE"], rows);
            }
        }
        StateSubcommand::Reset { key: Some(key) } => {
            let removed = store
                .remove(&key)
                .with_context(|| format!("failed to remove {key}"))?;
            if json {
                print_json(&serde_json::json!({ "key": key, "removed": removed }))?;
            } else if removed {
                println!("Removed {key}.");
            } else {
                println!("{key} was not set.");
            }
        }
        StateSubcommand::Reset { key: None } => {
            let count = store.list().len();
            store.clear().context("failed to clear state")?;
            if json {
                print_json(&serde_json::json!({ "cleared": count }))?;
            } else {
                println!("Cleared {count} record(s).");
            }
        }
    }
    Ok(())
}
