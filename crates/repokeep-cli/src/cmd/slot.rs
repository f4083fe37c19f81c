use crate::output::print_json;
use anyhow::Context;
use clap::Subcommand;
use repokeep_core::{
    config::Config,
    remote::channel_for,
    slot::RepositorySlotAllocator,
    state::{self, keys},
};
use std::path::Path;

#[derive(Subcommand)]
pub enum SlotSubcommand {
    /// Show the slot this source owns or would be given (read-only)
    Show,
}

pub fn run(root: &Path, subcmd: SlotSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        SlotSubcommand::Show => show(root, json),
    }
}

fn show(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let dest = &config.destination;
    let allocator = RepositorySlotAllocator::new(&dest.slot_prefix, &dest.owner_attribute)?;
    let channel = channel_for(&config.transport)?;
    let assignment = allocator.allocate(
        channel.as_ref(),
        &dest.host,
        &dest.config_path,
        &config.source.identity,
    )?;
    let recorded = state::open_store(root, config.state.backend)
        .context("failed to open state")?
        .get(keys::REPO_SLOT);

    if json {
        return print_json(&serde_json::json!({
            "destination": dest.host,
            "config_path": dest.config_path,
            "assignment": assignment,
            "recorded": recorded,
        }));
    }

    let status = if assignment.existing { "owned" } else { "next free" };
    println!(
        "{}: slot {} ({status}) in {}:{}",
        assignment.owner_identity, assignment.slot_number, dest.host, dest.config_path
    );
    match recorded {
        Some(slot) if slot != assignment.slot_number.to_string() => {
            println!("warning: state records {} = {slot}", keys::REPO_SLOT);
        }
        Some(_) => println!("state agrees: {} = {}", keys::REPO_SLOT, assignment.slot_number),
        None => println!("no slot recorded in state yet"),
    }
    Ok(())
}
