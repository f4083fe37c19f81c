use anyhow::Context;
use clap::Args;
use repokeep_core::{
    config::{Config, StateBackend, TransportKind},
    io, paths,
};
use std::path::Path;

const STATE_FILE_HEADER: &str = "# repokeep state: KEY=VALUE, one record per line\n";

#[derive(Args)]
pub struct InitArgs {
    /// Owner identity recorded in the destination (usually this source's address)
    #[arg(long, default_value = "localhost")]
    identity: String,

    /// Host where the backup tool runs
    #[arg(long, default_value = "localhost")]
    source_host: String,

    /// Primary database host
    #[arg(long, default_value = "localhost")]
    primary: String,

    /// Host holding the shared backup-tool configuration
    #[arg(long, default_value = "localhost")]
    destination_host: String,

    /// Path of the shared backup-tool configuration on the destination
    #[arg(long)]
    destination_config: Option<String>,

    #[arg(long, default_value = "main")]
    stanza: String,

    /// Remote transport: ssh or local
    #[arg(long, default_value = "ssh", value_parser = parse_transport)]
    transport: TransportKind,

    /// State backend: file or redb
    #[arg(long, default_value = "file", value_parser = parse_backend)]
    state_backend: StateBackend,

    /// Block-storage volume to snapshot
    #[arg(long)]
    volume_id: Option<String>,

    /// Disable snapshots and snapshot retention
    #[arg(long)]
    no_snapshots: bool,
}

fn parse_transport(s: &str) -> Result<TransportKind, String> {
    match s {
        "ssh" => Ok(TransportKind::Ssh),
        "local" => Ok(TransportKind::Local),
        other => Err(format!("unknown transport '{other}' (expected ssh or local)")),
    }
}

fn parse_backend(s: &str) -> Result<StateBackend, String> {
    match s {
        "file" => Ok(StateBackend::File),
        "redb" => Ok(StateBackend::Redb),
        other => Err(format!("unknown state backend '{other}' (expected file or redb)")),
    }
}

pub fn run(root: &Path, args: InitArgs) -> anyhow::Result<()> {
    println!("Initializing repokeep in: {}", root.display());

    let dir = paths::repokeep_dir(root);
    io::ensure_dir(&dir).with_context(|| format!("failed to create {}", dir.display()))?;

    let config_path = paths::config_path(root);
    let backend = if config_path.exists() {
        println!("  exists:  {}", paths::CONFIG_FILE);
        Config::load(root).context("failed to load config")?.state.backend
    } else {
        let mut cfg = Config::new(
            args.identity,
            args.source_host,
            args.primary,
            args.destination_host,
        );
        cfg.stanza = args.stanza;
        if let Some(path) = args.destination_config {
            cfg.destination.config_path = path;
        }
        cfg.transport.kind = args.transport;
        cfg.state.backend = args.state_backend;
        cfg.snapshot.volume_id = args.volume_id;
        if args.no_snapshots {
            cfg.snapshot.enabled = false;
        }
        cfg.save(root).context("failed to write config.yaml")?;
        println!("  created: {}", paths::CONFIG_FILE);
        cfg.state.backend
    };

    match backend {
        StateBackend::File => {
            let created = io::write_if_missing(&paths::state_path(root), STATE_FILE_HEADER.as_bytes())
                .context("failed to create state file")?;
            let verb = if created { "created:" } else { "exists: " };
            println!("  {verb} {}", paths::STATE_FILE);
        }
        StateBackend::Redb => {
            repokeep_core::state::open_store(root, backend).context("failed to create state database")?;
            println!("  ready:   {}", paths::STATE_DB_FILE);
        }
    }

    println!("\nNext: review {}, then run 'repokeep config validate'.", paths::CONFIG_FILE);
    Ok(())
}
