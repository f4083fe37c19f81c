mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{
    config::ConfigSubcommand, init::InitArgs, run::RunArgs, slot::SlotSubcommand,
    state::StateSubcommand,
};
use repokeep_core::types::RunMode;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "repokeep",
    about = "Resumable replica backups with repository slot allocation and snapshot retention",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .repokeep/)
    #[arg(long, global = true, env = "REPOKEEP_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create .repokeep/config.yaml and the state location
    Init(InitArgs),

    /// Run the orchestrator in setup or scheduled mode
    Run(RunArgs),

    /// Show which steps a run would execute today, without contacting any host
    Plan {
        #[arg(long, default_value = "scheduled")]
        mode: RunMode,
        /// Treat this step as forced
        #[arg(long)]
        force_step: Option<String>,
    },

    /// Inspect or reset persisted state
    State {
        #[command(subcommand)]
        subcommand: StateSubcommand,
    },

    /// Inspect repository slot assignment
    Slot {
        #[command(subcommand)]
        subcommand: SlotSubcommand,
    },

    /// Validate or print the configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Run(_) => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init(args) => cmd::init::run(&root, args),
        Commands::Run(args) => cmd::run::run(&root, args, cli.json),
        Commands::Plan { mode, force_step } => {
            cmd::plan::run(&root, mode, force_step.as_deref(), cli.json)
        }
        Commands::State { subcommand } => cmd::state::run(&root, subcommand, cli.json),
        Commands::Slot { subcommand } => cmd::slot::run(&root, subcommand, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
