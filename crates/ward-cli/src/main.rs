mod cmd;
mod output;

use clap::{Parser, Subcommand};
use cmd::{audit::AuditSubcommand, config::ConfigSubcommand, snapshot::SnapshotSubcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "ward",
    about = "Offline tooling for the ward control plane: plan rollouts, check config, inspect state",
    version,
    propagate_version = true
)]
struct Cli {
    /// Config file (default: built-in defaults)
    #[arg(long, global = true, env = "WARD_CONFIG")]
    config: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    /// Log debug detail to stderr
    #[arg(long, global = true, short = 'v')]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Preview the admission waves of a dependency-aware rollout
    Plan {
        /// YAML file listing shards and their replica nodes
        #[arg(long)]
        topology: PathBuf,

        /// Comma-separated nodes to include (default: every replica node)
        #[arg(long, value_delimiter = ',')]
        nodes: Vec<String>,

        /// Override scheduler.max_concurrency
        #[arg(long)]
        max_concurrency: Option<usize>,
    },

    /// Validate or print the configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Inspect persisted cluster snapshots
    Snapshot {
        #[command(subcommand)]
        subcommand: SnapshotSubcommand,
    },

    /// Inspect and prune the action audit log
    Audit {
        #[command(subcommand)]
        subcommand: AuditSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = cli.config.as_deref();
    let result = match cli.command {
        Commands::Plan {
            topology,
            nodes,
            max_concurrency,
        } => cmd::plan::run(config, &topology, nodes, max_concurrency, cli.json),
        Commands::Config { subcommand } => cmd::config::run(config, subcommand, cli.json),
        Commands::Snapshot { subcommand } => cmd::snapshot::run(subcommand, cli.json),
        Commands::Audit { subcommand } => cmd::audit::run(subcommand, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
