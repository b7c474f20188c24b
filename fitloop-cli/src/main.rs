//! fitloop CLI: train the reference linear model and manage its checkpoints.

mod commands;

use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// fitloop: resumable epoch/batch training with checkpoint retention
#[derive(Parser, Debug)]
#[command(name = "fitloop", version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Run directory (overrides `workdir` from the configuration)
    #[arg(short, long, global = true)]
    workdir: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only report errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Train the reference linear model on synthetic data
    Train(commands::TrainArgs),
    /// Inspect or prune saved checkpoints
    Snapshots {
        #[command(subcommand)]
        action: SnapshotAction,
    },
    /// Inspect or create configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
pub enum SnapshotAction {
    /// List checkpoints and whether they load cleanly
    List,
    /// Remove checkpoints outside the retention set
    Cleanup {
        /// Override `snapshots.num_keep`
        #[arg(short = 'n', long)]
        num_keep: Option<usize>,
        /// Report what would be removed without deleting anything
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(clap::Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Write the default configuration to a file
    Init {
        #[arg(default_value = "fitloop.toml")]
        path: PathBuf,
    },
}

fn level_filter(verbose: u8, quiet: bool) -> &'static str {
    match verbose {
        0 if quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Human-readable stderr logging, plus JSON file logging when `log_dir` is given.
fn init_tracing(verbose: u8, quiet: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(EnvFilter::new(level_filter(verbose, quiet)));

    let log_dir = log_dir.and_then(|dir| std::fs::create_dir_all(dir).ok().map(|_| dir));
    let (json_layer, guard) = match log_dir {
        Some(dir) => {
            let file_name = format!("fitlog_{}.log", chrono::Local::now().format("%Y%m%d_%H%M%S"));
            let file_appender = tracing_appender::rolling::never(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(EnvFilter::new("debug"));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();
    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config = commands::resolve_config(&cli)?;

    let log_dir = match &cli.command {
        Commands::Train(_) if !config.dry_run => Some(config.workdir.join("logs")),
        _ => None,
    };
    let _guard = init_tracing(cli.verbose, cli.quiet, log_dir.as_deref());

    commands::handle_command(cli.command, config).await
}
