//! CLI subcommand handlers.

use crate::{Cli, Commands, ConfigAction, SnapshotAction};
use figment::providers::Serialized;
use fitloop_core::config::{self, FitConfig};
use fitloop_core::harness::{Harness, HarnessState, Loaders, ResetMode};
use fitloop_core::monitor::Monitor;
use fitloop_core::snapshot::SnapshotManager;
use fitloop_core::toy::{LinearModel, MseCriterion, Sgd, VecLoader};
use std::collections::BTreeMap;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

type ToyHarness = Harness<LinearModel, MseCriterion, Sgd, VecLoader>;

/// How to treat checkpoints from an earlier run.
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResetArg {
    #[default]
    Resume,
    Restart,
    Delete,
}

impl From<ResetArg> for ResetMode {
    fn from(arg: ResetArg) -> Self {
        match arg {
            ResetArg::Resume => ResetMode::Resume,
            ResetArg::Restart => ResetMode::Restart,
            ResetArg::Delete => ResetMode::Delete,
        }
    }
}

#[derive(clap::Args, Debug)]
pub struct TrainArgs {
    /// Override `monitor.max_epoch`
    #[arg(long)]
    pub max_epoch: Option<usize>,

    /// Override `monitor.patience`
    #[arg(long)]
    pub patience: Option<usize>,

    /// Override `dynamics.batch_step`
    #[arg(long)]
    pub batch_step: Option<usize>,

    /// Existing checkpoints: resume, restart, delete
    #[arg(long, value_enum, default_value_t = ResetArg::Resume)]
    pub reset: ResetArg,

    /// Run without writing checkpoints or log files
    #[arg(long)]
    pub dry_run: bool,

    /// Initial learning rate
    #[arg(long, default_value_t = 0.05)]
    pub lr: f64,

    #[arg(long, default_value_t = 0.0)]
    pub momentum: f64,

    /// Number of input features of the synthetic problem
    #[arg(long, default_value_t = 4)]
    pub features: usize,

    #[arg(long, default_value_t = 16)]
    pub train_batches: usize,

    /// Validation batches (0 disables validation)
    #[arg(long, default_value_t = 4)]
    pub vali_batches: usize,

    /// Test batches (0 disables testing)
    #[arg(long, default_value_t = 0)]
    pub test_batches: usize,

    #[arg(long, default_value_t = 32)]
    pub batch_size: usize,

    /// Amplitude of the uniform label noise
    #[arg(long, default_value_t = 0.1)]
    pub noise: f64,

    #[arg(long, default_value_t = 0)]
    pub seed: u64,
}

/// Layer CLI flags over the file/environment configuration.
pub fn resolve_config(cli: &Cli) -> anyhow::Result<FitConfig> {
    if let Some(path) = &cli.config {
        anyhow::ensure!(path.exists(), "Config file {} does not exist", path.display());
    }
    let mut figment = config::base_figment(cli.config.as_deref());
    if let Some(workdir) = &cli.workdir {
        figment = figment.merge(Serialized::default("workdir", workdir));
    }
    if let Commands::Train(args) = &cli.command {
        if let Some(max_epoch) = args.max_epoch {
            figment = figment.merge(Serialized::default("monitor.max_epoch", max_epoch));
        }
        if let Some(patience) = args.patience {
            figment = figment.merge(Serialized::default("monitor.patience", patience));
        }
        if let Some(batch_step) = args.batch_step {
            figment = figment.merge(Serialized::default("dynamics.batch_step", batch_step));
        }
        if args.dry_run {
            figment = figment.merge(Serialized::default("dry_run", true));
        }
    }
    config::extract(figment).map_err(|e| anyhow::anyhow!("Configuration error: {e}"))
}

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, config: FitConfig) -> anyhow::Result<ExitCode> {
    match command {
        Commands::Train(args) => train(args, config).await,
        Commands::Snapshots { action } => {
            handle_snapshots(action, &config)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Config { action } => {
            handle_config(action, &config)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Process exit status for a finished run: 0 completed, 130 cancelled, 1 otherwise.
pub fn exit_status(state: HarnessState) -> u8 {
    match state {
        HarnessState::Completed(_) => 0,
        HarnessState::Terminated => 130,
        _ => 1,
    }
}

/// Alternating-sign coefficients the synthetic targets are drawn from.
fn true_weights(features: usize) -> Vec<f64> {
    (0..features)
        .map(|i| {
            let sign = if i % 2 == 0 { 1.0 } else { -1.0 };
            sign * (1.0 + i as f64 * 0.5)
        })
        .collect()
}

fn build_harness(args: &TrainArgs, config: FitConfig) -> anyhow::Result<ToyHarness> {
    anyhow::ensure!(args.features > 0, "--features must be > 0");
    anyhow::ensure!(args.batch_size > 0, "--batch-size must be > 0");
    anyhow::ensure!(args.train_batches > 0, "--train-batches must be > 0");

    let truth = true_weights(args.features);
    let synthetic = |batches: usize, seed: u64| {
        VecLoader::synthetic(batches, args.batch_size, &truth, 0.5, args.noise, seed)
    };

    let mut loaders = Loaders::new(synthetic(args.train_batches, args.seed));
    if args.vali_batches > 0 {
        loaders = loaders.with_vali(synthetic(args.vali_batches, args.seed.wrapping_add(1)));
    }
    if args.test_batches > 0 {
        loaders = loaders.with_test(synthetic(args.test_batches, args.seed.wrapping_add(2)));
    }

    let optimizer = Sgd::new(args.lr).with_momentum(args.momentum);
    Ok(Harness::new(
        config,
        LinearModel::zeros(args.features),
        MseCriterion,
        optimizer,
        loaders,
    )?)
}

async fn train(args: TrainArgs, config: FitConfig) -> anyhow::Result<ExitCode> {
    let reset = ResetMode::from(args.reset);
    let token = CancellationToken::new();
    let mut harness = build_harness(&args, config)?.with_cancellation(token.clone());

    let interrupt = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping at the next batch boundary");
            interrupt.cancel();
        }
    });

    let outcome = tokio::task::spawn_blocking(move || {
        harness.initialize(reset)?;
        harness.run()
    })
    .await?;

    let summary = outcome?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(ExitCode::from(exit_status(summary.state)))
}

fn handle_snapshots(action: SnapshotAction, config: &FitConfig) -> anyhow::Result<()> {
    match action {
        SnapshotAction::List => {
            let mgr = SnapshotManager::new(&config.workdir, config.snapshots.clone(), false);
            let found = mgr.list()?;
            if found.is_empty() {
                println!("No checkpoints in {}", mgr.dir().display());
                return Ok(());
            }
            println!("{:>8}  {:<8}  PATH", "EPOCH", "STATUS");
            for (epoch, path) in found {
                let status = match mgr.load(&path) {
                    Ok(_) => "ok",
                    Err(e) if e.is_corrupt() => "corrupt",
                    Err(_) => "error",
                };
                println!("{epoch:>8}  {status:<8}  {}", path.display());
            }
            let best = mgr.best_path();
            if best.exists() {
                match mgr.load(&best) {
                    Ok(checkpoint) => {
                        println!("best: epoch {} ({})", checkpoint.epoch, best.display())
                    }
                    Err(e) => println!("best: unreadable ({e})"),
                }
            }
            Ok(())
        }
        SnapshotAction::Cleanup { num_keep, dry_run } => {
            let mut snapshots = config.snapshots.clone();
            if let Some(n) = num_keep {
                anyhow::ensure!(n > 0, "--num-keep must be > 0");
                snapshots.num_keep = n;
            }
            let mgr = SnapshotManager::new(&config.workdir, snapshots, dry_run || config.dry_run);
            let best_epochs = best_epochs_on_disk(&mgr, config)?;
            let removed = mgr.cleanup(&best_epochs)?;
            let verb = if mgr.is_dry_run() {
                "Would remove"
            } else {
                "Removed"
            };
            println!("{verb} {} checkpoint(s): {removed:?}", removed.len());
            Ok(())
        }
    }
}

/// Best-epoch rankings from the newest checkpoint that loads.
fn best_epochs_on_disk(
    mgr: &SnapshotManager,
    config: &FitConfig,
) -> anyhow::Result<BTreeMap<String, Vec<usize>>> {
    let mut monitor = Monitor::new(&config.monitor)?;
    for (epoch, path) in mgr.list()?.into_iter().rev() {
        match mgr.load(&path) {
            Ok(checkpoint) => {
                monitor.load_state_dict(checkpoint.monitor_state);
                break;
            }
            Err(err) => tracing::warn!(epoch, error = %err, "Skipping unreadable checkpoint"),
        }
    }
    Ok(monitor.best_epochs())
}

fn handle_config(action: ConfigAction, config: &FitConfig) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            println!("{}", config.to_toml_string()?);
            Ok(())
        }
        ConfigAction::Init { path } => {
            if path.exists() {
                println!("Configuration file already exists at: {}", path.display());
                return Ok(());
            }
            std::fs::write(&path, FitConfig::default().to_toml_string()?)?;
            println!("Created default configuration at: {}", path.display());
            Ok(())
        }
    }
}
