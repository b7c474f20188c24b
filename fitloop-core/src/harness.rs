//! The training loop.
//!
//! [`Harness`] wires the monitor, scheduler, snapshot manager and batch
//! runner together at construction time and drives them across epochs. Each
//! epoch returns an explicit [`EpochOutcome`]; the outer driver turns that
//! into the terminal [`HarnessState`].

use crate::batch::{BatchContext, BatchRunner};
use crate::collab::{Batch, Criterion, Loader, Model, NoHooks, Optimizer, TrainingHooks};
use crate::config::FitConfig;
use crate::error::{ConfigError, HarnessError, Result};
use crate::interval::{Action, Split};
use crate::metrics::{
    CumulativeAverage, MetricMap, MovingAverage, WindowedAverage, format_metrics, merge_disjoint,
};
use crate::monitor::Monitor;
use crate::scheduler::LrScheduler;
use crate::snapshot::{Checkpoint, SnapshotManager};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Why a run completed voluntarily.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The configured epoch ceiling was reached.
    MaxEpoch,
    /// The monitor ran out of patience.
    Converged,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::MaxEpoch => write!(f, "max_epoch"),
            StopReason::Converged => write!(f, "converged"),
        }
    }
}

/// Lifecycle of a harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HarnessState {
    NotInitialized,
    Initializing,
    Running,
    Completed(StopReason),
    /// Stopped early through the cancellation token.
    Terminated,
    Failed,
}

impl HarnessState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HarnessState::Completed(_) | HarnessState::Terminated | HarnessState::Failed
        )
    }
}

impl fmt::Display for HarnessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HarnessState::NotInitialized => write!(f, "not_initialized"),
            HarnessState::Initializing => write!(f, "initializing"),
            HarnessState::Running => write!(f, "running"),
            HarnessState::Completed(reason) => write!(f, "completed ({reason})"),
            HarnessState::Terminated => write!(f, "terminated"),
            HarnessState::Failed => write!(f, "failed"),
        }
    }
}

/// What to do with checkpoints left by an earlier run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResetMode {
    /// Restore the newest loadable checkpoint.
    #[default]
    Resume,
    /// Start from scratch but leave existing files alone.
    Restart,
    /// Remove existing checkpoints and the best artifact, then start from scratch.
    Delete,
}

/// Mutable progress of the run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TrainingState {
    /// Epoch currently running, or next to run.
    pub epoch: usize,
    /// Batches consumed in the current pass of each split.
    pub batch_index: BTreeMap<Split, usize>,
    pub dry_run: bool,
}

/// Result of one epoch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochOutcome {
    Continue,
    Stop(StopReason),
    Cancelled,
}

/// Final report of a run, also written to the log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub state: HarnessState,
    /// Epoch the run stopped at.
    pub epoch: usize,
    /// Epochs completed by this invocation.
    pub epochs_run: usize,
    pub learning_rates: Vec<f64>,
    pub best_epoch: Option<usize>,
    pub best_epochs: BTreeMap<String, Vec<usize>>,
    pub optimizer_steps: usize,
}

/// Training loader plus optional validation and test loaders.
#[derive(Debug, Clone)]
pub struct Loaders<L> {
    pub train: L,
    pub vali: Option<L>,
    pub test: Option<L>,
}

impl<L> Loaders<L> {
    pub fn new(train: L) -> Self {
        Self {
            train,
            vali: None,
            test: None,
        }
    }

    pub fn with_vali(mut self, loader: L) -> Self {
        self.vali = Some(loader);
        self
    }

    pub fn with_test(mut self, loader: L) -> Self {
        self.test = Some(loader);
        self
    }

    pub fn get(&self, split: Split) -> Option<&L> {
        match split {
            Split::Train => Some(&self.train),
            Split::Vali => self.vali.as_ref(),
            Split::Test => self.test.as_ref(),
        }
    }

    pub fn get_mut(&mut self, split: Split) -> Option<&mut L> {
        match split {
            Split::Train => Some(&mut self.train),
            Split::Vali => self.vali.as_mut(),
            Split::Test => self.test.as_mut(),
        }
    }
}

/// Orchestrates training of one model.
pub struct Harness<M: Model, C, O, L> {
    config: FitConfig,
    state: HarnessState,
    training: TrainingState,
    model: M,
    criterion: C,
    optimizer: O,
    loaders: Loaders<L>,
    hooks: Box<dyn TrainingHooks<M> + Send>,
    monitor: Monitor,
    scheduler: LrScheduler,
    snapshots: SnapshotManager,
    runner: BatchRunner,
    windowed: BTreeMap<Split, WindowedAverage>,
    cancel: CancellationToken,
    epochs_run: usize,
}

impl<M, C, O, L> Harness<M, C, O, L>
where
    M: Model,
    C: Criterion<M>,
    O: Optimizer<M>,
    L: Loader<Input = M::Input, Target = C::Target>,
{
    /// Validate `config` and build every sub-component from it.
    pub fn new(
        config: FitConfig,
        model: M,
        criterion: C,
        optimizer: O,
        loaders: Loaders<L>,
    ) -> Result<Self> {
        config.validate()?;
        let monitor = Monitor::new(&config.monitor)?;
        let scheduler = LrScheduler::from_config(&config.scheduler)?;
        let snapshots =
            SnapshotManager::new(&config.workdir, config.snapshots.clone(), config.dry_run);
        let runner = BatchRunner::new(
            config.dynamics.batch_step,
            config.large_loss,
            config.large_loss_sentinel,
        );
        let training = TrainingState {
            dry_run: config.dry_run,
            ..Default::default()
        };
        Ok(Self {
            config,
            state: HarnessState::NotInitialized,
            training,
            model,
            criterion,
            optimizer,
            loaders,
            hooks: Box::new(NoHooks),
            monitor,
            scheduler,
            snapshots,
            runner,
            windowed: BTreeMap::new(),
            cancel: CancellationToken::new(),
            epochs_run: 0,
        })
    }

    pub fn with_hooks(mut self, hooks: impl TrainingHooks<M> + Send + 'static) -> Self {
        self.hooks = Box::new(hooks);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &FitConfig {
        &self.config
    }

    pub fn state(&self) -> HarnessState {
        self.state
    }

    pub fn training_state(&self) -> &TrainingState {
        &self.training
    }

    pub fn epoch(&self) -> usize {
        self.training.epoch
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    pub fn scheduler(&self) -> &LrScheduler {
        &self.scheduler
    }

    pub fn snapshots(&self) -> &SnapshotManager {
        &self.snapshots
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn optimizer_steps(&self) -> usize {
        self.runner.optimizer_steps()
    }

    pub fn current_learning_rates(&self) -> Vec<f64> {
        self.scheduler.current_learning_rates(&self.optimizer)
    }

    /// Prepare the run: check collaborators, apply `reset`, restore a checkpoint.
    pub fn initialize(&mut self, reset: ResetMode) -> Result<()> {
        if self.state != HarnessState::NotInitialized {
            return Err(HarnessError::InvalidState {
                expected: "not_initialized",
                actual: self.state.to_string(),
            });
        }
        self.state = HarnessState::Initializing;
        match self.try_initialize(reset) {
            Ok(()) => {
                self.state = HarnessState::Running;
                Ok(())
            }
            Err(err) => {
                self.state = HarnessState::Failed;
                error!(error = %err, "Initialization failed");
                Err(err)
            }
        }
    }

    fn try_initialize(&mut self, reset: ResetMode) -> Result<()> {
        if self.scheduler.requires_validation() && self.loaders.vali.is_none() {
            return Err(ConfigError::invalid(
                "scheduler",
                format!(
                    "the '{}' schedule reacts to validation results, but no validation loader was given",
                    self.scheduler.name()
                ),
            )
            .into());
        }

        info!(
            workdir = %self.config.workdir.display(),
            parameters = self.model.num_parameters(),
            train_batches = self.loaders.train.len(),
            batch_size = self.loaders.train.batch_size(),
            batch_step = self.runner.batch_step(),
            scheduler = self.scheduler.name(),
            dry_run = self.training.dry_run,
            "Initializing harness"
        );

        match reset {
            ResetMode::Resume => self.restore_latest()?,
            ResetMode::Restart => info!("Restart requested, ignoring existing checkpoints"),
            ResetMode::Delete => self.delete_snapshots()?,
        }

        self.scheduler.prepare(self.training.epoch, &mut self.optimizer);
        Ok(())
    }

    fn delete_snapshots(&self) -> Result<()> {
        let dir = self.snapshots.dir();
        let best = self.snapshots.best_path();
        if self.training.dry_run {
            warn!(dir = %dir.display(), "Dry run, not deleting existing checkpoints");
            return Ok(());
        }
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        if best.exists() {
            std::fs::remove_file(&best)?;
        }
        info!(dir = %dir.display(), "Deleted existing checkpoints");
        Ok(())
    }

    /// Load checkpoints newest-first until one applies cleanly.
    ///
    /// Failed attempts are rolled back, so if none applies the run starts
    /// from the collaborators' initial state.
    fn restore_latest(&mut self) -> Result<()> {
        let found = self.snapshots.list()?;
        if found.is_empty() {
            info!("No checkpoints found, starting fresh");
            return Ok(());
        }

        let initial_model = self
            .model
            .state_dict()
            .map_err(|e| HarnessError::collaborator("model state_dict", e))?;
        let initial_optimizer = self
            .optimizer
            .state_dict()
            .map_err(|e| HarnessError::collaborator("optimizer state_dict", e))?;
        let initial_monitor = self.monitor.clone();
        let initial_scheduler = self.scheduler.clone();

        for (epoch, path) in found.iter().rev() {
            let restored = self
                .snapshots
                .load(path)
                .map_err(HarnessError::from)
                .and_then(|checkpoint| self.apply_checkpoint(checkpoint));
            match restored {
                Ok(()) => {
                    info!(
                        epoch,
                        path = %path.display(),
                        next_epoch = self.training.epoch,
                        "Restored checkpoint"
                    );
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        epoch,
                        path = %path.display(),
                        error = %err,
                        "Could not restore checkpoint, trying an older one"
                    );
                    self.model
                        .load_state_dict(initial_model.clone())
                        .map_err(|e| HarnessError::collaborator("model load_state_dict", e))?;
                    self.optimizer
                        .load_state_dict(initial_optimizer.clone())
                        .map_err(|e| HarnessError::collaborator("optimizer load_state_dict", e))?;
                    self.monitor = initial_monitor.clone();
                    self.scheduler = initial_scheduler.clone();
                    self.training.epoch = 0;
                }
            }
        }

        warn!(
            attempted = found.len(),
            "No checkpoint could be restored, starting fresh"
        );
        Ok(())
    }

    fn apply_checkpoint(&mut self, checkpoint: Checkpoint) -> Result<()> {
        self.model
            .load_state_dict(checkpoint.model_state)
            .map_err(|e| HarnessError::collaborator("model load_state_dict", e))?;
        self.optimizer
            .load_state_dict(checkpoint.optimizer_state)
            .map_err(|e| HarnessError::collaborator("optimizer load_state_dict", e))?;
        self.monitor.load_state_dict(checkpoint.monitor_state);
        if let Some(state) = checkpoint.scheduler_state {
            self.scheduler.load_state(state)?;
        }
        self.training.epoch = checkpoint.epoch + 1;
        Ok(())
    }

    /// Capture the current state as a checkpoint for the current epoch.
    pub fn checkpoint(&self) -> Result<Checkpoint> {
        Ok(Checkpoint {
            epoch: self.training.epoch,
            model_state: self
                .model
                .state_dict()
                .map_err(|e| HarnessError::collaborator("model state_dict", e))?,
            optimizer_state: self
                .optimizer
                .state_dict()
                .map_err(|e| HarnessError::collaborator("optimizer state_dict", e))?,
            monitor_state: self.monitor.state_dict(),
            scheduler_state: self.scheduler.state(),
        })
    }

    fn save_snapshot(&self) -> Result<Option<PathBuf>> {
        if self.training.dry_run {
            debug!(epoch = self.training.epoch, "Dry run, skipping snapshot");
            return Ok(None);
        }
        let checkpoint = self.checkpoint()?;
        Ok(self.snapshots.save(&checkpoint)?)
    }

    /// Reload only the model parameters saved at `epoch`.
    pub fn backtrack_weights(&mut self, epoch: usize) -> Result<()> {
        let checkpoint = self.snapshots.load_epoch(epoch)?;
        self.model
            .load_state_dict(checkpoint.model_state)
            .map_err(|e| HarnessError::collaborator("model load_state_dict", e))?;
        info!(epoch, "Backtracked model weights");
        Ok(())
    }

    /// Restore the full checkpoint of `epoch`; training continues at `epoch + 1`.
    pub fn rollback(&mut self, epoch: usize) -> Result<()> {
        if self.state != HarnessState::Running {
            return Err(HarnessError::InvalidState {
                expected: "running",
                actual: self.state.to_string(),
            });
        }
        let checkpoint = self.snapshots.load_epoch(epoch)?;
        self.apply_checkpoint(checkpoint)?;
        self.scheduler.prepare(self.training.epoch, &mut self.optimizer);
        info!(epoch, next_epoch = self.training.epoch, "Rolled back to checkpoint");
        Ok(())
    }

    /// Fetch a single prepared batch, for debugging collaborators.
    pub fn demo_batch(&mut self, split: Split, index: usize) -> Result<Batch<M::Input, C::Target>> {
        let loader = self
            .loaders
            .get_mut(split)
            .ok_or_else(|| HarnessError::MissingSplit(split.to_string()))?;
        let len = loader.len();
        match loader.batches().nth(index) {
            Some(batch) => batch.map_err(|e| HarnessError::collaborator("loader", e)),
            None => Err(HarnessError::BatchOutOfRange {
                split: split.to_string(),
                index,
                len,
            }),
        }
    }

    /// Train until completion, cancellation or failure.
    ///
    /// Initializes with [`ResetMode::Resume`] if that has not happened yet.
    /// Voluntary stops and cancellation return `Ok`; any error moves the
    /// harness to [`HarnessState::Failed`] and is returned.
    pub fn run(&mut self) -> Result<RunSummary> {
        if self.state == HarnessState::NotInitialized {
            self.initialize(ResetMode::Resume)?;
        }
        if self.state != HarnessState::Running {
            return Err(HarnessError::InvalidState {
                expected: "running",
                actual: self.state.to_string(),
            });
        }

        info!(
            epoch = self.training.epoch,
            max_epoch = self.monitor.max_epoch(),
            "Begin training"
        );
        loop {
            match self.epoch_cycle() {
                Ok(EpochOutcome::Continue) => {}
                Ok(EpochOutcome::Stop(reason)) => {
                    self.state = HarnessState::Completed(reason);
                    break;
                }
                Ok(EpochOutcome::Cancelled) => {
                    self.state = HarnessState::Terminated;
                    break;
                }
                Err(err) => {
                    self.state = HarnessState::Failed;
                    error!(
                        epoch = self.training.epoch,
                        batch = ?self.training.batch_index,
                        error = %err,
                        cause = ?std::error::Error::source(&err).map(|s| s.to_string()),
                        "Training failed"
                    );
                    self.log_summary(&self.summary());
                    return Err(err);
                }
            }
        }

        let summary = self.summary();
        self.log_summary(&summary);
        Ok(summary)
    }

    fn epoch_cycle(&mut self) -> Result<EpochOutcome> {
        if self.cancel.is_cancelled() {
            info!(epoch = self.training.epoch, "Cancellation requested, not starting epoch");
            return Ok(EpochOutcome::Cancelled);
        }
        let epoch = self.training.epoch;
        let max_epoch = self.monitor.max_epoch();
        if epoch >= max_epoch {
            info!(epoch, max_epoch, "Maximum epoch already reached");
            return Ok(EpochOutcome::Stop(StopReason::MaxEpoch));
        }
        if self.monitor.is_done() {
            info!(epoch, "Monitor already out of patience");
            return Ok(EpochOutcome::Stop(StopReason::Converged));
        }

        info!(epoch, lrs = ?self.current_learning_rates(), "Epoch start");

        if self.run_split(Split::Train, true)?.is_none() {
            return Ok(EpochOutcome::Cancelled);
        }

        let mut improved = None;
        if self.loaders.vali.is_some() && self.config.intervals.check(Action::Validate, epoch) {
            let Some(metrics) = self.run_split(Split::Vali, false)? else {
                return Ok(EpochOutcome::Cancelled);
            };
            let verdict = self.monitor.update(epoch, &metrics)?;
            info!(epoch, improved = verdict, "{}", self.monitor.message());
            improved = Some(verdict);
        }

        if self.loaders.test.is_some()
            && self.config.intervals.check(Action::Test, epoch)
            && self.run_split(Split::Test, false)?.is_none()
        {
            return Ok(EpochOutcome::Cancelled);
        }

        if improved == Some(true) {
            if let Some(path) = self.save_snapshot()? {
                self.snapshots.promote_best(&path)?;
            }
            info!(epoch, "New best epoch");
        } else if self.config.intervals.check(Action::Snapshot, epoch) {
            self.save_snapshot()?;
        }

        if self.config.intervals.check(Action::Cleanup, epoch) {
            self.snapshots.cleanup(&self.monitor.best_epochs())?;
        }

        self.epochs_run += 1;

        if epoch + 1 >= max_epoch {
            info!(epoch, max_epoch, "Maximum epoch reached");
            return Ok(EpochOutcome::Stop(StopReason::MaxEpoch));
        }
        if self.monitor.is_done() {
            info!(
                epoch,
                bad_updates = self.monitor.bad_updates(),
                patience = self.monitor.patience(),
                "Validation stopped improving"
            );
            return Ok(EpochOutcome::Stop(StopReason::Converged));
        }

        self.scheduler.step(epoch + 1, improved, &mut self.optimizer)?;
        self.training.epoch += 1;
        Ok(EpochOutcome::Continue)
    }

    /// One full pass over `split`. Returns `None` if cancelled mid-pass.
    fn run_split(&mut self, split: Split, learn: bool) -> Result<Option<MetricMap>> {
        let epoch = self.training.epoch;
        let Self {
            config,
            training,
            model,
            criterion,
            optimizer,
            loaders,
            hooks,
            runner,
            windowed,
            cancel,
            ..
        } = self;

        let loader = loaders
            .get_mut(split)
            .ok_or_else(|| HarnessError::MissingSplit(split.to_string()))?;
        let num_batches = loader.len();
        let window = windowed
            .entry(split)
            .or_insert_with(|| WindowedAverage::new(num_batches));
        let mut pass = CumulativeAverage::new();

        model.set_training(learn);
        if learn {
            // An unfinished accumulation group from the previous epoch is dropped.
            optimizer.zero_grad(model);
        }
        training.batch_index.insert(split, 0);

        for (index, batch) in loader.batches().enumerate() {
            if cancel.is_cancelled() {
                info!(
                    split = %split,
                    epoch,
                    batch = index,
                    "Cancellation requested, stopping pass"
                );
                return Ok(None);
            }
            let batch = batch.map_err(|e| {
                error!(
                    split = %split,
                    epoch,
                    batch = index,
                    error = %e,
                    "Loader failed to produce a batch"
                );
                HarnessError::collaborator("loader", e)
            })?;
            let ctx = BatchContext {
                split,
                epoch,
                index,
            };
            let output = runner.run_batch(ctx, &batch, learn, model, criterion, optimizer)?;

            let mut metrics = MetricMap::from([("loss".to_string(), output.loss)]);
            merge_disjoint(
                "batch",
                &mut metrics,
                hooks.on_batch(split, &output.outputs, output.loss),
            )?;
            pass.update(&metrics);
            window.update(&metrics);
            training.batch_index.insert(split, index + 1);

            if config.intervals.check(Action::LogIter(split), index) {
                let step = epoch * num_batches + index;
                for (key, value) in window.average() {
                    log_scalar(&format!("{split}_iter_{key}"), value, step);
                }
            }
            if config.intervals.check(Action::Display(split), index) {
                debug!(
                    split = %split,
                    epoch,
                    batch = index,
                    total = num_batches,
                    "{}",
                    format_metrics(&window.average())
                );
            }
        }

        let mut metrics = pass.average();
        merge_disjoint("epoch", &mut metrics, hooks.on_epoch(split, epoch))?;
        for (key, value) in &metrics {
            log_scalar(&format!("{split}_epoch_{key}"), *value, epoch);
        }
        info!(
            split = %split,
            epoch,
            batches = training.batch_index.get(&split).copied().unwrap_or(0),
            "{}",
            format_metrics(&metrics)
        );
        Ok(Some(metrics))
    }

    /// Snapshot of the run's outcome so far.
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            state: self.state,
            epoch: self.training.epoch,
            epochs_run: self.epochs_run,
            learning_rates: self.current_learning_rates(),
            best_epoch: self.monitor.best_epoch(),
            best_epochs: self.monitor.best_epochs(),
            optimizer_steps: self.runner.optimizer_steps(),
        }
    }

    fn log_summary(&self, summary: &RunSummary) {
        match summary.state {
            HarnessState::Completed(reason) => info!(
                reason = %reason,
                epoch = summary.epoch,
                epochs_run = summary.epochs_run,
                lrs = ?summary.learning_rates,
                best_epoch = ?summary.best_epoch,
                optimizer_steps = summary.optimizer_steps,
                "Training complete"
            ),
            HarnessState::Terminated => warn!(
                epoch = summary.epoch,
                epochs_run = summary.epochs_run,
                lrs = ?summary.learning_rates,
                best_epoch = ?summary.best_epoch,
                "Training terminated before completion"
            ),
            HarnessState::Failed => error!(
                epoch = summary.epoch,
                epochs_run = summary.epochs_run,
                lrs = ?summary.learning_rates,
                best_epoch = ?summary.best_epoch,
                "Training ended with an error"
            ),
            _ => {}
        }
    }
}

/// Scalar hook point for dashboards: a `debug` event on target `fitloop::scalar`.
fn log_scalar(key: &str, value: f64, step: usize) {
    debug!(target: "fitloop::scalar", key, value, step);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::SchedulerConfig;
    use crate::toy::{LinearModel, MseCriterion, Sgd, VecLoader};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    type ToyHarness = Harness<LinearModel, MseCriterion, Sgd, VecLoader>;

    fn config(dir: &TempDir, max_epoch: usize) -> FitConfig {
        let mut config = FitConfig {
            workdir: dir.path().to_path_buf(),
            ..Default::default()
        };
        config.monitor.max_epoch = max_epoch;
        config
    }

    fn harness(config: FitConfig, loaders: Loaders<VecLoader>) -> ToyHarness {
        Harness::new(config, LinearModel::zeros(1), MseCriterion, Sgd::new(0.05), loaders).unwrap()
    }

    fn loader(batches: usize, seed: u64) -> VecLoader {
        VecLoader::synthetic(batches, 4, &[2.0], 0.5, 0.01, seed)
    }

    #[test]
    fn test_state_transitions() {
        let dir = TempDir::new().unwrap();
        let mut h = harness(config(&dir, 2), Loaders::new(loader(2, 1)));
        assert_eq!(h.state(), HarnessState::NotInitialized);
        h.initialize(ResetMode::Resume).unwrap();
        assert_eq!(h.state(), HarnessState::Running);
        assert!(matches!(
            h.initialize(ResetMode::Resume),
            Err(HarnessError::InvalidState { .. })
        ));

        let summary = h.run().unwrap();
        assert_eq!(summary.state, HarnessState::Completed(StopReason::MaxEpoch));
        assert!(h.state().is_terminal());
        assert!(matches!(h.run(), Err(HarnessError::InvalidState { .. })));
    }

    #[test]
    fn test_plateau_requires_vali_loader() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir, 2);
        cfg.scheduler = SchedulerConfig::Plateau {
            factor: 0.5,
            patience: 1,
            cooldown: 0,
            min_lr: 0.0,
        };
        let mut h = harness(cfg, Loaders::new(loader(2, 1)));
        let err = h.run().unwrap_err();
        assert!(matches!(err, HarnessError::Config(_)), "{err}");
        assert_eq!(h.state(), HarnessState::Failed);
    }

    #[test]
    fn test_plateau_with_sparse_validation_fails_loudly() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir, 5);
        cfg.intervals.vali = Some(2);
        cfg.scheduler = SchedulerConfig::Plateau {
            factor: 0.5,
            patience: 1,
            cooldown: 0,
            min_lr: 0.0,
        };
        let mut h = harness(cfg, Loaders::new(loader(2, 1)).with_vali(loader(1, 2)));
        let err = h.run().unwrap_err();
        assert!(
            matches!(err, HarnessError::StaleValidation { epoch: 0, .. }),
            "{err}"
        );
        assert_eq!(h.state(), HarnessState::Failed);
    }

    #[test]
    fn test_demo_batch() {
        let dir = TempDir::new().unwrap();
        let mut h = harness(config(&dir, 1), Loaders::new(loader(3, 1)));
        let batch = h.demo_batch(Split::Train, 2).unwrap();
        assert_eq!(batch.target.len(), 4);
        assert!(matches!(
            h.demo_batch(Split::Train, 3),
            Err(HarnessError::BatchOutOfRange { index: 3, len: 3, .. })
        ));
        assert!(matches!(
            h.demo_batch(Split::Test, 0),
            Err(HarnessError::MissingSplit(_))
        ));
    }

    #[test]
    fn test_epoch_schedule_applied_each_epoch() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir, 3);
        cfg.scheduler = SchedulerConfig::Step {
            base_lr: 0.1,
            step_size: 1,
            gamma: 0.5,
        };
        let mut h = harness(cfg, Loaders::new(loader(2, 1)));
        h.initialize(ResetMode::Restart).unwrap();
        assert_eq!(h.current_learning_rates(), vec![0.1]);
        h.run().unwrap();
        // stepped into epochs 1 and 2 only
        assert_eq!(h.current_learning_rates(), vec![0.025]);
    }

    #[test]
    fn test_rollback_requires_running() {
        let dir = TempDir::new().unwrap();
        let mut h = harness(config(&dir, 1), Loaders::new(loader(1, 1)));
        assert!(matches!(
            h.rollback(0),
            Err(HarnessError::InvalidState { .. })
        ));
    }
}
