//! Learning-rate schedule adapters.
//!
//! Three shapes of schedule sit behind one `step(epoch, improved)` call:
//! a constant rate owned by the optimizer, epoch-indexed schedules, and
//! reduce-on-plateau which reacts to the monitor's improvement verdict. The
//! shape is chosen once from [`SchedulerConfig`].

use crate::collab::LearningRates;
use crate::error::{ConfigError, HarnessError, Result};
use serde::{Deserialize, Serialize};

/// A `(epoch, lr)` anchor of a listed schedule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LrPoint {
    pub epoch: usize,
    pub lr: f64,
}

/// Which schedule drives the learning rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SchedulerConfig {
    /// Leave the optimizer's rate alone.
    #[default]
    None,
    /// Piecewise schedule through fixed points, optionally interpolated.
    Listed {
        points: Vec<LrPoint>,
        #[serde(default)]
        interpolate: bool,
    },
    /// Multiply by `gamma` every `step_size` epochs.
    Step {
        base_lr: f64,
        step_size: usize,
        gamma: f64,
    },
    /// Multiply by `gamma` every epoch.
    Exponential { base_lr: f64, gamma: f64 },
    /// Scale rates by `factor` after `patience` non-improving epochs.
    Plateau {
        #[serde(default = "default_plateau_factor")]
        factor: f64,
        #[serde(default = "default_plateau_patience")]
        patience: usize,
        #[serde(default)]
        cooldown: usize,
        #[serde(default)]
        min_lr: f64,
    },
}

fn default_plateau_factor() -> f64 {
    0.1
}

fn default_plateau_patience() -> usize {
    10
}

/// Piecewise learning-rate schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct ListedLr {
    points: Vec<LrPoint>,
    interpolate: bool,
}

impl ListedLr {
    pub fn new(
        mut points: Vec<LrPoint>,
        interpolate: bool,
    ) -> std::result::Result<Self, ConfigError> {
        if points.is_empty() {
            return Err(ConfigError::invalid(
                "scheduler.points",
                "a listed schedule needs at least one point",
            ));
        }
        points.sort_by_key(|p| p.epoch);
        Ok(Self {
            points,
            interpolate,
        })
    }

    pub fn learning_rate(&self, epoch: usize) -> f64 {
        let idx = self.points.partition_point(|p| p.epoch <= epoch);
        if idx == 0 {
            return self.points[0].lr;
        }
        let prev = self.points[idx - 1];
        match self.points.get(idx) {
            Some(next) if self.interpolate => {
                let span = (next.epoch - prev.epoch) as f64;
                let alpha = (epoch - prev.epoch) as f64 / span;
                prev.lr + alpha * (next.lr - prev.lr)
            }
            _ => prev.lr,
        }
    }
}

/// Schedules that are a pure function of the epoch number.
#[derive(Debug, Clone, PartialEq)]
pub enum EpochSchedule {
    Listed(ListedLr),
    Step {
        base_lr: f64,
        step_size: usize,
        gamma: f64,
    },
    Exponential {
        base_lr: f64,
        gamma: f64,
    },
}

impl EpochSchedule {
    pub fn learning_rate(&self, epoch: usize) -> f64 {
        match self {
            EpochSchedule::Listed(listed) => listed.learning_rate(epoch),
            EpochSchedule::Step {
                base_lr,
                step_size,
                gamma,
            } => base_lr * gamma.powi((epoch / step_size) as i32),
            EpochSchedule::Exponential { base_lr, gamma } => base_lr * gamma.powi(epoch as i32),
        }
    }
}

/// Counters of the plateau-reactive schedule; persisted with checkpoints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlateauCounters {
    pub bad_epochs: usize,
    pub cooldown_counter: usize,
    pub reductions: usize,
}

/// Reduce-on-plateau driven by the monitor's verdict rather than a raw metric.
#[derive(Debug, Clone, PartialEq)]
pub struct ReduceOnPlateau {
    factor: f64,
    patience: usize,
    cooldown: usize,
    min_lr: f64,
    counters: PlateauCounters,
}

impl ReduceOnPlateau {
    pub fn new(
        factor: f64,
        patience: usize,
        cooldown: usize,
        min_lr: f64,
    ) -> std::result::Result<Self, ConfigError> {
        if !(factor > 0.0 && factor < 1.0) {
            return Err(ConfigError::invalid(
                "scheduler.factor",
                format!("must be in (0, 1), got {factor}"),
            ));
        }
        if !min_lr.is_finite() || min_lr < 0.0 {
            return Err(ConfigError::invalid(
                "scheduler.min_lr",
                "must be a finite, non-negative number",
            ));
        }
        Ok(Self {
            factor,
            patience,
            cooldown,
            min_lr,
            counters: PlateauCounters::default(),
        })
    }

    pub fn counters(&self) -> PlateauCounters {
        self.counters
    }

    pub fn in_cooldown(&self) -> bool {
        self.counters.cooldown_counter > 0
    }

    /// Advance the counters; returns `true` when a reduction is due.
    pub fn observe(&mut self, improved: bool) -> bool {
        let c = &mut self.counters;
        if improved {
            c.bad_epochs = 0;
        } else {
            c.bad_epochs += 1;
        }
        if c.cooldown_counter > 0 {
            c.cooldown_counter -= 1;
            c.bad_epochs = 0;
        }
        if c.bad_epochs > self.patience {
            c.cooldown_counter = self.cooldown;
            c.bad_epochs = 0;
            c.reductions += 1;
            return true;
        }
        false
    }

    fn reduce<O: LearningRates + ?Sized>(&self, optimizer: &mut O) -> Vec<f64> {
        let reduced: Vec<f64> = optimizer
            .learning_rates()
            .into_iter()
            .map(|lr| (lr * self.factor).max(self.min_lr))
            .collect();
        optimizer.set_learning_rates(&reduced);
        reduced
    }
}

/// Learning-rate driver selected once at configuration time.
#[derive(Debug, Clone, PartialEq)]
pub enum LrScheduler {
    Constant,
    Epoch(EpochSchedule),
    Plateau(ReduceOnPlateau),
}

impl LrScheduler {
    pub fn from_config(config: &SchedulerConfig) -> std::result::Result<Self, ConfigError> {
        Ok(match config {
            SchedulerConfig::None => LrScheduler::Constant,
            SchedulerConfig::Listed {
                points,
                interpolate,
            } => LrScheduler::Epoch(EpochSchedule::Listed(ListedLr::new(
                points.clone(),
                *interpolate,
            )?)),
            SchedulerConfig::Step {
                base_lr,
                step_size,
                gamma,
            } => {
                if *step_size == 0 {
                    return Err(ConfigError::invalid("scheduler.step_size", "must be > 0"));
                }
                LrScheduler::Epoch(EpochSchedule::Step {
                    base_lr: *base_lr,
                    step_size: *step_size,
                    gamma: *gamma,
                })
            }
            SchedulerConfig::Exponential { base_lr, gamma } => {
                LrScheduler::Epoch(EpochSchedule::Exponential {
                    base_lr: *base_lr,
                    gamma: *gamma,
                })
            }
            SchedulerConfig::Plateau {
                factor,
                patience,
                cooldown,
                min_lr,
            } => LrScheduler::Plateau(ReduceOnPlateau::new(
                *factor, *patience, *cooldown, *min_lr,
            )?),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            LrScheduler::Constant => "constant",
            LrScheduler::Epoch(EpochSchedule::Listed(_)) => "listed",
            LrScheduler::Epoch(EpochSchedule::Step { .. }) => "step",
            LrScheduler::Epoch(EpochSchedule::Exponential { .. }) => "exponential",
            LrScheduler::Plateau(_) => "plateau",
        }
    }

    /// Whether every step needs a fresh validation verdict.
    pub fn requires_validation(&self) -> bool {
        matches!(self, LrScheduler::Plateau(_))
    }

    /// Put the optimizer at the rate for `epoch` before it runs.
    pub fn prepare<O: LearningRates + ?Sized>(&self, epoch: usize, optimizer: &mut O) {
        if let LrScheduler::Epoch(schedule) = self {
            set_uniform(optimizer, schedule.learning_rate(epoch));
        }
    }

    /// Advance the schedule after an epoch.
    ///
    /// `next_epoch` is the epoch about to run. `improved` is `None` when no
    /// validation pass ran this epoch, which the plateau schedule refuses.
    pub fn step<O: LearningRates + ?Sized>(
        &mut self,
        next_epoch: usize,
        improved: Option<bool>,
        optimizer: &mut O,
    ) -> Result<()> {
        match self {
            LrScheduler::Constant => {}
            LrScheduler::Epoch(schedule) => {
                set_uniform(optimizer, schedule.learning_rate(next_epoch));
            }
            LrScheduler::Plateau(plateau) => {
                let improved = improved.ok_or(HarnessError::StaleValidation {
                    scheduler: "plateau",
                    epoch: next_epoch.saturating_sub(1),
                })?;
                if plateau.observe(improved) {
                    let lrs = plateau.reduce(optimizer);
                    tracing::info!(
                        epoch = next_epoch,
                        lrs = ?lrs,
                        reductions = plateau.counters.reductions,
                        "Plateau reached, reducing learning rate"
                    );
                }
            }
        }
        Ok(())
    }

    /// Distinct learning rates currently in effect, ascending.
    pub fn current_learning_rates<O: LearningRates + ?Sized>(&self, optimizer: &O) -> Vec<f64> {
        let mut lrs = optimizer.learning_rates();
        lrs.sort_by(f64::total_cmp);
        lrs.dedup();
        lrs
    }

    /// Serializable schedule state, if the schedule has any.
    pub fn state(&self) -> Option<serde_json::Value> {
        match self {
            LrScheduler::Plateau(plateau) => serde_json::to_value(plateau.counters).ok(),
            _ => None,
        }
    }

    pub fn load_state(&mut self, state: serde_json::Value) -> Result<()> {
        if let LrScheduler::Plateau(plateau) = self {
            plateau.counters = serde_json::from_value(state)?;
        }
        Ok(())
    }
}

fn set_uniform<O: LearningRates + ?Sized>(optimizer: &mut O, lr: f64) {
    let groups = optimizer.learning_rates().len().max(1);
    optimizer.set_learning_rates(&vec![lr; groups]);
}
