//! Configuration for a training run.
//!
//! Uses `figment` for layered configuration: defaults -> user config ->
//! explicit file -> environment (`FITLOOP_`, `__` separated) -> overrides.
//! The user-level file is `~/.config/fitloop/config.toml` (via `directories`).

use crate::error::ConfigError;
use crate::interval::Intervals;
use crate::monitor::MonitorConfig;
use crate::scheduler::{LrScheduler, SchedulerConfig};
use crate::snapshot::SnapshotConfig;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Everything the training loop consults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    /// Run directory; checkpoints land in `<workdir>/snapshots`.
    pub workdir: PathBuf,
    /// Suppress every durable write while keeping control flow unchanged.
    pub dry_run: bool,
    pub monitor: MonitorConfig,
    pub dynamics: DynamicsConfig,
    pub snapshots: SnapshotConfig,
    pub intervals: Intervals,
    /// Training losses above this trigger a weight finiteness check.
    pub large_loss: f64,
    /// Value reported in place of a non-finite loss.
    pub large_loss_sentinel: f64,
    pub scheduler: SchedulerConfig,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from("runs/default"),
            dry_run: false,
            monitor: MonitorConfig::default(),
            dynamics: DynamicsConfig::default(),
            snapshots: SnapshotConfig::default(),
            intervals: Intervals::default(),
            large_loss: 100.0,
            large_loss_sentinel: 1000.0,
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// Optimization dynamics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicsConfig {
    /// Batches per optimizer update (gradient accumulation group size).
    pub batch_step: usize,
}

impl Default for DynamicsConfig {
    fn default() -> Self {
        Self { batch_step: 1 }
    }
}

impl FitConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.monitor.validate()?;
        self.intervals.validate()?;
        if self.dynamics.batch_step == 0 {
            return Err(ConfigError::invalid("dynamics.batch_step", "must be > 0"));
        }
        if self.snapshots.num_keep == 0 {
            return Err(ConfigError::invalid("snapshots.num_keep", "must be > 0"));
        }
        for (field, value) in [
            ("snapshots.prefix", &self.snapshots.prefix),
            ("snapshots.extension", &self.snapshots.extension),
        ] {
            if value.is_empty() || value.contains(['/', '\\']) {
                return Err(ConfigError::invalid(
                    field,
                    "must be a non-empty file name component",
                ));
            }
        }
        if !(self.large_loss.is_finite() && self.large_loss > 0.0) {
            return Err(ConfigError::invalid("large_loss", "must be finite and > 0"));
        }
        if !self.large_loss_sentinel.is_finite() {
            return Err(ConfigError::invalid("large_loss_sentinel", "must be finite"));
        }
        LrScheduler::from_config(&self.scheduler)?;
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::invalid("config", e.to_string()))
    }
}

fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "fitloop", "fitloop")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Layered figment without explicit overrides; callers may merge more keys.
pub fn base_figment(file: Option<&Path>) -> Figment {
    let mut figment = Figment::from(Serialized::defaults(FitConfig::default()));

    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(file) = file {
        figment = figment.merge(Toml::file(file));
    }

    // FITLOOP_MONITOR__PATIENCE, FITLOOP_DYNAMICS__BATCH_STEP, ...
    figment.merge(Env::prefixed("FITLOOP_").split("__"))
}

/// Extract and validate a [`FitConfig`] from a prepared figment.
pub fn extract(figment: Figment) -> Result<FitConfig, ConfigError> {
    let config: FitConfig = figment
        .extract()
        .map_err(|e| ConfigError::Load(Box::new(e)))?;
    config.validate()?;
    Ok(config)
}

/// Load the layered configuration, with `overrides` merged last.
///
/// A missing explicit `file` is an error; a missing user config is not.
pub fn load_config(
    file: Option<&Path>,
    overrides: Option<&FitConfig>,
) -> Result<FitConfig, ConfigError> {
    if let Some(file) = file {
        if !file.exists() {
            return Err(ConfigError::invalid(
                "config",
                format!("file {} does not exist", file.display()),
            ));
        }
    }
    let mut figment = base_figment(file);
    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }
    extract(figment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::TrackedMetric;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_are_valid() {
        let config = FitConfig::default();
        config.validate().unwrap();
        assert_eq!(config.snapshots.num_keep, 10);
        assert_eq!(config.intervals.cleanup, Some(10));
        assert_eq!(config.large_loss, 100.0);
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = FitConfig::default();
        config.monitor.metrics = vec![
            TrackedMetric::minimize("loss"),
            TrackedMetric::maximize("acc"),
        ];
        config.intervals.log_iter_train = Some(5);
        config.intervals.test = None;
        config.scheduler = SchedulerConfig::Plateau {
            factor: 0.5,
            patience: 2,
            cooldown: 1,
            min_lr: 1e-6,
        };

        let text = config.to_toml_string().unwrap();
        let parsed: FitConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fit.toml");
        std::fs::write(
            &path,
            r#"
workdir = "/tmp/fit-run"
dry_run = true

[monitor]
patience = 3
max_epoch = 7

[dynamics]
batch_step = 4

[intervals]
cleanup = 2

[scheduler]
kind = "step"
base_lr = 0.1
step_size = 5
gamma = 0.5
"#,
        )
        .unwrap();

        let config = load_config(Some(&path), None).unwrap();
        assert_eq!(config.workdir, PathBuf::from("/tmp/fit-run"));
        assert!(config.dry_run);
        assert_eq!(config.monitor.patience, 3);
        assert_eq!(config.monitor.max_epoch, 7);
        assert_eq!(config.dynamics.batch_step, 4);
        assert_eq!(config.intervals.cleanup, Some(2));
        assert_eq!(config.intervals.vali, Some(1));
        assert!(matches!(config.scheduler, SchedulerConfig::Step { step_size: 5, .. }));
    }

    #[test]
    fn test_load_config_with_overrides() {
        let mut overrides = FitConfig::default();
        overrides.monitor.max_epoch = 2;
        let config = load_config(None, Some(&overrides)).unwrap();
        assert_eq!(config.monitor.max_epoch, 2);
    }

    #[test]
    fn test_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(Some(&dir.path().join("absent.toml")), None).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = FitConfig::default();
        config.dynamics.batch_step = 0;
        assert!(config.validate().is_err());

        let mut config = FitConfig::default();
        config.snapshots.num_keep = 0;
        assert!(config.validate().is_err());

        let mut config = FitConfig::default();
        config.intervals.snapshot = Some(0);
        assert!(config.validate().is_err());

        let mut config = FitConfig::default();
        config.snapshots.prefix = "a/b".into();
        assert!(config.validate().is_err());

        let mut config = FitConfig::default();
        config.scheduler = SchedulerConfig::Plateau {
            factor: 1.5,
            patience: 1,
            cooldown: 0,
            min_lr: 0.0,
        };
        assert!(config.validate().is_err());
    }
}
