//! Periodic-action gating.
//!
//! Every recurring action in the loop (progress display, iteration logging,
//! validation, testing, snapshotting, cleanup) is keyed by a named cadence in
//! [`Intervals`]. A cadence of `None` disables the action.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Returns `true` when an action with the given periodicity should fire at `index`.
///
/// `index` is zero-based, so a periodicity of `n` fires on indices
/// `n - 1`, `2n - 1`, ...
pub fn should_fire(periodicity: Option<usize>, index: usize) -> bool {
    match periodicity {
        None | Some(0) => false,
        Some(n) => (index + 1) % n == 0,
    }
}

/// Data split a pass runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Vali,
    Test,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Train, Split::Vali, Split::Test];

    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Vali => "vali",
            Split::Test => "test",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named periodic action consulted by the training loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Refresh the moving-average display for a split (batch index).
    Display(Split),
    /// Emit iteration-level scalars for a split (batch index).
    LogIter(Split),
    /// Run a validation pass (epoch index).
    Validate,
    /// Run a test pass (epoch index).
    Test,
    /// Save a checkpoint even without improvement (epoch index).
    Snapshot,
    /// Retire checkpoints outside the retention set (epoch index).
    Cleanup,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Display(split) => write!(f, "display_{split}"),
            Action::LogIter(split) => write!(f, "log_iter_{split}"),
            Action::Validate => write!(f, "vali"),
            Action::Test => write!(f, "test"),
            Action::Snapshot => write!(f, "snapshot"),
            Action::Cleanup => write!(f, "cleanup"),
        }
    }
}

/// Cadence of each periodic action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Intervals {
    pub display_train: Option<usize>,
    pub display_vali: Option<usize>,
    pub display_test: Option<usize>,
    pub log_iter_train: Option<usize>,
    pub log_iter_vali: Option<usize>,
    pub log_iter_test: Option<usize>,
    pub vali: Option<usize>,
    pub test: Option<usize>,
    /// How often to save a checkpoint when the monitor saw no improvement.
    pub snapshot: Option<usize>,
    /// How often to remove checkpoints outside the retention set.
    pub cleanup: Option<usize>,
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            display_train: Some(1),
            display_vali: Some(1),
            display_test: Some(1),
            log_iter_train: None,
            log_iter_vali: None,
            log_iter_test: None,
            vali: Some(1),
            test: Some(1),
            snapshot: Some(1),
            cleanup: Some(10),
        }
    }
}

impl Intervals {
    pub fn periodicity(&self, action: Action) -> Option<usize> {
        match action {
            Action::Display(Split::Train) => self.display_train,
            Action::Display(Split::Vali) => self.display_vali,
            Action::Display(Split::Test) => self.display_test,
            Action::LogIter(Split::Train) => self.log_iter_train,
            Action::LogIter(Split::Vali) => self.log_iter_vali,
            Action::LogIter(Split::Test) => self.log_iter_test,
            Action::Validate => self.vali,
            Action::Test => self.test,
            Action::Snapshot => self.snapshot,
            Action::Cleanup => self.cleanup,
        }
    }

    /// Check whether `action` fires at `index`.
    pub fn check(&self, action: Action, index: usize) -> bool {
        should_fire(self.periodicity(action), index)
    }

    /// Reject zero periodicities; use `None` to disable an action.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let actions = Split::ALL
            .iter()
            .flat_map(|&s| [Action::Display(s), Action::LogIter(s)])
            .chain([
                Action::Validate,
                Action::Test,
                Action::Snapshot,
                Action::Cleanup,
            ]);
        for action in actions {
            if self.periodicity(action) == Some(0) {
                return Err(ConfigError::invalid(
                    format!("intervals.{action}"),
                    "periodicity must be > 0 (omit it to disable the action)",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_never_fires() {
        for i in 0..50 {
            assert!(!should_fire(None, i));
        }
    }

    #[test]
    fn test_every_third_index() {
        let fired: Vec<usize> = (0..10).filter(|&i| should_fire(Some(3), i)).collect();
        assert_eq!(fired, vec![2, 5, 8]);
    }

    #[test]
    fn test_period_one_always_fires() {
        assert!((0..20).all(|i| should_fire(Some(1), i)));
    }

    #[test]
    fn test_default_intervals() {
        let intervals = Intervals::default();
        assert!(intervals.check(Action::Validate, 0));
        assert!(!intervals.check(Action::LogIter(Split::Train), 0));
        assert!(!intervals.check(Action::Cleanup, 8));
        assert!(intervals.check(Action::Cleanup, 9));
    }

    #[test]
    fn test_zero_periodicity_rejected() {
        let intervals = Intervals {
            log_iter_vali: Some(0),
            ..Default::default()
        };
        let err = intervals.validate().unwrap_err();
        assert!(err.to_string().contains("intervals.log_iter_vali"));
    }

    #[test]
    fn test_action_names() {
        assert_eq!(Action::Display(Split::Test).to_string(), "display_test");
        assert_eq!(Action::Validate.to_string(), "vali");
        assert_eq!(Split::Vali.to_string(), "vali");
    }
}
