//! Error types for the fitloop training engine.
//!
//! Uses `thiserror` for structured variants covering configuration,
//! checkpoint storage, collaborator failures, and the fatal conditions the
//! training loop refuses to paper over.

use std::path::PathBuf;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Top-level error type for the training harness.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("{stage} failed: {source}")]
    Collaborator {
        stage: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("Non-finite model weights detected at epoch {epoch}, batch {batch}: sum = {sum}")]
    NonFiniteWeights { epoch: usize, batch: usize, sum: f64 },

    #[error("Conflicting {scope} metrics: {}", .keys.join(", "))]
    ConflictingMetrics {
        scope: &'static str,
        keys: Vec<String>,
    },

    #[error(
        "Scheduler '{scheduler}' requires a validation result for epoch {epoch}, but none was produced"
    )]
    StaleValidation {
        scheduler: &'static str,
        epoch: usize,
    },

    #[error("Monitor error: {0}")]
    Monitor(String),

    #[error("Harness is in state '{actual}', expected '{expected}'")]
    InvalidState {
        expected: &'static str,
        actual: String,
    },

    #[error("Split '{0}' has no loader")]
    MissingSplit(String),

    #[error("Split '{split}' has {len} batches, index {index} is out of range")]
    BatchOutOfRange {
        split: String,
        index: usize,
        len: usize,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HarnessError {
    pub fn collaborator(stage: &'static str, source: anyhow::Error) -> Self {
        Self::Collaborator { stage, source }
    }

    pub fn monitor(msg: impl Into<String>) -> Self {
        Self::Monitor(msg.into())
    }
}

/// Errors from configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Invalid value for '{field}': {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Errors from checkpoint persistence.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("Corrupt checkpoint {}: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("No checkpoint for epoch {epoch} in {}", .dir.display())]
    NotFound { epoch: usize, dir: PathBuf },

    #[error("Failed to write checkpoint {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SnapshotError {
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        Self::Corrupt {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the caller should fall back to an older checkpoint.
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }
}
