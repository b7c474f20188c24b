//! # fitloop-core
//!
//! Training orchestration for opaque learnable models: epoch and batch
//! sequencing, gradient accumulation, metric aggregation, multi-metric early
//! stopping, learning-rate scheduling and checkpoint retention.
//!
//! The model, criterion, optimizer and data loaders are supplied through the
//! traits in [`collab`]; the loop only sequences calls and reacts to their
//! scalar results.

pub mod batch;
pub mod collab;
pub mod config;
pub mod error;
pub mod harness;
pub mod interval;
pub mod metrics;
pub mod monitor;
pub mod persistence;
pub mod scheduler;
pub mod snapshot;
pub mod toy;

pub use batch::{BatchContext, BatchOutput, BatchRunner};
pub use collab::{
    Batch, Criterion, LearningRates, Loader, Loss, Model, NoHooks, Optimizer, TrainingHooks,
};
pub use config::{DynamicsConfig, FitConfig, load_config};
pub use error::{ConfigError, HarnessError, Result, SnapshotError};
pub use harness::{
    EpochOutcome, Harness, HarnessState, Loaders, ResetMode, RunSummary, StopReason,
    TrainingState,
};
pub use interval::{Action, Intervals, Split, should_fire};
pub use metrics::{CumulativeAverage, MetricMap, MovingAverage, WindowedAverage};
pub use monitor::{Direction, Monitor, MonitorConfig, MonitorState, TrackedMetric};
pub use scheduler::{LrPoint, LrScheduler, SchedulerConfig};
pub use snapshot::{Checkpoint, SnapshotConfig, SnapshotManager, retention_set};
