//! Contracts of the external collaborators the training loop drives.
//!
//! The loop never looks inside tensors or gradients. It only sequences calls
//! to these traits and interprets their scalar results.

use crate::interval::Split;
use crate::metrics::MetricMap;
use serde_json::Value;

/// A learnable model.
pub trait Model {
    type Input;
    type Output;
    /// Gradient of the loss with respect to [`Model::Output`].
    type Gradient;

    /// Switch between training and evaluation behaviour (dropout, batch norm, ...).
    fn set_training(&mut self, training: bool);

    fn forward(&mut self, input: &Self::Input) -> anyhow::Result<Self::Output>;

    /// Accumulate parameter gradients for the most recent forward pass.
    fn backward(&mut self, grad: &Self::Gradient) -> anyhow::Result<()>;

    /// Sum over every parameter, used as a cheap corruption probe.
    fn weight_sum(&self) -> f64;

    fn num_parameters(&self) -> usize;

    fn state_dict(&self) -> anyhow::Result<Value>;

    fn load_state_dict(&mut self, state: Value) -> anyhow::Result<()>;
}

/// Scalar loss plus the gradient fed back into [`Model::backward`].
#[derive(Debug, Clone)]
pub struct Loss<G> {
    pub value: f64,
    pub grad: G,
}

/// Loss function over model outputs and targets.
pub trait Criterion<M: Model> {
    type Target;

    fn compute(
        &mut self,
        outputs: &M::Output,
        target: &Self::Target,
    ) -> anyhow::Result<Loss<M::Gradient>>;
}

/// Read/write access to per-group learning rates.
pub trait LearningRates {
    fn learning_rates(&self) -> Vec<f64>;

    fn set_learning_rates(&mut self, lrs: &[f64]);
}

/// Parameter update rule.
pub trait Optimizer<M: Model>: LearningRates {
    /// Apply accumulated gradients to the model parameters.
    fn step(&mut self, model: &mut M) -> anyhow::Result<()>;

    fn zero_grad(&mut self, model: &mut M);

    fn state_dict(&self) -> anyhow::Result<Value>;

    fn load_state_dict(&mut self, state: Value) -> anyhow::Result<()>;
}

/// One unit of data: model input and criterion target.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch<I, T> {
    pub input: I,
    pub target: T,
}

/// Source of batches for one data split.
///
/// Every pass asks for a fresh iterator; iterators are not restarted mid-way.
pub trait Loader {
    type Input;
    type Target;

    /// Number of batches a full pass yields.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn batch_size(&self) -> usize;

    fn batches(
        &mut self,
    ) -> Box<dyn Iterator<Item = anyhow::Result<Batch<Self::Input, Self::Target>>> + '_>;
}

/// Optional user hooks that contribute extra metrics.
///
/// Returned keys must not collide with the loop's own keys (`loss`).
pub trait TrainingHooks<M: Model> {
    /// Called after every batch with the model outputs and the scalar loss.
    fn on_batch(&mut self, _split: Split, _outputs: &M::Output, _loss: f64) -> MetricMap {
        MetricMap::new()
    }

    /// Called after every pass over a split.
    fn on_epoch(&mut self, _split: Split, _epoch: usize) -> MetricMap {
        MetricMap::new()
    }
}

/// Hooks that contribute nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl<M: Model> TrainingHooks<M> for NoHooks {}
