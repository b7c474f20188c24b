//! Single-batch execution with gradient accumulation and numeric guards.

use crate::collab::{Batch, Criterion, Model, Optimizer};
use crate::error::{HarnessError, Result};
use crate::interval::Split;

/// Where in the run a batch sits; used for cadence and log context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchContext {
    pub split: Split,
    pub epoch: usize,
    /// Zero-based index within the current pass.
    pub index: usize,
}

/// Result of one batch.
#[derive(Debug, Clone)]
pub struct BatchOutput<O> {
    pub outputs: O,
    /// Loss as reported for aggregation; non-finite values are already replaced.
    pub loss: f64,
    /// Whether this batch closed an accumulation group with an optimizer step.
    pub stepped: bool,
}

/// Runs forward/backward for one batch and applies the accumulation cadence.
#[derive(Debug, Clone)]
pub struct BatchRunner {
    batch_step: usize,
    large_loss: f64,
    large_loss_sentinel: f64,
    optimizer_steps: usize,
}

impl BatchRunner {
    pub fn new(batch_step: usize, large_loss: f64, large_loss_sentinel: f64) -> Self {
        Self {
            batch_step: batch_step.max(1),
            large_loss,
            large_loss_sentinel,
            optimizer_steps: 0,
        }
    }

    pub fn batch_step(&self) -> usize {
        self.batch_step
    }

    /// Optimizer updates applied since construction.
    pub fn optimizer_steps(&self) -> usize {
        self.optimizer_steps
    }

    fn closes_group(&self, index: usize) -> bool {
        (index + 1) % self.batch_step == 0
    }

    /// Execute one batch.
    ///
    /// With `learn` set, gradients accumulate through backward and the
    /// optimizer only steps when `(index + 1) % batch_step == 0`, zeroing
    /// gradients right after. A trailing partial group is left unapplied.
    pub fn run_batch<M, C, O>(
        &mut self,
        ctx: BatchContext,
        batch: &Batch<M::Input, C::Target>,
        learn: bool,
        model: &mut M,
        criterion: &mut C,
        optimizer: &mut O,
    ) -> Result<BatchOutput<M::Output>>
    where
        M: Model,
        C: Criterion<M>,
        O: Optimizer<M>,
    {
        let outputs = model
            .forward(&batch.input)
            .map_err(|e| collaborator_failure(ctx, "forward", e))?;
        let loss = criterion
            .compute(&outputs, &batch.target)
            .map_err(|e| collaborator_failure(ctx, "criterion", e))?;

        let mut stepped = false;
        if learn {
            model
                .backward(&loss.grad)
                .map_err(|e| collaborator_failure(ctx, "backward", e))?;
            if self.closes_group(ctx.index) {
                optimizer
                    .step(model)
                    .map_err(|e| collaborator_failure(ctx, "optimizer step", e))?;
                optimizer.zero_grad(model);
                self.optimizer_steps += 1;
                stepped = true;
            }
        }

        let value = if loss.value.is_finite() {
            loss.value
        } else {
            tracing::warn!(
                split = %ctx.split,
                epoch = ctx.epoch,
                batch = ctx.index,
                loss = loss.value,
                sentinel = self.large_loss_sentinel,
                "Non-finite loss, substituting sentinel"
            );
            self.large_loss_sentinel
        };

        // A replaced loss is checked even when the sentinel sits below `large_loss`.
        if ctx.split == Split::Train && (!loss.value.is_finite() || value > self.large_loss) {
            let sum = model.weight_sum();
            if !sum.is_finite() {
                tracing::error!(
                    epoch = ctx.epoch,
                    batch = ctx.index,
                    sum,
                    "Model weights are no longer finite"
                );
                return Err(HarnessError::NonFiniteWeights {
                    epoch: ctx.epoch,
                    batch: ctx.index,
                    sum,
                });
            }
            tracing::warn!(
                epoch = ctx.epoch,
                batch = ctx.index,
                loss = value,
                weight_sum = sum,
                "Large loss; weights still finite"
            );
        }

        Ok(BatchOutput {
            outputs,
            loss: value,
            stepped,
        })
    }
}

fn collaborator_failure(
    ctx: BatchContext,
    stage: &'static str,
    err: anyhow::Error,
) -> HarnessError {
    tracing::error!(
        split = %ctx.split,
        epoch = ctx.epoch,
        batch = ctx.index,
        stage,
        error = %err,
        "Collaborator failed while running a batch. Check that the loader yields \
         inputs the model accepts and that targets match the criterion"
    );
    HarnessError::collaborator(stage, err)
}
