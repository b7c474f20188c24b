//! Small reference collaborators: a linear regressor trained with SGD on
//! synthetic data. They exercise the loop end to end without a tensor library.

use crate::collab::{Batch, Criterion, LearningRates, Loader, Loss, Model, Optimizer};
use anyhow::{Context, bail, ensure};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Rows of features.
pub type Features = Vec<Vec<f64>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct LinearState {
    weights: Vec<f64>,
    bias: f64,
}

/// `y = w . x + b`, with gradients accumulated across backward calls.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearModel {
    weights: Vec<f64>,
    bias: f64,
    grad_weights: Vec<f64>,
    grad_bias: f64,
    training: bool,
    last_input: Option<Features>,
}

impl LinearModel {
    pub fn zeros(features: usize) -> Self {
        Self::new(vec![0.0; features], 0.0)
    }

    pub fn new(weights: Vec<f64>, bias: f64) -> Self {
        let n = weights.len();
        Self {
            weights,
            bias,
            grad_weights: vec![0.0; n],
            grad_bias: 0.0,
            training: true,
            last_input: None,
        }
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn bias(&self) -> f64 {
        self.bias
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Accumulated gradient norm; zero right after `zero_grad`.
    pub fn grad_norm(&self) -> f64 {
        let sq: f64 = self.grad_weights.iter().map(|g| g * g).sum::<f64>()
            + self.grad_bias * self.grad_bias;
        sq.sqrt()
    }

    fn zero_grad(&mut self) {
        self.grad_weights.iter_mut().for_each(|g| *g = 0.0);
        self.grad_bias = 0.0;
    }

    /// Visit every parameter with its accumulated gradient.
    fn visit_parameters(&mut self, mut f: impl FnMut(usize, &mut f64, f64)) {
        for (i, (w, g)) in self.weights.iter_mut().zip(&self.grad_weights).enumerate() {
            f(i, w, *g);
        }
        let n = self.weights.len();
        f(n, &mut self.bias, self.grad_bias);
    }
}

impl Model for LinearModel {
    type Input = Features;
    type Output = Vec<f64>;
    type Gradient = Vec<f64>;

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn forward(&mut self, input: &Features) -> anyhow::Result<Vec<f64>> {
        let mut out = Vec::with_capacity(input.len());
        for (row, x) in input.iter().enumerate() {
            ensure!(
                x.len() == self.weights.len(),
                "row {row} has {} features, model expects {}",
                x.len(),
                self.weights.len()
            );
            let y: f64 = self.weights.iter().zip(x).map(|(w, xi)| w * xi).sum();
            out.push(y + self.bias);
        }
        if self.training {
            self.last_input = Some(input.clone());
        }
        Ok(out)
    }

    fn backward(&mut self, grad: &Vec<f64>) -> anyhow::Result<()> {
        let Some(input) = self.last_input.take() else {
            bail!("backward called without a preceding training forward pass");
        };
        ensure!(
            grad.len() == input.len(),
            "gradient has {} rows, forward saw {}",
            grad.len(),
            input.len()
        );
        for (g, x) in grad.iter().zip(&input) {
            for (gw, xi) in self.grad_weights.iter_mut().zip(x) {
                *gw += g * xi;
            }
            self.grad_bias += g;
        }
        Ok(())
    }

    fn weight_sum(&self) -> f64 {
        self.weights.iter().sum::<f64>() + self.bias
    }

    fn num_parameters(&self) -> usize {
        self.weights.len() + 1
    }

    fn state_dict(&self) -> anyhow::Result<Value> {
        Ok(serde_json::to_value(LinearState {
            weights: self.weights.clone(),
            bias: self.bias,
        })?)
    }

    fn load_state_dict(&mut self, state: Value) -> anyhow::Result<()> {
        let state: LinearState =
            serde_json::from_value(state).context("invalid linear model state")?;
        ensure!(
            state.weights.len() == self.weights.len(),
            "state has {} weights, model has {}",
            state.weights.len(),
            self.weights.len()
        );
        self.weights = state.weights;
        self.bias = state.bias;
        self.zero_grad();
        Ok(())
    }
}

/// Mean squared error.
#[derive(Debug, Clone, Copy, Default)]
pub struct MseCriterion;

impl Criterion<LinearModel> for MseCriterion {
    type Target = Vec<f64>;

    fn compute(&mut self, outputs: &Vec<f64>, target: &Vec<f64>) -> anyhow::Result<Loss<Vec<f64>>> {
        ensure!(
            outputs.len() == target.len(),
            "{} outputs for {} targets",
            outputs.len(),
            target.len()
        );
        ensure!(!outputs.is_empty(), "empty batch");
        let n = outputs.len() as f64;
        let diff: Vec<f64> = outputs.iter().zip(target).map(|(y, t)| y - t).collect();
        let value = diff.iter().map(|d| d * d).sum::<f64>() / n;
        let grad = diff.iter().map(|d| 2.0 * d / n).collect();
        Ok(Loss { value, grad })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SgdState {
    learning_rates: Vec<f64>,
    momentum: f64,
    velocity: Vec<f64>,
    steps: usize,
}

/// Stochastic gradient descent with optional momentum and a single parameter group.
#[derive(Debug, Clone, PartialEq)]
pub struct Sgd {
    learning_rates: Vec<f64>,
    momentum: f64,
    velocity: Vec<f64>,
    steps: usize,
}

impl Sgd {
    pub fn new(lr: f64) -> Self {
        Self {
            learning_rates: vec![lr],
            momentum: 0.0,
            velocity: Vec::new(),
            steps: 0,
        }
    }

    pub fn with_momentum(mut self, momentum: f64) -> Self {
        self.momentum = momentum;
        self
    }

    /// Number of parameter updates applied.
    pub fn steps(&self) -> usize {
        self.steps
    }
}

impl LearningRates for Sgd {
    fn learning_rates(&self) -> Vec<f64> {
        self.learning_rates.clone()
    }

    fn set_learning_rates(&mut self, lrs: &[f64]) {
        self.learning_rates = lrs.to_vec();
    }
}

impl Optimizer<LinearModel> for Sgd {
    fn step(&mut self, model: &mut LinearModel) -> anyhow::Result<()> {
        let lr = self.learning_rates.first().copied().context("optimizer has no parameter group")?;
        let momentum = self.momentum;
        if self.velocity.len() != model.num_parameters() {
            self.velocity = vec![0.0; model.num_parameters()];
        }
        let velocity = &mut self.velocity;
        model.visit_parameters(|i, param, grad| {
            velocity[i] = momentum * velocity[i] + grad;
            *param -= lr * velocity[i];
        });
        self.steps += 1;
        Ok(())
    }

    fn zero_grad(&mut self, model: &mut LinearModel) {
        model.zero_grad();
    }

    fn state_dict(&self) -> anyhow::Result<Value> {
        Ok(serde_json::to_value(SgdState {
            learning_rates: self.learning_rates.clone(),
            momentum: self.momentum,
            velocity: self.velocity.clone(),
            steps: self.steps,
        })?)
    }

    fn load_state_dict(&mut self, state: Value) -> anyhow::Result<()> {
        let state: SgdState = serde_json::from_value(state).context("invalid SGD state")?;
        self.learning_rates = state.learning_rates;
        self.momentum = state.momentum;
        self.velocity = state.velocity;
        self.steps = state.steps;
        Ok(())
    }
}

/// In-memory loader over pre-built batches.
#[derive(Debug, Clone, PartialEq)]
pub struct VecLoader {
    batches: Vec<Batch<Features, Vec<f64>>>,
    batch_size: usize,
}

impl VecLoader {
    pub fn new(batches: Vec<Batch<Features, Vec<f64>>>) -> Self {
        let batch_size = batches.first().map(|b| b.target.len()).unwrap_or(0);
        Self {
            batches,
            batch_size,
        }
    }

    /// Noisy samples of `y = w . x + b` with features drawn from `[-1, 1)`.
    pub fn synthetic(
        num_batches: usize,
        batch_size: usize,
        weights: &[f64],
        bias: f64,
        noise: f64,
        seed: u64,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let batches = (0..num_batches)
            .map(|_| {
                let mut input = Vec::with_capacity(batch_size);
                let mut target = Vec::with_capacity(batch_size);
                for _ in 0..batch_size {
                    let x: Vec<f64> = weights.iter().map(|_| rng.gen_range(-1.0..1.0)).collect();
                    let y: f64 = weights.iter().zip(&x).map(|(w, xi)| w * xi).sum::<f64>()
                        + bias
                        + noise * rng.gen_range(-1.0..1.0);
                    input.push(x);
                    target.push(y);
                }
                Batch { input, target }
            })
            .collect();
        Self {
            batches,
            batch_size,
        }
    }
}

impl Loader for VecLoader {
    type Input = Features;
    type Target = Vec<f64>;

    fn len(&self) -> usize {
        self.batches.len()
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn batches(
        &mut self,
    ) -> Box<dyn Iterator<Item = anyhow::Result<Batch<Features, Vec<f64>>>> + '_> {
        Box::new(self.batches.iter().cloned().map(Ok))
    }
}
