//! Metric aggregation across batches and epochs.

use crate::error::{HarnessError, Result};
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Scalar metrics keyed by name, iterated in name order.
pub type MetricMap = BTreeMap<String, f64>;

/// Shared interface of the per-epoch and cross-epoch aggregators.
pub trait MovingAverage {
    /// Fold one set of samples in. Keys may differ between calls.
    fn update(&mut self, samples: &MetricMap);

    /// Current average per key.
    fn average(&self) -> MetricMap;

    fn reset(&mut self);
}

/// Running mean scoped to a single pass; reset at the start of every epoch.
///
/// Non-finite samples are excluded from both the sum and the count. A key
/// that was reported but never with a finite value averages to NaN, so
/// consumers see it as an anomaly rather than a missing metric.
#[derive(Debug, Clone, Default)]
pub struct CumulativeAverage {
    totals: HashMap<String, (f64, usize)>,
    ignored: usize,
}

impl CumulativeAverage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of non-finite samples dropped since the last reset.
    pub fn ignored(&self) -> usize {
        self.ignored
    }
}

impl MovingAverage for CumulativeAverage {
    fn update(&mut self, samples: &MetricMap) {
        for (name, &value) in samples {
            let entry = self.totals.entry(name.clone()).or_insert((0.0, 0));
            if !value.is_finite() {
                self.ignored += 1;
                tracing::warn!(metric = %name, value, "Ignoring non-finite metric sample");
                continue;
            }
            entry.0 += value;
            entry.1 += 1;
        }
    }

    fn average(&self) -> MetricMap {
        self.totals
            .iter()
            .map(|(name, &(sum, count))| {
                let mean = if count > 0 { sum / count as f64 } else { f64::NAN };
                (name.clone(), mean)
            })
            .collect()
    }

    fn reset(&mut self) {
        self.totals.clear();
        self.ignored = 0;
    }
}

/// Mean over the most recent `window` samples per key, kept across epochs.
///
/// Non-finite samples are skipped; a key with no finite sample yet is absent.
#[derive(Debug, Clone)]
pub struct WindowedAverage {
    window: usize,
    values: HashMap<String, VecDeque<f64>>,
}

impl WindowedAverage {
    /// A window of zero is treated as one.
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            values: HashMap::new(),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }
}

impl MovingAverage for WindowedAverage {
    fn update(&mut self, samples: &MetricMap) {
        let window = self.window;
        for (name, &value) in samples {
            if !value.is_finite() {
                tracing::warn!(metric = %name, value, "Ignoring non-finite metric sample");
                continue;
            }
            let queue = self
                .values
                .entry(name.clone())
                .or_insert_with(|| VecDeque::with_capacity(window));
            if queue.len() == window {
                queue.pop_front();
            }
            queue.push_back(value);
        }
    }

    fn average(&self) -> MetricMap {
        self.values
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(name, q)| (name.clone(), q.iter().sum::<f64>() / q.len() as f64))
            .collect()
    }

    fn reset(&mut self) {
        self.values.clear();
    }
}

/// Merge hook-provided metrics into `base`, refusing to shadow existing keys.
pub fn merge_disjoint(scope: &'static str, base: &mut MetricMap, extra: MetricMap) -> Result<()> {
    let conflicts: Vec<String> = extra
        .keys()
        .filter(|k| base.contains_key(*k))
        .cloned()
        .collect();
    if !conflicts.is_empty() {
        return Err(HarnessError::ConflictingMetrics {
            scope,
            keys: conflicts,
        });
    }
    base.extend(extra);
    Ok(())
}

/// One-line `name:value` rendering used in progress log lines.
pub fn format_metrics(metrics: &MetricMap) -> String {
    metrics
        .iter()
        .map(|(k, v)| format!("{k}:{v:.3}"))
        .collect::<Vec<_>>()
        .join(" | ")
}
