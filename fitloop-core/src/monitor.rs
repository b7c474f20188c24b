//! Multi-metric improvement tracking and early stopping.
//!
//! The monitor compares epochs lexicographically over its tracked metrics in
//! configuration order: the first metric whose value moved by more than
//! `min_delta` relative to the best epoch decides the verdict, metrics within
//! `min_delta` defer to the next one, and a full tie is not an improvement.
//! Non-finite values never count as an improvement.

use crate::error::{ConfigError, HarnessError, Result};
use crate::metrics::MetricMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Whether smaller or larger values of a metric are better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Minimize,
    Maximize,
}

impl Direction {
    fn improves(self, candidate: f64, best: f64, min_delta: f64) -> bool {
        if !candidate.is_finite() {
            return false;
        }
        if !best.is_finite() {
            return true;
        }
        match self {
            Direction::Minimize => candidate < best - min_delta,
            Direction::Maximize => candidate > best + min_delta,
        }
    }

    fn regresses(self, candidate: f64, best: f64, min_delta: f64) -> bool {
        if !candidate.is_finite() {
            return true;
        }
        if !best.is_finite() {
            return false;
        }
        match self {
            Direction::Minimize => candidate > best + min_delta,
            Direction::Maximize => candidate < best - min_delta,
        }
    }

    /// Ordering where the better value sorts first.
    fn rank(self, a: f64, b: f64) -> std::cmp::Ordering {
        match self {
            Direction::Minimize => a.total_cmp(&b),
            Direction::Maximize => b.total_cmp(&a),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Minimize => write!(f, "minimize"),
            Direction::Maximize => write!(f, "maximize"),
        }
    }
}

/// A metric the monitor watches, with its direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedMetric {
    pub name: String,
    pub direction: Direction,
}

impl TrackedMetric {
    pub fn minimize(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: Direction::Minimize,
        }
    }

    pub fn maximize(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: Direction::Maximize,
        }
    }
}

/// Monitor settings. The first tracked metric is the primary one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub metrics: Vec<TrackedMetric>,
    /// Consecutive non-improving updates tolerated before the run is done.
    pub patience: usize,
    /// Number of epochs after which the run always stops.
    pub max_epoch: usize,
    /// Minimum change that counts as a real difference.
    pub min_delta: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            metrics: vec![TrackedMetric::minimize("loss")],
            patience: 10,
            max_epoch: 100,
            min_delta: 0.0,
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.metrics.is_empty() {
            return Err(ConfigError::invalid(
                "monitor.metrics",
                "at least one metric must be tracked",
            ));
        }
        let mut seen = HashSet::new();
        for metric in &self.metrics {
            if !seen.insert(metric.name.as_str()) {
                return Err(ConfigError::invalid(
                    "monitor.metrics",
                    format!("metric '{}' is listed more than once", metric.name),
                ));
            }
        }
        if !self.min_delta.is_finite() || self.min_delta < 0.0 {
            return Err(ConfigError::invalid(
                "monitor.min_delta",
                "must be a finite, non-negative number",
            ));
        }
        Ok(())
    }
}

/// One observation of a tracked metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MonitorRecord {
    pub epoch: usize,
    #[serde(with = "nullable_f64")]
    pub value: f64,
}

/// JSON has no NaN; non-finite values travel as `null` and come back as NaN.
mod nullable_f64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, s: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            s.serialize_f64(*value)
        } else {
            s.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(d)?.unwrap_or(f64::NAN))
    }
}

/// The epoch currently considered best, with its tracked values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestEntry {
    pub epoch: usize,
    pub values: MetricMap,
}

/// Serializable snapshot of a [`Monitor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorState {
    pub metrics: Vec<TrackedMetric>,
    pub patience: usize,
    pub max_epoch: usize,
    pub min_delta: f64,
    pub history: BTreeMap<String, Vec<MonitorRecord>>,
    pub best: Option<BestEntry>,
    pub bad_updates: usize,
}

/// Tracks metric history, decides improvement, and signals stalls.
#[derive(Debug, Clone)]
pub struct Monitor {
    metrics: Vec<TrackedMetric>,
    patience: usize,
    max_epoch: usize,
    min_delta: f64,
    history: BTreeMap<String, Vec<MonitorRecord>>,
    best: Option<BestEntry>,
    bad_updates: usize,
}

impl Monitor {
    pub fn new(config: &MonitorConfig) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            metrics: config.metrics.clone(),
            patience: config.patience,
            max_epoch: config.max_epoch,
            min_delta: config.min_delta,
            history: BTreeMap::new(),
            best: None,
            bad_updates: 0,
        })
    }

    pub fn patience(&self) -> usize {
        self.patience
    }

    pub fn max_epoch(&self) -> usize {
        self.max_epoch
    }

    pub fn metrics(&self) -> &[TrackedMetric] {
        &self.metrics
    }

    pub fn bad_updates(&self) -> usize {
        self.bad_updates
    }

    pub fn best(&self) -> Option<&BestEntry> {
        self.best.as_ref()
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best.as_ref().map(|b| b.epoch)
    }

    pub fn history(&self, metric: &str) -> &[MonitorRecord] {
        self.history.get(metric).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Record the tracked metrics of `epoch`; returns whether it improved on the best so far.
    ///
    /// Untracked keys in `metrics` are ignored. A missing tracked key is an error.
    pub fn update(&mut self, epoch: usize, metrics: &MetricMap) -> Result<bool> {
        let mut values = MetricMap::new();
        for tracked in &self.metrics {
            let value = metrics.get(&tracked.name).copied().ok_or_else(|| {
                HarnessError::monitor(format!(
                    "tracked metric '{}' missing from epoch {epoch} metrics",
                    tracked.name
                ))
            })?;
            values.insert(tracked.name.clone(), value);
        }

        for (name, &value) in &values {
            self.history
                .entry(name.clone())
                .or_default()
                .push(MonitorRecord { epoch, value });
        }

        let improved = self.judge(epoch, values);
        tracing::debug!(
            epoch,
            improved,
            bad_updates = self.bad_updates,
            "Monitor updated"
        );
        Ok(improved)
    }

    fn judge(&mut self, epoch: usize, values: MetricMap) -> bool {
        let finite = values.values().all(|v| v.is_finite());
        let improved = finite
            && match &self.best {
                None => true,
                Some(best) => self.dominates(&values, &best.values),
            };
        if improved {
            self.best = Some(BestEntry { epoch, values });
            self.bad_updates = 0;
        } else {
            self.bad_updates += 1;
        }
        improved
    }

    fn dominates(&self, candidate: &MetricMap, best: &MetricMap) -> bool {
        for tracked in &self.metrics {
            let c = candidate[&tracked.name];
            let b = best.get(&tracked.name).copied().unwrap_or(f64::NAN);
            if tracked.direction.improves(c, b, self.min_delta) {
                return true;
            }
            if tracked.direction.regresses(c, b, self.min_delta) {
                return false;
            }
        }
        false
    }

    /// Epochs ranked best-first for every tracked metric. Ties keep the earlier epoch first.
    pub fn best_epochs(&self) -> BTreeMap<String, Vec<usize>> {
        self.metrics
            .iter()
            .map(|tracked| {
                let mut records: Vec<MonitorRecord> = self
                    .history(&tracked.name)
                    .iter()
                    .filter(|r| r.value.is_finite())
                    .copied()
                    .collect();
                records.sort_by(|a, b| {
                    tracked
                        .direction
                        .rank(a.value, b.value)
                        .then(a.epoch.cmp(&b.epoch))
                });
                (
                    tracked.name.clone(),
                    records.into_iter().map(|r| r.epoch).collect(),
                )
            })
            .collect()
    }

    /// True once more than `patience` consecutive updates failed to improve.
    pub fn is_done(&self) -> bool {
        self.bad_updates > self.patience
    }

    /// One-line status for progress logs.
    pub fn message(&self) -> String {
        match &self.best {
            None => "monitor: no validation yet".to_string(),
            Some(best) => {
                let primary = &self.metrics[0].name;
                let last = self
                    .history(primary)
                    .last()
                    .map(|r| format!("{:.4}", r.value))
                    .unwrap_or_else(|| "n/a".into());
                let best_value = best
                    .values
                    .get(primary)
                    .map(|v| format!("{v:.4}"))
                    .unwrap_or_else(|| "n/a".into());
                format!(
                    "vali {primary}:{last} best:{best_value} @ epoch {} | bad {}/{}",
                    best.epoch, self.bad_updates, self.patience
                )
            }
        }
    }

    pub fn state_dict(&self) -> MonitorState {
        MonitorState {
            metrics: self.metrics.clone(),
            patience: self.patience,
            max_epoch: self.max_epoch,
            min_delta: self.min_delta,
            history: self.history.clone(),
            best: self.best.clone(),
            bad_updates: self.bad_updates,
        }
    }

    /// Restore history from a snapshot.
    ///
    /// The configured `patience`, `max_epoch` and `min_delta` are kept. When
    /// the snapshot tracked a different metric list, the history is replayed
    /// under the configured metrics instead of trusting the stored verdicts.
    pub fn load_state_dict(&mut self, state: MonitorState) {
        self.history = state.history;
        if state.metrics == self.metrics && state.min_delta == self.min_delta {
            self.best = state.best;
            self.bad_updates = state.bad_updates;
        } else {
            tracing::warn!(
                "Monitor snapshot tracked different metrics; replaying history under current settings"
            );
            self.replay();
        }
        if state.patience != self.patience {
            tracing::info!(
                saved = state.patience,
                current = self.patience,
                "Keeping configured monitor patience over snapshot value"
            );
        }
    }

    fn replay(&mut self) {
        self.best = None;
        self.bad_updates = 0;
        let mut by_epoch: BTreeMap<usize, MetricMap> = BTreeMap::new();
        for (name, records) in &self.history {
            for record in records {
                by_epoch
                    .entry(record.epoch)
                    .or_default()
                    .insert(name.clone(), record.value);
            }
        }
        for (epoch, values) in by_epoch {
            let complete: Option<MetricMap> = self
                .metrics
                .iter()
                .map(|t| values.get(&t.name).map(|v| (t.name.clone(), *v)))
                .collect();
            if let Some(values) = complete {
                self.judge(epoch, values);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn loss_only(patience: usize) -> Monitor {
        Monitor::new(&MonitorConfig {
            patience,
            ..Default::default()
        })
        .unwrap()
    }

    fn m(pairs: &[(&str, f64)]) -> MetricMap {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_first_update_improves() {
        let mut mon = loss_only(2);
        assert!(mon.update(0, &m(&[("loss", 1.0)])).unwrap());
        assert_eq!(mon.best_epoch(), Some(0));
    }

    #[test]
    fn test_patience_exact_boundary() {
        let patience = 3;
        let mut mon = loss_only(patience);
        mon.update(0, &m(&[("loss", 1.0)])).unwrap();
        for epoch in 1..=patience {
            assert!(!mon.update(epoch, &m(&[("loss", 2.0)])).unwrap());
            assert!(!mon.is_done(), "done too early at epoch {epoch}");
        }
        mon.update(patience + 1, &m(&[("loss", 2.0)])).unwrap();
        assert!(mon.is_done());
    }

    #[test]
    fn test_improvement_resets_bad_count() {
        let mut mon = loss_only(1);
        mon.update(0, &m(&[("loss", 1.0)])).unwrap();
        mon.update(1, &m(&[("loss", 1.5)])).unwrap();
        assert_eq!(mon.bad_updates(), 1);
        assert!(mon.update(2, &m(&[("loss", 0.5)])).unwrap());
        assert_eq!(mon.bad_updates(), 0);
        assert!(!mon.is_done());
    }

    #[test]
    fn test_min_delta_blocks_tiny_gains() {
        let mut mon = Monitor::new(&MonitorConfig {
            min_delta: 0.1,
            ..Default::default()
        })
        .unwrap();
        mon.update(0, &m(&[("loss", 1.0)])).unwrap();
        assert!(!mon.update(1, &m(&[("loss", 0.95)])).unwrap());
        assert!(mon.update(2, &m(&[("loss", 0.85)])).unwrap());
    }

    #[test]
    fn test_secondary_metric_breaks_ties() {
        let mut mon = Monitor::new(&MonitorConfig {
            metrics: vec![TrackedMetric::minimize("loss"), TrackedMetric::maximize("acc")],
            ..Default::default()
        })
        .unwrap();
        mon.update(0, &m(&[("loss", 1.0), ("acc", 0.5)])).unwrap();
        // equal primary, better secondary
        assert!(mon.update(1, &m(&[("loss", 1.0), ("acc", 0.6)])).unwrap());
        // worse primary wins over better secondary
        assert!(!mon.update(2, &m(&[("loss", 1.1), ("acc", 0.9)])).unwrap());
        // full tie is not an improvement
        assert!(!mon.update(3, &m(&[("loss", 1.0), ("acc", 0.6)])).unwrap());
    }

    #[test]
    fn test_nan_never_improves() {
        let mut mon = loss_only(5);
        assert!(!mon.update(0, &m(&[("loss", f64::NAN)])).unwrap());
        assert!(mon.update(1, &m(&[("loss", 3.0)])).unwrap());
        assert!(!mon.update(2, &m(&[("loss", f64::NAN)])).unwrap());
    }

    #[test]
    fn test_non_finite_history_survives_serialization() {
        let mut mon = loss_only(5);
        mon.update(0, &m(&[("loss", 1.0)])).unwrap();
        mon.update(1, &m(&[("loss", f64::INFINITY)])).unwrap();
        let json = serde_json::to_string(&mon.state_dict()).unwrap();
        let state: MonitorState = serde_json::from_str(&json).unwrap();
        assert!(state.history["loss"][1].value.is_nan());
        assert_eq!(state.best.unwrap().epoch, 0);
    }

    #[test]
    fn test_missing_metric_is_error() {
        let mut mon = loss_only(1);
        let err = mon.update(0, &m(&[("acc", 1.0)])).unwrap_err();
        assert!(err.to_string().contains("'loss'"));
    }

    #[test]
    fn test_best_epochs_ranking() {
        let mut mon = Monitor::new(&MonitorConfig {
            metrics: vec![TrackedMetric::minimize("loss"), TrackedMetric::maximize("acc")],
            ..Default::default()
        })
        .unwrap();
        mon.update(0, &m(&[("loss", 3.0), ("acc", 0.1)])).unwrap();
        mon.update(1, &m(&[("loss", 1.0), ("acc", 0.3)])).unwrap();
        mon.update(2, &m(&[("loss", 2.0), ("acc", 0.9)])).unwrap();
        mon.update(3, &m(&[("loss", 1.0), ("acc", 0.2)])).unwrap();

        let ranks = mon.best_epochs();
        assert_eq!(ranks["loss"], vec![1, 3, 2, 0]);
        assert_eq!(ranks["acc"], vec![2, 1, 3, 0]);
    }

    #[test]
    fn test_state_roundtrip_keeps_current_patience() {
        let mut mon = loss_only(2);
        mon.update(0, &m(&[("loss", 1.0)])).unwrap();
        mon.update(1, &m(&[("loss", 2.0)])).unwrap();
        let state = mon.state_dict();

        let json = serde_json::to_string(&state).unwrap();
        let state: MonitorState = serde_json::from_str(&json).unwrap();

        let mut resumed = loss_only(7);
        resumed.load_state_dict(state.clone());
        assert_eq!(resumed.patience(), 7);
        assert_eq!(resumed.bad_updates(), 1);
        assert_eq!(resumed.best_epoch(), Some(0));
        assert_eq!(resumed.history("loss"), mon.history("loss"));

        let mut expected = state;
        expected.patience = 7;
        assert_eq!(resumed.state_dict(), expected);
    }

    #[test]
    fn test_load_replays_when_metrics_change() {
        let mut mon = Monitor::new(&MonitorConfig {
            metrics: vec![TrackedMetric::maximize("acc"), TrackedMetric::minimize("loss")],
            ..Default::default()
        })
        .unwrap();
        mon.update(0, &m(&[("loss", 1.0), ("acc", 0.9)])).unwrap();
        mon.update(1, &m(&[("loss", 0.5), ("acc", 0.1)])).unwrap();
        assert_eq!(mon.best_epoch(), Some(0));

        let mut loss_first = loss_only(3);
        loss_first.load_state_dict(mon.state_dict());
        assert_eq!(loss_first.best_epoch(), Some(1));
        assert_eq!(loss_first.bad_updates(), 0);
    }

    #[test]
    fn test_config_rejects_duplicates() {
        let config = MonitorConfig {
            metrics: vec![TrackedMetric::minimize("loss"), TrackedMetric::maximize("loss")],
            ..Default::default()
        };
        assert!(Monitor::new(&config).is_err());
        let config = MonitorConfig {
            metrics: vec![],
            ..Default::default()
        };
        assert!(Monitor::new(&config).is_err());
    }

    #[test]
    fn test_message_mentions_best_epoch() {
        let mut mon = loss_only(4);
        assert!(mon.message().contains("no validation"));
        mon.update(0, &m(&[("loss", 0.25)])).unwrap();
        mon.update(1, &m(&[("loss", 0.5)])).unwrap();
        let msg = mon.message();
        assert!(msg.contains("best:0.2500 @ epoch 0"), "{msg}");
        assert!(msg.contains("bad 1/4"), "{msg}");
    }
}
