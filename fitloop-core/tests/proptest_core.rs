//! Property-based tests for core components using proptest.

use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

use fitloop_core::batch::{BatchContext, BatchRunner};
use fitloop_core::collab::{Batch, LearningRates};
use fitloop_core::interval::{Split, should_fire};
use fitloop_core::metrics::MetricMap;
use fitloop_core::monitor::{Monitor, MonitorConfig};
use fitloop_core::scheduler::{LrScheduler, SchedulerConfig};
use fitloop_core::snapshot::{Checkpoint, SnapshotConfig, SnapshotManager, retention_set};
use fitloop_core::toy::{LinearModel, MseCriterion, Sgd};

// --- Interval gate ---

proptest! {
    #[test]
    fn gate_matches_modulo(n in 1usize..50, i in 0usize..10_000) {
        prop_assert_eq!(should_fire(Some(n), i), (i + 1) % n == 0);
    }

    #[test]
    fn gate_disabled_never_fires(i in 0usize..10_000) {
        prop_assert!(!should_fire(None, i));
    }

    #[test]
    fn gate_fires_floor_times(n in 1usize..50, len in 0usize..500) {
        let fired = (0..len).filter(|&i| should_fire(Some(n), i)).count();
        prop_assert_eq!(fired, len / n);
    }
}

// --- Gradient accumulation ---

proptest! {
    #[test]
    fn accumulation_steps_floor_b_over_s(batches in 0usize..40, batch_step in 1usize..9) {
        let mut runner = BatchRunner::new(batch_step, 100.0, 1000.0);
        let mut model = LinearModel::zeros(1);
        let mut criterion = MseCriterion;
        let mut sgd = Sgd::new(0.01);
        let batch = Batch { input: vec![vec![0.5]], target: vec![1.0] };

        let mut last_step = None;
        for index in 0..batches {
            let ctx = BatchContext { split: Split::Train, epoch: 0, index };
            let out = runner
                .run_batch(ctx, &batch, true, &mut model, &mut criterion, &mut sgd)
                .unwrap();
            if out.stepped {
                last_step = Some(index);
            }
        }

        prop_assert_eq!(runner.optimizer_steps(), batches / batch_step);
        prop_assert_eq!(sgd.steps(), batches / batch_step);
        // the trailing `batches % batch_step` batches never trigger an update
        if let Some(last) = last_step {
            prop_assert_eq!(batches - (last + 1), batches % batch_step);
        }
    }
}

// --- Retention ---

fn ranking_strategy() -> impl Strategy<Value = BTreeMap<String, Vec<usize>>> {
    prop::collection::btree_map(
        prop::sample::select(vec!["loss".to_string(), "acc".to_string(), "f1".to_string()]),
        prop::collection::vec(0usize..30, 0..30),
        0..3,
    )
}

proptest! {
    #[test]
    fn retention_is_a_fixed_point(
        existing in prop::collection::btree_set(0usize..30, 0..30),
        num_keep in 1usize..6,
        best in ranking_strategy(),
    ) {
        let existing: Vec<usize> = existing.into_iter().collect();
        let keep = retention_set(&existing, num_keep, &best);

        prop_assert!(keep.iter().all(|e| existing.contains(e)));
        let recent: BTreeSet<usize> = existing.iter().rev().take(num_keep).copied().collect();
        prop_assert!(recent.is_subset(&keep));

        let survivors: Vec<usize> = keep.iter().copied().collect();
        prop_assert_eq!(retention_set(&survivors, num_keep, &best), keep);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn cleanup_twice_deletes_nothing_more(
        existing in prop::collection::btree_set(0usize..20, 0..12),
        num_keep in 1usize..4,
        best in ranking_strategy(),
    ) {
        let dir = tempfile::TempDir::new().unwrap();
        let mgr = SnapshotManager::new(
            dir.path(),
            SnapshotConfig { num_keep, ..Default::default() },
            false,
        );
        let monitor_state = Monitor::new(&MonitorConfig::default()).unwrap().state_dict();
        for &epoch in &existing {
            mgr.save(&Checkpoint {
                epoch,
                model_state: serde_json::json!([epoch]),
                optimizer_state: serde_json::json!({}),
                monitor_state: monitor_state.clone(),
                scheduler_state: None,
            })
            .unwrap();
        }

        mgr.cleanup(&best).unwrap();
        let after_first = mgr.existing_epochs().unwrap();
        let removed = mgr.cleanup(&best).unwrap();
        prop_assert!(removed.is_empty());
        prop_assert_eq!(mgr.existing_epochs().unwrap(), after_first);
    }
}

// --- Monitor patience ---

proptest! {
    #[test]
    fn monitor_done_exactly_after_patience_plus_one(patience in 0usize..12) {
        let mut monitor = Monitor::new(&MonitorConfig {
            patience,
            ..Default::default()
        })
        .unwrap();
        let loss = |v: f64| MetricMap::from([("loss".to_string(), v)]);

        prop_assert!(monitor.update(0, &loss(1.0)).unwrap());
        for k in 0..=patience {
            prop_assert!(!monitor.is_done());
            prop_assert!(!monitor.update(k + 1, &loss(2.0)).unwrap());
        }
        prop_assert!(monitor.is_done());
    }
}

// --- Plateau scheduler ---

struct Rates(Vec<f64>);

impl LearningRates for Rates {
    fn learning_rates(&self) -> Vec<f64> {
        self.0.clone()
    }

    fn set_learning_rates(&mut self, lrs: &[f64]) {
        self.0 = lrs.to_vec();
    }
}

proptest! {
    #[test]
    fn plateau_reduces_once_after_patience_plus_one(patience in 0usize..10) {
        let mut sched = LrScheduler::from_config(&SchedulerConfig::Plateau {
            factor: 0.5,
            patience,
            cooldown: 0,
            min_lr: 0.0,
        })
        .unwrap();
        let mut rates = Rates(vec![1.0]);

        for epoch in 1..=patience + 1 {
            sched.step(epoch, Some(false), &mut rates).unwrap();
        }
        prop_assert_eq!(rates.0.clone(), vec![0.5]);

        let LrScheduler::Plateau(plateau) = &sched else {
            unreachable!("built from a plateau config")
        };
        prop_assert_eq!(plateau.counters().reductions, 1);
        prop_assert_eq!(plateau.counters().bad_epochs, 0);
    }
}
