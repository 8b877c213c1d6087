//! Property-based tests for the `table` module.
//!
//! Drives a `ManualTimer`-backed `CorrelationTable` with random operation
//! sequences and checks it against a simple model: each registration settles
//! at most once, through the path the model predicts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use correlate_core::config::TableConfig;
use correlate_core::{CorrelationTable, Delay, Error, ManualTimer, RegisterOptions, TableStats};
use proptest::prelude::*;

// =========================================================================
// Strategies
// =========================================================================

#[derive(Debug, Clone)]
enum Op {
    Register { key: u8, delay: Option<u64> },
    Resolve { key: u8, value: u32 },
    Cancel { key: u8 },
    Advance { ms: u64 },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..6_u8, proptest::option::of(0..50_u64))
            .prop_map(|(key, delay)| Op::Register { key, delay }),
        3 => (0..6_u8, any::<u32>()).prop_map(|(key, value)| Op::Resolve { key, value }),
        1 => (0..6_u8).prop_map(|key| Op::Cancel { key }),
        2 => (0..60_u64).prop_map(|ms| Op::Advance { ms }),
    ]
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Outcome {
    successes: u32,
    failures: u32,
    last_value: Option<u32>,
}

/// Pending registration in the model: (registration index, deadline).
type Model = HashMap<u8, (usize, Option<u64>)>;

struct Harness {
    timer: ManualTimer,
    table: CorrelationTable<u8, u32>,
    outcomes: Arc<Mutex<Vec<Outcome>>>,
}

impl Harness {
    fn new(config: TableConfig) -> Self {
        let timer = ManualTimer::new();
        Self {
            table: CorrelationTable::with_config(Arc::new(timer.clone()), config),
            timer,
            outcomes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn register(&self, key: u8, delay: Option<u64>) -> Result<usize, Error> {
        let index = {
            let mut outcomes = self.outcomes.lock().unwrap();
            outcomes.push(Outcome::default());
            outcomes.len() - 1
        };
        let ok_sink = Arc::clone(&self.outcomes);
        let err_sink = Arc::clone(&self.outcomes);
        let mut options = RegisterOptions::new();
        if let Some(ms) = delay {
            options = options.delay(Delay::from_millis(ms));
        }
        self.table
            .register(
                key,
                move |v| {
                    let mut outcomes = ok_sink.lock().unwrap();
                    outcomes[index].successes += 1;
                    outcomes[index].last_value = Some(v);
                },
                move |_| err_sink.lock().unwrap()[index].failures += 1,
                options,
            )
            .map(|()| index)
    }

    fn outcome(&self, index: usize) -> Outcome {
        self.outcomes.lock().unwrap()[index]
    }
}

fn now_ms(timer: &ManualTimer) -> u64 {
    timer.now().as_millis() as u64
}

// =========================================================================
// Model-checked operation sequences
// =========================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Every operation agrees with the model and no registration settles twice.
    #[test]
    fn prop_table_matches_model(ops in prop::collection::vec(arb_op(), 1..80)) {
        let harness = Harness::new(TableConfig::default());
        let mut model: Model = HashMap::new();

        for op in ops {
            match op {
                Op::Register { key, delay } => {
                    let result = harness.register(key, delay);
                    if model.contains_key(&key) {
                        prop_assert!(matches!(result, Err(Error::DuplicateKey { .. })), "duplicate accepted");
                    } else {
                        let index = result.unwrap();
                        let deadline = delay.map(|d| now_ms(&harness.timer) + d);
                        model.insert(key, (index, deadline));
                    }
                }
                Op::Resolve { key, value } => {
                    let resolved = harness.table.resolve(&key, value);
                    match model.remove(&key) {
                        Some((index, _)) => {
                            prop_assert!(resolved);
                            let outcome = harness.outcome(index);
                            prop_assert_eq!(outcome.successes, 1);
                            prop_assert_eq!(outcome.last_value, Some(value));
                        }
                        None => prop_assert!(!resolved),
                    }
                }
                Op::Cancel { key } => {
                    let cancelled = harness.table.cancel(&key);
                    prop_assert_eq!(cancelled, model.remove(&key).is_some());
                }
                Op::Advance { ms } => {
                    let target = now_ms(&harness.timer) + ms;
                    let expired: Vec<(u8, usize)> = model
                        .iter()
                        .filter(|(_, (_, deadline))| deadline.is_some_and(|d| d <= target))
                        .map(|(key, (index, _))| (*key, *index))
                        .collect();
                    harness.timer.advance(Duration::from_millis(ms));
                    for (key, index) in expired {
                        model.remove(&key);
                        prop_assert_eq!(harness.outcome(index).failures, 1);
                    }
                }
            }

            prop_assert_eq!(harness.table.len(), model.len());
            for key in model.keys() {
                prop_assert!(harness.table.contains(key));
            }
        }

        for outcome in harness.outcomes.lock().unwrap().iter() {
            prop_assert!(outcome.successes + outcome.failures <= 1, "settled twice: {:?}", outcome);
        }
    }

    /// Stats account for every accepted registration exactly once.
    #[test]
    fn prop_stats_balance(ops in prop::collection::vec(arb_op(), 1..80)) {
        let harness = Harness::new(TableConfig::default());
        let mut attempts = 0_u64;
        for op in ops {
            match op {
                Op::Register { key, delay } => {
                    attempts += 1;
                    let _ = harness.register(key, delay);
                }
                Op::Resolve { key, value } => { harness.table.resolve(&key, value); }
                Op::Cancel { key } => { harness.table.cancel(&key); }
                Op::Advance { ms } => { harness.timer.advance(Duration::from_millis(ms)); }
            }
        }

        let TableStats { registered, resolved, timed_out, cancelled, rejected, pending, .. } =
            harness.table.stats();
        prop_assert_eq!(registered + rejected, attempts);
        prop_assert_eq!(resolved + timed_out + cancelled + pending as u64, registered);
    }

    /// Closing drops everything: no continuation runs afterwards and no timer
    /// stays armed.
    #[test]
    fn prop_close_silences_everything(
        regs in prop::collection::vec((0..6_u8, proptest::option::of(0..50_u64)), 1..20),
        after in 0..200_u64,
    ) {
        let harness = Harness::new(TableConfig::default());
        for (key, delay) in regs {
            let _ = harness.register(key, delay);
        }
        let pending = harness.table.len();
        prop_assert_eq!(harness.table.close(), pending);
        prop_assert_eq!(harness.timer.pending(), 0);
        harness.timer.advance(Duration::from_millis(after));
        for outcome in harness.outcomes.lock().unwrap().iter() {
            prop_assert_eq!(*outcome, Outcome::default());
        }
        prop_assert!(matches!(harness.register(0, None), Err(Error::Closed)));
    }

    /// `max_pending` is never exceeded.
    #[test]
    fn prop_capacity_respected(
        capacity in 1..5_usize,
        ops in prop::collection::vec(arb_op(), 1..60),
    ) {
        let harness = Harness::new(TableConfig { max_pending: capacity, ..TableConfig::default() });
        for op in ops {
            match op {
                Op::Register { key, delay } => {
                    let before = harness.table.len();
                    match harness.register(key, delay) {
                        Err(Error::TableFull { capacity: c }) => {
                            prop_assert_eq!(c, capacity);
                            prop_assert_eq!(before, capacity);
                        }
                        Ok(_) | Err(Error::DuplicateKey { .. }) => {}
                        Err(other) => prop_assert!(false, "unexpected error: {other}"),
                    }
                }
                Op::Resolve { key, value } => { harness.table.resolve(&key, value); }
                Op::Cancel { key } => { harness.table.cancel(&key); }
                Op::Advance { ms } => { harness.timer.advance(Duration::from_millis(ms)); }
            }
            prop_assert!(harness.table.len() <= capacity);
        }
    }
}
