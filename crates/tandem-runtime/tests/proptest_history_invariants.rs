#![forbid(unsafe_code)]

//! Property tests for the undo/redo history.
//!
//! Random sequences of execute (batched or not), undo, redo and split are run
//! against a `HistoryManager` and a plain stack model. After every step:
//! - the observed total equals the model's total;
//! - undo and redo depths match the model;
//! - `future` is empty right after an execute;
//! - `past` never exceeds `max_depth`;
//! - the history's aggregate state is settled once every handle resolved.
//!
//! Run:
//!   cargo test -p tandem-runtime --test proptest_history_invariants

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use proptest::prelude::*;
use tandem_runtime::{BatchMode, Command, HistoryConfig, HistoryManager, ResourceLock, UndoableCmd};

// ============================================================================
// Model
// ============================================================================

#[derive(Debug, Clone)]
enum Op {
    Execute { delta: i64, batched: bool },
    Undo,
    Redo,
    Split,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (-50i64..50, any::<bool>())
            .prop_map(|(delta, batched)| Op::Execute { delta, batched }),
        2 => Just(Op::Undo),
        2 => Just(Op::Redo),
        1 => Just(Op::Split),
    ]
}

#[derive(Debug, Clone)]
struct Entry {
    compound: bool,
    deltas: Vec<i64>,
}

impl Entry {
    fn sum(&self) -> i64 {
        self.deltas.iter().sum()
    }
}

#[derive(Debug, Default)]
struct Model {
    past: VecDeque<Entry>,
    future: VecDeque<Entry>,
    split: bool,
    total: i64,
}

impl Model {
    fn apply(&mut self, op: &Op, max_depth: usize) {
        match *op {
            Op::Execute { delta, batched } => {
                self.total += delta;
                let split = std::mem::take(&mut self.split);
                match self.past.back_mut() {
                    Some(last) if batched && !split && last.compound => last.deltas.push(delta),
                    _ => self.past.push_back(Entry {
                        compound: batched,
                        deltas: vec![delta],
                    }),
                }
                self.future.clear();
                self.evict(max_depth);
            }
            Op::Undo => {
                if let Some(entry) = self.past.pop_back() {
                    self.total -= entry.sum();
                    self.future.push_front(entry);
                }
            }
            Op::Redo => {
                if let Some(entry) = self.future.pop_front() {
                    self.total += entry.sum();
                    self.past.push_back(entry);
                    self.evict(max_depth);
                }
            }
            Op::Split => self.split = true,
        }
    }

    fn evict(&mut self, max_depth: usize) {
        while self.past.len() > max_depth {
            self.past.pop_front();
        }
    }
}

fn adder(lock: &ResourceLock, total: &Arc<AtomicI64>, delta: i64) -> Arc<dyn UndoableCmd> {
    let (up, down) = (Arc::clone(total), Arc::clone(total));
    Arc::new(
        Command::from_fns(
            move || {
                up.fetch_add(delta, Ordering::SeqCst);
                async { Ok(()) }
            },
            move || {
                down.fetch_sub(delta, Ordering::SeqCst);
                async { Ok(()) }
            },
        )
        .with_description(format!("add {delta}"))
        .with_dependencies([lock.clone()]),
    )
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn history_tracks_model(
        ops in prop::collection::vec(op_strategy(), 1..40),
        max_depth in 1usize..6,
    ) {
        let rt = runtime();
        let _guard = rt.enter();
        let history = HistoryManager::new(HistoryConfig::new(max_depth));
        let lock = ResourceLock::new("counter");
        let total = Arc::new(AtomicI64::new(0));
        let mut model = Model::default();

        for op in &ops {
            match *op {
                Op::Execute { delta, batched } => {
                    let mode = if batched { BatchMode::Always } else { BatchMode::Never };
                    rt.block_on(history.execute(adder(&lock, &total, delta), mode)).unwrap();
                    prop_assert_eq!(history.redo_depth(), 0);
                }
                Op::Undo => {
                    if let Some(handle) = history.undo() {
                        rt.block_on(handle).unwrap();
                    }
                }
                Op::Redo => {
                    if let Some(handle) = history.redo() {
                        rt.block_on(handle).unwrap();
                    }
                }
                Op::Split => history.split_batch(),
            }
            model.apply(op, max_depth);

            prop_assert_eq!(total.load(Ordering::SeqCst), model.total, "after {:?}", op);
            prop_assert_eq!(history.undo_depth(), model.past.len());
            prop_assert_eq!(history.redo_depth(), model.future.len());
            prop_assert!(history.undo_depth() <= max_depth);
            prop_assert!(history.state().is_settled());
        }
    }

    #[test]
    fn undo_all_then_redo_all_restores_total(
        deltas in prop::collection::vec((-20i64..20, any::<bool>()), 1..12),
    ) {
        let rt = runtime();
        let _guard = rt.enter();
        let history = HistoryManager::new(HistoryConfig::unlimited());
        let lock = ResourceLock::new("counter");
        let total = Arc::new(AtomicI64::new(0));

        for &(delta, batched) in &deltas {
            rt.block_on(history.execute(adder(&lock, &total, delta), batched)).unwrap();
        }
        let expected: i64 = deltas.iter().map(|(d, _)| d).sum();
        prop_assert_eq!(total.load(Ordering::SeqCst), expected);

        let depth = history.undo_depth();
        let mut undone = 0;
        while let Some(handle) = history.undo() {
            rt.block_on(handle).unwrap();
            undone += 1;
        }
        prop_assert_eq!(undone, depth);
        prop_assert_eq!(total.load(Ordering::SeqCst), 0);

        let mut redone = 0;
        while let Some(handle) = history.redo() {
            rt.block_on(handle).unwrap();
            redone += 1;
        }
        prop_assert_eq!(redone, depth);
        prop_assert_eq!(total.load(Ordering::SeqCst), expected);
    }
}
