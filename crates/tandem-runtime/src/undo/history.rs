#![forbid(unsafe_code)]

//! Undo/redo history over asynchronous commands.
//!
//! [`HistoryManager`] keeps two stacks of [`UndoableCmd`]s:
//!
//! - `past`: executed entries, oldest first;
//! - `future`: undone entries, next to redo first.
//!
//! ```text
//! execute(c4)
//! ┌───────────────────────────────────────────────┐
//! │ past:   [c1, c2, c3, c4]                      │
//! │ future: []                                     │
//! └───────────────────────────────────────────────┘
//!
//! undo() x2
//! ┌───────────────────────────────────────────────┐
//! │ past:   [c1, c2]                              │
//! │ future: [c3, c4]                               │
//! └───────────────────────────────────────────────┘
//!
//! execute(c5)  <-- new branch, clears future
//! ┌───────────────────────────────────────────────┐
//! │ past:   [c1, c2, c5]                          │
//! │ future: []                                     │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! # Batching
//!
//! `execute(cmd, batch)` with batching requested folds `cmd` into the newest
//! `past` entry when that entry is a [`CompoundCommand`], so the whole batch
//! undoes in one step. [`HistoryManager::split_batch`] forces the next batched
//! command to start a fresh compound.
//!
//! # Invariants
//!
//! 1. `future` is empty after every `execute`.
//! 2. `past.len() <= max(config.max_depth, 1)` after every operation, so the
//!    newest executed command can always be undone.
//! 3. The history only starts requests; awaiting their handles is optional
//!    and the stacks move immediately.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::debug;

use super::command::{CommandHandle, CommandState, UndoableCmd};
use super::compound::{CompoundCommand, aggregate_state};
use crate::reactive::{Subscription, ValueCell};

/// Configuration for the history manager.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "config", serde(default))]
pub struct HistoryConfig {
    /// Maximum number of entries kept in `past`. Oldest entries are evicted.
    /// Zero is treated as one.
    pub max_depth: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { max_depth: 100 }
    }
}

impl HistoryConfig {
    #[must_use]
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth: max_depth.max(1),
        }
    }

    #[must_use]
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth.max(1);
        self
    }

    /// No depth limit.
    #[must_use]
    pub fn unlimited() -> Self {
        Self {
            max_depth: usize::MAX,
        }
    }
}

/// Decides whether the previous `past` entry may absorb a new command.
pub type BatchPredicate = Arc<dyn Fn(Option<&dyn UndoableCmd>) -> bool + Send + Sync>;

/// Batching request for [`HistoryManager::execute`].
#[derive(Clone, Default)]
pub enum BatchMode {
    /// Push the bare command.
    #[default]
    Never,
    /// Fold into the previous compound, or start one.
    Always,
    /// Evaluate against the newest `past` entry; behaves as `Always` when
    /// it returns `true`, otherwise as `Never`.
    When(BatchPredicate),
}

impl BatchMode {
    pub fn when(
        predicate: impl Fn(Option<&dyn UndoableCmd>) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self::When(Arc::new(predicate))
    }

    fn resolve(&self, previous: Option<&dyn UndoableCmd>) -> bool {
        match self {
            Self::Never => false,
            Self::Always => true,
            Self::When(predicate) => predicate(previous),
        }
    }
}

impl From<bool> for BatchMode {
    fn from(batch: bool) -> Self {
        if batch { Self::Always } else { Self::Never }
    }
}

impl fmt::Debug for BatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => f.write_str("Never"),
            Self::Always => f.write_str("Always"),
            Self::When(_) => f.write_str("When(..)"),
        }
    }
}

/// Snapshot of both history stacks.
#[derive(Debug, Clone, Default)]
pub struct HistorySnapshot {
    /// Executed entries, oldest first.
    pub past: Vec<Arc<dyn UndoableCmd>>,
    /// Undone entries, next to redo first.
    pub future: Vec<Arc<dyn UndoableCmd>>,
}

/// Manager for undo/redo history.
///
/// Cloning yields another handle to the same history.
#[derive(Clone)]
pub struct HistoryManager {
    inner: Arc<HistoryInner>,
}

struct HistoryInner {
    config: HistoryConfig,
    stacks: Mutex<Stacks>,
    /// Ticks whenever either stack changes.
    contents: ValueCell<u64>,
    /// Ticks whenever the stacks or any tracked command's state change.
    states: ValueCell<u64>,
}

#[derive(Default)]
struct Stacks {
    past: VecDeque<Entry>,
    future: VecDeque<Entry>,
    split_pending: bool,
}

struct Entry {
    command: Arc<dyn UndoableCmd>,
    _watch: Subscription,
}

impl Default for HistoryManager {
    fn default() -> Self {
        Self::new(HistoryConfig::default())
    }
}

impl fmt::Debug for HistoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stacks = self.inner.stacks();
        f.debug_struct("HistoryManager")
            .field("undo_depth", &stacks.past.len())
            .field("redo_depth", &stacks.future.len())
            .field("split_pending", &stacks.split_pending)
            .field("config", &self.inner.config)
            .finish()
    }
}

impl HistoryManager {
    #[must_use]
    pub fn new(config: HistoryConfig) -> Self {
        Self {
            inner: Arc::new(HistoryInner {
                config,
                stacks: Mutex::new(Stacks::default()),
                contents: ValueCell::new(0),
                states: ValueCell::new(0),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &HistoryConfig {
        &self.inner.config
    }

    // ========================================================================
    // Core Operations
    // ========================================================================

    /// Start `command` and record it.
    ///
    /// The command's execute request is issued before the stacks change. The
    /// returned handle settles with that request.
    pub fn execute(
        &self,
        command: Arc<dyn UndoableCmd>,
        batch: impl Into<BatchMode>,
    ) -> CommandHandle {
        let batch = batch.into();
        let handle = command.execute();

        let previous = self
            .inner
            .stacks()
            .past
            .back()
            .map(|entry| Arc::clone(&entry.command));
        let batched = batch.resolve(previous.as_deref());

        let (replaced, discarded, evicted) = {
            let mut stacks = self.inner.stacks();
            let split = std::mem::take(&mut stacks.split_pending);
            let merged = if batched && !split {
                stacks
                    .past
                    .back()
                    .and_then(|entry| entry.command.as_any().downcast_ref::<CompoundCommand>())
                    .map(|compound| compound.augment(Arc::clone(&command)))
            } else {
                None
            };

            let mut replaced = None;
            let entry: Arc<dyn UndoableCmd> = match merged {
                Some(compound) => {
                    replaced = stacks.past.pop_back();
                    Arc::new(compound)
                }
                None if batched => Arc::new(CompoundCommand::new(
                    command.description().to_string(),
                    vec![Arc::clone(&command)],
                )),
                None => Arc::clone(&command),
            };
            debug!(
                target: "tandem.history",
                command = %command.description(),
                source = command.metadata().source.as_str(),
                batched,
                merged = replaced.is_some(),
                split,
                "execute"
            );

            stacks.past.push_back(self.inner.track(entry));
            let discarded = std::mem::take(&mut stacks.future);
            let evicted = self.inner.enforce_depth(&mut stacks);
            (replaced, discarded, evicted)
        };

        // Entries are dropped outside the lock.
        drop((replaced, discarded, evicted));
        self.inner.publish();
        handle
    }

    /// Revert the newest `past` entry and move it to the front of `future`.
    ///
    /// `None` when there is nothing to undo.
    pub fn undo(&self) -> Option<CommandHandle> {
        let command = {
            let mut stacks = self.inner.stacks();
            let entry = stacks.past.pop_back()?;
            let command = Arc::clone(&entry.command);
            stacks.future.push_front(entry);
            command
        };
        debug!(target: "tandem.history", command = %command.description(), "undo");
        let handle = command.revert();
        self.inner.publish();
        Some(handle)
    }

    /// Execute the first `future` entry and move it to the end of `past`.
    ///
    /// `None` when there is nothing to redo.
    pub fn redo(&self) -> Option<CommandHandle> {
        let (command, evicted) = {
            let mut stacks = self.inner.stacks();
            let entry = stacks.future.pop_front()?;
            let command = Arc::clone(&entry.command);
            stacks.past.push_back(entry);
            let evicted = self.inner.enforce_depth(&mut stacks);
            (command, evicted)
        };
        drop(evicted);
        debug!(target: "tandem.history", command = %command.description(), "redo");
        let handle = command.execute();
        self.inner.publish();
        Some(handle)
    }

    /// Make the next batched `execute` start a new compound.
    pub fn split_batch(&self) {
        self.inner.stacks().split_pending = true;
        debug!(target: "tandem.history", "split batch");
    }

    /// Forget every entry. Commands are not reverted.
    pub fn clear(&self) {
        let (past, future) = {
            let mut stacks = self.inner.stacks();
            stacks.split_pending = false;
            (
                std::mem::take(&mut stacks.past),
                std::mem::take(&mut stacks.future),
            )
        };
        debug!(target: "tandem.history", past = past.len(), future = future.len(), "clear");
        drop((past, future));
        self.inner.publish();
    }

    // ========================================================================
    // Observation
    // ========================================================================

    /// Aggregate state of every entry in both stacks.
    #[must_use]
    pub fn state(&self) -> CommandState {
        self.inner.aggregate()
    }

    /// Observe changes of [`state`](Self::state).
    pub fn subscribe_state(
        &self,
        callback: impl Fn(CommandState) + Send + Sync + 'static,
    ) -> Subscription {
        let history: Weak<HistoryInner> = Arc::downgrade(&self.inner);
        let last = Mutex::new(self.state());
        self.inner.states.subscribe(move |_| {
            let Some(history) = history.upgrade() else {
                return;
            };
            let current = history.aggregate();
            let changed = {
                let mut last = last.lock().unwrap_or_else(|e| e.into_inner());
                std::mem::replace(&mut *last, current) != current
            };
            if changed {
                callback(current);
            }
        })
    }

    #[must_use]
    pub fn commands(&self) -> HistorySnapshot {
        self.inner.snapshot()
    }

    /// Observe every change to either stack.
    pub fn subscribe_commands(
        &self,
        callback: impl Fn(&HistorySnapshot) + Send + Sync + 'static,
    ) -> Subscription {
        let history: Weak<HistoryInner> = Arc::downgrade(&self.inner);
        self.inner.contents.subscribe(move |_| {
            if let Some(history) = history.upgrade() {
                callback(&history.snapshot());
            }
        })
    }

    #[must_use]
    pub fn can_undo(&self) -> bool {
        !self.inner.stacks().past.is_empty()
    }

    #[must_use]
    pub fn can_redo(&self) -> bool {
        !self.inner.stacks().future.is_empty()
    }

    #[must_use]
    pub fn undo_depth(&self) -> usize {
        self.inner.stacks().past.len()
    }

    #[must_use]
    pub fn redo_depth(&self) -> usize {
        self.inner.stacks().future.len()
    }

    /// Descriptions of up to `limit` undoable entries, newest first.
    #[must_use]
    pub fn undo_descriptions(&self, limit: usize) -> Vec<String> {
        let stacks = self.inner.stacks();
        stacks
            .past
            .iter()
            .rev()
            .take(limit)
            .map(|entry| entry.command.description().to_string())
            .collect()
    }

    /// Descriptions of up to `limit` redoable entries, next first.
    #[must_use]
    pub fn redo_descriptions(&self, limit: usize) -> Vec<String> {
        let stacks = self.inner.stacks();
        stacks
            .future
            .iter()
            .take(limit)
            .map(|entry| entry.command.description().to_string())
            .collect()
    }

    #[must_use]
    pub fn next_undo_description(&self) -> Option<String> {
        self.undo_descriptions(1).pop()
    }

    #[must_use]
    pub fn next_redo_description(&self) -> Option<String> {
        self.redo_descriptions(1).pop()
    }
}

impl HistoryInner {
    fn stacks(&self) -> MutexGuard<'_, Stacks> {
        self.stacks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn track(&self, command: Arc<dyn UndoableCmd>) -> Entry {
        let states = self.states.clone();
        let watch = command.subscribe_state(Arc::new(move |_| tick(&states)));
        Entry {
            command,
            _watch: watch,
        }
    }

    fn enforce_depth(&self, stacks: &mut Stacks) -> Vec<Entry> {
        let max_depth = self.config.max_depth.max(1);
        let excess = stacks.past.len().saturating_sub(max_depth);
        if excess > 0 {
            debug!(target: "tandem.history", evicted = excess, max_depth, "evict oldest");
        }
        stacks.past.drain(..excess).collect()
    }

    fn aggregate(&self) -> CommandState {
        let commands: Vec<Arc<dyn UndoableCmd>> = {
            let stacks = self.stacks();
            stacks
                .past
                .iter()
                .chain(stacks.future.iter())
                .map(|entry| Arc::clone(&entry.command))
                .collect()
        };
        aggregate_state(commands.iter().map(|command| command.state()))
    }

    fn snapshot(&self) -> HistorySnapshot {
        let stacks = self.stacks();
        HistorySnapshot {
            past: stacks.past.iter().map(|e| Arc::clone(&e.command)).collect(),
            future: stacks.future.iter().map(|e| Arc::clone(&e.command)).collect(),
        }
    }

    /// Called with the stacks unlocked.
    fn publish(&self) {
        tick(&self.contents);
        tick(&self.states);
    }
}

fn tick(signal: &ValueCell<u64>) {
    signal.update(|count| *count = count.wrapping_add(1));
}
