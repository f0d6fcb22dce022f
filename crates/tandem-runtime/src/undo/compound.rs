#![forbid(unsafe_code)]

//! Commands made of other commands.
//!
//! A [`CompoundCommand`] fans each request out to its children: `execute`
//! calls every child's `execute` in child order, `revert` calls every child's
//! `revert` in reverse child order. All calls are issued before any of them
//! settles, so children on disjoint locks run concurrently while children on
//! a shared lock are admitted in the order they were called.
//!
//! The compound's state is derived from its children with
//! [`aggregate_state`] every time it is read; it stores none of its own.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::debug;

use super::command::{
    CommandHandle, CommandMetadata, CommandState, StateCallback, UndoableCmd,
};
use crate::lock::ResourceLock;
use crate::reactive::Subscription;

/// Collapse child states into one.
///
/// 1. Any child running a body: `Executing` if at least as many children are
///    executing as reverting, otherwise `Reverting`.
/// 2. Else any child waiting for locks: `PreparingForExecution` if at least as
///    many prepare to execute as to revert, otherwise `PreparingForRevert`.
/// 3. Else `Executed` if strictly more children are executed than ready,
///    otherwise `Ready`. No children at all is `Ready`.
#[must_use]
pub fn aggregate_state(states: impl IntoIterator<Item = CommandState>) -> CommandState {
    let mut tally = [0usize; 6];
    for state in states {
        let slot = match state {
            CommandState::Ready => 0,
            CommandState::PreparingForExecution => 1,
            CommandState::Executing => 2,
            CommandState::Executed => 3,
            CommandState::PreparingForRevert => 4,
            CommandState::Reverting => 5,
        };
        tally[slot] += 1;
    }
    let [ready, preparing_exec, executing, executed, preparing_rev, reverting] = tally;

    if executing + reverting > 0 {
        if executing >= reverting {
            CommandState::Executing
        } else {
            CommandState::Reverting
        }
    } else if preparing_exec + preparing_rev > 0 {
        if preparing_exec >= preparing_rev {
            CommandState::PreparingForExecution
        } else {
            CommandState::PreparingForRevert
        }
    } else if executed > ready {
        CommandState::Executed
    } else {
        CommandState::Ready
    }
}

/// An ordered group of commands executed and reverted as one.
pub struct CompoundCommand {
    metadata: CommandMetadata,
    children: Vec<Arc<dyn UndoableCmd>>,
}

impl CompoundCommand {
    pub fn new(description: impl Into<String>, children: Vec<Arc<dyn UndoableCmd>>) -> Self {
        Self {
            metadata: CommandMetadata::new(description),
            children,
        }
    }

    /// A new compound with `command` appended. `self` is left unchanged.
    #[must_use]
    pub fn augment(&self, command: Arc<dyn UndoableCmd>) -> Self {
        let mut children = self.children.clone();
        children.push(command);
        Self {
            metadata: self.metadata.clone(),
            children,
        }
    }

    #[must_use]
    pub fn children(&self) -> &[Arc<dyn UndoableCmd>] {
        &self.children
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.children.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

impl UndoableCmd for CompoundCommand {
    fn execute(&self) -> CommandHandle {
        debug!(
            target: "tandem.command",
            compound = %self.metadata.description,
            children = self.children.len(),
            "execute"
        );
        CommandHandle::join(self.children.iter().map(|child| child.execute()).collect())
    }

    fn revert(&self) -> CommandHandle {
        debug!(
            target: "tandem.command",
            compound = %self.metadata.description,
            children = self.children.len(),
            "revert"
        );
        CommandHandle::join(self.children.iter().rev().map(|child| child.revert()).collect())
    }

    fn state(&self) -> CommandState {
        aggregate_state(self.children.iter().map(|child| child.state()))
    }

    /// Fires when the aggregate changes, not on every child transition.
    fn subscribe_state(&self, callback: StateCallback) -> Subscription {
        let children = self.children.clone();
        let last = Mutex::new(self.state());
        let relay: StateCallback = Arc::new(move |_| {
            let current = aggregate_state(children.iter().map(|child| child.state()));
            let changed = {
                let mut last = last.lock().unwrap_or_else(|e| e.into_inner());
                std::mem::replace(&mut *last, current) != current
            };
            if changed {
                callback(current);
            }
        });
        Subscription::combine(
            self.children
                .iter()
                .map(|child| child.subscribe_state(Arc::clone(&relay)))
                .collect(),
        )
    }

    fn metadata(&self) -> &CommandMetadata {
        &self.metadata
    }

    /// Distinct locks of all children, in first-seen order.
    fn dependencies(&self) -> Vec<ResourceLock> {
        let mut locks: Vec<ResourceLock> = Vec::new();
        for lock in self.children.iter().flat_map(|child| child.dependencies()) {
            if !locks.contains(&lock) {
                locks.push(lock);
            }
        }
        locks
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn debug_name(&self) -> &'static str {
        "CompoundCommand"
    }
}

impl fmt::Debug for CompoundCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompoundCommand")
            .field("description", &self.metadata.description)
            .field("children", &self.children)
            .finish()
    }
}
