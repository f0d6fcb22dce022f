#![forbid(unsafe_code)]

//! Tandem Runtime
//!
//! Asynchronous, lock-coordinated commands with undo/redo history.
//!
//! # Key Components
//!
//! - [`ResourceLock`] - Named FIFO counting lock that serializes command bodies
//! - [`Command`] - Async apply/unapply body guarded by its locks
//! - [`CompoundCommand`] - Commands executed and reverted as one
//! - [`HistoryManager`] - Undo/redo stacks with batching
//! - [`TextEditCommand`] / [`AdvancedTextEditCommand`] - Undoable text edits
//! - [`ValueCell`] - Observable state behind every `state()`/`subscribe_*` pair
//!
//! # Role in Tandem
//! `tandem-runtime` is the coordinator. Text arithmetic lives in
//! `tandem-text`; this crate decides *when* edits run and how they are
//! undone. Commands run on the ambient Tokio runtime; requests made outside
//! one fail with [`CommandError::NoRuntime`].
//!
//! # Observability
//! Everything is reported through `tracing` under the targets
//! `tandem.command`, `tandem.lock`, `tandem.history` and `tandem.text`. The
//! library installs no subscriber.

pub mod lock;
pub mod reactive;
pub mod undo;

#[cfg(feature = "config")]
pub mod config;

pub use lock::{Acquire, LockGuard, ResourceLock, acquire_all};
pub use reactive::{Subscription, ValueCell};
pub use undo::{
    AdvancedTextEditCommand, BatchMode, Command, CommandBody, CommandError, CommandHandle,
    CommandResult, CommandState, CompoundCommand, HistoryConfig, HistoryManager, TextEditCommand,
    TextEditPlan, TextField, TextSnapshot, TextTarget, UndoableCmd,
};

#[cfg(feature = "config")]
pub use config::ConfigError;
