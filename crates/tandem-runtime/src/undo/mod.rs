#![forbid(unsafe_code)]

//! Undo/redo over asynchronous, lock-coordinated commands.
//!
//! - **Commands** run an async body while holding every [`ResourceLock`]
//!   they depend on, and can be reverted.
//! - **Compound commands** group commands so they execute and revert as one.
//! - **History** records executed commands, batches related ones, and drives
//!   undo and redo.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         HistoryManager                           │
//! │   past: [Compound[c1, c2], c3]          future: [c4]             │
//! └──────────────┬───────────────────────────────────────────────────┘
//!                │ execute() / revert()
//!                ▼
//! ┌──────────────────────────┐    tickets     ┌──────────────────────┐
//! │ Command                  │ ─────────────► │ ResourceLock (FIFO)  │
//! │  request queue ──► body  │ ◄───────────── │  holders / waiters   │
//! └──────────────────────────┘   admitted     └──────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tandem_runtime::undo::{HistoryManager, TextEditCommand, TextField, TextTarget};
//! use tandem_text::TextAlteration;
//!
//! # async fn demo() -> Result<(), tandem_runtime::undo::CommandError> {
//! let field = Arc::new(TextField::new("hello"));
//! let history = HistoryManager::default();
//!
//! let edit = TextEditCommand::new(field.clone(), TextAlteration::insert(5, " world"));
//! history.execute(Arc::new(edit), false).await?;
//! assert_eq!(field.text(), "hello world");
//!
//! if let Some(undo) = history.undo() {
//!     undo.await?;
//! }
//! assert_eq!(field.text(), "hello");
//! # Ok(())
//! # }
//! ```
//!
//! [`ResourceLock`]: crate::lock::ResourceLock

pub mod command;
pub mod compound;
pub mod history;
pub mod text;

pub use command::{
    Command, CommandBody, CommandError, CommandHandle, CommandMetadata, CommandResult,
    CommandSource, CommandState, FnBody, StateCallback, UndoableCmd,
};
pub use compound::{CompoundCommand, aggregate_state};
pub use history::{BatchMode, BatchPredicate, HistoryConfig, HistoryManager, HistorySnapshot};
pub use text::{
    AdvancedTextEditCommand, EditPlanner, TextEditCommand, TextEditPlan, TextField, TextSnapshot,
    TextTarget,
};
