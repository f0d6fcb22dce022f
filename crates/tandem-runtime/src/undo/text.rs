#![forbid(unsafe_code)]

//! Undoable edits of a text field.
//!
//! Both commands here capture the target's text and selection the first time
//! they apply, and restore exactly that snapshot on revert. Alterations are
//! recorded with their `previous_content` so applied edits can be audited or
//! merged with [`tandem_text::merge_alterations`].
//!
//! - [`TextEditCommand`]: one fixed [`TextAlteration`].
//! - [`AdvancedTextEditCommand`]: a callback computes the alterations from the
//!   text as it is when the body runs.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tandem_text::{Selection, TextAlteration, char_len, perform_alterations};
use tracing::trace;

use super::command::{
    Command, CommandBody, CommandError, CommandHandle, CommandMetadata, CommandResult,
    CommandSource, CommandState, StateCallback, UndoableCmd,
};
use crate::lock::ResourceLock;
use crate::reactive::{Subscription, ValueCell};

/// A mutable text field that commands edit.
pub trait TextTarget: Send + Sync {
    fn text(&self) -> String;

    fn set_text(&self, text: String);

    fn selection(&self) -> Option<Selection> {
        None
    }

    fn set_selection(&self, _selection: Option<Selection>) {}
}

/// In-memory [`TextTarget`] with observable text and selection.
///
/// Cloning yields another handle to the same field.
#[derive(Clone, Debug)]
pub struct TextField {
    text: ValueCell<String>,
    selection: ValueCell<Option<Selection>>,
}

impl Default for TextField {
    fn default() -> Self {
        Self::new("")
    }
}

impl TextField {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: ValueCell::new(text.into()),
            selection: ValueCell::new(None),
        }
    }

    #[must_use]
    pub fn with_selection(self, selection: Selection) -> Self {
        self.selection.set(Some(selection));
        self
    }

    pub fn subscribe_text(&self, callback: impl Fn(&str) + Send + Sync + 'static) -> Subscription {
        self.text.subscribe(move |text| callback(text))
    }

    pub fn subscribe_selection(
        &self,
        callback: impl Fn(Option<Selection>) + Send + Sync + 'static,
    ) -> Subscription {
        self.selection.subscribe(move |selection| callback(*selection))
    }
}

impl TextTarget for TextField {
    fn text(&self) -> String {
        self.text.get()
    }

    fn set_text(&self, text: String) {
        self.text.set(text);
    }

    fn selection(&self) -> Option<Selection> {
        self.selection.get()
    }

    fn set_selection(&self, selection: Option<Selection>) {
        self.selection.set(selection);
    }
}

/// Text and selection of a target at one moment.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TextSnapshot {
    pub text: String,
    pub selection: Option<Selection>,
}

impl TextSnapshot {
    pub fn capture(target: &dyn TextTarget) -> Self {
        Self {
            text: target.text(),
            selection: target.selection(),
        }
    }

    fn restore(&self, target: &dyn TextTarget) {
        target.set_text(self.text.clone());
        target.set_selection(self.selection);
    }
}

/// What an [`AdvancedTextEditCommand`] callback wants done.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TextEditPlan {
    /// Alterations against the snapshot passed to the callback. Sorted by
    /// end index before they are applied.
    pub alterations: Vec<TextAlteration>,
    /// Selection after the edit; `None` keeps the current one.
    pub selection: Option<Selection>,
}

impl TextEditPlan {
    pub fn new(alterations: Vec<TextAlteration>) -> Self {
        Self {
            alterations,
            selection: None,
        }
    }

    #[must_use]
    pub fn with_selection(mut self, selection: Selection) -> Self {
        self.selection = Some(selection);
        self
    }
}

/// Capture/apply/restore bookkeeping shared by both text commands.
struct EditRecord {
    target: Arc<dyn TextTarget>,
    before: Mutex<Option<TextSnapshot>>,
    applied: Mutex<Vec<TextAlteration>>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl EditRecord {
    fn new(target: Arc<dyn TextTarget>) -> Self {
        Self {
            target,
            before: Mutex::new(None),
            applied: Mutex::new(Vec::new()),
        }
    }

    /// Current snapshot. The first call also becomes the restore point.
    fn begin(&self) -> TextSnapshot {
        let current = TextSnapshot::capture(self.target.as_ref());
        guard(&self.before).get_or_insert_with(|| current.clone());
        current
    }

    fn commit(
        &self,
        current: &TextSnapshot,
        mut alterations: Vec<TextAlteration>,
        selection: Option<Selection>,
    ) -> CommandResult {
        let length = char_len(&current.text);
        if let Some(bad) = alterations.iter().find(|a| a.start > a.end || a.end > length) {
            let position = if bad.end > length { bad.end } else { bad.start };
            return Err(CommandError::PositionOutOfBounds { position, length });
        }

        alterations.sort_by_key(|a| a.end);
        let recorded: Vec<TextAlteration> = alterations
            .into_iter()
            .map(|a| TextAlteration::captured(&current.text, a.start, a.end, a.content))
            .collect();
        let text = perform_alterations(&current.text, &recorded);
        let new_length = char_len(&text);

        trace!(
            target: "tandem.text",
            alterations = recorded.len(),
            before = length,
            after = new_length,
            "apply text edit"
        );
        self.target.set_text(text);
        self.target
            .set_selection(selection.map(|selection| selection.clamp(new_length)));
        *guard(&self.applied) = recorded;
        Ok(())
    }

    fn restore(&self) -> CommandResult {
        let before = guard(&self.before).clone();
        match before {
            Some(snapshot) => {
                trace!(target: "tandem.text", length = char_len(&snapshot.text), "restore text");
                snapshot.restore(self.target.as_ref());
                Ok(())
            }
            None => Err(CommandError::InvalidState(
                "no captured text to restore".to_string(),
            )),
        }
    }
}

struct SingleEdit {
    record: EditRecord,
    alteration: TextAlteration,
    selection: Mutex<Option<Selection>>,
}

#[async_trait]
impl CommandBody for SingleEdit {
    async fn apply(&self) -> CommandResult {
        let current = self.record.begin();
        let selection =
            guard(&self.selection).unwrap_or_else(|| Selection::after(&self.alteration));
        self.record
            .commit(&current, vec![self.alteration.clone()], Some(selection))
    }

    async fn unapply(&self) -> CommandResult {
        self.record.restore()
    }
}

/// Replace one range of a [`TextTarget`].
pub struct TextEditCommand {
    command: Command,
    edit: Arc<SingleEdit>,
}

impl TextEditCommand {
    pub fn new(target: Arc<dyn TextTarget>, alteration: TextAlteration) -> Self {
        let edit = Arc::new(SingleEdit {
            record: EditRecord::new(target),
            alteration,
            selection: Mutex::new(None),
        });
        let body: Arc<dyn CommandBody> = edit.clone();
        Self {
            command: Command::from_body(body).with_description("Edit text"),
            edit,
        }
    }

    /// Selection to set after applying. Defaults to a caret after the
    /// inserted content.
    #[must_use]
    pub fn with_selection(self, selection: Selection) -> Self {
        *guard(&self.edit.selection) = Some(selection);
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.command = self.command.with_description(description);
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: CommandSource) -> Self {
        self.command = self.command.with_source(source);
        self
    }

    #[must_use]
    pub fn with_dependencies(mut self, locks: impl IntoIterator<Item = ResourceLock>) -> Self {
        self.command = self.command.with_dependencies(locks);
        self
    }

    #[must_use]
    pub fn alteration(&self) -> &TextAlteration {
        &self.edit.alteration
    }

    /// The alteration as last applied, with `previous_content` recorded.
    #[must_use]
    pub fn applied_alterations(&self) -> Vec<TextAlteration> {
        guard(&self.edit.record.applied).clone()
    }

    /// The snapshot revert restores, once captured.
    #[must_use]
    pub fn captured(&self) -> Option<TextSnapshot> {
        guard(&self.edit.record.before).clone()
    }
}

/// Computes a [`TextEditPlan`] from the current text.
pub type EditPlanner = Arc<dyn Fn(&TextSnapshot) -> TextEditPlan + Send + Sync>;

struct PlannedEdit {
    record: EditRecord,
    planner: EditPlanner,
}

#[async_trait]
impl CommandBody for PlannedEdit {
    async fn apply(&self) -> CommandResult {
        let current = self.record.begin();
        let plan = (self.planner)(&current);
        let selection = plan.selection.or(current.selection);
        self.record.commit(&current, plan.alterations, selection)
    }

    async fn unapply(&self) -> CommandResult {
        self.record.restore()
    }
}

/// Apply alterations computed at execution time.
pub struct AdvancedTextEditCommand {
    command: Command,
    edit: Arc<PlannedEdit>,
}

impl AdvancedTextEditCommand {
    pub fn new(
        target: Arc<dyn TextTarget>,
        planner: impl Fn(&TextSnapshot) -> TextEditPlan + Send + Sync + 'static,
    ) -> Self {
        let edit = Arc::new(PlannedEdit {
            record: EditRecord::new(target),
            planner: Arc::new(planner),
        });
        let body: Arc<dyn CommandBody> = edit.clone();
        Self {
            command: Command::from_body(body).with_description("Edit text"),
            edit,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.command = self.command.with_description(description);
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: CommandSource) -> Self {
        self.command = self.command.with_source(source);
        self
    }

    #[must_use]
    pub fn with_dependencies(mut self, locks: impl IntoIterator<Item = ResourceLock>) -> Self {
        self.command = self.command.with_dependencies(locks);
        self
    }

    /// Alterations as last applied, sorted by end, with `previous_content`.
    #[must_use]
    pub fn applied_alterations(&self) -> Vec<TextAlteration> {
        guard(&self.edit.record.applied).clone()
    }

    #[must_use]
    pub fn captured(&self) -> Option<TextSnapshot> {
        guard(&self.edit.record.before).clone()
    }
}

macro_rules! delegate_undoable {
    ($ty:ty, $name:literal) => {
        impl UndoableCmd for $ty {
            fn execute(&self) -> CommandHandle {
                self.command.execute()
            }

            fn revert(&self) -> CommandHandle {
                self.command.revert()
            }

            fn state(&self) -> CommandState {
                self.command.state()
            }

            fn subscribe_state(&self, callback: StateCallback) -> Subscription {
                self.command.subscribe_state(callback)
            }

            fn metadata(&self) -> &CommandMetadata {
                self.command.metadata()
            }

            fn dependencies(&self) -> Vec<ResourceLock> {
                self.command.dependencies()
            }

            fn as_any(&self) -> &dyn Any {
                self
            }

            fn debug_name(&self) -> &'static str {
                $name
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct($name)
                    .field("description", &self.command.description())
                    .field("state", &self.command.state())
                    .finish()
            }
        }
    };
}

delegate_undoable!(TextEditCommand, "TextEditCommand");
delegate_undoable!(AdvancedTextEditCommand, "AdvancedTextEditCommand");
