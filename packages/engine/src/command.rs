//! # Commands
//!
//! Undoable operations on models.
//!
//! ## Variants
//!
//! - **Simple**: bound to one model; mutates that model's working copy
//! - **Compound**: ordered children under one label; executes/redoes in
//!   order and undoes in reverse
//! - **Appendable**: a compound formed by merging commands after the fact;
//!   accepts further children only while executed
//!
//! Every leaf that produced a change reports its patch; compounds expand to
//! their leaves in the resulting [`CommandResult`].

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use quire_patch::{apply, diff, Patch};
use serde_json::Value;

use crate::errors::{CommandError, StackError, StoreError};
use crate::store::{ChangeSet, ModelAccess, Transaction};
use crate::types::ModelId;

/// A command bound to exactly one model.
///
/// `execute`/`undo`/`redo` mutate the supplied working copy and return the
/// patch they applied, or `None` when nothing observable changed.
#[async_trait]
pub trait SimpleCommand: Send + Sync + fmt::Debug {
    fn label(&self) -> &str;

    fn model_id(&self) -> &ModelId;

    fn can_execute(&self, _model: &Value) -> bool {
        true
    }

    fn can_undo(&self, _model: &Value) -> bool {
        true
    }

    fn can_redo(&self, _model: &Value) -> bool {
        true
    }

    async fn execute(&self, model: &mut Value) -> Result<Option<Patch>, CommandError>;

    async fn undo(&self, model: &mut Value) -> Result<Option<Patch>, CommandError>;

    async fn redo(&self, model: &mut Value) -> Result<Option<Patch>, CommandError>;
}

/// Lifecycle state of a history entry and its appendable command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Executed,
    Undone,
}

#[derive(Debug, Clone, Copy)]
enum Action {
    Execute,
    Undo,
    Redo,
}

/// Command variants
#[derive(Debug, Clone)]
pub enum Command {
    Simple(Arc<dyn SimpleCommand>),
    Compound(CompoundCommand),
    Appendable(AppendableCommand),
}

#[derive(Debug, Clone)]
pub struct CompoundCommand {
    label: String,
    commands: Vec<Command>,
}

impl CompoundCommand {
    pub fn new(label: impl Into<String>, commands: Vec<Command>) -> Self {
        Self {
            label: label.into(),
            commands,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }
}

#[derive(Debug, Clone)]
pub struct AppendableCommand {
    compound: CompoundCommand,
    state: CommandState,
}

impl AppendableCommand {
    pub fn new(label: impl Into<String>, commands: Vec<Command>) -> Self {
        Self {
            compound: CompoundCommand::new(label, commands),
            state: CommandState::Executed,
        }
    }

    pub fn state(&self) -> CommandState {
        self.state
    }

    pub fn commands(&self) -> &[Command] {
        &self.compound.commands
    }

    /// Add an already-executed command at the end.
    ///
    /// Appending to an undone command would corrupt redo ordering.
    pub fn append(&mut self, command: Command) -> Result<(), StackError> {
        if self.state == CommandState::Undone {
            return Err(StackError::AppendToUndone);
        }
        self.compound.commands.push(command);
        Ok(())
    }
}

impl Command {
    pub fn simple(command: impl SimpleCommand + 'static) -> Self {
        Command::Simple(Arc::new(command))
    }

    pub fn compound(label: impl Into<String>, commands: Vec<Command>) -> Self {
        Command::Compound(CompoundCommand::new(label, commands))
    }

    pub fn label(&self) -> &str {
        match self {
            Command::Simple(command) => command.label(),
            Command::Compound(compound) => compound.label(),
            Command::Appendable(appendable) => appendable.compound.label(),
        }
    }

    fn children(&self) -> &[Command] {
        match self {
            Command::Simple(_) => &[],
            Command::Compound(compound) => &compound.commands,
            Command::Appendable(appendable) => &appendable.compound.commands,
        }
    }

    /// Leaf commands in execution order
    pub fn leaves(&self) -> Vec<Arc<dyn SimpleCommand>> {
        let mut leaves = Vec::new();
        self.collect_leaves(&mut leaves);
        leaves
    }

    fn collect_leaves(&self, leaves: &mut Vec<Arc<dyn SimpleCommand>>) {
        match self {
            Command::Simple(command) => leaves.push(command.clone()),
            _ => {
                for child in self.children() {
                    child.collect_leaves(leaves);
                }
            }
        }
    }

    pub fn model_ids(&self) -> BTreeSet<ModelId> {
        self.leaves()
            .iter()
            .map(|leaf| leaf.model_id().clone())
            .collect()
    }

    /// State of an appendable command; plain commands carry none
    pub fn state(&self) -> Option<CommandState> {
        match self {
            Command::Appendable(appendable) => Some(appendable.state),
            _ => None,
        }
    }

    pub(crate) fn set_state(&mut self, state: CommandState) {
        if let Command::Appendable(appendable) = self {
            appendable.state = state;
        }
    }

    /// Append `command`, turning `self` into an appendable compound if needed
    pub fn append(&mut self, command: Command) -> Result<(), StackError> {
        match self {
            Command::Appendable(appendable) => appendable.append(command),
            _ => {
                self.absorb(command, false);
                Ok(())
            }
        }
    }

    /// Merge `other` into `self` regardless of state, at the front or back
    pub(crate) fn absorb(&mut self, other: Command, front: bool) {
        if let Command::Appendable(appendable) = self {
            if front {
                appendable.compound.commands.insert(0, other);
            } else {
                appendable.compound.commands.push(other);
            }
            return;
        }

        let label = self.label().to_string();
        let current = std::mem::replace(self, Command::compound(label.clone(), Vec::new()));
        let commands = if front {
            vec![other, current]
        } else {
            vec![current, other]
        };
        *self = Command::Appendable(AppendableCommand::new(label, commands));
    }

    pub fn can_execute(&self, models: &mut dyn ModelAccess) -> Result<bool, StoreError> {
        self.check(models, Action::Execute)
    }

    pub fn can_undo(&self, models: &mut dyn ModelAccess) -> Result<bool, StoreError> {
        self.check(models, Action::Undo)
    }

    pub fn can_redo(&self, models: &mut dyn ModelAccess) -> Result<bool, StoreError> {
        self.check(models, Action::Redo)
    }

    fn check(&self, models: &mut dyn ModelAccess, action: Action) -> Result<bool, StoreError> {
        for leaf in self.leaves() {
            let model = models.model(leaf.model_id())?;
            let allowed = match action {
                Action::Execute => leaf.can_execute(model),
                Action::Undo => leaf.can_undo(model),
                Action::Redo => leaf.can_redo(model),
            };
            if !allowed {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn execute<'a>(
        &'a self,
        tx: &'a mut Transaction,
    ) -> BoxFuture<'a, Result<CommandResult, CommandError>> {
        self.run(tx, Action::Execute)
    }

    pub fn undo<'a>(
        &'a self,
        tx: &'a mut Transaction,
    ) -> BoxFuture<'a, Result<CommandResult, CommandError>> {
        self.run(tx, Action::Undo)
    }

    pub fn redo<'a>(
        &'a self,
        tx: &'a mut Transaction,
    ) -> BoxFuture<'a, Result<CommandResult, CommandError>> {
        self.run(tx, Action::Redo)
    }

    fn run<'a>(
        &'a self,
        tx: &'a mut Transaction,
        action: Action,
    ) -> BoxFuture<'a, Result<CommandResult, CommandError>> {
        Box::pin(async move {
            match self {
                Command::Simple(command) => {
                    let model = tx.working_copy(command.model_id())?;
                    let patch = match action {
                        Action::Execute => command.execute(model).await?,
                        Action::Undo => command.undo(model).await?,
                        Action::Redo => command.redo(model).await?,
                    };
                    Ok(CommandResult::leaf(command.clone(), patch))
                }
                _ => {
                    let mut result = CommandResult::default();
                    let children = self.children();
                    if matches!(action, Action::Undo) {
                        for child in children.iter().rev() {
                            result.extend(child.run(tx, action).await?);
                        }
                    } else {
                        for child in children {
                            result.extend(child.run(tx, action).await?);
                        }
                    }
                    Ok(result)
                }
            }
        })
    }
}

impl From<CompoundCommand> for Command {
    fn from(compound: CompoundCommand) -> Self {
        Command::Compound(compound)
    }
}

/// Ordered mapping from each leaf that changed something to its patch
#[derive(Debug, Clone, Default)]
pub struct CommandResult {
    leaves: Vec<(Arc<dyn SimpleCommand>, Patch)>,
}

impl CommandResult {
    fn leaf(command: Arc<dyn SimpleCommand>, patch: Option<Patch>) -> Self {
        let mut result = Self::default();
        if let Some(patch) = patch.filter(|patch| !patch.is_empty()) {
            result.leaves.push((command, patch));
        }
        result
    }

    pub fn extend(&mut self, other: CommandResult) {
        self.leaves.extend(other.leaves);
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Arc<dyn SimpleCommand>, &Patch)> {
        self.leaves.iter().map(|(command, patch)| (command, patch))
    }

    /// Patch produced by `command`, matched by identity
    pub fn patch_for(&self, command: &Arc<dyn SimpleCommand>) -> Option<&Patch> {
        let wanted = Arc::as_ptr(command) as *const ();
        self.leaves
            .iter()
            .find(|(leaf, _)| Arc::as_ptr(leaf) as *const () == wanted)
            .map(|(_, patch)| patch)
    }

    /// Patches concatenated per model in execution order
    pub fn change_set(&self) -> ChangeSet {
        let mut changes = ChangeSet::new();
        for (command, patch) in &self.leaves {
            changes
                .entry(command.model_id().clone())
                .or_default()
                .extend(patch.iter().cloned());
        }
        changes
    }
}

/// Forward and reverse patches recorded on first execution
#[derive(Debug, Default)]
struct Recorded {
    patches: Mutex<Option<(Patch, Patch)>>,
}

impl Recorded {
    fn record(&self, before: &Value, after: &Value) -> Option<Patch> {
        let forward = diff(before, after);
        if forward.is_empty() {
            return None;
        }
        let reverse = diff(after, before);
        *self.patches.lock() = Some((forward.clone(), reverse));
        Some(forward)
    }

    fn is_recorded(&self) -> bool {
        self.patches.lock().is_some()
    }

    fn replay(&self, model: &mut Value, forward: bool) -> Result<Option<Patch>, CommandError> {
        let patch = match self.patches.lock().as_ref() {
            Some((redo, undo)) => {
                if forward {
                    redo.clone()
                } else {
                    undo.clone()
                }
            }
            None => return Err(CommandError::Failed("command has not been executed".to_string())),
        };
        apply(model, &patch)?;
        Ok(Some(patch))
    }
}

/// Applies a fixed patch to one model
#[derive(Debug)]
pub struct PatchCommand {
    label: String,
    model_id: ModelId,
    patch: Patch,
    recorded: Recorded,
}

impl PatchCommand {
    pub fn new(label: impl Into<String>, model_id: impl Into<ModelId>, patch: Patch) -> Self {
        Self {
            label: label.into(),
            model_id: model_id.into(),
            patch,
            recorded: Recorded::default(),
        }
    }

    pub fn patch(&self) -> &Patch {
        &self.patch
    }
}

#[async_trait]
impl SimpleCommand for PatchCommand {
    fn label(&self) -> &str {
        &self.label
    }

    fn model_id(&self) -> &ModelId {
        &self.model_id
    }

    fn can_execute(&self, model: &Value) -> bool {
        let mut probe = model.clone();
        apply(&mut probe, &self.patch).is_ok()
    }

    fn can_undo(&self, _model: &Value) -> bool {
        self.recorded.is_recorded()
    }

    fn can_redo(&self, _model: &Value) -> bool {
        self.recorded.is_recorded()
    }

    async fn execute(&self, model: &mut Value) -> Result<Option<Patch>, CommandError> {
        let before = model.clone();
        apply(model, &self.patch)?;
        Ok(self.recorded.record(&before, model))
    }

    async fn undo(&self, model: &mut Value) -> Result<Option<Patch>, CommandError> {
        self.recorded.replay(model, false)
    }

    async fn redo(&self, model: &mut Value) -> Result<Option<Patch>, CommandError> {
        self.recorded.replay(model, true)
    }
}

type Updater = Arc<dyn Fn(&mut Value) -> Result<(), CommandError> + Send + Sync>;

/// Mutates one model through a closure; changes are captured by diffing
pub struct UpdateModelCommand {
    label: String,
    model_id: ModelId,
    updater: Updater,
    recorded: Recorded,
}

impl UpdateModelCommand {
    pub fn new<F>(label: impl Into<String>, model_id: impl Into<ModelId>, updater: F) -> Self
    where
        F: Fn(&mut Value) -> Result<(), CommandError> + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            model_id: model_id.into(),
            updater: Arc::new(updater),
            recorded: Recorded::default(),
        }
    }
}

impl fmt::Debug for UpdateModelCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateModelCommand")
            .field("label", &self.label)
            .field("model_id", &self.model_id)
            .finish()
    }
}

#[async_trait]
impl SimpleCommand for UpdateModelCommand {
    fn label(&self) -> &str {
        &self.label
    }

    fn model_id(&self) -> &ModelId {
        &self.model_id
    }

    fn can_undo(&self, _model: &Value) -> bool {
        self.recorded.is_recorded()
    }

    fn can_redo(&self, _model: &Value) -> bool {
        self.recorded.is_recorded()
    }

    async fn execute(&self, model: &mut Value) -> Result<Option<Patch>, CommandError> {
        let before = model.clone();
        (self.updater)(model)?;
        Ok(self.recorded.record(&before, model))
    }

    async fn undo(&self, model: &mut Value) -> Result<Option<Patch>, CommandError> {
        self.recorded.replay(model, false)
    }

    async fn redo(&self, model: &mut Value) -> Result<Option<Patch>, CommandError> {
        self.recorded.replay(model, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ModelStore;
    use quire_patch::Operation;
    use serde_json::json;

    fn increment(model_id: &str, by: i64) -> Command {
        Command::simple(UpdateModelCommand::new("Increment", model_id, move |model| {
            let value = model["value"].as_i64().unwrap_or_default();
            model["value"] = json!(value + by);
            Ok(())
        }))
    }

    fn store_with(models: &[(&str, Value)]) -> ModelStore {
        let store = ModelStore::new();
        for (id, model) in models {
            store.set_model(*id, model.clone()).unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_compound_executes_in_order_and_undoes_in_reverse() {
        let store = store_with(&[("a", json!({ "value": 1 }))]);
        let command = Command::compound(
            "Double step",
            vec![
                increment("a", 1),
                Command::simple(UpdateModelCommand::new("Double", "a", |model| {
                    let value = model["value"].as_i64().unwrap_or_default();
                    model["value"] = json!(value * 2);
                    Ok(())
                })),
            ],
        );

        let mut tx = store.open(&command.model_ids()).unwrap();
        let result = command.execute(&mut tx).await.unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(tx.working_copy(&ModelId::from("a")).unwrap()["value"], json!(4));

        command.undo(&mut tx).await.unwrap();
        assert_eq!(tx.working_copy(&ModelId::from("a")).unwrap()["value"], json!(1));
    }

    #[tokio::test]
    async fn test_no_change_yields_empty_result() {
        let store = store_with(&[("a", json!({ "value": 1 }))]);
        let command = Command::simple(UpdateModelCommand::new("Noop", "a", |_| Ok(())));

        let mut tx = store.open(&command.model_ids()).unwrap();
        let result = command.execute(&mut tx).await.unwrap();
        assert!(result.is_empty());
        assert!(result.change_set().is_empty());
    }

    #[tokio::test]
    async fn test_patch_command_records_reverse_patch() {
        let store = store_with(&[("a", json!({ "name": "old" }))]);
        let patch = vec![Operation::Replace {
            path: "/name".to_string(),
            value: json!("new"),
        }];
        let leaf: Arc<dyn SimpleCommand> = Arc::new(PatchCommand::new("Rename", "a", patch.clone()));
        let command = Command::Simple(leaf.clone());

        let mut view = store.view();
        assert!(command.can_execute(&mut view).unwrap());
        assert!(!command.can_undo(&mut view).unwrap());

        let mut tx = store.open(&command.model_ids()).unwrap();
        let result = command.execute(&mut tx).await.unwrap();
        assert_eq!(result.patch_for(&leaf), Some(&patch));

        let undo = command.undo(&mut tx).await.unwrap();
        assert_eq!(
            undo.patch_for(&leaf),
            Some(&vec![Operation::Replace {
                path: "/name".to_string(),
                value: json!("old"),
            }])
        );
        assert_eq!(tx.working_copy(&ModelId::from("a")).unwrap(), &json!({ "name": "old" }));
    }

    #[test]
    fn test_patch_command_not_executable_on_missing_path() {
        let store = store_with(&[("a", json!({}))]);
        let command = Command::simple(PatchCommand::new(
            "Broken",
            "a",
            vec![Operation::Remove {
                path: "/missing".to_string(),
            }],
        ));
        assert!(!command.can_execute(&mut store.view()).unwrap());
    }

    #[test]
    fn test_append_creates_appendable_compound() {
        let mut command = increment("a", 1);
        command.append(increment("b", 1)).unwrap();

        assert_eq!(command.state(), Some(CommandState::Executed));
        assert_eq!(command.label(), "Increment");
        assert_eq!(command.leaves().len(), 2);
        assert_eq!(
            command.model_ids(),
            [ModelId::from("a"), ModelId::from("b")].into_iter().collect()
        );
    }

    #[test]
    fn test_append_to_undone_command_rejected() {
        let mut command = increment("a", 1);
        command.append(increment("a", 2)).unwrap();
        command.set_state(CommandState::Undone);

        assert_eq!(
            command.append(increment("a", 3)).err(),
            Some(StackError::AppendToUndone)
        );
        assert_eq!(command.leaves().len(), 2);
    }

    #[test]
    fn test_absorb_front_and_back() {
        let first = increment("a", 1);
        let second = increment("b", 1);
        let third = increment("c", 1);

        let mut merged = second.clone();
        merged.absorb(third, false);
        merged.absorb(first, true);

        let models: Vec<String> = merged
            .leaves()
            .iter()
            .map(|leaf| leaf.model_id().to_string())
            .collect();
        assert_eq!(models, vec!["a", "b", "c"]);
    }
}
