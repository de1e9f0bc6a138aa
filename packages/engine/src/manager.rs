//! # Model Manager
//!
//! Facade over one engine instance: model access, trigger registration and
//! per-context [`CommandStack`] handles.
//!
//! ```rust,ignore
//! let manager = ModelManager::new(EngineConfig::default());
//! manager.set_model("order", json!({ "qty": 1 }))?;
//!
//! let stack = manager.command_stack("editor");
//! stack.execute(command).await?;
//! stack.undo().await?;
//! ```

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;

use crate::analysis::{RedoAnalysis, UndoAnalysis};
use crate::command::{Command, CommandResult};
use crate::config::EngineConfig;
use crate::errors::{ConfigError, StackError, StoreError};
use crate::notify::{DirtyStateEvent, ModelEvent, StackEvent, Subscription};
use crate::stack::CoreCommandStack;
use crate::store::ModelStore;
use crate::trigger::{Trigger, TriggerEngine};
use crate::types::{EditingContext, ModelId};

/// Owns the store, the command stack and the trigger engine
pub struct ModelManager {
    store: ModelStore,
    stack: Arc<CoreCommandStack>,
    triggers: Arc<TriggerEngine>,
}

impl ModelManager {
    pub fn new(config: EngineConfig) -> Self {
        let store = ModelStore::new();
        let triggers = Arc::new(TriggerEngine::new(config.trigger_iteration_limit));
        let stack = CoreCommandStack::new(store.clone(), config).with_follow_up(triggers.clone());

        Self {
            store,
            stack: Arc::new(stack),
            triggers,
        }
    }

    /// Build a manager from `quire.config.json` in `dir`, or defaults
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Ok(Self::new(EngineConfig::load(dir)?))
    }

    /// Register a trigger; call before the first command runs
    pub fn add_trigger(&self, trigger: impl Trigger + 'static) {
        self.triggers.add_trigger(trigger);
    }

    pub fn triggers(&self) -> &TriggerEngine {
        &self.triggers
    }

    pub fn core(&self) -> &Arc<CoreCommandStack> {
        &self.stack
    }

    pub fn set_model(&self, id: impl Into<ModelId>, model: Value) -> Result<(), StoreError> {
        self.store.set_model(id, model)
    }

    pub fn get_model(&self, id: &ModelId) -> Option<Value> {
        self.store.get_model(id)
    }

    pub fn remove_model(&self, id: &ModelId) -> Option<Value> {
        self.store.remove_model(id)
    }

    pub fn model_ids(&self) -> Vec<ModelId> {
        self.store.model_ids()
    }

    /// Commits of one model, or of every model
    pub fn subscribe_model<F>(&self, model_id: Option<ModelId>, callback: F) -> Subscription
    where
        F: Fn(&ModelEvent) + Send + Sync + 'static,
    {
        self.store.subscribe(model_id, callback)
    }

    pub fn editing_contexts(&self) -> Vec<EditingContext> {
        self.stack.editing_contexts().into_iter().collect()
    }

    /// Handle bound to the editing context `id`
    pub fn command_stack(&self, id: impl Into<EditingContext>) -> CommandStack {
        CommandStack {
            context: id.into(),
            core: self.stack.clone(),
        }
    }
}

impl Default for ModelManager {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

/// The command stack of one editing context
#[derive(Clone)]
pub struct CommandStack {
    context: EditingContext,
    core: Arc<CoreCommandStack>,
}

impl CommandStack {
    pub fn context(&self) -> &EditingContext {
        &self.context
    }

    pub async fn execute(&self, command: Command) -> Result<Option<CommandResult>, StackError> {
        self.core
            .execute(command, std::slice::from_ref(&self.context))
            .await
    }

    /// Execute in this context and in `others`
    pub async fn execute_in(
        &self,
        command: Command,
        others: &[EditingContext],
    ) -> Result<Option<CommandResult>, StackError> {
        let mut contexts = vec![self.context.clone()];
        contexts.extend(others.iter().cloned());
        self.core.execute(command, &contexts).await
    }

    pub async fn execute_and_append(
        &self,
        command: Command,
    ) -> Result<Option<CommandResult>, StackError> {
        self.core
            .execute_and_append(&self.context, command, &[])
            .await
    }

    /// Undo, following dependencies as configured
    pub async fn undo(&self) -> Result<CommandResult, StackError> {
        self.undo_with(self.core.config().undo_with_dependencies)
            .await
    }

    pub async fn undo_with(&self, with_dependencies: bool) -> Result<CommandResult, StackError> {
        self.core.undo(&self.context, with_dependencies).await
    }

    /// Redo, following dependencies as configured
    pub async fn redo(&self) -> Result<CommandResult, StackError> {
        self.redo_with(self.core.config().undo_with_dependencies)
            .await
    }

    pub async fn redo_with(&self, with_dependencies: bool) -> Result<CommandResult, StackError> {
        self.core.redo(&self.context, with_dependencies).await
    }

    pub async fn flush(&self) {
        self.core.flush(&self.context).await
    }

    pub async fn mark_saved(&self) {
        self.core.mark_saved(&self.context).await
    }

    pub fn is_dirty(&self) -> bool {
        self.core.is_dirty(&self.context)
    }

    pub fn dirty_model_ids(&self) -> Vec<ModelId> {
        self.core.dirty_model_ids(&self.context)
    }

    pub fn undo_command(&self) -> Option<Command> {
        self.core.undo_command(&self.context)
    }

    pub fn redo_command(&self) -> Option<Command> {
        self.core.redo_command(&self.context)
    }

    pub fn can_execute(&self, command: &Command) -> Result<bool, StackError> {
        self.core.can_execute(command)
    }

    pub fn can_undo(&self) -> bool {
        self.core.can_undo(&self.context)
    }

    pub fn can_redo(&self) -> bool {
        self.core.can_redo(&self.context)
    }

    pub fn analyze_undo(&self) -> UndoAnalysis {
        self.core.analyze_undo(&self.context)
    }

    pub fn analyze_redo(&self) -> RedoAnalysis {
        self.core.analyze_redo(&self.context)
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&StackEvent) + Send + Sync + 'static,
    {
        self.core
            .subscribe_stack(Some(self.context.clone()), callback)
    }

    pub fn subscribe_dirty<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&DirtyStateEvent) + Send + Sync + 'static,
    {
        self.core
            .subscribe_dirty(Some(self.context.clone()), callback)
    }
}
