//! # Core Command Stack
//!
//! Executes, undoes and redoes commands across editing contexts.
//!
//! ## Operation Flow
//!
//! ```text
//! acquire scope ─→ open working copies ─→ check predicate ─→ run command
//!       │                                                        │
//!       │                                       follow-up hook ←─┘
//!       │                                             │
//!       └── retry if the scope grew        update history + dirty state
//!                                                     │
//!                                        commit ─→ notify subscribers
//! ```
//!
//! Every operation holds its editing contexts and models exclusively from
//! planning to commit. A failure anywhere before commit drops the working
//! copies, so canonical models and history stay as they were.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::analysis::{RedoAnalysis, UndoAnalysis, Verdicts};
use crate::command::{Command, CommandResult};
use crate::config::EngineConfig;
use crate::errors::{HistoryError, StackError, TriggerError};
use crate::exclusive::{ExclusiveExecutor, ExclusiveGuard, Scope};
use crate::history::MergeFor;
use crate::notify::{DirtyStateEvent, StackEvent, StackEventKind, Subscribers, Subscription};
use crate::store::{ChangeSet, ModelStore, Transaction};
use crate::timeline::{DirtySnapshot, Timeline};
use crate::types::{EditingContext, ModelId};

/// Supplies an extra command after a change, run in the same transaction
/// and never recorded in history
#[async_trait]
pub trait FollowUpProvider: Send + Sync {
    async fn follow_up(
        &self,
        changes: &ChangeSet,
        tx: &mut Transaction,
    ) -> Result<Option<Command>, TriggerError>;
}

/// Shared multi-context command stack
pub struct CoreCommandStack {
    store: ModelStore,
    executor: ExclusiveExecutor,
    timeline: Mutex<Timeline>,
    follow_up: Option<Arc<dyn FollowUpProvider>>,
    config: EngineConfig,
    stack_subscribers: Subscribers<EditingContext, StackEvent>,
    dirty_subscribers: Subscribers<EditingContext, DirtyStateEvent>,
}

impl CoreCommandStack {
    pub fn new(store: ModelStore, config: EngineConfig) -> Self {
        Self {
            store,
            executor: ExclusiveExecutor::new(),
            timeline: Mutex::new(Timeline::new()),
            follow_up: None,
            config,
            stack_subscribers: Subscribers::new(),
            dirty_subscribers: Subscribers::new(),
        }
    }

    /// Install the follow-up hook
    pub fn with_follow_up(mut self, provider: Arc<dyn FollowUpProvider>) -> Self {
        self.follow_up = Some(provider);
        self
    }

    pub fn store(&self) -> &ModelStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ─── Execute ──────────────────────────────────────────────────────────

    /// Execute `command` in `contexts`.
    ///
    /// Returns `None` when the command changed nothing; such a command is
    /// not recorded and nobody is notified.
    #[instrument(skip(self, command), fields(command = command.label()))]
    pub async fn execute(
        &self,
        command: Command,
        contexts: &[EditingContext],
    ) -> Result<Option<CommandResult>, StackError> {
        let contexts: BTreeSet<EditingContext> = contexts.iter().cloned().collect();
        if contexts.is_empty() {
            return Err(StackError::ContextRequired);
        }
        let models = command.model_ids();

        let (_guard, scope_contexts) = self
            .acquire(|timeline| {
                let scope_contexts = timeline.flush_scope(&contexts);
                let scope = Scope::new(scope_contexts.iter().cloned(), models.iter().cloned());
                (scope, scope_contexts)
            })
            .await;

        let mut tx = self.store.open(&models)?;
        if !command.can_execute(&mut tx)? {
            tx.cancel();
            return Err(StackError::NotExecutable);
        }

        let mut result = command.execute(&mut tx).await?;
        if result.is_empty() {
            debug!("Command produced no change");
            tx.cancel();
            return Ok(None);
        }
        self.run_follow_up(&mut tx, &mut result).await;

        let (before, after) = {
            let mut timeline = self.timeline.lock();
            let before = timeline.dirty_snapshot(&scope_contexts);
            let entry = timeline.record(command.clone(), contexts.clone())?;
            debug!(%entry, leaves = result.len(), "Executed command");
            (before, timeline.dirty_snapshot(&scope_contexts))
        };

        tx.commit(&result.change_set());
        self.notify_stack(&contexts, StackEventKind::Executed, Some(&command));
        self.notify_redo_discarded(&scope_contexts, &contexts);
        self.notify_dirty(&before, &after);
        Ok(Some(result))
    }

    /// Execute `command` and merge it into the undo-top entry of `appended`
    #[instrument(skip(self, command), fields(command = command.label()))]
    pub async fn execute_and_append(
        &self,
        appended: &EditingContext,
        command: Command,
        contexts: &[EditingContext],
    ) -> Result<Option<CommandResult>, StackError> {
        let extra: BTreeSet<EditingContext> = contexts.iter().cloned().collect();
        let models = command.model_ids();

        let (_guard, planned) = self
            .acquire(|timeline| match timeline.plan_append(appended, &extra) {
                Ok((_, all)) => {
                    let scope_contexts = timeline.flush_scope(&all);
                    let scope = Scope::new(scope_contexts.iter().cloned(), models.iter().cloned());
                    (scope, Ok(scope_contexts))
                }
                Err(err) => {
                    let scope = Scope::new([appended.clone()], BTreeSet::new());
                    (scope, Err(err))
                }
            })
            .await;
        let scope_contexts = planned?;

        let mut tx = self.store.open(&models)?;
        if !command.can_execute(&mut tx)? {
            tx.cancel();
            return Err(StackError::NotExecutable);
        }

        let mut result = command.execute(&mut tx).await?;
        if result.is_empty() {
            debug!("Appended command produced no change");
            tx.cancel();
            return Ok(None);
        }
        self.run_follow_up(&mut tx, &mut result).await;

        let (before, after, entry_contexts, merged) = {
            let mut timeline = self.timeline.lock();
            let before = timeline.dirty_snapshot(&scope_contexts);
            let entry = timeline.append(appended, command, &extra)?;
            let (entry_contexts, merged) = timeline
                .entry(entry)
                .map(|entry| (entry.contexts.clone(), entry.command.clone()))
                .ok_or(HistoryError::UnknownEntry(entry))?;
            debug!(%entry, leaves = result.len(), "Appended command");
            (before, timeline.dirty_snapshot(&scope_contexts), entry_contexts, merged)
        };

        tx.commit(&result.change_set());
        self.notify_stack(&entry_contexts, StackEventKind::Executed, Some(&merged));
        self.notify_redo_discarded(&scope_contexts, &entry_contexts);
        self.notify_dirty(&before, &after);
        Ok(Some(result))
    }

    // ─── Undo / Redo ──────────────────────────────────────────────────────

    #[instrument(skip(self))]
    pub async fn undo(
        &self,
        context: &EditingContext,
        with_dependencies: bool,
    ) -> Result<CommandResult, StackError> {
        self.move_unit(context, with_dependencies, MergeFor::Undo).await
    }

    #[instrument(skip(self))]
    pub async fn redo(
        &self,
        context: &EditingContext,
        with_dependencies: bool,
    ) -> Result<CommandResult, StackError> {
        self.move_unit(context, with_dependencies, MergeFor::Redo).await
    }

    async fn move_unit(
        &self,
        context: &EditingContext,
        with_dependencies: bool,
        op: MergeFor,
    ) -> Result<CommandResult, StackError> {
        let (_guard, unit) = self
            .acquire(|timeline| match timeline.plan(context, op) {
                Some(unit) => {
                    let scope = Scope::new(timeline.unit_contexts(&unit), timeline.unit_models(&unit));
                    (scope, Some(unit))
                }
                None => (Scope::new([context.clone()], BTreeSet::new()), None),
            })
            .await;

        let Some(unit) = unit else {
            return Err(match op {
                MergeFor::Undo => StackError::NothingToUndo(context.clone()),
                MergeFor::Redo => StackError::NothingToRedo(context.clone()),
            });
        };
        let rejected = match op {
            MergeFor::Undo => StackError::NotUndoable,
            MergeFor::Redo => StackError::NotRedoable,
        };
        if unit.has_dependencies() && !with_dependencies {
            debug!(dependencies = unit.dependencies.len(), "Refusing to expand the unit");
            return Err(rejected);
        }

        let (command, unit_contexts, models) = {
            let timeline = self.timeline.lock();
            let command = timeline
                .unit_command(&unit, op)
                .ok_or(HistoryError::UnknownEntry(unit.target))?;
            (command, timeline.unit_contexts(&unit), timeline.unit_models(&unit))
        };

        let mut tx = self.store.open(&models)?;
        let allowed = match op {
            MergeFor::Undo => command.can_undo(&mut tx)?,
            MergeFor::Redo => command.can_redo(&mut tx)?,
        };
        if !allowed {
            tx.cancel();
            return Err(rejected);
        }

        let mut result = match op {
            MergeFor::Undo => command.undo(&mut tx).await?,
            MergeFor::Redo => command.redo(&mut tx).await?,
        };
        self.run_follow_up(&mut tx, &mut result).await;

        let (before, after) = {
            let mut timeline = self.timeline.lock();
            let before = timeline.dirty_snapshot(&unit_contexts);
            timeline.complete(&unit, op)?;
            (before, timeline.dirty_snapshot(&unit_contexts))
        };

        tx.commit(&result.change_set());
        let kind = match op {
            MergeFor::Undo => StackEventKind::Undone,
            MergeFor::Redo => StackEventKind::Redone,
        };
        debug!(
            entry = %unit.target,
            dependencies = unit.dependencies.len(),
            leaves = result.len(),
            ?kind,
            "Moved command"
        );
        self.notify_stack(&unit_contexts, kind, Some(&command));
        self.notify_dirty(&before, &after);
        Ok(result)
    }

    // ─── Flush / Save ─────────────────────────────────────────────────────

    /// Discard the history of `context`; dirty models stay dirty until saved
    #[instrument(skip(self))]
    pub async fn flush(&self, context: &EditingContext) {
        let _guard = self
            .executor
            .acquire(&Scope::new([context.clone()], BTreeSet::new()))
            .await;

        let was_dirty = self.timeline.lock().flush(context);
        info!(%context, was_dirty, "Flushed command stack");
        self.notify_stack(
            &BTreeSet::from([context.clone()]),
            StackEventKind::Flushed,
            None,
        );
    }

    /// Record the current undo-top of `context` as saved
    #[instrument(skip(self))]
    pub async fn mark_saved(&self, context: &EditingContext) {
        let _guard = self
            .executor
            .acquire(&Scope::new([context.clone()], BTreeSet::new()))
            .await;

        let (before, after) = {
            let mut timeline = self.timeline.lock();
            let before = timeline.dirty_snapshot([context]);
            timeline.mark_saved(context);
            (before, timeline.dirty_snapshot([context]))
        };
        info!(%context, "Marked command stack saved");
        self.notify_dirty(&before, &after);
    }

    // ─── Queries ──────────────────────────────────────────────────────────

    pub fn is_dirty(&self, context: &EditingContext) -> bool {
        self.timeline.lock().is_dirty(context)
    }

    pub fn dirty_model_ids(&self, context: &EditingContext) -> Vec<ModelId> {
        self.timeline
            .lock()
            .dirty_model_ids(context)
            .into_iter()
            .collect()
    }

    pub fn undo_command(&self, context: &EditingContext) -> Option<Command> {
        let timeline = self.timeline.lock();
        let id = timeline.undo_top(context)?;
        timeline.entry(id).map(|entry| entry.command.clone())
    }

    pub fn redo_command(&self, context: &EditingContext) -> Option<Command> {
        let timeline = self.timeline.lock();
        let id = timeline.redo_top(context)?;
        timeline.entry(id).map(|entry| entry.command.clone())
    }

    pub fn editing_contexts(&self) -> BTreeSet<EditingContext> {
        self.timeline.lock().editing_contexts()
    }

    /// Whether `command` could execute against canonical state
    pub fn can_execute(&self, command: &Command) -> Result<bool, StackError> {
        Ok(command.can_execute(&mut self.store.view())?)
    }

    pub fn can_undo(&self, context: &EditingContext) -> bool {
        self.analyze_undo(context).can_undo
    }

    pub fn can_redo(&self, context: &EditingContext) -> bool {
        self.analyze_redo(context).can_redo
    }

    pub fn analyze_undo(&self, context: &EditingContext) -> UndoAnalysis {
        UndoAnalysis::build(context, self.verdicts(context, MergeFor::Undo))
    }

    pub fn analyze_redo(&self, context: &EditingContext) -> RedoAnalysis {
        RedoAnalysis::build(context, self.verdicts(context, MergeFor::Redo))
    }

    fn verdicts(&self, context: &EditingContext, op: MergeFor) -> Option<Verdicts> {
        let (entries, has_dependencies) = {
            let timeline = self.timeline.lock();
            let unit = timeline.plan(context, op)?;
            let entries: Vec<(BTreeSet<EditingContext>, Command)> = unit
                .entries()
                .filter_map(|id| timeline.entry(id))
                .map(|entry| (entry.contexts.clone(), entry.command.clone()))
                .collect();
            (entries, unit.has_dependencies())
        };

        let mut view = self.store.view();
        let mut contexts = BTreeMap::new();
        for (entry_contexts, command) in entries {
            let allowed = match op {
                MergeFor::Undo => command.can_undo(&mut view),
                MergeFor::Redo => command.can_redo(&mut view),
            }
            .unwrap_or(false);
            for entry_context in entry_contexts {
                let verdict = contexts.entry(entry_context).or_insert(true);
                *verdict = *verdict && allowed;
            }
        }

        Some(Verdicts {
            contexts,
            has_dependencies,
        })
    }

    // ─── Subscriptions ────────────────────────────────────────────────────

    /// Stack events for one context, or for all contexts
    pub fn subscribe_stack<F>(&self, context: Option<EditingContext>, callback: F) -> Subscription
    where
        F: Fn(&StackEvent) + Send + Sync + 'static,
    {
        self.stack_subscribers.subscribe(context, callback)
    }

    /// Dirty-state events for one context, or for all contexts
    pub fn subscribe_dirty<F>(&self, context: Option<EditingContext>, callback: F) -> Subscription
    where
        F: Fn(&DirtyStateEvent) + Send + Sync + 'static,
    {
        self.dirty_subscribers.subscribe(context, callback)
    }

    // ─── Internals ────────────────────────────────────────────────────────

    /// Hold the scope `plan` asks for, re-planning until the held scope
    /// still covers it
    async fn acquire<T, P>(&self, plan: P) -> (ExclusiveGuard, T)
    where
        P: Fn(&Timeline) -> (Scope, T) + Send + Sync,
        T: Send,
    {
        let mut scope = Scope::default();
        loop {
            let (needed, _) = plan(&self.timeline.lock());
            scope = scope.union(&needed);

            let guard = self.executor.acquire(&scope).await;
            let (needed, planned) = plan(&self.timeline.lock());
            if guard.covers(&needed) {
                return (guard, planned);
            }
            debug!("Scope grew while waiting; acquiring again");
        }
    }

    async fn run_follow_up(&self, tx: &mut Transaction, result: &mut CommandResult) {
        if !self.config.follow_ups {
            return;
        }
        let Some(provider) = &self.follow_up else {
            return;
        };

        let snapshot = tx.snapshot();
        let changes = result.change_set();
        let outcome = provider.follow_up(&changes, tx).await;
        let follow_up = match outcome {
            Ok(Some(command)) => command,
            Ok(None) => return,
            Err(err) => {
                error!(error = %err, "Follow-up computation failed; model integrity at risk");
                tx.restore(snapshot);
                return;
            }
        };

        match follow_up.can_execute(tx) {
            Ok(true) => {}
            Ok(false) => {
                warn!(command = follow_up.label(), "Follow-up command is not executable; discarding");
                tx.restore(snapshot);
                return;
            }
            Err(err) => {
                warn!(command = follow_up.label(), error = %err, "Follow-up command check failed; discarding");
                tx.restore(snapshot);
                return;
            }
        }

        match follow_up.execute(tx).await {
            Ok(extra) => {
                debug!(leaves = extra.len(), "Applied follow-up command");
                result.extend(extra);
            }
            Err(err) => {
                warn!(command = follow_up.label(), error = %err, "Follow-up command failed; discarding");
                tx.restore(snapshot);
            }
        }
    }

    fn notify_stack(
        &self,
        contexts: &BTreeSet<EditingContext>,
        kind: StackEventKind,
        command: Option<&Command>,
    ) {
        for context in contexts {
            let event = StackEvent {
                context: context.clone(),
                kind,
                command: command.cloned(),
            };
            self.stack_subscribers.notify(context, &event);
        }
    }

    /// Contexts that lost redo history without executing anything themselves
    fn notify_redo_discarded(
        &self,
        scope_contexts: &BTreeSet<EditingContext>,
        executed_in: &BTreeSet<EditingContext>,
    ) {
        let discarded: BTreeSet<EditingContext> =
            scope_contexts.difference(executed_in).cloned().collect();
        if !discarded.is_empty() {
            self.notify_stack(&discarded, StackEventKind::RedoDiscarded, None);
        }
    }

    fn notify_dirty(&self, before: &DirtySnapshot, after: &DirtySnapshot) {
        for event in dirty_changes(before, after) {
            self.dirty_subscribers.notify(&event.context, &event);
        }
    }
}

/// Models whose dirty state flipped between two snapshots, per context
fn dirty_changes(before: &DirtySnapshot, after: &DirtySnapshot) -> Vec<DirtyStateEvent> {
    let empty = BTreeSet::new();
    let contexts: BTreeSet<&EditingContext> = before.keys().chain(after.keys()).collect();

    contexts
        .into_iter()
        .filter_map(|context| {
            let was = before.get(context).unwrap_or(&empty);
            let now = after.get(context).unwrap_or(&empty);
            let dirty: BTreeMap<ModelId, bool> = now
                .difference(was)
                .map(|id| (id.clone(), true))
                .chain(was.difference(now).map(|id| (id.clone(), false)))
                .collect();
            (!dirty.is_empty()).then(|| DirtyStateEvent {
                context: context.clone(),
                dirty,
            })
        })
        .collect()
}
