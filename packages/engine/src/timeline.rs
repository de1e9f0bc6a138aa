//! # Timeline
//!
//! Per-context bookkeeping layered over the shared [`History`] list:
//! undo/redo pointers, savepoints, dependency gathering and dirty state.
//!
//! ## Pointers
//!
//! Acting on an entry moves it to the tail, so for each context:
//!
//! - the undo-top is the last executed entry carrying it
//! - the redo-top is the last undone entry carrying it
//!
//! ## Dependencies
//!
//! A unit is the target entry plus every entry that, on a context shared
//! with the unit, was executed (or undone) after it. The unit is gathered
//! to a fixpoint and moved across the undo boundary as one entry.
//!
//! ## Dirty state
//!
//! ```text
//! savepoint      is_dirty                 dirty models
//! ─────────      ────────                 ────────────
//! none           undo-top exists          every executed entry
//! At(s)          undo-top != s            entries changed since s
//! Flushed(d, a)  always                   d + entries changed since a
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use tracing::debug;

use crate::command::{Command, CommandState};
use crate::errors::{HistoryError, StackError};
use crate::history::{EntryId, History, MergeFor, StackEntry};
use crate::types::{EditingContext, ModelId};

/// Dirty model IDs per editing context
pub type DirtySnapshot = BTreeMap<EditingContext, BTreeSet<ModelId>>;

/// Saved position of an editing context
#[derive(Debug, Clone, PartialEq)]
pub enum Savepoint {
    /// The undo-top at the last save
    At(EntryId),
    /// History was discarded while dirty; `dirty` stays dirty until saved,
    /// and anything changed after `anchor` is added to it
    Flushed {
        dirty: BTreeSet<ModelId>,
        anchor: Option<EntryId>,
    },
}

impl Savepoint {
    fn references(&self, id: EntryId) -> bool {
        match self {
            Savepoint::At(saved) => *saved == id,
            Savepoint::Flushed { anchor, .. } => *anchor == Some(id),
        }
    }
}

/// Entries that undo or redo together
#[derive(Debug, Clone, PartialEq)]
pub struct Unit {
    pub target: EntryId,
    /// Dependent entries in list order
    pub dependencies: Vec<EntryId>,
}

impl Unit {
    pub fn entries(&self) -> impl Iterator<Item = EntryId> + '_ {
        std::iter::once(self.target).chain(self.dependencies.iter().copied())
    }

    pub fn has_dependencies(&self) -> bool {
        !self.dependencies.is_empty()
    }
}

/// Undo/redo timelines of every editing context
#[derive(Debug, Default)]
pub struct Timeline {
    history: History,
    savepoints: HashMap<EditingContext, Savepoint>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn entry(&self, id: EntryId) -> Option<&StackEntry> {
        self.history.get(id)
    }

    pub fn savepoint(&self, context: &EditingContext) -> Option<&Savepoint> {
        self.savepoints.get(context)
    }

    pub fn undo_top(&self, context: &EditingContext) -> Option<EntryId> {
        self.history.latest_in(context, Some(CommandState::Executed))
    }

    pub fn redo_top(&self, context: &EditingContext) -> Option<EntryId> {
        self.history.latest_in(context, Some(CommandState::Undone))
    }

    /// Contexts with history, plus contexts that were flushed while dirty
    pub fn editing_contexts(&self) -> BTreeSet<EditingContext> {
        let mut contexts = self.history.contexts();
        contexts.extend(
            self.savepoints
                .iter()
                .filter(|(_, savepoint)| matches!(savepoint, Savepoint::Flushed { .. }))
                .map(|(context, _)| context.clone()),
        );
        contexts
    }

    // ─── Units ────────────────────────────────────────────────────────────

    /// The unit an undo (or redo) in `context` would move, if any
    pub fn plan(&self, context: &EditingContext, op: MergeFor) -> Option<Unit> {
        let (target, state) = match op {
            MergeFor::Undo => (self.undo_top(context)?, CommandState::Executed),
            MergeFor::Redo => (self.redo_top(context)?, CommandState::Undone),
        };
        Some(self.gather(target, state))
    }

    fn gather(&self, target: EntryId, state: CommandState) -> Unit {
        let order = self.positions();
        let position = |id: &EntryId| order.get(id).copied().unwrap_or(usize::MAX);
        let mut members = BTreeSet::from([target]);

        loop {
            let mut found = Vec::new();
            for context in self.contexts_of(members.iter().copied()) {
                let earliest = members
                    .iter()
                    .filter(|id| self.carries(**id, &context))
                    .min_by_key(|id| position(*id))
                    .copied();
                let Some(mut cursor) = earliest else {
                    continue;
                };
                while let Some(next) = self.history.next_in(cursor, &context) {
                    if !members.contains(&next) && self.state(next) == Some(state) {
                        found.push(next);
                    }
                    cursor = next;
                }
            }
            if found.is_empty() {
                break;
            }
            members.extend(found);
        }

        members.remove(&target);
        let mut dependencies: Vec<EntryId> = members.into_iter().collect();
        dependencies.sort_by_key(position);
        Unit {
            target,
            dependencies,
        }
    }

    pub fn unit_contexts(&self, unit: &Unit) -> BTreeSet<EditingContext> {
        self.contexts_of(unit.entries())
    }

    pub fn unit_models(&self, unit: &Unit) -> BTreeSet<ModelId> {
        unit.entries()
            .filter_map(|id| self.history.get(id))
            .flat_map(|entry| entry.model_ids())
            .collect()
    }

    /// The command the unit will become once merged
    pub fn unit_command(&self, unit: &Unit, op: MergeFor) -> Option<Command> {
        let mut command = self.history.get(unit.target)?.command.clone();
        for dependency in &unit.dependencies {
            let other = self.history.get(*dependency)?.command.clone();
            command.absorb(other, op == MergeFor::Redo);
        }
        Some(command)
    }

    /// Merge the unit into its target and move it across the undo boundary
    pub fn complete(&mut self, unit: &Unit, op: MergeFor) -> Result<(), HistoryError> {
        self.reconcile_savepoints(unit, op);
        for dependency in &unit.dependencies {
            self.history.merge(unit.target, *dependency, op)?;
        }

        let state = match op {
            MergeFor::Undo => CommandState::Undone,
            MergeFor::Redo => CommandState::Executed,
        };
        let entry = self
            .history
            .get_mut(unit.target)
            .ok_or(HistoryError::UnknownEntry(unit.target))?;
        entry.state = state;
        entry.command.set_state(state);
        self.history.move_to_tail(unit.target)?;

        debug!(
            entry = %unit.target,
            merged = unit.dependencies.len(),
            ?op,
            "Moved unit across the undo boundary"
        );
        Ok(())
    }

    /// Savepoints pointing into a merged unit either follow the target or,
    /// when the unit now also contains work done after the save, become
    /// flushed savepoints.
    fn reconcile_savepoints(&mut self, unit: &Unit, op: MergeFor) {
        if !unit.has_dependencies() {
            return;
        }
        let members: Vec<EntryId> = unit.entries().collect();
        let affected: Vec<(EditingContext, Savepoint)> = self
            .savepoints
            .iter()
            .filter(|(_, savepoint)| members.iter().any(|id| savepoint.references(*id)))
            .map(|(context, savepoint)| (context.clone(), savepoint.clone()))
            .collect();

        for (context, savepoint) in affected {
            let carrying: Vec<EntryId> = members
                .iter()
                .copied()
                .filter(|id| self.carries(*id, &context))
                .collect();
            let latest = match op {
                MergeFor::Undo => carrying.last().copied(),
                MergeFor::Redo => carrying.first().copied(),
            };

            let replacement = match savepoint {
                Savepoint::At(saved) if Some(saved) == latest => Savepoint::At(unit.target),
                _ => {
                    let mut dirty = self.dirty_model_ids(&context);
                    for id in &carrying {
                        if let Some(entry) = self.history.get(*id) {
                            dirty.extend(entry.model_ids());
                        }
                    }
                    Savepoint::Flushed {
                        dirty,
                        anchor: Some(unit.target),
                    }
                }
            };
            self.savepoints.insert(context, replacement);
        }
    }

    // ─── Recording ────────────────────────────────────────────────────────

    /// Undone entries a new execution in `contexts` invalidates.
    ///
    /// Cascades: purging an entry also purges, in each of its other
    /// contexts, the undone entries that would be redone after it.
    pub fn redo_cascade(&self, contexts: &BTreeSet<EditingContext>) -> BTreeSet<EntryId> {
        let mut queue: VecDeque<EntryId> = contexts
            .iter()
            .flat_map(|context| self.undone_in(context))
            .collect();
        let mut doomed = BTreeSet::new();
        let order = self.positions();
        let precedes = |a: &EntryId, b: &EntryId| match (order.get(a), order.get(b)) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        };

        while let Some(id) = queue.pop_front() {
            if !doomed.insert(id) {
                continue;
            }
            let Some(entry) = self.history.get(id) else {
                continue;
            };
            for context in &entry.contexts {
                queue.extend(
                    self.undone_in(context)
                        .into_iter()
                        .filter(|other| !doomed.contains(other) && precedes(other, &id)),
                );
            }
        }
        doomed
    }

    /// Every context whose state a new execution in `contexts` touches
    pub fn flush_scope(&self, contexts: &BTreeSet<EditingContext>) -> BTreeSet<EditingContext> {
        let mut scope = contexts.clone();
        scope.extend(self.contexts_of(self.redo_cascade(contexts).into_iter()));
        scope
    }

    fn flush_redo(&mut self, contexts: &BTreeSet<EditingContext>) -> usize {
        let doomed = self.redo_cascade(contexts);
        self.purge_entries(&doomed);
        doomed.len()
    }

    /// Record a freshly executed command
    pub fn record(
        &mut self,
        command: Command,
        contexts: BTreeSet<EditingContext>,
    ) -> Result<EntryId, HistoryError> {
        let purged = self.flush_redo(&contexts);
        let id = self.history.create(command, contexts);
        self.history.push(id)?;
        debug!(entry = %id, purged, "Recorded command");
        Ok(id)
    }

    /// Target of an append in `context` and the contexts the grown entry
    /// will carry
    pub fn plan_append(
        &self,
        context: &EditingContext,
        contexts: &BTreeSet<EditingContext>,
    ) -> Result<(EntryId, BTreeSet<EditingContext>), StackError> {
        let target = self
            .undo_top(context)
            .ok_or_else(|| StackError::NothingToAppend(context.clone()))?;
        let entry = self
            .history
            .get(target)
            .ok_or(HistoryError::UnknownEntry(target))?;
        if entry.state == CommandState::Undone {
            return Err(StackError::AppendToUndone);
        }

        let mut all = entry.contexts.clone();
        all.extend(contexts.iter().cloned());
        all.insert(context.clone());

        // The grown entry becomes the undo-top of every context it carries
        if let Some(buried) = all.iter().find(|other| {
            self.undo_top(other)
                .map_or(false, |top| top != target && self.history.precedes(target, top))
        }) {
            return Err(StackError::AppendBuried(buried.clone()));
        }
        Ok((target, all))
    }

    /// Append an executed command to the undo-top of `context`
    pub fn append(
        &mut self,
        context: &EditingContext,
        command: Command,
        contexts: &BTreeSet<EditingContext>,
    ) -> Result<EntryId, StackError> {
        let (target, all) = self.plan_append(context, contexts)?;
        self.flush_redo(&all);

        let appended_models = command.model_ids();
        let saved_here: Vec<EditingContext> = self
            .savepoints
            .iter()
            .filter(|(_, savepoint)| savepoint.references(target))
            .map(|(context, _)| context.clone())
            .collect();
        for saved in saved_here {
            let mut dirty = self.dirty_model_ids(&saved);
            dirty.extend(appended_models.iter().cloned());
            self.savepoints.insert(
                saved,
                Savepoint::Flushed {
                    dirty,
                    anchor: Some(target),
                },
            );
        }

        let entry = self
            .history
            .get_mut(target)
            .ok_or(HistoryError::UnknownEntry(target))?;
        entry.command.append(command)?;
        entry.contexts.extend(all);
        self.history.move_to_tail(target)?;

        debug!(entry = %target, "Appended command");
        Ok(target)
    }

    // ─── Flush and save ───────────────────────────────────────────────────

    /// Detach `context` from all history, keeping its dirty models dirty
    pub fn flush(&mut self, context: &EditingContext) -> bool {
        let dirty = self
            .is_dirty(context)
            .then(|| self.dirty_model_ids(context));

        let mut purgeable = BTreeSet::new();
        for id in self.history.chain(context) {
            if self.history.remove_context(id, context) {
                purgeable.insert(id);
            }
        }
        self.purge_entries(&purgeable);

        let was_dirty = dirty.is_some();
        match dirty {
            Some(dirty) => {
                self.savepoints.insert(
                    context.clone(),
                    Savepoint::Flushed {
                        dirty,
                        anchor: None,
                    },
                );
            }
            None => {
                self.savepoints.remove(context);
            }
        }
        debug!(%context, purged = purgeable.len(), was_dirty, "Flushed editing context");
        was_dirty
    }

    pub fn mark_saved(&mut self, context: &EditingContext) {
        match self.undo_top(context) {
            Some(id) => {
                self.savepoints.insert(context.clone(), Savepoint::At(id));
            }
            None => {
                self.savepoints.remove(context);
            }
        }
    }

    fn purge_entries(&mut self, ids: &BTreeSet<EntryId>) {
        if ids.is_empty() {
            return;
        }
        let orphaned: Vec<(EditingContext, BTreeSet<ModelId>)> = self
            .savepoints
            .iter()
            .filter(|(_, savepoint)| ids.iter().any(|id| savepoint.references(*id)))
            .map(|(context, _)| (context.clone(), self.dirty_model_ids(context)))
            .collect();

        for id in ids {
            self.history.purge(*id);
        }

        for (context, dirty) in orphaned {
            let anchor = self.undo_top(&context);
            self.savepoints
                .insert(context, Savepoint::Flushed { dirty, anchor });
        }
    }

    // ─── Dirty state ──────────────────────────────────────────────────────

    pub fn is_dirty(&self, context: &EditingContext) -> bool {
        match self.savepoints.get(context) {
            Some(Savepoint::Flushed { .. }) => true,
            Some(Savepoint::At(saved)) => self.undo_top(context) != Some(*saved),
            None => self.undo_top(context).is_some(),
        }
    }

    pub fn dirty_model_ids(&self, context: &EditingContext) -> BTreeSet<ModelId> {
        match self.savepoints.get(context) {
            None => self.changed_since(context, None),
            Some(Savepoint::At(saved)) => {
                if self.is_dirty(context) {
                    self.changed_since(context, Some(*saved))
                } else {
                    BTreeSet::new()
                }
            }
            Some(Savepoint::Flushed { dirty, anchor }) => {
                let mut models = dirty.clone();
                models.extend(self.changed_since(context, *anchor));
                models
            }
        }
    }

    pub fn dirty_snapshot<'a>(
        &self,
        contexts: impl IntoIterator<Item = &'a EditingContext>,
    ) -> DirtySnapshot {
        contexts
            .into_iter()
            .map(|context| (context.clone(), self.dirty_model_ids(context)))
            .collect()
    }

    fn changed_since(&self, context: &EditingContext, anchor: Option<EntryId>) -> BTreeSet<ModelId> {
        let order = self.positions();
        let position = |id: EntryId| order.get(&id).copied();
        let anchor = anchor.and_then(|id| Some((position(id)?, self.state(id)?)));

        let changed = self.history.chain(context).into_iter().filter(|id| {
            let state = self.state(*id);
            let at = position(*id);
            match anchor {
                None => state == Some(CommandState::Executed),
                Some((anchor, CommandState::Executed)) => {
                    state == Some(CommandState::Executed) && at.map_or(false, |at| at > anchor)
                }
                Some((anchor, CommandState::Undone)) => {
                    state == Some(CommandState::Undone) && at.map_or(false, |at| at >= anchor)
                }
            }
        });

        changed
            .filter_map(|id| self.history.get(id))
            .flat_map(|entry| entry.model_ids())
            .collect()
    }

    // ─── Helpers ──────────────────────────────────────────────────────────

    fn positions(&self) -> HashMap<EntryId, usize> {
        self.history
            .ids()
            .into_iter()
            .enumerate()
            .map(|(position, id)| (id, position))
            .collect()
    }

    fn state(&self, id: EntryId) -> Option<CommandState> {
        self.history.get(id).map(|entry| entry.state)
    }

    fn carries(&self, id: EntryId, context: &EditingContext) -> bool {
        self.history
            .get(id)
            .map_or(false, |entry| entry.has_context(context))
    }

    fn undone_in(&self, context: &EditingContext) -> Vec<EntryId> {
        self.history
            .chain(context)
            .into_iter()
            .filter(|id| self.state(*id) == Some(CommandState::Undone))
            .collect()
    }

    fn contexts_of(&self, ids: impl Iterator<Item = EntryId>) -> BTreeSet<EditingContext> {
        ids.filter_map(|id| self.history.get(id))
            .flat_map(|entry| entry.contexts.iter().cloned())
            .collect()
    }
}
