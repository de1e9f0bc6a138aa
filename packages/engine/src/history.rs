//! # Stack Entry Graph
//!
//! One global, temporally ordered, doubly linked list of history entries,
//! stored in an arena and addressed by stable [`EntryId`] handles.
//!
//! ## Design
//!
//! - The list order is the order of the last execute, append, undo or redo
//!   of each entry; an entry that is acted upon moves to the tail
//! - Each entry carries the set of editing contexts that still consider it
//!   part of their history; [`History::next_in`] and
//!   [`History::previous_in`] give every context its own view of the list
//! - Handles are never reused, so a stale handle simply misses
//!
//! An entry with no contexts left is purgeable.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use crate::command::{Command, CommandState};
use crate::errors::HistoryError;
use crate::types::{EditingContext, ModelId};

/// Stable handle of a stack entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which operation a merge prepares for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeFor {
    /// Absorbed commands run after this one: `[this, other]`
    Undo,
    /// Absorbed commands run before this one: `[other, this]`
    Redo,
}

#[derive(Debug)]
pub struct StackEntry {
    pub command: Command,
    pub contexts: BTreeSet<EditingContext>,
    pub state: CommandState,
    previous: Option<EntryId>,
    next: Option<EntryId>,
}

impl StackEntry {
    pub fn has_context(&self, context: &EditingContext) -> bool {
        self.contexts.contains(context)
    }

    pub fn model_ids(&self) -> BTreeSet<ModelId> {
        self.command.model_ids()
    }

    pub fn is_purgeable(&self) -> bool {
        self.contexts.is_empty()
    }
}

/// Arena-backed history list
#[derive(Debug, Default)]
pub struct History {
    entries: HashMap<EntryId, StackEntry>,
    head: Option<EntryId>,
    tail: Option<EntryId>,
    next_id: u64,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn head(&self) -> Option<EntryId> {
        self.head
    }

    pub fn tail(&self) -> Option<EntryId> {
        self.tail
    }

    pub fn get(&self, id: EntryId) -> Option<&StackEntry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut StackEntry> {
        self.entries.get_mut(&id)
    }

    /// Allocate an unlinked, executed entry
    pub fn create(&mut self, command: Command, contexts: BTreeSet<EditingContext>) -> EntryId {
        let id = EntryId(self.next_id);
        self.next_id += 1;
        self.entries.insert(
            id,
            StackEntry {
                command,
                contexts,
                state: CommandState::Executed,
                previous: None,
                next: None,
            },
        );
        id
    }

    /// Link `id` as the new tail.
    ///
    /// Rejects an entry that is already linked: walking forward from it
    /// would reach the current tail, so linking again would close a cycle.
    pub fn push(&mut self, id: EntryId) -> Result<(), HistoryError> {
        if !self.entries.contains_key(&id) {
            return Err(HistoryError::UnknownEntry(id));
        }
        if self.tail.is_some() && self.walk_forward(id).any(|step| Some(step) == self.tail) {
            return Err(HistoryError::Cycle(id));
        }
        if self.head == Some(id) {
            return Err(HistoryError::Cycle(id));
        }

        let previous = self.tail;
        if let Some(tail) = previous.and_then(|tail| self.entries.get_mut(&tail)) {
            tail.next = Some(id);
        }
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.previous = previous;
            entry.next = None;
        }
        if self.head.is_none() {
            self.head = Some(id);
        }
        self.tail = Some(id);
        Ok(())
    }

    /// Splice `id` out of the list, keeping it allocated
    pub fn pop(&mut self, id: EntryId) -> Result<(), HistoryError> {
        let (previous, next) = {
            let entry = self
                .entries
                .get_mut(&id)
                .ok_or(HistoryError::UnknownEntry(id))?;
            (entry.previous.take(), entry.next.take())
        };

        match previous.and_then(|p| self.entries.get_mut(&p)) {
            Some(prev) => prev.next = next,
            None => {
                if self.head == Some(id) {
                    self.head = next;
                }
            }
        }
        match next.and_then(|n| self.entries.get_mut(&n)) {
            Some(following) => following.previous = previous,
            None => {
                if self.tail == Some(id) {
                    self.tail = previous;
                }
            }
        }
        Ok(())
    }

    /// Move `id` to the tail
    pub fn move_to_tail(&mut self, id: EntryId) -> Result<(), HistoryError> {
        self.pop(id)?;
        self.push(id)
    }

    /// Splice out and deallocate `id`
    pub fn purge(&mut self, id: EntryId) -> Option<StackEntry> {
        self.pop(id).ok()?;
        self.entries.remove(&id)
    }

    /// Absorb `other` into `target` as a compound and remove `other`
    pub fn merge(&mut self, target: EntryId, other: EntryId, op: MergeFor) -> Result<(), HistoryError> {
        if !self.entries.contains_key(&target) {
            return Err(HistoryError::UnknownEntry(target));
        }
        let absorbed = self.purge(other).ok_or(HistoryError::UnknownEntry(other))?;
        let entry = self
            .entries
            .get_mut(&target)
            .ok_or(HistoryError::UnknownEntry(target))?;

        entry.command.absorb(absorbed.command, op == MergeFor::Redo);
        entry.command.set_state(entry.state);
        entry.contexts.extend(absorbed.contexts);
        Ok(())
    }

    /// Nearest following entry that carries `context`
    pub fn next_in(&self, id: EntryId, context: &EditingContext) -> Option<EntryId> {
        self.walk_forward(id)
            .skip(1)
            .find(|step| self.carries(*step, context))
    }

    /// Nearest preceding entry that carries `context`
    pub fn previous_in(&self, id: EntryId, context: &EditingContext) -> Option<EntryId> {
        self.walk_backward(id)
            .skip(1)
            .find(|step| self.carries(*step, context))
    }

    /// Most recent entry carrying `context`, optionally in a given state
    pub fn latest_in(&self, context: &EditingContext, state: Option<CommandState>) -> Option<EntryId> {
        let tail = self.tail?;
        self.walk_backward(tail).find(|step| {
            self.entries.get(step).map_or(false, |entry| {
                entry.has_context(context) && state.map_or(true, |state| entry.state == state)
            })
        })
    }

    /// Whether `a` comes before `b` in the list
    pub fn precedes(&self, a: EntryId, b: EntryId) -> bool {
        a != b && self.walk_forward(a).any(|step| step == b)
    }

    /// Whether `a` comes after `b` in the list
    pub fn succeeds(&self, a: EntryId, b: EntryId) -> bool {
        self.precedes(b, a)
    }

    /// Drop `context` from the entry; returns whether the entry is now purgeable
    pub fn remove_context(&mut self, id: EntryId, context: &EditingContext) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.contexts.remove(context);
                entry.is_purgeable()
            }
            None => false,
        }
    }

    pub fn is_purgeable(&self, id: EntryId) -> bool {
        self.entries.get(&id).map_or(false, StackEntry::is_purgeable)
    }

    /// Entry handles in list order
    pub fn ids(&self) -> Vec<EntryId> {
        match self.head {
            Some(head) => self.walk_forward(head).collect(),
            None => Vec::new(),
        }
    }

    /// Entries carrying `context`, in list order
    pub fn chain(&self, context: &EditingContext) -> Vec<EntryId> {
        self.ids()
            .into_iter()
            .filter(|id| self.carries(*id, context))
            .collect()
    }

    pub fn contexts(&self) -> BTreeSet<EditingContext> {
        self.entries
            .values()
            .flat_map(|entry| entry.contexts.iter().cloned())
            .collect()
    }

    fn carries(&self, id: EntryId, context: &EditingContext) -> bool {
        self.entries
            .get(&id)
            .map_or(false, |entry| entry.has_context(context))
    }

    fn walk_forward(&self, from: EntryId) -> Walk<'_> {
        Walk {
            history: self,
            current: Some(from),
            forward: true,
        }
    }

    fn walk_backward(&self, from: EntryId) -> Walk<'_> {
        Walk {
            history: self,
            current: Some(from),
            forward: false,
        }
    }
}

/// Iterator over handles starting at (and including) one entry
struct Walk<'a> {
    history: &'a History,
    current: Option<EntryId>,
    forward: bool,
}

impl Iterator for Walk<'_> {
    type Item = EntryId;

    fn next(&mut self) -> Option<EntryId> {
        let current = self.current?;
        let entry = self.history.entries.get(&current)?;
        self.current = if self.forward {
            entry.next
        } else {
            entry.previous
        };
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::UpdateModelCommand;

    fn command(label: &str) -> Command {
        Command::simple(UpdateModelCommand::new(label, "model", |_| Ok(())))
    }

    fn contexts(values: &[&str]) -> BTreeSet<EditingContext> {
        values.iter().map(|v| EditingContext::from(*v)).collect()
    }

    fn push(history: &mut History, label: &str, ctx: &[&str]) -> EntryId {
        let id = history.create(command(label), contexts(ctx));
        history.push(id).unwrap();
        id
    }

    #[test]
    fn test_push_links_in_order() {
        let mut history = History::new();
        let a = push(&mut history, "a", &["c1"]);
        let b = push(&mut history, "b", &["c1"]);
        let c = push(&mut history, "c", &["c2"]);

        assert_eq!(history.ids(), vec![a, b, c]);
        assert_eq!(history.head(), Some(a));
        assert_eq!(history.tail(), Some(c));
        assert!(history.precedes(a, c));
        assert!(history.succeeds(c, a));
        assert!(!history.precedes(c, a));
    }

    #[test]
    fn test_push_linked_entry_is_cycle() {
        let mut history = History::new();
        let a = push(&mut history, "a", &["c1"]);
        push(&mut history, "b", &["c1"]);

        assert_eq!(history.push(a), Err(HistoryError::Cycle(a)));
    }

    #[test]
    fn test_pop_preserves_neighbor_links() {
        let mut history = History::new();
        let a = push(&mut history, "a", &["c1"]);
        let b = push(&mut history, "b", &["c1"]);
        let c = push(&mut history, "c", &["c1"]);

        history.pop(b).unwrap();
        assert_eq!(history.ids(), vec![a, c]);
        assert_eq!(history.previous_in(c, &EditingContext::from("c1")), Some(a));

        history.push(b).unwrap();
        assert_eq!(history.ids(), vec![a, c, b]);
    }

    #[test]
    fn test_context_views_skip_foreign_entries() {
        let mut history = History::new();
        let a = push(&mut history, "a", &["c1"]);
        let b = push(&mut history, "b", &["c2"]);
        let c = push(&mut history, "c", &["c1", "c2"]);
        let c1 = EditingContext::from("c1");
        let c2 = EditingContext::from("c2");

        assert_eq!(history.next_in(a, &c1), Some(c));
        assert_eq!(history.previous_in(c, &c2), Some(b));
        assert_eq!(history.previous_in(a, &c1), None);
        assert_eq!(history.chain(&c1), vec![a, c]);
        assert_eq!(history.latest_in(&c2, None), Some(c));
    }

    #[test]
    fn test_merge_orders_commands_by_operation() {
        let mut history = History::new();
        let a = push(&mut history, "first", &["c1"]);
        let b = push(&mut history, "second", &["c2"]);
        history.merge(a, b, MergeFor::Undo).unwrap();

        let labels: Vec<String> = history.get(a).unwrap().command.leaves().iter().map(|l| l.label().to_string()).collect();
        assert_eq!(labels, vec!["first", "second"]);
        assert_eq!(history.get(a).unwrap().contexts, contexts(&["c1", "c2"]));
        assert_eq!(history.ids(), vec![a]);

        let c = push(&mut history, "third", &["c1"]);
        history.merge(a, c, MergeFor::Redo).unwrap();
        let labels: Vec<String> = history.get(a).unwrap().command.leaves().iter().map(|l| l.label().to_string()).collect();
        assert_eq!(labels, vec!["third", "first", "second"]);
    }

    #[test]
    fn test_remove_context_makes_entry_purgeable() {
        let mut history = History::new();
        let a = push(&mut history, "a", &["c1", "c2"]);

        assert!(!history.remove_context(a, &EditingContext::from("c1")));
        assert!(history.remove_context(a, &EditingContext::from("c2")));
        assert!(history.is_purgeable(a));

        history.purge(a);
        assert!(history.is_empty());
        assert_eq!(history.head(), None);
        assert_eq!(history.tail(), None);
    }
}
