//! Undo/redo diagnostics.
//!
//! Reports whether the unit an undo or redo would move can move, which of
//! its editing contexts block it, and a sentence describing the outcome.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::types::EditingContext;

/// Result of analyzing an undo in one editing context
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UndoAnalysis {
    pub can_undo: bool,
    pub has_dependencies: bool,
    pub summary: String,
    pub contexts: BTreeMap<EditingContext, bool>,
}

/// Result of analyzing a redo in one editing context
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedoAnalysis {
    pub can_redo: bool,
    pub has_dependencies: bool,
    pub summary: String,
    pub contexts: BTreeMap<EditingContext, bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Undo,
    Redo,
}

impl Direction {
    fn verb(self) -> &'static str {
        match self {
            Direction::Undo => "undo",
            Direction::Redo => "redo",
        }
    }

    fn participle(self) -> &'static str {
        match self {
            Direction::Undo => "undone",
            Direction::Redo => "redone",
        }
    }
}

/// Per-context verdicts for one unit
#[derive(Debug, Default)]
pub(crate) struct Verdicts {
    pub contexts: BTreeMap<EditingContext, bool>,
    pub has_dependencies: bool,
}

impl Verdicts {
    fn allowed(&self) -> bool {
        self.contexts.values().all(|allowed| *allowed)
    }
}

impl UndoAnalysis {
    pub(crate) fn build(context: &EditingContext, verdicts: Option<Verdicts>) -> Self {
        let (allowed, has_dependencies, summary, contexts) =
            analyze(context, verdicts, Direction::Undo);
        Self {
            can_undo: allowed,
            has_dependencies,
            summary,
            contexts,
        }
    }
}

impl RedoAnalysis {
    pub(crate) fn build(context: &EditingContext, verdicts: Option<Verdicts>) -> Self {
        let (allowed, has_dependencies, summary, contexts) =
            analyze(context, verdicts, Direction::Redo);
        Self {
            can_redo: allowed,
            has_dependencies,
            summary,
            contexts,
        }
    }
}

fn analyze(
    context: &EditingContext,
    verdicts: Option<Verdicts>,
    direction: Direction,
) -> (bool, bool, String, BTreeMap<EditingContext, bool>) {
    let Some(verdicts) = verdicts else {
        let summary = format!(
            "There is no command to {} in editing context '{}'.",
            direction.verb(),
            context
        );
        return (false, false, summary, BTreeMap::new());
    };

    let allowed = verdicts.allowed();
    let summary = summarize(context, &verdicts, direction);
    (allowed, verdicts.has_dependencies, summary, verdicts.contexts)
}

fn summarize(context: &EditingContext, verdicts: &Verdicts, direction: Direction) -> String {
    let action = direction.participle();

    if verdicts.allowed() {
        let dependents: Vec<&EditingContext> =
            verdicts.contexts.keys().filter(|other| *other != context).collect();
        if !verdicts.has_dependencies || dependents.is_empty() {
            return format!("Command can be {action} in editing context '{context}'.");
        }
        return format!(
            "Command can be {action} in editing context '{context}' together with dependent commands in {}.",
            name_contexts(&dependents)
        );
    }

    if verdicts.contexts.get(context) == Some(&false) {
        return format!("Command cannot be {action} in editing context '{context}'.");
    }

    let failing: Vec<&EditingContext> = verdicts
        .contexts
        .iter()
        .filter(|(other, allowed)| *other != context && !**allowed)
        .map(|(other, _)| other)
        .collect();
    if failing.len() == 1 {
        format!(
            "Command cannot be {action} in editing context '{context}' because a dependent command in {} cannot be {action}.",
            name_contexts(&failing)
        )
    } else {
        format!(
            "Command cannot be {action} in editing context '{context}' because dependent commands in {} cannot be {action}.",
            name_contexts(&failing)
        )
    }
}

fn name_contexts(contexts: &[&EditingContext]) -> String {
    let quoted: Vec<String> = contexts.iter().map(|c| format!("'{c}'")).collect();
    let noun = if contexts.len() == 1 {
        "editing context"
    } else {
        "editing contexts"
    };
    format!("{noun} {}", quoted.join(", "))
}
