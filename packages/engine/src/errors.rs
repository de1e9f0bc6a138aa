//! Error types for the engine

use quire_patch::PatchError;
use thiserror::Error;

use crate::history::EntryId;
use crate::types::{EditingContext, ModelId};

/// Integrity faults raised by the model store
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Model already registered: {0}")]
    AlreadyRegistered(ModelId),

    #[error("Already open: {0}")]
    AlreadyOpen(ModelId),

    #[error("Not open: {0}")]
    NotOpen(ModelId),
}

/// Failure of a leaf command while mutating a working copy
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    #[error("Command failed: {0}")]
    Failed(String),

    #[error("Patch error: {0}")]
    Patch(#[from] PatchError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HistoryError {
    #[error("Pushing entry {0} would create a cycle")]
    Cycle(EntryId),

    #[error("Unknown stack entry: {0}")]
    UnknownEntry(EntryId),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TriggerError {
    #[error("Triggers for model {model_id} did not settle after {limit} passes")]
    IterationLimit { model_id: ModelId, limit: usize },

    #[error("Patch error: {0}")]
    Patch(#[from] PatchError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// Rejection of a command-stack operation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StackError {
    #[error("an editing context is required")]
    ContextRequired,

    #[error("command is not executable")]
    NotExecutable,

    #[error("command is not undoable")]
    NotUndoable,

    #[error("command is not redoable")]
    NotRedoable,

    #[error("nothing to undo in editing context '{0}'")]
    NothingToUndo(EditingContext),

    #[error("nothing to redo in editing context '{0}'")]
    NothingToRedo(EditingContext),

    #[error("no command to append in the editing context '{0}'")]
    NothingToAppend(EditingContext),

    #[error("cannot append to a command on the redo stack")]
    AppendToUndone,

    #[error("cannot append: editing context '{0}' has later commands on its undo stack")]
    AppendBuried(EditingContext),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    #[error("History error: {0}")]
    History(#[from] HistoryError),
}
