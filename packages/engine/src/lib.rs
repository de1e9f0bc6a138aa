//! # Quire Engine
//!
//! Transactional editing of in-memory JSON models across independent undo
//! timelines ("editing contexts").
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ manager: ModelManager + CommandStack facade │
//! └─────────────────────────────────────────────┘
//!                     ↓
//! ┌─────────────────────────────────────────────┐
//! │ stack: execute / undo / redo / flush / save │
//! │  - exclusive scopes per context and model   │
//! │  - dependency-aware undo and redo           │
//! │  - dirty state relative to savepoints       │
//! │  - trigger follow-ups in the same commit    │
//! └─────────────────────────────────────────────┘
//!          ↓                         ↓
//! ┌──────────────────────┐ ┌────────────────────┐
//! │ timeline + history   │ │ store: working     │
//! │ (shared entry list)  │ │ copies and commits │
//! └──────────────────────┘ └────────────────────┘
//! ```
//!
//! ## Core Principles
//!
//! 1. **Copy-on-write**: commands edit private working copies; canonical
//!    models change only on commit
//! 2. **One list, many views**: every context reads its history out of one
//!    temporally ordered entry list
//! 3. **All or nothing**: a failed operation leaves models and history as
//!    they were
//!
//! ## Usage
//!
//! ```rust,ignore
//! use quire_engine::{Command, EngineConfig, ModelManager, UpdateModelCommand};
//! use serde_json::json;
//!
//! let manager = ModelManager::new(EngineConfig::default());
//! manager.set_model("counter", json!({ "value": 42 }))?;
//!
//! let stack = manager.command_stack("editor");
//! stack
//!     .execute(Command::simple(UpdateModelCommand::new("Add", "counter", |model| {
//!         model["value"] = json!(model["value"].as_i64().unwrap_or(0) + 2);
//!         Ok(())
//!     })))
//!     .await?;
//!
//! assert!(stack.is_dirty());
//! stack.undo().await?;
//! ```

mod analysis;
mod command;
mod config;
mod errors;
mod exclusive;
mod history;
mod manager;
mod notify;
mod stack;
mod store;
mod timeline;
mod trigger;
mod types;

pub use analysis::{RedoAnalysis, UndoAnalysis};
pub use command::{
    AppendableCommand, Command, CommandResult, CommandState, CompoundCommand, PatchCommand,
    SimpleCommand, UpdateModelCommand,
};
pub use config::{EngineConfig, DEFAULT_CONFIG_NAME};
pub use errors::{
    CommandError, ConfigError, HistoryError, StackError, StoreError, TriggerError,
};
pub use exclusive::{ExclusiveExecutor, ExclusiveGuard, ResourceKey, Scope};
pub use history::EntryId;
pub use manager::{CommandStack, ModelManager};
pub use notify::{
    DirtyStateEvent, ModelEvent, StackEvent, StackEventKind, Subscribers, Subscription,
};
pub use stack::{CoreCommandStack, FollowUpProvider};
pub use store::{CanonicalView, ChangeSet, ModelAccess, ModelStore, Transaction};
pub use trigger::{FnTrigger, Trigger, TriggerEngine, DEFAULT_ITERATION_LIMIT};
pub use types::{EditingContext, ModelId};

// Re-export patch primitives used in command and trigger signatures
pub use quire_patch::{Operation, Patch};
