//! # Trigger Engine
//!
//! Derives follow-up patches that keep dependent fields of a model
//! consistent after a change.
//!
//! ## Passes
//!
//! ```text
//! pass 1: delta = committed patch     previous = pre-change model
//! pass n: delta = patches of pass n-1 previous = scratch before pass n-1
//! ```
//!
//! Within a pass every trigger runs in registration order and its patch is
//! applied to the scratch copy at once, so later triggers see it. Passes
//! repeat until one produces nothing; the result is a single diff from the
//! changed model to the settled scratch copy.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use quire_patch::{apply, diff, Patch};
use serde_json::Value;
use tracing::{debug, trace};

use crate::command::{Command, PatchCommand};
use crate::errors::TriggerError;
use crate::stack::FollowUpProvider;
use crate::store::{ChangeSet, Transaction};
use crate::types::ModelId;

pub const DEFAULT_ITERATION_LIMIT: usize = 100;

/// Computes a corrective patch for one model, or `None` when the model
/// already satisfies the trigger's invariant
#[async_trait]
pub trait Trigger: Send + Sync {
    async fn trigger(
        &self,
        model_id: &ModelId,
        model: &Value,
        delta: &Patch,
        previous: &Value,
    ) -> Option<Patch>;
}

/// Adapts a synchronous closure into a [`Trigger`]
pub struct FnTrigger<F> {
    compute: F,
}

impl<F> FnTrigger<F>
where
    F: Fn(&ModelId, &Value, &Patch, &Value) -> Option<Patch> + Send + Sync,
{
    pub fn new(compute: F) -> Self {
        Self { compute }
    }
}

#[async_trait]
impl<F> Trigger for FnTrigger<F>
where
    F: Fn(&ModelId, &Value, &Patch, &Value) -> Option<Patch> + Send + Sync,
{
    async fn trigger(
        &self,
        model_id: &ModelId,
        model: &Value,
        delta: &Patch,
        previous: &Value,
    ) -> Option<Patch> {
        (self.compute)(model_id, model, delta, previous)
    }
}

/// Ordered trigger registry
pub struct TriggerEngine {
    triggers: RwLock<Vec<Arc<dyn Trigger>>>,
    iteration_limit: usize,
}

impl TriggerEngine {
    pub fn new(iteration_limit: usize) -> Self {
        Self {
            triggers: RwLock::new(Vec::new()),
            iteration_limit,
        }
    }

    pub fn iteration_limit(&self) -> usize {
        self.iteration_limit
    }

    /// Register a trigger; registration order is application order
    pub fn add_trigger(&self, trigger: impl Trigger + 'static) {
        self.triggers.write().push(Arc::new(trigger));
    }

    pub fn len(&self) -> usize {
        self.triggers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Combined follow-up patch for one changed model
    pub async fn apply_triggers(
        &self,
        model_id: &ModelId,
        model: &Value,
        delta: &Patch,
        previous: &Value,
    ) -> Result<Patch, TriggerError> {
        let triggers: Vec<Arc<dyn Trigger>> = self.triggers.read().clone();
        if triggers.is_empty() {
            return Ok(Patch::new());
        }

        let mut scratch = model.clone();
        let mut delta = delta.clone();
        let mut previous = previous.clone();
        let mut passes = 0;

        loop {
            if passes == self.iteration_limit {
                return Err(TriggerError::IterationLimit {
                    model_id: model_id.clone(),
                    limit: self.iteration_limit,
                });
            }
            passes += 1;

            let start = scratch.clone();
            let mut produced = Patch::new();
            for trigger in &triggers {
                let Some(patch) = trigger.trigger(model_id, &scratch, &delta, &previous).await else {
                    continue;
                };
                if patch.is_empty() {
                    continue;
                }
                apply(&mut scratch, &patch)?;
                produced.extend(patch);
            }

            trace!(model_id = %model_id, pass = passes, operations = produced.len(), "Trigger pass");
            if produced.is_empty() {
                break;
            }
            delta = produced;
            previous = start;
        }

        let combined = diff(model, &scratch);
        debug!(model_id = %model_id, passes, operations = combined.len(), "Triggers settled");
        Ok(combined)
    }

    /// Follow-up patches for every model in a change-set
    pub async fn apply_all(
        &self,
        changes: &ChangeSet,
        tx: &mut Transaction,
    ) -> Result<BTreeMap<ModelId, Patch>, TriggerError> {
        let mut follow_ups = BTreeMap::new();
        for (model_id, delta) in changes {
            let Some(previous) = tx.canonical(model_id) else {
                continue;
            };
            let model = tx.working_copy(model_id)?.clone();
            let patch = self.apply_triggers(model_id, &model, delta, &previous).await?;
            if !patch.is_empty() {
                follow_ups.insert(model_id.clone(), patch);
            }
        }
        Ok(follow_ups)
    }
}

impl Default for TriggerEngine {
    fn default() -> Self {
        Self::new(DEFAULT_ITERATION_LIMIT)
    }
}

#[async_trait]
impl FollowUpProvider for TriggerEngine {
    async fn follow_up(
        &self,
        changes: &ChangeSet,
        tx: &mut Transaction,
    ) -> Result<Option<Command>, TriggerError> {
        let follow_ups = self.apply_all(changes, tx).await?;
        if follow_ups.is_empty() {
            return Ok(None);
        }

        let commands = follow_ups
            .into_iter()
            .map(|(model_id, patch)| Command::simple(PatchCommand::new("Trigger", model_id, patch)))
            .collect();
        Ok(Some(Command::compound("Triggers", commands)))
    }
}
