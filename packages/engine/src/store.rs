//! # Model Store
//!
//! Canonical model storage plus the working-copy transaction manager.
//!
//! ## Lifecycle
//!
//! ```text
//! open(ids) → working_copy(id)* → commit(changes) | cancel()
//!                  ↓                    ↓
//!          lazy deep clone     atomic replace + notify
//! ```
//!
//! Canonical documents are never mutated in place. A transaction edits
//! private clones and publishes them on commit, so readers observe either
//! the complete pre-transaction state or the complete committed state.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use quire_patch::Patch;
use serde_json::Value;
use tracing::debug;

use crate::errors::StoreError;
use crate::notify::{ModelEvent, Subscribers, Subscription};
use crate::types::ModelId;

/// Per-model patches produced by one operation
pub type ChangeSet = BTreeMap<ModelId, Patch>;

/// Read access to models, used to evaluate command predicates
pub trait ModelAccess {
    fn model(&mut self, id: &ModelId) -> Result<&Value, StoreError>;
}

#[derive(Default)]
struct StoreState {
    models: HashMap<ModelId, Value>,
    open: HashSet<ModelId>,
}

struct StoreInner {
    state: Mutex<StoreState>,
    subscribers: Subscribers<ModelId, ModelEvent>,
}

/// Shared handle to canonical model state
#[derive(Clone)]
pub struct ModelStore {
    inner: Arc<StoreInner>,
}

impl ModelStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(StoreState::default()),
                subscribers: Subscribers::new(),
            }),
        }
    }

    /// Register a model; fails if the ID is already live
    pub fn set_model(&self, id: impl Into<ModelId>, model: Value) -> Result<(), StoreError> {
        let id = id.into();
        let mut state = self.inner.state.lock();
        if state.models.contains_key(&id) {
            return Err(StoreError::AlreadyRegistered(id));
        }
        debug!(model_id = %id, "Registering model");
        state.models.insert(id, model);
        Ok(())
    }

    pub fn get_model(&self, id: &ModelId) -> Option<Value> {
        self.inner.state.lock().models.get(id).cloned()
    }

    pub fn remove_model(&self, id: &ModelId) -> Option<Value> {
        debug!(model_id = %id, "Removing model");
        self.inner.state.lock().models.remove(id)
    }

    pub fn model_ids(&self) -> Vec<ModelId> {
        let mut ids: Vec<ModelId> = self.inner.state.lock().models.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Whether a transaction currently holds `id` open
    pub fn is_open(&self, id: &ModelId) -> bool {
        self.inner.state.lock().open.contains(id)
    }

    /// Begin a transaction scope over `ids`.
    ///
    /// The exclusive executor keeps scopes disjoint; a collision here is an
    /// integrity fault.
    pub fn open(&self, ids: &BTreeSet<ModelId>) -> Result<Transaction, StoreError> {
        let mut state = self.inner.state.lock();
        if let Some(id) = ids.iter().find(|id| state.open.contains(*id)) {
            return Err(StoreError::AlreadyOpen(id.clone()));
        }
        state.open.extend(ids.iter().cloned());
        debug!(models = ids.len(), "Opened transaction scope");

        Ok(Transaction {
            store: self.clone(),
            scope: ids.clone(),
            copies: HashMap::new(),
            finished: false,
        })
    }

    /// Subscribe to commits of one model, or of all models
    pub fn subscribe<F>(&self, model_id: Option<ModelId>, callback: F) -> Subscription
    where
        F: Fn(&ModelEvent) + Send + Sync + 'static,
    {
        self.inner.subscribers.subscribe(model_id, callback)
    }

    /// Read-only view over canonical state
    pub fn view(&self) -> CanonicalView<'_> {
        CanonicalView {
            store: self,
            cache: HashMap::new(),
        }
    }

    fn release(&self, ids: &BTreeSet<ModelId>) {
        let mut state = self.inner.state.lock();
        for id in ids {
            state.open.remove(id);
        }
    }
}

impl Default for ModelStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Isolated working copies for one operation
pub struct Transaction {
    store: ModelStore,
    scope: BTreeSet<ModelId>,
    copies: HashMap<ModelId, Value>,
    finished: bool,
}

impl Transaction {
    pub fn model_ids(&self) -> &BTreeSet<ModelId> {
        &self.scope
    }

    /// The working copy of `id`, cloned from canonical state on first access
    pub fn working_copy(&mut self, id: &ModelId) -> Result<&mut Value, StoreError> {
        if !self.scope.contains(id) {
            return Err(StoreError::NotOpen(id.clone()));
        }
        if !self.copies.contains_key(id) {
            let model = self
                .store
                .get_model(id)
                .ok_or_else(|| StoreError::NotOpen(id.clone()))?;
            self.copies.insert(id.clone(), model);
        }
        self.copies
            .get_mut(id)
            .ok_or_else(|| StoreError::NotOpen(id.clone()))
    }

    /// Canonical (pre-transaction) state of `id`
    pub fn canonical(&self, id: &ModelId) -> Option<Value> {
        self.store.get_model(id)
    }

    pub fn snapshot(&self) -> HashMap<ModelId, Value> {
        self.copies.clone()
    }

    pub fn restore(&mut self, snapshot: HashMap<ModelId, Value>) {
        self.copies = snapshot;
    }

    /// Publish working copies of every model touched by `changes`, notify
    /// model subscribers, then release the scope.
    pub fn commit(mut self, changes: &ChangeSet) {
        let mut published = Vec::new();
        {
            let mut state = self.store.inner.state.lock();
            for (id, patch) in changes {
                if patch.is_empty() {
                    continue;
                }
                let Some(copy) = self.copies.remove(id) else {
                    continue;
                };
                if !state.models.contains_key(id) {
                    debug!(model_id = %id, "Model removed during transaction; dropping working copy");
                    continue;
                }
                state.models.insert(id.clone(), copy.clone());
                published.push(ModelEvent {
                    model_id: id.clone(),
                    model: copy,
                    patch: patch.clone(),
                });
            }
        }
        debug!(models = published.len(), "Committed transaction");

        for event in &published {
            self.store.inner.subscribers.notify(&event.model_id, event);
        }

        self.finish();
    }

    /// Discard working copies without touching canonical state
    pub fn cancel(mut self) {
        debug!(models = self.scope.len(), "Cancelled transaction");
        self.finish();
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.copies.clear();
            self.store.release(&self.scope);
        }
    }
}

impl ModelAccess for Transaction {
    fn model(&mut self, id: &ModelId) -> Result<&Value, StoreError> {
        self.working_copy(id).map(|model| &*model)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Canonical-state reader with a per-view cache
pub struct CanonicalView<'a> {
    store: &'a ModelStore,
    cache: HashMap<ModelId, Value>,
}

impl ModelAccess for CanonicalView<'_> {
    fn model(&mut self, id: &ModelId) -> Result<&Value, StoreError> {
        if !self.cache.contains_key(id) {
            let model = self
                .store
                .get_model(id)
                .ok_or_else(|| StoreError::NotOpen(id.clone()))?;
            self.cache.insert(id.clone(), model);
        }
        self.cache
            .get(id)
            .ok_or_else(|| StoreError::NotOpen(id.clone()))
    }
}
