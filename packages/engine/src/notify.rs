//! # Subscriptions
//!
//! Callback registries for stack, dirty-state and model notifications.
//!
//! - A listener targets one key (context or model) or every key
//! - Notification iterates a copy of the listener list, so callbacks may
//!   subscribe or unsubscribe while being notified
//! - A panicking callback is logged and does not stop the others

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use quire_patch::Patch;
use serde_json::Value;
use tracing::warn;

use crate::command::Command;
use crate::types::{EditingContext, ModelId};

/// What happened to an editing context's history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackEventKind {
    Executed,
    Undone,
    Redone,
    Flushed,
    /// Redo history dropped by an execution in another context
    RedoDiscarded,
}

/// Editing context changed
#[derive(Debug, Clone)]
pub struct StackEvent {
    pub context: EditingContext,
    pub kind: StackEventKind,
    /// The acting command (absent for flush)
    pub command: Option<Command>,
}

/// Dirty state of some models changed within an editing context
#[derive(Debug, Clone, PartialEq)]
pub struct DirtyStateEvent {
    pub context: EditingContext,
    pub dirty: BTreeMap<ModelId, bool>,
}

/// Canonical model replaced by a commit
#[derive(Debug, Clone, PartialEq)]
pub struct ModelEvent {
    pub model_id: ModelId,
    pub model: Value,
    pub patch: Patch,
}

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Listener<K, E> {
    id: u64,
    filter: Option<K>,
    callback: Callback<E>,
}

struct Registry<K, E> {
    next_id: u64,
    listeners: Vec<Listener<K, E>>,
}

/// Listener registry keyed by context or model
pub struct Subscribers<K, E> {
    registry: Arc<Mutex<Registry<K, E>>>,
}

impl<K, E> Subscribers<K, E>
where
    K: PartialEq + Clone + Send + 'static,
    E: 'static,
{
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                listeners: Vec::new(),
            })),
        }
    }

    /// Register a callback for one key, or for all keys when `filter` is `None`
    pub fn subscribe<F>(&self, filter: Option<K>, callback: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = {
            let mut registry = self.registry.lock();
            let id = registry.next_id;
            registry.next_id += 1;
            registry.listeners.push(Listener {
                id,
                filter,
                callback: Arc::new(callback),
            });
            id
        };

        let registry: Weak<Mutex<Registry<K, E>>> = Arc::downgrade(&self.registry);
        Subscription::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry.lock().listeners.retain(|listener| listener.id != id);
            }
        })
    }

    pub fn notify(&self, key: &K, event: &E) {
        let callbacks: Vec<Callback<E>> = self
            .registry
            .lock()
            .listeners
            .iter()
            .filter(|listener| listener.filter.as_ref().map_or(true, |filter| filter == key))
            .map(|listener| listener.callback.clone())
            .collect();

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                warn!("Subscriber callback panicked; continuing with remaining subscribers");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.registry.lock().listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, E> Default for Subscribers<K, E>
where
    K: PartialEq + Clone + Send + 'static,
    E: 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Handle of a registered callback.
///
/// Closing is idempotent; dropping the handle closes it.
pub struct Subscription {
    closer: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Subscription {
    fn new(closer: impl FnOnce() + Send + 'static) -> Self {
        Self {
            closer: Mutex::new(Some(Box::new(closer))),
        }
    }

    pub fn close(&self) {
        let closer = self.closer.lock().take();
        if let Some(closer) = closer {
            closer();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closer.lock().is_none()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("closed", &self.is_closed())
            .finish()
    }
}
