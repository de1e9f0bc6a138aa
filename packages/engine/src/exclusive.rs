//! # Exclusive Executor
//!
//! Serializes operations whose editing contexts or models overlap while
//! letting disjoint operations run concurrently.
//!
//! ## Design
//!
//! - Every operation declares a [`Scope`] (contexts + model IDs)
//! - A scope is admitted when none of its keys is held and no earlier
//!   waiter claims any of them, so conflicting operations run in
//!   submission order
//! - Waiters park on a oneshot channel; releasing a guard admits every
//!   queued waiter that became free
//!
//! There is no global lock: unrelated scopes never wait on each other.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::trace;

use crate::types::{EditingContext, ModelId};

/// One serializable resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKey {
    Context(EditingContext),
    Model(ModelId),
}

/// Resources touched by one operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scope {
    pub contexts: BTreeSet<EditingContext>,
    pub models: BTreeSet<ModelId>,
}

impl Scope {
    pub fn new(
        contexts: impl IntoIterator<Item = EditingContext>,
        models: impl IntoIterator<Item = ModelId>,
    ) -> Self {
        Self {
            contexts: contexts.into_iter().collect(),
            models: models.into_iter().collect(),
        }
    }

    pub fn keys(&self) -> BTreeSet<ResourceKey> {
        self.contexts
            .iter()
            .cloned()
            .map(ResourceKey::Context)
            .chain(self.models.iter().cloned().map(ResourceKey::Model))
            .collect()
    }

    pub fn union(&self, other: &Scope) -> Scope {
        Scope {
            contexts: self.contexts.union(&other.contexts).cloned().collect(),
            models: self.models.union(&other.models).cloned().collect(),
        }
    }
}

struct Waiter {
    keys: BTreeSet<ResourceKey>,
    grant: oneshot::Sender<()>,
}

#[derive(Default)]
struct ExecutorState {
    held: HashSet<ResourceKey>,
    waiters: VecDeque<Waiter>,
}

impl ExecutorState {
    fn is_free(&self, keys: &BTreeSet<ResourceKey>) -> bool {
        keys.iter().all(|key| !self.held.contains(key))
            && self
                .waiters
                .iter()
                .filter(|waiter| !waiter.grant.is_closed())
                .all(|waiter| waiter.keys.is_disjoint(keys))
    }

    fn release(&mut self, keys: &BTreeSet<ResourceKey>) {
        for key in keys {
            self.held.remove(key);
        }
        self.admit();
    }

    fn admit(&mut self) {
        // Admit waiters in order; a still-blocked waiter blocks later
        // waiters that share its keys.
        let mut blocked: HashSet<ResourceKey> = HashSet::new();
        let mut remaining = VecDeque::with_capacity(self.waiters.len());
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.grant.is_closed() {
                continue;
            }
            let free = waiter
                .keys
                .iter()
                .all(|key| !self.held.contains(key) && !blocked.contains(key));
            if free {
                self.held.extend(waiter.keys.iter().cloned());
                if waiter.grant.send(()).is_err() {
                    for key in &waiter.keys {
                        self.held.remove(key);
                    }
                }
            } else {
                blocked.extend(waiter.keys.iter().cloned());
                remaining.push_back(waiter);
            }
        }
        self.waiters = remaining;
    }
}

/// Async-aware admission queue keyed by contexts and models
#[derive(Clone, Default)]
pub struct ExclusiveExecutor {
    state: Arc<Mutex<ExecutorState>>,
}

impl ExclusiveExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `scope` may run exclusively
    pub async fn acquire(&self, scope: &Scope) -> ExclusiveGuard {
        let keys = scope.keys();

        loop {
            let receiver = {
                let mut state = self.state.lock();
                if state.is_free(&keys) {
                    state.held.extend(keys.iter().cloned());
                    trace!(keys = keys.len(), "Scope admitted immediately");
                    return self.guard(keys);
                }
                let (grant, receiver) = oneshot::channel();
                state.waiters.push_back(Waiter {
                    keys: keys.clone(),
                    grant,
                });
                receiver
            };

            trace!(keys = keys.len(), "Scope queued behind conflicting operation");
            let mut pending = PendingGrant {
                receiver,
                state: self.state.clone(),
                keys: Some(keys.clone()),
            };
            if (&mut pending.receiver).await.is_ok() {
                pending.keys = None;
                return self.guard(keys);
            }
        }
    }

    /// Run `operation` while holding `scope`
    pub async fn run<F, T>(&self, scope: &Scope, operation: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        let _guard = self.acquire(scope).await;
        operation.await
    }

    fn guard(&self, keys: BTreeSet<ResourceKey>) -> ExclusiveGuard {
        ExclusiveGuard {
            state: self.state.clone(),
            keys,
        }
    }

    #[cfg(test)]
    fn held_len(&self) -> usize {
        self.state.lock().held.len()
    }
}

/// Cancellation-safe wait: if the future is dropped after the grant was
/// sent, the granted keys are released again; otherwise the waiter leaves
/// the queue.
struct PendingGrant {
    receiver: oneshot::Receiver<()>,
    state: Arc<Mutex<ExecutorState>>,
    keys: Option<BTreeSet<ResourceKey>>,
}

impl Drop for PendingGrant {
    fn drop(&mut self) {
        if let Some(keys) = self.keys.take() {
            self.receiver.close();
            let mut state = self.state.lock();
            if self.receiver.try_recv().is_ok() {
                state.release(&keys);
            } else {
                // Drop the abandoned waiter so it stops blocking later scopes
                state.admit();
            }
        }
    }
}

/// Held resources; released on drop
pub struct ExclusiveGuard {
    state: Arc<Mutex<ExecutorState>>,
    keys: BTreeSet<ResourceKey>,
}

impl ExclusiveGuard {
    /// Whether every key of `scope` is held by this guard
    pub fn covers(&self, scope: &Scope) -> bool {
        scope.keys().is_subset(&self.keys)
    }
}

impl Drop for ExclusiveGuard {
    fn drop(&mut self) {
        self.state.lock().release(&self.keys);
    }
}
