//! Table of in-flight transfer tasks.
//!
//! The registry is how two requests for the same transfer end up sharing
//! one task. Tasks remove themselves when they reach a terminal state;
//! they only hold a weak reference back, so dropping the owning engine
//! frees the table.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tracing::debug;

use super::task::TransferTask;
use crate::request::TaskId;

type TaskMap = DashMap<TaskId, TransferTask>;

/// Concurrent map from task identifier to the active task.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: Arc<TaskMap>,
}

impl TaskRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the active task for `id`, creating it with `create` if there is none.
    ///
    /// Lookup and insert happen under the same shard lock, so two callers
    /// racing on one id always get the same task. The boolean is true when
    /// the task was created by this call.
    pub fn get_or_insert_with(
        &self,
        id: TaskId,
        create: impl FnOnce(RegistryHandle) -> TransferTask,
    ) -> (TransferTask, bool) {
        let handle = self.handle();
        let mut created = false;
        let task = self
            .tasks
            .entry(id)
            .or_insert_with(|| {
                created = true;
                create(handle)
            })
            .clone();
        if !created {
            debug!(task_id = %task.id(), "attached to existing task");
        }
        (task, created)
    }

    /// The active task for `id`, if any.
    #[must_use]
    pub fn get(&self, id: &TaskId) -> Option<TransferTask> {
        self.tasks.get(id).map(|entry| entry.value().clone())
    }

    /// Number of active tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no task is active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Identifiers of all active tasks.
    #[must_use]
    pub fn ids(&self) -> Vec<TaskId> {
        self.tasks.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Cancels every registered task.
    pub fn cancel_all(&self) {
        // Collect first: canceling may remove entries from the map.
        let tasks: Vec<TransferTask> = self
            .tasks
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for task in tasks {
            task.cancel();
        }
    }

    pub(crate) fn handle(&self) -> RegistryHandle {
        RegistryHandle(Arc::downgrade(&self.tasks))
    }
}

/// Weak back-reference a task uses to deregister itself.
#[derive(Clone, Default)]
pub(crate) struct RegistryHandle(Weak<TaskMap>);

impl RegistryHandle {
    /// Removes `task` if it is still the entry registered under its id.
    pub(crate) fn remove(&self, task: &TransferTask) {
        if let Some(tasks) = self.0.upgrade() {
            let removed = tasks
                .remove_if(task.id(), |_, registered| registered.same_task(task))
                .is_some();
            if removed {
                debug!(task_id = %task.id(), "task deregistered");
            }
        }
    }
}
