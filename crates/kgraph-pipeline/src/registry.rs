//! Task registry
//!
//! In-flight tasks live in a map that is never evicted. When a task reaches
//! a terminal state it moves to a bounded, expiring store backed by moka, so
//! finished tasks stay queryable for a while without growing memory forever.
//! A finished task is never modified again.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use moka::sync::Cache;

use crate::task::{Stage, Task, TaskId, TaskStatus};

/// Registry configuration
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Maximum number of finished tasks kept
    pub max_capacity: u64,

    /// Time a finished task stays queryable
    pub ttl: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_capacity: 10_000,
            ttl: Duration::from_secs(3600),
        }
    }
}

/// Outcome of a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    /// Task is finished or its candidates are being merged
    Refused,
    NotFound,
}

/// Task store shared by the pipeline workers
pub struct TaskRegistry {
    active: Mutex<HashMap<TaskId, Task>>,
    finished: Cache<TaskId, Arc<Task>>,
}

impl TaskRegistry {
    pub fn new(config: &RetentionConfig) -> Self {
        let finished = Cache::builder()
            .max_capacity(config.max_capacity)
            .time_to_live(config.ttl)
            .build();

        Self {
            active: Mutex::new(HashMap::new()),
            finished,
        }
    }

    fn active(&self) -> MutexGuard<'_, HashMap<TaskId, Task>> {
        // No mutation below can panic midway through updating a task
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a new pending task
    pub fn insert(&self, task: Task) {
        self.active().insert(task.id, task);
    }

    /// Copy of a task, active or finished
    pub fn get(&self, id: TaskId) -> Option<Task> {
        if let Some(task) = self.active().get(&id) {
            return Some(task.clone());
        }
        self.finished.get(&id).map(|t| (*t).clone())
    }

    /// Current status without cloning the task
    pub fn status(&self, id: TaskId) -> Option<TaskStatus> {
        if let Some(task) = self.active().get(&id) {
            return Some(task.status);
        }
        self.finished.get(&id).map(|t| t.status)
    }

    /// Move a pending task to running. Returns false if it is no longer
    /// pending.
    pub fn start(&self, id: TaskId) -> bool {
        let mut active = self.active();
        match active.get_mut(&id) {
            Some(task) if task.status == TaskStatus::Pending => {
                task.status = TaskStatus::Running;
                task.started_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    /// Record a stage for a running task. Returns false if the task is no
    /// longer active.
    pub fn record_stage(&self, id: TaskId, stage: Stage, result: serde_json::Value) -> bool {
        let mut active = self.active();
        match active.get_mut(&id) {
            Some(task) if task.status == TaskStatus::Running => {
                task.record(stage, result);
                true
            }
            _ => false,
        }
    }

    /// Enter the merging stage. Returns false if the task was cancelled (or
    /// otherwise finished) before its candidates reached the merge worker.
    pub fn begin_merge(&self, id: TaskId) -> bool {
        self.record_stage(id, Stage::Merging, serde_json::Value::Null)
    }

    /// Move a task to a terminal state, recording `stage` with `result`
    pub fn finish(
        &self,
        id: TaskId,
        status: TaskStatus,
        stage: Stage,
        result: serde_json::Value,
        error: Option<String>,
    ) -> bool {
        // Held until the task is in `finished`, so readers always see it in
        // one of the two maps
        let mut active = self.active();
        let Some(mut task) = active.remove(&id) else {
            return false;
        };
        task.record(stage, result);
        task.finish(status, error);
        self.finished.insert(id, Arc::new(task));
        true
    }

    /// Cancel a task that has not reached the merging stage
    pub fn cancel(&self, id: TaskId) -> CancelOutcome {
        let mut active = self.active();
        let Some(task) = active.get(&id) else {
            drop(active);
            return if self.finished.contains_key(&id) {
                CancelOutcome::Refused
            } else {
                CancelOutcome::NotFound
            };
        };
        if task.stage == Some(Stage::Merging) {
            return CancelOutcome::Refused;
        }

        if let Some(mut task) = active.remove(&id) {
            task.stage = Some(Stage::Cancelled);
            task.finish(TaskStatus::Cancelled, None);
            self.finished.insert(id, Arc::new(task));
        }
        CancelOutcome::Cancelled
    }

    /// Number of known tasks per status
    pub fn counts(&self) -> BTreeMap<TaskStatus, usize> {
        let mut counts = BTreeMap::new();
        let active = self.active();
        for task in active.values() {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        for (_, task) in self.finished.iter() {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        counts
    }

    /// Ids of tasks that have not finished
    pub fn active_ids(&self) -> Vec<TaskId> {
        self.active().keys().copied().collect()
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new(&RetentionConfig::default())
    }
}
