//! Task store: the two queues (`user`, `internal`) backed by task files.
//!
//! Each queue is an ordered list of tasks derived from its file. The store
//! re-parses on start, on an explicit refresh, and on a filesystem-watch
//! trigger, publishing `tasks:*:changed` only when the parsed list differs
//! from the in-memory snapshot. If a file becomes unreadable the last good
//! snapshot is kept; that is a warning, never a crash.

use crate::{
    config::Config,
    events::{EventBus, Topic},
    models::{Queue, Task, TaskStatus},
    persistence, CosError, Result,
};
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

pub mod parser;
pub mod watcher;

/// Insertion position for `add`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    Top,
    Bottom,
}

#[derive(Clone)]
pub struct TaskStore {
    files: Arc<HashMap<Queue, PathBuf>>,
    queues: Arc<RwLock<HashMap<Queue, Vec<Task>>>>,
    bus: EventBus,
}

impl TaskStore {
    pub fn new(config: &Config, bus: EventBus) -> Self {
        let mut files = HashMap::new();
        files.insert(Queue::User, config.user_tasks_path.clone());
        files.insert(Queue::Internal, config.internal_tasks_path.clone());

        let mut queues = HashMap::new();
        queues.insert(Queue::User, Vec::new());
        queues.insert(Queue::Internal, Vec::new());

        Self {
            files: Arc::new(files),
            queues: Arc::new(RwLock::new(queues)),
            bus,
        }
    }

    pub fn file_path(&self, queue: Queue) -> &PathBuf {
        // Both queues are inserted in new(); the map is never mutated.
        &self.files[&queue]
    }

    /// Re-read one queue file. A missing file is an empty queue; an
    /// unreadable or unparseable file keeps the last good snapshot.
    pub async fn refresh(&self, queue: Queue) {
        let path = self.file_path(queue);
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                warn!(queue = %queue, path = %path.display(), error = %e,
                      "task file unreadable, keeping last snapshot");
                return;
            }
        };

        let tasks = match parser::parse(&content) {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(queue = %queue, path = %path.display(), error = %e,
                      "task file unparseable, keeping last snapshot");
                return;
            }
        };

        let changed = {
            let mut queues = self.queues.write().await;
            let slot = queues.entry(queue).or_default();
            if *slot == tasks {
                false
            } else {
                *slot = tasks;
                true
            }
        };

        if changed {
            debug!(queue = %queue, "task queue reloaded from file");
            self.publish_changed(queue).await;
        }
    }

    pub async fn refresh_all(&self) {
        self.refresh(Queue::User).await;
        self.refresh(Queue::Internal).await;
    }

    /// Snapshot of one queue in file order.
    pub async fn list(&self, queue: Queue) -> Vec<Task> {
        let queues = self.queues.read().await;
        queues.get(&queue).cloned().unwrap_or_default()
    }

    pub async fn get(&self, queue: Queue, id: &str) -> Option<Task> {
        let queues = self.queues.read().await;
        queues
            .get(&queue)
            .and_then(|tasks| tasks.iter().find(|t| t.id == id))
            .cloned()
    }

    pub async fn add(&self, queue: Queue, mut task: Task, position: Position) -> Result<Task> {
        if task.description.trim().is_empty() {
            return Err(CosError::Validation(
                "task description must not be empty".to_string(),
            ));
        }
        if task.id.trim().is_empty() {
            task.id = uuid::Uuid::new_v4().to_string();
        }

        self.mutate(queue, |tasks| {
            if tasks.iter().any(|t| t.id == task.id) {
                return Err(CosError::Conflict(format!(
                    "task {} already exists in {} queue",
                    task.id, queue
                )));
            }
            match position {
                Position::Top => tasks.insert(0, task.clone()),
                Position::Bottom => tasks.push(task.clone()),
            }
            Ok(task.clone())
        })
        .await
    }

    /// Merge a JSON patch into the addressed task. Identity fields (`id`)
    /// cannot be patched.
    pub async fn update(&self, queue: Queue, id: &str, patch: serde_json::Value) -> Result<Task> {
        let serde_json::Value::Object(patch) = patch else {
            return Err(CosError::Validation(
                "task patch must be a JSON object".to_string(),
            ));
        };
        if patch.contains_key("id") {
            return Err(CosError::Validation("task id is immutable".to_string()));
        }

        let id = id.to_string();
        self.mutate(queue, move |tasks| {
            let slot = tasks
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or_else(|| CosError::NotFound(format!("task {id} in {queue} queue")))?;

            let mut merged = serde_json::to_value(&*slot)?;
            let obj = merged
                .as_object_mut()
                .ok_or_else(|| CosError::Validation("task must serialize to an object".into()))?;
            for (key, value) in patch.clone() {
                obj.insert(key, value);
            }
            *slot = serde_json::from_value(merged)?;
            Ok(slot.clone())
        })
        .await
    }

    pub async fn delete(&self, queue: Queue, id: &str) -> Result<()> {
        let id = id.to_string();
        self.mutate(queue, move |tasks| {
            let before = tasks.len();
            tasks.retain(|t| t.id != id);
            if tasks.len() == before {
                return Err(CosError::NotFound(format!("task {id} in {queue} queue")));
            }
            Ok(())
        })
        .await
    }

    /// Apply a new ordering. `ids` should be a permutation of the current id
    /// set: ids not currently present are ignored, and current tasks missing
    /// from `ids` retain their relative order at the end. Duplicates in the
    /// argument are a validation error.
    pub async fn reorder(&self, queue: Queue, ids: Vec<String>) -> Result<Vec<Task>> {
        let mut seen = std::collections::HashSet::new();
        for id in &ids {
            if !seen.insert(id.as_str()) {
                return Err(CosError::Validation(format!("duplicate id in reorder: {id}")));
            }
        }

        self.mutate(queue, move |tasks| {
            let mut remaining: Vec<Task> = std::mem::take(tasks);
            let mut ordered = Vec::with_capacity(remaining.len());

            for id in &ids {
                if let Some(idx) = remaining.iter().position(|t| &t.id == id) {
                    ordered.push(remaining.remove(idx));
                }
            }
            ordered.extend(remaining);
            *tasks = ordered;
            Ok(tasks.clone())
        })
        .await
    }

    /// Approve a task that requires approval. Approving a task that needs no
    /// approval, or one already approved, is a conflict.
    pub async fn approve(&self, queue: Queue, id: &str) -> Result<Task> {
        let id = id.to_string();
        self.mutate(queue, move |tasks| {
            let task = tasks
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or_else(|| CosError::NotFound(format!("task {id} in {queue} queue")))?;

            if !task.approval_required {
                return Err(CosError::Conflict(format!(
                    "task {id} does not require approval"
                )));
            }
            if task.approved {
                return Err(CosError::Conflict(format!("task {id} is already approved")));
            }
            task.approved = true;
            Ok(task.clone())
        })
        .await
    }

    /// Supervisor-side claim: mark in_progress and write the agent
    /// back-reference.
    pub async fn claim(&self, queue: Queue, id: &str, agent_id: &str) -> Result<Task> {
        let id = id.to_string();
        let agent_id = agent_id.to_string();
        self.mutate(queue, move |tasks| {
            let task = tasks
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or_else(|| CosError::NotFound(format!("task {id} in {queue} queue")))?;
            if task.status != TaskStatus::Pending {
                return Err(CosError::Conflict(format!(
                    "task {id} is not pending (status {:?})",
                    task.status
                )));
            }
            task.status = TaskStatus::InProgress;
            task.current_agent_id = Some(agent_id.clone());
            Ok(task.clone())
        })
        .await
    }

    /// Supervisor-side release on completion. Success marks the task
    /// completed; failure returns it to pending for a retry. A task edited
    /// out of the file mid-run is simply gone by now, which is fine: the
    /// agent already finished.
    pub async fn release(&self, queue: Queue, id: &str, success: bool) -> Result<()> {
        let id = id.to_string();
        let outcome = self
            .mutate(queue, move |tasks| {
                let Some(task) = tasks.iter_mut().find(|t| t.id == id) else {
                    return Ok(false);
                };
                task.status = if success {
                    TaskStatus::Completed
                } else {
                    TaskStatus::Pending
                };
                task.current_agent_id = None;
                Ok(true)
            })
            .await?;

        if !outcome {
            debug!(queue = %queue, "released task no longer present in file");
        }
        Ok(())
    }

    async fn publish_changed(&self, queue: Queue) {
        let count = self.list(queue).await.len();
        self.bus.publish(
            Topic::tasks_changed(queue),
            json!({"queue": queue, "count": count}),
        );
    }

    /// Serialize one mutation: apply it under the write lock, persist the
    /// queue file, then publish the change event.
    async fn mutate<T, F>(&self, queue: Queue, op: F) -> Result<T>
    where
        F: FnOnce(&mut Vec<Task>) -> Result<T>,
    {
        let (result, snapshot) = {
            let mut queues = self.queues.write().await;
            let tasks = queues.entry(queue).or_default();
            let result = op(tasks)?;
            (result, tasks.clone())
        };

        // write_json pretty-prints the same shape parser::parse reads back.
        let path = self.file_path(queue);
        persistence::write_json(path, &snapshot).await?;
        debug!(queue = %queue, count = snapshot.len(), "task file rewritten");

        self.publish_changed(queue).await;
        Ok(result)
    }
}
