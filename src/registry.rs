//! Task registry - the task state machine over the evidence store.
//!
//! The in-memory map is a cache for fast polling. Every mutation goes to
//! `status.json` first and the cache can be rebuilt from disk at any time.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tokio::sync::RwLock;

use crate::budget::Budget;
use crate::evidence::artifacts::{APPROVAL, APPROVAL_LOG, SCOPE};
use crate::evidence::{EvidenceStore, ScopeRecord};
use crate::task::{
    ApprovalAction, ApprovalRecord, Blocked, Stage, StatusUpdate, Task, TaskError, TaskId, TaskState,
};

pub type TaskResult<T> = Result<T, TaskError>;

/// Owns task lifecycle. Shared between the pipeline, the scheduler and the
/// API through an `Arc`.
#[derive(Debug)]
pub struct TaskRegistry {
    store: EvidenceStore,
    tasks: RwLock<HashMap<TaskId, Task>>,
    /// Serializes read-modify-write cycles on status documents
    write_lock: tokio::sync::Mutex<()>,
    stop_requests: Mutex<HashSet<TaskId>>,
}

impl TaskRegistry {
    pub fn new(store: EvidenceStore) -> Self {
        Self {
            store,
            tasks: RwLock::new(HashMap::new()),
            write_lock: tokio::sync::Mutex::new(()),
            stop_requests: Mutex::new(HashSet::new()),
        }
    }

    /// Rebuild the registry from every status document under the store root.
    ///
    /// A task found `running` lost its pipeline with the previous process;
    /// it is marked failed and retryable.
    pub async fn load(store: EvidenceStore) -> TaskResult<Self> {
        let registry = Self::new(store);
        let ids = registry.store.list_tasks().await?;

        let mut interrupted = Vec::new();
        {
            let mut tasks = registry.tasks.write().await;
            for id in ids {
                match registry.store.read_status(&id).await {
                    Ok(Some(task)) => {
                        if task.state == TaskState::Running {
                            interrupted.push(id.clone());
                        }
                        tasks.insert(id, task);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(task_id = %id, error = %e, "Skipping unreadable task");
                    }
                }
            }
            tracing::info!("Loaded {} tasks from {}", tasks.len(), registry.store.root().display());
        }

        for id in interrupted {
            let update = StatusUpdate::new()
                .state(TaskState::Failed)
                .hint("Interrupted by restart")
                .error(Some("Pipeline was interrupted by a process restart".to_string()))
                .retryable(true);
            if let Err(e) = registry.update(&id, update).await {
                tracing::warn!(task_id = %id, error = %e, "Failed to mark interrupted task");
            }
        }

        Ok(registry)
    }

    pub fn store(&self) -> &EvidenceStore {
        &self.store
    }

    /// Create a task with a fresh identifier, its evidence directory, the
    /// scope snapshot and the initial status document.
    pub async fn create(&self, target: String, base_url: Option<String>, budget: Budget) -> TaskResult<Task> {
        let _guard = self.write_lock.lock().await;

        let task_id = loop {
            let candidate = TaskId::generate();
            let cached = self.tasks.read().await.contains_key(&candidate);
            if !cached && !self.store.exists(&candidate).await {
                break candidate;
            }
        };

        let task = Task::new(task_id.clone(), target, base_url, budget);
        self.store.ensure(&task_id).await?;
        let scope = ScopeRecord {
            task_id: task_id.clone(),
            target: task.target.clone(),
            base_url: task.base_url.clone(),
            budget: task.budget.clone(),
            created_at: task.created_at,
        };
        self.store.write_artifact(&task_id, SCOPE, &scope).await?;
        self.store.init_status(&task).await?;
        self.store
            .append_log(
                &task_id,
                Stage::Create.log_name(),
                &format!("Task created for target {}", task.target),
            )
            .await?;

        self.tasks.write().await.insert(task_id.clone(), task.clone());
        tracing::info!(task_id = %task_id, target = %task.target, "Task created");
        Ok(task)
    }

    /// Current task document. Falls back to disk when the cache misses.
    pub async fn get(&self, task_id: &TaskId) -> TaskResult<Task> {
        if let Some(task) = self.tasks.read().await.get(task_id) {
            return Ok(task.clone());
        }
        match self.store.read_status(task_id).await? {
            Some(task) => {
                self.tasks
                    .write()
                    .await
                    .entry(task_id.clone())
                    .or_insert_with(|| task.clone());
                Ok(task)
            }
            None => Err(TaskError::NotFound(task_id.clone())),
        }
    }

    /// Status poll: the cached document with its poll counter bumped. Never
    /// touches the evidence directory.
    pub async fn observe(&self, task_id: &TaskId) -> TaskResult<Task> {
        self.get(task_id).await?;
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| TaskError::NotFound(task_id.clone()))?;
        task.poll_count += 1;
        Ok(task.clone())
    }

    /// Every known task, newest first.
    pub async fn list(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.read().await.values().cloned().collect();
        tasks.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.task_id.cmp(&a.task_id))
        });
        tasks
    }

    /// The only mutation path: validate `update` against the stored
    /// document, persist the merge, then refresh the cache.
    pub async fn update(&self, task_id: &TaskId, update: StatusUpdate) -> TaskResult<Task> {
        let _guard = self.write_lock.lock().await;

        let current = self
            .store
            .read_status(task_id)
            .await?
            .ok_or_else(|| TaskError::NotFound(task_id.clone()))?;
        let normalized = current.check_update(&update)?;
        let mut task = self.store.write_status(task_id, &normalized).await?;

        let mut tasks = self.tasks.write().await;
        if let Some(cached) = tasks.get(task_id) {
            task.poll_count = cached.poll_count;
        }
        tasks.insert(task_id.clone(), task.clone());

        if current.state != task.state {
            tracing::info!(task_id = %task_id, from = %current.state, to = %task.state, stage = %task.stage, "Task state changed");
        }
        Ok(task)
    }

    /// Mark a task failed. When the status document itself cannot be
    /// written the failure is still reflected in the cache so polling
    /// reports it.
    pub async fn fail(&self, task_id: &TaskId, error: String, retryable: bool) {
        tracing::error!(task_id = %task_id, retryable, "Pipeline failed: {}", error);
        let update = StatusUpdate::new()
            .state(TaskState::Failed)
            .hint(format!("Failed: {}", error))
            .error(Some(error))
            .retryable(retryable);

        match self.update(task_id, update.clone()).await {
            Ok(_) => {}
            Err(TaskError::Evidence(e)) => {
                tracing::warn!(task_id = %task_id, error = %e, "Could not persist failure, updating cache only");
                if let Some(task) = self.tasks.write().await.get_mut(task_id) {
                    task.apply(&update);
                    task.blocked = Blocked::none();
                }
            }
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "Failure not recorded");
            }
        }
    }

    /// Take the approval-gate decision in `record`. The check that the task
    /// is waiting for a decision, the status change in `update` and the
    /// audit record happen under one write lock, so of two racing decisions
    /// exactly one wins. A reject whose report could not be composed may be
    /// repeated; any other second decision fails.
    pub async fn decide(&self, record: &ApprovalRecord, update: StatusUpdate) -> TaskResult<Task> {
        let task_id = &record.task_id;
        let _guard = self.write_lock.lock().await;

        let current = self
            .store
            .read_status(task_id)
            .await?
            .ok_or_else(|| TaskError::NotFound(task_id.clone()))?;
        if current.state != TaskState::Blocked {
            let to = match record.action {
                ApprovalAction::Approve => TaskState::Running,
                ApprovalAction::Reject => TaskState::Completed,
            };
            return Err(TaskError::InvalidTransition {
                from: current.state,
                to,
            });
        }
        match current.approved {
            None => {}
            Some(ApprovalAction::Reject) if record.action == ApprovalAction::Reject => {}
            Some(action) => {
                return Err(TaskError::AlreadyDecided {
                    task_id: task_id.clone(),
                    action,
                })
            }
        }

        let normalized = current.check_update(&update.approved(record.action))?;
        let mut task = self.store.write_status(task_id, &normalized).await?;
        {
            let mut tasks = self.tasks.write().await;
            if let Some(cached) = tasks.get(task_id) {
                task.poll_count = cached.poll_count;
            }
            tasks.insert(task_id.clone(), task.clone());
        }

        self.record_approval(record).await?;
        Ok(task)
    }

    /// Append an approval decision to the audit trail and keep it as the
    /// latest decision.
    pub async fn record_approval(&self, record: &ApprovalRecord) -> TaskResult<()> {
        let task_id = &record.task_id;
        self.store.append_jsonl(task_id, APPROVAL_LOG, record).await?;
        self.store.write_artifact(task_id, APPROVAL, record).await?;

        let mut line = format!("Decision '{}' by {}", record.action, record.approver);
        if let Some(remark) = &record.remark {
            line.push_str(&format!(": {}", remark));
        }
        self.store
            .append_log(task_id, Stage::HumanGate.log_name(), &line)
            .await?;
        tracing::info!(task_id = %task_id, action = %record.action, approver = %record.approver, "Approval recorded");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Stop requests
    // ─────────────────────────────────────────────────────────────────────

    pub fn request_stop(&self, task_id: &TaskId) {
        self.stop_requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task_id.clone());
    }

    /// Consume a pending stop request.
    pub fn take_stop(&self, task_id: &TaskId) -> bool {
        self.stop_requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(task_id)
    }
}
