//! Upstream operations: the one entry point the HTTP layer (or any other
//! caller) needs.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::budget::{parse_budget, BudgetError, BudgetGovernor};
use crate::config::Config;
use crate::evidence::artifacts::archive_name;
use crate::evidence::{ArtifactEntry, EvidenceError, EvidenceStore};
use crate::pipeline::Pipeline;
use crate::registry::TaskRegistry;
use crate::report::ReportError;
use crate::scheduler::{Admission, Job, Scheduler};
use crate::task::{
    ApprovalAction, ApprovalRecord, Stage, StatusUpdate, Task, TaskError, TaskId, TaskState,
};
use crate::tools::{
    DispatchError, ProcessRunner, SystemRunner, ToolContext, ToolInfo, ToolPaths, ToolRegistry,
    ToolResponse,
};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("Invalid budget: {0}")]
    Budget(#[from] BudgetError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Report(#[from] ReportError),

    #[error(transparent)]
    Evidence(#[from] EvidenceError),

    #[error("{0}")]
    InvalidInput(String),

    #[error("Archive for task {0} is not ready")]
    ArchiveNotReady(TaskId),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Answer to a run request.
#[derive(Debug, Clone, Serialize)]
pub struct RunReceipt {
    pub task: Task,
    /// Whether this request started or queued a pipeline
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
    pub message: String,
}

/// Answer to a status poll.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    #[serde(flatten)]
    pub task: Task,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
}

pub struct Orchestrator {
    registry: Arc<TaskRegistry>,
    scheduler: Scheduler,
    pipeline: Arc<Pipeline>,
    tools: ToolRegistry,
    governor: BudgetGovernor,
    runner: Arc<dyn ProcessRunner>,
    paths: Arc<ToolPaths>,
}

impl Orchestrator {
    /// Rebuild state from `config.runs_dir` and run tools as real processes.
    pub async fn start(config: &Config) -> OrchestratorResult<Self> {
        Self::with_runner(config, Arc::new(SystemRunner)).await
    }

    pub async fn with_runner(config: &Config, runner: Arc<dyn ProcessRunner>) -> OrchestratorResult<Self> {
        let store = EvidenceStore::new(&config.runs_dir);
        let registry = Arc::new(TaskRegistry::load(store.clone()).await?);
        let governor = BudgetGovernor::new(store, config.default_timeout);
        let paths = Arc::new(ToolPaths {
            tools_dir: config.tools_dir.clone(),
            wordlists_dir: config.wordlists_dir.clone(),
        });

        let pipeline = Arc::new(
            Pipeline::new(registry.clone(), governor.clone(), runner.clone(), paths.clone())
                .with_asset_ports(config.asset_ports.clone()),
        );
        let scheduler = Scheduler::new(config.max_concurrent_tasks, pipeline.clone());
        tracing::info!(
            limit = scheduler.limit(),
            runs_dir = %config.runs_dir.display(),
            "Orchestrator ready"
        );

        Ok(Self {
            registry,
            scheduler,
            pipeline,
            tools: ToolRegistry::with_defaults(),
            governor,
            runner,
            paths,
        })
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Pipelines currently holding a scheduler slot.
    pub fn running(&self) -> usize {
        self.scheduler.running()
    }

    /// Create a task. `budget` may be absent, a JSON object or a string
    /// holding a JSON object.
    pub async fn create_task(
        &self,
        target: &str,
        base_url: Option<&str>,
        budget: Option<&Value>,
    ) -> OrchestratorResult<Task> {
        let target = target.trim();
        if target.is_empty() {
            return Err(OrchestratorError::InvalidInput("target is required".to_string()));
        }
        let base_url = match base_url.map(str::trim).filter(|u| !u.is_empty()) {
            Some(raw) => {
                let url = Url::parse(raw)
                    .map_err(|e| OrchestratorError::InvalidInput(format!("Invalid base_url {:?}: {}", raw, e)))?;
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(OrchestratorError::InvalidInput(format!(
                        "base_url must be http or https, got {}",
                        url.scheme()
                    )));
                }
                Some(raw.to_string())
            }
            None => None,
        };
        let budget = parse_budget(budget)?;
        Ok(self.registry.create(target.to_string(), base_url, budget).await?)
    }

    /// Trigger the pipeline. Repeated calls never start a second execution.
    pub async fn run_task(&self, task_id: &TaskId) -> OrchestratorResult<RunReceipt> {
        let task = self.registry.get(task_id).await?;
        let receipt = |task: Task, accepted, queue_position, message: &str| RunReceipt {
            task,
            accepted,
            queue_position,
            message: message.to_string(),
        };

        if self.scheduler.is_active(task_id) {
            let position = self.scheduler.position(task_id);
            return Ok(receipt(task, false, position, "Task is already scheduled"));
        }
        match task.state {
            TaskState::Created => {}
            TaskState::Failed if task.retryable => {
                tracing::info!(task_id = %task_id, "Retrying failed task");
            }
            TaskState::Failed => return Err(TaskError::NotRetryable(task_id.clone()).into()),
            _ => {
                let message = format!("Task is already {}", task.state);
                return Ok(receipt(task, false, None, &message));
            }
        }

        let task = self
            .registry
            .update(task_id, StatusUpdate::new().hint("Queued for execution"))
            .await?;
        Ok(match self.scheduler.submit(task_id.clone(), Job::Discover) {
            Admission::Started => receipt(task, true, None, "Pipeline started"),
            Admission::Queued { position } => receipt(task, true, Some(position), "Waiting for a free slot"),
            Admission::AlreadyActive => receipt(task, false, None, "Task is already scheduled"),
        })
    }

    /// Current status. Polling changes nothing but the poll counter.
    pub async fn status(&self, task_id: &TaskId) -> OrchestratorResult<TaskStatus> {
        let task = self.registry.observe(task_id).await?;
        Ok(TaskStatus {
            queue_position: self.scheduler.position(task_id),
            task,
        })
    }

    /// Record a decision for a task waiting at the approval gate.
    pub async fn approve(
        &self,
        task_id: &TaskId,
        action: &str,
        approver: &str,
        remark: Option<String>,
    ) -> OrchestratorResult<Task> {
        let action: ApprovalAction = action.parse()?;
        let approver = approver.trim();
        if approver.is_empty() {
            return Err(OrchestratorError::InvalidInput("approver is required".to_string()));
        }

        let record = ApprovalRecord::new(task_id.clone(), action, approver, remark);
        match action {
            ApprovalAction::Approve => {
                let task = self
                    .registry
                    .decide(
                        &record,
                        StatusUpdate::new()
                            .state(TaskState::Running)
                            .stage(Stage::Verify)
                            .percent(90)
                            .hint(format!("Approved by {}, verifying", approver)),
                    )
                    .await?;
                self.scheduler.chain(task_id.clone(), Job::Verify);
                Ok(task)
            }
            ApprovalAction::Reject => {
                self.registry
                    .decide(&record, StatusUpdate::new().hint("Rejected, composing report"))
                    .await?;
                self.pipeline.composer().compose(task_id).await?;
                let task = self
                    .registry
                    .update(
                        task_id,
                        StatusUpdate::new()
                            .state(TaskState::Completed)
                            .stage(Stage::Report)
                            .percent(100)
                            .hint(format!("Rejected by {}, report only", approver)),
                    )
                    .await?;
                tracing::info!(task_id = %task_id, "Task completed without verification");
                Ok(task)
            }
        }
    }

    /// Stop a task. Idle and queued tasks stop at once; a running pipeline
    /// stops at its next stage boundary, or when its job ends.
    pub async fn stop(&self, task_id: &TaskId) -> OrchestratorResult<Task> {
        let task = self.registry.get(task_id).await?;
        let stopped = StatusUpdate::new()
            .state(TaskState::Stopped)
            .hint("Stopped by operator");

        let cancelled = self.scheduler.cancel(task_id);
        let in_flight = matches!(task.state, TaskState::Created | TaskState::Running)
            && !cancelled
            && self.scheduler.is_active(task_id);
        if in_flight {
            self.registry.request_stop(task_id);
            tracing::info!(task_id = %task_id, "Stop requested");
            let task = self
                .registry
                .update(task_id, StatusUpdate::new().hint("Stop requested"))
                .await?;
            return Ok(task);
        }

        if task.state == TaskState::Stopped {
            return Ok(task);
        }
        let task = self.registry.update(task_id, stopped).await?;
        self.registry
            .store()
            .append_log(task_id, task.stage.log_name(), "Stopped by operator")
            .await?;
        Ok(task)
    }

    pub async fn list_tasks(&self) -> Vec<Task> {
        self.registry.list().await
    }

    pub async fn list_artifacts(&self, task_id: &TaskId) -> OrchestratorResult<Vec<ArtifactEntry>> {
        self.registry.get(task_id).await?;
        Ok(self.registry.store().list_files(task_id).await?)
    }

    /// Path of the composed archive.
    pub async fn archive(&self, task_id: &TaskId) -> OrchestratorResult<PathBuf> {
        self.registry.get(task_id).await?;
        let path = self.registry.store().path(task_id, &archive_name(task_id));
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            Ok(path)
        } else {
            Err(OrchestratorError::ArchiveNotReady(task_id.clone()))
        }
    }

    /// Run one tool ad hoc against an existing task's evidence directory.
    pub async fn invoke_tool(&self, task_id: &TaskId, tool_id: &str, args: &Value) -> OrchestratorResult<ToolResponse> {
        self.registry.get(task_id).await?;
        let ctx = ToolContext::new(
            task_id.clone(),
            self.registry.store().clone(),
            self.governor.clone(),
            self.runner.clone(),
            self.paths.clone(),
        );
        Ok(self.tools.execute(&ctx, tool_id, args).await?)
    }

    pub fn list_tools(&self) -> Vec<ToolInfo> {
        self.tools.list()
    }
}
