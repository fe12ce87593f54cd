//! Pipeline module - drives a task through its stages.
//!
//! # Flow
//! ```text
//! Discover: Stage1_Asset -> Stage2_Fingerprint -> Stage3_Surface -> Stage4_Candidate -> human_gate
//! Verify:   Stage5_Verify -> Stage6_Report
//! ```
//! Every stage writes its artifact before the status moves on. A stop
//! request is honoured at the next stage boundary, or once the job ends
//! when it arrived after the last one.

pub mod candidate;
pub mod stages;
pub mod surface;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::budget::BudgetGovernor;
use crate::evidence::artifacts::CANDIDATES;
use crate::evidence::{CandidatesArtifact, EvidenceError};
use crate::registry::TaskRegistry;
use crate::report::{ReportComposer, ReportError};
use crate::scheduler::{Job, JobRunner};
use crate::task::{Blocked, Stage, StatusUpdate, Task, TaskError, TaskId, TaskState};
use crate::tools::{ProcessRunner, ToolContext, ToolPaths, DEFAULT_PORTS};

pub use candidate::CandidateFilter;
pub use surface::fallback_endpoints;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Evidence(#[from] EvidenceError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Report(#[from] ReportError),

    #[error("Stopped by operator")]
    Stopped,
}

impl PipelineError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Evidence(e) => e.is_transient(),
            Self::Task(TaskError::Evidence(e)) => e.is_transient(),
            Self::Report(e) => e.is_transient(),
            _ => false,
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Status hint that keeps naming every stage whose tools timed out.
fn hint(message: impl Into<String>, timed_out: &[Stage]) -> String {
    let message = message.into();
    if timed_out.is_empty() {
        return message;
    }
    let stages: Vec<&str> = timed_out.iter().map(|s| s.as_str()).collect();
    format!("{} (timed out in {}, partial results kept)", message, stages.join(", "))
}

pub struct Pipeline {
    registry: Arc<TaskRegistry>,
    governor: BudgetGovernor,
    runner: Arc<dyn ProcessRunner>,
    paths: Arc<ToolPaths>,
    composer: ReportComposer,
    filter: CandidateFilter,
    asset_ports: String,
}

impl Pipeline {
    pub fn new(
        registry: Arc<TaskRegistry>,
        governor: BudgetGovernor,
        runner: Arc<dyn ProcessRunner>,
        paths: Arc<ToolPaths>,
    ) -> Self {
        let composer = ReportComposer::new(registry.store().clone());
        Self {
            registry,
            governor,
            runner,
            paths,
            composer,
            filter: CandidateFilter::default(),
            asset_ports: DEFAULT_PORTS.to_string(),
        }
    }

    pub fn with_asset_ports(mut self, ports: impl Into<String>) -> Self {
        self.asset_ports = ports.into();
        self
    }

    pub fn composer(&self) -> &ReportComposer {
        &self.composer
    }

    fn context(&self, task_id: &TaskId, stage: Stage) -> ToolContext {
        ToolContext::new(
            task_id.clone(),
            self.registry.store().clone(),
            self.governor.clone(),
            self.runner.clone(),
            self.paths.clone(),
        )
        .with_log(stage.log_name())
    }

    async fn update(&self, task_id: &TaskId, update: StatusUpdate) -> PipelineResult<Task> {
        Ok(self.registry.update(task_id, update).await?)
    }

    /// Enter `stage` at `percent`.
    async fn begin(&self, task_id: &TaskId, stage: Stage, percent: u8, message: &str) -> PipelineResult<()> {
        self.checkpoint(task_id).await?;
        self.update(
            task_id,
            StatusUpdate::new().stage(stage).percent(percent).hint(message),
        )
        .await?;
        self.registry
            .store()
            .append_log(task_id, stage.log_name(), &format!("{} started", stage))
            .await?;
        Ok(())
    }

    /// Honour a pending stop request.
    async fn checkpoint(&self, task_id: &TaskId) -> PipelineResult<()> {
        if !self.registry.take_stop(task_id) {
            return Ok(());
        }
        tracing::info!(task_id = %task_id, "Stopping at stage boundary");
        self.halt(task_id).await?;
        Err(PipelineError::Stopped)
    }

    async fn halt(&self, task_id: &TaskId) -> PipelineResult<()> {
        let task = self
            .update(
                task_id,
                StatusUpdate::new()
                    .state(TaskState::Stopped)
                    .hint("Stopped by operator"),
            )
            .await?;
        self.registry
            .store()
            .append_log(task_id, task.stage.log_name(), "Stopped by operator")
            .await?;
        Ok(())
    }

    /// Resolve a stop request that arrived after the last stage boundary
    /// of a job. A task parked at the gate stops; a finished task keeps
    /// its outcome and the request is dropped.
    pub async fn settle_stop(&self, task_id: &TaskId) -> PipelineResult<()> {
        if !self.registry.take_stop(task_id) {
            return Ok(());
        }
        let task = self.registry.get(task_id).await?;
        if task.state.is_terminal() {
            tracing::debug!(task_id = %task_id, state = %task.state, "Dropping stop request for finished task");
            return Ok(());
        }
        tracing::info!(task_id = %task_id, state = %task.state, "Stopping after job end");
        self.halt(task_id).await
    }

    /// Stages 1-4, ending blocked at the approval gate.
    pub async fn discover(&self, task_id: &TaskId) -> PipelineResult<()> {
        let task = self
            .update(
                task_id,
                StatusUpdate::new()
                    .state(TaskState::Running)
                    .stage(Stage::Asset)
                    .percent(10)
                    .hint("Discovering assets")
                    .error(None)
                    .clear_approval()
                    .retryable(false),
            )
            .await?;
        tracing::info!(task_id = %task_id, target = %task.target, "Pipeline started");
        let mut timed_out = Vec::new();

        let ctx = self.context(task_id, Stage::Asset);
        ctx.log(format!("Pipeline started for {}", task.target)).await;
        let assets = stages::asset(&ctx, &task, &self.asset_ports).await?;
        if assets.timed_out {
            timed_out.push(Stage::Asset);
        }
        let ports: usize = assets.artifact.hosts.iter().map(|h| h.ports.len()).sum();
        self.update(
            task_id,
            StatusUpdate::new()
                .percent(30)
                .hint(hint(format!("Found {} open ports", ports), &timed_out)),
        )
        .await?;

        let message = hint("Fingerprinting web services", &timed_out);
        self.begin(task_id, Stage::Fingerprint, 45, &message).await?;
        let ctx = self.context(task_id, Stage::Fingerprint);
        let fingerprints = stages::fingerprint(&ctx, &task, &assets.artifact).await?;
        if fingerprints.timed_out {
            timed_out.push(Stage::Fingerprint);
        }
        self.update(
            task_id,
            StatusUpdate::new().percent(55).hint(hint(
                format!("Found {} web fingerprints", fingerprints.artifact.total_found),
                &timed_out,
            )),
        )
        .await?;

        let message = hint("Crawling for endpoints", &timed_out);
        self.begin(task_id, Stage::Surface, 65, &message).await?;
        let ctx = self.context(task_id, Stage::Surface);
        let endpoints = stages::surface(&ctx, &task, &fingerprints.artifact).await?;
        if endpoints.timed_out {
            timed_out.push(Stage::Surface);
        }
        self.update(
            task_id,
            StatusUpdate::new().percent(75).hint(hint(
                format!("Discovered {} endpoints", endpoints.artifact.endpoints.len()),
                &timed_out,
            )),
        )
        .await?;

        let message = hint("Selecting candidates", &timed_out);
        self.begin(task_id, Stage::Candidate, 80, &message).await?;
        let ctx = self.context(task_id, Stage::Candidate);
        let candidates = stages::candidate(&ctx, &task, &self.filter, &endpoints.artifact).await?;
        let selected = candidates.artifact.candidates.len();

        self.checkpoint(task_id).await?;
        self.update(
            task_id,
            StatusUpdate::new()
                .state(TaskState::Blocked)
                .stage(Stage::HumanGate)
                .percent(85)
                .hint(hint(
                    format!("{} candidates selected, waiting for approval", selected),
                    &timed_out,
                ))
                .blocked(Blocked::awaiting_approval()),
        )
        .await?;
        self.registry
            .store()
            .append_log(
                task_id,
                Stage::HumanGate.log_name(),
                &format!("Waiting for approval of {} candidates", selected),
            )
            .await?;
        tracing::info!(task_id = %task_id, candidates = selected, "Waiting at approval gate");
        Ok(())
    }

    /// Stage 5 and the report, after an approval.
    pub async fn verify(&self, task_id: &TaskId) -> PipelineResult<()> {
        let task = self.registry.get(task_id).await?;
        if task.state != TaskState::Running {
            tracing::info!(task_id = %task_id, state = %task.state, "Skipping verification");
            return Ok(());
        }
        self.begin(task_id, Stage::Verify, 90, "Verifying candidates").await?;

        let candidates = self
            .registry
            .store()
            .read_artifact::<CandidatesArtifact>(task_id, CANDIDATES)
            .await?
            .unwrap_or_else(|| CandidatesArtifact {
                task_id: task_id.clone(),
                candidates: Vec::new(),
            });
        let ctx = self.context(task_id, Stage::Verify);
        let findings = stages::verify(&ctx, &task, &candidates).await?;
        let timed_out = if findings.timed_out { vec![Stage::Verify] } else { Vec::new() };
        self.update(
            task_id,
            StatusUpdate::new().percent(95).hint(hint(
                format!("Verified {} findings", findings.artifact.findings.len()),
                &timed_out,
            )),
        )
        .await?;

        self.report(task_id, &timed_out).await
    }

    /// Stage 6: compose the deliverables and complete the task.
    pub async fn report(&self, task_id: &TaskId, timed_out: &[Stage]) -> PipelineResult<()> {
        self.begin(task_id, Stage::Report, 95, &hint("Composing report", timed_out))
            .await?;
        let bundle = self.composer.compose(task_id).await?;
        self.registry
            .store()
            .append_log(
                task_id,
                Stage::Report.log_name(),
                &format!("Report written to {}", bundle.report_path.display()),
            )
            .await?;
        self.update(
            task_id,
            StatusUpdate::new()
                .state(TaskState::Completed)
                .percent(100)
                .hint(hint("Report ready", timed_out)),
        )
        .await?;
        tracing::info!(task_id = %task_id, "Pipeline completed");
        Ok(())
    }
}

#[async_trait]
impl JobRunner for Pipeline {
    async fn execute(&self, task_id: TaskId, job: Job) {
        let result = match job {
            Job::Discover => self.discover(&task_id).await,
            Job::Verify => self.verify(&task_id).await,
        };
        match result {
            Ok(()) | Err(PipelineError::Stopped) => {}
            Err(e) => {
                let retryable = e.is_transient();
                self.registry.fail(&task_id, e.to_string(), retryable).await;
            }
        }
        if let Err(e) = self.settle_stop(&task_id).await {
            tracing::warn!(task_id = %task_id, "Failed to settle stop request: {}", e);
        }
    }
}
