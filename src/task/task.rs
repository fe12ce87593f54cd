//! Core task types and the pure transition rules of the task state machine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::approval::ApprovalAction;
use crate::budget::Budget;
use crate::evidence::EvidenceError;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Invalid task id: {0:?}")]
    InvalidTaskId(String),

    #[error("Task {0} not found")]
    NotFound(TaskId),

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: TaskState, to: TaskState },

    #[error("Task cannot enter the blocked state without a reason")]
    BlockedWithoutReason,

    #[error("Action must be approve or reject, got {0:?}")]
    InvalidAction(String),

    #[error("Task {0} failed with a terminal error and cannot be retried")]
    NotRetryable(TaskId),

    #[error("Task {task_id} was already decided: {action}")]
    AlreadyDecided { task_id: TaskId, action: ApprovalAction },

    #[error(transparent)]
    Evidence(#[from] EvidenceError),
}

/// Opaque task identifier, e.g. `t_3fa91c07`.
///
/// Identifiers name directories on disk, so parsing only accepts ASCII
/// alphanumerics, `_` and `-`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskId(String);

impl TaskId {
    /// Generate a fresh random identifier. Uniqueness against existing tasks
    /// is checked by the registry.
    pub fn generate() -> Self {
        Self(format!("t_{:08x}", rand::random::<u32>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for TaskId {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = !s.is_empty()
            && s.len() <= 64
            && s
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(TaskError::InvalidTaskId(s.to_string()))
        }
    }
}

impl TryFrom<String> for TaskId {
    type Error = TaskError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TaskId> for String {
    fn from(id: TaskId) -> Self {
        id.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Created,
    Running,
    /// Waiting at the approval gate
    Blocked,
    Completed,
    Failed,
    Stopped,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Blocked => "blocked",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    /// No further transitions are possible, except retrying a failed task.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    /// Whether the state machine admits `self -> next`. Staying in the same
    /// state is always allowed.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;

        if *self == next {
            return true;
        }
        matches!(
            (self, next),
            (Created, Running | Stopped | Failed)
                | (Running, Blocked | Completed | Failed | Stopped)
                | (Blocked, Running | Completed | Failed | Stopped)
                | (Failed, Running)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stage {
    #[serde(rename = "Stage0_Create")]
    Create,
    #[serde(rename = "Stage1_Asset")]
    Asset,
    #[serde(rename = "Stage2_Fingerprint")]
    Fingerprint,
    #[serde(rename = "Stage3_Surface")]
    Surface,
    #[serde(rename = "Stage4_Candidate")]
    Candidate,
    #[serde(rename = "human_gate")]
    HumanGate,
    #[serde(rename = "Stage5_Verify")]
    Verify,
    #[serde(rename = "Stage6_Report")]
    Report,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "Stage0_Create",
            Self::Asset => "Stage1_Asset",
            Self::Fingerprint => "Stage2_Fingerprint",
            Self::Surface => "Stage3_Surface",
            Self::Candidate => "Stage4_Candidate",
            Self::HumanGate => "human_gate",
            Self::Verify => "Stage5_Verify",
            Self::Report => "Stage6_Report",
        }
    }

    /// Name of the stage log under `logs/`.
    pub fn log_name(&self) -> &'static str {
        match self {
            Self::Create => "stage0_create",
            Self::Asset => "stage1_asset",
            Self::Fingerprint => "stage2_fingerprint",
            Self::Surface => "stage3_surface",
            Self::Candidate => "stage4_candidate",
            Self::HumanGate => "human_gate",
            Self::Verify => "stage5_verify",
            Self::Report => "stage6_report",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Blocked flag. `is_blocked` is true exactly when the task state is `blocked`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blocked {
    pub is_blocked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_action: Option<String>,
}

impl Blocked {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn awaiting_approval() -> Self {
        Self {
            is_blocked: true,
            reason: Some("Needs approval to proceed".to_string()),
            required_action: Some("approve_or_reject".to_string()),
        }
    }
}

/// The task status document, persisted as `status.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default)]
    pub budget: Budget,
    pub state: TaskState,
    pub stage: Stage,
    /// 0-100, non-decreasing while running
    pub percent: u8,
    #[serde(default)]
    pub hint: String,
    #[serde(default)]
    pub blocked: Blocked,
    #[serde(default)]
    pub approved: Option<ApprovalAction>,
    #[serde(default)]
    pub poll_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set on failed tasks whose error is transient
    #[serde(default)]
    pub retryable: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(task_id: TaskId, target: String, base_url: Option<String>, budget: Budget) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            target,
            base_url,
            budget,
            state: TaskState::Created,
            stage: Stage::Create,
            percent: 0,
            hint: "Task created".to_string(),
            blocked: Blocked::none(),
            approved: None,
            poll_count: 0,
            error: None,
            retryable: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Merge `update` field by field. Missing fields keep their value.
    /// `updated_at` is always refreshed. No invariants are checked here;
    /// see [`Task::check_update`].
    pub fn apply(&mut self, update: &StatusUpdate) {
        if let Some(state) = update.state {
            self.state = state;
        }
        if let Some(stage) = update.stage {
            self.stage = stage;
        }
        if let Some(percent) = update.percent {
            self.percent = percent.min(100);
        }
        if let Some(hint) = &update.hint {
            self.hint = hint.clone();
        }
        if let Some(blocked) = &update.blocked {
            self.blocked = blocked.clone();
        }
        if let Some(approved) = update.approved {
            self.approved = approved;
        }
        if let Some(error) = &update.error {
            self.error = error.clone();
        }
        if let Some(retryable) = update.retryable {
            self.retryable = retryable;
        }
        self.updated_at = Utc::now();
    }

    /// Validate `update` against the current document and return the
    /// normalized update that keeps every invariant:
    /// - the state transition must be admitted by the state machine
    /// - percent never decreases while the task stays running
    /// - `blocked.is_blocked` holds exactly when the state is `blocked`
    pub fn check_update(&self, update: &StatusUpdate) -> Result<StatusUpdate, TaskError> {
        let next_state = update.state.unwrap_or(self.state);
        if !self.state.can_transition_to(next_state) {
            return Err(TaskError::InvalidTransition {
                from: self.state,
                to: next_state,
            });
        }

        let mut normalized = update.clone();

        if let Some(percent) = normalized.percent {
            let percent = percent.min(100);
            normalized.percent = Some(
                if self.state == TaskState::Running && next_state == TaskState::Running {
                    percent.max(self.percent)
                } else {
                    percent
                },
            );
        }

        if next_state == TaskState::Blocked {
            let blocked = normalized.blocked.as_ref().unwrap_or(&self.blocked);
            if !blocked.is_blocked {
                return Err(TaskError::BlockedWithoutReason);
            }
        } else if self.blocked.is_blocked
            || normalized.blocked.as_ref().is_some_and(|b| b.is_blocked)
        {
            normalized.blocked = Some(Blocked::none());
        }

        Ok(normalized)
    }
}

/// Typed partial update of a [`Task`]. Every field is optional; `None` means
/// "leave unchanged".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusUpdate {
    pub state: Option<TaskState>,
    pub stage: Option<Stage>,
    pub percent: Option<u8>,
    pub hint: Option<String>,
    pub blocked: Option<Blocked>,
    /// `Some(None)` clears a previous decision
    pub approved: Option<Option<ApprovalAction>>,
    /// `Some(None)` clears a previous error
    pub error: Option<Option<String>>,
    pub retryable: Option<bool>,
}

impl StatusUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(mut self, state: TaskState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn percent(mut self, percent: u8) -> Self {
        self.percent = Some(percent);
        self
    }

    pub fn hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn blocked(mut self, blocked: Blocked) -> Self {
        self.blocked = Some(blocked);
        self
    }

    pub fn approved(mut self, action: ApprovalAction) -> Self {
        self.approved = Some(Some(action));
        self
    }

    pub fn clear_approval(mut self) -> Self {
        self.approved = Some(None);
        self
    }

    pub fn error(mut self, error: Option<String>) -> Self {
        self.error = Some(error);
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }
}
