//! API request and response types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::evidence::ArtifactEntry;
use crate::task::TaskId;

/// Request to create a new task.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTaskRequest {
    /// Host, IP or URL to test
    pub target: String,

    /// Root URL for web stages, when it differs from the target
    #[serde(default)]
    pub base_url: Option<String>,

    /// Budget as a JSON object or a string holding one
    #[serde(default)]
    pub budget: Option<Value>,
}

/// Decision at the human gate.
#[derive(Debug, Clone, Deserialize)]
pub struct ApproveRequest {
    /// `approve` or `reject`
    pub action: String,
    pub approver: String,
    #[serde(default)]
    pub remark: Option<String>,
}

/// Ad hoc tool invocation.
#[derive(Debug, Clone, Deserialize)]
pub struct InvokeToolRequest {
    pub task_id: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactListResponse {
    pub task_id: TaskId,
    pub artifacts: Vec<ArtifactEntry>,
}

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub dev_mode: bool,
    pub auth_required: bool,
    pub max_concurrent_tasks: usize,
}
