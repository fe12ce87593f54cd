//! Human approval decisions taken at the gate between triage and verification.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::{TaskError, TaskId};

/// Decision submitted for a task waiting at the approval gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalAction {
    /// Resume the pipeline into controlled verification
    Approve,
    /// Stop probing and finish with a report-only deliverable
    Reject,
}

impl ApprovalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
        }
    }
}

impl fmt::Display for ApprovalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalAction {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "approve" => Ok(Self::Approve),
            "reject" => Ok(Self::Reject),
            other => Err(TaskError::InvalidAction(other.to_string())),
        }
    }
}

/// One approval decision. Every decision is appended to the audit trail;
/// the most recent one is also kept as `approval.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub task_id: TaskId,
    pub action: ApprovalAction,
    pub approver: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remark: Option<String>,
    pub time: DateTime<Utc>,
}

impl ApprovalRecord {
    pub fn new(
        task_id: TaskId,
        action: ApprovalAction,
        approver: impl Into<String>,
        remark: Option<String>,
    ) -> Self {
        Self {
            task_id,
            action,
            approver: approver.into(),
            remark: remark.filter(|r| !r.trim().is_empty()),
            time: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_parsing() {
        assert_eq!("approve".parse::<ApprovalAction>().unwrap(), ApprovalAction::Approve);
        assert_eq!(" Reject ".parse::<ApprovalAction>().unwrap(), ApprovalAction::Reject);
        assert!(matches!(
            "maybe".parse::<ApprovalAction>(),
            Err(TaskError::InvalidAction(_))
        ));
    }

    #[test]
    fn test_blank_remark_dropped() {
        let id: TaskId = "t_0000beef".parse().unwrap();
        let record = ApprovalRecord::new(id, ApprovalAction::Reject, "alice", Some("  ".into()));
        assert!(record.remark.is_none());
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["action"], "reject");
        assert!(json.get("remark").is_none());
    }
}
