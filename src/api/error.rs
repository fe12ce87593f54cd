//! Mapping from orchestrator errors to HTTP responses.

use axum::http::StatusCode;

use crate::orchestrator::OrchestratorError;
use crate::task::TaskError;

pub fn error_response(err: OrchestratorError) -> (StatusCode, String) {
    let status = match &err {
        OrchestratorError::Task(e) => match e {
            TaskError::NotFound(_) => StatusCode::NOT_FOUND,
            TaskError::InvalidTaskId(_) => StatusCode::BAD_REQUEST,
            TaskError::InvalidAction(_) => StatusCode::UNPROCESSABLE_ENTITY,
            TaskError::InvalidTransition { .. }
            | TaskError::NotRetryable(_)
            | TaskError::AlreadyDecided { .. }
            | TaskError::BlockedWithoutReason => StatusCode::CONFLICT,
            TaskError::Evidence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        },
        OrchestratorError::Budget(_) | OrchestratorError::InvalidInput(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        OrchestratorError::Dispatch(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::ArchiveNotReady(_) => StatusCode::NOT_FOUND,
        OrchestratorError::Evidence(_) | OrchestratorError::Report(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };

    if status.is_server_error() {
        tracing::error!("Request failed: {}", err);
    }
    (status, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::BudgetError;
    use crate::task::{ApprovalAction, TaskId, TaskState};
    use crate::tools::DispatchError;

    fn id() -> TaskId {
        "t_0000abcd".parse().unwrap()
    }

    #[test]
    fn test_status_codes() {
        let cases: Vec<(OrchestratorError, StatusCode)> = vec![
            (TaskError::NotFound(id()).into(), StatusCode::NOT_FOUND),
            (
                TaskError::InvalidTaskId("../x".into()).into(),
                StatusCode::BAD_REQUEST,
            ),
            (
                TaskError::InvalidTransition {
                    from: TaskState::Completed,
                    to: TaskState::Running,
                }
                .into(),
                StatusCode::CONFLICT,
            ),
            (TaskError::NotRetryable(id()).into(), StatusCode::CONFLICT),
            (
                TaskError::AlreadyDecided {
                    task_id: id(),
                    action: ApprovalAction::Reject,
                }
                .into(),
                StatusCode::CONFLICT,
            ),
            (
                OrchestratorError::Budget(BudgetError::NotAnObject),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                DispatchError::UnregisteredTool("metasploit".into()).into(),
                StatusCode::BAD_REQUEST,
            ),
            (OrchestratorError::ArchiveNotReady(id()), StatusCode::NOT_FOUND),
        ];

        for (err, expected) in cases {
            let (status, message): (StatusCode, String) = error_response(err);
            assert_eq!(status, expected, "{}", message);
            assert!(!message.is_empty());
        }
    }

    #[test]
    fn test_not_found_names_the_task() {
        let (_, message) = error_response(TaskError::NotFound(id()).into());
        assert!(message.contains("t_0000abcd"));
    }
}
