//! Resolves how long a single tool invocation may run.

use std::time::Duration;

use crate::evidence::EvidenceStore;
use crate::task::TaskId;

/// Reads the task budget from evidence and turns it into a timeout.
///
/// Resolution never fails: a missing or unreadable status document falls
/// back to the configured default.
#[derive(Debug, Clone)]
pub struct BudgetGovernor {
    store: EvidenceStore,
    fallback: Duration,
}

impl BudgetGovernor {
    pub fn new(store: EvidenceStore, fallback: Duration) -> Self {
        Self { store, fallback }
    }

    pub fn fallback(&self) -> Duration {
        self.fallback
    }

    /// Effective timeout, in priority order: a positive per-call override,
    /// the task's `budget.timeout_seconds`, then the fallback.
    pub async fn timeout_for(&self, task_id: &TaskId, override_secs: Option<u64>) -> Duration {
        if let Some(secs) = override_secs.filter(|s| *s > 0) {
            return Duration::from_secs(secs);
        }

        match self.store.read_status(task_id).await {
            Ok(Some(task)) if task.budget.timeout_seconds > 0 => {
                Duration::from_secs(task.budget.timeout_seconds)
            }
            Ok(_) => self.fallback,
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "Unreadable budget, using default timeout");
                self.fallback
            }
        }
    }
}
