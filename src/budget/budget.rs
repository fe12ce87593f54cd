//! Budget type and request parsing.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_TIMEOUT_SECONDS: u64 = 900;
pub const DEFAULT_RATE_LIMIT_RPS: f64 = 1.0;

#[derive(Debug, Error)]
pub enum BudgetError {
    #[error("Budget is not valid JSON: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("Budget must be a JSON object")]
    NotAnObject,

    #[error("timeout_seconds must be greater than zero")]
    InvalidTimeout,

    #[error("rate_limit_rps must be a positive number, got {0}")]
    InvalidRate(f64),
}

/// Execution limits attached to a task at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Budget {
    /// Upper bound on a single tool invocation
    pub timeout_seconds: u64,
    /// Requests per second the tools may send. Validated and recorded with
    /// the task but not yet passed to any tool.
    pub rate_limit_rps: f64,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            rate_limit_rps: DEFAULT_RATE_LIMIT_RPS,
        }
    }
}

impl Budget {
    pub fn validate(&self) -> Result<(), BudgetError> {
        if self.timeout_seconds == 0 {
            return Err(BudgetError::InvalidTimeout);
        }
        if !self.rate_limit_rps.is_finite() || self.rate_limit_rps <= 0.0 {
            return Err(BudgetError::InvalidRate(self.rate_limit_rps));
        }
        Ok(())
    }
}

/// Parse the `budget` field of a create request.
///
/// Accepts nothing (defaults), a JSON object, or a string holding a JSON
/// object. Missing keys take their defaults.
pub fn parse_budget(raw: Option<&Value>) -> Result<Budget, BudgetError> {
    let value = match raw {
        None | Some(Value::Null) => return Ok(Budget::default()),
        Some(Value::String(s)) if s.trim().is_empty() => return Ok(Budget::default()),
        Some(Value::String(s)) => serde_json::from_str::<Value>(s).map_err(BudgetError::Malformed)?,
        Some(other) => other.clone(),
    };

    if !value.is_object() {
        return Err(BudgetError::NotAnObject);
    }

    let budget: Budget = serde_json::from_value(value).map_err(BudgetError::Malformed)?;
    budget.validate()?;
    Ok(budget)
}
