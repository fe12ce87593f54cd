//! Budget module - per-task execution limits.
//!
//! # Key Concepts
//! - Budget: the limits a task was created with (tool timeout, request rate)
//! - Parsing: budgets arrive as a JSON object or a JSON-encoded string
//! - Governor: resolves the effective timeout for one tool invocation

mod budget;
mod governor;

pub use budget::{parse_budget, Budget, BudgetError, DEFAULT_RATE_LIMIT_RPS, DEFAULT_TIMEOUT_SECONDS};
pub use governor::BudgetGovernor;
