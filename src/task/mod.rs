//! Task module - defines tasks, lifecycle states, pipeline stages and approvals.
//!
//! This module is designed around explicit invariants:
//! - All lifecycle values use algebraic data types with exhaustive matching
//! - Status changes flow through a typed partial update (`StatusUpdate`)
//! - Transition checks are pure functions, separated from IO operations

pub mod task;
mod approval;

pub use approval::{ApprovalAction, ApprovalRecord};
pub use task::{Blocked, Stage, StatusUpdate, Task, TaskError, TaskId, TaskState};
