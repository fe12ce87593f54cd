//! # pentest-runner
//!
//! Evidence-first orchestrator for staged penetration tests.
//!
//! This library provides:
//! - A staged pipeline (assets, fingerprints, attack surface, candidates,
//!   verification, report) driving external security tools
//! - A human approval gate between discovery and verification
//! - A per-task evidence directory that is the single source of truth
//! - An HTTP API for task submission, polling and evidence download
//!
//! ## Architecture
//!
//! ```text
//!   HTTP API ──► Orchestrator ──► Scheduler (bounded, FIFO)
//!                    │                  │
//!                    │                  ▼
//!                    │              Pipeline ──► Tool adapters ──► external processes
//!                    │                  │               │
//!                    ▼                  ▼               ▼
//!              TaskRegistry ──────► EvidenceStore (runs/{task_id}/)
//!                                       ▲
//!                                 ReportComposer
//! ```
//!
//! ## Task Flow
//! 1. Create a task with a target, optional base URL and budget
//! 2. Run: stages 1-4 execute and the task blocks at the human gate
//! 3. Approve to verify candidates, or reject to report discovery only
//! 4. Download `report.md` and the evidence archive
//!
//! ## Modules
//! - `task`: Task document, identifiers and the state machine rules
//! - `budget`: Budget parsing and the timeout governor
//! - `evidence`: Evidence directory I/O and artifact documents
//! - `tools`: Tool adapters, process invocation and the dispatcher
//! - `pipeline`: Stage implementations
//! - `report`: Markdown report and zip archive

pub mod api;
pub mod budget;
pub mod config;
pub mod evidence;
pub mod orchestrator;
pub mod pipeline;
pub mod registry;
pub mod report;
pub mod scheduler;
pub mod task;
pub mod tools;

pub use config::Config;
pub use orchestrator::{Orchestrator, OrchestratorError};
pub use task::{Task, TaskId, TaskState};
