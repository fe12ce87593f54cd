//! Evidence module - the per-task directory that holds all durable state.
//!
//! # Layout (`{runs_dir}/{task_id}/`)
//! - `status.json` - current task document, merge-updated
//! - `scope.json` - target, base URL and budget snapshot taken at creation
//! - `{artifact}.json` - one document per stage or tool, tagged with `task_id`
//! - `logs/{stage}.log` - append-only, `[YYYY-MM-DD HH:MM:SS] message`
//! - `approval.json`, `approvals.jsonl` - last decision and audit trail
//! - `report.md`, `artifacts_{task_id}.zip` - final deliverables
//!
//! Nothing here caches state: the directory is the source of truth.

pub mod artifacts;
mod store;

pub use artifacts::{
    Candidate, CandidatesArtifact, Endpoint, EndpointSource, EndpointsArtifact, Evidence,
    EvidenceKind, Finding, FindingsArtifact, Fingerprint, FingerprintsArtifact, Host, OpenPort,
    AssetsArtifact, ScopeRecord, Severity,
};
pub use store::{is_transient_io, ArtifactEntry, EvidenceError, EvidenceResult, EvidenceStore};
