//! Artifact document names and shapes.
//!
//! Every document carries the owning `task_id` so an artifact copied out of
//! its directory still says where it came from.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::budget::Budget;
use crate::task::TaskId;

pub const STATUS: &str = "status.json";
pub const SCOPE: &str = "scope.json";
pub const ASSETS: &str = "assets.json";
pub const FINGERPRINTS: &str = "http_fingerprints.json";
pub const ENDPOINTS: &str = "endpoints.json";
pub const CANDIDATES: &str = "candidates.json";
pub const FINDINGS: &str = "findings.json";
pub const APPROVAL: &str = "approval.json";
pub const APPROVAL_LOG: &str = "approvals.jsonl";
pub const REPORT: &str = "report.md";
pub const LOGS_DIR: &str = "logs";

pub fn archive_name(task_id: &TaskId) -> String {
    format!("artifacts_{}.zip", task_id)
}

/// Per-tool findings document written by ad hoc adapters.
pub fn tool_findings_name(tool: &str) -> String {
    format!("{}_findings.json", tool)
}

/// Raw output file of a tool, e.g. `nuclei_raw.jsonl`.
pub fn tool_raw_name(tool: &str, extension: &str) -> String {
    format!("{}_raw.{}", tool, extension)
}

// ─────────────────────────────────────────────────────────────────────────────
// Scope
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeRecord {
    pub task_id: TaskId,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    pub budget: Budget,
    pub created_at: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Stage 1: assets
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetsArtifact {
    pub task_id: TaskId,
    pub target: String,
    pub hosts: Vec<Host>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub ip: String,
    pub ports: Vec<OpenPort>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenPort {
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub service: String,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

// ─────────────────────────────────────────────────────────────────────────────
// Stage 2: fingerprints
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintsArtifact {
    pub task_id: TaskId,
    pub total_found: usize,
    pub fingerprints: Vec<Fingerprint>,
}

/// One HTTP service fingerprint. Field names follow httpx JSON output, so
/// raw records deserialize directly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Fingerprint {
    pub url: String,
    #[serde(alias = "status-code", skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(alias = "technologies")]
    pub tech: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webserver: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Stage 3: endpoints
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointsArtifact {
    pub task_id: TaskId,
    pub endpoints: Vec<Endpoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointSource {
    Crawl,
    Fingerprint,
    Redirect,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    pub source: EndpointSource,
}

fn default_method() -> String {
    "GET".to_string()
}

// ─────────────────────────────────────────────────────────────────────────────
// Stage 4: candidates
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidatesArtifact {
    pub task_id: TaskId,
    pub candidates: Vec<Candidate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    pub reason: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Findings
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindingsArtifact {
    pub task_id: TaskId,
    pub findings: Vec<Finding>,
}

/// Severity tier of a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "Info",
            Self::Low => "Low",
            Self::Medium => "Medium",
            Self::High => "High",
            Self::Critical => "Critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    /// Case-insensitive; also accepts the `unknown`/`informational` spellings
    /// some scanners emit.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "info" | "informational" | "unknown" => Ok(Self::Info),
            "low" => Ok(Self::Low),
            "medium" | "moderate" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown severity: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvidenceKind {
    /// Response status or header line of a probe
    HttpHeader,
    /// A record or line emitted by a tool
    ToolOutput,
    /// Recovered credential material
    Credential,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    pub kind: EvidenceKind,
    pub data: String,
}

/// Normalized unit of signal, independent of the tool that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// URL, host or IP the finding applies to
    pub target: String,
    pub classification: String,
    pub severity: Severity,
    pub evidence: Evidence,
}

impl Finding {
    pub fn new(
        target: impl Into<String>,
        classification: impl Into<String>,
        severity: Severity,
        kind: EvidenceKind,
        data: impl Into<String>,
    ) -> Self {
        Self {
            target: target.into(),
            classification: classification.into(),
            severity,
            evidence: Evidence {
                kind,
                data: data.into(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_from_httpx_record() {
        let line = r#"{"url":"http://10.0.0.1:8080","status-code":302,"title":"Login","tech":["nginx","PHP"],"location":"/login.php","port":"8080"}"#;
        let fp: Fingerprint = serde_json::from_str(line).unwrap();
        assert_eq!(fp.status_code, Some(302));
        assert_eq!(fp.tech, vec!["nginx", "PHP"]);
        assert_eq!(fp.location.as_deref(), Some("/login.php"));

        let newer: Fingerprint =
            serde_json::from_str(r#"{"url":"https://a.test","status_code":200}"#).unwrap();
        assert_eq!(newer.status_code, Some(200));
        assert!(newer.tech.is_empty());
    }

    #[test]
    fn test_severity_parsing_and_order() {
        assert_eq!("CRITICAL".parse::<Severity>().unwrap(), Severity::Critical);
        assert_eq!("unknown".parse::<Severity>().unwrap(), Severity::Info);
        assert!("bogus".parse::<Severity>().is_err());
        assert!(Severity::High > Severity::Low);
        assert_eq!(serde_json::to_value(Severity::Medium).unwrap(), "Medium");
    }

    #[test]
    fn test_finding_document_shape() {
        let finding = Finding::new(
            "http://t/login",
            "Potential Sensitive Interface",
            Severity::Medium,
            EvidenceKind::HttpHeader,
            "HTTP/1.1 200 OK",
        );
        let json = serde_json::to_value(&finding).unwrap();
        assert_eq!(json["evidence"]["kind"], "HTTP_HEADER");
        assert_eq!(json["severity"], "Medium");
    }
}
