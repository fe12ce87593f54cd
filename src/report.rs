//! Report composer - renders `report.md` and bundles the evidence directory.
//!
//! Composition never requires a complete run: every input is optional and
//! the report says what is missing instead of failing.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use thiserror::Error;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::evidence::artifacts::{
    archive_name, APPROVAL, ASSETS, CANDIDATES, ENDPOINTS, FINDINGS, FINGERPRINTS, REPORT, SCOPE,
    STATUS,
};
use crate::evidence::{
    is_transient_io, AssetsArtifact, CandidatesArtifact, EndpointsArtifact, EvidenceError, EvidenceStore,
    FindingsArtifact, FingerprintsArtifact, ScopeRecord,
};
use crate::task::{ApprovalRecord, Task, TaskId};

#[derive(Debug, Error)]
pub enum ReportError {
    #[error(transparent)]
    Evidence(#[from] EvidenceError),

    #[error("Failed to build archive: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Archive I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Archive task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl ReportError {
    /// Disk trouble while writing the bundle may clear up on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Evidence(e) => e.is_transient(),
            Self::Io { source, .. } => is_transient_io(source),
            Self::Zip(zip::result::ZipError::Io(e)) => is_transient_io(e),
            _ => false,
        }
    }
}

/// Paths of the two deliverables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportBundle {
    pub report_path: PathBuf,
    pub archive_path: PathBuf,
}

/// Everything the report draws from. Absent or unreadable documents are
/// `None`.
#[derive(Debug, Default)]
pub struct ReportInputs {
    pub status: Option<Task>,
    pub scope: Option<ScopeRecord>,
    pub assets: Option<AssetsArtifact>,
    pub fingerprints: Option<FingerprintsArtifact>,
    pub endpoints: Option<EndpointsArtifact>,
    pub candidates: Option<CandidatesArtifact>,
    pub findings: Option<FindingsArtifact>,
    pub approval: Option<ApprovalRecord>,
    /// `(tool, finding count)` for every ad hoc `{tool}_findings.json`
    pub tool_counts: Vec<(String, usize)>,
}

#[derive(Debug, Clone)]
pub struct ReportComposer {
    store: EvidenceStore,
}

impl ReportComposer {
    pub fn new(store: EvidenceStore) -> Self {
        Self { store }
    }

    /// Render `report.md` and rebuild `artifacts_{task_id}.zip`.
    pub async fn compose(&self, task_id: &TaskId) -> Result<ReportBundle, ReportError> {
        let inputs = self.load(task_id).await;
        let markdown = render(task_id, &inputs, Utc::now());
        self.store.write_text(task_id, REPORT, &markdown).await?;

        let dir = self.store.task_dir(task_id);
        let archive_path = dir.join(archive_name(task_id));
        let target = archive_path.clone();
        let entries = tokio::task::spawn_blocking(move || build_archive(&dir, &target)).await??;

        tracing::info!(task_id = %task_id, entries, "Report composed");
        Ok(ReportBundle {
            report_path: self.store.path(task_id, REPORT),
            archive_path,
        })
    }

    /// Load every known artifact, tolerating missing or malformed ones.
    pub async fn load(&self, task_id: &TaskId) -> ReportInputs {
        let mut tool_counts = Vec::new();
        if let Ok(files) = self.store.list_files(task_id).await {
            for file in files {
                let Some(tool) = file.name.strip_suffix("_findings.json") else {
                    continue;
                };
                if tool.contains('/') {
                    continue;
                }
                let doc: Option<FindingsArtifact> = self.tolerant(task_id, &file.name).await;
                if let Some(doc) = doc {
                    tool_counts.push((tool.to_string(), doc.findings.len()));
                }
            }
        }

        ReportInputs {
            status: self.tolerant(task_id, STATUS).await,
            scope: self.tolerant(task_id, SCOPE).await,
            assets: self.tolerant(task_id, ASSETS).await,
            fingerprints: self.tolerant(task_id, FINGERPRINTS).await,
            endpoints: self.tolerant(task_id, ENDPOINTS).await,
            candidates: self.tolerant(task_id, CANDIDATES).await,
            findings: self.tolerant(task_id, FINDINGS).await,
            approval: self.tolerant(task_id, APPROVAL).await,
            tool_counts,
        }
    }

    async fn tolerant<T: DeserializeOwned>(&self, task_id: &TaskId, name: &str) -> Option<T> {
        match self.store.read_artifact(task_id, name).await {
            Ok(doc) => doc,
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "Ignoring unreadable {}", name);
                None
            }
        }
    }
}

/// Escape a value for a markdown table cell.
fn cell(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('|', "\\|")
        .replace(['\r', '\n'], " ")
}

/// Render the markdown report.
pub fn render(task_id: &TaskId, inputs: &ReportInputs, completed_at: DateTime<Utc>) -> String {
    let mut out = String::new();
    let target = inputs
        .scope
        .as_ref()
        .map(|s| s.target.as_str())
        .or_else(|| inputs.status.as_ref().map(|t| t.target.as_str()))
        .unwrap_or("unknown");

    out.push_str("# Penetration Test Report\n\n");
    out.push_str("## Overview\n\n");
    out.push_str(&format!("- **Task ID**: {}\n", task_id));
    out.push_str(&format!("- **Target**: {}\n", target));
    if let Some(base) = inputs.scope.as_ref().and_then(|s| s.base_url.as_deref()) {
        out.push_str(&format!("- **Base URL**: {}\n", base));
    }
    if let Some(status) = &inputs.status {
        out.push_str(&format!("- **Created**: {}\n", status.created_at.format("%Y-%m-%d %H:%M:%S UTC")));
    }
    out.push_str(&format!(
        "- **Completed**: {}\n",
        completed_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));

    let findings = inputs
        .findings
        .as_ref()
        .map(|f| f.findings.as_slice())
        .unwrap_or_default();
    out.push_str(&format!("- **Findings**: {}\n\n", findings.len()));

    out.push_str("## Findings\n\n");
    if findings.is_empty() {
        let note = match (&inputs.findings, inputs.approval.as_ref().map(|a| a.action)) {
            (None, Some(crate::task::ApprovalAction::Reject)) => {
                "Verification was rejected at the approval gate; no probes were sent."
            }
            (None, _) => "Verification did not run.",
            (Some(_), _) => "No findings.",
        };
        out.push_str(note);
        out.push_str("\n\n");
    } else {
        out.push_str("| Target | Classification | Severity | Evidence |\n");
        out.push_str("| --- | --- | --- | --- |\n");
        for f in findings {
            out.push_str(&format!(
                "| {} | {} | {} | `{}` |\n",
                cell(&f.target),
                cell(&f.classification),
                f.severity,
                cell(&f.evidence.data).replace('`', "'")
            ));
        }
        out.push('\n');
    }

    out.push_str("## Assets\n\n");
    match &inputs.assets {
        Some(assets) if !assets.hosts.is_empty() => {
            for host in &assets.hosts {
                let ports = host
                    .ports
                    .iter()
                    .map(|p| format!("{}/{} ({})", p.port, p.protocol, p.service))
                    .collect::<Vec<_>>()
                    .join(", ");
                out.push_str(&format!("- **{}**: {}\n", host.ip, ports));
            }
        }
        _ => out.push_str("No asset data.\n"),
    }
    out.push('\n');

    out.push_str("## Fingerprints\n\n");
    match &inputs.fingerprints {
        Some(fps) if !fps.fingerprints.is_empty() => {
            for fp in &fps.fingerprints {
                let tech = if fp.tech.is_empty() {
                    "unknown".to_string()
                } else {
                    fp.tech.join(", ")
                };
                let status = fp
                    .status_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "n/a".to_string());
                out.push_str(&format!("- **{}**: {} (Status: {})\n", fp.url, tech, status));
            }
        }
        _ => out.push_str("No fingerprint data.\n"),
    }
    out.push('\n');

    out.push_str("## Attack Surface\n\n");
    let endpoints = inputs.endpoints.as_ref().map(|e| e.endpoints.len());
    let candidates = inputs.candidates.as_ref().map(|c| c.candidates.len());
    out.push_str(&format!(
        "- Endpoints discovered: {}\n",
        endpoints.map_or("n/a".to_string(), |n| n.to_string())
    ));
    out.push_str(&format!(
        "- Candidates selected: {}\n\n",
        candidates.map_or("n/a".to_string(), |n| n.to_string())
    ));

    out.push_str("## Approval\n\n");
    match &inputs.approval {
        Some(a) => {
            out.push_str(&format!(
                "- **Decision**: {} by {} at {}\n",
                a.action,
                a.approver,
                a.time.format("%Y-%m-%d %H:%M:%S UTC")
            ));
            if let Some(remark) = &a.remark {
                out.push_str(&format!("- **Remark**: {}\n", remark));
            }
        }
        None => out.push_str("No approval decision recorded.\n"),
    }

    if !inputs.tool_counts.is_empty() {
        out.push_str("\n## Additional Tool Runs\n\n");
        for (tool, count) in &inputs.tool_counts {
            out.push_str(&format!("- {}: {} findings\n", tool, count));
        }
    }

    out
}

/// Zip every file under `dir` into `target`. The previous archive and
/// in-flight temporary files are left out. Returns the number of entries.
fn build_archive(dir: &Path, target: &Path) -> Result<usize, ReportError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: io::Error| ReportError::Io { path, source }
    };

    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    let result = (|| -> Result<usize, ReportError> {
        let file = File::create(&tmp).map_err(io_err(&tmp))?;
        let mut writer = ZipWriter::new(file);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        let mut entries = 0;

        let mut paths = Vec::new();
        for entry in WalkDir::new(dir).min_depth(1) {
            let entry = entry.map_err(|e| ReportError::Io {
                path: dir.to_path_buf(),
                source: e.into(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if entry.path() == target || (name.starts_with('.') && name.ends_with(".tmp")) {
                continue;
            }
            paths.push(entry.path().to_path_buf());
        }
        paths.sort();

        for path in paths {
            let name = path
                .strip_prefix(dir)
                .unwrap_or(&path)
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            writer.start_file(name, options)?;
            let mut source = File::open(&path).map_err(io_err(&path))?;
            io::copy(&mut source, &mut writer).map_err(io_err(&path))?;
            entries += 1;
        }
        writer.finish()?;
        Ok(entries)
    })();

    match result {
        Ok(entries) => {
            std::fs::rename(&tmp, target).map_err(io_err(target))?;
            Ok(entries)
        }
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            Err(e)
        }
    }
}
