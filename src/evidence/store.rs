//! Filesystem-backed evidence store.

use std::io;
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use walkdir::WalkDir;

use super::artifacts::{LOGS_DIR, STATUS};
use crate::task::{StatusUpdate, Task, TaskId};

#[derive(Debug, Error)]
pub enum EvidenceError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Malformed document {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Missing document {0}")]
    Missing(PathBuf),

    #[error("Failed to serialize document: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl EvidenceError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Whether retrying the failed operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io { source, .. } => is_transient_io(source),
            _ => false,
        }
    }
}

/// Interrupted, timed out, would-block and disk-full errors may clear up.
pub fn is_transient_io(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    ) || error.raw_os_error() == Some(libc::ENOSPC)
}

pub type EvidenceResult<T> = Result<T, EvidenceError>;

/// One file inside a task directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactEntry {
    /// Path relative to the task directory, `/`-separated
    pub name: String,
    pub path: PathBuf,
    pub mime_type: &'static str,
    pub size_bytes: u64,
    pub sha256: String,
}

/// Per-task evidence directories under one root.
#[derive(Debug, Clone)]
pub struct EvidenceStore {
    root: PathBuf,
}

impl EvidenceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn task_dir(&self, task_id: &TaskId) -> PathBuf {
        self.root.join(task_id.as_str())
    }

    pub fn path(&self, task_id: &TaskId, name: &str) -> PathBuf {
        self.task_dir(task_id).join(name)
    }

    pub fn log_path(&self, task_id: &TaskId, stage_log: &str) -> PathBuf {
        self.task_dir(task_id)
            .join(LOGS_DIR)
            .join(format!("{}.log", stage_log))
    }

    /// Create the task directory and its `logs/` subdirectory. Idempotent.
    pub async fn ensure(&self, task_id: &TaskId) -> EvidenceResult<PathBuf> {
        let dir = self.task_dir(task_id);
        let logs = dir.join(LOGS_DIR);
        tokio::fs::create_dir_all(&logs)
            .await
            .map_err(|e| EvidenceError::io(&logs, e))?;
        Ok(dir)
    }

    pub async fn exists(&self, task_id: &TaskId) -> bool {
        tokio::fs::try_exists(self.path(task_id, STATUS))
            .await
            .unwrap_or(false)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Status
    // ─────────────────────────────────────────────────────────────────────

    pub async fn read_status(&self, task_id: &TaskId) -> EvidenceResult<Option<Task>> {
        self.read_artifact(task_id, STATUS).await
    }

    /// Write the initial status document of a new task.
    pub async fn init_status(&self, task: &Task) -> EvidenceResult<()> {
        self.ensure(&task.task_id).await?;
        self.write_artifact(&task.task_id, STATUS, task).await
    }

    /// Read-modify-write the status document. Fields absent from `update`
    /// keep their stored value; `task_id` and `updated_at` are always stamped.
    pub async fn write_status(&self, task_id: &TaskId, update: &StatusUpdate) -> EvidenceResult<Task> {
        let path = self.path(task_id, STATUS);
        let mut task = self
            .read_status(task_id)
            .await?
            .ok_or_else(|| EvidenceError::Missing(path.clone()))?;

        task.apply(update);
        task.task_id = task_id.clone();
        self.write_artifact(task_id, STATUS, &task).await?;
        Ok(task)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Logs
    // ─────────────────────────────────────────────────────────────────────

    /// Append `message` to `logs/{stage_log}.log`, one timestamped line per
    /// message line. The file is created on first write.
    pub async fn append_log(&self, task_id: &TaskId, stage_log: &str, message: &str) -> EvidenceResult<()> {
        self.ensure(task_id).await?;
        let path = self.log_path(task_id, stage_log);
        let stamp = Local::now().format("%Y-%m-%d %H:%M:%S");

        let mut buf = String::new();
        for line in message.lines() {
            buf.push_str(&format!("[{}] {}\n", stamp, line));
        }
        if buf.is_empty() {
            buf = format!("[{}] \n", stamp);
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| EvidenceError::io(&path, e))?;
        file.write_all(buf.as_bytes())
            .await
            .map_err(|e| EvidenceError::io(&path, e))?;
        file.flush().await.map_err(|e| EvidenceError::io(&path, e))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Artifacts
    // ─────────────────────────────────────────────────────────────────────

    /// Replace the named JSON document. Readers see either the previous or
    /// the new document, never a partial one.
    pub async fn write_artifact<T: Serialize + ?Sized>(
        &self,
        task_id: &TaskId,
        name: &str,
        document: &T,
    ) -> EvidenceResult<()> {
        let bytes = serde_json::to_vec_pretty(document)?;
        self.write_atomic(task_id, name, &bytes).await
    }

    /// Read the named JSON document, `None` if it does not exist.
    pub async fn read_artifact<T: DeserializeOwned>(
        &self,
        task_id: &TaskId,
        name: &str,
    ) -> EvidenceResult<Option<T>> {
        let path = self.path(task_id, name);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(EvidenceError::io(&path, e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| EvidenceError::Malformed { path, source })
    }

    pub async fn write_text(&self, task_id: &TaskId, name: &str, text: &str) -> EvidenceResult<()> {
        self.write_atomic(task_id, name, text.as_bytes()).await
    }

    /// Append one compact JSON line to `name`.
    pub async fn append_jsonl<T: Serialize>(&self, task_id: &TaskId, name: &str, record: &T) -> EvidenceResult<()> {
        self.ensure(task_id).await?;
        let path = self.path(task_id, name);
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| EvidenceError::io(&path, e))?;
        file.write_all(&line)
            .await
            .map_err(|e| EvidenceError::io(&path, e))
    }

    async fn write_atomic(&self, task_id: &TaskId, name: &str, bytes: &[u8]) -> EvidenceResult<()> {
        let dir = self.ensure(task_id).await?;
        let path = dir.join(name);
        let tmp = dir.join(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4()));

        if let Err(e) = tokio::fs::write(&tmp, bytes).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(EvidenceError::io(&tmp, e));
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(EvidenceError::io(&path, e));
        }
        tracing::debug!(task_id = %task_id, "Wrote {}", path.display());
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Raw tool output
    // ─────────────────────────────────────────────────────────────────────

    /// Read a raw output file written by a tool, `None` if the tool never
    /// created it.
    pub async fn read_raw(&self, task_id: &TaskId, name: &str) -> EvidenceResult<Option<String>> {
        let path = self.path(task_id, name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EvidenceError::io(&path, e)),
        }
    }

    /// Remove a stale raw output file before a tool rewrites it.
    pub async fn remove_raw(&self, task_id: &TaskId, name: &str) -> EvidenceResult<()> {
        let path = self.path(task_id, name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EvidenceError::io(&path, e)),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Listing
    // ─────────────────────────────────────────────────────────────────────

    /// Every task directory under the root that holds a status document.
    pub async fn list_tasks(&self) -> EvidenceResult<Vec<TaskId>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(EvidenceError::io(&self.root, e)),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| EvidenceError::io(&self.root, e))?
        {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let Ok(id) = name.parse::<TaskId>() else {
                continue;
            };
            if self.exists(&id).await {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Every file in the task directory with size and digest, sorted by name.
    /// In-flight temporary files are skipped.
    pub async fn list_files(&self, task_id: &TaskId) -> EvidenceResult<Vec<ArtifactEntry>> {
        let dir = self.task_dir(task_id);
        let walk_dir = dir.clone();

        let listed = tokio::task::spawn_blocking(move || -> EvidenceResult<Vec<ArtifactEntry>> {
            let mut files = Vec::new();
            for entry in WalkDir::new(&walk_dir).min_depth(1) {
                let entry = entry.map_err(|e| {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| walk_dir.clone());
                    EvidenceError::Io {
                        path,
                        source: e.into(),
                    }
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let file_name = entry.file_name().to_string_lossy();
                if file_name.starts_with('.') && file_name.ends_with(".tmp") {
                    continue;
                }

                let path = entry.path().to_path_buf();
                let bytes = std::fs::read(&path).map_err(|e| EvidenceError::io(&path, e))?;
                let name = path
                    .strip_prefix(&walk_dir)
                    .unwrap_or(&path)
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");

                files.push(ArtifactEntry {
                    mime_type: mime_type_for(&name),
                    size_bytes: bytes.len() as u64,
                    sha256: hex::encode(Sha256::digest(&bytes)),
                    name,
                    path,
                });
            }
            files.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(files)
        })
        .await
        .map_err(|e| EvidenceError::io(&dir, io::Error::new(io::ErrorKind::Other, e)))?;

        listed
    }
}

fn mime_type_for(name: &str) -> &'static str {
    match name.rsplit('.').next().unwrap_or_default() {
        "json" => "application/json",
        "jsonl" => "application/x-ndjson",
        "md" => "text/markdown",
        "log" | "txt" => "text/plain",
        "zip" => "application/zip",
        "xml" => "application/xml",
        _ => "application/octet-stream",
    }
}
