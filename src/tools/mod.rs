//! Tools module - wrappers around external security tools.
//!
//! Every adapter follows the same contract:
//! 1. Missing required arguments yield an empty result without invoking anything
//! 2. The executable is looked up in the project tools directory, then on `PATH`
//! 3. The command line is built deterministically and run with no stdin and a
//!    deadline from the [`BudgetGovernor`]
//! 4. Timeouts keep partial output and are logged; other failures are logged
//!    and yield an empty result
//! 5. Output is parsed into [`Finding`]s (malformed lines are skipped) and
//!    persisted as `{tool}_findings.json`

mod content;
mod dispatcher;
mod exploit;
mod ports;
pub mod process;
mod recon;
mod web;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::budget::BudgetGovernor;
use crate::evidence::artifacts::{tool_findings_name, tool_raw_name};
use crate::evidence::{EvidenceStore, Finding, FindingsArtifact};
use crate::task::TaskId;

pub use content::{Arjun, DirScan, Nuclei};
pub use dispatcher::{DispatchError, ToolId, ToolInfo, ToolRegistry, ToolResponse};
pub use exploit::{Hydra, Sqlmap, Trufflehog};
pub use ports::{Masscan, Naabu, Nmap, DEFAULT_PORTS};
pub use process::{CommandSpec, ProcessError, ProcessOutput, ProcessRunner, SystemRunner};
pub use recon::{Amass, Dnsx, Gau, Subfinder};
pub use web::{HttpProbe, Httpx, Katana, ProbeOutcome, Wafw00f, WhatWeb};

/// Records produced by one adapter run.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolRun<T> {
    pub records: Vec<T>,
    /// The invocation hit its deadline; `records` come from partial output
    pub timed_out: bool,
}

impl<T> ToolRun<T> {
    pub fn new(records: Vec<T>, timed_out: bool) -> Self {
        Self { records, timed_out }
    }

    pub fn empty() -> Self {
        Self {
            records: Vec::new(),
            timed_out: false,
        }
    }
}

/// Directories searched for tool binaries and wordlists.
#[derive(Debug, Clone)]
pub struct ToolPaths {
    pub tools_dir: PathBuf,
    pub wordlists_dir: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            tools_dir: PathBuf::from("."),
            wordlists_dir: PathBuf::from("."),
        }
    }
}

/// Prefer a project-local binary (`{tools_dir}/{name}` or
/// `{tools_dir}/{name}/{name}`), otherwise the bare name for `PATH` lookup.
pub fn resolve_binary(tools_dir: &Path, name: &str) -> String {
    let candidates = [tools_dir.join(name), tools_dir.join(name).join(name)];
    candidates
        .into_iter()
        .find(|p| p.is_file())
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string())
}

/// Output of one invocation, already logged.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    /// The process could not be started or waited for
    pub failed: bool,
}

/// Everything an adapter needs for one run against one task.
#[derive(Clone)]
pub struct ToolContext {
    pub task_id: TaskId,
    pub store: EvidenceStore,
    pub governor: BudgetGovernor,
    pub runner: Arc<dyn ProcessRunner>,
    pub paths: Arc<ToolPaths>,
    /// Stage log the adapter writes to, without the `.log` suffix
    pub log_name: String,
    /// Per-call timeout in seconds, wins over the task budget
    pub timeout_override: Option<u64>,
}

impl ToolContext {
    pub fn new(
        task_id: TaskId,
        store: EvidenceStore,
        governor: BudgetGovernor,
        runner: Arc<dyn ProcessRunner>,
        paths: Arc<ToolPaths>,
    ) -> Self {
        let log_name = "tools".to_string();
        Self {
            task_id,
            store,
            governor,
            runner,
            paths,
            log_name,
            timeout_override: None,
        }
    }

    pub fn with_log(mut self, log_name: impl Into<String>) -> Self {
        self.log_name = log_name.into();
        self
    }

    pub fn with_timeout_override(mut self, secs: Option<u64>) -> Self {
        self.timeout_override = secs;
        self
    }

    pub fn binary(&self, name: &str) -> String {
        resolve_binary(&self.paths.tools_dir, name)
    }

    pub fn wordlist(&self, relative: &str) -> PathBuf {
        self.paths.wordlists_dir.join(relative)
    }

    /// Path of a raw output file inside the evidence directory.
    pub fn raw_path(&self, tool: &str, extension: &str) -> PathBuf {
        self.store.path(&self.task_id, &tool_raw_name(tool, extension))
    }

    /// Append to the stage log. Logging problems never fail a tool run.
    pub async fn log(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        if let Err(e) = self
            .store
            .append_log(&self.task_id, &self.log_name, message)
            .await
        {
            tracing::warn!(task_id = %self.task_id, error = %e, "Failed to append stage log");
        }
    }

    /// Run `spec` under the task's deadline. Never fails: problems are
    /// written to the stage log and reported through the flags.
    pub async fn invoke(&self, tool: &str, spec: CommandSpec) -> Invocation {
        let timeout = self
            .governor
            .timeout_for(&self.task_id, self.timeout_override)
            .await;

        self.log(format!("Running: {}", spec.display())).await;
        tracing::info!(task_id = %self.task_id, tool, timeout_secs = timeout.as_secs(), "Invoking tool");

        match self.runner.run(&spec, timeout).await {
            Ok(output) => {
                if output.timed_out {
                    self.log(format!(
                        "TIMEOUT: {} exceeded {}s; kept {} bytes of partial output",
                        tool,
                        timeout.as_secs(),
                        output.stdout.len() + output.stderr.len()
                    ))
                    .await;
                    tracing::warn!(task_id = %self.task_id, tool, "Tool timed out");
                } else if let Some(code) = output.exit_code.filter(|c| *c != 0) {
                    self.log(format!("{} exited with code {}", tool, code)).await;
                }
                Invocation {
                    stdout: output.stdout,
                    stderr: output.stderr,
                    timed_out: output.timed_out,
                    failed: false,
                }
            }
            Err(e) => {
                self.log(format!("ERROR: {}", e)).await;
                tracing::warn!(task_id = %self.task_id, tool, error = %e, "Tool invocation failed");
                Invocation {
                    failed: true,
                    ..Invocation::default()
                }
            }
        }
    }

    /// Read a raw output file the tool was told to write. A missing file
    /// reads as empty.
    pub async fn read_raw(&self, tool: &str, extension: &str) -> String {
        let name = tool_raw_name(tool, extension);
        match self.store.read_raw(&self.task_id, &name).await {
            Ok(content) => content.unwrap_or_default(),
            Err(e) => {
                self.log(format!("Could not read {}: {}", name, e)).await;
                String::new()
            }
        }
    }

    /// Keep captured stdout as `{tool}_raw.{extension}` for tools that print
    /// their results instead of writing a file.
    pub async fn save_raw(&self, tool: &str, extension: &str, text: &str) {
        let name = tool_raw_name(tool, extension);
        if let Err(e) = self.store.write_text(&self.task_id, &name, text).await {
            self.log(format!("Could not save {}: {}", name, e)).await;
        }
    }

    /// Remove a raw output file left over from an earlier run.
    pub async fn clear_raw(&self, tool: &str, extension: &str) {
        let name = tool_raw_name(tool, extension);
        if let Err(e) = self.store.remove_raw(&self.task_id, &name).await {
            tracing::warn!(task_id = %self.task_id, error = %e, "Failed to clear {}", name);
        }
    }

    /// Persist `{tool}_findings.json` and log the count.
    pub async fn persist_findings(&self, tool: &str, findings: Vec<Finding>, timed_out: bool) -> ToolRun<Finding> {
        let document = FindingsArtifact {
            task_id: self.task_id.clone(),
            findings,
        };
        if let Err(e) = self
            .store
            .write_artifact(&self.task_id, &tool_findings_name(tool), &document)
            .await
        {
            self.log(format!("Failed to persist {} findings: {}", tool, e)).await;
        }
        self.log(format!("{} finished with {} findings", tool, document.findings.len()))
            .await;
        ToolRun::new(document.findings, timed_out)
    }
}

/// Uniform interface implemented by every tool wrapper.
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    fn id(&self) -> ToolId;

    fn description(&self) -> &str;

    /// JSON schema of the arguments accepted by [`ToolAdapter::run`].
    fn parameters_schema(&self) -> Value;

    async fn run(&self, ctx: &ToolContext, args: &Value) -> ToolRun<Finding>;

    /// One-line summary for the dispatch response.
    fn summarize(&self, run: &ToolRun<Finding>) -> String {
        let mut summary = format!("{} produced {} findings", self.id(), run.records.len());
        if run.timed_out {
            summary.push_str(" (timed out, partial output)");
        }
        summary
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Argument and output helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Non-empty trimmed string argument.
pub(crate) fn arg_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// List argument given either as an array of strings or a comma-separated
/// string. Blank entries are dropped.
pub(crate) fn arg_strings(args: &Value, key: &str) -> Vec<String> {
    match args.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

/// Unsigned integer argument, also accepted as a numeric string.
pub(crate) fn arg_u64(args: &Value, key: &str) -> Option<u64> {
    match args.get(key)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Parse line-delimited JSON, skipping blank and malformed lines.
pub(crate) fn parse_json_lines<T: DeserializeOwned>(text: &str) -> Vec<T> {
    text.lines()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

/// Parse a JSON array document. Some tools leave a trailing comma or an
/// unterminated array behind when interrupted, so when the document does not
/// parse as a whole each line is tried as a standalone object.
pub(crate) fn parse_json_array_lenient(text: &str) -> Vec<Value> {
    match serde_json::from_str::<Value>(text.trim()) {
        Ok(Value::Array(items)) => items,
        Ok(other @ Value::Object(_)) => vec![other],
        _ => text
            .lines()
            .map(|line| line.trim().trim_end_matches(',').trim_start_matches('['))
            .filter(|line| line.starts_with('{'))
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect(),
    }
}

/// Walk a JSON value by keys, e.g. `json_path(v, &["info", "name"])`.
pub(crate) fn json_path<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().try_fold(value, |v, k| v.get(*k))
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_arg_helpers() {
        let args = json!({"a": " x ", "b": "", "list": "p, q,,r", "arr": ["m", " ", "n"], "n": "42", "m": 7});
        assert_eq!(arg_str(&args, "a"), Some("x"));
        assert_eq!(arg_str(&args, "b"), None);
        assert_eq!(arg_strings(&args, "list"), vec!["p", "q", "r"]);
        assert_eq!(arg_strings(&args, "arr"), vec!["m", "n"]);
        assert_eq!(arg_u64(&args, "n"), Some(42));
        assert_eq!(arg_u64(&args, "m"), Some(7));
        assert_eq!(arg_u64(&args, "missing"), None);
    }

    #[test]
    fn test_parse_json_lines_skips_garbage() {
        let text = "{\"url\":\"a\"}\nnot json\n{broken\n\n{\"url\":\"b\"}\n";
        let parsed: Vec<Value> = parse_json_lines(text);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1]["url"], "b");
    }

    #[test]
    fn test_lenient_array_parsing() {
        assert_eq!(parse_json_array_lenient("[{\"a\":1},{\"a\":2}]").len(), 2);
        let interrupted = "[\n{\"ip\":\"10.0.0.1\",\"ports\":[]},\n{\"ip\":\"10.0.0.2\",\"ports\":[]},\n";
        let items = parse_json_array_lenient(interrupted);
        assert_eq!(items.len(), 2);
        assert_eq!(items[1]["ip"], "10.0.0.2");
        assert!(parse_json_array_lenient("").is_empty());
    }

    #[test]
    fn test_resolve_binary_prefers_local() {
        let dir = tempdir().unwrap();
        assert_eq!(resolve_binary(dir.path(), "nuclei"), "nuclei");

        std::fs::create_dir_all(dir.path().join("hydra")).unwrap();
        std::fs::write(dir.path().join("hydra/hydra"), "").unwrap();
        std::fs::write(dir.path().join("ffuf"), "").unwrap();
        assert!(resolve_binary(dir.path(), "hydra").ends_with("hydra/hydra"));
        assert!(resolve_binary(dir.path(), "ffuf").ends_with("ffuf"));
        assert_ne!(resolve_binary(dir.path(), "ffuf"), "ffuf");
    }

    #[tokio::test]
    async fn test_invoke_logs_timeout_and_keeps_output() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new(|_| ProcessOutput {
            stdout: "half a line".into(),
            timed_out: true,
            ..ProcessOutput::default()
        }));
        let ctx = context(dir.path(), runner.clone()).with_timeout_override(Some(3));

        let inv = ctx.invoke("nmap", CommandSpec::new("nmap")).await;
        assert!(inv.timed_out);
        assert_eq!(inv.stdout, "half a line");

        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[0].1, Duration::from_secs(3));
        drop(calls);

        let log = log_text(&ctx);
        assert!(log.contains("Running: nmap"));
        assert!(log.contains("TIMEOUT: nmap exceeded 3s"));
    }

    #[tokio::test]
    async fn test_invoke_failure_is_swallowed() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path(), Arc::new(SystemRunner))
            .with_timeout_override(Some(2));
        let inv = ctx
            .invoke("ghost", CommandSpec::new("definitely-not-a-real-tool-xyz"))
            .await;
        assert!(inv.failed);
        assert!(inv.stdout.is_empty());
        assert!(log_text(&ctx).contains("ERROR: Failed to start"));
    }
}
