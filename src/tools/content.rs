//! Content and vulnerability scanners: nuclei, ffuf directory brute force
//! and arjun parameter discovery.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{
    arg_str, arg_strings, json_path, parse_json_lines, CommandSpec, ToolAdapter, ToolContext,
    ToolId, ToolRun,
};
use crate::evidence::{EvidenceKind, Finding, Severity};

// ─────────────────────────────────────────────────────────────────────────────
// nuclei
// ─────────────────────────────────────────────────────────────────────────────

const DEFAULT_TEMPLATES: [&str; 2] = ["cves/", "vulnerabilities/"];

/// Template-based vulnerability scanner.
#[derive(Debug, Default, Clone, Copy)]
pub struct Nuclei;

fn nuclei_finding(record: &Value) -> Option<Finding> {
    let target = record
        .get("matched-at")
        .or_else(|| record.get("host"))
        .and_then(Value::as_str)?;
    let name = json_path(record, &["info", "name"])
        .and_then(Value::as_str)
        .unwrap_or("Unknown Vuln");
    let severity = json_path(record, &["info", "severity"])
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .unwrap_or(Severity::Info);
    let evidence = record
        .get("extracted-results")
        .and_then(Value::as_array)
        .and_then(|r| r.first())
        .and_then(Value::as_str)
        .or_else(|| record.get("matcher-name").and_then(Value::as_str))
        .or_else(|| record.get("template-id").and_then(Value::as_str))
        .unwrap_or_default();
    Some(Finding::new(target, name, severity, EvidenceKind::ToolOutput, evidence))
}

#[async_trait]
impl ToolAdapter for Nuclei {
    fn id(&self) -> ToolId {
        ToolId::Nuclei
    }

    fn description(&self) -> &str {
        "Run nuclei templates against targets and report matched vulnerabilities."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "targets": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "URLs or hosts to scan"
                },
                "templates": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Template paths (default: cves/, vulnerabilities/)"
                }
            },
            "required": ["targets"]
        })
    }

    async fn run(&self, ctx: &ToolContext, args: &Value) -> ToolRun<Finding> {
        let targets = arg_strings(args, "targets");
        if targets.is_empty() {
            return ToolRun::empty();
        }
        let mut templates = arg_strings(args, "templates");
        if templates.is_empty() {
            templates = DEFAULT_TEMPLATES.iter().map(|t| t.to_string()).collect();
        }
        ctx.log(format!("nuclei request for {} targets", targets.len())).await;

        ctx.clear_raw("nuclei", "jsonl").await;
        let raw = ctx.raw_path("nuclei", "jsonl");
        let mut spec = CommandSpec::new(ctx.binary("nuclei"))
            .arg("-u")
            .arg(targets.join(","))
            .args(["-jsonl", "-silent", "-o"])
            .arg(raw.to_string_lossy());
        for template in &templates {
            spec = spec.arg("-t").arg(template);
        }
        let inv = ctx.invoke("nuclei", spec).await;
        if inv.failed {
            return ToolRun::empty();
        }

        let findings = parse_json_lines::<Value>(&ctx.read_raw("nuclei", "jsonl").await)
            .iter()
            .filter_map(nuclei_finding)
            .collect();
        ctx.persist_findings("nuclei", findings, inv.timed_out).await
    }

    fn summarize(&self, run: &ToolRun<Finding>) -> String {
        format!("nuclei detected {} vulnerabilities", run.records.len())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// dirscan (ffuf)
// ─────────────────────────────────────────────────────────────────────────────

/// Directory and file brute force with ffuf over a SecLists wordlist.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirScan;

pub(crate) fn wordlist_for(kind: &str) -> &'static str {
    match kind.to_ascii_lowercase().as_str() {
        "medium" => "SecLists/Discovery/Web-Content/raft-medium-directories.txt",
        "large" => "SecLists/Discovery/Web-Content/raft-large-directories.txt",
        "api" => "SecLists/Discovery/Web-Content/api/api-endpoints.txt",
        _ => "SecLists/Discovery/Web-Content/raft-small-directories.txt",
    }
}

/// `php,txt` -> `.php,.txt`
fn ffuf_extensions(extensions: &str) -> String {
    extensions
        .split(',')
        .map(|e| e.trim().trim_start_matches('.'))
        .filter(|e| !e.is_empty())
        .map(|e| format!(".{}", e))
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl ToolAdapter for DirScan {
    fn id(&self) -> ToolId {
        ToolId::DirScan
    }

    fn description(&self) -> &str {
        "Brute-force hidden directories and files under a base URL with ffuf."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "target_url": { "type": "string", "description": "Base URL" },
                "extensions": { "type": "string", "description": "Comma-separated extensions (default: php,txt,zip)" },
                "wordlist_type": {
                    "type": "string",
                    "enum": ["small", "medium", "large", "api"],
                    "description": "Wordlist size (default: small)"
                }
            },
            "required": ["target_url"]
        })
    }

    async fn run(&self, ctx: &ToolContext, args: &Value) -> ToolRun<Finding> {
        let Some(target_url) = arg_str(args, "target_url") else {
            return ToolRun::empty();
        };
        let extensions = arg_str(args, "extensions").unwrap_or("php,txt,zip");
        let wordlist_type = arg_str(args, "wordlist_type").unwrap_or("small");

        let wordlist = ctx.wordlist(wordlist_for(wordlist_type));
        if !wordlist.is_file() {
            ctx.log(format!("Wordlist missing: {}", wordlist.display())).await;
            return ToolRun::empty();
        }

        ctx.clear_raw("dirscan", "json").await;
        let raw = ctx.raw_path("dirscan", "json");
        let spec = CommandSpec::new(ctx.binary("ffuf"))
            .arg("-u")
            .arg(format!("{}/FUZZ", target_url.trim_end_matches('/')))
            .arg("-w")
            .arg(wordlist.to_string_lossy())
            .arg("-e")
            .arg(ffuf_extensions(extensions))
            .args(["-mc", "200,301,302,403", "-t", "50", "-o"])
            .arg(raw.to_string_lossy())
            .args(["-of", "json", "-s"]);
        let inv = ctx.invoke("dirscan", spec).await;
        if inv.failed {
            return ToolRun::empty();
        }

        let raw_text = ctx.read_raw("dirscan", "json").await;
        let document: Value = match serde_json::from_str(&raw_text) {
            Ok(v) => v,
            Err(e) => {
                if !raw_text.is_empty() {
                    ctx.log(format!("Could not parse ffuf output: {}", e)).await;
                }
                Value::Null
            }
        };
        let findings = document
            .get("results")
            .and_then(Value::as_array)
            .map(|results| {
                results
                    .iter()
                    .filter_map(|r| {
                        let url = r.get("url").and_then(Value::as_str)?;
                        let status = r.get("status").and_then(Value::as_u64).unwrap_or(0);
                        let length = r.get("length").and_then(Value::as_u64).unwrap_or(0);
                        let severity = if status == 200 { Severity::Low } else { Severity::Info };
                        Some(Finding::new(
                            url,
                            "Discovered Path",
                            severity,
                            EvidenceKind::ToolOutput,
                            format!("HTTP {}, {} bytes", status, length),
                        ))
                    })
                    .collect()
            })
            .unwrap_or_default();
        ctx.persist_findings("dirscan", findings, inv.timed_out).await
    }

    fn summarize(&self, run: &ToolRun<Finding>) -> String {
        format!("dirscan found {} hidden paths", run.records.len())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// arjun
// ─────────────────────────────────────────────────────────────────────────────

/// Hidden HTTP parameter discovery.
#[derive(Debug, Default, Clone, Copy)]
pub struct Arjun;

/// Arjun writes `{url: [params]}`, newer releases `{url: {"params": [...]}}`.
fn arjun_params(entry: &Value) -> Vec<String> {
    let list = match entry {
        Value::Array(items) => Some(items),
        Value::Object(_) => entry.get("params").and_then(Value::as_array),
        _ => None,
    };
    list.map(|items| {
        items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

#[async_trait]
impl ToolAdapter for Arjun {
    fn id(&self) -> ToolId {
        ToolId::Arjun
    }

    fn description(&self) -> &str {
        "Discover hidden query and body parameters accepted by a URL."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "target_url": { "type": "string", "description": "URL to test" }
            },
            "required": ["target_url"]
        })
    }

    async fn run(&self, ctx: &ToolContext, args: &Value) -> ToolRun<Finding> {
        let Some(target_url) = arg_str(args, "target_url") else {
            return ToolRun::empty();
        };

        ctx.clear_raw("arjun", "json").await;
        let raw = ctx.raw_path("arjun", "json");
        let spec = CommandSpec::new(ctx.binary("arjun"))
            .args(["-u", target_url, "-oJ"])
            .arg(raw.to_string_lossy());
        let inv = ctx.invoke("arjun", spec).await;
        if inv.failed {
            return ToolRun::empty();
        }

        let document: Value =
            serde_json::from_str(&ctx.read_raw("arjun", "json").await).unwrap_or(Value::Null);
        let findings = document
            .as_object()
            .map(|map| {
                map.iter()
                    .filter_map(|(url, entry)| {
                        let params = arjun_params(entry);
                        (!params.is_empty()).then(|| {
                            Finding::new(
                                url,
                                "Hidden Parameters",
                                Severity::Low,
                                EvidenceKind::ToolOutput,
                                params.join(", "),
                            )
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        ctx.persist_findings("arjun", findings, inv.timed_out).await
    }

    fn summarize(&self, run: &ToolRun<Finding>) -> String {
        let params: usize = run
            .records
            .iter()
            .map(|f| f.evidence.data.split(", ").count())
            .sum();
        format!("arjun found {} hidden parameters", params)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{context, flag_value, log_text, FakeRunner};
    use super::*;
    use crate::tools::ProcessOutput;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_ffuf_extensions() {
        assert_eq!(ffuf_extensions("php,txt,zip"), ".php,.txt,.zip");
        assert_eq!(ffuf_extensions(".bak, ,old"), ".bak,.old");
    }

    #[tokio::test]
    async fn test_nuclei_default_templates_and_parsing() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new(|spec| {
            std::fs::write(
                flag_value(spec, "-o").unwrap(),
                concat!(
                    r#"{"matched-at":"http://t/.git/config","info":{"name":"Git Config Exposure","severity":"medium"},"matcher-name":"status-200"}"#,
                    "\n{truncated\n",
                    r#"{"host":"http://t","info":{"name":"Tech","severity":"info"},"extracted-results":["nginx/1.25"]}"#,
                    "\n"
                ),
            )
            .unwrap();
            ProcessOutput::default()
        }));
        let ctx = context(dir.path(), runner.clone());

        let run = Nuclei.run(&ctx, &json!({"targets": ["http://t"]})).await;
        assert_eq!(run.records.len(), 2);
        assert_eq!(run.records[0].severity, Severity::Medium);
        assert_eq!(run.records[0].evidence.data, "status-200");
        assert_eq!(run.records[1].evidence.data, "nginx/1.25");

        let calls = runner.calls.lock().unwrap();
        let templates: Vec<&String> = calls[0]
            .0
            .args
            .iter()
            .enumerate()
            .filter(|(i, _)| *i > 0 && calls[0].0.args[i - 1] == "-t")
            .map(|(_, a)| a)
            .collect();
        assert_eq!(templates, vec!["cves/", "vulnerabilities/"]);
    }

    #[tokio::test]
    async fn test_dirscan_requires_wordlist() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(FakeRunner::silent());
        let ctx = context(dir.path(), runner.clone());

        let run = DirScan.run(&ctx, &json!({"target_url": "http://t"})).await;
        assert!(run.records.is_empty());
        assert_eq!(runner.call_count(), 0);
        assert!(log_text(&ctx).contains("Wordlist missing"));
    }

    #[tokio::test]
    async fn test_dirscan_parses_ffuf_results() {
        let dir = tempdir().unwrap();
        let list = dir.path().join("wordlists").join(wordlist_for("api"));
        std::fs::create_dir_all(list.parent().unwrap()).unwrap();
        std::fs::write(&list, "admin\n").unwrap();

        let runner = Arc::new(FakeRunner::new(|spec| {
            std::fs::write(
                flag_value(spec, "-o").unwrap(),
                r#"{"results":[{"url":"http://t/admin","status":200,"length":512},{"url":"http://t/private","status":403,"length":10}]}"#,
            )
            .unwrap();
            ProcessOutput::default()
        }));
        let ctx = context(dir.path(), runner.clone());

        let run = DirScan
            .run(&ctx, &json!({"target_url": "http://t/", "wordlist_type": "API", "extensions": "bak"}))
            .await;
        assert_eq!(run.records.len(), 2);
        assert_eq!(run.records[0].severity, Severity::Low);
        assert_eq!(DirScan.summarize(&run), "dirscan found 2 hidden paths");

        let calls = runner.calls.lock().unwrap();
        assert_eq!(flag_value(&calls[0].0, "-u"), Some("http://t/FUZZ"));
        assert_eq!(flag_value(&calls[0].0, "-e"), Some(".bak"));
    }

    #[tokio::test]
    async fn test_arjun_both_output_shapes() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new(|spec| {
            std::fs::write(
                flag_value(spec, "-oJ").unwrap(),
                r#"{"http://t/a":["id","debug"],"http://t/b":{"params":["token"],"method":"GET"},"http://t/c":[]}"#,
            )
            .unwrap();
            ProcessOutput::default()
        }));
        let ctx = context(dir.path(), runner);
        let run = Arjun.run(&ctx, &json!({"target_url": "http://t/a"})).await;
        assert_eq!(run.records.len(), 2);
        assert_eq!(Arjun.summarize(&run), "arjun found 3 hidden parameters");
    }
}
