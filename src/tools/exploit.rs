//! Intrusive checks: SQL injection, credential brute force and secret
//! scanning. Only reachable through ad hoc dispatch, never from the pipeline.

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};

use super::{
    arg_str, arg_u64, json_path, parse_json_lines, CommandSpec, ToolAdapter, ToolContext, ToolId,
    ToolRun,
};
use crate::evidence::{EvidenceKind, Finding, Severity};

// ─────────────────────────────────────────────────────────────────────────────
// sqlmap
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
pub struct Sqlmap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SqlmapVerdict {
    pub vulnerable: bool,
    pub databases: Vec<String>,
}

pub(crate) fn parse_sqlmap(output: &str) -> SqlmapVerdict {
    let vulnerable = output.contains("sqlmap identified the following injection point(s)")
        || output.contains("is vulnerable");

    let mut databases = Vec::new();
    if let Some((_, listing)) = output.split_once("available databases") {
        if let Ok(re) = Regex::new(r"\[\*\]\s([A-Za-z0-9_\-]+)") {
            databases = re
                .captures_iter(listing)
                .map(|c| c[1].to_string())
                .filter(|db| !matches!(db.as_str(), "starting" | "shutting" | "ending"))
                .collect();
        }
    }

    SqlmapVerdict {
        vulnerable: vulnerable || !databases.is_empty(),
        databases,
    }
}

#[async_trait]
impl ToolAdapter for Sqlmap {
    fn id(&self) -> ToolId {
        ToolId::Sqlmap
    }

    fn description(&self) -> &str {
        "Test a URL for SQL injection and enumerate databases when injectable."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "target_url": { "type": "string", "description": "URL with the parameter to test" },
                "risk_level": { "type": "integer", "minimum": 1, "description": "Test level/risk (default: 1)" }
            },
            "required": ["target_url"]
        })
    }

    async fn run(&self, ctx: &ToolContext, args: &Value) -> ToolRun<Finding> {
        let Some(target_url) = arg_str(args, "target_url") else {
            return ToolRun::empty();
        };
        let risk = arg_u64(args, "risk_level").unwrap_or(1).max(1);

        let spec = CommandSpec::new(ctx.binary("sqlmap"))
            .args(["-u", target_url, "--batch", "--dbs"])
            .arg(format!("--level={}", risk.min(5)))
            .arg(format!("--risk={}", risk.min(3)));
        let inv = ctx.invoke("sqlmap", spec).await;
        if inv.failed {
            return ToolRun::empty();
        }
        ctx.save_raw("sqlmap", "txt", &inv.stdout).await;

        let verdict = parse_sqlmap(&inv.stdout);
        let mut findings = Vec::new();
        if verdict.vulnerable {
            let (severity, evidence) = if verdict.databases.is_empty() {
                (Severity::High, "Injection point identified".to_string())
            } else {
                (
                    Severity::Critical,
                    format!("Extracted databases: {}", verdict.databases.join(", ")),
                )
            };
            findings.push(Finding::new(
                target_url,
                "SQL Injection",
                severity,
                EvidenceKind::ToolOutput,
                evidence,
            ));
        }
        ctx.persist_findings("sqlmap", findings, inv.timed_out).await
    }

    fn summarize(&self, run: &ToolRun<Finding>) -> String {
        format!("sqlmap finished, vulnerable: {}", !run.records.is_empty())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// hydra
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
pub struct Hydra;

pub(crate) fn default_port(service: &str) -> u16 {
    match service.to_ascii_lowercase().as_str() {
        "ftp" => 21,
        "telnet" => 23,
        "smtp" => 25,
        "http-get" | "http-post-form" | "http-get-form" => 80,
        "pop3" => 110,
        "imap" => 143,
        "smb" => 445,
        "mssql" => 1433,
        "mysql" => 3306,
        "rdp" => 3389,
        "postgres" => 5432,
        "vnc" => 5900,
        "redis" => 6379,
        _ => 22,
    }
}

/// `(host, login, password)` triples from hydra's success lines.
pub(crate) fn parse_hydra(output: &str) -> Vec<(String, String, String)> {
    let Ok(re) = Regex::new(r"(?i)host:\s*(\S+)\s+login:\s*(\S+)\s+password:\s*(\S+)") else {
        return Vec::new();
    };
    re.captures_iter(output)
        .map(|c| (c[1].to_string(), c[2].to_string(), c[3].to_string()))
        .collect()
}

#[async_trait]
impl ToolAdapter for Hydra {
    fn id(&self) -> ToolId {
        ToolId::Hydra
    }

    fn description(&self) -> &str {
        "Brute-force weak credentials of a network service using users.txt and pass.txt."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "target_ip": { "type": "string", "description": "Service host" },
                "service": { "type": "string", "description": "hydra service module, e.g. ssh, ftp, mysql" },
                "port": { "type": "integer", "description": "Service port (default: by service)" }
            },
            "required": ["target_ip", "service"]
        })
    }

    async fn run(&self, ctx: &ToolContext, args: &Value) -> ToolRun<Finding> {
        let (Some(target_ip), Some(service)) = (arg_str(args, "target_ip"), arg_str(args, "service"))
        else {
            return ToolRun::empty();
        };
        let port = arg_u64(args, "port")
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or_else(|| default_port(service));

        let users = ctx.wordlist("users.txt");
        let passwords = ctx.wordlist("pass.txt");
        if !users.is_file() || !passwords.is_file() {
            ctx.log(format!(
                "Dictionaries missing: expected {} and {}",
                users.display(),
                passwords.display()
            ))
            .await;
            return ToolRun::empty();
        }

        let spec = CommandSpec::new(ctx.binary("hydra"))
            .arg("-L")
            .arg(users.to_string_lossy())
            .arg("-P")
            .arg(passwords.to_string_lossy())
            .arg("-s")
            .arg(port.to_string())
            .args(["-f", "-t", "4", target_ip, service]);
        let inv = ctx.invoke("hydra", spec).await;
        if inv.failed {
            return ToolRun::empty();
        }
        ctx.save_raw("hydra", "txt", &inv.stdout).await;

        let findings: Vec<Finding> = parse_hydra(&inv.stdout)
            .into_iter()
            .map(|(host, login, password)| {
                Finding::new(
                    format!("{}:{}", host, port),
                    format!("Weak Credential ({})", service),
                    Severity::Critical,
                    EvidenceKind::Credential,
                    format!("login: {} password: {}", login, password),
                )
            })
            .collect();
        if findings.is_empty() {
            ctx.log("No weak credentials found").await;
        }
        ctx.persist_findings("hydra", findings, inv.timed_out).await
    }

    fn summarize(&self, run: &ToolRun<Finding>) -> String {
        format!(
            "hydra finished, cracked: {} ({} credentials)",
            !run.records.is_empty(),
            run.records.len()
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// trufflehog
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
pub struct Trufflehog;

fn trufflehog_finding(repo: &str, record: &Value) -> Finding {
    let detector = record
        .get("DetectorName")
        .and_then(Value::as_str)
        .unwrap_or("Unknown");
    let git = json_path(record, &["SourceMetadata", "Data", "Git"]);
    let file = git
        .and_then(|g| g.get("file"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let commit = git
        .and_then(|g| g.get("commit"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let redacted = record.get("Redacted").and_then(Value::as_str).unwrap_or_default();

    let target = if file.is_empty() {
        repo.to_string()
    } else {
        format!("{}:{}", repo, file)
    };
    Finding::new(
        target,
        format!("Leaked Secret ({})", detector),
        Severity::High,
        EvidenceKind::Credential,
        format!("{} @ {}", redacted, commit),
    )
}

#[async_trait]
impl ToolAdapter for Trufflehog {
    fn id(&self) -> ToolId {
        ToolId::Trufflehog
    }

    fn description(&self) -> &str {
        "Scan a git repository history for leaked credentials."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "target_url": { "type": "string", "description": "Git repository URL" }
            },
            "required": ["target_url"]
        })
    }

    async fn run(&self, ctx: &ToolContext, args: &Value) -> ToolRun<Finding> {
        let Some(target_url) = arg_str(args, "target_url") else {
            return ToolRun::empty();
        };

        let spec = CommandSpec::new(ctx.binary("trufflehog")).args(["git", target_url, "--json"]);
        let inv = ctx.invoke("trufflehog", spec).await;
        if inv.failed {
            return ToolRun::empty();
        }
        ctx.save_raw("trufflehog", "jsonl", &inv.stdout).await;

        let findings = parse_json_lines::<Value>(&inv.stdout)
            .iter()
            .map(|r| trufflehog_finding(target_url, r))
            .collect();
        ctx.persist_findings("trufflehog", findings, inv.timed_out).await
    }

    fn summarize(&self, run: &ToolRun<Finding>) -> String {
        format!("trufflehog found {} leaked credentials", run.records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{context, log_text, FakeRunner};
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_parse_sqlmap_databases() {
        let out = "\
[12:00:01] [INFO] GET parameter 'id' is vulnerable.
sqlmap identified the following injection point(s) with a total of 42 HTTP(s) requests:
available databases [2]:
[*] information_schema
[*] shop
[*] ending @ 12:00:09
";
        let verdict = parse_sqlmap(out);
        assert!(verdict.vulnerable);
        assert_eq!(verdict.databases, vec!["information_schema", "shop"]);

        let clean = parse_sqlmap("[*] starting @ 12:00:00\nall tested parameters do not appear to be injectable");
        assert!(!clean.vulnerable);
        assert!(clean.databases.is_empty());
    }

    #[test]
    fn test_parse_hydra_success_lines() {
        let out = "[22][ssh] host: 10.0.0.5   login: root   password: toor\n[STATUS] attack finished";
        assert_eq!(
            parse_hydra(out),
            vec![("10.0.0.5".to_string(), "root".to_string(), "toor".to_string())]
        );
        assert_eq!(default_port("MySQL"), 3306);
        assert_eq!(default_port("ssh"), 22);
    }

    #[tokio::test]
    async fn test_hydra_requires_dictionaries() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(FakeRunner::silent());
        let ctx = context(dir.path(), runner.clone());

        let run = Hydra
            .run(&ctx, &json!({"target_ip": "10.0.0.5", "service": "ssh"}))
            .await;
        assert!(run.records.is_empty());
        assert_eq!(runner.call_count(), 0);
        assert!(log_text(&ctx).contains("Dictionaries missing"));
    }

    #[tokio::test]
    async fn test_hydra_reports_credentials() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("wordlists")).unwrap();
        std::fs::write(dir.path().join("wordlists/users.txt"), "root\n").unwrap();
        std::fs::write(dir.path().join("wordlists/pass.txt"), "toor\n").unwrap();
        let runner = Arc::new(FakeRunner::stdout(
            "[3306][mysql] host: 10.0.0.5   login: root   password: toor\n",
        ));
        let ctx = context(dir.path(), runner.clone());

        let run = Hydra
            .run(&ctx, &json!({"target_ip": "10.0.0.5", "service": "mysql"}))
            .await;
        assert_eq!(run.records.len(), 1);
        assert_eq!(run.records[0].target, "10.0.0.5:3306");
        assert_eq!(run.records[0].severity, Severity::Critical);
        assert!(Hydra.summarize(&run).contains("cracked: true"));
        assert!(dir.path().join("t_7e570000/hydra_raw.txt").exists());
    }

    #[tokio::test]
    async fn test_sqlmap_level_and_risk_are_capped() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(FakeRunner::silent());
        let ctx = context(dir.path(), runner.clone());

        let run = Sqlmap
            .run(&ctx, &json!({"target_url": "http://t/item?id=1", "risk_level": 9}))
            .await;
        assert!(run.records.is_empty());
        let args = runner.calls.lock().unwrap()[0].0.args.clone();
        assert!(args.contains(&"--level=5".to_string()));
        assert!(args.contains(&"--risk=3".to_string()));
        assert_eq!(Sqlmap.summarize(&run), "sqlmap finished, vulnerable: false");
    }

    #[test]
    fn test_trufflehog_record_mapping() {
        let record = json!({
            "DetectorName": "AWS",
            "Redacted": "AKIA****",
            "SourceMetadata": {"Data": {"Git": {"file": "config.py", "commit": "abc123"}}}
        });
        let finding = trufflehog_finding("https://git/repo", &record);
        assert_eq!(finding.target, "https://git/repo:config.py");
        assert_eq!(finding.classification, "Leaked Secret (AWS)");
        assert_eq!(finding.evidence.data, "AKIA**** @ abc123");
    }
}
