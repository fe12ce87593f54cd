//! Passive reconnaissance: subdomains, DNS resolution and historical URLs.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{
    arg_str, arg_strings, parse_json_lines, CommandSpec, ToolAdapter, ToolContext, ToolId, ToolRun,
};
use crate::evidence::{EvidenceKind, Finding, Severity};

fn str_field<'a>(record: &'a Value, key: &str) -> Option<&'a str> {
    record.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn joined(record: &Value, key: &str) -> String {
    record
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_default()
}

/// Run a tool that writes JSONL to `{tool}_raw.jsonl` and map each record.
async fn run_jsonl_tool<F>(
    ctx: &ToolContext,
    tool: &str,
    spec: CommandSpec,
    map: F,
) -> ToolRun<Finding>
where
    F: Fn(&Value) -> Option<Finding>,
{
    let inv = ctx.invoke(tool, spec).await;
    if inv.failed {
        return ToolRun::empty();
    }
    let findings = parse_json_lines::<Value>(&ctx.read_raw(tool, "jsonl").await)
        .iter()
        .filter_map(map)
        .collect();
    ctx.persist_findings(tool, findings, inv.timed_out).await
}

fn domain_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "target_domain": { "type": "string", "description": "Registered domain, e.g. example.com" }
        },
        "required": ["target_domain"]
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// subfinder
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
pub struct Subfinder;

#[async_trait]
impl ToolAdapter for Subfinder {
    fn id(&self) -> ToolId {
        ToolId::Subfinder
    }

    fn description(&self) -> &str {
        "Enumerate subdomains from passive sources."
    }

    fn parameters_schema(&self) -> Value {
        domain_schema()
    }

    async fn run(&self, ctx: &ToolContext, args: &Value) -> ToolRun<Finding> {
        let Some(domain) = arg_str(args, "target_domain") else {
            return ToolRun::empty();
        };
        ctx.clear_raw("subfinder", "jsonl").await;
        let spec = CommandSpec::new(ctx.binary("subfinder"))
            .args(["-d", domain, "-silent", "-j", "-o"])
            .arg(ctx.raw_path("subfinder", "jsonl").to_string_lossy());

        run_jsonl_tool(ctx, "subfinder", spec, |r| {
            let host = str_field(r, "host")?;
            Some(Finding::new(
                host,
                "Subdomain",
                Severity::Info,
                EvidenceKind::ToolOutput,
                format!("source: {}", str_field(r, "source").unwrap_or("unknown")),
            ))
        })
        .await
    }

    fn summarize(&self, run: &ToolRun<Finding>) -> String {
        format!("subfinder found {} subdomains", run.records.len())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// amass
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
pub struct Amass;

#[async_trait]
impl ToolAdapter for Amass {
    fn id(&self) -> ToolId {
        ToolId::Amass
    }

    fn description(&self) -> &str {
        "Passive attack-surface mapping of a domain."
    }

    fn parameters_schema(&self) -> Value {
        domain_schema()
    }

    async fn run(&self, ctx: &ToolContext, args: &Value) -> ToolRun<Finding> {
        let Some(domain) = arg_str(args, "target_domain") else {
            return ToolRun::empty();
        };
        ctx.clear_raw("amass", "jsonl").await;
        let spec = CommandSpec::new(ctx.binary("amass"))
            .args(["enum", "-passive", "-d", domain, "-json"])
            .arg(ctx.raw_path("amass", "jsonl").to_string_lossy());

        run_jsonl_tool(ctx, "amass", spec, |r| {
            let name = str_field(r, "name")?;
            Some(Finding::new(
                name,
                "Subdomain",
                Severity::Info,
                EvidenceKind::ToolOutput,
                format!(
                    "domain: {}; sources: {}",
                    str_field(r, "domain").unwrap_or("-"),
                    joined(r, "sources")
                ),
            ))
        })
        .await
    }

    fn summarize(&self, run: &ToolRun<Finding>) -> String {
        format!("amass found {} related assets", run.records.len())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// dnsx
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
pub struct Dnsx;

#[async_trait]
impl ToolAdapter for Dnsx {
    fn id(&self) -> ToolId {
        ToolId::Dnsx
    }

    fn description(&self) -> &str {
        "Resolve a list of subdomains and keep the ones that are alive."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "subdomains": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Host names to resolve"
                }
            },
            "required": ["subdomains"]
        })
    }

    async fn run(&self, ctx: &ToolContext, args: &Value) -> ToolRun<Finding> {
        let subdomains = arg_strings(args, "subdomains");
        if subdomains.is_empty() {
            return ToolRun::empty();
        }

        let input = "dnsx_input.txt";
        if let Err(e) = ctx
            .store
            .write_text(&ctx.task_id, input, &subdomains.join("\n"))
            .await
        {
            ctx.log(format!("Could not write dnsx input list: {}", e)).await;
            return ToolRun::empty();
        }

        ctx.clear_raw("dnsx", "jsonl").await;
        let spec = CommandSpec::new(ctx.binary("dnsx"))
            .arg("-l")
            .arg(ctx.store.path(&ctx.task_id, input).to_string_lossy())
            .args(["-silent", "-json", "-a", "-o"])
            .arg(ctx.raw_path("dnsx", "jsonl").to_string_lossy());

        run_jsonl_tool(ctx, "dnsx", spec, |r| {
            let host = str_field(r, "host")?;
            let mut evidence = format!("A: {}", joined(r, "a"));
            let cname = joined(r, "cname");
            if !cname.is_empty() {
                evidence.push_str(&format!("; CNAME: {}", cname));
            }
            Some(Finding::new(
                host,
                "Resolved Host",
                Severity::Info,
                EvidenceKind::ToolOutput,
                evidence,
            ))
        })
        .await
    }

    fn summarize(&self, run: &ToolRun<Finding>) -> String {
        format!("dnsx confirmed {} live records", run.records.len())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// gau
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
pub struct Gau;

#[async_trait]
impl ToolAdapter for Gau {
    fn id(&self) -> ToolId {
        ToolId::Gau
    }

    fn description(&self) -> &str {
        "Fetch known historical URLs of a domain from public archives."
    }

    fn parameters_schema(&self) -> Value {
        domain_schema()
    }

    async fn run(&self, ctx: &ToolContext, args: &Value) -> ToolRun<Finding> {
        let Some(domain) = arg_str(args, "target_domain") else {
            return ToolRun::empty();
        };
        ctx.clear_raw("gau", "jsonl").await;
        let spec = CommandSpec::new(ctx.binary("gau"))
            .args([domain, "--json", "-o"])
            .arg(ctx.raw_path("gau", "jsonl").to_string_lossy());

        run_jsonl_tool(ctx, "gau", spec, |r| {
            let url = str_field(r, "url")?;
            let method = str_field(r, "method").unwrap_or("GET");
            let status = match r.get("status") {
                Some(Value::Number(n)) => n.to_string(),
                Some(Value::String(s)) if !s.is_empty() => s.clone(),
                _ => "-".to_string(),
            };
            Some(Finding::new(
                url,
                "Historical URL",
                Severity::Info,
                EvidenceKind::ToolOutput,
                format!("{} {} ({})", method, url, status),
            ))
        })
        .await
    }

    fn summarize(&self, run: &ToolRun<Finding>) -> String {
        format!("gau extracted {} historical URLs", run.records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{context, flag_value, FakeRunner};
    use super::*;
    use crate::tools::ProcessOutput;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_subfinder_parses_raw_file() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new(|spec| {
            std::fs::write(
                flag_value(spec, "-o").unwrap(),
                "{\"host\":\"a.example.com\",\"source\":\"crtsh\"}\n{\"host\":\"\"}\nnoise\n",
            )
            .unwrap();
            ProcessOutput::default()
        }));
        let ctx = context(dir.path(), runner);

        let run = Subfinder.run(&ctx, &json!({"target_domain": "example.com"})).await;
        assert_eq!(run.records.len(), 1);
        assert_eq!(run.records[0].target, "a.example.com");
        assert_eq!(run.records[0].evidence.data, "source: crtsh");
    }

    #[tokio::test]
    async fn test_dnsx_writes_input_list() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new(|spec| {
            let input = std::fs::read_to_string(flag_value(spec, "-l").unwrap()).unwrap();
            assert_eq!(input, "a.example.com\nb.example.com");
            std::fs::write(
                flag_value(spec, "-o").unwrap(),
                "{\"host\":\"a.example.com\",\"a\":[\"10.0.0.1\"],\"cname\":[\"edge.cdn.net\"]}\n",
            )
            .unwrap();
            ProcessOutput::default()
        }));
        let ctx = context(dir.path(), runner.clone());

        let run = Dnsx
            .run(&ctx, &json!({"subdomains": "a.example.com, b.example.com"}))
            .await;
        assert_eq!(runner.call_count(), 1);
        assert_eq!(run.records[0].evidence.data, "A: 10.0.0.1; CNAME: edge.cdn.net");
    }

    #[tokio::test]
    async fn test_recon_tools_skip_without_domain() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(FakeRunner::silent());
        let ctx = context(dir.path(), runner.clone());
        for adapter in [&Subfinder as &dyn ToolAdapter, &Amass, &Gau, &Dnsx] {
            assert!(adapter.run(&ctx, &json!({})).await.records.is_empty());
        }
        assert_eq!(runner.call_count(), 0);
    }
}
