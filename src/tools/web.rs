//! Web-facing tools: fingerprinting, crawling, safe probing and WAF detection.

use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{
    arg_str, arg_strings, json_path, parse_json_array_lenient, parse_json_lines, CommandSpec,
    ToolAdapter, ToolContext, ToolId, ToolRun,
};
use crate::evidence::{Endpoint, EndpointSource, EvidenceKind, Finding, Fingerprint, Severity};

// ─────────────────────────────────────────────────────────────────────────────
// httpx
// ─────────────────────────────────────────────────────────────────────────────

/// HTTP service fingerprinting (status, title, technologies).
#[derive(Debug, Default, Clone, Copy)]
pub struct Httpx;

impl Httpx {
    pub async fn fingerprint(&self, ctx: &ToolContext, targets: &[String]) -> ToolRun<Fingerprint> {
        if targets.is_empty() {
            return ToolRun::empty();
        }
        let spec = CommandSpec::new(ctx.binary("httpx"))
            .arg("-u")
            .arg(targets.join(","))
            .args(["-title", "-tech-detect", "-status-code", "-json", "-silent"]);
        let inv = ctx.invoke("httpx", spec).await;
        if inv.failed {
            return ToolRun::empty();
        }

        let fingerprints = parse_json_lines::<Fingerprint>(&inv.stdout)
            .into_iter()
            .filter(|fp| !fp.url.is_empty())
            .collect();
        ToolRun::new(fingerprints, inv.timed_out)
    }
}

#[async_trait]
impl ToolAdapter for Httpx {
    fn id(&self) -> ToolId {
        ToolId::Httpx
    }

    fn description(&self) -> &str {
        "Probe HTTP services and fingerprint status code, title and technology stack."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "targets": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Hosts, host:port pairs or URLs"
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
        let run = self.fingerprint(ctx, &targets).await;
        let findings = run
            .records
            .iter()
            .map(|fp| {
                let status = fp
                    .status_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "?".to_string());
                Finding::new(
                    &fp.url,
                    "HTTP Service",
                    Severity::Info,
                    EvidenceKind::ToolOutput,
                    format!(
                        "status {} | title {} | tech {}",
                        status,
                        fp.title.as_deref().unwrap_or("-"),
                        fp.tech.join(", ")
                    ),
                )
            })
            .collect();
        ctx.persist_findings("httpx", findings, run.timed_out).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// katana
// ─────────────────────────────────────────────────────────────────────────────

/// Crawler used for endpoint discovery.
#[derive(Debug, Default, Clone, Copy)]
pub struct Katana;

impl Katana {
    pub async fn crawl(&self, ctx: &ToolContext, urls: &[String]) -> ToolRun<Endpoint> {
        if urls.is_empty() {
            return ToolRun::empty();
        }
        let spec = CommandSpec::new(ctx.binary("katana"))
            .arg("-u")
            .arg(urls.join(","))
            .args(["-d", "3", "-fl", "-jc", "-jsonl", "-silent"]);
        let inv = ctx.invoke("katana", spec).await;
        if inv.failed {
            return ToolRun::empty();
        }
        ToolRun::new(parse_katana(&inv.stdout), inv.timed_out)
    }
}

/// Endpoints from katana JSONL. Newer releases nest the URL under
/// `request.endpoint`, older ones put `endpoint` or `url` at the top level.
pub(crate) fn parse_katana(stdout: &str) -> Vec<Endpoint> {
    let mut seen = HashSet::new();
    parse_json_lines::<Value>(stdout)
        .iter()
        .filter_map(|record| {
            let url = json_path(record, &["request", "endpoint"])
                .or_else(|| record.get("endpoint"))
                .or_else(|| record.get("url"))
                .and_then(Value::as_str)?;
            let method = json_path(record, &["request", "method"])
                .and_then(Value::as_str)
                .unwrap_or("GET");
            Some(Endpoint {
                url: url.to_string(),
                method: method.to_ascii_uppercase(),
                source: EndpointSource::Crawl,
            })
        })
        .filter(|e| seen.insert((e.method.clone(), e.url.clone())))
        .collect()
}

#[async_trait]
impl ToolAdapter for Katana {
    fn id(&self) -> ToolId {
        ToolId::Katana
    }

    fn description(&self) -> &str {
        "Crawl web applications (depth 3, JavaScript parsing) and list discovered endpoints."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "urls": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Seed URLs"
                }
            },
            "required": ["urls"]
        })
    }

    async fn run(&self, ctx: &ToolContext, args: &Value) -> ToolRun<Finding> {
        let urls = arg_strings(args, "urls");
        if urls.is_empty() {
            return ToolRun::empty();
        }
        let run = self.crawl(ctx, &urls).await;
        let findings = run
            .records
            .iter()
            .map(|e| {
                Finding::new(
                    &e.url,
                    "Discovered Endpoint",
                    Severity::Info,
                    EvidenceKind::ToolOutput,
                    format!("{} {}", e.method, e.url),
                )
            })
            .collect();
        ctx.persist_findings("katana", findings, run.timed_out).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// http_probe
// ─────────────────────────────────────────────────────────────────────────────

/// Result of a header-only request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    /// Literal status line, e.g. `HTTP/1.1 302 Found`
    pub status_line: String,
    pub status_code: Option<u16>,
}

impl ProbeOutcome {
    pub fn parse(stdout: &str) -> Option<Self> {
        let status_line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
        let status_code = status_line
            .starts_with("HTTP/")
            .then(|| status_line.split_whitespace().nth(1))
            .flatten()
            .and_then(|code| code.parse().ok());
        Some(Self {
            status_line: status_line.to_string(),
            status_code,
        })
    }

    /// Success or redirect.
    pub fn is_reachable(&self) -> bool {
        matches!(self.status_code, Some(200..=399))
    }
}

/// Read-only verification: one `HEAD`-style request, no body, no redirects.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpProbe;

impl HttpProbe {
    pub async fn probe(&self, ctx: &ToolContext, url: &str) -> ToolRun<ProbeOutcome> {
        let spec = CommandSpec::new(ctx.binary("curl")).args(["-I", "-s", "--connect-timeout", "5", url]);
        let inv = ctx.invoke("http_probe", spec).await;
        if inv.failed {
            return ToolRun::empty();
        }
        let outcome = ProbeOutcome::parse(&inv.stdout);
        match &outcome {
            Some(o) => ctx.log(format!("{} -> {}", url, o.status_line)).await,
            None => ctx.log(format!("{} -> no response", url)).await,
        }
        ToolRun::new(outcome.into_iter().collect(), inv.timed_out)
    }

    /// Turn a probe outcome into a finding when the target answered with a
    /// success or redirect status. Login pages rank higher.
    pub fn classify(url: &str, outcome: &ProbeOutcome) -> Option<Finding> {
        if !outcome.is_reachable() {
            return None;
        }
        let severity = if url.to_ascii_lowercase().contains("login") {
            Severity::Medium
        } else {
            Severity::Low
        };
        Some(Finding::new(
            url,
            "Potential Sensitive Interface",
            severity,
            EvidenceKind::HttpHeader,
            &outcome.status_line,
        ))
    }
}

#[async_trait]
impl ToolAdapter for HttpProbe {
    fn id(&self) -> ToolId {
        ToolId::HttpProbe
    }

    fn description(&self) -> &str {
        "Send a header-only request to each URL and record the response status line."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "urls": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "URLs to probe"
                }
            },
            "required": ["urls"]
        })
    }

    async fn run(&self, ctx: &ToolContext, args: &Value) -> ToolRun<Finding> {
        let mut urls = arg_strings(args, "urls");
        if let Some(url) = arg_str(args, "url") {
            urls.push(url.to_string());
        }
        if urls.is_empty() {
            return ToolRun::empty();
        }

        let mut findings = Vec::new();
        let mut timed_out = false;
        for url in &urls {
            let run = self.probe(ctx, url).await;
            timed_out |= run.timed_out;
            findings.extend(run.records.iter().filter_map(|o| Self::classify(url, o)));
        }
        ctx.persist_findings("http_probe", findings, timed_out).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// whatweb
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
pub struct WhatWeb;

#[async_trait]
impl ToolAdapter for WhatWeb {
    fn id(&self) -> ToolId {
        ToolId::WhatWeb
    }

    fn description(&self) -> &str {
        "Identify web technologies, CMS and server software of a URL."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "target_url": { "type": "string", "description": "URL to fingerprint" }
            },
            "required": ["target_url"]
        })
    }

    async fn run(&self, ctx: &ToolContext, args: &Value) -> ToolRun<Finding> {
        let Some(target_url) = arg_str(args, "target_url") else {
            return ToolRun::empty();
        };

        // A checked-out whatweb is a ruby script, not a binary.
        let script = ctx.paths.tools_dir.join("whatweb").join("whatweb");
        let spec = if script.is_file() {
            CommandSpec::new("ruby").arg(script.to_string_lossy())
        } else {
            CommandSpec::new("whatweb")
        };

        ctx.clear_raw("whatweb", "json").await;
        let raw = ctx.raw_path("whatweb", "json");
        let spec = spec
            .arg(target_url)
            .arg("--log-json")
            .arg(raw.to_string_lossy());
        let inv = ctx.invoke("whatweb", spec).await;
        if inv.failed {
            return ToolRun::empty();
        }

        let findings = parse_json_array_lenient(&ctx.read_raw("whatweb", "json").await)
            .iter()
            .filter_map(|item| {
                let target = item.get("target").and_then(Value::as_str).unwrap_or(target_url);
                let plugins = item.get("plugins")?.as_object()?;
                let detected: Vec<String> = plugins
                    .iter()
                    .map(|(name, detail)| {
                        match json_path(detail, &["version"])
                            .and_then(Value::as_array)
                            .and_then(|v| v.first())
                            .and_then(Value::as_str)
                        {
                            Some(version) => format!("{} {}", name, version),
                            None => name.clone(),
                        }
                    })
                    .collect();
                Some(Finding::new(
                    target,
                    "Technology Fingerprint",
                    Severity::Info,
                    EvidenceKind::ToolOutput,
                    detected.join(", "),
                ))
            })
            .collect();
        ctx.persist_findings("whatweb", findings, inv.timed_out).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// wafw00f
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
pub struct Wafw00f;

const WAF_DETECTED: &str = "WAF Detected";

#[async_trait]
impl ToolAdapter for Wafw00f {
    fn id(&self) -> ToolId {
        ToolId::Wafw00f
    }

    fn description(&self) -> &str {
        "Detect web application firewalls in front of a URL."
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

        ctx.clear_raw("wafw00f", "json").await;
        let raw = ctx.raw_path("wafw00f", "json");
        let spec = CommandSpec::new(ctx.binary("wafw00f"))
            .args([target_url, "-o"])
            .arg(raw.to_string_lossy());
        let inv = ctx.invoke("wafw00f", spec).await;
        if inv.failed {
            return ToolRun::empty();
        }

        let findings = parse_json_array_lenient(&ctx.read_raw("wafw00f", "json").await)
            .iter()
            .map(|item| {
                let url = item.get("url").and_then(Value::as_str).unwrap_or(target_url);
                let detected = item.get("detected").and_then(Value::as_bool).unwrap_or(false);
                let firewall = item.get("firewall").and_then(Value::as_str).unwrap_or("None");
                let manufacturer = item
                    .get("manufacturer")
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown");
                let classification = if detected { WAF_DETECTED } else { "No WAF Detected" };
                Finding::new(
                    url,
                    classification,
                    Severity::Info,
                    EvidenceKind::ToolOutput,
                    format!("{} ({})", firewall, manufacturer),
                )
            })
            .collect();
        ctx.persist_findings("wafw00f", findings, inv.timed_out).await
    }

    fn summarize(&self, run: &ToolRun<Finding>) -> String {
        match run.records.iter().find(|f| f.classification == WAF_DETECTED) {
            Some(f) => format!("wafw00f detected a WAF: {}", f.evidence.data),
            None => "wafw00f found no WAF".to_string(),
        }
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
    fn test_parse_katana_formats() {
        let out = r#"{"request":{"method":"get","endpoint":"http://t/admin/login.php"}}
{"endpoint":"http://t/api/v1"}
{"url":"http://t/robots.txt"}
{"request":{"method":"GET","endpoint":"http://t/admin/login.php"}}
garbage
"#;
        let endpoints = parse_katana(out);
        let urls: Vec<&str> = endpoints.iter().map(|e| e.url.as_str()).collect();
        assert_eq!(urls, vec!["http://t/admin/login.php", "http://t/api/v1", "http://t/robots.txt"]);
        assert_eq!(endpoints[0].method, "GET");
        assert!(endpoints.iter().all(|e| e.source == EndpointSource::Crawl));
    }

    #[test]
    fn test_probe_classification() {
        let ok = ProbeOutcome::parse("\r\nHTTP/1.1 200 OK\r\nServer: nginx\r\n").unwrap();
        assert_eq!(ok.status_line, "HTTP/1.1 200 OK");
        let finding = HttpProbe::classify("http://t/Login.php", &ok).unwrap();
        assert_eq!(finding.severity, Severity::Medium);
        assert_eq!(finding.evidence.kind, EvidenceKind::HttpHeader);
        assert_eq!(finding.evidence.data, "HTTP/1.1 200 OK");

        let redirect = ProbeOutcome::parse("HTTP/2 302\r\nlocation: /x").unwrap();
        assert_eq!(
            HttpProbe::classify("http://t/admin", &redirect).unwrap().severity,
            Severity::Low
        );

        let missing = ProbeOutcome::parse("HTTP/1.1 404 Not Found").unwrap();
        assert!(HttpProbe::classify("http://t/admin", &missing).is_none());
        assert!(ProbeOutcome::parse("").is_none());
    }

    #[tokio::test]
    async fn test_httpx_parses_stdout() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(FakeRunner::stdout(
            "{\"url\":\"http://127.0.0.1\",\"status_code\":200,\"tech\":[\"nginx\"]}\n{\"input\":\"x\"}\n",
        ));
        let ctx = context(dir.path(), runner.clone());

        let run = Httpx
            .fingerprint(&ctx, &["127.0.0.1".to_string(), "127.0.0.1:8080".to_string()])
            .await;
        assert_eq!(run.records.len(), 1);
        assert_eq!(
            flag_value(&runner.calls.lock().unwrap()[0].0, "-u"),
            Some("127.0.0.1,127.0.0.1:8080")
        );
    }

    #[tokio::test]
    async fn test_probe_logs_status_line() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path(), Arc::new(FakeRunner::stdout("HTTP/1.1 302 Found\r\n")));
        let run = HttpProbe
            .run(&ctx, &json!({"urls": ["http://t/admin/login.php"]}))
            .await;
        assert_eq!(run.records.len(), 1);
        assert!(log_text(&ctx).contains("http://t/admin/login.php -> HTTP/1.1 302 Found"));
    }

    #[tokio::test]
    async fn test_wafw00f_summary() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new(|spec| {
            std::fs::write(
                flag_value(spec, "-o").unwrap(),
                r#"[{"url":"https://t","detected":true,"firewall":"Cloudflare","manufacturer":"Cloudflare Inc."}]"#,
            )
            .unwrap();
            ProcessOutput::default()
        }));
        let ctx = context(dir.path(), runner);
        let run = Wafw00f.run(&ctx, &json!({"target_url": "https://t"})).await;
        assert_eq!(run.records.len(), 1);
        assert_eq!(
            Wafw00f.summarize(&run),
            "wafw00f detected a WAF: Cloudflare (Cloudflare Inc.)"
        );
    }
}
