//! Port discovery: nmap, naabu and masscan.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{
    arg_str, arg_u64, parse_json_array_lenient, parse_json_lines, CommandSpec, ToolAdapter,
    ToolContext, ToolId, ToolRun,
};
use crate::evidence::{EvidenceKind, Finding, OpenPort, Severity};

pub const DEFAULT_PORTS: &str = "80,443,8080";

fn open_port_finding(host: &str, port: u16, protocol: &str, service: &str) -> Finding {
    Finding::new(
        format!("{}:{}", host, port),
        "Open Port",
        Severity::Info,
        EvidenceKind::ToolOutput,
        format!("{}/{} open {}", port, protocol, service),
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// nmap
// ─────────────────────────────────────────────────────────────────────────────

/// Service/version scan of a fixed port list.
#[derive(Debug, Default, Clone, Copy)]
pub struct Nmap;

impl Nmap {
    pub async fn scan(&self, ctx: &ToolContext, target: &str, ports: &str) -> ToolRun<OpenPort> {
        let spec = CommandSpec::new(ctx.binary("nmap")).args(["-sV", "-p", ports, target]);
        let inv = ctx.invoke("nmap", spec).await;
        if inv.failed {
            return ToolRun::empty();
        }
        ToolRun::new(parse_nmap(&inv.stdout), inv.timed_out)
    }
}

/// Extract `80/tcp open http` rows from nmap's normal output.
pub(crate) fn parse_nmap(stdout: &str) -> Vec<OpenPort> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            let (port, protocol) = tokens.next()?.split_once('/')?;
            let port: u16 = port.parse().ok()?;
            if tokens.next()? != "open" {
                return None;
            }
            Some(OpenPort {
                port,
                protocol: protocol.to_string(),
                service: tokens.next().unwrap_or("unknown").to_string(),
            })
        })
        .collect()
}

#[async_trait]
impl ToolAdapter for Nmap {
    fn id(&self) -> ToolId {
        ToolId::Nmap
    }

    fn description(&self) -> &str {
        "Scan a host for open ports and identify the services behind them."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "target": { "type": "string", "description": "Host name or IP address" },
                "ports": { "type": "string", "description": "Port list (default: 80,443,8080)" }
            },
            "required": ["target"]
        })
    }

    async fn run(&self, ctx: &ToolContext, args: &Value) -> ToolRun<Finding> {
        let Some(target) = arg_str(args, "target") else {
            return ToolRun::empty();
        };
        let ports = arg_str(args, "ports").unwrap_or(DEFAULT_PORTS);

        let run = self.scan(ctx, target, ports).await;
        let findings = run
            .records
            .iter()
            .map(|p| open_port_finding(target, p.port, &p.protocol, &p.service))
            .collect();
        ctx.persist_findings("nmap", findings, run.timed_out).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// naabu
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
pub struct Naabu;

#[async_trait]
impl ToolAdapter for Naabu {
    fn id(&self) -> ToolId {
        ToolId::Naabu
    }

    fn description(&self) -> &str {
        "Fast SYN/CONNECT port scan of a host."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "target": { "type": "string", "description": "Host name or IP address" }
            },
            "required": ["target"]
        })
    }

    async fn run(&self, ctx: &ToolContext, args: &Value) -> ToolRun<Finding> {
        let Some(target) = arg_str(args, "target") else {
            return ToolRun::empty();
        };

        ctx.clear_raw("naabu", "jsonl").await;
        let raw = ctx.raw_path("naabu", "jsonl");
        let spec = CommandSpec::new(ctx.binary("naabu"))
            .args(["-host", target, "-json", "-o"])
            .arg(raw.to_string_lossy());
        let inv = ctx.invoke("naabu", spec).await;
        if inv.failed {
            return ToolRun::empty();
        }

        let records: Vec<Value> = parse_json_lines(&ctx.read_raw("naabu", "jsonl").await);
        let findings = records
            .iter()
            .filter_map(|r| {
                let port = r.get("port").and_then(Value::as_u64)?;
                let host = r
                    .get("host")
                    .or_else(|| r.get("ip"))
                    .and_then(Value::as_str)
                    .unwrap_or(target);
                let protocol = r.get("protocol").and_then(Value::as_str).unwrap_or("tcp");
                Some(open_port_finding(host, port as u16, protocol, "unknown"))
            })
            .collect();
        ctx.persist_findings("naabu", findings, inv.timed_out).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// masscan
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
pub struct Masscan;

#[async_trait]
impl ToolAdapter for Masscan {
    fn id(&self) -> ToolId {
        ToolId::Masscan
    }

    fn description(&self) -> &str {
        "Asynchronous full-range port sweep of an IP address."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "target_ip": { "type": "string", "description": "IP address or CIDR range" },
                "ports": { "type": "string", "description": "Port range (default: 1-65535)" },
                "rate": { "type": "integer", "description": "Packets per second (default: 1000)" }
            },
            "required": ["target_ip"]
        })
    }

    async fn run(&self, ctx: &ToolContext, args: &Value) -> ToolRun<Finding> {
        let Some(target_ip) = arg_str(args, "target_ip") else {
            return ToolRun::empty();
        };
        let ports = arg_str(args, "ports").unwrap_or("1-65535");
        let rate = arg_u64(args, "rate").filter(|r| *r > 0).unwrap_or(1000);

        ctx.clear_raw("masscan", "json").await;
        let raw = ctx.raw_path("masscan", "json");
        let spec = CommandSpec::new(ctx.binary("masscan"))
            .args([target_ip, "-p", ports, "--rate"])
            .arg(rate.to_string())
            .arg("-oJ")
            .arg(raw.to_string_lossy());
        let inv = ctx.invoke("masscan", spec).await;
        if inv.failed {
            return ToolRun::empty();
        }

        let mut findings = Vec::new();
        for item in parse_json_array_lenient(&ctx.read_raw("masscan", "json").await) {
            let ip = item.get("ip").and_then(Value::as_str).unwrap_or(target_ip);
            let ports = item.get("ports").and_then(Value::as_array).cloned().unwrap_or_default();
            for port in ports {
                let Some(number) = port.get("port").and_then(Value::as_u64) else {
                    continue;
                };
                let proto = port.get("proto").and_then(Value::as_str).unwrap_or("tcp");
                let status = port.get("status").and_then(Value::as_str).unwrap_or("open");
                findings.push(open_port_finding(ip, number as u16, proto, status));
            }
        }
        ctx.persist_findings("masscan", findings, inv.timed_out).await
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{context, flag_value, FakeRunner};
    use super::*;
    use crate::tools::ProcessOutput;
    use std::sync::Arc;
    use tempfile::tempdir;

    const NMAP_OUTPUT: &str = "\
Starting Nmap 7.94 ( https://nmap.org )
Nmap scan report for 127.0.0.1
PORT     STATE  SERVICE VERSION
80/tcp   open   http    nginx 1.25.3
443/tcp  closed https
8080/tcp open   http-proxy
Service detection performed.
";

    #[test]
    fn test_parse_nmap_open_ports_only() {
        let ports = parse_nmap(NMAP_OUTPUT);
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].port, 80);
        assert_eq!(ports[0].service, "http");
        assert_eq!(ports[1].port, 8080);
        assert_eq!(ports[1].service, "http-proxy");
    }

    #[tokio::test]
    async fn test_nmap_command_line() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(FakeRunner::stdout(NMAP_OUTPUT));
        let ctx = context(dir.path(), runner.clone());

        let run = Nmap.run(&ctx, &json!({"target": "127.0.0.1"})).await;
        assert_eq!(run.records.len(), 2);
        assert_eq!(run.records[0].target, "127.0.0.1:80");

        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[0].0.args, vec!["-sV", "-p", "80,443,8080", "127.0.0.1"]);
        assert!(dir.path().join("t_7e570000/nmap_findings.json").exists());
    }

    #[tokio::test]
    async fn test_missing_target_skips_invocation() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(FakeRunner::silent());
        let ctx = context(dir.path(), runner.clone());

        assert!(Nmap.run(&ctx, &json!({})).await.records.is_empty());
        assert!(Naabu.run(&ctx, &json!({"target": "  "})).await.records.is_empty());
        assert!(Masscan.run(&ctx, &json!({"ports": "80"})).await.records.is_empty());
        assert_eq!(runner.call_count(), 0);
    }

    #[tokio::test]
    async fn test_masscan_reads_interrupted_output_file() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new(|spec| {
            let out = flag_value(spec, "-oJ").unwrap();
            std::fs::write(
                out,
                "[\n{\"ip\":\"10.0.0.9\",\"ports\":[{\"port\":22,\"proto\":\"tcp\",\"status\":\"open\"}]},\n",
            )
            .unwrap();
            ProcessOutput {
                timed_out: true,
                ..ProcessOutput::default()
            }
        }));
        let ctx = context(dir.path(), runner.clone());
        std::fs::create_dir_all(dir.path().join("t_7e570000")).unwrap();

        let run = Masscan
            .run(&ctx, &json!({"target_ip": "10.0.0.0/24", "rate": "500"}))
            .await;
        assert!(run.timed_out);
        assert_eq!(run.records.len(), 1);
        assert_eq!(run.records[0].target, "10.0.0.9:22");
        assert_eq!(flag_value(&runner.calls.lock().unwrap()[0].0, "--rate"), Some("500"));
    }

    #[tokio::test]
    async fn test_naabu_without_output_file() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path(), Arc::new(FakeRunner::silent()));
        let run = Naabu.run(&ctx, &json!({"target": "example.com"})).await;
        assert!(run.records.is_empty());
        assert!(dir.path().join("t_7e570000/naabu_findings.json").exists());
    }
}
