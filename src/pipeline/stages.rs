//! The pipeline stages. Each reads what the previous one produced, writes
//! its own artifact and leaves status bookkeeping to [`super::Pipeline`].

use url::Url;

use super::candidate::CandidateFilter;
use super::surface::fallback_endpoints;
use crate::evidence::artifacts::{ASSETS, CANDIDATES, ENDPOINTS, FINDINGS, FINGERPRINTS};
use crate::evidence::{
    AssetsArtifact, CandidatesArtifact, Endpoint, EndpointSource, EndpointsArtifact,
    EvidenceResult, FindingsArtifact, FingerprintsArtifact, Host, OpenPort,
};
use crate::task::Task;
use crate::tools::{HttpProbe, Httpx, Katana, Nmap, ToolContext};

/// Artifact written by a stage and whether any tool hit its deadline.
#[derive(Debug, Clone)]
pub struct StageOutput<T> {
    pub artifact: T,
    pub timed_out: bool,
}

/// Host portion of the task target. Plain hosts and IPs pass through;
/// URLs are reduced to their host.
pub fn scan_host(task: &Task) -> String {
    let target = task.target.trim();
    Url::parse(target)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
        .unwrap_or_else(|| target.to_string())
}

/// Stage 1: open ports on the target host.
pub async fn asset(ctx: &ToolContext, task: &Task, ports: &str) -> EvidenceResult<StageOutput<AssetsArtifact>> {
    let host = scan_host(task);
    ctx.log(format!("Scanning {} on ports {}", host, ports)).await;

    let run = Nmap.scan(ctx, &host, ports).await;
    let mut open = run.records;
    if open.is_empty() {
        ctx.log("No open ports reported, assuming 80/tcp").await;
        open.push(OpenPort {
            port: 80,
            protocol: "tcp".to_string(),
            service: "unknown".to_string(),
        });
    } else {
        ctx.log(format!("Found {} open ports", open.len())).await;
    }

    let artifact = AssetsArtifact {
        task_id: task.task_id.clone(),
        target: task.target.clone(),
        hosts: vec![Host { ip: host, ports: open }],
    };
    ctx.store.write_artifact(&task.task_id, ASSETS, &artifact).await?;
    Ok(StageOutput {
        artifact,
        timed_out: run.timed_out,
    })
}

/// Stage 2: HTTP fingerprints for every discovered `host:port`, plus the
/// base URL when one was given.
pub async fn fingerprint(
    ctx: &ToolContext,
    task: &Task,
    assets: &AssetsArtifact,
) -> EvidenceResult<StageOutput<FingerprintsArtifact>> {
    let mut targets: Vec<String> = assets
        .hosts
        .iter()
        .flat_map(|h| h.ports.iter().map(move |p| format!("{}:{}", h.ip, p.port)))
        .collect();
    if let Some(base) = &task.base_url {
        if !targets.contains(base) {
            targets.push(base.clone());
        }
    }

    let run = Httpx.fingerprint(ctx, &targets).await;
    ctx.log(format!("Identified {} web fingerprints", run.records.len())).await;

    let artifact = FingerprintsArtifact {
        task_id: task.task_id.clone(),
        total_found: run.records.len(),
        fingerprints: run.records,
    };
    ctx.store
        .write_artifact(&task.task_id, FINGERPRINTS, &artifact)
        .await?;
    Ok(StageOutput {
        artifact,
        timed_out: run.timed_out,
    })
}

/// Stage 3: crawl the fingerprinted services. An empty crawl falls back to
/// the fingerprint URLs and their redirect targets.
pub async fn surface(
    ctx: &ToolContext,
    task: &Task,
    fingerprints: &FingerprintsArtifact,
) -> EvidenceResult<StageOutput<EndpointsArtifact>> {
    let mut seeds: Vec<String> = fingerprints
        .fingerprints
        .iter()
        .map(|fp| fp.url.clone())
        .filter(|url| !url.is_empty())
        .collect();
    if let Some(base) = &task.base_url {
        if !seeds.contains(base) {
            seeds.push(base.clone());
        }
    }

    let run = Katana.crawl(ctx, &seeds).await;
    let mut endpoints = run.records;
    if endpoints.is_empty() {
        endpoints = fallback_endpoints(&fingerprints.fingerprints);
        if endpoints.is_empty() {
            if let Some(base) = &task.base_url {
                endpoints.push(Endpoint {
                    url: base.clone(),
                    method: "GET".to_string(),
                    source: EndpointSource::Fingerprint,
                });
            }
        }
        ctx.log(format!(
            "Crawl found nothing, using {} endpoints from fingerprints",
            endpoints.len()
        ))
        .await;
    } else {
        ctx.log(format!("Crawl found {} endpoints", endpoints.len())).await;
    }

    let artifact = EndpointsArtifact {
        task_id: task.task_id.clone(),
        endpoints,
    };
    ctx.store.write_artifact(&task.task_id, ENDPOINTS, &artifact).await?;
    Ok(StageOutput {
        artifact,
        timed_out: run.timed_out,
    })
}

/// Stage 4: risk triage of the discovered endpoints.
pub async fn candidate(
    ctx: &ToolContext,
    task: &Task,
    filter: &CandidateFilter,
    endpoints: &EndpointsArtifact,
) -> EvidenceResult<StageOutput<CandidatesArtifact>> {
    let candidates = filter.select(&endpoints.endpoints);
    for c in &candidates {
        ctx.log(format!("Candidate {} ({})", c.url, c.reason)).await;
    }
    ctx.log(format!(
        "Selected {} of {} endpoints",
        candidates.len(),
        endpoints.endpoints.len()
    ))
    .await;

    let artifact = CandidatesArtifact {
        task_id: task.task_id.clone(),
        candidates,
    };
    ctx.store.write_artifact(&task.task_id, CANDIDATES, &artifact).await?;
    Ok(StageOutput {
        artifact,
        timed_out: false,
    })
}

/// Stage 5: one header-only probe per candidate. Only success and redirect
/// answers become findings.
pub async fn verify(
    ctx: &ToolContext,
    task: &Task,
    candidates: &CandidatesArtifact,
) -> EvidenceResult<StageOutput<FindingsArtifact>> {
    let mut findings = Vec::new();
    let mut timed_out = false;

    for candidate in &candidates.candidates {
        ctx.log(format!("Verifying {}", candidate.url)).await;
        let run = HttpProbe.probe(ctx, &candidate.url).await;
        timed_out |= run.timed_out;
        findings.extend(
            run.records
                .iter()
                .filter_map(|outcome| HttpProbe::classify(&candidate.url, outcome)),
        );
    }
    ctx.log(format!("Verification produced {} findings", findings.len())).await;

    let artifact = FindingsArtifact {
        task_id: task.task_id.clone(),
        findings,
    };
    ctx.store.write_artifact(&task.task_id, FINDINGS, &artifact).await?;
    Ok(StageOutput { artifact, timed_out })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::Budget;
    use crate::evidence::{Candidate, Fingerprint};
    use crate::tools::testing::{context, log_text, FakeRunner};
    use crate::tools::ProcessOutput;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn task(ctx: &ToolContext, target: &str, base_url: Option<&str>) -> Task {
        Task::new(
            ctx.task_id.clone(),
            target.to_string(),
            base_url.map(String::from),
            Budget::default(),
        )
    }

    #[test]
    fn test_scan_host() {
        let t = |target: &str| {
            let id = "t_00000001".parse().unwrap();
            scan_host(&Task::new(id, target.to_string(), None, Budget::default()))
        };
        assert_eq!(t("127.0.0.1"), "127.0.0.1");
        assert_eq!(t("http://10.0.0.5:8080/app"), "10.0.0.5");
        assert_eq!(t(" example.com "), "example.com");
    }

    #[tokio::test]
    async fn test_asset_falls_back_to_port_80() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path(), Arc::new(FakeRunner::silent()));
        let out = asset(&ctx, &task(&ctx, "127.0.0.1", None), "80,443").await.unwrap();
        assert_eq!(out.artifact.hosts[0].ports[0].port, 80);
        assert!(ctx.store.path(&ctx.task_id, ASSETS).is_file());
    }

    #[tokio::test]
    async fn test_fingerprint_targets_host_ports_and_base_url() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(FakeRunner::stdout(
            "{\"url\":\"http://127.0.0.1:8080\",\"status-code\":200,\"tech\":[\"nginx\"]}\n",
        ));
        let ctx = context(dir.path(), runner.clone());
        let t = task(&ctx, "127.0.0.1", Some("http://127.0.0.1:8080/app"));
        let assets = AssetsArtifact {
            task_id: t.task_id.clone(),
            target: t.target.clone(),
            hosts: vec![Host {
                ip: "127.0.0.1".into(),
                ports: vec![
                    OpenPort { port: 8080, protocol: "tcp".into(), service: "http".into() },
                    OpenPort { port: 443, protocol: "tcp".into(), service: "https".into() },
                ],
            }],
        };

        let out = fingerprint(&ctx, &t, &assets).await.unwrap();
        assert_eq!(out.artifact.total_found, 1);

        let calls = runner.calls.lock().unwrap();
        let joined = calls[0].0.args.join(" ");
        assert!(joined.contains("127.0.0.1:8080,127.0.0.1:443,http://127.0.0.1:8080/app"));
    }

    #[tokio::test]
    async fn test_empty_crawl_uses_redirect_fallback() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path(), Arc::new(FakeRunner::silent()));
        let t = task(&ctx, "10.0.0.1", None);
        let fps = FingerprintsArtifact {
            task_id: t.task_id.clone(),
            total_found: 1,
            fingerprints: vec![Fingerprint {
                url: "http://10.0.0.1:8080".into(),
                location: Some("/login.php".into()),
                ..Fingerprint::default()
            }],
        };

        let out = surface(&ctx, &t, &fps).await.unwrap();
        assert_eq!(out.artifact.endpoints.len(), 2);
        assert!(log_text(&ctx).contains("Crawl found nothing"));
    }

    #[tokio::test]
    async fn test_verify_keeps_only_reachable_candidates() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new(|spec| {
            let url = spec.args.last().cloned().unwrap_or_default();
            let stdout = if url.ends_with("login.php") {
                "HTTP/1.1 200 OK\r\nServer: nginx\r\n"
            } else {
                "HTTP/1.1 404 Not Found\r\n"
            };
            ProcessOutput {
                stdout: stdout.to_string(),
                exit_code: Some(0),
                ..ProcessOutput::default()
            }
        }));
        let ctx = context(dir.path(), runner);
        let t = task(&ctx, "10.0.0.1", None);
        let candidates = CandidatesArtifact {
            task_id: t.task_id.clone(),
            candidates: ["http://10.0.0.1/admin/login.php", "http://10.0.0.1/missing"]
                .iter()
                .map(|u| Candidate {
                    url: u.to_string(),
                    method: "GET".into(),
                    reason: "test".into(),
                })
                .collect(),
        };

        let out = verify(&ctx, &t, &candidates).await.unwrap();
        assert_eq!(out.artifact.findings.len(), 1);
        let finding = &out.artifact.findings[0];
        assert_eq!(finding.evidence.data, "HTTP/1.1 200 OK");
        assert_eq!(finding.severity, crate::evidence::Severity::Medium);
    }
}
