//! Typed tool registry and the ad hoc dispatch envelope.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::{
    Amass, Arjun, DirScan, Dnsx, Gau, HttpProbe, Httpx, Hydra, Katana, Masscan, Naabu, Nmap,
    Nuclei, Sqlmap, Subfinder, ToolAdapter, ToolContext, Trufflehog, Wafw00f, WhatWeb,
};
use crate::evidence::Finding;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Unregistered tool: {0}")]
    UnregisteredTool(String),

    #[error("Invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: ToolId, reason: String },
}

/// Identifier of every tool the engine knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ToolId {
    #[serde(rename = "nmap")]
    Nmap,
    #[serde(rename = "httpx")]
    Httpx,
    #[serde(rename = "katana")]
    Katana,
    #[serde(rename = "http_probe")]
    HttpProbe,
    #[serde(rename = "nuclei")]
    Nuclei,
    #[serde(rename = "sqlmap")]
    Sqlmap,
    #[serde(rename = "dirscan")]
    DirScan,
    #[serde(rename = "hydra")]
    Hydra,
    #[serde(rename = "subfinder")]
    Subfinder,
    #[serde(rename = "amass")]
    Amass,
    #[serde(rename = "dnsx")]
    Dnsx,
    #[serde(rename = "naabu")]
    Naabu,
    #[serde(rename = "masscan")]
    Masscan,
    #[serde(rename = "gau")]
    Gau,
    #[serde(rename = "whatweb")]
    WhatWeb,
    #[serde(rename = "wafw00f")]
    Wafw00f,
    #[serde(rename = "arjun")]
    Arjun,
    #[serde(rename = "trufflehog")]
    Trufflehog,
}

impl ToolId {
    pub const ALL: [ToolId; 18] = [
        ToolId::Nmap,
        ToolId::Httpx,
        ToolId::Katana,
        ToolId::HttpProbe,
        ToolId::Nuclei,
        ToolId::Sqlmap,
        ToolId::DirScan,
        ToolId::Hydra,
        ToolId::Subfinder,
        ToolId::Amass,
        ToolId::Dnsx,
        ToolId::Naabu,
        ToolId::Masscan,
        ToolId::Gau,
        ToolId::WhatWeb,
        ToolId::Wafw00f,
        ToolId::Arjun,
        ToolId::Trufflehog,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nmap => "nmap",
            Self::Httpx => "httpx",
            Self::Katana => "katana",
            Self::HttpProbe => "http_probe",
            Self::Nuclei => "nuclei",
            Self::Sqlmap => "sqlmap",
            Self::DirScan => "dirscan",
            Self::Hydra => "hydra",
            Self::Subfinder => "subfinder",
            Self::Amass => "amass",
            Self::Dnsx => "dnsx",
            Self::Naabu => "naabu",
            Self::Masscan => "masscan",
            Self::Gau => "gau",
            Self::WhatWeb => "whatweb",
            Self::Wafw00f => "wafw00f",
            Self::Arjun => "arjun",
            Self::Trufflehog => "trufflehog",
        }
    }

    /// Stage log used when the tool is invoked ad hoc.
    pub fn log_name(&self) -> String {
        format!("tool_{}", self.as_str())
    }
}

impl fmt::Display for ToolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolId {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        ToolId::ALL
            .into_iter()
            .find(|id| id.as_str() == wanted)
            .ok_or_else(|| DispatchError::UnregisteredTool(s.to_string()))
    }
}

type Factory = fn() -> Box<dyn ToolAdapter>;

fn boxed<T: ToolAdapter + Default + 'static>() -> Box<dyn ToolAdapter> {
    Box::new(T::default())
}

/// Registered tool, as listed by the API.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub tool_id: ToolId,
    pub description: String,
    pub parameters: Value,
}

/// Uniform envelope returned by [`ToolRegistry::execute`].
#[derive(Debug, Clone, Serialize)]
pub struct ToolResponse {
    pub tool_id: ToolId,
    pub summary: String,
    pub findings: Vec<Finding>,
    pub timed_out: bool,
}

/// Mapping from [`ToolId`] to adapter constructors, populated once at start.
pub struct ToolRegistry {
    factories: HashMap<ToolId, Factory>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with every built-in adapter.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(ToolId::Nmap, boxed::<Nmap>);
        registry.register(ToolId::Httpx, boxed::<Httpx>);
        registry.register(ToolId::Katana, boxed::<Katana>);
        registry.register(ToolId::HttpProbe, boxed::<HttpProbe>);
        registry.register(ToolId::Nuclei, boxed::<Nuclei>);
        registry.register(ToolId::Sqlmap, boxed::<Sqlmap>);
        registry.register(ToolId::DirScan, boxed::<DirScan>);
        registry.register(ToolId::Hydra, boxed::<Hydra>);
        registry.register(ToolId::Subfinder, boxed::<Subfinder>);
        registry.register(ToolId::Amass, boxed::<Amass>);
        registry.register(ToolId::Dnsx, boxed::<Dnsx>);
        registry.register(ToolId::Naabu, boxed::<Naabu>);
        registry.register(ToolId::Masscan, boxed::<Masscan>);
        registry.register(ToolId::Gau, boxed::<Gau>);
        registry.register(ToolId::WhatWeb, boxed::<WhatWeb>);
        registry.register(ToolId::Wafw00f, boxed::<Wafw00f>);
        registry.register(ToolId::Arjun, boxed::<Arjun>);
        registry.register(ToolId::Trufflehog, boxed::<Trufflehog>);
        registry
    }

    pub fn register(&mut self, id: ToolId, factory: Factory) {
        self.factories.insert(id, factory);
    }

    pub fn adapter(&self, id: ToolId) -> Result<Box<dyn ToolAdapter>, DispatchError> {
        self.factories
            .get(&id)
            .map(|factory| factory())
            .ok_or_else(|| DispatchError::UnregisteredTool(id.to_string()))
    }

    pub fn list(&self) -> Vec<ToolInfo> {
        let mut ids: Vec<ToolId> = self.factories.keys().copied().collect();
        ids.sort();
        ids.into_iter()
            .map(|id| {
                let adapter = (self.factories[&id])();
                ToolInfo {
                    tool_id: id,
                    description: adapter.description().to_string(),
                    parameters: adapter.parameters_schema(),
                }
            })
            .collect()
    }

    /// Look up `tool_id` and run it. Unknown identifiers and non-object
    /// arguments are rejected before anything runs; tool failures surface
    /// as an empty finding list.
    pub async fn execute(
        &self,
        ctx: &ToolContext,
        tool_id: &str,
        args: &Value,
    ) -> Result<ToolResponse, DispatchError> {
        let id: ToolId = tool_id.parse()?;
        let adapter = self.adapter(id)?;

        let empty = Value::Object(Default::default());
        let args = match args {
            Value::Null => &empty,
            Value::Object(_) => args,
            _ => {
                return Err(DispatchError::InvalidArguments {
                    tool: id,
                    reason: "arguments must be a JSON object".to_string(),
                })
            }
        };

        let ctx = ctx
            .clone()
            .with_log(id.log_name())
            .with_timeout_override(super::arg_u64(args, "timeout_seconds"));

        tracing::info!(task_id = %ctx.task_id, tool = %id, "Dispatching tool");
        let run = adapter.run(&ctx, args).await;

        Ok(ToolResponse {
            tool_id: id,
            summary: adapter.summarize(&run),
            findings: run.records,
            timed_out: run.timed_out,
        })
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{context, FakeRunner};
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_tool_id_round_trips_through_str() {
        for id in ToolId::ALL {
            assert_eq!(id.as_str().parse::<ToolId>().unwrap(), id);
            assert_eq!(serde_json::to_value(id).unwrap(), id.as_str());
        }
        assert_eq!("NUCLEI".parse::<ToolId>().unwrap(), ToolId::Nuclei);
    }

    #[test]
    fn test_defaults_register_every_tool() {
        let registry = ToolRegistry::with_defaults();
        let listed = registry.list();
        assert_eq!(listed.len(), ToolId::ALL.len());
        for info in &listed {
            assert!(!info.description.is_empty());
            assert_eq!(info.parameters["type"], "object");
        }
    }

    #[tokio::test]
    async fn test_unknown_tool_is_rejected() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(FakeRunner::silent());
        let ctx = context(dir.path(), runner.clone());

        let err = ToolRegistry::with_defaults()
            .execute(&ctx, "metasploit", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::UnregisteredTool(ref t) if t == "metasploit"));
        assert_eq!(runner.call_count(), 0);
    }

    #[tokio::test]
    async fn test_registered_id_without_factory() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path(), Arc::new(FakeRunner::silent()));
        let err = ToolRegistry::new()
            .execute(&ctx, "nmap", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::UnregisteredTool(_)));
    }

    #[tokio::test]
    async fn test_non_object_args_rejected() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path(), Arc::new(FakeRunner::silent()));
        let err = ToolRegistry::with_defaults()
            .execute(&ctx, "nuclei", &json!(["http://a"]))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidArguments { tool: ToolId::Nuclei, .. }));
    }

    #[tokio::test]
    async fn test_envelope_and_timeout_override() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(FakeRunner::stdout(
            "{\"host\":\"a.example.com\",\"source\":\"crtsh\"}\n",
        ));
        let ctx = context(dir.path(), runner.clone());

        let response = ToolRegistry::with_defaults()
            .execute(&ctx, "trufflehog", &json!({"target_url": "https://git.example/repo", "timeout_seconds": 12}))
            .await
            .unwrap();
        assert_eq!(response.tool_id, ToolId::Trufflehog);
        assert!(!response.summary.is_empty());
        assert_eq!(runner.calls.lock().unwrap()[0].1.as_secs(), 12);
        assert!(dir
            .path()
            .join("t_7e570000/logs/tool_trufflehog.log")
            .exists());
    }
}
