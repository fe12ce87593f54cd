//! Configuration management.
//!
//! Configuration can be set via environment variables:
//! - `HOST` - Bind address. Defaults to `127.0.0.1`.
//! - `PORT` - Bind port. Defaults to `8020`.
//! - `RUNS_DIR` - Evidence root. Defaults to `runs`.
//! - `TOOLS_DIR` - Project-local tool binaries, searched before `PATH`. Defaults to `.`.
//! - `WORDLISTS_DIR` - Dictionaries and SecLists. Defaults to `.`.
//! - `MAX_CONCURRENT_TASKS` - Pipelines running at once. Defaults to `2`.
//! - `DEFAULT_TIMEOUT_SECONDS` - Tool timeout when a task budget is unreadable. Defaults to `900`.
//! - `API_KEY` - Value expected in the `X-API-Key` header.
//! - `DEV_MODE` - Disables authentication when no `API_KEY` is set.
//! - `ASSET_PORTS` - Ports scanned during asset discovery. Defaults to `80,443,8080`.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context};

use crate::budget::DEFAULT_TIMEOUT_SECONDS;
use crate::tools::DEFAULT_PORTS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Disabled,
    ApiKey,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub runs_dir: PathBuf,
    pub tools_dir: PathBuf,
    pub wordlists_dir: PathBuf,
    pub max_concurrent_tasks: usize,
    pub default_timeout: Duration,
    pub api_key: Option<String>,
    pub dev_mode: bool,
    pub asset_ports: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8020,
            runs_dir: PathBuf::from("runs"),
            tools_dir: PathBuf::from("."),
            wordlists_dir: PathBuf::from("."),
            max_concurrent_tasks: 2,
            default_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECONDS),
            api_key: None,
            dev_mode: false,
            asset_ports: DEFAULT_PORTS.to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let config = Self {
            host: var("HOST").unwrap_or(defaults.host),
            port: parse_var(&var, "PORT")?.unwrap_or(defaults.port),
            runs_dir: var("RUNS_DIR").map(PathBuf::from).unwrap_or(defaults.runs_dir),
            tools_dir: var("TOOLS_DIR").map(PathBuf::from).unwrap_or(defaults.tools_dir),
            wordlists_dir: var("WORDLISTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.wordlists_dir),
            max_concurrent_tasks: parse_var::<usize>(&var, "MAX_CONCURRENT_TASKS")?
                .unwrap_or(defaults.max_concurrent_tasks)
                .max(1),
            default_timeout: parse_var::<u64>(&var, "DEFAULT_TIMEOUT_SECONDS")?
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.default_timeout),
            api_key: var("API_KEY"),
            dev_mode: var("DEV_MODE")
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(false),
            asset_ports: var("ASSET_PORTS").unwrap_or(defaults.asset_ports),
        };

        if config.api_key.is_none() && !config.dev_mode {
            bail!("API_KEY must be set unless DEV_MODE is enabled");
        }
        Ok(config)
    }

    pub fn auth_mode(&self) -> AuthMode {
        match (&self.api_key, self.dev_mode) {
            (None, true) => AuthMode::Disabled,
            _ => AuthMode::ApiKey,
        }
    }
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var(key)
        .map(|v| v.parse::<T>().with_context(|| format!("Invalid {}: {:?}", key, v)))
        .transpose()
}
