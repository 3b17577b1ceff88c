//! Configuration management for the getwork gateway
//!
//! The command line only says where the configuration lives and how to log.
//! Everything else comes from a JSON or YAML file whose keys match the
//! historical `aquaproxy.json` layout, so existing deployments keep working.

use crate::{Error, Result};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Locations probed, in order, when `--config` is not given
pub const DEFAULT_CONFIG_PATHS: &[&str] = &[
    "aquaproxy.json",
    "/etc/aquaproxy.json",
    "/opt/aquaproxy/aquaproxy.json",
];

/// Log output formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Compact single-line output
    Plain,
    /// Multi-line human readable output
    Pretty,
    /// One JSON object per event
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Plain => write!(f, "plain"),
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// Command line arguments
#[derive(Debug, Clone, Parser)]
#[command(
    name = "getwork-gateway",
    version = env!("CARGO_PKG_VERSION"),
    about = "getWork mining gateway with upstream failover"
)]
pub struct Cli {
    /// Path to the config file (JSON or YAML)
    #[arg(short = 'c', long = "config", visible_alias = "cfg", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Write the default configuration to the config path and exit
    #[arg(long)]
    pub mkcfg: bool,

    /// Log filter directive (e.g. "info" or "getwork_gateway=debug")
    #[arg(short = 'l', long, default_value = "info", env = "GATEWAY_LOG")]
    pub log_level: String,

    /// Log output format
    #[arg(long, default_value = "plain")]
    pub log_format: LogFormat,

    /// Additionally write logs to this file
    #[arg(long, value_name = "FILE")]
    pub log_file: Option<PathBuf>,
}

/// One upstream node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamConfig {
    /// Display name
    pub name: String,
    /// JSON-RPC endpoint
    pub url: String,
    /// Per-call timeout
    #[serde(default = "default_upstream_timeout")]
    pub timeout: String,
    /// Idle connections kept per host
    #[serde(default = "default_upstream_pool")]
    pub pool: usize,
}

impl UpstreamConfig {
    /// Parsed per-call timeout
    pub fn timeout_duration(&self) -> Result<Duration> {
        parse_duration("upstream.timeout", &self.timeout)
    }
}

/// Miner-facing listener and accounting settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    /// Listen address for miners
    #[serde(default = "default_listen")]
    pub listen: String,
    /// How long a connection may sit idle between request lines
    #[serde(default = "default_client_timeout")]
    pub client_timeout: String,
    /// Block template refresh cadence
    #[serde(default = "default_block_refresh")]
    pub block_refresh_interval: String,
    /// Window for effective hashrate
    #[serde(default = "default_hashrate_window")]
    pub hashrate_window: String,
    /// Honor eth_submitHashrate
    #[serde(default)]
    pub submit_hashrate: bool,
    /// Short luck window
    #[serde(default = "default_luck_window")]
    pub luck_window: String,
    /// Large luck window
    #[serde(default = "default_large_luck_window")]
    pub large_luck_window: String,
    /// JSON-RPC namespace used towards upstream nodes ("aqua" or "eth")
    #[serde(default = "default_rpc_namespace")]
    pub rpc_namespace: String,
    /// Multiplier applied to a route difficulty override
    #[serde(default = "default_difficulty_multiplier")]
    pub difficulty_multiplier: f64,
    /// Grace period for open connections on shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            client_timeout: default_client_timeout(),
            block_refresh_interval: default_block_refresh(),
            hashrate_window: default_hashrate_window(),
            submit_hashrate: false,
            luck_window: default_luck_window(),
            large_luck_window: default_large_luck_window(),
            rpc_namespace: default_rpc_namespace(),
            difficulty_multiplier: default_difficulty_multiplier(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

/// Statistics endpoint settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrontendConfig {
    /// Listen address; empty disables the endpoint
    #[serde(default)]
    pub listen: String,
    /// Basic auth user
    #[serde(default)]
    pub login: String,
    /// Basic auth password; empty disables auth
    #[serde(default)]
    pub password: String,
    /// Leave miner IPs out of the statistics
    #[serde(default, rename = "hideIP")]
    pub hide_ip: bool,
}

/// Complete gateway configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Runtime worker threads, 0 means one per core
    #[serde(default)]
    pub threads: usize,
    /// Miner-facing settings
    #[serde(default)]
    pub proxy: ProxyConfig,
    /// Statistics endpoint
    #[serde(default)]
    pub frontend: FrontendConfig,
    /// Health check cadence
    #[serde(default = "default_check_interval")]
    pub upstream_check_interval: String,
    /// Upstream nodes in priority order
    #[serde(default)]
    pub upstream: Vec<UpstreamConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            threads: 0,
            proxy: ProxyConfig::default(),
            frontend: FrontendConfig {
                listen: "127.0.0.1:8080".to_string(),
                login: "admin".to_string(),
                password: String::new(),
                hide_ip: false,
            },
            upstream_check_interval: default_check_interval(),
            upstream: vec![
                UpstreamConfig {
                    name: "main".to_string(),
                    url: "http://127.0.0.1:8543".to_string(),
                    timeout: default_upstream_timeout(),
                    pool: default_upstream_pool(),
                },
                UpstreamConfig {
                    name: "backup".to_string(),
                    url: "http://127.0.0.2:8543".to_string(),
                    timeout: default_upstream_timeout(),
                    pool: default_upstream_pool(),
                },
            ],
        }
    }
}

/// Parsed tunables the running gateway reads on every request.
///
/// Swapped as a whole on configuration reload. Upstreams and the RPC
/// namespace are bound at startup and are not part of it.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub client_timeout: Duration,
    pub block_refresh_interval: Duration,
    pub upstream_check_interval: Duration,
    pub hashrate_window: Duration,
    pub luck_window: Duration,
    pub large_luck_window: Duration,
    pub submit_hashrate: bool,
    pub difficulty_multiplier: f64,
    pub shutdown_grace: Duration,
    pub hide_ip: bool,
}

impl Config {
    /// Find the configuration file: the explicit path, else the first
    /// default location that exists.
    pub fn locate(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        DEFAULT_CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
    }

    /// Load and validate a configuration file
    pub async fn load_from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::config(format!("config file error {}: {}", path.display(), e))
        })?;
        let config = Self::parse_str(path, &content)?;
        config.validate()?;
        Ok(config)
    }

    /// Blocking variant of [`Config::load_from_file`] for use before a
    /// runtime exists
    pub fn read_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("config file error {}: {}", path.display(), e))
        })?;
        let config = Self::parse_str(path, &content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration text, choosing the format from the file extension
    fn parse_str(path: &Path, content: &str) -> Result<Self> {
        match path.extension().and_then(|s| s.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(content).map_err(Error::from),
            _ => serde_json::from_str(content).map_err(Error::from),
        }
    }

    /// Write this configuration as indented JSON, refusing to overwrite
    pub fn write_new(&self, path: &Path) -> Result<()> {
        if path.exists() {
            return Err(Error::config(format!(
                "config file {} already exists",
                path.display()
            )));
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json + "\n")?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.upstream.is_empty() {
            return Err(Error::config("at least one upstream is required"));
        }

        for upstream in &self.upstream {
            if upstream.name.is_empty() {
                return Err(Error::config("upstream name must not be empty"));
            }
            let url = Url::parse(&upstream.url).map_err(|e| {
                Error::config(format!("invalid url for upstream {}: {}", upstream.name, e))
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(Error::config(format!(
                    "upstream {} must use http or https",
                    upstream.name
                )));
            }
            if upstream.timeout_duration()?.is_zero() {
                return Err(Error::config(format!(
                    "upstream {} timeout must be positive",
                    upstream.name
                )));
            }
        }

        self.listen_addr()?;
        if !self.frontend.listen.is_empty() {
            self.frontend_addr()?;
        }

        let settings = self.settings()?;
        if settings.luck_window > settings.large_luck_window {
            return Err(Error::config("luckWindow must not exceed largeLuckWindow"));
        }
        if settings.block_refresh_interval.is_zero() || settings.upstream_check_interval.is_zero()
        {
            return Err(Error::config("refresh and check intervals must be positive"));
        }
        if !(settings.difficulty_multiplier > 0.0) {
            return Err(Error::config("difficultyMultiplier must be positive"));
        }
        if self.proxy.rpc_namespace.is_empty() {
            return Err(Error::config("rpcNamespace must not be empty"));
        }

        Ok(())
    }

    /// Parse the runtime tunables
    pub fn settings(&self) -> Result<Settings> {
        Ok(Settings {
            client_timeout: parse_duration("proxy.clientTimeout", &self.proxy.client_timeout)?,
            block_refresh_interval: parse_duration(
                "proxy.blockRefreshInterval",
                &self.proxy.block_refresh_interval,
            )?,
            upstream_check_interval: parse_duration(
                "upstreamCheckInterval",
                &self.upstream_check_interval,
            )?,
            hashrate_window: parse_duration("proxy.hashrateWindow", &self.proxy.hashrate_window)?,
            luck_window: parse_duration("proxy.luckWindow", &self.proxy.luck_window)?,
            large_luck_window: parse_duration(
                "proxy.largeLuckWindow",
                &self.proxy.large_luck_window,
            )?,
            submit_hashrate: self.proxy.submit_hashrate,
            difficulty_multiplier: self.proxy.difficulty_multiplier,
            shutdown_grace: parse_duration("proxy.shutdownGrace", &self.proxy.shutdown_grace)?,
            hide_ip: self.frontend.hide_ip,
        })
    }

    /// Miner-facing socket address
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.proxy
            .listen
            .parse()
            .map_err(|e| Error::config(format!("invalid proxy.listen: {}", e)))
    }

    /// Statistics socket address, if enabled
    pub fn frontend_addr(&self) -> Result<Option<SocketAddr>> {
        if self.frontend.listen.is_empty() {
            return Ok(None);
        }
        self.frontend
            .listen
            .parse()
            .map(Some)
            .map_err(|e| Error::config(format!("invalid frontend.listen: {}", e)))
    }

    /// Worker thread count for the runtime
    pub fn worker_threads(&self) -> usize {
        if self.threads > 0 {
            self.threads
        } else {
            num_cpus::get()
        }
    }
}

fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .map_err(|e| Error::config(format!("invalid duration for {}: {:?}: {}", field, value, e)))
}

// Default value functions for serde
fn default_listen() -> String { "0.0.0.0:8546".to_string() }
fn default_client_timeout() -> String { "3m".to_string() }
fn default_block_refresh() -> String { "120ms".to_string() }
fn default_hashrate_window() -> String { "15m".to_string() }
fn default_luck_window() -> String { "24h".to_string() }
fn default_large_luck_window() -> String { "72h".to_string() }
fn default_rpc_namespace() -> String { "aqua".to_string() }
fn default_difficulty_multiplier() -> f64 { 1_000_000.0 }
fn default_shutdown_grace() -> String { "5s".to_string() }
fn default_check_interval() -> String { "5s".to_string() }
fn default_upstream_timeout() -> String { "10s".to_string() }
fn default_upstream_pool() -> usize { 10 }
