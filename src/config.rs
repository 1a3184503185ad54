//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `VMI_GATEWAY_LISTEN`, `VMI_GATEWAY_API_KEY`,
//!    `VMI_GATEWAY_AGENT_TOKEN`
//! 2. **Config file** — path via `--config <path>`, or `vmi-gateway.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8443"
//!
//! [auth]
//! api_key = "your-secret-key"              # omit to disable auth
//!
//! [logging]
//! level = "info"
//!
//! [cluster]
//! api_url = "https://kubernetes.default.svc"
//! token_file = "/var/run/secrets/kubernetes.io/serviceaccount/token"
//! insecure_skip_tls_verify = false
//! # instances_file = "instances.yaml"      # used when api_url is unset
//! request_timeout_secs = 10
//!
//! [agent]
//! url_template = "http://{node}:8186"
//! token_file = "/etc/vmi-gateway/agent-token"
//! control_timeout_secs = 10
//! connect_timeout_secs = 10
//!
//! [agent.nodes]
//! node01 = "http://10.0.0.5:8186"
//!
//! [stream]
//! keepalive_interval_secs = 10
//! keepalive_timeout_secs = 30
//! buffer_size = 32768
//! # max_session_secs = 3600
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

/// Default config file looked up in the current directory.
pub const DEFAULT_CONFIG_FILE: &str = "vmi-gateway.toml";

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub stream: StreamConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8443`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Seconds between sweeps of idle session counters (default 60).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

/// Authentication settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared Bearer token. Override with `VMI_GATEWAY_API_KEY`.
    /// When unset, requests are not authenticated by the gateway itself.
    pub api_key: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Where instance records come from.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Base URL of the cluster REST API. Takes precedence over `instances_file`.
    pub api_url: Option<String>,
    /// File holding the bearer token for the cluster API.
    pub token_file: Option<String>,
    /// Skip TLS certificate verification for the cluster API (default false).
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
    /// YAML list of instance records for a static in-memory store.
    pub instances_file: Option<String>,
    /// Timeout for one cluster API request in seconds (default 10).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// How to reach the per-node agents.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Agent base URL; `{node}` is replaced by the instance's node name
    /// (default `http://{node}:8186`).
    #[serde(default = "default_url_template")]
    pub url_template: String,
    /// Explicit per-node agent URLs, consulted before `url_template`.
    #[serde(default)]
    pub nodes: HashMap<String, String>,
    /// Bearer token presented to agents. Override with `VMI_GATEWAY_AGENT_TOKEN`.
    pub token: Option<String>,
    /// File holding the agent bearer token (read when `token` is unset).
    pub token_file: Option<String>,
    /// Timeout for the channel resolve call in seconds (default 10).
    #[serde(default = "default_control_timeout")]
    pub control_timeout_secs: u64,
    /// Timeout for opening the device stream in seconds (default 10).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// Relay settings for established sessions.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Seconds between pings sent to the client (default 10).
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,
    /// Seconds without a pong before the session is cancelled (default 30).
    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout_secs: u64,
    /// Hard deadline for one session in seconds. Unlimited when unset.
    pub max_session_secs: Option<u64>,
    /// Copy buffer size per direction in bytes (default 32 KiB).
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

fn default_listen() -> String {
    "0.0.0.0:8443".to_string()
}
fn default_sweep_interval() -> u64 {
    60
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_request_timeout() -> u64 {
    10
}
fn default_url_template() -> String {
    "http://{node}:8186".to_string()
}
fn default_control_timeout() -> u64 {
    10
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_keepalive_interval() -> u64 {
    10
}
fn default_keepalive_timeout() -> u64 {
    30
}
fn default_buffer_size() -> usize {
    32 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            token_file: None,
            insecure_skip_tls_verify: false,
            instances_file: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            url_template: default_url_template(),
            nodes: HashMap::new(),
            token: None,
            token_file: None,
            control_timeout_secs: default_control_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_secs: default_keepalive_interval(),
            keepalive_timeout_secs: default_keepalive_timeout(),
            max_session_secs: None,
            buffer_size: default_buffer_size(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file. Otherwise looks for
    /// `vmi-gateway.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(DEFAULT_CONFIG_FILE)?
            }
            None => Config::default(),
        };

        // Env var overrides
        if let Ok(listen) = std::env::var("VMI_GATEWAY_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(key) = std::env::var("VMI_GATEWAY_API_KEY") {
            config.auth.api_key = Some(key);
        }
        if let Ok(token) = std::env::var("VMI_GATEWAY_AGENT_TOKEN") {
            config.agent.token = Some(token);
        }

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }
}

impl AgentConfig {
    /// The agent bearer token: `token` if set, else the contents of `token_file`.
    pub fn resolve_token(&self) -> Result<Option<String>, ConfigError> {
        if let Some(ref token) = self.token {
            return Ok(Some(token.clone()));
        }
        match self.token_file {
            Some(ref path) => std::fs::read_to_string(path)
                .map(|t| Some(t.trim().to_string()))
                .map_err(|source| ConfigError::Read {
                    path: path.clone(),
                    source,
                }),
            None => Ok(None),
        }
    }
}
