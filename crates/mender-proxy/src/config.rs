//! Configuration from defaults, an optional YAML file, and environment variables.
//!
//! ```yaml
//! port: 4001
//! backend_url: "http://localhost:4000"
//! request_timeout_secs: 300
//! policy:
//!   blocked_params: [tool_choice, thinking, metadata]
//! ```
//!
//! **Environment variables** (applied on top of the file):
//! - `PROXY_HOST`: listen address (default: 0.0.0.0)
//! - `PROXY_PORT`: listen port (default: 4001)
//! - `LITELLM_URL`: backend base URL (default: http://localhost:4000)
//! - `PROXY_CONNECT_TIMEOUT_SECS`: backend connect timeout (default: 10)
//! - `PROXY_REQUEST_TIMEOUT_SECS`: backend response timeout (default: 300)
//! - `PROXY_STREAM_IDLE_TIMEOUT_SECS`: max gap between streamed chunks (default: 300)
//! - `PROXY_LOG_FILE`: optional log file path
//! - `PROXY_DEBUG`: `true`/`1`/`yes` enables debug logging

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 4001;
pub const DEFAULT_BACKEND_URL: &str = "http://localhost:4000";

/// Top-level parameters the relay rejects or turns into beta negotiation.
pub const DEFAULT_BLOCKED_PARAMS: &[&str] = &[
    "tool_choice",
    "thinking",
    "reasoning_effort",
    "extended_thinking",
    "budget_tokens",
    "metadata",
    "stream_options",
];

/// Fields removed at every nesting depth.
pub const DEFAULT_STRIPPED_FIELDS: &[&str] = &["cache_control"];

/// Inbound headers that negotiate beta capabilities.
pub const DEFAULT_BLOCKED_HEADERS: &[&str] = &["anthropic-beta"];

pub const DEFAULT_MAX_DEPTH: usize = 64;

/// Deepest nesting `serde_json` will parse. A higher `max_depth` could never
/// take effect.
pub const MAX_PARSE_DEPTH: usize = 127;

/// The immutable rule set the pipeline applies. Built once at startup and
/// shared read-only by every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    pub stripped_fields: Vec<String>,
    pub blocked_params: Vec<String>,
    pub blocked_headers: Vec<String>,
    /// Maximum container nesting accepted in a request body.
    pub max_depth: usize,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            stripped_fields: to_strings(DEFAULT_STRIPPED_FIELDS),
            blocked_params: to_strings(DEFAULT_BLOCKED_PARAMS),
            blocked_headers: to_strings(DEFAULT_BLOCKED_HEADERS),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl Policy {
    pub fn is_stripped_field(&self, key: &str) -> bool {
        self.stripped_fields.iter().any(|f| f == key)
    }

    pub fn is_blocked_param(&self, key: &str) -> bool {
        self.blocked_params.iter().any(|p| p == key)
    }

    pub fn is_blocked_header(&self, name: &str) -> bool {
        self.blocked_headers
            .iter()
            .any(|h| h.eq_ignore_ascii_case(name))
    }
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub backend_url: String,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub stream_idle_timeout_secs: u64,
    /// Largest accepted request body.
    pub max_body_bytes: usize,
    pub debug: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    pub policy: Policy,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            connect_timeout_secs: 10,
            request_timeout_secs: 300,
            stream_idle_timeout_secs: 300,
            max_body_bytes: 32 * 1024 * 1024,
            debug: false,
            log_file: None,
            policy: Policy::default(),
        }
    }
}

impl ProxyConfig {
    /// Defaults, overlaid by `path` (if given) and then by the process
    /// environment. Not validated, so callers can layer further overrides
    /// before calling [`ProxyConfig::validate`].
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| env::var(key).ok());
        Ok(config)
    }

    pub fn from_yaml_file(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let content = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml_ng::from_str(content)?)
    }

    /// Apply environment overrides through `lookup`, so callers (and tests)
    /// decide where variables come from. Unparseable numbers are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("PROXY_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("PROXY_PORT").and_then(|p| p.parse().ok()) {
            self.port = port;
        }
        if let Some(url) = lookup("LITELLM_URL") {
            self.backend_url = url;
        }
        if let Some(secs) = lookup("PROXY_CONNECT_TIMEOUT_SECS").and_then(|p| p.parse().ok()) {
            self.connect_timeout_secs = secs;
        }
        if let Some(secs) = lookup("PROXY_REQUEST_TIMEOUT_SECS").and_then(|p| p.parse().ok()) {
            self.request_timeout_secs = secs;
        }
        if let Some(secs) =
            lookup("PROXY_STREAM_IDLE_TIMEOUT_SECS").and_then(|p| p.parse().ok())
        {
            self.stream_idle_timeout_secs = secs;
        }
        if let Some(path) = lookup("PROXY_LOG_FILE") {
            self.log_file = Some(PathBuf::from(path));
        }
        if let Some(debug) = lookup("PROXY_DEBUG") {
            self.debug = matches!(debug.to_ascii_lowercase().as_str(), "true" | "1" | "yes");
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.backend_url.trim();
        if url.is_empty() {
            return Err(ConfigError::Invalid("backend_url must not be empty".into()));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "backend_url must start with http:// or https:// (got {url})"
            )));
        }
        if self.connect_timeout_secs == 0
            || self.request_timeout_secs == 0
            || self.stream_idle_timeout_secs == 0
        {
            return Err(ConfigError::Invalid("timeouts must be non-zero".into()));
        }
        if self.policy.max_depth == 0 || self.policy.max_depth > MAX_PARSE_DEPTH {
            return Err(ConfigError::Invalid(format!(
                "policy.max_depth must be between 1 and {MAX_PARSE_DEPTH}"
            )));
        }
        Ok(())
    }

    pub fn backend_url_trimmed(&self) -> String {
        self.backend_url.trim().trim_end_matches('/').to_string()
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }

    /// `RUST_LOG`-style directive for the configured verbosity.
    pub fn log_directive(&self) -> &'static str {
        if self.debug {
            "debug"
        } else {
            "info"
        }
    }
}
