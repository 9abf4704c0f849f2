//! Session configuration
//!
//! Configuration for a session, loaded from session.yaml:
//!
//! ```yaml
//! timeout: 30000
//! shutdown_grace: 5000
//! history_limit: 10
//! max_age: 24h
//!
//! server:
//!   command: tool-echo-server
//!   args: ["--quiet"]
//!   env:
//!     API_TOKEN: "..."
//!
//! web:
//!   headers:
//!     User-Agent: api-flows
//!   auth:
//!     type: bearer
//!     token: "..."
//!
//! environment:
//!   base: https://api.example.com
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::loader::LoadError;
use crate::engine::mock_clock::{parse_duration, ClockError};

/// How to launch the protocol server subprocess
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Executable name or path, located through PATH when relative
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    pub working_dir: Option<String>,

    /// Extra environment variables for the subprocess
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl ServerConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Settings for the built-in HTTP transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    /// Prefix for relative step URLs
    pub base_url: Option<String>,

    /// Default headers to include in all requests
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Default timeout in milliseconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Authentication configuration
    pub auth: Option<WebAuthConfig>,

    /// Whether to follow redirects (default: true)
    #[serde(default = "default_true")]
    pub follow_redirects: bool,

    /// Whether to validate SSL certificates (default: true)
    #[serde(default = "default_true")]
    pub validate_ssl: bool,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            headers: HashMap::new(),
            timeout: default_timeout(),
            auth: None,
            follow_redirects: true,
            validate_ssl: true,
        }
    }
}

/// Authentication configuration for web requests
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WebAuthConfig {
    /// Bearer token authentication
    Bearer { token: String },
    /// Basic authentication
    Basic { username: String, password: String },
    /// API key authentication
    ApiKey { header: String, key: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Protocol server to forward tool calls to
    #[serde(default)]
    pub server: Option<ServerConfig>,

    /// Default per-call timeout in milliseconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// How long to wait for the server to exit before killing it, in milliseconds
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: u64,

    /// Terminal runs kept per flow id
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Age after which active flow records are discarded (e.g. "24h")
    #[serde(default = "default_max_age")]
    pub max_age: String,

    #[serde(default)]
    pub web: WebConfig,

    /// Initial environment scope
    #[serde(default)]
    pub environment: Map<String, Value>,
}

fn default_timeout() -> u64 {
    30000
}

fn default_shutdown_grace() -> u64 {
    5000
}

fn default_history_limit() -> usize {
    10
}

fn default_max_age() -> String {
    "24h".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server: None,
            timeout: default_timeout(),
            shutdown_grace: default_shutdown_grace(),
            history_limit: default_history_limit(),
            max_age: default_max_age(),
            web: WebConfig::default(),
            environment: Map::new(),
        }
    }
}

impl SessionConfig {
    pub fn with_server(mut self, server: ServerConfig) -> Self {
        self.server = Some(server);
        self
    }

    pub fn max_age_duration(&self) -> Result<Duration, ClockError> {
        parse_duration(&self.max_age)
    }

    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig =
            serde_yaml::from_str(&content).map_err(|e| LoadError::Yaml {
                file: path.display().to_string(),
                error: e,
            })?;

        // Surface a bad duration at load time instead of at first cleanup
        config.max_age_duration().map_err(|e| LoadError::Invalid {
            file: path.display().to_string(),
            message: format!("max_age: {}", e),
        })?;

        Ok(config)
    }
}
