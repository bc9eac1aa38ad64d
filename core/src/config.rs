use std::fs;
use std::path::Path;
use std::time::Duration;

use connman_proto::{default_agent_path, AGENT_SERVICE, CALL_TIMEOUT, INIT_TIMEOUT};

use crate::telemetry::LogLevel;
use crate::{ConnmanError, Result};

/// Client configuration
#[derive(Clone, Debug)]
pub struct ConnmanConfig {
    /// Register an agent so the daemon can ask for credentials on connect
    pub register_agent: bool,
    /// Reply timeout for every daemon call
    pub call_timeout: Duration,
    /// How long init waits for the event loop to become ready
    pub init_timeout: Duration,
    /// Bus name claimed before exporting the agent object
    pub agent_name: String,
    /// Agent object path; `None` means `/net/connman/agent<pid>`
    pub agent_path: Option<String>,
    pub log_level: LogLevel,
}

impl Default for ConnmanConfig {
    fn default() -> Self {
        Self {
            register_agent: std::env::var("CONNMAN_REGISTER_AGENT")
                .ok()
                .and_then(|v| parse_bool(&v))
                .unwrap_or(false),
            call_timeout: std::env::var("CONNMAN_CALL_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(CALL_TIMEOUT),
            init_timeout: std::env::var("CONNMAN_INIT_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(INIT_TIMEOUT),
            agent_name: std::env::var("CONNMAN_AGENT_NAME")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| AGENT_SERVICE.to_string()),
            agent_path: std::env::var("CONNMAN_AGENT_PATH")
                .ok()
                .filter(|s| !s.is_empty()),
            log_level: std::env::var("CONNMAN_LOG_LEVEL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
        }
    }
}

impl ConnmanConfig {
    /// Load configuration from a TOML file (path via CONNMAN_CLIENT_CONFIG or
    /// ./connman-client.toml), overlaying values onto env-driven defaults.
    pub fn load() -> Self {
        let default = Self::default();
        let path = std::env::var("CONNMAN_CLIENT_CONFIG")
            .unwrap_or_else(|_| "connman-client.toml".into());
        let p = Path::new(&path);
        if !p.exists() {
            tracing::info!(target: "connman::config", path = %path, "No TOML config found; using defaults/env");
            return default;
        }
        match fs::read_to_string(p) {
            Ok(s) => match toml::from_str::<ConnmanToml>(&s) {
                Ok(t) => t.overlay(default),
                Err(e) => {
                    tracing::warn!(target: "connman::config", error = %e, "Failed to parse TOML; using defaults");
                    default
                }
            },
            Err(e) => {
                tracing::warn!(target: "connman::config", error = %e, "Failed to read TOML; using defaults");
                default
            }
        }
    }

    /// Parses a TOML document and overlays it onto env-driven defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let t = toml::from_str::<ConnmanToml>(s).map_err(|e| ConnmanError::Config(e.to_string()))?;
        Ok(t.overlay(Self::default()))
    }

    pub fn with_register_agent(mut self, register_agent: bool) -> Self {
        self.register_agent = register_agent;
        self
    }

    /// Object path the agent is exported at.
    pub fn agent_path(&self) -> String {
        self.agent_path.clone().unwrap_or_else(default_agent_path)
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

// TOML overlay

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct ConnmanToml {
    pub register_agent: Option<bool>,
    pub call_timeout_ms: Option<u64>,
    pub init_timeout_ms: Option<u64>,
    pub agent_name: Option<String>,
    pub agent_path: Option<String>,
    pub log_level: Option<String>,
}

impl ConnmanToml {
    fn overlay(self, mut base: ConnmanConfig) -> ConnmanConfig {
        if let Some(v) = self.register_agent {
            base.register_agent = v;
        }
        if let Some(v) = self.call_timeout_ms {
            base.call_timeout = Duration::from_millis(v);
        }
        if let Some(v) = self.init_timeout_ms {
            base.init_timeout = Duration::from_millis(v);
        }
        if let Some(v) = self.agent_name.filter(|s| !s.is_empty()) {
            base.agent_name = v;
        }
        if let Some(v) = self.agent_path.filter(|s| !s.is_empty()) {
            base.agent_path = Some(v);
        }
        if let Some(v) = self.log_level {
            match v.parse() {
                Ok(level) => base.log_level = level,
                Err(e) => {
                    tracing::warn!(target: "connman::config", error = %e, "Ignoring log_level");
                }
            }
        }
        base
    }
}
