//! Configuration management.
//!
//! pinflow configuration can come from:
//! - Environment variables (PINFLOW_*, with legacy PF_* fallbacks)
//! - Config file (~/.config/pinflow/config.toml)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variables holding the external base URL, first defined wins.
pub const EXTERNAL_URL_VARS: [&str; 2] = ["PINFLOW_EXTERNAL_URL", "PF_EXTERNAL_URL"];

/// Environment variables holding the API token, first defined wins.
pub const TOKEN_VARS: [&str; 2] = ["PINFLOW_TOKEN", "PF_TOKEN"];

/// pinflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Webhook listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Runtime configuration
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Webhook listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

fn default_port() -> u16 {
    3333
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

/// Runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Absolute base URL under which webhooks are reachable from outside
    #[serde(default)]
    pub external_url: Option<String>,

    /// Bearer token sent when fetching dependency code
    #[serde(default)]
    pub token: Option<String>,
}

impl Config {
    /// Load configuration from default locations.
    pub fn load() -> Self {
        let mut config = Self::default();

        let primary_path = Self::config_dir().join("config.toml");
        if let Ok(partial) = Self::load_partial_from_path(&primary_path) {
            config.apply_partial(partial);
        }

        config.apply_env_overrides(|name| std::env::var(name).ok());
        config
    }

    /// Get the config directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("pinflow"))
            .unwrap_or_else(|| PathBuf::from(".pinflow"))
    }

    /// Base URL used for webhook namespaces: the external override, else the
    /// URL the listener answers on.
    pub fn base_url(&self, listener_url: &str) -> String {
        self.runtime
            .external_url
            .clone()
            .unwrap_or_else(|| listener_url.to_string())
    }

    /// Apply environment overrides read through `lookup`.
    ///
    /// Empty values are treated as unset.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(port) = lookup("PINFLOW_PORT") {
            if let Ok(parsed) = port.parse::<u16>() {
                self.server.port = parsed;
            }
        }
        if let Some(host) = lookup("PINFLOW_HOST") {
            self.server.host = host;
        }
        if let Some(url) = EXTERNAL_URL_VARS.iter().find_map(|name| lookup(name)) {
            self.runtime.external_url = Some(url);
        }
        if let Some(token) = TOKEN_VARS.iter().find_map(|name| lookup(name)) {
            self.runtime.token = Some(token);
        }
    }

    fn load_partial_from_path(path: &Path) -> std::result::Result<PartialConfig, ()> {
        let content = std::fs::read_to_string(path).map_err(|_| ())?;
        toml::from_str(&content).map_err(|_| ())
    }

    fn apply_partial(&mut self, partial: PartialConfig) {
        if let Some(server) = partial.server {
            self.server = server;
        }
        if let Some(runtime) = partial.runtime {
            self.runtime = runtime;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    server: Option<ServerConfig>,
    runtime: Option<RuntimeConfig>,
}
