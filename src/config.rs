//! Host configuration loaded from `config.yaml`.
//!
//! Resolution: `TOOLHOST_CONFIG` if set, otherwise `<data_dir>/config.yaml`.
//! A missing file means defaults; a file that exists must parse.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::subserver::errors::HostError;
use crate::subserver::secrets::ScopedSecret;
use crate::subserver::types::AttachRequest;

/// Environment variable overriding the config file location.
pub const CONFIG_PATH_ENV: &str = "TOOLHOST_CONFIG";

#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    /// Container runtime CLI (`docker`, `podman`, ...).
    #[serde(default = "default_runtime")]
    pub runtime: String,

    /// Label attached to every launched container.
    #[serde(default = "default_label")]
    pub label: String,

    #[serde(default = "default_discovery_timeout_secs")]
    pub discovery_timeout_secs: u64,

    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    /// Host secrets and the servers allowed to receive them.
    #[serde(default)]
    pub secrets: Vec<ScopedSecret>,

    /// Servers attached at startup.
    #[serde(default)]
    pub servers: Vec<AttachRequest>,
}

fn default_runtime() -> String {
    "docker".to_string()
}

fn default_label() -> String {
    "toolhost.managed=true".to_string()
}

fn default_discovery_timeout_secs() -> u64 {
    10
}

fn default_call_timeout_ms() -> u64 {
    30_000
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            runtime: default_runtime(),
            label: default_label(),
            discovery_timeout_secs: default_discovery_timeout_secs(),
            call_timeout_ms: default_call_timeout_ms(),
            secrets: Vec::new(),
            servers: Vec::new(),
        }
    }
}

impl HostConfig {
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    fn validate(&self) -> Result<(), HostError> {
        if self.runtime.trim().is_empty() {
            return Err(config_error("runtime must not be empty"));
        }
        if self.discovery_timeout_secs == 0 {
            return Err(config_error("discovery_timeout_secs must be greater than 0"));
        }
        if self.call_timeout_ms == 0 {
            return Err(config_error("call_timeout_ms must be greater than 0"));
        }
        if let Some(secret) = self.secrets.iter().find(|s| s.env.trim().is_empty()) {
            return Err(config_error(&format!(
                "secret scoped to {:?} has an empty env name",
                secret.servers
            )));
        }
        Ok(())
    }
}

fn config_error(reason: &str) -> HostError {
    HostError::ConfigError {
        reason: reason.to_string(),
    }
}

/// Where the config file is expected.
pub fn config_path() -> PathBuf {
    match std::env::var(CONFIG_PATH_ENV) {
        Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
        _ => crate::logging::data_dir().join("config.yaml"),
    }
}

/// Load the config from its resolved location.
pub fn load() -> Result<HostConfig, HostError> {
    load_config(&config_path())
}

/// Load and validate the config at `path`. A missing file yields defaults.
pub fn load_config(path: &Path) -> Result<HostConfig, HostError> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "no config file, using defaults");
        return Ok(HostConfig::default());
    }

    let raw = std::fs::read_to_string(path)
        .map_err(|e| config_error(&format!("failed to read {}: {e}", path.display())))?;

    let config = if raw.trim().is_empty() {
        HostConfig::default()
    } else {
        serde_yaml::from_str::<HostConfig>(&raw)
            .map_err(|e| config_error(&format!("failed to parse {}: {e}", path.display())))?
    };
    config.validate()?;

    tracing::info!(
        path = %path.display(),
        runtime = %config.runtime,
        servers = config.servers.len(),
        secrets = config.secrets.len(),
        "config loaded"
    );
    Ok(config)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
