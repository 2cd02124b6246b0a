//! Configuration for the wash daemon.
//!
//! Configuration is loaded from `~/.config/wash/wash.toml`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WashConfig {
    /// Address the HTTP control surface binds to.
    #[serde(default = "default_addr")]
    pub addr: String,

    /// Upper bound on concurrent external-plugin subprocesses.
    #[serde(default = "default_spawn_limit")]
    pub plugin_spawn_limit: usize,

    /// Grace between SIGTERM and SIGKILL when cancelling a plugin, in
    /// milliseconds.
    #[serde(default = "default_grace_ms")]
    pub termination_grace_ms: u64,

    /// Default deadline applied to capability calls, in milliseconds.
    #[serde(default = "default_deadline_ms")]
    pub call_deadline_ms: u64,

    /// Attribute/entry validity reported to the FUSE kernel when an entry
    /// does not carry its own, in milliseconds.
    #[serde(default = "default_attr_ttl_ms")]
    pub fuse_attr_ttl_ms: u64,

    /// Journal rotation: size limit in bytes.
    #[serde(default = "default_journal_max_size")]
    pub journal_max_size: u64,

    /// Journal rotation: age limit in seconds.
    #[serde(default = "default_journal_max_age_secs")]
    pub journal_max_age_secs: u64,

    /// External plugins to mount at startup.
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,
}

/// One external plugin: a name and the executable that serves it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Mount name: the top-level directory the plugin appears under.
    pub name: String,
    /// Path to the plugin executable.
    pub script: PathBuf,
}

fn default_addr() -> String {
    "127.0.0.1:4444".to_string()
}

fn default_spawn_limit() -> usize {
    32
}

fn default_grace_ms() -> u64 {
    3_000
}

fn default_deadline_ms() -> u64 {
    30_000
}

fn default_attr_ttl_ms() -> u64 {
    1_000
}

fn default_journal_max_size() -> u64 {
    crate::journal::Journal::DEFAULT_MAX_SIZE
}

fn default_journal_max_age_secs() -> u64 {
    crate::journal::Journal::DEFAULT_MAX_AGE.as_secs()
}

impl Default for WashConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            plugin_spawn_limit: default_spawn_limit(),
            termination_grace_ms: default_grace_ms(),
            call_deadline_ms: default_deadline_ms(),
            fuse_attr_ttl_ms: default_attr_ttl_ms(),
            journal_max_size: default_journal_max_size(),
            journal_max_age_secs: default_journal_max_age_secs(),
            plugins: Vec::new(),
        }
    }
}

impl WashConfig {
    /// Load configuration from the default path.
    ///
    /// If the config file doesn't exist, returns default configuration.
    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        if !path.exists() {
            tracing::debug!("no config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))
    }

    pub fn config_path() -> PathBuf {
        crate::paths::config_dir().join("wash.toml")
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }

    pub fn call_deadline(&self) -> Duration {
        Duration::from_millis(self.call_deadline_ms)
    }

    pub fn fuse_attr_ttl(&self) -> Duration {
        Duration::from_millis(self.fuse_attr_ttl_ms)
    }

    pub fn journal_max_age(&self) -> Duration {
        Duration::from_secs(self.journal_max_age_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WashConfig::default();
        assert_eq!(config.plugin_spawn_limit, 32);
        assert!(config.plugins.is_empty());
        assert_eq!(config.addr, "127.0.0.1:4444");
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: WashConfig = toml::from_str(
            r#"
            addr = "0.0.0.0:8080"

            [[plugins]]
            name = "docker"
            script = "/usr/local/lib/wash/docker.rb"
            "#,
        )
        .unwrap();

        assert_eq!(config.addr, "0.0.0.0:8080");
        assert_eq!(config.plugin_spawn_limit, 32);
        assert_eq!(config.plugins.len(), 1);
        assert_eq!(config.plugins[0].name, "docker");
    }

    #[test]
    fn test_bad_toml_is_an_error() {
        let path = PathBuf::from("/nonexistent/wash.toml");
        assert!(WashConfig::load_from(&path).is_err());
    }
}
