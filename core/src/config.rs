//! Runtime configuration surface.
//!
//! Recognized environment variables are enumerated in full so operators
//! have one place to look (spec.md §6); values may also be supplied via
//! a TOML file pointed at by `--config`. Defaults match the contract
//! exactly so a bare `core serve` with no environment is a valid,
//! documented configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Endpoint for the default socket transport.
    pub listen_path: String,
    /// Shared-memory segment size, in megabytes.
    pub shm_size_mb: u64,
    /// Registry upper bound; the 1025th `register` beyond this returns
    /// `REGISTRY_FULL`.
    pub max_agents: u32,
    /// Applied when a message omits an explicit deadline.
    pub default_deadline_ms: u64,
    /// Session token TTL, in seconds.
    pub session_ttl_s: u64,
    /// {debug, info, warn, error}; passed through to `tracing_subscriber`'s
    /// `EnvFilter` when `RUST_LOG` itself is unset.
    pub log_level: String,
    /// Adapter DSN for the persistent store (a `sled` path in the shipped
    /// adapter).
    pub store_url: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            listen_path: "/tmp/agentmesh.sock".to_string(),
            shm_size_mb: 64,
            max_agents: 1024,
            default_deadline_ms: 5000,
            session_ttl_s: 3600,
            log_level: "info".to_string(),
            store_url: "./agentmesh-data".to_string(),
        }
    }
}

impl CoreConfig {
    /// Load configuration layering, in increasing precedence: built-in
    /// defaults, an optional TOML file, then `CORE_*` environment
    /// variables.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&CoreConfig::default())?);

        if let Some(path) = config_file {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("CORE")
                .try_parsing(true)
                .separator("_"),
        );

        let settings = builder.build().context("failed to assemble configuration")?;
        settings
            .try_deserialize()
            .context("failed to deserialize configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.max_agents, 1024);
        assert_eq!(cfg.default_deadline_ms, 5000);
        assert_eq!(cfg.session_ttl_s, 3600);
    }

    #[test]
    fn env_overrides_defaults() {
        std::env::set_var("CORE_MAX_AGENTS", "16");
        let cfg = CoreConfig::load(None).unwrap();
        assert_eq!(cfg.max_agents, 16);
        std::env::remove_var("CORE_MAX_AGENTS");
    }
}
