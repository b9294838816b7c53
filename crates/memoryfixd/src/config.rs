use memoryfix_core::config::ConfigError;
use std::net::SocketAddr;

const DEFAULT_BIND: &str = "127.0.0.1:3000";

/// Daemon configuration, loaded from environment variables.
pub struct DaemonConfig {
    /// Listen address (default: 127.0.0.1:3000).
    pub bind: SocketAddr,
    /// Provider and pipeline settings shared with the CLI.
    pub core: memoryfix_core::Config,
}

impl DaemonConfig {
    /// Load configuration from `MEMORYFIX_*` environment variables with defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind = env_string("MEMORYFIX_BIND", DEFAULT_BIND);
        let bind = bind.parse().map_err(|_| ConfigError::InvalidValue {
            key: "MEMORYFIX_BIND",
            value: bind.clone(),
        })?;

        Ok(Self {
            bind,
            core: memoryfix_core::Config::from_env()?,
        })
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}
