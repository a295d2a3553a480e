//! Service Configuration
//!
//! Settings for the tunnel service, loaded from TOML or JSON. Every field
//! has a default, so an empty file is a valid configuration.
//!
//! ```toml
//! pool_size = 5
//! state_path = "/var/lib/fos-tunnel/state.json"
//! control_addr = "127.0.0.1:7070"
//! probe_timeout_ms = 10000
//!
//! [proxy]
//! program = "ss-local"
//! args = ["-s", "{host}", "-p", "{port}", "-k", "{password}", "-m", "{method}",
//!         "-b", "127.0.0.1", "-l", "{local_port}", "-u"]
//!
//! [route]
//! target = "1.1.1.1:53"
//! interval_ms = 2000
//! ```

use crate::connectivity::CheckConfig;
use crate::orchestrator::OrchestratorSettings;
use crate::pool::{DEFAULT_POOL_SIZE, MIN_POOL_SIZE};
use crate::proxy::CommandProxyConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Worker pool size for proxy starts and connectivity checks
    pub pool_size: usize,
    /// Where the last successful tunnel is persisted
    pub state_path: PathBuf,
    /// Local control socket of the daemon
    pub control_addr: SocketAddr,
    /// Default log filter when `RUST_LOG` is unset
    pub log_level: String,
    /// Limit on each connectivity check
    pub probe_timeout_ms: Option<u64>,
    /// Limit on proxy start plus connectivity probe
    pub proxy_start_timeout_ms: Option<u64>,
    pub proxy: CommandProxyConfig,
    pub checks: CheckConfig,
    pub route: RouteConfig,
}

/// Default-route watcher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    /// Any routable address; nothing is ever sent to it
    pub target: SocketAddr,
    pub interval_ms: u64,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            target: SocketAddr::from(([1, 1, 1, 1], 53)),
            interval_ms: 2_000,
        }
    }
}

impl RouteConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            state_path: PathBuf::from("fos-tunnel-state.json"),
            control_addr: SocketAddr::from(([127, 0, 0, 1], 7070)),
            log_level: "info".to_string(),
            probe_timeout_ms: None,
            proxy_start_timeout_ms: None,
            proxy: CommandProxyConfig::default(),
            checks: CheckConfig::default(),
            route: RouteConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Load from TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, ServiceConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ServiceConfigError::Io(e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ServiceConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ServiceConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from JSON file
    pub fn from_json_file(path: &Path) -> Result<Self, ServiceConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ServiceConfigError::Io(e.to_string()))?;
        Self::from_json(&content)
    }

    /// Load from JSON string
    pub fn from_json(content: &str) -> Result<Self, ServiceConfigError> {
        let config: Self =
            serde_json::from_str(content).map_err(|e| ServiceConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load by file extension; anything but `.json` is read as TOML
    pub fn from_file(path: &Path) -> Result<Self, ServiceConfigError> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_file(path),
            _ => Self::from_toml_file(path),
        }
    }

    pub fn validate(&self) -> Result<(), ServiceConfigError> {
        if self.pool_size < MIN_POOL_SIZE {
            return Err(ServiceConfigError::Invalid(format!(
                "pool_size must be at least {}, got {}",
                MIN_POOL_SIZE, self.pool_size
            )));
        }
        if self.proxy.program.is_empty() {
            return Err(ServiceConfigError::Invalid("proxy.program is empty".into()));
        }
        if self.route.interval_ms == 0 {
            return Err(ServiceConfigError::Invalid("route.interval_ms must be positive".into()));
        }
        Ok(())
    }

    /// Time limits for the orchestrator
    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            proxy_start_timeout: self.proxy_start_timeout_ms.map(Duration::from_millis),
            probe_timeout: self.probe_timeout_ms.map(Duration::from_millis),
        }
    }

    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}

/// Service configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
