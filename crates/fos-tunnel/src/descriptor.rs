//! Tunnel Descriptor
//!
//! A tunnel is identified by an id chosen by the host application and an
//! opaque endpoint configuration. Only a handful of keys are interpreted
//! here (`host`, `port`, `password`, `method`, `name`); everything else is
//! passed through untouched to the proxy process and the store.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Name shown when a config carries neither `name` nor `host`.
pub const DEFAULT_SERVER_NAME: &str = "fOS Tunnel";

/// Opaque key/value endpoint configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TunnelConfig(Map<String, Value>);

impl TunnelConfig {
    /// Create an empty configuration
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Build a configuration from a JSON value
    ///
    /// Anything other than a JSON object is rejected.
    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            _ => Err(ConfigError::NotAnObject),
        }
    }

    /// Set a key, returning the config for chaining
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    /// Raw access to a key
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// True when no key is present at all
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Remote server host
    pub fn host(&self) -> Result<&str, ConfigError> {
        self.string("host")
    }

    /// Remote server port
    ///
    /// Accepts both a JSON number and a numeric string, since host
    /// applications are not consistent about it.
    pub fn port(&self) -> Result<u16, ConfigError> {
        let value = self.0.get("port").ok_or(ConfigError::MissingKey("port"))?;
        let port = match value {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse::<u64>().ok(),
            _ => None,
        };
        match port {
            Some(p) if p > 0 && p <= u16::MAX as u64 => Ok(p as u16),
            _ => Err(ConfigError::InvalidPort),
        }
    }

    /// Server credentials
    pub fn password(&self) -> Result<&str, ConfigError> {
        self.string("password")
    }

    /// Cipher method, if the config names one
    pub fn method(&self) -> Option<&str> {
        self.0.get("method").and_then(Value::as_str)
    }

    /// Human readable server name for the presentation layer.
    ///
    /// Falls back to the host, then to [`DEFAULT_SERVER_NAME`].
    pub fn server_name(&self) -> &str {
        self.0
            .get("name")
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .or_else(|| self.host().ok())
            .unwrap_or(DEFAULT_SERVER_NAME)
    }

    /// Check the keys every tunnel needs
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.host()?;
        self.port()?;
        self.password()?;
        Ok(())
    }

    /// Remote host and port of a complete config
    pub fn endpoint(&self) -> Result<(&str, u16), ConfigError> {
        self.validate()?;
        Ok((self.host()?, self.port()?))
    }

    fn string(&self, key: &'static str) -> Result<&str, ConfigError> {
        match self.0.get(key) {
            Some(Value::String(s)) if !s.is_empty() => Ok(s),
            Some(_) => Err(ConfigError::InvalidValue(key)),
            None => Err(ConfigError::MissingKey(key)),
        }
    }
}

/// Tunnel identity plus its endpoint configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelDescriptor {
    pub id: String,
    pub config: TunnelConfig,
}

impl TunnelDescriptor {
    pub fn new(id: impl Into<String>, config: TunnelConfig) -> Self {
        Self {
            id: id.into(),
            config,
        }
    }
}

impl fmt::Display for TunnelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.config.host(), self.config.port()) {
            (Ok(host), Ok(port)) => write!(f, "{} ({}:{})", self.id, host, port),
            _ => write!(f, "{}", self.id),
        }
    }
}

/// Endpoint configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing config key: {0}")]
    MissingKey(&'static str),

    #[error("Invalid value for config key: {0}")]
    InvalidValue(&'static str),

    #[error("Invalid server port")]
    InvalidPort,

    #[error("Tunnel config must be a JSON object")]
    NotAnObject,
}
