//! Local Proxy Process
//!
//! The tunnel's traffic enters a local SOCKS endpoint served by an external
//! proxy process (e.g. `ss-local`). The orchestrator only needs to start it
//! for a config, stop it, and know where it listens.
//!
//! ```text
//! Interface → local proxy (127.0.0.1:1081) → remote server
//! ```

use crate::descriptor::{ConfigError, TunnelConfig};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Start/stop handle for the local proxy process
#[async_trait]
pub trait ProxyProcessHandle: Send + Sync {
    /// Start the proxy for `config`, stopping any running instance first
    async fn start(&self, config: &TunnelConfig) -> Result<(), ProxyError>;

    /// Stop the proxy; a no-op when nothing runs
    async fn stop(&self);

    /// Address the proxy listens on once started
    fn local_addr(&self) -> SocketAddr;
}

/// Settings for [`CommandProxy`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandProxyConfig {
    /// Executable to launch
    pub program: String,
    /// Arguments; `{host}`, `{port}`, `{password}`, `{method}`,
    /// `{local_addr}` and `{local_port}` are substituted per tunnel
    pub args: Vec<String>,
    /// Local SOCKS listen address
    #[serde(default = "default_local_addr")]
    pub local_addr: SocketAddr,
    /// How long to wait for the local port to accept connections
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
    /// Cipher used when the tunnel config names none
    #[serde(default = "default_method")]
    pub default_method: String,
}

fn default_local_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 1081))
}

fn default_ready_timeout_ms() -> u64 {
    5_000
}

fn default_method() -> String {
    "chacha20-ietf-poly1305".to_string()
}

impl Default for CommandProxyConfig {
    fn default() -> Self {
        Self {
            program: "ss-local".to_string(),
            args: [
                "-s", "{host}", "-p", "{port}", "-k", "{password}", "-m", "{method}", "-b",
                "{local_addr}", "-l", "{local_port}", "-u",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            local_addr: default_local_addr(),
            ready_timeout_ms: default_ready_timeout_ms(),
            default_method: default_method(),
        }
    }
}

impl CommandProxyConfig {
    /// Expand the argument template for one tunnel
    pub fn render_args(&self, config: &TunnelConfig) -> Result<Vec<String>, ProxyError> {
        let host = config.host()?;
        let port = config.port()?.to_string();
        let password = config.password()?;
        let method = config.method().unwrap_or(&self.default_method);
        let local_addr = self.local_addr.ip().to_string();
        let local_port = self.local_addr.port().to_string();

        Ok(self
            .args
            .iter()
            .map(|arg| {
                arg.replace("{host}", host)
                    .replace("{port}", &port)
                    .replace("{password}", password)
                    .replace("{method}", method)
                    .replace("{local_addr}", &local_addr)
                    .replace("{local_port}", &local_port)
            })
            .collect())
    }
}

/// Proxy handle backed by a child process
pub struct CommandProxy {
    config: CommandProxyConfig,
    child: Mutex<Option<Child>>,
}

impl CommandProxy {
    pub fn new(config: CommandProxyConfig) -> Self {
        Self {
            config,
            child: Mutex::new(None),
        }
    }

    /// Poll the local port until it accepts, the child dies, or time runs out
    async fn wait_ready(&self, child: &mut Child) -> Result<(), ProxyError> {
        let deadline = Instant::now() + Duration::from_millis(self.config.ready_timeout_ms);

        loop {
            if TcpStream::connect(self.config.local_addr).await.is_ok() {
                return Ok(());
            }
            if let Some(status) = child.try_wait()? {
                return Err(ProxyError::Exited(status.to_string()));
            }
            if Instant::now() >= deadline {
                return Err(ProxyError::NotReady(self.config.local_addr));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn kill(child: &mut Child) {
        if let Err(e) = child.kill().await {
            debug!("Proxy process already gone: {}", e);
        }
    }
}

#[async_trait]
impl ProxyProcessHandle for CommandProxy {
    async fn start(&self, config: &TunnelConfig) -> Result<(), ProxyError> {
        let args = self.config.render_args(config)?;
        let mut slot = self.child.lock().await;

        if let Some(mut previous) = slot.take() {
            debug!("Stopping previous proxy instance");
            Self::kill(&mut previous).await;
        }

        info!(
            "Starting local proxy {} on {}",
            self.config.program, self.config.local_addr
        );

        let mut child = Command::new(&self.config.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProxyError::Spawn(e.to_string()))?;

        if let Err(e) = self.wait_ready(&mut child).await {
            warn!("Local proxy failed to come up: {}", e);
            Self::kill(&mut child).await;
            return Err(e);
        }

        *slot = Some(child);
        info!("Local proxy listening on {}", self.config.local_addr);
        Ok(())
    }

    async fn stop(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            info!("Stopping local proxy");
            Self::kill(&mut child).await;
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.config.local_addr
    }
}

/// Proxy errors
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Invalid tunnel config: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to spawn proxy: {0}")]
    Spawn(String),

    #[error("Proxy exited early: {0}")]
    Exited(String),

    #[error("Proxy not accepting connections on {0}")]
    NotReady(SocketAddr),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
