//! Virtual network interface
//!
//! The OS side of the tunnel: bring up the interface, wire it to the local
//! proxy, and pin underlying traffic to a physical network where the
//! platform allows it.

use crate::network::NetworkId;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Mutex;
use tracing::{debug, info};

/// Handle to the OS tunnel interface
#[async_trait]
pub trait TunnelInterfaceHandle: Send + Sync {
    /// Bring the interface up. Returns false when the OS refuses.
    async fn establish(&self) -> bool;

    /// Route interface traffic into the local proxy
    async fn connect(&self, local_proxy: SocketAddr, udp_enabled: bool)
        -> Result<(), InterfaceError>;

    /// Detach from the local proxy; the interface stays up
    async fn disconnect(&self);

    /// Bring the interface down
    async fn tear_down(&self);

    /// Pin (or unpin with `None`) underlying traffic to a network.
    ///
    /// Returns false when the platform has no explicit binding.
    fn set_underlying_network(&self, _network: Option<NetworkId>) -> bool {
        false
    }

    /// Whether the user granted permission to create the interface
    fn is_prepared(&self) -> bool {
        true
    }
}

/// No OS interface: applications talk to the local SOCKS endpoint directly.
///
/// Tracks the binding so status output can report it.
#[derive(Default)]
pub struct DirectProxyInterface {
    binding: Mutex<Option<(SocketAddr, bool)>>,
}

impl DirectProxyInterface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current proxy binding and its UDP mode
    pub fn binding(&self) -> Option<(SocketAddr, bool)> {
        self.binding.lock().ok().and_then(|b| *b)
    }

    /// URL applications should use
    pub fn proxy_url(&self) -> Option<String> {
        self.binding().map(|(addr, _)| format!("socks5://{}", addr))
    }
}

#[async_trait]
impl TunnelInterfaceHandle for DirectProxyInterface {
    async fn establish(&self) -> bool {
        debug!("Direct proxy mode, no interface to establish");
        true
    }

    async fn connect(
        &self,
        local_proxy: SocketAddr,
        udp_enabled: bool,
    ) -> Result<(), InterfaceError> {
        let mut binding = self.binding.lock().map_err(|_| InterfaceError::Poisoned)?;
        *binding = Some((local_proxy, udp_enabled));
        info!(
            "Proxy available at socks5://{} (UDP {})",
            local_proxy,
            if udp_enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    async fn disconnect(&self) {
        if let Ok(mut binding) = self.binding.lock() {
            *binding = None;
        }
    }

    async fn tear_down(&self) {
        self.disconnect().await;
    }
}

/// Interface errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum InterfaceError {
    #[error("Failed to connect interface: {0}")]
    Connect(String),

    #[error("Interface state poisoned")]
    Poisoned,
}
