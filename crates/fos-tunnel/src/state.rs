//! Tunnel status, error codes and probe outcomes
//!
//! The integer values of [`TunnelStatus`] and [`ErrorCode`] are part of the
//! host application protocol and must not be renumbered.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Tunnel connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    /// Tunnel is up and traffic flows
    Connected,
    /// No tunnel is active
    Disconnected,
    /// Tunnel is active but the underlying network is gone
    Reconnecting,
    /// Start in progress
    Connecting,
}

impl TunnelStatus {
    /// Wire value for the host application
    pub fn code(&self) -> i32 {
        match self {
            TunnelStatus::Connected => 0,
            TunnelStatus::Disconnected => 1,
            TunnelStatus::Reconnecting => 2,
            TunnelStatus::Connecting => 3,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, TunnelStatus::Connected)
    }
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TunnelStatus::Connected => "Connected",
            TunnelStatus::Disconnected => "Disconnected",
            TunnelStatus::Reconnecting => "Reconnecting",
            TunnelStatus::Connecting => "Connecting",
        };
        f.write_str(s)
    }
}

/// Outcome codes reported to the host application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NoError,
    Unexpected,
    VpnPermissionNotGranted,
    InvalidServerCredentials,
    /// Soft error: the tunnel works in TCP-only mode
    UdpRelayNotEnabled,
    ServerUnreachable,
    VpnStartFailure,
    IllegalServerConfiguration,
    ProxyStartFailure,
    ConfigureSystemProxyFailure,
}

impl ErrorCode {
    /// Wire value for the host application
    pub fn code(&self) -> i32 {
        match self {
            ErrorCode::NoError => 0,
            ErrorCode::Unexpected => 1,
            ErrorCode::VpnPermissionNotGranted => 2,
            ErrorCode::InvalidServerCredentials => 3,
            ErrorCode::UdpRelayNotEnabled => 4,
            ErrorCode::ServerUnreachable => 5,
            ErrorCode::VpnStartFailure => 6,
            ErrorCode::IllegalServerConfiguration => 7,
            ErrorCode::ProxyStartFailure => 8,
            ErrorCode::ConfigureSystemProxyFailure => 9,
        }
    }

    /// Whether a start may go on after this outcome
    pub fn is_continuable(&self) -> bool {
        matches!(self, ErrorCode::NoError | ErrorCode::UdpRelayNotEnabled)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

/// Capabilities of the current network path to the server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    pub udp_forwarding_supported: bool,
}

/// Why a probe declared the endpoint unusable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeFailure {
    /// Server answers but rejects the credentials
    InvalidCredentials,
    /// Nothing conclusive; assume the server cannot be reached
    Unreachable,
}

/// Result of a [`ConnectivityProbe`](crate::probe::ConnectivityProbe) run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityResult {
    /// TCP and UDP both work
    Usable,
    /// TCP works, UDP relay does not
    UsableNoUdp,
    UnreachableOrInvalid(ProbeFailure),
}

impl ConnectivityResult {
    pub fn is_usable(&self) -> bool {
        !matches!(self, ConnectivityResult::UnreachableOrInvalid(_))
    }
}

impl From<ConnectivityResult> for ErrorCode {
    fn from(result: ConnectivityResult) -> Self {
        match result {
            ConnectivityResult::Usable => ErrorCode::NoError,
            ConnectivityResult::UsableNoUdp => ErrorCode::UdpRelayNotEnabled,
            ConnectivityResult::UnreachableOrInvalid(ProbeFailure::InvalidCredentials) => {
                ErrorCode::InvalidServerCredentials
            }
            ConnectivityResult::UnreachableOrInvalid(ProbeFailure::Unreachable) => {
                ErrorCode::ServerUnreachable
            }
        }
    }
}
