//! fOS Tunnel - Single-Tunnel VPN Lifecycle Service
//!
//! Starts, restarts and stops one proxy-backed tunnel at a time, checks
//! that the server is usable before committing to it, and follows the
//! device across network changes.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      TunnelOrchestrator                      │
//! │                (one session, one lock, one tunnel)           │
//! │                                                              │
//! │  start ──▶ WorkerPool ──▶ ProxyProcessHandle ──▶ Probe ──┐   │
//! │                                                          │   │
//! │  ┌──────────────────┐    ┌────────────────┐    ┌─────────▼─┐ │
//! │  │ TunnelStateStore │◀───│ EventSink /    │◀───│ Tunnel    │ │
//! │  │ (last good)      │    │ Presenter      │    │ Interface │ │
//! │  └──────────────────┘    └────────────────┘    └───────────┘ │
//! │            ▲                                                 │
//! │            │ restart on UDP change                           │
//! │  ┌─────────┴──────────────┐      ┌────────────────┐          │
//! │  │ NetworkChangeReactor   │◀─────│ NetworkMonitor │          │
//! │  └────────────────────────┘      └────────────────┘          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Connectivity probe**: UDP relay, reachability and credentials
//!   checked concurrently; TCP-only servers are still usable
//! - **Seamless restart**: a new tunnel replaces the active one without
//!   tearing down the interface
//! - **Auto-start**: resumes the last tunnel that reached `Connected`
//! - **Network following**: reports `Reconnecting` on loss and re-checks
//!   UDP support when a network comes back

mod config;
mod connectivity;
mod descriptor;
mod event;
mod interface;
mod network;
mod orchestrator;
mod pool;
mod probe;
mod proxy;
mod state;
mod store;

#[cfg(test)]
mod testing;

pub use config::{RouteConfig, ServiceConfig, ServiceConfigError};
pub use connectivity::{CheckConfig, ConnectivityChecks, SocksConnectivity};
pub use descriptor::{ConfigError, DEFAULT_SERVER_NAME, TunnelConfig, TunnelDescriptor};
pub use event::{
    BroadcastEventSink, EventSink, LifecycleAction, LifecycleEvent, LogPresenter, Presenter,
    RecordingEventSink,
};
pub use interface::{DirectProxyInterface, InterfaceError, TunnelInterfaceHandle};
pub use network::{
    NetworkError, NetworkEvent, NetworkId, NetworkMonitor, NetworkState, RouteWatcher,
};
pub use orchestrator::{
    Collaborators, OrchestratorSettings, ServiceLifecycle, TunnelError, TunnelOrchestrator,
};
pub use pool::{DEFAULT_POOL_SIZE, MIN_POOL_SIZE, PoolTask, WorkerPool};
pub use probe::{ConnectivityProbe, ProbeError};
pub use proxy::{CommandProxy, CommandProxyConfig, ProxyError, ProxyProcessHandle};
pub use state::{CapabilitySet, ConnectivityResult, ErrorCode, ProbeFailure, TunnelStatus};
pub use store::{JsonFileStore, MemoryStore, StoreError, TunnelStateStore};
