//! Network Change Reactor
//!
//! Follows the device's active network while a tunnel is up:
//!
//! - **Available** (validated as connected): report `Connected`, pin
//!   underlying traffic to the new network, and re-check UDP relay. UDP
//!   support belongs to the network path, so a change restarts the tunnel.
//! - **Lost** (and no other network connected): report `Reconnecting` and
//!   unpin underlying traffic.
//!
//! The monitor is registered when a tunnel is freshly started and
//! unregistered on teardown; the reactor task ends when its event channel
//! closes.

use crate::orchestrator::TunnelOrchestrator;
use crate::state::TunnelStatus;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Opaque identifier of a physical network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkId(pub u64);

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Network({})", self.0)
    }
}

/// Connection state of a network as the OS reports it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    Connecting,
    Connected,
    Disconnected,
}

/// Unsolicited network change notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    Available(NetworkId),
    Lost(NetworkId),
}

/// Source of network change notifications
pub trait NetworkMonitor: Send + Sync {
    /// Start delivering events
    fn register(&self) -> Result<mpsc::Receiver<NetworkEvent>, NetworkError>;

    /// Stop delivering events; closes the channel returned by `register`
    fn unregister(&self) -> Result<(), NetworkError>;

    /// Current state of a specific network
    fn network_state(&self, network: NetworkId) -> Option<NetworkState>;

    /// State of the network the OS currently routes through
    fn active_network_state(&self) -> Option<NetworkState>;
}

/// Reacts to network events on behalf of the orchestrator
pub(crate) struct NetworkChangeReactor {
    orchestrator: TunnelOrchestrator,
    monitor: Arc<dyn NetworkMonitor>,
}

impl NetworkChangeReactor {
    pub(crate) fn new(orchestrator: TunnelOrchestrator, monitor: Arc<dyn NetworkMonitor>) -> Self {
        Self {
            orchestrator,
            monitor,
        }
    }

    /// Consume events until the monitor closes the channel
    pub(crate) fn spawn(self, mut events: mpsc::Receiver<NetworkEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            debug!("Network change reactor started");
            while let Some(event) = events.recv().await {
                match event {
                    NetworkEvent::Available(network) => self.on_available(network).await,
                    NetworkEvent::Lost(network) => self.on_lost(network).await,
                }
            }
            debug!("Network change reactor stopped");
        })
    }

    pub(crate) async fn on_available(&self, network: NetworkId) {
        let state = self.monitor.network_state(network);
        debug!("Network available: {} ({:?})", network, state);
        if state != Some(NetworkState::Connected) {
            return;
        }

        let Some(active) = self.orchestrator.report_status(TunnelStatus::Connected).await else {
            return;
        };

        let shared = self.orchestrator.shared();
        if !shared.interface.set_underlying_network(Some(network)) {
            debug!("Platform does not support underlying network binding");
        }

        let is_udp_supported = shared.probe.check_udp(shared.proxy.local_addr()).await;
        let Some(was_udp_supported) = self
            .orchestrator
            .record_udp_support(&active, is_udp_supported)
            .await
        else {
            return;
        };
        info!("UDP support: {} -> {}", was_udp_supported, is_udp_supported);

        if is_udp_supported != was_udp_supported {
            info!("UDP support changed with the network, restarting {}", active.id);
            self.orchestrator.restart_if_active(active).await;
        }
    }

    pub(crate) async fn on_lost(&self, network: NetworkId) {
        debug!("Network lost: {}", network);
        if self.monitor.active_network_state() == Some(NetworkState::Connected) {
            // Another network already took over
            return;
        }

        if self
            .orchestrator
            .report_status(TunnelStatus::Reconnecting)
            .await
            .is_some()
        {
            self.orchestrator.shared().interface.set_underlying_network(None);
        }
    }
}

/// Polling monitor that follows the default route.
///
/// A connected UDP socket never sends anything, but connecting it makes
/// the OS pick the outgoing interface, which reveals the local address of
/// the current default route. Each distinct address is one network.
pub struct RouteWatcher {
    target: SocketAddr,
    interval: Duration,
    inner: Arc<Mutex<RouteState>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
struct RouteState {
    networks: HashMap<IpAddr, NetworkId>,
    current: Option<IpAddr>,
    next_id: u64,
}

impl RouteState {
    fn id_for(&mut self, ip: IpAddr) -> NetworkId {
        if let Some(id) = self.networks.get(&ip) {
            return *id;
        }
        self.next_id += 1;
        let id = NetworkId(self.next_id);
        self.networks.insert(ip, id);
        id
    }

    /// Move to `next`, returning the events that describe the change
    fn transition(&mut self, next: Option<IpAddr>) -> Vec<NetworkEvent> {
        if next == self.current {
            return Vec::new();
        }

        let mut events = Vec::new();
        let previous = self.current.take();
        if let Some(ip) = next {
            events.push(NetworkEvent::Available(self.id_for(ip)));
        }
        if let Some(ip) = previous {
            events.push(NetworkEvent::Lost(self.id_for(ip)));
        }
        self.current = next;
        events
    }

    fn state_of(&self, network: NetworkId) -> Option<NetworkState> {
        let ip = self
            .networks
            .iter()
            .find_map(|(ip, id)| (*id == network).then_some(*ip))?;
        Some(if self.current == Some(ip) {
            NetworkState::Connected
        } else {
            NetworkState::Disconnected
        })
    }
}

impl RouteWatcher {
    pub fn new(target: SocketAddr, interval: Duration) -> Self {
        Self {
            target,
            interval,
            inner: Arc::new(Mutex::new(RouteState::default())),
            task: Mutex::new(None),
        }
    }

    /// Local address of the route towards `target`; loopback counts only
    /// when `target` itself is loopback
    async fn default_route(target: SocketAddr) -> Option<IpAddr> {
        let bind: SocketAddr = if target.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from((std::net::Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(bind).await.ok()?;
        socket.connect(target).await.ok()?;
        let ip = socket.local_addr().ok()?.ip();
        let routed = !ip.is_unspecified() && (target.ip().is_loopback() || !ip.is_loopback());
        routed.then_some(ip)
    }

    async fn poll(
        target: SocketAddr,
        interval: Duration,
        inner: Arc<Mutex<RouteState>>,
        tx: mpsc::Sender<NetworkEvent>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let route = Self::default_route(target).await;
            let events = match inner.lock() {
                Ok(mut state) => state.transition(route),
                Err(_) => break,
            };
            for event in events {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        }
    }
}

impl NetworkMonitor for RouteWatcher {
    fn register(&self) -> Result<mpsc::Receiver<NetworkEvent>, NetworkError> {
        let mut task = self.task.lock().map_err(|_| NetworkError::Poisoned)?;
        if let Some(previous) = task.take() {
            previous.abort();
        }

        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(Self::poll(
            self.target,
            self.interval,
            self.inner.clone(),
            tx,
        ));
        *task = Some(handle);
        info!("Watching default route towards {}", self.target);
        Ok(rx)
    }

    fn unregister(&self) -> Result<(), NetworkError> {
        let mut task = self.task.lock().map_err(|_| NetworkError::Poisoned)?;
        match task.take() {
            Some(handle) => {
                handle.abort();
                Ok(())
            }
            None => Err(NetworkError::NotRegistered),
        }
    }

    fn network_state(&self, network: NetworkId) -> Option<NetworkState> {
        self.inner.lock().ok()?.state_of(network)
    }

    fn active_network_state(&self) -> Option<NetworkState> {
        let state = self.inner.lock().ok()?;
        state.current.map(|_| NetworkState::Connected)
    }
}

/// Network monitor errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkError {
    #[error("Network monitor not registered")]
    NotRegistered,

    #[error("Network monitor state poisoned")]
    Poisoned,
}
