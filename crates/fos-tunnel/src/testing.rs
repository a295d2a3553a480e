//! In-crate collaborators for unit tests

use crate::connectivity::ConnectivityChecks;
use crate::descriptor::TunnelConfig;
use crate::event::{Presenter, RecordingEventSink};
use crate::interface::{InterfaceError, TunnelInterfaceHandle};
use crate::network::{
    NetworkChangeReactor, NetworkError, NetworkEvent, NetworkId, NetworkMonitor, NetworkState,
};
use crate::orchestrator::{
    Collaborators, OrchestratorSettings, ServiceLifecycle, TunnelOrchestrator,
};
use crate::pool::WorkerPool;
use crate::proxy::{ProxyError, ProxyProcessHandle};
use crate::state::TunnelStatus;
use crate::store::MemoryStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub(crate) fn test_config() -> TunnelConfig {
    TunnelConfig::new()
        .with("host", "1.2.3.4")
        .with("port", 8388)
        .with("password", "x")
}

/// Scripted check results; `None` never completes
pub(crate) struct FakeChecks {
    pub udp: AtomicBool,
    pub udp_hangs: bool,
    pub reachable: Option<bool>,
    pub credentials: Option<bool>,
}

impl FakeChecks {
    pub fn new(udp: bool, reachable: Option<bool>, credentials: Option<bool>) -> Self {
        Self {
            udp: AtomicBool::new(udp),
            udp_hangs: false,
            reachable,
            credentials,
        }
    }

    pub fn set_udp(&self, udp: bool) {
        self.udp.store(udp, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectivityChecks for FakeChecks {
    async fn is_udp_forwarding_enabled(&self, _local: SocketAddr) -> bool {
        if self.udp_hangs {
            std::future::pending::<()>().await;
        }
        self.udp.load(Ordering::SeqCst)
    }

    async fn is_server_reachable(&self, _host: &str, _port: u16) -> bool {
        match self.reachable {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }

    async fn validate_server_credentials(&self, _local: SocketAddr) -> bool {
        match self.credentials {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }
}

#[derive(Default)]
pub(crate) struct FakeProxy {
    starts: AtomicUsize,
    stops: AtomicUsize,
    fail_next: AtomicBool,
}

impl FakeProxy {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn fail_next_start(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProxyProcessHandle for FakeProxy {
    async fn start(&self, _config: &TunnelConfig) -> Result<(), ProxyError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(ProxyError::Exited("exit status 1".into()));
        }
        Ok(())
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn local_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 1081))
    }
}

pub(crate) struct FakeInterface {
    establish_ok: AtomicBool,
    connect_ok: AtomicBool,
    prepared: AtomicBool,
    establishes: AtomicUsize,
    disconnects: AtomicUsize,
    teardowns: AtomicUsize,
    connects: Mutex<Vec<(SocketAddr, bool)>>,
    underlying: Mutex<Option<NetworkId>>,
}

impl Default for FakeInterface {
    fn default() -> Self {
        Self {
            establish_ok: AtomicBool::new(true),
            connect_ok: AtomicBool::new(true),
            prepared: AtomicBool::new(true),
            establishes: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            teardowns: AtomicUsize::new(0),
            connects: Mutex::new(Vec::new()),
            underlying: Mutex::new(None),
        }
    }
}

impl FakeInterface {
    pub fn refuse_establish(&self) {
        self.establish_ok.store(false, Ordering::SeqCst);
    }

    pub fn fail_connect(&self) {
        self.connect_ok.store(false, Ordering::SeqCst);
    }

    pub fn revoke_permission(&self) {
        self.prepared.store(false, Ordering::SeqCst);
    }

    pub fn establishes(&self) -> usize {
        self.establishes.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn teardowns(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> Vec<(SocketAddr, bool)> {
        self.connects.lock().unwrap().clone()
    }

    pub fn underlying(&self) -> Option<NetworkId> {
        *self.underlying.lock().unwrap()
    }
}

#[async_trait]
impl TunnelInterfaceHandle for FakeInterface {
    async fn establish(&self) -> bool {
        self.establishes.fetch_add(1, Ordering::SeqCst);
        self.establish_ok.load(Ordering::SeqCst)
    }

    async fn connect(
        &self,
        local_proxy: SocketAddr,
        udp_enabled: bool,
    ) -> Result<(), InterfaceError> {
        if !self.connect_ok.load(Ordering::SeqCst) {
            return Err(InterfaceError::Connect("refused".into()));
        }
        self.connects.lock().unwrap().push((local_proxy, udp_enabled));
        Ok(())
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    async fn tear_down(&self) {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
    }

    fn set_underlying_network(&self, network: Option<NetworkId>) -> bool {
        *self.underlying.lock().unwrap() = network;
        true
    }

    fn is_prepared(&self) -> bool {
        self.prepared.load(Ordering::SeqCst)
    }
}

/// Monitor driven by the test; the active network starts out lost
#[derive(Default)]
pub(crate) struct FakeMonitor {
    states: Mutex<HashMap<NetworkId, NetworkState>>,
    active: Mutex<Option<NetworkState>>,
    sender: Mutex<Option<mpsc::Sender<NetworkEvent>>>,
    registrations: AtomicUsize,
    unregistrations: AtomicUsize,
}

impl FakeMonitor {
    pub fn set_state(&self, network: NetworkId, state: NetworkState) {
        self.states.lock().unwrap().insert(network, state);
    }

    pub fn set_active(&self, state: Option<NetworkState>) {
        *self.active.lock().unwrap() = state;
    }

    pub fn registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }

    pub fn unregistrations(&self) -> usize {
        self.unregistrations.load(Ordering::SeqCst)
    }

    pub async fn send(&self, event: NetworkEvent) {
        let sender = self.sender.lock().unwrap().clone();
        sender.expect("monitor not registered").send(event).await.unwrap();
    }
}

impl NetworkMonitor for FakeMonitor {
    fn register(&self) -> Result<mpsc::Receiver<NetworkEvent>, NetworkError> {
        let (tx, rx) = mpsc::channel(8);
        *self.sender.lock().unwrap() = Some(tx);
        self.registrations.fetch_add(1, Ordering::SeqCst);
        Ok(rx)
    }

    fn unregister(&self) -> Result<(), NetworkError> {
        self.unregistrations.fetch_add(1, Ordering::SeqCst);
        self.sender
            .lock()
            .unwrap()
            .take()
            .map(|_| ())
            .ok_or(NetworkError::NotRegistered)
    }

    fn network_state(&self, network: NetworkId) -> Option<NetworkState> {
        self.states.lock().unwrap().get(&network).copied()
    }

    fn active_network_state(&self) -> Option<NetworkState> {
        *self.active.lock().unwrap()
    }
}

/// Records every status shown; `last` is `None` once cleared
#[derive(Default)]
pub(crate) struct RecordingPresenter {
    history: Mutex<Vec<TunnelStatus>>,
    current: Mutex<Option<TunnelStatus>>,
    cleared: AtomicUsize,
}

impl RecordingPresenter {
    pub fn last(&self) -> Option<TunnelStatus> {
        *self.current.lock().unwrap()
    }

    pub fn history(&self) -> Vec<TunnelStatus> {
        self.history.lock().unwrap().clone()
    }

    pub fn cleared(&self) -> usize {
        self.cleared.load(Ordering::SeqCst)
    }
}

impl Presenter for RecordingPresenter {
    fn show(&self, _server_name: &str, status: TunnelStatus) {
        self.history.lock().unwrap().push(status);
        *self.current.lock().unwrap() = Some(status);
    }

    fn clear(&self) {
        self.cleared.fetch_add(1, Ordering::SeqCst);
        *self.current.lock().unwrap() = None;
    }
}

#[derive(Default)]
pub(crate) struct FakeLifecycle {
    exit: AtomicBool,
}

impl FakeLifecycle {
    pub fn exit_requested(&self) -> bool {
        self.exit.load(Ordering::SeqCst)
    }
}

impl ServiceLifecycle for FakeLifecycle {
    fn request_exit(&self) {
        self.exit.store(true, Ordering::SeqCst);
    }
}

/// Orchestrator wired to fakes, with handles to each of them
pub(crate) struct Harness {
    pub orchestrator: TunnelOrchestrator,
    pub proxy: Arc<FakeProxy>,
    pub interface: Arc<FakeInterface>,
    pub store: Arc<MemoryStore>,
    pub events: Arc<RecordingEventSink>,
    pub presenter: Arc<RecordingPresenter>,
    pub monitor: Arc<FakeMonitor>,
    pub checks: Arc<FakeChecks>,
    pub lifecycle: Arc<FakeLifecycle>,
}

impl Harness {
    /// Every check passes
    pub fn new() -> Self {
        Self::with_checks(FakeChecks::new(true, Some(true), Some(true)))
    }

    pub fn with_checks(checks: FakeChecks) -> Self {
        Self::build(checks, OrchestratorSettings::default())
    }

    pub fn with_store(store: MemoryStore) -> Self {
        Self::assemble(
            FakeChecks::new(true, Some(true), Some(true)),
            store,
            OrchestratorSettings::default(),
        )
    }

    pub fn build(checks: FakeChecks, settings: OrchestratorSettings) -> Self {
        Self::assemble(checks, MemoryStore::new(), settings)
    }

    fn assemble(checks: FakeChecks, store: MemoryStore, settings: OrchestratorSettings) -> Self {
        let proxy = Arc::new(FakeProxy::default());
        let interface = Arc::new(FakeInterface::default());
        let store = Arc::new(store);
        let events = Arc::new(RecordingEventSink::new());
        let presenter = Arc::new(RecordingPresenter::default());
        let monitor = Arc::new(FakeMonitor::default());
        let checks = Arc::new(checks);
        let lifecycle = Arc::new(FakeLifecycle::default());

        let orchestrator = TunnelOrchestrator::new(
            Collaborators {
                proxy: proxy.clone(),
                interface: interface.clone(),
                store: store.clone(),
                events: events.clone(),
                presenter: presenter.clone(),
                network: monitor.clone(),
                checks: checks.clone(),
                lifecycle: lifecycle.clone(),
            },
            WorkerPool::default(),
            settings,
        );

        Self {
            orchestrator,
            proxy,
            interface,
            store,
            events,
            presenter,
            monitor,
            checks,
            lifecycle,
        }
    }

    /// Reactor bound to this harness, for driving events directly
    pub fn reactor(&self) -> NetworkChangeReactor {
        NetworkChangeReactor::new(self.orchestrator.clone(), self.monitor.clone())
    }
}
