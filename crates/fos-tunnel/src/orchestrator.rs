//! Tunnel Orchestrator
//!
//! Owns the single active tunnel and drives it through start, restart,
//! stop and teardown.
//!
//! # Usage
//!
//! ```rust,ignore
//! let orchestrator = TunnelOrchestrator::new(collaborators, WorkerPool::default(), settings);
//!
//! let code = orchestrator.start("office", config).await?;
//! if code.is_continuable() {
//!     println!("Connected ({})", code);
//! }
//!
//! orchestrator.stop("office").await?;
//! ```
//!
//! Every top-level operation holds the session lock for its whole sequence,
//! so a stop can never interleave with a half-finished start. Queries read
//! a mirror of the session and never wait on that lock.

use crate::connectivity::ConnectivityChecks;
use crate::descriptor::{TunnelConfig, TunnelDescriptor};
use crate::event::{EventSink, LifecycleEvent, Presenter};
use crate::interface::TunnelInterfaceHandle;
use crate::network::{NetworkChangeReactor, NetworkMonitor};
use crate::pool::WorkerPool;
use crate::probe::ConnectivityProbe;
use crate::proxy::ProxyProcessHandle;
use crate::state::{ErrorCode, TunnelStatus};
use crate::store::TunnelStateStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Hook into the hosting process
pub trait ServiceLifecycle: Send + Sync {
    /// Ask the host to shut the service down
    fn request_exit(&self);
}

/// Collaborators the orchestrator drives
pub struct Collaborators {
    pub proxy: Arc<dyn ProxyProcessHandle>,
    pub interface: Arc<dyn TunnelInterfaceHandle>,
    pub store: Arc<dyn TunnelStateStore>,
    pub events: Arc<dyn EventSink>,
    pub presenter: Arc<dyn Presenter>,
    pub network: Arc<dyn NetworkMonitor>,
    pub checks: Arc<dyn ConnectivityChecks>,
    pub lifecycle: Arc<dyn ServiceLifecycle>,
}

/// Optional time limits; `None` waits indefinitely
#[derive(Debug, Clone, Copy, Default)]
pub struct OrchestratorSettings {
    /// Limit on proxy start plus connectivity probe
    pub proxy_start_timeout: Option<Duration>,
    /// Limit on each individual connectivity check
    pub probe_timeout: Option<Duration>,
}

/// Orchestrator errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TunnelError {
    #[error("Missing tunnel ID")]
    MissingTunnelId,

    #[error("Missing tunnel configuration")]
    MissingConfig,

    #[error("Tunnel not active: {0}")]
    NotActive(String),
}

#[derive(Default)]
struct Session {
    active: Option<TunnelDescriptor>,
    /// Reactor consuming network events, present while monitoring
    reactor: Option<JoinHandle<()>>,
}

impl Session {
    fn active_id(&self) -> Option<String> {
        self.active.as_ref().map(|d| d.id.clone())
    }

    fn is_active(&self, tunnel_id: &str) -> bool {
        self.active.as_ref().is_some_and(|d| d.id == tunnel_id)
    }
}

/// State shared between the orchestrator handles and the reactor
pub(crate) struct Shared {
    pub(crate) proxy: Arc<dyn ProxyProcessHandle>,
    pub(crate) interface: Arc<dyn TunnelInterfaceHandle>,
    pub(crate) store: Arc<dyn TunnelStateStore>,
    pub(crate) probe: ConnectivityProbe,
    events: Arc<dyn EventSink>,
    presenter: Arc<dyn Presenter>,
    network: Arc<dyn NetworkMonitor>,
    lifecycle: Arc<dyn ServiceLifecycle>,
    pool: WorkerPool,
    settings: OrchestratorSettings,
    session: Mutex<Session>,
    /// Mirrors of the session, readable without waiting on an in-flight start
    status: RwLock<TunnelStatus>,
    active: RwLock<Option<TunnelDescriptor>>,
}

/// Cloneable handle to the tunnel service
#[derive(Clone)]
pub struct TunnelOrchestrator {
    shared: Arc<Shared>,
}

impl TunnelOrchestrator {
    /// Create an orchestrator; the pool runs proxy starts and probes
    pub fn new(
        collaborators: Collaborators,
        pool: WorkerPool,
        settings: OrchestratorSettings,
    ) -> Self {
        let probe = ConnectivityProbe::new(collaborators.checks, pool.clone())
            .with_timeout(settings.probe_timeout);

        Self {
            shared: Arc::new(Shared {
                proxy: collaborators.proxy,
                interface: collaborators.interface,
                store: collaborators.store,
                probe,
                events: collaborators.events,
                presenter: collaborators.presenter,
                network: collaborators.network,
                lifecycle: collaborators.lifecycle,
                pool,
                settings,
                session: Mutex::new(Session::default()),
                status: RwLock::new(TunnelStatus::Disconnected),
                active: RwLock::new(None),
            }),
        }
    }

    /// Start `tunnel_id`, replacing any active tunnel.
    ///
    /// Returns the outcome of the attempt; `NoError` and
    /// `UdpRelayNotEnabled` leave the tunnel connected.
    pub async fn start(
        &self,
        tunnel_id: &str,
        config: TunnelConfig,
    ) -> Result<ErrorCode, TunnelError> {
        if tunnel_id.is_empty() {
            return Err(TunnelError::MissingTunnelId);
        }
        if config.is_empty() {
            return Err(TunnelError::MissingConfig);
        }

        let mut session = self.shared.session.lock().await;
        let descriptor = TunnelDescriptor::new(tunnel_id, config);
        Ok(self.start_locked(&mut session, descriptor, false).await)
    }

    /// Stop `tunnel_id`, which must be the active tunnel
    pub async fn stop(&self, tunnel_id: &str) -> Result<(), TunnelError> {
        if tunnel_id.is_empty() {
            return Err(TunnelError::MissingTunnelId);
        }

        let mut session = self.shared.session.lock().await;
        if !session.is_active(tunnel_id) {
            warn!("Cannot stop inactive tunnel {}", tunnel_id);
            return Err(TunnelError::NotActive(tunnel_id.to_string()));
        }

        info!("Stopping tunnel {}", tunnel_id);
        self.emit(LifecycleEvent::stop(session.active_id()));
        self.tear_down(&mut session).await;
        Ok(())
    }

    /// Whether `tunnel_id` is the active tunnel, including one still starting
    pub async fn is_active(&self, tunnel_id: &str) -> Result<bool, TunnelError> {
        if tunnel_id.is_empty() {
            return Err(TunnelError::MissingTunnelId);
        }
        let active = self.shared.active.read().await;
        Ok(active.as_ref().is_some_and(|d| d.id == tunnel_id))
    }

    /// Snapshot of the active tunnel
    pub async fn active_tunnel(&self) -> Option<TunnelDescriptor> {
        self.shared.active.read().await.clone()
    }

    /// Last reported status
    pub async fn status(&self) -> TunnelStatus {
        *self.shared.status.read().await
    }

    /// Bring back the last tunnel that reached `Connected`.
    ///
    /// Requests process exit when there is nothing to resume or the VPN
    /// permission is gone. Returns the start outcome, or `None` after an
    /// exit request.
    pub async fn resume_last_known_tunnel_or_exit(&self) -> Option<ErrorCode> {
        info!("Received auto-connect request, loading last successful tunnel");
        let mut session = self.shared.session.lock().await;

        let descriptor = match self.shared.store.load() {
            Ok(Some(descriptor)) if !descriptor.id.is_empty() && !descriptor.config.is_empty() => {
                descriptor
            }
            Ok(Some(descriptor)) => {
                error!("Stored tunnel {:?} is incomplete, exiting", descriptor.id);
                self.shared.lifecycle.request_exit();
                return None;
            }
            Ok(None) => {
                info!("No tunnel was connected at shutdown, exiting");
                self.shared.lifecycle.request_exit();
                return None;
            }
            Err(e) => {
                error!("Failed to load last successful tunnel: {}", e);
                self.shared.lifecycle.request_exit();
                return None;
            }
        };

        if !self.shared.interface.is_prepared() {
            warn!("VPN permission not granted, aborting auto-connect");
            self.shared.lifecycle.request_exit();
            return None;
        }

        self.shared
            .presenter
            .show(descriptor.config.server_name(), TunnelStatus::Reconnecting);
        Some(self.start_locked(&mut session, descriptor, true).await)
    }

    /// The OS withdrew the VPN permission
    pub async fn revoke(&self) {
        info!("VPN permission revoked");
        let mut session = self.shared.session.lock().await;
        self.emit(LifecycleEvent::status_change(
            session.active_id(),
            TunnelStatus::Disconnected,
        ));
        self.tear_down(&mut session).await;
    }

    /// Service shutdown; tears down without notifying
    pub async fn destroy(&self) {
        info!("Destroying tunnel service");
        let mut session = self.shared.session.lock().await;
        self.tear_down(&mut session).await;
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    /// Report a connectivity change for the active tunnel.
    ///
    /// Returns the active tunnel, or `None` when nothing is active and the
    /// report was dropped.
    pub(crate) async fn report_status(&self, status: TunnelStatus) -> Option<TunnelDescriptor> {
        let session = self.shared.session.lock().await;
        let active = session.active.clone()?;

        self.emit(LifecycleEvent::status_change(Some(active.id.clone()), status));
        self.shared.presenter.show(active.config.server_name(), status);
        self.set_status(status).await;
        Some(active)
    }

    /// Persist the UDP support measured for `descriptor`.
    ///
    /// Returns the previously stored flag, or `None` when `descriptor` is no
    /// longer active and nothing was written.
    pub(crate) async fn record_udp_support(
        &self,
        descriptor: &TunnelDescriptor,
        supported: bool,
    ) -> Option<bool> {
        let session = self.shared.session.lock().await;
        if session.active.as_ref() != Some(descriptor) {
            debug!("Tunnel {} no longer active, dropping UDP result", descriptor.id);
            return None;
        }
        let previous = self.shared.store.is_udp_supported();
        if let Err(e) = self.shared.store.set_udp_supported(supported) {
            warn!("Failed to persist UDP support: {}", e);
        }
        Some(previous)
    }

    /// Restart `descriptor` if it is still the active tunnel
    pub(crate) async fn restart_if_active(
        &self,
        descriptor: TunnelDescriptor,
    ) -> Option<ErrorCode> {
        let mut session = self.shared.session.lock().await;
        if session.active.as_ref() != Some(&descriptor) {
            debug!("Tunnel {} no longer active, skipping restart", descriptor.id);
            return None;
        }
        Some(self.start_locked(&mut session, descriptor, false).await)
    }

    async fn start_locked(
        &self,
        session: &mut Session,
        descriptor: TunnelDescriptor,
        is_auto_start: bool,
    ) -> ErrorCode {
        let shared = &self.shared;
        info!("Starting tunnel {}", descriptor);

        let is_restart = session.active.is_some();
        if is_restart {
            // The previous tunnel disconnects logically before the id changes
            self.emit(LifecycleEvent::status_change(
                session.active_id(),
                TunnelStatus::Disconnected,
            ));
            shared.presenter.clear();
        }
        self.set_active(session, Some(descriptor.clone())).await;
        self.set_status(TunnelStatus::Connecting).await;

        let error_code = self.start_proxy(&descriptor.config, !is_auto_start).await;
        if !error_code.is_continuable() {
            return self.fail_start(session, error_code).await;
        }

        if is_restart {
            // Reuse the interface; only the proxy binding changes
            shared.interface.disconnect().await;
        } else {
            if !shared.interface.establish().await {
                error!("Failed to establish the tunnel interface");
                return self.fail_start(session, ErrorCode::VpnStartFailure).await;
            }
            self.start_network_monitoring(session);
        }

        let udp_supported = if is_auto_start {
            shared.store.is_udp_supported()
        } else {
            error_code == ErrorCode::NoError
        };

        if let Err(e) = shared
            .interface
            .connect(shared.proxy.local_addr(), udp_supported)
            .await
        {
            error!("Failed to connect the tunnel: {}", e);
            return self.fail_start(session, ErrorCode::VpnStartFailure).await;
        }

        self.emit(LifecycleEvent::start(session.active_id(), ErrorCode::NoError));
        shared
            .presenter
            .show(descriptor.config.server_name(), TunnelStatus::Connected);
        self.set_status(TunnelStatus::Connected).await;
        self.store_active(&descriptor, udp_supported);

        info!(
            "Tunnel {} connected (UDP {})",
            descriptor.id,
            if udp_supported { "enabled" } else { "disabled" }
        );
        error_code
    }

    /// Start the proxy and, unless suppressed, probe the server through it.
    ///
    /// The proxy start is one pool unit; the probe then fans out on the
    /// pool from here, so no pool work ever waits on other pool work.
    async fn start_proxy(&self, config: &TunnelConfig, check_connectivity: bool) -> ErrorCode {
        let (host, port) = match config.endpoint() {
            Ok((host, port)) => (host.to_string(), port),
            Err(e) => {
                error!("Illegal server configuration: {}", e);
                return ErrorCode::IllegalServerConfiguration;
            }
        };

        let attempt = async {
            let proxy = self.shared.proxy.clone();
            let config = config.clone();
            let started = self
                .shared
                .pool
                .spawn(async move { proxy.start(&config).await })
                .await;

            match started {
                Ok(Some(Ok(()))) => {}
                Ok(Some(Err(e))) => {
                    error!("Failed to start local proxy: {}", e);
                    return ErrorCode::ProxyStartFailure;
                }
                Ok(None) => {
                    error!("Worker pool closed before the proxy started");
                    return ErrorCode::ProxyStartFailure;
                }
                Err(e) => {
                    error!("Proxy start task failed: {}", e);
                    return ErrorCode::ProxyStartFailure;
                }
            }

            if !check_connectivity {
                return ErrorCode::NoError;
            }
            let local = self.shared.proxy.local_addr();
            ErrorCode::from(self.shared.probe.check(local, &host, port).await)
        };

        // Dropping the attempt on timeout aborts its pool tasks
        match self.shared.settings.proxy_start_timeout {
            Some(limit) => tokio::time::timeout(limit, attempt).await.unwrap_or_else(|_| {
                error!("Proxy start timed out after {:?}", limit);
                ErrorCode::ProxyStartFailure
            }),
            None => attempt.await,
        }
    }

    async fn fail_start(&self, session: &mut Session, error_code: ErrorCode) -> ErrorCode {
        warn!("Tunnel start failed: {}", error_code);
        self.emit(LifecycleEvent::start(session.active_id(), error_code));
        self.tear_down(session).await;
        error_code
    }

    /// Shared by every abort, stop, revoke and destroy. Safe when idle.
    async fn tear_down(&self, session: &mut Session) {
        let shared = &self.shared;
        debug!("Tearing down tunnel {:?}", session.active_id());

        shared.proxy.stop().await;
        shared.interface.disconnect().await;
        shared.interface.tear_down().await;
        shared.presenter.clear();
        self.set_active(session, None).await;
        self.stop_network_monitoring(session);

        self.set_status(TunnelStatus::Disconnected).await;
        if let Err(e) = shared.store.set_status(TunnelStatus::Disconnected) {
            warn!("Failed to persist tunnel status: {}", e);
        }
    }

    fn start_network_monitoring(&self, session: &mut Session) {
        if session.reactor.is_some() {
            return;
        }
        match self.shared.network.register() {
            Ok(events) => {
                let reactor = NetworkChangeReactor::new(self.clone(), self.shared.network.clone());
                session.reactor = Some(reactor.spawn(events));
            }
            Err(e) => warn!("Network monitoring unavailable: {}", e),
        }
    }

    fn stop_network_monitoring(&self, session: &mut Session) {
        // The reactor ends on its own once the monitor closes the channel;
        // it may be the caller, so it is never awaited here
        if session.reactor.take().is_none() {
            return;
        }
        if let Err(e) = self.shared.network.unregister() {
            debug!("Failed to unregister network monitor: {}", e);
        }
    }

    fn store_active(&self, descriptor: &TunnelDescriptor, udp_supported: bool) {
        let store = &self.shared.store;
        if let Err(e) = store.save(descriptor) {
            error!("Failed to store tunnel {}: {}", descriptor.id, e);
        }
        if let Err(e) = store.set_udp_supported(udp_supported) {
            error!("Failed to store UDP support: {}", e);
        }
        if let Err(e) = store.set_status(TunnelStatus::Connected) {
            error!("Failed to store tunnel status: {}", e);
        }
    }

    fn emit(&self, event: LifecycleEvent) {
        self.shared.events.emit(event);
    }

    async fn set_status(&self, status: TunnelStatus) {
        *self.shared.status.write().await = status;
    }

    async fn set_active(&self, session: &mut Session, active: Option<TunnelDescriptor>) {
        *self.shared.active.write().await = active.clone();
        session.active = active;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::LifecycleAction;
    use crate::network::{NetworkEvent, NetworkId};
    use crate::store::MemoryStore;
    use crate::testing::{FakeChecks, Harness, test_config};
    use serde_json::json;

    type Action = (LifecycleAction, ErrorCode, Option<String>, Option<TunnelStatus>);

    fn actions(harness: &Harness) -> Vec<Action> {
        harness
            .events
            .events()
            .into_iter()
            .map(|e| (e.action, e.error_code, e.tunnel_id, e.status))
            .collect()
    }

    #[tokio::test]
    async fn test_preconditions() {
        let harness = Harness::new();
        let orchestrator = &harness.orchestrator;

        assert_eq!(
            orchestrator.start("", test_config()).await,
            Err(TunnelError::MissingTunnelId)
        );
        assert_eq!(
            orchestrator.start("t1", TunnelConfig::new()).await,
            Err(TunnelError::MissingConfig)
        );
        assert_eq!(orchestrator.stop("").await, Err(TunnelError::MissingTunnelId));
        assert_eq!(orchestrator.is_active("").await, Err(TunnelError::MissingTunnelId));

        assert!(harness.events.events().is_empty());
        assert_eq!(harness.proxy.starts(), 0);
    }

    #[tokio::test]
    async fn test_successful_start_persists_state() {
        let harness = Harness::new();

        let code = harness.orchestrator.start("t1", test_config()).await.unwrap();

        assert_eq!(code, ErrorCode::NoError);
        assert!(harness.orchestrator.is_active("t1").await.unwrap());
        assert_eq!(harness.orchestrator.status().await, TunnelStatus::Connected);
        assert_eq!(
            harness.store.load().unwrap(),
            Some(TunnelDescriptor::new("t1", test_config()))
        );
        assert_eq!(harness.store.status(), TunnelStatus::Connected);
        assert!(harness.store.is_udp_supported());
        assert_eq!(harness.interface.connects(), vec![(harness.proxy.local_addr(), true)]);
        assert_eq!(harness.monitor.registrations(), 1);
        assert_eq!(
            actions(&harness),
            vec![(LifecycleAction::Start, ErrorCode::NoError, Some("t1".into()), None)]
        );
        assert_eq!(harness.presenter.last(), Some(TunnelStatus::Connected));
    }

    #[tokio::test]
    async fn test_tcp_only_start() {
        let harness = Harness::with_checks(FakeChecks::new(false, Some(true), Some(true)));

        let code = harness.orchestrator.start("t1", test_config()).await.unwrap();

        assert_eq!(code, ErrorCode::UdpRelayNotEnabled);
        assert!(harness.orchestrator.is_active("t1").await.unwrap());
        assert!(!harness.store.is_udp_supported());
        assert_eq!(harness.interface.connects(), vec![(harness.proxy.local_addr(), false)]);
        // The event reports the connection, not the degraded mode
        assert_eq!(harness.events.events()[0].error_code, ErrorCode::NoError);
    }

    #[tokio::test]
    async fn test_failed_probe_tears_down() {
        let harness = Harness::with_checks(FakeChecks::new(false, Some(true), Some(false)));
        let known_good = TunnelDescriptor::new("old", test_config());
        harness.store.save(&known_good).unwrap();
        harness.store.set_udp_supported(true).unwrap();

        let code = harness.orchestrator.start("t1", test_config()).await.unwrap();

        assert_eq!(code, ErrorCode::InvalidServerCredentials);
        assert!(!harness.orchestrator.is_active("t1").await.unwrap());
        assert!(harness.orchestrator.active_tunnel().await.is_none());
        assert_eq!(harness.orchestrator.status().await, TunnelStatus::Disconnected);
        assert_eq!(harness.store.load().unwrap(), Some(known_good));
        assert!(harness.store.is_udp_supported());
        assert_eq!(harness.store.status(), TunnelStatus::Disconnected);
        assert_eq!(harness.proxy.stops(), 1);
        assert_eq!(harness.interface.establishes(), 0);
        assert_eq!(
            actions(&harness),
            vec![(
                LifecycleAction::Start,
                ErrorCode::InvalidServerCredentials,
                Some("t1".into()),
                None
            )]
        );
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let harness = Harness::with_checks(FakeChecks::new(false, Some(false), Some(false)));
        let code = harness.orchestrator.start("t1", test_config()).await.unwrap();
        assert_eq!(code, ErrorCode::ServerUnreachable);
        assert_eq!(harness.presenter.last(), None);
    }

    #[tokio::test]
    async fn test_illegal_configuration() {
        let harness = Harness::new();
        let config = TunnelConfig::new().with("host", "1.2.3.4");

        let code = harness.orchestrator.start("t1", config).await.unwrap();

        assert_eq!(code, ErrorCode::IllegalServerConfiguration);
        assert_eq!(harness.proxy.starts(), 0);
        assert!(!harness.orchestrator.is_active("t1").await.unwrap());
    }

    #[tokio::test]
    async fn test_proxy_failure() {
        let harness = Harness::new();
        harness.proxy.fail_next_start();

        let code = harness.orchestrator.start("t1", test_config()).await.unwrap();

        assert_eq!(code, ErrorCode::ProxyStartFailure);
        assert_eq!(harness.events.events().len(), 1);
        assert!(harness.orchestrator.active_tunnel().await.is_none());
    }

    #[tokio::test]
    async fn test_proxy_start_timeout() {
        let mut checks = FakeChecks::new(false, None, None);
        checks.udp_hangs = true;
        let harness = Harness::build(
            checks,
            OrchestratorSettings {
                proxy_start_timeout: Some(Duration::from_millis(50)),
                probe_timeout: None,
            },
        );

        let code = harness.orchestrator.start("t1", test_config()).await.unwrap();

        assert_eq!(code, ErrorCode::ProxyStartFailure);
        assert!(harness.orchestrator.active_tunnel().await.is_none());
    }

    #[tokio::test]
    async fn test_timed_out_probes_do_not_exhaust_the_pool() {
        let mut checks = FakeChecks::new(false, None, None);
        checks.udp_hangs = true;
        let harness = Harness::build(
            checks,
            OrchestratorSettings {
                proxy_start_timeout: None,
                probe_timeout: Some(Duration::from_millis(50)),
            },
        );

        for attempt in 0..3 {
            let code = tokio::time::timeout(
                Duration::from_secs(2),
                harness.orchestrator.start("t1", test_config()),
            )
            .await
            .unwrap_or_else(|_| panic!("start #{} hung", attempt));
            assert_eq!(code, Ok(ErrorCode::ServerUnreachable));
        }
        assert_eq!(harness.proxy.starts(), 3);
    }

    #[tokio::test]
    async fn test_start_timeouts_do_not_exhaust_the_pool() {
        let mut checks = FakeChecks::new(false, None, None);
        checks.udp_hangs = true;
        let harness = Harness::build(
            checks,
            OrchestratorSettings {
                proxy_start_timeout: Some(Duration::from_millis(50)),
                probe_timeout: None,
            },
        );

        for attempt in 0..3 {
            let code = tokio::time::timeout(
                Duration::from_secs(2),
                harness.orchestrator.start("t1", test_config()),
            )
            .await
            .unwrap_or_else(|_| panic!("start #{} hung", attempt));
            assert_eq!(code, Ok(ErrorCode::ProxyStartFailure));
        }
    }

    #[tokio::test]
    async fn test_queries_do_not_wait_on_a_start() {
        let mut checks = FakeChecks::new(false, None, None);
        checks.udp_hangs = true;
        let harness = Harness::build(
            checks,
            OrchestratorSettings {
                proxy_start_timeout: None,
                probe_timeout: Some(Duration::from_millis(500)),
            },
        );
        let starting = harness.orchestrator.clone();
        let start = tokio::spawn(async move { starting.start("t1", test_config()).await });
        while harness.proxy.starts() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let queries = async {
            (
                harness.orchestrator.is_active("t1").await,
                harness.orchestrator.active_tunnel().await.map(|d| d.id),
                harness.orchestrator.status().await,
            )
        };
        let (active, tunnel, status) = tokio::time::timeout(Duration::from_millis(200), queries)
            .await
            .expect("queries waited on the session lock");

        assert_eq!(active, Ok(true));
        assert_eq!(tunnel.as_deref(), Some("t1"));
        assert_eq!(status, TunnelStatus::Connecting);
        assert_eq!(start.await.unwrap(), Ok(ErrorCode::ServerUnreachable));
        assert!(harness.orchestrator.active_tunnel().await.is_none());
    }

    #[tokio::test]
    async fn test_udp_result_for_inactive_tunnel_is_dropped() {
        let harness = Harness::new();
        harness.orchestrator.start("t1", test_config()).await.unwrap();
        let active = harness.orchestrator.active_tunnel().await.unwrap();

        assert_eq!(harness.orchestrator.record_udp_support(&active, false).await, Some(true));
        assert!(!harness.store.is_udp_supported());

        harness.orchestrator.start("t2", test_config()).await.unwrap();
        assert!(harness.store.is_udp_supported());
        assert_eq!(harness.orchestrator.record_udp_support(&active, false).await, None);
        assert!(harness.store.is_udp_supported());
    }

    #[tokio::test]
    async fn test_interface_refused() {
        let harness = Harness::new();
        harness.interface.refuse_establish();

        let code = harness.orchestrator.start("t1", test_config()).await.unwrap();

        assert_eq!(code, ErrorCode::VpnStartFailure);
        assert!(harness.store.load().unwrap().is_none());
        assert_eq!(harness.monitor.registrations(), 0);
        assert_eq!(harness.interface.teardowns(), 1);
    }

    #[tokio::test]
    async fn test_interface_connect_failure() {
        let harness = Harness::new();
        harness.interface.fail_connect();

        let code = harness.orchestrator.start("t1", test_config()).await.unwrap();

        assert_eq!(code, ErrorCode::VpnStartFailure);
        assert!(harness.orchestrator.active_tunnel().await.is_none());
        // Monitoring registered by the attempt is released again
        assert_eq!(harness.monitor.unregistrations(), 1);
    }

    #[tokio::test]
    async fn test_restart_disconnects_previous_tunnel_first() {
        let harness = Harness::new();
        harness.orchestrator.start("t1", test_config()).await.unwrap();

        let other = test_config().with("name", "Other");
        let code = harness.orchestrator.start("t2", other.clone()).await.unwrap();

        assert_eq!(code, ErrorCode::NoError);
        assert_eq!(
            actions(&harness),
            vec![
                (LifecycleAction::Start, ErrorCode::NoError, Some("t1".into()), None),
                (
                    LifecycleAction::StatusChange,
                    ErrorCode::NoError,
                    Some("t1".into()),
                    Some(TunnelStatus::Disconnected)
                ),
                (LifecycleAction::Start, ErrorCode::NoError, Some("t2".into()), None),
            ]
        );
        assert!(!harness.orchestrator.is_active("t1").await.unwrap());
        assert!(harness.orchestrator.is_active("t2").await.unwrap());
        assert_eq!(harness.store.load().unwrap(), Some(TunnelDescriptor::new("t2", other)));

        // The interface and the monitor are reused
        assert_eq!(harness.interface.establishes(), 1);
        assert_eq!(harness.interface.disconnects(), 1);
        assert_eq!(harness.monitor.registrations(), 1);
        assert_eq!(harness.presenter.cleared(), 1);
    }

    #[tokio::test]
    async fn test_failed_restart_tears_down_everything() {
        let harness = Harness::new();
        harness.orchestrator.start("t1", test_config()).await.unwrap();
        harness.proxy.fail_next_start();

        let code = harness.orchestrator.start("t2", test_config()).await.unwrap();

        assert_eq!(code, ErrorCode::ProxyStartFailure);
        let events = harness.events.events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].tunnel_id.as_deref(), Some("t2"));
        assert!(harness.orchestrator.active_tunnel().await.is_none());
        // Known-good state survives the failed attempt
        assert_eq!(
            harness.store.load().unwrap(),
            Some(TunnelDescriptor::new("t1", test_config()))
        );
    }

    #[tokio::test]
    async fn test_stop() {
        let harness = Harness::new();
        harness.orchestrator.start("t1", test_config()).await.unwrap();

        assert_eq!(
            harness.orchestrator.stop("t2").await,
            Err(TunnelError::NotActive("t2".into()))
        );
        assert!(harness.orchestrator.is_active("t1").await.unwrap());

        harness.orchestrator.stop("t1").await.unwrap();

        let last = harness.events.events().pop().unwrap();
        assert_eq!(last.action, LifecycleAction::Stop);
        assert_eq!(last.tunnel_id.as_deref(), Some("t1"));
        assert!(!harness.orchestrator.is_active("t1").await.unwrap());
        assert_eq!(harness.store.status(), TunnelStatus::Disconnected);
        assert_eq!(harness.monitor.unregistrations(), 1);
        assert_eq!(harness.presenter.last(), None);

        // Stopping again is a precondition failure, not a second teardown
        assert_eq!(
            harness.orchestrator.stop("t1").await,
            Err(TunnelError::NotActive("t1".into()))
        );
        assert_eq!(harness.proxy.stops(), 1);
    }

    #[tokio::test]
    async fn test_destroy_is_silent_and_repeatable() {
        let harness = Harness::new();
        harness.orchestrator.start("t1", test_config()).await.unwrap();
        let before = harness.events.events().len();

        harness.orchestrator.destroy().await;
        harness.orchestrator.destroy().await;

        assert_eq!(harness.events.events().len(), before);
        assert!(harness.orchestrator.active_tunnel().await.is_none());
        assert_eq!(harness.monitor.unregistrations(), 1);
        assert_eq!(harness.store.status(), TunnelStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_revoke_reports_disconnect() {
        let harness = Harness::new();
        harness.orchestrator.start("t1", test_config()).await.unwrap();

        harness.orchestrator.revoke().await;

        let last = harness.events.events().pop().unwrap();
        assert_eq!(last.action, LifecycleAction::StatusChange);
        assert_eq!(last.status, Some(TunnelStatus::Disconnected));
        assert_eq!(last.tunnel_id.as_deref(), Some("t1"));
        assert!(harness.orchestrator.active_tunnel().await.is_none());
    }

    #[tokio::test]
    async fn test_resume_without_tunnel_exits() {
        let harness = Harness::new();

        assert_eq!(harness.orchestrator.resume_last_known_tunnel_or_exit().await, None);

        assert!(harness.lifecycle.exit_requested());
        assert!(harness.events.events().is_empty());
        assert_eq!(harness.proxy.starts(), 0);
    }

    #[tokio::test]
    async fn test_resume_with_malformed_tunnel_exits() {
        let harness = Harness::with_store(MemoryStore::with_raw_tunnel(json!("junk")));

        assert_eq!(harness.orchestrator.resume_last_known_tunnel_or_exit().await, None);

        assert!(harness.lifecycle.exit_requested());
        assert!(harness.events.events().is_empty());
    }

    #[tokio::test]
    async fn test_resume_without_permission_exits() {
        let harness = Harness::new();
        harness.store.save(&TunnelDescriptor::new("t1", test_config())).unwrap();
        harness.interface.revoke_permission();

        assert_eq!(harness.orchestrator.resume_last_known_tunnel_or_exit().await, None);

        assert!(harness.lifecycle.exit_requested());
        assert_eq!(harness.proxy.starts(), 0);
    }

    #[tokio::test]
    async fn test_resume_uses_stored_udp_flag() {
        // Probing would fail; auto-start must not probe
        let harness = Harness::with_checks(FakeChecks::new(false, Some(false), Some(false)));
        harness.store.save(&TunnelDescriptor::new("t1", test_config())).unwrap();
        harness.store.set_udp_supported(true).unwrap();

        let code = harness.orchestrator.resume_last_known_tunnel_or_exit().await;

        assert_eq!(code, Some(ErrorCode::NoError));
        assert!(!harness.lifecycle.exit_requested());
        assert!(harness.orchestrator.is_active("t1").await.unwrap());
        assert_eq!(harness.interface.connects(), vec![(harness.proxy.local_addr(), true)]);
        assert_eq!(harness.presenter.history()[0], TunnelStatus::Reconnecting);
        assert_eq!(harness.presenter.last(), Some(TunnelStatus::Connected));
    }

    #[tokio::test]
    async fn test_session_scenario() {
        let harness = Harness::new();
        let orchestrator = &harness.orchestrator;

        assert_eq!(orchestrator.start("A", test_config()).await, Ok(ErrorCode::NoError));
        assert_eq!(orchestrator.start("B", test_config()).await, Ok(ErrorCode::NoError));
        assert_eq!(orchestrator.stop("A").await, Err(TunnelError::NotActive("A".into())));
        assert_eq!(orchestrator.stop("B").await, Ok(()));

        assert_eq!(
            actions(&harness),
            vec![
                (LifecycleAction::Start, ErrorCode::NoError, Some("A".into()), None),
                (
                    LifecycleAction::StatusChange,
                    ErrorCode::NoError,
                    Some("A".into()),
                    Some(TunnelStatus::Disconnected)
                ),
                (LifecycleAction::Start, ErrorCode::NoError, Some("B".into()), None),
                (LifecycleAction::Stop, ErrorCode::NoError, Some("B".into()), None),
            ]
        );
        assert!(orchestrator.active_tunnel().await.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_starts_are_serialized() {
        let harness = Harness::new();
        let a = harness.orchestrator.clone();
        let b = harness.orchestrator.clone();

        let (first, second) = tokio::join!(
            a.start("A", test_config()),
            b.start("B", test_config())
        );
        assert_eq!(first, Ok(ErrorCode::NoError));
        assert_eq!(second, Ok(ErrorCode::NoError));

        // Whichever ran second saw the first as active and restarted
        let events = harness.events.events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[1].action, LifecycleAction::StatusChange);
        assert_eq!(events[1].tunnel_id, events[0].tunnel_id);
        assert_eq!(harness.interface.establishes(), 1);
    }

    #[tokio::test]
    async fn test_stale_restart_is_skipped() {
        let harness = Harness::new();
        harness.orchestrator.start("t1", test_config()).await.unwrap();
        let stale = harness.orchestrator.active_tunnel().await.unwrap();
        harness.orchestrator.stop("t1").await.unwrap();

        assert_eq!(harness.orchestrator.restart_if_active(stale).await, None);
        assert_eq!(harness.proxy.starts(), 1);
    }

    #[tokio::test]
    async fn test_network_events_reach_reactor() {
        let harness = Harness::new();
        harness.orchestrator.start("t1", test_config()).await.unwrap();
        harness.monitor.set_active(None);

        harness.monitor.send(NetworkEvent::Lost(NetworkId(1))).await;

        let mut reconnecting = false;
        for _ in 0..50 {
            if harness.orchestrator.status().await == TunnelStatus::Reconnecting {
                reconnecting = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(reconnecting);
    }
}
