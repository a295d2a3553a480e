//! fos-tunneld: Tunnel Service Daemon
//!
//! Hosts a single tunnel behind a local control socket. With `--autostart`
//! it brings back the tunnel that was connected at shutdown, and exits if
//! there is none.

mod control;

use anyhow::{Context, Result};
use clap::Parser;
use fos_tunnel::{
    BroadcastEventSink, Collaborators, CommandProxy, DirectProxyInterface, JsonFileStore,
    LogPresenter, RouteWatcher, ServiceConfig, ServiceLifecycle, SocksConnectivity,
    TunnelOrchestrator, TunnelStateStore, WorkerPool,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::control::ControlContext;

#[derive(Parser, Debug)]
#[command(author, version, about = "Single-tunnel VPN service", long_about = None)]
struct Args {
    /// Service config file (TOML, or JSON by extension)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Resume the last connected tunnel, exiting if there is none
    #[arg(long)]
    autostart: bool,

    /// Override the control socket address
    #[arg(long)]
    control: Option<SocketAddr>,
}

/// Exit requests from the orchestrator
#[derive(Default)]
struct ExitSignal {
    notify: Notify,
}

impl ServiceLifecycle for ExitSignal {
    fn request_exit(&self) {
        info!("Service exit requested");
        self.notify.notify_one();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ServiceConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ServiceConfig::default(),
    };
    if let Some(control) = args.control {
        config.control_addr = control;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("fos-tunneld starting...");

    let store: Arc<dyn TunnelStateStore> = Arc::new(
        JsonFileStore::open(&config.state_path)
            .with_context(|| format!("Failed to open state {}", config.state_path.display()))?,
    );
    let events = Arc::new(BroadcastEventSink::default());
    let exit = Arc::new(ExitSignal::default());

    let orchestrator = TunnelOrchestrator::new(
        Collaborators {
            proxy: Arc::new(CommandProxy::new(config.proxy.clone())),
            interface: Arc::new(DirectProxyInterface::new()),
            store: store.clone(),
            events: events.clone(),
            presenter: Arc::new(LogPresenter::new()),
            network: Arc::new(RouteWatcher::new(config.route.target, config.route.interval())),
            checks: Arc::new(SocksConnectivity::new(config.checks.clone())),
            lifecycle: exit.clone(),
        },
        WorkerPool::new(config.pool_size),
        config.orchestrator_settings(),
    );

    let listener = TcpListener::bind(config.control_addr)
        .await
        .with_context(|| format!("Failed to bind control socket {}", config.control_addr))?;
    info!("Control socket listening on {}", config.control_addr);

    let ctx = Arc::new(ControlContext {
        orchestrator: orchestrator.clone(),
        events,
        store,
    });
    let server = tokio::spawn(control::serve(listener, ctx));

    if args.autostart {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            if let Some(code) = orchestrator.resume_last_known_tunnel_or_exit().await {
                info!("Auto-start finished: {}", code);
            }
        });
    }

    tokio::select! {
        _ = exit.notify.notified() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for ctrl-c: {}", e);
            }
        }
        _ = terminate() => {}
    }

    server.abort();
    orchestrator.destroy().await;
    info!("fos-tunneld shutting down");
    Ok(())
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            error!("Failed to listen for SIGTERM: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
