//! Connectivity Probe
//!
//! Decides whether a freshly started local proxy gives a usable tunnel, and
//! in which mode. The three checks run concurrently on the worker pool:
//!
//! ```text
//!            ┌── UDP relay ─────┐  ok ─────────────▶ Usable
//!  check() ──┼── reachability ──┤
//!            └── credentials ───┘  creds ok ───────▶ UsableNoUdp
//!                                  reachable only ─▶ InvalidCredentials
//!                                  otherwise ──────▶ Unreachable
//! ```
//!
//! UDP relay success implies transport and credentials are fine, so the
//! other two results are not awaited in that case. Checks whose result is
//! no longer needed (short-circuit, timeout, cancelled probe) are aborted
//! and give their worker back to the pool.

use crate::connectivity::ConnectivityChecks;
use crate::pool::{PoolTask, WorkerPool};
use crate::state::{ConnectivityResult, ProbeFailure};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Runs the three-way connectivity check
#[derive(Clone)]
pub struct ConnectivityProbe {
    checks: Arc<dyn ConnectivityChecks>,
    pool: WorkerPool,
    /// Upper bound on each join; `None` waits as long as the checks do
    timeout: Option<Duration>,
}

impl ConnectivityProbe {
    pub fn new(checks: Arc<dyn ConnectivityChecks>, pool: WorkerPool) -> Self {
        Self {
            checks,
            pool,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Check the tunnel through the proxy at `local` to `remote_host:remote_port`
    pub async fn check(
        &self,
        local: SocketAddr,
        remote_host: &str,
        remote_port: u16,
    ) -> ConnectivityResult {
        match self.evaluate(local, remote_host, remote_port).await {
            Ok(result) => result,
            Err(e) => {
                error!("Failed to execute server connectivity checks: {}", e);
                ConnectivityResult::UnreachableOrInvalid(ProbeFailure::Unreachable)
            }
        }
    }

    /// Re-run only the UDP relay check, e.g. after a network change
    pub async fn check_udp(&self, local: SocketAddr) -> bool {
        let checks = self.checks.clone();
        let task = self
            .pool
            .spawn(async move { checks.is_udp_forwarding_enabled(local).await });
        match self.join(task).await {
            Ok(supported) => supported,
            Err(e) => {
                debug!("UDP relay re-check failed: {}", e);
                false
            }
        }
    }

    async fn evaluate(
        &self,
        local: SocketAddr,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<ConnectivityResult, ProbeError> {
        let udp = {
            let checks = self.checks.clone();
            self.pool
                .spawn(async move { checks.is_udp_forwarding_enabled(local).await })
        };
        let reachability = {
            let checks = self.checks.clone();
            let host = remote_host.to_string();
            self.pool
                .spawn(async move { checks.is_server_reachable(&host, remote_port).await })
        };
        let credentials = {
            let checks = self.checks.clone();
            self.pool
                .spawn(async move { checks.validate_server_credentials(local).await })
        };

        // Returning early drops the remaining tasks, which aborts them
        if self.join(udp).await? {
            // Late failures of the other two are treated as transient
            debug!("UDP relay works, skipping remaining checks");
            return Ok(ConnectivityResult::Usable);
        }

        let reachable = self.join(reachability).await?;
        let credentials_valid = self.join(credentials).await?;
        info!(
            "Server connectivity: UDP forwarding disabled, server {}, credentials {}",
            if reachable { "reachable" } else { "unreachable" },
            if credentials_valid { "valid" } else { "invalid" }
        );

        Ok(if credentials_valid {
            ConnectivityResult::UsableNoUdp
        } else if reachable {
            ConnectivityResult::UnreachableOrInvalid(ProbeFailure::InvalidCredentials)
        } else {
            ConnectivityResult::UnreachableOrInvalid(ProbeFailure::Unreachable)
        })
    }

    async fn join(&self, task: PoolTask<bool>) -> Result<bool, ProbeError> {
        let joined = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, task)
                .await
                .map_err(|_| ProbeError::Timeout(limit))?,
            None => task.await,
        };
        joined
            .map_err(|e| ProbeError::Task(e.to_string()))?
            .ok_or(ProbeError::PoolClosed)
    }
}

/// Probe infrastructure failures
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProbeError {
    #[error("Check timed out after {0:?}")]
    Timeout(Duration),

    #[error("Check task failed: {0}")]
    Task(String),

    #[error("Worker pool closed")]
    PoolClosed,
}
