//! Lifecycle events and presentation
//!
//! Everything the host application learns about the tunnel goes through an
//! [`EventSink`]; the persistent status indicator (notification, tray icon)
//! goes through a [`Presenter`]. Both are fire-and-forget.

use crate::state::{ErrorCode, TunnelStatus};
use serde::Serialize;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Kind of lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleAction {
    /// Result of a start request
    Start,
    /// Tunnel stopped on request
    Stop,
    /// Connectivity of the active tunnel changed
    StatusChange,
}

/// Event delivered to the host application
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleEvent {
    pub action: LifecycleAction,
    pub error_code: ErrorCode,
    /// Tunnel active when the event was emitted
    pub tunnel_id: Option<String>,
    pub status: Option<TunnelStatus>,
}

impl LifecycleEvent {
    pub fn start(tunnel_id: Option<String>, error_code: ErrorCode) -> Self {
        Self {
            action: LifecycleAction::Start,
            error_code,
            tunnel_id,
            status: None,
        }
    }

    pub fn stop(tunnel_id: Option<String>) -> Self {
        Self {
            action: LifecycleAction::Stop,
            error_code: ErrorCode::NoError,
            tunnel_id,
            status: None,
        }
    }

    pub fn status_change(tunnel_id: Option<String>, status: TunnelStatus) -> Self {
        Self {
            action: LifecycleAction::StatusChange,
            error_code: ErrorCode::NoError,
            tunnel_id,
            status: Some(status),
        }
    }
}

/// Receiver of lifecycle events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: LifecycleEvent);
}

/// Fans events out to any number of subscribers
///
/// Slow subscribers lag and lose the oldest events; the orchestrator never
/// waits on them.
pub struct BroadcastEventSink {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(64)
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, event: LifecycleEvent) {
        debug!(?event, "Lifecycle event");
        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}

/// Keeps every event in memory, in emission order
#[derive(Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything emitted so far
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: LifecycleEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Persistent status indicator for the active tunnel
pub trait Presenter: Send + Sync {
    /// Show (or update) the indicator
    fn show(&self, server_name: &str, status: TunnelStatus);

    /// Remove the indicator
    fn clear(&self);
}

/// Presenter that only logs; used where no indicator exists
pub struct LogPresenter {
    /// Name shown since the last `clear`; updates keep it
    current: Mutex<Option<String>>,
}

impl LogPresenter {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(None),
        }
    }
}

impl Default for LogPresenter {
    fn default() -> Self {
        Self::new()
    }
}

impl Presenter for LogPresenter {
    fn show(&self, server_name: &str, status: TunnelStatus) {
        let Ok(mut current) = self.current.lock() else {
            warn!("Unable to update status indicator");
            return;
        };
        let name = current.get_or_insert_with(|| server_name.to_string());
        info!("[{}] {}", name, status);
    }

    fn clear(&self) {
        if let Ok(mut current) = self.current.lock() {
            if current.take().is_some() {
                debug!("Status indicator cleared");
            }
        }
    }
}
