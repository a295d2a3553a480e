//! Control socket
//!
//! Newline-delimited JSON over a local TCP socket. Each line from a client
//! is one request and gets exactly one `reply` line back; lifecycle events
//! are pushed to every connected client as `event` lines. The requesting
//! client sees the reply first, then the events its request caused.
//!
//! ```text
//! > {"command":"start","tunnel_id":"office","config":{"host":"1.2.3.4","port":8388,"password":"x"}}
//! < {"type":"reply","ok":true,"error_code":"no_error"}
//! < {"type":"event","action":"start","error_code":"no_error","tunnel_id":"office","status":null}
//! > {"command":"status"}
//! < {"type":"reply","ok":true,"status":"connected","tunnel_id":"office","capabilities":{"udp_forwarding_supported":true}}
//! ```

use fos_tunnel::{
    BroadcastEventSink, CapabilitySet, ErrorCode, LifecycleEvent, TunnelConfig, TunnelOrchestrator,
    TunnelStateStore, TunnelStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

/// Client request
#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlRequest {
    Start {
        tunnel_id: String,
        #[serde(default)]
        config: Value,
    },
    Stop {
        tunnel_id: String,
    },
    Status {
        #[serde(default)]
        tunnel_id: Option<String>,
    },
    /// Withdraw the tunnel as if the OS revoked the permission
    Revoke,
}

/// Answer to one request
#[derive(Debug, Default, Serialize, PartialEq)]
pub struct ControlReply {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TunnelStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<CapabilitySet>,
}

impl ControlReply {
    fn ok() -> Self {
        Self {
            ok: true,
            ..Default::default()
        }
    }

    fn error(message: impl ToString) -> Self {
        Self {
            ok: false,
            error: Some(message.to_string()),
            ..Default::default()
        }
    }
}

/// Line sent to a client
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Reply(ControlReply),
    Event(LifecycleEvent),
}

/// Everything a control connection needs
pub struct ControlContext {
    pub orchestrator: TunnelOrchestrator,
    pub events: Arc<BroadcastEventSink>,
    pub store: Arc<dyn TunnelStateStore>,
}

/// Accept control clients until the listener fails
pub async fn serve(listener: TcpListener, ctx: Arc<ControlContext>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                tracing::debug!("Control client connected: {}", addr);
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    handle_connection(stream, ctx).await;
                    tracing::debug!("Control client disconnected: {}", addr);
                });
            }
            Err(e) => {
                tracing::error!("Failed to accept control connection: {}", e);
            }
        }
    }
}

/// Serve one client until it hangs up
pub async fn handle_connection(stream: TcpStream, ctx: Arc<ControlContext>) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    let mut events = ctx.events.subscribe();

    loop {
        let message = tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => ServerMessage::Reply(dispatch(&ctx, &line).await),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Control read failed: {}", e);
                    break;
                }
            },
            event = events.recv() => match event {
                Ok(event) => ServerMessage::Event(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!("Control client lagging, dropped {} events", missed);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        let mut encoded = match serde_json::to_string(&message) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!("Failed to encode control message: {}", e);
                continue;
            }
        };
        encoded.push('\n');
        if write.write_all(encoded.as_bytes()).await.is_err() {
            break;
        }
    }
}

async fn dispatch(ctx: &ControlContext, line: &str) -> ControlReply {
    match serde_json::from_str::<ControlRequest>(line) {
        Ok(request) => handle_request(ctx, request).await,
        Err(e) => {
            tracing::warn!("Invalid control request: {}", e);
            ControlReply::error(format!("Invalid request: {}", e))
        }
    }
}

pub async fn handle_request(ctx: &ControlContext, request: ControlRequest) -> ControlReply {
    match request {
        ControlRequest::Start { tunnel_id, config } => {
            let config = match config {
                Value::Null => TunnelConfig::new(),
                value => match TunnelConfig::from_value(value) {
                    Ok(config) => config,
                    Err(e) => return ControlReply::error(e),
                },
            };
            match ctx.orchestrator.start(&tunnel_id, config).await {
                Ok(code) => ControlReply {
                    ok: code.is_continuable(),
                    error_code: Some(code),
                    ..Default::default()
                },
                Err(e) => ControlReply::error(e),
            }
        }
        ControlRequest::Stop { tunnel_id } => match ctx.orchestrator.stop(&tunnel_id).await {
            Ok(()) => ControlReply::ok(),
            Err(e) => ControlReply::error(e),
        },
        ControlRequest::Status { tunnel_id } => {
            let active = match tunnel_id {
                Some(id) => match ctx.orchestrator.is_active(&id).await {
                    Ok(active) => Some(active),
                    Err(e) => return ControlReply::error(e),
                },
                None => None,
            };
            ControlReply {
                active,
                status: Some(ctx.orchestrator.status().await),
                tunnel_id: ctx.orchestrator.active_tunnel().await.map(|d| d.id),
                capabilities: Some(CapabilitySet {
                    udp_forwarding_supported: ctx.store.is_udp_supported(),
                }),
                ..ControlReply::ok()
            }
        }
        ControlRequest::Revoke => {
            ctx.orchestrator.revoke().await;
            ControlReply::ok()
        }
    }
}
