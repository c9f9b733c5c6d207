//! Relay command handlers
//!
//! Each handler answers only the connection that issued the command. The
//! forwarding handlers are fire-and-forget: the originator is acknowledged
//! as soon as the command is queued for the execution side.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::protocol::{CommandEnvelope, ErrorCode, ProtocolError, ResponseEnvelope};
use super::registry::{ConnectionHandle, ConnectionRegistry, Role, TransportError};
use crate::broadcast::BroadcastController;

/// Render a preview on the execution side
pub const PREVIEW_RENDERING: &str = "preview_rendering";
/// Render a video on the execution side
pub const GENERATE_VIDEO: &str = "generate_video";
/// Start streaming frames to the control connection
pub const START_BROADCAST: &str = "start_broadcast";
/// Stop the current frame stream
pub const STOP_BROADCAST: &str = "stop_broadcast";
/// Report broadcast and connection state
pub const BROADCAST_STATUS: &str = "broadcast_status";
/// Keepalive
pub const PING: &str = "ping";

/// Errors a handler can hit while answering a command
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Result type for handler operations
pub type HandlerResult<T> = Result<T, HandlerError>;

/// A routable command implementation
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Handle one command issued by `origin`
    async fn handle(&self, origin: ConnectionHandle, params: Map<String, Value>)
        -> HandlerResult<()>;
}

async fn reply(origin: &ConnectionHandle, response: ResponseEnvelope) -> HandlerResult<()> {
    origin.send_text(response.to_json()?).await?;
    Ok(())
}

/// Forwards a command to the execution connection and acknowledges the
/// originator
pub struct ForwardHandler {
    action: &'static str,
    registry: Arc<ConnectionRegistry>,
}

impl ForwardHandler {
    /// Create a forwarder for `action`
    pub fn new(action: &'static str, registry: Arc<ConnectionRegistry>) -> Self {
        Self { action, registry }
    }
}

#[async_trait]
impl CommandHandler for ForwardHandler {
    async fn handle(
        &self,
        origin: ConnectionHandle,
        params: Map<String, Value>,
    ) -> HandlerResult<()> {
        if origin.role() == Role::Execution {
            warn!(
                "Refusing to relay {} from {} connection {} back to itself",
                self.action,
                Role::Execution,
                origin.id()
            );
            return reply(
                &origin,
                ResponseEnvelope::error(
                    format!("{} cannot be issued by {}", self.action, Role::Execution),
                    ErrorCode::InvalidOrigin,
                ),
            )
            .await;
        }

        let Some(execution) = self.registry.get(Role::Execution) else {
            warn!(
                "Cannot relay {} from connection {}: {} not connected",
                self.action,
                origin.id(),
                Role::Execution
            );
            return reply(
                &origin,
                ResponseEnvelope::error(
                    format!("{} not connected", Role::Execution),
                    ErrorCode::ExecutionDisconnected,
                ),
            )
            .await;
        };

        let forward = CommandEnvelope::command(self.action).with_params(params);
        if let Err(e) = execution.send_text(forward.to_json()?).await {
            warn!("Failed to relay {} to {}: {}", self.action, execution.id(), e);
            return reply(
                &origin,
                ResponseEnvelope::error(
                    format!("failed to relay {}: {}", self.action, e),
                    ErrorCode::TransportError,
                ),
            )
            .await;
        }

        debug!(
            "Relayed {} from {} to {}",
            self.action,
            origin.id(),
            execution.id()
        );
        reply(
            &origin,
            ResponseEnvelope::ok(format!("{} started", self.action)),
        )
        .await
    }
}

/// Sets the start signal, spawning the broadcast loop if needed
pub struct StartBroadcastHandler {
    broadcast: Arc<BroadcastController>,
}

impl StartBroadcastHandler {
    pub fn new(broadcast: Arc<BroadcastController>) -> Self {
        Self { broadcast }
    }
}

#[async_trait]
impl CommandHandler for StartBroadcastHandler {
    async fn handle(&self, origin: ConnectionHandle, _: Map<String, Value>) -> HandlerResult<()> {
        if self.broadcast.start() {
            info!("Broadcast loop spawned by connection {}", origin.id());
        }
        reply(&origin, ResponseEnvelope::ok("broadcast started")).await
    }
}

/// Sets the stop signal and clears the start signal
pub struct StopBroadcastHandler {
    broadcast: Arc<BroadcastController>,
}

impl StopBroadcastHandler {
    pub fn new(broadcast: Arc<BroadcastController>) -> Self {
        Self { broadcast }
    }
}

#[async_trait]
impl CommandHandler for StopBroadcastHandler {
    async fn handle(&self, origin: ConnectionHandle, _: Map<String, Value>) -> HandlerResult<()> {
        self.broadcast.stop();
        reply(&origin, ResponseEnvelope::ok("broadcast stopped")).await
    }
}

/// Reports loop phase, counters and which roles are connected
pub struct BroadcastStatusHandler {
    registry: Arc<ConnectionRegistry>,
    broadcast: Arc<BroadcastController>,
}

impl BroadcastStatusHandler {
    pub fn new(registry: Arc<ConnectionRegistry>, broadcast: Arc<BroadcastController>) -> Self {
        Self {
            registry,
            broadcast,
        }
    }
}

#[async_trait]
impl CommandHandler for BroadcastStatusHandler {
    async fn handle(&self, origin: ConnectionHandle, _: Map<String, Value>) -> HandlerResult<()> {
        let status = self.broadcast.status();
        let data = json!({
            "phase": status.phase,
            "running": status.running,
            "stop_requested": status.stop_requested,
            "frames_sent": status.frames_sent,
            "passes": status.passes,
            "control_connected": self.registry.is_connected(Role::Control),
            "execution_connected": self.registry.is_connected(Role::Execution),
        });
        reply(&origin, ResponseEnvelope::ok_with_data("broadcast status", data)).await
    }
}

/// Echoes `params.seq` back to the caller
pub struct PingHandler;

#[async_trait]
impl CommandHandler for PingHandler {
    async fn handle(
        &self,
        origin: ConnectionHandle,
        params: Map<String, Value>,
    ) -> HandlerResult<()> {
        let seq = params.get("seq").cloned().unwrap_or(Value::Null);
        reply(&origin, ResponseEnvelope::ok_with_data("pong", json!({ "seq": seq }))).await
    }
}
