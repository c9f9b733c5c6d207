//! Command router
//!
//! Fixed table from dispatch key to handler. Each connection feeds its
//! commands through a `CommandQueue`, whose single worker task runs them in
//! arrival order, so the read loop never waits on a handler.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::handler::{
    BroadcastStatusHandler, CommandHandler, ForwardHandler, HandlerError, PingHandler,
    StartBroadcastHandler, StopBroadcastHandler, BROADCAST_STATUS, GENERATE_VIDEO, PING,
    PREVIEW_RENDERING, START_BROADCAST, STOP_BROADCAST,
};
use super::protocol::{CommandEnvelope, ErrorCode, ResponseEnvelope};
use super::registry::{ConnectionHandle, ConnectionRegistry};
use crate::broadcast::BroadcastController;

/// Maps dispatch keys to handlers
#[derive(Default)]
pub struct CommandRouter {
    routes: HashMap<String, Arc<dyn CommandHandler>>,
}

impl CommandRouter {
    /// Create an empty router
    pub fn new() -> Self {
        Self::default()
    }

    /// The relay's standard command table
    pub fn relay(registry: Arc<ConnectionRegistry>, broadcast: Arc<BroadcastController>) -> Self {
        Self::new()
            .route(
                PREVIEW_RENDERING,
                ForwardHandler::new(PREVIEW_RENDERING, Arc::clone(&registry)),
            )
            .route(
                GENERATE_VIDEO,
                ForwardHandler::new(GENERATE_VIDEO, Arc::clone(&registry)),
            )
            .route(
                START_BROADCAST,
                StartBroadcastHandler::new(Arc::clone(&broadcast)),
            )
            .route(
                STOP_BROADCAST,
                StopBroadcastHandler::new(Arc::clone(&broadcast)),
            )
            .route(
                BROADCAST_STATUS,
                BroadcastStatusHandler::new(registry, broadcast),
            )
            .route(PING, PingHandler)
    }

    /// Register a handler under `key`, replacing any previous one
    pub fn route(
        mut self,
        key: impl Into<String>,
        handler: impl CommandHandler + 'static,
    ) -> Self {
        self.routes.insert(key.into(), Arc::new(handler));
        self
    }

    /// Whether a handler exists for `key`
    #[allow(dead_code)]
    pub fn contains(&self, key: &str) -> bool {
        self.routes.contains_key(key)
    }

    /// Route one envelope and run its handler to completion
    ///
    /// Returns `false` when nothing is registered for the envelope's
    /// dispatch key. Unrouted commands get no reply.
    pub async fn dispatch(&self, origin: &ConnectionHandle, envelope: CommandEnvelope) -> bool {
        let Some(key) = envelope.dispatch_key().map(str::to_owned) else {
            warn!(
                "Dropping envelope without dispatch key from connection {}",
                origin.id()
            );
            return false;
        };

        let Some(handler) = self.routes.get(&key).cloned() else {
            warn!(
                "No handler for '{}' from {} connection {}",
                key,
                origin.role(),
                origin.id()
            );
            return false;
        };

        debug!("Dispatching '{}' from connection {}", key, origin.id());
        let fault = match AssertUnwindSafe(handler.handle(origin.clone(), envelope.params))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => return true,
            Ok(Err(HandlerError::Transport(e))) => {
                warn!("Handler '{}' could not reach its peer: {}", key, e);
                return true;
            }
            Ok(Err(e)) => {
                warn!(
                    "Handler '{}' failed for connection {}: {}",
                    key,
                    origin.id(),
                    e
                );
                format!("{} failed: {}", key, e)
            }
            Err(_) => {
                error!("Handler '{}' panicked for connection {}", key, origin.id());
                format!("{} failed", key)
            }
        };

        // Best effort: the originator may be gone too.
        let response = ResponseEnvelope::error(fault, ErrorCode::InternalError);
        if let Ok(json) = response.to_json() {
            let _ = origin.send_text(json).await;
        }
        true
    }
}

/// Ordered command intake for one connection
///
/// One worker task drains the queue, so commands from a connection run in
/// the order they arrived while the read loop keeps reading.
pub struct CommandQueue {
    tx: mpsc::UnboundedSender<CommandEnvelope>,
    worker: JoinHandle<()>,
}

impl CommandQueue {
    /// Spawn the worker for `origin`
    ///
    /// Once another connection has taken over `origin`'s role, its queued
    /// commands are dropped unanswered.
    pub fn spawn(
        router: Arc<CommandRouter>,
        registry: Arc<ConnectionRegistry>,
        origin: ConnectionHandle,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<CommandEnvelope>();

        let worker = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                if registry.is_superseded(origin.role(), origin.id()) {
                    debug!(
                        "{} connection {} was replaced, dropping {:?}",
                        origin.role(),
                        origin.id(),
                        envelope.dispatch_key()
                    );
                    continue;
                }
                router.dispatch(&origin, envelope).await;
            }
        });

        Self { tx, worker }
    }

    /// Queue an envelope without waiting for it to run
    ///
    /// Returns `false` if the worker is gone.
    pub fn push(&self, envelope: CommandEnvelope) -> bool {
        self.tx.send(envelope).is_ok()
    }

    /// Stop accepting commands; the worker finishes what is already queued
    pub fn close(self) -> JoinHandle<()> {
        drop(self.tx);
        self.worker
    }
}
