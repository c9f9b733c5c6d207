//! WebSocket server implementation
//!
//! Accepts connections, binds each one to the role named by its request
//! path, and feeds inbound text messages through decode → router. Outbound
//! traffic for a connection is serialized through a queue drained by a
//! dedicated writer task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::protocol::{CommandEnvelope, StreamMessage};
use super::registry::{Connection, ConnectionHandle, ConnectionRegistry, Role};
use super::router::{CommandQueue, CommandRouter};
use crate::broadcast::BroadcastController;
use crate::config::RelayConfig;

/// How long a closing connection waits for its writer to flush
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Shared state each connection task needs
#[derive(Clone)]
struct ConnectionContext {
    registry: Arc<ConnectionRegistry>,
    router: Arc<CommandRouter>,
    outbound_queue: usize,
    send_timeout: Duration,
}

/// Relay server: owns the registry, the broadcast controller and the router
pub struct RelayServer {
    config: RelayConfig,
    registry: Arc<ConnectionRegistry>,
    controller: Arc<BroadcastController>,
    router: Arc<CommandRouter>,
    shutdown_tx: broadcast::Sender<()>,
}

impl RelayServer {
    /// Create a new relay server
    pub fn new(config: RelayConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let registry = Arc::new(ConnectionRegistry::new());
        let controller = Arc::new(BroadcastController::new(
            Arc::clone(&registry),
            config.frames_dir.clone(),
            config.frame_interval(),
        ));
        let router = Arc::new(CommandRouter::relay(
            Arc::clone(&registry),
            Arc::clone(&controller),
        ));

        Self {
            config,
            registry,
            controller,
            router,
            shutdown_tx,
        }
    }

    /// Connection registry
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Broadcast controller
    pub fn controller(&self) -> &Arc<BroadcastController> {
        &self.controller
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        self.controller.shutdown();
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!(
            "Relay listening on ws://{}/ws/{{{},{}}}",
            addr,
            Role::Control,
            Role::Execution
        );
        info!("Streaming frames from {}", self.config.frames_dir.display());

        self.serve(listener).await
    }

    /// Accept connections on `listener` until shutdown
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let ctx = ConnectionContext {
            registry: Arc::clone(&self.registry),
            router: Arc::clone(&self.router),
            outbound_queue: self.config.outbound_queue,
            send_timeout: self.config.forward_timeout(),
        };

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let ctx = ctx.clone();
                            let shutdown_rx = self.shutdown_tx.subscribe();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer_addr, ctx, shutdown_rx).await {
                                    error!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        let connected = self.registry.connected_roles();
        if !connected.is_empty() {
            info!("Closing {} registered connections", connected.len());
        }

        Ok(())
    }
}

fn reject_path(path: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(format!("unknown role path: {}", path)));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}

/// Handle a single WebSocket connection
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    ctx: ConnectionContext,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    debug!("New TCP connection from {}", peer_addr);

    let mut requested_role = None;
    let upgrade = accept_hdr_async(stream, |request: &Request, response: Response| {
        let path = request.uri().path();
        match Role::from_path(path) {
            Some(role) => {
                requested_role = Some(role);
                Ok(response)
            }
            None => Err(reject_path(path)),
        }
    })
    .await;

    let ws_stream = match upgrade {
        Ok(ws_stream) => ws_stream,
        Err(e) => {
            warn!("Rejected connection from {}: {}", peer_addr, e);
            return Ok(());
        }
    };
    let Some(role) = requested_role else {
        return Ok(());
    };

    let (ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, rx) = mpsc::channel(ctx.outbound_queue);
    let handle = ConnectionHandle::new(role, tx, ctx.send_timeout);
    let connection_id = handle.id();
    let welcome = StreamMessage::welcome(role, connection_id).to_json()?;
    let mut writer = tokio::spawn(write_loop(ws_sender, rx, connection_id));

    let connection = Connection::new(handle.clone());
    let established_at = connection.established_at;
    ctx.registry.register(connection);
    let commands = CommandQueue::spawn(
        Arc::clone(&ctx.router),
        Arc::clone(&ctx.registry),
        handle.clone(),
    );
    info!("{} connected from {} ({})", role, peer_addr, connection_id);

    if let Err(e) = handle.send_text(welcome).await {
        warn!("Failed to send welcome to {}: {}", connection_id, e);
    }

    // Message handling loop
    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!("Received message from {} {}: {}", role, connection_id, text);

                        match CommandEnvelope::decode(&text) {
                            Ok(envelope) => {
                                if !commands.push(envelope) {
                                    warn!("Command worker for {} is gone, closing", connection_id);
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!("Dropping malformed message from {}: {}", connection_id, e);
                            }
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        warn!("Received binary message from {} ({} bytes), ignoring", connection_id, data.len());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = handle.send(Message::Pong(data)).await {
                            debug!("Failed to answer ping from {}: {}", connection_id, e);
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Ignore pong messages
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("{} connection {} requested close", role, connection_id);
                        break;
                    }
                    Some(Ok(Message::Frame(_))) => {
                        // Raw frame, ignore
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error from {}: {}", connection_id, e);
                        break;
                    }
                    None => {
                        info!("Connection {} closed by {}", connection_id, peer_addr);
                        break;
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, closing connection {}", connection_id);
                let _ = handle.send(Message::Close(None)).await;
                break;
            }
        }
    }

    // Queued commands still run; the worker exits once they are done.
    let _ = commands.close();
    ctx.registry.unregister_connection(role, connection_id);
    drop(handle);

    // In-flight handlers may still hold a handle; don't wait on them forever.
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }

    info!(
        "{} connection {} closed after {:?}",
        role,
        connection_id,
        established_at.elapsed()
    );
    Ok(())
}

/// Drain a connection's outbound queue into its socket
async fn write_loop(mut sink: WsSink, mut rx: mpsc::Receiver<Message>, connection_id: Uuid) {
    while let Some(message) = rx.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            debug!("Send to connection {} failed: {}", connection_id, e);
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}
