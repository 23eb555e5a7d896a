//! WebSocket gateway: one task per connection, one room per session.
//!
//! Architecture:
//! ```text
//! Client A ──┐                     ┌── SessionRegistry ── EventStore (RocksDB)
//!             ├── Gateway ── Hub ──┼── LockTable
//! Client B ──┘                     ├── ChangeLog ──────── EventStore
//!                                  └── BroadcastRouter
//!                                         │
//!                          ┌──────────────┼──────────────┐
//!                          ▼              ▼              ▼
//!                       Client A       Client B       Client C
//! ```
//!
//! Each connection walks `Connecting → Joined → Leaving → Closed`:
//! - `Connecting`: token check (close 4001 on failure), then join
//!   (close 4000 if the session cannot be set up)
//! - `Joined`: `session_state` snapshot, then one `select!` loop over the
//!   socket, the room receiver and a heartbeat ping
//! - `Leaving`: roster and lock cleanup, always run to completion even if the
//!   connection task is cancelled
//!
//! A background sweeper expires locks and ends idle sessions.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::auth::{diagram_from_path, extract_token, IdentityProvider, StaticTokenProvider};
use crate::config::ServerConfig;
use crate::error::{CollabError, CollabResult};
use crate::hub::{Connection, Hub, JoinOutcome};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::storage::StoreError;

/// Close code for a missing or rejected token.
pub const CLOSE_UNAUTHENTICATED: u16 = 4001;
/// Close code for a connection that could not be joined to a session.
pub const CLOSE_SETUP_FAILED: u16 = 4000;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;
type GatewayResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub lagged_disconnects: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub active_sessions: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Connecting,
    Joined,
    Leaving,
    Closed,
}

/// Runs `Hub::leave` when dropped, on a detached task so it survives
/// cancellation of the connection task.
struct LeaveGuard {
    hub: Arc<Hub>,
    connection: Option<Connection>,
}

impl LeaveGuard {
    async fn run(mut self) {
        if let Some(conn) = self.connection.take() {
            let hub = self.hub.clone();
            if let Err(e) = tokio::spawn(async move { hub.leave(&conn).await }).await {
                log::error!("Leave cleanup task failed: {e}");
            }
        }
    }
}

impl Drop for LeaveGuard {
    fn drop(&mut self) {
        if let Some(conn) = self.connection.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let hub = self.hub.clone();
                handle.spawn(async move { hub.leave(&conn).await });
            }
        }
    }
}

/// The collaboration server.
pub struct CollabServer {
    config: ServerConfig,
    hub: Arc<Hub>,
    identity: Arc<dyn IdentityProvider>,
    stats: Arc<RwLock<ServerStats>>,
}

impl CollabServer {
    /// Create a server that authenticates against the config's token table.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let identity = Arc::new(StaticTokenProvider::from_entries(&config.tokens));
        Self::with_identity(config, identity)
    }

    pub fn with_identity(config: ServerConfig, identity: Arc<dyn IdentityProvider>) -> Result<Self, StoreError> {
        let hub = Arc::new(Hub::new(config.clone())?);
        Ok(Self {
            config,
            hub,
            identity,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        })
    }

    /// Recover persisted sessions from storage.
    pub async fn recover(&self) -> CollabResult<usize> {
        self.hub.recover().await
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> GatewayResult<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> GatewayResult<()> {
        let recovered = self.recover().await?;
        if recovered > 0 {
            log::info!("Recovered {recovered} sessions from persistent storage");
        }

        let _sweeper = SweeperHandle(self.spawn_sweeper());
        log::info!("Collaboration server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let identity = self.identity.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, hub, identity, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    fn spawn_sweeper(&self) -> JoinHandle<()> {
        let hub = self.hub.clone();
        let period = Duration::from_secs(self.config.lock_sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let report = hub.sweep().await;
                if report.expired_locks > 0 || report.ended_sessions > 0 {
                    log::info!(
                        "Sweep: {} expired locks, {} idle sessions ended",
                        report.expired_locks,
                        report.ended_sessions
                    );
                }
            }
        })
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: Arc<Hub>,
        identity: Arc<dyn IdentityProvider>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> GatewayResult<()> {
        let mut path = String::new();
        let mut query: Option<String> = None;
        let mut authorization: Option<String> = None;
        let capture = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            path = req.uri().path().to_string();
            query = req.uri().query().map(str::to_string);
            authorization = req
                .headers()
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            Ok(resp)
        };
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, capture).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut phase = ConnectionPhase::Connecting;
        let result = Self::drive(
            &hub,
            identity.as_ref(),
            &stats,
            addr,
            (path.as_str(), query.as_deref(), authorization.as_deref()),
            &mut ws_sender,
            &mut ws_receiver,
            &mut phase,
        )
        .await;

        let _ = ws_sender.close().await;
        phase = ConnectionPhase::Closed;
        log::debug!("Connection from {addr} is {phase:?}");

        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        hub: &Arc<Hub>,
        identity: &dyn IdentityProvider,
        stats: &RwLock<ServerStats>,
        addr: SocketAddr,
        (path, query, authorization): (&str, Option<&str>, Option<&str>),
        ws_sender: &mut WsSink,
        ws_receiver: &mut WsSource,
        phase: &mut ConnectionPhase,
    ) -> GatewayResult<()> {
        // Connecting
        let user = match extract_token(query, authorization) {
            Some(token) => identity.authenticate(&token).await,
            None => None,
        };
        let Some(user) = user else {
            log::warn!("Rejected unauthenticated connection from {addr}");
            stats.write().await.rejected_connections += 1;
            close_with(ws_sender, CLOSE_UNAUTHENTICATED, "unauthenticated").await;
            return Ok(());
        };

        let Some(diagram_id) = diagram_from_path(path) else {
            log::warn!("Connection from {addr} named no diagram ({path})");
            stats.write().await.rejected_connections += 1;
            close_with(ws_sender, CLOSE_SETUP_FAILED, "expected /diagrams/<id>").await;
            return Ok(());
        };

        let JoinOutcome {
            connection,
            snapshot,
            mut receiver,
            ..
        } = match hub.join(diagram_id, user).await {
            Ok(joined) => joined,
            Err(e) => {
                log::error!("Join failed for {addr} on diagram {diagram_id}: {e}");
                stats.write().await.rejected_connections += 1;
                close_with(ws_sender, CLOSE_SETUP_FAILED, "session setup failed").await;
                return Ok(());
            }
        };
        let leave = LeaveGuard {
            hub: hub.clone(),
            connection: Some(connection.clone()),
        };
        *phase = ConnectionPhase::Joined;
        log::info!(
            "{} ({}) joined diagram {diagram_id} from {addr}",
            connection.user.display_name,
            connection.user.user_id
        );

        let outcome = async {
            send(ws_sender, &snapshot).await?;
            let period = Duration::from_secs(hub.config().heartbeat_interval_secs.max(1));
            let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = heartbeat.tick() => {
                        ws_sender.send(Message::Ping(Default::default())).await?;
                    }

                    // Incoming WebSocket message
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                {
                                    let mut s = stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += text.len() as u64;
                                }
                                if !Self::dispatch(hub, &connection, text.as_str(), ws_sender).await? {
                                    break;
                                }
                            }

                            Some(Ok(Message::Binary(_))) => {
                                let err = CollabError::MalformedMessage("binary frames are not supported".into());
                                send(ws_sender, &ServerMessage::error(&err)).await?;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    // Outgoing room message
                    msg = receiver.recv() => {
                        match msg {
                            Ok(envelope) => {
                                if envelope.delivers_to(connection.connection_id) {
                                    ws_sender.send(Message::text(envelope.payload.to_string())).await?;
                                }
                            }
                            Err(RecvError::Lagged(n)) => {
                                log::warn!("Peer {} lagged by {n} messages; disconnecting", connection.user.user_id);
                                stats.write().await.lagged_disconnects += 1;
                                break;
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }
                }
            }
            GatewayResult::Ok(())
        }
        .await;

        *phase = ConnectionPhase::Leaving;
        drop(receiver);
        leave.run().await;
        outcome
    }

    /// Handle one text frame. Returns false when the connection should leave.
    async fn dispatch(hub: &Hub, connection: &Connection, text: &str, ws_sender: &mut WsSink) -> GatewayResult<bool> {
        let msg = match ClientMessage::decode(text) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Failed to decode message from {}: {e}", connection.user.user_id);
                send(ws_sender, &ServerMessage::error(&e)).await?;
                return Ok(true);
            }
        };
        if msg == ClientMessage::Leave {
            return Ok(false);
        }

        let kind = msg.kind();
        match hub.handle(connection, msg).await {
            Ok(Some(reply)) => send(ws_sender, &reply).await?,
            Ok(None) => {}
            Err(e) => {
                if e.is_internal() {
                    log::error!("{kind} from {} failed: {e}", connection.user.user_id);
                } else {
                    log::debug!("{kind} from {} rejected: {e}", connection.user.user_id);
                }
                send(ws_sender, &ServerMessage::error(&e)).await?;
                if matches!(e, CollabError::SessionClosed(_)) {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.hub.router().room_count().await;
        stats.active_sessions = self.hub.registry().active_session_count().await;
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }
}

/// Aborts the sweeper when the accept loop exits.
struct SweeperHandle(JoinHandle<()>);

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn send(ws_sender: &mut WsSink, msg: &ServerMessage) -> GatewayResult<()> {
    ws_sender.send(Message::text(msg.encode()?)).await?;
    Ok(())
}

async fn close_with(ws_sender: &mut WsSink, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
    };
    if let Err(e) = ws_sender.send(Message::Close(Some(frame))).await {
        log::debug!("Close frame not delivered: {e}");
    }
}
