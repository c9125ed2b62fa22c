//! WebSocket relay server.
//!
//! One task accepts TCP connections; each connection gets its own task
//! running a three-way select:
//!
//! ```text
//!   accept loop ──spawn──► per-connection task
//!                            │
//!                            ├─ socket frame ──► room.handle_message ──► replies
//!                            ├─ room broadcast ─► socket (skip own origin)
//!                            └─ keepalive tick ─► ping / idle timeout
//! ```
//!
//! The room a connection lands in is named by the request path of the
//! WebSocket handshake: `ws://host:port/design-doc` joins `"design-doc"`.
//! The name is taken verbatim after stripping the leading slash.
//!
//! A connection is closed for exactly three reasons beyond the peer going
//! away on its own: it sent a frame that violates the protocol, it fell too
//! far behind the room's fan-out, or it went silent past the keepalive
//! timeout. All exits funnel through the same leave path, so the rest of
//! the room always learns that the departed peer's presence is gone.

use std::error::Error;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::protocol::ProtocolError;
use crate::room::{BroadcastFrame, BroadcastPolicy, Room, RoomConfig, RoomManager};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the WebSocket listener to.
    pub bind_addr: String,
    /// Capacity of each room's broadcast channel.
    pub broadcast_capacity: usize,
    /// Awareness entries older than this are swept.
    pub outdated_timeout: Duration,
    /// How often to ping idle connections.
    pub keepalive_interval: Duration,
    /// Close a connection that has sent nothing at all for this long.
    pub keepalive_timeout: Duration,
    /// How long an empty room lingers before retirement; `None` keeps
    /// rooms for the life of the process.
    pub empty_room_grace: Option<Duration>,
    /// Fan-out policy for document updates.
    pub update_policy: BroadcastPolicy,
    /// Fan-out policy for awareness changes.
    pub awareness_policy: BroadcastPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            outdated_timeout: Duration::from_millis(30_000),
            keepalive_interval: Duration::from_secs(30),
            keepalive_timeout: Duration::from_secs(60),
            empty_room_grace: None,
            update_policy: BroadcastPolicy::ExcludeOrigin,
            awareness_policy: BroadcastPolicy::IncludeOrigin,
        }
    }
}

impl ServerConfig {
    /// The room-level slice of this configuration.
    pub fn room_config(&self) -> RoomConfig {
        RoomConfig {
            broadcast_capacity: self.broadcast_capacity,
            outdated_timeout: self.outdated_timeout,
            update_policy: self.update_policy,
            awareness_policy: self.awareness_policy,
            empty_room_grace: self.empty_room_grace,
        }
    }
}

/// Server-wide counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServerStats {
    pub connections_accepted: u64,
    pub active_connections: u64,
    pub active_rooms: usize,
}

#[derive(Debug, Default)]
struct AtomicServerStats {
    connections_accepted: AtomicU64,
    active_connections: AtomicU64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Session teardown reasons
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum SessionError {
    /// The peer sent a frame that violates the wire protocol.
    Protocol(ProtocolError),
    /// The peer fell behind the room's fan-out channel.
    Backpressure { lagged: u64 },
    /// Nothing arrived from the peer within the keepalive timeout.
    TimedOut { idle: Duration },
    /// The WebSocket transport failed underneath us.
    Transport(tungstenite::Error),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(e) => write!(f, "protocol violation: {e}"),
            Self::Backpressure { lagged } => {
                write!(f, "outbound queue overran by {lagged} frames")
            }
            Self::TimedOut { idle } => write!(f, "no traffic for {idle:?}"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
        }
    }
}

impl Error for SessionError {}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<tungstenite::Error> for SessionError {
    fn from(e: tungstenite::Error) -> Self {
        Self::Transport(e)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server
// ─────────────────────────────────────────────────────────────────────────────

/// The relay: accepts WebSocket connections and routes each into the room
/// named by its request path.
pub struct SyncServer {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<AtomicServerStats>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(config.room_config()));
        Self {
            config,
            rooms,
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// The manager owning this server's rooms, for embedding and
    /// introspection.
    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            connections_accepted: self.stats.connections_accepted.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            active_rooms: self.rooms.room_count().await,
        }
    }

    /// Binds the listener and serves until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");
            let rooms = self.rooms.clone();
            let config = self.config.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                handle_connection(stream, addr, rooms, config, stats).await;
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    rooms: Arc<RoomManager>,
    config: ServerConfig,
    stats: Arc<AtomicServerStats>,
) {
    // Capture the request path during the handshake; it names the room.
    let mut path = String::new();
    let ws_stream = match tokio_tungstenite::accept_hdr_async(
        stream,
        |req: &Request, resp: Response| {
            path = req.uri().path().to_string();
            Ok(resp)
        },
    )
    .await
    {
        Ok(ws) => ws,
        Err(e) => {
            log::debug!("WebSocket handshake with {addr} failed: {e}");
            return;
        }
    };

    let room_name = room_name_from_path(&path);
    let conn_id = Uuid::new_v4();
    let (room, broadcast_rx) = rooms.attach(&room_name, conn_id).await;
    stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
    stats.active_connections.fetch_add(1, Ordering::Relaxed);
    log::info!("Connection {conn_id} from {addr} joined room {room_name:?}");

    let result = run_session(ws_stream, &room, conn_id, &config, broadcast_rx).await;

    // Every exit, clean or not, goes through the same leave path so the
    // room broadcasts the departed peer's presence as offline.
    rooms.detach(&room_name, &room, conn_id).await;
    stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    match result {
        Ok(()) => log::info!("Connection {conn_id} closed"),
        Err(e) => log::warn!("Connection {conn_id} closed: {e}"),
    }
}

/// Room names are the request path, verbatim, minus the leading slash.
/// No normalization: `/a` and `/a/` are different rooms.
fn room_name_from_path(path: &str) -> String {
    path.strip_prefix('/').unwrap_or(path).to_string()
}

async fn run_session(
    ws_stream: WebSocketStream<TcpStream>,
    room: &Room,
    conn_id: Uuid,
    config: &ServerConfig,
    mut broadcast_rx: broadcast::Receiver<BroadcastFrame>,
) -> Result<(), SessionError> {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // Greet the peer: our state vector, then the awareness table if anyone
    // is in it.
    for frame in room.open_frames().await {
        ws_sender.send(Message::Binary(frame.into())).await?;
    }

    let mut keepalive = tokio::time::interval(config.keepalive_interval);
    keepalive.tick().await; // the first tick completes immediately
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            inbound = ws_receiver.next() => {
                match inbound {
                    Some(Ok(Message::Binary(data))) => {
                        last_seen = Instant::now();
                        if data.is_empty() {
                            continue;
                        }
                        let replies = room.handle_message(conn_id, &data).await?;
                        for reply in replies {
                            ws_sender.send(Message::Binary(reply.into())).await?;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        last_seen = Instant::now();
                        ws_sender.send(Message::Pong(payload)).await?;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_seen = Instant::now();
                    }
                    Some(Ok(Message::Text(_))) => {
                        // The protocol is binary-only; tolerate and ignore.
                        last_seen = Instant::now();
                        log::debug!("Ignoring text frame from {conn_id}");
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(SessionError::Transport(e)),
                }
            }
            outbound = broadcast_rx.recv() => {
                match outbound {
                    Ok(frame) => {
                        if frame.origin == Some(conn_id) {
                            continue; // the sender already has this change
                        }
                        ws_sender
                            .send(Message::Binary(frame.payload.to_vec().into()))
                            .await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(lagged)) => {
                        // Dropping the slow member beats stalling the room;
                        // it can reconnect and resync from scratch.
                        return Err(SessionError::Backpressure { lagged });
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }
            _ = keepalive.tick() => {
                let idle = last_seen.elapsed();
                if idle > config.keepalive_timeout {
                    return Err(SessionError::TimedOut { idle });
                }
                ws_sender.send(Message::Ping(Vec::new().into())).await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.outdated_timeout, Duration::from_millis(30_000));
        assert!(config.empty_room_grace.is_none());
        assert_eq!(config.update_policy, BroadcastPolicy::ExcludeOrigin);
        assert_eq!(config.awareness_policy, BroadcastPolicy::IncludeOrigin);
    }

    #[test]
    fn test_room_config_mirrors_server_config() {
        let config = ServerConfig {
            broadcast_capacity: 8,
            outdated_timeout: Duration::from_millis(500),
            empty_room_grace: Some(Duration::from_secs(1)),
            update_policy: BroadcastPolicy::IncludeOrigin,
            ..ServerConfig::default()
        };
        let room_config = config.room_config();
        assert_eq!(room_config.broadcast_capacity, 8);
        assert_eq!(room_config.outdated_timeout, Duration::from_millis(500));
        assert_eq!(room_config.empty_room_grace, Some(Duration::from_secs(1)));
        assert_eq!(room_config.update_policy, BroadcastPolicy::IncludeOrigin);
    }

    #[test]
    fn test_room_name_from_path() {
        assert_eq!(room_name_from_path("/design-doc"), "design-doc");
        assert_eq!(room_name_from_path("/"), "");
        assert_eq!(room_name_from_path("/nested/name"), "nested/name");
        assert_eq!(room_name_from_path("/with%20escape"), "with%20escape");
    }

    #[tokio::test]
    async fn test_new_server_is_empty() {
        let server = SyncServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.connections_accepted, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.active_rooms, 0);
    }
}
