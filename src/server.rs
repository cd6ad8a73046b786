//! WebSocket collaboration server with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (document_id) ── Document (CRDT) ── BroadcastGroup
//! Client B ──┘                             │
//!                                          ├── OpLogStore (RocksDB)
//!                                          │       │
//!                                          │       ├── Ops (LZ4 JSON)
//!                                          │       └── Checkpoints (LZ4 JSON)
//!                                          │
//!                               ┌──────────┼───────────┐
//!                               ▼          ▼           ▼
//!                            Client A   Client B    Client C
//! ```
//!
//! Every connection starts with a `join` handshake naming the document and
//! the caller identity. Authorization runs against an [`AccessChecker`];
//! a rejected join closes the socket with code 4403, a full room with 4429.
//! After the handshake each client-submitted operation is re-stamped by the
//! connection's [`Session`] and fanned out to the rest of the room.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapters 5 & 8

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::{RoomManager, SessionInfo};
use crate::op::Operation;
use crate::protocol::{ClientMessage, ServerMessage, CLOSE_ROOM_FULL, CLOSE_UNAUTHORIZED};
use crate::session::Session;
use crate::storage::{OpLogStore, StoreConfig, StoreError};
use crate::store::DocumentStore;

/// How long a connection may sit without sending its `join`.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct CollabConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum concurrent sessions per document
    pub max_sessions_per_document: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Heartbeat interval in seconds (advisory, used by clients)
    pub heartbeat_interval_secs: u64,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_sessions_per_document: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            storage_path: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub rejected_joins: u64,
    pub persisted_ops: u64,
    pub persisted_checkpoints: u64,
}

/// Authorization hook for the join handshake.
///
/// Runs synchronously inside the handshake; implementations are expected to
/// consult in-memory state (an ACL cache, a token table), not the network.
pub trait AccessChecker: Send + Sync {
    fn has_access(&self, document_id: &str, user_id: &str) -> bool;
}

/// Default checker: every identity may open every document.
pub struct AllowAll;

impl AccessChecker for AllowAll {
    fn has_access(&self, _document_id: &str, _user_id: &str) -> bool {
        true
    }
}

/// Shared state every connection task holds.
struct ServerContext {
    config: CollabConfig,
    documents: DocumentStore,
    rooms: RoomManager,
    stats: RwLock<ServerStats>,
    access: Arc<dyn AccessChecker>,
    storage: Option<Arc<OpLogStore>>,
}

/// The collaboration server.
pub struct CollabServer {
    ctx: Arc<ServerContext>,
}

impl CollabServer {
    pub fn new(config: CollabConfig) -> Result<Self, StoreError> {
        Self::with_access(config, Arc::new(AllowAll))
    }

    /// Create with a custom authorization hook.
    pub fn with_access(
        config: CollabConfig,
        access: Arc<dyn AccessChecker>,
    ) -> Result<Self, StoreError> {
        let storage = match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                Some(Arc::new(OpLogStore::open(store_config)?))
            }
            None => None,
        };

        Ok(Self {
            ctx: Arc::new(ServerContext {
                rooms: RoomManager::new(config.broadcast_capacity),
                config,
                documents: DocumentStore::new(),
                stats: RwLock::new(ServerStats::default()),
                access,
                storage,
            }),
        })
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        // Default config has no storage path, so open cannot fail.
        match Self::new(CollabConfig::default()) {
            Ok(server) => server,
            Err(_) => unreachable!("in-memory server construction is infallible"),
        }
    }

    /// Create with persistence enabled at the given path.
    pub fn with_storage(
        bind_addr: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Result<Self, StoreError> {
        Self::new(CollabConfig {
            bind_addr: bind_addr.into(),
            storage_path: Some(path.into()),
            ..CollabConfig::default()
        })
    }

    /// Accept connections forever. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.ctx.config.bind_addr).await?;
        log::info!("Collab server listening on {}", self.ctx.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, ctx).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.ctx.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.ctx.config.bind_addr
    }

    /// The persistent store, if configured.
    pub fn storage(&self) -> Option<&Arc<OpLogStore>> {
        self.ctx.storage.as_ref()
    }

    /// Currently open documents.
    pub async fn active_documents(&self) -> Vec<String> {
        self.ctx.rooms.active_documents().await
    }
}

type WsStream = WebSocketStream<TcpStream>;
type ConnResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

async fn handle_connection(stream: TcpStream, addr: SocketAddr, ctx: Arc<ServerContext>) -> ConnResult {
    let mut ws = tokio_tungstenite::accept_async(stream).await?;
    log::info!("WebSocket connection established from {addr}");

    {
        let mut s = ctx.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let result = serve_session(&mut ws, addr, &ctx).await;

    let mut s = ctx.stats.write().await;
    s.active_connections -= 1;
    drop(s);

    result
}

/// Run the join handshake, then the message loop, then room cleanup.
async fn serve_session(ws: &mut WsStream, addr: SocketAddr, ctx: &Arc<ServerContext>) -> ConnResult {
    let (document_id, user_id, username) = match handshake(ws, addr, ctx).await? {
        Some(join) => join,
        None => return Ok(()), // rejected; close frame already sent
    };

    // Materialize the document, seeding from persistence on first access.
    let doc = ctx.documents.get_or_create(&document_id).await;
    if let Some(storage) = &ctx.storage {
        let mut guard = doc.lock().await;
        if guard.version() == 0 {
            match storage.restore(&document_id) {
                Ok(Some(restored)) => {
                    log::info!(
                        "Restored document {document_id} at version {}",
                        restored.version()
                    );
                    *guard = restored;
                }
                Ok(None) => {}
                Err(e) => log::error!("Failed to restore document {document_id}: {e}"),
            }
        }
    }

    let mut session = Session::new(user_id.clone(), username.clone(), doc);
    let session_id = session.session_id();

    let room = ctx.rooms.get_or_create(&document_id).await;
    let mut broadcast_rx = room
        .join(SessionInfo {
            session_id,
            user_id: user_id.clone(),
            username: username.clone(),
        })
        .await;

    // Greeting: the authoritative state vector, so the client can decide
    // between sync_request and snapshot_request.
    let greeting = ServerMessage::StateVector {
        data: session.state_vector().await,
    };
    ws.send(Message::Text(greeting.encode()?.into())).await?;

    let _ = room.send(
        session_id,
        &ServerMessage::UserJoined {
            user_id: user_id.clone(),
            username: username.clone(),
        },
    );
    log::info!("{username} ({user_id}) joined document {document_id}");

    // Message loop
    loop {
        tokio::select! {
            msg = ws.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        ctx.stats.write().await.total_messages += 1;
                        match ClientMessage::decode(&text) {
                            Ok(client_msg) => {
                                dispatch(ws, &mut session, &room, ctx, client_msg).await?;
                            }
                            Err(e) => {
                                // Malformed frame: drop it, keep the connection.
                                log::warn!("Malformed frame from {addr}: {e}");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        break;
                    }
                    Some(Ok(_)) => {} // binary/pong frames carry nothing here
                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        break;
                    }
                }
            }

            frame = broadcast_rx.recv() => {
                match frame {
                    Ok(frame) => {
                        if frame.origin == session_id {
                            continue; // own activity, already answered directly
                        }
                        ws.send(Message::Text(frame.payload.to_string().into())).await?;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Session {session_id} lagged by {n} frames");
                    }
                    Err(_) => break,
                }
            }
        }
    }

    // Cleanup: leave the room, tell the others, maybe retire the document.
    room.leave(&session_id).await;
    let _ = room.send(
        session_id,
        &ServerMessage::UserLeft {
            user_id: user_id.clone(),
            username: username.clone(),
        },
    );

    if ctx.rooms.remove_if_empty(&document_id).await {
        log::info!("Room {document_id} removed (empty)");
        if let Some(storage) = &ctx.storage {
            checkpoint_and_evict(ctx, storage, &document_id).await;
        }
    }

    Ok(())
}

/// Read and validate the `join` message. Returns `None` after sending a
/// close frame when the connection is rejected.
async fn handshake(
    ws: &mut WsStream,
    addr: SocketAddr,
    ctx: &Arc<ServerContext>,
) -> Result<Option<(String, String, String)>, Box<dyn std::error::Error + Send + Sync>> {
    let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, ws.next()).await;
    let text = match first {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(Some(Ok(_))) | Ok(None) | Ok(Some(Err(_))) => {
            log::warn!("Connection from {addr} did not start with a join");
            ws.close(None).await?;
            return Ok(None);
        }
        Err(_) => {
            log::warn!("Handshake timeout from {addr}");
            ws.close(None).await?;
            return Ok(None);
        }
    };

    let join = match ClientMessage::decode(&text) {
        Ok(ClientMessage::Join {
            document_id,
            user_id,
            username,
        }) => (document_id, user_id, username),
        Ok(other) => {
            log::warn!("Expected join from {addr}, got {other:?}");
            ws.close(None).await?;
            return Ok(None);
        }
        Err(e) => {
            log::warn!("Malformed join from {addr}: {e}");
            ws.close(None).await?;
            return Ok(None);
        }
    };

    if !ctx.access.has_access(&join.0, &join.1) {
        log::warn!("Unauthorized join for document {} by {}", join.0, join.1);
        ctx.stats.write().await.rejected_joins += 1;
        ws.close(Some(CloseFrame {
            code: CloseCode::Library(CLOSE_UNAUTHORIZED),
            reason: "unauthorized".into(),
        }))
        .await?;
        return Ok(None);
    }

    let room = ctx.rooms.get_or_create(&join.0).await;
    if room.session_count().await >= ctx.config.max_sessions_per_document {
        log::warn!("Document {} is full, rejecting {}", join.0, join.1);
        ctx.stats.write().await.rejected_joins += 1;
        ws.close(Some(CloseFrame {
            code: CloseCode::Library(CLOSE_ROOM_FULL),
            reason: "room full".into(),
        }))
        .await?;
        return Ok(None);
    }

    Ok(Some(join))
}

/// Handle one decoded client message.
async fn dispatch(
    ws: &mut WsStream,
    session: &mut Session,
    room: &crate::broadcast::BroadcastGroup,
    ctx: &Arc<ServerContext>,
    msg: ClientMessage,
) -> ConnResult {
    let session_id = session.session_id();
    match msg {
        ClientMessage::CrdtOp { op } => {
            if let Some((stamped, version)) = session.ingest(&op).await {
                persist_ops(ctx, session, std::slice::from_ref(&stamped), version).await;
                let reply = ServerMessage::CrdtOps {
                    ops: vec![stamped],
                    version,
                    origin: Some(session_id),
                };
                // Submitter gets the authoritative re-stamped op directly;
                // the broadcast frame is origin-filtered on its receiver.
                ws.send(Message::Text(reply.encode()?.into())).await?;
                let _ = room.send(session_id, &reply);
            }
            // Stale write: silent no-op, nothing to send.
        }
        ClientMessage::CrdtBatch { ops } => {
            let (accepted, version) = session.ingest_batch(&ops).await;
            if !accepted.is_empty() {
                persist_ops(ctx, session, &accepted, version).await;
                let reply = ServerMessage::CrdtOps {
                    ops: accepted,
                    version,
                    origin: Some(session_id),
                };
                ws.send(Message::Text(reply.encode()?.into())).await?;
                let _ = room.send(session_id, &reply);
            }
        }
        ClientMessage::SyncRequest { since_version } => {
            let (ops, version) = session.sync_since(since_version).await;
            let reply = ServerMessage::CrdtOps {
                ops,
                version,
                origin: None,
            };
            ws.send(Message::Text(reply.encode()?.into())).await?;
        }
        ClientMessage::SnapshotRequest => {
            let reply = ServerMessage::Snapshot {
                data: session.snapshot().await,
            };
            ws.send(Message::Text(reply.encode()?.into())).await?;
        }
        ClientMessage::CursorMove { position } => {
            let _ = room.send(
                session_id,
                &ServerMessage::CursorUpdate {
                    user_id: session.user_id().to_string(),
                    username: session.username().to_string(),
                    position,
                },
            );
        }
        ClientMessage::PresenceUpdate { status } => {
            let _ = room.send(
                session_id,
                &ServerMessage::PresenceUpdate {
                    user_id: session.user_id().to_string(),
                    username: session.username().to_string(),
                    status,
                },
            );
        }
        ClientMessage::Ping => {
            ws.send(Message::Text(ServerMessage::Pong.encode()?.into()))
                .await?;
        }
        ClientMessage::Join { .. } => {
            log::warn!("Duplicate join from session {session_id}, ignoring");
        }
    }
    Ok(())
}

/// Append freshly accepted ops to the durable log. `final_version` is the
/// document version after the last op; earlier ops get consecutive versions
/// counting back from it.
async fn persist_ops(ctx: &Arc<ServerContext>, session: &Session, ops: &[Operation], final_version: u64) {
    let Some(storage) = &ctx.storage else {
        return;
    };
    let document_id = {
        let doc = session.document().lock().await;
        doc.document_id().to_string()
    };
    let first_version = final_version - ops.len() as u64 + 1;
    for (i, op) in ops.iter().enumerate() {
        let version = first_version + i as u64;
        if let Err(e) = storage.append_op(&document_id, version, op) {
            log::error!("Failed to persist op v{version} for {document_id}: {e}");
            return;
        }
    }
    ctx.stats.write().await.persisted_ops += ops.len() as u64;
}

/// Checkpoint a closing document, compact its log, and evict it from the
/// in-memory registry.
async fn checkpoint_and_evict(ctx: &Arc<ServerContext>, storage: &Arc<OpLogStore>, document_id: &str) {
    let Some(doc) = ctx.documents.remove(document_id).await else {
        return;
    };
    let guard = doc.lock().await;
    match storage.save_checkpoint(&guard) {
        Ok(meta) => {
            let _ = storage.compact_ops(document_id, meta.checkpoint_version);
            ctx.stats.write().await.persisted_checkpoints += 1;
            log::info!(
                "Checkpointed document {document_id} at version {} (room closing)",
                meta.checkpoint_version
            );
        }
        Err(e) => {
            log::error!("Failed to checkpoint document {document_id}: {e}");
        }
    }
}
