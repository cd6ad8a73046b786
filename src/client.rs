//! WebSocket client for connecting to the collaboration server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect)
//! - Operation send/receive with HLC stamping
//! - Cursor and presence updates (cursor sends throttled to 30fps)
//! - Offline queue for edits made while disconnected
//!
//! The client keeps its own [`HlcClock`] so locally produced operations are
//! causally ordered even before the server re-stamps them. Remote clocks are
//! merged in as ops arrive, which keeps the local clock ahead of everything
//! this client has observed.
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::clock::HlcClock;
use crate::document::{DocumentSnapshot, StateVector};
use crate::op::Operation;
use crate::presence::{CursorPosition, CursorThrottle, PresenceRoster, PresenceStatus};
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted to the application.
#[derive(Debug, Clone)]
pub enum CollabEvent {
    /// Connection established and join sent
    Connected,
    /// Connection lost
    Disconnected,
    /// Re-stamped operations accepted by the server. `origin` is the
    /// submitting session; compare against nothing client-side — the ops
    /// are authoritative either way.
    RemoteOps {
        ops: Vec<Operation>,
        version: u64,
        origin: Option<Uuid>,
    },
    /// Full document snapshot (reply to snapshot_request)
    Snapshot(DocumentSnapshot),
    /// State vector (connection greeting or divergence check)
    StateVector(StateVector),
    /// A remote cursor moved
    CursorMoved {
        user_id: String,
        username: String,
        position: CursorPosition,
    },
    UserJoined { user_id: String, username: String },
    UserLeft { user_id: String, username: String },
    PresenceChanged {
        user_id: String,
        username: String,
        status: PresenceStatus,
    },
    Pong,
}

/// Queue for operations produced while disconnected, replayed on reconnect.
pub struct OfflineQueue {
    queue: VecDeque<Operation>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an op for later replay. Returns false when full.
    pub fn enqueue(&mut self, op: Operation) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(op);
        true
    }

    /// Drain all queued ops in submission order.
    pub fn drain(&mut self) -> Vec<Operation> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// The collaboration client.
pub struct CollabClient {
    client_id: Uuid,
    user_id: String,
    username: String,
    document_id: String,
    server_url: String,

    state: Arc<RwLock<ConnectionState>>,
    clock: Arc<Mutex<HlcClock>>,
    offline_queue: Arc<Mutex<OfflineQueue>>,
    /// Highest document version seen; sync_request picks up from here.
    last_seen_version: Arc<RwLock<u64>>,
    /// Everyone else in the room, as observed from broadcasts.
    roster: Arc<RwLock<PresenceRoster>>,
    cursor_throttle: Mutex<CursorThrottle>,

    outgoing_tx: Option<mpsc::Sender<Message>>,
    event_rx: Option<mpsc::Receiver<CollabEvent>>,
    event_tx: mpsc::Sender<CollabEvent>,
}

impl CollabClient {
    pub fn new(
        user_id: impl Into<String>,
        username: impl Into<String>,
        document_id: impl Into<String>,
        server_url: impl Into<String>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let client_id = Uuid::new_v4();
        Self {
            client_id,
            user_id: user_id.into(),
            username: username.into(),
            document_id: document_id.into(),
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            clock: Arc::new(Mutex::new(HlcClock::new(client_id.simple().to_string()))),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(10_000))),
            last_seen_version: Arc::new(RwLock::new(0)),
            roster: Arc::new(RwLock::new(PresenceRoster::new())),
            cursor_throttle: Mutex::new(CursorThrottle::new()),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<CollabEvent>> {
        self.event_rx.take()
    }

    /// Connect, join the document, replay any queued edits, and request the
    /// ops missed while away. Spawns reader and writer tasks.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        let reconnecting = *self.last_seen_version.read().await > 0;
        *self.state.write().await = if reconnecting {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        };

        let ws_stream = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Connect to {} failed: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };

        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing channel to the socket. When the
        // channel closes (disconnect or drop), run the close handshake so
        // the server sees the departure promptly.
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        self.outgoing_tx = Some(out_tx.clone());
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if ws_writer.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Handshake first; the server drops anything sent before the join.
        let join = ClientMessage::Join {
            document_id: self.document_id.clone(),
            user_id: self.user_id.clone(),
            username: self.username.clone(),
        };
        out_tx
            .send(Message::Text(join.encode()?.into()))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(CollabEvent::Connected).await;

        // Replay offline edits as one batch, then fill the gap.
        {
            let queued = self.offline_queue.lock().await.drain();
            if !queued.is_empty() {
                log::info!("Replaying {} queued operations", queued.len());
                let batch = ClientMessage::CrdtBatch { ops: queued };
                let _ = out_tx.send(Message::Text(batch.encode()?.into())).await;
            }
        }
        if reconnecting {
            let since_version = *self.last_seen_version.read().await;
            let sync = ClientMessage::SyncRequest { since_version };
            let _ = out_tx.send(Message::Text(sync.encode()?.into())).await;
        }

        // Reader task: decode server frames into events.
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let clock = self.clock.clone();
        let last_seen = self.last_seen_version.clone();
        let roster = self.roster.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let server_msg = match ServerMessage::decode(&text) {
                            Ok(m) => m,
                            Err(e) => {
                                log::warn!("Undecodable server frame: {e}");
                                continue;
                            }
                        };
                        let event = match server_msg {
                            ServerMessage::CrdtOps { ops, version, origin } => {
                                {
                                    let mut clk = clock.lock().await;
                                    for op in &ops {
                                        clk.merge(&op.clock);
                                    }
                                }
                                let mut seen = last_seen.write().await;
                                *seen = (*seen).max(version);
                                Some(CollabEvent::RemoteOps { ops, version, origin })
                            }
                            ServerMessage::Snapshot { data } => {
                                let mut seen = last_seen.write().await;
                                *seen = (*seen).max(data.version);
                                Some(CollabEvent::Snapshot(data))
                            }
                            ServerMessage::StateVector { data } => {
                                Some(CollabEvent::StateVector(data))
                            }
                            ServerMessage::CursorUpdate { user_id, username, position } => {
                                roster.write().await.cursor(&user_id, &username, position);
                                Some(CollabEvent::CursorMoved { user_id, username, position })
                            }
                            ServerMessage::UserJoined { user_id, username } => {
                                roster.write().await.join(&user_id, &username);
                                Some(CollabEvent::UserJoined { user_id, username })
                            }
                            ServerMessage::UserLeft { user_id, username } => {
                                roster.write().await.leave(&user_id);
                                Some(CollabEvent::UserLeft { user_id, username })
                            }
                            ServerMessage::PresenceUpdate { user_id, username, status } => {
                                roster.write().await.status(&user_id, &username, status);
                                Some(CollabEvent::PresenceChanged { user_id, username, status })
                            }
                            ServerMessage::Pong => Some(CollabEvent::Pong),
                        };
                        if let Some(evt) = event {
                            let _ = event_tx.send(evt).await;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(CollabEvent::Disconnected).await;
        });

        Ok(())
    }

    // ─── Operations ───────────────────────────────────────────────────

    /// Set one property on an element.
    pub async fn set(
        &self,
        element_id: impl Into<String>,
        prop: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<(), ProtocolError> {
        let clock = self.clock.lock().await.tick();
        self.send_op(Operation::set(element_id, prop, value, clock, self.client_id))
            .await
    }

    /// Delete one property (writes a null tombstone).
    pub async fn delete(
        &self,
        element_id: impl Into<String>,
        prop: impl Into<String>,
    ) -> Result<(), ProtocolError> {
        let clock = self.clock.lock().await.tick();
        self.send_op(Operation::delete(element_id, prop, clock, self.client_id))
            .await
    }

    /// Add an element with its initial properties.
    pub async fn add_element(
        &self,
        element_id: impl Into<String>,
        initial: serde_json::Value,
    ) -> Result<(), ProtocolError> {
        let clock = self.clock.lock().await.tick();
        self.send_op(Operation::add_element(element_id, initial, clock, self.client_id))
            .await
    }

    /// Remove an element from the canvas.
    pub async fn remove_element(&self, element_id: impl Into<String>) -> Result<(), ProtocolError> {
        let clock = self.clock.lock().await.tick();
        self.send_op(Operation::remove_element(element_id, clock, self.client_id))
            .await
    }

    /// Send an already-stamped operation. Queued when disconnected.
    pub async fn send_op(&self, op: Operation) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            let mut queue = self.offline_queue.lock().await;
            if !queue.enqueue(op) {
                return Err(ProtocolError::ConnectionClosed);
            }
            return Ok(());
        }
        self.send(ClientMessage::CrdtOp { op }).await
    }

    /// Send a batch of stamped operations in order.
    pub async fn send_batch(&self, ops: Vec<Operation>) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            let mut queue = self.offline_queue.lock().await;
            for op in ops {
                if !queue.enqueue(op) {
                    return Err(ProtocolError::ConnectionClosed);
                }
            }
            return Ok(());
        }
        self.send(ClientMessage::CrdtBatch { ops }).await
    }

    /// Ask for the ops since a version (gap fill).
    pub async fn sync_request(&self, since_version: u64) -> Result<(), ProtocolError> {
        self.send(ClientMessage::SyncRequest { since_version }).await
    }

    /// Ask for a full snapshot.
    pub async fn snapshot_request(&self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::SnapshotRequest).await
    }

    // ─── Presence ─────────────────────────────────────────────────────

    /// Send a cursor move. Throttled to 30fps; over-budget moves are
    /// silently dropped (the next allowed one supersedes them anyway).
    pub async fn send_cursor(&self, position: CursorPosition) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Ok(()); // presence is ephemeral, never queued
        }
        if !self.cursor_throttle.lock().await.allow() {
            return Ok(());
        }
        self.send(ClientMessage::CursorMove { position }).await
    }

    /// Advertise an activity status. Not throttled.
    pub async fn send_presence(&self, status: PresenceStatus) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Ok(());
        }
        self.send(ClientMessage::PresenceUpdate { status }).await
    }

    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Ping).await
    }

    async fn send(&self, msg: ClientMessage) -> Result<(), ProtocolError> {
        let encoded = msg.encode()?;
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(Message::Text(encoded.into()))
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Close the connection. Pending edits made after this queue offline.
    pub async fn disconnect(&mut self) {
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.send(Message::Close(None)).await;
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }

    // ─── Accessors ────────────────────────────────────────────────────

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn last_seen_version(&self) -> u64 {
        *self.last_seen_version.read().await
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }

    /// Presence of everyone else in the room.
    pub fn roster(&self) -> &Arc<RwLock<PresenceRoster>> {
        &self.roster
    }
}
