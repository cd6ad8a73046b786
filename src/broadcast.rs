//! Fan-out broadcast to the other sessions editing a document.
//!
//! Built on tokio broadcast channels: one channel per document room, each
//! session holding an independent receiver buffering up to `capacity`
//! frames. Frames carry the origin session id alongside the pre-encoded
//! JSON payload, so echo suppression is an id comparison rather than a
//! re-decode on every delivery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{ProtocolError, ServerMessage};

/// Identity of a connected session within a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub user_id: String,
    pub username: String,
}

/// One frame on a room's broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastFrame {
    /// Session whose activity produced this frame; that session's receiver
    /// skips it instead of echoing back.
    pub origin: Uuid,
    /// Pre-encoded JSON payload, shared across all receivers.
    pub payload: Arc<str>,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub active_sessions: usize,
}

/// A broadcast group for a single document room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<BroadcastFrame>,
    sessions: RwLock<HashMap<Uuid, SessionInfo>>,
    capacity: usize,
    /// Lock-free on the send path; read via stats().
    frames_sent: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` bounds how many frames a lagging session may buffer
    /// before it starts dropping (backpressure).
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            sessions: RwLock::new(HashMap::new()),
            capacity,
            frames_sent: AtomicU64::new(0),
        }
    }

    /// Register a session; returns its receiver.
    pub async fn join(&self, info: SessionInfo) -> broadcast::Receiver<BroadcastFrame> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(info.session_id, info);
        self.sender.subscribe()
    }

    pub async fn leave(&self, session_id: &Uuid) -> Option<SessionInfo> {
        self.sessions.write().await.remove(session_id)
    }

    /// Encode once and fan out to every receiver; receivers filter the
    /// origin themselves. Returns the receiver count at send time.
    pub fn send(&self, origin: Uuid, msg: &ServerMessage) -> Result<usize, ProtocolError> {
        let payload: Arc<str> = msg.encode()?.into();
        Ok(self.send_frame(BroadcastFrame { origin, payload }))
    }

    /// Fan out a pre-encoded frame. Lock-free.
    pub fn send_frame(&self, frame: BroadcastFrame) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn contains(&self, session_id: &Uuid) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            active_sessions: self.sessions.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Raw receiver without roster registration (monitoring, tests).
    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastFrame> {
        self.sender.subscribe()
    }
}

/// Room manager: document id → broadcast group.
///
/// Each document gets its own group so frames never leak across documents.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Get or create the room for a document.
    pub async fn get_or_create(&self, document_id: &str) -> Arc<BroadcastGroup> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(document_id) {
                return room.clone();
            }
        }

        // Slow path: write lock, double-check after acquiring
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(document_id) {
            return room.clone();
        }
        let room = Arc::new(BroadcastGroup::new(self.default_capacity));
        rooms.insert(document_id.to_string(), room.clone());
        room
    }

    /// Drop the room if no sessions remain.
    pub async fn remove_if_empty(&self, document_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(document_id) {
            if room.session_count().await == 0 {
                rooms.remove(document_id);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
