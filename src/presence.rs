//! Ephemeral presence: cursors and activity status.
//!
//! Presence is broadcast-only and never touches the Document — it carries
//! no ordering guarantee beyond last-sent-wins per session. A peer that
//! disconnects simply disappears from the roster; nothing is persisted.
//!
//! Cursor updates are rate-limited to 30fps before hitting the wire, the
//! usual budget for smooth remote cursors without flooding the channel.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Cursor position in canvas (world) coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
}

impl CursorPosition {
    pub const ORIGIN: CursorPosition = CursorPosition { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl Default for CursorPosition {
    fn default() -> Self {
        Self::ORIGIN
    }
}

/// Coarse activity state a user advertises to the room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Idle,
    Editing,
    Away,
}

impl Default for PresenceStatus {
    fn default() -> Self {
        Self::Idle
    }
}

/// Last-known presence of one remote peer. Updates are last-sent-wins.
#[derive(Debug, Clone)]
pub struct PeerPresence {
    pub user_id: String,
    pub username: String,
    pub cursor: CursorPosition,
    pub status: PresenceStatus,
    last_update: Instant,
}

impl PeerPresence {
    pub fn new(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
            cursor: CursorPosition::ORIGIN,
            status: PresenceStatus::default(),
            last_update: Instant::now(),
        }
    }

    pub fn update_cursor(&mut self, position: CursorPosition) {
        self.cursor = position;
        self.last_update = Instant::now();
    }

    pub fn update_status(&mut self, status: PresenceStatus) {
        self.status = status;
        self.last_update = Instant::now();
    }

    /// Whether no update has arrived within `timeout`.
    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_update.elapsed() > timeout
    }
}

/// Client-side view of everyone else in the room.
#[derive(Debug, Default)]
pub struct PresenceRoster {
    peers: HashMap<String, PeerPresence>,
}

impl PresenceRoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&mut self, user_id: &str, username: &str) {
        self.peers
            .entry(user_id.to_string())
            .or_insert_with(|| PeerPresence::new(user_id, username));
    }

    pub fn leave(&mut self, user_id: &str) -> Option<PeerPresence> {
        self.peers.remove(user_id)
    }

    /// Record a cursor update, creating the peer if the join raced past us.
    pub fn cursor(&mut self, user_id: &str, username: &str, position: CursorPosition) {
        self.peers
            .entry(user_id.to_string())
            .or_insert_with(|| PeerPresence::new(user_id, username))
            .update_cursor(position);
    }

    pub fn status(&mut self, user_id: &str, username: &str, status: PresenceStatus) {
        self.peers
            .entry(user_id.to_string())
            .or_insert_with(|| PeerPresence::new(user_id, username))
            .update_status(status);
    }

    pub fn get(&self, user_id: &str) -> Option<&PeerPresence> {
        self.peers.get(user_id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerPresence> {
        self.peers.values()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// Outbound cursor rate limiter: 30fps (33ms) between sends.
///
/// Status changes are not throttled — they are rare and must not be lost
/// to a cursor-move burst.
#[derive(Debug)]
pub struct CursorThrottle {
    last_sent: Option<Instant>,
    min_interval: Duration,
}

impl CursorThrottle {
    pub fn new() -> Self {
        Self {
            last_sent: None,
            min_interval: Duration::from_millis(33),
        }
    }

    pub fn with_interval(min_interval: Duration) -> Self {
        Self {
            last_sent: None,
            min_interval,
        }
    }

    /// Whether a cursor update may go out now; records the send if so.
    pub fn allow(&mut self) -> bool {
        let now = Instant::now();
        match self.last_sent {
            Some(last) if now.duration_since(last) < self.min_interval => false,
            _ => {
                self.last_sent = Some(now);
                true
            }
        }
    }
}

impl Default for CursorThrottle {
    fn default() -> Self {
        Self::new()
    }
}
