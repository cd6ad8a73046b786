//! Per-connection session state bridging transport and CRDT core.
//!
//! A [`Session`] owns its own [`HlcClock`] and a shared handle to the
//! document it edits; it owns no canvas data. Every client-submitted
//! operation is merged into the session clock and re-stamped with a fresh
//! tick before applying, so the stored clock reflects this session's causal
//! knowledge rather than the client's possibly-stale clock.
//!
//! The merge + re-stamp + apply critical section runs synchronously under
//! the per-document mutex — no await inside — so two sessions' clock
//! adjustments can never interleave.

use uuid::Uuid;

use crate::clock::HlcClock;
use crate::document::{DocumentSnapshot, StateVector};
use crate::op::Operation;
use crate::store::SharedDocument;

/// Ephemeral state for one connected editor.
pub struct Session {
    session_id: Uuid,
    user_id: String,
    username: String,
    clock: HlcClock,
    document: SharedDocument,
}

impl Session {
    /// Create a session bound to a shared document. The session id doubles
    /// as the HLC node id, so clock tie-breaks are per-connection.
    pub fn new(user_id: impl Into<String>, username: impl Into<String>, document: SharedDocument) -> Self {
        let session_id = Uuid::new_v4();
        Self {
            session_id,
            user_id: user_id.into(),
            username: username.into(),
            clock: HlcClock::new(session_id.simple().to_string()),
            document,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn document(&self) -> &SharedDocument {
        &self.document
    }

    /// Ingest one client operation.
    ///
    /// Returns the re-stamped operation and the document version when the
    /// apply changed state (broadcast it), or `None` for a stale no-op.
    pub async fn ingest(&mut self, op: &Operation) -> Option<(Operation, u64)> {
        let mut doc = self.document.lock().await;
        // Critical section: synchronous from here to unlock.
        self.clock.merge(&op.clock);
        let stamped = op.restamped(self.clock.tick(), self.session_id);
        if doc.apply(&stamped) {
            Some((stamped, doc.version()))
        } else {
            None
        }
    }

    /// Ingest a batch, preserving the client's submission order.
    ///
    /// Returns the accepted (re-stamped) subsequence and the resulting
    /// document version.
    pub async fn ingest_batch(&mut self, ops: &[Operation]) -> (Vec<Operation>, u64) {
        let mut doc = self.document.lock().await;
        let stamped: Vec<Operation> = ops
            .iter()
            .map(|op| {
                self.clock.merge(&op.clock);
                op.restamped(self.clock.tick(), self.session_id)
            })
            .collect();
        let accepted = doc.apply_batch(&stamped);
        (accepted, doc.version())
    }

    /// Op-log suffix for reconnect gap-filling, plus the current version.
    pub async fn sync_since(&self, since_version: u64) -> (Vec<Operation>, u64) {
        let doc = self.document.lock().await;
        (doc.ops_since(since_version).to_vec(), doc.version())
    }

    pub async fn snapshot(&self) -> DocumentSnapshot {
        self.document.lock().await.snapshot()
    }

    pub async fn state_vector(&self) -> StateVector {
        self.document.lock().await.state_vector()
    }
}
