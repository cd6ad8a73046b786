//! # canvas-collab — Real-time collaborative canvas engine
//!
//! CRDT-based multiplayer editing over WebSockets: hybrid logical clocks,
//! last-writer-wins registers, add-biased element liveness, and a JSON wire
//! protocol with presence fan-out.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ CollabClient │ ◄─────────────────► │ CollabServer │
//! │ (per user)   │     JSON frames     │ (central)    │
//! └──────┬───────┘                     └──────┬───────┘
//!        │                                    │ re-stamp (HLC)
//!        ▼                                    ▼
//! ┌──────────────┐                     ┌──────────────┐
//! │ local replica│                     │ Document     │
//! │ + offline q  │                     │ (authority)  │
//! └──────────────┘                     └──────┬───────┘
//!                                             │
//!                                     ┌───────┴───────┐
//!                                     │BroadcastGroup │──► OpLogStore
//!                                     │ (fan-out)     │    (RocksDB)
//!                                     └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`clock`] — Hybrid logical clocks with total ordering
//! - [`op`] / [`register`] / [`element`] / [`document`] — the CRDT core
//! - [`store`] — sharded in-memory document registry
//! - [`session`] — per-connection re-stamping and apply
//! - [`protocol`] — JSON wire protocol
//! - [`broadcast`] — room-based fan-out with backpressure
//! - [`server`] / [`client`] — the WebSocket transport
//! - [`presence`] — ephemeral cursors and status
//! - [`storage`] — durable op log and checkpoints (RocksDB)
//!
//! ## Convergence
//!
//! Two replicas that apply the same set of operations agree on content,
//! regardless of delivery order, duplication, or interleaving. Order
//! disputes resolve by HLC comparison; element add/remove is add-biased.

pub mod clock;
pub mod op;
pub mod register;
pub mod element;
pub mod document;
pub mod store;
pub mod session;
pub mod protocol;
pub mod broadcast;
pub mod presence;
pub mod server;
pub mod client;
pub mod storage;

// Re-exports for convenience
pub use clock::{Hlc, HlcClock};
pub use op::{OpType, Operation};
pub use register::LwwRegister;
pub use element::ElementMap;
pub use document::{Document, DocumentSnapshot, StateVector};
pub use store::{DocumentStore, SharedDocument};
pub use session::Session;
pub use protocol::{
    ClientMessage, ProtocolError, ServerMessage, CLOSE_ROOM_FULL, CLOSE_UNAUTHORIZED,
};
pub use broadcast::{BroadcastFrame, BroadcastGroup, BroadcastStats, RoomManager, SessionInfo};
pub use presence::{CursorPosition, CursorThrottle, PeerPresence, PresenceRoster, PresenceStatus};
pub use server::{AccessChecker, AllowAll, CollabConfig, CollabServer, ServerStats};
pub use client::{CollabClient, CollabEvent, ConnectionState, OfflineQueue};
pub use storage::{DocumentMeta, OpLogStore, StoreConfig, StoreError};
