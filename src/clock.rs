//! Hybrid Logical Clock for causal ordering of canvas operations.
//!
//! An [`Hlc`] combines wall-clock milliseconds with a logical counter so
//! that events across sessions are totally ordered even when wall clocks
//! disagree or stall. Ties between concurrent events are broken by
//! `node_id` string comparison — deterministic, not "fair".
//!
//! Clock values are immutable; [`HlcClock`] is the per-session generator
//! that produces them via `tick()` (local event) and `merge()` (remote
//! observation). Both guarantee the returned value compares strictly
//! greater than every value previously issued or observed by the instance.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 8

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// A single hybrid-logical-clock reading.
///
/// Ordering is lexicographic on `(physical, logical, node_id)`, which the
/// derived impls provide thanks to field declaration order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hlc {
    /// Wall-clock component in milliseconds since the Unix epoch.
    pub physical: u64,
    /// Logical counter for events within the same millisecond.
    pub logical: u32,
    /// Session-stable identifier breaking ties between concurrent events.
    pub node_id: String,
}

impl Hlc {
    pub fn new(physical: u64, logical: u32, node_id: impl Into<String>) -> Self {
        Self {
            physical,
            logical,
            node_id: node_id.into(),
        }
    }
}

impl std::fmt::Display for Hlc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.physical, self.logical, self.node_id)
    }
}

/// Stateful clock generator owned by one session.
///
/// Never shared across sessions; concurrency is handled by each session
/// owning its own instance and merging remote readings as they arrive.
#[derive(Debug, Clone)]
pub struct HlcClock {
    node_id: String,
    physical: u64,
    logical: u32,
}

/// Current wall time in milliseconds. Saturates at 0 if the system clock
/// reads before the epoch.
fn wall_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl HlcClock {
    /// Create a clock for the given node. Starts at the current wall time
    /// so the first `tick()` is already ahead of any zero-valued clock.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            physical: wall_now_ms(),
            logical: 0,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// The last value this clock issued or advanced to.
    pub fn current(&self) -> Hlc {
        Hlc::new(self.physical, self.logical, self.node_id.clone())
    }

    /// Produce the next local-event timestamp.
    ///
    /// If wall time moved forward, adopt it and reset the counter;
    /// otherwise (same millisecond, or wall clock moved backward) keep
    /// `physical` and bump `logical`. `physical` never decreases.
    pub fn tick(&mut self) -> Hlc {
        self.tick_at(wall_now_ms())
    }

    /// `tick()` with an injected wall-clock reading, for deterministic tests.
    pub fn tick_at(&mut self, now_ms: u64) -> Hlc {
        if now_ms > self.physical {
            self.physical = now_ms;
            self.logical = 0;
        } else {
            self.logical += 1;
        }
        self.current()
    }

    /// Incorporate a remote timestamp, returning a value strictly greater
    /// than both the local clock and the remote reading.
    pub fn merge(&mut self, remote: &Hlc) -> Hlc {
        self.merge_at(remote, wall_now_ms())
    }

    /// `merge()` with an injected wall-clock reading, for deterministic tests.
    pub fn merge_at(&mut self, remote: &Hlc, now_ms: u64) -> Hlc {
        if now_ms > self.physical && now_ms > remote.physical {
            self.physical = now_ms;
            self.logical = 0;
        } else if self.physical == remote.physical {
            self.logical = self.logical.max(remote.logical) + 1;
        } else if remote.physical > self.physical {
            self.physical = remote.physical;
            self.logical = remote.logical + 1;
        } else {
            self.logical += 1;
        }
        self.current()
    }
}
