//! Last-Writer-Wins register — the atomic unit of conflict resolution.
//!
//! A register holds one property value plus the clock of the writer that
//! last won it. `set` accepts a write only when its clock is strictly
//! greater than the stored clock; a rejected write is a silent no-op, not
//! an error — CRDT convergence expects redundant and out-of-order delivery.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::Hlc;

/// Single-property LWW register.
///
/// A tombstoned property is a register holding `Value::Null`; the register
/// itself is never removed, so its clock keeps guarding against stale
/// resurrection writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LwwRegister {
    value: Value,
    clock: Hlc,
}

impl LwwRegister {
    pub fn new(value: Value, clock: Hlc) -> Self {
        Self { value, clock }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn clock(&self) -> &Hlc {
        &self.clock
    }

    /// Accept `value` iff `clock` is strictly greater than the stored clock.
    ///
    /// Returns `true` when visible state changed and the write should be
    /// propagated; `false` for a stale write.
    pub fn set(&mut self, value: Value, clock: Hlc) -> bool {
        if clock > self.clock {
            self.value = value;
            self.clock = clock;
            true
        } else {
            false
        }
    }

    /// Whether the register currently holds a live (non-null) value.
    pub fn is_set(&self) -> bool {
        !self.value.is_null()
    }
}
