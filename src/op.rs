//! Operations — the immutable unit of canvas mutation.
//!
//! Every edit a client makes is expressed as one [`Operation`]: set or
//! tombstone a single property, or add/remove a whole element. The embedded
//! [`Hlc`] alone determines ordering and idempotence; delivery order and
//! duplication are irrelevant to the outcome.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::clock::Hlc;

/// Kind of mutation an operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    /// Set one property on an element.
    Set,
    /// Tombstone one property (stored as a null-valued register write).
    Delete,
    /// Mark an element as existing, optionally seeding properties.
    AddElement,
    /// Mark an element as removed.
    RemoveElement,
}

/// One immutable canvas mutation.
///
/// Wire shape (JSON):
/// `{op_type, element_id, prop, value, clock: {physical, logical, node_id}, origin}`.
/// `prop` is empty for element-level ops; `value` is `null` for deletes and
/// removes, and may be a property map for `add_element`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub op_type: OpType,
    pub element_id: String,
    #[serde(default)]
    pub prop: String,
    #[serde(default)]
    pub value: Value,
    pub clock: Hlc,
    pub origin: Uuid,
}

impl Operation {
    /// Set `element_id.prop = value`.
    pub fn set(
        element_id: impl Into<String>,
        prop: impl Into<String>,
        value: Value,
        clock: Hlc,
        origin: Uuid,
    ) -> Self {
        Self {
            op_type: OpType::Set,
            element_id: element_id.into(),
            prop: prop.into(),
            value,
            clock,
            origin,
        }
    }

    /// Tombstone `element_id.prop`.
    pub fn delete(
        element_id: impl Into<String>,
        prop: impl Into<String>,
        clock: Hlc,
        origin: Uuid,
    ) -> Self {
        Self {
            op_type: OpType::Delete,
            element_id: element_id.into(),
            prop: prop.into(),
            value: Value::Null,
            clock,
            origin,
        }
    }

    /// Add an element, optionally seeding initial properties.
    ///
    /// `value` should be `Value::Null` (no payload) or an object mapping
    /// property names to initial values.
    pub fn add_element(element_id: impl Into<String>, value: Value, clock: Hlc, origin: Uuid) -> Self {
        Self {
            op_type: OpType::AddElement,
            element_id: element_id.into(),
            prop: String::new(),
            value,
            clock,
            origin,
        }
    }

    /// Remove an element.
    pub fn remove_element(element_id: impl Into<String>, clock: Hlc, origin: Uuid) -> Self {
        Self {
            op_type: OpType::RemoveElement,
            element_id: element_id.into(),
            prop: String::new(),
            value: Value::Null,
            clock,
            origin,
        }
    }

    /// Copy of this operation carrying a new clock and origin.
    ///
    /// Used by the relaying session to re-stamp client submissions with its
    /// own causal knowledge before applying and broadcasting.
    pub fn restamped(&self, clock: Hlc, origin: Uuid) -> Self {
        Self {
            clock,
            origin,
            ..self.clone()
        }
    }
}
