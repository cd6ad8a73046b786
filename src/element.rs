//! Per-element CRDT state: property registers plus existence tombstones.
//!
//! An [`ElementMap`] aggregates one [`LwwRegister`] per property together
//! with `add_clock`/`remove_clock` for element existence. Existence is
//! add-biased: an element is alive when its latest add outranks its latest
//! remove. Properties written to a dead element are retained so a later
//! resurrection recovers the last known values; nothing is garbage
//! collected.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::Hlc;
use crate::op::{OpType, Operation};
use crate::register::LwwRegister;

/// CRDT state for one canvas element.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementMap {
    props: HashMap<String, LwwRegister>,
    add_clock: Option<Hlc>,
    remove_clock: Option<Hlc>,
}

impl ElementMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add-biased liveness: alive iff added, and the add outranks any remove.
    pub fn is_alive(&self) -> bool {
        match (&self.add_clock, &self.remove_clock) {
            (Some(add), Some(remove)) => add > remove,
            (Some(_), None) => true,
            _ => false,
        }
    }

    pub fn add_clock(&self) -> Option<&Hlc> {
        self.add_clock.as_ref()
    }

    pub fn remove_clock(&self) -> Option<&Hlc> {
        self.remove_clock.as_ref()
    }

    /// Apply one operation, returning whether visible state advanced.
    ///
    /// Stale operations (clock not strictly greater than the relevant
    /// stored clock) are silent no-ops, which is what makes replay and
    /// out-of-order delivery safe.
    pub fn apply_op(&mut self, op: &Operation) -> bool {
        match op.op_type {
            OpType::AddElement => self.apply_add(op),
            OpType::RemoveElement => self.apply_remove(&op.clock),
            OpType::Set => self.write_prop(&op.prop, op.value.clone(), op.clock.clone()),
            OpType::Delete => self.write_prop(&op.prop, Value::Null, op.clock.clone()),
        }
    }

    fn apply_add(&mut self, op: &Operation) -> bool {
        let accepted = match &self.add_clock {
            Some(existing) => op.clock > *existing,
            None => true,
        };
        if !accepted {
            return false;
        }
        self.add_clock = Some(op.clock.clone());
        // An add may carry a property payload seeding initial values; each
        // entry goes through normal LWW arbitration.
        if let Value::Object(seed) = &op.value {
            for (prop, value) in seed {
                self.write_prop(prop, value.clone(), op.clock.clone());
            }
        }
        true
    }

    fn apply_remove(&mut self, clock: &Hlc) -> bool {
        let accepted = match &self.remove_clock {
            Some(existing) => *clock > *existing,
            None => true,
        };
        if accepted {
            self.remove_clock = Some(clock.clone());
        }
        accepted
    }

    fn write_prop(&mut self, prop: &str, value: Value, clock: Hlc) -> bool {
        match self.props.get_mut(prop) {
            Some(register) => register.set(value, clock),
            None => {
                self.props
                    .insert(prop.to_string(), LwwRegister::new(value, clock));
                true
            }
        }
    }

    /// Current non-null property values.
    ///
    /// Deliberately ignores liveness — callers combine this with
    /// [`is_alive`](Self::is_alive) (full-state sync keeps dead elements'
    /// snapshots out by filtering at the document level).
    pub fn snapshot(&self) -> serde_json::Map<String, Value> {
        self.props
            .iter()
            .filter(|(_, reg)| reg.is_set())
            .map(|(prop, reg)| (prop.clone(), reg.value().clone()))
            .collect()
    }

    /// Number of property registers, tombstoned ones included.
    pub fn register_count(&self) -> usize {
        self.props.len()
    }
}
