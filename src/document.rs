//! The full CRDT state for one canvas document.
//!
//! A [`Document`] maps element ids to [`ElementMap`]s, keeps an append-only
//! operation log, and tracks a version counter that advances exactly once
//! per operation that changed visible state. The log is index-aligned with
//! the version, so `ops_since(v)` is a plain suffix slice — the cheap path
//! for reconnect gap-filling.
//!
//! Every function here is total over valid operations: a stale or duplicate
//! operation is a `false` return, never an error. That property is what
//! makes convergence provable; failure lives at the transport edges only.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::element::ElementMap;
use crate::op::Operation;

/// Value-only view of a document, for full-state sync.
///
/// `elements` holds only alive elements; within each, only non-null
/// properties. Serialized key order is deterministic (`serde_json`'s map is
/// BTree-backed), which the checksum relies on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub document_id: String,
    pub version: u64,
    pub elements: serde_json::Map<String, Value>,
}

/// Compact divergence detector: replicas with equal checksums hold equal
/// snapshots without transferring them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector {
    pub document_id: String,
    pub version: u64,
    pub element_count: usize,
    pub checksum: String,
}

/// CRDT state for one canvas: element maps + op log + version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    document_id: String,
    elements: HashMap<String, ElementMap>,
    op_log: Vec<Operation>,
    version: u64,
}

impl Document {
    pub fn new(document_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            elements: HashMap::new(),
            op_log: Vec::new(),
            version: 0,
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Apply one operation; returns whether state changed.
    ///
    /// The element map is created on first reference regardless of op type:
    /// a `set` may legitimately arrive before its element's `add_element`,
    /// and the write must be stored rather than dropped.
    pub fn apply(&mut self, op: &Operation) -> bool {
        let element = self.elements.entry(op.element_id.clone()).or_default();
        if element.apply_op(op) {
            self.op_log.push(op.clone());
            self.version += 1;
            true
        } else {
            false
        }
    }

    /// Apply a batch in order, returning the subsequence that changed state.
    ///
    /// The returned ops are the ones worth broadcasting; rejected ops were
    /// stale everywhere and carry no information for peers.
    pub fn apply_batch(&mut self, ops: &[Operation]) -> Vec<Operation> {
        ops.iter()
            .filter(|op| self.apply(op))
            .cloned()
            .collect()
    }

    /// Whether the element exists and is currently alive.
    pub fn is_alive(&self, element_id: &str) -> bool {
        self.elements
            .get(element_id)
            .is_some_and(ElementMap::is_alive)
    }

    /// Value-only view of all alive elements.
    pub fn snapshot(&self) -> DocumentSnapshot {
        let elements = self
            .elements
            .iter()
            .filter(|(_, el)| el.is_alive())
            .map(|(id, el)| (id.clone(), Value::Object(el.snapshot())))
            .collect();
        DocumentSnapshot {
            document_id: self.document_id.clone(),
            version: self.version,
            elements,
        }
    }

    /// Version + content checksum for cheap divergence detection.
    pub fn state_vector(&self) -> StateVector {
        let snapshot = self.snapshot();
        StateVector {
            document_id: self.document_id.clone(),
            version: self.version,
            element_count: snapshot.elements.len(),
            checksum: content_checksum(&self.document_id, &snapshot.elements),
        }
    }

    /// Suffix of the op log after the caller's known count.
    ///
    /// `version` is the number of ops the caller has already seen, not a
    /// clock field. A count beyond the log yields an empty slice.
    pub fn ops_since(&self, version: u64) -> &[Operation] {
        let start = (version as usize).min(self.op_log.len());
        &self.op_log[start..]
    }

    /// Total elements tracked, dead ones included.
    pub fn element_count(&self) -> usize {
        self.elements.len()
    }
}

/// 12-hex-char blake3 digest of the canonical (sorted-key) serialization of
/// the snapshot content.
///
/// The version counter is deliberately excluded: replicas that converged
/// through different delivery orders may have rejected different ops and
/// therefore disagree on version while agreeing on content.
fn content_checksum(document_id: &str, elements: &serde_json::Map<String, Value>) -> String {
    let canonical = serde_json::json!({
        "document_id": document_id,
        "elements": elements,
    });
    // serde_json maps iterate in key order, so this serialization is
    // canonical without extra sorting.
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    blake3::hash(&bytes).to_hex()[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Hlc;
    use serde_json::json;
    use uuid::Uuid;

    fn hlc(physical: u64, logical: u32, node: &str) -> Hlc {
        Hlc::new(physical, logical, node)
    }

    fn origin() -> Uuid {
        Uuid::nil()
    }

    /// The six concrete scenarios from the collaboration model, in order.
    #[test]
    fn test_reference_scenario() {
        let mut doc = Document::new("canvas-1");

        // 1. add e1: alive but empty snapshot entry.
        doc.apply(&Operation::add_element("e1", Value::Null, hlc(1000, 0, "A"), origin()));
        assert!(doc.is_alive("e1"));
        assert_eq!(doc.snapshot().elements["e1"], json!({}));

        // 2. set fill.
        doc.apply(&Operation::set("e1", "fill", json!("#fff"), hlc(1001, 0, "A"), origin()));
        assert_eq!(doc.snapshot().elements["e1"], json!({"fill": "#fff"}));

        // 3. concurrent writes: (1002,0,"B") beats (1002,0,"A") lexically.
        doc.apply(&Operation::set("e1", "fill", json!("#000"), hlc(1002, 0, "A"), origin()));
        doc.apply(&Operation::set("e1", "fill", json!("#f00"), hlc(1002, 0, "B"), origin()));
        assert_eq!(doc.snapshot().elements["e1"], json!({"fill": "#f00"}));

        // 4. remove then re-add: property retained across resurrection.
        doc.apply(&Operation::remove_element("e1", hlc(1003, 0, "A"), origin()));
        assert!(!doc.is_alive("e1"));
        doc.apply(&Operation::add_element("e1", Value::Null, hlc(1004, 0, "A"), origin()));
        assert!(doc.is_alive("e1"));
        assert_eq!(doc.snapshot().elements["e1"], json!({"fill": "#f00"}));
    }

    #[test]
    fn test_version_counts_effective_ops_only() {
        let mut doc = Document::new("d");
        assert!(doc.apply(&Operation::set("e1", "x", json!(1), hlc(100, 0, "A"), origin())));
        assert_eq!(doc.version(), 1);
        // Stale write: version unchanged, log unchanged.
        assert!(!doc.apply(&Operation::set("e1", "x", json!(2), hlc(50, 0, "A"), origin())));
        assert_eq!(doc.version(), 1);
        assert_eq!(doc.ops_since(0).len(), 1);
    }

    #[test]
    fn test_idempotence() {
        let mut doc = Document::new("d");
        let op = Operation::set("e1", "x", json!(1), hlc(100, 0, "A"), origin());
        doc.apply(&op);
        let once = (doc.version(), doc.snapshot());
        doc.apply(&op);
        assert_eq!((doc.version(), doc.snapshot()), once);
    }

    #[test]
    fn test_commutativity_distinct_props() {
        let a = Operation::set("e1", "x", json!(1), hlc(100, 0, "A"), origin());
        let b = Operation::set("e1", "y", json!(2), hlc(100, 0, "B"), origin());

        let mut ab = Document::new("d");
        ab.apply(&a);
        ab.apply(&b);
        let mut ba = Document::new("d");
        ba.apply(&b);
        ba.apply(&a);

        assert_eq!(ab.snapshot().elements, ba.snapshot().elements);
        assert_eq!(ab.is_alive("e1"), ba.is_alive("e1"));
    }

    #[test]
    fn test_commutativity_same_prop_distinct_clocks() {
        let a = Operation::set("e1", "fill", json!("#000"), hlc(100, 0, "A"), origin());
        let b = Operation::set("e1", "fill", json!("#fff"), hlc(101, 0, "B"), origin());

        let mut ab = Document::new("d");
        ab.apply(&a);
        ab.apply(&b);
        let mut ba = Document::new("d");
        ba.apply(&b);
        ba.apply(&a);

        assert_eq!(ab.snapshot().elements["e1"], json!({"fill": "#fff"}));
        assert_eq!(ab.snapshot().elements, ba.snapshot().elements);
    }

    #[test]
    fn test_lww_convergence_any_order() {
        let ops: Vec<Operation> = (0..8)
            .map(|i| {
                Operation::set(
                    "e1",
                    "fill",
                    json!(format!("#{i:06x}")),
                    hlc(1000 + i, 0, "A"),
                    origin(),
                )
            })
            .collect();

        // Forward, reversed, and interleaved delivery all converge on the
        // max-clock value.
        let orders: Vec<Vec<usize>> = vec![
            (0..8).collect(),
            (0..8).rev().collect(),
            vec![3, 0, 7, 1, 4, 6, 2, 5],
        ];
        for order in orders {
            let mut doc = Document::new("d");
            for i in order {
                doc.apply(&ops[i]);
            }
            assert_eq!(doc.snapshot().elements["e1"]["fill"], json!("#000007"));
        }
    }

    #[test]
    fn test_apply_batch_returns_changed_subsequence() {
        let mut doc = Document::new("d");
        let ops = vec![
            Operation::set("e1", "x", json!(1), hlc(100, 0, "A"), origin()),
            Operation::set("e1", "x", json!(0), hlc(50, 0, "A"), origin()), // stale
            Operation::set("e1", "y", json!(2), hlc(101, 0, "A"), origin()),
        ];
        let accepted = doc.apply_batch(&ops);
        assert_eq!(accepted.len(), 2);
        assert_eq!(accepted[0].prop, "x");
        assert_eq!(accepted[1].prop, "y");
        assert_eq!(doc.version(), 2);
    }

    #[test]
    fn test_ops_since_suffix() {
        let mut doc = Document::new("d");
        for i in 0..5u64 {
            doc.apply(&Operation::set(
                "e1",
                format!("p{i}"),
                json!(i),
                hlc(100 + i, 0, "A"),
                origin(),
            ));
        }
        let tail = doc.ops_since(2);
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].prop, "p2");
        assert_eq!(tail[2].prop, "p4");
        assert!(doc.ops_since(5).is_empty());
        assert!(doc.ops_since(99).is_empty());
    }

    #[test]
    fn test_snapshot_excludes_dead_elements() {
        let mut doc = Document::new("d");
        doc.apply(&Operation::add_element("e1", Value::Null, hlc(100, 0, "A"), origin()));
        doc.apply(&Operation::add_element("e2", Value::Null, hlc(101, 0, "A"), origin()));
        doc.apply(&Operation::remove_element("e2", hlc(102, 0, "A"), origin()));
        let snap = doc.snapshot();
        assert!(snap.elements.contains_key("e1"));
        assert!(!snap.elements.contains_key("e2"));
        // element_count tracks all maps, including tombstoned ones.
        assert_eq!(doc.element_count(), 2);
        assert_eq!(doc.state_vector().element_count, 1);
    }

    #[test]
    fn test_checksum_converged_replicas_match() {
        let ops = vec![
            Operation::add_element("e1", Value::Null, hlc(100, 0, "A"), origin()),
            Operation::set("e1", "fill", json!("#a00"), hlc(101, 0, "A"), origin()),
            Operation::set("e1", "fill", json!("#b00"), hlc(102, 0, "B"), origin()),
            Operation::set("e2", "w", json!(7), hlc(103, 0, "A"), origin()),
            Operation::add_element("e2", Value::Null, hlc(104, 0, "B"), origin()),
        ];
        let mut fwd = Document::new("d");
        for op in &ops {
            fwd.apply(op);
        }
        let mut rev = Document::new("d");
        for op in ops.iter().rev() {
            rev.apply(op);
        }
        // Delivery order differs and version may differ, but content agrees.
        assert_eq!(fwd.snapshot().elements, rev.snapshot().elements);
        assert_eq!(fwd.state_vector().checksum, rev.state_vector().checksum);
        assert_eq!(fwd.state_vector().checksum.len(), 12);
    }

    #[test]
    fn test_checksum_differs_on_divergence() {
        let mut a = Document::new("d");
        let mut b = Document::new("d");
        a.apply(&Operation::set("e1", "x", json!(1), hlc(100, 0, "A"), origin()));
        b.apply(&Operation::set("e1", "x", json!(2), hlc(100, 0, "B"), origin()));
        assert_ne!(a.state_vector().checksum, b.state_vector().checksum);
    }

    #[test]
    fn test_document_serde_roundtrip() {
        let mut doc = Document::new("d");
        doc.apply(&Operation::add_element("e1", json!({"fill": "#fff"}), hlc(100, 0, "A"), origin()));
        doc.apply(&Operation::remove_element("e1", hlc(50, 0, "B"), origin()));
        let encoded = serde_json::to_vec(&doc).unwrap();
        let decoded: Document = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded.version(), doc.version());
        assert_eq!(decoded.snapshot(), doc.snapshot());
        assert_eq!(decoded.state_vector(), doc.state_vector());
        assert_eq!(decoded.ops_since(0), doc.ops_since(0));
    }
}
