//! Process-wide document registry.
//!
//! Maps canvas/document id to its single authoritative [`Document`].
//! Get-or-create is atomic with respect to concurrent first access, so two
//! sessions racing on a new document id always end up sharing one instance.
//! The registry is sharded by document-id hash so unrelated documents never
//! contend on one lock.
//!
//! Lifecycle is tied to the process: nothing here expires documents. The
//! server evicts via [`DocumentStore::remove`] as an operational decision.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::document::Document;

/// Shared handle to one document. All mutation goes through the mutex, one
/// operation in flight per document.
pub type SharedDocument = Arc<Mutex<Document>>;

const SHARD_COUNT: usize = 16;

/// Sharded in-memory registry of documents.
pub struct DocumentStore {
    shards: Vec<RwLock<HashMap<String, SharedDocument>>>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT)
                .map(|_| RwLock::new(HashMap::new()))
                .collect(),
        }
    }

    fn shard(&self, document_id: &str) -> &RwLock<HashMap<String, SharedDocument>> {
        let mut hasher = DefaultHasher::new();
        document_id.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % SHARD_COUNT]
    }

    /// Return the document for the id, creating an empty one on first access.
    pub async fn get_or_create(&self, document_id: &str) -> SharedDocument {
        let shard = self.shard(document_id);

        // Fast path: read lock
        {
            let docs = shard.read().await;
            if let Some(doc) = docs.get(document_id) {
                return doc.clone();
            }
        }

        // Slow path: write lock, double-check after acquiring
        let mut docs = shard.write().await;
        if let Some(doc) = docs.get(document_id) {
            return doc.clone();
        }
        let doc = Arc::new(Mutex::new(Document::new(document_id)));
        docs.insert(document_id.to_string(), doc.clone());
        doc
    }

    /// Look up without creating.
    pub async fn get(&self, document_id: &str) -> Option<SharedDocument> {
        self.shard(document_id).read().await.get(document_id).cloned()
    }

    /// Evict a document from the registry. Sessions holding the Arc keep
    /// their reference; the registry just forgets it.
    pub async fn remove(&self, document_id: &str) -> Option<SharedDocument> {
        self.shard(document_id).write().await.remove(document_id)
    }

    /// Number of registered documents.
    pub async fn len(&self) -> usize {
        let mut total = 0;
        for shard in &self.shards {
            total += shard.read().await.len();
        }
        total
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// All registered document ids.
    pub async fn document_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for shard in &self.shards {
            ids.extend(shard.read().await.keys().cloned());
        }
        ids
    }
}

impl Default for DocumentStore {
    fn default() -> Self {
        Self::new()
    }
}
