//! Persistence and realtime seam used by the engine.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::{CollabError, Result};
use crate::operation::Operation;

/// Last-known persisted form of a document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDocument {
    /// Flattened text content.
    pub content: String,
    /// Full CRDT state from a checkpoint, preferred over `content` on load.
    pub crdt_state: Option<Vec<u8>>,
}

impl StoredDocument {
    pub fn from_content(content: &str) -> Self {
        Self {
            content: content.to_string(),
            crdt_state: None,
        }
    }
}

/// Backend the engine loads documents from and publishes operations to.
pub trait DocumentBackend: Send + Sync {
    fn load_document(
        &self,
        document_id: &str,
    ) -> impl Future<Output = Result<Option<StoredDocument>>> + Send;

    fn save_document(
        &self,
        document_id: &str,
        document: StoredDocument,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Persist the operation to the log and broadcast it to other
    /// participants of the document.
    fn publish_operation(&self, operation: Operation) -> impl Future<Output = Result<()>> + Send;
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-process backend for a single replica, with switchable failures.
#[derive(Debug, Default)]
pub struct OfflineBackend {
    documents: Mutex<HashMap<String, StoredDocument>>,
    published: Mutex<Vec<Operation>>,
    offline: AtomicBool,
    fail_loads: AtomicBool,
}

impl OfflineBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(self, document_id: &str, content: &str) -> Self {
        lock(&self.documents).insert(document_id.to_string(), StoredDocument::from_content(content));
        self
    }

    /// While offline, publishing fails with a network error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<Operation> {
        lock(&self.published).clone()
    }

    pub fn stored(&self, document_id: &str) -> Option<StoredDocument> {
        lock(&self.documents).get(document_id).cloned()
    }
}

impl DocumentBackend for OfflineBackend {
    async fn load_document(&self, document_id: &str) -> Result<Option<StoredDocument>> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(CollabError::Storage(format!("load of {} failed", document_id)));
        }
        Ok(lock(&self.documents).get(document_id).cloned())
    }

    async fn save_document(&self, document_id: &str, document: StoredDocument) -> Result<()> {
        lock(&self.documents).insert(document_id.to_string(), document);
        Ok(())
    }

    async fn publish_operation(&self, operation: Operation) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(CollabError::NetworkFailure("backend unreachable".into()));
        }
        lock(&self.published).push(operation);
        Ok(())
    }
}
