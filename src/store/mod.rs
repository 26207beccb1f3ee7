//! Document store used as the signaling transport.
//!
//! The store is eventually consistent and was never designed as a message
//! bus: listeners redeliver snapshots, a writer sees its own writes, and the
//! same document is overwritten for several message kinds. Everything above
//! this module has to tolerate that.

pub mod firestore;
pub mod memory;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::models::Document;

pub use firestore::FirestoreStore;
pub use memory::MemoryStore;

/// One document as seen by a listener. `data` is `None` when the document
/// does not exist (or was deleted).
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSnapshot {
    pub id: String,
    pub path: String,
    pub data: Option<Document>,
}

impl DocumentSnapshot {
    pub fn new(path: &str, data: Option<Document>) -> Self {
        Self {
            id: doc_id(path).to_string(),
            path: path.to_string(),
            data,
        }
    }
}

/// Equality filter on a top-level field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldFilter {
    pub field: String,
    pub value: Value,
}

impl FieldFilter {
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Self {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn matches(&self, doc: &Document) -> bool {
        doc.get(&self.field) == Some(&self.value)
    }
}

/// What a listener is attached to.
#[derive(Debug, Clone, PartialEq)]
pub enum ListenTarget {
    /// A single document.
    Document(String),
    /// Every document of a collection.
    Collection(String),
    /// Documents of a collection matching all filters.
    Query {
        collection: String,
        filters: Vec<FieldFilter>,
    },
}

impl ListenTarget {
    /// Whether a write to `path` with `data` is visible to this listener.
    pub fn matches(&self, path: &str, data: &Document) -> bool {
        match self {
            ListenTarget::Document(p) => p == path,
            ListenTarget::Collection(c) => parent_path(path) == Some(c.as_str()),
            ListenTarget::Query {
                collection,
                filters,
            } => {
                parent_path(path) == Some(collection.as_str())
                    && filters.iter().all(|f| f.matches(data))
            }
        }
    }
}

/// Errors raised by a document store. Cloneable so a single failure can be
/// fanned out to every affected listener.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("store request failed ({status}): {body}")]
    Http { status: u16, body: String },

    #[error("could not decode store response: {0}")]
    Decode(String),
}

/// Item delivered on a listener: a batch of changed documents or an error.
/// Errors do not end the subscription.
pub type ListenEvent = Result<Vec<DocumentSnapshot>, StoreError>;

/// Receiving end of a listener. Dropping it cancels the listener.
pub type Subscription = mpsc::UnboundedReceiver<ListenEvent>;

/// Abstract document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Overwrite the document at `path` (last writer wins).
    async fn set(&self, path: &str, data: Document) -> Result<(), StoreError>;

    /// Append a document with a generated id to `collection`. Returns the id.
    async fn add(&self, collection: &str, data: Document) -> Result<String, StoreError>;

    /// Start a listener. The first delivery is the current state of the
    /// target; later deliveries carry documents written since.
    fn listen(&self, target: ListenTarget) -> Subscription;
}

/// Last segment of a document path.
pub fn doc_id(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Collection containing the document at `path`.
pub fn parent_path(path: &str) -> Option<&str> {
    path.rfind('/').map(|idx| &path[..idx])
}

/// Document paths have an even number of non-empty segments.
pub fn validate_document_path(path: &str) -> Result<(), StoreError> {
    let segments: Vec<&str> = path.split('/').collect();
    if segments.iter().any(|s| s.is_empty()) || segments.len() % 2 != 0 {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// Collection paths have an odd number of non-empty segments.
pub fn validate_collection_path(path: &str) -> Result<(), StoreError> {
    let segments: Vec<&str> = path.split('/').collect();
    if segments.iter().any(|s| s.is_empty()) || segments.len() % 2 != 1 {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(())
}
