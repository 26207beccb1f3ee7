//! In-process document store with Firestore-like listener semantics.
//!
//! Used by the `demo` command and by tests. Listeners get the current state
//! on attach and a snapshot for every matching write, including writes made
//! by the party that is listening.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{
    parent_path, validate_collection_path, validate_document_path, DocumentSnapshot,
    DocumentStore, ListenEvent, ListenTarget, StoreError, Subscription,
};
use crate::models::Document;

struct Watcher {
    target: ListenTarget,
    tx: mpsc::UnboundedSender<ListenEvent>,
}

#[derive(Default)]
struct Inner {
    docs: BTreeMap<String, Document>,
    watchers: Vec<Watcher>,
    /// Number of upcoming writes that fail with `Unavailable`.
    failing_writes: usize,
    writes: usize,
}

/// Shared in-memory store. Wrap in an `Arc` to hand the same store to
/// several parties.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current content of a document.
    pub fn get(&self, path: &str) -> Option<Document> {
        self.lock().docs.get(path).cloned()
    }

    /// Documents directly under `collection`, ordered by path.
    pub fn list(&self, collection: &str) -> Vec<DocumentSnapshot> {
        self.lock()
            .docs
            .iter()
            .filter(|(path, _)| parent_path(path) == Some(collection))
            .map(|(path, data)| DocumentSnapshot::new(path, Some(data.clone())))
            .collect()
    }

    /// Deliver the current content of `path` again to every matching
    /// listener, as the real store does after a reconnect.
    pub fn redeliver(&self, path: &str) -> bool {
        let mut inner = self.lock();
        let Some(data) = inner.docs.get(path).cloned() else {
            return false;
        };
        notify(&mut inner.watchers, path, &data);
        true
    }

    /// Make the next `count` writes fail.
    pub fn fail_next_writes(&self, count: usize) {
        self.lock().failing_writes = count;
    }

    /// Push a transport error to every listener.
    pub fn inject_error(&self, error: StoreError) {
        let mut inner = self.lock();
        inner
            .watchers
            .retain(|w| w.tx.send(Err(error.clone())).is_ok());
    }

    /// Number of listeners that are still attached.
    pub fn listener_count(&self) -> usize {
        let mut inner = self.lock();
        inner.watchers.retain(|w| !w.tx.is_closed());
        inner.watchers.len()
    }

    /// Total successful writes so far.
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    fn write(&self, path: &str, data: Document) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.failing_writes > 0 {
            inner.failing_writes -= 1;
            return Err(StoreError::Unavailable(format!("write to {} rejected", path)));
        }
        inner.docs.insert(path.to_string(), data.clone());
        inner.writes += 1;
        notify(&mut inner.watchers, path, &data);
        Ok(())
    }
}

/// Send a snapshot of `path` to matching watchers, pruning closed ones.
fn notify(watchers: &mut Vec<Watcher>, path: &str, data: &Document) {
    watchers.retain(|w| {
        if w.tx.is_closed() {
            return false;
        }
        if w.target.matches(path, data) {
            let snap = DocumentSnapshot::new(path, Some(data.clone()));
            return w.tx.send(Ok(vec![snap])).is_ok();
        }
        true
    });
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn set(&self, path: &str, data: Document) -> Result<(), StoreError> {
        validate_document_path(path)?;
        self.write(path, data)
    }

    async fn add(&self, collection: &str, data: Document) -> Result<String, StoreError> {
        validate_collection_path(collection)?;
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.write(&format!("{}/{}", collection, id), data)?;
        Ok(id)
    }

    fn listen(&self, target: ListenTarget) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();

        let initial: Vec<DocumentSnapshot> = match &target {
            ListenTarget::Document(path) => {
                vec![DocumentSnapshot::new(path, inner.docs.get(path).cloned())]
            }
            _ => inner
                .docs
                .iter()
                .filter(|(path, data)| target.matches(path, data))
                .map(|(path, data)| DocumentSnapshot::new(path, Some(data.clone())))
                .collect(),
        };
        if !initial.is_empty() {
            let _ = tx.send(Ok(initial));
        }

        inner.watchers.push(Watcher { target, tx });
        rx
    }
}
