//! Firestore REST backend
//!
//! Writes go through the v1 REST API: `PATCH` without an update mask
//! replaces a whole document, `POST` on a collection appends one. The REST
//! surface has no streaming listen, so listeners are polling tasks that
//! report documents whose `updateTime` changed since the previous poll.
//! Failed polls are reported to the listener and retried with exponential
//! backoff; the listener itself stays alive until its subscription is
//! dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio::time;
use url::Url;

use super::{
    doc_id, parent_path, validate_collection_path, validate_document_path, DocumentSnapshot,
    DocumentStore, FieldFilter, ListenEvent, ListenTarget, StoreError, Subscription,
};
use crate::models::Document;

const DEFAULT_BASE_URL: &str = "https://firestore.googleapis.com/v1";

/// Maximum retry delay for a failing listener.
const MAX_BACKOFF_SECS: u64 = 64;

/// Page size when listing a collection.
const LIST_PAGE_SIZE: &str = "300";

/// Connection settings for one Firestore database.
#[derive(Debug, Clone)]
pub struct FirestoreConfig {
    pub project_id: String,
    /// Database id, usually `(default)`.
    pub database: String,
    /// Web API key, sent as the `key` query parameter.
    pub api_key: Option<String>,
    /// Firebase ID token, sent as a bearer token.
    pub id_token: Option<String>,
    pub poll_interval: Duration,
    pub base_url: String,
}

impl FirestoreConfig {
    pub fn new(project_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            database: "(default)".to_string(),
            api_key: None,
            id_token: None,
            poll_interval: Duration::from_secs(1),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }
}

/// REST client for a Firestore database. Cheap to clone.
#[derive(Clone)]
pub struct FirestoreStore {
    http: reqwest::Client,
    config: Arc<FirestoreConfig>,
}

impl FirestoreStore {
    pub fn new(config: FirestoreConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config: Arc::new(config),
        }
    }

    fn root_url(&self) -> Result<Url, StoreError> {
        let root = format!(
            "{}/projects/{}/databases/{}/documents",
            self.config.base_url.trim_end_matches('/'),
            self.config.project_id,
            self.config.database
        );
        Url::parse(&root).map_err(|e| StoreError::InvalidPath(format!("{}: {}", root, e)))
    }

    /// URL of a document or collection, with each segment percent-encoded.
    fn url(&self, path: &str) -> Result<Url, StoreError> {
        let mut url = self.root_url()?;
        url.path_segments_mut()
            .map_err(|_| StoreError::InvalidPath(path.to_string()))?
            .extend(path.split('/'));
        Ok(url)
    }

    fn run_query_url(&self, collection: &str) -> Result<Url, StoreError> {
        let parent = match parent_path(collection) {
            Some(p) => self.url(p)?,
            None => self.root_url()?,
        };
        Url::parse(&format!("{}:runQuery", parent))
            .map_err(|e| StoreError::InvalidPath(format!("{}: {}", collection, e)))
    }

    fn authorize(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(ref key) = self.config.api_key {
            req = req.query(&[("key", key.as_str())]);
        }
        if let Some(ref token) = self.config.id_token {
            req = req.bearer_auth(token);
        }
        req
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, StoreError> {
        let resp = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        check_status(resp).await
    }

    async fn fetch(&self, target: &ListenTarget) -> Result<Vec<Fetched>, StoreError> {
        match target {
            ListenTarget::Document(path) => {
                let url = self.url(path)?;
                tracing::debug!("Firestore GET {}", url);
                let resp = self
                    .authorize(self.http.get(url))
                    .send()
                    .await
                    .map_err(|e| StoreError::Unavailable(e.to_string()))?;
                if resp.status() == reqwest::StatusCode::NOT_FOUND {
                    return Ok(vec![Fetched::missing(path)]);
                }
                let body: Value = check_status(resp).await?.json().await.map_err(decode_err)?;
                Ok(vec![decode_document(&body)?])
            }
            ListenTarget::Collection(collection) => {
                let mut out = Vec::new();
                let mut page_token: Option<String> = None;
                loop {
                    let url = self.url(collection)?;
                    let mut req = self.http.get(url).query(&[("pageSize", LIST_PAGE_SIZE)]);
                    if let Some(ref token) = page_token {
                        req = req.query(&[("pageToken", token.as_str())]);
                    }
                    let body: Value = self.send(req).await?.json().await.map_err(decode_err)?;
                    if let Some(docs) = body.get("documents").and_then(|d| d.as_array()) {
                        for d in docs {
                            out.push(decode_document(d)?);
                        }
                    }
                    page_token = body
                        .get("nextPageToken")
                        .and_then(|t| t.as_str())
                        .map(|s| s.to_string());
                    if page_token.is_none() {
                        break;
                    }
                }
                Ok(out)
            }
            ListenTarget::Query {
                collection,
                filters,
            } => {
                let url = self.run_query_url(collection)?;
                let body = structured_query(collection, filters);
                tracing::debug!("Firestore runQuery {}", url);
                let rows: Value = self
                    .send(self.http.post(url).json(&body))
                    .await?
                    .json()
                    .await
                    .map_err(decode_err)?;
                let mut out = Vec::new();
                for row in rows.as_array().map(|a| a.as_slice()).unwrap_or(&[]) {
                    if let Some(d) = row.get("document") {
                        out.push(decode_document(d)?);
                    }
                }
                Ok(out)
            }
        }
    }
}

#[async_trait]
impl DocumentStore for FirestoreStore {
    async fn set(&self, path: &str, data: Document) -> Result<(), StoreError> {
        validate_document_path(path)?;
        let url = self.url(path)?;
        tracing::debug!("Firestore PATCH {}", url);
        self.send(self.http.patch(url).json(&json!({ "fields": encode_fields(&data) })))
            .await?;
        Ok(())
    }

    async fn add(&self, collection: &str, data: Document) -> Result<String, StoreError> {
        validate_collection_path(collection)?;
        let url = self.url(collection)?;
        tracing::debug!("Firestore POST {}", url);
        let body: Value = self
            .send(self.http.post(url).json(&json!({ "fields": encode_fields(&data) })))
            .await?
            .json()
            .await
            .map_err(decode_err)?;
        let name = body
            .get("name")
            .and_then(|n| n.as_str())
            .ok_or_else(|| StoreError::Decode("created document has no name".into()))?;
        Ok(doc_id(name).to_string())
    }

    fn listen(&self, target: ListenTarget) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(poll_loop(self.clone(), target, tx));
        rx
    }
}

/// Poll `target` until the subscription is dropped.
async fn poll_loop(
    store: FirestoreStore,
    target: ListenTarget,
    tx: mpsc::UnboundedSender<ListenEvent>,
) {
    let mut tracker = SnapshotTracker::default();
    let mut backoff = 1u64;

    loop {
        let result = tokio::select! {
            _ = tx.closed() => break,
            r = store.fetch(&target) => r,
        };

        let delay = match result {
            Ok(fetched) => {
                backoff = 1;
                let changes = tracker.changes(fetched);
                if !changes.is_empty() && tx.send(Ok(changes)).is_err() {
                    break;
                }
                store.config.poll_interval
            }
            Err(e) => {
                tracing::warn!(
                    "Firestore listener {:?} failed: {}. Retrying in {}s...",
                    target,
                    e,
                    backoff
                );
                if tx.send(Err(e)).is_err() {
                    break;
                }
                let delay = Duration::from_secs(backoff);
                backoff = (backoff * 2).min(MAX_BACKOFF_SECS);
                delay
            }
        };

        tokio::select! {
            _ = tx.closed() => break,
            _ = time::sleep(delay) => {}
        }
    }

    tracing::debug!("Firestore listener {:?} stopped", target);
}

/// A fetched document together with its server update time.
#[derive(Debug, Clone, PartialEq)]
struct Fetched {
    snapshot: DocumentSnapshot,
    update_time: Option<String>,
}

impl Fetched {
    fn missing(path: &str) -> Self {
        Self {
            snapshot: DocumentSnapshot::new(path, None),
            update_time: None,
        }
    }
}

/// Turns successive poll results into change batches.
///
/// The first poll is always reported (a listener starts with the current
/// state); later polls report only documents whose update time changed.
#[derive(Default)]
struct SnapshotTracker {
    seen: HashMap<String, Option<String>>,
    primed: bool,
}

impl SnapshotTracker {
    fn changes(&mut self, fetched: Vec<Fetched>) -> Vec<DocumentSnapshot> {
        let first = !self.primed;
        self.primed = true;

        let mut out = Vec::new();
        for f in fetched {
            let previous = self
                .seen
                .insert(f.snapshot.path.clone(), f.update_time.clone());
            let changed = match previous {
                None => first || f.snapshot.data.is_some(),
                Some(prev) => prev != f.update_time,
            };
            if changed {
                out.push(f.snapshot);
            }
        }
        out
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, StoreError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(match status.as_u16() {
        401 | 403 => StoreError::PermissionDenied(body),
        429 | 500..=599 => StoreError::Unavailable(format!("{}: {}", status, body)),
        code => StoreError::Http { status: code, body },
    })
}

fn decode_err(e: reqwest::Error) -> StoreError {
    StoreError::Decode(e.to_string())
}

fn structured_query(collection: &str, filters: &[FieldFilter]) -> Value {
    let collection_id = doc_id(collection);
    let mut clauses: Vec<Value> = filters
        .iter()
        .map(|f| {
            json!({
                "fieldFilter": {
                    "field": { "fieldPath": f.field },
                    "op": "EQUAL",
                    "value": encode_value(&f.value)
                }
            })
        })
        .collect();

    let mut query = json!({ "from": [{ "collectionId": collection_id }] });
    match clauses.len() {
        0 => {}
        1 => query["where"] = clauses.remove(0),
        _ => {
            query["where"] = json!({
                "compositeFilter": { "op": "AND", "filters": clauses }
            })
        }
    }
    json!({ "structuredQuery": query })
}

/// Encode a document body as Firestore `fields`.
fn encode_fields(doc: &Document) -> Value {
    let fields: Map<String, Value> = doc
        .iter()
        .map(|(k, v)| (k.clone(), encode_value(v)))
        .collect();
    Value::Object(fields)
}

/// Encode a JSON value as a Firestore typed value.
fn encode_value(value: &Value) -> Value {
    match value {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(b) => json!({ "booleanValue": b }),
        Value::Number(n) => match n.as_i64() {
            // Firestore transports 64-bit integers as strings.
            Some(i) => json!({ "integerValue": i.to_string() }),
            None => json!({ "doubleValue": n.as_f64().unwrap_or_default() }),
        },
        Value::String(s) => json!({ "stringValue": s }),
        Value::Array(items) => {
            let values: Vec<Value> = items.iter().map(encode_value).collect();
            json!({ "arrayValue": { "values": values } })
        }
        Value::Object(map) => json!({ "mapValue": { "fields": encode_fields(map) } }),
    }
}

/// Decode a Firestore typed value into plain JSON.
fn decode_value(value: &Value) -> Result<Value, StoreError> {
    let obj = value
        .as_object()
        .ok_or_else(|| StoreError::Decode(format!("typed value is not an object: {}", value)))?;
    let (kind, inner) = obj
        .iter()
        .next()
        .ok_or_else(|| StoreError::Decode("empty typed value".into()))?;

    Ok(match kind.as_str() {
        "nullValue" => Value::Null,
        "booleanValue" => Value::Bool(inner.as_bool().unwrap_or_default()),
        "integerValue" => {
            let parsed = match inner {
                Value::String(s) => s.parse::<i64>().ok(),
                other => other.as_i64(),
            };
            let i = parsed
                .ok_or_else(|| StoreError::Decode(format!("bad integerValue: {}", inner)))?;
            Value::from(i)
        }
        "doubleValue" => inner.clone(),
        "stringValue" | "timestampValue" | "referenceValue" | "bytesValue" => inner.clone(),
        "arrayValue" => {
            let mut out = Vec::new();
            if let Some(values) = inner.get("values").and_then(|v| v.as_array()) {
                for v in values {
                    out.push(decode_value(v)?);
                }
            }
            Value::Array(out)
        }
        "mapValue" => {
            let fields = inner.get("fields").cloned().unwrap_or_else(|| json!({}));
            Value::Object(decode_fields(&fields)?)
        }
        other => return Err(StoreError::Decode(format!("unsupported value type {}", other))),
    })
}

fn decode_fields(fields: &Value) -> Result<Document, StoreError> {
    let mut doc = Document::new();
    if let Some(map) = fields.as_object() {
        for (k, v) in map {
            doc.insert(k.clone(), decode_value(v)?);
        }
    }
    Ok(doc)
}

/// Decode a REST `Document` resource.
fn decode_document(resource: &Value) -> Result<Fetched, StoreError> {
    let name = resource
        .get("name")
        .and_then(|n| n.as_str())
        .ok_or_else(|| StoreError::Decode("document has no name".into()))?;
    let path = name
        .split_once("/documents/")
        .map(|(_, rest)| rest)
        .ok_or_else(|| StoreError::Decode(format!("unexpected document name {}", name)))?;
    let data = decode_fields(resource.get("fields").unwrap_or(&Value::Null))?;
    let update_time = resource
        .get("updateTime")
        .and_then(|t| t.as_str())
        .map(|s| s.to_string());

    Ok(Fetched {
        snapshot: DocumentSnapshot::new(path, Some(data)),
        update_time,
    })
}
