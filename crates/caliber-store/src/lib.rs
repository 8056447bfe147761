//! Document store contract plus in-memory and file-backed implementations.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "caliber-store";

pub type Document = serde_json::Map<String, JsonValue>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("document {id} not found")]
    NotFound { id: String },
    #[error("malformed document {id}: {reason}")]
    Malformed { id: String, reason: String },
    #[error("write rejected for {id}: {reason}")]
    Rejected { id: String, reason: String },
    #[error("io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Narrow document-oriented key-value interface the reconciler writes through.
///
/// Each call is atomic with respect to other calls on the same document. Nothing spans calls.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Document>, StoreError>;

    /// Full replace.
    async fn set(&self, id: &str, document: Document) -> Result<(), StoreError>;

    /// Field-level merge into an existing document.
    async fn update(&self, id: &str, fields: Document) -> Result<(), StoreError>;

    /// Append the elements of `elements` not already structurally present in array `field`.
    /// Returns how many were appended.
    async fn array_union(
        &self,
        id: &str,
        field: &str,
        elements: Vec<JsonValue>,
    ) -> Result<usize, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_store_error(err: &StoreError) -> RetryDisposition {
    match err {
        StoreError::Unavailable(_) => RetryDisposition::Retryable,
        StoreError::Io { source, .. }
            if matches!(
                source.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
            ) =>
        {
            RetryDisposition::Retryable
        }
        _ => RetryDisposition::NonRetryable,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

fn merge_fields(document: &mut Document, fields: Document) {
    for (name, value) in fields {
        document.insert(name, value);
    }
}

fn union_into(
    id: &str,
    document: &mut Document,
    field: &str,
    elements: Vec<JsonValue>,
) -> Result<usize, StoreError> {
    let slot = document
        .entry(field.to_string())
        .or_insert_with(|| JsonValue::Array(Vec::new()));
    if slot.is_null() {
        *slot = JsonValue::Array(Vec::new());
    }
    let JsonValue::Array(existing) = slot else {
        return Err(StoreError::Malformed {
            id: id.to_string(),
            reason: format!("field `{field}` is not an array"),
        });
    };

    let mut appended = 0;
    for element in elements {
        if !existing.contains(&element) {
            existing.push(element);
            appended += 1;
        }
    }
    Ok(appended)
}

/// Process-local store; every call holds one lock for its whole read-modify-write.
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: Mutex<BTreeMap<String, Document>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> BTreeMap<String, Document> {
        self.documents.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.documents.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.lock().await.is_empty()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<Document>, StoreError> {
        Ok(self.documents.lock().await.get(id).cloned())
    }

    async fn set(&self, id: &str, document: Document) -> Result<(), StoreError> {
        self.documents.lock().await.insert(id.to_string(), document);
        Ok(())
    }

    async fn update(&self, id: &str, fields: Document) -> Result<(), StoreError> {
        let mut documents = self.documents.lock().await;
        let document = documents
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
        merge_fields(document, fields);
        Ok(())
    }

    async fn array_union(
        &self,
        id: &str,
        field: &str,
        elements: Vec<JsonValue>,
    ) -> Result<usize, StoreError> {
        let mut documents = self.documents.lock().await;
        let document = documents
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
        union_into(id, document, field, elements)
    }
}

/// One JSON file per document under `<root>/<collection>/<id>.json`.
///
/// Writes go to a temp file in the same directory and are atomically renamed into place, so a
/// reader never observes a half-written document. A per-document lock serializes
/// read-modify-write calls made through the same store instance.
#[derive(Debug)]
pub struct JsonDirStore {
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl JsonDirStore {
    /// Open (creating if needed) the directory backing `collection`.
    pub async fn open(root: impl AsRef<Path>, collection: &str) -> Result<Self, StoreError> {
        let dir = root.as_ref().join(collection);
        fs::create_dir_all(&dir).await.map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self {
            dir,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn document_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        if id.is_empty() || id.starts_with('.') || id.contains(['/', '\\']) {
            return Err(StoreError::Rejected {
                id: id.to_string(),
                reason: "document id is not a safe file name".to_string(),
            });
        }
        Ok(self.dir.join(format!("{id}.json")))
    }

    async fn document_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut map = self.locks.lock().await;
        map.entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the lock entry for `id` once no other call holds or waits on it.
    async fn release_lock(&self, id: &str, lock: Arc<Mutex<()>>) {
        let mut map = self.locks.lock().await;
        drop(lock);
        if map.get(id).is_some_and(|entry| Arc::strong_count(entry) == 1) {
            map.remove(id);
        }
    }

    async fn update_locked(&self, id: &str, path: &Path, fields: Document) -> Result<(), StoreError> {
        let mut document = self
            .read_document(id, path)
            .await?
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
        merge_fields(&mut document, fields);
        self.write_document(path, &document).await
    }

    async fn union_locked(
        &self,
        id: &str,
        path: &Path,
        field: &str,
        elements: Vec<JsonValue>,
    ) -> Result<usize, StoreError> {
        let mut document = self
            .read_document(id, path)
            .await?
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
        let appended = union_into(id, &mut document, field, elements)?;
        if appended > 0 {
            self.write_document(path, &document).await?;
        }
        Ok(appended)
    }

    async fn read_document(&self, id: &str, path: &Path) -> Result<Option<Document>, StoreError> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        match serde_json::from_slice::<JsonValue>(&bytes) {
            Ok(JsonValue::Object(document)) => Ok(Some(document)),
            Ok(other) => Err(StoreError::Malformed {
                id: id.to_string(),
                reason: format!("expected an object, found {}", json_kind(&other)),
            }),
            Err(err) => Err(StoreError::Malformed {
                id: id.to_string(),
                reason: err.to_string(),
            }),
        }
    }

    async fn write_document(&self, path: &Path, document: &Document) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(document)?;

        let temp_path = self
            .dir
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_error(&temp_path))?;
        file.write_all(&bytes).await.map_err(io_error(&temp_path))?;
        file.flush().await.map_err(io_error(&temp_path))?;
        drop(file);

        if let Err(source) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
        debug!(path = %path.display(), bytes = bytes.len(), "document written");
        Ok(())
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError {
    let path = path.to_path_buf();
    move |source| StoreError::Io { path, source }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

#[async_trait]
impl DocumentStore for JsonDirStore {
    async fn get(&self, id: &str) -> Result<Option<Document>, StoreError> {
        let path = self.document_path(id)?;
        let lock = self.document_lock(id).await;
        let result = {
            let _guard = lock.lock().await;
            self.read_document(id, &path).await
        };
        self.release_lock(id, lock).await;
        result
    }

    async fn set(&self, id: &str, document: Document) -> Result<(), StoreError> {
        let path = self.document_path(id)?;
        let lock = self.document_lock(id).await;
        let result = {
            let _guard = lock.lock().await;
            self.write_document(&path, &document).await
        };
        self.release_lock(id, lock).await;
        result
    }

    async fn update(&self, id: &str, fields: Document) -> Result<(), StoreError> {
        let path = self.document_path(id)?;
        let lock = self.document_lock(id).await;
        let result = {
            let _guard = lock.lock().await;
            self.update_locked(id, &path, fields).await
        };
        self.release_lock(id, lock).await;
        result
    }

    async fn array_union(
        &self,
        id: &str,
        field: &str,
        elements: Vec<JsonValue>,
    ) -> Result<usize, StoreError> {
        let path = self.document_path(id)?;
        let lock = self.document_lock(id).await;
        let result = {
            let _guard = lock.lock().await;
            self.union_locked(id, &path, field, elements).await
        };
        self.release_lock(id, lock).await;
        result
    }
}
