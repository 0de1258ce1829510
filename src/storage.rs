//! Per-dataset on-disk columnar store: sled holds the row-level source of
//! truth (one entry per live vector, keyed by a monotonically increasing
//! row index) plus an id→index lookup so duplicate-id checks are O(1)
//! instead of the linear scan the original service performed; an Arrow
//! `RecordBatch` is rebuilt from those rows on every commit to back the
//! "one tensor per attribute" columnar view the spec describes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arrow::array::{Float32Array, StringArray, UInt32Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::Utc;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use sled::{Db, Transactional};

use crate::error::{AidbError, AidbResult};
use crate::models::{Dataset, DatasetSpec, User, VectorRecord};

const COMMIT_INITIAL_BACKOFF: Duration = Duration::from_millis(200);
const COMMIT_BACKOFF_FACTOR: u32 = 2;
const COMMIT_MAX_ATTEMPTS: u32 = 5;

/// Handle to one dataset's sled trees plus its write lock and staged rows.
/// Held open for as long as anything (search or ingest) references it.
pub struct DatasetHandle {
    pub dataset_id: String,
    rows_tree: sled::Tree,
    ids_tree: sled::Tree,
    next_index: AtomicU64,
    live_count: AtomicU64,
    write_lock: Mutex<()>,
    staged: Mutex<Vec<StagedChange>>,
    arrow_cache: Mutex<Option<RecordBatch>>,
}

enum StagedChange {
    Append(VectorRecord),
    Delete(String),
}

impl DatasetHandle {
    pub fn vector_count(&self) -> u64 {
        self.live_count.load(Ordering::SeqCst)
    }
}

/// Top-level storage engine: one sled database shared by every dataset's
/// trees, plus a process-wide cache of open dataset handles.
pub struct Storage {
    db: Db,
    datasets_tree: sled::Tree,
    users_tree: sled::Tree,
    handles: DashMap<String, Arc<DatasetHandle>>,
}

impl Storage {
    pub fn open(path: &str) -> AidbResult<Self> {
        let db = sled::open(path).map_err(|e| AidbError::Storage {
            operation: "open".into(),
            message: e.to_string(),
        })?;
        let datasets_tree = db.open_tree("datasets").map_err(|e| AidbError::Storage {
            operation: "open_tree(datasets)".into(),
            message: e.to_string(),
        })?;
        let users_tree = db.open_tree("users").map_err(|e| AidbError::Storage {
            operation: "open_tree(users)".into(),
            message: e.to_string(),
        })?;
        Ok(Self {
            db,
            datasets_tree,
            users_tree,
            handles: DashMap::new(),
        })
    }

    /// Registers a new user. Errors with `Validation` if the username is
    /// already taken — usernames are the primary key in this tree.
    pub fn create_user(&self, user: User) -> AidbResult<()> {
        if self.users_tree.contains_key(user.username.as_bytes()).map_err(|e| AidbError::Storage {
            operation: "create_user".into(),
            message: e.to_string(),
        })? {
            return Err(AidbError::Validation {
                field: "username".into(),
                message: format!("username '{}' already registered", user.username),
            });
        }
        let bytes = serde_json::to_vec(&user).map_err(|e| AidbError::Internal(e.to_string()))?;
        self.users_tree.insert(user.username.as_bytes(), bytes).map_err(|e| AidbError::Storage {
            operation: "create_user".into(),
            message: e.to_string(),
        })?;
        Ok(())
    }

    pub fn get_user(&self, username: &str) -> AidbResult<User> {
        let bytes = self
            .users_tree
            .get(username.as_bytes())
            .map_err(|e| AidbError::Storage { operation: "get_user".into(), message: e.to_string() })?
            .ok_or_else(|| AidbError::Unauthenticated(format!("unknown user '{username}'")))?;
        serde_json::from_slice(&bytes).map_err(|e| AidbError::Internal(e.to_string()))
    }

    fn rows_tree_name(dataset_id: &str) -> String {
        format!("ds::{dataset_id}::rows")
    }

    fn ids_tree_name(dataset_id: &str) -> String {
        format!("ds::{dataset_id}::ids")
    }

    /// Creates the dataset sidecar and its backing trees. `AlreadyExists`
    /// unless `spec.overwrite`, in which case the old trees are dropped and
    /// recreated so the caller sees an atomic replace.
    pub fn create_dataset(&self, tenant_id: &str, spec: DatasetSpec) -> AidbResult<Dataset> {
        let existing = self.find_by_tenant_and_name(tenant_id, &spec.name)?;
        if let Some(existing) = existing {
            if !spec.overwrite {
                return Err(AidbError::DatasetAlreadyExists(spec.name));
            }
            self.delete_dataset(&existing.id)?;
        }

        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let dataset = Dataset {
            id: id.clone(),
            name: spec.name,
            description: spec.description,
            dimensions: spec.dimensions,
            metric: spec.metric,
            index_type: spec.index_type,
            tenant_id: tenant_id.to_string(),
            metadata: spec.metadata,
            created_at: now,
            updated_at: now,
        };

        self.put_dataset_meta(&dataset)?;
        self.open_handle(&id)?;
        Ok(dataset)
    }

    fn put_dataset_meta(&self, dataset: &Dataset) -> AidbResult<()> {
        let bytes = serde_json::to_vec(dataset).map_err(|e| AidbError::Internal(e.to_string()))?;
        self.datasets_tree
            .insert(dataset.id.as_bytes(), bytes)
            .map_err(|e| AidbError::Storage {
                operation: "put_dataset_meta".into(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    pub fn get_dataset_meta(&self, dataset_id: &str) -> AidbResult<Dataset> {
        let bytes = self
            .datasets_tree
            .get(dataset_id.as_bytes())
            .map_err(|e| AidbError::Storage {
                operation: "get_dataset_meta".into(),
                message: e.to_string(),
            })?
            .ok_or_else(|| AidbError::DatasetNotFound(dataset_id.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| AidbError::Internal(e.to_string()))
    }

    fn find_by_tenant_and_name(&self, tenant_id: &str, name: &str) -> AidbResult<Option<Dataset>> {
        for item in self.datasets_tree.iter() {
            let (_, value) = item.map_err(|e| AidbError::Storage {
                operation: "scan_datasets".into(),
                message: e.to_string(),
            })?;
            let dataset: Dataset =
                serde_json::from_slice(&value).map_err(|e| AidbError::Internal(e.to_string()))?;
            if dataset.tenant_id == tenant_id && dataset.name == name {
                return Ok(Some(dataset));
            }
        }
        Ok(None)
    }

    pub fn list_datasets(&self, tenant_id: &str) -> AidbResult<Vec<Dataset>> {
        let mut out = Vec::new();
        for item in self.datasets_tree.iter() {
            let (_, value) = item.map_err(|e| AidbError::Storage {
                operation: "list_datasets".into(),
                message: e.to_string(),
            })?;
            let dataset: Dataset =
                serde_json::from_slice(&value).map_err(|e| AidbError::Internal(e.to_string()))?;
            if dataset.tenant_id == tenant_id {
                out.push(dataset);
            }
        }
        Ok(out)
    }

    /// Opens (creating trees lazily if missing) and caches a dataset handle.
    /// Readers and writers share the same handle; the write lock inside it
    /// serializes commits only.
    pub fn open_handle(&self, dataset_id: &str) -> AidbResult<Arc<DatasetHandle>> {
        if let Some(handle) = self.handles.get(dataset_id) {
            return Ok(handle.clone());
        }
        let rows_tree = self
            .db
            .open_tree(Self::rows_tree_name(dataset_id))
            .map_err(|e| AidbError::Storage {
                operation: "open_tree(rows)".into(),
                message: e.to_string(),
            })?;
        let ids_tree = self
            .db
            .open_tree(Self::ids_tree_name(dataset_id))
            .map_err(|e| AidbError::Storage {
                operation: "open_tree(ids)".into(),
                message: e.to_string(),
            })?;
        let next_index = rows_tree
            .last()
            .map_err(|e| AidbError::Storage {
                operation: "scan_last_row".into(),
                message: e.to_string(),
            })?
            .map(|(k, _)| u64::from_be_bytes(k.as_ref().try_into().unwrap_or([0; 8])) + 1)
            .unwrap_or(0);
        let live_count = rows_tree.len() as u64;

        let handle = Arc::new(DatasetHandle {
            dataset_id: dataset_id.to_string(),
            rows_tree,
            ids_tree,
            next_index: AtomicU64::new(next_index),
            live_count: AtomicU64::new(live_count),
            write_lock: Mutex::new(()),
            staged: Mutex::new(Vec::new()),
            arrow_cache: Mutex::new(None),
        });
        self.handles.insert(dataset_id.to_string(), handle.clone());
        Ok(handle)
    }

    /// Drops a dataset's sidecar and trees. The handle cache entry is
    /// evicted so no stale reference outlives the on-disk state.
    pub fn delete_dataset(&self, dataset_id: &str) -> AidbResult<()> {
        self.handles.remove(dataset_id);
        self.datasets_tree
            .remove(dataset_id.as_bytes())
            .map_err(|e| AidbError::Storage {
                operation: "delete_dataset".into(),
                message: e.to_string(),
            })?;
        self.db
            .drop_tree(Self::rows_tree_name(dataset_id))
            .map_err(|e| AidbError::Storage {
                operation: "drop_tree(rows)".into(),
                message: e.to_string(),
            })?;
        self.db
            .drop_tree(Self::ids_tree_name(dataset_id))
            .map_err(|e| AidbError::Storage {
                operation: "drop_tree(ids)".into(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    /// Stages rows for the next commit. Duplicate ids within the dataset
    /// are the caller's concern here; `ingest.rs` enforces the
    /// `skip_existing` policy before staging.
    pub fn append(&self, handle: &DatasetHandle, rows: Vec<VectorRecord>) {
        let mut staged = handle.staged.lock().expect("storage staged lock poisoned");
        staged.extend(rows.into_iter().map(StagedChange::Append));
    }

    pub fn stage_delete(&self, handle: &DatasetHandle, vector_id: &str) {
        let mut staged = handle.staged.lock().expect("storage staged lock poisoned");
        staged.push(StagedChange::Delete(vector_id.to_string()));
    }

    pub fn has_id(&self, handle: &DatasetHandle, vector_id: &str) -> AidbResult<bool> {
        handle
            .ids_tree
            .contains_key(vector_id.as_bytes())
            .map_err(|e| AidbError::Storage {
                operation: "has_id".into(),
                message: e.to_string(),
            })
    }

    /// Flushes staged appends/deletes atomically, then rebuilds the
    /// dataset's cached Arrow projection. Retries with exponential backoff
    /// (200ms, ×2, up to 5 attempts) when the write lock is contended —
    /// the only retry loop in the storage layer.
    pub fn commit(&self, handle: &DatasetHandle) -> AidbResult<()> {
        let mut backoff = COMMIT_INITIAL_BACKOFF;
        let mut guard = None;
        for attempt in 0..COMMIT_MAX_ATTEMPTS {
            match handle.write_lock.try_lock() {
                Ok(g) => {
                    guard = Some(g);
                    break;
                }
                Err(_) if attempt + 1 < COMMIT_MAX_ATTEMPTS => {
                    std::thread::sleep(backoff);
                    backoff *= COMMIT_BACKOFF_FACTOR;
                }
                Err(_) => {
                    return Err(AidbError::Storage {
                        operation: "commit".into(),
                        message: "write lock contended after max retries".into(),
                    })
                }
            }
        }
        let _guard = guard.expect("lock acquired or returned above");

        let changes = {
            let mut staged = handle.staged.lock().expect("storage staged lock poisoned");
            std::mem::take(&mut *staged)
        };
        if changes.is_empty() {
            return Ok(());
        }

        (&handle.rows_tree, &handle.ids_tree)
            .transaction(|(rows_tx, ids_tx)| {
                for change in &changes {
                    match change {
                        StagedChange::Append(row) => {
                            let index = handle.next_index.fetch_add(1, Ordering::SeqCst);
                            let bytes = serde_json::to_vec(row).map_err(|e| {
                                sled::transaction::ConflictableTransactionError::Abort(e.to_string())
                            })?;
                            rows_tx.insert(&index.to_be_bytes(), bytes)?;
                            ids_tx.insert(row.id.as_bytes(), &index.to_be_bytes())?;
                            handle.live_count.fetch_add(1, Ordering::SeqCst);
                        }
                        StagedChange::Delete(vector_id) => {
                            if let Some(index_bytes) = ids_tx.get(vector_id.as_bytes())? {
                                rows_tx.remove(index_bytes.as_ref())?;
                                ids_tx.remove(vector_id.as_bytes())?;
                                handle.live_count.fetch_sub(1, Ordering::SeqCst);
                            }
                        }
                    }
                }
                Ok(())
            })
            .map_err(|e: sled::transaction::TransactionError<String>| AidbError::Storage {
                operation: "commit".into(),
                message: e.to_string(),
            })?;

        self.rebuild_arrow_cache(handle)?;
        Ok(())
    }

    pub fn scan(&self, handle: &DatasetHandle, limit: usize, offset: usize) -> AidbResult<Vec<VectorRecord>> {
        let mut out = Vec::with_capacity(limit.min(1024));
        for (i, item) in handle.rows_tree.iter().enumerate() {
            if i < offset {
                continue;
            }
            if out.len() >= limit {
                break;
            }
            let (_, value) = item.map_err(|e| AidbError::Storage {
                operation: "scan".into(),
                message: e.to_string(),
            })?;
            let row: VectorRecord =
                serde_json::from_slice(&value).map_err(|e| AidbError::Internal(e.to_string()))?;
            out.push(row);
        }
        Ok(out)
    }

    pub fn scan_all(&self, handle: &DatasetHandle) -> AidbResult<Vec<VectorRecord>> {
        self.scan(handle, usize::MAX, 0)
    }

    pub fn get_by_id(&self, handle: &DatasetHandle, vector_id: &str) -> AidbResult<Option<VectorRecord>> {
        let Some(index_bytes) = handle
            .ids_tree
            .get(vector_id.as_bytes())
            .map_err(|e| AidbError::Storage {
                operation: "get_by_id".into(),
                message: e.to_string(),
            })?
        else {
            return Ok(None);
        };
        let row_bytes = handle.rows_tree.get(index_bytes).map_err(|e| AidbError::Storage {
            operation: "get_by_id".into(),
            message: e.to_string(),
        })?;
        match row_bytes {
            Some(bytes) => {
                let row: VectorRecord =
                    serde_json::from_slice(&bytes).map_err(|e| AidbError::Internal(e.to_string()))?;
                Ok(Some(row))
            }
            None => Ok(None),
        }
    }

    fn rebuild_arrow_cache(&self, handle: &DatasetHandle) -> AidbResult<()> {
        let rows = self.scan_all(handle)?;
        let batch = rows_to_record_batch(&rows)?;
        *handle.arrow_cache.lock().expect("arrow cache lock poisoned") = Some(batch);
        Ok(())
    }

    pub fn arrow_projection(&self, handle: &DatasetHandle) -> AidbResult<RecordBatch> {
        let cached = handle
            .arrow_cache
            .lock()
            .expect("arrow cache lock poisoned")
            .clone();
        match cached {
            Some(batch) => Ok(batch),
            None => {
                let rows = self.scan_all(handle)?;
                let batch = rows_to_record_batch(&rows)?;
                *handle.arrow_cache.lock().expect("arrow cache lock poisoned") = Some(batch.clone());
                Ok(batch)
            }
        }
    }
}

/// Builds the columnar "one tensor per attribute" projection described in
/// the storage engine's data model: fixed-width embedding column plus one
/// column per scalar attribute.
fn rows_to_record_batch(rows: &[VectorRecord]) -> AidbResult<RecordBatch> {
    let dim = rows.first().map(|r| r.values.len()).unwrap_or(0);
    let mut ids = Vec::with_capacity(rows.len());
    let mut document_ids = Vec::with_capacity(rows.len());
    let mut contents = Vec::with_capacity(rows.len());
    let mut metadata_json = Vec::with_capacity(rows.len());
    let mut content_hashes = Vec::with_capacity(rows.len());
    let mut content_types = Vec::with_capacity(rows.len());
    let mut languages = Vec::with_capacity(rows.len());
    let mut models = Vec::with_capacity(rows.len());
    let mut chunk_indices = Vec::with_capacity(rows.len());
    let mut chunk_counts = Vec::with_capacity(rows.len());
    let mut created_ats = Vec::with_capacity(rows.len());
    let mut updated_ats = Vec::with_capacity(rows.len());
    let mut embeddings: Vec<f32> = Vec::with_capacity(rows.len() * dim);

    for row in rows {
        ids.push(row.id.clone());
        document_ids.push(row.document_id.clone());
        contents.push(row.content.clone().unwrap_or_default());
        metadata_json.push(row.metadata.to_string());
        content_hashes.push(row.content_hash.clone().unwrap_or_default());
        content_types.push(row.content_type.clone().unwrap_or_default());
        languages.push(row.language.clone().unwrap_or_default());
        models.push(row.model.clone().unwrap_or_default());
        chunk_indices.push(row.chunk_index.unwrap_or(0));
        chunk_counts.push(row.chunk_count.unwrap_or(0));
        created_ats.push(row.created_at.to_rfc3339());
        updated_ats.push(row.updated_at.to_rfc3339());
        embeddings.extend_from_slice(&row.values);
    }

    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("document_id", DataType::Utf8, false),
        Field::new("content", DataType::Utf8, true),
        Field::new("metadata", DataType::Utf8, false),
        Field::new("content_hash", DataType::Utf8, true),
        Field::new("content_type", DataType::Utf8, true),
        Field::new("language", DataType::Utf8, true),
        Field::new("model", DataType::Utf8, true),
        Field::new("chunk_index", DataType::UInt32, true),
        Field::new("chunk_count", DataType::UInt32, true),
        Field::new("created_at", DataType::Utf8, false),
        Field::new("updated_at", DataType::Utf8, false),
        Field::new("embedding", DataType::Float32, false),
    ]));

    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(ids)),
            Arc::new(StringArray::from(document_ids)),
            Arc::new(StringArray::from(contents)),
            Arc::new(StringArray::from(metadata_json)),
            Arc::new(StringArray::from(content_hashes)),
            Arc::new(StringArray::from(content_types)),
            Arc::new(StringArray::from(languages)),
            Arc::new(StringArray::from(models)),
            Arc::new(UInt32Array::from(chunk_indices)),
            Arc::new(UInt32Array::from(chunk_counts)),
            Arc::new(StringArray::from(created_ats)),
            Arc::new(StringArray::from(updated_ats)),
            Arc::new(Float32Array::from(embeddings)),
        ],
    )
    .map_err(|e| AidbError::Internal(e.to_string()))
}

pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
pub(crate) fn test_storage() -> (tempfile::TempDir, Storage) {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = Storage::open(dir.path().to_str().unwrap()).expect("open storage");
    (dir, storage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{IndexKind, Metric};

    fn spec(name: &str, dim: usize) -> DatasetSpec {
        DatasetSpec {
            name: name.to_string(),
            description: "".into(),
            dimensions: dim,
            metric: Metric::Cosine,
            index_type: IndexKind::Flat,
            metadata: serde_json::json!({}),
            overwrite: false,
        }
    }

    fn row(id: &str, values: Vec<f32>) -> VectorRecord {
        let now = Utc::now();
        VectorRecord {
            id: id.to_string(),
            document_id: "doc1".into(),
            chunk_id: None,
            chunk_index: None,
            chunk_count: None,
            values,
            content: None,
            content_hash: None,
            content_type: None,
            language: None,
            model: None,
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn create_then_duplicate_name_conflicts() {
        let (_dir, storage) = test_storage();
        storage.create_dataset("t1", spec("ds1", 3)).unwrap();
        let err = storage.create_dataset("t1", spec("ds1", 3)).unwrap_err();
        assert_eq!(err.error_code(), "DATASET_ALREADY_EXISTS");
    }

    #[test]
    fn append_commit_then_scan_roundtrips() {
        let (_dir, storage) = test_storage();
        let dataset = storage.create_dataset("t1", spec("ds1", 3)).unwrap();
        let handle = storage.open_handle(&dataset.id).unwrap();
        storage.append(&handle, vec![row("a", vec![1.0, 0.0, 0.0]), row("b", vec![0.0, 1.0, 0.0])]);
        storage.commit(&handle).unwrap();
        assert_eq!(handle.vector_count(), 2);
        let rows = storage.scan_all(&handle).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(storage.has_id(&handle, "a").unwrap());
    }

    #[test]
    fn delete_row_removes_from_index_and_count() {
        let (_dir, storage) = test_storage();
        let dataset = storage.create_dataset("t1", spec("ds1", 3)).unwrap();
        let handle = storage.open_handle(&dataset.id).unwrap();
        storage.append(&handle, vec![row("a", vec![1.0, 0.0, 0.0])]);
        storage.commit(&handle).unwrap();
        storage.stage_delete(&handle, "a");
        storage.commit(&handle).unwrap();
        assert_eq!(handle.vector_count(), 0);
        assert!(!storage.has_id(&handle, "a").unwrap());
    }

    #[test]
    fn delete_dataset_evicts_cached_handle() {
        let (_dir, storage) = test_storage();
        let dataset = storage.create_dataset("t1", spec("ds1", 3)).unwrap();
        storage.open_handle(&dataset.id).unwrap();
        storage.delete_dataset(&dataset.id).unwrap();
        assert!(storage.get_dataset_meta(&dataset.id).is_err());
    }
}
