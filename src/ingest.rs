//! Ingest Pipeline: validates and stages a batch of vectors against a
//! dataset, commits once per batch, and reports per-row outcomes. Grounded
//! on `original_source/app/services/ingest_service.py`'s batch-then-commit
//! shape; id assignment and skip/overwrite semantics follow spec.md §4.7.

use chrono::Utc;
use uuid::Uuid;

use crate::error::AidbResult;
use crate::models::{Dataset, TenantQuotas, VectorRecord};
use crate::storage::{self, DatasetHandle, Storage};

/// A dataset is reindexed once its live count crosses this watermark;
/// the caller (service.rs) is responsible for actually triggering the
/// rebuild after a commit that crosses it.
pub const INDEX_REBUILD_WATERMARK: u64 = 10_000;

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct IngestReport {
    pub inserted: u64,
    pub skipped: u64,
    pub failed: u64,
    pub error_messages: Vec<String>,
    pub processing_ms: f64,
    pub crossed_rebuild_watermark: bool,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct IngestRow {
    #[serde(default)]
    pub id: Option<String>,
    pub document_id: String,
    #[serde(default)]
    pub chunk_id: Option<String>,
    #[serde(default)]
    pub chunk_index: Option<u32>,
    #[serde(default)]
    pub chunk_count: Option<u32>,
    pub values: Vec<f32>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "serde_json_null_object")]
    pub metadata: serde_json::Value,
}

fn serde_json_null_object() -> serde_json::Value {
    serde_json::json!({})
}

fn row_byte_estimate(row: &IngestRow) -> u64 {
    let values_bytes = (row.values.len() * std::mem::size_of::<f32>()) as u64;
    let content_bytes = row.content.as_ref().map(|c| c.len()).unwrap_or(0) as u64;
    let metadata_bytes = row.metadata.to_string().len() as u64;
    values_bytes + content_bytes + metadata_bytes
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// Reject the whole row, counted as skipped.
    Skip,
    /// Delete the existing row with the same id, then insert the new one.
    Overwrite,
}

/// Stages `rows` onto `handle`, validates dimension/duplicate handling per
/// row, and commits once at the end. A row that fails validation does not
/// abort the batch — it is counted in `failed`/`error_messages` and the
/// rest of the batch still proceeds.
///
/// `quotas.max_vectors_per_dataset` and `quotas.max_bytes` (0 meaning
/// unlimited, matching `Service::create_dataset`'s sentinel) are enforced
/// per row: `max_vectors_per_dataset` against the dataset's live count,
/// `max_bytes` against the cumulative row size ingested so far in this
/// batch. A row that would cross either ceiling is failed rather than
/// aborting the batch, so earlier rows in the same call still land.
pub fn ingest_batch(
    storage: &Storage,
    handle: &DatasetHandle,
    dataset: &Dataset,
    quotas: &TenantQuotas,
    rows: Vec<IngestRow>,
    duplicate_policy: DuplicatePolicy,
) -> AidbResult<IngestReport> {
    let start = std::time::Instant::now();
    let mut report = IngestReport::default();
    let before_count = handle.vector_count();
    let mut live_count = before_count;
    let mut batch_bytes: u64 = 0;

    for row in rows {
        if row.values.len() != dataset.dimensions {
            report.failed += 1;
            report.error_messages.push(format!(
                "row for document {} has {} dimensions, expected {}",
                row.document_id,
                row.values.len(),
                dataset.dimensions
            ));
            continue;
        }

        let id = row.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        let exists = storage.has_id(handle, &id)?;
        if exists {
            match duplicate_policy {
                DuplicatePolicy::Skip => {
                    report.skipped += 1;
                    continue;
                }
                DuplicatePolicy::Overwrite => {
                    storage.stage_delete(handle, &id);
                }
            }
        }

        if !exists && quotas.max_vectors_per_dataset > 0 && live_count >= quotas.max_vectors_per_dataset {
            report.failed += 1;
            report.error_messages.push(format!(
                "dataset vector quota exceeded: {} vectors allowed",
                quotas.max_vectors_per_dataset
            ));
            continue;
        }

        let row_bytes = row_byte_estimate(&row);
        if quotas.max_bytes > 0 && batch_bytes + row_bytes > quotas.max_bytes {
            report.failed += 1;
            report.error_messages.push(format!("dataset byte quota exceeded: {} bytes allowed", quotas.max_bytes));
            continue;
        }

        let now = Utc::now();
        let content_hash = row.content.as_deref().map(storage::content_hash);
        let record = VectorRecord {
            id,
            document_id: row.document_id,
            chunk_id: row.chunk_id,
            chunk_index: row.chunk_index,
            chunk_count: row.chunk_count,
            values: row.values,
            content: row.content,
            content_hash,
            content_type: row.content_type,
            language: row.language,
            model: row.model,
            metadata: row.metadata,
            created_at: now,
            updated_at: now,
        };
        storage.append(handle, vec![record]);
        report.inserted += 1;
        batch_bytes += row_bytes;
        if !exists {
            live_count += 1;
        }
    }

    if report.inserted > 0 || report.failed > 0 {
        storage.commit(handle)?;
    }

    let after_count = handle.vector_count();
    report.crossed_rebuild_watermark =
        before_count < INDEX_REBUILD_WATERMARK && after_count >= INDEX_REBUILD_WATERMARK;
    report.processing_ms = start.elapsed().as_secs_f64() * 1000.0;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{IndexKind, Metric};

    fn make_dataset(storage: &Storage) -> Dataset {
        storage
            .create_dataset(
                "t1",
                crate::models::DatasetSpec {
                    name: "ds1".into(),
                    description: String::new(),
                    dimensions: 3,
                    metric: Metric::Cosine,
                    index_type: IndexKind::Flat,
                    metadata: serde_json::json!({}),
                    overwrite: false,
                },
            )
            .unwrap()
    }

    fn row(document_id: &str) -> IngestRow {
        IngestRow {
            id: None,
            document_id: document_id.to_string(),
            chunk_id: None,
            chunk_index: None,
            chunk_count: None,
            values: vec![1.0, 0.0, 0.0],
            content: Some("hello world".into()),
            content_type: None,
            language: None,
            model: None,
            metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn ingest_reports_inserted_and_failed() {
        let (_dir, storage) = storage::test_storage();
        let ds = make_dataset(&storage);
        let handle = storage.open_handle(&ds.id).unwrap();
        let mut bad_row = row("d2");
        bad_row.values = vec![1.0, 0.0];
        let report =
            ingest_batch(&storage, &handle, &ds, &TenantQuotas::default(), vec![row("d1"), bad_row], DuplicatePolicy::Skip)
                .unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.error_messages.len(), 1);
    }

    #[test]
    fn duplicate_id_is_skipped_by_default() {
        let (_dir, storage) = storage::test_storage();
        let ds = make_dataset(&storage);
        let handle = storage.open_handle(&ds.id).unwrap();
        let mut r = row("d1");
        r.id = Some("fixed-id".into());
        let first =
            ingest_batch(&storage, &handle, &ds, &TenantQuotas::default(), vec![r.clone()], DuplicatePolicy::Skip)
                .unwrap();
        assert_eq!(first.inserted, 1);
        let second =
            ingest_batch(&storage, &handle, &ds, &TenantQuotas::default(), vec![r], DuplicatePolicy::Skip).unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.skipped, 1);
    }

    #[test]
    fn duplicate_id_overwrites_when_requested() {
        let (_dir, storage) = storage::test_storage();
        let ds = make_dataset(&storage);
        let handle = storage.open_handle(&ds.id).unwrap();
        let mut r = row("d1");
        r.id = Some("fixed-id".into());
        ingest_batch(&storage, &handle, &ds, &TenantQuotas::default(), vec![r.clone()], DuplicatePolicy::Skip).unwrap();
        let report =
            ingest_batch(&storage, &handle, &ds, &TenantQuotas::default(), vec![r], DuplicatePolicy::Overwrite)
                .unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(handle.vector_count(), 1);
    }

    #[test]
    fn vector_quota_fails_rows_once_exhausted() {
        let (_dir, storage) = storage::test_storage();
        let ds = make_dataset(&storage);
        let handle = storage.open_handle(&ds.id).unwrap();
        let quotas = TenantQuotas { max_datasets: 0, max_vectors_per_dataset: 1, max_bytes: 0 };
        let report =
            ingest_batch(&storage, &handle, &ds, &quotas, vec![row("d1"), row("d2")], DuplicatePolicy::Skip).unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(handle.vector_count(), 1);
    }
}
