//! Backup Engine: archives one or more datasets (metadata, schema, rows)
//! into a gzip+tar bundle with a SHA-256 checksum, and restores from one.
//! Grounded on `original_source/app/services/backup_service.py`'s archive
//! layout; `ObjectStoreSink` stands in for the original's pluggable object
//! store with a local-filesystem implementation, per spec.md §4.9.

use std::fs::File;
use std::io::{Read, Write as _};
use std::path::PathBuf;

use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{AidbError, AidbResult};
use crate::models::{BackupRecord, BackupStatus, BackupType, Dataset, VectorRecord};
use crate::storage::Storage;

/// Where a finished archive (and its restore source) lives. The local
/// filesystem implementation is the only one shipped; a networked object
/// store would implement the same trait.
pub trait ObjectStoreSink: Send + Sync {
    fn put(&self, key: &str, bytes: &[u8]) -> AidbResult<String>;
    fn get(&self, uri: &str) -> AidbResult<Vec<u8>>;
}

pub struct LocalFsSink {
    root: PathBuf,
}

impl LocalFsSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ObjectStoreSink for LocalFsSink {
    fn put(&self, key: &str, bytes: &[u8]) -> AidbResult<String> {
        std::fs::create_dir_all(&self.root).map_err(|e| AidbError::Backup(e.to_string()))?;
        let path = self.root.join(key);
        let mut file = File::create(&path).map_err(|e| AidbError::Backup(e.to_string()))?;
        file.write_all(bytes).map_err(|e| AidbError::Backup(e.to_string()))?;
        Ok(path.to_string_lossy().to_string())
    }

    fn get(&self, uri: &str) -> AidbResult<Vec<u8>> {
        std::fs::read(uri).map_err(|e| AidbError::Backup(e.to_string()))
    }
}

/// Builds one archive for `dataset_ids` under `tenant_id` (or all datasets
/// visible to the tenant when empty) and writes it through `sink`.
///
/// Incremental backups are not distinguished from full ones at the
/// storage layer — there is no change-log to diff against, so an
/// "incremental" request degrades to a full archive. This is a recorded
/// open-question decision, not an oversight.
pub fn run_backup(
    storage: &Storage,
    sink: &dyn ObjectStoreSink,
    tenant_id: &str,
    dataset_ids: &[String],
    backup_type: BackupType,
) -> AidbResult<BackupRecord> {
    let start = std::time::Instant::now();
    let id = Uuid::new_v4().to_string();

    let datasets: Vec<Dataset> = if dataset_ids.is_empty() {
        storage.list_datasets(tenant_id)?
    } else {
        dataset_ids
            .iter()
            .map(|id| storage.get_dataset_meta(id))
            .collect::<AidbResult<Vec<_>>>()?
    };

    let mut tar_bytes = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut tar_bytes);
        for dataset in &datasets {
            let handle = storage.open_handle(&dataset.id)?;
            let rows = storage.scan_all(&handle)?;
            append_json(&mut builder, &format!("{id}/dataset_{}/metadata.json", dataset.id), dataset)?;
            append_json(&mut builder, &format!("{id}/dataset_{}/schema.json", dataset.id), &dataset_schema(dataset))?;
            append_json(&mut builder, &format!("{id}/dataset_{}/data.json", dataset.id), &rows)?;
        }
        append_json(
            &mut builder,
            &format!("{id}/system/config.json"),
            &serde_json::json!({ "tenant_id": tenant_id, "dataset_count": datasets.len() }),
        )?;
        builder.finish().map_err(|e| AidbError::Backup(e.to_string()))?;
    }

    let raw_bytes = tar_bytes.len() as u64;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar_bytes).map_err(|e| AidbError::Backup(e.to_string()))?;
    let compressed = encoder.finish().map_err(|e| AidbError::Backup(e.to_string()))?;
    let compressed_bytes = compressed.len() as u64;

    let mut hasher = Sha256::new();
    hasher.update(&compressed);
    let checksum = hex::encode(hasher.finalize());

    let storage_uri = sink.put(&format!("{id}.tar.gz"), &compressed)?;

    Ok(BackupRecord {
        id,
        created_at: Utc::now(),
        backup_type,
        status: BackupStatus::Completed,
        tenant_id: Some(tenant_id.to_string()),
        dataset_ids: datasets.iter().map(|d| d.id.clone()).collect(),
        raw_bytes,
        compressed_bytes,
        checksum: Some(checksum),
        storage_uri,
        duration_ms: start.elapsed().as_millis() as u64,
        error_message: None,
    })
}

fn dataset_schema(dataset: &Dataset) -> serde_json::Value {
    serde_json::json!({
        "dimensions": dataset.dimensions,
        "metric": dataset.metric.as_str(),
        "index_type": dataset.index_type.as_str(),
    })
}

fn append_json<W: std::io::Write, T: serde::Serialize>(
    builder: &mut tar::Builder<W>,
    path: &str,
    value: &T,
) -> AidbResult<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| AidbError::Internal(e.to_string()))?;
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, path, bytes.as_slice())
        .map_err(|e| AidbError::Backup(e.to_string()))
}

#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    pub verify_integrity: bool,
    pub restore_indexes: bool,
    pub restore_metadata: bool,
    /// Maps archived dataset id -> destination dataset id, for restoring
    /// into a dataset other than the one the backup was taken from.
    pub dataset_mapping: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RestoreReport {
    pub datasets_restored: Vec<String>,
    pub rows_restored: u64,
    pub checksum_verified: bool,
}

/// Restores datasets from an archive previously produced by `run_backup`.
pub fn run_restore(
    storage: &Storage,
    sink: &dyn ObjectStoreSink,
    record: &BackupRecord,
    options: &RestoreOptions,
) -> AidbResult<RestoreReport> {
    let compressed = sink.get(&record.storage_uri)?;

    if options.verify_integrity {
        let mut hasher = Sha256::new();
        hasher.update(&compressed);
        let checksum = hex::encode(hasher.finalize());
        if Some(checksum) != record.checksum {
            return Err(AidbError::Backup("checksum mismatch, archive may be corrupt".into()));
        }
    }

    let mut decoder = flate2::read::GzDecoder::new(compressed.as_slice());
    let mut tar_bytes = Vec::new();
    decoder.read_to_end(&mut tar_bytes).map_err(|e| AidbError::Backup(e.to_string()))?;

    let mut archive = tar::Archive::new(tar_bytes.as_slice());
    let mut report = RestoreReport {
        checksum_verified: options.verify_integrity,
        ..Default::default()
    };

    let mut metadata_by_dataset: std::collections::HashMap<String, Dataset> = std::collections::HashMap::new();
    let mut rows_by_dataset: std::collections::HashMap<String, Vec<VectorRecord>> = std::collections::HashMap::new();

    for entry in archive.entries().map_err(|e| AidbError::Backup(e.to_string()))? {
        let mut entry = entry.map_err(|e| AidbError::Backup(e.to_string()))?;
        let path = entry.path().map_err(|e| AidbError::Backup(e.to_string()))?.to_string_lossy().to_string();
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).map_err(|e| AidbError::Backup(e.to_string()))?;

        let Some(dataset_id) = dataset_id_from_path(&path) else { continue };
        if path.ends_with("metadata.json") {
            let dataset: Dataset = serde_json::from_slice(&contents).map_err(|e| AidbError::Internal(e.to_string()))?;
            metadata_by_dataset.insert(dataset_id, dataset);
        } else if path.ends_with("data.json") {
            let rows: Vec<VectorRecord> =
                serde_json::from_slice(&contents).map_err(|e| AidbError::Internal(e.to_string()))?;
            rows_by_dataset.insert(dataset_id, rows);
        }
    }

    for (archived_id, mut dataset) in metadata_by_dataset {
        let target_id = options.dataset_mapping.get(&archived_id).cloned();
        if let Some(target_id) = &target_id {
            dataset.id = target_id.clone();
        }
        if options.restore_metadata {
            // put_dataset_meta is private to storage; a fresh create_dataset
            // with overwrite covers the restore-metadata path instead.
            let spec = crate::models::DatasetSpec {
                name: dataset.name.clone(),
                description: dataset.description.clone(),
                dimensions: dataset.dimensions,
                metric: dataset.metric,
                index_type: dataset.index_type,
                metadata: dataset.metadata.clone(),
                overwrite: true,
            };
            let created = storage.create_dataset(&dataset.tenant_id, spec)?;
            let handle = storage.open_handle(&created.id)?;
            if let Some(rows) = rows_by_dataset.remove(&archived_id) {
                report.rows_restored += rows.len() as u64;
                storage.append(&handle, rows);
                storage.commit(&handle)?;
            }
            report.datasets_restored.push(created.id);
        }
    }

    let _ = options.restore_indexes; // index rebuild is the caller's job (service.rs), after rows land

    Ok(report)
}

fn dataset_id_from_path(path: &str) -> Option<String> {
    let marker = "dataset_";
    let start = path.find(marker)? + marker.len();
    let rest = &path[start..];
    let end = rest.find('/')?;
    Some(rest[..end].to_string())
}

/// Marks backups older than `retention_days` for cleanup. Returns the ids
/// the caller should delete from the sink and the backup-record table.
pub fn sweep_expired(records: &[BackupRecord], retention_days: i64) -> Vec<String> {
    let cutoff = Utc::now() - chrono::Duration::days(retention_days);
    records
        .iter()
        .filter(|r| r.status == BackupStatus::Completed && r.created_at < cutoff)
        .map(|r| r.id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{IndexKind, Metric};
    use crate::storage;

    #[test]
    fn backup_then_restore_round_trips_rows() {
        let (_dir, storage) = storage::test_storage();
        let dataset = storage
            .create_dataset(
                "t1",
                crate::models::DatasetSpec {
                    name: "ds1".into(),
                    description: String::new(),
                    dimensions: 2,
                    metric: Metric::Euclidean,
                    index_type: IndexKind::Flat,
                    metadata: serde_json::json!({}),
                    overwrite: false,
                },
            )
            .unwrap();
        let handle = storage.open_handle(&dataset.id).unwrap();
        let now = Utc::now();
        storage.append(
            &handle,
            vec![VectorRecord {
                id: "v1".into(),
                document_id: "d1".into(),
                chunk_id: None,
                chunk_index: None,
                chunk_count: None,
                values: vec![1.0, 2.0],
                content: None,
                content_hash: None,
                content_type: None,
                language: None,
                model: None,
                metadata: serde_json::json!({}),
                created_at: now,
                updated_at: now,
            }],
        );
        storage.commit(&handle).unwrap();

        let tmp = tempfile::tempdir().unwrap();
        let sink = LocalFsSink::new(tmp.path());
        let backup = run_backup(&storage, &sink, "t1", &[], BackupType::Full).unwrap();
        assert_eq!(backup.status, BackupStatus::Completed);
        assert!(backup.checksum.is_some());

        let mut mapping = std::collections::HashMap::new();
        mapping.insert(dataset.id.clone(), dataset.id.clone());
        let options = RestoreOptions {
            verify_integrity: true,
            restore_indexes: false,
            restore_metadata: true,
            dataset_mapping: mapping,
        };
        let report = run_restore(&storage, &sink, &backup, &options).unwrap();
        assert_eq!(report.rows_restored, 1);
        assert!(report.checksum_verified);
    }

    #[test]
    fn sweep_only_returns_completed_past_retention() {
        let old = BackupRecord {
            id: "old".into(),
            created_at: Utc::now() - chrono::Duration::days(40),
            backup_type: BackupType::Full,
            status: BackupStatus::Completed,
            tenant_id: None,
            dataset_ids: vec![],
            raw_bytes: 0,
            compressed_bytes: 0,
            checksum: None,
            storage_uri: String::new(),
            duration_ms: 0,
            error_message: None,
        };
        let recent = BackupRecord { id: "recent".into(), created_at: Utc::now(), ..old.clone() };
        let failed = BackupRecord {
            id: "failed".into(),
            status: BackupStatus::Failed,
            created_at: Utc::now() - chrono::Duration::days(40),
            ..old.clone()
        };
        let expired = sweep_expired(&[old, recent, failed], 30);
        assert_eq!(expired, vec!["old".to_string()]);
    }
}
