//! Seeds a sample dataset for local testing against the vector database
//! service: one dataset with ten ingested vectors spread across two
//! synthetic categories, so search/hybrid-search/index endpoints have
//! something to return against a freshly opened store.
//!
//! Run: cargo run --bin vectordb-seed

use serde_json::json;

use vectordb::ingest::{self, DuplicatePolicy, IngestRow};
use vectordb::models::{DatasetSpec, IndexKind, Metric};
use vectordb::storage::Storage;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let storage = Storage::open("./data")?;

    let dataset = storage.create_dataset(
        "default",
        DatasetSpec {
            name: "sample".to_string(),
            description: "seeded sample dataset".to_string(),
            dimensions: 4,
            metric: Metric::Cosine,
            index_type: IndexKind::Flat,
            metadata: json!({}),
            overwrite: true,
        },
    )?;
    let handle = storage.open_handle(&dataset.id)?;

    let rows: Vec<IngestRow> = (0..10)
        .map(|i| {
            let category = if i % 2 == 0 { "ai" } else { "data" };
            let mut values = vec![0.1f32; 4];
            values[i % 4] = 1.0;
            IngestRow {
                id: None,
                document_id: format!("doc{i}"),
                chunk_id: None,
                chunk_index: None,
                chunk_count: None,
                values,
                content: Some(format!(
                    "Sample document {i}: vector database covering search, hybrid fusion, and metadata filters."
                )),
                content_type: Some("text/plain".to_string()),
                language: Some("en".to_string()),
                model: None,
                metadata: json!({ "source": "load_data", "category": category }),
            }
        })
        .collect();

    let report = ingest::ingest_batch(&storage, &handle, &dataset, rows, DuplicatePolicy::Overwrite)?;
    println!(
        "seeded dataset '{}': {} inserted, {} skipped, {} failed",
        dataset.id, report.inserted, report.skipped, report.failed
    );

    Ok(())
}
