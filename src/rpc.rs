//! gRPC layer: tonic service implementation for `vectordb.VectorDbService`,
//! wired to the same `Service` the REST layer uses. Mirrors `rest.rs`'s
//! handlers one-for-one, trading JSON bodies for the generated proto types.

use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::cache::{self, Namespace};
use crate::error::AidbError;
use crate::filter;
use crate::hybrid::{self, FusionMethod};
use crate::ingest::{self, DuplicatePolicy, IngestRow};
use crate::models::{DatasetSpec, IndexKind, Metric};
use crate::query::{self, SearchOptions};
use crate::rate_limit::Operation;
use crate::service::Service;

pub mod proto {
    tonic::include_proto!("vectordb");
}

use proto::vector_db_service_server::{VectorDbService, VectorDbServiceServer};
use proto::{
    CreateDatasetRequest, DatasetReply, DeleteReply, GetDatasetRequest, GetVectorRequest, HealthReply, HealthRequest,
    HybridSearchRequest, InsertVectorsReply, InsertVectorsRequest, SearchReply, SearchRequest, SearchResultItem,
    VectorPayload, VectorReply,
};

pub struct VectorDbServiceImpl {
    service: Arc<Service>,
}

impl VectorDbServiceImpl {
    pub fn new(service: Arc<Service>) -> Self {
        Self { service }
    }

    pub fn into_server(self) -> VectorDbServiceServer<Self> {
        VectorDbServiceServer::new(self)
    }
}

fn vector_payload(row: &crate::models::VectorRecord) -> VectorPayload {
    VectorPayload {
        id: row.id.clone(),
        document_id: row.document_id.clone(),
        values: row.values.clone(),
        content: row.content.clone().unwrap_or_default(),
        metadata_json: row.metadata.to_string(),
        chunk_id: row.chunk_id.clone().unwrap_or_default(),
        chunk_index: row.chunk_index.unwrap_or(0),
        chunk_count: row.chunk_count.unwrap_or(0),
        content_type: row.content_type.clone().unwrap_or_default(),
        language: row.language.clone().unwrap_or_default(),
        model: row.model.clone().unwrap_or_default(),
    }
}

fn dataset_reply(dataset: &crate::models::Dataset, vector_count: u64) -> DatasetReply {
    DatasetReply {
        id: dataset.id.clone(),
        name: dataset.name.clone(),
        description: dataset.description.clone(),
        dimensions: dataset.dimensions as u32,
        metric: dataset.metric.as_str().to_string(),
        index_type: dataset.index_type.as_str().to_string(),
        tenant_id: dataset.tenant_id.clone(),
        created_at: dataset.created_at.to_rfc3339(),
        updated_at: dataset.updated_at.to_rfc3339(),
        vector_count,
    }
}

#[tonic::async_trait]
impl VectorDbService for VectorDbServiceImpl {
    async fn create_dataset(&self, request: Request<CreateDatasetRequest>) -> Result<Response<DatasetReply>, Status> {
        let req = request.into_inner();
        self.service.check_rate_limit(&req.tenant_id, Operation::CreateDataset).await?;
        let metric = Metric::parse(&req.metric)
            .ok_or_else(|| AidbError::Validation { field: "metric".into(), message: req.metric.clone() })?;
        let index_type = IndexKind::parse(&req.index_type)
            .ok_or_else(|| AidbError::Validation { field: "index_type".into(), message: req.index_type.clone() })?;
        let dataset = self
            .service
            .create_dataset(
                &req.tenant_id,
                DatasetSpec {
                    name: req.name,
                    description: req.description,
                    dimensions: req.dimensions as usize,
                    metric,
                    index_type,
                    metadata: serde_json::json!({}),
                    overwrite: req.overwrite,
                },
            )
            .await?;
        Ok(Response::new(dataset_reply(&dataset, 0)))
    }

    async fn get_dataset(&self, request: Request<GetDatasetRequest>) -> Result<Response<DatasetReply>, Status> {
        let req = request.into_inner();
        let dataset = self.service.storage.get_dataset_meta(&req.dataset_id)?;
        let handle = self.service.storage.open_handle(&req.dataset_id)?;
        Ok(Response::new(dataset_reply(&dataset, handle.vector_count())))
    }

    async fn delete_dataset(&self, request: Request<GetDatasetRequest>) -> Result<Response<DeleteReply>, Status> {
        let req = request.into_inner();
        self.service.delete_dataset(&req.dataset_id)?;
        Ok(Response::new(DeleteReply { success: true }))
    }

    async fn insert_vectors(
        &self,
        request: Request<InsertVectorsRequest>,
    ) -> Result<Response<InsertVectorsReply>, Status> {
        let req = request.into_inner();
        self.service.check_rate_limit(&req.tenant_id, Operation::BatchInsert).await?;
        let dataset = self.service.storage.get_dataset_meta(&req.dataset_id)?;
        let handle = self.service.storage.open_handle(&req.dataset_id)?;
        let rows: Vec<IngestRow> = req
            .vectors
            .into_iter()
            .map(|v| IngestRow {
                id: if v.id.is_empty() { None } else { Some(v.id) },
                document_id: v.document_id,
                chunk_id: if v.chunk_id.is_empty() { None } else { Some(v.chunk_id) },
                chunk_index: if v.chunk_index == 0 { None } else { Some(v.chunk_index) },
                chunk_count: if v.chunk_count == 0 { None } else { Some(v.chunk_count) },
                values: v.values,
                content: if v.content.is_empty() { None } else { Some(v.content) },
                content_type: if v.content_type.is_empty() { None } else { Some(v.content_type) },
                language: if v.language.is_empty() { None } else { Some(v.language) },
                model: if v.model.is_empty() { None } else { Some(v.model) },
                metadata: serde_json::from_str(&v.metadata_json).unwrap_or_else(|_| serde_json::json!({})),
            })
            .collect();
        let policy = if req.overwrite { DuplicatePolicy::Overwrite } else { DuplicatePolicy::Skip };
        let quotas = self.service.tenant(&req.tenant_id).await.map(|t| t.quotas).unwrap_or_default();
        let report = ingest::ingest_batch(&self.service.storage, &handle, &dataset, &quotas, rows, policy)?;
        self.service.invalidate_index(&req.dataset_id);
        Ok(Response::new(InsertVectorsReply {
            inserted: report.inserted as u32,
            skipped: report.skipped as u32,
            failed: report.failed as u32,
            error_messages: report.error_messages,
            processing_ms: report.processing_ms as u64,
        }))
    }

    async fn get_vector(&self, request: Request<GetVectorRequest>) -> Result<Response<VectorReply>, Status> {
        let req = request.into_inner();
        let handle = self.service.storage.open_handle(&req.dataset_id)?;
        let row = self
            .service
            .storage
            .get_by_id(&handle, &req.vector_id)?
            .ok_or_else(|| AidbError::VectorNotFound { dataset_id: req.dataset_id, vector_id: req.vector_id })?;
        Ok(Response::new(VectorReply { vector: Some(vector_payload(&row)) }))
    }

    async fn delete_vector(&self, request: Request<GetVectorRequest>) -> Result<Response<DeleteReply>, Status> {
        let req = request.into_inner();
        let handle = self.service.storage.open_handle(&req.dataset_id)?;
        self.service.storage.stage_delete(&handle, &req.vector_id);
        self.service.storage.commit(&handle)?;
        self.service.invalidate_index(&req.dataset_id);
        Ok(Response::new(DeleteReply { success: true }))
    }

    async fn search(&self, request: Request<SearchRequest>) -> Result<Response<SearchReply>, Status> {
        let req = request.into_inner();
        self.service.check_rate_limit(&req.tenant_id, Operation::Search).await?;
        let reply = run_search(&self.service, &req)?;
        Ok(Response::new(reply))
    }

    async fn hybrid_search(&self, request: Request<HybridSearchRequest>) -> Result<Response<SearchReply>, Status> {
        let hybrid_req = request.into_inner();
        let base = hybrid_req.base.ok_or_else(|| AidbError::Validation {
            field: "base".into(),
            message: "hybrid search requires a base vector search request".into(),
        })?;
        self.service.check_rate_limit(&base.tenant_id, Operation::HybridSearch).await?;

        let cache_key = cache::search_cache_key(
            &base.dataset_id,
            &base.query_vector,
            &format!(
                "hybrid:{}:{}:{}:{}:{}",
                hybrid_req.query_text, base.top_k, hybrid_req.vector_weight, hybrid_req.text_weight, hybrid_req.fusion_method
            ),
        );
        if let Some(cached) = self.service.cache.get(Namespace::SearchResult, &cache_key) {
            if let Some(reply) = json_to_search_reply(&cached) {
                return Ok(Response::new(reply));
            }
        }

        let dataset = self.service.storage.get_dataset_meta(&base.dataset_id)?;
        let rows = self.service.live_rows(&base.dataset_id)?;
        let indexes = self.service.indexes_for(&dataset)?;

        let options = SearchOptions { top_k: (base.top_k as usize).max(1) * 5, ..Default::default() };
        let (vector_results, _stats) = query::search(
            &rows,
            Some(&indexes.vector_index),
            dataset.dimensions,
            dataset.metric,
            &base.query_vector,
            &options,
        )?;

        let by_id: std::collections::HashMap<&str, &crate::models::VectorRecord> =
            rows.iter().map(|r| (r.id.as_str(), r)).collect();
        let text_results = indexes.lexical_index.search(&hybrid_req.query_text, &by_id);

        let method = FusionMethod::parse(&hybrid_req.fusion_method).unwrap_or(FusionMethod::Rrf);
        let mut fused = hybrid::fuse(&vector_results, &text_results, method, hybrid_req.vector_weight, hybrid_req.text_weight);
        fused.truncate((base.top_k as usize).max(1));

        let reply = SearchReply {
            results: fused
                .iter()
                .map(|r| SearchResultItem {
                    vector_id: r.vector_id.clone(),
                    score: r.score,
                    distance: r.distance,
                    rank: r.rank as u32,
                    content: r.content.clone().unwrap_or_default(),
                    metadata_json: r.metadata.to_string(),
                })
                .collect(),
            vectors_scanned: rows.len() as u64,
            index_hits: 0,
            filtered_results: 0,
            database_time_ms: 0.0,
            post_processing_time_ms: 0.0,
        };
        self.service.cache.put(Namespace::SearchResult, &cache_key, &base.dataset_id, search_reply_to_json(&reply));
        Ok(Response::new(reply))
    }

    async fn health(&self, _request: Request<HealthRequest>) -> Result<Response<HealthReply>, Status> {
        Ok(Response::new(HealthReply { healthy: true, version: env!("CARGO_PKG_VERSION").to_string() }))
    }
}

fn run_search(service: &Service, req: &SearchRequest) -> Result<SearchReply, AidbError> {
    let cache_key = cache::search_cache_key(
        &req.dataset_id,
        &req.query_vector,
        &format!(
            "{}:{}:{}:{}:{}:{}:{}:{}",
            req.top_k,
            req.threshold,
            req.metric_override,
            req.filters_json,
            req.deduplicate,
            req.group_by_document,
            req.ef_search,
            req.nprobe
        ),
    );
    if let Some(cached) = service.cache.get(Namespace::SearchResult, &cache_key) {
        if let Some(reply) = json_to_search_reply(&cached) {
            return Ok(reply);
        }
    }

    let dataset = service.storage.get_dataset_meta(&req.dataset_id)?;
    let rows = service.live_rows(&req.dataset_id)?;
    let indexes = service.indexes_for(&dataset)?;

    let metric_override = if req.metric_override.is_empty() { None } else { Metric::parse(&req.metric_override) };
    let filter_expr = if req.filters_json.is_empty() {
        None
    } else {
        let value: serde_json::Value =
            serde_json::from_str(&req.filters_json).map_err(|e| AidbError::InvalidFilter(e.to_string()))?;
        Some(filter::parse(&value)?)
    };

    let options = SearchOptions {
        top_k: (req.top_k as usize).max(1),
        threshold: if req.threshold > 0.0 { Some(req.threshold) } else { None },
        metric_override,
        filter: filter_expr,
        deduplicate: req.deduplicate,
        group_by_document: req.group_by_document,
        rerank_query_text: None,
        ef_search: if req.ef_search > 0 { Some(req.ef_search as usize) } else { None },
        nprobe: if req.nprobe > 0 { Some(req.nprobe as usize) } else { None },
        max_distance: None,
        min_score: None,
    };

    let (results, stats) = query::search(
        &rows,
        Some(&indexes.vector_index),
        dataset.dimensions,
        dataset.metric,
        &req.query_vector,
        &options,
    )?;

    let reply = SearchReply {
        results: results
            .iter()
            .map(|r| SearchResultItem {
                vector_id: r.vector_id.clone(),
                score: r.score,
                distance: r.distance,
                rank: r.rank as u32,
                content: r.content.clone().unwrap_or_default(),
                metadata_json: r.metadata.to_string(),
            })
            .collect(),
        vectors_scanned: stats.vectors_scanned,
        index_hits: stats.index_hits,
        filtered_results: stats.filtered_results,
        database_time_ms: stats.database_time_ms,
        post_processing_time_ms: stats.post_processing_time_ms,
    };
    service.cache.put(Namespace::SearchResult, &cache_key, &req.dataset_id, search_reply_to_json(&reply));
    Ok(reply)
}

/// Hand-rolled (rather than `#[derive(Serialize)]`) because the generated
/// proto types carry no serde impls and adding any would mean patching
/// `build.rs`'s codegen just for the cache's benefit.
fn search_reply_to_json(reply: &SearchReply) -> serde_json::Value {
    serde_json::json!({
        "results": reply.results.iter().map(|r| serde_json::json!({
            "vector_id": r.vector_id,
            "score": r.score,
            "distance": r.distance,
            "rank": r.rank,
            "content": r.content,
            "metadata_json": r.metadata_json,
        })).collect::<Vec<_>>(),
        "vectors_scanned": reply.vectors_scanned,
        "index_hits": reply.index_hits,
        "filtered_results": reply.filtered_results,
        "database_time_ms": reply.database_time_ms,
        "post_processing_time_ms": reply.post_processing_time_ms,
    })
}

fn json_to_search_reply(value: &serde_json::Value) -> Option<SearchReply> {
    let results = value
        .get("results")?
        .as_array()?
        .iter()
        .map(|r| {
            Some(SearchResultItem {
                vector_id: r.get("vector_id")?.as_str()?.to_string(),
                score: r.get("score")?.as_f64()?,
                distance: r.get("distance")?.as_f64()?,
                rank: r.get("rank")?.as_u64()? as u32,
                content: r.get("content")?.as_str()?.to_string(),
                metadata_json: r.get("metadata_json")?.as_str()?.to_string(),
            })
        })
        .collect::<Option<Vec<_>>>()?;
    Some(SearchReply {
        results,
        vectors_scanned: value.get("vectors_scanned")?.as_u64()?,
        index_hits: value.get("index_hits")?.as_u64()?,
        filtered_results: value.get("filtered_results")?.as_u64()?,
        database_time_ms: value.get("database_time_ms")?.as_f64()?,
        post_processing_time_ms: value.get("post_processing_time_ms")?.as_f64()?,
    })
}
