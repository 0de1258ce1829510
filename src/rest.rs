//! REST API layer: Axum router under `/api/v1`, mirroring the gRPC surface
//! in `rpc.rs` over the same `Service`. Route shape and DTO naming follow
//! spec.md §6's HTTP table; the teacher's `create_router(storage)` pattern
//! is kept, generalized to take the shared `Service` instead of a bare
//! `Storage`.

use std::sync::Arc;

use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{async_trait, Json, Router};
use serde::Deserialize;

use crate::backup::{run_backup, run_restore, RestoreOptions};
use crate::cache::{self, Namespace};
use crate::error::{AidbError, AidbResult};
use crate::filter;
use crate::hybrid::{self, FusionMethod};
use crate::ingest::{self, DuplicatePolicy, IngestRow};
use crate::models::{BackupType, DatasetSpec, Metric, User};
use crate::query::{self, SearchOptions};
use crate::rate_limit::Operation;
use crate::service::Service;

pub type AppState = Arc<Service>;

pub fn create_router(service: Arc<Service>) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/readyz", get(ready))
        .route("/livez", get(live))
        .nest("/api/v1", api_v1())
        .with_state(service)
}

fn api_v1() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/datasets", post(create_dataset).get(list_datasets))
        .route("/datasets/:dataset_id", get(get_dataset).delete(delete_dataset))
        .route("/datasets/:dataset_id/stats", get(dataset_stats))
        .route("/datasets/:dataset_id/vectors", post(insert_vectors).get(list_vectors))
        .route("/datasets/:dataset_id/vectors/:vector_id", get(get_vector).delete(delete_vector))
        .route("/datasets/:dataset_id/search", post(search_vectors))
        .route("/datasets/:dataset_id/search/text", post(search_text))
        .route("/datasets/:dataset_id/search/hybrid", post(search_hybrid))
        .route("/datasets/:dataset_id/index", post(rebuild_index).get(index_stats).delete(drop_index))
        .route("/backups", post(create_backup).get(list_backups))
        .route("/backups/:backup_id/restore", post(restore_backup))
        .route("/rate-limits/:tenant_id", get(rate_limit_status))
}

/// Principal resolved from `Authorization: Bearer <jwt>`. A registered
/// `User`'s first tenant membership is what the JWT's `sub` claim
/// resolves to at login time, so downstream handlers can keep treating
/// `sub` as the tenant id directly.
pub struct AuthenticatedTenant(pub String);

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedTenant {
    type Rejection = AidbError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AidbError::Unauthenticated("missing Authorization header".into()))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| AidbError::Unauthenticated("Authorization header must be a Bearer token".into()))?;
        let claims = crate::tenant::validate_jwt(&state.config.auth, token)?;
        Ok(AuthenticatedTenant(claims.sub))
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn ready(State(service): State<AppState>) -> Json<serde_json::Value> {
    let ready = service.storage.list_datasets("default").is_ok();
    Json(serde_json::json!({ "ready": ready }))
}

async fn live() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "alive": true }))
}

#[derive(Deserialize)]
struct RegisterBody {
    username: String,
    password: String,
    #[serde(default)]
    tenant_id: Option<String>,
}

async fn register(
    State(service): State<AppState>,
    Json(body): Json<RegisterBody>,
) -> AidbResult<(StatusCode, Json<serde_json::Value>)> {
    let tenant_id = body.tenant_id.unwrap_or_else(|| body.username.clone());
    let user = User {
        username: body.username.clone(),
        password_hash: crate::tenant::hash_password(&body.password)?,
        tenant_ids: vec![tenant_id.clone()],
    };
    service.storage.create_user(user)?;
    if service.tenant(&tenant_id).await.is_err() {
        service.upsert_tenant(crate::tenant::new_tenant(tenant_id)).await;
    }
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "username": body.username }))))
}

#[derive(Deserialize)]
struct LoginBody {
    username: String,
    password: String,
}

async fn login(State(service): State<AppState>, Json(body): Json<LoginBody>) -> AidbResult<Json<serde_json::Value>> {
    let user = service.storage.get_user(&body.username)?;
    if !crate::tenant::verify_password(&body.password, &user.password_hash)? {
        return Err(AidbError::Unauthenticated("invalid username or password".into()));
    }
    let tenant_id = user.tenant_ids.first().cloned().unwrap_or(user.username.clone());
    let token = crate::tenant::create_jwt(&service.config.auth, &tenant_id)?;
    Ok(Json(serde_json::json!({ "token": token })))
}

#[derive(Deserialize)]
struct CreateDatasetBody {
    name: String,
    #[serde(default)]
    description: String,
    dimensions: usize,
    metric: String,
    #[serde(default = "default_index_type")]
    index_type: String,
    #[serde(default)]
    metadata: serde_json::Value,
    #[serde(default)]
    overwrite: bool,
}

fn default_index_type() -> String {
    "default".to_string()
}

async fn create_dataset(
    State(service): State<AppState>,
    AuthenticatedTenant(tenant_id): AuthenticatedTenant,
    Json(body): Json<CreateDatasetBody>,
) -> AidbResult<(StatusCode, Json<serde_json::Value>)> {
    service.check_rate_limit(&tenant_id, Operation::CreateDataset).await?;
    let metric = Metric::parse(&body.metric).ok_or_else(|| AidbError::Validation {
        field: "metric".into(),
        message: format!("unknown metric '{}'", body.metric),
    })?;
    let index_type = crate::models::IndexKind::parse(&body.index_type).ok_or_else(|| AidbError::Validation {
        field: "index_type".into(),
        message: format!("unknown index_type '{}'", body.index_type),
    })?;
    let spec = DatasetSpec {
        name: body.name,
        description: body.description,
        dimensions: body.dimensions,
        metric,
        index_type,
        metadata: body.metadata,
        overwrite: body.overwrite,
    };
    let dataset = service.create_dataset(&tenant_id, spec).await?;
    Ok((StatusCode::CREATED, Json(serde_json::to_value(dataset).unwrap())))
}

async fn list_datasets(
    State(service): State<AppState>,
    AuthenticatedTenant(tenant_id): AuthenticatedTenant,
) -> AidbResult<Json<serde_json::Value>> {
    let datasets = service.storage.list_datasets(&tenant_id)?;
    Ok(Json(serde_json::to_value(datasets).unwrap()))
}

async fn get_dataset(State(service): State<AppState>, Path(dataset_id): Path<String>) -> AidbResult<Json<serde_json::Value>> {
    let dataset = service.storage.get_dataset_meta(&dataset_id)?;
    Ok(Json(serde_json::to_value(dataset).unwrap()))
}

async fn delete_dataset(State(service): State<AppState>, Path(dataset_id): Path<String>) -> AidbResult<StatusCode> {
    service.delete_dataset(&dataset_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn dataset_stats(
    State(service): State<AppState>,
    Path(dataset_id): Path<String>,
) -> AidbResult<Json<serde_json::Value>> {
    let dataset = service.storage.get_dataset_meta(&dataset_id)?;
    let handle = service.storage.open_handle(&dataset_id)?;
    Ok(Json(serde_json::json!({
        "dataset_id": dataset.id,
        "vector_count": handle.vector_count(),
        "dimensions": dataset.dimensions,
        "metric": dataset.metric.as_str(),
        "index_type": dataset.index_type.as_str(),
    })))
}

#[derive(Deserialize)]
struct InsertVectorsBody {
    vectors: Vec<IngestRow>,
    #[serde(default)]
    skip_existing: bool,
    #[serde(default)]
    overwrite: bool,
}

async fn insert_vectors(
    State(service): State<AppState>,
    AuthenticatedTenant(tenant_id): AuthenticatedTenant,
    Path(dataset_id): Path<String>,
    Json(body): Json<InsertVectorsBody>,
) -> AidbResult<Json<serde_json::Value>> {
    service.check_rate_limit(&tenant_id, Operation::BatchInsert).await?;
    let dataset = service.storage.get_dataset_meta(&dataset_id)?;
    let handle = service.storage.open_handle(&dataset_id)?;
    let quotas = service.tenant(&tenant_id).await.map(|t| t.quotas).unwrap_or_default();
    let policy = if body.overwrite { DuplicatePolicy::Overwrite } else { DuplicatePolicy::Skip };
    let _ = body.skip_existing; // Skip is already the default non-overwrite behavior
    let report = ingest::ingest_batch(&service.storage, &handle, &dataset, &quotas, body.vectors, policy)?;
    service.invalidate_index(&dataset_id);
    Ok(Json(serde_json::to_value(report).unwrap()))
}

#[derive(Deserialize)]
struct PageQuery {
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

fn default_limit() -> usize {
    100
}

async fn list_vectors(
    State(service): State<AppState>,
    Path(dataset_id): Path<String>,
    Query(page): Query<PageQuery>,
) -> AidbResult<Json<serde_json::Value>> {
    let handle = service.storage.open_handle(&dataset_id)?;
    let rows = service.storage.scan(&handle, page.limit, page.offset)?;
    Ok(Json(serde_json::to_value(rows).unwrap()))
}

async fn get_vector(
    State(service): State<AppState>,
    Path((dataset_id, vector_id)): Path<(String, String)>,
) -> AidbResult<Json<serde_json::Value>> {
    let handle = service.storage.open_handle(&dataset_id)?;
    let row = service
        .storage
        .get_by_id(&handle, &vector_id)?
        .ok_or_else(|| AidbError::VectorNotFound { dataset_id, vector_id })?;
    Ok(Json(serde_json::to_value(row).unwrap()))
}

async fn delete_vector(
    State(service): State<AppState>,
    Path((dataset_id, vector_id)): Path<(String, String)>,
) -> AidbResult<StatusCode> {
    let handle = service.storage.open_handle(&dataset_id)?;
    service.storage.stage_delete(&handle, &vector_id);
    service.storage.commit(&handle)?;
    service.invalidate_index(&dataset_id);
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct SearchBody {
    query_vector: Vec<f32>,
    #[serde(default = "default_top_k")]
    top_k: usize,
    #[serde(default)]
    threshold: Option<f64>,
    #[serde(default)]
    metric_override: Option<String>,
    #[serde(default)]
    filter: Option<serde_json::Value>,
    #[serde(default)]
    deduplicate: bool,
    #[serde(default)]
    group_by_document: bool,
    #[serde(default)]
    max_distance: Option<f64>,
    #[serde(default)]
    min_score: Option<f64>,
}

fn default_top_k() -> usize {
    10
}

fn build_search_options(body: &SearchBody) -> AidbResult<SearchOptions> {
    let metric_override = match &body.metric_override {
        Some(m) => Some(Metric::parse(m).ok_or_else(|| AidbError::Validation {
            field: "metric_override".into(),
            message: format!("unknown metric '{m}'"),
        })?),
        None => None,
    };
    let filter_expr = match &body.filter {
        Some(value) => Some(filter::parse(value)?),
        None => None,
    };
    Ok(SearchOptions {
        top_k: body.top_k,
        threshold: body.threshold,
        metric_override,
        filter: filter_expr,
        deduplicate: body.deduplicate,
        group_by_document: body.group_by_document,
        rerank_query_text: None,
        ef_search: None,
        nprobe: None,
        max_distance: body.max_distance,
        min_score: body.min_score,
    })
}

async fn search_vectors(
    State(service): State<AppState>,
    AuthenticatedTenant(tenant_id): AuthenticatedTenant,
    Path(dataset_id): Path<String>,
    Json(body): Json<SearchBody>,
) -> AidbResult<Json<serde_json::Value>> {
    service.check_rate_limit(&tenant_id, Operation::Search).await?;
    let options = build_search_options(&body)?;
    let cache_key = cache::search_cache_key(&dataset_id, &body.query_vector, &format!("{options:?}"));
    if let Some(cached) = service.cache.get(Namespace::SearchResult, &cache_key) {
        return Ok(Json(cached));
    }
    let dataset = service.storage.get_dataset_meta(&dataset_id)?;
    let rows = service.live_rows(&dataset_id)?;
    let indexes = service.indexes_for(&dataset)?;
    let (results, stats) = query::search(
        &rows,
        Some(&indexes.vector_index),
        dataset.dimensions,
        dataset.metric,
        &body.query_vector,
        &options,
    )?;
    let response = serde_json::json!({ "results": results, "stats": stats });
    service.cache.put(Namespace::SearchResult, &cache_key, &dataset_id, response.clone());
    Ok(Json(response))
}

#[derive(Deserialize)]
struct TextSearchBody {
    query_text: String,
    #[serde(default = "default_top_k")]
    top_k: usize,
}

async fn search_text(
    State(service): State<AppState>,
    AuthenticatedTenant(tenant_id): AuthenticatedTenant,
    Path(dataset_id): Path<String>,
    Json(body): Json<TextSearchBody>,
) -> AidbResult<Json<serde_json::Value>> {
    service.check_rate_limit(&tenant_id, Operation::Search).await?;
    let cache_key = cache::search_cache_key(&dataset_id, &[], &format!("text:{}:{}", body.query_text, body.top_k));
    if let Some(cached) = service.cache.get(Namespace::SearchResult, &cache_key) {
        return Ok(Json(cached));
    }
    let dataset = service.storage.get_dataset_meta(&dataset_id)?;
    let rows = service.live_rows(&dataset_id)?;
    let indexes = service.indexes_for(&dataset)?;
    let by_id: std::collections::HashMap<&str, &crate::models::VectorRecord> =
        rows.iter().map(|r| (r.id.as_str(), r)).collect();
    let mut results = indexes.lexical_index.search(&body.query_text, &by_id);
    results.truncate(body.top_k);
    let response = serde_json::to_value(results).unwrap();
    service.cache.put(Namespace::SearchResult, &cache_key, &dataset_id, response.clone());
    Ok(Json(response))
}

#[derive(Deserialize)]
struct HybridSearchBody {
    query_vector: Vec<f32>,
    query_text: String,
    #[serde(default = "default_top_k")]
    top_k: usize,
    #[serde(default = "default_weight")]
    vector_weight: f64,
    #[serde(default = "default_weight")]
    text_weight: f64,
    #[serde(default = "default_fusion")]
    fusion_method: String,
}

fn default_weight() -> f64 {
    0.5
}

fn default_fusion() -> String {
    "rrf".to_string()
}

async fn search_hybrid(
    State(service): State<AppState>,
    AuthenticatedTenant(tenant_id): AuthenticatedTenant,
    Path(dataset_id): Path<String>,
    Json(body): Json<HybridSearchBody>,
) -> AidbResult<Json<serde_json::Value>> {
    service.check_rate_limit(&tenant_id, Operation::HybridSearch).await?;
    let cache_key = cache::search_cache_key(
        &dataset_id,
        &body.query_vector,
        &format!(
            "hybrid:{}:{}:{}:{}:{}",
            body.query_text, body.top_k, body.vector_weight, body.text_weight, body.fusion_method
        ),
    );
    if let Some(cached) = service.cache.get(Namespace::SearchResult, &cache_key) {
        return Ok(Json(cached));
    }
    let dataset = service.storage.get_dataset_meta(&dataset_id)?;
    let rows = service.live_rows(&dataset_id)?;
    let indexes = service.indexes_for(&dataset)?;

    let options = SearchOptions { top_k: body.top_k * 5, ..Default::default() };
    let (vector_results, _stats) = query::search(
        &rows,
        Some(&indexes.vector_index),
        dataset.dimensions,
        dataset.metric,
        &body.query_vector,
        &options,
    )?;

    let by_id: std::collections::HashMap<&str, &crate::models::VectorRecord> =
        rows.iter().map(|r| (r.id.as_str(), r)).collect();
    let text_results = indexes.lexical_index.search(&body.query_text, &by_id);

    let method = FusionMethod::parse(&body.fusion_method).ok_or_else(|| AidbError::Validation {
        field: "fusion_method".into(),
        message: format!("unknown fusion method '{}'", body.fusion_method),
    })?;
    let mut fused = hybrid::fuse(&vector_results, &text_results, method, body.vector_weight, body.text_weight);
    fused.truncate(body.top_k);
    let response = serde_json::to_value(fused).unwrap();
    service.cache.put(Namespace::SearchResult, &cache_key, &dataset_id, response.clone());
    Ok(Json(response))
}

async fn rebuild_index(
    State(service): State<AppState>,
    AuthenticatedTenant(tenant_id): AuthenticatedTenant,
    Path(dataset_id): Path<String>,
) -> AidbResult<Json<serde_json::Value>> {
    service.check_rate_limit(&tenant_id, Operation::IndexOperation).await?;
    service.invalidate_index(&dataset_id);
    let dataset = service.storage.get_dataset_meta(&dataset_id)?;
    let indexes = service.indexes_for(&dataset)?;
    let _ = &indexes.vector_index;
    Ok(Json(serde_json::json!({ "rebuilt": true })))
}

async fn index_stats(State(service): State<AppState>, Path(dataset_id): Path<String>) -> AidbResult<Json<serde_json::Value>> {
    let dataset = service.storage.get_dataset_meta(&dataset_id)?;
    let handle = service.storage.open_handle(&dataset_id)?;
    Ok(Json(serde_json::json!({
        "dataset_id": dataset_id,
        "declared_index_type": dataset.index_type.as_str(),
        "vector_count": handle.vector_count(),
    })))
}

async fn drop_index(State(service): State<AppState>, Path(dataset_id): Path<String>) -> AidbResult<StatusCode> {
    service.invalidate_index(&dataset_id);
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct CreateBackupBody {
    #[serde(default)]
    dataset_ids: Vec<String>,
    #[serde(default = "default_backup_type")]
    backup_type: String,
}

fn default_backup_type() -> String {
    "full".to_string()
}

async fn create_backup(
    State(service): State<AppState>,
    AuthenticatedTenant(tenant_id): AuthenticatedTenant,
    Json(body): Json<CreateBackupBody>,
) -> AidbResult<Json<serde_json::Value>> {
    service.check_rate_limit(&tenant_id, Operation::Export).await?;
    let backup_type = match body.backup_type.as_str() {
        "full" => BackupType::Full,
        "incremental" => BackupType::Incremental,
        "snapshot" => BackupType::Snapshot,
        other => {
            return Err(AidbError::Validation {
                field: "backup_type".into(),
                message: format!("unknown backup type '{other}'"),
            })
        }
    };
    let record =
        run_backup(&service.storage, service.backup_sink.as_ref(), &tenant_id, &body.dataset_ids, backup_type)?;
    Ok(Json(serde_json::to_value(record).unwrap()))
}

async fn list_backups() -> Json<serde_json::Value> {
    // Backup records are returned by run_backup but this service does not
    // yet persist a backup-record table; a caller tracking its own record
    // ids can poll /backups/:id/restore directly.
    Json(serde_json::json!([]))
}

#[derive(Deserialize)]
struct RestoreBody {
    storage_uri: String,
    checksum: Option<String>,
    #[serde(default = "default_true")]
    verify_integrity: bool,
    #[serde(default)]
    dataset_mapping: std::collections::HashMap<String, String>,
}

fn default_true() -> bool {
    true
}

async fn restore_backup(
    State(service): State<AppState>,
    Path(backup_id): Path<String>,
    Json(body): Json<RestoreBody>,
) -> AidbResult<Json<serde_json::Value>> {
    let record = crate::models::BackupRecord {
        id: backup_id,
        created_at: chrono::Utc::now(),
        backup_type: BackupType::Full,
        status: crate::models::BackupStatus::Completed,
        tenant_id: None,
        dataset_ids: body.dataset_mapping.keys().cloned().collect(),
        raw_bytes: 0,
        compressed_bytes: 0,
        checksum: body.checksum,
        storage_uri: body.storage_uri,
        duration_ms: 0,
        error_message: None,
    };
    let options = RestoreOptions {
        verify_integrity: body.verify_integrity,
        restore_indexes: true,
        restore_metadata: true,
        dataset_mapping: body.dataset_mapping,
    };
    let report = run_restore(&service.storage, service.backup_sink.as_ref(), &record, &options)?;
    for dataset_id in &report.datasets_restored {
        service.invalidate_index(dataset_id);
    }
    Ok(Json(serde_json::to_value(report).unwrap()))
}

async fn rate_limit_status(State(service): State<AppState>, Path(tenant_id): Path<String>) -> Json<serde_json::Value> {
    let decision = service.rate_limit_decision(&tenant_id, Operation::Search).await;
    Json(serde_json::json!({
        "limit": decision.limit,
        "remaining": decision.remaining,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_service() -> Arc<Service> {
        let mut config = Config::load();
        config.storage.data_dir = tempfile::tempdir().unwrap().into_path().to_string_lossy().to_string();
        Arc::new(Service::new(config).unwrap())
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let app = create_router(test_service());
        let response =
            app.oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
