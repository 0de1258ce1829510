//! Process-wide service state: the single object `rest.rs`/`rpc.rs`
//! construct once at startup and share behind an `Arc`. Bundles the
//! storage engine, per-dataset index cache, rate limiter, job manager,
//! result cache, and a bounded worker pool for blocking storage calls —
//! the "global service state" shape spec.md §9 calls out explicitly,
//! generalized from the teacher's single `Storage` field in `main.rs`.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{RwLock, Semaphore};

use crate::backup::{LocalFsSink, ObjectStoreSink};
use crate::cache::Cache;
use crate::config::Config;
use crate::error::{AidbError, AidbResult};
use crate::hybrid::LexicalIndex;
use crate::indexing::Index;
use crate::jobs::JobManager;
use crate::models::{Dataset, DatasetSpec, Tenant, VectorRecord};
use crate::rate_limit::{Operation, RateLimiter, Strategy};
use crate::storage::Storage;
use crate::tenant;

/// Built index plus the lexical index search needs, cached together so a
/// hybrid query never rebuilds one without the other.
pub struct DatasetIndexes {
    pub vector_index: Index,
    pub lexical_index: LexicalIndex,
}

pub struct Service {
    pub config: Config,
    pub storage: Storage,
    pub cache: Cache,
    pub jobs: JobManager,
    pub rate_limiter: RateLimiter,
    pub backup_sink: Box<dyn ObjectStoreSink>,
    indexes: DashMap<String, Arc<DatasetIndexes>>,
    tenants: RwLock<HashMap<String, Tenant>>,
    worker_permits: Semaphore,
}

impl Service {
    pub fn new(config: Config) -> AidbResult<Self> {
        let storage = Storage::open(&config.storage.data_dir)?;
        let backup_sink: Box<dyn ObjectStoreSink> = Box::new(LocalFsSink::new(config.backup.backup_dir.clone()));
        let worker_permits = Semaphore::new(config.storage.worker_pool_size.max(1));
        let mut tenants = HashMap::new();
        tenants.insert("default".to_string(), tenant::new_tenant("default"));

        let rate_limiter = RateLimiter::with_limits(
            Strategy::SlidingWindow,
            config.rate_limit.requests_per_minute as u32,
            config.rate_limit.burst as u32,
        );

        Ok(Self {
            storage,
            cache: Cache::with_config(&config.cache),
            jobs: JobManager::new(),
            rate_limiter,
            backup_sink,
            indexes: DashMap::new(),
            tenants: RwLock::new(tenants),
            worker_permits,
            config,
        })
    }

    pub async fn tenant(&self, tenant_id: &str) -> AidbResult<Tenant> {
        self.tenants
            .read()
            .await
            .get(tenant_id)
            .cloned()
            .ok_or_else(|| AidbError::Unauthenticated(format!("unknown tenant '{tenant_id}'")))
    }

    pub async fn upsert_tenant(&self, tenant: Tenant) {
        self.tenants.write().await.insert(tenant.id.clone(), tenant);
    }

    /// Resolves the tenant's `rate_limit_overrides` entry for `operation`
    /// (if any) and checks it against the limiter. Unknown tenants fall
    /// back to the operation's default limits rather than erroring, since
    /// rate limiting must not become a second authentication gate.
    pub async fn rate_limit_decision(&self, tenant_id: &str, operation: Operation) -> crate::rate_limit::Decision {
        let override_limit = self
            .tenant(tenant_id)
            .await
            .ok()
            .and_then(|t| t.rate_limit_overrides.get(operation.as_str()).copied())
            .map(|v| v as u32);
        self.rate_limiter.check(tenant_id, operation, override_limit)
    }

    pub async fn check_rate_limit(&self, tenant_id: &str, operation: Operation) -> AidbResult<()> {
        let decision = self.rate_limit_decision(tenant_id, operation).await;
        if !decision.allowed {
            return Err(AidbError::RateLimitExceeded {
                message: format!("rate limit exceeded for {tenant_id}"),
                retry_after_secs: decision.retry_after_secs,
            });
        }
        Ok(())
    }

    /// Runs a blocking storage/index operation on the bounded worker pool,
    /// mirroring how `spawn_blocking` work is gated in the teacher's
    /// server loop, just with an explicit capacity knob from config.
    pub async fn run_blocking<F, T>(&self, f: F) -> AidbResult<T>
    where
        F: FnOnce() -> AidbResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self.worker_permits.acquire().await.map_err(|e| AidbError::Internal(e.to_string()))?;
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| AidbError::Internal(e.to_string()))?
    }

    /// `quotas.max_datasets == 0` means unlimited — the sentinel lets a
    /// freshly provisioned tenant (whose `TenantQuotas` default to all
    /// zero) create datasets before an operator sets a real ceiling.
    pub async fn create_dataset(&self, tenant_id: &str, spec: DatasetSpec) -> AidbResult<Dataset> {
        if let Ok(tenant) = self.tenant(tenant_id).await {
            if tenant.quotas.max_datasets > 0 {
                let existing = self.storage.list_datasets(tenant_id)?.len() as u32;
                if existing >= tenant.quotas.max_datasets {
                    return Err(AidbError::QuotaExceeded {
                        resource: "datasets".into(),
                        limit: tenant.quotas.max_datasets as u64,
                    });
                }
            }
        }
        let dataset = self.storage.create_dataset(tenant_id, spec)?;
        self.indexes.remove(&dataset.id);
        Ok(dataset)
    }

    pub fn delete_dataset(&self, dataset_id: &str) -> AidbResult<()> {
        self.storage.delete_dataset(dataset_id)?;
        self.indexes.remove(dataset_id);
        self.cache.invalidate_dataset(dataset_id);
        Ok(())
    }

    /// Lazily (re)builds and caches the vector + lexical index pair for a
    /// dataset. Callers that just wrote to the dataset should call
    /// `invalidate_index` first so the next search sees fresh data.
    pub fn indexes_for(&self, dataset: &Dataset) -> AidbResult<Arc<DatasetIndexes>> {
        if let Some(existing) = self.indexes.get(&dataset.id) {
            return Ok(existing.clone());
        }
        let handle = self.storage.open_handle(&dataset.id)?;
        let rows = self.storage.scan_all(&handle)?;
        let vectors: Vec<(String, Vec<f32>)> = rows.iter().map(|r| (r.id.clone(), r.values.clone())).collect();
        let (vector_index, _stats) = Index::build(dataset.index_type, &vectors, dataset.metric);
        let lexical_index = LexicalIndex::build(&rows);
        let built = Arc::new(DatasetIndexes { vector_index, lexical_index });
        self.indexes.insert(dataset.id.clone(), built.clone());
        Ok(built)
    }

    pub fn invalidate_index(&self, dataset_id: &str) {
        self.indexes.remove(dataset_id);
        self.cache.invalidate_dataset(dataset_id);
    }

    pub fn live_rows(&self, dataset_id: &str) -> AidbResult<Vec<VectorRecord>> {
        let handle = self.storage.open_handle(dataset_id)?;
        self.storage.scan_all(&handle)
    }
}
