//! Process configuration, assembled from environment variables the way
//! the original service's pydantic `BaseSettings` groups did: one struct
//! per concern, each with its own env prefix, loaded through `dotenvy`
//! so a local `.env` file works the same as exported vars.

use std::env;
use std::time::Duration;

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub data_dir: String,
    pub worker_pool_size: usize,
}

impl StorageConfig {
    fn from_env() -> Self {
        Self {
            data_dir: env_or("AIDB_DATA_DIR", "./data"),
            worker_pool_size: env_parse("AIDB_WORKER_POOL_SIZE", 10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout: Duration,
}

impl HttpConfig {
    fn from_env() -> Self {
        Self {
            host: env_or("HTTP_HOST", "0.0.0.0"),
            port: env_parse("HTTP_PORT", 11111),
            request_timeout: Duration::from_secs(env_parse("HTTP_REQUEST_TIMEOUT", 300)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GrpcConfig {
    pub host: String,
    pub port: u16,
    pub max_workers: usize,
}

impl GrpcConfig {
    fn from_env() -> Self {
        Self {
            host: env_or("GRPC_HOST", "0.0.0.0"),
            port: env_parse("GRPC_PORT", 50051),
            max_workers: env_parse("GRPC_MAX_WORKERS", 10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret_key: String,
    pub jwt_expiration_hours: i64,
}

impl AuthConfig {
    fn from_env() -> Self {
        Self {
            jwt_secret_key: env::var("AUTH_JWT_SECRET_KEY")
                .unwrap_or_else(|_| "dev-only-insecure-secret-change-me".to_string()),
            jwt_expiration_hours: env_parse("AUTH_JWT_EXPIRATION_HOURS", 8760),
        }
    }
}

/// Namespaced cache TTLs, mirroring the per-purpose Redis TTLs of the
/// service this was distilled from, applied here to the in-process cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub default_ttl_secs: u64,
    pub search_ttl_secs: u64,
    pub metadata_ttl_secs: u64,
    pub dataset_ttl_secs: u64,
    pub embedding_ttl_secs: u64,
    pub max_cache_size_mb: u64,
}

impl CacheConfig {
    fn from_env() -> Self {
        Self {
            default_ttl_secs: env_parse("CACHE_DEFAULT_TTL_SECONDS", 3600),
            search_ttl_secs: env_parse("CACHE_SEARCH_TTL_SECONDS", 300),
            metadata_ttl_secs: env_parse("CACHE_METADATA_TTL_SECONDS", 1800),
            dataset_ttl_secs: env_parse("CACHE_DATASET_TTL_SECONDS", 900),
            embedding_ttl_secs: env_parse("CACHE_EMBEDDING_TTL_SECONDS", 3600),
            max_cache_size_mb: env_parse("CACHE_MAX_SIZE_MB", 512),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_minute: u64,
    pub burst: u64,
}

impl RateLimitConfig {
    fn from_env() -> Self {
        Self {
            requests_per_minute: env_parse("RATE_LIMIT_REQUESTS_PER_MINUTE", 1000),
            burst: env_parse("RATE_LIMIT_BURST", 100),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitoringConfig {
    pub log_level: String,
    pub log_format: String,
    pub log_dir: String,
}

impl MonitoringConfig {
    fn from_env() -> Self {
        Self {
            log_level: env_or("MONITORING_LOG_LEVEL", "info"),
            log_format: env_or("MONITORING_LOG_FORMAT", "json"),
            log_dir: env_or("MONITORING_LOG_DIR", "./logs"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub backup_dir: String,
    pub retention_days: u32,
}

impl BackupConfig {
    fn from_env() -> Self {
        Self {
            backup_dir: env_or("AIDB_BACKUP_DIR", "./backups"),
            retention_days: env_parse("AIDB_BACKUP_RETENTION_DAYS", 30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    pub http: HttpConfig,
    pub grpc: GrpcConfig,
    pub auth: AuthConfig,
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
    pub monitoring: MonitoringConfig,
    pub backup: BackupConfig,
}

impl Config {
    /// Loads `.env` (if present) then reads every sub-config from the
    /// process environment. Missing vars fall back to the defaults above.
    pub fn load() -> Self {
        if let Err(err) = dotenvy::dotenv() {
            tracing::debug!(%err, "no .env file loaded");
        }
        Self {
            storage: StorageConfig::from_env(),
            http: HttpConfig::from_env(),
            grpc: GrpcConfig::from_env(),
            auth: AuthConfig::from_env(),
            cache: CacheConfig::from_env(),
            rate_limit: RateLimitConfig::from_env(),
            monitoring: MonitoringConfig::from_env(),
            backup: BackupConfig::from_env(),
        }
    }
}
