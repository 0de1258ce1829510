//! Error taxonomy for the engine and its HTTP/RPC surfaces.
//!
//! Mirrors the kind -> surface table in the specification: every
//! variant knows its HTTP status and gRPC code so `rest.rs` and `rpc.rs`
//! don't have to duplicate the mapping.

use axum::http::StatusCode;
use serde::Serialize;
use uuid::Uuid;

#[derive(thiserror::Error, Debug)]
pub enum AidbError {
    #[error("dataset '{0}' not found")]
    DatasetNotFound(String),

    #[error("dataset '{0}' already exists")]
    DatasetAlreadyExists(String),

    #[error("vector '{vector_id}' not found in dataset '{dataset_id}'")]
    VectorNotFound { dataset_id: String, vector_id: String },

    #[error("backup '{0}' not found")]
    BackupNotFound(String),

    #[error("job '{0}' not found")]
    JobNotFound(String),

    #[error("vector dimensions mismatch: expected {expected}, got {actual}")]
    InvalidDimensions { expected: usize, actual: usize },

    #[error("invalid filter expression: {0}")]
    InvalidFilter(String),

    #[error("invalid search parameters: {0}")]
    InvalidSearchParameters(String),

    #[error("validation failed for field '{field}': {message}")]
    Validation { field: String, message: String },

    #[error("authentication failed: {0}")]
    Unauthenticated(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("rate limit exceeded: {message}")]
    RateLimitExceeded { message: String, retry_after_secs: u64 },

    #[error("quota exceeded for {resource}: limit is {limit}")]
    QuotaExceeded { resource: String, limit: u64 },

    #[error("storage error during {operation}: {message}")]
    Storage { operation: String, message: String },

    #[error("backup error: {0}")]
    Backup(String),

    #[error("indexing error: {0}")]
    Indexing(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AidbError {
    pub fn error_code(&self) -> &'static str {
        match self {
            AidbError::DatasetNotFound(_) => "DATASET_NOT_FOUND",
            AidbError::DatasetAlreadyExists(_) => "DATASET_ALREADY_EXISTS",
            AidbError::VectorNotFound { .. } => "VECTOR_NOT_FOUND",
            AidbError::BackupNotFound(_) => "BACKUP_NOT_FOUND",
            AidbError::JobNotFound(_) => "JOB_NOT_FOUND",
            AidbError::InvalidDimensions { .. } => "INVALID_DIMENSIONS",
            AidbError::InvalidFilter(_) => "INVALID_FILTER",
            AidbError::InvalidSearchParameters(_) => "INVALID_SEARCH_PARAMETERS",
            AidbError::Validation { .. } => "VALIDATION_ERROR",
            AidbError::Unauthenticated(_) => "UNAUTHENTICATED",
            AidbError::PermissionDenied(_) => "PERMISSION_DENIED",
            AidbError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            AidbError::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            AidbError::Storage { .. } => "STORAGE_ERROR",
            AidbError::Backup(_) => "BACKUP_ERROR",
            AidbError::Indexing(_) => "INDEXING_ERROR",
            AidbError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            AidbError::Internal(_) => "INTERNAL",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AidbError::DatasetNotFound(_)
            | AidbError::VectorNotFound { .. }
            | AidbError::BackupNotFound(_)
            | AidbError::JobNotFound(_) => StatusCode::NOT_FOUND,
            AidbError::DatasetAlreadyExists(_) => StatusCode::CONFLICT,
            AidbError::InvalidDimensions { .. }
            | AidbError::InvalidFilter(_)
            | AidbError::InvalidSearchParameters(_) => StatusCode::BAD_REQUEST,
            AidbError::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AidbError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            AidbError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            AidbError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            AidbError::QuotaExceeded { .. } => StatusCode::FORBIDDEN,
            AidbError::Storage { .. } | AidbError::Backup(_) | AidbError::Indexing(_) | AidbError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AidbError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn grpc_code(&self) -> tonic::Code {
        match self {
            AidbError::DatasetNotFound(_)
            | AidbError::VectorNotFound { .. }
            | AidbError::BackupNotFound(_)
            | AidbError::JobNotFound(_) => tonic::Code::NotFound,
            AidbError::DatasetAlreadyExists(_) => tonic::Code::AlreadyExists,
            AidbError::InvalidDimensions { .. }
            | AidbError::InvalidFilter(_)
            | AidbError::InvalidSearchParameters(_)
            | AidbError::Validation { .. } => tonic::Code::InvalidArgument,
            AidbError::Unauthenticated(_) => tonic::Code::Unauthenticated,
            AidbError::PermissionDenied(_) => tonic::Code::PermissionDenied,
            AidbError::RateLimitExceeded { .. } => tonic::Code::ResourceExhausted,
            AidbError::QuotaExceeded { .. } => tonic::Code::ResourceExhausted,
            AidbError::Storage { .. } | AidbError::Backup(_) | AidbError::Indexing(_) | AidbError::Internal(_) => {
                tonic::Code::Internal
            }
            AidbError::ServiceUnavailable(_) => tonic::Code::Unavailable,
        }
    }
}

impl From<AidbError> for tonic::Status {
    fn from(err: AidbError) -> Self {
        tonic::Status::new(err.grpc_code(), err.to_string())
    }
}

/// `{ success:false, error_code, message, details, request_id }` envelope
/// carried by every HTTP error response, echoed also in `X-Request-ID`.
#[derive(Serialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error_code: &'static str,
    pub message: String,
    pub details: serde_json::Value,
    pub request_id: String,
}

impl axum::response::IntoResponse for AidbError {
    fn into_response(self) -> axum::response::Response {
        let request_id = Uuid::new_v4().to_string();
        let status = self.status_code();
        let mut details = serde_json::json!({});
        if let AidbError::RateLimitExceeded { retry_after_secs, .. } = &self {
            details = serde_json::json!({ "retry_after": retry_after_secs });
        }
        let body = ErrorBody {
            success: false,
            error_code: self.error_code(),
            message: self.to_string(),
            details,
            request_id: request_id.clone(),
        };
        let mut response = (status, axum::Json(body)).into_response();
        if let Ok(value) = axum::http::HeaderValue::from_str(&request_id) {
            response.headers_mut().insert("X-Request-ID", value);
        }
        if let AidbError::RateLimitExceeded { retry_after_secs, .. } = &self {
            if let Ok(value) = axum::http::HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}

pub type AidbResult<T> = Result<T, AidbError>;
