//! Error handling for the search service

use thiserror::Error;

/// Result type alias for the search service
pub type Result<T> = std::result::Result<T, SentinelError>;

/// Error kinds mapped onto the HTTP surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Authentication,
    Authorization,
    Validation,
    NotFound,
    Conflict,
    Dependency,
    Internal,
}

impl ErrorKind {
    /// HTTP status code for this kind
    pub fn status(&self) -> u16 {
        match self {
            ErrorKind::Authentication => 401,
            ErrorKind::Authorization => 403,
            ErrorKind::Validation => 422,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Dependency => 503,
            ErrorKind::Internal => 500,
        }
    }

    /// Stable error code for the response envelope
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Authentication => "authentication_error",
            ErrorKind::Authorization => "authorization_error",
            ErrorKind::Validation => "validation_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Dependency => "dependency_failure",
            ErrorKind::Internal => "internal_error",
        }
    }
}

/// Main error type for the search service
#[derive(Error, Debug)]
pub enum SentinelError {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("redaction error: {0}")]
    Redaction(#[from] RedactionError),

    #[error("metadata store error: {0}")]
    Store(#[from] StoreError),

    #[error("vector store error: {0}")]
    Vector(#[from] VectorError),

    #[error("audit error: {0}")]
    Audit(#[from] AuditError),

    #[error("auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("ingestion error: {0}")]
    Ingest(#[from] IngestError),

    #[error("query error: {0}")]
    Query(#[from] QueryError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("deadline exceeded")]
    Deadline,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Errors raised while converting uploaded files to markdown
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("failed to parse document: {0}")]
    ParseFailure(String),
}

/// Errors from embedding providers
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("provider request failed: {0}")]
    Provider(String),

    #[error("provider returned an invalid response: {0}")]
    InvalidResponse(String),

    #[error("provider rejected credentials")]
    Unauthorized,

    #[error("invalid embedding dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    #[error("timeout: embedding request took too long")]
    Timeout,

    #[error("unknown embedding provider: {0}")]
    UnknownProvider(String),
}

/// Errors from the PII redaction pool
#[derive(Error, Debug)]
pub enum RedactionError {
    #[error("redaction pool is saturated")]
    PoolSaturated,

    #[error("redaction worker failed: {0}")]
    WorkerFailed(String),

    #[error("redaction pool has shut down")]
    PoolClosed,
}

/// Errors from the metadata store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store not initialized")]
    NotInitialized,

    #[error("storage failed: {0}")]
    StorageFailed(String),

    #[error("record not found: {0}")]
    RecordNotFound(String),

    #[error("duplicate record: {0}")]
    Duplicate(String),
}

/// Errors from the vector store
#[derive(Error, Debug)]
pub enum VectorError {
    #[error("vector store not initialized")]
    NotInitialized,

    #[error("invalid embedding dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    #[error("upsert failed: {0}")]
    UpsertFailed(String),

    #[error("search failed: {0}")]
    SearchFailed(String),
}

/// Errors from the audit sink
#[derive(Error, Debug)]
pub enum AuditError {
    #[error("audit buffer is full")]
    BufferFull,

    #[error("audit sink has shut down")]
    SinkClosed,

    #[error("audit write failed: {0}")]
    WriteFailed(String),
}

/// Errors from authentication and session handling
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("not authenticated")]
    NotAuthenticated,

    #[error("token is invalid or expired")]
    InvalidToken,

    #[error("state parameter is invalid or expired")]
    InvalidState,

    #[error("registration required for {0}")]
    RegistrationRequired(String),

    #[error("principal lacks permission for this resource")]
    Forbidden,

    #[error("identity provider error: {0}")]
    Provider(String),
}

/// Failure modes specific to the ingestion pipeline
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("no text could be extracted from the document")]
    EmptyDocument,

    #[error("chunking produced no chunks")]
    NoChunks,

    #[error("vector write failed after metadata commit; document {doc_id} was rolled back: {reason}")]
    Compensated { doc_id: uuid::Uuid, reason: String },
}

/// Failure modes specific to the retrieval pipeline
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("failed to embed query: {0}")]
    QueryEmbedding(String),

    #[error("search failed: {0}")]
    Search(String),

    #[error("redaction failed, refusing to return unredacted content: {0}")]
    RedactionFailed(String),
}

impl SentinelError {
    /// Check if the error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SentinelError::Embedding(EmbeddingError::Timeout)
                | SentinelError::Embedding(EmbeddingError::Provider(_))
                | SentinelError::Redaction(RedactionError::PoolSaturated)
                | SentinelError::Http(_)
        )
    }

    /// Map the error onto the HTTP surface taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            SentinelError::Auth(AuthError::Forbidden) => ErrorKind::Authorization,
            SentinelError::Auth(AuthError::Provider(_)) => ErrorKind::Dependency,
            SentinelError::Auth(_) => ErrorKind::Authentication,
            SentinelError::Parse(_) => ErrorKind::Validation,
            SentinelError::Validation(_) => ErrorKind::Validation,
            SentinelError::Config(_) => ErrorKind::Internal,
            SentinelError::NotFound(_) => ErrorKind::NotFound,
            SentinelError::Store(StoreError::RecordNotFound(_)) => ErrorKind::NotFound,
            SentinelError::Conflict(_) => ErrorKind::Conflict,
            SentinelError::Store(StoreError::Duplicate(_)) => ErrorKind::Conflict,
            SentinelError::Embedding(EmbeddingError::UnknownProvider(_)) => ErrorKind::Internal,
            SentinelError::Embedding(_)
            | SentinelError::Store(_)
            | SentinelError::Vector(_)
            | SentinelError::Database(_)
            | SentinelError::Http(_) => ErrorKind::Dependency,
            SentinelError::Ingest(IngestError::EmptyDocument)
            | SentinelError::Ingest(IngestError::NoChunks) => ErrorKind::Validation,
            SentinelError::Ingest(IngestError::Compensated { .. }) => ErrorKind::Dependency,
            SentinelError::Query(QueryError::QueryEmbedding(_))
            | SentinelError::Query(QueryError::Search(_)) => ErrorKind::Dependency,
            SentinelError::Query(QueryError::RedactionFailed(_)) => ErrorKind::Internal,
            SentinelError::Deadline => ErrorKind::Dependency,
            _ => ErrorKind::Internal,
        }
    }

    /// Get error category for logging/metrics
    pub fn category(&self) -> &'static str {
        match self {
            SentinelError::Parse(_) => "parse",
            SentinelError::Embedding(_) => "embedding",
            SentinelError::Redaction(_) => "redaction",
            SentinelError::Store(_) => "store",
            SentinelError::Vector(_) => "vector",
            SentinelError::Audit(_) => "audit",
            SentinelError::Auth(_) => "auth",
            SentinelError::Ingest(_) => "ingest",
            SentinelError::Query(_) => "query",
            SentinelError::Config(_) => "config",
            SentinelError::Validation(_) => "validation",
            SentinelError::NotFound(_) => "not_found",
            SentinelError::Conflict(_) => "conflict",
            SentinelError::Deadline => "deadline",
            SentinelError::Io(_) => "io",
            SentinelError::Serialization(_) => "serialization",
            SentinelError::Http(_) => "http",
            SentinelError::Database(_) => "database",
        }
    }
}
