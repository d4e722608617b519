//! Configuration management for the search service
//!
//! Business-logic configuration (chunk sizing, RBAC policy, app metadata)
//! lives in a JSON or TOML file; secrets (database URLs, signing key, OIDC
//! and embedding credentials) come from environment variables and overlay
//! whatever the file provides.

use crate::embedding::ProviderKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Main configuration for the search service
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SentinelConfig {
    /// Application metadata
    #[serde(default)]
    pub app: AppConfig,

    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Metadata store configuration
    #[serde(default)]
    pub metadata: MetadataStoreConfig,

    /// Vector store configuration
    #[serde(default)]
    pub vector: VectorStoreConfig,

    /// Chunking and retrieval configuration
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Embedding provider configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Token signing and session configuration
    #[serde(default)]
    pub security: SecurityConfig,

    /// Identity provider configuration
    #[serde(default)]
    pub oidc: OidcConfig,

    /// Tenant configuration
    #[serde(default)]
    pub tenant: TenantConfig,

    /// Audit sink configuration
    #[serde(default)]
    pub audit: AuditConfig,

    /// RBAC policy: departments, roles and the access matrix
    #[serde(default)]
    pub rbac: RbacConfig,
}

/// Application metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub name: String,
    pub version: String,
    pub environment: String,
    pub debug: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "Sentinel".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            environment: "development".to_string(),
            debug: true,
        }
    }
}

impl AppConfig {
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,

    /// Allowed CORS origins; `*` means any
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,

    /// Per-request deadline in seconds, propagated to all downstream calls
    #[serde(default = "default_request_deadline")]
    pub request_deadline_secs: u64,
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_request_deadline() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            cors_origins: default_cors_origins(),
            request_deadline_secs: default_request_deadline(),
        }
    }
}

/// Metadata store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataStoreConfig {
    /// SQLite database URL
    pub database_url: String,

    pub min_pool_size: u32,
    pub max_pool_size: u32,
}

impl Default for MetadataStoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:sentinel.db".to_string(),
            min_pool_size: 2,
            max_pool_size: 10,
        }
    }
}

/// Vector store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorStoreConfig {
    /// SQLite database URL holding the child and parent collections
    pub database_url: String,

    pub max_pool_size: u32,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:sentinel-vectors.db".to_string(),
            max_pool_size: 10,
        }
    }
}

/// Chunk sizing and search configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Maximum results returned by a query
    pub max_retrieved_docs: usize,

    /// Minimum cosine similarity for a hit
    pub similarity_threshold: f32,

    /// Expand child hits to their parent chunks by default
    pub use_parent_retrieval: bool,

    /// Split documents hierarchically (parents + children) on ingest
    pub use_hierarchical_ingest: bool,

    pub parent_chunk_size: usize,
    pub parent_chunk_overlap: usize,
    pub child_chunk_size: usize,
    pub child_chunk_overlap: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_retrieved_docs: 20,
            similarity_threshold: 0.4,
            use_parent_retrieval: true,
            use_hierarchical_ingest: true,
            parent_chunk_size: 2000,
            parent_chunk_overlap: 200,
            child_chunk_size: 400,
            child_chunk_overlap: 50,
        }
    }
}

/// Embedding provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Which provider to construct at startup
    pub provider: ProviderKind,

    /// Model name; provider default used when empty
    #[serde(default)]
    pub model_name: String,

    /// API key, usually overlaid from `EMBEDDING_API_KEY`
    #[serde(default)]
    pub api_key: String,

    /// Fixed dimensionality every vector must have
    pub dimension: usize,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Fake,
            model_name: String::new(),
            api_key: String::new(),
            dimension: 1536,
            timeout_secs: 30,
        }
    }
}

/// Token signing and session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// HS256 signing key, overlaid from `SECRET_KEY`
    pub secret_key: String,

    /// Session token lifetime in minutes
    pub session_expiry_minutes: i64,

    /// Registration token lifetime in minutes
    pub registration_expiry_minutes: i64,

    /// Maximum age of the OIDC state parameter in minutes
    pub state_max_age_minutes: i64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            secret_key: String::new(),
            session_expiry_minutes: 60,
            registration_expiry_minutes: 15,
            state_max_age_minutes: 10,
        }
    }
}

/// Identity provider configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OidcConfig {
    #[serde(default)]
    pub client_id: String,

    #[serde(default)]
    pub client_secret: String,

    /// OIDC discovery document URL
    #[serde(default)]
    pub server_metadata_url: String,

    /// Callback URL registered with the provider
    #[serde(default)]
    pub redirect_url: String,
}

impl OidcConfig {
    pub fn is_configured(&self) -> bool {
        !self.client_id.is_empty()
            && !self.client_secret.is_empty()
            && !self.server_metadata_url.is_empty()
    }
}

/// Tenant configuration; one deployment serves one tenant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantConfig {
    pub tenant_id: String,
    pub domain: String,
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            tenant_id: "tenant-default".to_string(),
            domain: "example.com".to_string(),
        }
    }
}

/// Audit sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    pub enabled: bool,

    /// SQLite database URL for the audit tables
    pub database_url: String,

    /// Bounded in-process buffer capacity
    pub buffer_capacity: usize,

    /// Number of background drain workers
    pub workers: usize,

    /// How long an enqueue may block before the event is dropped to
    /// best-effort and the operation reports partial success
    pub enqueue_timeout_ms: u64,

    pub max_pool_size: u32,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            database_url: "sqlite:sentinel-audit.db".to_string(),
            buffer_capacity: 4096,
            workers: 2,
            enqueue_timeout_ms: 250,
            max_pool_size: 10,
        }
    }
}

/// RBAC policy loaded once at startup and immutable afterwards
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RbacConfig {
    /// Department names to provision
    #[serde(default)]
    pub departments: Vec<String>,

    /// Role names per department
    #[serde(default)]
    pub roles: HashMap<String, Vec<String>>,

    /// classification -> department -> allowed roles
    #[serde(default)]
    pub access_matrix: HashMap<String, HashMap<String, Vec<String>>>,
}

impl SentinelConfig {
    /// Load configuration from a file
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(&path)?;
        let config = match path.as_ref().extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            Some("toml") => toml::from_str(&content)?,
            _ => return Err(anyhow::anyhow!("Unsupported config file format")),
        };
        Ok(config)
    }

    /// Save configuration to a file
    pub fn to_file<P: AsRef<std::path::Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = match path.as_ref().extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::to_string_pretty(self)?,
            Some("toml") => toml::to_string(self)?,
            _ => return Err(anyhow::anyhow!("Unsupported config file format")),
        };
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Overlay secrets and environment-specific settings from env vars
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("SENTINEL_DATABASE_URL") {
            self.metadata.database_url = v;
        }
        if let Ok(v) = std::env::var("SENTINEL_VECTOR_URL") {
            self.vector.database_url = v;
        }
        if let Ok(v) = std::env::var("SENTINEL_AUDIT_URL") {
            self.audit.database_url = v;
        }
        if let Ok(v) = std::env::var("SECRET_KEY") {
            self.security.secret_key = v;
        }
        if let Ok(v) = std::env::var("OIDC_CLIENT_ID") {
            self.oidc.client_id = v;
        }
        if let Ok(v) = std::env::var("OIDC_CLIENT_SECRET") {
            self.oidc.client_secret = v;
        }
        if let Ok(v) = std::env::var("OIDC_SERVER_METADATA_URL") {
            self.oidc.server_metadata_url = v;
        }
        if let Ok(v) = std::env::var("EMBEDDING_API_KEY") {
            self.embedding.api_key = v;
        }
        if let Ok(v) = std::env::var("TENANT_ID") {
            self.tenant.tenant_id = v;
        }
        if let Ok(v) = std::env::var("TENANT_DOMAIN") {
            self.tenant.domain = v;
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.app.is_production() && self.security.secret_key.len() < 32 {
            return Err(anyhow::anyhow!(
                "SECRET_KEY must be at least 32 characters in production"
            ));
        }

        if self.embedding.dimension == 0 {
            return Err(anyhow::anyhow!(
                "Embedding dimension must be greater than 0"
            ));
        }

        if !(0.0..=1.0).contains(&self.retrieval.similarity_threshold) {
            return Err(anyhow::anyhow!(
                "Similarity threshold must be between 0.0 and 1.0"
            ));
        }

        if self.retrieval.parent_chunk_size <= self.retrieval.child_chunk_size {
            return Err(anyhow::anyhow!(
                "Parent chunks must be larger than child chunks"
            ));
        }

        if self.retrieval.parent_chunk_overlap >= self.retrieval.parent_chunk_size {
            return Err(anyhow::anyhow!("Parent overlap must be less than chunk size"));
        }

        if self.retrieval.child_chunk_overlap >= self.retrieval.child_chunk_size {
            return Err(anyhow::anyhow!("Child overlap must be less than chunk size"));
        }

        if self.retrieval.max_retrieved_docs == 0 {
            return Err(anyhow::anyhow!("max_retrieved_docs must be greater than 0"));
        }

        if self.audit.enabled && self.audit.workers == 0 {
            return Err(anyhow::anyhow!("Audit sink needs at least one worker"));
        }

        if self.tenant.tenant_id.is_empty() {
            return Err(anyhow::anyhow!("Tenant id cannot be empty"));
        }

        for (classification, departments) in &self.rbac.access_matrix {
            for department in departments.keys() {
                if !self.rbac.departments.contains(department) {
                    return Err(anyhow::anyhow!(
                        "Access matrix references unknown department {} under {}",
                        department,
                        classification
                    ));
                }
            }
        }

        Ok(())
    }
}
