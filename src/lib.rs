//! Sentinel: multi-tenant retrieval-augmented search over enterprise documents
//!
//! Tenants ingest heterogeneous files (PDF, office, markdown, plain text)
//! and issue natural-language queries; results are restricted to what the
//! caller may see under role-based access control, PII is redacted before
//! anything leaves the service, and every access lands on an immutable
//! audit trail.
//!
//! The crate is organised around four subsystems:
//! - Ingestion: format-adaptive parsing, hierarchical chunking, embedding
//!   and the ordered dual-store write ([`ingest`])
//! - Retrieval: RBAC-filtered vector search with optional parent expansion
//!   and mandatory redaction ([`retrieval`])
//! - RBAC: translation of user grants into (department, classification)
//!   filters ([`rbac`])
//! - Audit: buffered, typed, multi-table event logging ([`audit`])
//!
//! # Example
//!
//! ```rust,no_run
//! use sentinel::api::AppState;
//! use sentinel::config::SentinelConfig;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = SentinelConfig::from_file("config.json")?;
//!     config.apply_env();
//!
//!     let state = AppState::initialize(config).await?;
//!     sentinel::api::start_server(state).await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod audit;
pub mod auth;
pub mod chunker;
pub mod config;
pub mod context;
pub mod embedding;
pub mod error;
pub mod ingest;
pub mod model;
pub mod parser;
pub mod rbac;
pub mod redact;
pub mod retrieval;
pub mod seed;
pub mod store;

// Re-export main types
pub use api::AppState;
pub use audit::{
    AuditAction, AuditEvent, AuditSink, AuthAuditEvent, EventCategory, EventOutcome,
    ModificationAuditEvent, QueryAuditEvent, ResourceType,
};
pub use auth::{OidcClient, PendingPrincipal, Principal, TokenService};
pub use chunker::{ChunkSet, HierarchicalChunker, RecursiveSplitter, Segment};
pub use config::{RetrievalConfig, SentinelConfig};
pub use context::RequestContext;
pub use embedding::{EmbeddingProvider, FakeProvider, ProviderKind};
pub use error::{ErrorKind, Result, SentinelError};
pub use ingest::{IngestReceipt, IngestRequest, IngestionCoordinator};
pub use model::{AccessPair, Classification, Document, DocumentSummary, ParentChunk, User};
pub use parser::{DocumentFormat, DocumentParser, OfficeConverter};
pub use rbac::{AccessMatrix, RbacResolver};
pub use redact::{Analyzer, Redacted, RedactionPool};
pub use retrieval::{QueryRequest, QueryResponse, RetrievalCoordinator, RetrievedChunk};
pub use store::{MetadataStore, VectorStore};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
