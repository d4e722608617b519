//! Ingestion coordinator
//!
//! Drives a document through parse, chunk, embed and the dual-store write.
//! The metadata store and the vector store are not transactional together:
//! vectors are written only after the metadata commit, and a late vector
//! failure is compensated by deleting the vectors and the document, so no
//! orphan state survives a failed ingestion.

use crate::audit::{
    AuditAction, AuditEvent, AuditSink, EventCategory, EventOutcome, ModificationAuditEvent,
    ResourceType,
};
use crate::chunker::{ChunkSet, HierarchicalChunker};
use crate::config::RetrievalConfig;
use crate::context::RequestContext;
use crate::embedding::EmbeddingProvider;
use crate::error::{AuthError, EmbeddingError, IngestError, Result, SentinelError};
use crate::model::{Classification, NewDocument};
use crate::parser::DocumentParser;
use crate::store::{ChildPoint, MetadataStore, ParentPoint, SavedHierarchy, VectorIndex};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Pipeline states, reported in audit metadata on failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestState {
    Received,
    Parsing,
    Chunking,
    Embedding,
    Persisting,
    Committed,
}

impl IngestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestState::Received => "received",
            IngestState::Parsing => "parsing",
            IngestState::Chunking => "chunking",
            IngestState::Embedding => "embedding",
            IngestState::Persisting => "persisting",
            IngestState::Committed => "committed",
        }
    }
}

/// One upload to run through the pipeline
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub filename: String,
    pub bytes: Vec<u8>,
    pub title: String,
    pub description: String,
    pub department: String,
    pub classification: Classification,
    /// Override the configured chunking mode for this request
    pub hierarchical: Option<bool>,
}

/// Result of a committed ingestion
#[derive(Debug, Clone)]
pub struct IngestReceipt {
    pub doc_id: Uuid,
    pub parent_chunks: usize,
    pub child_chunks: usize,
    /// Success, or partial when the audit buffer rejected the event
    pub outcome: EventOutcome,
}

pub struct IngestionCoordinator {
    parser: Arc<DocumentParser>,
    embedder: Arc<dyn EmbeddingProvider>,
    metadata: Arc<MetadataStore>,
    vectors: Arc<dyn VectorIndex>,
    audit: Arc<AuditSink>,
    config: RetrievalConfig,
}

impl IngestionCoordinator {
    pub fn new(
        parser: Arc<DocumentParser>,
        embedder: Arc<dyn EmbeddingProvider>,
        metadata: Arc<MetadataStore>,
        vectors: Arc<dyn VectorIndex>,
        audit: Arc<AuditSink>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            parser,
            embedder,
            metadata,
            vectors,
            audit,
            config,
        }
    }

    /// Ingest one document. Any failure is audited with the pipeline state
    /// it happened in; partial work is discarded before the error surfaces.
    pub async fn ingest(
        &self,
        ctx: &RequestContext,
        request: IngestRequest,
    ) -> Result<IngestReceipt> {
        if ctx.user_id().is_none() {
            return Err(AuthError::NotAuthenticated.into());
        }

        let mut state = IngestState::Received;
        match self.run(ctx, &request, &mut state).await {
            Ok(receipt) => {
                info!(
                    doc_id = %receipt.doc_id,
                    parents = receipt.parent_chunks,
                    children = receipt.child_chunks,
                    "ingestion committed"
                );
                Ok(receipt)
            }
            Err(err) => {
                self.audit_failure(ctx, &request, state, &err).await;
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        ctx: &RequestContext,
        request: &IngestRequest,
        state: &mut IngestState,
    ) -> Result<IngestReceipt> {
        *state = IngestState::Parsing;
        let markdown = {
            let parser = self.parser.clone();
            let filename = request.filename.clone();
            let bytes = request.bytes.clone();
            ctx.with_deadline(async move {
                tokio::task::spawn_blocking(move || parser.parse(&filename, &bytes))
                    .await
                    .map_err(|e| {
                        SentinelError::Validation(format!("parser task failed: {}", e))
                    })?
            })
            .await?
        };
        if markdown.trim().is_empty() {
            return Err(IngestError::EmptyDocument.into());
        }

        *state = IngestState::Chunking;
        let hierarchical = request
            .hierarchical
            .unwrap_or(self.config.use_hierarchical_ingest);
        let chunker = HierarchicalChunker::new(&self.config);
        let chunks = if hierarchical {
            chunker.chunk(&markdown)
        } else {
            chunker.chunk_flat(&markdown)
        };
        if chunks.is_empty() {
            return Err(IngestError::NoChunks.into());
        }

        *state = IngestState::Embedding;
        let texts: Vec<String> = chunks
            .children
            .iter()
            .map(|child| child.content.clone())
            .collect();
        let embeddings = ctx
            .with_deadline(self.embedder.embed_documents(&texts))
            .await?;

        // I3 holds before anything touches either store
        let expected = self.vectors.dimension();
        for embedding in &embeddings {
            if embedding.len() != expected {
                return Err(EmbeddingError::InvalidDimension {
                    expected,
                    actual: embedding.len(),
                }
                .into());
            }
        }

        *state = IngestState::Persisting;
        let department_id = self
            .metadata
            .department_id_by_name(&request.department)
            .await?
            .ok_or_else(|| {
                SentinelError::NotFound(format!("department {}", request.department))
            })?;
        let doc = NewDocument {
            title: request.title.clone(),
            description: request.description.clone(),
            filename: request.filename.clone(),
            uploaded_by: ctx.user_id().unwrap_or_default(),
            department_id,
            classification: request.classification,
        };

        let saved = ctx
            .with_deadline(self.metadata.save_hierarchical(
                &doc,
                &chunks.parents,
                &chunks.children,
                &chunks.edges,
            ))
            .await?;

        // Vectors strictly after the metadata commit; a failure here rolls
        // everything back
        if let Err(reason) = self
            .write_vectors(ctx, request, &chunks, &embeddings, &saved)
            .await
        {
            warn!(doc_id = %saved.doc_id, error = %reason, "vector write failed; compensating");
            if let Err(e) = self.vectors.delete_by_doc(saved.doc_id).await {
                error!(doc_id = %saved.doc_id, error = %e, "compensation: vector delete failed");
            }
            if let Err(e) = self.metadata.delete_document(saved.doc_id).await {
                error!(doc_id = %saved.doc_id, error = %e, "compensation: document delete failed");
            }
            return Err(IngestError::Compensated {
                doc_id: saved.doc_id,
                reason: reason.to_string(),
            }
            .into());
        }

        *state = IngestState::Committed;
        let outcome = self.audit_success(ctx, request, &chunks, &saved).await;

        Ok(IngestReceipt {
            doc_id: saved.doc_id,
            parent_chunks: chunks.parents.len(),
            child_chunks: chunks.children.len(),
            outcome,
        })
    }

    async fn write_vectors(
        &self,
        ctx: &RequestContext,
        request: &IngestRequest,
        chunks: &ChunkSet,
        embeddings: &[Vec<f32>],
        saved: &SavedHierarchy,
    ) -> Result<()> {
        // child index -> parent chunk id, from the edge list
        let mut parent_of: Vec<Option<Uuid>> = vec![None; chunks.children.len()];
        for (child_idx, parent_idx) in &chunks.edges {
            parent_of[*child_idx] = saved.parent_ids.get(*parent_idx).copied();
        }

        let parent_points: Vec<ParentPoint> = chunks
            .parents
            .iter()
            .zip(&saved.parent_ids)
            .enumerate()
            .map(|(idx, (segment, chunk_id))| ParentPoint {
                chunk_id: *chunk_id,
                chunk_index: idx as i64,
                page: segment.page as i64,
                content: segment.content.clone(),
            })
            .collect();

        let child_points: Vec<ChildPoint> = chunks
            .children
            .iter()
            .zip(&saved.child_ids)
            .zip(embeddings)
            .enumerate()
            .map(|(idx, ((segment, chunk_id), embedding))| ChildPoint {
                chunk_id: *chunk_id,
                parent_chunk_id: parent_of[idx],
                chunk_index: idx as i64,
                page: segment.page as i64,
                content: segment.content.clone(),
                embedding: embedding.clone(),
            })
            .collect();

        ctx.with_deadline(self.vectors.upsert_parents(
            saved.doc_id,
            request.department.clone(),
            request.classification,
            parent_points,
        ))
        .await?;
        ctx.with_deadline(self.vectors.upsert_children(
            saved.doc_id,
            request.department.clone(),
            request.classification,
            child_points,
        ))
        .await?;
        Ok(())
    }

    async fn audit_success(
        &self,
        ctx: &RequestContext,
        request: &IngestRequest,
        chunks: &ChunkSet,
        saved: &SavedHierarchy,
    ) -> EventOutcome {
        let mut event = AuditEvent::new(
            EventCategory::Modification,
            "document_upload",
            AuditAction::Write,
            EventOutcome::Success,
        )
        .with_classification(request.classification);
        ctx.stamp(&mut event);
        event.resource_type = Some(ResourceType::Document);
        event.resource_id = Some(saved.doc_id);
        event.resource_name = Some(request.title.clone());
        event.department_name = Some(request.department.clone());
        event.metadata = Some(serde_json::json!({
            "filename": request.filename,
            "parent_chunks": chunks.parents.len(),
            "child_chunks": chunks.children.len(),
        }));

        match self.audit.log(event).await {
            Ok(log_id) => {
                let modification = ModificationAuditEvent {
                    user_id: ctx.user_id(),
                    table_name: "documents".to_string(),
                    record_id: saved.doc_id,
                    operation: "INSERT".to_string(),
                    old_values: None,
                    new_values: Some(serde_json::json!({
                        "title": request.title,
                        "filename": request.filename,
                        "department": request.department,
                        "classification": request.classification.as_str(),
                    })),
                    changed_fields: Vec::new(),
                    reason: None,
                    approved_by: None,
                    metadata: None,
                };
                if self.audit.log_modification(log_id, modification).await.is_err() {
                    EventOutcome::Partial
                } else {
                    EventOutcome::Success
                }
            }
            Err(e) => {
                warn!(error = %e, "ingestion committed but audit enqueue failed");
                EventOutcome::Partial
            }
        }
    }

    async fn audit_failure(
        &self,
        ctx: &RequestContext,
        request: &IngestRequest,
        state: IngestState,
        err: &SentinelError,
    ) {
        let mut event = AuditEvent::new(
            EventCategory::Modification,
            "document_upload",
            AuditAction::Write,
            EventOutcome::Failure,
        )
        .with_classification(request.classification);
        ctx.stamp(&mut event);
        event.resource_type = Some(ResourceType::Document);
        event.resource_name = Some(request.title.clone());
        event.department_name = Some(request.department.clone());
        event.error_message = Some(match err {
            SentinelError::Deadline => "deadline".to_string(),
            other => other.to_string(),
        });
        event.metadata = Some(serde_json::json!({
            "state": state.as_str(),
            "filename": request.filename,
        }));

        if let Err(e) = self.audit.log(event).await {
            warn!(error = %e, "failed to audit ingestion failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditSink;
    use crate::auth::Principal;
    use crate::config::{
        AuditConfig, MetadataStoreConfig, TenantConfig, VectorStoreConfig,
    };
    use crate::embedding::FakeProvider;
    use crate::error::VectorError;
    use crate::store::vector::MockVectorIndex;
    use crate::store::VectorStore;
    use std::time::Duration;

    const DIM: usize = 64;

    async fn metadata_store() -> Arc<MetadataStore> {
        let config = MetadataStoreConfig {
            database_url: "sqlite::memory:".to_string(),
            ..MetadataStoreConfig::default()
        };
        let store = MetadataStore::connect(&config, &TenantConfig::default())
            .await
            .unwrap();
        store.create_department("engineering").await.unwrap();
        Arc::new(store)
    }

    async fn vector_store() -> Arc<VectorStore> {
        let config = VectorStoreConfig {
            database_url: "sqlite::memory:".to_string(),
            ..VectorStoreConfig::default()
        };
        Arc::new(VectorStore::connect(&config, DIM).await.unwrap())
    }

    async fn audit_sink() -> Arc<AuditSink> {
        let config = AuditConfig {
            database_url: "sqlite::memory:".to_string(),
            workers: 1,
            ..AuditConfig::default()
        };
        Arc::new(AuditSink::connect(&config).await.unwrap())
    }

    fn coordinator(
        metadata: Arc<MetadataStore>,
        vectors: Arc<dyn VectorIndex>,
        audit: Arc<AuditSink>,
    ) -> IngestionCoordinator {
        IngestionCoordinator::new(
            Arc::new(DocumentParser::new()),
            Arc::new(FakeProvider::new(DIM)),
            metadata,
            vectors,
            audit,
            RetrievalConfig {
                parent_chunk_size: 300,
                parent_chunk_overlap: 30,
                child_chunk_size: 100,
                child_chunk_overlap: 10,
                ..RetrievalConfig::default()
            },
        )
    }

    async fn ctx(metadata: &MetadataStore) -> RequestContext {
        let user_id = metadata
            .create_user("uploader@example.com", None)
            .await
            .unwrap();
        RequestContext::new(Duration::from_secs(30)).with_principal(Principal {
            user_id,
            email: "uploader@example.com".to_string(),
            tenant_id: "tenant-default".to_string(),
            role: "engineer".to_string(),
            department: "engineering".to_string(),
        })
    }

    fn request(content: &str) -> IngestRequest {
        IngestRequest {
            filename: "policy.md".to_string(),
            bytes: content.as_bytes().to_vec(),
            title: "Policy".to_string(),
            description: "Company policy".to_string(),
            department: "engineering".to_string(),
            classification: Classification::Internal,
            hierarchical: None,
        }
    }

    #[tokio::test]
    async fn test_hierarchical_ingest_commits() {
        let metadata = metadata_store().await;
        let vectors = vector_store().await;
        let audit = audit_sink().await;
        let coordinator = coordinator(metadata.clone(), vectors.clone(), audit.clone());
        let ctx = ctx(&metadata).await;

        let content =
            "# Handbook\n\n## Dress code\n".to_string() + &"The dress code is business casual. ".repeat(20);
        let receipt = coordinator.ingest(&ctx, request(&content)).await.unwrap();
        assert!(receipt.parent_chunks >= 1);
        assert!(receipt.child_chunks >= receipt.parent_chunks);
        assert_eq!(receipt.outcome, EventOutcome::Success);

        // Both stores saw the document
        let uploads = metadata
            .get_documents_by_uploader(ctx.user_id().unwrap())
            .await
            .unwrap();
        assert_eq!(uploads.len(), 1);
        let info = vectors.collection_info().await.unwrap();
        assert_eq!(info.child_points, receipt.child_chunks);
        assert_eq!(info.parent_points, receipt.parent_chunks);

        // P3: a success audit event matching the upload exists
        audit.flush().await;
        let events = audit.recent_events(10).await.unwrap();
        let upload = events
            .iter()
            .find(|e| e.event_type == "document_upload")
            .unwrap();
        assert_eq!(upload.outcome, "success");
        assert_eq!(upload.resource_id, Some(receipt.doc_id));
        assert_eq!(upload.user_id, ctx.user_id());
    }

    #[tokio::test]
    async fn test_flat_ingest_has_no_parents() {
        let metadata = metadata_store().await;
        let vectors = vector_store().await;
        let coordinator = coordinator(metadata.clone(), vectors.clone(), audit_sink().await);
        let ctx = ctx(&metadata).await;

        let mut req = request(&"Plain prose with no headers at all. ".repeat(20));
        req.hierarchical = Some(false);
        let receipt = coordinator.ingest(&ctx, req).await.unwrap();
        assert_eq!(receipt.parent_chunks, 0);
        assert!(receipt.child_chunks > 0);
    }

    #[tokio::test]
    async fn test_unsupported_format_audits_failure() {
        let metadata = metadata_store().await;
        let audit = audit_sink().await;
        let coordinator = coordinator(metadata.clone(), vector_store().await, audit.clone());
        let ctx = ctx(&metadata).await;

        let mut req = request("irrelevant");
        req.filename = "binary.exe".to_string();
        let err = coordinator.ingest(&ctx, req).await.unwrap_err();
        assert_eq!(err.kind().status(), 422);

        // P4: failure event with a non-empty message and the failing state
        audit.flush().await;
        let events = audit.recent_events(10).await.unwrap();
        let failure = events
            .iter()
            .find(|e| e.event_type == "document_upload")
            .unwrap();
        assert_eq!(failure.outcome, "failure");
        assert!(failure.error_message.as_deref().unwrap_or("").len() > 0);
        assert_eq!(
            failure.metadata.as_ref().unwrap()["state"],
            serde_json::json!("parsing")
        );
    }

    #[tokio::test]
    async fn test_vector_failure_compensates() {
        let metadata = metadata_store().await;
        let audit = audit_sink().await;

        let mut mock = MockVectorIndex::new();
        mock.expect_dimension().return_const(DIM);
        mock.expect_upsert_parents().returning(|_, _, _, _| Ok(0));
        mock.expect_upsert_children().returning(|_, _, _, _| {
            Err(VectorError::UpsertFailed("store down".to_string()).into())
        });
        // Compensation must delete the vectors it may have written
        mock.expect_delete_by_doc().times(1).returning(|_| Ok(()));

        let coordinator = coordinator(metadata.clone(), Arc::new(mock), audit.clone());
        let ctx = ctx(&metadata).await;

        let err = coordinator
            .ingest(&ctx, request(&"Some document body. ".repeat(30)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SentinelError::Ingest(IngestError::Compensated { .. })
        ));
        assert_eq!(err.kind().status(), 503);

        // The document is gone from the metadata store
        let uploads = metadata
            .get_documents_by_uploader(ctx.user_id().unwrap())
            .await
            .unwrap();
        assert!(uploads.is_empty());

        audit.flush().await;
        let events = audit.recent_events(10).await.unwrap();
        assert!(events.iter().any(|e| e.outcome == "failure"));
    }

    #[tokio::test]
    async fn test_unauthenticated_is_rejected() {
        let metadata = metadata_store().await;
        let coordinator = coordinator(metadata.clone(), vector_store().await, audit_sink().await);
        let ctx = RequestContext::new(Duration::from_secs(5));
        let err = coordinator.ingest(&ctx, request("text")).await.unwrap_err();
        assert_eq!(err.kind().status(), 401);
    }

    #[tokio::test]
    async fn test_unknown_department_is_not_found() {
        let metadata = metadata_store().await;
        let coordinator = coordinator(metadata.clone(), vector_store().await, audit_sink().await);
        let ctx = ctx(&metadata).await;

        let mut req = request(&"Body text for the document. ".repeat(10));
        req.department = "marketing".to_string();
        let err = coordinator.ingest(&ctx, req).await.unwrap_err();
        assert_eq!(err.kind().status(), 404);
    }
}
