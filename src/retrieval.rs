//! Retrieval coordinator
//!
//! Resolves the caller's RBAC filters, embeds the question, searches the
//! vector store, optionally widens child hits to their parent chunks, and
//! redacts PII before anything leaves the service. An empty filter set is a
//! deny-all: the vector store is never consulted. Redaction failures fail
//! the query; returning unredacted text is never an option.

use crate::audit::{
    AuditAction, AuditEvent, AuditSink, EventCategory, EventOutcome, QueryAuditEvent,
};
use crate::config::RetrievalConfig;
use crate::context::RequestContext;
use crate::embedding::EmbeddingProvider;
use crate::error::{AuthError, QueryError, Result, SentinelError};
use crate::model::Classification;
use crate::rbac::RbacResolver;
use crate::redact::RedactionPool;
use crate::store::{MetadataStore, VectorSearch};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One retrieval request
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub question: String,
    pub k: Option<usize>,
    pub expand_parents: Option<bool>,
}

/// Chunk metadata returned alongside the content
#[derive(Debug, Clone, serde::Serialize)]
pub struct ChunkMetadata {
    pub chunk_id: Uuid,
    pub doc_id: Uuid,
    pub chunk_index: i64,
    pub department: String,
    pub classification: Classification,
    pub parent_chunk_id: Option<Uuid>,
}

/// A redacted, scored result
#[derive(Debug, Clone, serde::Serialize)]
pub struct RetrievedChunk {
    pub content: String,
    pub score: f32,
    pub metadata: ChunkMetadata,
}

/// Query response plus the audit outcome the caller should report
#[derive(Debug, Clone)]
pub struct QueryResponse {
    pub results: Vec<RetrievedChunk>,
    pub outcome: EventOutcome,
}

struct Timings {
    embedding_ms: f64,
    search_ms: f64,
    started: Instant,
}

pub struct RetrievalCoordinator {
    resolver: Arc<RbacResolver>,
    embedder: Arc<dyn EmbeddingProvider>,
    metadata: Arc<MetadataStore>,
    vectors: Arc<dyn VectorSearch>,
    redactor: Arc<RedactionPool>,
    audit: Arc<AuditSink>,
    config: RetrievalConfig,
}

impl RetrievalCoordinator {
    pub fn new(
        resolver: Arc<RbacResolver>,
        embedder: Arc<dyn EmbeddingProvider>,
        metadata: Arc<MetadataStore>,
        vectors: Arc<dyn VectorSearch>,
        redactor: Arc<RedactionPool>,
        audit: Arc<AuditSink>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            resolver,
            embedder,
            metadata,
            vectors,
            redactor,
            audit,
            config,
        }
    }

    /// Run a query for the authenticated principal
    pub async fn query(
        &self,
        ctx: &RequestContext,
        request: QueryRequest,
    ) -> Result<QueryResponse> {
        let Some(user_id) = ctx.user_id() else {
            return Err(AuthError::NotAuthenticated.into());
        };

        match self.run(ctx, &request, user_id).await {
            Ok(response) => Ok(response),
            Err(err) => {
                self.audit_failure(ctx, &request, &err).await;
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        ctx: &RequestContext,
        request: &QueryRequest,
        user_id: Uuid,
    ) -> Result<QueryResponse> {
        let mut timings = Timings {
            embedding_ms: 0.0,
            search_ms: 0.0,
            started: Instant::now(),
        };

        let filters = ctx
            .with_deadline(self.resolver.filters_for(&self.metadata, user_id))
            .await?;

        // Deny-all short-circuit: no grants, no search
        if filters.is_empty() {
            debug!(%user_id, "user resolves to an empty access set");
            let outcome = self
                .audit_query(ctx, request, &filters, &[], false, &[], &timings)
                .await;
            return Ok(QueryResponse {
                results: Vec::new(),
                outcome,
            });
        }

        let embed_start = Instant::now();
        let query_vec = ctx
            .with_deadline(self.embedder.embed_query(&request.question))
            .await
            .map_err(wrap_embedding_error)?;
        timings.embedding_ms = embed_start.elapsed().as_secs_f64() * 1000.0;

        let k = request.k.unwrap_or(self.config.max_retrieved_docs);
        let expand = request
            .expand_parents
            .unwrap_or(self.config.use_parent_retrieval);
        let threshold = self.config.similarity_threshold;

        let search_start = Instant::now();
        let hits = if expand {
            self.expanded_hits(ctx, query_vec, &filters, k, threshold)
                .await?
        } else {
            ctx.with_deadline(self.vectors.search(
                query_vec,
                filters.clone(),
                k,
                threshold,
            ))
            .await
            .map_err(wrap_search_error)?
            .into_iter()
            .map(|hit| RetrievedChunk {
                content: hit.content,
                score: hit.score,
                metadata: ChunkMetadata {
                    chunk_id: hit.chunk_id,
                    doc_id: hit.doc_id,
                    chunk_index: hit.chunk_index,
                    department: hit.department,
                    classification: hit.classification,
                    parent_chunk_id: hit.parent_chunk_id,
                },
            })
            .collect()
        };
        timings.search_ms = search_start.elapsed().as_secs_f64() * 1000.0;

        // Redaction failures abort the query; nothing unredacted leaves
        let contents: Vec<String> = hits.iter().map(|hit| hit.content.clone()).collect();
        let redacted = self
            .redactor
            .redact(&contents)
            .await
            .map_err(|e| SentinelError::from(QueryError::RedactionFailed(e.to_string())))?;

        let mut pii_types: BTreeSet<String> = BTreeSet::new();
        for item in &redacted {
            pii_types.extend(item.pii_types.iter().cloned());
        }
        let pii_types: Vec<String> = pii_types.into_iter().collect();

        let results: Vec<RetrievedChunk> = hits
            .into_iter()
            .zip(redacted)
            .map(|(mut hit, clean)| {
                hit.content = clean.text;
                hit
            })
            .collect();

        let outcome = self
            .audit_query(ctx, request, &filters, &results, expand, &pii_types, &timings)
            .await;

        info!(
            %user_id,
            results = results.len(),
            expand,
            "query complete"
        );
        Ok(QueryResponse { results, outcome })
    }

    /// Parent expansion: aggregate child hits per parent, then bulk-read the
    /// parent content from the metadata store
    async fn expanded_hits(
        &self,
        ctx: &RequestContext,
        query_vec: Vec<f32>,
        filters: &[(String, Classification)],
        k: usize,
        threshold: f32,
    ) -> Result<Vec<RetrievedChunk>> {
        let parent_hits = ctx
            .with_deadline(self.vectors.search_with_parent_expansion(
                query_vec,
                filters.to_vec(),
                k,
                threshold,
            ))
            .await
            .map_err(wrap_search_error)?;

        let parent_ids: Vec<Uuid> = parent_hits.iter().map(|hit| hit.parent_chunk_id).collect();
        let parents = ctx
            .with_deadline(self.metadata.get_parents_by_id(&parent_ids))
            .await?;

        let mut results = Vec::with_capacity(parent_hits.len());
        for hit in parent_hits {
            let Some(parent) = parents.iter().find(|p| p.chunk_id == hit.parent_chunk_id)
            else {
                warn!(parent_id = %hit.parent_chunk_id, "parent chunk missing from metadata store");
                continue;
            };
            results.push(RetrievedChunk {
                content: parent.content.clone(),
                score: hit.best_child_score,
                metadata: ChunkMetadata {
                    chunk_id: parent.chunk_id,
                    doc_id: parent.doc_id,
                    chunk_index: parent.chunk_index,
                    department: hit.department,
                    classification: hit.classification,
                    parent_chunk_id: None,
                },
            });
        }

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.metadata.doc_id.cmp(&b.metadata.doc_id))
                .then_with(|| a.metadata.chunk_index.cmp(&b.metadata.chunk_index))
        });
        Ok(results)
    }

    #[allow(clippy::too_many_arguments)]
    async fn audit_query(
        &self,
        ctx: &RequestContext,
        request: &QueryRequest,
        filters: &[(String, Classification)],
        results: &[RetrievedChunk],
        expand: bool,
        pii_types: &[String],
        timings: &Timings,
    ) -> EventOutcome {
        let mut event = AuditEvent::new(
            EventCategory::DataAccess,
            "rag_query",
            AuditAction::Read,
            EventOutcome::Success,
        );
        ctx.stamp(&mut event);
        event.query_text = Some(request.question.clone());
        event.pii_accessed = !pii_types.is_empty();
        event.pii_types = pii_types.to_vec();
        event.data_redacted = !pii_types.is_empty();
        event.metadata = Some(serde_json::json!({
            "chunks_retrieved": results.len(),
            "expand_parents": expand,
        }));

        let documents: BTreeSet<Uuid> = results.iter().map(|r| r.metadata.doc_id).collect();
        let query_event = QueryAuditEvent {
            user_id: ctx.user_id(),
            query_text: request.question.clone(),
            chunks_retrieved: results.len() as i64,
            chunks_accessed: results.iter().map(|r| r.metadata.chunk_id).collect(),
            documents_accessed: documents.into_iter().collect(),
            embedding_time_ms: timings.embedding_ms,
            vector_search_time_ms: timings.search_ms,
            total_response_time_ms: timings.started.elapsed().as_secs_f64() * 1000.0,
            filters_applied: Some(serde_json::json!(filters
                .iter()
                .map(|(department, classification)| {
                    serde_json::json!({
                        "department": department,
                        "classification": classification.as_str(),
                    })
                })
                .collect::<Vec<_>>())),
            metadata: None,
        };

        match self.audit.log(event).await {
            Ok(log_id) => {
                if self.audit.log_query(log_id, query_event).await.is_err() {
                    EventOutcome::Partial
                } else {
                    EventOutcome::Success
                }
            }
            Err(e) => {
                warn!(error = %e, "query succeeded but audit enqueue failed");
                EventOutcome::Partial
            }
        }
    }

    async fn audit_failure(&self, ctx: &RequestContext, request: &QueryRequest, err: &SentinelError) {
        let mut event = AuditEvent::new(
            EventCategory::DataAccess,
            "rag_query",
            AuditAction::Read,
            EventOutcome::Failure,
        );
        ctx.stamp(&mut event);
        event.query_text = Some(request.question.clone());
        event.error_message = Some(match err {
            SentinelError::Deadline => "deadline".to_string(),
            other => other.to_string(),
        });

        if let Err(e) = self.audit.log(event).await {
            warn!(error = %e, "failed to audit query failure");
        }
    }
}

fn wrap_embedding_error(err: SentinelError) -> SentinelError {
    match err {
        SentinelError::Deadline => SentinelError::Deadline,
        other => QueryError::QueryEmbedding(other.to_string()).into(),
    }
}

fn wrap_search_error(err: SentinelError) -> SentinelError {
    match err {
        SentinelError::Deadline => SentinelError::Deadline,
        other => QueryError::Search(other.to_string()).into(),
    }
}
