//! End-to-end pipeline tests: ingest documents through the coordinator and
//! query them back under RBAC, PII redaction and audit.

use sentinel::audit::AuditSink;
use sentinel::auth::Principal;
use sentinel::config::{
    AuditConfig, MetadataStoreConfig, RbacConfig, RetrievalConfig, TenantConfig,
    VectorStoreConfig,
};
use sentinel::context::RequestContext;
use sentinel::embedding::{EmbeddingProvider, FakeProvider};
use sentinel::error::{IngestError, SentinelError};
use sentinel::ingest::{IngestRequest, IngestionCoordinator};
use sentinel::model::Classification;
use sentinel::parser::DocumentParser;
use sentinel::rbac::RbacResolver;
use sentinel::redact::RedactionPool;
use sentinel::retrieval::{QueryRequest, RetrievalCoordinator};
use sentinel::store::{
    ChildPoint, MetadataStore, ParentPoint, VectorIndex, VectorStore,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const DIM: usize = 256;

struct Harness {
    metadata: Arc<MetadataStore>,
    vectors: Arc<VectorStore>,
    audit: Arc<AuditSink>,
    embedder: Arc<FakeProvider>,
    resolver: Arc<RbacResolver>,
    retrieval_config: RetrievalConfig,
}

impl Harness {
    async fn new() -> Self {
        let metadata = Arc::new(
            MetadataStore::connect(
                &MetadataStoreConfig {
                    database_url: "sqlite::memory:".to_string(),
                    ..MetadataStoreConfig::default()
                },
                &TenantConfig::default(),
            )
            .await
            .unwrap(),
        );

        let rbac = Self::rbac_config();
        sentinel::seed::seed_initial_data(&metadata, &rbac).await.unwrap();

        let vectors = Arc::new(
            VectorStore::connect(
                &VectorStoreConfig {
                    database_url: "sqlite::memory:".to_string(),
                    ..VectorStoreConfig::default()
                },
                DIM,
            )
            .await
            .unwrap(),
        );

        let audit = Arc::new(
            AuditSink::connect(&AuditConfig {
                database_url: "sqlite::memory:".to_string(),
                workers: 1,
                ..AuditConfig::default()
            })
            .await
            .unwrap(),
        );

        Self {
            metadata,
            vectors,
            audit,
            embedder: Arc::new(FakeProvider::new(DIM)),
            resolver: Arc::new(RbacResolver::new(&rbac)),
            retrieval_config: RetrievalConfig {
                similarity_threshold: 0.05,
                use_parent_retrieval: false,
                ..RetrievalConfig::default()
            },
        }
    }

    fn rbac_config() -> RbacConfig {
        RbacConfig {
            departments: vec!["engineering".to_string(), "finance".to_string()],
            roles: HashMap::from([
                ("engineering".to_string(), vec!["engineer".to_string()]),
                ("finance".to_string(), vec!["analyst".to_string()]),
            ]),
            access_matrix: HashMap::from([
                (
                    "internal".to_string(),
                    HashMap::from([(
                        "engineering".to_string(),
                        vec!["engineer".to_string()],
                    )]),
                ),
                (
                    "public".to_string(),
                    HashMap::from([
                        ("engineering".to_string(), vec!["engineer".to_string()]),
                        ("finance".to_string(), vec!["analyst".to_string()]),
                    ]),
                ),
            ]),
        }
    }

    fn ingestion(&self) -> IngestionCoordinator {
        IngestionCoordinator::new(
            Arc::new(DocumentParser::new()),
            self.embedder.clone(),
            self.metadata.clone(),
            self.vectors.clone(),
            self.audit.clone(),
            self.retrieval_config.clone(),
        )
    }

    fn ingestion_with_vectors(&self, vectors: Arc<dyn VectorIndex>) -> IngestionCoordinator {
        IngestionCoordinator::new(
            Arc::new(DocumentParser::new()),
            self.embedder.clone(),
            self.metadata.clone(),
            vectors,
            self.audit.clone(),
            self.retrieval_config.clone(),
        )
    }

    fn retrieval(&self) -> RetrievalCoordinator {
        RetrievalCoordinator::new(
            self.resolver.clone(),
            self.embedder.clone(),
            self.metadata.clone(),
            self.vectors.clone(),
            Arc::new(RedactionPool::with_workers(2)),
            self.audit.clone(),
            self.retrieval_config.clone(),
        )
    }

    async fn user(&self, email: &str, grants: &[(&str, &str)]) -> RequestContext {
        let user_id = self.metadata.create_user(email, None).await.unwrap();
        for (department, role) in grants {
            self.metadata
                .assign_role(user_id, department, role)
                .await
                .unwrap();
        }
        let (department, role) = grants
            .first()
            .map(|(d, r)| (d.to_string(), r.to_string()))
            .unwrap_or_default();
        RequestContext::new(Duration::from_secs(30)).with_principal(Principal {
            user_id,
            email: email.to_string(),
            tenant_id: "tenant-default".to_string(),
            role,
            department,
        })
    }

    fn upload(filename: &str, content: &str, classification: Classification) -> IngestRequest {
        IngestRequest {
            filename: filename.to_string(),
            bytes: content.as_bytes().to_vec(),
            title: filename.to_string(),
            description: String::new(),
            department: "engineering".to_string(),
            classification,
            hierarchical: None,
        }
    }
}

#[tokio::test]
async fn happy_path_query_returns_the_matching_sentence() {
    let harness = Harness::new().await;
    let uploader = harness.user("uploader@example.com", &[("engineering", "engineer")]).await;

    let content = "# Employee Handbook\n\n## Attire\nThe dress code is business casual.\n\n\
                   ## Hours\nCore hours are ten to four.";
    harness
        .ingestion()
        .ingest(
            &uploader,
            Harness::upload("handbook.md", content, Classification::Internal),
        )
        .await
        .unwrap();

    let engineer = harness.user("engineer@example.com", &[("engineering", "engineer")]).await;
    let response = harness
        .retrieval()
        .query(
            &engineer,
            QueryRequest {
                question: "dress code".to_string(),
                k: Some(3),
                expand_parents: Some(false),
            },
        )
        .await
        .unwrap();

    assert!(!response.results.is_empty());
    let top = &response.results[0];
    assert!(top.content.contains("The dress code is business casual."));
    assert_eq!(top.metadata.department, "engineering");
    assert_eq!(top.metadata.classification, Classification::Internal);
}

#[tokio::test]
async fn rbac_denial_returns_empty_and_audits_a_zero_hit_query() {
    let harness = Harness::new().await;
    let uploader = harness.user("owner@example.com", &[("engineering", "engineer")]).await;

    let content = "## Attire\nThe dress code is business casual.";
    harness
        .ingestion()
        .ingest(
            &uploader,
            Harness::upload("handbook.md", content, Classification::Internal),
        )
        .await
        .unwrap();

    // The analyst can see public finance documents only; the internal
    // engineering document is out of reach
    let analyst = harness.user("analyst@example.com", &[("finance", "analyst")]).await;
    let response = harness
        .retrieval()
        .query(
            &analyst,
            QueryRequest {
                question: "dress code".to_string(),
                k: Some(3),
                expand_parents: Some(false),
            },
        )
        .await
        .unwrap();
    assert!(response.results.is_empty());

    harness.audit.flush().await;
    let events = harness.audit.recent_events(50).await.unwrap();
    let denials: Vec<_> = events
        .iter()
        .filter(|e| {
            e.event_type == "rag_query" && e.user_id == analyst.user_id()
        })
        .collect();
    assert_eq!(denials.len(), 1);
    assert_eq!(denials[0].category, "data_access");
    assert_eq!(denials[0].outcome, "success");
    assert_eq!(
        denials[0].metadata.as_ref().unwrap()["chunks_retrieved"],
        serde_json::json!(0)
    );
}

#[tokio::test]
async fn pii_is_replaced_with_typed_tags_and_audited() {
    let harness = Harness::new().await;
    let uploader = harness.user("hr@example.com", &[("engineering", "engineer")]).await;

    let content = "## Contacts\nContact John Doe at john@example.com for onboarding help.";
    harness
        .ingestion()
        .ingest(
            &uploader,
            Harness::upload("contacts.md", content, Classification::Internal),
        )
        .await
        .unwrap();

    let engineer = harness.user("reader@example.com", &[("engineering", "engineer")]).await;
    let response = harness
        .retrieval()
        .query(
            &engineer,
            QueryRequest {
                question: "who do I contact for onboarding".to_string(),
                k: Some(3),
                expand_parents: Some(false),
            },
        )
        .await
        .unwrap();

    let top = &response.results[0];
    assert!(top.content.contains("<PERSON>"));
    assert!(top.content.contains("<EMAIL>"));
    assert!(!top.content.contains("john@example.com"));

    harness.audit.flush().await;
    let events = harness.audit.recent_events(50).await.unwrap();
    let query_event = events
        .iter()
        .find(|e| e.event_type == "rag_query" && e.user_id == engineer.user_id())
        .unwrap();
    assert!(query_event.pii_accessed);
    assert!(query_event.data_redacted);
    assert!(query_event.pii_types.contains(&"EMAIL".to_string()));
    assert!(query_event.pii_types.contains(&"PERSON".to_string()));
}

#[tokio::test]
async fn parent_expansion_returns_wider_context_containing_the_match() {
    let harness = Harness::new().await;
    let uploader = harness.user("author@example.com", &[("engineering", "engineer")]).await;

    // A long structured section so parents are materially larger than
    // children (child budget 400, parent budget 2000)
    let filler = "Procedures for office conduct are reviewed annually by the operations team. "
        .repeat(18);
    let content = format!(
        "# Handbook\n\n## Attire\n{}The dress code is business casual.\n{}",
        filler, filler
    );
    harness
        .ingestion()
        .ingest(
            &uploader,
            Harness::upload("handbook.md", &content, Classification::Internal),
        )
        .await
        .unwrap();

    let engineer = harness.user("wide@example.com", &[("engineering", "engineer")]).await;
    let response = harness
        .retrieval()
        .query(
            &engineer,
            QueryRequest {
                question: "dress code business casual".to_string(),
                k: Some(3),
                expand_parents: Some(true),
            },
        )
        .await
        .unwrap();

    assert!(!response.results.is_empty());
    assert!(response.results.len() <= 3);
    let config = RetrievalConfig::default();
    let best = response
        .results
        .iter()
        .find(|r| r.content.contains("The dress code is business casual."))
        .expect("some parent contains the matching child text");
    assert!(best.content.len() >= config.child_chunk_size);
    assert!(best.content.len() <= config.parent_chunk_size + config.parent_chunk_overlap);
}

#[tokio::test]
async fn every_indexed_child_has_a_parent_row_after_hierarchical_ingest() {
    let harness = Harness::new().await;
    let uploader = harness.user("p2@example.com", &[("engineering", "engineer")]).await;

    let content = "# Guide\n\n## One\n".to_string()
        + &"Section one content sentence. ".repeat(40)
        + "\n\n## Two\n"
        + &"Section two content sentence. ".repeat(40);
    harness
        .ingestion()
        .ingest(
            &uploader,
            Harness::upload("guide.md", &content, Classification::Internal),
        )
        .await
        .unwrap();

    // Pull every child back out via an unfiltered-by-score search
    let probe = harness.embedder.embed_query("content sentence").await.unwrap();
    let children = harness
        .vectors
        .search(
            &probe,
            &[("engineering".to_string(), Classification::Internal)],
            1000,
            -1.0,
        )
        .await
        .unwrap();
    assert!(!children.is_empty());

    let parent_ids: Vec<Uuid> = children
        .iter()
        .map(|c| c.parent_chunk_id.expect("hierarchical child has a parent"))
        .collect();
    let mut unique = parent_ids.clone();
    unique.sort();
    unique.dedup();

    let parents = harness.metadata.get_parents_by_id(&unique).await.unwrap();
    assert_eq!(parents.len(), unique.len());
}

/// Delegates to a real store but fails child upserts, which happen after the
/// metadata commit
struct FailingVectorStore {
    inner: Arc<VectorStore>,
}

#[async_trait::async_trait]
impl VectorIndex for FailingVectorStore {
    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    async fn upsert_parents(
        &self,
        doc_id: Uuid,
        department: String,
        classification: Classification,
        points: Vec<ParentPoint>,
    ) -> sentinel::error::Result<usize> {
        VectorStore::upsert_parents(&self.inner, doc_id, &department, classification, &points)
            .await
    }

    async fn upsert_children(
        &self,
        _doc_id: Uuid,
        _department: String,
        _classification: Classification,
        _points: Vec<ChildPoint>,
    ) -> sentinel::error::Result<usize> {
        Err(sentinel::error::VectorError::UpsertFailed("injected fault".to_string()).into())
    }

    async fn delete_by_doc(&self, doc_id: Uuid) -> sentinel::error::Result<()> {
        VectorStore::delete_by_doc(&self.inner, doc_id).await
    }
}

#[tokio::test]
async fn vector_store_fault_after_metadata_commit_is_fully_compensated() {
    let harness = Harness::new().await;
    let uploader = harness.user("faulty@example.com", &[("engineering", "engineer")]).await;

    let failing = Arc::new(FailingVectorStore {
        inner: harness.vectors.clone(),
    });
    let err = harness
        .ingestion_with_vectors(failing)
        .ingest(
            &uploader,
            Harness::upload(
                "doomed.md",
                &("## Doomed\n".to_string() + &"This write will not survive. ".repeat(30)),
                Classification::Internal,
            ),
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SentinelError::Ingest(IngestError::Compensated { .. })
    ));
    assert_eq!(err.kind().status(), 503);

    // Not visible via the uploader listing
    let uploads = harness
        .metadata
        .get_documents_by_uploader(uploader.user_id().unwrap())
        .await
        .unwrap();
    assert!(uploads.is_empty());

    // Not visible via any subsequent query
    let engineer = harness.user("checker@example.com", &[("engineering", "engineer")]).await;
    let response = harness
        .retrieval()
        .query(
            &engineer,
            QueryRequest {
                question: "this write will not survive".to_string(),
                k: Some(5),
                expand_parents: Some(false),
            },
        )
        .await
        .unwrap();
    assert!(response.results.is_empty());

    // And nothing lingers in either vector collection
    let info = harness.vectors.collection_info().await.unwrap();
    assert_eq!(info.child_points, 0);
    assert_eq!(info.parent_points, 0);
}

#[tokio::test]
async fn user_with_no_grants_gets_nothing_and_one_zero_hit_audit_event() {
    let harness = Harness::new().await;
    let uploader = harness.user("seed@example.com", &[("engineering", "engineer")]).await;
    harness
        .ingestion()
        .ingest(
            &uploader,
            Harness::upload(
                "visible.md",
                "## Visible\nVisible to engineers only.",
                Classification::Internal,
            ),
        )
        .await
        .unwrap();

    let nobody = harness.user("nobody@example.com", &[]).await;
    let response = harness
        .retrieval()
        .query(
            &nobody,
            QueryRequest {
                question: "visible to engineers".to_string(),
                k: None,
                expand_parents: None,
            },
        )
        .await
        .unwrap();
    assert!(response.results.is_empty());

    harness.audit.flush().await;
    let events = harness.audit.recent_events(50).await.unwrap();
    let theirs: Vec<_> = events
        .iter()
        .filter(|e| e.user_id == nobody.user_id() && e.event_type == "rag_query")
        .collect();
    assert_eq!(theirs.len(), 1);
    assert_eq!(
        theirs[0].metadata.as_ref().unwrap()["chunks_retrieved"],
        serde_json::json!(0)
    );
}

#[tokio::test]
async fn results_are_ordered_by_score_with_stable_ties() {
    let harness = Harness::new().await;
    let uploader = harness.user("rank@example.com", &[("engineering", "engineer")]).await;

    for name in ["a.md", "b.md", "c.md"] {
        harness
            .ingestion()
            .ingest(
                &uploader,
                Harness::upload(
                    name,
                    &format!(
                        "## Notes\nTravel policy allows economy flights. Extra detail for {}.",
                        name
                    ),
                    Classification::Internal,
                ),
            )
            .await
            .unwrap();
    }

    let engineer = harness.user("sorted@example.com", &[("engineering", "engineer")]).await;
    let response = harness
        .retrieval()
        .query(
            &engineer,
            QueryRequest {
                question: "travel policy economy flights".to_string(),
                k: Some(10),
                expand_parents: Some(false),
            },
        )
        .await
        .unwrap();

    assert!(response.results.len() >= 3);
    for window in response.results.windows(2) {
        let (a, b) = (&window[0], &window[1]);
        assert!(
            a.score > b.score
                || (a.score == b.score
                    && (a.metadata.doc_id, a.metadata.chunk_index)
                        <= (b.metadata.doc_id, b.metadata.chunk_index))
        );
    }
}
