//! Vector store over child-chunk embeddings
//!
//! Two collections: `child_points` carries embeddings and is what similarity
//! search scans; `parent_points` is content-only and exists so a document
//! can be deleted or inspected wholly within this store. RBAC filter columns
//! (`department`, `classification`) are indexed so filtered scans stay cheap.

use crate::config::VectorStoreConfig;
use crate::error::{Result, VectorError};
use crate::model::Classification;
use crate::store::{clamp_pool_for_memory, prepare_sqlite_url};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

/// A child chunk ready for indexing
#[derive(Debug, Clone)]
pub struct ChildPoint {
    pub chunk_id: Uuid,
    pub parent_chunk_id: Option<Uuid>,
    pub chunk_index: i64,
    pub page: i64,
    pub content: String,
    pub embedding: Vec<f32>,
}

/// A parent chunk stored content-only
#[derive(Debug, Clone)]
pub struct ParentPoint {
    pub chunk_id: Uuid,
    pub chunk_index: i64,
    pub page: i64,
    pub content: String,
}

/// A scored child hit
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub chunk_id: Uuid,
    pub doc_id: Uuid,
    pub content: String,
    pub score: f32,
    pub department: String,
    pub classification: Classification,
    pub parent_chunk_id: Option<Uuid>,
    pub chunk_index: i64,
    pub page: i64,
}

/// A parent reference aggregated from its best-scoring child
#[derive(Debug, Clone)]
pub struct ParentHit {
    pub parent_chunk_id: Uuid,
    pub doc_id: Uuid,
    pub best_child_score: f32,
    pub department: String,
    pub classification: Classification,
}

/// Point counts per collection
#[derive(Debug, Clone, serde::Serialize)]
pub struct CollectionInfo {
    pub child_points: usize,
    pub parent_points: usize,
}

/// The search operations the retrieval path depends on, split out so tests
/// can verify the deny-all short-circuit never reaches the store
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait VectorSearch: Send + Sync {
    async fn search(
        &self,
        query: Vec<f32>,
        filters: Vec<(String, Classification)>,
        k: usize,
        threshold: f32,
    ) -> Result<Vec<SearchHit>>;

    async fn search_with_parent_expansion(
        &self,
        query: Vec<f32>,
        filters: Vec<(String, Classification)>,
        k: usize,
        threshold: f32,
    ) -> Result<Vec<ParentHit>>;
}

/// The write operations the ingestion path depends on; a trait so fault
/// injection can exercise the compensation path
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait VectorIndex: Send + Sync {
    fn dimension(&self) -> usize;

    async fn upsert_parents(
        &self,
        doc_id: Uuid,
        department: String,
        classification: Classification,
        points: Vec<ParentPoint>,
    ) -> Result<usize>;

    async fn upsert_children(
        &self,
        doc_id: Uuid,
        department: String,
        classification: Classification,
        points: Vec<ChildPoint>,
    ) -> Result<usize>;

    async fn delete_by_doc(&self, doc_id: Uuid) -> Result<()>;
}

#[async_trait::async_trait]
impl VectorIndex for VectorStore {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn upsert_parents(
        &self,
        doc_id: Uuid,
        department: String,
        classification: Classification,
        points: Vec<ParentPoint>,
    ) -> Result<usize> {
        VectorStore::upsert_parents(self, doc_id, &department, classification, &points).await
    }

    async fn upsert_children(
        &self,
        doc_id: Uuid,
        department: String,
        classification: Classification,
        points: Vec<ChildPoint>,
    ) -> Result<usize> {
        VectorStore::upsert_children(self, doc_id, &department, classification, &points).await
    }

    async fn delete_by_doc(&self, doc_id: Uuid) -> Result<()> {
        VectorStore::delete_by_doc(self, doc_id).await
    }
}

#[async_trait::async_trait]
impl VectorSearch for VectorStore {
    async fn search(
        &self,
        query: Vec<f32>,
        filters: Vec<(String, Classification)>,
        k: usize,
        threshold: f32,
    ) -> Result<Vec<SearchHit>> {
        VectorStore::search(self, &query, &filters, k, threshold).await
    }

    async fn search_with_parent_expansion(
        &self,
        query: Vec<f32>,
        filters: Vec<(String, Classification)>,
        k: usize,
        threshold: f32,
    ) -> Result<Vec<ParentHit>> {
        VectorStore::search_with_parent_expansion(self, &query, &filters, k, threshold).await
    }
}

pub struct VectorStore {
    pool: SqlitePool,
    dimension: usize,
}

impl VectorStore {
    pub async fn connect(config: &VectorStoreConfig, dimension: usize) -> Result<Self> {
        let url = prepare_sqlite_url(&config.database_url)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(clamp_pool_for_memory(&config.database_url, config.max_pool_size))
            .connect(&url)
            .await?;

        let store = Self { pool, dimension };
        store.init_schema().await?;
        info!(dimension, "vector store initialized");
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS child_points (
                chunk_id TEXT PRIMARY KEY,
                doc_id TEXT NOT NULL,
                parent_chunk_id TEXT,
                department TEXT NOT NULL,
                classification TEXT NOT NULL,
                chunk_type TEXT NOT NULL DEFAULT 'child',
                chunk_index INTEGER NOT NULL,
                page INTEGER NOT NULL DEFAULT 0,
                content TEXT NOT NULL,
                embedding BLOB NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS parent_points (
                chunk_id TEXT PRIMARY KEY,
                doc_id TEXT NOT NULL,
                department TEXT NOT NULL,
                classification TEXT NOT NULL,
                chunk_type TEXT NOT NULL DEFAULT 'parent',
                chunk_index INTEGER NOT NULL,
                page INTEGER NOT NULL DEFAULT 0,
                content TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_child_doc ON child_points(doc_id)",
            "CREATE INDEX IF NOT EXISTS idx_child_filter ON child_points(department, classification)",
            "CREATE INDEX IF NOT EXISTS idx_parent_doc ON parent_points(doc_id)",
            "CREATE INDEX IF NOT EXISTS idx_parent_filter ON parent_points(department, classification)",
        ];
        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Calculate cosine similarity between two vectors
    pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() {
            return 0.0;
        }
        let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }
        dot_product / (norm_a * norm_b)
    }

    /// Serialize embedding for storage
    pub fn serialize_embedding(embedding: &[f32]) -> Vec<u8> {
        embedding
            .iter()
            .flat_map(|f| f.to_le_bytes().to_vec())
            .collect()
    }

    /// Deserialize embedding from storage
    pub fn deserialize_embedding(data: &[u8]) -> Vec<f32> {
        data.chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(VectorError::InvalidDimension {
                expected: self.dimension,
                actual: vector.len(),
            }
            .into());
        }
        Ok(())
    }

    /// Index child chunks with their RBAC payload columns
    pub async fn upsert_children(
        &self,
        doc_id: Uuid,
        department: &str,
        classification: Classification,
        points: &[ChildPoint],
    ) -> Result<usize> {
        if points.is_empty() {
            return Ok(0);
        }
        for point in points {
            self.check_dimension(&point.embedding)?;
        }

        let mut tx = self.pool.begin().await.map_err(upsert_err)?;
        for point in points {
            sqlx::query(
                "INSERT OR REPLACE INTO child_points \
                 (chunk_id, doc_id, parent_chunk_id, department, classification, chunk_type, \
                  chunk_index, page, content, embedding) \
                 VALUES (?1, ?2, ?3, ?4, ?5, 'child', ?6, ?7, ?8, ?9)",
            )
            .bind(point.chunk_id.to_string())
            .bind(doc_id.to_string())
            .bind(point.parent_chunk_id.map(|id| id.to_string()))
            .bind(department)
            .bind(classification.as_str())
            .bind(point.chunk_index)
            .bind(point.page)
            .bind(&point.content)
            .bind(Self::serialize_embedding(&point.embedding))
            .execute(&mut *tx)
            .await
            .map_err(upsert_err)?;
        }
        tx.commit().await.map_err(upsert_err)?;

        debug!(%doc_id, points = points.len(), "upserted child points");
        Ok(points.len())
    }

    /// Store parent chunks content-only for per-document bookkeeping
    pub async fn upsert_parents(
        &self,
        doc_id: Uuid,
        department: &str,
        classification: Classification,
        points: &[ParentPoint],
    ) -> Result<usize> {
        if points.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await.map_err(upsert_err)?;
        for point in points {
            sqlx::query(
                "INSERT OR REPLACE INTO parent_points \
                 (chunk_id, doc_id, department, classification, chunk_type, chunk_index, page, content) \
                 VALUES (?1, ?2, ?3, ?4, 'parent', ?5, ?6, ?7)",
            )
            .bind(point.chunk_id.to_string())
            .bind(doc_id.to_string())
            .bind(department)
            .bind(classification.as_str())
            .bind(point.chunk_index)
            .bind(point.page)
            .bind(&point.content)
            .execute(&mut *tx)
            .await
            .map_err(upsert_err)?;
        }
        tx.commit().await.map_err(upsert_err)?;
        Ok(points.len())
    }

    /// Top-k cosine search over child chunks, restricted to the caller's
    /// (department, classification) pairs. An empty filter set matches
    /// nothing by construction.
    pub async fn search(
        &self,
        query: &[f32],
        filters: &[(String, Classification)],
        k: usize,
        threshold: f32,
    ) -> Result<Vec<SearchHit>> {
        if filters.is_empty() {
            return Ok(Vec::new());
        }
        self.check_dimension(query)?;

        let rows = self.fetch_filtered(filters).await?;

        let mut hits = Vec::new();
        for row in rows {
            let embedding_blob: Vec<u8> = row.get("embedding");
            let embedding = Self::deserialize_embedding(&embedding_blob);
            let score = Self::cosine_similarity(query, &embedding);
            if score < threshold {
                continue;
            }
            hits.push(SearchHit {
                chunk_id: parse_uuid(row.get::<String, _>("chunk_id").as_str())?,
                doc_id: parse_uuid(row.get::<String, _>("doc_id").as_str())?,
                content: row.get("content"),
                score,
                department: row.get("department"),
                classification: parse_classification(
                    row.get::<String, _>("classification").as_str(),
                )?,
                parent_chunk_id: row
                    .get::<Option<String>, _>("parent_chunk_id")
                    .as_deref()
                    .map(parse_uuid)
                    .transpose()?,
                chunk_index: row.get("chunk_index"),
                page: row.get("page"),
            });
        }

        sort_hits(&mut hits);
        hits.truncate(k);

        debug!(hits = hits.len(), threshold, "vector search complete");
        Ok(hits)
    }

    /// Search children, then aggregate to parents by best child score.
    /// Requests `3 * k` children so distinct parents surface, keeps each
    /// parent once, and truncates to `k`. Content comes from the metadata
    /// store; only references and scores are returned here.
    pub async fn search_with_parent_expansion(
        &self,
        query: &[f32],
        filters: &[(String, Classification)],
        k: usize,
        threshold: f32,
    ) -> Result<Vec<ParentHit>> {
        if filters.is_empty() {
            return Ok(Vec::new());
        }
        let children = self.search(query, filters, k * 3, threshold).await?;

        let mut best: HashMap<Uuid, ParentHit> = HashMap::new();
        for child in children {
            let Some(parent_id) = child.parent_chunk_id else {
                continue;
            };
            match best.get_mut(&parent_id) {
                Some(existing) if existing.best_child_score >= child.score => {}
                Some(existing) => existing.best_child_score = child.score,
                None => {
                    best.insert(
                        parent_id,
                        ParentHit {
                            parent_chunk_id: parent_id,
                            doc_id: child.doc_id,
                            best_child_score: child.score,
                            department: child.department.clone(),
                            classification: child.classification,
                        },
                    );
                }
            }
        }

        let mut parents: Vec<ParentHit> = best.into_values().collect();
        parents.sort_by(|a, b| {
            b.best_child_score
                .partial_cmp(&a.best_child_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.doc_id.cmp(&b.doc_id))
                .then_with(|| a.parent_chunk_id.cmp(&b.parent_chunk_id))
        });
        parents.truncate(k);
        Ok(parents)
    }

    /// Delete every point belonging to a document, in both collections
    pub async fn delete_by_doc(&self, doc_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM child_points WHERE doc_id = ?1")
            .bind(doc_id.to_string())
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM parent_points WHERE doc_id = ?1")
            .bind(doc_id.to_string())
            .execute(&self.pool)
            .await?;
        debug!(%doc_id, "deleted points for document");
        Ok(())
    }

    /// Point counts per collection
    pub async fn collection_info(&self) -> Result<CollectionInfo> {
        let child: i64 = sqlx::query("SELECT COUNT(*) as count FROM child_points")
            .fetch_one(&self.pool)
            .await?
            .get("count");
        let parent: i64 = sqlx::query("SELECT COUNT(*) as count FROM parent_points")
            .fetch_one(&self.pool)
            .await?
            .get("count");
        Ok(CollectionInfo {
            child_points: child as usize,
            parent_points: parent as usize,
        })
    }

    async fn fetch_filtered(
        &self,
        filters: &[(String, Classification)],
    ) -> Result<Vec<sqlx::sqlite::SqliteRow>> {
        let mut clauses = Vec::with_capacity(filters.len());
        let mut bind_idx = 1;
        for _ in filters {
            clauses.push(format!(
                "(department = ?{} AND classification = ?{})",
                bind_idx,
                bind_idx + 1
            ));
            bind_idx += 2;
        }
        let sql = format!(
            "SELECT * FROM child_points WHERE {}",
            clauses.join(" OR ")
        );

        let mut query = sqlx::query(&sql);
        for (department, classification) in filters {
            query = query.bind(department).bind(classification.as_str());
        }
        query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| VectorError::SearchFailed(e.to_string()).into())
    }
}

/// Score descending, ties broken by `(doc_id, chunk_index)` ascending
fn sort_hits(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.doc_id.cmp(&b.doc_id))
            .then_with(|| a.chunk_index.cmp(&b.chunk_index))
    });
}

fn upsert_err(err: sqlx::Error) -> crate::error::SentinelError {
    VectorError::UpsertFailed(err.to_string()).into()
}

fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value)
        .map_err(|e| VectorError::SearchFailed(format!("bad uuid {}: {}", value, e)).into())
}

fn parse_classification(value: &str) -> Result<Classification> {
    Classification::from_str(value)
        .map_err(|e| VectorError::SearchFailed(e).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIM: usize = 8;

    async fn test_store() -> VectorStore {
        let config = VectorStoreConfig {
            database_url: "sqlite::memory:".to_string(),
            ..VectorStoreConfig::default()
        };
        VectorStore::connect(&config, DIM).await.unwrap()
    }

    fn vector(seed: usize) -> Vec<f32> {
        let mut v = vec![0.0; DIM];
        v[seed % DIM] = 1.0;
        v
    }

    fn child(seed: usize, parent: Option<Uuid>) -> ChildPoint {
        ChildPoint {
            chunk_id: Uuid::new_v4(),
            parent_chunk_id: parent,
            chunk_index: seed as i64,
            page: 0,
            content: format!("chunk {}", seed),
            embedding: vector(seed),
        }
    }

    fn filters(department: &str, classification: Classification) -> Vec<(String, Classification)> {
        vec![(department.to_string(), classification)]
    }

    #[tokio::test]
    async fn test_upsert_and_search() {
        let store = test_store().await;
        let doc_id = Uuid::new_v4();
        let points = vec![child(0, None), child(1, None), child(2, None)];

        store
            .upsert_children(doc_id, "engineering", Classification::Internal, &points)
            .await
            .unwrap();

        let hits = store
            .search(
                &vector(0),
                &filters("engineering", Classification::Internal),
                5,
                0.5,
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "chunk 0");
        assert!(hits[0].score > 0.99);
    }

    #[tokio::test]
    async fn test_filters_restrict_results() {
        let store = test_store().await;
        let doc_id = Uuid::new_v4();
        store
            .upsert_children(
                doc_id,
                "engineering",
                Classification::Internal,
                &[child(0, None)],
            )
            .await
            .unwrap();

        // Wrong department
        let hits = store
            .search(
                &vector(0),
                &filters("finance", Classification::Internal),
                5,
                0.0,
            )
            .await
            .unwrap();
        assert!(hits.is_empty());

        // Wrong classification
        let hits = store
            .search(
                &vector(0),
                &filters("engineering", Classification::Restricted),
                5,
                0.0,
            )
            .await
            .unwrap();
        assert!(hits.is_empty());

        // No filters means no results, not all results
        let hits = store.search(&vector(0), &[], 5, 0.0).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_dimension_enforced_at_write_and_query() {
        let store = test_store().await;
        let doc_id = Uuid::new_v4();

        let mut bad = child(0, None);
        bad.embedding = vec![1.0; DIM + 1];
        let err = store
            .upsert_children(doc_id, "engineering", Classification::Internal, &[bad])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::SentinelError::Vector(VectorError::InvalidDimension { .. })
        ));

        let err = store
            .search(
                &vec![1.0; DIM - 1],
                &filters("engineering", Classification::Internal),
                5,
                0.0,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::SentinelError::Vector(VectorError::InvalidDimension { .. })
        ));
    }

    #[tokio::test]
    async fn test_parent_expansion_aggregates_best_child() {
        let store = test_store().await;
        let doc_id = Uuid::new_v4();
        let parent_a = Uuid::new_v4();
        let parent_b = Uuid::new_v4();

        // Two children under parent A, one under parent B. The query aligns
        // with child 0 exactly and child 1 partially.
        let mut near = child(0, Some(parent_a));
        near.embedding = vector(0);
        let mut mid = child(1, Some(parent_a));
        mid.embedding = {
            let mut v = vector(0);
            v[1] = 1.0;
            v
        };
        let far = child(2, Some(parent_b));

        store
            .upsert_children(
                doc_id,
                "engineering",
                Classification::Internal,
                &[near, mid, far],
            )
            .await
            .unwrap();

        let parents = store
            .search_with_parent_expansion(
                &vector(0),
                &filters("engineering", Classification::Internal),
                5,
                0.1,
            )
            .await
            .unwrap();

        // Parent A appears once with the best child's score
        assert_eq!(parents.len(), 1);
        assert_eq!(parents[0].parent_chunk_id, parent_a);
        assert!(parents[0].best_child_score > 0.99);
    }

    #[tokio::test]
    async fn test_delete_by_doc_clears_both_collections() {
        let store = test_store().await;
        let doc_id = Uuid::new_v4();
        let parent_id = Uuid::new_v4();

        store
            .upsert_children(
                doc_id,
                "engineering",
                Classification::Internal,
                &[child(0, Some(parent_id))],
            )
            .await
            .unwrap();
        store
            .upsert_parents(
                doc_id,
                "engineering",
                Classification::Internal,
                &[ParentPoint {
                    chunk_id: parent_id,
                    chunk_index: 0,
                    page: 0,
                    content: "parent".to_string(),
                }],
            )
            .await
            .unwrap();

        let info = store.collection_info().await.unwrap();
        assert_eq!(info.child_points, 1);
        assert_eq!(info.parent_points, 1);

        store.delete_by_doc(doc_id).await.unwrap();
        let info = store.collection_info().await.unwrap();
        assert_eq!(info.child_points, 0);
        assert_eq!(info.parent_points, 0);
    }

    #[tokio::test]
    async fn test_ordering_is_stable_on_ties() {
        let store = test_store().await;
        let doc_a = Uuid::new_v4();
        let doc_b = Uuid::new_v4();

        // Identical embeddings across two documents: ordering falls back to
        // (doc_id, chunk_index)
        for doc_id in [doc_a, doc_b] {
            let points = vec![
                ChildPoint {
                    chunk_id: Uuid::new_v4(),
                    parent_chunk_id: None,
                    chunk_index: 1,
                    page: 0,
                    content: "later".to_string(),
                    embedding: vector(0),
                },
                ChildPoint {
                    chunk_id: Uuid::new_v4(),
                    parent_chunk_id: None,
                    chunk_index: 0,
                    page: 0,
                    content: "earlier".to_string(),
                    embedding: vector(0),
                },
            ];
            store
                .upsert_children(doc_id, "engineering", Classification::Internal, &points)
                .await
                .unwrap();
        }

        let hits = store
            .search(
                &vector(0),
                &filters("engineering", Classification::Internal),
                10,
                0.5,
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 4);
        let first_doc = doc_a.min(doc_b);
        assert_eq!(hits[0].doc_id, first_doc);
        assert_eq!(hits[0].chunk_index, 0);
        assert_eq!(hits[1].doc_id, first_doc);
        assert_eq!(hits[1].chunk_index, 1);
    }
}
