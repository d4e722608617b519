//! Relational metadata store
//!
//! Holds users, departments, roles, access grants, documents and the chunk
//! hierarchy. Schema creation is idempotent at startup; every query is
//! scoped to the owning tenant.

use crate::chunker::Segment;
use crate::config::{MetadataStoreConfig, TenantConfig};
use crate::error::{Result, StoreError};
use crate::model::{
    AccessPair, Classification, Department, Document, DocumentSummary, NewDocument, ParentChunk,
    User,
};
use crate::store::{clamp_pool_for_memory, map_insert_error, prepare_sqlite_url};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

/// Ids allocated by a hierarchical save, in chunk order
#[derive(Debug, Clone)]
pub struct SavedHierarchy {
    pub doc_id: Uuid,
    pub parent_ids: Vec<Uuid>,
    pub child_ids: Vec<Uuid>,
}

pub struct MetadataStore {
    pool: SqlitePool,
    tenant_id: String,
}

impl MetadataStore {
    /// Connect and run the idempotent schema setup
    pub async fn connect(config: &MetadataStoreConfig, tenant: &TenantConfig) -> Result<Self> {
        let url = prepare_sqlite_url(&config.database_url)?;
        let pool = SqlitePoolOptions::new()
            .min_connections(clamp_pool_for_memory(&config.database_url, config.min_pool_size))
            .max_connections(clamp_pool_for_memory(&config.database_url, config.max_pool_size))
            .connect(&url)
            .await?;

        let store = Self {
            pool,
            tenant_id: tenant.tenant_id.clone(),
        };
        store.init_schema().await?;
        store.ensure_tenant(&tenant.domain).await?;
        info!(tenant = %store.tenant_id, "metadata store initialized");
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS tenants (
                tenant_id TEXT PRIMARY KEY,
                domain TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS users (
                user_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                email TEXT NOT NULL,
                full_name TEXT,
                created_at TEXT NOT NULL,
                UNIQUE(tenant_id, email)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS departments (
                department_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                department_name TEXT NOT NULL,
                UNIQUE(tenant_id, department_name)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS roles (
                role_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                department_id TEXT NOT NULL,
                role_name TEXT NOT NULL,
                UNIQUE(department_id, role_name)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS user_access (
                user_id TEXT NOT NULL,
                department_id TEXT NOT NULL,
                role_id TEXT NOT NULL,
                PRIMARY KEY (user_id, department_id, role_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                doc_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                filename TEXT NOT NULL,
                uploaded_by TEXT NOT NULL,
                department_id TEXT NOT NULL,
                classification TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                chunk_id TEXT PRIMARY KEY,
                doc_id TEXT NOT NULL,
                parent_chunk_id TEXT,
                chunk_index INTEGER NOT NULL,
                chunk_type TEXT NOT NULL,
                content TEXT NOT NULL,
                page INTEGER NOT NULL DEFAULT 0,
                headers TEXT
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_users_email ON users(tenant_id, email)",
            "CREATE INDEX IF NOT EXISTS idx_chunks_doc ON chunks(doc_id)",
            "CREATE INDEX IF NOT EXISTS idx_chunks_parent ON chunks(parent_chunk_id)",
            "CREATE INDEX IF NOT EXISTS idx_documents_uploader ON documents(uploaded_by)",
        ];
        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn ensure_tenant(&self, domain: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO tenants (tenant_id, domain) VALUES (?1, ?2)")
            .bind(&self.tenant_id)
            .bind(domain)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    //        User management
    // -------------------------------

    pub async fn create_user(&self, email: &str, full_name: Option<&str>) -> Result<Uuid> {
        let user_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO users (user_id, tenant_id, email, full_name, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(user_id.to_string())
        .bind(&self.tenant_id)
        .bind(email)
        .bind(full_name)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_error(e, &format!("user {}", email)))?;

        debug!(%user_id, email, "created user");
        Ok(user_id)
    }

    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE tenant_id = ?1 AND email = ?2")
            .bind(&self.tenant_id)
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| parse_user(&r)).transpose()
    }

    pub async fn get_user(&self, user_id: Uuid) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE tenant_id = ?1 AND user_id = ?2")
            .bind(&self.tenant_id)
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| parse_user(&r)).transpose()
    }

    //       Department management
    // -------------------------------

    /// Create a department; returns the existing id when already provisioned
    pub async fn create_department(&self, name: &str) -> Result<Uuid> {
        if let Some(existing) = self.department_id_by_name(name).await? {
            return Ok(existing);
        }
        let department_id = Uuid::new_v4();
        sqlx::query(
            "INSERT OR IGNORE INTO departments (department_id, tenant_id, department_name) \
             VALUES (?1, ?2, ?3)",
        )
        .bind(department_id.to_string())
        .bind(&self.tenant_id)
        .bind(name)
        .execute(&self.pool)
        .await?;
        // A concurrent insert may have won the race
        self.department_id_by_name(name)
            .await?
            .ok_or_else(|| StoreError::StorageFailed(format!("department {} vanished", name)).into())
    }

    pub async fn department_id_by_name(&self, name: &str) -> Result<Option<Uuid>> {
        let row = sqlx::query(
            "SELECT department_id FROM departments \
             WHERE tenant_id = ?1 AND department_name = ?2",
        )
        .bind(&self.tenant_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| parse_uuid(r.get::<String, _>("department_id").as_str()))
            .transpose()
    }

    pub async fn list_departments(&self) -> Result<Vec<Department>> {
        let rows = sqlx::query(
            "SELECT department_id, department_name FROM departments \
             WHERE tenant_id = ?1 ORDER BY department_name",
        )
        .bind(&self.tenant_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(Department {
                    department_id: parse_uuid(row.get::<String, _>("department_id").as_str())?,
                    tenant_id: self.tenant_id.clone(),
                    name: row.get("department_name"),
                })
            })
            .collect()
    }

    //        Role management
    // -------------------------------

    pub async fn create_role(&self, role_name: &str, department_name: &str) -> Result<Uuid> {
        let department_id = self
            .department_id_by_name(department_name)
            .await?
            .ok_or_else(|| {
                StoreError::RecordNotFound(format!("department {}", department_name))
            })?;

        if let Some(existing) = self.role_id(role_name, department_id).await? {
            return Ok(existing);
        }

        let role_id = Uuid::new_v4();
        sqlx::query(
            "INSERT OR IGNORE INTO roles (role_id, tenant_id, department_id, role_name) \
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(role_id.to_string())
        .bind(&self.tenant_id)
        .bind(department_id.to_string())
        .bind(role_name)
        .execute(&self.pool)
        .await?;

        self.role_id(role_name, department_id)
            .await?
            .ok_or_else(|| StoreError::StorageFailed(format!("role {} vanished", role_name)).into())
    }

    async fn role_id(&self, role_name: &str, department_id: Uuid) -> Result<Option<Uuid>> {
        let row = sqlx::query(
            "SELECT role_id FROM roles WHERE department_id = ?1 AND role_name = ?2",
        )
        .bind(department_id.to_string())
        .bind(role_name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| parse_uuid(r.get::<String, _>("role_id").as_str()))
            .transpose()
    }

    /// All (role, department) pairs known to the tenant
    pub async fn list_roles(&self) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query(
            "SELECT r.role_name, d.department_name \
             FROM roles r JOIN departments d ON r.department_id = d.department_id \
             WHERE r.tenant_id = ?1 ORDER BY d.department_name, r.role_name",
        )
        .bind(&self.tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("role_name"), row.get("department_name")))
            .collect())
    }

    pub async fn assign_role(
        &self,
        user_id: Uuid,
        department_name: &str,
        role_name: &str,
    ) -> Result<()> {
        let row = sqlx::query(
            "SELECT r.role_id, d.department_id FROM roles r \
             JOIN departments d ON r.department_id = d.department_id \
             WHERE r.role_name = ?1 AND d.department_name = ?2 AND d.tenant_id = ?3",
        )
        .bind(role_name)
        .bind(department_name)
        .bind(&self.tenant_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            StoreError::RecordNotFound(format!(
                "role {} in department {}",
                role_name, department_name
            ))
        })?;

        let role_id: String = row.get("role_id");
        let department_id: String = row.get("department_id");

        sqlx::query(
            "INSERT OR IGNORE INTO user_access (user_id, department_id, role_id) \
             VALUES (?1, ?2, ?3)",
        )
        .bind(user_id.to_string())
        .bind(department_id)
        .bind(role_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All (department, role) grants a user holds; tenant-scoped by the join
    pub async fn get_user_access_pairs(&self, user_id: Uuid) -> Result<Vec<AccessPair>> {
        let rows = sqlx::query(
            "SELECT d.department_name, r.role_name \
             FROM user_access ua \
             JOIN roles r ON ua.role_id = r.role_id \
             JOIN departments d ON ua.department_id = d.department_id \
             WHERE ua.user_id = ?1 AND d.tenant_id = ?2",
        )
        .bind(user_id.to_string())
        .bind(&self.tenant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| AccessPair {
                department: row.get("department_name"),
                role: row.get("role_name"),
            })
            .collect())
    }

    //        Document management
    // ----------------------------------

    /// Atomically persist a document with its parent and child chunk rows.
    /// Either everything lands or nothing does.
    pub async fn save_hierarchical(
        &self,
        doc: &NewDocument,
        parents: &[Segment],
        children: &[Segment],
        edges: &[(usize, usize)],
    ) -> Result<SavedHierarchy> {
        let doc_id = Uuid::new_v4();
        let parent_ids: Vec<Uuid> = parents.iter().map(|_| Uuid::new_v4()).collect();
        let child_ids: Vec<Uuid> = children.iter().map(|_| Uuid::new_v4()).collect();

        // child index -> parent index
        let mut parent_of = vec![None; children.len()];
        for (child_idx, parent_idx) in edges {
            if *child_idx >= children.len() || *parent_idx >= parents.len() {
                return Err(StoreError::StorageFailed(format!(
                    "edge ({}, {}) out of range",
                    child_idx, parent_idx
                ))
                .into());
            }
            parent_of[*child_idx] = Some(*parent_idx);
        }
        if !parents.is_empty() {
            if let Some(orphan) = parent_of.iter().position(|p| p.is_none()) {
                return Err(StoreError::StorageFailed(format!(
                    "child chunk {} has no parent edge",
                    orphan
                ))
                .into());
            }
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO documents \
             (doc_id, tenant_id, title, description, filename, uploaded_by, department_id, classification, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(doc_id.to_string())
        .bind(&self.tenant_id)
        .bind(&doc.title)
        .bind(&doc.description)
        .bind(&doc.filename)
        .bind(doc.uploaded_by.to_string())
        .bind(doc.department_id.to_string())
        .bind(doc.classification.as_str())
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;

        for (idx, (segment, chunk_id)) in parents.iter().zip(&parent_ids).enumerate() {
            sqlx::query(
                "INSERT INTO chunks \
                 (chunk_id, doc_id, parent_chunk_id, chunk_index, chunk_type, content, page, headers) \
                 VALUES (?1, ?2, NULL, ?3, 'parent', ?4, ?5, ?6)",
            )
            .bind(chunk_id.to_string())
            .bind(doc_id.to_string())
            .bind(idx as i64)
            .bind(&segment.content)
            .bind(segment.page as i64)
            .bind(serde_json::to_string(&segment.headers)?)
            .execute(&mut *tx)
            .await?;
        }

        for (idx, (segment, chunk_id)) in children.iter().zip(&child_ids).enumerate() {
            let parent_chunk_id = parent_of[idx].map(|p| parent_ids[p].to_string());
            sqlx::query(
                "INSERT INTO chunks \
                 (chunk_id, doc_id, parent_chunk_id, chunk_index, chunk_type, content, page, headers) \
                 VALUES (?1, ?2, ?3, ?4, 'child', ?5, ?6, ?7)",
            )
            .bind(chunk_id.to_string())
            .bind(doc_id.to_string())
            .bind(parent_chunk_id)
            .bind(idx as i64)
            .bind(&segment.content)
            .bind(segment.page as i64)
            .bind(serde_json::to_string(&segment.headers)?)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        debug!(%doc_id, parents = parents.len(), children = children.len(), "saved document hierarchy");
        Ok(SavedHierarchy {
            doc_id,
            parent_ids,
            child_ids,
        })
    }

    pub async fn get_document(&self, doc_id: Uuid) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE tenant_id = ?1 AND doc_id = ?2")
            .bind(&self.tenant_id)
            .bind(doc_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| parse_document(&r)).transpose()
    }

    pub async fn get_documents_by_uploader(&self, user_id: Uuid) -> Result<Vec<DocumentSummary>> {
        let rows = sqlx::query(
            "SELECT d.doc_id, d.filename, d.title, d.description, d.classification, d.created_at, \
                    dept.department_name \
             FROM documents d \
             JOIN departments dept ON d.department_id = dept.department_id \
             WHERE d.uploaded_by = ?1 AND d.tenant_id = ?2 \
             ORDER BY d.created_at DESC",
        )
        .bind(user_id.to_string())
        .bind(&self.tenant_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(DocumentSummary {
                    doc_id: parse_uuid(row.get::<String, _>("doc_id").as_str())?,
                    filename: row.get("filename"),
                    title: row.get("title"),
                    description: row.get("description"),
                    classification: parse_classification(
                        row.get::<String, _>("classification").as_str(),
                    )?,
                    department_name: row.get("department_name"),
                    created_at: parse_timestamp(row.get::<String, _>("created_at").as_str())?,
                })
            })
            .collect()
    }

    /// Bulk read of parent chunks for parent expansion
    pub async fn get_parents_by_id(&self, chunk_ids: &[Uuid]) -> Result<Vec<ParentChunk>> {
        if chunk_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders: Vec<String> =
            (1..=chunk_ids.len()).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "SELECT chunk_id, doc_id, chunk_index, content, page FROM chunks \
             WHERE chunk_type = 'parent' AND chunk_id IN ({})",
            placeholders.join(", ")
        );

        let mut query = sqlx::query(&sql);
        for chunk_id in chunk_ids {
            query = query.bind(chunk_id.to_string());
        }
        let rows = query.fetch_all(&self.pool).await?;

        rows.into_iter()
            .map(|row| {
                Ok(ParentChunk {
                    chunk_id: parse_uuid(row.get::<String, _>("chunk_id").as_str())?,
                    doc_id: parse_uuid(row.get::<String, _>("doc_id").as_str())?,
                    chunk_index: row.get("chunk_index"),
                    content: row.get("content"),
                    page: row.get("page"),
                })
            })
            .collect()
    }

    /// Delete a document and its chunk rows; used by ingest compensation
    pub async fn delete_document(&self, doc_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks WHERE doc_id = ?1")
            .bind(doc_id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents WHERE doc_id = ?1 AND tenant_id = ?2")
            .bind(doc_id.to_string())
            .bind(&self.tenant_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        debug!(%doc_id, "deleted document and chunks");
        Ok(())
    }
}

fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value)
        .map_err(|e| StoreError::StorageFailed(format!("bad uuid {}: {}", value, e)).into())
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::StorageFailed(format!("bad timestamp {}: {}", value, e)).into())
}

fn parse_classification(value: &str) -> Result<Classification> {
    Classification::from_str(value)
        .map_err(|e| StoreError::StorageFailed(e).into())
}

fn parse_user(row: &sqlx::sqlite::SqliteRow) -> Result<User> {
    Ok(User {
        user_id: parse_uuid(row.get::<String, _>("user_id").as_str())?,
        tenant_id: row.get("tenant_id"),
        email: row.get("email"),
        full_name: row.get("full_name"),
        created_at: parse_timestamp(row.get::<String, _>("created_at").as_str())?,
    })
}

fn parse_document(row: &sqlx::sqlite::SqliteRow) -> Result<Document> {
    Ok(Document {
        doc_id: parse_uuid(row.get::<String, _>("doc_id").as_str())?,
        tenant_id: row.get("tenant_id"),
        title: row.get("title"),
        description: row.get("description"),
        filename: row.get("filename"),
        uploaded_by: parse_uuid(row.get::<String, _>("uploaded_by").as_str())?,
        department_id: parse_uuid(row.get::<String, _>("department_id").as_str())?,
        classification: parse_classification(row.get::<String, _>("classification").as_str())?,
        created_at: parse_timestamp(row.get::<String, _>("created_at").as_str())?,
    })
}
