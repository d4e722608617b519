//! Core entities shared across the ingestion and retrieval pipelines
//!
//! Every entity belongs to exactly one tenant; identifiers are opaque and
//! unique within that tenant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sensitivity label on a document. Fixed at ingest; re-classification
/// requires re-ingestion under a new document id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Public,
    Internal,
    Confidential,
    Restricted,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Public => "public",
            Classification::Internal => "internal",
            Classification::Confidential => "confidential",
            Classification::Restricted => "restricted",
        }
    }

    /// Audit retention period in years for events touching this label
    pub fn retention_years(&self) -> i64 {
        match self {
            Classification::Public => 3,
            Classification::Internal => 5,
            Classification::Confidential => 7,
            Classification::Restricted => 10,
        }
    }
}

impl std::str::FromStr for Classification {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "public" => Ok(Classification::Public),
            "internal" => Ok(Classification::Internal),
            "confidential" => Ok(Classification::Confidential),
            "restricted" => Ok(Classification::Restricted),
            other => Err(format!("unknown classification: {}", other)),
        }
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A principal known to the system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: Uuid,
    pub tenant_id: String,
    pub email: String,
    pub full_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Organisational unit; roles are always scoped to one
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Department {
    pub department_id: Uuid,
    pub tenant_id: String,
    pub name: String,
}

/// Role within a department
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub role_id: Uuid,
    pub tenant_id: String,
    pub department_id: Uuid,
    pub name: String,
}

/// One (department, role) grant held by a user
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessPair {
    pub department: String,
    pub role: String,
}

/// An ingested document; department and classification never change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub doc_id: Uuid,
    pub tenant_id: String,
    pub title: String,
    pub description: String,
    pub filename: String,
    pub uploaded_by: Uuid,
    pub department_id: Uuid,
    pub classification: Classification,
    pub created_at: DateTime<Utc>,
}

/// Attributes of a document about to be ingested
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub title: String,
    pub description: String,
    pub filename: String,
    pub uploaded_by: Uuid,
    pub department_id: Uuid,
    pub classification: Classification,
}

/// Listing row for a user's uploads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub doc_id: Uuid,
    pub filename: String,
    pub title: String,
    pub description: String,
    pub classification: Classification,
    pub department_name: String,
    pub created_at: DateTime<Utc>,
}

/// A context-preserving section of a document; carries no embedding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParentChunk {
    pub chunk_id: Uuid,
    pub doc_id: Uuid,
    pub chunk_index: i64,
    pub content: String,
    pub page: i64,
}
