//! Durable storage: relational metadata plus the vector collections

pub mod metadata;
pub mod vector;

pub use metadata::{MetadataStore, SavedHierarchy};
pub use vector::{
    ChildPoint, CollectionInfo, ParentHit, ParentPoint, SearchHit, VectorIndex, VectorSearch,
    VectorStore,
};

use crate::error::{Result, StoreError};

/// Normalise a SQLite URL the way deployments expect: make sure the parent
/// directory exists and the create-if-missing mode is set.
pub(crate) fn prepare_sqlite_url(database_url: &str) -> Result<String> {
    if let Some(db_path) = database_url.strip_prefix("sqlite:") {
        let db_path = db_path.split('?').next().unwrap_or(db_path);
        if db_path != ":memory:" && !db_path.is_empty() {
            if let Some(parent) = std::path::Path::new(db_path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        StoreError::StorageFailed(format!(
                            "failed to create database directory: {}",
                            e
                        ))
                    })?;
                }
            }
        }
    }

    let url = if database_url.contains('?') {
        if database_url.contains("mode=") {
            database_url.to_string()
        } else {
            format!("{}&mode=rwc", database_url)
        }
    } else {
        format!("{}?mode=rwc", database_url)
    };
    Ok(url)
}

/// An in-memory SQLite database exists per connection; a pool larger than
/// one would silently shard it
pub(crate) fn clamp_pool_for_memory(database_url: &str, size: u32) -> u32 {
    if database_url.contains(":memory:") {
        1
    } else {
        size
    }
}

/// Map a unique-constraint violation onto the conflict taxonomy
pub(crate) fn map_insert_error(err: sqlx::Error, what: &str) -> crate::error::SentinelError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.message().contains("UNIQUE") {
            return StoreError::Duplicate(what.to_string()).into();
        }
    }
    err.into()
}
