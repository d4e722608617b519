//! Buffered audit sink
//!
//! The request path never waits on the audit store: events are stamped,
//! enqueued into a bounded buffer and drained by background workers over a
//! connection pool. A saturated buffer blocks the caller for at most a short
//! interval, after which the enqueue is reported as failed and the business
//! operation records partial success. On graceful shutdown the buffer is
//! flushed; on crash, unflushed events are lost.

use crate::audit::{
    AuditEvent, AuthAuditEvent, ModificationAuditEvent, QueryAuditEvent,
};
use crate::config::AuditConfig;
use crate::error::{AuditError, Result};
use crate::store::{clamp_pool_for_memory, prepare_sqlite_url};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

enum Job {
    Main { log_id: Uuid, event: Box<AuditEvent> },
    Query { log_id: Uuid, event: QueryAuditEvent },
    Auth { log_id: Uuid, event: AuthAuditEvent },
    Modification { log_id: Uuid, event: ModificationAuditEvent },
}

struct Inner {
    tx: Mutex<Option<flume::Sender<Job>>>,
    pool: SqlitePool,
    pending: Arc<AtomicUsize>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    enqueue_timeout: Duration,
}

/// Asynchronous audit sink; cheap to share behind an `Arc`
pub struct AuditSink {
    inner: Option<Inner>,
}

/// A persisted main audit event, as read back for compliance queries
#[derive(Debug, Clone, serde::Serialize)]
pub struct StoredAuditEvent {
    pub log_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub user_id: Option<Uuid>,
    pub user_email: Option<String>,
    pub category: String,
    pub event_type: String,
    pub action: String,
    pub outcome: String,
    pub resource_type: Option<String>,
    pub resource_id: Option<Uuid>,
    pub resource_name: Option<String>,
    pub department_name: Option<String>,
    pub role_name: Option<String>,
    pub classification: Option<String>,
    pub pii_accessed: bool,
    pub pii_types: Vec<String>,
    pub data_redacted: bool,
    pub query_text: Option<String>,
    pub error_message: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub retention_years: i64,
    pub archived: bool,
}

/// One modification-history row joined with the actor's email
#[derive(Debug, Clone, serde::Serialize)]
pub struct ModificationRecord {
    pub modification_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub old_values: Option<serde_json::Value>,
    pub new_values: Option<serde_json::Value>,
    pub changed_fields: Vec<String>,
    pub reason: Option<String>,
    pub user_email: Option<String>,
}

impl AuditSink {
    /// Connect the sink, create the audit tables and start the drain workers.
    /// A disabled configuration yields a no-op sink.
    pub async fn connect(config: &AuditConfig) -> Result<Self> {
        if !config.enabled {
            info!("audit logging disabled; using no-op sink");
            return Ok(Self::noop());
        }

        let url = prepare_sqlite_url(&config.database_url)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(clamp_pool_for_memory(&config.database_url, config.max_pool_size))
            .connect(&url)
            .await?;
        init_schema(&pool).await?;

        let (tx, rx) = flume::bounded::<Job>(config.buffer_capacity);
        let pending = Arc::new(AtomicUsize::new(0));

        let workers = (0..config.workers.max(1))
            .map(|worker_id| {
                let rx = rx.clone();
                let pool = pool.clone();
                let pending = pending.clone();
                tokio::spawn(async move {
                    debug!(worker_id, "audit worker started");
                    while let Ok(job) = rx.recv_async().await {
                        if let Err(e) = write_job(&pool, job).await {
                            error!(worker_id, error = %e, "audit write failed");
                        }
                        pending.fetch_sub(1, Ordering::SeqCst);
                    }
                    debug!(worker_id, "audit worker stopped");
                })
            })
            .collect();

        info!(
            workers = config.workers.max(1),
            capacity = config.buffer_capacity,
            "audit sink started"
        );

        Ok(Self {
            inner: Some(Inner {
                tx: Mutex::new(Some(tx)),
                pool,
                pending,
                workers: Mutex::new(workers),
                enqueue_timeout: Duration::from_millis(config.enqueue_timeout_ms),
            }),
        })
    }

    /// A sink that accepts and discards everything
    pub fn noop() -> Self {
        Self { inner: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    async fn enqueue(&self, job: Job) -> Result<()> {
        let Some(inner) = &self.inner else {
            return Ok(());
        };

        let sender = {
            let guard = inner
                .tx
                .lock()
                .map_err(|_| AuditError::WriteFailed("sink lock poisoned".into()))?;
            guard.clone()
        };
        let Some(sender) = sender else {
            return Err(AuditError::SinkClosed.into());
        };

        inner.pending.fetch_add(1, Ordering::SeqCst);
        match tokio::time::timeout(inner.enqueue_timeout, sender.send_async(job)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                inner.pending.fetch_sub(1, Ordering::SeqCst);
                Err(AuditError::SinkClosed.into())
            }
            Err(_) => {
                inner.pending.fetch_sub(1, Ordering::SeqCst);
                warn!("audit buffer saturated; event dropped to best effort");
                Err(AuditError::BufferFull.into())
            }
        }
    }

    /// Enqueue a main audit event; the returned id is stable before the
    /// write lands so specialised records can reference it immediately
    pub async fn log(&self, event: AuditEvent) -> Result<Uuid> {
        let log_id = Uuid::new_v4();
        self.enqueue(Job::Main {
            log_id,
            event: Box::new(event),
        })
        .await?;
        Ok(log_id)
    }

    pub async fn log_query(&self, log_id: Uuid, event: QueryAuditEvent) -> Result<()> {
        self.enqueue(Job::Query { log_id, event }).await
    }

    pub async fn log_auth(&self, log_id: Uuid, event: AuthAuditEvent) -> Result<()> {
        self.enqueue(Job::Auth { log_id, event }).await
    }

    pub async fn log_modification(
        &self,
        log_id: Uuid,
        event: ModificationAuditEvent,
    ) -> Result<()> {
        self.enqueue(Job::Modification { log_id, event }).await
    }

    /// Wait until every enqueued event has been written
    pub async fn flush(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while inner.pending.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() > deadline {
                warn!("audit flush timed out with events still pending");
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Flush the buffer and stop the workers
    pub async fn shutdown(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        // Closing the channel lets workers drain the tail and exit
        if let Ok(mut guard) = inner.tx.lock() {
            guard.take();
        }
        let workers = match inner.workers.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => Vec::new(),
        };
        for worker in workers {
            if worker.await.is_err() {
                warn!("audit worker panicked during shutdown");
            }
        }
        info!("audit sink shut down");
    }

    //  COMPLIANCE QUERIES
    // ---------------------

    /// All activity for one user over a date range
    pub async fn get_user_activity(
        &self,
        user_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<StoredAuditEvent>> {
        let Some(inner) = &self.inner else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query(
            "SELECT * FROM audit_logs \
             WHERE user_id = ?1 AND timestamp BETWEEN ?2 AND ?3 \
             ORDER BY timestamp DESC",
        )
        .bind(user_id.to_string())
        .bind(start.to_rfc3339())
        .bind(end.to_rfc3339())
        .fetch_all(&inner.pool)
        .await?;
        rows.iter().map(parse_stored_event).collect()
    }

    /// Every event that touched PII in a date range
    pub async fn get_pii_access_log(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<StoredAuditEvent>> {
        let Some(inner) = &self.inner else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query(
            "SELECT * FROM audit_logs \
             WHERE pii_accessed = 1 AND timestamp BETWEEN ?1 AND ?2 \
             ORDER BY timestamp DESC",
        )
        .bind(start.to_rfc3339())
        .bind(end.to_rfc3339())
        .fetch_all(&inner.pool)
        .await?;
        rows.iter().map(parse_stored_event).collect()
    }

    /// Failed access attempts for security monitoring
    pub async fn get_failed_access_attempts(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<StoredAuditEvent>> {
        let Some(inner) = &self.inner else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query(
            "SELECT * FROM audit_logs \
             WHERE outcome = 'failure' AND timestamp BETWEEN ?1 AND ?2 \
             ORDER BY timestamp DESC LIMIT ?3",
        )
        .bind(start.to_rfc3339())
        .bind(end.to_rfc3339())
        .bind(limit)
        .fetch_all(&inner.pool)
        .await?;
        rows.iter().map(parse_stored_event).collect()
    }

    /// Modification history for one record
    pub async fn get_data_modifications(
        &self,
        table_name: &str,
        record_id: Uuid,
    ) -> Result<Vec<ModificationRecord>> {
        let Some(inner) = &self.inner else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query(
            "SELECT m.modification_id, m.timestamp, m.operation, m.old_values, m.new_values, \
                    m.changed_fields, m.reason, a.user_email \
             FROM modification_audit m \
             JOIN audit_logs a ON m.log_id = a.log_id \
             WHERE m.table_name = ?1 AND m.record_id = ?2 \
             ORDER BY m.timestamp DESC",
        )
        .bind(table_name)
        .bind(record_id.to_string())
        .fetch_all(&inner.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ModificationRecord {
                    modification_id: parse_uuid(row.get::<String, _>("modification_id").as_str())?,
                    timestamp: parse_timestamp(row.get::<String, _>("timestamp").as_str())?,
                    operation: row.get("operation"),
                    old_values: parse_json(row.get::<Option<String>, _>("old_values")),
                    new_values: parse_json(row.get::<Option<String>, _>("new_values")),
                    changed_fields: parse_string_list(
                        row.get::<Option<String>, _>("changed_fields"),
                    ),
                    reason: row.get("reason"),
                    user_email: row.get("user_email"),
                })
            })
            .collect()
    }

    /// Most recent main events, newest first
    pub async fn recent_events(&self, limit: i64) -> Result<Vec<StoredAuditEvent>> {
        let Some(inner) = &self.inner else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query(
            "SELECT * FROM audit_logs ORDER BY timestamp DESC, rowid DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&inner.pool)
        .await?;
        rows.iter().map(parse_stored_event).collect()
    }

    /// Flip the archived flag for events older than the cutoff. Archived
    /// events stay queryable; nothing else about them ever changes.
    pub async fn archive(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let Some(inner) = &self.inner else {
            return Ok(0);
        };
        let result = sqlx::query(
            "UPDATE audit_logs \
             SET archived = 1, archived_at = ?1 \
             WHERE timestamp < ?2 AND archived = 0",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(cutoff.to_rfc3339())
        .execute(&inner.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }
}

async fn init_schema(pool: &SqlitePool) -> Result<()> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS audit_logs (
            log_id TEXT PRIMARY KEY,
            timestamp TEXT NOT NULL,
            user_id TEXT,
            user_email TEXT,
            session_id TEXT,
            ip_address TEXT,
            user_agent TEXT,
            event_category TEXT NOT NULL,
            event_type TEXT NOT NULL,
            action TEXT NOT NULL,
            outcome TEXT NOT NULL,
            resource_type TEXT,
            resource_id TEXT,
            resource_name TEXT,
            department_name TEXT,
            role_name TEXT,
            classification_level TEXT,
            pii_accessed INTEGER NOT NULL DEFAULT 0,
            pii_types TEXT,
            data_redacted INTEGER NOT NULL DEFAULT 0,
            changes TEXT,
            query_text TEXT,
            error_message TEXT,
            metadata TEXT,
            retention_years INTEGER NOT NULL,
            archived INTEGER NOT NULL DEFAULT 0,
            archived_at TEXT
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS query_audit (
            query_id TEXT PRIMARY KEY,
            log_id TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            user_id TEXT,
            query_text_hash TEXT NOT NULL,
            chunks_retrieved INTEGER NOT NULL DEFAULT 0,
            chunks_accessed TEXT,
            documents_accessed TEXT,
            embedding_time_ms REAL NOT NULL DEFAULT 0,
            vector_search_time_ms REAL NOT NULL DEFAULT 0,
            total_response_time_ms REAL NOT NULL DEFAULT 0,
            filters_applied TEXT,
            metadata TEXT
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS auth_audit (
            auth_id TEXT PRIMARY KEY,
            log_id TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            user_id TEXT,
            email TEXT NOT NULL,
            auth_method TEXT NOT NULL,
            event_type TEXT NOT NULL,
            ip_address TEXT,
            user_agent TEXT,
            failed_attempts_count INTEGER NOT NULL DEFAULT 0,
            account_locked INTEGER NOT NULL DEFAULT 0,
            mfa_used INTEGER NOT NULL DEFAULT 0,
            metadata TEXT
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS modification_audit (
            modification_id TEXT PRIMARY KEY,
            log_id TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            user_id TEXT,
            table_name TEXT NOT NULL,
            record_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            old_values TEXT,
            new_values TEXT,
            changed_fields TEXT,
            reason TEXT,
            approved_by TEXT,
            metadata TEXT
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_audit_user ON audit_logs(user_id, timestamp)",
        "CREATE INDEX IF NOT EXISTS idx_audit_outcome ON audit_logs(outcome, timestamp)",
        "CREATE INDEX IF NOT EXISTS idx_audit_pii ON audit_logs(pii_accessed, timestamp)",
        "CREATE INDEX IF NOT EXISTS idx_modification_record ON modification_audit(table_name, record_id)",
    ];
    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

async fn write_job(pool: &SqlitePool, job: Job) -> std::result::Result<(), sqlx::Error> {
    match job {
        Job::Main { log_id, event } => {
            sqlx::query(
                "INSERT INTO audit_logs ( \
                    log_id, timestamp, user_id, user_email, session_id, ip_address, user_agent, \
                    event_category, event_type, action, outcome, \
                    resource_type, resource_id, resource_name, \
                    department_name, role_name, classification_level, \
                    pii_accessed, pii_types, data_redacted, \
                    changes, query_text, error_message, metadata, retention_years \
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, \
                          ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25)",
            )
            .bind(log_id.to_string())
            .bind(event.timestamp.to_rfc3339())
            .bind(event.user_id.map(|id| id.to_string()))
            .bind(&event.user_email)
            .bind(&event.session_id)
            .bind(&event.ip_address)
            .bind(&event.user_agent)
            .bind(event.category.as_str())
            .bind(&event.event_type)
            .bind(event.action.as_str())
            .bind(event.outcome.as_str())
            .bind(event.resource_type.map(|t| t.as_str()))
            .bind(event.resource_id.map(|id| id.to_string()))
            .bind(&event.resource_name)
            .bind(&event.department_name)
            .bind(&event.role_name)
            .bind(event.classification.map(|c| c.as_str()))
            .bind(event.pii_accessed as i64)
            .bind(to_json_opt(&event.pii_types))
            .bind(event.data_redacted as i64)
            .bind(event.changes.as_ref().map(|v| v.to_string()))
            .bind(&event.query_text)
            .bind(&event.error_message)
            .bind(event.metadata.as_ref().map(|v| v.to_string()))
            .bind(event.retention_years)
            .execute(pool)
            .await?;
        }
        Job::Query { log_id, event } => {
            let query_text_hash = hex_sha256(&event.query_text);
            sqlx::query(
                "INSERT INTO query_audit ( \
                    query_id, log_id, timestamp, user_id, query_text_hash, \
                    chunks_retrieved, chunks_accessed, documents_accessed, \
                    embedding_time_ms, vector_search_time_ms, total_response_time_ms, \
                    filters_applied, metadata \
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(log_id.to_string())
            .bind(Utc::now().to_rfc3339())
            .bind(event.user_id.map(|id| id.to_string()))
            .bind(query_text_hash)
            .bind(event.chunks_retrieved)
            .bind(to_json_opt(
                &event
                    .chunks_accessed
                    .iter()
                    .map(|id| id.to_string())
                    .collect::<Vec<_>>(),
            ))
            .bind(to_json_opt(
                &event
                    .documents_accessed
                    .iter()
                    .map(|id| id.to_string())
                    .collect::<Vec<_>>(),
            ))
            .bind(event.embedding_time_ms)
            .bind(event.vector_search_time_ms)
            .bind(event.total_response_time_ms)
            .bind(event.filters_applied.as_ref().map(|v| v.to_string()))
            .bind(event.metadata.as_ref().map(|v| v.to_string()))
            .execute(pool)
            .await?;
        }
        Job::Auth { log_id, event } => {
            sqlx::query(
                "INSERT INTO auth_audit ( \
                    auth_id, log_id, timestamp, user_id, email, auth_method, event_type, \
                    ip_address, user_agent, failed_attempts_count, account_locked, mfa_used, \
                    metadata \
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(log_id.to_string())
            .bind(Utc::now().to_rfc3339())
            .bind(event.user_id.map(|id| id.to_string()))
            .bind(&event.email)
            .bind(&event.auth_method)
            .bind(&event.event_type)
            .bind(&event.ip_address)
            .bind(&event.user_agent)
            .bind(event.failed_attempts_count)
            .bind(event.account_locked as i64)
            .bind(event.mfa_used as i64)
            .bind(event.metadata.as_ref().map(|v| v.to_string()))
            .execute(pool)
            .await?;
        }
        Job::Modification { log_id, event } => {
            sqlx::query(
                "INSERT INTO modification_audit ( \
                    modification_id, log_id, timestamp, user_id, table_name, record_id, \
                    operation, old_values, new_values, changed_fields, reason, approved_by, \
                    metadata \
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(log_id.to_string())
            .bind(Utc::now().to_rfc3339())
            .bind(event.user_id.map(|id| id.to_string()))
            .bind(&event.table_name)
            .bind(event.record_id.to_string())
            .bind(&event.operation)
            .bind(event.old_values.as_ref().map(|v| v.to_string()))
            .bind(event.new_values.as_ref().map(|v| v.to_string()))
            .bind(to_json_opt(&event.changed_fields))
            .bind(&event.reason)
            .bind(event.approved_by.map(|id| id.to_string()))
            .bind(event.metadata.as_ref().map(|v| v.to_string()))
            .execute(pool)
            .await?;
        }
    }
    Ok(())
}

fn hex_sha256(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn to_json_opt(values: &[String]) -> Option<String> {
    if values.is_empty() {
        None
    } else {
        serde_json::to_string(values).ok()
    }
}

fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value)
        .map_err(|e| AuditError::WriteFailed(format!("bad uuid {}: {}", value, e)).into())
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AuditError::WriteFailed(format!("bad timestamp {}: {}", value, e)).into())
}

fn parse_json(value: Option<String>) -> Option<serde_json::Value> {
    value.and_then(|s| serde_json::from_str(&s).ok())
}

fn parse_string_list(value: Option<String>) -> Vec<String> {
    value
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

fn parse_stored_event(row: &sqlx::sqlite::SqliteRow) -> Result<StoredAuditEvent> {
    Ok(StoredAuditEvent {
        log_id: parse_uuid(row.get::<String, _>("log_id").as_str())?,
        timestamp: parse_timestamp(row.get::<String, _>("timestamp").as_str())?,
        user_id: row
            .get::<Option<String>, _>("user_id")
            .as_deref()
            .map(parse_uuid)
            .transpose()?,
        user_email: row.get("user_email"),
        category: row.get("event_category"),
        event_type: row.get("event_type"),
        action: row.get("action"),
        outcome: row.get("outcome"),
        resource_type: row.get("resource_type"),
        resource_id: row
            .get::<Option<String>, _>("resource_id")
            .as_deref()
            .map(parse_uuid)
            .transpose()?,
        resource_name: row.get("resource_name"),
        department_name: row.get("department_name"),
        role_name: row.get("role_name"),
        classification: row.get("classification_level"),
        pii_accessed: row.get::<i64, _>("pii_accessed") != 0,
        pii_types: parse_string_list(row.get::<Option<String>, _>("pii_types")),
        data_redacted: row.get::<i64, _>("data_redacted") != 0,
        query_text: row.get("query_text"),
        error_message: row.get("error_message"),
        metadata: parse_json(row.get::<Option<String>, _>("metadata")),
        retention_years: row.get("retention_years"),
        archived: row.get::<i64, _>("archived") != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditAction, EventCategory, EventOutcome, ResourceType};
    use crate::model::Classification;
    use chrono::Duration as ChronoDuration;

    async fn test_sink() -> AuditSink {
        let config = AuditConfig {
            database_url: "sqlite::memory:".to_string(),
            workers: 1,
            ..AuditConfig::default()
        };
        AuditSink::connect(&config).await.unwrap()
    }

    fn access_event(user_id: Uuid) -> AuditEvent {
        AuditEvent::document_access(
            user_id,
            "user@example.com",
            Uuid::new_v4(),
            "handbook.md",
            Classification::Internal,
            "engineering",
            "engineer",
            EventOutcome::Success,
        )
    }

    #[tokio::test]
    async fn test_log_and_read_back() {
        let sink = test_sink().await;
        let user_id = Uuid::new_v4();
        let log_id = sink.log(access_event(user_id)).await.unwrap();
        sink.flush().await;

        let events = sink.recent_events(10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].log_id, log_id);
        assert_eq!(events[0].category, "data_access");
        assert_eq!(events[0].outcome, "success");
        assert_eq!(events[0].retention_years, 5);
        assert!(!events[0].archived);
    }

    #[tokio::test]
    async fn test_query_record_attaches_to_main_event() {
        let sink = test_sink().await;
        let user_id = Uuid::new_v4();
        let log_id = sink.log(access_event(user_id)).await.unwrap();
        sink.log_query(
            log_id,
            QueryAuditEvent {
                user_id: Some(user_id),
                query_text: "dress code".to_string(),
                chunks_retrieved: 3,
                total_response_time_ms: 12.5,
                ..QueryAuditEvent::default()
            },
        )
        .await
        .unwrap();
        sink.flush().await;

        let activity = sink
            .get_user_activity(
                user_id,
                Utc::now() - ChronoDuration::hours(1),
                Utc::now() + ChronoDuration::hours(1),
            )
            .await
            .unwrap();
        assert_eq!(activity.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_attempts_query() {
        let sink = test_sink().await;
        sink.log(AuditEvent::failed_login(
            "intruder@example.com",
            Some("203.0.113.9"),
            "invalid token",
        ))
        .await
        .unwrap();
        sink.log(access_event(Uuid::new_v4())).await.unwrap();
        sink.flush().await;

        let failures = sink
            .get_failed_access_attempts(
                Utc::now() - ChronoDuration::hours(1),
                Utc::now() + ChronoDuration::hours(1),
                100,
            )
            .await
            .unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].error_message.as_deref(), Some("invalid token"));
    }

    #[tokio::test]
    async fn test_pii_access_query() {
        let sink = test_sink().await;
        let mut event = access_event(Uuid::new_v4());
        event.pii_accessed = true;
        event.data_redacted = true;
        event.pii_types = vec!["EMAIL".to_string(), "PERSON".to_string()];
        sink.log(event).await.unwrap();
        sink.flush().await;

        let pii = sink
            .get_pii_access_log(
                Utc::now() - ChronoDuration::hours(1),
                Utc::now() + ChronoDuration::hours(1),
            )
            .await
            .unwrap();
        assert_eq!(pii.len(), 1);
        assert_eq!(pii[0].pii_types, vec!["EMAIL", "PERSON"]);
        assert!(pii[0].data_redacted);
    }

    #[tokio::test]
    async fn test_modification_history() {
        let sink = test_sink().await;
        let user_id = Uuid::new_v4();
        let record_id = Uuid::new_v4();

        let mut event = AuditEvent::new(
            EventCategory::Modification,
            "user_registered",
            AuditAction::Write,
            EventOutcome::Success,
        );
        event.user_id = Some(user_id);
        event.user_email = Some("admin@example.com".to_string());
        event.resource_type = Some(ResourceType::User);
        let log_id = sink.log(event).await.unwrap();

        sink.log_modification(
            log_id,
            ModificationAuditEvent {
                user_id: Some(user_id),
                table_name: "users".to_string(),
                record_id,
                operation: "INSERT".to_string(),
                old_values: None,
                new_values: Some(serde_json::json!({"email": "new@example.com"})),
                changed_fields: vec!["email".to_string()],
                reason: None,
                approved_by: None,
                metadata: None,
            },
        )
        .await
        .unwrap();
        sink.flush().await;

        let history = sink.get_data_modifications("users", record_id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].operation, "INSERT");
        assert_eq!(history[0].user_email.as_deref(), Some("admin@example.com"));
    }

    #[tokio::test]
    async fn test_archive_flips_flag_only_once() {
        let sink = test_sink().await;
        sink.log(access_event(Uuid::new_v4())).await.unwrap();
        sink.flush().await;

        let cutoff = Utc::now() + ChronoDuration::hours(1);
        assert_eq!(sink.archive(cutoff).await.unwrap(), 1);
        // Second pass finds nothing eligible
        assert_eq!(sink.archive(cutoff).await.unwrap(), 0);

        let events = sink.recent_events(10).await.unwrap();
        assert!(events[0].archived);
    }

    #[tokio::test]
    async fn test_noop_sink_accepts_everything() {
        let sink = AuditSink::noop();
        let log_id = sink.log(access_event(Uuid::new_v4())).await.unwrap();
        sink.log_query(log_id, QueryAuditEvent::default())
            .await
            .unwrap();
        assert!(sink.recent_events(10).await.unwrap().is_empty());
        sink.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_flushes_tail() {
        let sink = test_sink().await;
        for _ in 0..20 {
            sink.log(access_event(Uuid::new_v4())).await.unwrap();
        }
        sink.shutdown().await;
        assert_eq!(sink.recent_events(100).await.unwrap().len(), 20);
    }
}
