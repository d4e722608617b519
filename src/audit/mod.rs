//! Audit event model
//!
//! Every significant action produces a main audit event; queries,
//! authentication and data modifications attach a specialised record to it.
//! Records are append-only: after the write, only the archived flag may
//! change.

pub mod sink;

pub use sink::AuditSink;

use crate::model::Classification;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default retention when no classification is involved
pub const DEFAULT_RETENTION_YEARS: i64 = 7;

/// Retention period by classification, defaulting for unlabelled events
pub fn retention_years_for(classification: Option<Classification>) -> i64 {
    classification
        .map(|c| c.retention_years())
        .unwrap_or(DEFAULT_RETENTION_YEARS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Authentication,
    Authorization,
    DataAccess,
    Modification,
    Admin,
    System,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::Authentication => "authentication",
            EventCategory::Authorization => "authorization",
            EventCategory::DataAccess => "data_access",
            EventCategory::Modification => "modification",
            EventCategory::Admin => "admin",
            EventCategory::System => "system",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    Success,
    Failure,
    Partial,
}

impl EventOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOutcome::Success => "success",
            EventOutcome::Failure => "failure",
            EventOutcome::Partial => "partial",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditAction {
    Read,
    Write,
    Delete,
    Update,
    Execute,
    Login,
    Logout,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Read => "READ",
            AuditAction::Write => "WRITE",
            AuditAction::Delete => "DELETE",
            AuditAction::Update => "UPDATE",
            AuditAction::Execute => "EXECUTE",
            AuditAction::Login => "LOGIN",
            AuditAction::Logout => "LOGOUT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Document,
    Chunk,
    User,
    Role,
    Department,
    Query,
    System,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Document => "document",
            ResourceType::Chunk => "chunk",
            ResourceType::User => "user",
            ResourceType::Role => "role",
            ResourceType::Department => "department",
            ResourceType::Query => "query",
            ResourceType::System => "system",
        }
    }
}

/// Main audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    // Actor information
    pub user_id: Option<Uuid>,
    pub user_email: Option<String>,
    pub session_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,

    // Event classification
    pub category: EventCategory,
    pub event_type: String,
    pub action: AuditAction,
    pub outcome: EventOutcome,

    // Resource information
    pub resource_type: Option<ResourceType>,
    pub resource_id: Option<Uuid>,
    pub resource_name: Option<String>,

    // Access control context
    pub department_name: Option<String>,
    pub role_name: Option<String>,
    pub classification: Option<Classification>,

    // Compliance fields
    pub pii_accessed: bool,
    pub pii_types: Vec<String>,
    pub data_redacted: bool,

    // Change tracking and free-form context
    pub changes: Option<serde_json::Value>,
    pub query_text: Option<String>,
    pub error_message: Option<String>,
    pub metadata: Option<serde_json::Value>,

    pub retention_years: i64,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        category: EventCategory,
        event_type: impl Into<String>,
        action: AuditAction,
        outcome: EventOutcome,
    ) -> Self {
        Self {
            user_id: None,
            user_email: None,
            session_id: None,
            ip_address: None,
            user_agent: None,
            category,
            event_type: event_type.into(),
            action,
            outcome,
            resource_type: None,
            resource_id: None,
            resource_name: None,
            department_name: None,
            role_name: None,
            classification: None,
            pii_accessed: false,
            pii_types: Vec::new(),
            data_redacted: false,
            changes: None,
            query_text: None,
            error_message: None,
            metadata: None,
            retention_years: DEFAULT_RETENTION_YEARS,
            timestamp: Utc::now(),
        }
    }

    pub fn with_classification(mut self, classification: Classification) -> Self {
        self.retention_years = classification.retention_years();
        self.classification = Some(classification);
        self
    }

    /// Document read by an authorised user
    pub fn document_access(
        user_id: Uuid,
        user_email: &str,
        document_id: Uuid,
        document_name: &str,
        classification: Classification,
        department_name: &str,
        role_name: &str,
        outcome: EventOutcome,
    ) -> Self {
        let mut event = Self::new(
            EventCategory::DataAccess,
            "document_access",
            AuditAction::Read,
            outcome,
        )
        .with_classification(classification);
        event.user_id = Some(user_id);
        event.user_email = Some(user_email.to_string());
        event.resource_type = Some(ResourceType::Document);
        event.resource_id = Some(document_id);
        event.resource_name = Some(document_name.to_string());
        event.department_name = Some(department_name.to_string());
        event.role_name = Some(role_name.to_string());
        event
    }

    /// Authorization decision on a resource
    pub fn permission_check(
        user_id: Uuid,
        user_email: &str,
        resource_type: ResourceType,
        resource_id: Uuid,
        user_role: &str,
        granted: bool,
    ) -> Self {
        let mut event = Self::new(
            EventCategory::Authorization,
            "permission_check",
            AuditAction::Read,
            if granted {
                EventOutcome::Success
            } else {
                EventOutcome::Failure
            },
        );
        event.user_id = Some(user_id);
        event.user_email = Some(user_email.to_string());
        event.resource_type = Some(resource_type);
        event.resource_id = Some(resource_id);
        event.role_name = Some(user_role.to_string());
        event.metadata = Some(serde_json::json!({ "granted": granted }));
        event
    }

    /// Failed authentication attempt
    pub fn failed_login(email: &str, ip_address: Option<&str>, reason: &str) -> Self {
        let mut event = Self::new(
            EventCategory::Authentication,
            "login_failure",
            AuditAction::Login,
            EventOutcome::Failure,
        );
        event.user_email = Some(email.to_string());
        event.ip_address = ip_address.map(str::to_string);
        event.error_message = Some(reason.to_string());
        event
    }
}

/// Query-specific audit record
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QueryAuditEvent {
    pub user_id: Option<Uuid>,
    pub query_text: String,

    pub chunks_retrieved: i64,
    pub chunks_accessed: Vec<Uuid>,
    pub documents_accessed: Vec<Uuid>,

    pub embedding_time_ms: f64,
    pub vector_search_time_ms: f64,
    pub total_response_time_ms: f64,

    pub filters_applied: Option<serde_json::Value>,
    pub metadata: Option<serde_json::Value>,
}

/// Authentication-specific audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthAuditEvent {
    pub user_id: Option<Uuid>,
    pub email: String,
    pub auth_method: String,
    pub event_type: String,

    pub ip_address: Option<String>,
    pub user_agent: Option<String>,

    pub failed_attempts_count: i64,
    pub account_locked: bool,
    pub mfa_used: bool,

    pub metadata: Option<serde_json::Value>,
}

impl AuthAuditEvent {
    pub fn new(email: &str, auth_method: &str, event_type: &str) -> Self {
        Self {
            user_id: None,
            email: email.to_string(),
            auth_method: auth_method.to_string(),
            event_type: event_type.to_string(),
            ip_address: None,
            user_agent: None,
            failed_attempts_count: 0,
            account_locked: false,
            mfa_used: false,
            metadata: None,
        }
    }
}

/// Data-modification audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModificationAuditEvent {
    pub user_id: Option<Uuid>,
    pub table_name: String,
    pub record_id: Uuid,
    /// INSERT, UPDATE or DELETE
    pub operation: String,

    pub old_values: Option<serde_json::Value>,
    pub new_values: Option<serde_json::Value>,
    pub changed_fields: Vec<String>,

    pub reason: Option<String>,
    pub approved_by: Option<Uuid>,
    pub metadata: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retention_follows_classification() {
        let event = AuditEvent::new(
            EventCategory::DataAccess,
            "document_access",
            AuditAction::Read,
            EventOutcome::Success,
        )
        .with_classification(Classification::Restricted);
        assert_eq!(event.retention_years, 10);

        let plain = AuditEvent::new(
            EventCategory::System,
            "startup",
            AuditAction::Execute,
            EventOutcome::Success,
        );
        assert_eq!(plain.retention_years, DEFAULT_RETENTION_YEARS);
    }

    #[test]
    fn test_permission_check_outcome() {
        let denied = AuditEvent::permission_check(
            Uuid::new_v4(),
            "user@example.com",
            ResourceType::Document,
            Uuid::new_v4(),
            "viewer",
            false,
        );
        assert_eq!(denied.outcome, EventOutcome::Failure);
        assert_eq!(denied.category, EventCategory::Authorization);
    }

    #[test]
    fn test_failed_login_carries_reason() {
        let event = AuditEvent::failed_login("who@example.com", Some("10.0.0.9"), "bad state");
        assert_eq!(event.outcome, EventOutcome::Failure);
        assert_eq!(event.error_message.as_deref(), Some("bad state"));
        assert_eq!(event.action, AuditAction::Login);
    }
}
