//! Request-scoped context
//!
//! A `RequestContext` carries the principal, client details and the request
//! deadline through every coordinator call. Audit records are assembled from
//! it instead of reaching into ambient state.

use crate::audit::AuditEvent;
use crate::auth::Principal;
use crate::error::{Result, SentinelError};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub principal: Option<Principal>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub session_id: Option<String>,
    pub request_id: Uuid,
    deadline: Instant,
}

impl RequestContext {
    pub fn new(deadline: Duration) -> Self {
        Self {
            principal: None,
            ip_address: None,
            user_agent: None,
            session_id: None,
            request_id: Uuid::new_v4(),
            deadline: Instant::now() + deadline,
        }
    }

    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = Some(principal);
        self
    }

    pub fn user_id(&self) -> Option<Uuid> {
        self.principal.as_ref().map(|p| p.user_id)
    }

    pub fn email(&self) -> Option<&str> {
        self.principal.as_ref().map(|p| p.email.as_str())
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Run a downstream call under the request deadline. Expiry abandons the
    /// in-flight work and surfaces [`SentinelError::Deadline`].
    pub async fn with_deadline<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout_at(self.deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(SentinelError::Deadline),
        }
    }

    /// Stamp actor fields onto an audit event
    pub fn stamp(&self, event: &mut AuditEvent) {
        if let Some(principal) = &self.principal {
            event.user_id = Some(principal.user_id);
            event.user_email = Some(principal.email.clone());
            if event.role_name.is_none() {
                event.role_name = Some(principal.role.clone());
            }
        }
        event.ip_address = self.ip_address.clone();
        event.user_agent = self.user_agent.clone();
        event.session_id = self.session_id.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditAction, EventCategory, EventOutcome};

    fn principal() -> Principal {
        Principal {
            user_id: Uuid::new_v4(),
            email: "alice@example.com".to_string(),
            tenant_id: "tenant-default".to_string(),
            role: "engineer".to_string(),
            department: "engineering".to_string(),
        }
    }

    #[tokio::test]
    async fn test_deadline_expiry() {
        let ctx = RequestContext::new(Duration::from_millis(10));
        let result: Result<()> = ctx
            .with_deadline(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(SentinelError::Deadline)));
        assert!(ctx.expired());
    }

    #[tokio::test]
    async fn test_fast_work_completes() {
        let ctx = RequestContext::new(Duration::from_secs(5));
        let result = ctx.with_deadline(async { Ok(42) }).await.unwrap();
        assert_eq!(result, 42);
        assert!(!ctx.expired());
    }

    #[test]
    fn test_stamp_copies_actor_fields() {
        let mut ctx = RequestContext::new(Duration::from_secs(5)).with_principal(principal());
        ctx.ip_address = Some("198.51.100.7".to_string());
        ctx.session_id = Some("sess-1".to_string());

        let mut event = AuditEvent::new(
            EventCategory::DataAccess,
            "rag_query",
            AuditAction::Read,
            EventOutcome::Success,
        );
        ctx.stamp(&mut event);
        assert_eq!(event.user_email.as_deref(), Some("alice@example.com"));
        assert_eq!(event.ip_address.as_deref(), Some("198.51.100.7"));
        assert_eq!(event.session_id.as_deref(), Some("sess-1"));
        assert_eq!(event.role_name.as_deref(), Some("engineer"));
    }
}
