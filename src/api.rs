//! REST API surface
//!
//! Provides HTTP endpoints for:
//! - Liveness and readiness probes
//! - OIDC login, callback, registration and logout
//! - Document upload and per-user document listing
//! - RBAC-filtered retrieval queries
//!
//! Every handler builds a [`RequestContext`] from the incoming request and
//! threads it through the coordinators; errors map onto the stable
//! `{error, message, request_id}` envelope.

use crate::audit::{
    AuditAction, AuditEvent, AuditSink, AuthAuditEvent, EventCategory, EventOutcome,
    ModificationAuditEvent, ResourceType,
};
use crate::auth::{OidcClient, Principal, TokenService};
use crate::config::SentinelConfig;
use crate::context::RequestContext;
use crate::embedding;
use crate::error::{AuthError, ErrorKind, Result, SentinelError};
use crate::ingest::{IngestRequest, IngestionCoordinator};
use crate::model::{Classification, DocumentSummary};
use crate::parser::DocumentParser;
use crate::rbac::RbacResolver;
use crate::redact::RedactionPool;
use crate::retrieval::{QueryRequest, RetrievalCoordinator, RetrievedChunk};
use crate::seed::seed_initial_data;
use crate::store::{MetadataStore, VectorStore};
use axum::{
    extract::{Multipart, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

const SESSION_COOKIE: &str = "access_token";

/// Shared application state: process-wide singletons behind `Arc`s,
/// initialized once at startup and torn down in order at shutdown
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<SentinelConfig>,
    pub metadata: Arc<MetadataStore>,
    pub vectors: Arc<VectorStore>,
    pub audit: Arc<AuditSink>,
    pub tokens: Arc<TokenService>,
    pub oidc: Arc<OidcClient>,
    pub redactor: Arc<RedactionPool>,
    pub ingestion: Arc<IngestionCoordinator>,
    pub retrieval: Arc<RetrievalCoordinator>,
}

impl AppState {
    pub async fn initialize(config: SentinelConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| SentinelError::Config(e.to_string()))?;

        let metadata =
            Arc::new(MetadataStore::connect(&config.metadata, &config.tenant).await?);
        seed_initial_data(&metadata, &config.rbac).await?;

        let vectors =
            Arc::new(VectorStore::connect(&config.vector, config.embedding.dimension).await?);
        let audit = Arc::new(AuditSink::connect(&config.audit).await?);
        let embedder = embedding::new_provider(&config.embedding)?;
        let redactor = Arc::new(RedactionPool::new());
        let tokens = Arc::new(TokenService::new(&config.security, &config.tenant.tenant_id));
        let oidc = Arc::new(OidcClient::new(config.oidc.clone()));
        let resolver = Arc::new(RbacResolver::new(&config.rbac));
        let parser = Arc::new(DocumentParser::new());

        let ingestion = Arc::new(IngestionCoordinator::new(
            parser,
            embedder.clone(),
            metadata.clone(),
            vectors.clone(),
            audit.clone(),
            config.retrieval.clone(),
        ));
        let retrieval = Arc::new(RetrievalCoordinator::new(
            resolver,
            embedder,
            metadata.clone(),
            vectors.clone(),
            redactor.clone(),
            audit.clone(),
            config.retrieval.clone(),
        ));

        info!(app = %config.app.name, "application state initialized");
        Ok(Self {
            config: Arc::new(config),
            metadata,
            vectors,
            audit,
            tokens,
            oidc,
            redactor,
            ingestion,
            retrieval,
        })
    }

    /// Ordered teardown: flush the audit buffer first, then stop the
    /// redaction pool; store pools close when the process exits
    pub async fn shutdown(&self) {
        self.audit.shutdown().await;
        self.redactor.shutdown();
        info!("application state shut down");
    }
}

//       RESPONSE & ERROR ENVELOPES
// --------------------------------------

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    pub request_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Error response carrying the stable taxonomy code
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

fn api_error(err: SentinelError, request_id: Uuid, debug: bool) -> ApiError {
    let kind = err.kind();
    // Internal details stay out of production responses
    let message = if kind == ErrorKind::Internal && !debug {
        "internal error".to_string()
    } else {
        err.to_string()
    };
    ApiError {
        status: StatusCode::from_u16(kind.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        body: ErrorBody {
            error: kind.code().to_string(),
            message,
            request_id,
            details: None,
        },
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct RegistrationRequiredResponse {
    pub registration_required: bool,
    pub registration_token: String,
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub registration_token: String,
    pub role: String,
    pub department: String,
}

#[derive(Debug, Serialize)]
pub struct RoleOption {
    pub role_name: String,
    pub department_name: String,
}

#[derive(Debug, Serialize)]
pub struct RegistrationOptionsResponse {
    pub departments: Vec<String>,
    pub roles: Vec<RoleOption>,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub doc_id: Uuid,
    pub parent_chunks: usize,
    pub child_chunks: usize,
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct ApiQueryRequest {
    pub user_query: String,
    #[serde(default)]
    pub k: Option<usize>,
    #[serde(default)]
    pub expand_parents: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct ApiQueryResponse {
    pub results: Vec<RetrievedChunk>,
    pub count: usize,
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
}

//       REQUEST PLUMBING
// ----------------------------

fn build_context(state: &AppState, headers: &HeaderMap) -> RequestContext {
    let mut ctx = RequestContext::new(Duration::from_secs(
        state.config.server.request_deadline_secs,
    ));
    ctx.ip_address = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.split(',').next().unwrap_or(s).trim().to_string());
    ctx.user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    ctx.session_id = cookie_value(headers, SESSION_COOKIE);
    ctx
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

fn session_cookie(token: &str, max_age_secs: i64) -> HeaderValue {
    let cookie = format!(
        "{}={}; HttpOnly; Secure; SameSite=Lax; Path=/; Max-Age={}",
        SESSION_COOKIE, token, max_age_secs
    );
    HeaderValue::from_str(&cookie).unwrap_or_else(|_| HeaderValue::from_static(""))
}

/// Resolve the principal, header token winning over the cookie. Failures
/// fail closed and are audited as failed authentication.
async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Principal> {
    let token = bearer_token(headers)
        .or_else(|| cookie_value(headers, SESSION_COOKIE))
        .ok_or(AuthError::NotAuthenticated)?;

    match state.tokens.verify_session(&token) {
        Ok(principal) => Ok(principal),
        Err(err) => {
            let event =
                AuditEvent::failed_login("unknown", None, "session token rejected");
            if let Err(e) = state.audit.log(event).await {
                warn!(error = %e, "failed to audit rejected session token");
            }
            Err(err)
        }
    }
}

async fn audit_auth_event(
    state: &AppState,
    ctx: &RequestContext,
    email: &str,
    user_id: Option<Uuid>,
    event_type: &str,
    action: AuditAction,
    outcome: EventOutcome,
) {
    let mut event = AuditEvent::new(EventCategory::Authentication, event_type, action, outcome);
    ctx.stamp(&mut event);
    event.user_id = user_id;
    event.user_email = Some(email.to_string());

    match state.audit.log(event).await {
        Ok(log_id) => {
            let mut auth = AuthAuditEvent::new(email, "oidc", event_type);
            auth.user_id = user_id;
            auth.ip_address = ctx.ip_address.clone();
            auth.user_agent = ctx.user_agent.clone();
            if let Err(e) = state.audit.log_auth(log_id, auth).await {
                warn!(error = %e, "failed to attach auth audit record");
            }
        }
        Err(e) => warn!(error = %e, "failed to audit auth event"),
    }
}

//       HANDLERS
// --------------------

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: state.config.app.version.clone(),
    })
}

async fn health_live_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "alive" }))
}

async fn health_ready_handler(State(state): State<AppState>) -> Response {
    // Readiness means both stores answer
    let metadata_ok = state.metadata.list_departments().await.is_ok();
    let vectors_ok = state.vectors.collection_info().await.is_ok();
    let body = serde_json::json!({
        "status": if metadata_ok && vectors_ok { "ready" } else { "degraded" },
        "metadata_store": metadata_ok,
        "vector_store": vectors_ok,
    });
    let status = if metadata_ok && vectors_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

async fn auth_login_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> std::result::Result<Redirect, ApiError> {
    let ctx = build_context(&state, &headers);
    let debug = state.config.app.debug;

    if !state.oidc.is_configured() {
        return Err(api_error(
            AuthError::Provider("OIDC is not configured".to_string()).into(),
            ctx.request_id,
            debug,
        ));
    }

    let metadata = state
        .oidc
        .discover()
        .await
        .map_err(|e| api_error(e, ctx.request_id, debug))?;
    let state_token = state
        .tokens
        .issue_state()
        .map_err(|e| api_error(e, ctx.request_id, debug))?;

    Ok(Redirect::temporary(
        &state.oidc.authorization_url(&metadata, &state_token),
    ))
}

async fn auth_callback_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<CallbackParams>,
) -> std::result::Result<Response, ApiError> {
    let ctx = build_context(&state, &headers);
    let debug = state.config.app.debug;
    let fail = |e: SentinelError| api_error(e, ctx.request_id, debug);

    let state_token = params
        .state
        .ok_or_else(|| fail(SentinelError::Validation("missing state parameter".into())))?;
    if state.tokens.verify_state(&state_token).is_err() {
        let event = AuditEvent::failed_login(
            "unknown",
            ctx.ip_address.as_deref(),
            "invalid or expired state parameter",
        );
        if let Err(e) = state.audit.log(event).await {
            warn!(error = %e, "failed to audit state rejection");
        }
        return Err(fail(AuthError::InvalidState.into()));
    }

    let code = params
        .code
        .ok_or_else(|| fail(SentinelError::Validation("missing code parameter".into())))?;

    let provider = state.oidc.discover().await.map_err(fail)?;
    let access_token = state
        .oidc
        .exchange_code(&provider, &code)
        .await
        .map_err(fail)?;
    let info = state
        .oidc
        .userinfo(&provider, &access_token)
        .await
        .map_err(fail)?;

    match state.metadata.get_user_by_email(&info.email).await.map_err(fail)? {
        Some(user) => {
            let pairs = state
                .metadata
                .get_user_access_pairs(user.user_id)
                .await
                .map_err(fail)?;
            let (department, role) = pairs
                .first()
                .map(|p| (p.department.clone(), p.role.clone()))
                .unwrap_or_default();

            let principal = Principal {
                user_id: user.user_id,
                email: user.email.clone(),
                tenant_id: state.config.tenant.tenant_id.clone(),
                role,
                department,
            };
            let token = state.tokens.issue_session(&principal).map_err(fail)?;

            audit_auth_event(
                &state,
                &ctx,
                &user.email,
                Some(user.user_id),
                "login_success",
                AuditAction::Login,
                EventOutcome::Success,
            )
            .await;

            let expires_in = state.config.security.session_expiry_minutes * 60;
            let mut response = Json(SessionResponse {
                access_token: token.clone(),
                token_type: "bearer".to_string(),
                expires_in,
                email: user.email,
            })
            .into_response();
            response
                .headers_mut()
                .insert(header::SET_COOKIE, session_cookie(&token, expires_in));
            Ok(response)
        }
        None => {
            // Half-authenticated: hand out a short-lived registration token
            let registration_token = state
                .tokens
                .issue_registration(&info.email, info.name.as_deref())
                .map_err(fail)?;

            audit_auth_event(
                &state,
                &ctx,
                &info.email,
                None,
                "registration_required",
                AuditAction::Login,
                EventOutcome::Partial,
            )
            .await;

            Ok(Json(RegistrationRequiredResponse {
                registration_required: true,
                registration_token,
                email: info.email,
            })
            .into_response())
        }
    }
}

async fn register_options_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> std::result::Result<Json<RegistrationOptionsResponse>, ApiError> {
    let ctx = build_context(&state, &headers);
    let debug = state.config.app.debug;

    let departments = state
        .metadata
        .list_departments()
        .await
        .map_err(|e| api_error(e, ctx.request_id, debug))?
        .into_iter()
        .map(|d| d.name)
        .collect();
    let roles = state
        .metadata
        .list_roles()
        .await
        .map_err(|e| api_error(e, ctx.request_id, debug))?
        .into_iter()
        .map(|(role_name, department_name)| RoleOption {
            role_name,
            department_name,
        })
        .collect();

    Ok(Json(RegistrationOptionsResponse { departments, roles }))
}

async fn auth_register_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<RegisterRequest>,
) -> std::result::Result<Response, ApiError> {
    let ctx = build_context(&state, &headers);
    let debug = state.config.app.debug;
    let fail = |e: SentinelError| api_error(e, ctx.request_id, debug);

    // Only a valid registration token may reach this endpoint
    let pending = state
        .tokens
        .verify_registration(&request.registration_token)
        .map_err(fail)?;

    // Validate the requested grant before touching the user table
    let known_roles = state.metadata.list_roles().await.map_err(fail)?;
    if !known_roles
        .iter()
        .any(|(role, department)| role == &request.role && department == &request.department)
    {
        return Err(fail(SentinelError::NotFound(format!(
            "role {} in department {}",
            request.role, request.department
        ))));
    }

    let user_id = state
        .metadata
        .create_user(&pending.email, pending.full_name.as_deref())
        .await
        .map_err(fail)?;
    state
        .metadata
        .assign_role(user_id, &request.department, &request.role)
        .await
        .map_err(fail)?;

    audit_auth_event(
        &state,
        &ctx,
        &pending.email,
        Some(user_id),
        "user_registered",
        AuditAction::Login,
        EventOutcome::Success,
    )
    .await;
    if let Ok(log_id) = state
        .audit
        .log({
            let mut event = AuditEvent::new(
                EventCategory::Modification,
                "user_registered",
                AuditAction::Write,
                EventOutcome::Success,
            );
            ctx.stamp(&mut event);
            event.user_id = Some(user_id);
            event.user_email = Some(pending.email.clone());
            event.resource_type = Some(ResourceType::User);
            event.resource_id = Some(user_id);
            event
        })
        .await
    {
        let modification = ModificationAuditEvent {
            user_id: Some(user_id),
            table_name: "users".to_string(),
            record_id: user_id,
            operation: "INSERT".to_string(),
            old_values: None,
            new_values: Some(serde_json::json!({
                "email": pending.email,
                "department": request.department,
                "role": request.role,
            })),
            changed_fields: Vec::new(),
            reason: None,
            approved_by: None,
            metadata: None,
        };
        if let Err(e) = state.audit.log_modification(log_id, modification).await {
            warn!(error = %e, "failed to attach modification record for registration");
        }
    }

    let principal = Principal {
        user_id,
        email: pending.email.clone(),
        tenant_id: state.config.tenant.tenant_id.clone(),
        role: request.role,
        department: request.department,
    };
    let token = state.tokens.issue_session(&principal).map_err(fail)?;
    let expires_in = state.config.security.session_expiry_minutes * 60;

    let mut response = Json(SessionResponse {
        access_token: token.clone(),
        token_type: "bearer".to_string(),
        expires_in,
        email: pending.email,
    })
    .into_response();
    response
        .headers_mut()
        .insert(header::SET_COOKIE, session_cookie(&token, expires_in));
    Ok(response)
}

async fn auth_logout_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let mut ctx = build_context(&state, &headers);
    if let Ok(principal) = authenticate(&state, &headers).await {
        let email = principal.email.clone();
        let user_id = principal.user_id;
        ctx = ctx.with_principal(principal);
        audit_auth_event(
            &state,
            &ctx,
            &email,
            Some(user_id),
            "logout",
            AuditAction::Logout,
            EventOutcome::Success,
        )
        .await;
    }

    let mut response =
        Json(serde_json::json!({ "status": "logged_out" })).into_response();
    response
        .headers_mut()
        .insert(header::SET_COOKIE, session_cookie("", 0));
    response
}

async fn current_user_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> std::result::Result<Json<Principal>, ApiError> {
    let ctx = build_context(&state, &headers);
    let principal = authenticate(&state, &headers)
        .await
        .map_err(|e| api_error(e, ctx.request_id, state.config.app.debug))?;
    Ok(Json(principal))
}

async fn user_documents_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> std::result::Result<Json<Vec<DocumentSummary>>, ApiError> {
    let ctx = build_context(&state, &headers);
    let debug = state.config.app.debug;
    let principal = authenticate(&state, &headers)
        .await
        .map_err(|e| api_error(e, ctx.request_id, debug))?;

    let documents = state
        .metadata
        .get_documents_by_uploader(principal.user_id)
        .await
        .map_err(|e| api_error(e, ctx.request_id, debug))?;
    Ok(Json(documents))
}

async fn upload_document_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> std::result::Result<Json<UploadResponse>, ApiError> {
    let ctx = build_context(&state, &headers);
    let debug = state.config.app.debug;
    let request_id = ctx.request_id;
    let fail = move |e: SentinelError| api_error(e, request_id, debug);

    let principal = authenticate(&state, &headers).await.map_err(fail)?;
    let ctx = ctx.with_principal(principal);

    let mut filename = None;
    let mut bytes = None;
    let mut title = None;
    let mut description = String::new();
    let mut department = None;
    let mut classification = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| fail(SentinelError::Validation(format!("bad multipart body: {}", e))))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                filename = field.file_name().map(str::to_string);
                bytes = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| {
                            fail(SentinelError::Validation(format!(
                                "failed to read file field: {}",
                                e
                            )))
                        })?
                        .to_vec(),
                );
            }
            Some(name) => {
                let name = name.to_string();
                let value = field.text().await.map_err(|e| {
                    fail(SentinelError::Validation(format!(
                        "failed to read field {}: {}",
                        name, e
                    )))
                })?;
                match name.as_str() {
                    "title" => title = Some(value),
                    "description" => description = value,
                    "department" => department = Some(value),
                    "classification" => classification = Some(value),
                    _ => {}
                }
            }
            None => {}
        }
    }

    let missing =
        |what: &str| fail(SentinelError::Validation(format!("missing field: {}", what)));
    let filename = filename.ok_or_else(|| missing("file"))?;
    let bytes = bytes.ok_or_else(|| missing("file"))?;
    let title = title.ok_or_else(|| missing("title"))?;
    let department = department.ok_or_else(|| missing("department"))?;
    let classification = classification.ok_or_else(|| missing("classification"))?;
    let classification = Classification::from_str(&classification)
        .map_err(|e| fail(SentinelError::Validation(e)))?;

    let receipt = state
        .ingestion
        .ingest(
            &ctx,
            IngestRequest {
                filename,
                bytes,
                title,
                description,
                department,
                classification,
                hierarchical: None,
            },
        )
        .await
        .map_err(fail)?;

    Ok(Json(UploadResponse {
        doc_id: receipt.doc_id,
        parent_chunks: receipt.parent_chunks,
        child_chunks: receipt.child_chunks,
        status: receipt.outcome.as_str().to_string(),
    }))
}

async fn query_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ApiQueryRequest>,
) -> std::result::Result<Json<ApiQueryResponse>, ApiError> {
    let ctx = build_context(&state, &headers);
    let debug = state.config.app.debug;
    let request_id = ctx.request_id;
    let fail = move |e: SentinelError| api_error(e, request_id, debug);

    let principal = authenticate(&state, &headers).await.map_err(fail)?;
    let ctx = ctx.with_principal(principal);

    if request.user_query.trim().is_empty() {
        return Err(fail(SentinelError::Validation(
            "user_query cannot be empty".into(),
        )));
    }

    let response = state
        .retrieval
        .query(
            &ctx,
            QueryRequest {
                question: request.user_query,
                k: request.k,
                expand_parents: request.expand_parents,
            },
        )
        .await
        .map_err(fail)?;

    Ok(Json(ApiQueryResponse {
        count: response.results.len(),
        status: response.outcome.as_str().to_string(),
        results: response.results,
    }))
}

//       ROUTER & SERVER
// ---------------------------

fn cors_layer(config: &SentinelConfig) -> CorsLayer {
    if config.server.cors_origins.iter().any(|o| o == "*") {
        CorsLayer::permissive()
    } else {
        let origins: Vec<HeaderValue> = config
            .server
            .cors_origins
            .iter()
            .filter_map(|o| HeaderValue::from_str(o).ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any)
    }
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config);
    Router::new()
        // Health checks
        .route("/health", get(health_handler))
        .route("/health/ready", get(health_ready_handler))
        .route("/health/live", get(health_live_handler))
        // Authentication
        .route("/auth/login", get(auth_login_handler))
        .route("/auth/callback", get(auth_callback_handler))
        .route("/auth/register", post(auth_register_handler))
        .route("/auth/register/options", get(register_options_handler))
        .route("/auth/logout", post(auth_logout_handler))
        // Principal endpoints
        .route("/api/user", post(current_user_handler))
        .route("/api/user/docs", post(user_documents_handler))
        // Documents and retrieval
        .route("/api/documents/upload", post(upload_document_handler))
        .route("/api/query", post(query_handler))
        .with_state(state)
        // Add middleware
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Bind and serve until a shutdown signal arrives
pub async fn start_server(state: AppState) -> Result<()> {
    let addr = format!(
        "{}:{}",
        state.config.server.host, state.config.server.port
    );
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on {}", addr);

    let shutdown_state = state.clone();
    let app = create_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            shutdown_state.shutdown().await;
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SentinelConfig;
    use crate::embedding::ProviderKind;
    use axum::body::Body;
    use axum::http::Request;
    use std::collections::HashMap;
    use tower::ServiceExt;

    fn test_config() -> SentinelConfig {
        let mut config = SentinelConfig::default();
        config.metadata.database_url = "sqlite::memory:".to_string();
        config.vector.database_url = "sqlite::memory:".to_string();
        config.audit.database_url = "sqlite::memory:".to_string();
        config.audit.workers = 1;
        config.embedding.provider = ProviderKind::Fake;
        config.embedding.dimension = 64;
        config.security.secret_key = "a-test-signing-key-of-sufficient-length".to_string();
        config.rbac.departments = vec!["engineering".to_string()];
        config.rbac.roles = HashMap::from([(
            "engineering".to_string(),
            vec!["engineer".to_string()],
        )]);
        config.rbac.access_matrix = HashMap::from([(
            "internal".to_string(),
            HashMap::from([("engineering".to_string(), vec!["engineer".to_string()])]),
        )]);
        config
    }

    #[test]
    fn test_cookie_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; access_token=abc123; lang=en"),
        );
        assert_eq!(
            cookie_value(&headers, SESSION_COOKIE).as_deref(),
            Some("abc123")
        );
        assert_eq!(cookie_value(&headers, "missing"), None);
    }

    #[test]
    fn test_bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer tok-1"),
        );
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("access_token=cookie-tok"),
        );
        // Header wins over cookie
        assert_eq!(bearer_token(&headers).as_deref(), Some("tok-1"));
    }

    #[test]
    fn test_error_envelope_mapping() {
        let request_id = Uuid::new_v4();
        let err = api_error(
            SentinelError::Auth(AuthError::NotAuthenticated),
            request_id,
            true,
        );
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
        assert_eq!(err.body.error, "authentication_error");
        assert_eq!(err.body.request_id, request_id);
    }

    #[test]
    fn test_internal_errors_redacted_in_production() {
        let err = api_error(
            SentinelError::Config("secret dsn leaked".to_string()),
            Uuid::new_v4(),
            false,
        );
        assert_eq!(err.body.message, "internal error");

        let verbose = api_error(
            SentinelError::Config("secret dsn leaked".to_string()),
            Uuid::new_v4(),
            true,
        );
        assert!(verbose.body.message.contains("secret dsn leaked"));
    }

    #[tokio::test]
    async fn test_health_endpoints() {
        let state = AppState::initialize(test_config()).await.unwrap();
        let app = create_router(state.clone());

        for path in ["/health", "/health/ready", "/health/live"] {
            let response = app
                .clone()
                .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{} not ok", path);
        }
        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_protected_endpoint_requires_session() {
        let state = AppState::initialize(test_config()).await.unwrap();
        let app = create_router(state.clone());

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/user")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_login_without_oidc_is_unavailable() {
        let state = AppState::initialize(test_config()).await.unwrap();
        let app = create_router(state.clone());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/auth/login")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        state.shutdown().await;
    }
}
