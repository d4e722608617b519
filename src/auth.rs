//! Authentication: session tokens, registration tokens, OIDC state and the
//! identity-provider client
//!
//! All tokens are HS256-signed with the deployment secret. Verification
//! fails closed: any decoding problem is an authentication failure, never a
//! pass-through. A registration token is a half-authenticated state that can
//! only complete registration, nothing else.

use crate::config::{OidcConfig, SecurityConfig};
use crate::error::{AuthError, Result};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// A fully authenticated principal, reconstructed from session claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: Uuid,
    pub email: String,
    pub tenant_id: String,
    pub role: String,
    pub department: String,
}

/// A principal that passed the identity provider but has no account yet.
/// May call registration and nothing else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingPrincipal {
    pub email: String,
    pub full_name: Option<String>,
    pub tenant_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionClaims {
    sub: String,
    user_id: Uuid,
    tenant_id: String,
    role: String,
    department: String,
    token_use: String,
    exp: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistrationClaims {
    sub: String,
    full_name: Option<String>,
    tenant_id: String,
    token_use: String,
    exp: i64,
}

/// Signed state parameter carried through the OIDC redirect
#[derive(Debug, Serialize, Deserialize)]
pub struct StateClaims {
    pub tenant_id: String,
    pub nonce: String,
    token_use: String,
    iat: i64,
    exp: i64,
}

const USE_SESSION: &str = "session";
const USE_REGISTRATION: &str = "registration";
const USE_STATE: &str = "state";

/// Issues and verifies the three token kinds
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    session_expiry: Duration,
    registration_expiry: Duration,
    state_max_age: Duration,
    tenant_id: String,
}

impl TokenService {
    pub fn new(security: &SecurityConfig, tenant_id: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(security.secret_key.as_bytes()),
            decoding: DecodingKey::from_secret(security.secret_key.as_bytes()),
            session_expiry: Duration::minutes(security.session_expiry_minutes),
            registration_expiry: Duration::minutes(security.registration_expiry_minutes),
            state_max_age: Duration::minutes(security.state_max_age_minutes),
            tenant_id: tenant_id.to_string(),
        }
    }

    fn validation() -> Validation {
        Validation::new(Algorithm::HS256)
    }

    pub fn issue_session(&self, principal: &Principal) -> Result<String> {
        let claims = SessionClaims {
            sub: principal.email.clone(),
            user_id: principal.user_id,
            tenant_id: principal.tenant_id.clone(),
            role: principal.role.clone(),
            department: principal.department.clone(),
            token_use: USE_SESSION.to_string(),
            exp: (Utc::now() + self.session_expiry).timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| AuthError::Provider(format!("failed to sign session token: {}", e)).into())
    }

    pub fn verify_session(&self, token: &str) -> Result<Principal> {
        let data = decode::<SessionClaims>(token, &self.decoding, &Self::validation())
            .map_err(|_| AuthError::InvalidToken)?;
        let claims = data.claims;
        if claims.token_use != USE_SESSION || claims.tenant_id != self.tenant_id {
            return Err(AuthError::InvalidToken.into());
        }
        Ok(Principal {
            user_id: claims.user_id,
            email: claims.sub,
            tenant_id: claims.tenant_id,
            role: claims.role,
            department: claims.department,
        })
    }

    pub fn issue_registration(&self, email: &str, full_name: Option<&str>) -> Result<String> {
        let claims = RegistrationClaims {
            sub: email.to_string(),
            full_name: full_name.map(str::to_string),
            tenant_id: self.tenant_id.clone(),
            token_use: USE_REGISTRATION.to_string(),
            exp: (Utc::now() + self.registration_expiry).timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding).map_err(|e| {
            AuthError::Provider(format!("failed to sign registration token: {}", e)).into()
        })
    }

    pub fn verify_registration(&self, token: &str) -> Result<PendingPrincipal> {
        let data = decode::<RegistrationClaims>(token, &self.decoding, &Self::validation())
            .map_err(|_| AuthError::InvalidToken)?;
        let claims = data.claims;
        if claims.token_use != USE_REGISTRATION || claims.tenant_id != self.tenant_id {
            return Err(AuthError::InvalidToken.into());
        }
        Ok(PendingPrincipal {
            email: claims.sub,
            full_name: claims.full_name,
            tenant_id: claims.tenant_id,
        })
    }

    pub fn issue_state(&self) -> Result<String> {
        let now = Utc::now();
        let claims = StateClaims {
            tenant_id: self.tenant_id.clone(),
            nonce: Uuid::new_v4().to_string(),
            token_use: USE_STATE.to_string(),
            iat: now.timestamp(),
            exp: (now + self.state_max_age).timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| AuthError::Provider(format!("failed to sign state token: {}", e)).into())
    }

    pub fn verify_state(&self, token: &str) -> Result<StateClaims> {
        let data = decode::<StateClaims>(token, &self.decoding, &Self::validation())
            .map_err(|_| AuthError::InvalidState)?;
        let claims = data.claims;
        if claims.token_use != USE_STATE || claims.tenant_id != self.tenant_id {
            return Err(AuthError::InvalidState.into());
        }
        // exp validation already bounds the age; iat being in the future
        // means clock games, reject
        if claims.iat > Utc::now().timestamp() + 30 {
            return Err(AuthError::InvalidState.into());
        }
        Ok(claims)
    }
}

/// OIDC discovery document, reduced to the endpoints the flow needs
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderMetadata {
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub userinfo_endpoint: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Claims read from the provider's userinfo endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct UserInfo {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Minimal authorization-code-flow client over the discovery document
pub struct OidcClient {
    http: reqwest::Client,
    config: OidcConfig,
}

impl OidcClient {
    pub fn new(config: OidcConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_configured()
    }

    pub async fn discover(&self) -> Result<ProviderMetadata> {
        let metadata = self
            .http
            .get(&self.config.server_metadata_url)
            .send()
            .await
            .map_err(|e| AuthError::Provider(format!("discovery failed: {}", e)))?
            .error_for_status()
            .map_err(|e| AuthError::Provider(format!("discovery failed: {}", e)))?
            .json::<ProviderMetadata>()
            .await
            .map_err(|e| AuthError::Provider(format!("bad discovery document: {}", e)))?;
        debug!("fetched OIDC discovery document");
        Ok(metadata)
    }

    /// Build the provider authorization URL carrying our signed state
    pub fn authorization_url(&self, metadata: &ProviderMetadata, state: &str) -> String {
        format!(
            "{}?response_type=code&client_id={}&redirect_uri={}&scope=openid%20email%20profile&state={}",
            metadata.authorization_endpoint,
            urlencode(&self.config.client_id),
            urlencode(&self.config.redirect_url),
            urlencode(state),
        )
    }

    /// Exchange the authorization code for an access token
    pub async fn exchange_code(&self, metadata: &ProviderMetadata, code: &str) -> Result<String> {
        let response = self
            .http
            .post(&metadata.token_endpoint)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.config.redirect_url.as_str()),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| AuthError::Provider(format!("code exchange failed: {}", e)))?
            .error_for_status()
            .map_err(|e| AuthError::Provider(format!("code exchange rejected: {}", e)))?
            .json::<TokenResponse>()
            .await
            .map_err(|e| AuthError::Provider(format!("bad token response: {}", e)))?;
        Ok(response.access_token)
    }

    pub async fn userinfo(&self, metadata: &ProviderMetadata, access_token: &str) -> Result<UserInfo> {
        self.http
            .get(&metadata.userinfo_endpoint)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| AuthError::Provider(format!("userinfo failed: {}", e)))?
            .error_for_status()
            .map_err(|e| AuthError::Provider(format!("userinfo rejected: {}", e)))?
            .json::<UserInfo>()
            .await
            .map_err(|e| AuthError::Provider(format!("bad userinfo response: {}", e)).into())
    }
}

fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> TokenService {
        let security = SecurityConfig {
            secret_key: "a-test-signing-key-of-sufficient-length".to_string(),
            ..SecurityConfig::default()
        };
        TokenService::new(&security, "tenant-default")
    }

    fn principal() -> Principal {
        Principal {
            user_id: Uuid::new_v4(),
            email: "alice@example.com".to_string(),
            tenant_id: "tenant-default".to_string(),
            role: "engineer".to_string(),
            department: "engineering".to_string(),
        }
    }

    #[test]
    fn test_session_roundtrip() {
        let tokens = service();
        let original = principal();
        let token = tokens.issue_session(&original).unwrap();
        let verified = tokens.verify_session(&token).unwrap();
        assert_eq!(verified.user_id, original.user_id);
        assert_eq!(verified.email, original.email);
        assert_eq!(verified.role, "engineer");
    }

    #[test]
    fn test_garbage_token_fails_closed() {
        let tokens = service();
        assert!(tokens.verify_session("not-a-token").is_err());
        assert!(tokens.verify_session("").is_err());
    }

    #[test]
    fn test_registration_token_is_not_a_session() {
        let tokens = service();
        let registration = tokens
            .issue_registration("new@example.com", Some("New User"))
            .unwrap();
        assert!(tokens.verify_session(&registration).is_err());

        let pending = tokens.verify_registration(&registration).unwrap();
        assert_eq!(pending.email, "new@example.com");
        assert_eq!(pending.full_name.as_deref(), Some("New User"));
    }

    #[test]
    fn test_session_token_is_not_a_registration() {
        let tokens = service();
        let session = tokens.issue_session(&principal()).unwrap();
        assert!(tokens.verify_registration(&session).is_err());
    }

    #[test]
    fn test_state_roundtrip_and_kind_check() {
        let tokens = service();
        let state = tokens.issue_state().unwrap();
        let claims = tokens.verify_state(&state).unwrap();
        assert_eq!(claims.tenant_id, "tenant-default");
        assert!(!claims.nonce.is_empty());

        let session = tokens.issue_session(&principal()).unwrap();
        assert!(tokens.verify_state(&session).is_err());
    }

    #[test]
    fn test_foreign_tenant_rejected() {
        let security = SecurityConfig {
            secret_key: "a-test-signing-key-of-sufficient-length".to_string(),
            ..SecurityConfig::default()
        };
        let ours = TokenService::new(&security, "tenant-default");
        let theirs = TokenService::new(&security, "tenant-other");

        let mut foreign = principal();
        foreign.tenant_id = "tenant-other".to_string();
        let token = theirs.issue_session(&foreign).unwrap();
        assert!(ours.verify_session(&token).is_err());
    }

    #[test]
    fn test_urlencode() {
        assert_eq!(urlencode("abc-123"), "abc-123");
        assert_eq!(
            urlencode("https://a.example/cb?x=1"),
            "https%3A%2F%2Fa.example%2Fcb%3Fx%3D1"
        );
    }
}
