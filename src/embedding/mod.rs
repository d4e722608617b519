//! Embedding provider abstraction
//!
//! All providers normalise to fixed-dimension `f32` vectors. The provider is
//! selected once at startup; switching providers invalidates existing
//! indexes because cosine geometry does not transfer between models.

pub mod fake;
pub mod gemini;
pub mod openai;

use crate::config::EmbeddingConfig;
use crate::error::{EmbeddingError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

pub use fake::FakeProvider;
pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;

/// Supported embedding providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Gemini,
    #[default]
    Fake,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::OpenAi => write!(f, "openai"),
            ProviderKind::Gemini => write!(f, "gemini"),
            ProviderKind::Fake => write!(f, "fake"),
        }
    }
}

/// Trait every embedding provider implements
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Provider name for logs and audit metadata
    fn name(&self) -> &str;

    /// Fixed dimensionality of every vector this provider emits
    fn dimension(&self) -> usize;

    /// Embed a batch of document chunks, preserving order
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single query string
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_documents(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| EmbeddingError::InvalidResponse("empty embedding batch".into()).into())
    }
}

/// Construct the provider named by the configuration. Unknown kinds are
/// rejected at config deserialization, so this cannot fall through.
pub fn new_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    let provider: Arc<dyn EmbeddingProvider> = match config.provider {
        ProviderKind::OpenAi => Arc::new(OpenAiProvider::new(config)?),
        ProviderKind::Gemini => Arc::new(GeminiProvider::new(config)?),
        ProviderKind::Fake => Arc::new(FakeProvider::new(config.dimension)),
    };
    debug!(provider = provider.name(), dimension = provider.dimension(), "constructed embedding provider");
    Ok(provider)
}

/// Verify a response vector against the configured dimensionality
pub(crate) fn check_dimension(expected: usize, vector: &[f32]) -> Result<()> {
    if vector.len() != expected {
        return Err(EmbeddingError::InvalidDimension {
            expected,
            actual: vector.len(),
        }
        .into());
    }
    Ok(())
}

/// Shared HTTP client for hosted providers
pub struct HttpProviderClient {
    client: Client,
    timeout: Duration,
}

impl HttpProviderClient {
    pub fn new(timeout_secs: u64) -> Result<Self> {
        let timeout = Duration::from_secs(timeout_secs);
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EmbeddingError::Provider(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, timeout })
    }

    /// Execute a POST request with a JSON body
    pub async fn post_json<T: Serialize, R: DeserializeOwned>(
        &self,
        url: &str,
        body: &T,
        headers: Vec<(&str, String)>,
    ) -> Result<R> {
        debug!("making POST request to: {}", url);

        let mut request = self.client.post(url).json(body);
        for (key, value) in headers {
            request = request.header(key, value);
        }

        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| EmbeddingError::Timeout)?
            .map_err(|e| EmbeddingError::Provider(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| format!("HTTP {} error", status));
            error!("embedding API error ({}): {}", status, error_text);

            return Err(match status.as_u16() {
                401 | 403 => EmbeddingError::Unauthorized,
                _ => EmbeddingError::Provider(error_text),
            }
            .into());
        }

        response
            .json()
            .await
            .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()).into())
    }
}
