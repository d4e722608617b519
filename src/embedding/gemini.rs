//! Google Gemini embeddings provider
//!
//! Gemini uses a different request shape than the OpenAI-style providers, so
//! it implements the trait directly instead of sharing a request body.

use crate::config::EmbeddingConfig;
use crate::embedding::{check_dimension, EmbeddingProvider, HttpProviderClient};
use crate::error::{EmbeddingError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_MODEL: &str = "models/embedding-001";

#[derive(Debug, Serialize)]
struct BatchEmbedRequest {
    requests: Vec<EmbedContentRequest>,
}

#[derive(Debug, Serialize)]
struct EmbedContentRequest {
    model: String,
    content: Content,
}

#[derive(Debug, Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct Part {
    text: String,
}

#[derive(Debug, Deserialize)]
struct BatchEmbedResponse {
    embeddings: Vec<ContentEmbedding>,
}

#[derive(Debug, Deserialize)]
struct ContentEmbedding {
    values: Vec<f32>,
}

pub struct GeminiProvider {
    client: HttpProviderClient,
    base_url: String,
    model: String,
    api_key: String,
    dimension: usize,
}

impl GeminiProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(EmbeddingError::Provider(
                "Gemini provider requires an API key".to_string(),
            )
            .into());
        }
        let model = if config.model_name.is_empty() {
            DEFAULT_MODEL.to_string()
        } else {
            config.model_name.clone()
        };
        Ok(Self {
            client: HttpProviderClient::new(config.timeout_secs)?,
            base_url: DEFAULT_BASE_URL.to_string(),
            model,
            api_key: config.api_key.clone(),
            dimension: config.dimension,
        })
    }

    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }
}

#[async_trait]
impl EmbeddingProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!(batch = texts.len(), model = %self.model, "embedding batch");

        let url = format!(
            "{}/{}:batchEmbedContents?key={}",
            self.base_url.trim_end_matches('/'),
            self.model,
            self.api_key
        );
        let request = BatchEmbedRequest {
            requests: texts
                .iter()
                .map(|text| EmbedContentRequest {
                    model: self.model.clone(),
                    content: Content {
                        parts: vec![Part { text: text.clone() }],
                    },
                })
                .collect(),
        };

        let response: BatchEmbedResponse =
            self.client.post_json(&url, &request, Vec::new()).await?;

        if response.embeddings.len() != texts.len() {
            return Err(EmbeddingError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                response.embeddings.len()
            ))
            .into());
        }

        let vectors: Vec<Vec<f32>> = response.embeddings.into_iter().map(|e| e.values).collect();
        for vector in &vectors {
            check_dimension(self.dimension, vector)?;
        }
        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::ProviderKind;
    use wiremock::matchers::{method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_requires_api_key() {
        let config = EmbeddingConfig {
            provider: ProviderKind::Gemini,
            ..EmbeddingConfig::default()
        };
        assert!(GeminiProvider::new(&config).is_err());
    }

    #[tokio::test]
    async fn test_embed_documents_roundtrip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(r".*:batchEmbedContents$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "embeddings": [
                    {"values": [0.5, 0.5]},
                    {"values": [0.1, 0.9]},
                ]
            })))
            .mount(&server)
            .await;

        let config = EmbeddingConfig {
            provider: ProviderKind::Gemini,
            api_key: "test-key".to_string(),
            dimension: 2,
            ..EmbeddingConfig::default()
        };
        let provider = GeminiProvider::new(&config)
            .unwrap()
            .with_base_url(server.uri());

        let vectors = provider
            .embed_documents(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0], vec![0.5, 0.5]);
    }
}
