//! OpenAI embeddings provider

use crate::config::EmbeddingConfig;
use crate::embedding::{check_dimension, EmbeddingProvider, HttpProviderClient};
use crate::error::{EmbeddingError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "text-embedding-3-small";

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

pub struct OpenAiProvider {
    client: HttpProviderClient,
    base_url: String,
    model: String,
    api_key: String,
    dimension: usize,
}

impl OpenAiProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(EmbeddingError::Provider(
                "OpenAI provider requires an API key".to_string(),
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
impl EmbeddingProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!(batch = texts.len(), model = %self.model, "embedding batch");

        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };
        let headers = vec![("Authorization", format!("Bearer {}", self.api_key))];

        let mut response: EmbeddingResponse =
            self.client.post_json(&url, &request, headers).await?;

        if response.data.len() != texts.len() {
            return Err(EmbeddingError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                response.data.len()
            ))
            .into());
        }

        // The API may return out of order; index restores it
        response.data.sort_by_key(|d| d.index);
        let vectors: Vec<Vec<f32>> = response.data.into_iter().map(|d| d.embedding).collect();
        for vector in &vectors {
            check_dimension(self.dimension, vector)?;
        }
        Ok(vectors)
    }
}
