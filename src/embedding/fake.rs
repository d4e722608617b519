//! Deterministic lexical embedding provider for tests and development
//!
//! Generates reproducible pseudo-embeddings from word-level and character
//! trigram hashing, normalised to unit length so cosine similarity behaves.
//! Texts sharing vocabulary land near each other; this is lexical overlap,
//! not semantics.

use crate::embedding::EmbeddingProvider;
use crate::error::Result;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

pub struct FakeProvider {
    dimension: usize,
}

impl FakeProvider {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn hash_str(s: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        s.hash(&mut hasher);
        hasher.finish()
    }

    fn generate(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0f32; self.dimension];

        let normalized: String = text
            .chars()
            .map(|c| {
                if c.is_alphanumeric() || c.is_whitespace() {
                    c.to_ascii_lowercase()
                } else {
                    ' '
                }
            })
            .collect();

        // Word-level hashing carries the primary signal
        for word in normalized.split_whitespace() {
            let hash = Self::hash_str(word);
            let idx = (hash as usize) % self.dimension;
            let sign = if (hash >> 32) & 1 == 0 { 1.0 } else { -1.0 };
            let magnitude = 1.0 + ((hash >> 16) & 0xFF) as f32 / 255.0;
            embedding[idx] += sign * magnitude;
        }

        // Character trigrams add a fuzzy-match signal
        let chars: Vec<char> = normalized.chars().collect();
        for window in chars.windows(3) {
            let trigram: String = window.iter().collect();
            let hash = Self::hash_str(&trigram);
            let idx = (hash as usize) % self.dimension;
            let sign = if (hash >> 32) & 1 == 0 { 0.5 } else { -0.5 };
            embedding[idx] += sign;
        }

        // Degenerate input (no tokens at all) still gets a reproducible
        // non-zero vector so dimension checks and storage stay uniform
        if embedding.iter().all(|v| *v == 0.0) {
            let mut rng = StdRng::seed_from_u64(Self::hash_str(text));
            for value in &mut embedding {
                *value = rng.random_range(-1.0..1.0);
            }
        }

        let magnitude: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut embedding {
                *value /= magnitude;
            }
        }
        embedding
    }
}

#[async_trait]
impl EmbeddingProvider for FakeProvider {
    fn name(&self) -> &str {
        "fake"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|text| self.generate(text)).collect())
    }
}
