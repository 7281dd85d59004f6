//! Mock collaborators for deterministic testing.
//!
//! No HTTP calls. The embedder derives a stable vector from the text's
//! word multiset (so paraphrases with shared words land close together),
//! with per-text overrides for tests that need exact geometry.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::provider::{EmbeddingProvider, SynthesisProvider};
use reverie_core::{Result, ReverieError};

/// A deterministic embedding provider for tests.
#[derive(Clone)]
pub struct MockEmbedder {
    dims: usize,
    overrides: Arc<Mutex<HashMap<String, Vec<f32>>>>,
    fail: Arc<Mutex<bool>>,
    /// Number of embed calls made (for asserting single-embed call paths).
    pub calls: Arc<Mutex<usize>>,
}

impl MockEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            overrides: Arc::new(Mutex::new(HashMap::new())),
            fail: Arc::new(Mutex::new(false)),
            calls: Arc::new(Mutex::new(0)),
        }
    }

    /// Pin the exact vector returned for a given text.
    pub fn with_vector(self, text: &str, vector: Vec<f32>) -> Self {
        self.overrides.lock().insert(text.to_string(), vector);
        self
    }

    /// Make every subsequent call fail (embedding outage).
    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock() = fail;
    }

    pub fn call_count(&self) -> usize {
        *self.calls.lock()
    }

    /// Hash each lowercase word into a bucket so texts sharing words share
    /// vector mass. Normalized to unit length.
    fn derive(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for word in text.to_lowercase().split_whitespace() {
            let mut h: u64 = 1469598103934665603;
            for b in word.bytes() {
                h ^= b as u64;
                h = h.wrapping_mul(1099511628211);
            }
            v[(h % self.dims as u64) as usize] += 1.0;
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        *self.calls.lock() += 1;
        if *self.fail.lock() {
            return Err(ReverieError::Embedding("mock embedding outage".into()));
        }
        if let Some(v) = self.overrides.lock().get(text) {
            return Ok(v.clone());
        }
        Ok(self.derive(text))
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// A mock synthesis provider that returns queued responses in order.
#[derive(Clone)]
pub struct MockSynthesizer {
    responses: Arc<Mutex<Vec<std::result::Result<String, String>>>>,
    /// Every (system, prompt) pair received, for assertions.
    pub prompts: Arc<Mutex<Vec<(String, String)>>>,
}

impl Default for MockSynthesizer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSynthesizer {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(Vec::new())),
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue a text response.
    pub fn with_response(self, text: &str) -> Self {
        self.responses.lock().push(Ok(text.to_string()));
        self
    }

    /// Queue an error response.
    pub fn with_error(self, msg: &str) -> Self {
        self.responses.lock().push(Err(msg.to_string()));
        self
    }

    pub fn prompt_count(&self) -> usize {
        self.prompts.lock().len()
    }
}

#[async_trait]
impl SynthesisProvider for MockSynthesizer {
    async fn synthesize(&self, system: &str, prompt: &str) -> Result<String> {
        self.prompts
            .lock()
            .push((system.to_string(), prompt.to_string()));
        let mut responses = self.responses.lock();
        if responses.is_empty() {
            // Neutral default: an empty JSON object, which every lenient
            // parser in the engine treats as "nothing new".
            return Ok("{}".to_string());
        }
        match responses.remove(0) {
            Ok(text) => Ok(text),
            Err(msg) => Err(ReverieError::Synthesis(msg)),
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_embedder_deterministic() {
        let embedder = MockEmbedder::new(64);
        let a = embedder.embed("the user prefers terse answers").await.unwrap();
        let b = embedder.embed("the user prefers terse answers").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_eq!(embedder.call_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_embedder_override_and_failure() {
        let embedder = MockEmbedder::new(3).with_vector("pinned", vec![1.0, 0.0, 0.0]);
        assert_eq!(embedder.embed("pinned").await.unwrap(), vec![1.0, 0.0, 0.0]);
        embedder.set_failing(true);
        assert!(embedder.embed("pinned").await.is_err());
    }

    #[tokio::test]
    async fn test_mock_synthesizer_order_and_default() {
        let synth = MockSynthesizer::new()
            .with_response("first")
            .with_error("outage");
        assert_eq!(synth.synthesize("s", "p").await.unwrap(), "first");
        assert!(synth.synthesize("s", "p").await.is_err());
        // Queue exhausted: neutral empty object.
        assert_eq!(synth.synthesize("s", "p").await.unwrap(), "{}");
        assert_eq!(synth.prompt_count(), 3);
    }
}
