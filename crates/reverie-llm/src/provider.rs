use async_trait::async_trait;
use reverie_core::Result;

/// Trait for generating text embeddings.
///
/// The dimensionality must be stable per deployment: the cold index stores
/// fixed-length vectors and excludes mismatched nodes from search.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of texts, preserving order.
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>>;

    /// The dimensionality of the output embeddings.
    fn dimensions(&self) -> usize;

    /// Provider name for logging.
    fn name(&self) -> &str;
}

/// Trait for the synthesis collaborator: given a system framing and a prompt,
/// return raw model text. Callers are responsible for lenient parsing —
/// responses may arrive wrapped in markdown code fences or surrounded by
/// prose, and malformed output must degrade to an empty result, never an
/// error on the caller's primary flow.
#[async_trait]
pub trait SynthesisProvider: Send + Sync {
    async fn synthesize(&self, system: &str, prompt: &str) -> Result<String>;

    /// Provider name for logging.
    fn name(&self) -> &str;
}
