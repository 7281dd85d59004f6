//! # reverie-llm
//!
//! The two narrow collaborator contracts the memory engine consumes:
//! `Embed(text) -> vector` and `Synthesize(prompt) -> text`. Adapters exist
//! for OpenAI-compatible endpoints and Ollama; deterministic mocks back the
//! test suites. Prompt wording and model choice live with the caller.

pub mod json;
pub mod mock;
pub mod ollama;
pub mod openai;
pub mod provider;

pub use json::extract_json;
pub use mock::{MockEmbedder, MockSynthesizer};
pub use ollama::OllamaEmbedder;
pub use openai::{OpenAiEmbedder, OpenAiSynthesizer};
pub use provider::{EmbeddingProvider, SynthesisProvider};
