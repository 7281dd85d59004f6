//! # reverie-config
//!
//! Configuration system for the Reverie engine. Reads from `reverie.toml` and
//! environment variables — file first, env as fallback for secrets and as
//! override for operational knobs.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::{LlmConfig, LoggingConfig, MemoryConfig, ReverieConfig, StorageConfig};
