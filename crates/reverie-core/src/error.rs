use thiserror::Error;

/// Unified error type for the entire Reverie engine.
#[derive(Error, Debug)]
pub enum ReverieError {
    // ── Storage errors ─────────────────────────────────────────
    #[error("memory index error: {0}")]
    Memory(String),

    #[error("hot store error: {0}")]
    HotStore(String),

    // ── Collaborator errors ────────────────────────────────────
    #[error("embedding provider error: {0}")]
    Embedding(String),

    #[error("synthesis provider error: {0}")]
    Synthesis(String),

    // ── Caller-facing rejections ───────────────────────────────
    #[error("validation failed: {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("node not found: {0}")]
    NotFound(String),

    // ── Config errors ──────────────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl ReverieError {
    /// Shorthand for a field-level validation rejection.
    pub fn validation(field: &str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ReverieError>;
