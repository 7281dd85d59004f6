use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration — maps to `reverie.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReverieConfig {
    pub storage: StorageConfig,
    pub llm: LlmConfig,
    pub memory: MemoryConfig,
    pub logging: LoggingConfig,
}

// ── Storage ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the cold-index SQLite database.
    pub db_path: PathBuf,
    /// Key namespace prefix for the hot store, so multiple deployments can
    /// share one backend: `{namespace}:{entity}:{user}:{suffix}`.
    pub hot_namespace: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".reverie")
                .join("memory.db"),
            hot_namespace: "reverie".into(),
        }
    }
}

// ── LLM collaborators ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Embedding provider: "openai" or "ollama".
    pub embedding_provider: String,
    pub embedding_model: String,
    /// Fixed embedding dimensionality for this deployment. Every stored
    /// vector must match; the cold index rejects mismatched lengths.
    pub embedding_dimensions: usize,
    /// Chat model used for all synthesis calls.
    pub synthesis_model: String,
    /// Base URL for an OpenAI-compatible endpoint.
    pub base_url: Option<String>,
    /// API key. Falls back to OPENAI_API_KEY when unset.
    pub api_key: Option<String>,
    /// Per-request timeout for collaborator calls, so no network call can
    /// block the interleaving of other sessions.
    pub request_timeout_secs: u64,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            embedding_provider: "openai".into(),
            embedding_model: "text-embedding-3-small".into(),
            embedding_dimensions: 1536,
            synthesis_model: "gpt-4o-mini".into(),
            base_url: None,
            api_key: None,
            request_timeout_secs: 30,
            max_tokens: 2048,
            temperature: 0.4,
        }
    }
}

// ── Memory policy ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Rolling cap on the episodic turn stream.
    pub episodic_window: usize,
    /// TTL for the episodic stream, in days.
    pub stream_ttl_days: i64,
    /// Session considered expired after this many hours of inactivity.
    pub session_timeout_hours: i64,
    /// TTL for the active-context cache, in minutes.
    pub active_context_ttl_minutes: i64,

    /// Raw cosine similarity threshold for dedup candidate matching.
    pub dedup_similarity_threshold: f32,
    /// Cap on the size of a dedup merge cluster.
    pub dedup_cluster_cap: usize,
    /// TTL of the in-process recent-write cache, in seconds.
    pub recent_write_ttl_secs: i64,
    /// Word-overlap threshold for the recent-write near-exact match.
    pub recent_write_jaccard: f64,
    /// At most this many distinct content variants are passed to merge synthesis.
    pub merge_variant_cap: usize,
    /// Corroboration bonus added to averaged confidence on merge.
    pub merge_confidence_bonus: f64,

    /// Recall score weights: vector similarity / importance / recency.
    pub recall_weight_similarity: f64,
    pub recall_weight_importance: f64,
    pub recall_weight_recency: f64,
    /// Recency decay scale in days: recency = exp(-days_since_access / scale).
    pub recency_decay_days: f64,
    /// Over-fetch factor for semantic search before re-ranking.
    pub search_overfetch_factor: usize,
    /// Only the top-N results of a search get a recall-count touch.
    pub recall_touch_top_n: usize,
    /// Skip the touch when the node was accessed within this window, in minutes.
    pub recall_touch_window_minutes: i64,

    /// Half-life in days for anchor narrative gravity.
    pub anchor_half_life_days: f64,
    /// Gravity never decays below this floor fraction.
    pub gravity_min_floor: f64,
    /// Display caps for assembled context sections.
    pub context_max_anchors: usize,
    pub context_max_artifacts: usize,
    pub context_max_identity: usize,
    pub context_max_vocabulary: usize,
    pub context_stream_tail: usize,
    /// Word-overlap fraction below which the topic is considered drifted.
    pub topic_drift_threshold: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            episodic_window: 50,
            stream_ttl_days: 7,
            session_timeout_hours: 4,
            active_context_ttl_minutes: 30,

            dedup_similarity_threshold: 0.75,
            dedup_cluster_cap: 5,
            recent_write_ttl_secs: 30,
            recent_write_jaccard: 0.85,
            merge_variant_cap: 3,
            merge_confidence_bonus: 0.1,

            recall_weight_similarity: 0.7,
            recall_weight_importance: 0.2,
            recall_weight_recency: 0.1,
            recency_decay_days: 30.0,
            search_overfetch_factor: 2,
            recall_touch_top_n: 5,
            recall_touch_window_minutes: 5,

            anchor_half_life_days: 60.0,
            gravity_min_floor: 0.5,
            context_max_anchors: 6,
            context_max_artifacts: 3,
            context_max_identity: 4,
            context_max_vocabulary: 10,
            context_stream_tail: 12,
            topic_drift_threshold: 0.2,
        }
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Tracing filter, e.g. "info" or "reverie_memory=debug,info".
    pub level: String,
    /// Emit JSON log lines instead of the human-readable format.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

impl ReverieConfig {
    /// Validate the config. Returns human-readable warnings for suspicious
    /// values; errors only for settings that cannot work at all.
    pub fn validate(&self) -> Result<Vec<String>, String> {
        let mut warnings = Vec::new();
        let m = &self.memory;

        if self.llm.embedding_dimensions == 0 {
            return Err("llm.embedding_dimensions must be non-zero".into());
        }
        if !(0.0..=1.0).contains(&m.dedup_similarity_threshold) {
            return Err(format!(
                "memory.dedup_similarity_threshold must be 0.0-1.0, got {}",
                m.dedup_similarity_threshold
            ));
        }

        let weight_sum =
            m.recall_weight_similarity + m.recall_weight_importance + m.recall_weight_recency;
        if (weight_sum - 1.0).abs() > 1e-6 {
            warnings.push(format!(
                "recall weights sum to {weight_sum}, not 1.0 — scores will not be normalized"
            ));
        }
        if m.dedup_similarity_threshold < 0.5 {
            warnings.push(format!(
                "dedup_similarity_threshold {} is very loose; unrelated memories may merge",
                m.dedup_similarity_threshold
            ));
        }
        if m.episodic_window == 0 {
            warnings.push("episodic_window is 0; no turns will be retained".into());
        }
        if m.search_overfetch_factor < 1 {
            return Err("memory.search_overfetch_factor must be >= 1".into());
        }

        Ok(warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ReverieConfig::default();
        let warnings = config.validate().unwrap();
        assert!(warnings.is_empty(), "default config warned: {warnings:?}");
        assert_eq!(config.memory.dedup_similarity_threshold, 0.75);
        assert_eq!(config.memory.session_timeout_hours, 4);
        assert_eq!(config.memory.recall_weight_similarity, 0.7);
    }

    #[test]
    fn test_validate_rejects_zero_dims() {
        let mut config = ReverieConfig::default();
        config.llm.embedding_dimensions = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_warns_on_skewed_weights() {
        let mut config = ReverieConfig::default();
        config.memory.recall_weight_similarity = 0.9;
        let warnings = config.validate().unwrap();
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let raw = r#"
            [memory]
            episodic_window = 20
        "#;
        let config: ReverieConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.memory.episodic_window, 20);
        assert_eq!(config.memory.session_timeout_hours, 4);
        assert_eq!(config.llm.embedding_dimensions, 1536);
    }
}
