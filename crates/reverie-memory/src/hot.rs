//! Hot memory — per-entity/per-user ephemeral working state.
//!
//! Backed by a low-latency key-value store with TTLs, abstracted behind
//! [`HotBackend`] so a shared cache (Redis-style) can replace the in-process
//! map without touching callers. Every operation is best-effort: if the
//! backend is unreachable, reads return empty and writes report
//! [`CacheWrite::Degraded`] — hot memory is an optimization, never a source
//! of truth.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;
use uuid::Uuid;

use reverie_config::MemoryConfig;
use reverie_core::{CacheWrite, EpisodicTurn, ExpressionState, MemoryNode, Result, ReverieError};

/// Key-value backend contract for the hot store. Keys are namespaced strings
/// `{namespace}:{entity}:{user}:{suffix}`; values are JSON.
#[async_trait]
pub trait HotBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: String, ttl: Option<std::time::Duration>) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// In-process backend: a concurrent map with per-entry expiry, checked
/// lazily on read.
#[derive(Default)]
pub struct InMemoryBackend {
    entries: DashMap<String, (String, Option<Instant>)>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HotBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        if let Some(entry) = self.entries.get(key) {
            let (value, expiry) = entry.value();
            if let Some(deadline) = expiry {
                if Instant::now() >= *deadline {
                    drop(entry);
                    self.entries.remove(key);
                    return Ok(None);
                }
            }
            return Ok(Some(value.clone()));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Option<std::time::Duration>) -> Result<()> {
        let expiry = ttl.map(|d| Instant::now() + d);
        self.entries.insert(key.to_string(), (value, expiry));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Derived, disposable topic cache. Absence always triggers a fresh topic
/// query, never an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveContext {
    /// Topic words of the query this cache was built for.
    pub topics: Vec<String>,
    /// Ids of the topic-relevant cold nodes.
    pub memory_ids: Vec<Uuid>,
    /// Generated narrative summary of the topic cluster, if any.
    pub narrative: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Derived, disposable identity cache: CORE + CORE_EXTENSION + top anchors.
/// Stale-while-revalidate — served until invalidated, rebuilt lazily on the
/// next miss.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapCache {
    pub core_nodes: Vec<MemoryNode>,
    pub anchors: Vec<MemoryNode>,
    pub built_at: DateTime<Utc>,
}

/// Per-entity/per-user ephemeral state over a [`HotBackend`].
pub struct HotMemoryStore {
    backend: Arc<dyn HotBackend>,
    namespace: String,
    config: MemoryConfig,
}

impl HotMemoryStore {
    pub fn new(backend: Arc<dyn HotBackend>, namespace: &str, config: MemoryConfig) -> Self {
        Self {
            backend,
            namespace: namespace.to_string(),
            config,
        }
    }

    /// In-process store with default namespace, for tests and single-node use.
    pub fn in_memory(config: MemoryConfig) -> Self {
        Self::new(Arc::new(InMemoryBackend::new()), "reverie", config)
    }

    /// Key prefix this store writes under. Distinct namespaces let multiple
    /// deployments share one backend without colliding.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn key(&self, entity_id: &str, user_id: &str, suffix: &str) -> String {
        format!("{}:{}:{}:{}", self.namespace, entity_id, user_id, suffix)
    }

    fn stream_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.config.stream_ttl_days.max(0) as u64 * 86_400)
    }

    // ── Generic best-effort plumbing ───────────────────────────

    async fn read_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.backend.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(key, error = %e, "hot store entry corrupt, treating as miss");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(key, error = %e, "hot store read failed, degrading to empty");
                None
            }
        }
    }

    async fn write_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<std::time::Duration>,
    ) -> CacheWrite {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key, error = %e, "hot store serialize failed");
                return CacheWrite::Degraded;
            }
        };
        match self.backend.set(key, raw, ttl).await {
            Ok(()) => CacheWrite::Stored,
            Err(e) => {
                warn!(key, error = %e, "hot store write failed, degrading");
                CacheWrite::Degraded
            }
        }
    }

    async fn remove(&self, key: &str) -> CacheWrite {
        match self.backend.delete(key).await {
            Ok(()) => CacheWrite::Stored,
            Err(e) => {
                warn!(key, error = %e, "hot store delete failed, degrading");
                CacheWrite::Degraded
            }
        }
    }

    // ── Episodic stream ────────────────────────────────────────

    /// Append a turn to the rolling episodic stream (window-capped, TTL-bound)
    /// and stamp the expression state's last-interaction time.
    pub async fn append_turn(
        &self,
        entity_id: &str,
        user_id: &str,
        turn: EpisodicTurn,
    ) -> CacheWrite {
        let key = self.key(entity_id, user_id, "stream");
        let mut stream: Vec<EpisodicTurn> = self.read_json(&key).await.unwrap_or_default();
        stream.push(turn);
        let window = self.config.episodic_window;
        if stream.len() > window {
            let excess = stream.len() - window;
            stream.drain(..excess);
        }
        let wrote = self
            .write_json(&key, &stream, Some(self.stream_ttl()))
            .await;

        let mut expression = self
            .get_expression_state(entity_id, user_id)
            .await
            .unwrap_or_default();
        expression.last_interaction = Some(Utc::now());
        let stamped = self.update_expression_state(entity_id, user_id, &expression).await;

        if wrote == CacheWrite::Degraded || stamped == CacheWrite::Degraded {
            CacheWrite::Degraded
        } else {
            CacheWrite::Stored
        }
    }

    /// Most recent `limit` turns, oldest first. Empty on any backend failure.
    pub async fn get_stream(&self, entity_id: &str, user_id: &str, limit: usize) -> Vec<EpisodicTurn> {
        let key = self.key(entity_id, user_id, "stream");
        let stream: Vec<EpisodicTurn> = self.read_json(&key).await.unwrap_or_default();
        let start = stream.len().saturating_sub(limit);
        stream[start..].to_vec()
    }

    pub async fn clear_stream(&self, entity_id: &str, user_id: &str) -> CacheWrite {
        self.remove(&self.key(entity_id, user_id, "stream")).await
    }

    // ── Expression state ───────────────────────────────────────

    pub async fn get_expression_state(
        &self,
        entity_id: &str,
        user_id: &str,
    ) -> Option<ExpressionState> {
        self.read_json(&self.key(entity_id, user_id, "expression"))
            .await
    }

    /// No TTL: expression state persists until explicitly reset.
    pub async fn update_expression_state(
        &self,
        entity_id: &str,
        user_id: &str,
        state: &ExpressionState,
    ) -> CacheWrite {
        self.write_json(&self.key(entity_id, user_id, "expression"), state, None)
            .await
    }

    // ── Active-context cache ───────────────────────────────────

    /// Expired entries are treated as a miss.
    pub async fn get_active_context(
        &self,
        entity_id: &str,
        user_id: &str,
    ) -> Option<ActiveContext> {
        let ctx: ActiveContext = self
            .read_json(&self.key(entity_id, user_id, "context"))
            .await?;
        if ctx.expires_at <= Utc::now() {
            return None;
        }
        Some(ctx)
    }

    pub async fn set_active_context(
        &self,
        entity_id: &str,
        user_id: &str,
        ctx: &ActiveContext,
    ) -> CacheWrite {
        self.write_json(&self.key(entity_id, user_id, "context"), ctx, None)
            .await
    }

    pub async fn invalidate_active_context(&self, entity_id: &str, user_id: &str) -> CacheWrite {
        self.remove(&self.key(entity_id, user_id, "context")).await
    }

    /// Default expiry for a freshly built active context.
    pub fn active_context_expiry(&self) -> DateTime<Utc> {
        Utc::now() + Duration::minutes(self.config.active_context_ttl_minutes)
    }

    // ── Bootstrap cache ────────────────────────────────────────

    pub async fn get_bootstrap_cache(
        &self,
        entity_id: &str,
        user_id: &str,
    ) -> Option<BootstrapCache> {
        self.read_json(&self.key(entity_id, user_id, "bootstrap"))
            .await
    }

    pub async fn set_bootstrap_cache(
        &self,
        entity_id: &str,
        user_id: &str,
        cache: &BootstrapCache,
    ) -> CacheWrite {
        self.write_json(&self.key(entity_id, user_id, "bootstrap"), cache, None)
            .await
    }

    /// Invalidate only — the next `get_bootstrap_cache` misses and the caller
    /// rebuilds lazily from cold storage.
    pub async fn invalidate_bootstrap_cache(&self, entity_id: &str, user_id: &str) -> CacheWrite {
        self.remove(&self.key(entity_id, user_id, "bootstrap")).await
    }

    // ── Session lifecycle ──────────────────────────────────────

    /// Clear stream + active-context and stamp a new session start.
    /// Expression state is preserved.
    pub async fn start_new_session(&self, entity_id: &str, user_id: &str) -> CacheWrite {
        let cleared_stream = self.clear_stream(entity_id, user_id).await;
        let cleared_ctx = self.invalidate_active_context(entity_id, user_id).await;

        let mut expression = self
            .get_expression_state(entity_id, user_id)
            .await
            .unwrap_or_default();
        expression.session_start = Some(Utc::now());
        let stamped = self.update_expression_state(entity_id, user_id, &expression).await;

        if [cleared_stream, cleared_ctx, stamped].contains(&CacheWrite::Degraded) {
            CacheWrite::Degraded
        } else {
            CacheWrite::Stored
        }
    }

    /// A session is expired after `session_timeout_hours` of inactivity.
    /// A user with no recorded interaction is not "expired" — there is
    /// nothing to summarize.
    pub async fn is_session_expired(&self, entity_id: &str, user_id: &str, now: DateTime<Utc>) -> bool {
        let Some(expression) = self.get_expression_state(entity_id, user_id).await else {
            return false;
        };
        let Some(last) = expression.last_interaction else {
            return false;
        };
        now - last > Duration::hours(self.config.session_timeout_hours)
    }
}

/// A backend that always fails, for exercising degraded paths in tests.
pub struct FailingBackend;

#[async_trait]
impl HotBackend for FailingBackend {
    async fn get(&self, _key: &str) -> Result<Option<String>> {
        Err(ReverieError::HotStore("backend unreachable".into()))
    }
    async fn set(&self, _key: &str, _value: String, _ttl: Option<std::time::Duration>) -> Result<()> {
        Err(ReverieError::HotStore("backend unreachable".into()))
    }
    async fn delete(&self, _key: &str) -> Result<()> {
        Err(ReverieError::HotStore("backend unreachable".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reverie_core::TurnRole;

    fn store() -> HotMemoryStore {
        HotMemoryStore::in_memory(MemoryConfig::default())
    }

    #[tokio::test]
    async fn test_stream_window_cap() {
        let mut config = MemoryConfig::default();
        config.episodic_window = 3;
        let store = HotMemoryStore::in_memory(config);

        for i in 0..5 {
            store
                .append_turn("e", "u", EpisodicTurn::new(TurnRole::User, &format!("turn {i}")))
                .await;
        }
        let stream = store.get_stream("e", "u", 10).await;
        assert_eq!(stream.len(), 3);
        assert_eq!(stream[0].content, "turn 2");
        assert_eq!(stream[2].content, "turn 4");
    }

    #[tokio::test]
    async fn test_namespace_partitions_shared_backend() {
        let backend: Arc<InMemoryBackend> = Arc::new(InMemoryBackend::new());
        let blue = HotMemoryStore::new(backend.clone(), "blue", MemoryConfig::default());
        let green = HotMemoryStore::new(backend.clone(), "green", MemoryConfig::default());

        blue.append_turn("e", "u", EpisodicTurn::new(TurnRole::User, "hello from blue"))
            .await;

        // Same entity and user, different namespace: no bleed-through.
        assert_eq!(blue.get_stream("e", "u", 10).await.len(), 1);
        assert!(green.get_stream("e", "u", 10).await.is_empty());
        // The configured prefix is what actually lands in the backend keys.
        assert!(backend.get("blue:e:u:stream").await.unwrap().is_some());
        assert!(backend.get("green:e:u:stream").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stream_isolated_per_user() {
        let store = store();
        store
            .append_turn("e", "alice", EpisodicTurn::new(TurnRole::User, "hi"))
            .await;
        assert_eq!(store.get_stream("e", "alice", 10).await.len(), 1);
        assert!(store.get_stream("e", "bob", 10).await.is_empty());
    }

    #[tokio::test]
    async fn test_new_session_preserves_expression() {
        let store = store();
        let mut expr = ExpressionState::default();
        expr.resonance.insert("warmth".into(), 0.8);
        store.update_expression_state("e", "u", &expr).await;
        store
            .append_turn("e", "u", EpisodicTurn::new(TurnRole::User, "hello"))
            .await;

        store.start_new_session("e", "u").await;

        assert!(store.get_stream("e", "u", 10).await.is_empty());
        let expr = store.get_expression_state("e", "u").await.unwrap();
        assert_eq!(expr.resonance["warmth"], 0.8);
        assert!(expr.session_start.is_some());
    }

    #[tokio::test]
    async fn test_session_expiry_boundary() {
        let store = store();
        let mut expr = ExpressionState::default();
        // Exactly at the boundary: not yet expired.
        let now = Utc::now();
        expr.last_interaction = Some(now - Duration::hours(4));
        store.update_expression_state("e", "u", &expr).await;
        assert!(!store.is_session_expired("e", "u", now).await);

        // One second past the boundary: expired.
        let now = Utc::now();
        expr.last_interaction = Some(now - Duration::hours(4) - Duration::seconds(1));
        store.update_expression_state("e", "u", &expr).await;
        assert!(store.is_session_expired("e", "u", now).await);
    }

    #[tokio::test]
    async fn test_active_context_expiry_is_a_miss() {
        let store = store();
        let ctx = ActiveContext {
            topics: vec!["rust".into()],
            memory_ids: vec![],
            narrative: None,
            expires_at: Utc::now() - Duration::seconds(1),
        };
        store.set_active_context("e", "u", &ctx).await;
        assert!(store.get_active_context("e", "u").await.is_none());
    }

    #[tokio::test]
    async fn test_degrades_on_backend_failure() {
        let store = HotMemoryStore::new(Arc::new(FailingBackend), "reverie", MemoryConfig::default());
        let wrote = store
            .append_turn("e", "u", EpisodicTurn::new(TurnRole::User, "hi"))
            .await;
        assert_eq!(wrote, CacheWrite::Degraded);
        // Reads degrade to empty, never error.
        assert!(store.get_stream("e", "u", 10).await.is_empty());
        assert!(store.get_expression_state("e", "u").await.is_none());
        assert!(!store.is_session_expired("e", "u", Utc::now()).await);
    }

    #[tokio::test]
    async fn test_ttl_expiry_in_backend() {
        let backend = InMemoryBackend::new();
        backend
            .set("k", "v".into(), Some(std::time::Duration::from_millis(10)))
            .await
            .unwrap();
        assert!(backend.get("k").await.unwrap().is_some());
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        assert!(backend.get("k").await.unwrap().is_none());
    }
}
