//! The continuity memory service: one explicit struct wiring the hot store,
//! cold index, dedup engine, synthesizer, and context builder together.
//!
//! Hot-path rules it enforces:
//! - recording a turn always succeeds, whatever the synthesis pipeline's state
//! - the cold index is only consulted when the active-context cache misses,
//!   expired, or the conversation drifted to a new topic
//! - synthesis runs in the background with a per-(entity, user) single-flight
//!   guard, and is never awaited by a conversation turn

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use reverie_config::ReverieConfig;
use reverie_core::{
    CacheWrite, EpisodicTurn, ExpressionState, MemoryNode, MemoryType, Result, ReverieError,
    Shorthand,
};
use reverie_llm::{
    EmbeddingProvider, OllamaEmbedder, OpenAiEmbedder, OpenAiSynthesizer, SynthesisProvider,
};
use reverie_memory::{
    ActiveContext, BootstrapCache, ColdMemoryIndex, ContextBuilder, ContextInputs, DedupOptions,
    Deduplicator, ForgetSummary, HotMemoryStore, InMemoryBackend, NarrativeSynthesizer,
    QueryInput, ScoredNode, StoreOutcome, TAG_COMPASS,
};

/// How many topic-relevant cold memories a context window recalls.
const RECALL_LIMIT: usize = 8;
/// Batch size for the sleep pass piggybacked on session turnover.
const SLEEP_BATCH: usize = 25;

/// Orchestrates both memory tiers for one deployment. Cheap to share:
/// every field is an `Arc` or a small value.
pub struct ContinuityMemoryService {
    hot: Arc<HotMemoryStore>,
    cold: Arc<ColdMemoryIndex>,
    dedup: Arc<Deduplicator>,
    synthesizer: Arc<NarrativeSynthesizer>,
    builder: ContextBuilder,
    config: reverie_config::MemoryConfig,
    /// Per-(entity, user) single-flight markers for background synthesis.
    in_flight: Arc<DashMap<(String, String), ()>>,
}

impl ContinuityMemoryService {
    pub fn new(
        hot: Arc<HotMemoryStore>,
        cold: Arc<ColdMemoryIndex>,
        dedup: Arc<Deduplicator>,
        synthesizer: Arc<NarrativeSynthesizer>,
        config: reverie_config::MemoryConfig,
    ) -> Self {
        Self {
            hot,
            cold,
            dedup,
            synthesizer,
            builder: ContextBuilder::new(config.clone()),
            config,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// Wire up a full service from configuration: SQLite cold index at the
    /// configured path, in-process hot store, providers per `[llm]`.
    pub fn from_config(config: &ReverieConfig) -> Result<Arc<Self>> {
        let embedder: Arc<dyn EmbeddingProvider> = match config.llm.embedding_provider.as_str() {
            "ollama" => {
                let mut e = OllamaEmbedder::new(
                    &config.llm.embedding_model,
                    config.llm.embedding_dimensions,
                );
                if let Some(url) = &config.llm.base_url {
                    e = e.with_base_url(url.clone());
                }
                Arc::new(e)
            }
            "openai" => Arc::new(OpenAiEmbedder::from_config(&config.llm)?),
            other => {
                return Err(ReverieError::Config(format!(
                    "unknown embedding provider: {other}"
                )))
            }
        };
        let provider: Arc<dyn SynthesisProvider> =
            Arc::new(OpenAiSynthesizer::from_config(&config.llm)?);

        if let Some(parent) = config.storage.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let cold = Arc::new(ColdMemoryIndex::open(
            &config.storage.db_path,
            embedder.clone(),
            config.memory.clone(),
        )?);
        let hot = Arc::new(HotMemoryStore::new(
            Arc::new(InMemoryBackend::new()),
            &config.storage.hot_namespace,
            config.memory.clone(),
        ));
        let dedup = Arc::new(Deduplicator::new(
            cold.clone(),
            embedder,
            provider.clone(),
            config.memory.clone(),
        ));
        let synthesizer = Arc::new(NarrativeSynthesizer::new(
            dedup.clone(),
            provider,
            config.memory.clone(),
        ));
        Ok(Arc::new(Self::new(
            hot,
            cold,
            dedup,
            synthesizer,
            config.memory.clone(),
        )))
    }

    // ── Session lifecycle ──────────────────────────────────────

    /// Start-of-conversation hook. When the previous session has expired the
    /// order is fixed: the compass is synthesized from the still-intact
    /// episodic buffer FIRST, then stored memories are consolidated, and only
    /// then is the hot session state cleared. Returns whether a new session
    /// was started.
    pub async fn init_session(&self, entity_id: &str, user_id: &str) -> Result<bool> {
        if !self.hot.is_session_expired(entity_id, user_id, Utc::now()).await {
            return Ok(false);
        }
        info!(entity = entity_id, user = user_id, "session expired, turning over");

        let stream = self
            .hot
            .get_stream(entity_id, user_id, self.config.episodic_window)
            .await;
        // Compass before clear: once the stream is gone there is nothing left
        // to summarize.
        self.synthesizer
            .synthesize_compass(entity_id, user_id, &stream)
            .await;

        if let Err(e) = self.synthesizer.run_deep_synthesis(entity_id, user_id).await {
            warn!(error = %e, "deep synthesis during turnover failed");
        }
        if let Err(e) = self
            .synthesizer
            .run_sleep_synthesis(entity_id, user_id, SLEEP_BATCH)
            .await
        {
            warn!(error = %e, "sleep synthesis during turnover failed");
        }

        self.hot.start_new_session(entity_id, user_id).await;
        self.hot.invalidate_bootstrap_cache(entity_id, user_id).await;
        Ok(true)
    }

    // ── Context assembly ───────────────────────────────────────

    /// Assemble the context block for the next turn. Hot state is always
    /// consulted; the cold index only when the active-context cache is
    /// missing, expired, or the query has drifted off its topics.
    pub async fn get_context_window(
        &self,
        entity_id: &str,
        user_id: &str,
        query: &str,
    ) -> Result<String> {
        let bootstrap = self.bootstrap(entity_id, user_id).await?;
        let stream = self
            .hot
            .get_stream(entity_id, user_id, self.config.episodic_window)
            .await;

        let cached = self.hot.get_active_context(entity_id, user_id).await;
        let (active, recalled) = match cached {
            Some(active) if !self.builder.has_topic_drifted(query, &active.topics) => {
                debug!(entity = entity_id, "active context reused");
                let recalled = self.cold.get_by_ids(&active.memory_ids)?;
                (Some(active), recalled)
            }
            _ => {
                let scored = self
                    .cold
                    .search_semantic(
                        entity_id,
                        Some(user_id),
                        QueryInput::Text(query),
                        RECALL_LIMIT,
                        None,
                    )
                    .await?;
                let recalled: Vec<MemoryNode> = scored.into_iter().map(|s| s.node).collect();
                let narrative = self.synthesizer.summarize_topic(&stream).await;
                let active = ActiveContext {
                    topics: vec![query.to_string()],
                    memory_ids: recalled.iter().map(|n| n.id).collect(),
                    narrative,
                    expires_at: self.hot.active_context_expiry(),
                };
                self.hot.set_active_context(entity_id, user_id, &active).await;
                debug!(entity = entity_id, recalled = recalled.len(), "active context rebuilt");
                (Some(active), recalled)
            }
        };

        let expression = self.hot.get_expression_state(entity_id, user_id).await;
        let compass = self
            .cold
            .get_by_tag(entity_id, Some(user_id), TAG_COMPASS, 1)?
            .pop();
        let artifacts = self.cold.get_by_type(
            entity_id,
            Some(user_id),
            MemoryType::Artifact,
            self.config.context_max_artifacts,
        )?;
        let identity = self.cold.get_by_type(
            entity_id,
            Some(user_id),
            MemoryType::Identity,
            self.config.context_max_identity,
        )?;
        let shorthands = extract_shorthands(&artifacts);

        let inputs = ContextInputs {
            core: bootstrap.core_nodes,
            expression,
            compass,
            anchors: bootstrap.anchors,
            artifacts,
            identity,
            shorthands,
            narrative: active.as_ref().and_then(|a| a.narrative.clone()),
            recalled,
            stream,
        };
        Ok(self.builder.build(&inputs))
    }

    /// Bootstrap cache: core directives plus the strongest anchors.
    /// Stale-while-revalidate — served as cached until something invalidates
    /// it, then rebuilt here on the next miss.
    async fn bootstrap(&self, entity_id: &str, user_id: &str) -> Result<BootstrapCache> {
        if let Some(cached) = self.hot.get_bootstrap_cache(entity_id, user_id).await {
            return Ok(cached);
        }
        let mut core = self
            .cold
            .get_by_type(entity_id, None, MemoryType::Core, usize::MAX)?;
        core.extend(self.cold.get_by_type(
            entity_id,
            None,
            MemoryType::CoreExtension,
            usize::MAX,
        )?);
        // Importance-ranked, not newest-first: an old high-importance anchor
        // must survive the fetch window so gravity ranking can still see it.
        let anchors = self.cold.get_top_by_importance(
            entity_id,
            Some(user_id),
            Some(MemoryType::Anchor),
            1,
            self.config.context_max_anchors * 2,
        )?;
        let cache = BootstrapCache {
            core_nodes: core,
            anchors,
            built_at: Utc::now(),
        };
        self.hot.set_bootstrap_cache(entity_id, user_id, &cache).await;
        Ok(cache)
    }

    // ── Turn recording and synthesis ───────────────────────────

    /// Record one turn into the episodic stream. Always succeeds from the
    /// caller's perspective; a degraded write only costs cache freshness.
    pub async fn record_turn(
        &self,
        entity_id: &str,
        user_id: &str,
        turn: EpisodicTurn,
    ) -> CacheWrite {
        self.hot.append_turn(entity_id, user_id, turn).await
    }

    /// Fire-and-forget background synthesis over the current episodic stream.
    /// At most one pass per (entity, user) runs at a time; a second trigger
    /// while one is in flight is dropped. The in-flight marker is set before
    /// the task spawns and cleared when the task exits, panics included —
    /// a marker left behind would silently disable synthesis for that pair.
    pub fn trigger_synthesis(&self, entity_id: &str, user_id: &str) -> Option<JoinHandle<()>> {
        let key = (entity_id.to_string(), user_id.to_string());
        if self.in_flight.insert(key.clone(), ()).is_some() {
            debug!(entity = entity_id, user = user_id, "synthesis already in flight, skipping");
            return None;
        }

        let hot = self.hot.clone();
        let synthesizer = self.synthesizer.clone();
        let guard = InFlightGuard {
            markers: self.in_flight.clone(),
            key: key.clone(),
        };
        let window = self.config.episodic_window;
        let (entity, user) = key;

        Some(tokio::spawn(async move {
            let _guard = guard;
            let stream = hot.get_stream(&entity, &user, window).await;
            let result = synthesizer.synthesize_turn(&entity, &user, &stream).await;

            if !result.expression_adjustments.is_empty() {
                let mut expression = hot
                    .get_expression_state(&entity, &user)
                    .await
                    .unwrap_or_default();
                expression.apply_adjustments(&result.expression_adjustments);
                hot.update_expression_state(&entity, &user, &expression).await;
            }
            if !result.is_empty() {
                // New memories exist; cached views are stale.
                hot.invalidate_active_context(&entity, &user).await;
                hot.invalidate_bootstrap_cache(&entity, &user).await;
            }
        }))
    }

    // ── Explicit memory APIs ───────────────────────────────────

    /// Store a memory through the dedup chokepoint. Validation is synchronous:
    /// an invalid node is rejected here, never silently dropped later.
    pub async fn store_memory(&self, node: MemoryNode) -> Result<StoreOutcome> {
        node.validate()?;
        let entity = node.entity_id.clone();
        let users: Vec<String> = node.assoc_ids.iter().cloned().collect();
        let outcome = self.dedup.store_with_dedup(node, DedupOptions::default()).await?;
        for user in &users {
            self.hot.invalidate_active_context(&entity, user).await;
            self.hot.invalidate_bootstrap_cache(&entity, user).await;
        }
        Ok(outcome)
    }

    /// Semantic search over one user's memories, recall-ranked.
    pub async fn search(
        &self,
        entity_id: &str,
        user_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<ScoredNode>> {
        self.cold
            .search_semantic(entity_id, Some(user_id), QueryInput::Text(query), limit, None)
            .await
    }

    /// Forget a user entirely: cascading cold-index forget plus all hot state.
    pub async fn forget_user(&self, entity_id: &str, user_id: &str) -> Result<ForgetSummary> {
        let summary = self.cold.cascading_forget(entity_id, user_id)?;
        self.hot.clear_stream(entity_id, user_id).await;
        self.hot.invalidate_active_context(entity_id, user_id).await;
        self.hot.invalidate_bootstrap_cache(entity_id, user_id).await;
        self.hot
            .update_expression_state(entity_id, user_id, &ExpressionState::default())
            .await;
        info!(
            entity = entity_id,
            user = user_id,
            deleted = summary.deleted,
            anonymized = summary.anonymized,
            "user forgotten"
        );
        Ok(summary)
    }

    pub fn hot(&self) -> &Arc<HotMemoryStore> {
        &self.hot
    }

    pub fn cold(&self) -> &Arc<ColdMemoryIndex> {
        &self.cold
    }
}

/// Clears a single-flight marker when dropped, so a panicking synthesis task
/// cannot leave its (entity, user) slot permanently occupied.
struct InFlightGuard {
    markers: Arc<DashMap<(String, String), ()>>,
    key: (String, String),
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.markers.remove(&self.key);
    }
}

/// Pull shared-vocabulary entries out of artifact nodes' relational context.
fn extract_shorthands(artifacts: &[MemoryNode]) -> Vec<Shorthand> {
    let mut shorthands = Vec::new();
    for node in artifacts {
        let Some(vocab) = node
            .relational_context
            .as_ref()
            .and_then(|c| c.get("sharedVocabulary"))
            .and_then(|v| v.as_object())
        else {
            continue;
        };
        for (term, meaning) in vocab {
            if let Some(meaning) = meaning.as_str() {
                shorthands.push(Shorthand {
                    term: term.clone(),
                    meaning: meaning.to_string(),
                });
            }
        }
    }
    shorthands
}
