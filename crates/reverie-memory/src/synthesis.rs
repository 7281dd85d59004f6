//! Narrative synthesis: the pipeline that turns raw conversation into
//! structured memory, and the slower passes that reorganize what is already
//! stored.
//!
//! Every node created here goes through the deduplicator — synthesis output
//! is exactly as duplicate-prone as user-driven stores, so it gets the same
//! chokepoint. Synthesis is best-effort end to end: a malformed model
//! response degrades to "nothing learned this turn", never an error.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cold::QueryInput;
use crate::dedup::{DedupOptions, Deduplicator};
use crate::merge;
use reverie_config::MemoryConfig;
use reverie_core::{
    EmotionalState, EpisodicTurn, MemoryCandidate, MemoryNode, MemoryType, Result,
    SynthesisResult, TurnRole, TAG_AUTO_SYNTHESIS, TAG_PROMOTION_CANDIDATE, TAG_SLEEP_PROCESSED,
};
use reverie_llm::{extract_json, SynthesisProvider};

/// Tag identifying the persistent narrative-summary node.
pub const TAG_COMPASS: &str = "compass";

/// Nodes recalled at least this often become promotion candidates during a
/// deep-synthesis pass.
const PROMOTION_RECALL_THRESHOLD: u32 = 5;

/// How many nearest neighbors sleep synthesis weighs a memory against.
const SLEEP_NEIGHBOR_COUNT: usize = 3;

const TURN_SYNTHESIS_SYSTEM: &str = "You analyze a conversation excerpt and extract \
durable memories. Answer with a single JSON object: {\"new_anchors\": \
[{\"content\", \"importance\" 1-10, \"emotional_tone\"}], \"new_artifacts\": [...], \
\"identity_updates\": [...], \"shorthands\": [{\"term\", \"meaning\"}], \
\"expression_adjustments\": {\"dial\": delta}}. Only include things worth \
remembering across sessions. An empty object means nothing qualified.";

const SLEEP_SYSTEM: &str = "You decide what to do with one stored memory given its \
nearest neighbors. Answer with exactly one word: ABSORB (a neighbor already covers \
it), MERGE (combine it with the first neighbor), LINK (related but distinct), or \
KEEP (leave it alone).";

const COMPASS_SYSTEM: &str = "You write a compact narrative summary of a conversation \
that is about to leave working memory. Capture the throughline, open threads, and \
tone in a short paragraph. Answer with the summary text only.";

const TOPIC_SYSTEM: &str = "You name what a conversation excerpt is currently about. \
Answer with one short sentence.";

/// Drives all synthesis passes against one deduplicator (and through it, one
/// cold index).
pub struct NarrativeSynthesizer {
    dedup: Arc<Deduplicator>,
    provider: Arc<dyn SynthesisProvider>,
    config: MemoryConfig,
}

impl NarrativeSynthesizer {
    pub fn new(
        dedup: Arc<Deduplicator>,
        provider: Arc<dyn SynthesisProvider>,
        config: MemoryConfig,
    ) -> Self {
        Self {
            dedup,
            provider,
            config,
        }
    }

    // ── Turn synthesis ─────────────────────────────────────────

    /// Extract durable memories from the recent episodic stream and store
    /// them. Never fails: any provider or parse problem degrades to an empty
    /// result with a warning. Expression adjustments are returned to the
    /// caller, which owns the hot expression state.
    pub async fn synthesize_turn(
        &self,
        entity_id: &str,
        user_id: &str,
        stream: &[EpisodicTurn],
    ) -> SynthesisResult {
        if stream.is_empty() {
            return SynthesisResult::default();
        }

        let prompt = format!(
            "Conversation excerpt:\n{}",
            transcript(stream, self.config.context_stream_tail)
        );
        let raw = match self.provider.synthesize(TURN_SYNTHESIS_SYSTEM, &prompt).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "turn synthesis call failed");
                return SynthesisResult::default();
            }
        };

        let result = match extract_json(&raw)
            .and_then(|json| serde_json::from_value::<SynthesisResult>(json).ok())
        {
            Some(result) => result,
            None => {
                warn!("turn synthesis returned unparseable output, dropping");
                return SynthesisResult::default();
            }
        };

        self.store_candidates(entity_id, user_id, &result.new_anchors, MemoryType::Anchor)
            .await;
        self.store_candidates(entity_id, user_id, &result.new_artifacts, MemoryType::Artifact)
            .await;
        self.store_candidates(entity_id, user_id, &result.identity_updates, MemoryType::Identity)
            .await;
        self.store_shorthands(entity_id, user_id, &result).await;

        if !result.is_empty() {
            info!(
                entity = entity_id,
                user = user_id,
                anchors = result.new_anchors.len(),
                artifacts = result.new_artifacts.len(),
                identity = result.identity_updates.len(),
                shorthands = result.shorthands.len(),
                "turn synthesis stored new memories"
            );
        }
        result
    }

    async fn store_candidates(
        &self,
        entity_id: &str,
        user_id: &str,
        candidates: &[MemoryCandidate],
        kind: MemoryType,
    ) {
        for candidate in candidates {
            if candidate.content.trim().is_empty() {
                continue;
            }
            let mut node = MemoryNode::new(entity_id, kind, candidate.content.trim())
                .with_assoc(user_id)
                .with_importance(candidate.importance.clamp(1, 10))
                .with_tag(TAG_AUTO_SYNTHESIS);
            node.emotional_state = candidate.emotional_tone.as_ref().map(|tone| EmotionalState {
                tone: tone.clone(),
                intensity: 0.5,
            });
            if let Err(e) = self.dedup.store_with_dedup(node, DedupOptions::default()).await {
                warn!(error = %e, kind = %kind, "failed to store synthesized memory");
            }
        }
    }

    /// Shorthands become one artifact node carrying the vocabulary in its
    /// relational context, where the merge policy's deep merge accumulates
    /// terms across sessions.
    async fn store_shorthands(&self, entity_id: &str, user_id: &str, result: &SynthesisResult) {
        if result.shorthands.is_empty() {
            return;
        }
        let listing = result
            .shorthands
            .iter()
            .map(|s| format!("\"{}\" means {}", s.term, s.meaning))
            .collect::<Vec<_>>()
            .join("; ");
        let mut vocabulary = serde_json::Map::new();
        for s in &result.shorthands {
            vocabulary.insert(
                s.term.trim().to_lowercase(),
                serde_json::Value::String(s.meaning.clone()),
            );
        }
        let mut node = MemoryNode::new(
            entity_id,
            MemoryType::Artifact,
            &format!("Shared vocabulary: {listing}"),
        )
        .with_assoc(user_id)
        .with_importance(6)
        .with_tag(TAG_AUTO_SYNTHESIS);
        node.relational_context = Some(serde_json::json!({ "sharedVocabulary": vocabulary }));

        if let Err(e) = self.dedup.store_with_dedup(node, DedupOptions::default()).await {
            warn!(error = %e, "failed to store vocabulary artifact");
        }
    }

    // ── Deep synthesis ─────────────────────────────────────────

    /// Consolidate near-duplicate clusters per memory type and tag
    /// high-recall nodes as promotion candidates. Returns the number of
    /// merges performed.
    pub async fn run_deep_synthesis(&self, entity_id: &str, user_id: &str) -> Result<usize> {
        let mut merges = 0;
        for kind in MemoryType::ALL {
            // Core directives are curated by hand, never auto-consolidated.
            if matches!(kind, MemoryType::Core | MemoryType::CoreExtension) {
                continue;
            }
            let outcomes = self
                .dedup
                .cluster_and_consolidate(entity_id, Some(user_id), kind)
                .await?;
            merges += outcomes.len();
        }

        let index = self.dedup.index();
        let mut promoted = 0;
        for kind in [MemoryType::Episode, MemoryType::Artifact, MemoryType::Anchor] {
            for mut node in index.get_by_type(entity_id, Some(user_id), kind, usize::MAX)? {
                if node.recall_count >= PROMOTION_RECALL_THRESHOLD
                    && !node.tags.contains(TAG_PROMOTION_CANDIDATE)
                {
                    node.tags.insert(TAG_PROMOTION_CANDIDATE.to_string());
                    index.upsert_memory(&node)?;
                    promoted += 1;
                }
            }
        }

        info!(
            entity = entity_id,
            user = user_id,
            merges,
            promoted,
            "deep synthesis complete"
        );
        Ok(merges)
    }

    // ── Sleep synthesis ────────────────────────────────────────

    /// Walk unprocessed memories newest-first and decide, per memory, what to
    /// do with it relative to its nearest neighbors. Any unrecognized
    /// decision falls back to KEEP. Returns the number of memories processed.
    pub async fn run_sleep_synthesis(
        &self,
        entity_id: &str,
        user_id: &str,
        batch: usize,
    ) -> Result<usize> {
        let index = self.dedup.index();
        let pending = index.get_missing_tag(entity_id, Some(user_id), TAG_SLEEP_PROCESSED, batch)?;
        let mut processed = 0;
        let mut consumed: HashSet<uuid::Uuid> = HashSet::new();

        for node in pending {
            if consumed.contains(&node.id) {
                continue;
            }
            let decision = match &node.embedding {
                None => SleepDecision::Keep,
                Some(embedding) => {
                    let neighbors: Vec<MemoryNode> = index
                        .search_semantic(
                            entity_id,
                            Some(user_id),
                            QueryInput::Embedding(embedding),
                            SLEEP_NEIGHBOR_COUNT + 1,
                            None,
                        )
                        .await?
                        .into_iter()
                        .map(|s| s.node)
                        .filter(|n| n.id != node.id && !consumed.contains(&n.id))
                        .take(SLEEP_NEIGHBOR_COUNT)
                        .collect();
                    if neighbors.is_empty() {
                        SleepDecision::Keep
                    } else {
                        self.decide_sleep_action(&node, &neighbors).await
                    }
                }
            };

            match decision {
                SleepDecision::Absorb(mut neighbor) => {
                    neighbor.synthesized_from.push(node.id);
                    index.upsert_memory(&neighbor)?;
                    index.delete_memory(node.id)?;
                    consumed.insert(node.id);
                    debug!(id = %node.id, into = %neighbor.id, "sleep: absorbed");
                }
                SleepDecision::Merge(neighbor) => {
                    let content = merge::longest_variant(&[
                        neighbor.content.as_str(),
                        node.content.as_str(),
                    ]);
                    let mut merged = merge::merge_nodes(
                        &neighbor,
                        std::slice::from_ref(&node),
                        content,
                        self.config.merge_confidence_bonus,
                    );
                    merged.tags.insert(TAG_SLEEP_PROCESSED.to_string());
                    index.upsert_memory(&merged)?;
                    index.delete_memory(node.id)?;
                    consumed.insert(node.id);
                    debug!(id = %node.id, into = %merged.id, "sleep: merged");
                }
                SleepDecision::Link(neighbor) => {
                    index.link_memories(node.id, neighbor.id)?;
                    self.mark_sleep_processed(&node)?;
                }
                SleepDecision::Keep => {
                    self.mark_sleep_processed(&node)?;
                }
            }
            processed += 1;
        }

        if processed > 0 {
            info!(entity = entity_id, user = user_id, processed, "sleep synthesis pass complete");
        }
        Ok(processed)
    }

    async fn decide_sleep_action(
        &self,
        node: &MemoryNode,
        neighbors: &[MemoryNode],
    ) -> SleepDecision {
        let prompt = format!(
            "Memory: {}\n\nNeighbors:\n{}",
            node.content,
            neighbors
                .iter()
                .enumerate()
                .map(|(i, n)| format!("{}. [{}] {}", i + 1, n.kind, n.content))
                .collect::<Vec<_>>()
                .join("\n")
        );
        let raw = match self.provider.synthesize(SLEEP_SYSTEM, &prompt).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "sleep decision call failed, keeping memory");
                return SleepDecision::Keep;
            }
        };
        let first = neighbors[0].clone();
        match raw
            .split(|c: char| !c.is_ascii_alphabetic())
            .find(|w| !w.is_empty())
            .map(str::to_ascii_uppercase)
            .as_deref()
        {
            Some("ABSORB") => SleepDecision::Absorb(first),
            Some("MERGE") => SleepDecision::Merge(first),
            Some("LINK") => SleepDecision::Link(first),
            Some("KEEP") => SleepDecision::Keep,
            other => {
                debug!(?other, "unrecognized sleep decision, keeping memory");
                SleepDecision::Keep
            }
        }
    }

    fn mark_sleep_processed(&self, node: &MemoryNode) -> Result<()> {
        let mut updated = node.clone();
        updated.tags.insert(TAG_SLEEP_PROCESSED.to_string());
        self.dedup.index().upsert_memory(&updated)?;
        Ok(())
    }

    // ── Compass and topic summaries ────────────────────────────

    /// Distill an expiring episodic stream into the persistent compass node,
    /// replacing the previous one. Failures return `None` — losing a compass
    /// update must never block session turnover.
    pub async fn synthesize_compass(
        &self,
        entity_id: &str,
        user_id: &str,
        stream: &[EpisodicTurn],
    ) -> Option<MemoryNode> {
        if stream.is_empty() {
            return None;
        }
        let prompt = format!(
            "Conversation about to be cleared:\n{}",
            transcript(stream, self.config.episodic_window)
        );
        let summary = match self.provider.synthesize(COMPASS_SYSTEM, &prompt).await {
            Ok(text) => text.trim().to_string(),
            Err(e) => {
                warn!(error = %e, "compass synthesis failed");
                return None;
            }
        };
        if summary.is_empty() || summary == "{}" {
            return None;
        }

        let index = self.dedup.index();
        let previous = index
            .get_by_tag(entity_id, Some(user_id), TAG_COMPASS, usize::MAX)
            .unwrap_or_default();

        let node = MemoryNode::new(entity_id, MemoryType::Episode, &summary)
            .with_assoc(user_id)
            .with_importance(8)
            .with_tag(TAG_COMPASS)
            .with_tag(TAG_AUTO_SYNTHESIS);
        let stored = match self.dedup.store_with_dedup(node, DedupOptions::default()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "compass store failed");
                return None;
            }
        };

        // The compass replaces, never accumulates.
        for old in previous {
            if old.id != stored.id {
                if let Err(e) = index.delete_memory(old.id) {
                    warn!(error = %e, id = %old.id, "failed to delete superseded compass");
                }
            }
        }

        index.get_by_ids(&[stored.id]).ok()?.pop()
    }

    /// One-line description of what the conversation is currently about, for
    /// the active-context topic list. Best-effort.
    pub async fn summarize_topic(&self, stream: &[EpisodicTurn]) -> Option<String> {
        if stream.is_empty() {
            return None;
        }
        let prompt = transcript(stream, self.config.context_stream_tail);
        match self.provider.synthesize(TOPIC_SYSTEM, &prompt).await {
            Ok(text) => {
                let text = text.trim().to_string();
                (!text.is_empty() && text != "{}").then_some(text)
            }
            Err(e) => {
                warn!(error = %e, "topic summary failed");
                None
            }
        }
    }
}

enum SleepDecision {
    Absorb(MemoryNode),
    Merge(MemoryNode),
    Link(MemoryNode),
    Keep,
}

fn transcript(stream: &[EpisodicTurn], tail: usize) -> String {
    let skip = stream.len().saturating_sub(tail);
    stream
        .iter()
        .skip(skip)
        .map(|turn| {
            let speaker = match turn.role {
                TurnRole::User => "User",
                TurnRole::Assistant => "Assistant",
            };
            format!("{speaker}: {}", turn.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
