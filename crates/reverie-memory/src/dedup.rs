//! Write-path dedup/merge engine for the cold index.
//!
//! Every explicit store funnels through [`Deduplicator::store_with_dedup`]:
//! a cheap recent-write cache absorbs rapid-fire repeats of the same fact,
//! then a vector lookup finds semantic near-duplicates and collapses them
//! into one node. A drift check guards the merge — if the merged text has
//! wandered away from its sources in embedding space, the nodes are linked
//! instead of merged.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cold::{ColdMemoryIndex, QueryInput};
use crate::merge::{self, ContentPlan};
use crate::score::{cosine_similarity, word_overlap};
use reverie_config::MemoryConfig;
use reverie_core::{MemoryNode, MemoryType, Result};
use reverie_llm::{EmbeddingProvider, SynthesisProvider};

const CONSOLIDATE_SYSTEM: &str = "You consolidate near-duplicate memory notes \
into a single note. Preserve every concrete detail from the variants, remove \
repetition, and answer with the consolidated note text only.";

/// Knobs for a single store call.
#[derive(Debug, Clone, Copy, Default)]
pub struct DedupOptions {
    /// When set, absorbed duplicates are reported in
    /// [`StoreOutcome::deferred_deletes`] instead of being deleted inline.
    /// Used by batch consolidation so a failure mid-pass never leaves the
    /// index missing rows it still references.
    pub defer_deletes: bool,
}

/// What a store call did.
#[derive(Debug, Clone)]
pub struct StoreOutcome {
    /// Id of the node now representing this memory.
    pub id: Uuid,
    pub merged: bool,
    /// Number of prior nodes this write absorbed.
    pub merged_count: usize,
    pub merged_ids: Vec<Uuid>,
    /// Absorbed ids left in place because the caller deferred deletes.
    pub deferred_deletes: Vec<Uuid>,
}

impl StoreOutcome {
    fn stored(id: Uuid) -> Self {
        Self {
            id,
            merged: false,
            merged_count: 0,
            merged_ids: Vec::new(),
            deferred_deletes: Vec::new(),
        }
    }
}

struct RecentWrite {
    id: Uuid,
    content: String,
    at: Instant,
}

fn recent_key(node: &MemoryNode) -> (String, String, &'static str) {
    let user = node.assoc_ids.iter().next().cloned().unwrap_or_default();
    (node.entity_id.clone(), user, node.kind.as_str())
}

/// Merge engine sitting in front of the cold index's write path.
pub struct Deduplicator {
    index: Arc<ColdMemoryIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    synthesizer: Arc<dyn SynthesisProvider>,
    config: MemoryConfig,
    // Keyed by (entity, primary user, kind). Entries expire after the
    // recent-write TTL.
    recent: Mutex<std::collections::HashMap<(String, String, &'static str), Vec<RecentWrite>>>,
}

impl Deduplicator {
    pub fn new(
        index: Arc<ColdMemoryIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        synthesizer: Arc<dyn SynthesisProvider>,
        config: MemoryConfig,
    ) -> Self {
        Self {
            index,
            embedder,
            synthesizer,
            config,
            recent: Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn index(&self) -> &Arc<ColdMemoryIndex> {
        &self.index
    }

    /// Store a node, merging it into an existing near-duplicate when one
    /// exists. The returned outcome always names the node that now holds
    /// this memory.
    pub async fn store_with_dedup(
        &self,
        mut node: MemoryNode,
        options: DedupOptions,
    ) -> Result<StoreOutcome> {
        node.validate()?;

        // Step 1: recent-write cache. Rapid repeats of the same fact (same
        // entity and kind, near-identical wording) within the TTL collapse to
        // the previous write without touching the embedder.
        if let Some(existing) = self.check_recent(&node) {
            debug!(id = %existing, "recent-write cache hit, skipping store");
            return Ok(StoreOutcome {
                id: existing,
                merged: true,
                merged_count: 1,
                merged_ids: vec![existing],
                deferred_deletes: Vec::new(),
            });
        }

        // Step 2: ensure an embedding. An embedding outage disables dedup for
        // this write but never blocks storage.
        if node.embedding.is_none() {
            match self.embedder.embed(&node.content).await {
                Ok(e) => node.embedding = Some(e),
                Err(e) => {
                    warn!(error = %e, "embedding failed, storing without dedup");
                    let id = self.index.upsert_memory(&node)?;
                    return Ok(StoreOutcome::stored(id));
                }
            }
        }

        // Step 3: find near-duplicates of the same kind above the similarity
        // threshold, capped at the cluster size.
        let duplicates = self.find_duplicates(&node).await?;
        if duplicates.is_empty() {
            let id = self.index.upsert_memory(&node)?;
            self.remember_write(&node);
            return Ok(StoreOutcome::stored(id));
        }

        // Step 4: resolve merged content (maybe via LLM synthesis).
        let contents: Vec<&str> = std::iter::once(node.content.as_str())
            .chain(duplicates.iter().map(|n| n.content.as_str()))
            .collect();
        let merged_content = self.resolve_content(&contents).await;

        // Step 5: drift check. The merged text must still sit within the
        // dedup threshold of every source; if it drifted, link instead of
        // merging so no source memory is silently rewritten.
        // When the candidate's own text won (subsuming case), its vector is
        // already in hand; don't embed the same string twice.
        let merged_embedding = if merged_content == node.content {
            node.embedding.clone()
        } else {
            match self.embedder.embed(&merged_content).await {
                Ok(e) => Some(e),
                Err(e) => {
                    warn!(error = %e, "merged-content embedding failed");
                    None
                }
            }
        };
        // Drift holds when, for every source S:
        //   sim(merged, candidate) >= sim(merged, S) >= sim(candidate, S)
        // i.e. the merged text stays anchored to the candidate and moves no
        // further from any source than the candidate already was.
        let drifted = match (&merged_embedding, &node.embedding) {
            (Some(me), Some(ce)) => {
                let sim_mc = cosine_similarity(me, ce);
                duplicates.iter().filter_map(|s| s.embedding.as_ref()).any(|se| {
                    let sim_ms = cosine_similarity(me, se);
                    let sim_cs = cosine_similarity(ce, se);
                    sim_mc < sim_ms - 1e-6 || sim_ms < sim_cs - 1e-6
                })
            }
            // Nothing to verify against: be conservative, do not merge.
            _ => merged_content != node.content,
        };

        if drifted {
            info!(
                candidate = %node.id,
                cluster = duplicates.len(),
                "merge drift detected, linking instead of merging"
            );
            let id = self.index.upsert_memory(&node)?;
            for duplicate in &duplicates {
                self.index.link_memories(id, duplicate.id)?;
            }
            self.remember_write(&node);
            return Ok(StoreOutcome::stored(id));
        }

        // Step 6: merge, persist, drop (or defer) the absorbed rows.
        let mut merged = merge::merge_nodes(
            &node,
            &duplicates,
            merged_content,
            self.config.merge_confidence_bonus,
        );
        if merged.embedding.is_none() {
            merged.embedding = merged_embedding;
        }
        let id = self.index.upsert_memory(&merged)?;

        let merged_ids: Vec<Uuid> = duplicates.iter().map(|n| n.id).collect();
        let deferred_deletes = if options.defer_deletes {
            merged_ids.clone()
        } else {
            self.index.delete_memories(&merged_ids)?;
            Vec::new()
        };

        info!(
            id = %id,
            absorbed = merged_ids.len(),
            kind = %merged.kind,
            "merged duplicate memories"
        );
        self.remember_write(&merged);
        Ok(StoreOutcome {
            id,
            merged: true,
            merged_count: merged_ids.len(),
            merged_ids,
            deferred_deletes,
        })
    }

    /// Batch consolidation for one entity/user/kind: greedily cluster stored
    /// nodes by embedding similarity and collapse each cluster into its
    /// newest member. Returns the outcomes of the merges performed.
    pub async fn cluster_and_consolidate(
        &self,
        entity_id: &str,
        user_id: Option<&str>,
        kind: MemoryType,
    ) -> Result<Vec<StoreOutcome>> {
        let mut nodes = self
            .index
            .get_by_type(entity_id, user_id, kind, usize::MAX)?
            .into_iter()
            .filter(|n| n.embedding.is_some())
            .collect::<Vec<_>>();
        // Newest first so each cluster's candidate is its freshest phrasing.
        nodes.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let mut assigned = vec![false; nodes.len()];
        let mut outcomes = Vec::new();

        for i in 0..nodes.len() {
            if assigned[i] {
                continue;
            }
            assigned[i] = true;
            let mut cluster: Vec<MemoryNode> = Vec::new();
            let anchor_embedding = nodes[i].embedding.as_ref().unwrap().clone();
            for j in (i + 1)..nodes.len() {
                if assigned[j] || cluster.len() + 1 >= self.config.dedup_cluster_cap {
                    continue;
                }
                let sim =
                    cosine_similarity(&anchor_embedding, nodes[j].embedding.as_ref().unwrap());
                if sim >= self.config.dedup_similarity_threshold {
                    assigned[j] = true;
                    cluster.push(nodes[j].clone());
                }
            }
            if cluster.is_empty() {
                continue;
            }

            let candidate = nodes[i].clone();
            let contents: Vec<&str> = std::iter::once(candidate.content.as_str())
                .chain(cluster.iter().map(|n| n.content.as_str()))
                .collect();
            let merged_content = self.resolve_content(&contents).await;

            let mut merged = merge::merge_nodes(
                &candidate,
                &cluster,
                merged_content,
                self.config.merge_confidence_bonus,
            );
            if merged.embedding.is_none() {
                match self.embedder.embed(&merged.content).await {
                    Ok(e) => merged.embedding = Some(e),
                    Err(e) => warn!(error = %e, "consolidated node left unembedded"),
                }
            }
            let id = self.index.upsert_memory(&merged)?;
            let merged_ids: Vec<Uuid> = cluster.iter().map(|n| n.id).collect();
            self.index.delete_memories(&merged_ids)?;

            outcomes.push(StoreOutcome {
                id,
                merged: true,
                merged_count: merged_ids.len(),
                merged_ids,
                deferred_deletes: Vec::new(),
            });
        }

        if !outcomes.is_empty() {
            info!(
                entity = entity_id,
                kind = %kind,
                clusters = outcomes.len(),
                "consolidation pass complete"
            );
        }
        Ok(outcomes)
    }

    // ── Internals ──────────────────────────────────────────────

    async fn find_duplicates(&self, node: &MemoryNode) -> Result<Vec<MemoryNode>> {
        let Some(embedding) = &node.embedding else {
            return Ok(Vec::new());
        };
        let primary_user = node.assoc_ids.iter().next().map(String::as_str);
        let hits = self
            .index
            .search_semantic(
                &node.entity_id,
                primary_user,
                QueryInput::Embedding(embedding),
                self.config.dedup_cluster_cap,
                Some(node.kind),
            )
            .await?;
        Ok(hits
            .into_iter()
            .filter(|s| {
                s.node.id != node.id && s.similarity >= self.config.dedup_similarity_threshold
            })
            .map(|s| s.node)
            .collect())
    }

    /// Resolve the merged content per the content plan; synthesis failures
    /// fall back to the longest variant.
    async fn resolve_content(&self, contents: &[&str]) -> String {
        match merge::plan_content(contents, self.config.merge_variant_cap) {
            ContentPlan::Subsuming(text) => text,
            ContentPlan::NeedsSynthesis(variants) => {
                let prompt = format!(
                    "Consolidate these {} variants of the same memory:\n{}",
                    variants.len(),
                    variants
                        .iter()
                        .enumerate()
                        .map(|(i, v)| format!("{}. {v}", i + 1))
                        .collect::<Vec<_>>()
                        .join("\n")
                );
                match self.synthesizer.synthesize(CONSOLIDATE_SYSTEM, &prompt).await {
                    Ok(text) if !text.trim().is_empty() && text.trim() != "{}" => {
                        text.trim().to_string()
                    }
                    Ok(_) => merge::longest_variant(contents),
                    Err(e) => {
                        warn!(error = %e, "content synthesis failed, using longest variant");
                        merge::longest_variant(contents)
                    }
                }
            }
        }
    }

    fn check_recent(&self, node: &MemoryNode) -> Option<Uuid> {
        let ttl = Duration::from_secs(self.config.recent_write_ttl_secs.max(0) as u64);
        let key = recent_key(node);
        let mut recent = self.recent.lock();
        let entries = recent.get_mut(&key)?;
        entries.retain(|e| e.at.elapsed() <= ttl);
        entries
            .iter()
            .find(|e| word_overlap(&e.content, &node.content) >= self.config.recent_write_jaccard)
            .map(|e| e.id)
    }

    fn remember_write(&self, node: &MemoryNode) {
        let key = recent_key(node);
        let mut recent = self.recent.lock();
        let entries = recent.entry(key).or_default();
        entries.push(RecentWrite {
            id: node.id,
            content: node.content.clone(),
            at: Instant::now(),
        });
        // Keep the per-key window small; the TTL handles correctness.
        if entries.len() > 32 {
            entries.drain(..entries.len() - 32);
        }
    }
}
