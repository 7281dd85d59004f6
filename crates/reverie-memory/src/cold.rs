//! Cold memory — the durable, vector-searchable long-term index.
//!
//! A single SQLite table of memory nodes partitioned by entity, with
//! embeddings stored as little-endian f32 blobs. Semantic search pre-filters
//! in SQL, over-fetches by raw cosine similarity, then re-ranks every
//! candidate with the composite recall score — results are ordered by
//! recall, not by vector distance.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::score::{cosine_similarity, recall_score};
use reverie_config::MemoryConfig;
use reverie_core::{MemoryNode, MemoryType, Result, ReverieError};
use reverie_llm::EmbeddingProvider;

const NODE_COLUMNS: &str = "id, entity_id, assoc_ids, kind, content, embedding, related_ids, \
     parent_id, tags, importance, confidence, decay_rate, timestamp, last_accessed, \
     recall_count, emotional_state, relational_context, synthesized_from, synthesis_type";

/// A semantic-search query: either raw text (embedded internally) or a
/// precomputed embedding, so callers that already embedded the same text
/// never pay for it twice.
pub enum QueryInput<'a> {
    Text(&'a str),
    Embedding(&'a [f32]),
}

/// One semantic-search result with both the raw similarity and the composite
/// recall score it was ranked by.
#[derive(Debug, Clone)]
pub struct ScoredNode {
    pub node: MemoryNode,
    pub similarity: f32,
    pub recall: f64,
}

/// Counts returned by a cascading forget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForgetSummary {
    pub deleted: usize,
    pub anonymized: usize,
}

/// Durable memory index over SQLite.
pub struct ColdMemoryIndex {
    db: Arc<Mutex<Connection>>,
    embedder: Arc<dyn EmbeddingProvider>,
    config: MemoryConfig,
    dims: usize,
}

impl ColdMemoryIndex {
    /// Open or create the index database at the given path.
    pub fn open(
        path: &Path,
        embedder: Arc<dyn EmbeddingProvider>,
        config: MemoryConfig,
    ) -> Result<Self> {
        info!(?path, "opening cold memory index");

        let conn = Connection::open(path).map_err(|e| ReverieError::Memory(e.to_string()))?;

        // Enable WAL mode for concurrent reads
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| ReverieError::Memory(e.to_string()))?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS memory_nodes (
                id TEXT PRIMARY KEY,
                entity_id TEXT NOT NULL,
                assoc_ids TEXT NOT NULL DEFAULT '[]',
                kind TEXT NOT NULL,
                content TEXT NOT NULL,
                embedding BLOB,
                related_ids TEXT NOT NULL DEFAULT '[]',
                parent_id TEXT,
                tags TEXT NOT NULL DEFAULT '[]',
                importance INTEGER NOT NULL DEFAULT 5,
                confidence REAL NOT NULL DEFAULT 1.0,
                decay_rate REAL NOT NULL DEFAULT 0.0,
                timestamp TEXT NOT NULL,
                last_accessed TEXT NOT NULL,
                recall_count INTEGER NOT NULL DEFAULT 0,
                emotional_state TEXT,
                relational_context TEXT,
                synthesized_from TEXT NOT NULL DEFAULT '[]',
                synthesis_type TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_nodes_entity ON memory_nodes(entity_id);
            CREATE INDEX IF NOT EXISTS idx_nodes_entity_kind ON memory_nodes(entity_id, kind);
            CREATE INDEX IF NOT EXISTS idx_nodes_importance ON memory_nodes(entity_id, importance);
            ",
        )
        .map_err(|e| ReverieError::Memory(e.to_string()))?;

        let dims = embedder.dimensions();
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            embedder,
            config,
            dims,
        })
    }

    /// Open an in-memory database (for tests).
    pub fn open_in_memory(
        embedder: Arc<dyn EmbeddingProvider>,
        config: MemoryConfig,
    ) -> Result<Self> {
        Self::open(Path::new(":memory:"), embedder, config)
    }

    /// The configured embedding dimensionality.
    pub fn dimensions(&self) -> usize {
        self.dims
    }

    // ── Writes ─────────────────────────────────────────────────

    /// Insert or replace a node by id. Rejects embeddings whose length does
    /// not match the index's configured dimensionality.
    pub fn upsert_memory(&self, node: &MemoryNode) -> Result<Uuid> {
        node.validate()?;
        if let Some(emb) = &node.embedding {
            if emb.len() != self.dims {
                return Err(ReverieError::validation(
                    "embedding",
                    format!("expected {} dimensions, got {}", self.dims, emb.len()),
                ));
            }
        }

        let db = self.db.lock();
        db.execute(
            &format!(
                "INSERT OR REPLACE INTO memory_nodes ({NODE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)"
            ),
            rusqlite::params![
                node.id.to_string(),
                node.entity_id,
                json_string(&node.assoc_ids),
                node.kind.as_str(),
                node.content,
                node.embedding.as_ref().map(|e| embedding_blob(e)),
                json_string(&node.related_ids),
                node.parent_id.map(|p| p.to_string()),
                json_string(&node.tags),
                node.importance as i64,
                node.confidence,
                node.decay_rate,
                node.timestamp.to_rfc3339(),
                node.last_accessed.to_rfc3339(),
                node.recall_count as i64,
                node.emotional_state
                    .as_ref()
                    .and_then(|s| serde_json::to_string(s).ok()),
                node.relational_context
                    .as_ref()
                    .and_then(|c| serde_json::to_string(c).ok()),
                json_string(&node.synthesized_from),
                node.synthesis_type,
            ],
        )
        .map_err(|e| ReverieError::Memory(e.to_string()))?;

        Ok(node.id)
    }

    pub fn upsert_memories(&self, nodes: &[MemoryNode]) -> Result<Vec<Uuid>> {
        let mut ids = Vec::with_capacity(nodes.len());
        for node in nodes {
            ids.push(self.upsert_memory(node)?);
        }
        Ok(ids)
    }

    pub fn delete_memory(&self, id: Uuid) -> Result<bool> {
        let db = self.db.lock();
        let rows = db
            .execute(
                "DELETE FROM memory_nodes WHERE id = ?1",
                rusqlite::params![id.to_string()],
            )
            .map_err(|e| ReverieError::Memory(e.to_string()))?;
        Ok(rows > 0)
    }

    pub fn delete_memories(&self, ids: &[Uuid]) -> Result<usize> {
        let mut deleted = 0;
        for id in ids {
            if self.delete_memory(*id)? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    // ── Lookups ────────────────────────────────────────────────

    pub fn get_by_ids(&self, ids: &[Uuid]) -> Result<Vec<MemoryNode>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let params: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        let db = self.db.lock();
        let mut stmt = db
            .prepare(&format!(
                "SELECT {NODE_COLUMNS} FROM memory_nodes WHERE id IN ({placeholders})"
            ))
            .map_err(|e| ReverieError::Memory(e.to_string()))?;
        let nodes = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), node_from_row)
            .map_err(|e| ReverieError::Memory(e.to_string()))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(nodes)
    }

    /// All nodes of a kind for an entity, optionally restricted to one user's
    /// associations, newest first.
    pub fn get_by_type(
        &self,
        entity_id: &str,
        user_id: Option<&str>,
        kind: MemoryType,
        limit: usize,
    ) -> Result<Vec<MemoryNode>> {
        let db = self.db.lock();
        let mut stmt = db
            .prepare(&format!(
                "SELECT {NODE_COLUMNS} FROM memory_nodes
                 WHERE entity_id = ?1 AND kind = ?2
                 ORDER BY timestamp DESC"
            ))
            .map_err(|e| ReverieError::Memory(e.to_string()))?;
        let nodes: Vec<MemoryNode> = stmt
            .query_map(
                rusqlite::params![entity_id, kind.as_str()],
                node_from_row,
            )
            .map_err(|e| ReverieError::Memory(e.to_string()))?
            .filter_map(|r| r.ok())
            .filter(|n| user_id.is_none_or(|u| n.assoc_ids.contains(u)))
            .take(limit)
            .collect();
        Ok(nodes)
    }

    /// Strongest memories first, regardless of age, optionally restricted to
    /// one kind. Unlike [`get_by_type`](Self::get_by_type) this never drops an
    /// old high-importance node in favor of a fresher trivial one.
    pub fn get_top_by_importance(
        &self,
        entity_id: &str,
        user_id: Option<&str>,
        kind: Option<MemoryType>,
        min_importance: u8,
        limit: usize,
    ) -> Result<Vec<MemoryNode>> {
        let db = self.db.lock();
        let mut stmt = db
            .prepare(&format!(
                "SELECT {NODE_COLUMNS} FROM memory_nodes
                 WHERE entity_id = ?1 AND importance >= ?2
                 ORDER BY importance DESC, timestamp DESC"
            ))
            .map_err(|e| ReverieError::Memory(e.to_string()))?;
        let nodes: Vec<MemoryNode> = stmt
            .query_map(
                rusqlite::params![entity_id, min_importance as i64],
                node_from_row,
            )
            .map_err(|e| ReverieError::Memory(e.to_string()))?
            .filter_map(|r| r.ok())
            .filter(|n| kind.is_none_or(|k| n.kind == k))
            .filter(|n| user_id.is_none_or(|u| n.assoc_ids.contains(u)))
            .take(limit)
            .collect();
        Ok(nodes)
    }

    /// Nodes carrying a given tag, newest first.
    pub fn get_by_tag(
        &self,
        entity_id: &str,
        user_id: Option<&str>,
        tag: &str,
        limit: usize,
    ) -> Result<Vec<MemoryNode>> {
        let nodes = self.load_for_user(entity_id, user_id, None)?;
        let mut tagged: Vec<MemoryNode> = nodes
            .into_iter()
            .filter(|n| n.tags.contains(tag))
            .collect();
        tagged.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        tagged.truncate(limit);
        Ok(tagged)
    }

    /// Nodes NOT carrying a given tag, newest first. Used by sleep synthesis
    /// to walk unprocessed memories backward in time.
    pub fn get_missing_tag(
        &self,
        entity_id: &str,
        user_id: Option<&str>,
        tag: &str,
        limit: usize,
    ) -> Result<Vec<MemoryNode>> {
        let nodes = self.load_for_user(entity_id, user_id, None)?;
        let mut untagged: Vec<MemoryNode> = nodes
            .into_iter()
            .filter(|n| !n.tags.contains(tag))
            .collect();
        untagged.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        untagged.truncate(limit);
        Ok(untagged)
    }

    /// Word-scored full-text search over content and tags, best match first.
    pub fn search_full_text(
        &self,
        entity_id: &str,
        user_id: Option<&str>,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryNode>> {
        let query_lower = query.to_lowercase();
        let query_words: Vec<&str> = query_lower
            .split_whitespace()
            .filter(|w| w.len() >= 2)
            .collect();

        let nodes = self.load_for_user(entity_id, user_id, None)?;

        let mut scored: Vec<(MemoryNode, usize)> = nodes
            .into_iter()
            .filter_map(|n| {
                let content_lower = n.content.to_lowercase();
                let hit_count = if query_words.is_empty() {
                    usize::from(content_lower.contains(&query_lower))
                } else {
                    query_words
                        .iter()
                        .filter(|w| {
                            content_lower.contains(*w)
                                || n.tags.iter().any(|t| t.to_lowercase().contains(*w))
                        })
                        .count()
                };
                (hit_count > 0).then_some((n, hit_count))
            })
            .collect();

        scored.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(scored.into_iter().map(|(n, _)| n).take(limit).collect())
    }

    // ── Semantic search ────────────────────────────────────────

    /// Pre-filtered nearest-neighbor search re-ranked by recall score.
    ///
    /// Embedding failures degrade to an empty result set — vector search is
    /// disabled for that call, the caller's flow continues. The top results
    /// get a debounced recall-count touch.
    pub async fn search_semantic(
        &self,
        entity_id: &str,
        user_id: Option<&str>,
        query: QueryInput<'_>,
        limit: usize,
        type_filter: Option<MemoryType>,
    ) -> Result<Vec<ScoredNode>> {
        let query_embedding: Vec<f32> = match query {
            QueryInput::Embedding(e) => e.to_vec(),
            QueryInput::Text(text) => match self.embedder.embed(text).await {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "query embedding failed, semantic search degraded to empty");
                    return Ok(Vec::new());
                }
            },
        };
        if query_embedding.len() != self.dims {
            warn!(
                got = query_embedding.len(),
                expected = self.dims,
                "query embedding dimensionality mismatch, degrading to empty"
            );
            return Ok(Vec::new());
        }

        // Nodes without an embedding are excluded until backfilled.
        let candidates = self
            .load_for_user(entity_id, user_id, type_filter)?
            .into_iter()
            .filter(|n| n.embedding.as_ref().is_some_and(|e| e.len() == self.dims));

        let mut by_similarity: Vec<(MemoryNode, f32)> = candidates
            .map(|n| {
                let sim = cosine_similarity(&query_embedding, n.embedding.as_ref().unwrap());
                (n, sim)
            })
            .collect();
        by_similarity
            .sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        // Over-fetch, then re-rank by the composite recall score.
        by_similarity.truncate(limit * self.config.search_overfetch_factor.max(1));

        let now = Utc::now();
        let weights = (
            self.config.recall_weight_similarity,
            self.config.recall_weight_importance,
            self.config.recall_weight_recency,
        );
        let mut ranked: Vec<ScoredNode> = by_similarity
            .into_iter()
            .map(|(node, similarity)| {
                let days = (now - node.last_accessed).num_seconds() as f64 / 86_400.0;
                let recall = recall_score(
                    similarity,
                    node.importance,
                    days,
                    weights,
                    self.config.recency_decay_days,
                );
                ScoredNode {
                    node,
                    similarity,
                    recall,
                }
            })
            .collect();
        ranked.sort_by(|a, b| b.recall.partial_cmp(&a.recall).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(limit);

        self.touch_recalled(&ranked, now);
        debug!(
            entity = entity_id,
            results = ranked.len(),
            "semantic search complete"
        );
        Ok(ranked)
    }

    /// Debounced recall bookkeeping: only the top-N results are touched, and
    /// only when the node wasn't accessed within the touch window. Bounds
    /// write amplification on hot queries; failures are swallowed.
    fn touch_recalled(&self, ranked: &[ScoredNode], now: DateTime<Utc>) {
        let window = Duration::minutes(self.config.recall_touch_window_minutes);
        let db = self.db.lock();
        for scored in ranked.iter().take(self.config.recall_touch_top_n) {
            if now - scored.node.last_accessed <= window {
                continue;
            }
            let result = db.execute(
                "UPDATE memory_nodes SET recall_count = recall_count + 1, last_accessed = ?1 WHERE id = ?2",
                rusqlite::params![now.to_rfc3339(), scored.node.id.to_string()],
            );
            if let Err(e) = result {
                warn!(error = %e, id = %scored.node.id, "recall touch failed");
            }
        }
    }

    // ── Graph ──────────────────────────────────────────────────

    /// Breadth-first expansion over `related_ids`/`parent_id` up to
    /// `max_depth`, deduplicated by id. Seed nodes are never revisited.
    /// Dangling references are tolerated — edges are soft links.
    pub fn expand_graph(&self, seeds: &[MemoryNode], max_depth: usize) -> Result<Vec<MemoryNode>> {
        let mut seen: HashSet<Uuid> = seeds.iter().map(|n| n.id).collect();
        let mut result: Vec<MemoryNode> = seeds.to_vec();
        let mut frontier: VecDeque<(Uuid, usize)> = VecDeque::new();

        for node in seeds {
            for edge in node_edges(node) {
                frontier.push_back((edge, 1));
            }
        }

        while let Some((id, depth)) = frontier.pop_front() {
            if depth > max_depth || !seen.insert(id) {
                continue;
            }
            let Some(node) = self.get_by_ids(&[id])?.pop() else {
                continue; // dangling reference
            };
            if depth < max_depth {
                for edge in node_edges(&node) {
                    if !seen.contains(&edge) {
                        frontier.push_back((edge, depth + 1));
                    }
                }
            }
            result.push(node);
        }

        Ok(result)
    }

    /// Create a bidirectional soft link between two nodes. Idempotent:
    /// related-id sets absorb repeats.
    pub fn link_memories(&self, a: Uuid, b: Uuid) -> Result<()> {
        if a == b {
            return Ok(());
        }
        let nodes = self.get_by_ids(&[a, b])?;
        if nodes.len() != 2 {
            return Err(ReverieError::NotFound(format!(
                "link requires both nodes to exist ({a}, {b})"
            )));
        }
        let db = self.db.lock();
        for node in &nodes {
            let other = if node.id == a { b } else { a };
            let mut related = node.related_ids.clone();
            related.insert(other);
            db.execute(
                "UPDATE memory_nodes SET related_ids = ?1 WHERE id = ?2",
                rusqlite::params![json_string(&related), node.id.to_string()],
            )
            .map_err(|e| ReverieError::Memory(e.to_string()))?;
        }
        Ok(())
    }

    // ── Forgetting ─────────────────────────────────────────────

    /// Forget a user. ANCHOR nodes are deleted outright; nodes with no
    /// synthesis provenance are deleted; merge descendants are anonymized in
    /// place instead — deleting them would silently corrupt other users'
    /// merged memories when cross-referenced. This asymmetry is intentional.
    pub fn cascading_forget(&self, entity_id: &str, user_id: &str) -> Result<ForgetSummary> {
        let nodes = self.load_for_user(entity_id, Some(user_id), None)?;
        let mut summary = ForgetSummary::default();

        for mut node in nodes {
            let delete = node.kind == MemoryType::Anchor || !node.is_merge_descendant();
            if delete {
                self.delete_memory(node.id)?;
                summary.deleted += 1;
            } else {
                node.anonymize();
                self.upsert_memory(&node)?;
                summary.anonymized += 1;
            }
        }

        info!(
            entity = entity_id,
            user = user_id,
            deleted = summary.deleted,
            anonymized = summary.anonymized,
            "cascading forget complete"
        );
        Ok(summary)
    }

    // ── Maintenance ────────────────────────────────────────────

    /// Regenerate embeddings for nodes missing one, re-admitting them to
    /// vector search. Returns the number backfilled.
    pub async fn backfill_embeddings(&self, entity_id: &str, limit: usize) -> Result<usize> {
        let pending: Vec<(Uuid, String)> = {
            let db = self.db.lock();
            let mut stmt = db
                .prepare(
                    "SELECT id, content FROM memory_nodes
                     WHERE entity_id = ?1 AND embedding IS NULL LIMIT ?2",
                )
                .map_err(|e| ReverieError::Memory(e.to_string()))?;
            stmt.query_map(rusqlite::params![entity_id, limit as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| ReverieError::Memory(e.to_string()))?
            .filter_map(|r| r.ok())
            .filter_map(|(id, content)| id.parse::<Uuid>().ok().map(|id| (id, content)))
            .collect()
        };

        if pending.is_empty() {
            return Ok(0);
        }

        let texts: Vec<&str> = pending.iter().map(|(_, c)| c.as_str()).collect();
        let embeddings = self.embedder.embed_batch(&texts).await?;

        let db = self.db.lock();
        let mut count = 0;
        for ((id, _), embedding) in pending.iter().zip(embeddings.iter()) {
            if embedding.len() != self.dims {
                continue;
            }
            db.execute(
                "UPDATE memory_nodes SET embedding = ?1 WHERE id = ?2",
                rusqlite::params![embedding_blob(embedding), id.to_string()],
            )
            .map_err(|e| ReverieError::Memory(e.to_string()))?;
            count += 1;
        }
        Ok(count)
    }

    // ── Internals ──────────────────────────────────────────────

    /// Load all nodes for an entity, optionally pre-filtered by kind in SQL
    /// and by user association in Rust (assoc ids live in a JSON column).
    fn load_for_user(
        &self,
        entity_id: &str,
        user_id: Option<&str>,
        kind: Option<MemoryType>,
    ) -> Result<Vec<MemoryNode>> {
        let db = self.db.lock();
        let sql = match kind {
            Some(_) => format!(
                "SELECT {NODE_COLUMNS} FROM memory_nodes WHERE entity_id = ?1 AND kind = ?2"
            ),
            None => format!("SELECT {NODE_COLUMNS} FROM memory_nodes WHERE entity_id = ?1"),
        };
        let mut stmt = db
            .prepare(&sql)
            .map_err(|e| ReverieError::Memory(e.to_string()))?;

        let mapped: Vec<MemoryNode> = match kind {
            Some(k) => stmt
                .query_map(rusqlite::params![entity_id, k.as_str()], node_from_row)
                .map_err(|e| ReverieError::Memory(e.to_string()))?
                .filter_map(|r| r.ok())
                .collect(),
            None => stmt
                .query_map(rusqlite::params![entity_id], node_from_row)
                .map_err(|e| ReverieError::Memory(e.to_string()))?
                .filter_map(|r| r.ok())
                .collect(),
        };

        Ok(mapped
            .into_iter()
            .filter(|n| user_id.is_none_or(|u| n.assoc_ids.contains(u)))
            .collect())
    }
}

fn node_edges(node: &MemoryNode) -> Vec<Uuid> {
    let mut edges: Vec<Uuid> = node.related_ids.iter().copied().collect();
    if let Some(parent) = node.parent_id {
        edges.push(parent);
    }
    edges
}

fn json_string<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "[]".to_string())
}

/// Serialize an embedding as little-endian f32 bytes.
fn embedding_blob(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn embedding_from_blob(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.is_empty() || blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
    )
}

fn parse_instant(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn node_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryNode> {
    let id: String = row.get(0)?;
    let assoc_ids: String = row.get(2)?;
    let kind: String = row.get(3)?;
    let embedding: Option<Vec<u8>> = row.get(5)?;
    let related_ids: String = row.get(6)?;
    let parent_id: Option<String> = row.get(7)?;
    let tags: String = row.get(8)?;
    let timestamp: String = row.get(12)?;
    let last_accessed: String = row.get(13)?;
    let emotional_state: Option<String> = row.get(15)?;
    let relational_context: Option<String> = row.get(16)?;
    let synthesized_from: String = row.get(17)?;

    Ok(MemoryNode {
        id: id.parse().unwrap_or_else(|_| Uuid::nil()),
        entity_id: row.get(1)?,
        assoc_ids: serde_json::from_str::<BTreeSet<String>>(&assoc_ids).unwrap_or_default(),
        kind: kind.parse().unwrap_or(MemoryType::Episode),
        content: row.get(4)?,
        embedding: embedding.as_deref().and_then(embedding_from_blob),
        related_ids: serde_json::from_str::<BTreeSet<Uuid>>(&related_ids).unwrap_or_default(),
        parent_id: parent_id.and_then(|p| p.parse().ok()),
        tags: serde_json::from_str::<BTreeSet<String>>(&tags).unwrap_or_default(),
        importance: row.get::<_, i64>(9)?.clamp(1, 10) as u8,
        confidence: row.get(10)?,
        decay_rate: row.get(11)?,
        timestamp: parse_instant(&timestamp),
        last_accessed: parse_instant(&last_accessed),
        recall_count: row.get::<_, i64>(14)?.max(0) as u32,
        emotional_state: emotional_state.and_then(|s| serde_json::from_str(&s).ok()),
        relational_context: relational_context.and_then(|s| serde_json::from_str(&s).ok()),
        synthesized_from: serde_json::from_str::<Vec<Uuid>>(&synthesized_from).unwrap_or_default(),
        synthesis_type: row.get(18)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use reverie_llm::MockEmbedder;

    fn test_index() -> ColdMemoryIndex {
        let embedder = Arc::new(MockEmbedder::new(8));
        ColdMemoryIndex::open_in_memory(embedder, MemoryConfig::default()).unwrap()
    }

    fn node(entity: &str, user: &str, kind: MemoryType, content: &str) -> MemoryNode {
        MemoryNode::new(entity, kind, content).with_assoc(user)
    }

    #[test]
    fn test_embedding_blob_roundtrip() {
        let original = vec![0.25f32, -1.5, 3.75, 0.0];
        let blob = embedding_blob(&original);
        assert_eq!(embedding_from_blob(&blob), Some(original));
        assert_eq!(embedding_from_blob(&[]), None);
        assert_eq!(embedding_from_blob(&[1, 2, 3]), None);
    }

    #[test]
    fn test_upsert_and_get_roundtrip() {
        let index = test_index();
        let mut n = node("ava", "user-1", MemoryType::Anchor, "first shared joke about compilers");
        n.embedding = Some(vec![0.1; 8]);
        n.importance = 7;
        index.upsert_memory(&n).unwrap();

        let fetched = index.get_by_ids(&[n.id]).unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].content, n.content);
        assert_eq!(fetched[0].importance, 7);
        assert_eq!(fetched[0].embedding, Some(vec![0.1; 8]));
        assert!(fetched[0].assoc_ids.contains("user-1"));
    }

    #[test]
    fn test_upsert_rejects_wrong_dimensionality() {
        let index = test_index();
        let mut n = node("ava", "user-1", MemoryType::Episode, "short note");
        n.embedding = Some(vec![0.5; 3]);
        assert!(index.upsert_memory(&n).is_err());
    }

    #[test]
    fn test_get_by_type_respects_user_partition() {
        let index = test_index();
        index
            .upsert_memory(&node("ava", "user-1", MemoryType::Identity, "I value precision"))
            .unwrap();
        index
            .upsert_memory(&node("ava", "user-2", MemoryType::Identity, "I enjoy wordplay"))
            .unwrap();

        let for_one = index
            .get_by_type("ava", Some("user-1"), MemoryType::Identity, 10)
            .unwrap();
        assert_eq!(for_one.len(), 1);
        assert_eq!(for_one[0].content, "I value precision");

        let all = index.get_by_type("ava", None, MemoryType::Identity, 10).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_get_top_by_importance_ignores_recency_and_filters_kind() {
        let index = test_index();
        let mut old_strong = node("ava", "user-1", MemoryType::Anchor, "user recently got engaged");
        old_strong.importance = 10;
        old_strong.timestamp = chrono::Utc::now() - chrono::Duration::days(120);
        index.upsert_memory(&old_strong).unwrap();

        let mut fresh_weak = node("ava", "user-1", MemoryType::Anchor, "user likes toast");
        fresh_weak.importance = 2;
        index.upsert_memory(&fresh_weak).unwrap();

        let mut other_kind = node("ava", "user-1", MemoryType::Identity, "I value precision");
        other_kind.importance = 9;
        index.upsert_memory(&other_kind).unwrap();

        // The old anchor outranks the fresh one; the identity node is filtered.
        let top = index
            .get_top_by_importance("ava", Some("user-1"), Some(MemoryType::Anchor), 1, 1)
            .unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].id, old_strong.id);

        // The importance floor prunes the weak anchor.
        let strong = index
            .get_top_by_importance("ava", Some("user-1"), Some(MemoryType::Anchor), 5, 10)
            .unwrap();
        assert_eq!(strong.len(), 1);
        assert_eq!(strong[0].id, old_strong.id);
    }

    #[test]
    fn test_link_memories_bidirectional_and_idempotent() {
        let index = test_index();
        let a = node("ava", "user-1", MemoryType::Anchor, "the lighthouse metaphor");
        let b = node("ava", "user-1", MemoryType::Artifact, "lighthouse: our word for a guiding idea");
        index.upsert_memory(&a).unwrap();
        index.upsert_memory(&b).unwrap();

        index.link_memories(a.id, b.id).unwrap();
        index.link_memories(a.id, b.id).unwrap();

        let fetched = index.get_by_ids(&[a.id, b.id]).unwrap();
        for n in &fetched {
            assert_eq!(n.related_ids.len(), 1);
        }
    }

    #[test]
    fn test_expand_graph_follows_links_without_revisiting() {
        let index = test_index();
        let a = node("ava", "user-1", MemoryType::Anchor, "root");
        let mut b = node("ava", "user-1", MemoryType::Episode, "child");
        b.related_ids.insert(a.id);
        let mut a2 = a.clone();
        a2.related_ids.insert(b.id);
        index.upsert_memory(&a2).unwrap();
        index.upsert_memory(&b).unwrap();

        let expanded = index.expand_graph(&[a2.clone()], 2).unwrap();
        assert_eq!(expanded.len(), 2);
    }

    #[test]
    fn test_cascading_forget_asymmetry() {
        let index = test_index();
        let anchor = node("ava", "user-1", MemoryType::Anchor, "a private shared moment");
        let plain = node("ava", "user-1", MemoryType::Episode, "user mentioned the beach");
        let mut merged = node("ava", "user-1", MemoryType::Identity, "synthesized trait");
        merged.synthesized_from = vec![Uuid::new_v4()];
        index.upsert_memory(&anchor).unwrap();
        index.upsert_memory(&plain).unwrap();
        index.upsert_memory(&merged).unwrap();

        let summary = index.cascading_forget("ava", "user-1").unwrap();
        assert_eq!(summary.deleted, 2);
        assert_eq!(summary.anonymized, 1);

        assert!(index.get_by_ids(&[anchor.id]).unwrap().is_empty());
        assert!(index.get_by_ids(&[plain.id]).unwrap().is_empty());

        let survivor = &index.get_by_ids(&[merged.id]).unwrap()[0];
        assert!(survivor.assoc_ids.contains(reverie_core::ANONYMIZED_ASSOC));
        assert!(!survivor.assoc_ids.contains("user-1"));
        assert!(survivor.emotional_state.is_none());
    }

    #[tokio::test]
    async fn test_semantic_search_ranks_by_recall_not_similarity() {
        let index = test_index();
        let embedder = MockEmbedder::new(8);

        // Same content so similarity ties, but wildly different importance.
        let mut low = node("ava", "user-1", MemoryType::Episode, "coffee ritual every morning");
        low.embedding = Some(embedder.embed("coffee ritual every morning").await.unwrap());
        low.importance = 1;
        let mut high = node("ava", "user-1", MemoryType::Anchor, "coffee ritual every morning");
        high.embedding = Some(low.embedding.clone().unwrap());
        high.importance = 10;
        index.upsert_memory(&low).unwrap();
        index.upsert_memory(&high).unwrap();

        let results = index
            .search_semantic("ava", Some("user-1"), QueryInput::Text("coffee ritual"), 2, None)
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].node.id, high.id);
        assert!(results[0].recall > results[1].recall);
    }

    #[tokio::test]
    async fn test_semantic_search_degrades_when_embedding_fails() {
        let embedder = Arc::new(MockEmbedder::new(8));
        let index =
            ColdMemoryIndex::open_in_memory(embedder.clone(), MemoryConfig::default()).unwrap();
        let mut n = node("ava", "user-1", MemoryType::Episode, "stored before outage");
        n.embedding = Some(vec![0.2; 8]);
        index.upsert_memory(&n).unwrap();

        embedder.set_failing(true);
        let results = index
            .search_semantic("ava", Some("user-1"), QueryInput::Text("anything"), 5, None)
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_backfill_embeddings() {
        let index = test_index();
        let n = node("ava", "user-1", MemoryType::Episode, "needs an embedding later");
        index.upsert_memory(&n).unwrap();

        let count = index.backfill_embeddings("ava", 10).await.unwrap();
        assert_eq!(count, 1);
        let fetched = &index.get_by_ids(&[n.id]).unwrap()[0];
        assert_eq!(fetched.embedding.as_ref().map(Vec::len), Some(8));
    }

    #[test]
    fn test_full_text_search_scores_by_word_hits() {
        let index = test_index();
        index
            .upsert_memory(&node("ava", "user-1", MemoryType::Episode, "we talked about rust and memory safety"))
            .unwrap();
        index
            .upsert_memory(&node("ava", "user-1", MemoryType::Episode, "rust conversation"))
            .unwrap();
        index
            .upsert_memory(&node("ava", "user-1", MemoryType::Episode, "gardening tips"))
            .unwrap();

        let hits = index
            .search_full_text("ava", Some("user-1"), "rust memory", 10)
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].content, "we talked about rust and memory safety");
    }
}
