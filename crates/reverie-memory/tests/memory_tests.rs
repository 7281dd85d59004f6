//! End-to-end tests over the dedup engine and cold index together, with
//! deterministic mock providers.

use std::sync::Arc;

use reverie_config::MemoryConfig;
use reverie_core::{MemoryNode, MemoryType, ANONYMIZED_ASSOC};
use reverie_llm::{EmbeddingProvider, MockEmbedder, MockSynthesizer, SynthesisProvider};
use reverie_memory::{ColdMemoryIndex, DedupOptions, Deduplicator, QueryInput};

const DIMS: usize = 32;

struct Harness {
    dedup: Deduplicator,
    index: Arc<ColdMemoryIndex>,
    embedder: MockEmbedder,
}

fn harness(synth: MockSynthesizer) -> Harness {
    let embedder = MockEmbedder::new(DIMS);
    let config = MemoryConfig::default();
    let index = Arc::new(
        ColdMemoryIndex::open_in_memory(Arc::new(embedder.clone()), config.clone()).unwrap(),
    );
    let provider: Arc<dyn SynthesisProvider> = Arc::new(synth);
    let dedup = Deduplicator::new(index.clone(), Arc::new(embedder.clone()), provider, config);
    Harness {
        dedup,
        index,
        embedder,
    }
}

fn anchor(content: &str, importance: u8) -> MemoryNode {
    MemoryNode::new("ava", MemoryType::Anchor, content)
        .with_assoc("user-1")
        .with_importance(importance)
}

fn axis(i: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; DIMS];
    v[i] = 1.0;
    v
}

#[tokio::test]
async fn test_dedup_is_idempotent() {
    let h = harness(MockSynthesizer::new());

    let first = anchor("user keeps a garden of native plants", 5);
    let second = anchor("user keeps a garden of native plants", 5);

    let a = h.dedup.store_with_dedup(first.clone(), DedupOptions::default()).await.unwrap();
    let b = h.dedup.store_with_dedup(second, DedupOptions::default()).await.unwrap();

    // The second write collapsed onto the first; exactly one node exists.
    assert!(!a.merged);
    assert!(b.merged);
    assert_eq!(b.id, first.id);
    let all = h
        .index
        .get_by_type("ava", Some("user-1"), MemoryType::Anchor, 10)
        .unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn test_near_duplicate_merge_end_to_end() {
    // The canonical scenario: an existing short memory, then a richer
    // near-duplicate. The merge keeps the newcomer's id, the higher
    // importance, and records provenance; the old id disappears.
    let h = harness(MockSynthesizer::new());
    let shared = axis(0);

    let mut old = anchor("likes coffee", 6);
    old.embedding = Some(shared.clone());
    h.index.upsert_memory(&old).unwrap();

    let mut newcomer = anchor("likes coffee, specifically a pour-over every single morning", 4);
    newcomer.embedding = Some(shared.clone());
    // Merged content subsumes (the newcomer is much longer), so pin its
    // embedding to keep the drift check anchored.
    let _ = h
        .embedder
        .clone()
        .with_vector(&newcomer.content, shared.clone());

    let outcome = h
        .dedup
        .store_with_dedup(newcomer.clone(), DedupOptions::default())
        .await
        .unwrap();

    assert!(outcome.merged);
    assert_eq!(outcome.id, newcomer.id);
    assert_eq!(outcome.merged_count, 1);
    assert_eq!(outcome.merged_ids, vec![old.id]);

    // Old id gone from the index.
    assert!(h.index.get_by_ids(&[old.id]).unwrap().is_empty());

    let merged = &h.index.get_by_ids(&[newcomer.id]).unwrap()[0];
    assert_eq!(merged.importance, 6);
    assert_eq!(merged.synthesized_from, vec![old.id]);
    assert!(merged.content.contains("pour-over"));
    assert_eq!(merged.synthesis_type.as_deref(), Some("dedup-merge"));
}

#[tokio::test]
async fn test_drift_invariant_forces_link_not_merge() {
    // Two same-length variants force an LLM consolidation whose output is
    // semantically unrelated. The drift check must refuse the merge and link
    // the nodes instead; neither source is rewritten.
    let synth = MockSynthesizer::new()
        .with_response("an entirely different thought about deep sea submarines");
    let h = harness(synth);
    let shared = axis(1);

    let mut existing = anchor("enjoys coffee every morning", 5);
    existing.embedding = Some(shared.clone());
    h.index.upsert_memory(&existing).unwrap();

    let mut candidate = anchor("drinks coffee each morning", 5);
    candidate.embedding = Some(shared);

    let outcome = h
        .dedup
        .store_with_dedup(candidate.clone(), DedupOptions::default())
        .await
        .unwrap();
    assert!(!outcome.merged);

    let both = h.index.get_by_ids(&[existing.id, candidate.id]).unwrap();
    assert_eq!(both.len(), 2);
    for node in &both {
        assert_eq!(node.related_ids.len(), 1, "nodes must be linked");
        // Content untouched.
        assert!(node.content.contains("coffee"));
    }
}

#[tokio::test]
async fn test_recall_ranking_prefers_important_recent_memories() {
    let h = harness(MockSynthesizer::new());

    // Three memories equally similar to the query, differing in importance
    // and staleness.
    let shared = axis(2);
    let mut fresh_important = anchor("shared a joke about compilers", 9);
    fresh_important.embedding = Some(shared.clone());
    let mut fresh_trivial = anchor("joked about compilers once", 1);
    fresh_trivial.embedding = Some(shared.clone());
    let mut stale_important = anchor("an old compiler joke", 9);
    stale_important.embedding = Some(shared.clone());
    stale_important.last_accessed = chrono::Utc::now() - chrono::Duration::days(90);

    for n in [&fresh_important, &fresh_trivial, &stale_important] {
        h.index.upsert_memory(n).unwrap();
    }

    let results = h
        .index
        .search_semantic("ava", Some("user-1"), QueryInput::Embedding(&axis(2)), 3, None)
        .await
        .unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].node.id, fresh_important.id);
    // Similarity ties across the board, so ranking is recall-driven: the
    // stale important memory still beats the fresh trivial one.
    assert_eq!(results[1].node.id, stale_important.id);
    assert_eq!(results[2].node.id, fresh_trivial.id);
    assert!(results[0].recall > results[1].recall);
    assert!(results[1].recall > results[2].recall);
}

#[tokio::test]
async fn test_cascading_forget_asymmetry_end_to_end() {
    // An anchor is deleted outright on forget; a synthesized artifact (merge
    // descendant) survives anonymized.
    let h = harness(MockSynthesizer::new());
    let shared = axis(3);

    let mut plain_anchor = anchor("a private shared moment", 7);
    plain_anchor.embedding = Some(shared.clone());
    h.index.upsert_memory(&plain_anchor).unwrap();

    let mut a = MemoryNode::new("ava", MemoryType::Artifact, "the lighthouse joke")
        .with_assoc("user-1");
    a.embedding = Some(axis(4));
    h.index.upsert_memory(&a).unwrap();

    let mut b = MemoryNode::new(
        "ava",
        MemoryType::Artifact,
        "the lighthouse joke, told again with a longer and sillier setup",
    )
    .with_assoc("user-1");
    b.embedding = Some(axis(4));
    let _ = h.embedder.clone().with_vector(&b.content, axis(4));

    let merged = h.dedup.store_with_dedup(b.clone(), DedupOptions::default()).await.unwrap();
    assert!(merged.merged);

    let summary = h.index.cascading_forget("ava", "user-1").unwrap();
    assert_eq!(summary.deleted, 1);
    assert_eq!(summary.anonymized, 1);

    assert!(h.index.get_by_ids(&[plain_anchor.id]).unwrap().is_empty());
    let survivor = &h.index.get_by_ids(&[merged.id]).unwrap()[0];
    assert!(survivor.assoc_ids.contains(ANONYMIZED_ASSOC));
    assert!(!survivor.assoc_ids.contains("user-1"));
    assert!(survivor.relational_context.is_none());
}

#[tokio::test]
async fn test_graph_links_survive_merges() {
    // A node linked to an unrelated neighbor keeps that edge when it absorbs
    // a duplicate.
    let h = harness(MockSynthesizer::new());

    let mut neighbor = anchor("user's sister is named June", 5);
    neighbor.embedding = Some(axis(5));
    h.index.upsert_memory(&neighbor).unwrap();

    let mut old = anchor("user plays jazz piano", 5);
    old.embedding = Some(axis(6));
    h.index.upsert_memory(&old).unwrap();
    h.index.link_memories(old.id, neighbor.id).unwrap();
    let old = h.index.get_by_ids(&[old.id]).unwrap().pop().unwrap();

    let mut replacement = anchor(
        "user plays jazz piano most evenings and has for over a decade",
        5,
    );
    replacement.embedding = Some(axis(6));
    let _ = h.embedder.clone().with_vector(&replacement.content, axis(6));

    let outcome = h
        .dedup
        .store_with_dedup(replacement.clone(), DedupOptions::default())
        .await
        .unwrap();
    assert!(outcome.merged);

    let merged = &h.index.get_by_ids(&[outcome.id]).unwrap()[0];
    assert!(merged.related_ids.contains(&neighbor.id));

    // Graph expansion from the merged node reaches the neighbor.
    let expanded = h.index.expand_graph(std::slice::from_ref(merged), 1).unwrap();
    assert!(expanded.iter().any(|n| n.id == neighbor.id));
}

#[tokio::test]
async fn test_cold_index_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("memory.db");
    let embedder: Arc<MockEmbedder> = Arc::new(MockEmbedder::new(DIMS));
    let config = MemoryConfig::default();

    let node = anchor("met at the planetarium opening", 6);
    {
        let index = ColdMemoryIndex::open(&path, embedder.clone(), config.clone()).unwrap();
        index.upsert_memory(&node).unwrap();
    }

    let reopened = ColdMemoryIndex::open(&path, embedder, config).unwrap();
    let all = reopened
        .get_by_type("ava", Some("user-1"), MemoryType::Anchor, 10)
        .unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].id, node.id);
    assert_eq!(all[0].importance, 6);
}

#[tokio::test]
async fn test_embedding_backfill_readmits_to_search() {
    let h = harness(MockSynthesizer::new());

    // Stored during an outage: no embedding, invisible to vector search.
    let node = anchor("met at the planetarium opening", 6);
    h.index.upsert_memory(&node).unwrap();

    let results = h
        .index
        .search_semantic(
            "ava",
            Some("user-1"),
            QueryInput::Text("planetarium opening"),
            5,
            None,
        )
        .await
        .unwrap();
    assert!(results.is_empty());

    assert_eq!(h.index.backfill_embeddings("ava", 10).await.unwrap(), 1);

    let results = h
        .index
        .search_semantic(
            "ava",
            Some("user-1"),
            QueryInput::Text("met at the planetarium opening"),
            5,
            None,
        )
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].node.id, node.id);
}
