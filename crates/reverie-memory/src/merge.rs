//! Merge policy: how a cluster of near-duplicate nodes collapses into one.
//!
//! Everything here is pure — the deduplicator decides WHEN to merge and makes
//! the LLM call when the content plan asks for one; this module decides WHAT
//! the merged node looks like.

use serde_json::Value;
use std::collections::BTreeSet;
use uuid::Uuid;

use reverie_core::{MemoryNode, MemoryType};

/// How to resolve the merged node's content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentPlan {
    /// One variant clearly subsumes the rest; use it verbatim.
    Subsuming(String),
    /// No variant dominates; hand these to the LLM for a synthesis pass.
    NeedsSynthesis(Vec<String>),
}

/// Pick the merged content strategy. A variant whose length exceeds 1.5× the
/// mean is treated as subsuming the others and wins without an LLM call.
/// Otherwise the longest `variant_cap` variants go to synthesis.
pub fn plan_content(contents: &[&str], variant_cap: usize) -> ContentPlan {
    debug_assert!(!contents.is_empty());
    let mean = contents.iter().map(|c| c.len()).sum::<usize>() as f64 / contents.len() as f64;
    let longest = contents
        .iter()
        .max_by_key(|c| c.len())
        .copied()
        .unwrap_or_default();

    if contents.len() == 1 || longest.len() as f64 > mean * 1.5 {
        return ContentPlan::Subsuming(longest.to_string());
    }

    let mut variants: Vec<String> = contents.iter().map(|c| c.to_string()).collect();
    variants.sort_by(|a, b| b.len().cmp(&a.len()));
    variants.dedup();
    variants.truncate(variant_cap.max(1));
    ContentPlan::NeedsSynthesis(variants)
}

/// The fallback when content synthesis fails: the longest variant.
pub fn longest_variant(contents: &[&str]) -> String {
    contents
        .iter()
        .max_by_key(|c| c.len())
        .copied()
        .unwrap_or_default()
        .to_string()
}

/// Collapse `candidate` and `absorbed` into one node carrying the candidate's
/// id. Field policy:
///
/// - kind: highest merge priority across all inputs
/// - importance: max (a duplicate observation never weakens a memory)
/// - confidence: mean plus a small corroboration bonus, capped at 1.0
/// - timestamp: earliest origin; last_accessed: latest; recall_count: sum
/// - assoc ids / tags / related ids: set union (minus the absorbed ids)
/// - emotional state: the most intense one wins
/// - relational context: recursive deep merge
/// - provenance: absorbed ids plus their own provenance chains
///
/// The embedding is kept only when the merged content is unchanged from the
/// candidate's; otherwise it is cleared for re-embedding.
pub fn merge_nodes(
    candidate: &MemoryNode,
    absorbed: &[MemoryNode],
    content: String,
    confidence_bonus: f64,
) -> MemoryNode {
    let mut merged = candidate.clone();
    let all = std::iter::once(candidate).chain(absorbed.iter());

    merged.kind = all
        .clone()
        .map(|n| n.kind)
        .max_by_key(|k| k.merge_priority())
        .unwrap_or(candidate.kind);

    merged.importance = all.clone().map(|n| n.importance).max().unwrap_or(5);

    let count = 1 + absorbed.len();
    let mean_confidence = all.clone().map(|n| n.confidence).sum::<f64>() / count as f64;
    merged.confidence = (mean_confidence + confidence_bonus).min(1.0);

    merged.timestamp = all.clone().map(|n| n.timestamp).min().unwrap_or(candidate.timestamp);
    merged.last_accessed = all
        .clone()
        .map(|n| n.last_accessed)
        .max()
        .unwrap_or(candidate.last_accessed);
    merged.recall_count = all.clone().map(|n| n.recall_count).sum();

    let absorbed_ids: BTreeSet<Uuid> = absorbed.iter().map(|n| n.id).collect();
    for node in absorbed {
        merged.assoc_ids.extend(node.assoc_ids.iter().cloned());
        merged.tags.extend(node.tags.iter().cloned());
        merged.related_ids.extend(node.related_ids.iter().copied());
    }
    merged.related_ids.remove(&merged.id);
    for id in &absorbed_ids {
        merged.related_ids.remove(id);
    }

    merged.emotional_state = all
        .clone()
        .filter_map(|n| n.emotional_state.clone())
        .max_by(|a, b| {
            a.intensity
                .partial_cmp(&b.intensity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

    merged.relational_context = all
        .clone()
        .filter_map(|n| n.relational_context.clone())
        .reduce(|acc, next| deep_merge_relational(&acc, &next));

    let mut provenance: Vec<Uuid> = candidate.synthesized_from.clone();
    for node in absorbed {
        provenance.push(node.id);
        provenance.extend(node.synthesized_from.iter().copied());
    }
    provenance.sort();
    provenance.dedup();
    merged.synthesized_from = provenance;
    merged.synthesis_type = Some("dedup-merge".to_string());

    if content != candidate.content {
        merged.embedding = None;
    }
    merged.content = content;

    merged
}

/// Recursive merge of two relational-context values:
/// objects merge key-wise, arrays union with dedup, numbers take the max,
/// anything else the newer value wins.
pub fn deep_merge_relational(base: &Value, other: &Value) -> Value {
    match (base, other) {
        (Value::Object(a), Value::Object(b)) => {
            let mut out = a.clone();
            for (key, value) in b {
                let merged = match out.get(key) {
                    Some(existing) => deep_merge_relational(existing, value),
                    None => value.clone(),
                };
                out.insert(key.clone(), merged);
            }
            Value::Object(out)
        }
        (Value::Array(a), Value::Array(b)) => {
            let mut out = a.clone();
            for item in b {
                if !out.contains(item) {
                    out.push(item.clone());
                }
            }
            Value::Array(out)
        }
        (Value::Number(a), Value::Number(b)) => {
            let fa = a.as_f64().unwrap_or(0.0);
            let fb = b.as_f64().unwrap_or(0.0);
            if fa >= fb { base.clone() } else { other.clone() }
        }
        _ => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use reverie_core::EmotionalState;
    use serde_json::json;

    fn node(kind: MemoryType, content: &str) -> MemoryNode {
        MemoryNode::new("ava", kind, content).with_assoc("user-1")
    }

    #[test]
    fn test_plan_content_subsuming_long_variant() {
        let plan = plan_content(
            &[
                "likes coffee",
                "likes coffee, specifically a pour-over every morning before work",
            ],
            3,
        );
        match plan {
            ContentPlan::Subsuming(text) => assert!(text.contains("pour-over")),
            other => panic!("expected subsuming plan, got {other:?}"),
        }
    }

    #[test]
    fn test_plan_content_similar_lengths_need_synthesis() {
        let plan = plan_content(
            &[
                "enjoys coffee in the morning",
                "drinks coffee every morning",
                "has a morning coffee habit",
                "morning coffee person",
            ],
            3,
        );
        match plan {
            ContentPlan::NeedsSynthesis(variants) => {
                assert_eq!(variants.len(), 3);
                // Longest first.
                assert!(variants[0].len() >= variants[1].len());
            }
            other => panic!("expected synthesis plan, got {other:?}"),
        }
    }

    #[test]
    fn test_plan_content_single_variant() {
        assert_eq!(
            plan_content(&["only one"], 3),
            ContentPlan::Subsuming("only one".to_string())
        );
    }

    #[test]
    fn test_merge_field_policy() {
        let mut candidate = node(MemoryType::Anchor, "user loves hiking in the mountains");
        candidate.importance = 4;
        candidate.confidence = 0.8;
        candidate.recall_count = 2;

        let mut old = node(MemoryType::Identity, "loves hiking");
        old.importance = 7;
        old.confidence = 0.6;
        old.recall_count = 3;
        old.timestamp = candidate.timestamp - Duration::days(10);
        old.assoc_ids.insert("user-2".to_string());

        let merged = merge_nodes(&candidate, &[old.clone()], candidate.content.clone(), 0.1);

        assert_eq!(merged.id, candidate.id);
        // Identity outranks Anchor.
        assert_eq!(merged.kind, MemoryType::Identity);
        assert_eq!(merged.importance, 7);
        // avg(0.8, 0.6) + 0.1
        assert!((merged.confidence - 0.8).abs() < 1e-9);
        assert_eq!(merged.timestamp, old.timestamp);
        assert_eq!(merged.recall_count, 5);
        assert!(merged.assoc_ids.contains("user-1"));
        assert!(merged.assoc_ids.contains("user-2"));
        assert_eq!(merged.synthesized_from, vec![old.id]);
        assert_eq!(merged.synthesis_type.as_deref(), Some("dedup-merge"));
    }

    #[test]
    fn test_merge_confidence_caps_at_one() {
        let mut candidate = node(MemoryType::Anchor, "certain fact");
        candidate.confidence = 1.0;
        let mut other = node(MemoryType::Anchor, "certain fact again");
        other.confidence = 1.0;
        let merged = merge_nodes(&candidate, &[other], "certain fact".to_string(), 0.1);
        assert_eq!(merged.confidence, 1.0);
    }

    #[test]
    fn test_merge_clears_embedding_when_content_changes() {
        let mut candidate = node(MemoryType::Anchor, "original");
        candidate.embedding = Some(vec![0.5; 4]);
        let other = node(MemoryType::Anchor, "other");

        let same = merge_nodes(&candidate, &[other.clone()], "original".to_string(), 0.1);
        assert!(same.embedding.is_some());

        let changed = merge_nodes(&candidate, &[other], "synthesized text".to_string(), 0.1);
        assert!(changed.embedding.is_none());
        assert_eq!(changed.content, "synthesized text");
    }

    #[test]
    fn test_merge_keeps_most_intense_emotion_and_chains_provenance() {
        let ancestor = Uuid::new_v4();
        let mut candidate = node(MemoryType::Artifact, "the lighthouse joke");
        candidate.emotional_state = Some(EmotionalState {
            tone: "amused".into(),
            intensity: 0.4,
        });
        let mut other = node(MemoryType::Artifact, "lighthouse joke");
        other.emotional_state = Some(EmotionalState {
            tone: "delighted".into(),
            intensity: 0.9,
        });
        other.synthesized_from = vec![ancestor];

        let merged = merge_nodes(&candidate, &[other.clone()], candidate.content.clone(), 0.1);
        assert_eq!(merged.emotional_state.unwrap().tone, "delighted");
        assert!(merged.synthesized_from.contains(&other.id));
        assert!(merged.synthesized_from.contains(&ancestor));
    }

    #[test]
    fn test_deep_merge_relational() {
        let a = json!({
            "sharedVocabulary": {"blorp": "hello"},
            "topics": ["rust", "coffee"],
            "warmth": 3
        });
        let b = json!({
            "sharedVocabulary": {"zim": "goodbye"},
            "topics": ["coffee", "music"],
            "warmth": 5,
            "mood": "bright"
        });
        let merged = deep_merge_relational(&a, &b);
        assert_eq!(merged["sharedVocabulary"]["blorp"], "hello");
        assert_eq!(merged["sharedVocabulary"]["zim"], "goodbye");
        let topics = merged["topics"].as_array().unwrap();
        assert_eq!(topics.len(), 3);
        assert_eq!(merged["warmth"], 5);
        assert_eq!(merged["mood"], "bright");
    }
}
