use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Who produced a turn in the episodic stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
}

/// One turn of conversation. Lives only in the hot store, capped to a
/// rolling window and bounded by a TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodicTurn {
    pub role: TurnRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emotional_tone: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<String>,
}

impl EpisodicTurn {
    pub fn new(role: TurnRole, content: &str) -> Self {
        Self {
            role,
            content: content.to_string(),
            timestamp: Utc::now(),
            emotional_tone: None,
            topics: Vec::new(),
        }
    }
}

/// A named emotional register with an intensity, attached to memory nodes
/// and to the per-user expression state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionalState {
    pub tone: String,
    /// 0.0–1.0. The merge policy keeps the highest-intensity source.
    pub intensity: f64,
}

/// Per entity/user expression state. No TTL; persists until explicitly reset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExpressionState {
    /// Current emotional resonance per register, e.g. "warmth" -> 0.7.
    #[serde(default)]
    pub resonance: HashMap<String, f64>,
    /// Personality dial adjustments, e.g. "playfulness" -> +0.2.
    #[serde(default)]
    pub personality_adjustments: HashMap<String, f64>,
    pub last_interaction: Option<DateTime<Utc>>,
    pub session_start: Option<DateTime<Utc>>,
}

impl ExpressionState {
    /// Apply a set of adjustment deltas, clamping each dial to [-1.0, 1.0].
    pub fn apply_adjustments(&mut self, adjustments: &HashMap<String, f64>) {
        for (dial, delta) in adjustments {
            let v = self.personality_adjustments.entry(dial.clone()).or_insert(0.0);
            *v = (*v + delta).clamp(-1.0, 1.0);
        }
    }
}

/// A candidate memory produced by turn synthesis, before dedup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryCandidate {
    pub content: String,
    #[serde(default = "default_importance")]
    pub importance: u8,
    #[serde(default)]
    pub emotional_tone: Option<String>,
}

fn default_importance() -> u8 {
    5
}

/// A shared-vocabulary entry: a term coined in conversation and its meaning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shorthand {
    pub term: String,
    pub meaning: String,
}

/// Structured output of one turn-synthesis pass. All fields default to empty;
/// a malformed synthesis response degrades to `SynthesisResult::default()`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisResult {
    pub new_anchors: Vec<MemoryCandidate>,
    pub new_artifacts: Vec<MemoryCandidate>,
    pub identity_updates: Vec<MemoryCandidate>,
    pub shorthands: Vec<Shorthand>,
    pub expression_adjustments: HashMap<String, f64>,
}

impl SynthesisResult {
    pub fn is_empty(&self) -> bool {
        self.new_anchors.is_empty()
            && self.new_artifacts.is_empty()
            && self.identity_updates.is_empty()
            && self.shorthands.is_empty()
            && self.expression_adjustments.is_empty()
    }
}

/// Outcome of a best-effort cache write. The caller is never failed; a
/// degraded write just means the next read will miss and rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheWrite {
    Stored,
    Degraded,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthesis_result_lenient_parse() {
        // Missing fields default to empty.
        let parsed: SynthesisResult = serde_json::from_str(r#"{"new_anchors": []}"#).unwrap();
        assert!(parsed.is_empty());

        let parsed: SynthesisResult = serde_json::from_str(
            r#"{"new_anchors": [{"content": "prefers terse answers"}], "shorthands": [{"term": "blorp", "meaning": "hello"}]}"#,
        )
        .unwrap();
        assert!(!parsed.is_empty());
        assert_eq!(parsed.new_anchors[0].importance, 5);
        assert_eq!(parsed.shorthands[0].term, "blorp");
    }

    #[test]
    fn test_expression_adjustments_clamp() {
        let mut state = ExpressionState::default();
        let mut adj = HashMap::new();
        adj.insert("playfulness".to_string(), 0.8);
        state.apply_adjustments(&adj);
        state.apply_adjustments(&adj);
        assert_eq!(state.personality_adjustments["playfulness"], 1.0);
    }
}
