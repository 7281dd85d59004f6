use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Result, ReverieError};
use crate::types::EmotionalState;

/// Provenance tag set by the synthesizer on every node it creates.
pub const TAG_AUTO_SYNTHESIS: &str = "auto-synthesis";
/// Provenance tag set once sleep synthesis has visited a node.
pub const TAG_SLEEP_PROCESSED: &str = "sleep-processed";
/// Tag marking a node that deep synthesis considers worth promoting.
pub const TAG_PROMOTION_CANDIDATE: &str = "promotion-candidate";

/// Sentinel written into `assoc_ids` when a merge-descendant node is
/// anonymized (rather than deleted) during a cascading forget.
pub const ANONYMIZED_ASSOC: &str = "__forgotten__";

/// The kind of a long-term memory node. Governs retrieval priority and
/// display grouping in the assembled context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    /// Foundational identity directives for the entity.
    Core,
    /// Addenda layered on top of core directives.
    CoreExtension,
    /// A relational anchor — something learned about a specific user.
    Anchor,
    /// A resonance artifact — a shared moment, joke, or reference.
    Artifact,
    /// A self-observation about the entity's own identity.
    Identity,
    /// A summarized episode of past conversation.
    Episode,
    /// Expression / emotional register notes.
    Expression,
    /// A value or principle the entity holds.
    Value,
    /// Something the entity learned it can (or cannot) do.
    Capability,
}

impl MemoryType {
    /// Merge priority: when duplicates of different kinds collapse into one
    /// node, the highest-priority kind wins.
    pub fn merge_priority(self) -> u8 {
        match self {
            MemoryType::Core => 9,
            MemoryType::CoreExtension => 8,
            MemoryType::Identity => 7,
            MemoryType::Anchor => 6,
            MemoryType::Artifact => 5,
            MemoryType::Value => 4,
            MemoryType::Capability => 4,
            MemoryType::Expression => 3,
            MemoryType::Episode => 2,
        }
    }

    pub const ALL: [MemoryType; 9] = [
        MemoryType::Core,
        MemoryType::CoreExtension,
        MemoryType::Anchor,
        MemoryType::Artifact,
        MemoryType::Identity,
        MemoryType::Episode,
        MemoryType::Expression,
        MemoryType::Value,
        MemoryType::Capability,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MemoryType::Core => "core",
            MemoryType::CoreExtension => "core_extension",
            MemoryType::Anchor => "anchor",
            MemoryType::Artifact => "artifact",
            MemoryType::Identity => "identity",
            MemoryType::Episode => "episode",
            MemoryType::Expression => "expression",
            MemoryType::Value => "value",
            MemoryType::Capability => "capability",
        }
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemoryType {
    type Err = ReverieError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "core" => Ok(MemoryType::Core),
            "core_extension" => Ok(MemoryType::CoreExtension),
            "anchor" => Ok(MemoryType::Anchor),
            "artifact" => Ok(MemoryType::Artifact),
            "identity" => Ok(MemoryType::Identity),
            "episode" => Ok(MemoryType::Episode),
            "expression" => Ok(MemoryType::Expression),
            "value" => Ok(MemoryType::Value),
            "capability" => Ok(MemoryType::Capability),
            other => Err(ReverieError::validation(
                "type",
                format!("unknown memory type: {other}"),
            )),
        }
    }
}

/// A unit of long-term memory.
///
/// Nodes are mutable in place (a merge rewrites fields) but `id` is stable
/// for the node's lifetime. Graph edges (`related_ids`, `parent_id`) are soft
/// links, never ownership — dangling references are tolerated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryNode {
    pub id: Uuid,
    /// Owning entity (partition key).
    pub entity_id: String,
    /// Users/entities this memory relates to.
    pub assoc_ids: BTreeSet<String>,
    pub kind: MemoryType,
    /// The semantic payload.
    pub content: String,
    /// Must match the index's configured dimensionality. Nodes without an
    /// embedding are excluded from vector search until backfilled.
    pub embedding: Option<Vec<f32>>,
    pub related_ids: BTreeSet<Uuid>,
    pub parent_id: Option<Uuid>,
    pub tags: BTreeSet<String>,
    /// Static weight, 1–10.
    pub importance: u8,
    /// 0.0–1.0.
    pub confidence: f64,
    /// Reserved for future decay tuning; stored and round-tripped.
    pub decay_rate: f64,
    /// Origin time.
    pub timestamp: DateTime<Utc>,
    /// Most recent retrieval time.
    pub last_accessed: DateTime<Utc>,
    pub recall_count: u32,
    pub emotional_state: Option<EmotionalState>,
    /// Free-form associative metadata (e.g. a shared-vocabulary map).
    pub relational_context: Option<serde_json::Value>,
    /// Ids of the nodes this one was merged/consolidated from.
    pub synthesized_from: Vec<Uuid>,
    pub synthesis_type: Option<String>,
}

impl MemoryNode {
    pub fn new(entity_id: &str, kind: MemoryType, content: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            entity_id: entity_id.to_string(),
            assoc_ids: BTreeSet::new(),
            kind,
            content: content.to_string(),
            embedding: None,
            related_ids: BTreeSet::new(),
            parent_id: None,
            tags: BTreeSet::new(),
            importance: 5,
            confidence: 1.0,
            decay_rate: 0.0,
            timestamp: now,
            last_accessed: now,
            recall_count: 0,
            emotional_state: None,
            relational_context: None,
            synthesized_from: Vec::new(),
            synthesis_type: None,
        }
    }

    pub fn with_assoc(mut self, user_id: &str) -> Self {
        self.assoc_ids.insert(user_id.to_string());
        self
    }

    pub fn with_importance(mut self, importance: u8) -> Self {
        self.importance = importance;
        self
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tags.insert(tag.to_string());
        self
    }

    /// Whether this node is a merge/consolidation descendant.
    pub fn is_merge_descendant(&self) -> bool {
        !self.synthesized_from.is_empty()
    }

    /// Validate required fields and value ranges. Explicit store calls must
    /// reject invalid nodes synchronously rather than silently dropping them.
    pub fn validate(&self) -> Result<()> {
        if self.entity_id.trim().is_empty() {
            return Err(ReverieError::validation("entity_id", "must not be empty"));
        }
        if self.content.trim().is_empty() {
            return Err(ReverieError::validation("content", "must not be empty"));
        }
        if !(1..=10).contains(&self.importance) {
            return Err(ReverieError::validation(
                "importance",
                format!("must be 1-10, got {}", self.importance),
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(ReverieError::validation(
                "confidence",
                format!("must be 0.0-1.0, got {}", self.confidence),
            ));
        }
        if !(0.0..=1.0).contains(&self.decay_rate) {
            return Err(ReverieError::validation(
                "decay_rate",
                format!("must be 0.0-1.0, got {}", self.decay_rate),
            ));
        }
        Ok(())
    }

    /// Strip user-identifying data in place. Used by cascading forget for
    /// merge descendants that other users' memories may cross-reference.
    pub fn anonymize(&mut self) {
        self.assoc_ids.clear();
        self.assoc_ids.insert(ANONYMIZED_ASSOC.to_string());
        self.emotional_state = None;
        self.relational_context = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_priority_ordering() {
        assert!(MemoryType::Core.merge_priority() > MemoryType::Identity.merge_priority());
        assert!(MemoryType::Identity.merge_priority() > MemoryType::Anchor.merge_priority());
        assert!(MemoryType::Anchor.merge_priority() > MemoryType::Artifact.merge_priority());
        assert!(MemoryType::Artifact.merge_priority() > MemoryType::Value.merge_priority());
        assert!(MemoryType::Value.merge_priority() > MemoryType::Expression.merge_priority());
        assert!(MemoryType::Expression.merge_priority() > MemoryType::Episode.merge_priority());
    }

    #[test]
    fn test_type_roundtrip() {
        for kind in MemoryType::ALL {
            let parsed: MemoryType = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
        assert!("nonsense".parse::<MemoryType>().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_fields() {
        let mut node = MemoryNode::new("entity", MemoryType::Anchor, "remembers things");
        node.validate().unwrap();

        node.importance = 0;
        assert!(node.validate().is_err());
        node.importance = 11;
        assert!(node.validate().is_err());
        node.importance = 5;

        node.confidence = 1.5;
        assert!(node.validate().is_err());
        node.confidence = 0.9;

        node.content = "  ".into();
        assert!(node.validate().is_err());
    }

    #[test]
    fn test_anonymize_strips_metadata() {
        let mut node = MemoryNode::new("entity", MemoryType::Artifact, "a shared joke")
            .with_assoc("user-1");
        node.relational_context = Some(serde_json::json!({"sharedVocabulary": {"blorp": "hello"}}));
        node.anonymize();
        assert!(node.assoc_ids.contains(ANONYMIZED_ASSOC));
        assert!(!node.assoc_ids.contains("user-1"));
        assert!(node.relational_context.is_none());
    }

    #[test]
    fn test_node_serde() {
        let node = MemoryNode::new("entity", MemoryType::Anchor, "likes terse answers")
            .with_assoc("user-1")
            .with_importance(6);
        let json = serde_json::to_string(&node).unwrap();
        let restored: MemoryNode = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.id, node.id);
        assert_eq!(restored.kind, MemoryType::Anchor);
        assert_eq!(restored.importance, 6);
    }
}
