//! Context assembly: turns retrieved memory into the ordered text block that
//! precedes a conversation turn. Pure string building — every section has an
//! independent display cap so one noisy category can never crowd out the
//! others.

use chrono::Utc;
use std::collections::HashMap;

use crate::score::{cosine_similarity, narrative_gravity, query_coverage};
use reverie_config::MemoryConfig;
use reverie_core::{EpisodicTurn, ExpressionState, MemoryNode, Shorthand, TurnRole};

/// Everything the builder may render. Callers fill in what they retrieved;
/// empty sections are omitted from the output.
#[derive(Default)]
pub struct ContextInputs {
    /// Core and core-extension directives, highest priority first.
    pub core: Vec<MemoryNode>,
    pub expression: Option<ExpressionState>,
    /// The persistent narrative-summary node, if one exists.
    pub compass: Option<MemoryNode>,
    pub anchors: Vec<MemoryNode>,
    pub artifacts: Vec<MemoryNode>,
    pub identity: Vec<MemoryNode>,
    pub shorthands: Vec<Shorthand>,
    /// Cached narrative thread from the active context.
    pub narrative: Option<String>,
    /// Recalled memories relevant to the current query.
    pub recalled: Vec<MemoryNode>,
    /// Tail of the episodic stream.
    pub stream: Vec<EpisodicTurn>,
}

/// Assembles the context block and answers the topic-drift question for the
/// active-context cache.
#[derive(Clone)]
pub struct ContextBuilder {
    config: MemoryConfig,
}

impl ContextBuilder {
    pub fn new(config: MemoryConfig) -> Self {
        Self { config }
    }

    /// Render the full context block. Section order is fixed:
    /// core directives, expression state, compass, anchors, shared
    /// vocabulary, artifacts, identity notes, recalled memories, narrative
    /// thread, session context.
    pub fn build(&self, inputs: &ContextInputs) -> String {
        let mut out = String::new();

        if !inputs.core.is_empty() {
            push_section(&mut out, "Core Directives");
            let mut core = inputs.core.clone();
            core.sort_by(|a, b| {
                b.kind
                    .merge_priority()
                    .cmp(&a.kind.merge_priority())
                    .then(b.importance.cmp(&a.importance))
            });
            for node in &core {
                out.push_str("- ");
                out.push_str(&node.content);
                out.push('\n');
            }
        }

        if let Some(expression) = &inputs.expression {
            let line = render_expression(expression);
            if !line.is_empty() {
                push_section(&mut out, "Expression State");
                out.push_str(&line);
                out.push('\n');
            }
        }

        if let Some(compass) = &inputs.compass {
            push_section(&mut out, "Compass");
            out.push_str(&compass.content);
            out.push('\n');
        }

        if !inputs.anchors.is_empty() {
            push_section(&mut out, "Relational Anchors");
            for node in self.rank_anchors(&inputs.anchors) {
                out.push_str("- ");
                out.push_str(&node.content);
                out.push('\n');
            }
        }

        let vocabulary = dedup_vocabulary(&inputs.shorthands, self.config.context_max_vocabulary);
        if !vocabulary.is_empty() {
            push_section(&mut out, "Shared Vocabulary");
            for entry in &vocabulary {
                out.push_str(&format!("- \"{}\": {}\n", entry.term, entry.meaning));
            }
        }

        if !inputs.artifacts.is_empty() {
            push_section(&mut out, "Resonance Artifacts");
            for node in inputs.artifacts.iter().take(self.config.context_max_artifacts) {
                out.push_str("- ");
                out.push_str(&node.content);
                out.push('\n');
            }
        }

        if !inputs.identity.is_empty() {
            push_section(&mut out, "Identity Notes");
            for node in inputs.identity.iter().take(self.config.context_max_identity) {
                out.push_str("- ");
                out.push_str(&node.content);
                out.push('\n');
            }
        }

        if !inputs.recalled.is_empty() {
            push_section(&mut out, "Recalled Memories");
            for node in &inputs.recalled {
                out.push_str(&format!("- [{}] {}\n", node.kind, node.content));
            }
        }

        if let Some(narrative) = &inputs.narrative {
            if !narrative.trim().is_empty() {
                push_section(&mut out, "Narrative Thread");
                out.push_str(narrative.trim());
                out.push('\n');
            }
        }

        if !inputs.stream.is_empty() {
            push_section(&mut out, "Session Context");
            let tail = inputs
                .stream
                .iter()
                .rev()
                .take(self.config.context_stream_tail)
                .collect::<Vec<_>>();
            for turn in tail.into_iter().rev() {
                let speaker = match turn.role {
                    TurnRole::User => "User",
                    TurnRole::Assistant => "Assistant",
                };
                out.push_str(&format!("{speaker}: {}\n", turn.content));
            }
        }

        out.trim_end().to_string()
    }

    /// Rank anchors by narrative gravity and apply the display cap. Gravity
    /// decays an anchor's importance with age but never below the floor, so
    /// old foundational anchors stay visible.
    fn rank_anchors(&self, anchors: &[MemoryNode]) -> Vec<MemoryNode> {
        let now = Utc::now();
        let mut weighted: Vec<(f64, &MemoryNode)> = anchors
            .iter()
            .map(|node| {
                let days = (now - node.timestamp).num_seconds() as f64 / 86_400.0;
                let gravity = narrative_gravity(
                    node.importance,
                    days,
                    self.config.anchor_half_life_days,
                    self.config.gravity_min_floor,
                );
                (gravity, node)
            })
            .collect();
        weighted.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        weighted
            .into_iter()
            .take(self.config.context_max_anchors)
            .map(|(_, n)| n.clone())
            .collect()
    }

    /// Cheap word-overlap drift check against the cached context's topics.
    /// No I/O; used on every turn. Low coverage means the conversation has
    /// moved somewhere the cached context doesn't speak to.
    pub fn has_topic_drifted(&self, query: &str, cached_topics: &[String]) -> bool {
        if cached_topics.is_empty() {
            return true;
        }
        query_coverage(query, cached_topics) < self.config.topic_drift_threshold
    }

    /// Embedding-based drift check for callers that already paid for the
    /// query embedding and can afford the precision.
    pub fn has_topic_drifted_embedding(&self, query: &[f32], cached_topic: &[f32]) -> bool {
        f64::from(cosine_similarity(query, cached_topic)) < self.config.topic_drift_threshold
    }
}

fn push_section(out: &mut String, title: &str) {
    if !out.is_empty() {
        out.push('\n');
    }
    out.push_str("## ");
    out.push_str(title);
    out.push('\n');
}

fn render_expression(state: &ExpressionState) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut resonance: Vec<(&String, &f64)> = state.resonance.iter().collect();
    resonance.sort_by(|a, b| a.0.cmp(b.0));
    for (register, value) in resonance {
        parts.push(format!("{register}: {value:.2}"));
    }
    let mut dials: Vec<(&String, &f64)> = state.personality_adjustments.iter().collect();
    dials.sort_by(|a, b| a.0.cmp(b.0));
    for (dial, value) in dials {
        parts.push(format!("{dial}: {value:+.2}"));
    }
    parts.join(", ")
}

/// Dedup vocabulary entries by normalized term; when the same term appears
/// more than once the longest meaning wins.
fn dedup_vocabulary(shorthands: &[Shorthand], cap: usize) -> Vec<Shorthand> {
    let mut best: HashMap<String, &Shorthand> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    for entry in shorthands {
        let key = entry.term.trim().to_lowercase();
        if key.is_empty() {
            continue;
        }
        match best.get(&key) {
            Some(existing) if existing.meaning.len() >= entry.meaning.len() => {}
            Some(_) => {
                best.insert(key, entry);
            }
            None => {
                best.insert(key.clone(), entry);
                order.push(key);
            }
        }
    }
    order
        .into_iter()
        .filter_map(|key| best.get(&key).copied().cloned())
        .take(cap)
        .collect()
}
