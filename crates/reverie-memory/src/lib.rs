//! # reverie-memory
//!
//! Two-tier continuity memory for a conversational AI entity:
//!
//! - **Hot store**: per-entity/per-user ephemeral state — episodic turn
//!   stream, expression state, active-context and bootstrap caches. TTL-bound,
//!   best-effort, never a source of truth.
//! - **Cold index**: durable memory nodes with vector embeddings (SQLite),
//!   recall-ranked semantic search, graph expansion, cascading forget.
//! - **Deduplicator**: merge engine that keeps the cold index from
//!   accumulating near-duplicates, guarded by a drift invariant.
//! - **Context builder**: assembles a bounded, ordered prompt-context block
//!   from both tiers.
//! - **Narrative synthesizer**: turns raw conversation into structured
//!   memory and periodically consolidates what is already stored.

pub mod cold;
pub mod context;
pub mod dedup;
pub mod hot;
pub mod merge;
pub mod score;
pub mod synthesis;

pub use cold::{ColdMemoryIndex, ForgetSummary, QueryInput, ScoredNode};
pub use context::{ContextBuilder, ContextInputs};
pub use dedup::{DedupOptions, Deduplicator, StoreOutcome};
pub use hot::{
    ActiveContext, BootstrapCache, FailingBackend, HotBackend, HotMemoryStore, InMemoryBackend,
};
pub use merge::{deep_merge_relational, merge_nodes, ContentPlan};
pub use synthesis::{NarrativeSynthesizer, TAG_COMPASS};
