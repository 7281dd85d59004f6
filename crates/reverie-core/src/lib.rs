//! # reverie-core
//!
//! Core types, traits, and primitives for the Reverie continuity memory engine.
//! This crate defines the shared vocabulary used by every other crate in the
//! workspace: the long-term memory node model, the ephemeral session types, and
//! the unified error type.

pub mod error;
pub mod node;
pub mod types;

pub use error::{ReverieError, Result};
pub use node::{MemoryNode, MemoryType, ANONYMIZED_ASSOC, TAG_AUTO_SYNTHESIS, TAG_PROMOTION_CANDIDATE, TAG_SLEEP_PROCESSED};
pub use types::{
    CacheWrite, EmotionalState, EpisodicTurn, ExpressionState, MemoryCandidate, Shorthand,
    SynthesisResult, TurnRole,
};
