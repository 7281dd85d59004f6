//! # reverie-runtime
//!
//! The orchestration layer over the two memory tiers: session lifecycle,
//! per-turn context assembly, background synthesis scheduling, and the
//! explicit store/search/forget APIs a host application calls.

pub mod logging;
pub mod service;

pub use logging::init_logging;
pub use service::ContinuityMemoryService;
