//! Resumable human review
//!
//! - `decision_log`: durable, append-only JSONL log of decisions
//! - `session`: per-item state machine driven by reviewer input
//! - `queue`: flagged messages → review items with surrounding context
//!
//! The decision log is the only source of truth for what remains to be
//! reviewed; sessions derive their pending set from it on start.

pub mod decision_log;
pub mod queue;
pub mod session;

pub use decision_log::DecisionLog;
pub use queue::build_review_queue;
pub use session::{ItemState, ReviewInput, ReviewSession};
