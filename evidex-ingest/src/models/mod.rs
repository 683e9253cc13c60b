//! Data models for evidex-ingest
//!
//! - Canonical message stream types
//! - Per-source extraction reports
//! - Review items and decisions

pub mod message;
pub mod report;
pub mod review;

pub use message::{CanonicalMessage, MessageId, RawReference, ResolvedIdentity};
pub use report::{DecodeFailure, ExtractionReport};
pub use review::{Decision, ReviewDecision, ReviewItem, ReviewSummary};
