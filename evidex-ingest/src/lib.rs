//! evidex-ingest library
//!
//! Turns heterogeneous message archives into one canonical, identity-resolved
//! message stream, with a hashed audit trail of every step and a resumable
//! review ledger for flagged items.
//!
//! Flow: `IdentityResolver` is built once from configuration and shared by the
//! source adapters → `IngestionCoordinator` runs the adapters, merges their
//! output under a deterministic order, verifies sources and emits the manifest
//! through the `AuditLedger` → `ReviewSession` persists human decisions to a
//! `DecisionLog`.

pub mod adapters;
pub mod coordinator;
pub mod identity;
pub mod ledger;
pub mod models;
pub mod review;

pub use coordinator::{IngestionCoordinator, IngestionOutcome};
pub use identity::{IdentifierIndex, IdentityResolver, ThirdPartyRegistry};
pub use ledger::{AuditLedger, ChainOfCustody, RunManifest};
pub use models::{CanonicalMessage, ExtractionReport, MessageId, ResolvedIdentity};
pub use review::{DecisionLog, ReviewSession};

/// Generator string written into custody documents and manifests
pub const GENERATOR: &str = concat!("evidex-ingest ", env!("CARGO_PKG_VERSION"));
