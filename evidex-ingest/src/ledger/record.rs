//! Audit record types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Kind of audited action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    LedgerOpened,
    SourceRegistered,
    SourceUnavailable,
    FileHashed,
    ArchiveExtracted,
    ArchiveExtractionSkipped,
    ArchiveWorkdirReplaced,
    ExtractionStarted,
    ExtractionCompleted,
    IngestionStarted,
    IngestionCompleted,
    IngestionCancelled,
    IngestionAborted,
    ExtractionValidated,
    ThirdPartyRegistered,
    IntegrityVerified,
    IntegrityViolation,
    OutputWritten,
    ManifestEntryOmitted,
    ManifestGenerated,
    ReviewSessionStarted,
    ReviewDecisionRecorded,
    ReviewSessionEnded,
    CustodyFinalized,
}

/// Free-form structured metadata; BTreeMap keeps serialization ordered
pub type Metadata = BTreeMap<String, Value>;

/// One immutable chain-of-custody entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    pub details: String,
    pub metadata: Metadata,
    pub session_id: Uuid,
}

/// Build metadata from key/value pairs
///
/// ```
/// use evidex_ingest::ledger::metadata;
/// let meta = metadata([("path", "chat.db".into()), ("rows", 12.into())]);
/// assert_eq!(meta.len(), 2);
/// ```
pub fn metadata<const N: usize>(pairs: [(&str, Value); N]) -> Metadata {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}
