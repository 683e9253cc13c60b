//! Canonical message record

use chrono::{DateTime, Utc};
use evidex_common::SourceKind;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Stable message identifier
///
/// Derived from `(source, locator)` only, so re-extracting unchanged input
/// yields the same id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn derive(source: SourceKind, locator: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(source.as_str().as_bytes());
        hasher.update([0x1f]);
        hasher.update(locator.as_bytes());
        let digest = hasher.finalize();
        Self(digest[..16].iter().map(|b| format!("{:02x}", b)).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sender or recipient after identity resolution
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ResolvedIdentity {
    /// A configured person
    Person(String),
    /// Original token, kept verbatim
    Unmapped(String),
}

impl ResolvedIdentity {
    pub fn is_person(&self, name: &str) -> bool {
        matches!(self, ResolvedIdentity::Person(p) if p == name)
    }

    /// Display label for reports
    pub fn label(&self) -> String {
        match self {
            ResolvedIdentity::Person(name) => name.clone(),
            ResolvedIdentity::Unmapped(raw) if raw.is_empty() => "Unknown".to_string(),
            ResolvedIdentity::Unmapped(raw) => format!("Third Party: {}", raw),
        }
    }
}

/// Pointer back to the original record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawReference {
    /// `<path relative to source root>#<row>`
    pub locator: String,
    /// Body could not be decoded; content is empty
    #[serde(default)]
    pub decode_failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decode_error: Option<String>,
    /// Source-specific service label (e.g. "iMessage", "SMS")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    /// Mail subject line
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
}

impl RawReference {
    pub fn new(locator: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            decode_failed: false,
            decode_error: None,
            service: None,
            subject: None,
        }
    }
}

/// One communication event, independent of source format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalMessage {
    pub id: MessageId,
    pub timestamp: DateTime<Utc>,
    pub sender: ResolvedIdentity,
    pub recipient: ResolvedIdentity,
    pub content: String,
    /// SHA-256 of the UTF-8 content
    pub content_sha256: String,
    pub source: SourceKind,
    pub raw: RawReference,
}

impl CanonicalMessage {
    pub fn new(
        source: SourceKind,
        timestamp: DateTime<Utc>,
        sender: ResolvedIdentity,
        recipient: ResolvedIdentity,
        content: String,
        raw: RawReference,
    ) -> Self {
        Self {
            id: MessageId::derive(source, &raw.locator),
            timestamp,
            sender,
            recipient,
            content_sha256: crate::ledger::hashing::hash_content(&content),
            content,
            source,
            raw,
        }
    }

    /// Append a continuation line (multi-line bodies)
    pub fn append_line(&mut self, line: &str) {
        self.content.push('\n');
        self.content.push_str(line);
        self.content_sha256 = crate::ledger::hashing::hash_content(&self.content);
    }
}
