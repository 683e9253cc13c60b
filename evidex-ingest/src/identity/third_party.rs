//! Run-wide registry of unmapped contacts
//!
//! Identifiers that resolve to no configured person are collected here,
//! deduplicated by normalized form, so reports can disclose every third
//! party that appears in the evidence.

use super::phone::{canonical_phone, classify, normalize_key, IdentifierKind};
use crate::ledger::{metadata, AuditAction, AuditLedger};
use evidex_common::{Result, SourceKind};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThirdPartyContact {
    /// Identifier as first seen
    pub identifier: String,
    pub normalized: String,
    pub kind: IdentifierKind,
    /// Sources the contact appeared in
    pub sources: BTreeSet<SourceKind>,
}

#[derive(Debug, Default)]
pub struct ThirdPartyRegistry {
    entries: BTreeMap<String, ThirdPartyContact>,
}

impl ThirdPartyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(identifier: &str) -> (String, IdentifierKind) {
        let kind = classify(identifier);
        let key = match kind {
            IdentifierKind::Phone => {
                canonical_phone(identifier).unwrap_or_else(|| normalize_key(identifier))
            }
            _ => normalize_key(identifier),
        };
        (key, kind)
    }

    /// Register a contact; returns true if it was not known before
    ///
    /// New contacts are recorded in the ledger exactly once.
    pub fn register(
        &mut self,
        identifier: &str,
        source: SourceKind,
        ledger: &AuditLedger,
    ) -> Result<bool> {
        let trimmed = identifier.trim();
        if trimmed.is_empty() {
            return Ok(false);
        }

        let (key, kind) = Self::key(trimmed);
        if let Some(existing) = self.entries.get_mut(&key) {
            existing.sources.insert(source);
            return Ok(false);
        }

        ledger.record(
            AuditAction::ThirdPartyRegistered,
            format!("Registered third-party contact {}", trimmed),
            metadata([
                ("identifier", json!(trimmed)),
                ("normalized", json!(key)),
                ("source", json!(source.as_str())),
            ]),
        )?;
        debug!(identifier = trimmed, source = %source, "Third-party contact registered");

        self.entries.insert(
            key.clone(),
            ThirdPartyContact {
                identifier: trimmed.to_string(),
                normalized: key,
                kind,
                sources: BTreeSet::from([source]),
            },
        );
        Ok(true)
    }

    /// All contacts, ordered by normalized identifier
    pub fn get_all(&self) -> Vec<ThirdPartyContact> {
        self.entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Contact counts by identifier kind
    pub fn summary(&self) -> BTreeMap<&'static str, usize> {
        let mut summary = BTreeMap::new();
        summary.insert("total", self.entries.len());
        for contact in self.entries.values() {
            let label = match contact.kind {
                IdentifierKind::Phone => "phones",
                IdentifierKind::Email => "emails",
                IdentifierKind::Alias => "names",
            };
            *summary.entry(label).or_insert(0) += 1;
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_deduplicates_phone_formats() {
        let ledger = AuditLedger::ephemeral();
        let mut registry = ThirdPartyRegistry::new();

        assert!(registry.register("(425) 555-0100", SourceKind::MessageDb, &ledger).unwrap());
        assert!(!registry.register("+14255550100", SourceKind::LineExport, &ledger).unwrap());

        let all = registry.get_all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].identifier, "(425) 555-0100");
        assert_eq!(all[0].sources.len(), 2);

        let registered = ledger
            .records()
            .unwrap()
            .iter()
            .filter(|r| r.action == AuditAction::ThirdPartyRegistered)
            .count();
        assert_eq!(registered, 1);
    }

    #[test]
    fn test_email_case_insensitive_and_empty_ignored() {
        let ledger = AuditLedger::ephemeral();
        let mut registry = ThirdPartyRegistry::new();

        registry.register("Pat@Example.com", SourceKind::MessageDb, &ledger).unwrap();
        registry.register("pat@example.com", SourceKind::MessageDb, &ledger).unwrap();
        assert!(!registry.register("   ", SourceKind::MessageDb, &ledger).unwrap());
        registry.register("Casey", SourceKind::LineExport, &ledger).unwrap();

        let summary = registry.summary();
        assert_eq!(summary["total"], 2);
        assert_eq!(summary["emails"], 1);
        assert_eq!(summary["names"], 1);
    }
}
