//! Chain-of-custody document

use super::hashing::hash_bytes;
use super::manifest::RunManifest;
use super::record::AuditRecord;
use chrono::{DateTime, Utc};
use evidex_common::Result;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::PathBuf;
use uuid::Uuid;

pub const CUSTODY_SCHEMA_VERSION: u32 = 1;

pub const LEGAL_NOTICE: &str = "This document records every action taken on the listed evidence \
during a single processing session. Source files were opened read-only and their SHA-256 \
digests were recorded before and verified after extraction. Any alteration of this document \
invalidates its integrity hash.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub generator: String,
    /// Durable JSONL audit log, if the ledger was opened against one
    pub audit_log: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainOfCustody {
    pub schema_version: u32,
    pub session: SessionMetadata,
    pub legal_notice: String,
    pub records: Vec<AuditRecord>,
    pub manifest: Option<RunManifest>,
    /// SHA-256 over this document serialized with an empty `integrity_hash`
    pub integrity_hash: String,
}

impl ChainOfCustody {
    pub(crate) fn seal(
        session: SessionMetadata,
        records: Vec<AuditRecord>,
        manifest: Option<RunManifest>,
    ) -> Result<Self> {
        let mut doc = Self {
            schema_version: CUSTODY_SCHEMA_VERSION,
            session,
            legal_notice: LEGAL_NOTICE.to_string(),
            records,
            manifest,
            integrity_hash: String::new(),
        };
        doc.integrity_hash = doc.compute_integrity_hash()?;
        Ok(doc)
    }

    pub fn compute_integrity_hash(&self) -> Result<String> {
        let mut unsealed = self.clone();
        unsealed.integrity_hash.clear();
        let bytes = serde_json::to_vec(&unsealed)?;
        Ok(hash_bytes(&bytes))
    }

    /// True if the document has not been altered since sealing
    pub fn verify_integrity(&self) -> bool {
        match self.compute_integrity_hash() {
            Ok(hash) => hash == self.integrity_hash,
            Err(_) => false,
        }
    }

    /// Plain-text rendering for human readers
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let rule = "=".repeat(72);

        // fmt::Write into a String cannot fail
        let _ = writeln!(out, "{}", rule);
        let _ = writeln!(out, "CHAIN OF CUSTODY");
        let _ = writeln!(out, "{}", rule);
        let _ = writeln!(out, "Session:    {}", self.session.session_id);
        let _ = writeln!(out, "Started:    {}", self.session.started_at.to_rfc3339());
        let _ = writeln!(out, "Generator:  {}", self.session.generator);
        let _ = writeln!(out, "Integrity:  {}", self.integrity_hash);
        let _ = writeln!(out);
        let _ = writeln!(out, "{}", self.legal_notice);
        let _ = writeln!(out);
        let _ = writeln!(out, "ACTIONS ({})", self.records.len());
        let _ = writeln!(out, "{}", "-".repeat(72));
        for record in &self.records {
            let action = serde_json::to_value(record.action)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            let _ = writeln!(
                out,
                "#{:<5} {}  {:<28} {}",
                record.sequence,
                record.timestamp.to_rfc3339(),
                action,
                record.details
            );
        }

        if let Some(manifest) = &self.manifest {
            let _ = writeln!(out);
            let _ = writeln!(out, "FILES");
            let _ = writeln!(out, "{}", "-".repeat(72));
            for entry in manifest.inputs.iter().chain(manifest.outputs.iter()) {
                let role = match entry.role {
                    super::manifest::FileRole::Input => "input ",
                    super::manifest::FileRole::Output => "output",
                };
                let _ = writeln!(
                    out,
                    "{} {} {:>12} {}",
                    role,
                    entry.sha256,
                    entry.size,
                    entry.path.display()
                );
            }
            for path in &manifest.omitted {
                let _ = writeln!(out, "omitted {}", path.display());
            }
        }

        out
    }
}
