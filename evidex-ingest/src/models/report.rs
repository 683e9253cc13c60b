//! Per-source extraction report
//!
//! Consumed by reporting for error-rate disclosure. Every row an adapter saw
//! ends up counted here exactly once: as a message, a decode failure, or a skip.

use evidex_common::SourceKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// A per-message decode problem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodeFailure {
    pub locator: String,
    pub error: String,
    /// True when a message was still emitted with empty content
    pub message_emitted: bool,
}

/// Extraction statistics for one source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionReport {
    pub source: Option<SourceKind>,
    pub location: PathBuf,
    /// Messages emitted
    pub count: usize,
    pub decode_failures: usize,
    /// Rows intentionally not surfaced (system/reaction rows, notices)
    pub skipped: usize,
    /// Raw tokens that did not resolve to a configured person
    pub unmapped_contacts: BTreeSet<String>,
    pub failures: Vec<DecodeFailure>,
    /// Unparseable leading lines and similar notes
    pub diagnostics: Vec<String>,
    /// Set when the source could not be opened at all
    pub unavailable: Option<String>,
}

impl ExtractionReport {
    pub fn new(source: SourceKind, location: PathBuf) -> Self {
        Self {
            source: Some(source),
            location,
            ..Default::default()
        }
    }

    pub fn is_unavailable(&self) -> bool {
        self.unavailable.is_some()
    }

    /// Decode failures as a fraction of rows seen
    pub fn decode_failure_rate(&self) -> f64 {
        let rejected = self.failures.iter().filter(|f| !f.message_emitted).count();
        let seen = self.count + rejected;
        if seen == 0 {
            0.0
        } else {
            self.decode_failures as f64 / seen as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_rate_counts_rejected_rows() {
        let mut report = ExtractionReport::new(SourceKind::LineExport, PathBuf::from("chat.txt"));
        report.count = 3;
        report.decode_failures = 1;
        report.failures.push(DecodeFailure {
            locator: "chat.txt#4".to_string(),
            error: "unparseable timestamp".to_string(),
            message_emitted: false,
        });
        assert!((report.decode_failure_rate() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_report_rate_is_zero() {
        let report = ExtractionReport::new(SourceKind::MessageDb, PathBuf::from("chat.db"));
        assert_eq!(report.decode_failure_rate(), 0.0);
        assert!(!report.is_unavailable());
    }
}
