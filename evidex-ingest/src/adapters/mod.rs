//! Source adapters
//!
//! Each adapter turns one configured source into a lazy stream of
//! `SourceEvent`s. Per-message problems travel inside the stream as
//! `Rejected` events; only fatal conditions (persistence, integrity,
//! cancellation) are `Err` items. A source that cannot be opened yields a
//! single `Unavailable` event and ends.

pub mod archive;
pub mod email;
pub mod html;
pub mod keyed_archive;
pub mod line_export;
pub mod message_db;
pub mod teams;
pub mod templates;

pub use email::EmailAdapter;
pub use line_export::LineExportAdapter;
pub use message_db::MessageDbAdapter;
pub use teams::TeamsAdapter;

use crate::identity::IdentityResolver;
use crate::ledger::{metadata, AuditAction, AuditLedger};
use crate::models::{CanonicalMessage, DecodeFailure, ExtractionReport, ResolvedIdentity};
use evidex_common::{Error, IngestConfig, Result, SourceKind};
use futures::stream::{BoxStream, StreamExt};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error as ThisError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-message decode failure
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum DecodeError {
    #[error("truncated buffer: {0}")]
    Truncated(String),

    #[error("missing expected key: {0}")]
    MissingKey(String),

    #[error("unsupported encoding: {0}")]
    UnsupportedEncoding(String),

    #[error("malformed structure: {0}")]
    Malformed(String),

    #[error("unparseable timestamp: {0}")]
    UnparseableTimestamp(String),
}

/// One item produced by an adapter
#[derive(Debug, Clone)]
pub enum SourceEvent {
    /// A canonical message. Decode failures that still produce a message
    /// carry `raw.decode_failed = true`.
    Message(CanonicalMessage),
    /// A row that could not become a message at all
    Rejected { locator: String, error: DecodeError },
    /// A row intentionally filtered (reactions, system notices)
    Skipped { locator: String, reason: String },
    /// Informational note for the report
    Diagnostic(String),
    /// The source could not be opened; no further events follow
    Unavailable { reason: String },
}

/// Shared, read-only collaborators injected into every adapter
#[derive(Clone)]
pub struct ExtractContext {
    pub resolver: Arc<IdentityResolver>,
    pub ledger: Arc<AuditLedger>,
    pub cancel: CancellationToken,
}

impl ExtractContext {
    pub fn new(resolver: Arc<IdentityResolver>, ledger: Arc<AuditLedger>) -> Self {
        Self {
            resolver,
            ledger,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// A source of canonical messages
pub trait SourceAdapter: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Configured location (file or directory)
    fn location(&self) -> &Path;

    /// Lazy, finite event stream. Calling again restarts extraction from the
    /// beginning and yields the same events for unchanged input.
    fn extract<'a>(&'a self, ctx: &'a ExtractContext) -> BoxStream<'a, Result<SourceEvent>>;
}

/// Build the adapters named by the configuration, in configuration order
pub fn from_config(config: &IngestConfig) -> Vec<Arc<dyn SourceAdapter>> {
    config
        .sources
        .iter()
        .map(|source| -> Arc<dyn SourceAdapter> {
            match source.kind {
                SourceKind::MessageDb => Arc::new(MessageDbAdapter::new(source.location.clone())),
                SourceKind::LineExport => Arc::new(LineExportAdapter::new(
                    source.location.clone(),
                    config.line_export.clone(),
                    config.archive.clone(),
                )),
                SourceKind::Email => Arc::new(EmailAdapter::new(source.location.clone())),
                SourceKind::Teams => Arc::new(TeamsAdapter::new(
                    source.location.clone(),
                    config.archive.clone(),
                )),
            }
        })
        .collect()
}

/// Messages of one source in emission order, plus its report
#[derive(Debug, Clone)]
pub struct Extraction {
    pub messages: Vec<CanonicalMessage>,
    pub report: ExtractionReport,
}

/// Drain an adapter's stream into messages and an aggregated report
///
/// Stops with `Error::Cancelled` as soon as the context's token fires.
pub async fn collect_extraction(
    adapter: &dyn SourceAdapter,
    ctx: &ExtractContext,
) -> Result<Extraction> {
    let kind = adapter.kind();
    let location = adapter.location().to_path_buf();
    let mut report = ExtractionReport::new(kind, location.clone());
    let mut messages = Vec::new();

    ctx.ledger.record(
        AuditAction::ExtractionStarted,
        format!("Extracting {} from {}", kind, location.display()),
        metadata([
            ("source", json!(kind.as_str())),
            ("location", json!(location.display().to_string())),
        ]),
    )?;
    info!(source = %kind, location = %location.display(), "Extraction started");

    let mut stream = adapter.extract(ctx);
    loop {
        let next = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                warn!(source = %kind, "Extraction cancelled");
                return Err(Error::Cancelled(format!("extraction of {} interrupted", kind)));
            }
            next = stream.next() => next,
        };
        let Some(event) = next else { break };

        match event? {
            SourceEvent::Message(message) => {
                for identity in [&message.sender, &message.recipient] {
                    if let ResolvedIdentity::Unmapped(raw) = identity {
                        if !raw.is_empty() {
                            report.unmapped_contacts.insert(raw.clone());
                        }
                    }
                }
                if message.raw.decode_failed {
                    report.decode_failures += 1;
                    report.failures.push(DecodeFailure {
                        locator: message.raw.locator.clone(),
                        error: message.raw.decode_error.clone().unwrap_or_default(),
                        message_emitted: true,
                    });
                }
                report.count += 1;
                messages.push(message);
            }
            SourceEvent::Rejected { locator, error } => {
                debug!(source = %kind, locator = %locator, error = %error, "Row rejected");
                report.decode_failures += 1;
                report.failures.push(DecodeFailure {
                    locator,
                    error: error.to_string(),
                    message_emitted: false,
                });
            }
            SourceEvent::Skipped { locator, reason } => {
                debug!(source = %kind, locator = %locator, reason = %reason, "Row skipped");
                report.skipped += 1;
            }
            SourceEvent::Diagnostic(note) => report.diagnostics.push(note),
            SourceEvent::Unavailable { reason } => {
                warn!(source = %kind, location = %location.display(), reason = %reason, "Source unavailable");
                ctx.ledger.record(
                    AuditAction::SourceUnavailable,
                    format!("Source unavailable: {}", location.display()),
                    metadata([
                        ("source", json!(kind.as_str())),
                        ("location", json!(location.display().to_string())),
                        ("reason", json!(reason)),
                    ]),
                )?;
                report.unavailable = Some(reason);
                break;
            }
        }
    }

    ctx.ledger.record(
        AuditAction::ExtractionCompleted,
        format!("Extracted {} message(s) from {}", report.count, location.display()),
        metadata([
            ("source", json!(kind.as_str())),
            ("count", json!(report.count)),
            ("decode_failures", json!(report.decode_failures)),
            ("skipped", json!(report.skipped)),
            ("unmapped_contacts", json!(report.unmapped_contacts.len())),
        ]),
    )?;
    info!(
        source = %kind,
        count = report.count,
        decode_failures = report.decode_failures,
        skipped = report.skipped,
        "Extraction completed"
    );

    Ok(Extraction { messages, report })
}

/// Locator for a row: `<path relative to root>#<row>`
pub(crate) fn locator(root: &Path, file: &Path, row: impl std::fmt::Display) -> String {
    let relative = file.strip_prefix(root).unwrap_or(file);
    let relative = if relative.as_os_str().is_empty() {
        file.file_name().map(PathBuf::from).unwrap_or_default()
    } else {
        relative.to_path_buf()
    };
    format!("{}#{}", relative.to_string_lossy().replace('\\', "/"), row)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locator_relative_to_root() {
        let root = Path::new("/evidence/export");
        let file = Path::new("/evidence/export/chats/a.txt");
        assert_eq!(locator(root, file, 7), "chats/a.txt#7");
    }

    #[test]
    fn test_locator_for_file_source_uses_file_name() {
        let file = Path::new("/evidence/chat.db");
        assert_eq!(locator(file, file, 42), "chat.db#42");
    }
}
