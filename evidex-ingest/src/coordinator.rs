//! Ingestion coordinator
//!
//! Runs every configured adapter concurrently, waits for all of them (the
//! merge barrier), then orders the combined stream by
//! `(timestamp, source priority, adapter position, per-source sequence)`.
//! The order depends only on the data, never on task scheduling.
//!
//! After the merge the coordinator verifies that no source changed while it
//! was read, registers third-party contacts, writes the optional output
//! artifacts and has the ledger emit the run manifest.

use crate::adapters::{self, collect_extraction, ExtractContext, Extraction, SourceAdapter};
use crate::identity::{IdentityResolver, ThirdPartyContact, ThirdPartyRegistry};
use crate::ledger::{metadata, AuditAction, AuditLedger, RunManifest};
use crate::models::{CanonicalMessage, ExtractionReport};
use evidex_common::{Error, IngestConfig, Result, SourceKind};
use futures::future::join_all;
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub const MESSAGES_FILE: &str = "canonical_messages.jsonl";
pub const REPORT_FILE: &str = "extraction_report.json";
pub const THIRD_PARTY_FILE: &str = "third_party_contacts.json";
pub const MANIFEST_FILE: &str = "run_manifest.json";

/// Result of a completed run
#[derive(Debug, Clone)]
pub struct IngestionOutcome {
    /// Canonical stream in deterministic order
    pub messages: Vec<CanonicalMessage>,
    /// One report per adapter, in adapter order
    pub reports: Vec<ExtractionReport>,
    pub third_parties: Vec<ThirdPartyContact>,
    pub manifest: RunManifest,
}

impl IngestionOutcome {
    pub fn usable_sources(&self) -> usize {
        self.reports.iter().filter(|r| !r.is_unavailable()).count()
    }
}

pub struct IngestionCoordinator {
    config: IngestConfig,
    resolver: Arc<IdentityResolver>,
    ledger: Arc<AuditLedger>,
    adapters: Vec<Arc<dyn SourceAdapter>>,
    output_dir: Option<PathBuf>,
    cancel: CancellationToken,
}

impl IngestionCoordinator {
    /// Validate configuration, build the identity index and the configured
    /// adapters. Configuration errors surface here, before any extraction.
    pub fn new(config: IngestConfig, ledger: Arc<AuditLedger>) -> Result<Self> {
        config.validate()?;
        let resolver = Arc::new(IdentityResolver::from_config(&config)?);
        let adapters = adapters::from_config(&config);
        Ok(Self::with_adapters(config, resolver, ledger, adapters))
    }

    /// Coordinator over explicitly constructed adapters
    pub fn with_adapters(
        config: IngestConfig,
        resolver: Arc<IdentityResolver>,
        ledger: Arc<AuditLedger>,
        adapters: Vec<Arc<dyn SourceAdapter>>,
    ) -> Self {
        Self {
            config,
            resolver,
            ledger,
            adapters,
            output_dir: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Write canonical stream, reports and manifest under `dir`
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that aborts a running `run`
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn resolver(&self) -> &Arc<IdentityResolver> {
        &self.resolver
    }

    pub fn ledger(&self) -> &Arc<AuditLedger> {
        &self.ledger
    }

    pub async fn run(&self) -> Result<IngestionOutcome> {
        self.ledger.record(
            AuditAction::IngestionStarted,
            format!("Ingestion started with {} source(s)", self.adapters.len()),
            metadata([
                ("self_name", json!(self.config.self_name)),
                ("persons", json!(self.config.person_identifiers.len())),
                ("sources", json!(self.adapters.len())),
                (
                    "source_priority",
                    json!(self
                        .config
                        .source_priority
                        .iter()
                        .map(|k| k.as_str())
                        .collect::<Vec<_>>()),
                ),
            ]),
        )?;

        let extractions = match self.extract_all().await {
            Ok(extractions) => extractions,
            Err(e) => return Err(self.abort(e)),
        };

        match self.finish(extractions) {
            Ok(outcome) => Ok(outcome),
            Err(e) => Err(self.abort(e)),
        }
    }

    /// Run all adapters concurrently and wait for every one of them
    ///
    /// The first adapter error stops the others through a child token, so an
    /// abort does not wait for the slowest source to finish reading.
    async fn extract_all(&self) -> Result<Vec<Extraction>> {
        let stop = self.cancel.child_token();
        let ctx = ExtractContext::new(Arc::clone(&self.resolver), Arc::clone(&self.ledger))
            .with_cancellation(stop.clone());

        let handles: Vec<_> = self
            .adapters
            .iter()
            .map(|adapter| {
                let adapter = Arc::clone(adapter);
                let ctx = ctx.clone();
                let stop = stop.clone();
                tokio::spawn(async move {
                    let result = collect_extraction(adapter.as_ref(), &ctx).await;
                    if let Err(e) = &result {
                        if !matches!(e, Error::Cancelled(_)) {
                            warn!(source = %adapter.kind(), error = %e, "Adapter failed, stopping the others");
                            stop.cancel();
                        }
                    }
                    result
                })
            })
            .collect();

        let mut extractions = Vec::with_capacity(handles.len());
        let mut first_error = None;
        for joined in join_all(handles).await {
            let result = joined
                .map_err(|e| Error::Internal(format!("adapter task failed: {}", e)))
                .and_then(|r| r);
            match result {
                Ok(extraction) => extractions.push(extraction),
                // Siblings stopped by the failing adapter report Cancelled
                Err(Error::Cancelled(_)) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled("ingestion interrupted".to_string()));
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        if stop.is_cancelled() {
            return Err(Error::Cancelled("adapters stopped".to_string()));
        }
        Ok(extractions)
    }

    fn finish(&self, extractions: Vec<Extraction>) -> Result<IngestionOutcome> {
        let configured = extractions.len();
        if extractions.iter().all(|e| e.report.is_unavailable()) {
            error!(configured, "No usable sources");
            return Err(Error::NoUsableSources(configured));
        }

        let mut reports = Vec::with_capacity(extractions.len());
        let mut keyed = Vec::new();
        for (position, extraction) in extractions.into_iter().enumerate() {
            for (sequence, message) in extraction.messages.into_iter().enumerate() {
                let rank = self.config.priority_rank(message.source);
                keyed.push(((message.timestamp, rank, position, sequence), message));
            }
            reports.push(extraction.report);
        }
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        let messages: Vec<CanonicalMessage> = keyed.into_iter().map(|(_, m)| m).collect();
        info!(messages = messages.len(), sources = reports.len(), "Canonical stream merged");

        self.ledger.verify_sources()?;
        self.record_validation(&messages)?;

        let mut registry = ThirdPartyRegistry::new();
        for report in &reports {
            let Some(kind) = report.source else { continue };
            for contact in &report.unmapped_contacts {
                registry.register(contact, kind, &self.ledger)?;
            }
        }
        let third_parties = registry.get_all();

        if let Some(dir) = &self.output_dir {
            self.write_outputs(dir, &messages, &reports, &third_parties)?;
        }

        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled("ingestion interrupted before manifest".to_string()));
        }
        let manifest = self.ledger.generate_manifest()?;
        if let Some(dir) = &self.output_dir {
            self.ledger.write_manifest(&dir.join(MANIFEST_FILE))?;
        }

        self.ledger.record(
            AuditAction::IngestionCompleted,
            format!("Ingestion completed: {} message(s)", messages.len()),
            metadata([
                ("messages", json!(messages.len())),
                ("third_parties", json!(third_parties.len())),
                (
                    "unavailable_sources",
                    json!(reports.iter().filter(|r| r.is_unavailable()).count()),
                ),
            ]),
        )?;
        self.ledger.flush()?;

        Ok(IngestionOutcome {
            messages,
            reports,
            third_parties,
            manifest,
        })
    }

    /// Per-run sanity summary of the merged stream
    fn record_validation(&self, messages: &[CanonicalMessage]) -> Result<()> {
        let mut by_source: BTreeMap<SourceKind, usize> = BTreeMap::new();
        let mut seen = HashSet::with_capacity(messages.len());
        let mut duplicate_ids = 0usize;
        let mut empty_content = 0usize;

        for message in messages {
            *by_source.entry(message.source).or_insert(0) += 1;
            if !seen.insert(&message.id) {
                duplicate_ids += 1;
            }
            if message.content.trim().is_empty() {
                empty_content += 1;
            }
        }
        if duplicate_ids > 0 {
            warn!(duplicate_ids, "Duplicate message ids in canonical stream");
        }

        let by_source: BTreeMap<&str, usize> =
            by_source.into_iter().map(|(k, v)| (k.as_str(), v)).collect();
        self.ledger.record(
            AuditAction::ExtractionValidated,
            format!("Validated {} message(s)", messages.len()),
            metadata([
                ("total", json!(messages.len())),
                ("by_source", json!(by_source)),
                ("empty_content", json!(empty_content)),
                ("duplicate_ids", json!(duplicate_ids)),
            ]),
        )?;
        Ok(())
    }

    fn write_outputs(
        &self,
        dir: &Path,
        messages: &[CanonicalMessage],
        reports: &[ExtractionReport],
        third_parties: &[ThirdPartyContact],
    ) -> Result<()> {
        let mut jsonl = Vec::new();
        for message in messages {
            serde_json::to_writer(&mut jsonl, message)?;
            jsonl.push(b'\n');
        }
        self.ledger.write_output(&dir.join(MESSAGES_FILE), &jsonl)?;
        self.ledger
            .write_output(&dir.join(REPORT_FILE), &serde_json::to_vec_pretty(reports)?)?;
        self.ledger.write_output(
            &dir.join(THIRD_PARTY_FILE),
            &serde_json::to_vec_pretty(third_parties)?,
        )?;
        Ok(())
    }

    /// Record how the run ended and flush, keeping whatever is already durable
    fn abort(&self, err: Error) -> Error {
        let action = match err {
            Error::Cancelled(_) => AuditAction::IngestionCancelled,
            _ => AuditAction::IngestionAborted,
        };
        error!(error = %err, "Ingestion aborted");

        if !matches!(err, Error::Persistence(_)) {
            let recorded = self.ledger.record(
                action,
                format!("Ingestion aborted: {}", err),
                metadata([("error", json!(err.to_string())), ("fatal", json!(true))]),
            );
            if let Err(e) = recorded.and_then(|_| self.ledger.flush()) {
                return e;
            }
        }
        err
    }
}
