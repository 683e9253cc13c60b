//! End-to-end ingestion tests
//!
//! Message database + line export (zipped) through the coordinator:
//! merge order, determinism, decode fallback, source availability,
//! integrity verification, cancellation and output manifests.

mod helpers;

use evidex_common::{Error, Result, SourceKind};
use evidex_ingest::adapters::{ExtractContext, SourceAdapter, SourceEvent};
use evidex_ingest::ledger::{AuditAction, AuditLedger, RunManifest};
use evidex_ingest::models::{CanonicalMessage, RawReference, ResolvedIdentity};
use evidex_ingest::{IdentityResolver, IngestionCoordinator};
use futures::stream::{self, BoxStream, StreamExt};
use helpers::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

const WHATSAPP_EXPORT: &str = "\u{feff}[3/8/22, 2:12:34 PM] Jordan: same second as the database
[3/8/22, 2:15:00 PM] You: first line
second line
[3/8/22, 2:16:00 PM] Messages and calls are end-to-end encrypted.
[3/8/22, 2:17:00 PM] +1 425 555 0100: who is this
";

struct Fixture {
    _temp_dir: TempDir,
    db: PathBuf,
    exports: PathBuf,
    out: PathBuf,
}

async fn fixture() -> Fixture {
    let temp_dir = TempDir::new().unwrap();
    let db = temp_dir.path().join("chat.db");
    let exports = temp_dir.path().join("whatsapp");
    std::fs::create_dir_all(&exports).unwrap();
    let out = temp_dir.path().join("out");

    let truncated = {
        let full = keyed_archive("lost words");
        full[..full.len() / 2].to_vec()
    };
    create_chat_db(
        &db,
        &[(1, "(206) 555-1234"), (2, "+14255550100")],
        &[
            DbRow::text(1, 1, APPLE_DATE_2022_03_08, "hi there"),
            DbRow::body(2, 1, APPLE_DATE_2022_03_08 + 60, truncated),
            DbRow::body(3, 2, APPLE_DATE_2022_03_08 + 120, keyed_archive("from a stranger")),
            DbRow::text(4, 1, APPLE_DATE_2022_03_08 + 180, "Loved \u{201c}hi there\u{201d}").reaction(),
            DbRow::text(5, 1, 0, "no date"),
            DbRow::text(6, 1, APPLE_DATE_2022_03_08 + 240, "on my way").from_me(),
        ],
    )
    .await;

    write_zip(
        &exports.join("export.zip"),
        &[("WhatsApp Chat with Jordan.txt", WHATSAPP_EXPORT)],
    );

    Fixture {
        _temp_dir: temp_dir,
        db,
        exports,
        out,
    }
}

fn coordinator(f: &Fixture, ledger: Arc<AuditLedger>) -> IngestionCoordinator {
    let config = with_source(
        with_source(base_config(), SourceKind::LineExport, &f.exports),
        SourceKind::MessageDb,
        &f.db,
    );
    IngestionCoordinator::new(config, ledger)
        .unwrap()
        .with_output_dir(&f.out)
}

fn actions(ledger: &AuditLedger) -> Vec<AuditAction> {
    ledger.records().unwrap().iter().map(|r| r.action).collect()
}

fn person(name: &str) -> ResolvedIdentity {
    ResolvedIdentity::Person(name.to_string())
}

// ============================================================================
// Merge and extraction
// ============================================================================

#[tokio::test]
async fn test_merged_stream_order_and_identities() {
    let f = fixture().await;
    let ledger = Arc::new(AuditLedger::ephemeral());
    let outcome = coordinator(&f, ledger).run().await.unwrap();

    let summary: Vec<(SourceKind, &str)> = outcome
        .messages
        .iter()
        .map(|m| (m.source, m.content.as_str()))
        .collect();
    assert_eq!(
        summary,
        vec![
            // Same instant: message database outranks line export
            (SourceKind::MessageDb, "hi there"),
            (SourceKind::LineExport, "same second as the database"),
            (SourceKind::MessageDb, ""),
            (SourceKind::MessageDb, "from a stranger"),
            (SourceKind::LineExport, "first line\nsecond line"),
            (SourceKind::MessageDb, "on my way"),
            (SourceKind::LineExport, "who is this"),
        ]
    );

    let first = &outcome.messages[0];
    assert_eq!(first.sender, person("Jordan"));
    assert_eq!(first.recipient, person("Alex"));
    assert_eq!(first.timestamp.to_rfc3339(), "2022-03-08T14:12:34+00:00");

    let reply = &outcome.messages[4];
    assert_eq!(reply.sender, person("Alex"));
    assert_eq!(reply.recipient, person("Jordan"));

    let from_me = &outcome.messages[5];
    assert_eq!(from_me.sender, person("Alex"));
    assert_eq!(from_me.recipient, person("Jordan"));

    assert_eq!(
        outcome.messages[3].sender,
        ResolvedIdentity::Unmapped("+14255550100".to_string())
    );
}

#[tokio::test]
async fn test_decode_fallback_and_report_counts() {
    let f = fixture().await;
    let ledger = Arc::new(AuditLedger::ephemeral());
    let outcome = coordinator(&f, ledger).run().await.unwrap();

    let db_report = outcome
        .reports
        .iter()
        .find(|r| r.source == Some(SourceKind::MessageDb))
        .unwrap();
    assert_eq!(db_report.count, 4);
    assert_eq!(db_report.decode_failures, 2);
    assert_eq!(db_report.skipped, 1);
    assert!(db_report.unmapped_contacts.contains("+14255550100"));

    let failed = outcome
        .messages
        .iter()
        .find(|m| m.raw.locator == "chat.db#2")
        .unwrap();
    assert!(failed.raw.decode_failed);
    assert!(failed.raw.decode_error.is_some());
    assert_eq!(failed.content, "");

    // Extraction continued past the bad body
    assert!(outcome.messages.iter().any(|m| m.raw.locator == "chat.db#3"));

    let export_report = outcome
        .reports
        .iter()
        .find(|r| r.source == Some(SourceKind::LineExport))
        .unwrap();
    assert_eq!(export_report.count, 3);
    assert_eq!(export_report.skipped, 1);
}

#[tokio::test]
async fn test_third_parties_registered_once_across_sources() {
    let f = fixture().await;
    let ledger = Arc::new(AuditLedger::ephemeral());
    let outcome = coordinator(&f, Arc::clone(&ledger)).run().await.unwrap();

    assert_eq!(outcome.third_parties.len(), 1);
    let contact = &outcome.third_parties[0];
    assert_eq!(contact.normalized, "+14255550100");
    assert_eq!(contact.sources.len(), 2);

    let registered = actions(&ledger)
        .into_iter()
        .filter(|a| *a == AuditAction::ThirdPartyRegistered)
        .count();
    assert_eq!(registered, 1);
}

// ============================================================================
// Determinism
// ============================================================================

#[tokio::test]
async fn test_two_runs_are_identical() {
    let f = fixture().await;

    let first = coordinator(&f, Arc::new(AuditLedger::ephemeral()))
        .run()
        .await
        .unwrap();
    let second_ledger = Arc::new(AuditLedger::ephemeral());
    let second = coordinator(&f, Arc::clone(&second_ledger))
        .run()
        .await
        .unwrap();

    assert_eq!(first.messages, second.messages);
    assert_eq!(first.manifest.file_hashes(), second.manifest.file_hashes());
    assert_ne!(first.manifest.session_id, second.manifest.session_id);

    // The archive was extracted once and reused
    assert!(actions(&second_ledger).contains(&AuditAction::ArchiveExtractionSkipped));
}

// ============================================================================
// Outputs, manifest and custody
// ============================================================================

#[tokio::test]
async fn test_outputs_and_manifest_written() {
    let f = fixture().await;
    let ledger = Arc::new(AuditLedger::open(f.out.join("audit.jsonl"), 2000).unwrap());
    let outcome = coordinator(&f, Arc::clone(&ledger)).run().await.unwrap();

    let jsonl = std::fs::read_to_string(f.out.join("canonical_messages.jsonl")).unwrap();
    let written: Vec<CanonicalMessage> = jsonl
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(written, outcome.messages);

    assert_eq!(outcome.manifest.outputs.len(), 3);
    assert!(outcome.manifest.omitted.is_empty());
    let input_paths: Vec<&Path> = outcome
        .manifest
        .inputs
        .iter()
        .map(|e| e.path.as_path())
        .collect();
    assert!(input_paths.contains(&f.db.as_path()));
    assert!(input_paths.contains(&f.exports.join("export.zip").as_path()));

    let on_disk: RunManifest =
        serde_json::from_slice(&std::fs::read(f.out.join("run_manifest.json")).unwrap()).unwrap();
    assert_eq!(on_disk, outcome.manifest);

    let custody = ledger.write_custody(&f.out.join("custody.json")).unwrap();
    assert!(custody.verify_integrity());
    assert_eq!(custody.manifest.as_ref(), Some(&outcome.manifest));
    assert!(f.out.join("custody.txt").is_file());

    // Every in-memory record also reached the durable audit log
    let durable = std::fs::read_to_string(f.out.join("audit.jsonl")).unwrap();
    assert_eq!(durable.lines().count(), custody.records.len());
}

// ============================================================================
// Failure modes
// ============================================================================

#[tokio::test]
async fn test_missing_source_is_reported_not_fatal() {
    let f = fixture().await;
    let config = with_source(
        with_source(base_config(), SourceKind::MessageDb, &f.db.with_file_name("absent.db")),
        SourceKind::LineExport,
        &f.exports,
    );
    let outcome = IngestionCoordinator::new(config, Arc::new(AuditLedger::ephemeral()))
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(outcome.usable_sources(), 1);
    assert!(outcome.reports[0].is_unavailable());
    assert_eq!(outcome.messages.len(), 3);
}

#[tokio::test]
async fn test_all_sources_unavailable_is_fatal() {
    let temp_dir = TempDir::new().unwrap();
    let config = with_source(
        with_source(base_config(), SourceKind::MessageDb, &temp_dir.path().join("none.db")),
        SourceKind::LineExport,
        &temp_dir.path().join("none"),
    );
    let ledger = Arc::new(AuditLedger::ephemeral());
    let err = IngestionCoordinator::new(config, Arc::clone(&ledger))
        .unwrap()
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, Error::NoUsableSources(2)));
    let recorded = actions(&ledger);
    assert_eq!(
        recorded
            .iter()
            .filter(|a| **a == AuditAction::SourceUnavailable)
            .count(),
        2
    );
    assert!(!recorded.contains(&AuditAction::ManifestGenerated));
}

/// Fails on its first item
struct FailingAdapter {
    path: PathBuf,
}

impl SourceAdapter for FailingAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::LineExport
    }

    fn location(&self) -> &Path {
        &self.path
    }

    fn extract<'a>(&'a self, _ctx: &'a ExtractContext) -> BoxStream<'a, Result<SourceEvent>> {
        let err = Error::Integrity {
            path: self.path.clone(),
            expected: "aa".to_string(),
            actual: "bb".to_string(),
        };
        stream::iter(vec![Err(err)]).boxed()
    }
}

/// Never yields and never ends
struct StalledAdapter {
    path: PathBuf,
}

impl SourceAdapter for StalledAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::MessageDb
    }

    fn location(&self) -> &Path {
        &self.path
    }

    fn extract<'a>(&'a self, _ctx: &'a ExtractContext) -> BoxStream<'a, Result<SourceEvent>> {
        stream::pending().boxed()
    }
}

#[tokio::test]
async fn test_fatal_error_stops_stalled_sibling() {
    let config = base_config();
    let resolver = Arc::new(IdentityResolver::from_config(&config).unwrap());
    let ledger = Arc::new(AuditLedger::ephemeral());
    let adapters: Vec<Arc<dyn SourceAdapter>> = vec![
        Arc::new(StalledAdapter {
            path: PathBuf::from("slow.db"),
        }),
        Arc::new(FailingAdapter {
            path: PathBuf::from("chat.txt"),
        }),
    ];
    let coordinator = IngestionCoordinator::with_adapters(config, resolver, Arc::clone(&ledger), adapters);

    let result = tokio::time::timeout(std::time::Duration::from_secs(10), coordinator.run()).await;

    assert!(matches!(result, Ok(Err(Error::Integrity { .. }))), "{result:?}");
    assert!(actions(&ledger).contains(&AuditAction::IngestionAborted));
}

#[tokio::test]
async fn test_ambiguous_identifiers_fail_before_extraction() {
    let f = fixture().await;
    let mut config = with_source(base_config(), SourceKind::MessageDb, &f.db);
    config
        .person_identifiers
        .insert("Sam".to_string(), vec!["206-555-1234".to_string()]);

    let ledger = Arc::new(AuditLedger::ephemeral());
    let err = IngestionCoordinator::new(config, Arc::clone(&ledger)).err().unwrap();
    assert!(matches!(err, Error::Config(_)));
    assert!(ledger.records().unwrap().is_empty());
}

#[tokio::test]
async fn test_cancelled_run_has_no_manifest() {
    let f = fixture().await;
    let ledger = Arc::new(AuditLedger::ephemeral());
    let coordinator = coordinator(&f, Arc::clone(&ledger));
    coordinator.cancellation_token().cancel();

    let err = coordinator.run().await.unwrap_err();
    assert!(matches!(err, Error::Cancelled(_)));

    let recorded = actions(&ledger);
    assert!(recorded.contains(&AuditAction::IngestionCancelled));
    assert!(!recorded.contains(&AuditAction::ManifestGenerated));
    assert!(ledger.manifest().unwrap().is_none());
    assert!(!f.out.join("run_manifest.json").exists());
}

/// Adapter that alters its source after registering it
struct TamperingAdapter {
    path: PathBuf,
}

impl SourceAdapter for TamperingAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::LineExport
    }

    fn location(&self) -> &Path {
        &self.path
    }

    fn extract<'a>(&'a self, ctx: &'a ExtractContext) -> BoxStream<'a, Result<SourceEvent>> {
        let event = ctx.ledger.register_source(&self.path).and_then(|_| {
            std::fs::write(&self.path, "altered after hashing")?;
            Ok(SourceEvent::Message(CanonicalMessage::new(
                SourceKind::LineExport,
                chrono::Utc::now(),
                person("Jordan"),
                person("Alex"),
                "hi".to_string(),
                RawReference::new("chat.txt#1"),
            )))
        });
        stream::iter(vec![event]).boxed()
    }
}

#[tokio::test]
async fn test_modified_source_aborts_with_integrity_error() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_text(temp_dir.path(), "chat.txt", "original content");
    let config = base_config();
    let resolver = Arc::new(IdentityResolver::from_config(&config).unwrap());
    let ledger = Arc::new(AuditLedger::ephemeral());

    let coordinator = IngestionCoordinator::with_adapters(
        config,
        resolver,
        Arc::clone(&ledger),
        vec![Arc::new(TamperingAdapter { path })],
    );
    let err = coordinator.run().await.unwrap_err();

    assert!(matches!(err, Error::Integrity { .. }));
    let recorded = actions(&ledger);
    assert!(recorded.contains(&AuditAction::IntegrityViolation));
    assert!(recorded.contains(&AuditAction::IngestionAborted));
    assert!(!recorded.contains(&AuditAction::ManifestGenerated));
}
