//! Review workflow tests
//!
//! Queue construction from a canonical stream, decisions persisted across
//! an interrupted session, and resumption from the decision log alone.

use chrono::{Duration, TimeZone, Utc};
use evidex_common::SourceKind;
use evidex_ingest::ledger::{AuditAction, AuditLedger};
use evidex_ingest::models::{
    CanonicalMessage, Decision, MessageId, RawReference, ResolvedIdentity, ReviewItem,
};
use evidex_ingest::review::{build_review_queue, ItemState, ReviewInput};
use evidex_ingest::{DecisionLog, ReviewSession};
use std::io::Write;
use std::sync::Arc;
use tempfile::TempDir;

fn stream(n: usize) -> Vec<CanonicalMessage> {
    let start = Utc.with_ymd_and_hms(2022, 3, 8, 14, 0, 0).unwrap();
    (0..n)
        .map(|i| {
            CanonicalMessage::new(
                SourceKind::MessageDb,
                start + Duration::minutes(i as i64),
                ResolvedIdentity::Person("Jordan".to_string()),
                ResolvedIdentity::Person("Alex".to_string()),
                format!("message {}", i),
                RawReference::new(format!("chat.db#{}", i + 1)),
            )
        })
        .collect()
}

/// Five flagged items spread over a ten-message stream
fn flagged_items(messages: &[CanonicalMessage]) -> Vec<ReviewItem> {
    let flagged: Vec<(MessageId, String)> = [1, 3, 5, 7, 9]
        .iter()
        .map(|&i| (messages[i].id.clone(), "threat".to_string()))
        .collect();
    build_review_queue(&flagged, messages, 2)
}

fn confirm() -> ReviewInput {
    ReviewInput::parse("y", "reviewed").unwrap()
}

// ============================================================================
// Queue
// ============================================================================

#[test]
fn test_queue_context_windows() {
    let messages = stream(10);
    let items = flagged_items(&messages);

    assert_eq!(items.len(), 5);
    assert_eq!(items[0].context.len(), 4); // clamped at the start
    assert_eq!(items[1].context.len(), 5);
    assert_eq!(items[4].context.len(), 3); // clamped at the end
    assert_eq!(items[4].context.last(), Some(&messages[9].id));
}

// ============================================================================
// Resume after interruption
// ============================================================================

#[test]
fn test_interrupted_session_resumes_with_remaining_items() {
    let temp_dir = TempDir::new().unwrap();
    let log_path = temp_dir.path().join("decisions.jsonl");
    let messages = stream(10);
    let items = flagged_items(&messages);
    let ledger = Arc::new(AuditLedger::ephemeral());

    {
        let log = DecisionLog::open(&log_path, 500).unwrap();
        let mut session = ReviewSession::start(log, items.clone(), Arc::clone(&ledger)).unwrap();

        assert_eq!(session.next_item().unwrap().item_id, items[0].item_id);
        assert_eq!(session.submit(confirm()).unwrap(), Some(Decision::Confirmed));
        assert_eq!(session.next_item().unwrap().item_id, items[1].item_id);
        assert_eq!(
            session.submit(ReviewInput::parse("n", "").unwrap()).unwrap(),
            Some(Decision::Dismissed)
        );

        // Third item is on screen when the process dies
        assert_eq!(session.next_item().unwrap().item_id, items[2].item_id);
        assert_eq!(session.state(&items[2].item_id), Some(ItemState::Presented));
        drop(session);
    }

    // A write torn mid-line by the crash
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(&log_path)
        .unwrap();
    file.write_all(b"{\"item_id\":\"partial").unwrap();
    drop(file);

    let log = DecisionLog::open(&log_path, 500).unwrap();
    assert_eq!(log.replay().unwrap().len(), 2);
    let pending: Vec<MessageId> = log
        .load_pending(&items)
        .unwrap()
        .into_iter()
        .map(|i| i.item_id)
        .collect();
    assert_eq!(
        pending,
        items[2..].iter().map(|i| i.item_id.clone()).collect::<Vec<_>>()
    );

    let mut session = ReviewSession::start(log, items.clone(), Arc::clone(&ledger)).unwrap();
    assert_eq!(session.state(&items[0].item_id), None);
    assert_eq!(session.next_item().unwrap().item_id, items[2].item_id);
    session.submit(confirm()).unwrap();
    assert_eq!(session.next_item().unwrap().item_id, items[3].item_id);
    session.submit(ReviewInput::Quit).unwrap();
    assert!(session.is_finished());
    assert!(session.next_item().is_none());

    let summary = session.finish().unwrap();
    assert_eq!(summary.total, 5);
    assert_eq!(summary.confirmed, 2);
    assert_eq!(summary.dismissed, 1);
    assert_eq!(summary.pending, 2);

    let reopened = DecisionLog::open(&log_path, 500).unwrap();
    let decided = reopened.decided().unwrap();
    assert_eq!(decided.len(), 3);
    assert_eq!(decided[&items[1].item_id], Decision::Dismissed);

    let actions: Vec<AuditAction> = ledger.records().unwrap().iter().map(|r| r.action).collect();
    let count = |action: AuditAction| actions.iter().filter(|a| **a == action).count();
    assert_eq!(count(AuditAction::ReviewSessionStarted), 2);
    assert_eq!(count(AuditAction::ReviewDecisionRecorded), 3);
    assert_eq!(count(AuditAction::ReviewSessionEnded), 1);
}

#[test]
fn test_skipped_items_stay_pending_for_next_session() {
    let temp_dir = TempDir::new().unwrap();
    let log_path = temp_dir.path().join("decisions.jsonl");
    let messages = stream(10);
    let items = flagged_items(&messages);
    let ledger = Arc::new(AuditLedger::ephemeral());

    let log = DecisionLog::open(&log_path, 500).unwrap();
    let mut session = ReviewSession::start(log, items.clone(), Arc::clone(&ledger)).unwrap();
    while session.next_item().is_some() {
        session.submit(ReviewInput::parse("s", "").unwrap()).unwrap();
    }
    assert!(session.is_finished());
    let summary = session.finish().unwrap();
    assert_eq!(summary.pending, 5);

    let log = DecisionLog::open(&log_path, 500).unwrap();
    assert_eq!(log.load_pending(&items).unwrap().len(), 5);
}
