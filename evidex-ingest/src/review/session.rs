//! Review session state machine
//!
//! Per item: `Pending → Presented → Decided(Confirmed | Dismissed)`.
//! A decision is appended to the decision log before the item counts as
//! decided and before the next item can be presented. `Skip` and `Quit`
//! return the presented item to `Pending`; `Quit` also ends the session.

use super::DecisionLog;
use crate::ledger::{metadata, AuditAction, AuditLedger};
use crate::models::{Decision, MessageId, ReviewDecision, ReviewItem, ReviewSummary};
use evidex_common::{Error, Result};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Pending,
    Presented,
    Decided(Decision),
}

/// Reviewer input for the presented item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewInput {
    Confirm { notes: String },
    Dismiss { notes: String },
    /// Leave undecided and move on
    Skip,
    /// Leave undecided and end the session
    Quit,
}

impl ReviewInput {
    /// Map a keystroke: y/n/s/q (case-insensitive)
    pub fn parse(input: &str, notes: impl Into<String>) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => Some(ReviewInput::Confirm { notes: notes.into() }),
            "n" | "no" => Some(ReviewInput::Dismiss { notes: notes.into() }),
            "s" | "skip" => Some(ReviewInput::Skip),
            "q" | "quit" => Some(ReviewInput::Quit),
            _ => None,
        }
    }
}

pub struct ReviewSession {
    log: DecisionLog,
    ledger: Arc<AuditLedger>,
    /// Every item under review, decided ones included
    all_items: Vec<ReviewItem>,
    /// Undecided items at session start, in original order
    queue: Vec<ReviewItem>,
    states: Vec<ItemState>,
    cursor: usize,
    presented: Option<usize>,
    quit: bool,
}

impl ReviewSession {
    /// Resume review: items already decided in the log are not queued again
    pub fn start(log: DecisionLog, all_items: Vec<ReviewItem>, ledger: Arc<AuditLedger>) -> Result<Self> {
        let queue = log.load_pending(&all_items)?;
        ledger.record(
            AuditAction::ReviewSessionStarted,
            format!("Review session started with {} pending item(s)", queue.len()),
            metadata([
                ("decision_log", json!(log.path().display().to_string())),
                ("total", json!(all_items.len())),
                ("pending", json!(queue.len())),
            ]),
        )?;
        info!(total = all_items.len(), pending = queue.len(), "Review session started");

        let states = vec![ItemState::Pending; queue.len()];
        Ok(Self {
            log,
            ledger,
            all_items,
            queue,
            states,
            cursor: 0,
            presented: None,
            quit: false,
        })
    }

    /// Present the next pending item (Pending → Presented)
    ///
    /// Returns the currently presented item again if it has no input yet.
    pub fn next_item(&mut self) -> Option<&ReviewItem> {
        if self.quit {
            return None;
        }
        if let Some(index) = self.presented {
            return self.queue.get(index);
        }
        while self.cursor < self.queue.len() {
            let index = self.cursor;
            self.cursor += 1;
            if self.states[index] == ItemState::Pending {
                self.states[index] = ItemState::Presented;
                self.presented = Some(index);
                debug!(item_id = %self.queue[index].item_id, "Item presented");
                return self.queue.get(index);
            }
        }
        None
    }

    /// Apply reviewer input to the presented item
    ///
    /// Confirm/Dismiss persist the decision first; if persisting fails the
    /// item stays `Presented` and the error is returned.
    pub fn submit(&mut self, input: ReviewInput) -> Result<Option<Decision>> {
        let index = self
            .presented
            .ok_or_else(|| Error::Internal("no item is being presented".to_string()))?;
        let item_id = self.queue[index].item_id.clone();

        let (decision, notes) = match input {
            ReviewInput::Confirm { notes } => (Decision::Confirmed, notes),
            ReviewInput::Dismiss { notes } => (Decision::Dismissed, notes),
            ReviewInput::Skip => {
                self.states[index] = ItemState::Pending;
                self.presented = None;
                debug!(item_id = %item_id, "Item skipped");
                return Ok(None);
            }
            ReviewInput::Quit => {
                self.states[index] = ItemState::Pending;
                self.presented = None;
                self.quit = true;
                info!(item_id = %item_id, "Review quit, item left pending");
                return Ok(None);
            }
        };

        let record = ReviewDecision::new(item_id.clone(), decision, notes);
        self.log.append_decision(&record)?;
        self.states[index] = ItemState::Decided(decision);
        self.presented = None;

        self.ledger.record(
            AuditAction::ReviewDecisionRecorded,
            format!("Review decision for {}", item_id),
            metadata([
                ("item_id", json!(item_id.as_str())),
                ("item_type", json!(self.queue[index].item_type)),
                ("decision", json!(decision)),
            ]),
        )?;
        Ok(Some(decision))
    }

    pub fn state(&self, item_id: &MessageId) -> Option<ItemState> {
        self.queue
            .iter()
            .position(|item| &item.item_id == item_id)
            .map(|index| self.states[index])
    }

    /// True once every queued item has had its turn or the reviewer quit
    pub fn is_finished(&self) -> bool {
        self.quit || (self.presented.is_none() && self.cursor >= self.queue.len())
    }

    /// Counts over all items, read from the durable log
    pub fn summary(&self) -> Result<ReviewSummary> {
        self.log.summary(&self.all_items)
    }

    /// End the session; presented-but-undecided items stay pending
    pub fn finish(self) -> Result<ReviewSummary> {
        let summary = self.summary()?;
        self.ledger.record(
            AuditAction::ReviewSessionEnded,
            format!(
                "Review session ended: {} confirmed, {} dismissed, {} pending",
                summary.confirmed, summary.dismissed, summary.pending
            ),
            metadata([
                ("total", json!(summary.total)),
                ("confirmed", json!(summary.confirmed)),
                ("dismissed", json!(summary.dismissed)),
                ("pending", json!(summary.pending)),
                ("quit", json!(self.quit)),
            ]),
        )?;
        info!(
            confirmed = summary.confirmed,
            dismissed = summary.dismissed,
            pending = summary.pending,
            "Review session ended"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn items(n: usize) -> Vec<ReviewItem> {
        (1..=n)
            .map(|i| ReviewItem {
                item_id: MessageId::from(format!("item-{}", i).as_str()),
                item_type: "threat".to_string(),
                context: Vec::new(),
            })
            .collect()
    }

    fn session(temp_dir: &TempDir, all: Vec<ReviewItem>) -> ReviewSession {
        let log = DecisionLog::open(temp_dir.path().join("decisions.jsonl"), 1000).unwrap();
        ReviewSession::start(log, all, Arc::new(AuditLedger::ephemeral())).unwrap()
    }

    #[test]
    fn test_parse_input() {
        assert_eq!(
            ReviewInput::parse("Y", "note"),
            Some(ReviewInput::Confirm { notes: "note".to_string() })
        );
        assert_eq!(ReviewInput::parse(" s ", ""), Some(ReviewInput::Skip));
        assert_eq!(ReviewInput::parse("q", ""), Some(ReviewInput::Quit));
        assert_eq!(ReviewInput::parse("maybe", ""), None);
    }

    #[test]
    fn test_transitions() {
        let temp_dir = TempDir::new().unwrap();
        let all = items(3);
        let mut s = session(&temp_dir, all.clone());

        assert_eq!(s.state(&all[0].item_id), Some(ItemState::Pending));
        assert_eq!(s.next_item().unwrap().item_id, all[0].item_id);
        assert_eq!(s.state(&all[0].item_id), Some(ItemState::Presented));

        let decided = s.submit(ReviewInput::Dismiss { notes: String::new() }).unwrap();
        assert_eq!(decided, Some(Decision::Dismissed));
        assert_eq!(s.state(&all[0].item_id), Some(ItemState::Decided(Decision::Dismissed)));

        assert_eq!(s.next_item().unwrap().item_id, all[1].item_id);
        assert_eq!(s.submit(ReviewInput::Skip).unwrap(), None);
        assert_eq!(s.state(&all[1].item_id), Some(ItemState::Pending));

        assert_eq!(s.next_item().unwrap().item_id, all[2].item_id);
        s.submit(ReviewInput::Quit).unwrap();
        assert!(s.is_finished());
        assert!(s.next_item().is_none());

        let summary = s.finish().unwrap();
        assert_eq!(summary.dismissed, 1);
        assert_eq!(summary.pending, 2);
    }

    #[test]
    fn test_submit_without_presented_item_fails() {
        let temp_dir = TempDir::new().unwrap();
        let mut s = session(&temp_dir, items(1));
        assert!(s.submit(ReviewInput::Skip).is_err());
    }

    #[test]
    fn test_quit_item_is_pending_next_session() {
        let temp_dir = TempDir::new().unwrap();
        let all = items(2);
        {
            let mut s = session(&temp_dir, all.clone());
            s.next_item();
            s.submit(ReviewInput::Confirm { notes: "clear threat".to_string() }).unwrap();
            s.next_item();
            s.submit(ReviewInput::Quit).unwrap();
        }

        let mut resumed = session(&temp_dir, all.clone());
        assert_eq!(resumed.next_item().unwrap().item_id, all[1].item_id);
        assert!(resumed.state(&all[0].item_id).is_none());
    }
}
