//! Append-only review decision log
//!
//! One `ReviewDecision` per line, fsynced before `append_decision` returns.
//! State is always recomputed by replaying the file, so what a session
//! considers decided can never drift from what is durable.

use crate::models::{Decision, MessageId, ReviewDecision, ReviewItem, ReviewSummary};
use evidex_common::retry::retry_on_lock;
use evidex_common::{Error, Result};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

pub struct DecisionLog {
    path: PathBuf,
    max_lock_wait_ms: u64,
    writer: Mutex<File>,
}

/// Parsed log content
struct Replay {
    decisions: Vec<ReviewDecision>,
    /// Byte length of the valid prefix, through its last newline
    valid_len: u64,
    /// A partial final line was found and ignored
    torn_tail: bool,
}

fn replay_bytes(path: &Path, bytes: &[u8]) -> Result<Replay> {
    let mut decisions = Vec::new();
    let mut offset = 0usize;
    let mut valid_len = 0usize;
    let mut torn_tail = false;

    let mut lines = bytes.split_inclusive(|&b| b == b'\n').peekable();
    let mut line_no = 0usize;
    while let Some(line) = lines.next() {
        line_no += 1;
        offset += line.len();
        let is_last = lines.peek().is_none();
        let body = line.strip_suffix(b"\n").unwrap_or(line);
        let body = body.strip_suffix(b"\r").unwrap_or(body);

        if body.iter().all(|b| b.is_ascii_whitespace()) {
            valid_len = offset;
            continue;
        }
        match serde_json::from_slice::<ReviewDecision>(body) {
            Ok(decision) if line.ends_with(b"\n") => {
                decisions.push(decision);
                valid_len = offset;
            }
            // Complete record but the newline never made it to disk
            Ok(decision) => {
                decisions.push(decision);
                valid_len = offset;
                torn_tail = true;
            }
            Err(e) if is_last => {
                warn!(
                    path = %path.display(),
                    line = line_no,
                    error = %e,
                    "Ignoring torn final line in decision log"
                );
                torn_tail = true;
            }
            Err(e) => {
                return Err(Error::Persistence(format!(
                    "decision log {} corrupt at line {}: {}",
                    path.display(),
                    line_no,
                    e
                )))
            }
        }
    }

    Ok(Replay {
        decisions,
        valid_len: valid_len as u64,
        torn_tail,
    })
}

impl DecisionLog {
    /// Open (creating if needed) the log at `path`
    ///
    /// A torn final line left by a crash mid-append is cut off so the next
    /// append starts on a clean line. Corruption anywhere else is fatal.
    pub fn open(path: impl Into<PathBuf>, max_lock_wait_ms: u64) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let existing = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(Error::Persistence(format!("{}: {}", path.display(), e))),
        };
        let replay = replay_bytes(&path, &existing)?;

        let mut writer = retry_on_lock("open decision log", max_lock_wait_ms, || {
            OpenOptions::new().create(true).append(true).open(&path)
        })?;

        if replay.torn_tail {
            let keep_partial_record = replay.valid_len == existing.len() as u64;
            retry_on_lock("repair decision log", max_lock_wait_ms, || {
                if keep_partial_record {
                    writer.write_all(b"\n")?;
                } else {
                    writer.set_len(replay.valid_len)?;
                }
                writer.sync_all()
            })?;
            info!(path = %path.display(), valid_bytes = replay.valid_len, "Decision log tail repaired");
        }

        debug!(path = %path.display(), decisions = replay.decisions.len(), "Decision log opened");
        Ok(Self {
            path,
            max_lock_wait_ms,
            writer: Mutex::new(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every durable decision, in append order
    pub fn replay(&self) -> Result<Vec<ReviewDecision>> {
        let bytes = std::fs::read(&self.path)
            .map_err(|e| Error::Persistence(format!("{}: {}", self.path.display(), e)))?;
        Ok(replay_bytes(&self.path, &bytes)?.decisions)
    }

    /// Decided items and their verdicts
    pub fn decided(&self) -> Result<BTreeMap<MessageId, Decision>> {
        Ok(self
            .replay()?
            .into_iter()
            .map(|d| (d.item_id, d.decision))
            .collect())
    }

    /// Durably append one decision
    ///
    /// Returns only after the record is on disk. An item that already has a
    /// decision is rejected.
    pub fn append_decision(&self, decision: &ReviewDecision) -> Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| Error::Persistence("decision log mutex poisoned".to_string()))?;

        if self.decided()?.contains_key(&decision.item_id) {
            return Err(Error::Internal(format!(
                "item {} already has a recorded decision",
                decision.item_id
            )));
        }

        let mut line = serde_json::to_vec(decision)?;
        line.push(b'\n');
        retry_on_lock("append review decision", self.max_lock_wait_ms, || {
            writer.write_all(&line)?;
            writer.flush()?;
            writer.sync_data()
        })?;
        debug!(item_id = %decision.item_id, decision = ?decision.decision, "Decision persisted");
        Ok(())
    }

    /// `all_items` minus decided items, in original order
    pub fn load_pending(&self, all_items: &[ReviewItem]) -> Result<Vec<ReviewItem>> {
        let decided = self.decided()?;
        Ok(all_items
            .iter()
            .filter(|item| !decided.contains_key(&item.item_id))
            .cloned()
            .collect())
    }

    /// Confirmed/dismissed/pending counts over `all_items`
    pub fn summary(&self, all_items: &[ReviewItem]) -> Result<ReviewSummary> {
        let decided = self.decided()?;
        let mut summary = ReviewSummary {
            total: all_items.len(),
            ..ReviewSummary::default()
        };
        for item in all_items {
            match decided.get(&item.item_id) {
                Some(Decision::Confirmed) => summary.confirmed += 1,
                Some(Decision::Dismissed) => summary.dismissed += 1,
                None => summary.pending += 1,
            }
        }
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

    #[test]
    fn test_duplicate_decision_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let log = DecisionLog::open(temp_dir.path().join("decisions.jsonl"), 1000).unwrap();
        let id = MessageId::from("item-1");

        log.append_decision(&ReviewDecision::new(id.clone(), Decision::Confirmed, ""))
            .unwrap();
        let err = log
            .append_decision(&ReviewDecision::new(id, Decision::Dismissed, ""))
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert_eq!(log.replay().unwrap().len(), 1);
    }

    #[test]
    fn test_torn_tail_is_ignored_and_repaired() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("decisions.jsonl");
        let all = items(3);
        {
            let log = DecisionLog::open(&path, 1000).unwrap();
            log.append_decision(&ReviewDecision::new(
                all[0].item_id.clone(),
                Decision::Confirmed,
                "",
            ))
            .unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"item_id":"item-2","decis"#).unwrap();
        drop(file);

        let log = DecisionLog::open(&path, 1000).unwrap();
        let pending = log.load_pending(&all).unwrap();
        assert_eq!(pending.len(), 2);

        log.append_decision(&ReviewDecision::new(
            all[1].item_id.clone(),
            Decision::Dismissed,
            "",
        ))
        .unwrap();
        let reopened = DecisionLog::open(&path, 1000).unwrap();
        assert_eq!(reopened.replay().unwrap().len(), 2);
    }

    #[test]
    fn test_interior_corruption_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("decisions.jsonl");
        std::fs::write(&path, "not json\n{}\n").unwrap();
        let err = DecisionLog::open(&path, 1000).err().unwrap();
        assert!(matches!(err, Error::Persistence(_)));
    }

    #[test]
    fn test_summary_counts() {
        let temp_dir = TempDir::new().unwrap();
        let log = DecisionLog::open(temp_dir.path().join("d.jsonl"), 1000).unwrap();
        let all = items(4);
        log.append_decision(&ReviewDecision::new(all[0].item_id.clone(), Decision::Confirmed, ""))
            .unwrap();
        log.append_decision(&ReviewDecision::new(all[2].item_id.clone(), Decision::Dismissed, ""))
            .unwrap();

        let summary = log.summary(&all).unwrap();
        assert_eq!(
            summary,
            ReviewSummary {
                total: 4,
                confirmed: 1,
                dismissed: 1,
                pending: 2
            }
        );
    }
}
