//! Review item and decision records

use crate::models::MessageId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A flagged message awaiting human review
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewItem {
    pub item_id: MessageId,
    /// Why the item was flagged (e.g. "threat", "pattern")
    pub item_type: String,
    /// Adjacent canonical message ids, in stream order, item included
    pub context: Vec<MessageId>,
}

/// Reviewer verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Confirmed,
    Dismissed,
}

/// One durable decision-log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewDecision {
    pub item_id: MessageId,
    pub decision: Decision,
    #[serde(default)]
    pub notes: String,
    pub timestamp: DateTime<Utc>,
}

impl ReviewDecision {
    pub fn new(item_id: MessageId, decision: Decision, notes: impl Into<String>) -> Self {
        Self {
            item_id,
            decision,
            notes: notes.into(),
            timestamp: evidex_common::time::now(),
        }
    }
}

/// Counts over a set of review items
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewSummary {
    pub total: usize,
    pub confirmed: usize,
    pub dismissed: usize,
    pub pending: usize,
}
