//! Review queue construction

use crate::models::{CanonicalMessage, MessageId, ReviewItem};
use std::collections::HashMap;
use tracing::warn;

/// Build review items for flagged messages, in flag order
///
/// Each item carries the ids of up to `window` messages before and after
/// it in the canonical stream, itself included. A flagged id absent from
/// the stream gets a context of just itself.
pub fn build_review_queue(
    flagged: &[(MessageId, String)],
    stream: &[CanonicalMessage],
    window: usize,
) -> Vec<ReviewItem> {
    let positions: HashMap<&MessageId, usize> = stream
        .iter()
        .enumerate()
        .map(|(i, m)| (&m.id, i))
        .collect();

    flagged
        .iter()
        .map(|(item_id, item_type)| {
            let context = match positions.get(item_id) {
                Some(&pos) => {
                    let start = pos.saturating_sub(window);
                    let end = (pos + window + 1).min(stream.len());
                    stream[start..end].iter().map(|m| m.id.clone()).collect()
                }
                None => {
                    warn!(item_id = %item_id, "Flagged message not in canonical stream");
                    vec![item_id.clone()]
                }
            };
            ReviewItem {
                item_id: item_id.clone(),
                item_type: item_type.clone(),
                context,
            }
        })
        .collect()
}
