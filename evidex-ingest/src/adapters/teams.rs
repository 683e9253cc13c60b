//! Teams personal-export adapter
//!
//! The export is a tar holding `messages.json`:
//!
//! ```json
//! { "userId": "8:live:alex",
//!   "conversations": [
//!     { "id": "19:...", "displayName": "Jordan",
//!       "threadProperties": { "membercount": "2" },
//!       "MessageList": [
//!         { "id": "1001", "from": "8:live:alex", "displayName": null,
//!           "messagetype": "RichText/Html", "content": "<p>hi</p>",
//!           "originalarrivaltime": "2024-01-15T10:00:00.000Z" } ] } ] }
//! ```
//!
//! The location may be the tar, a directory of tars, or an already unpacked
//! directory. Messages whose `from` is the export's `userId` are sent by
//! self; every other message is received by self. Only text message types
//! are surfaced; calls, membership events and the like are skipped.

use super::archive::{self, ensure_extracted};
use super::{html, locator, DecodeError, ExtractContext, SourceAdapter, SourceEvent};
use crate::models::{CanonicalMessage, RawReference, ResolvedIdentity};
use chrono::{DateTime, Utc};
use evidex_common::config::ArchiveLimits;
use evidex_common::{Error, Result, SourceKind};
use futures::stream::BoxStream;
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub const MESSAGES_FILE: &str = "messages.json";

/// Message types carrying user-written text
const CONTENT_TYPES: [&str; 4] = ["Text", "RichText", "RichText/Html", "RichText/UriObject"];

/// Member count assumed when the export omits it
const DEFAULT_MEMBER_COUNT: u64 = 2;

#[derive(Debug, Deserialize)]
struct Export {
    #[serde(rename = "userId", default)]
    user_id: String,
    #[serde(default)]
    conversations: Vec<Conversation>,
}

#[derive(Debug, Deserialize)]
struct Conversation {
    #[serde(default)]
    id: String,
    #[serde(rename = "displayName", default)]
    display_name: Option<String>,
    #[serde(rename = "threadProperties", default)]
    thread_properties: Option<ThreadProperties>,
    /// Kept raw so one malformed message does not sink the file
    #[serde(rename = "MessageList", default)]
    message_list: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct ThreadProperties {
    /// A string in most exports, occasionally a number
    #[serde(default)]
    membercount: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct TeamsMessage {
    #[serde(default)]
    id: Value,
    #[serde(rename = "displayName", default)]
    display_name: Option<String>,
    #[serde(default)]
    originalarrivaltime: Option<String>,
    #[serde(default)]
    messagetype: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    from: Option<String>,
}

impl Conversation {
    fn member_count(&self) -> u64 {
        let count = self
            .thread_properties
            .as_ref()
            .and_then(|p| p.membercount.as_ref())
            .and_then(|v| match v {
                Value::Number(n) => n.as_u64(),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            });
        count.unwrap_or(DEFAULT_MEMBER_COUNT)
    }
}

/// Per-conversation facts shared by its messages
struct Thread<'c> {
    id: &'c str,
    one_to_one: bool,
    /// The other member of a one-to-one conversation, when known
    other: Option<ResolvedIdentity>,
}

pub struct TeamsAdapter {
    location: PathBuf,
    limits: ArchiveLimits,
}

impl TeamsAdapter {
    pub fn new(location: impl Into<PathBuf>, limits: ArchiveLimits) -> Self {
        Self {
            location: location.into(),
            limits,
        }
    }

    /// `messages.json` files to read, with the root their locators are
    /// relative to
    fn export_files(&self, ctx: &ExtractContext) -> Result<(PathBuf, Vec<PathBuf>, Vec<String>)> {
        let mut notes = Vec::new();

        let root = if archive::is_archive(&self.location) {
            ensure_extracted(&self.location, &self.limits, &ctx.ledger)?.workdir
        } else if self.location.is_dir() {
            for found in archive::discover(&self.location) {
                match ensure_extracted(&found, &self.limits, &ctx.ledger) {
                    Ok(_) => {}
                    Err(Error::SourceUnavailable { path, reason }) => {
                        warn!(archive = %path.display(), reason = %reason, "Archive skipped");
                        notes.push(format!("archive {} skipped: {}", path.display(), reason));
                    }
                    Err(e) => return Err(e),
                }
            }
            self.location.clone()
        } else {
            return Ok((self.location.clone(), vec![self.location.clone()], notes));
        };

        let files = WalkDir::new(&root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && e.file_name() == MESSAGES_FILE)
            .map(|e| e.into_path())
            .collect();
        Ok((root, files, notes))
    }

    fn thread<'c>(&self, conv: &'c Conversation, user_id: &str, ctx: &ExtractContext) -> Thread<'c> {
        let one_to_one = conv.member_count() == DEFAULT_MEMBER_COUNT;
        let other = one_to_one
            .then(|| {
                conv.message_list
                    .iter()
                    .filter_map(|v| serde_json::from_value::<TeamsMessage>(v.clone()).ok())
                    .filter(|m| m.from.as_deref() != Some(user_id))
                    .find_map(|m| m.display_name.filter(|n| !n.trim().is_empty()))
                    .or_else(|| conv.display_name.clone().filter(|n| !n.trim().is_empty()))
                    .map(|name| ctx.resolver.resolve(&name))
            })
            .flatten();
        Thread {
            id: &conv.id,
            one_to_one,
            other,
        }
    }

    fn convert(
        &self,
        root: &Path,
        file: &Path,
        thread: &Thread<'_>,
        user_id: &str,
        value: &Value,
        ctx: &ExtractContext,
    ) -> SourceEvent {
        let message: TeamsMessage = match serde_json::from_value(value.clone()) {
            Ok(message) => message,
            Err(e) => {
                return SourceEvent::Rejected {
                    locator: locator(root, file, format!("{}/?", thread.id)),
                    error: DecodeError::Malformed(e.to_string()),
                }
            }
        };
        let msg_id = match &message.id {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        let locator = locator(root, file, format!("{}/{}", thread.id, msg_id));

        let kind = message.messagetype.as_deref().unwrap_or_default();
        if !CONTENT_TYPES.contains(&kind) {
            return SourceEvent::Skipped {
                locator,
                reason: format!("messagetype {}", if kind.is_empty() { "missing" } else { kind }),
            };
        }

        let raw_content = message.content.as_deref().unwrap_or_default();
        let content = if kind.starts_with("RichText") {
            html::to_text(raw_content)
        } else {
            raw_content.trim().to_string()
        };
        if content.is_empty() {
            return SourceEvent::Skipped {
                locator,
                reason: "empty content".to_string(),
            };
        }

        let Some(timestamp) = message
            .originalarrivaltime
            .as_deref()
            .and_then(|t| DateTime::parse_from_rfc3339(t.trim()).ok())
            .map(|t| t.with_timezone(&Utc))
        else {
            return SourceEvent::Rejected {
                locator,
                error: DecodeError::UnparseableTimestamp(format!(
                    "originalarrivaltime={}",
                    message.originalarrivaltime.as_deref().unwrap_or("missing")
                )),
            };
        };

        let me = ctx.resolver.self_identity();
        let unknown = || ResolvedIdentity::Unmapped(String::new());
        let from_self = !user_id.is_empty() && message.from.as_deref() == Some(user_id);
        let (sender, recipient) = if from_self {
            (me, thread.other.clone().unwrap_or_else(unknown))
        } else {
            let sender = match message.display_name.as_deref().filter(|n| !n.trim().is_empty()) {
                Some(name) => ctx.resolver.resolve(name),
                None if thread.one_to_one => thread.other.clone().unwrap_or_else(unknown),
                None => unknown(),
            };
            (sender, me)
        };

        let mut raw = RawReference::new(locator);
        raw.service = Some(kind.to_string());
        SourceEvent::Message(CanonicalMessage::new(
            SourceKind::Teams,
            timestamp,
            sender,
            recipient,
            content,
            raw,
        ))
    }
}

impl SourceAdapter for TeamsAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Teams
    }

    fn location(&self) -> &Path {
        &self.location
    }

    fn extract<'a>(&'a self, ctx: &'a ExtractContext) -> BoxStream<'a, Result<SourceEvent>> {
        Box::pin(async_stream::try_stream! {
            if !self.location.exists() {
                yield SourceEvent::Unavailable {
                    reason: format!("{} does not exist", self.location.display()),
                };
                return;
            }

            let (root, files, notes) = match self.export_files(ctx) {
                Ok(found) => found,
                Err(Error::SourceUnavailable { reason, .. }) => {
                    yield SourceEvent::Unavailable { reason };
                    return;
                }
                Err(e) => {
                    Err::<(), Error>(e)?;
                    return;
                }
            };
            for note in notes {
                yield SourceEvent::Diagnostic(note);
            }
            if files.is_empty() {
                yield SourceEvent::Unavailable {
                    reason: format!("no {} under {}", MESSAGES_FILE, self.location.display()),
                };
                return;
            }
            info!(location = %self.location.display(), files = files.len(), "Reading Teams exports");

            for file in files {
                match ctx.ledger.register_source(&file) {
                    Ok(_) => {}
                    Err(Error::SourceUnavailable { reason, .. }) => {
                        yield SourceEvent::Diagnostic(format!("{} unreadable: {}", file.display(), reason));
                        continue;
                    }
                    Err(e) => Err::<(), Error>(e)?,
                }
                let bytes = match tokio::fs::read(&file).await {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        yield SourceEvent::Diagnostic(format!("{} unreadable: {}", file.display(), e));
                        continue;
                    }
                };
                let export: Export = match serde_json::from_slice(&bytes) {
                    Ok(export) => export,
                    Err(e) => {
                        warn!(file = %file.display(), error = %e, "Teams export unparseable");
                        yield SourceEvent::Diagnostic(format!("{} is not a Teams export: {}", file.display(), e));
                        continue;
                    }
                };
                debug!(
                    file = %file.display(),
                    conversations = export.conversations.len(),
                    "Teams export parsed"
                );

                for conv in &export.conversations {
                    let thread = self.thread(conv, &export.user_id, ctx);
                    for value in &conv.message_list {
                        yield self.convert(&root, &file, &thread, &export.user_id, value, ctx);
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn conversation(membercount: Value) -> Conversation {
        serde_json::from_value(json!({
            "id": "19:c1@thread.skype",
            "threadProperties": { "membercount": membercount },
            "MessageList": []
        }))
        .unwrap()
    }

    #[test]
    fn test_member_count_accepts_string_or_number() {
        assert_eq!(conversation(json!("5")).member_count(), 5);
        assert_eq!(conversation(json!(3)).member_count(), 3);
        assert_eq!(conversation(json!(null)).member_count(), DEFAULT_MEMBER_COUNT);
    }

    #[test]
    fn test_missing_fields_default() {
        let export: Export = serde_json::from_str(r#"{"conversations":[{"id":"x"}]}"#).unwrap();
        assert!(export.user_id.is_empty());
        assert!(export.conversations[0].message_list.is_empty());
        assert!(export.conversations[0].display_name.is_none());
    }
}
