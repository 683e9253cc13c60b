//! Line-export adapter
//!
//! Parses chat export text files (one message header per line, optional
//! continuation lines). The location may be a single `.txt` file, a zip
//! archive, or a directory holding either; archives are extracted first.

use super::archive::{self, ensure_extracted};
use super::templates::{match_line, LineMatch};
use super::{locator, DecodeError, ExtractContext, SourceAdapter, SourceEvent};
use crate::models::{CanonicalMessage, RawReference, ResolvedIdentity};
use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use evidex_common::config::{ArchiveLimits, LineExportConfig};
use evidex_common::{Error, Result, SourceKind};
use futures::stream::BoxStream;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const EXPORT_EXTENSION: &str = "txt";
const CHAT_WITH_PREFIXES: [&str; 2] = ["WhatsApp Chat with ", "WhatsApp Chat - "];

pub struct LineExportAdapter {
    location: PathBuf,
    config: LineExportConfig,
    limits: ArchiveLimits,
}

/// A parsed message header plus its continuation lines
#[derive(Debug)]
struct Entry {
    line_no: usize,
    timestamp: NaiveDateTime,
    author: String,
    content: String,
}

#[derive(Debug)]
enum Item {
    Entry(Entry),
    Event(SourceEvent),
}

impl LineExportAdapter {
    pub fn new(location: impl Into<PathBuf>, config: LineExportConfig, limits: ArchiveLimits) -> Self {
        Self {
            location: location.into(),
            config,
            limits,
        }
    }

    /// Export files to parse, with the root their locators are relative to
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
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| {
                p.extension()
                    .map_or(false, |ext| ext.eq_ignore_ascii_case(EXPORT_EXTENSION))
            })
            .collect();
        Ok((root, files, notes))
    }

    fn is_self_author(&self, author: &str, ctx: &ExtractContext) -> bool {
        self.config
            .self_markers
            .iter()
            .any(|m| m.eq_ignore_ascii_case(author.trim()))
            || ctx.resolver.is_self(&ctx.resolver.resolve(author))
    }

    fn to_utc(&self, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
        let offset = Duration::minutes(self.config.utc_offset_minutes as i64);
        naive
            .checked_sub_signed(offset)
            .map(|utc| Utc.from_utc_datetime(&utc))
    }

    /// Parse one file into entries and events, in line order
    fn parse(&self, root: &Path, file: &Path, text: &str) -> Vec<Item> {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let mut items = Vec::new();
        let mut current: Option<Entry> = None;

        for (idx, raw_line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw_line.replace(['\u{200e}', '\u{200f}'], "");

            match match_line(&line) {
                LineMatch::Header { timestamp, rest, .. } => {
                    items.extend(current.take().map(Item::Entry));
                    match split_author(rest) {
                        Some((author, content)) => {
                            current = Some(Entry {
                                line_no,
                                timestamp,
                                author: author.to_string(),
                                content: content.to_string(),
                            })
                        }
                        None => items.push(Item::Event(SourceEvent::Skipped {
                            locator: locator(root, file, line_no),
                            reason: "system notice".to_string(),
                        })),
                    }
                }
                LineMatch::BadTimestamp { template, .. } => {
                    items.extend(current.take().map(Item::Entry));
                    items.push(Item::Event(SourceEvent::Rejected {
                        locator: locator(root, file, line_no),
                        error: DecodeError::UnparseableTimestamp(format!(
                            "{} (shaped like {})",
                            line, template
                        )),
                    }));
                }
                LineMatch::NoMatch => match current.as_mut() {
                    Some(entry) => {
                        entry.content.push('\n');
                        entry.content.push_str(&line);
                    }
                    None if line.trim().is_empty() => {}
                    None => {
                        let loc = locator(root, file, line_no);
                        if line_no == 1 {
                            warn!(locator = %loc, "First line matches no timestamp template, skipping");
                        }
                        items.push(Item::Event(SourceEvent::Diagnostic(format!(
                            "{}: unparseable line skipped",
                            loc
                        ))));
                    }
                },
            }
        }
        items.extend(current.take().map(Item::Entry));
        items
    }

    /// Counterpart of the exporter for this file
    fn counterpart(&self, file: &Path, items: &[Item], ctx: &ExtractContext) -> ResolvedIdentity {
        let stem = file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        for prefix in CHAT_WITH_PREFIXES {
            if let Some(name) = stem.strip_prefix(prefix) {
                if !name.trim().is_empty() {
                    return ctx.resolver.resolve(name);
                }
            }
        }

        items
            .iter()
            .find_map(|item| match item {
                Item::Entry(e) if !self.is_self_author(&e.author, ctx) => {
                    Some(ctx.resolver.resolve(&e.author))
                }
                _ => None,
            })
            .unwrap_or_else(|| ResolvedIdentity::Unmapped(String::new()))
    }

    fn convert(
        &self,
        root: &Path,
        file: &Path,
        entry: Entry,
        counterpart: &ResolvedIdentity,
        ctx: &ExtractContext,
    ) -> SourceEvent {
        let locator = locator(root, file, entry.line_no);
        let Some(timestamp) = self.to_utc(entry.timestamp) else {
            return SourceEvent::Rejected {
                locator,
                error: DecodeError::UnparseableTimestamp(format!(
                    "{} out of range at offset {} minutes",
                    entry.timestamp, self.config.utc_offset_minutes
                )),
            };
        };

        let me = ctx.resolver.self_identity();
        let (sender, recipient) = if self.is_self_author(&entry.author, ctx) {
            (me, counterpart.clone())
        } else {
            (ctx.resolver.resolve(&entry.author), me)
        };

        let content = without_trailing_blank_lines(entry.content);
        SourceEvent::Message(CanonicalMessage::new(
            SourceKind::LineExport,
            timestamp,
            sender,
            recipient,
            content,
            RawReference::new(locator),
        ))
    }
}

/// Drop blank continuation lines after the last text line. The author's
/// own characters, trailing spaces included, are kept.
fn without_trailing_blank_lines(mut content: String) -> String {
    while let Some(pos) = content.rfind('\n') {
        if !content[pos + 1..].trim().is_empty() {
            break;
        }
        content.truncate(pos);
    }
    content
}

/// `Name: body` → (name, body); None for system notices
fn split_author(rest: &str) -> Option<(&str, &str)> {
    let (author, content) = match rest.split_once(": ") {
        Some(pair) => pair,
        None => (rest.strip_suffix(':')?, ""),
    };
    let author = author.trim();
    if author.is_empty() {
        None
    } else {
        Some((author, content))
    }
}

impl SourceAdapter for LineExportAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::LineExport
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
                    reason: format!("no .{} export files under {}", EXPORT_EXTENSION, self.location.display()),
                };
                return;
            }
            info!(location = %self.location.display(), files = files.len(), "Parsing chat exports");

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
                let text = match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(e) => {
                        yield SourceEvent::Diagnostic(format!("{} is not valid UTF-8, decoded lossily", file.display()));
                        String::from_utf8_lossy(e.as_bytes()).into_owned()
                    }
                };

                let items = self.parse(&root, &file, &text);
                let counterpart = self.counterpart(&file, &items, ctx);
                debug!(file = %file.display(), items = items.len(), counterpart = %counterpart.label(), "Export parsed");

                for item in items {
                    match item {
                        Item::Entry(entry) => yield self.convert(&root, &file, entry, &counterpart, ctx),
                        Item::Event(event) => yield event,
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_author() {
        assert_eq!(split_author("Jordan: hi"), Some(("Jordan", "hi")));
        assert_eq!(split_author("Jordan: re: plans"), Some(("Jordan", "re: plans")));
        assert_eq!(split_author("Jordan:"), Some(("Jordan", "")));
        assert_eq!(split_author("Jordan created group \"Trip\""), None);
    }

    #[test]
    fn test_trailing_spaces_kept_blank_lines_dropped() {
        assert_eq!(without_trailing_blank_lines("ok  ".to_string()), "ok  ");
        assert_eq!(without_trailing_blank_lines("ok  \n\n  ".to_string()), "ok  ");
        assert_eq!(
            without_trailing_blank_lines("one\n two \n".to_string()),
            "one\n two "
        );
        assert_eq!(without_trailing_blank_lines("\n".to_string()), "");
    }
}
