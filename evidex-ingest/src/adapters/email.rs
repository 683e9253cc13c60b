//! Email adapter
//!
//! Reads RFC 5322 messages from `.eml` files and `.mbox` mailboxes. The
//! location may be one such file or a directory searched recursively in
//! file-name order. Each message becomes one canonical message: the first
//! `From` address is the sender and the `To` list supplies the recipient
//! (self whenever self is listed). The body is the first `text/plain` part
//! outside attachments, falling back to `text/html` reduced to text.

use super::{html, locator, DecodeError, ExtractContext, SourceAdapter, SourceEvent};
use crate::models::{CanonicalMessage, RawReference, ResolvedIdentity};
use chrono::{TimeZone, Utc};
use evidex_common::{Error, Result, SourceKind};
use futures::stream::BoxStream;
use mailparse::{DispositionType, MailAddr, MailHeaderMap, ParsedMail, SingleInfo};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Container {
    /// One message per file
    Eml,
    /// `From `-separated messages
    Mbox,
}

impl Container {
    fn of(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?;
        if ext.eq_ignore_ascii_case("eml") {
            Some(Container::Eml)
        } else if ext.eq_ignore_ascii_case("mbox") {
            Some(Container::Mbox)
        } else {
            None
        }
    }
}

pub struct EmailAdapter {
    location: PathBuf,
}

impl EmailAdapter {
    pub fn new(location: impl Into<PathBuf>) -> Self {
        Self {
            location: location.into(),
        }
    }

    fn mail_files(&self) -> Vec<PathBuf> {
        if !self.location.is_dir() {
            return vec![self.location.clone()];
        }
        WalkDir::new(&self.location)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| Container::of(p).is_some())
            .collect()
    }

    fn convert(&self, locator: String, raw: &[u8], ctx: &ExtractContext) -> SourceEvent {
        let mail = match mailparse::parse_mail(raw) {
            Ok(mail) => mail,
            Err(e) => {
                return SourceEvent::Rejected {
                    locator,
                    error: DecodeError::Malformed(e.to_string()),
                }
            }
        };

        let timestamp = match mail.headers.get_first_value("Date") {
            Some(value) => match mailparse::dateparse(&value)
                .ok()
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            {
                Some(timestamp) => timestamp,
                None => {
                    return SourceEvent::Rejected {
                        locator,
                        error: DecodeError::UnparseableTimestamp(format!("Date: {}", value)),
                    }
                }
            },
            None => {
                return SourceEvent::Rejected {
                    locator,
                    error: DecodeError::MissingKey("Date header".to_string()),
                }
            }
        };

        let sender = match mail.headers.get_first_value("From") {
            Some(value) => match addresses(&value).first() {
                Some(info) => resolve_address(info, ctx),
                None => ResolvedIdentity::Unmapped(value.trim().to_string()),
            },
            None => ResolvedIdentity::Unmapped(String::new()),
        };

        let recipients: Vec<ResolvedIdentity> = mail
            .headers
            .get_first_value("To")
            .map(|value| addresses(&value).iter().map(|info| resolve_address(info, ctx)).collect())
            .unwrap_or_default();
        let recipient = recipients
            .iter()
            .find(|r| ctx.resolver.is_self(r))
            .or_else(|| recipients.first())
            .cloned()
            .unwrap_or_else(|| ResolvedIdentity::Unmapped(String::new()));

        let mut raw_ref = RawReference::new(locator);
        raw_ref.subject = mail
            .headers
            .get_first_value("Subject")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let body = match find_part(&mail, "text/plain") {
            Some(part) => part.get_body().map(|text| text.trim().to_string()),
            None => match find_part(&mail, "text/html") {
                Some(part) => part.get_body().map(|markup| html::to_text(&markup)),
                None => Ok(String::new()),
            },
        };
        let content = match body {
            Ok(text) => text,
            Err(e) => {
                debug!(locator = %raw_ref.locator, error = %e, "Mail body decode failed");
                raw_ref.decode_failed = true;
                raw_ref.decode_error = Some(e.to_string());
                String::new()
            }
        };

        SourceEvent::Message(CanonicalMessage::new(
            SourceKind::Email,
            timestamp,
            sender,
            recipient,
            content,
            raw_ref,
        ))
    }
}

/// Every mailbox in an address header, groups flattened
fn addresses(value: &str) -> Vec<SingleInfo> {
    let Ok(list) = mailparse::addrparse(value) else {
        return Vec::new();
    };
    list.iter()
        .flat_map(|addr| match addr {
            MailAddr::Single(info) => vec![info.clone()],
            MailAddr::Group(group) => group.addrs.clone(),
        })
        .collect()
}

/// Address first, then display name; unmatched keeps the address
fn resolve_address(info: &SingleInfo, ctx: &ExtractContext) -> ResolvedIdentity {
    let by_addr = ctx.resolver.resolve(&info.addr);
    if matches!(by_addr, ResolvedIdentity::Person(_)) {
        return by_addr;
    }
    if let Some(name) = info.display_name.as_deref().filter(|n| !n.trim().is_empty()) {
        let by_name = ctx.resolver.resolve(name);
        if matches!(by_name, ResolvedIdentity::Person(_)) {
            return by_name;
        }
        if info.addr.trim().is_empty() {
            return by_name;
        }
    }
    by_addr
}

/// First leaf part of `mimetype` that is not an attachment
fn find_part<'a, 'b>(mail: &'b ParsedMail<'a>, mimetype: &str) -> Option<&'b ParsedMail<'a>> {
    if matches!(mail.get_content_disposition().disposition, DispositionType::Attachment) {
        return None;
    }
    if mail.subparts.is_empty() {
        return mail.ctype.mimetype.eq_ignore_ascii_case(mimetype).then_some(mail);
    }
    mail.subparts.iter().find_map(|part| find_part(part, mimetype))
}

/// Split a mailbox at `From ` lines that open a message
///
/// A separator only counts at the start of the file or after a blank line.
/// Quoted `>From ` body lines lose one `>`.
pub(crate) fn split_mbox(bytes: &[u8]) -> Vec<Vec<u8>> {
    let mut messages = Vec::new();
    let mut current: Option<Vec<u8>> = None;
    let mut after_blank = true;

    for line in bytes.split_inclusive(|b| *b == b'\n') {
        if after_blank && line.starts_with(b"From ") {
            messages.extend(current.take());
            current = Some(Vec::new());
        } else if let Some(message) = current.as_mut() {
            let quoted = line.iter().take_while(|b| **b == b'>').count();
            if quoted > 0 && line[quoted..].starts_with(b"From ") {
                message.extend_from_slice(&line[1..]);
            } else {
                message.extend_from_slice(line);
            }
        }
        after_blank = line.iter().all(|b| b.is_ascii_whitespace());
    }
    messages.extend(current);
    messages
}

impl SourceAdapter for EmailAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Email
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
            let files = self.mail_files();
            if files.is_empty() {
                yield SourceEvent::Unavailable {
                    reason: format!("no .eml or .mbox files under {}", self.location.display()),
                };
                return;
            }
            info!(location = %self.location.display(), files = files.len(), "Reading mail files");

            let root = &self.location;
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

                match Container::of(&file) {
                    Some(Container::Mbox) => {
                        let messages = split_mbox(&bytes);
                        if messages.is_empty() {
                            yield SourceEvent::Diagnostic(format!(
                                "{}: no `From ` separator, not a mailbox",
                                file.display()
                            ));
                        }
                        debug!(file = %file.display(), messages = messages.len(), "Mailbox split");
                        for (index, raw) in messages.iter().enumerate() {
                            yield self.convert(locator(root, &file, index + 1), raw, ctx);
                        }
                    }
                    _ => yield self.convert(locator(root, &file, 1), &bytes, ctx),
                }
            }
        })
    }
}
