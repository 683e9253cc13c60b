//! Message-database adapter
//!
//! Reads a chat store (`message` joined to `handle`). The database and any
//! `-wal`/`-shm` journal files are registered, copied into a temporary
//! working directory, checked against their registered digests, and the copy
//! is opened read-only. Rows committed only to the write-ahead log are read;
//! the originals are never opened by SQLite.
//! Rows whose `text` column is empty fall back to the binary
//! `attributedBody` column; a body that fails to decode still produces a
//! message, with empty content and `decode_failed` set.

use super::keyed_archive::decode_body;
use super::{locator, DecodeError, ExtractContext, SourceAdapter, SourceEvent};
use crate::models::{CanonicalMessage, RawReference, ResolvedIdentity};
use evidex_common::{time, Error, Result, SourceKind};
use futures::stream::{BoxStream, TryStreamExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{ConnectOptions, Connection, Row};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// File name looked up when the configured location is a directory
pub const DEFAULT_DB_NAME: &str = "chat.db";

/// Tapbacks and other reactions
const REACTION_TYPES: RangeInclusive<i64> = 2000..=3999;

/// Journal files SQLite keeps next to a database in WAL mode
const COMPANION_SUFFIXES: [&str; 2] = ["-wal", "-shm"];

const MESSAGE_QUERY: &str = r#"
    SELECT
        m.ROWID AS rowid,
        m.text AS text,
        m.attributedBody AS attributed_body,
        COALESCE(m.is_from_me, 0) AS is_from_me,
        COALESCE(m.date, 0) AS date,
        m.service AS service,
        COALESCE(m.associated_message_type, 0) AS associated_message_type,
        COALESCE(m.item_type, 0) AS item_type,
        h.id AS handle
    FROM message m
    LEFT JOIN handle h ON m.handle_id = h.ROWID
    ORDER BY m.ROWID
"#;

pub struct MessageDbAdapter {
    location: PathBuf,
}

/// One `message` row before identity resolution
#[derive(Debug)]
struct MessageRow {
    rowid: i64,
    text: Option<String>,
    attributed_body: Option<Vec<u8>>,
    is_from_me: bool,
    date: i64,
    service: Option<String>,
    associated_message_type: i64,
    item_type: i64,
    handle: Option<String>,
}

impl MessageRow {
    fn from_row(row: &SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(Self {
            rowid: row.try_get("rowid")?,
            text: row.try_get("text")?,
            attributed_body: row.try_get("attributed_body")?,
            is_from_me: row.try_get::<i64, _>("is_from_me")? != 0,
            date: row.try_get("date")?,
            service: row.try_get("service")?,
            associated_message_type: row.try_get("associated_message_type")?,
            item_type: row.try_get("item_type")?,
            handle: row.try_get("handle")?,
        })
    }

    fn is_reaction_or_system(&self) -> bool {
        REACTION_TYPES.contains(&self.associated_message_type) || self.item_type != 0
    }
}

impl MessageDbAdapter {
    pub fn new(location: impl Into<PathBuf>) -> Self {
        Self {
            location: location.into(),
        }
    }

    fn database_path(&self) -> PathBuf {
        if self.location.is_dir() {
            self.location.join(DEFAULT_DB_NAME)
        } else {
            self.location.clone()
        }
    }

    /// Turn one row into an event
    fn convert(&self, db_path: &Path, row: MessageRow, ctx: &ExtractContext) -> SourceEvent {
        let locator = locator(db_path, db_path, row.rowid);

        if row.is_reaction_or_system() {
            return SourceEvent::Skipped {
                locator,
                reason: format!(
                    "associated_message_type={} item_type={}",
                    row.associated_message_type, row.item_type
                ),
            };
        }

        let Some(timestamp) = time::from_apple_epoch(row.date) else {
            return SourceEvent::Rejected {
                locator,
                error: DecodeError::UnparseableTimestamp(format!("date={}", row.date)),
            };
        };

        let mut raw = RawReference::new(locator);
        raw.service = row.service;

        let content = match row.text.filter(|t| !t.is_empty()) {
            Some(text) => text,
            None => match row.attributed_body.filter(|b| !b.is_empty()) {
                Some(body) => match decode_body(&body) {
                    Ok(text) => text,
                    Err(e) => {
                        debug!(locator = %raw.locator, error = %e, "Body decode failed");
                        raw.decode_failed = true;
                        raw.decode_error = Some(e.to_string());
                        String::new()
                    }
                },
                None => String::new(),
            },
        };

        let counterpart = match row.handle.as_deref() {
            Some(handle) => ctx.resolver.resolve(handle),
            None => ResolvedIdentity::Unmapped(String::new()),
        };
        let me = ctx.resolver.self_identity();
        let (sender, recipient) = if row.is_from_me {
            (me, counterpart)
        } else {
            (counterpart, me)
        };

        SourceEvent::Message(CanonicalMessage::new(
            SourceKind::MessageDb,
            timestamp,
            sender,
            recipient,
            content,
            raw,
        ))
    }
}

/// `chat.db` -> `chat.db-wal`
fn companion_path(db_path: &Path, suffix: &str) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Emitted when inputs were hashed into the ledger but no row was read
fn not_read(db_path: &Path) -> SourceEvent {
    SourceEvent::Diagnostic(format!(
        "{} was hashed and registered as an input but no rows were read",
        db_path.display()
    ))
}

impl SourceAdapter for MessageDbAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::MessageDb
    }

    fn location(&self) -> &Path {
        &self.location
    }

    fn extract<'a>(&'a self, ctx: &'a ExtractContext) -> BoxStream<'a, Result<SourceEvent>> {
        Box::pin(async_stream::try_stream! {
            let db_path = self.database_path();
            // "" is the database itself
            let suffixes: Vec<&str> = std::iter::once("")
                .chain(
                    COMPANION_SUFFIXES
                        .into_iter()
                        .filter(|suffix| companion_path(&db_path, suffix).exists()),
                )
                .collect();

            for (index, suffix) in suffixes.iter().enumerate() {
                match ctx.ledger.register_source(&companion_path(&db_path, suffix)) {
                    Ok(_) => {}
                    Err(Error::SourceUnavailable { reason, .. }) => {
                        if index > 0 {
                            // Reading without the journal would silently drop committed rows
                            yield not_read(&db_path);
                        }
                        yield SourceEvent::Unavailable { reason };
                        return;
                    }
                    Err(e) => Err::<(), Error>(e)?,
                }
            }

            let workdir = match tempfile::Builder::new().prefix("evidex-msgdb-").tempdir() {
                Ok(dir) => dir,
                Err(e) => {
                    yield not_read(&db_path);
                    yield SourceEvent::Unavailable { reason: format!("cannot create working copy: {}", e) };
                    return;
                }
            };
            let file_name = db_path
                .file_name()
                .map(|name| name.to_os_string())
                .unwrap_or_else(|| DEFAULT_DB_NAME.into());
            let copy_path = workdir.path().join(file_name);

            for suffix in &suffixes {
                let input = companion_path(&db_path, suffix);
                let target = companion_path(&copy_path, suffix);
                if let Err(e) = tokio::fs::copy(&input, &target).await {
                    yield not_read(&db_path);
                    yield SourceEvent::Unavailable {
                        reason: format!("cannot copy {}: {}", input.display(), e),
                    };
                    return;
                }
                ctx.ledger.verify_copy(&input, &target)?;
            }
            debug!(
                path = %db_path.display(),
                copy = %copy_path.display(),
                files = suffixes.len(),
                "Working copy verified"
            );

            let options = SqliteConnectOptions::new()
                .filename(&copy_path)
                .read_only(true);
            let mut conn = match options.connect().await {
                Ok(conn) => conn,
                Err(e) => {
                    yield not_read(&db_path);
                    yield SourceEvent::Unavailable { reason: format!("cannot open database: {}", e) };
                    return;
                }
            };
            info!(path = %db_path.display(), journal_files = suffixes.len() - 1, "Message database opened from working copy");

            let mut rows = sqlx::query(MESSAGE_QUERY).fetch(&mut conn);
            let mut seen = 0usize;
            loop {
                let row = match rows.try_next().await {
                    Ok(Some(row)) => row,
                    Ok(None) => break,
                    Err(e) if seen == 0 => {
                        warn!(path = %db_path.display(), error = %e, "Message query failed");
                        yield not_read(&db_path);
                        yield SourceEvent::Unavailable { reason: format!("message query failed: {}", e) };
                        return;
                    }
                    Err(e) => {
                        warn!(path = %db_path.display(), error = %e, rows = seen, "Message read interrupted");
                        yield SourceEvent::Diagnostic(format!("read interrupted after {} rows: {}", seen, e));
                        break;
                    }
                };
                seen += 1;

                match MessageRow::from_row(&row) {
                    Ok(parsed) => yield self.convert(&db_path, parsed, ctx),
                    Err(e) => {
                        let rowid: i64 = row.try_get("rowid").unwrap_or(-1);
                        yield SourceEvent::Rejected {
                            locator: locator(&db_path, &db_path, rowid),
                            error: DecodeError::Malformed(e.to_string()),
                        };
                    }
                }
            }
            drop(rows);
            if let Err(e) = conn.close().await {
                debug!(error = %e, "Closing working copy failed");
            }
            debug!(path = %db_path.display(), rows = seen, "Message rows read");
        })
    }
}
