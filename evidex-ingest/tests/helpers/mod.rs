//! Shared fixtures for evidex-ingest integration tests

#![allow(dead_code)]

use evidex_common::{IngestConfig, SourceConfig, SourceKind};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::ConnectOptions;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Apple-epoch seconds for 2022-03-08T14:12:34Z
pub const APPLE_DATE_2022_03_08: i64 = 668_441_554;

pub const SELF_NAME: &str = "Alex";

/// Alex (self) and Jordan, with Jordan's number configured in E.164 form
pub fn base_config() -> IngestConfig {
    let mut config = IngestConfig::new(SELF_NAME);
    config.person_identifiers.insert(
        SELF_NAME.to_string(),
        vec!["alex@example.com".to_string(), "You".to_string()],
    );
    config
        .person_identifiers
        .insert("Jordan".to_string(), vec!["+12065551234".to_string()]);
    config
}

pub fn with_source(mut config: IngestConfig, kind: SourceKind, location: &Path) -> IngestConfig {
    config.sources.push(SourceConfig {
        kind,
        location: location.to_path_buf(),
    });
    config
}

// ============================================================================
// Message database fixtures
// ============================================================================

#[derive(Debug, Clone)]
pub struct DbRow {
    pub rowid: i64,
    pub text: Option<String>,
    pub body: Option<Vec<u8>>,
    pub handle_id: Option<i64>,
    pub is_from_me: bool,
    pub date: i64,
    pub associated_message_type: i64,
    pub item_type: i64,
}

impl DbRow {
    pub fn text(rowid: i64, handle_id: i64, date: i64, text: &str) -> Self {
        Self {
            rowid,
            text: Some(text.to_string()),
            body: None,
            handle_id: Some(handle_id),
            is_from_me: false,
            date,
            associated_message_type: 0,
            item_type: 0,
        }
    }

    pub fn body(rowid: i64, handle_id: i64, date: i64, body: Vec<u8>) -> Self {
        Self {
            text: None,
            body: Some(body),
            ..Self::text(rowid, handle_id, date, "")
        }
    }

    pub fn from_me(mut self) -> Self {
        self.is_from_me = true;
        self
    }

    pub fn reaction(mut self) -> Self {
        self.associated_message_type = 2000;
        self
    }
}

/// Create a chat store with `handle` and `message` tables
pub async fn create_chat_db(path: &Path, handles: &[(i64, &str)], rows: &[DbRow]) {
    let mut conn = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .connect()
        .await
        .unwrap();

    sqlx::query("CREATE TABLE handle (ROWID INTEGER PRIMARY KEY, id TEXT NOT NULL)")
        .execute(&mut conn)
        .await
        .unwrap();
    sqlx::query(
        "CREATE TABLE message (
            ROWID INTEGER PRIMARY KEY,
            text TEXT,
            attributedBody BLOB,
            handle_id INTEGER,
            is_from_me INTEGER DEFAULT 0,
            date INTEGER,
            service TEXT,
            associated_message_type INTEGER DEFAULT 0,
            item_type INTEGER DEFAULT 0
        )",
    )
    .execute(&mut conn)
    .await
    .unwrap();

    for (rowid, id) in handles {
        sqlx::query("INSERT INTO handle (ROWID, id) VALUES (?, ?)")
            .bind(*rowid)
            .bind(*id)
            .execute(&mut conn)
            .await
            .unwrap();
    }
    for row in rows {
        sqlx::query(
            "INSERT INTO message
                (ROWID, text, attributedBody, handle_id, is_from_me, date, service,
                 associated_message_type, item_type)
             VALUES (?, ?, ?, ?, ?, ?, 'iMessage', ?, ?)",
        )
        .bind(row.rowid)
        .bind(row.text.clone())
        .bind(row.body.clone())
        .bind(row.handle_id)
        .bind(row.is_from_me as i64)
        .bind(row.date)
        .bind(row.associated_message_type)
        .bind(row.item_type)
        .execute(&mut conn)
        .await
        .unwrap();
    }

    sqlx::Connection::close(conn).await.unwrap();
}

// ============================================================================
// Keyed-archive fixtures
// ============================================================================

fn push_len(out: &mut Vec<u8>, kind: u8, len: usize) {
    if len < 15 {
        out.push(kind << 4 | len as u8);
    } else {
        out.push(kind << 4 | 0x0f);
        out.push(0x11);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    }
}

enum Obj<'a> {
    Str(&'a str),
    Int(i64),
    Uid(u8),
    Array(Vec<u8>),
    Dict(Vec<(u8, u8)>),
}

/// NSKeyedArchiver bplist whose root attributed string holds `text`
pub fn keyed_archive(text: &str) -> Vec<u8> {
    use Obj::*;
    let objects = [
        Dict(vec![(1, 2), (3, 4), (5, 6), (7, 8)]),
        Str("$archiver"),
        Str("NSKeyedArchiver"),
        Str("$version"),
        Int(100_000),
        Str("$top"),
        Dict(vec![(9, 10)]),
        Str("$objects"),
        Array(vec![11, 12, 13]),
        Str("root"),
        Uid(1),
        Str("$null"),
        Dict(vec![(14, 15)]),
        Dict(vec![(16, 17)]),
        Str("NSString"),
        Uid(2),
        Str("NS.string"),
        Str(text),
    ];

    let mut out = b"bplist00".to_vec();
    let mut offsets = Vec::new();
    for obj in &objects {
        offsets.push(out.len() as u32);
        match obj {
            Str(s) => {
                push_len(&mut out, 0x5, s.len());
                out.extend_from_slice(s.as_bytes());
            }
            Int(n) => {
                out.push(0x13);
                out.extend_from_slice(&n.to_be_bytes());
            }
            Uid(u) => out.extend_from_slice(&[0x80, *u]),
            Array(refs) => {
                push_len(&mut out, 0xA, refs.len());
                out.extend_from_slice(refs);
            }
            Dict(pairs) => {
                push_len(&mut out, 0xD, pairs.len());
                out.extend(pairs.iter().map(|p| p.0));
                out.extend(pairs.iter().map(|p| p.1));
            }
        }
    }
    let table_offset = out.len() as u64;
    for off in offsets {
        out.extend_from_slice(&off.to_be_bytes());
    }
    out.extend_from_slice(&[0, 0, 0, 0, 0, 0, 4, 1]);
    out.extend_from_slice(&(objects.len() as u64).to_be_bytes());
    out.extend_from_slice(&0u64.to_be_bytes());
    out.extend_from_slice(&table_offset.to_be_bytes());
    out
}

// ============================================================================
// File fixtures
// ============================================================================

pub fn write_zip(path: &Path, files: &[(&str, &str)]) {
    let mut writer = zip::ZipWriter::new(File::create(path).unwrap());
    for (name, content) in files {
        writer
            .start_file(*name, zip::write::FileOptions::default())
            .unwrap();
        writer.write_all(content.as_bytes()).unwrap();
    }
    writer.finish().unwrap();
}

pub fn write_tar(path: &Path, files: &[(&str, &str)]) {
    let mut builder = tar::Builder::new(File::create(path).unwrap());
    for (name, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, name, content.as_bytes())
            .unwrap();
    }
    builder.finish().unwrap();
}

pub fn write_text(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}
