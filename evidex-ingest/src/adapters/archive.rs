//! Archive auto-extraction
//!
//! A zip or tar found at a source location is unpacked once into the
//! sibling working directory `<archive file name>.extracted`, together with
//! an extraction manifest holding the archive digest and per-entry digests.
//! A later run with an unchanged archive reuses the directory after
//! re-hashing every entry; a changed archive, or a directory whose files no
//! longer match the manifest, is replaced. The archive itself is only ever
//! read.
//!
//! Entries are screened the same way as any untrusted bundle: paths must
//! stay inside the working directory, only regular files are written, and
//! file count, sizes and compression ratio are bounded.

use crate::ledger::{hash_bytes, metadata, write_atomic, AuditAction, AuditLedger};
use evidex_common::config::ArchiveLimits;
use evidex_common::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;
use zip::ZipArchive;

pub const WORKDIR_SUFFIX: &str = ".extracted";
pub const MANIFEST_NAME: &str = ".extraction-manifest.json";
const MANIFEST_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedEntry {
    /// Path relative to the working directory, `/`-separated
    pub path: String,
    pub sha256: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    PathTraversal,
    MaxFiles,
    TooLarge,
    MaxTotalSize,
    CompressionRatio,
    /// Links, devices and other non-regular tar entries
    NotRegularFile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedEntry {
    pub path: String,
    pub reason: RejectionReason,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionManifest {
    pub schema_version: u32,
    pub archive: String,
    pub archive_sha256: String,
    pub archive_size: u64,
    pub entries: Vec<ExtractedEntry>,
    pub rejected: Vec<RejectedEntry>,
    pub limits: ArchiveLimits,
}

#[derive(Debug, Clone)]
pub struct ExtractedArchive {
    pub archive: PathBuf,
    pub workdir: PathBuf,
    pub manifest: ExtractionManifest,
    /// True when an earlier extraction was reused
    pub reused: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    Tar,
}

impl ArchiveFormat {
    /// Format by file extension
    pub fn of(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?;
        if ext.eq_ignore_ascii_case("zip") {
            Some(ArchiveFormat::Zip)
        } else if ext.eq_ignore_ascii_case("tar") {
            Some(ArchiveFormat::Tar)
        } else {
            None
        }
    }
}

pub fn is_archive(path: &Path) -> bool {
    path.is_file() && ArchiveFormat::of(path).is_some()
}

/// Sibling working directory for an archive
pub fn workdir_for(archive: &Path) -> PathBuf {
    let mut name = archive.file_name().unwrap_or_default().to_os_string();
    name.push(WORKDIR_SUFFIX);
    archive.with_file_name(name)
}

/// Archives below `root`, sorted, ignoring existing working directories
pub fn discover(root: &Path) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !e.file_name().to_string_lossy().ends_with(WORKDIR_SUFFIX))
        .filter_map(|e| e.ok())
        .map(|e| e.into_path())
        .filter(|p| is_archive(p))
        .collect();
    found.sort();
    found
}

fn unavailable(archive: &Path, reason: impl std::fmt::Display) -> Error {
    Error::SourceUnavailable {
        path: archive.to_path_buf(),
        reason: reason.to_string(),
    }
}

fn load_manifest(path: &Path) -> Option<ExtractionManifest> {
    let bytes = fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Extract `archive` unless an up-to-date extraction already exists
///
/// Unreadable or oversized archives are `SourceUnavailable`; ledger
/// failures are fatal.
pub fn ensure_extracted(
    archive: &Path,
    limits: &ArchiveLimits,
    ledger: &AuditLedger,
) -> Result<ExtractedArchive> {
    let digest = ledger.register_source(archive)?;
    let workdir = workdir_for(archive);
    let manifest_path = workdir.join(MANIFEST_NAME);

    if let Some(manifest) = load_manifest(&manifest_path) {
        if manifest.archive_sha256 == digest.sha256 {
            let drift = workdir_drift(&workdir, &manifest);
            if drift.is_empty() {
                ledger.record(
                    AuditAction::ArchiveExtractionSkipped,
                    format!("Reused extraction of {}", archive.display()),
                    metadata([
                        ("archive", json!(archive.display().to_string())),
                        ("sha256", json!(digest.sha256)),
                        ("workdir", json!(workdir.display().to_string())),
                        ("entries_verified", json!(manifest.entries.len())),
                    ]),
                )?;
                info!(archive = %archive.display(), "Archive already extracted, reusing");
                return Ok(ExtractedArchive {
                    archive: archive.to_path_buf(),
                    workdir,
                    manifest,
                    reused: true,
                });
            }

            warn!(
                workdir = %workdir.display(),
                files = drift.len(),
                "Extracted files differ from manifest, re-extracting"
            );
            ledger.record(
                AuditAction::ArchiveWorkdirReplaced,
                format!("Extraction of {} no longer matched its manifest", archive.display()),
                metadata([
                    ("archive", json!(archive.display().to_string())),
                    ("sha256", json!(digest.sha256)),
                    ("workdir", json!(workdir.display().to_string())),
                    ("paths", json!(drift)),
                ]),
            )?;
        }
    }

    if workdir.exists() {
        warn!(workdir = %workdir.display(), "Stale extraction directory, replacing");
        fs::remove_dir_all(&workdir).map_err(|e| unavailable(archive, e))?;
    }

    let mut staging_name = workdir.file_name().unwrap_or_default().to_os_string();
    staging_name.push(".partial");
    let staging = workdir.with_file_name(staging_name);
    if staging.exists() {
        fs::remove_dir_all(&staging).map_err(|e| unavailable(archive, e))?;
    }
    fs::create_dir_all(&staging).map_err(|e| unavailable(archive, e))?;

    let extracted = match ArchiveFormat::of(archive) {
        Some(ArchiveFormat::Tar) => extract_tar(archive, &staging, limits),
        _ => extract_zip(archive, &staging, limits),
    };
    let (entries, rejected) = match extracted {
        Ok(result) => result,
        Err(e) => {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }
    };

    let manifest = ExtractionManifest {
        schema_version: MANIFEST_SCHEMA_VERSION,
        archive: archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        archive_sha256: digest.sha256.clone(),
        archive_size: digest.size,
        entries,
        rejected,
        limits: limits.clone(),
    };
    write_atomic(
        &staging.join(MANIFEST_NAME),
        &serde_json::to_vec_pretty(&manifest)?,
        ledger.max_lock_wait_ms(),
    )?;
    fs::rename(&staging, &workdir).map_err(|e| unavailable(archive, e))?;

    for entry in &manifest.rejected {
        warn!(archive = %archive.display(), entry = %entry.path, reason = ?entry.reason, "Archive entry rejected");
    }
    ledger.record(
        AuditAction::ArchiveExtracted,
        format!("Extracted {}", archive.display()),
        metadata([
            ("archive", json!(archive.display().to_string())),
            ("sha256", json!(digest.sha256)),
            ("workdir", json!(workdir.display().to_string())),
            ("entries", json!(manifest.entries.len())),
            ("rejected", json!(manifest.rejected.len())),
        ]),
    )?;
    info!(
        archive = %archive.display(),
        entries = manifest.entries.len(),
        rejected = manifest.rejected.len(),
        "Archive extracted"
    );

    Ok(ExtractedArchive {
        archive: archive.to_path_buf(),
        workdir,
        manifest,
        reused: false,
    })
}

/// Files below `workdir` that do not match `manifest`: altered or missing
/// entries and files the extraction never wrote
fn workdir_drift(workdir: &Path, manifest: &ExtractionManifest) -> Vec<String> {
    let mut drift = Vec::new();
    for entry in &manifest.entries {
        match fs::read(workdir.join(&entry.path)) {
            Ok(bytes) if hash_bytes(&bytes) == entry.sha256 => {}
            _ => drift.push(entry.path.clone()),
        }
    }

    let listed: BTreeSet<&str> = manifest.entries.iter().map(|e| e.path.as_str()).collect();
    for file in WalkDir::new(workdir)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| !e.file_type().is_dir())
    {
        let Ok(rel) = file.path().strip_prefix(workdir) else {
            continue;
        };
        let rel = rel.to_string_lossy().replace('\\', "/");
        if rel != MANIFEST_NAME && !listed.contains(rel.as_str()) {
            drift.push(rel);
        }
    }

    drift.sort();
    drift
}

/// Relative path of an entry, or `None` when it would leave the directory
fn enclosed(raw: &Path) -> Option<PathBuf> {
    let mut rel = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => rel.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!rel.as_os_str().is_empty()).then_some(rel)
}

/// Limit accounting shared by every archive format
struct Screen<'a> {
    archive: &'a Path,
    dest: &'a Path,
    limits: &'a ArchiveLimits,
    entries: Vec<ExtractedEntry>,
    rejected: Vec<RejectedEntry>,
    total_bytes: u64,
}

impl<'a> Screen<'a> {
    fn new(archive: &'a Path, dest: &'a Path, limits: &'a ArchiveLimits) -> Self {
        Self {
            archive,
            dest,
            limits,
            entries: Vec::new(),
            rejected: Vec::new(),
            total_bytes: 0,
        }
    }

    /// Entry counts and declared sizes, checked before anything is written
    fn prescan(&self, files: u64, declared_total: u64) -> Result<()> {
        if files > self.limits.max_files {
            return Err(unavailable(
                self.archive,
                format!("too many entries: {} > {}", files, self.limits.max_files),
            ));
        }
        if declared_total > self.limits.max_total_bytes {
            return Err(unavailable(
                self.archive,
                format!(
                    "total uncompressed size {} exceeds limit {}",
                    declared_total, self.limits.max_total_bytes
                ),
            ));
        }
        Ok(())
    }

    fn reject(&mut self, path: impl Into<String>, reason: RejectionReason, message: String) {
        self.rejected.push(RejectedEntry {
            path: path.into(),
            reason,
            message,
        });
    }

    fn directory(&self, rel_path: &Path) -> Result<()> {
        fs::create_dir_all(self.dest.join(rel_path)).map_err(|e| unavailable(self.archive, e))
    }

    /// Write one regular file if it stays within the limits
    fn admit(
        &mut self,
        rel_path: &Path,
        declared: u64,
        compressed: Option<u64>,
        reader: impl Read,
    ) -> Result<()> {
        let rel_name = rel_path.to_string_lossy().replace('\\', "/");
        let limits = self.limits;

        if self.entries.len() as u64 >= limits.max_files {
            self.reject(rel_name, RejectionReason::MaxFiles, format!("limit of {} files reached", limits.max_files));
            return Ok(());
        }
        if declared > limits.max_single_file_bytes {
            self.reject(
                rel_name,
                RejectionReason::TooLarge,
                format!("{} bytes exceeds limit {}", declared, limits.max_single_file_bytes),
            );
            return Ok(());
        }
        if let Some(compressed) = compressed.filter(|c| *c > 0) {
            let ratio = declared as f64 / compressed as f64;
            if ratio > limits.max_compression_ratio {
                self.reject(
                    rel_name,
                    RejectionReason::CompressionRatio,
                    format!("ratio {:.1} exceeds limit {}", ratio, limits.max_compression_ratio),
                );
                return Ok(());
            }
        }

        // Declared sizes can lie; never read past the single-file limit
        let mut content = Vec::new();
        reader
            .take(limits.max_single_file_bytes.saturating_add(1))
            .read_to_end(&mut content)
            .map_err(|e| unavailable(self.archive, e))?;
        let size = content.len() as u64;
        if size > limits.max_single_file_bytes {
            self.reject(
                rel_name,
                RejectionReason::TooLarge,
                format!("inflated past limit {}", limits.max_single_file_bytes),
            );
            return Ok(());
        }
        if self.total_bytes + size > limits.max_total_bytes {
            self.reject(
                rel_name,
                RejectionReason::MaxTotalSize,
                format!("total size would exceed {}", limits.max_total_bytes),
            );
            return Ok(());
        }

        let target = self.dest.join(rel_path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| unavailable(self.archive, e))?;
        }
        fs::write(&target, &content).map_err(|e| unavailable(self.archive, e))?;

        self.total_bytes += size;
        self.entries.push(ExtractedEntry {
            path: rel_name,
            sha256: hash_bytes(&content),
            size,
        });
        Ok(())
    }

    fn finish(mut self) -> (Vec<ExtractedEntry>, Vec<RejectedEntry>) {
        self.entries.sort_by(|a, b| a.path.cmp(&b.path));
        (self.entries, self.rejected)
    }
}

fn extract_zip(
    archive: &Path,
    dest: &Path,
    limits: &ArchiveLimits,
) -> Result<(Vec<ExtractedEntry>, Vec<RejectedEntry>)> {
    let file = File::open(archive).map_err(|e| unavailable(archive, e))?;
    let mut zip = ZipArchive::new(file).map_err(|e| unavailable(archive, e))?;
    let mut screen = Screen::new(archive, dest, limits);

    // Pre-scan from the central directory
    let mut declared_total = 0u64;
    for i in 0..zip.len() {
        let entry = zip.by_index_raw(i).map_err(|e| unavailable(archive, e))?;
        declared_total = declared_total.saturating_add(entry.size());
    }
    screen.prescan(zip.len() as u64, declared_total)?;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(|e| unavailable(archive, e))?;
        let Some(rel_path) = entry.enclosed_name().map(|p| p.to_path_buf()) else {
            screen.reject(
                entry.name(),
                RejectionReason::PathTraversal,
                "entry path escapes the extraction directory".to_string(),
            );
            continue;
        };
        if entry.is_dir() {
            screen.directory(&rel_path)?;
            continue;
        }
        let (declared, compressed) = (entry.size(), entry.compressed_size());
        screen.admit(&rel_path, declared, Some(compressed), &mut entry)?;
    }

    Ok(screen.finish())
}

/// Tar has no central directory and no compression: headers are read in a
/// first pass for the pre-scan, then the archive is streamed again
fn extract_tar(
    archive: &Path,
    dest: &Path,
    limits: &ArchiveLimits,
) -> Result<(Vec<ExtractedEntry>, Vec<RejectedEntry>)> {
    let open = || -> Result<tar::Archive<File>> {
        File::open(archive)
            .map(tar::Archive::new)
            .map_err(|e| unavailable(archive, e))
    };
    let mut screen = Screen::new(archive, dest, limits);

    let (mut files, mut declared_total) = (0u64, 0u64);
    let mut headers = open()?;
    for entry in headers.entries().map_err(|e| unavailable(archive, e))? {
        let entry = entry.map_err(|e| unavailable(archive, e))?;
        if entry.header().entry_type().is_file() {
            files += 1;
            declared_total = declared_total.saturating_add(entry.size());
        }
    }
    screen.prescan(files, declared_total)?;

    let mut tar = open()?;
    for entry in tar.entries().map_err(|e| unavailable(archive, e))? {
        let mut entry = entry.map_err(|e| unavailable(archive, e))?;
        let raw_path = entry
            .path()
            .map_err(|e| unavailable(archive, e))?
            .into_owned();
        let raw_name = raw_path.to_string_lossy().replace('\\', "/");
        let Some(rel_path) = enclosed(&raw_path) else {
            screen.reject(
                raw_name,
                RejectionReason::PathTraversal,
                "entry path escapes the extraction directory".to_string(),
            );
            continue;
        };

        let kind = entry.header().entry_type();
        if kind.is_dir() {
            screen.directory(&rel_path)?;
        } else if kind.is_file() {
            let declared = entry.size();
            screen.admit(&rel_path, declared, None, &mut entry)?;
        } else {
            screen.reject(
                raw_name,
                RejectionReason::NotRegularFile,
                format!("entry type {:?} is not extracted", kind),
            );
        }
    }

    Ok(screen.finish())
}
