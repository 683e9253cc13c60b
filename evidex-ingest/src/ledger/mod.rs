//! Hashing & audit ledger
//!
//! Sole writer of audit records. Every `record` is appended to the durable
//! JSONL audit log and fsynced before its sequence number is handed back; a
//! write that cannot be made durable within the retry budget is a fatal
//! `Persistence` error. The ledger is shared by reference (`Arc`) across
//! adapters; appends are serialized behind one mutex.

pub mod custody;
pub mod hashing;
pub mod manifest;
pub mod record;

pub use custody::{ChainOfCustody, SessionMetadata, LEGAL_NOTICE};
pub use hashing::{hash_bytes, hash_content, hash_file, FileDigest};
pub use manifest::{FileRole, ManifestEntry, RunManifest};
pub use record::{metadata, AuditAction, AuditRecord, Metadata};

use chrono::{DateTime, Utc};
use evidex_common::retry::retry_on_lock;
use evidex_common::{Error, Result};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const DEFAULT_LOCK_WAIT_MS: u64 = 5000;

pub struct AuditLedger {
    session_id: Uuid,
    started_at: DateTime<Utc>,
    log_path: Option<PathBuf>,
    max_lock_wait_ms: u64,
    state: Mutex<LedgerState>,
}

struct LedgerState {
    next_sequence: u64,
    records: Vec<AuditRecord>,
    writer: Option<File>,
    /// Registered source files and the digest taken before reading
    sources: BTreeMap<PathBuf, FileDigest>,
    outputs: BTreeSet<PathBuf>,
    manifest: Option<RunManifest>,
    finalized: Option<ChainOfCustody>,
}

impl AuditLedger {
    /// Open a ledger backed by a durable JSONL audit log (appended, never truncated)
    pub fn open(log_path: impl Into<PathBuf>, max_lock_wait_ms: u64) -> Result<Self> {
        let log_path = log_path.into();
        if let Some(parent) = log_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let writer = retry_on_lock("open audit log", max_lock_wait_ms, || {
            OpenOptions::new().create(true).append(true).open(&log_path)
        })?;

        let ledger = Self::with_writer(Some(log_path.clone()), Some(writer), max_lock_wait_ms);
        info!(
            session_id = %ledger.session_id,
            path = %log_path.display(),
            "Audit ledger opened"
        );
        ledger.record(
            AuditAction::LedgerOpened,
            "Audit ledger opened",
            metadata([
                ("generator", json!(crate::GENERATOR)),
                ("audit_log", json!(log_path.display().to_string())),
            ]),
        )?;
        Ok(ledger)
    }

    /// Ledger without a durable log; records live only in memory
    pub fn ephemeral() -> Self {
        Self::with_writer(None, None, DEFAULT_LOCK_WAIT_MS)
    }

    fn with_writer(log_path: Option<PathBuf>, writer: Option<File>, max_lock_wait_ms: u64) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            started_at: evidex_common::time::now(),
            log_path,
            max_lock_wait_ms,
            state: Mutex::new(LedgerState {
                next_sequence: 1,
                records: Vec::new(),
                writer,
                sources: BTreeMap::new(),
                outputs: BTreeSet::new(),
                manifest: None,
                finalized: None,
            }),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Retry budget for durable writes
    pub fn max_lock_wait_ms(&self) -> u64 {
        self.max_lock_wait_ms
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    fn lock(&self) -> Result<MutexGuard<'_, LedgerState>> {
        self.state
            .lock()
            .map_err(|_| Error::Persistence("audit ledger mutex poisoned".to_string()))
    }

    /// Append one audit record; returns its sequence number
    pub fn record(
        &self,
        action: AuditAction,
        details: impl Into<String>,
        metadata: Metadata,
    ) -> Result<u64> {
        let mut state = self.lock()?;
        self.append_locked(&mut state, action, details.into(), metadata)
    }

    fn append_locked(
        &self,
        state: &mut LedgerState,
        action: AuditAction,
        details: String,
        metadata: Metadata,
    ) -> Result<u64> {
        let record = AuditRecord {
            sequence: state.next_sequence,
            timestamp: evidex_common::time::now(),
            action,
            details,
            metadata,
            session_id: self.session_id,
        };

        if let Some(writer) = state.writer.as_mut() {
            let mut line = serde_json::to_vec(&record)?;
            line.push(b'\n');
            retry_on_lock("append audit record", self.max_lock_wait_ms, || {
                writer.write_all(&line)?;
                writer.flush()?;
                writer.sync_data()
            })
            .map_err(|e| {
                error!(sequence = record.sequence, error = %e, "Audit record could not be persisted");
                e
            })?;
        }

        debug!(sequence = record.sequence, action = ?record.action, "Audit record appended");
        state.next_sequence += 1;
        let sequence = record.sequence;
        state.records.push(record);
        Ok(sequence)
    }

    /// Snapshot of records appended so far
    pub fn records(&self) -> Result<Vec<AuditRecord>> {
        Ok(self.lock()?.records.clone())
    }

    /// Hash a file and record the digest
    pub fn hash(&self, path: &Path) -> Result<FileDigest> {
        let digest = hash_file(path)?;
        self.record(
            AuditAction::FileHashed,
            format!("Hashed {}", path.display()),
            metadata([
                ("path", json!(path.display().to_string())),
                ("sha256", json!(digest.sha256)),
                ("size", json!(digest.size)),
            ]),
        )?;
        Ok(digest)
    }

    /// Hash a source file before it is read and remember the digest
    ///
    /// An unreadable file is `SourceUnavailable`. Registering the same path
    /// again with different content is an `Integrity` violation.
    pub fn register_source(&self, path: &Path) -> Result<FileDigest> {
        let unavailable = |e: std::io::Error| Error::SourceUnavailable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };
        let digest = hash_file(path).map_err(unavailable)?;
        let modified = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .map(|t| DateTime::<Utc>::from(t).to_rfc3339());

        let mut state = self.lock()?;
        if let Some(previous) = state.sources.get(path) {
            if previous.sha256 != digest.sha256 {
                let expected = previous.sha256.clone();
                return Err(self.integrity_violation(&mut state, path, expected, digest.sha256));
            }
            return Ok(digest);
        }

        state.sources.insert(path.to_path_buf(), digest.clone());
        self.append_locked(
            &mut state,
            AuditAction::SourceRegistered,
            format!("Registered source {}", path.display()),
            metadata([
                ("path", json!(path.display().to_string())),
                ("sha256", json!(digest.sha256)),
                ("size", json!(digest.size)),
                ("modified", json!(modified)),
            ]),
        )?;
        info!(path = %path.display(), sha256 = %digest.sha256, "Source registered");
        Ok(digest)
    }

    fn integrity_violation(
        &self,
        state: &mut LedgerState,
        path: &Path,
        expected: String,
        actual: String,
    ) -> Error {
        error!(
            path = %path.display(),
            expected = %expected,
            actual = %actual,
            "Source file changed during processing"
        );
        let logged = self.append_locked(
            state,
            AuditAction::IntegrityViolation,
            format!("Source modified: {}", path.display()),
            metadata([
                ("path", json!(path.display().to_string())),
                ("expected", json!(expected)),
                ("actual", json!(actual)),
            ]),
        );
        match logged {
            Ok(_) => Error::Integrity {
                path: path.to_path_buf(),
                expected,
                actual,
            },
            Err(e) => e,
        }
    }

    /// Check that `copy` holds exactly the registered content of `source`
    ///
    /// Used for working copies read in place of a source. A mismatch means
    /// the source changed between hashing and copying.
    pub fn verify_copy(&self, source: &Path, copy: &Path) -> Result<()> {
        let actual = hash_file(copy)?.sha256;
        let mut state = self.lock()?;
        let expected = state
            .sources
            .get(source)
            .map(|d| d.sha256.clone())
            .ok_or_else(|| {
                Error::Internal(format!("{} is not a registered source", source.display()))
            })?;
        if expected != actual {
            return Err(self.integrity_violation(&mut state, source, expected, actual));
        }
        Ok(())
    }

    pub fn registered_sources(&self) -> Result<Vec<PathBuf>> {
        Ok(self.lock()?.sources.keys().cloned().collect())
    }

    /// Re-hash every registered source and compare against its registration
    pub fn verify_sources(&self) -> Result<usize> {
        let sources: Vec<(PathBuf, FileDigest)> = self
            .lock()?
            .sources
            .iter()
            .map(|(p, d)| (p.clone(), d.clone()))
            .collect();

        for (path, registered) in &sources {
            let actual = match hash_file(path) {
                Ok(digest) => digest.sha256,
                Err(e) => format!("unreadable: {}", e),
            };
            if actual != registered.sha256 {
                let mut state = self.lock()?;
                return Err(self.integrity_violation(
                    &mut state,
                    path,
                    registered.sha256.clone(),
                    actual,
                ));
            }
        }

        self.record(
            AuditAction::IntegrityVerified,
            format!("Verified {} source file(s) unchanged", sources.len()),
            metadata([("verified", json!(sources.len()))]),
        )?;
        Ok(sources.len())
    }

    /// Promise an output artifact; it is hashed at manifest time if it exists
    pub fn track_output(&self, path: &Path) -> Result<()> {
        self.lock()?.outputs.insert(path.to_path_buf());
        Ok(())
    }

    /// Atomically write an output artifact, track it, and record the write
    pub fn write_output(&self, path: &Path, bytes: &[u8]) -> Result<FileDigest> {
        self.track_output(path)?;
        write_atomic(path, bytes, self.max_lock_wait_ms)?;
        let digest = FileDigest {
            sha256: hash_bytes(bytes),
            size: bytes.len() as u64,
        };
        self.record(
            AuditAction::OutputWritten,
            format!("Wrote {}", path.display()),
            metadata([
                ("path", json!(path.display().to_string())),
                ("sha256", json!(digest.sha256)),
                ("size", json!(digest.size)),
            ]),
        )?;
        Ok(digest)
    }

    /// Hash every registered input and tracked output that exists now
    ///
    /// Promised files that are missing are omitted and logged, never
    /// fabricated.
    pub fn generate_manifest(&self) -> Result<RunManifest> {
        let (inputs, outputs) = {
            let state = self.lock()?;
            let inputs: Vec<PathBuf> = state.sources.keys().cloned().collect();
            let outputs: Vec<PathBuf> = state.outputs.iter().cloned().collect();
            (inputs, outputs)
        };

        let mut manifest = RunManifest {
            session_id: self.session_id,
            generator: crate::GENERATOR.to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            omitted: Vec::new(),
        };

        for (role, paths) in [(FileRole::Input, inputs), (FileRole::Output, outputs)] {
            for path in paths {
                match hash_file(&path) {
                    Ok(digest) => {
                        let entry = ManifestEntry {
                            path,
                            role,
                            sha256: digest.sha256,
                            size: digest.size,
                        };
                        match role {
                            FileRole::Input => manifest.inputs.push(entry),
                            FileRole::Output => manifest.outputs.push(entry),
                        }
                    }
                    Err(e) => {
                        warn!(
                            path = %path.display(),
                            error = %e,
                            "Promised file missing at manifest time, omitting"
                        );
                        self.record(
                            AuditAction::ManifestEntryOmitted,
                            format!("Omitted {} from manifest", path.display()),
                            metadata([
                                ("path", json!(path.display().to_string())),
                                ("reason", json!(e.to_string())),
                            ]),
                        )?;
                        manifest.omitted.push(path);
                    }
                }
            }
        }

        self.record(
            AuditAction::ManifestGenerated,
            "Run manifest generated",
            metadata([
                ("inputs", json!(manifest.inputs.len())),
                ("outputs", json!(manifest.outputs.len())),
                ("omitted", json!(manifest.omitted.len())),
            ]),
        )?;
        info!(
            inputs = manifest.inputs.len(),
            outputs = manifest.outputs.len(),
            omitted = manifest.omitted.len(),
            "Manifest generated"
        );

        self.lock()?.manifest = Some(manifest.clone());
        Ok(manifest)
    }

    pub fn manifest(&self) -> Result<Option<RunManifest>> {
        Ok(self.lock()?.manifest.clone())
    }

    /// Seal the chain-of-custody document
    ///
    /// Idempotent: later calls return the sealed document unchanged. Records
    /// appended after sealing reach the durable audit log only.
    pub fn finalize(&self) -> Result<ChainOfCustody> {
        let mut state = self.lock()?;
        if let Some(doc) = &state.finalized {
            return Ok(doc.clone());
        }

        let count = state.records.len() + 1;
        self.append_locked(
            &mut state,
            AuditAction::CustodyFinalized,
            "Chain of custody finalized".to_string(),
            metadata([("records", json!(count))]),
        )?;

        let session = SessionMetadata {
            session_id: self.session_id,
            started_at: self.started_at,
            generator: crate::GENERATOR.to_string(),
            audit_log: self.log_path.clone(),
        };
        let doc = ChainOfCustody::seal(session, state.records.clone(), state.manifest.clone())?;
        info!(records = doc.records.len(), integrity_hash = %doc.integrity_hash, "Chain of custody sealed");
        state.finalized = Some(doc.clone());
        Ok(doc)
    }

    /// Finalize and persist the custody document as JSON plus a `.txt` rendering
    pub fn write_custody(&self, path: &Path) -> Result<ChainOfCustody> {
        let doc = self.finalize()?;
        let json = serde_json::to_vec_pretty(&doc)?;
        write_atomic(path, &json, self.max_lock_wait_ms)?;
        write_atomic(
            &path.with_extension("txt"),
            doc.render_text().as_bytes(),
            self.max_lock_wait_ms,
        )?;
        info!(path = %path.display(), "Chain of custody written");
        Ok(doc)
    }

    /// Persist the last generated manifest
    pub fn write_manifest(&self, path: &Path) -> Result<RunManifest> {
        let manifest = self
            .manifest()?
            .ok_or_else(|| Error::Internal("manifest has not been generated".to_string()))?;
        write_atomic(path, &serde_json::to_vec_pretty(&manifest)?, self.max_lock_wait_ms)?;
        Ok(manifest)
    }

    /// Force buffered audit data to disk
    pub fn flush(&self) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(writer) = state.writer.as_mut() {
            retry_on_lock("flush audit log", self.max_lock_wait_ms, || {
                writer.flush()?;
                writer.sync_all()
            })?;
        }
        Ok(())
    }
}

/// Write via a temporary sibling and rename, so readers never see a partial file
pub fn write_atomic(path: &Path, bytes: &[u8], max_lock_wait_ms: u64) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    retry_on_lock("write output", max_lock_wait_ms, || {
        let mut file = File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        std::fs::rename(&tmp_path, path)
    })
}
