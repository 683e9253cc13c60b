//! Bootstrap configuration for an ingestion run
//!
//! Loaded once from TOML and passed by construction to the identity resolver,
//! the source adapters and the ledgers. Nothing here reads process-wide state.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Kind of source adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// SQLite message store with a binary body column
    MessageDb,
    /// Line-oriented chat export text
    LineExport,
    /// RFC 5322 messages: `.eml` files and `.mbox` mailboxes
    Email,
    /// Collaboration-suite personal export (`messages.json`, usually tarred)
    Teams,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::MessageDb => "message_db",
            SourceKind::LineExport => "line_export",
            SourceKind::Email => "email",
            SourceKind::Teams => "teams",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One configured source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub kind: SourceKind,
    /// File, directory or archive
    pub location: PathBuf,
}

/// Line-export parsing options
#[derive(Debug, Clone, Deserialize)]
pub struct LineExportConfig {
    /// Participant names that denote the device owner (case-insensitive)
    #[serde(default = "default_self_markers")]
    pub self_markers: Vec<String>,

    /// Offset applied to naive export timestamps, in minutes east of UTC
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

impl Default for LineExportConfig {
    fn default() -> Self {
        Self {
            self_markers: default_self_markers(),
            utc_offset_minutes: 0,
        }
    }
}

/// Archive extraction limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveLimits {
    #[serde(default = "default_max_files")]
    pub max_files: u64,
    #[serde(default = "default_max_total_bytes")]
    pub max_total_bytes: u64,
    #[serde(default = "default_max_single_file_bytes")]
    pub max_single_file_bytes: u64,
    #[serde(default = "default_max_compression_ratio")]
    pub max_compression_ratio: f64,
}

impl Default for ArchiveLimits {
    fn default() -> Self {
        Self {
            max_files: default_max_files(),
            max_total_bytes: default_max_total_bytes(),
            max_single_file_bytes: default_max_single_file_bytes(),
            max_compression_ratio: default_max_compression_ratio(),
        }
    }
}

/// Durable write settings
#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Total retry budget for a locked audit or decision log
    #[serde(default = "default_max_lock_wait_ms")]
    pub max_lock_wait_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            max_lock_wait_ms: default_max_lock_wait_ms(),
        }
    }
}

/// Review settings
#[derive(Debug, Clone, Deserialize)]
pub struct ReviewConfig {
    /// Messages shown before and after a flagged message
    #[serde(default = "default_context_window")]
    pub context_window: usize,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            context_window: default_context_window(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// Complete ingestion configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Person whose device or export is being examined
    pub self_name: String,

    /// Person name → raw identifiers (phones, emails, aliases)
    #[serde(default)]
    pub person_identifiers: BTreeMap<String, Vec<String>>,

    #[serde(default)]
    pub sources: Vec<SourceConfig>,

    /// Merge tie-break order; earlier kinds sort first
    #[serde(default = "default_source_priority")]
    pub source_priority: Vec<SourceKind>,

    #[serde(default)]
    pub line_export: LineExportConfig,

    #[serde(default)]
    pub archive: ArchiveLimits,

    #[serde(default)]
    pub persistence: PersistenceConfig,

    #[serde(default)]
    pub review: ReviewConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl IngestConfig {
    /// Minimal configuration, mostly for tests and embedding
    pub fn new(self_name: impl Into<String>) -> Self {
        Self {
            self_name: self_name.into(),
            person_identifiers: BTreeMap::new(),
            sources: Vec::new(),
            source_priority: default_source_priority(),
            line_export: LineExportConfig::default(),
            archive: ArchiveLimits::default(),
            persistence: PersistenceConfig::default(),
            review: ReviewConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Parse and validate TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: IngestConfig =
            toml::from_str(content).map_err(|e| Error::Config(format!("Invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load, parse and validate a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Cannot read config file {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&content)?;
        tracing::info!(
            path = %path.display(),
            persons = config.person_identifiers.len(),
            sources = config.sources.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Check structural invariants
    pub fn validate(&self) -> Result<()> {
        if self.self_name.trim().is_empty() {
            return Err(Error::Config("self_name must not be empty".to_string()));
        }

        for source in &self.sources {
            if !self.source_priority.contains(&source.kind) {
                return Err(Error::Config(format!(
                    "source kind {} missing from source_priority",
                    source.kind
                )));
            }
        }

        let mut seen = Vec::with_capacity(self.source_priority.len());
        for kind in &self.source_priority {
            if seen.contains(kind) {
                return Err(Error::Config(format!(
                    "source kind {} listed twice in source_priority",
                    kind
                )));
            }
            seen.push(*kind);
        }

        if self.line_export.utc_offset_minutes.abs() >= 24 * 60 {
            return Err(Error::Config(format!(
                "utc_offset_minutes out of range: {}",
                self.line_export.utc_offset_minutes
            )));
        }

        Ok(())
    }

    /// Rank of a source kind in the merge order (lower sorts first)
    pub fn priority_rank(&self, kind: SourceKind) -> usize {
        self.source_priority
            .iter()
            .position(|k| *k == kind)
            .unwrap_or(self.source_priority.len())
    }
}

fn default_self_markers() -> Vec<String> {
    vec!["You".to_string()]
}

fn default_source_priority() -> Vec<SourceKind> {
    vec![
        SourceKind::MessageDb,
        SourceKind::LineExport,
        SourceKind::Email,
        SourceKind::Teams,
    ]
}

fn default_max_files() -> u64 {
    10_000
}

fn default_max_total_bytes() -> u64 {
    4 * 1024 * 1024 * 1024 // 4GB
}

fn default_max_single_file_bytes() -> u64 {
    2 * 1024 * 1024 * 1024 // 2GB
}

fn default_max_compression_ratio() -> f64 {
    200.0
}

fn default_max_lock_wait_ms() -> u64 {
    5000
}

fn default_context_window() -> usize {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}
