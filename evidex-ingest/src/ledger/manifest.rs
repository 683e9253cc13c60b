//! Run manifest: input and output files with content hashes

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileRole {
    Input,
    Output,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: PathBuf,
    pub role: FileRole,
    pub sha256: String,
    pub size: u64,
}

/// Files touched by a run, sorted by path within each role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    pub session_id: uuid::Uuid,
    pub generator: String,
    pub inputs: Vec<ManifestEntry>,
    pub outputs: Vec<ManifestEntry>,
    /// Promised files that did not exist at generation time
    pub omitted: Vec<PathBuf>,
}

impl RunManifest {
    pub fn entry(&self, path: &std::path::Path) -> Option<&ManifestEntry> {
        self.inputs
            .iter()
            .chain(self.outputs.iter())
            .find(|e| e.path == path)
    }

    /// Path → sha256 pairs, independent of session
    pub fn file_hashes(&self) -> Vec<(PathBuf, String)> {
        self.inputs
            .iter()
            .chain(self.outputs.iter())
            .map(|e| (e.path.clone(), e.sha256.clone()))
            .collect()
    }
}
