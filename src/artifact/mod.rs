//! Artifact storage shared between stages
//!
//! A stage publishes a file or directory under a name; a later stage of the
//! same run downloads it by that name. Backends are content-addressed, so
//! identical files published by different runs are stored once.

pub mod store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

pub use store::LocalArtifactStore;

/// Result type for artifact operations
pub type ArtifactResult<T> = std::result::Result<T, ArtifactError>;

/// Errors raised by artifact backends
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("invalid artifact name '{0}'")]
    InvalidName(String),

    #[error("artifact '{name}' was already published in run {run_id}")]
    AlreadyPublished { run_id: Uuid, name: String },

    #[error("artifact source not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error("artifact '{name}' not found in run {run_id}")]
    NotFound { run_id: Uuid, name: String },

    #[error("artifact entry '{path}' is corrupt: expected {expected}, found {actual}")]
    DigestMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("artifact entry has an unsafe path: {0}")]
    UnsafePath(String),

    #[error("artifact manifest is unreadable: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("artifact I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One file inside an artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    /// Path relative to the artifact root, `/`-separated
    pub path: String,

    /// SHA-256 of the file content (lowercase hex)
    pub digest: String,

    pub size: u64,
}

/// Description of a published artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub name: String,
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub entries: Vec<ArtifactEntry>,
}

impl ArtifactManifest {
    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    pub fn summary(&self) -> ArtifactSummary {
        ArtifactSummary {
            name: self.name.clone(),
            file_count: self.entries.len(),
            total_size: self.total_size(),
        }
    }
}

/// Short form of a manifest, attached to step outcomes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSummary {
    pub name: String,
    pub file_count: usize,
    pub total_size: u64,
}

/// Storage backend for artifacts
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Publish `source` (a file or a directory) as artifact `name` of `run_id`
    async fn publish(&self, run_id: Uuid, name: &str, source: &Path)
        -> ArtifactResult<ArtifactManifest>;

    /// Recreate artifact `name` of `run_id` under the directory `dest`
    async fn download(&self, run_id: Uuid, name: &str, dest: &Path)
        -> ArtifactResult<ArtifactManifest>;

    /// Look up a manifest without downloading anything
    async fn manifest(&self, run_id: Uuid, name: &str) -> ArtifactResult<Option<ArtifactManifest>>;

    /// All artifacts published in a run, sorted by name
    async fn list(&self, run_id: Uuid) -> ArtifactResult<Vec<ArtifactManifest>>;
}

/// SHA-256 of `data` as lowercase hex
pub fn digest_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Artifact names become file names, so keep them to a safe alphabet
pub fn validate_name(name: &str) -> ArtifactResult<()> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ArtifactError::InvalidName(name.to_string()))
    }
}
