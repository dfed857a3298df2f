//! Stored-file references.
//!
//! Files are never embedded in events or inputs; only these references are.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A file produced by (or attached to) a run, referenced from a `final` event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Display name of the artifact
    pub name: String,

    /// Location in the data directory
    pub path: PathBuf,
}

impl ArtifactRef {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

/// An uploaded file, resolved to its stored location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    /// Upload identifier
    pub id: String,

    /// Where the bytes were stored
    pub path: PathBuf,

    /// Name the client supplied
    pub original_name: String,

    /// MIME type the client supplied
    pub mime: String,

    /// Size in bytes
    pub size: u64,

    /// SHA-256 of the content (hex)
    pub sha256: String,

    /// When the upload was stored
    pub created_at: DateTime<Utc>,
}

impl From<&FileRef> for ArtifactRef {
    fn from(file: &FileRef) -> Self {
        Self::new(file.original_name.clone(), file.path.clone())
    }
}
