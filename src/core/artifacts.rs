//! File storage for uploads and run-produced artifacts.
//!
//! Uploads land in `uploads/` under a unique name and are indexed in the run
//! store. Artifacts live under `runs/<run_id>/artifacts/` next to the run's
//! event log. Either way, events and inputs only ever carry references.

use std::path::{Path, PathBuf};

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::info;
use uuid::Uuid;

use super::run_store::RunStore;
use super::safety::InputLimits;
use crate::domain::{ArtifactRef, FileRef};
use crate::error::{EngineError, Result, StorageError};

/// Upload and artifact storage rooted in the data directory
#[derive(Clone)]
pub struct ArtifactStore {
    uploads_dir: PathBuf,
    runs_dir: PathBuf,
    store: RunStore,
    limits: InputLimits,
}

impl ArtifactStore {
    pub fn new(
        uploads_dir: impl Into<PathBuf>,
        runs_dir: impl Into<PathBuf>,
        store: RunStore,
        limits: InputLimits,
    ) -> Self {
        Self {
            uploads_dir: uploads_dir.into(),
            runs_dir: runs_dir.into(),
            store,
            limits,
        }
    }

    /// Directory a run writes its artifacts into
    pub fn artifacts_dir(&self, run_id: Uuid) -> PathBuf {
        self.runs_dir.join(run_id.to_string()).join("artifacts")
    }

    /// Store an uploaded file and index it
    pub async fn save_upload(&self, original_name: &str, mime: &str, bytes: &[u8]) -> Result<FileRef> {
        let name = base_name(original_name)?;
        self.limits.validate_upload_name(&name)?;

        fs::create_dir_all(&self.uploads_dir)
            .await
            .map_err(StorageError::from)?;
        let path = write_unique(&self.uploads_dir, &name, bytes).await?;

        let file = FileRef {
            id: Uuid::new_v4().to_string(),
            path,
            original_name: name,
            mime: if mime.is_empty() {
                guess_mime(original_name).to_string()
            } else {
                mime.to_string()
            },
            size: bytes.len() as u64,
            sha256: sha256_hex(bytes),
            created_at: Utc::now(),
        };
        self.store.save_upload(&file).await?;

        info!(
            file_id = %file.id,
            name = %file.original_name,
            size = file.size,
            "Upload stored"
        );
        Ok(file)
    }

    /// All uploads, newest first
    pub async fn list_uploads(&self) -> Result<Vec<FileRef>> {
        self.store.list_uploads().await
    }
}

/// Write a produced file into `dir`, returning a reference to it
pub(crate) async fn write_artifact(dir: &Path, name: &str, content: &[u8]) -> Result<ArtifactRef> {
    let name = base_name(name)?;
    fs::create_dir_all(dir).await.map_err(StorageError::from)?;
    let path = dir.join(&name);
    fs::write(&path, content).await.map_err(StorageError::from)?;
    Ok(ArtifactRef::new(name, path))
}

/// Final path component only, so a client-supplied name cannot escape the directory
fn base_name(name: &str) -> Result<String> {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| EngineError::InvalidInput(format!("invalid file name: '{}'", name)))
}

/// Create `name`, or `name-1`, `name-2`, … if taken
async fn write_unique(dir: &Path, name: &str, bytes: &[u8]) -> Result<PathBuf> {
    let path = Path::new(name);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name)
        .to_string();
    let extension = path.extension().and_then(|e| e.to_str());

    let mut attempt = 0u32;
    loop {
        let candidate_name = match (attempt, extension) {
            (0, _) => name.to_string(),
            (n, Some(ext)) => format!("{}-{}.{}", stem, n, ext),
            (n, None) => format!("{}-{}", stem, n),
        };
        let candidate = dir.join(candidate_name);

        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await
        {
            Ok(mut file) => {
                file.write_all(bytes).await.map_err(StorageError::from)?;
                file.sync_all().await.map_err(StorageError::from)?;
                return Ok(candidate);
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => attempt += 1,
            Err(err) => return Err(StorageError::from(err).into()),
        }
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn guess_mime(name: &str) -> &'static str {
    let extension = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    match extension.as_deref() {
        Some("txt") => "text/plain",
        Some("md") => "text/markdown",
        Some("json") => "application/json",
        Some("csv") => "text/csv",
        Some("pdf") => "application/pdf",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => "application/octet-stream",
    }
}
