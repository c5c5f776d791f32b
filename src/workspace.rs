//! Per-job working directories.
//!
//! Every conversion gets its own directory named by a fresh UUID, holding
//! `archive.epub`, `document.html` and `document.pdf`. Names never derive
//! from the book title, so two concurrent jobs for the same book cannot
//! overwrite each other's files.
//!
//! ## Why a drop guard?
//!
//! The directory must outlive the HTTP handler: the PDF is streamed from
//! disk after the handler has returned. Owning the directory through a
//! [`tempfile::TempDir`] lets the server move the guard into the response
//! body, so removal happens exactly when the last byte has been sent, the
//! client disconnects, or any earlier step fails and the guard is dropped.

use crate::error::ConvertError;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};
use uuid::Uuid;

pub const ARCHIVE_FILE: &str = "archive.epub";
pub const MARKUP_FILE: &str = "document.html";
pub const PDF_FILE: &str = "document.pdf";

/// A request-unique directory, removed on drop unless kept.
#[derive(Debug)]
pub struct JobWorkspace {
    token: Uuid,
    path: PathBuf,
    dir: Option<TempDir>,
}

impl JobWorkspace {
    /// Create a workspace under `parent` (created if absent), or under the
    /// system temp directory when `parent` is `None`.
    pub fn create(parent: Option<&Path>) -> Result<Self, ConvertError> {
        let parent = match parent {
            Some(p) => p.to_path_buf(),
            None => std::env::temp_dir(),
        };
        std::fs::create_dir_all(&parent).map_err(|e| ConvertError::workspace(&parent, e))?;

        let token = Uuid::new_v4();
        let dir = tempfile::Builder::new()
            .prefix(&format!("job-{}", token.simple()))
            .rand_bytes(0)
            .tempdir_in(&parent)
            .map_err(|e| ConvertError::workspace(&parent, e))?;
        let path = dir.path().to_path_buf();
        debug!("Created workspace {}", path.display());

        Ok(Self {
            token,
            path,
            dir: Some(dir),
        })
    }

    /// Unique id of this job, also used in log spans.
    pub fn token(&self) -> Uuid {
        self.token
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn archive_path(&self) -> PathBuf {
        self.path.join(ARCHIVE_FILE)
    }

    pub fn markup_path(&self) -> PathBuf {
        self.path.join(MARKUP_FILE)
    }

    pub fn pdf_path(&self) -> PathBuf {
        self.path.join(PDF_FILE)
    }

    /// Disable cleanup and return the directory path.
    pub fn keep(mut self) -> PathBuf {
        match self.dir.take() {
            Some(dir) => dir.keep(),
            None => self.path.clone(),
        }
    }
}

impl Drop for JobWorkspace {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            match dir.close() {
                Ok(()) => debug!("Removed workspace {}", self.path.display()),
                Err(e) => warn!("Failed to remove workspace {}: {}", self.path.display(), e),
            }
        }
    }
}
