//! Input gate and resolution.
//!
//! The upload gate only looks at the filename: it must carry an `.epub`
//! extension and nothing is sniffed. Anything that passes the gate but is not
//! really an EPUB fails later as a conversion error.
//!
//! For the library and CLI, an input may also be a local path or an
//! `http(s)://` URL. URLs are downloaded straight into the job workspace so
//! the archive is removed with the rest of the job's artifacts.

use crate::error::ConvertError;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// True when `filename` has a final extension equal to `epub`, ignoring case.
pub fn is_allowed_filename(filename: &str) -> bool {
    filename
        .rsplit_once('.')
        .is_some_and(|(_, ext)| ext.eq_ignore_ascii_case("epub"))
}

/// Gate an upload before anything is persisted.
///
/// `None` means the request carried no file part at all.
pub fn validate_upload(filename: Option<&str>) -> Result<(), ConvertError> {
    match filename {
        None => Err(ConvertError::MissingUpload),
        Some(name) if is_allowed_filename(name) => Ok(()),
        Some(name) => Err(ConvertError::UnsupportedExtension {
            filename: name.to_string(),
        }),
    }
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Where the archive for a job came from.
#[derive(Debug, Clone)]
pub enum ResolvedInput {
    /// A file the caller owns; never deleted by us.
    Local(PathBuf),
    /// Downloaded into the job workspace.
    Downloaded { url: String, path: PathBuf },
}

impl ResolvedInput {
    pub fn path(&self) -> &Path {
        match self {
            ResolvedInput::Local(p) => p,
            ResolvedInput::Downloaded { path, .. } => path,
        }
    }
}

/// Resolve a path or URL. URLs are saved to `download_to`.
pub async fn resolve_input(
    input: &str,
    download_to: &Path,
    timeout_secs: u64,
) -> Result<ResolvedInput, ConvertError> {
    if is_url(input) {
        download_url(input, download_to, timeout_secs).await
    } else {
        resolve_local(input)
    }
}

fn resolve_local(path_str: &str) -> Result<ResolvedInput, ConvertError> {
    let path = PathBuf::from(path_str);
    match std::fs::metadata(&path) {
        Ok(meta) if meta.is_file() => {}
        Ok(_) => return Err(ConvertError::FileNotFound { path }),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(ConvertError::PermissionDenied { path });
        }
        Err(_) => return Err(ConvertError::FileNotFound { path }),
    }
    debug!("Resolved local EPUB: {}", path.display());
    Ok(ResolvedInput::Local(path))
}

async fn download_url(
    url: &str,
    download_to: &Path,
    timeout_secs: u64,
) -> Result<ResolvedInput, ConvertError> {
    info!("Downloading EPUB from: {}", url);

    let failed = |reason: String| ConvertError::DownloadFailed {
        url: url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| failed(e.to_string()))?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            ConvertError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            failed(e.to_string())
        }
    })?;

    if !response.status().is_success() {
        return Err(failed(format!("HTTP {}", response.status())));
    }

    let bytes = response.bytes().await.map_err(|e| {
        if e.is_timeout() {
            ConvertError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            failed(e.to_string())
        }
    })?;

    tokio::fs::write(download_to, &bytes)
        .await
        .map_err(|e| ConvertError::workspace(download_to, e))?;

    info!("Downloaded {} bytes to {}", bytes.len(), download_to.display());
    Ok(ResolvedInput::Downloaded {
        url: url.to_string(),
        path: download_to.to_path_buf(),
    })
}
