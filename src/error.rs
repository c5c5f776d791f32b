//! Error types for the epub2pdf library.
//!
//! A single fatal error type, [`ConvertError`], covers every way a conversion
//! can stop. Each variant belongs to one [`ErrorClass`]:
//!
//! * [`ErrorClass::ClientInput`]: the caller sent something we refuse to
//!   touch (no upload, wrong extension, oversized body). The HTTP layer
//!   answers 4xx with a short, specific reason.
//!
//! * [`ErrorClass::Conversion`]: anything that went wrong after the upload
//!   was accepted: unreadable archive, missing title, decode failure, render
//!   failure, timeout. The HTTP layer answers 500 with a generic body and the
//!   detailed cause goes to the operator log only.
//!
//! There is no partial-success type: one bad content item aborts the whole
//! conversion.

use std::path::PathBuf;
use thiserror::Error;

/// Whether an error was caused by the client's input or by the conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    ClientInput,
    Conversion,
}

/// All fatal errors returned by the epub2pdf library.
#[derive(Debug, Error)]
pub enum ConvertError {
    // ── Client input errors ───────────────────────────────────────────────
    /// The request carried no `epubFile` part.
    #[error("No file part in the request")]
    MissingUpload,

    /// The uploaded filename does not end in `.epub`.
    #[error("Unsupported file '{filename}': expected an .epub file")]
    UnsupportedExtension { filename: String },

    /// The upload exceeds the configured size limit.
    #[error("Upload exceeds the {limit}-byte limit")]
    ArchiveTooLarge { limit: usize },

    /// The multipart body could not be parsed.
    #[error("Malformed upload: {detail}")]
    MalformedUpload { detail: String },

    // ── Input resolution errors ───────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("EPUB file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    // ── Archive errors ────────────────────────────────────────────────────
    /// The zip container or package document cannot be parsed.
    #[error("EPUB '{path}' is unreadable: {detail}")]
    ArchiveUnreadable { path: PathBuf, detail: String },

    /// The package metadata declares no title.
    #[error("EPUB metadata has no dc:title entry")]
    MissingTitle,

    /// A manifest item points at a zip entry that does not exist.
    #[error("Manifest item '{href}' is missing from the archive")]
    MissingEntry { href: String },

    /// One zip entry inflates past the per-entry limit.
    #[error("Archive entry '{href}' inflates past the {limit}-byte entry limit")]
    EntryTooLarge { href: String, limit: u64 },

    /// The loaded content items together inflate past the archive limit.
    #[error("Archive content inflates past the {limit}-byte limit")]
    UnpackedTooLarge { limit: u64 },

    /// A stylesheet or document fragment is not valid UTF-8.
    #[error("Content item '{href}' is not valid UTF-8: {source}")]
    Decode {
        href: String,
        #[source]
        source: std::str::Utf8Error,
    },

    // ── Render errors ─────────────────────────────────────────────────────
    /// The rendering engine could not lay out or emit the document.
    #[error("Rendering failed: {detail}")]
    RenderFailed { detail: String },

    /// The conversion exceeded the configured time budget.
    #[error("Conversion timed out after {secs}s")]
    Timeout { secs: u64 },

    /// Blocking work noticed that its job had already timed out.
    #[error("Conversion was cancelled")]
    Cancelled,

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or populate the per-request workspace.
    #[error("Workspace I/O failed at '{path}': {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Could not write the output PDF file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConvertError {
    /// Classify the error for the HTTP layer.
    pub fn class(&self) -> ErrorClass {
        match self {
            ConvertError::MissingUpload
            | ConvertError::UnsupportedExtension { .. }
            | ConvertError::ArchiveTooLarge { .. }
            | ConvertError::MalformedUpload { .. } => ErrorClass::ClientInput,
            _ => ErrorClass::Conversion,
        }
    }

    /// The text shown to an HTTP client. Conversion errors never leak their
    /// cause.
    pub fn client_message(&self) -> &'static str {
        match self {
            ConvertError::MissingUpload => "No file part in the request.",
            ConvertError::UnsupportedExtension { .. } => {
                "Invalid file format. Please upload an EPUB file."
            }
            ConvertError::ArchiveTooLarge { .. } => "Uploaded file is too large.",
            ConvertError::MalformedUpload { .. } => "Malformed upload.",
            _ => "Internal Server Error",
        }
    }

    pub(crate) fn workspace(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ConvertError::Workspace {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_are_classified() {
        assert_eq!(ConvertError::MissingUpload.class(), ErrorClass::ClientInput);
        assert_eq!(
            ConvertError::UnsupportedExtension {
                filename: "book.txt".into()
            }
            .class(),
            ErrorClass::ClientInput
        );
        assert_eq!(
            ConvertError::ArchiveTooLarge { limit: 5 }.class(),
            ErrorClass::ClientInput
        );
    }

    #[test]
    fn conversion_errors_hide_cause() {
        let e = ConvertError::RenderFailed {
            detail: "font table exploded".into(),
        };
        assert_eq!(e.class(), ErrorClass::Conversion);
        assert_eq!(e.client_message(), "Internal Server Error");
        assert!(e.to_string().contains("font table exploded"));
    }

    #[test]
    fn missing_title_is_a_conversion_error() {
        assert_eq!(ConvertError::MissingTitle.class(), ErrorClass::Conversion);
        assert_eq!(
            ConvertError::MissingTitle.client_message(),
            "Internal Server Error"
        );
    }

    #[test]
    fn decode_display_names_item() {
        let bad = [0xffu8, 0xfe];
        let source = std::str::from_utf8(&bad).unwrap_err();
        let e = ConvertError::Decode {
            href: "OEBPS/style.css".into(),
            source,
        };
        assert!(e.to_string().contains("OEBPS/style.css"), "got: {e}");
    }

    #[test]
    fn unpack_limits_are_conversion_errors() {
        let e = ConvertError::EntryTooLarge {
            href: "OEBPS/huge.bin".into(),
            limit: 1024,
        };
        assert_eq!(e.class(), ErrorClass::Conversion);
        assert!(e.to_string().contains("OEBPS/huge.bin"));
        assert_eq!(
            ConvertError::UnpackedTooLarge { limit: 1 }.client_message(),
            "Internal Server Error"
        );
    }

    #[test]
    fn timeout_display() {
        let e = ConvertError::Timeout { secs: 30 };
        assert!(e.to_string().contains("30s"));
    }
}
