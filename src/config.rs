//! Configuration types for EPUB-to-PDF conversion and the web server.
//!
//! Conversion behaviour is controlled through [`ConversionConfig`], built via
//! its [`ConversionConfigBuilder`]. The server wraps it in [`ServerConfig`]
//! together with the bind address and working directory.
//!
//! # Design choice: builder over constructor
//! Callers set only what they care about and rely on documented defaults for
//! the rest. `build()` parses the page rule once so a bad override fails at
//! startup instead of on the first request.

use crate::error::ConvertError;
use crate::pipeline::archive::ArchiveLimits;
use crate::pipeline::render::{PageRule, PrintPdfEngine, RenderEngine, DEFAULT_PAGE_CSS};
use crate::progress::ProgressCallback;
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

/// Default upload ceiling: 100 MiB.
pub const DEFAULT_MAX_ARCHIVE_BYTES: usize = 100 * 1024 * 1024;

/// Configuration for one EPUB-to-PDF conversion.
///
/// # Example
/// ```rust
/// use epub2pdf::ConversionConfig;
///
/// let config = ConversionConfig::builder()
///     .timeout_secs(60)
///     .page_css("@page { margin: 15mm; }")
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ConversionConfig {
    /// CSS holding the `@page` rule. Default: 20mm top and bottom margins.
    pub page_css: String,

    /// Parsed form of `page_css`, filled in by `build()`.
    pub page_rule: PageRule,

    /// Rendering engine. Default: [`PrintPdfEngine`].
    pub engine: Arc<dyn RenderEngine>,

    /// Wall-clock budget for one conversion in seconds. Default: 300.
    ///
    /// On expiry the job fails with [`ConvertError::Timeout`] and its
    /// workspace is cleaned up. The job's cancel token is set at the same
    /// moment; extraction checks it between items and the built-in engine
    /// between layout steps and pages, so blocking work stops at the next
    /// checkpoint. A custom [`RenderEngine`] that ignores
    /// [`RenderJob::cancel`](crate::pipeline::render::RenderJob::cancel) keeps
    /// its blocking thread until it returns.
    pub timeout_secs: u64,

    /// Largest archive accepted, in bytes. Default: 100 MiB.
    pub max_archive_bytes: usize,

    /// Caps on inflated entry sizes. Default: 64 MiB per entry, 512 MiB
    /// across all loaded items.
    pub archive_limits: ArchiveLimits,

    /// Leave the workspace of a failed job on disk. Default: false.
    pub keep_failed_artifacts: bool,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Parent directory for job workspaces. `None` uses the system temp dir.
    pub work_dir: Option<PathBuf>,

    /// Stage events receiver.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            page_css: DEFAULT_PAGE_CSS.to_string(),
            page_rule: PageRule {
                margin_top_mm: Some(20.0),
                margin_bottom_mm: Some(20.0),
                margin_left_mm: None,
                margin_right_mm: None,
            },
            engine: Arc::new(PrintPdfEngine),
            timeout_secs: 300,
            max_archive_bytes: DEFAULT_MAX_ARCHIVE_BYTES,
            archive_limits: ArchiveLimits::default(),
            keep_failed_artifacts: false,
            download_timeout_secs: 120,
            work_dir: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ConversionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionConfig")
            .field("page_css", &self.page_css)
            .field("page_rule", &self.page_rule)
            .field("engine", &self.engine.name())
            .field("timeout_secs", &self.timeout_secs)
            .field("max_archive_bytes", &self.max_archive_bytes)
            .field("archive_limits", &self.archive_limits)
            .field("keep_failed_artifacts", &self.keep_failed_artifacts)
            .field("download_timeout_secs", &self.download_timeout_secs)
            .field("work_dir", &self.work_dir)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn ConversionProgressCallback>"),
            )
            .finish()
    }
}

impl ConversionConfig {
    /// Create a new builder for `ConversionConfig`.
    pub fn builder() -> ConversionConfigBuilder {
        ConversionConfigBuilder {
            config: Self::default(),
        }
    }

    /// Loggable snapshot of the settings.
    pub fn summary(&self) -> ConfigSummary {
        ConfigSummary {
            engine: self.engine.name().to_string(),
            page_rule: self.page_rule,
            timeout_secs: self.timeout_secs,
            max_archive_bytes: self.max_archive_bytes,
            archive_limits: self.archive_limits,
            keep_failed_artifacts: self.keep_failed_artifacts,
            work_dir: self.work_dir.clone(),
        }
    }
}

/// Serialisable view of a [`ConversionConfig`] without the trait objects.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigSummary {
    pub engine: String,
    pub page_rule: PageRule,
    pub timeout_secs: u64,
    pub max_archive_bytes: usize,
    pub archive_limits: ArchiveLimits,
    pub keep_failed_artifacts: bool,
    pub work_dir: Option<PathBuf>,
}

/// Builder for [`ConversionConfig`].
#[derive(Debug)]
pub struct ConversionConfigBuilder {
    config: ConversionConfig,
}

impl ConversionConfigBuilder {
    pub fn page_css(mut self, css: impl Into<String>) -> Self {
        self.config.page_css = css.into();
        self
    }

    pub fn engine(mut self, engine: Arc<dyn RenderEngine>) -> Self {
        self.config.engine = engine;
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.config.timeout_secs = secs;
        self
    }

    pub fn max_archive_bytes(mut self, bytes: usize) -> Self {
        self.config.max_archive_bytes = bytes;
        self
    }

    pub fn max_entry_bytes(mut self, bytes: u64) -> Self {
        self.config.archive_limits.max_entry_bytes = bytes;
        self
    }

    pub fn max_unpacked_bytes(mut self, bytes: u64) -> Self {
        self.config.archive_limits.max_unpacked_bytes = bytes;
        self
    }

    pub fn keep_failed_artifacts(mut self, keep: bool) -> Self {
        self.config.keep_failed_artifacts = keep;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs.max(1);
        self
    }

    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.work_dir = Some(dir.into());
        self
    }

    pub fn progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.config.progress_callback = Some(callback);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(mut self) -> Result<ConversionConfig, ConvertError> {
        let c = &self.config;
        if c.timeout_secs == 0 {
            return Err(ConvertError::InvalidConfig(
                "Timeout must be ≥ 1 second".into(),
            ));
        }
        if c.max_archive_bytes == 0 {
            return Err(ConvertError::InvalidConfig(
                "Upload limit must be ≥ 1 byte".into(),
            ));
        }
        let limits = &c.archive_limits;
        if limits.max_entry_bytes == 0 || limits.max_unpacked_bytes == 0 {
            return Err(ConvertError::InvalidConfig(
                "Unpack limits must be ≥ 1 byte".into(),
            ));
        }
        if limits.max_entry_bytes > limits.max_unpacked_bytes {
            return Err(ConvertError::InvalidConfig(format!(
                "Entry limit ({}) exceeds the total unpack limit ({})",
                limits.max_entry_bytes, limits.max_unpacked_bytes
            )));
        }
        self.config.page_rule = PageRule::from_css(&self.config.page_css)?;
        Ok(self.config)
    }
}

// ── Server ───────────────────────────────────────────────────────────────

/// Settings for the HTTP surface.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address. Default: `127.0.0.1:5000`.
    pub bind: SocketAddr,
    /// Directory holding per-request workspaces, created at startup.
    /// Default: `temp`.
    pub work_dir: PathBuf,
    pub conversion: ConversionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 5000)),
            work_dir: PathBuf::from("temp"),
            conversion: ConversionConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn new(bind: SocketAddr, work_dir: impl Into<PathBuf>, conversion: ConversionConfig) -> Self {
        Self {
            bind,
            work_dir: work_dir.into(),
            conversion,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_built_default() {
        let built = ConversionConfig::builder().build().unwrap();
        assert_eq!(built.page_rule, ConversionConfig::default().page_rule);
        assert_eq!(built.timeout_secs, 300);
        assert_eq!(built.max_archive_bytes, DEFAULT_MAX_ARCHIVE_BYTES);
        assert!(!built.keep_failed_artifacts);
    }

    #[test]
    fn page_css_is_parsed_on_build() {
        let config = ConversionConfig::builder()
            .page_css("@page { margin: 1cm }")
            .build()
            .unwrap();
        assert_eq!(config.page_rule.margin_left_mm, Some(10.0));
    }

    #[test]
    fn invalid_page_css_is_rejected() {
        let err = ConversionConfig::builder()
            .page_css("@page { margin-top: wide }")
            .build()
            .unwrap_err();
        assert!(matches!(err, ConvertError::InvalidConfig(_)));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        assert!(ConversionConfig::builder().timeout_secs(0).build().is_err());
        assert!(ConversionConfig::builder().max_archive_bytes(0).build().is_err());
    }

    #[test]
    fn unpack_limits_are_validated() {
        let config = ConversionConfig::builder()
            .max_entry_bytes(1024)
            .max_unpacked_bytes(4096)
            .build()
            .unwrap();
        assert_eq!(config.archive_limits.max_entry_bytes, 1024);
        assert_eq!(config.archive_limits.max_unpacked_bytes, 4096);

        assert!(ConversionConfig::builder().max_entry_bytes(0).build().is_err());
        let err = ConversionConfig::builder()
            .max_entry_bytes(8192)
            .max_unpacked_bytes(4096)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("8192"), "got: {err}");
    }

    #[test]
    fn debug_hides_trait_objects() {
        let dbg = format!("{:?}", ConversionConfig::default());
        assert!(dbg.contains("printpdf"));
        assert!(dbg.contains("progress_callback: None"));
    }

    #[test]
    fn summary_serialises() {
        let json = serde_json::to_string(&ConversionConfig::default().summary()).unwrap();
        assert!(json.contains("\"timeout_secs\":300"));
    }

    #[test]
    fn server_defaults() {
        let s = ServerConfig::default();
        assert_eq!(s.bind.port(), 5000);
        assert_eq!(s.work_dir, PathBuf::from("temp"));
    }
}
