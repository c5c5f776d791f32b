//! Conversion entry points and the per-job state machine.
//!
//! A job walks through [`Stage`]s in order:
//!
//! ```text
//! RECEIVED → VALIDATED → ARCHIVE_SAVED → METADATA_READ → EXTRACTED →
//! MARKUP_SAVED → RENDERED → SENT → CLEANED
//! ```
//!
//! Any error short-circuits the walk. Nothing survives between jobs: every
//! artifact lives in the job's [`JobWorkspace`] and goes away with it.
//!
//! The HTTP server drives [`run_job`] directly so it can stream the PDF from
//! disk; the library entry points ([`convert`], [`convert_to_file`],
//! [`convert_from_bytes`]) read the result into memory or copy it to the
//! caller's path before the workspace is dropped.

use crate::config::ConversionConfig;
use crate::error::ConvertError;
use crate::output::{pdf_file_name, ArchiveSummary, ConversionOutput, ConversionStats, ItemSummary};
use crate::pipeline::archive::EpubArchive;
use crate::pipeline::cancel::CancelToken;
use crate::pipeline::{extract, input, render};
use crate::workspace::JobWorkspace;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Where a job is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Received,
    Validated,
    ArchiveSaved,
    MetadataRead,
    Extracted,
    MarkupSaved,
    Rendered,
    Sent,
    Cleaned,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Received => "received",
            Stage::Validated => "validated",
            Stage::ArchiveSaved => "archive saved",
            Stage::MetadataRead => "metadata read",
            Stage::Extracted => "extracted",
            Stage::MarkupSaved => "markup saved",
            Stage::Rendered => "rendered",
            Stage::Sent => "sent",
            Stage::Cleaned => "cleaned",
        };
        f.write_str(s)
    }
}

/// Log the stage and forward it to the configured callback.
pub(crate) fn report(config: &ConversionConfig, stage: Stage) {
    debug!(%stage, "Job stage");
    if let Some(ref cb) = config.progress_callback {
        cb.on_stage(stage);
    }
}

/// Files produced by a successful job, still inside its workspace.
#[derive(Debug, Clone)]
pub struct JobArtifacts {
    pub title: String,
    pub file_name: String,
    pub markup_path: PathBuf,
    pub pdf_path: PathBuf,
    pub stats: ConversionStats,
}

/// Extract and render the archive at `archive_path` into `workspace`.
///
/// Covers METADATA_READ through RENDERED under the configured timeout. The
/// caller owns the workspace and decides what happens to it afterwards.
///
/// On timeout the job's [`CancelToken`] is set so blocking extraction and
/// rendering stop at their next checkpoint instead of running to the end.
pub async fn run_job(
    archive_path: &Path,
    workspace: &JobWorkspace,
    config: &ConversionConfig,
) -> Result<JobArtifacts, ConvertError> {
    let cancel = CancelToken::new();
    let budget = Duration::from_secs(config.timeout_secs);
    let stages = run_stages(archive_path, workspace, config, &cancel);
    match tokio::time::timeout(budget, stages).await {
        Ok(result) => result,
        Err(_) => {
            cancel.cancel();
            Err(ConvertError::Timeout {
                secs: config.timeout_secs,
            })
        }
    }
}

async fn run_stages(
    archive_path: &Path,
    workspace: &JobWorkspace,
    config: &ConversionConfig,
    cancel: &CancelToken,
) -> Result<JobArtifacts, ConvertError> {
    let total_start = Instant::now();

    // ── Step 1: Open archive, read title ─────────────────────────────────
    let path = archive_path.to_path_buf();
    let limits = config.archive_limits;
    let archive = tokio::task::spawn_blocking(move || EpubArchive::open(&path, &limits))
        .await
        .map_err(|e| ConvertError::Internal(format!("Archive task panicked: {e}")))??;
    let title = archive
        .title()
        .ok_or(ConvertError::MissingTitle)?
        .to_string();
    info!("Title: {}", title);
    report(config, Stage::MetadataRead);

    // ── Step 2: Assemble markup ──────────────────────────────────────────
    let extract_start = Instant::now();
    let items = archive.into_items();
    let token = cancel.clone();
    let (document, extraction) =
        tokio::task::spawn_blocking(move || extract::assemble_until(&items, &token))
            .await
            .map_err(|e| ConvertError::Internal(format!("Extract task panicked: {e}")))??;
    let extract_duration_ms = extract_start.elapsed().as_millis() as u64;
    report(config, Stage::Extracted);

    // ── Step 3: Persist markup ───────────────────────────────────────────
    let markup = document.markup();
    let markup_path = workspace.markup_path();
    tokio::fs::write(&markup_path, &markup)
        .await
        .map_err(|e| ConvertError::workspace(&markup_path, e))?;
    report(config, Stage::MarkupSaved);

    // ── Step 4: Render ───────────────────────────────────────────────────
    let render_start = Instant::now();
    let pdf_path = workspace.pdf_path();
    let summary = render::render_to_file(
        config.engine.clone(),
        markup,
        config.page_rule,
        title.clone(),
        cancel.clone(),
        &pdf_path,
    )
    .await?;
    let render_duration_ms = render_start.elapsed().as_millis() as u64;
    report(config, Stage::Rendered);

    let stats = ConversionStats {
        extraction,
        page_count: summary.page_count,
        pdf_bytes: summary.pdf_bytes,
        extract_duration_ms,
        render_duration_ms,
        total_duration_ms: total_start.elapsed().as_millis() as u64,
    };

    info!(
        "Converted '{}': {} pages, {} bytes, {}ms",
        title, stats.page_count, stats.pdf_bytes, stats.total_duration_ms
    );

    Ok(JobArtifacts {
        file_name: pdf_file_name(&title),
        title,
        markup_path,
        pdf_path,
        stats,
    })
}

/// Dispose of a failed job's workspace, honouring `keep_failed_artifacts`.
pub fn discard_failed(workspace: JobWorkspace, config: &ConversionConfig, error: &ConvertError) {
    if let Some(ref cb) = config.progress_callback {
        cb.on_conversion_error(&error.to_string());
    }
    if config.keep_failed_artifacts {
        let kept = workspace.keep();
        warn!("Keeping artifacts of failed job in {}", kept.display());
    } else {
        drop(workspace);
        report(config, Stage::Cleaned);
    }
}

/// Convert an EPUB file or URL to PDF bytes.
///
/// # Arguments
/// * `input` — Local file path or HTTP/HTTPS URL to an EPUB
/// * `config` — Conversion configuration
///
/// # Errors
/// Any failure is fatal; there is no partial output.
pub async fn convert(
    input_str: impl AsRef<str>,
    config: &ConversionConfig,
) -> Result<ConversionOutput, ConvertError> {
    let input_str = input_str.as_ref();
    info!("Starting conversion: {}", input_str);
    start(config, input_str);

    let workspace = JobWorkspace::create(config.work_dir.as_deref())?;
    let result: Result<ConversionOutput, ConvertError> = async {
        let resolved = input::resolve_input(
            input_str,
            &workspace.archive_path(),
            config.download_timeout_secs,
        )
        .await?;
        report(config, Stage::ArchiveSaved);
        let artifacts = run_job(resolved.path(), &workspace, config).await?;
        read_output(artifacts).await
    }
    .await;
    finish(workspace, config, result)
}

/// Convert EPUB bytes held in memory.
///
/// The bytes are checked against `max_archive_bytes` and written to the
/// job workspace, which is removed before this returns.
///
/// # Example
/// ```rust,no_run
/// use epub2pdf::{convert_from_bytes, ConversionConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let bytes: Vec<u8> = std::fs::read("book.epub")?;
/// let output = convert_from_bytes(&bytes, &ConversionConfig::default()).await?;
/// std::fs::write(&output.file_name, &output.pdf)?;
/// # Ok(())
/// # }
/// ```
pub async fn convert_from_bytes(
    bytes: &[u8],
    config: &ConversionConfig,
) -> Result<ConversionOutput, ConvertError> {
    start(config, "<memory>");
    if bytes.len() > config.max_archive_bytes {
        return Err(ConvertError::ArchiveTooLarge {
            limit: config.max_archive_bytes,
        });
    }

    let workspace = JobWorkspace::create(config.work_dir.as_deref())?;
    let result: Result<ConversionOutput, ConvertError> = async {
        let archive_path = workspace.archive_path();
        tokio::fs::write(&archive_path, bytes)
            .await
            .map_err(|e| ConvertError::workspace(&archive_path, e))?;
        report(config, Stage::ArchiveSaved);
        let artifacts = run_job(&archive_path, &workspace, config).await?;
        read_output(artifacts).await
    }
    .await;
    finish(workspace, config, result)
}

/// Convert an EPUB and write the PDF to `output_path`.
///
/// Uses atomic write (temp file + rename) to prevent partial files.
pub async fn convert_to_file(
    input_str: impl AsRef<str>,
    output_path: impl AsRef<Path>,
    config: &ConversionConfig,
) -> Result<ConversionOutput, ConvertError> {
    let output = convert(input_str, config).await?;
    let path = output_path.as_ref();
    let write_err = |e| ConvertError::OutputWriteFailed {
        path: path.to_path_buf(),
        source: e,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }

    let tmp_path = path.with_extension("pdf.tmp");
    tokio::fs::write(&tmp_path, &output.pdf)
        .await
        .map_err(write_err)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(write_err)?;

    Ok(output)
}

/// Synchronous wrapper around [`convert`].
///
/// Creates a temporary tokio runtime internally.
pub fn convert_sync(
    input_str: impl AsRef<str>,
    config: &ConversionConfig,
) -> Result<ConversionOutput, ConvertError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| ConvertError::Internal(format!("Failed to create tokio runtime: {e}")))?
        .block_on(convert(input_str, config))
}

/// Read an EPUB's title and manifest without rendering it.
pub async fn inspect(
    input_str: impl AsRef<str>,
    config: &ConversionConfig,
) -> Result<ArchiveSummary, ConvertError> {
    let workspace = JobWorkspace::create(config.work_dir.as_deref())?;
    let resolved = input::resolve_input(
        input_str.as_ref(),
        &workspace.archive_path(),
        config.download_timeout_secs,
    )
    .await?;
    let path = resolved.path().to_path_buf();
    let limits = config.archive_limits;
    let archive = tokio::task::spawn_blocking(move || EpubArchive::open(&path, &limits))
        .await
        .map_err(|e| ConvertError::Internal(format!("Archive task panicked: {e}")))??;

    Ok(ArchiveSummary {
        title: archive.title().map(str::to_string),
        items: archive
            .items()
            .iter()
            .map(|item| ItemSummary {
                id: item.id.clone(),
                href: item.href.clone(),
                media_type: item.media_type.clone(),
                kind: item.kind,
                bytes: item.size,
            })
            .collect(),
    })
}

// ── Internal helpers ─────────────────────────────────────────────────────

fn start(config: &ConversionConfig, label: &str) {
    if let Some(ref cb) = config.progress_callback {
        cb.on_conversion_start(label);
    }
    report(config, Stage::Received);
    report(config, Stage::Validated);
}

async fn read_output(artifacts: JobArtifacts) -> Result<ConversionOutput, ConvertError> {
    let pdf = tokio::fs::read(&artifacts.pdf_path)
        .await
        .map_err(|e| ConvertError::workspace(&artifacts.pdf_path, e))?;
    Ok(ConversionOutput {
        title: artifacts.title,
        file_name: artifacts.file_name,
        pdf,
        stats: artifacts.stats,
    })
}

fn finish(
    workspace: JobWorkspace,
    config: &ConversionConfig,
    result: Result<ConversionOutput, ConvertError>,
) -> Result<ConversionOutput, ConvertError> {
    match result {
        Ok(output) => {
            report(config, Stage::Sent);
            if let Some(ref cb) = config.progress_callback {
                cb.on_conversion_complete(output.stats.page_count, output.pdf.len());
            }
            drop(workspace);
            report(config, Stage::Cleaned);
            Ok(output)
        }
        Err(e) => {
            discard_failed(workspace, config, &e);
            Err(e)
        }
    }
}
