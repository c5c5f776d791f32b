//! # epub2pdf
//!
//! Convert EPUB e-books to PDF, either through a small web form or from the
//! command line.
//!
//! ## Why this crate?
//!
//! An EPUB is a zip of XHTML fragments, stylesheets and images tied together
//! by a package document. Readers page through it one fragment at a time, but
//! printing or archiving wants a single paginated file. This crate flattens
//! the book into one self-contained document (images inlined as data URIs,
//! stylesheets concatenated in manifest order) and renders that to PDF.
//!
//! ## Pipeline Overview
//!
//! ```text
//! EPUB (upload, local path, or URL)
//!  │
//!  ├─ 1. Input    validate name, save into a per-job workspace
//!  ├─ 2. Archive  read container.xml → OPF → title + manifest (spawn_blocking)
//!  ├─ 3. Extract  images → data URIs, CSS concatenated, <body> fragments joined
//!  ├─ 4. Render   @page geometry + RenderEngine → PDF (spawn_blocking)
//!  └─ 5. Output   `{title}.pdf`, then the workspace is removed
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use epub2pdf::{convert, ConversionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConversionConfig::default();
//!     let output = convert("book.epub", &config).await?;
//!     std::fs::write(&output.file_name, &output.pdf)?;
//!     eprintln!("{} pages", output.stats.page_count);
//!     Ok(())
//! }
//! ```
//!
//! Serving the upload form:
//!
//! ```rust,no_run
//! use epub2pdf::{serve, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     serve(ServerConfig::default()).await
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `epub2pdf` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! epub2pdf = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod convert;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod server;
pub mod workspace;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ConversionConfig, ConversionConfigBuilder, ServerConfig};
pub use convert::{
    convert, convert_from_bytes, convert_sync, convert_to_file, inspect, JobArtifacts, Stage,
};
pub use error::{ConvertError, ErrorClass};
pub use output::{ArchiveSummary, ConversionOutput, ConversionStats, ItemSummary};
pub use pipeline::archive::{ArchiveLimits, ItemKind};
pub use pipeline::cancel::CancelToken;
pub use pipeline::render::{
    PageRule, PrintPdfEngine, RenderEngine, RenderJob, RenderedPdf, DEFAULT_PAGE_CSS,
};
pub use progress::{ConversionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use server::{router, serve, AppState};
pub use workspace::JobWorkspace;
