//! CLI binary for epub2pdf.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `ConversionConfig` / `ServerConfig` and prints results.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use epub2pdf::{
    convert_to_file, inspect, serve, ConversionConfig, ConversionProgressCallback, ItemKind,
    ProgressCallback, ServerConfig, Stage,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Spinner whose message follows the job's stages.
struct CliProgressCallback {
    bar: ProgressBar,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  {msg}  {elapsed:.dim}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix("Converting");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar })
    }
}

impl ConversionProgressCallback for CliProgressCallback {
    fn on_conversion_start(&self, input: &str) {
        self.bar.set_message(input.to_string());
    }

    fn on_stage(&self, stage: Stage) {
        match stage {
            Stage::MetadataRead | Stage::Extracted | Stage::Rendered => {
                self.bar.println(format!("  {} {}", green("✓"), stage));
            }
            _ => {}
        }
        self.bar.set_message(stage.to_string());
    }

    fn on_conversion_complete(&self, page_count: usize, pdf_bytes: usize) {
        self.bar.finish_and_clear();
        eprintln!(
            "{} {} pages  {}",
            green("✔"),
            bold(&page_count.to_string()),
            dim(&format!("{pdf_bytes} bytes"))
        );
    }

    fn on_conversion_error(&self, error: &str) {
        self.bar.finish_and_clear();
        let first_line = error.lines().next().unwrap_or_default();
        eprintln!("{} {}", red("✘"), red(first_line));
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Run the web form on http://127.0.0.1:5000
  epub2pdf serve

  # Listen on all interfaces with a custom working directory
  epub2pdf serve --bind 0.0.0.0:8080 --work-dir /var/tmp/epub2pdf

  # Convert a file; the PDF is named after the book title
  epub2pdf convert book.epub

  # Convert from URL into a chosen path
  epub2pdf convert https://example.com/book.epub -o out/book.pdf

  # Wider margins
  epub2pdf convert --page-css '@page { margin: 25mm; }' book.epub

  # List manifest items as JSON
  epub2pdf inspect --json book.epub

ENVIRONMENT VARIABLES:
  RUST_LOG                  Override log filter (e.g. epub2pdf=debug)
  EPUB2PDF_BIND             Listen address for `serve`
  EPUB2PDF_WORK_DIR         Directory for per-job workspaces
  EPUB2PDF_TIMEOUT          Per-conversion timeout in seconds
  EPUB2PDF_MAX_UPLOAD       Upload limit in bytes
  EPUB2PDF_PAGE_CSS         CSS with the @page rule
"#;

/// Convert EPUB e-books to PDF.
#[derive(Parser, Debug)]
#[command(
    name = "epub2pdf",
    version,
    about = "Convert EPUB e-books to PDF, from the command line or a web form",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "EPUB2PDF_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "EPUB2PDF_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the upload form and conversion endpoint.
    Serve {
        /// Listen address.
        #[arg(long, env = "EPUB2PDF_BIND", default_value = "127.0.0.1:5000")]
        bind: SocketAddr,

        /// Directory for per-request workspaces (created if missing).
        #[arg(long, env = "EPUB2PDF_WORK_DIR", default_value = "temp")]
        work_dir: PathBuf,

        /// Largest accepted upload in bytes.
        #[arg(long, env = "EPUB2PDF_MAX_UPLOAD", default_value_t = epub2pdf::config::DEFAULT_MAX_ARCHIVE_BYTES)]
        max_upload: usize,

        #[command(flatten)]
        conversion: ConversionArgs,
    },

    /// Convert one EPUB file or URL.
    Convert {
        /// Local EPUB path or HTTP/HTTPS URL.
        input: String,

        /// Output path. Default: `{title}.pdf` in the current directory.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print conversion stats as JSON on stdout.
        #[arg(long)]
        json: bool,

        /// Disable the spinner.
        #[arg(long, env = "EPUB2PDF_NO_PROGRESS")]
        no_progress: bool,

        /// Directory for the job workspace. Default: system temp dir.
        #[arg(long, env = "EPUB2PDF_WORK_DIR")]
        work_dir: Option<PathBuf>,

        #[command(flatten)]
        conversion: ConversionArgs,
    },

    /// Print an EPUB's title and manifest without converting it.
    Inspect {
        /// Local EPUB path or HTTP/HTTPS URL.
        input: String,

        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
struct ConversionArgs {
    /// CSS holding the @page rule.
    #[arg(long, env = "EPUB2PDF_PAGE_CSS", default_value = epub2pdf::DEFAULT_PAGE_CSS)]
    page_css: String,

    /// Per-conversion timeout in seconds.
    #[arg(long, env = "EPUB2PDF_TIMEOUT", default_value_t = 300)]
    timeout: u64,

    /// HTTP download timeout in seconds for URL inputs.
    #[arg(long, env = "EPUB2PDF_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Keep the workspace of failed jobs for debugging.
    #[arg(long, env = "EPUB2PDF_KEEP_FAILED")]
    keep_failed: bool,
}

impl ConversionArgs {
    fn builder(&self) -> epub2pdf::ConversionConfigBuilder {
        ConversionConfig::builder()
            .page_css(self.page_css.clone())
            .timeout_secs(self.timeout)
            .download_timeout_secs(self.download_timeout)
            .keep_failed_artifacts(self.keep_failed)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The server logs at info by default. For one-shot commands the spinner
    // is the feedback, so library logs are kept to errors.
    let show_progress = match &cli.command {
        Command::Convert {
            json, no_progress, ..
        } => !cli.quiet && !no_progress && !json,
        _ => false,
    };
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Command::Serve {
            bind,
            work_dir,
            max_upload,
            conversion,
        } => {
            let config = conversion
                .builder()
                .max_archive_bytes(max_upload)
                .build()
                .context("Invalid configuration")?;
            if !cli.quiet {
                eprintln!("{} listening on {}", bold("epub2pdf"), bold(&format!("http://{bind}")));
            }
            serve(ServerConfig::new(bind, work_dir, config))
                .await
                .context("Server failed")?;
        }

        Command::Convert {
            input,
            output,
            json,
            no_progress: _,
            work_dir,
            conversion,
        } => {
            let mut builder = conversion.builder();
            if let Some(dir) = work_dir {
                builder = builder.work_dir(dir);
            }
            if show_progress {
                let cb: ProgressCallback = CliProgressCallback::new();
                builder = builder.progress_callback(cb);
            }
            let config = builder.build().context("Invalid configuration")?;

            run_convert(&input, output, json, cli.quiet, &config).await?;
        }

        Command::Inspect { input, json } => {
            let config = ConversionConfig::default();
            let summary = inspect(&input, &config)
                .await
                .context("Failed to inspect EPUB")?;

            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&summary).context("Failed to serialise summary")?
                );
            } else {
                println!("File:         {}", input);
                println!(
                    "Title:        {}",
                    summary.title.as_deref().unwrap_or("(none)")
                );
                println!(
                    "Items:        {} ({} documents, {} stylesheets, {} images)",
                    summary.items.len(),
                    summary.count(ItemKind::DocumentFragment),
                    summary.count(ItemKind::Stylesheet),
                    summary.count(ItemKind::Image),
                );
                for item in &summary.items {
                    println!(
                        "  {:<24} {:<10} {:>9}  {}",
                        item.media_type,
                        format!("{:?}", item.kind).to_lowercase(),
                        item.bytes,
                        item.href
                    );
                }
            }
        }
    }

    Ok(())
}

async fn run_convert(
    input: &str,
    output: Option<PathBuf>,
    json: bool,
    quiet: bool,
    config: &ConversionConfig,
) -> Result<()> {
    // Without -o the name comes from the book title, known only after extraction.
    let (path, result) = match output {
        Some(path) => {
            let result = convert_to_file(input, &path, config)
                .await
                .context("Conversion failed")?;
            (path, result)
        }
        None => {
            let result = epub2pdf::convert(input, config)
                .await
                .context("Conversion failed")?;
            let path = PathBuf::from(sanitize_file_name(&result.file_name));
            tokio::fs::write(&path, &result.pdf)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            (path, result)
        }
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&result.stats).context("Failed to serialise stats")?
        );
    } else if !quiet {
        eprintln!(
            "{}  {}  {} pages  {}ms  →  {}",
            green("✔"),
            result.title,
            result.stats.page_count,
            result.stats.total_duration_ms,
            bold(&path.display().to_string()),
        );
    }
    Ok(())
}

/// Titles may contain path separators; keep the name a single component.
fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect()
}
