//! HTTP surface: upload form, conversion endpoint, health check.
//!
//! ```text
//! GET  /         → upload form
//! POST /convert  → multipart field `epubFile` → PDF attachment
//! GET  /health   → "ok"
//! ```
//!
//! ## Why stream from disk?
//!
//! The PDF is fully written to the job workspace before the response starts,
//! then streamed from the file. The workspace guard travels inside the body
//! stream and is dropped when the stream ends (or the client goes away), so
//! removal never races transmission and a disconnect still cleans up.

use crate::config::{ConversionConfig, ServerConfig};
use crate::convert::{discard_failed, report, run_job, Stage};
use crate::error::{ConvertError, ErrorClass};
use crate::pipeline::input::validate_upload;
use crate::workspace::JobWorkspace;
use axum::body::{Body, Bytes};
use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{error, info, info_span, warn, Instrument};

/// Multipart field carrying the archive.
pub const UPLOAD_FIELD: &str = "epubFile";

const INDEX_HTML: &str = include_str!("../assets/index.html");
/// Room for multipart boundaries and part headers on top of the archive.
const MULTIPART_SLACK: usize = 64 * 1024;
const CHUNK_SIZE: usize = 64 * 1024;

/// RFC 5987 `attr-char` complement.
const FILENAME_STAR: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b'-')
    .remove(b'.')
    .remove(b'^')
    .remove(b'_')
    .remove(b'`')
    .remove(b'|')
    .remove(b'~');

/// Shared, read-only server state.
pub struct AppState {
    pub config: ConversionConfig,
    pub work_dir: PathBuf,
}

/// Build the router. Exposed for tests and for embedding in a larger app.
pub fn router(state: Arc<AppState>) -> Router {
    let body_limit = state.config.max_archive_bytes.saturating_add(MULTIPART_SLACK);
    Router::new()
        .route("/", get(index))
        .route("/convert", post(convert_upload))
        .route("/health", get(|| async { "ok" }))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Create the working directory, bind and serve until Ctrl-C.
pub async fn serve(config: ServerConfig) -> std::io::Result<()> {
    std::fs::create_dir_all(&config.work_dir)?;
    let state = Arc::new(AppState {
        config: config.conversion,
        work_dir: config.work_dir,
    });
    info!(
        config = ?state.config.summary(),
        work_dir = %state.work_dir.display(),
        "Server configuration"
    );

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    info!(addr = %listener.local_addr()?, "epub2pdf listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

// ── Handlers ─────────────────────────────────────────────────────────────

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn convert_upload(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let config = &state.config;
    report(config, Stage::Received);

    // ── Step 1: Validate and read the upload ─────────────────────────────
    let upload = read_upload(multipart, config.max_archive_bytes).await?;
    report(config, Stage::Validated);

    // ── Step 2: Persist into a fresh workspace ───────────────────────────
    let workspace = JobWorkspace::create(Some(&state.work_dir))?;
    let span = info_span!("job", token = %workspace.token());
    span.in_scope(|| {
        info!(
            "Received '{}' ({} bytes)",
            upload.filename,
            upload.bytes.len()
        )
    });

    let result = async {
        let archive_path = workspace.archive_path();
        tokio::fs::write(&archive_path, &upload.bytes)
            .await
            .map_err(|e| ConvertError::workspace(&archive_path, e))?;
        report(config, Stage::ArchiveSaved);

        // ── Step 3: Extract + render ─────────────────────────────────────
        let artifacts = run_job(&archive_path, &workspace, config).await?;

        // ── Step 4: Open the finished PDF ────────────────────────────────
        let file = tokio::fs::File::open(&artifacts.pdf_path)
            .await
            .map_err(|e| ConvertError::workspace(&artifacts.pdf_path, e))?;
        let len = file
            .metadata()
            .await
            .map_err(|e| ConvertError::workspace(&artifacts.pdf_path, e))?
            .len();
        let disposition = content_disposition(&artifacts.file_name)?;
        Ok::<_, ConvertError>((file, len, disposition))
    }
    .instrument(span.clone())
    .await;

    let (file, len, disposition) = match result {
        Ok(parts) => parts,
        Err(e) => {
            span.in_scope(|| discard_failed(workspace, config, &e));
            return Err(ApiError(e));
        }
    };

    // ── Step 5: Stream; the guard cleans up when the body is done ────────
    let guard = SendGuard {
        workspace: Some(workspace),
        state: Arc::clone(&state),
        sent: false,
        span,
    };
    let body = Body::from_stream(pdf_stream(file, guard));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/pdf")
        .header(header::CONTENT_LENGTH, len)
        .header(header::CONTENT_DISPOSITION, disposition)
        .body(body)
        .map_err(|e| ApiError(ConvertError::Internal(format!("response: {e}"))))
}

struct Upload {
    filename: String,
    bytes: Bytes,
}

/// Pull the `epubFile` part out of the form, gating on its filename before
/// reading its bytes.
///
/// A part with that name but no `filename` parameter is a plain form value,
/// not a file part, so it is skipped. `filename=""` is a file part with an
/// empty name and fails the extension check.
async fn read_upload(mut multipart: Multipart, limit: usize) -> Result<Upload, ConvertError> {
    while let Some(field) = multipart.next_field().await.map_err(|e| multipart_error(e, limit))? {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };
        validate_upload(Some(&filename))?;

        let bytes = field.bytes().await.map_err(|e| multipart_error(e, limit))?;
        if bytes.len() > limit {
            return Err(ConvertError::ArchiveTooLarge { limit });
        }
        return Ok(Upload { filename, bytes });
    }
    Err(ConvertError::MissingUpload)
}

fn multipart_error(e: MultipartError, limit: usize) -> ConvertError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ConvertError::ArchiveTooLarge { limit }
    } else {
        ConvertError::MalformedUpload {
            detail: e.body_text(),
        }
    }
}

/// `attachment; filename="…"; filename*=UTF-8''…`
pub fn content_disposition(file_name: &str) -> Result<HeaderValue, ConvertError> {
    let fallback: String = file_name
        .chars()
        .map(|c| {
            if c.is_ascii() && !c.is_ascii_control() && c != '"' && c != '\\' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let encoded = utf8_percent_encode(file_name, FILENAME_STAR);
    let value = format!("attachment; filename=\"{fallback}\"; filename*=UTF-8''{encoded}");
    HeaderValue::from_str(&value)
        .map_err(|e| ConvertError::Internal(format!("Content-Disposition: {e}")))
}

// ── Streaming ────────────────────────────────────────────────────────────

/// Owns the workspace while the PDF is on the wire.
struct SendGuard {
    workspace: Option<JobWorkspace>,
    state: Arc<AppState>,
    sent: bool,
    span: tracing::Span,
}

impl Drop for SendGuard {
    fn drop(&mut self) {
        let _entered = self.span.enter();
        let config = &self.state.config;
        if self.sent {
            report(config, Stage::Sent);
        } else {
            warn!("Client went away before the PDF was fully sent");
        }
        drop(self.workspace.take());
        report(config, Stage::Cleaned);
    }
}

fn pdf_stream(
    file: tokio::fs::File,
    guard: SendGuard,
) -> impl futures::Stream<Item = std::io::Result<Bytes>> + Send + 'static {
    futures::stream::unfold(Some((file, guard)), |state| async move {
        let (mut file, mut guard) = state?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        match file.read(&mut buf).await {
            Ok(0) => {
                // Close the file before the directory goes.
                drop(file);
                guard.sent = true;
                drop(guard);
                None
            }
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(Bytes::from(buf)), Some((file, guard))))
            }
            Err(e) => Some((Err(e), None)),
        }
    })
}

// ── Errors ───────────────────────────────────────────────────────────────

/// Maps a [`ConvertError`] to a plain-text response.
#[derive(Debug)]
pub struct ApiError(pub ConvertError);

impl From<ConvertError> for ApiError {
    fn from(e: ConvertError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match (&self.0, self.0.class()) {
            (ConvertError::ArchiveTooLarge { .. }, _) => StatusCode::PAYLOAD_TOO_LARGE,
            (_, ErrorClass::ClientInput) => {
                info!(error = %self.0, "Rejected upload");
                StatusCode::BAD_REQUEST
            }
            (_, ErrorClass::Conversion) => {
                error!(error = %self.0, "Conversion failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (
            status,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            self.0.client_message(),
        )
            .into_response()
    }
}
