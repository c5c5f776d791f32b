//! End-to-end tests for epub2pdf.
//!
//! Every test builds its EPUB in memory, so nothing here needs fixtures on
//! disk or network access.
//!
//! Run with:
//!   cargo test --test e2e -- --nocapture

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use epub2pdf::pipeline::input::{is_allowed_filename, validate_upload};
use epub2pdf::workspace::JobWorkspace;
use epub2pdf::{
    convert, convert_from_bytes, convert_to_file, inspect, router, AppState, ConversionConfig,
    ConversionProgressCallback, ConvertError, ErrorClass, ItemKind, RenderEngine, RenderJob,
    RenderedPdf, Stage,
};
use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

// ── Test helpers ─────────────────────────────────────────────────────────────

const CONTAINER: &str = r#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#;

/// Builder for a small but well-formed EPUB.
struct BookBuilder {
    titles: Vec<String>,
    /// `None` data declares the item in the manifest without storing it.
    items: Vec<(String, String, Option<Vec<u8>>)>,
}

impl BookBuilder {
    fn new(title: &str) -> Self {
        Self {
            titles: vec![title.to_string()],
            items: Vec::new(),
        }
    }

    fn untitled() -> Self {
        Self {
            titles: Vec::new(),
            items: Vec::new(),
        }
    }

    fn item(mut self, href: &str, media_type: &str, data: impl Into<Vec<u8>>) -> Self {
        self.items
            .push((href.to_string(), media_type.to_string(), Some(data.into())));
        self
    }

    fn declared_only(mut self, href: &str, media_type: &str) -> Self {
        self.items
            .push((href.to_string(), media_type.to_string(), None));
        self
    }

    fn chapter(self, href: &str, body: &str) -> Self {
        let xhtml = format!(
            r#"<?xml version="1.0" encoding="utf-8"?>
<html xmlns="http://www.w3.org/1999/xhtml"><head><title>ch</title></head>
<body>{body}</body></html>"#
        );
        self.item(href, "application/xhtml+xml", xhtml)
    }

    fn build(&self) -> Vec<u8> {
        let metadata: String = self
            .titles
            .iter()
            .map(|t| format!("<dc:title>{t}</dc:title>"))
            .collect();
        let manifest: String = self
            .items
            .iter()
            .enumerate()
            .map(|(i, (href, media_type, _))| {
                format!(r#"<item id="i{i}" href="{href}" media-type="{media_type}"/>"#)
            })
            .collect();
        let opf = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">{metadata}</metadata>
  <manifest>{manifest}</manifest>
</package>"#
        );

        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        zip.start_file("mimetype", options).unwrap();
        zip.write_all(b"application/epub+zip").unwrap();
        zip.start_file("META-INF/container.xml", options).unwrap();
        zip.write_all(CONTAINER.as_bytes()).unwrap();
        zip.start_file("OEBPS/content.opf", options).unwrap();
        zip.write_all(opf.as_bytes()).unwrap();
        for (href, _, data) in &self.items {
            let Some(data) = data else { continue };
            zip.start_file(format!("OEBPS/{href}"), options).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }
}

fn tiny_png() -> Vec<u8> {
    let img = image::RgbImage::from_pixel(4, 4, image::Rgb([200, 30, 30]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png).unwrap();
    out.into_inner()
}

fn sample_book(title: &str) -> Vec<u8> {
    BookBuilder::new(title)
        .item("style/a.css", "text/css", "p { color: red; }")
        .chapter("ch1.xhtml", "<h1>Chapter One</h1><p>It was a dark night.</p>")
        .item("img/cover.png", "image/png", tiny_png())
        .item("style/b.css", "text/css", "h1 { color: blue; }")
        .chapter("ch2.xhtml", "<p>The end.</p>")
        .build()
}

fn config_in(dir: &Path) -> ConversionConfig {
    ConversionConfig::builder().work_dir(dir).build().unwrap()
}

fn entries(dir: &Path) -> usize {
    std::fs::read_dir(dir).unwrap().count()
}

/// Run the job stages on `bytes` inside a fresh workspace and return the
/// saved markup.
async fn markup_of(bytes: &[u8], dir: &Path) -> String {
    let config = ConversionConfig::default();
    let workspace = JobWorkspace::create(Some(dir)).unwrap();
    let archive = workspace.archive_path();
    std::fs::write(&archive, bytes).unwrap();
    let artifacts = epub2pdf::convert::run_job(&archive, &workspace, &config)
        .await
        .unwrap();
    std::fs::read_to_string(&artifacts.markup_path).unwrap()
}

// ── Library conversion ───────────────────────────────────────────────────────

#[tokio::test]
async fn converts_book_named_after_title() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());

    let output = convert_from_bytes(&sample_book("Moby Dick"), &config)
        .await
        .unwrap();

    assert_eq!(output.title, "Moby Dick");
    assert_eq!(output.file_name, "Moby Dick.pdf");
    assert!(output.pdf.starts_with(b"%PDF-"));
    assert!(output.stats.page_count >= 1);
    assert_eq!(output.stats.pdf_bytes, output.pdf.len());
    assert_eq!(output.stats.extraction.fragments, 2);
    assert_eq!(output.stats.extraction.stylesheets, 2);
    assert_eq!(output.stats.extraction.images, 1);
    assert_eq!(entries(dir.path()), 0, "workspace must be removed");
}

#[tokio::test]
async fn convert_from_local_path() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("book.epub");
    std::fs::write(&input, sample_book("Local")).unwrap();
    let work = tempfile::tempdir().unwrap();

    let output = convert(input.to_string_lossy(), &config_in(work.path()))
        .await
        .unwrap();

    assert_eq!(output.file_name, "Local.pdf");
    assert_eq!(entries(work.path()), 0);
}

#[tokio::test]
async fn convert_to_file_writes_pdf_atomically() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("book.epub");
    std::fs::write(&input, sample_book("Saved")).unwrap();
    let target = dir.path().join("out/nested/saved.pdf");

    let output = convert_to_file(input.to_string_lossy(), &target, &ConversionConfig::default())
        .await
        .unwrap();

    let written = std::fs::read(&target).unwrap();
    assert_eq!(written, output.pdf);
    assert!(!target.with_extension("pdf.tmp").exists());
}

#[tokio::test]
async fn first_title_wins() {
    let mut book = BookBuilder::new("First");
    book.titles.push("Second".to_string());
    let bytes = book.chapter("c.xhtml", "<p>x</p>").build();

    let output = convert_from_bytes(&bytes, &ConversionConfig::default())
        .await
        .unwrap();
    assert_eq!(output.file_name, "First.pdf");
}

#[tokio::test]
async fn blank_first_title_is_missing_even_with_a_second() {
    let dir = tempfile::tempdir().unwrap();
    let mut book = BookBuilder::new("   ");
    book.titles.push("Second".to_string());
    let bytes = book.chapter("c.xhtml", "<p>x</p>").build();

    let err = convert_from_bytes(&bytes, &config_in(dir.path()))
        .await
        .unwrap_err();
    assert!(matches!(err, ConvertError::MissingTitle), "got {err:?}");
    assert_eq!(entries(dir.path()), 0);
}

#[tokio::test]
async fn missing_title_is_a_conversion_error() {
    let dir = tempfile::tempdir().unwrap();
    let bytes = BookBuilder::untitled()
        .chapter("c.xhtml", "<p>no title</p>")
        .build();

    let err = convert_from_bytes(&bytes, &config_in(dir.path()))
        .await
        .unwrap_err();

    assert!(matches!(err, ConvertError::MissingTitle), "got {err:?}");
    assert_eq!(err.class(), ErrorClass::Conversion);
    assert_eq!(entries(dir.path()), 0);
}

#[tokio::test]
async fn invalid_utf8_fragment_fails_the_job() {
    let dir = tempfile::tempdir().unwrap();
    let bytes = BookBuilder::new("Broken")
        .item("c.xhtml", "application/xhtml+xml", vec![0xff, 0xfe, 0x00, 0x41])
        .build();

    let err = convert_from_bytes(&bytes, &config_in(dir.path()))
        .await
        .unwrap_err();
    assert!(matches!(err, ConvertError::Decode { .. }), "got {err:?}");
}

#[tokio::test]
async fn manifest_entry_missing_from_zip_fails() {
    let bytes = BookBuilder::new("Gap")
        .chapter("c.xhtml", "<p>x</p>")
        .declared_only("ghost.xhtml", "application/xhtml+xml")
        .build();

    let err = convert_from_bytes(&bytes, &ConversionConfig::default())
        .await
        .unwrap_err();
    assert!(
        matches!(err, ConvertError::MissingEntry { ref href } if href == "OEBPS/ghost.xhtml"),
        "got {err:?}"
    );
}

/// Engine whose "PDF" is the markup it was given, so a test can tell which
/// job's content ended up in which output. Holds its thread briefly and
/// records how many renders overlapped.
#[derive(Default)]
struct EchoEngine {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl RenderEngine for EchoEngine {
    fn name(&self) -> &str {
        "echo"
    }

    fn render(&self, job: RenderJob<'_>) -> Result<RenderedPdf, ConvertError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(150));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let mut bytes = b"%PDF-echo\n".to_vec();
        bytes.extend_from_slice(job.markup.as_bytes());
        Ok(RenderedPdf {
            bytes,
            page_count: 1,
        })
    }
}

/// Same title, different chapter text per job.
fn twin_book(n: usize) -> Vec<u8> {
    BookBuilder::new("Twin")
        .chapter("c.xhtml", &format!("<p>Only in copy {n}</p>"))
        .build()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_title_jobs_run_concurrently_without_collision() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(EchoEngine::default());
    let config = Arc::new(
        ConversionConfig::builder()
            .work_dir(dir.path())
            .engine(engine.clone())
            .build()
            .unwrap(),
    );

    let jobs: Vec<_> = (0..4)
        .map(|n| {
            let config = Arc::clone(&config);
            tokio::spawn(async move { (n, convert_from_bytes(&twin_book(n), &config).await) })
        })
        .collect();

    for job in jobs {
        let (n, result) = job.await.unwrap();
        let output = result.unwrap();
        assert_eq!(output.file_name, "Twin.pdf");
        let text = String::from_utf8(output.pdf).unwrap();
        for other in 0..4 {
            let marker = format!("Only in copy {other}");
            assert_eq!(text.contains(&marker), other == n, "job {n} got: {text}");
        }
    }
    assert!(engine.peak.load(Ordering::SeqCst) > 1, "renders never overlapped");
    assert_eq!(entries(dir.path()), 0);
}

// ── Markup assembly ──────────────────────────────────────────────────────────

#[tokio::test]
async fn self_closing_title_does_not_swallow_chapter() {
    let dir = tempfile::tempdir().unwrap();
    let xhtml = r#"<?xml version="1.0" encoding="utf-8"?>
<html xmlns="http://www.w3.org/1999/xhtml"><head><title/><link rel="stylesheet" href="a.css"/></head>
<body><p>Chapter text</p><div class="gap"/><p>After the gap</p></body></html>"#;
    let bytes = BookBuilder::new("Short")
        .item("c.xhtml", "application/xhtml+xml", xhtml)
        .build();

    let markup = markup_of(&bytes, dir.path()).await;
    assert_eq!(
        markup,
        r#"<style></style><p>Chapter text</p><div class="gap"></div><p>After the gap</p>"#
    );
}

#[tokio::test]
async fn stylesheets_precede_body_in_manifest_order() {
    let dir = tempfile::tempdir().unwrap();
    let markup = markup_of(&sample_book("Order"), dir.path()).await;

    assert!(markup.starts_with("<style>p { color: red; }h1 { color: blue; }</style>"));
    let one = markup.find("Chapter One").unwrap();
    let img = markup.find("<img src=\"data:image/png;base64,").unwrap();
    let end = markup.find("The end.").unwrap();
    assert!(one < img && img < end, "body order follows the manifest");
    assert!(!markup.contains("<title>"), "head content is not carried over");
}

#[tokio::test]
async fn image_subtype_is_sniffed_from_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let bytes = BookBuilder::new("Mislabelled")
        .item("pic.jpg", "image/jpeg", tiny_png())
        .build();

    let markup = markup_of(&bytes, dir.path()).await;
    assert!(markup.contains("data:image/png;base64,"), "{markup}");
    assert!(!markup.contains("image/jpeg"));
}

#[tokio::test]
async fn markup_is_identical_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let bytes = sample_book("Stable");
    let first = markup_of(&bytes, dir.path()).await;
    let second = markup_of(&bytes, dir.path()).await;
    assert_eq!(first, second);
}

// ── Inspect ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn inspect_lists_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("book.epub");
    std::fs::write(&input, sample_book("Listed")).unwrap();

    let summary = inspect(input.to_string_lossy(), &ConversionConfig::default())
        .await
        .unwrap();

    assert_eq!(summary.title.as_deref(), Some("Listed"));
    assert_eq!(summary.items.len(), 5);
    assert_eq!(summary.count(ItemKind::Stylesheet), 2);
    assert_eq!(summary.count(ItemKind::DocumentFragment), 2);
    assert_eq!(summary.count(ItemKind::Image), 1);
    let json = serde_json::to_value(&summary).unwrap();
    assert_eq!(json["items"][0]["kind"], "stylesheet");
}

#[tokio::test]
async fn inspect_reports_size_of_unloaded_items() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("book.epub");
    let bytes = BookBuilder::new("Fonts")
        .chapter("c.xhtml", "<p>x</p>")
        .item("font.otf", "application/vnd.ms-opentype", vec![7u8; 3000])
        .build();
    std::fs::write(&input, bytes).unwrap();

    let summary = inspect(input.to_string_lossy(), &ConversionConfig::default())
        .await
        .unwrap();
    let font = summary.items.iter().find(|i| i.href.ends_with("font.otf")).unwrap();
    assert_eq!(font.kind, ItemKind::Other);
    assert_eq!(font.bytes, 3000);
}

#[tokio::test]
async fn inspect_nonexistent_file() {
    let err = inspect("/no/such/book.epub", &ConversionConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ConvertError::FileNotFound { .. }), "got {err:?}");
}

// ── Progress callback ────────────────────────────────────────────────────────

#[derive(Default)]
struct Recorder {
    stages: Mutex<Vec<Stage>>,
    completed: Mutex<Option<usize>>,
}

impl ConversionProgressCallback for Recorder {
    fn on_stage(&self, stage: Stage) {
        self.stages.lock().unwrap().push(stage);
    }

    fn on_conversion_complete(&self, page_count: usize, _pdf_bytes: usize) {
        *self.completed.lock().unwrap() = Some(page_count);
    }
}

#[tokio::test]
async fn stages_are_reported_in_order() {
    let recorder = Arc::new(Recorder::default());
    let config = ConversionConfig::builder()
        .progress_callback(recorder.clone())
        .build()
        .unwrap();

    convert_from_bytes(&sample_book("Staged"), &config)
        .await
        .unwrap();

    let stages = recorder.stages.lock().unwrap().clone();
    let mut sorted = stages.clone();
    sorted.sort();
    assert_eq!(stages, sorted, "stages never go backwards");
    assert!(stages.contains(&Stage::MetadataRead));
    assert!(stages.contains(&Stage::Rendered));
    assert_eq!(stages.last(), Some(&Stage::Cleaned));
    assert!(recorder.completed.lock().unwrap().is_some());
}

// ── Upload validation ────────────────────────────────────────────────────────

#[test]
fn upload_filename_rules() {
    assert!(is_allowed_filename("book.epub"));
    assert!(is_allowed_filename("Book.EPUB"));
    assert!(is_allowed_filename("my.book.epub"));
    assert!(!is_allowed_filename("book"));
    assert!(!is_allowed_filename("book.pdf"));
    assert!(!is_allowed_filename("book.epub.zip"));

    assert!(matches!(
        validate_upload(None),
        Err(ConvertError::MissingUpload)
    ));
    let err = validate_upload(Some("")).unwrap_err();
    assert_eq!(err.class(), ErrorClass::ClientInput);
    assert!(validate_upload(Some("ok.epub")).is_ok());
}

// ── HTTP ─────────────────────────────────────────────────────────────────────

const BOUNDARY: &str = "e2e-boundary";

fn upload(filename: &str, data: &[u8]) -> Request<Body> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"epubFile\"; filename=\"{filename}\"\r\nContent-Type: application/epub+zip\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    Request::builder()
        .method("POST")
        .uri("/convert")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

fn app(work_dir: &Path) -> axum::Router {
    router(Arc::new(AppState {
        config: ConversionConfig::default(),
        work_dir: work_dir.to_path_buf(),
    }))
}

#[tokio::test]
async fn http_upload_returns_pdf_attachment() {
    let dir = tempfile::tempdir().unwrap();
    let response = app(dir.path())
        .oneshot(upload("whatever.epub", &sample_book("Über Book")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers().clone();
    assert_eq!(headers[header::CONTENT_TYPE], "application/pdf");
    let disposition = headers[header::CONTENT_DISPOSITION].to_str().unwrap();
    assert!(disposition.starts_with("attachment;"));
    assert!(disposition.contains("filename*=UTF-8''%C3%9Cber%20Book.pdf"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert!(body.starts_with(b"%PDF-"));
    let declared: usize = headers[header::CONTENT_LENGTH]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert_eq!(declared, body.len());
    assert_eq!(entries(dir.path()), 0, "workspace removed after sending");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn http_same_title_uploads_get_their_own_pdf() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(EchoEngine::default());
    let config = ConversionConfig::builder()
        .engine(engine.clone())
        .build()
        .unwrap();
    let app = router(Arc::new(AppState {
        config,
        work_dir: dir.path().to_path_buf(),
    }));

    let requests: Vec<_> = (0..4)
        .map(|n| {
            let app = app.clone();
            tokio::spawn(async move {
                let response = app
                    .oneshot(upload("twin.epub", &twin_book(n)))
                    .await
                    .unwrap();
                assert_eq!(response.status(), StatusCode::OK);
                let body = axum::body::to_bytes(response.into_body(), usize::MAX)
                    .await
                    .unwrap();
                (n, body)
            })
        })
        .collect();

    for request in requests {
        let (n, body) = request.await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains(&format!("Only in copy {n}")), "upload {n} got: {text}");
        for other in (0..4).filter(|&o| o != n) {
            assert!(!text.contains(&format!("Only in copy {other}")));
        }
    }
    assert!(engine.peak.load(Ordering::SeqCst) > 1, "renders never overlapped");
    assert_eq!(entries(dir.path()), 0, "every workspace removed");
}

#[tokio::test]
async fn http_untitled_book_is_500() {
    let dir = tempfile::tempdir().unwrap();
    let bytes = BookBuilder::untitled().chapter("c.xhtml", "<p>x</p>").build();
    let response = app(dir.path())
        .oneshot(upload("book.epub", &bytes))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(entries(dir.path()), 0);
}

#[tokio::test]
async fn http_non_epub_name_is_400() {
    let dir = tempfile::tempdir().unwrap();
    let response = app(dir.path())
        .oneshot(upload("book.mobi", &sample_book("Nope")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(entries(dir.path()), 0);
}
