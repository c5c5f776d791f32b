//! PDF rendering: assembled markup → paginated PDF bytes.
//!
//! ## Why a trait?
//!
//! The conversion only needs "markup in, PDF bytes out, with this page
//! rule". [`RenderEngine`] is that seam. [`PrintPdfEngine`] is the built-in
//! implementation: it flows the markup with [`crate::pipeline::layout`] and
//! emits pages with `printpdf`. A caller that needs full CSS layout can plug
//! in another engine through
//! [`crate::config::ConversionConfigBuilder::engine`].
//!
//! ## Why spawn_blocking?
//!
//! Parsing, layout and PDF serialisation are CPU-bound and can take seconds
//! for an illustrated book. [`render_to_file`] moves the work onto the
//! blocking pool so the server's worker threads keep serving requests.
//! The engine polls [`RenderJob::cancel`] between layout steps and pages, so
//! a timed-out job gives its thread back early.
//!
//! ## Fonts
//!
//! Text that fits the WinAnsi code page is set in the base-14 Helvetica and
//! Courier faces, which need no embedding. Any other line is set in bundled
//! DejaVu Sans (or DejaVu Sans Mono for code), embedded as a TrueType font
//! only when some line needs it. DejaVu has no CJK or Hangul glyphs; such
//! text is logged and its characters are left out.

use crate::error::ConvertError;
use crate::pipeline::cancel::CancelToken;
use crate::pipeline::layout::{self, Block, FlowItem, FontFace, PageGeometry, Placed};
use once_cell::sync::Lazy;
use printpdf::image_crate::DynamicImage;
use printpdf::{
    BuiltinFont, Image, ImageTransform, IndirectFontRef, Line, Mm, PdfDocument,
    PdfDocumentReference, PdfLayerReference, Point,
};
use regex::Regex;
use serde::Serialize;
use std::io::BufWriter;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Page rule applied to every conversion.
pub const DEFAULT_PAGE_CSS: &str = "@page { margin-top: 20mm; margin-bottom: 20mm; }";

/// A4 portrait.
pub const PAGE_WIDTH_MM: f32 = 210.0;
pub const PAGE_HEIGHT_MM: f32 = 297.0;
/// Engine default margin for any side the page rule leaves unset (75px).
pub const DEFAULT_MARGIN_MM: f32 = 75.0 * 25.4 / 96.0;

static RE_PAGE_RULE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)@page\s*(?::[a-z-]+\s*)?\{([^}]*)\}").unwrap());
static RE_DECLARATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([a-zA-Z-]+)\s*:\s*([^;]+)").unwrap());
static RE_LENGTH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(-?\d+(?:\.\d+)?|-?\.\d+)\s*(mm|cm|in|pt|px)?$").unwrap());

// ── Page rule ────────────────────────────────────────────────────────────

/// Page margins from an `@page` rule. `None` means "engine default".
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct PageRule {
    pub margin_top_mm: Option<f32>,
    pub margin_bottom_mm: Option<f32>,
    pub margin_left_mm: Option<f32>,
    pub margin_right_mm: Option<f32>,
}

impl PageRule {
    /// Parse the margin declarations of every `@page` block in `css`.
    ///
    /// Later declarations override earlier ones, as in a cascade. Properties
    /// other than `margin`/`margin-*` are ignored.
    pub fn from_css(css: &str) -> Result<Self, ConvertError> {
        let mut rule = PageRule::default();
        for block in RE_PAGE_RULE.captures_iter(css) {
            for decl in RE_DECLARATION.captures_iter(&block[1]) {
                let property = decl[1].to_ascii_lowercase();
                let value = decl[2].trim();
                match property.as_str() {
                    "margin-top" => rule.margin_top_mm = Some(parse_length(value)?),
                    "margin-bottom" => rule.margin_bottom_mm = Some(parse_length(value)?),
                    "margin-left" => rule.margin_left_mm = Some(parse_length(value)?),
                    "margin-right" => rule.margin_right_mm = Some(parse_length(value)?),
                    "margin" => rule.apply_shorthand(value)?,
                    other => debug!("Ignoring @page property '{}'", other),
                }
            }
        }
        Ok(rule)
    }

    fn apply_shorthand(&mut self, value: &str) -> Result<(), ConvertError> {
        let parts = value
            .split_whitespace()
            .map(parse_length)
            .collect::<Result<Vec<_>, _>>()?;
        let (top, right, bottom, left) = match parts.as_slice() {
            [all] => (*all, *all, *all, *all),
            [v, h] => (*v, *h, *v, *h),
            [t, h, b] => (*t, *h, *b, *h),
            [t, r, b, l] => (*t, *r, *b, *l),
            _ => {
                return Err(ConvertError::InvalidConfig(format!(
                    "margin shorthand takes 1–4 lengths, got '{value}'"
                )))
            }
        };
        self.margin_top_mm = Some(top);
        self.margin_right_mm = Some(right);
        self.margin_bottom_mm = Some(bottom);
        self.margin_left_mm = Some(left);
        Ok(())
    }

    /// Resolve the rule against the A4 page and engine defaults.
    pub fn geometry(&self) -> PageGeometry {
        PageGeometry {
            width_mm: PAGE_WIDTH_MM,
            height_mm: PAGE_HEIGHT_MM,
            margin_top_mm: self.margin_top_mm.unwrap_or(DEFAULT_MARGIN_MM),
            margin_bottom_mm: self.margin_bottom_mm.unwrap_or(DEFAULT_MARGIN_MM),
            margin_left_mm: self.margin_left_mm.unwrap_or(DEFAULT_MARGIN_MM),
            margin_right_mm: self.margin_right_mm.unwrap_or(DEFAULT_MARGIN_MM),
        }
    }
}

/// Parse a CSS length into millimetres. A bare number is only accepted for 0.
fn parse_length(value: &str) -> Result<f32, ConvertError> {
    let invalid = || ConvertError::InvalidConfig(format!("unsupported @page length '{value}'"));
    let caps = RE_LENGTH.captures(value.trim()).ok_or_else(invalid)?;
    let number: f32 = caps[1].parse().map_err(|_| invalid())?;
    let mm = match caps.get(2).map(|m| m.as_str()) {
        Some("mm") => number,
        Some("cm") => number * 10.0,
        Some("in") => number * 25.4,
        Some("pt") => number * layout::PT_TO_MM,
        Some("px") => number * 25.4 / layout::CSS_DPI,
        _ if number == 0.0 => 0.0,
        _ => return Err(invalid()),
    };
    if mm < 0.0 {
        return Err(invalid());
    }
    Ok(mm)
}

// ── Engine seam ──────────────────────────────────────────────────────────

/// One document to render.
#[derive(Debug, Clone, Copy)]
pub struct RenderJob<'a> {
    pub markup: &'a str,
    pub page: &'a PageRule,
    /// Embedded as the PDF document title.
    pub title: &'a str,
    /// Set once the job has timed out. Engines should return
    /// [`ConvertError::Cancelled`] at their next convenient point.
    pub cancel: &'a CancelToken,
}

/// Bytes produced by an engine.
#[derive(Debug, Clone)]
pub struct RenderedPdf {
    pub bytes: Vec<u8>,
    pub page_count: usize,
}

/// Turns assembled markup into a paginated PDF.
pub trait RenderEngine: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    /// Render the whole document. Any error aborts the conversion; partial
    /// output is never returned.
    fn render(&self, job: RenderJob<'_>) -> Result<RenderedPdf, ConvertError>;
}

/// Metadata of a PDF written by [`render_to_file`].
#[derive(Debug, Clone, Copy)]
pub struct RenderSummary {
    pub page_count: usize,
    pub pdf_bytes: usize,
}

/// Render on the blocking pool and write the PDF atomically to `path`.
pub async fn render_to_file(
    engine: Arc<dyn RenderEngine>,
    markup: String,
    page: PageRule,
    title: String,
    cancel: CancelToken,
    path: &Path,
) -> Result<RenderSummary, ConvertError> {
    let engine_name = engine.name().to_string();
    let rendered = tokio::task::spawn_blocking(move || {
        engine.render(RenderJob {
            markup: &markup,
            page: &page,
            title: &title,
            cancel: &cancel,
        })
    })
    .await
    .map_err(|e| ConvertError::Internal(format!("Render task panicked: {e}")))??;

    info!(
        "{} rendered {} pages ({} bytes)",
        engine_name,
        rendered.page_count,
        rendered.bytes.len()
    );

    let tmp_path = path.with_extension("pdf.tmp");
    tokio::fs::write(&tmp_path, &rendered.bytes)
        .await
        .map_err(|e| ConvertError::workspace(&tmp_path, e))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| ConvertError::workspace(path, e))?;

    Ok(RenderSummary {
        page_count: rendered.page_count,
        pdf_bytes: rendered.bytes.len(),
    })
}

// ── Built-in engine ──────────────────────────────────────────────────────

/// Built-in engine: scraper flow layout + printpdf base-14 fonts, with
/// DejaVu for text outside WinAnsi.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrintPdfEngine;

impl RenderEngine for PrintPdfEngine {
    fn name(&self) -> &str {
        "printpdf"
    }

    fn render(&self, job: RenderJob<'_>) -> Result<RenderedPdf, ConvertError> {
        let geometry = job.page.geometry();
        let blocks = layout::parse_blocks(job.markup);
        job.cancel.check()?;
        let (flow, images) = decode_images(blocks);
        let pages = layout::paginate(&flow, &geometry);
        job.cancel.check()?;
        debug!("Laid out {} flow items on {} pages", flow.len(), pages.len());

        let (doc, first_page, first_layer) = PdfDocument::new(
            job.title,
            Mm(geometry.width_mm),
            Mm(geometry.height_mm),
            "Layer 1",
        );
        let fonts = Fonts::load(&doc, &pages)?;

        for (index, page) in pages.iter().enumerate() {
            job.cancel.check()?;
            let layer = if index == 0 {
                doc.get_page(first_page).get_layer(first_layer)
            } else {
                let (p, l) = doc.add_page(
                    Mm(geometry.width_mm),
                    Mm(geometry.height_mm),
                    format!("Layer {}", index + 1),
                );
                doc.get_page(p).get_layer(l)
            };
            for item in &page.items {
                draw(&layer, item, &fonts, &images);
            }
        }

        let page_count = pages.len().max(1);
        let bytes = save(doc)?;
        Ok(RenderedPdf { bytes, page_count })
    }
}

// ── Fonts ────────────────────────────────────────────────────────────────

static DEJAVU_SANS: &[u8] = include_bytes!("../../assets/fonts/DejaVuSans.ttf");
static DEJAVU_SANS_MONO: &[u8] = include_bytes!("../../assets/fonts/DejaVuSansMono.ttf");

/// Characters outside the Windows-1252 range 0x80..=0x9F that WinAnsi
/// still encodes.
const WIN_ANSI_EXTRAS: &str = "€‚ƒ„…†‡ˆ‰Š‹ŒŽ‘’“”•–—˜™š›œžŸ";

/// Whether the base-14 fonts can show every character of `text`.
fn is_win_ansi(text: &str) -> bool {
    text.chars().all(|c| {
        matches!(c, ' '..='~' | '\u{a0}'..='\u{ff}') || WIN_ANSI_EXTRAS.contains(c)
    })
}

/// Scripts with no glyphs in the bundled fonts.
fn is_uncovered(c: char) -> bool {
    matches!(
        c as u32,
        0x1100..=0x11FF | 0x2E80..=0x9FFF | 0xAC00..=0xD7AF | 0xF900..=0xFAFF | 0x20000..
    )
}

struct Fonts {
    regular: IndirectFontRef,
    bold: IndirectFontRef,
    italic: IndirectFontRef,
    mono: IndirectFontRef,
    unicode: Option<IndirectFontRef>,
    unicode_mono: Option<IndirectFontRef>,
}

impl Fonts {
    /// Load the base-14 faces, plus whichever DejaVu faces `pages` need.
    fn load(doc: &PdfDocumentReference, pages: &[layout::PageLayout]) -> Result<Self, ConvertError> {
        let add = |font: BuiltinFont| {
            doc.add_builtin_font(font)
                .map_err(|e| ConvertError::RenderFailed {
                    detail: format!("builtin font: {e}"),
                })
        };
        let embed = |bytes: &'static [u8]| {
            doc.add_external_font(bytes)
                .map_err(|e| ConvertError::RenderFailed {
                    detail: format!("embedded font: {e}"),
                })
        };

        let mut need_sans = false;
        let mut need_mono = false;
        let mut uncovered = 0usize;
        for page in pages {
            for item in &page.items {
                if let Placed::Text { face, text, .. } = item {
                    if is_win_ansi(text) {
                        continue;
                    }
                    match face {
                        FontFace::Mono => need_mono = true,
                        _ => need_sans = true,
                    }
                    uncovered += text.chars().filter(|&c| is_uncovered(c)).count();
                }
            }
        }
        if uncovered > 0 {
            warn!(
                "{} characters (CJK or Hangul) have no glyph in the bundled fonts and are omitted",
                uncovered
            );
        }

        Ok(Self {
            regular: add(BuiltinFont::Helvetica)?,
            bold: add(BuiltinFont::HelveticaBold)?,
            italic: add(BuiltinFont::HelveticaOblique)?,
            mono: add(BuiltinFont::Courier)?,
            unicode: need_sans.then(|| embed(DEJAVU_SANS)).transpose()?,
            unicode_mono: need_mono.then(|| embed(DEJAVU_SANS_MONO)).transpose()?,
        })
    }

    /// Font for one line. Non-WinAnsi lines lose bold and italic.
    fn for_text(&self, face: FontFace, text: &str) -> &IndirectFontRef {
        if !is_win_ansi(text) {
            let unicode = match face {
                FontFace::Mono => self.unicode_mono.as_ref(),
                _ => self.unicode.as_ref(),
            };
            if let Some(font) = unicode {
                return font;
            }
        }
        match face {
            FontFace::Regular => &self.regular,
            FontFace::Bold => &self.bold,
            FontFace::Italic => &self.italic,
            FontFace::Mono => &self.mono,
        }
    }
}

/// Decode image blocks up front so the paginator knows their pixel size.
/// Undecodable images are dropped with a warning.
fn decode_images(blocks: Vec<Block>) -> (Vec<FlowItem>, Vec<DynamicImage>) {
    let mut flow = Vec::with_capacity(blocks.len());
    let mut images = Vec::new();
    for block in blocks {
        match block {
            Block::Text(text) => flow.push(FlowItem::Text(text)),
            Block::Rule => flow.push(FlowItem::Rule),
            Block::Image { media_type, data } => {
                match printpdf::image_crate::load_from_memory(&data) {
                    Ok(img) => {
                        // printpdf does not handle alpha channels in all viewers.
                        let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
                        flow.push(FlowItem::Image {
                            slot: images.len(),
                            width_px: rgb.width(),
                            height_px: rgb.height(),
                        });
                        images.push(rgb);
                    }
                    Err(e) => warn!("Skipping undecodable {} image: {}", media_type, e),
                }
            }
        }
    }
    (flow, images)
}

fn draw(layer: &PdfLayerReference, item: &Placed, fonts: &Fonts, images: &[DynamicImage]) {
    match item {
        Placed::Text {
            x_mm,
            baseline_mm,
            size_pt,
            face,
            text,
        } => {
            let font = fonts.for_text(*face, text);
            layer.use_text(text.as_str(), *size_pt, Mm(*x_mm), Mm(*baseline_mm), font);
        }
        Placed::Image {
            slot,
            x_mm,
            y_mm,
            dpi,
        } => {
            if let Some(img) = images.get(*slot) {
                Image::from_dynamic_image(img).add_to_layer(
                    layer.clone(),
                    ImageTransform {
                        translate_x: Some(Mm(*x_mm)),
                        translate_y: Some(Mm(*y_mm)),
                        dpi: Some(*dpi),
                        ..Default::default()
                    },
                );
            }
        }
        Placed::Rule { x1_mm, x2_mm, y_mm } => {
            layer.set_outline_thickness(0.5);
            layer.add_line(Line {
                points: vec![
                    (Point::new(Mm(*x1_mm), Mm(*y_mm)), false),
                    (Point::new(Mm(*x2_mm), Mm(*y_mm)), false),
                ],
                is_closed: false,
            });
        }
    }
}

fn save(doc: PdfDocumentReference) -> Result<Vec<u8>, ConvertError> {
    let mut buf = BufWriter::new(Vec::new());
    doc.save(&mut buf).map_err(|e| ConvertError::RenderFailed {
        detail: format!("PDF save error: {e}"),
    })?;
    buf.into_inner().map_err(|e| ConvertError::RenderFailed {
        detail: format!("PDF buffer error: {e}"),
    })
}
