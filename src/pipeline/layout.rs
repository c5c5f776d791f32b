//! Flow layout: assembled markup → blocks → positioned items on pages.
//!
//! The built-in engine does not implement CSS layout. It walks the parsed
//! HTML tree once, turning block-level elements into [`Block`]s with a fixed
//! typographic style per element kind (headings, paragraphs, list items,
//! quotes, preformatted text, rules, images). [`paginate`] then flows those
//! blocks top-to-bottom into the content box of each page, breaking to a new
//! page whenever the next line or image does not fit. Chapter boundaries in
//! the source have no influence on where pages break.
//!
//! Text is set in the PDF base-14 fonts (DejaVu for lines outside WinAnsi),
//! and printpdf exposes no metrics for either, so line wrapping uses a fixed
//! average advance per face.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Node};
use tracing::{debug, warn};

/// Points to millimetres.
pub const PT_TO_MM: f32 = 25.4 / 72.0;
/// CSS reference pixel density.
pub const CSS_DPI: f32 = 96.0;

const BASE_SIZE_PT: f32 = 12.0;
const MONO_SIZE_PT: f32 = 10.0;
const LINE_HEIGHT: f32 = 1.2;
const LIST_INDENT_MM: f32 = 8.0;
const QUOTE_INDENT_MM: f32 = 10.0;
/// Stands in for `<br>` while ordinary whitespace is collapsed.
const HARD_BREAK: char = '\u{2028}';

static RE_COLLAPSIBLE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t\r\n\x0C]+").unwrap());

// ── Blocks ────────────────────────────────────────────────────────────────

/// Typeface used for a text block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FontFace {
    Regular,
    Bold,
    Italic,
    Mono,
}

impl FontFace {
    /// Average glyph advance as a fraction of the font size.
    fn advance_em(self) -> f32 {
        match self {
            FontFace::Regular | FontFace::Italic => 0.5,
            FontFace::Bold => 0.55,
            FontFace::Mono => 0.6,
        }
    }
}

/// Style shared by every line of a text block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockStyle {
    pub face: FontFace,
    pub size_pt: f32,
    pub indent_mm: f32,
    pub space_before_pt: f32,
    pub space_after_pt: f32,
    pub preformatted: bool,
}

impl Default for BlockStyle {
    fn default() -> Self {
        Self {
            face: FontFace::Regular,
            size_pt: BASE_SIZE_PT,
            indent_mm: 0.0,
            space_before_pt: 0.0,
            space_after_pt: BASE_SIZE_PT * 0.5,
            preformatted: false,
        }
    }
}

impl BlockStyle {
    fn heading(level: u8) -> Self {
        // Browser default scale: 2em, 1.5em, 1.17em, 1em, .83em, .67em.
        let scale = match level {
            1 => 2.0,
            2 => 1.5,
            3 => 1.17,
            4 => 1.0,
            5 => 0.83,
            _ => 0.67,
        };
        let size_pt = BASE_SIZE_PT * scale;
        Self {
            face: FontFace::Bold,
            size_pt,
            space_before_pt: size_pt * 0.67,
            space_after_pt: size_pt * 0.67,
            ..Self::default()
        }
    }
}

/// A paragraph-like run of text. `lines` holds the hard lines; soft wrapping
/// happens in [`paginate`].
#[derive(Debug, Clone, PartialEq)]
pub struct TextBlock {
    pub lines: Vec<String>,
    pub style: BlockStyle,
}

/// A layout unit produced from the markup.
#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    Text(TextBlock),
    /// Raw image bytes decoded from a `data:` URI.
    Image { media_type: String, data: Vec<u8> },
    Rule,
}

/// Parse assembled markup into layout blocks in document order.
pub fn parse_blocks(markup: &str) -> Vec<Block> {
    let html = Html::parse_document(markup);
    let mut builder = BlockBuilder::default();
    builder.walk(html.root_element(), &Ctx::default());
    builder.flush();
    debug!("Parsed {} layout blocks", builder.blocks.len());
    builder.blocks
}

#[derive(Debug, Clone, Copy, Default)]
struct Ctx {
    style: BlockStyle,
}

impl Ctx {
    fn with_style(&self, style: BlockStyle) -> Self {
        Ctx {
            style: BlockStyle {
                indent_mm: self.style.indent_mm,
                ..style
            },
        }
    }

    fn indented(&self, by_mm: f32) -> Self {
        let mut ctx = *self;
        ctx.style.indent_mm += by_mm;
        ctx
    }
}

#[derive(Default)]
struct BlockBuilder {
    blocks: Vec<Block>,
    buffer: String,
    buffer_style: Option<BlockStyle>,
    /// Bullet or number waiting for the first text of a list item.
    pending_marker: Option<String>,
}

impl BlockBuilder {
    fn walk(&mut self, el: ElementRef<'_>, ctx: &Ctx) {
        for child in el.children() {
            match child.value() {
                Node::Text(text) => self.push_text(text, ctx),
                Node::Element(_) => {
                    if let Some(child_el) = ElementRef::wrap(child) {
                        self.element(child_el, ctx);
                    }
                }
                _ => {}
            }
        }
    }

    fn element(&mut self, el: ElementRef<'_>, ctx: &Ctx) {
        let name = el.value().name();
        match name {
            "head" | "script" | "style" | "title" | "noscript" | "template" => {}
            "br" => self.push_break(ctx),
            "hr" => {
                self.flush();
                self.blocks.push(Block::Rule);
            }
            "img" => {
                self.flush();
                self.image(el);
            }
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                let level = name.as_bytes()[1] - b'0';
                self.block(el, &ctx.with_style(BlockStyle::heading(level)));
            }
            "pre" => {
                let style = BlockStyle {
                    face: FontFace::Mono,
                    size_pt: MONO_SIZE_PT,
                    preformatted: true,
                    ..BlockStyle::default()
                };
                self.block(el, &ctx.with_style(style));
            }
            "blockquote" => {
                let mut inner = ctx.indented(QUOTE_INDENT_MM);
                inner.style.face = FontFace::Italic;
                self.block(el, &inner);
            }
            "ul" | "ol" => self.list(el, ctx, name == "ol"),
            "li" => {
                // A stray <li> outside a list still gets a bullet.
                self.flush();
                self.pending_marker = Some("\u{2022} ".to_string());
                self.block(el, &ctx.indented(LIST_INDENT_MM));
            }
            "td" | "th" => {
                self.walk(el, ctx);
                self.push_text(" ", ctx);
            }
            "p" | "div" | "section" | "article" | "header" | "footer" | "nav" | "aside"
            | "main" | "figure" | "figcaption" | "address" | "dl" | "dt" | "dd" | "table"
            | "thead" | "tbody" | "tfoot" | "tr" | "caption" | "body" | "html" => {
                self.block(el, ctx);
            }
            _ => self.walk(el, ctx),
        }
    }

    fn block(&mut self, el: ElementRef<'_>, ctx: &Ctx) {
        self.flush();
        self.walk(el, ctx);
        self.flush();
    }

    fn list(&mut self, el: ElementRef<'_>, ctx: &Ctx, ordered: bool) {
        self.flush();
        let inner = ctx.indented(LIST_INDENT_MM);
        let mut counter = 0usize;
        for child in el.children() {
            let Some(child_el) = ElementRef::wrap(child) else {
                continue;
            };
            if child_el.value().name() == "li" {
                counter += 1;
                self.flush();
                self.pending_marker = Some(if ordered {
                    format!("{counter}. ")
                } else {
                    "\u{2022} ".to_string()
                });
                self.walk(child_el, &inner);
                self.flush();
            } else {
                self.element(child_el, &inner);
            }
        }
        self.flush();
    }

    fn image(&mut self, el: ElementRef<'_>) {
        let src = el.value().attr("src").unwrap_or_default();
        match decode_data_uri(src) {
            Some((media_type, data)) => self.blocks.push(Block::Image { media_type, data }),
            None => {
                let shown: String = src.chars().take(60).collect();
                warn!("Skipping image with unresolvable source '{}'", shown);
            }
        }
    }

    fn push_text(&mut self, text: &str, ctx: &Ctx) {
        if self.buffer_style.is_none() {
            if !ctx.style.preformatted && text.trim().is_empty() {
                return;
            }
            self.buffer_style = Some(ctx.style);
            if let Some(marker) = self.pending_marker.take() {
                self.buffer.push_str(&marker);
            }
        }
        self.buffer.push_str(text);
    }

    fn push_break(&mut self, ctx: &Ctx) {
        if self.buffer_style.is_none() {
            self.buffer_style = Some(ctx.style);
        }
        self.buffer.push(HARD_BREAK);
    }

    fn flush(&mut self) {
        let Some(style) = self.buffer_style.take() else {
            self.buffer.clear();
            return;
        };
        let raw = std::mem::take(&mut self.buffer);
        let lines: Vec<String> = if style.preformatted {
            raw.replace(HARD_BREAK, "\n")
                .replace('\t', "    ")
                .trim_matches('\n')
                .lines()
                .map(|l| l.trim_end().to_string())
                .collect()
        } else {
            RE_COLLAPSIBLE_WS
                .replace_all(&raw, " ")
                .split(HARD_BREAK)
                .map(|l| l.trim().to_string())
                .collect()
        };
        if lines.iter().all(|l| l.is_empty()) {
            return;
        }
        self.blocks.push(Block::Text(TextBlock { lines, style }));
    }
}

/// Decode `data:<media-type>;base64,<payload>` into its media type and bytes.
pub fn decode_data_uri(src: &str) -> Option<(String, Vec<u8>)> {
    let rest = src.trim().strip_prefix("data:")?;
    let (header, payload) = rest.split_once(',')?;
    let media_type = header.strip_suffix(";base64")?;
    let data = STANDARD.decode(payload.trim()).ok()?;
    Some((media_type.to_string(), data))
}

// ── Pagination ────────────────────────────────────────────────────────────

/// Page size and margins in millimetres.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageGeometry {
    pub width_mm: f32,
    pub height_mm: f32,
    pub margin_top_mm: f32,
    pub margin_bottom_mm: f32,
    pub margin_left_mm: f32,
    pub margin_right_mm: f32,
}

impl PageGeometry {
    pub fn content_width_mm(&self) -> f32 {
        (self.width_mm - self.margin_left_mm - self.margin_right_mm).max(1.0)
    }

    pub fn content_height_mm(&self) -> f32 {
        (self.height_mm - self.margin_top_mm - self.margin_bottom_mm).max(1.0)
    }

    fn content_bottom_mm(&self) -> f32 {
        self.height_mm - self.margin_bottom_mm
    }
}

/// What the paginator flows. Images arrive already decoded to their pixel
/// size; `slot` indexes the engine's decoded image list.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowItem {
    Text(TextBlock),
    Image {
        slot: usize,
        width_px: u32,
        height_px: u32,
    },
    Rule,
}

/// An item fixed on a page. Coordinates are PDF user space in millimetres
/// (origin bottom-left).
#[derive(Debug, Clone, PartialEq)]
pub enum Placed {
    Text {
        x_mm: f32,
        baseline_mm: f32,
        size_pt: f32,
        face: FontFace,
        text: String,
    },
    Image {
        slot: usize,
        x_mm: f32,
        y_mm: f32,
        dpi: f32,
    },
    Rule {
        x1_mm: f32,
        x2_mm: f32,
        y_mm: f32,
    },
}

/// One laid-out page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageLayout {
    pub items: Vec<Placed>,
}

struct Cursor<'g> {
    geometry: &'g PageGeometry,
    pages: Vec<PageLayout>,
    /// Distance from the page top to the next free line, in mm.
    y_mm: f32,
}

impl<'g> Cursor<'g> {
    fn new(geometry: &'g PageGeometry) -> Self {
        Self {
            geometry,
            pages: vec![PageLayout::default()],
            y_mm: geometry.margin_top_mm,
        }
    }

    fn at_page_top(&self) -> bool {
        (self.y_mm - self.geometry.margin_top_mm).abs() < f32::EPSILON
    }

    fn fits(&self, height_mm: f32) -> bool {
        self.y_mm + height_mm <= self.geometry.content_bottom_mm() + 0.01
    }

    fn new_page(&mut self) {
        self.pages.push(PageLayout::default());
        self.y_mm = self.geometry.margin_top_mm;
    }

    /// Break the page unless the box fits or we are already at the top (an
    /// oversized box at the top of a page is placed anyway and overflows).
    fn reserve(&mut self, height_mm: f32) {
        if !self.fits(height_mm) && !self.at_page_top() {
            self.new_page();
        }
    }

    fn skip(&mut self, space_mm: f32) {
        if self.at_page_top() {
            return;
        }
        if self.fits(space_mm) {
            self.y_mm += space_mm;
        } else {
            self.new_page();
        }
    }

    fn place(&mut self, item: Placed) {
        if let Some(page) = self.pages.last_mut() {
            page.items.push(item);
        }
    }
}

/// Flow items into pages. Always returns at least one (possibly empty) page.
pub fn paginate(items: &[FlowItem], geometry: &PageGeometry) -> Vec<PageLayout> {
    let mut cursor = Cursor::new(geometry);

    for item in items {
        match item {
            FlowItem::Text(block) => place_text(&mut cursor, block),
            FlowItem::Image {
                slot,
                width_px,
                height_px,
            } => place_image(&mut cursor, *slot, *width_px, *height_px),
            FlowItem::Rule => {
                let height = 4.0;
                cursor.reserve(height);
                let y_top = cursor.y_mm + height / 2.0;
                cursor.place(Placed::Rule {
                    x1_mm: geometry.margin_left_mm,
                    x2_mm: geometry.width_mm - geometry.margin_right_mm,
                    y_mm: geometry.height_mm - y_top,
                });
                cursor.y_mm += height;
            }
        }
    }

    cursor.pages
}

fn place_text(cursor: &mut Cursor<'_>, block: &TextBlock) {
    let geometry = cursor.geometry;
    let style = &block.style;
    let size_mm = style.size_pt * PT_TO_MM;
    let line_height_mm = size_mm * LINE_HEIGHT;
    let x_mm = geometry.margin_left_mm + style.indent_mm;
    let available_mm = (geometry.content_width_mm() - style.indent_mm).max(size_mm);
    let max_chars = ((available_mm / (size_mm * style.face.advance_em())).floor() as usize).max(1);

    cursor.skip(style.space_before_pt * PT_TO_MM);

    for hard_line in &block.lines {
        let wrapped = if style.preformatted {
            hard_split(hard_line, max_chars)
        } else {
            wrap_words(hard_line, max_chars)
        };
        for line in wrapped {
            cursor.reserve(line_height_mm);
            let baseline_from_top = cursor.y_mm + size_mm;
            if !line.is_empty() {
                cursor.place(Placed::Text {
                    x_mm,
                    baseline_mm: geometry.height_mm - baseline_from_top,
                    size_pt: style.size_pt,
                    face: style.face,
                    text: line,
                });
            }
            cursor.y_mm += line_height_mm;
        }
    }

    cursor.skip(style.space_after_pt * PT_TO_MM);
}

fn place_image(cursor: &mut Cursor<'_>, slot: usize, width_px: u32, height_px: u32) {
    let geometry = cursor.geometry;
    if width_px == 0 || height_px == 0 {
        return;
    }
    let natural_w = width_px as f32 * 25.4 / CSS_DPI;
    let natural_h = height_px as f32 * 25.4 / CSS_DPI;
    let scale = (geometry.content_width_mm() / natural_w)
        .min(geometry.content_height_mm() / natural_h)
        .min(1.0);
    let height_mm = natural_h * scale;

    cursor.reserve(height_mm);
    cursor.place(Placed::Image {
        slot,
        x_mm: geometry.margin_left_mm,
        y_mm: geometry.height_mm - (cursor.y_mm + height_mm),
        dpi: CSS_DPI / scale,
    });
    cursor.y_mm += height_mm;
}

/// Greedy word wrap to at most `max_chars` characters per line. Words longer
/// than a line are split.
pub fn wrap_words(text: &str, max_chars: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for word in text.split(' ').filter(|w| !w.is_empty()) {
        let word_len = word.chars().count();
        let needed = if current_len == 0 {
            word_len
        } else {
            current_len + 1 + word_len
        };
        if needed <= max_chars {
            if current_len > 0 {
                current.push(' ');
            }
            current.push_str(word);
            current_len = needed;
            continue;
        }
        if current_len > 0 {
            lines.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if word_len <= max_chars {
            current.push_str(word);
            current_len = word_len;
        } else {
            let mut pieces = hard_split(word, max_chars);
            if let Some(last) = pieces.pop() {
                current_len = last.chars().count();
                current = last;
            }
            lines.extend(pieces);
        }
    }

    if current_len > 0 || lines.is_empty() {
        lines.push(current);
    }
    lines
}

fn hard_split(text: &str, max_chars: usize) -> Vec<String> {
    if text.is_empty() {
        return vec![String::new()];
    }
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(max_chars.max(1))
        .map(|c| c.iter().collect())
        .collect()
}
