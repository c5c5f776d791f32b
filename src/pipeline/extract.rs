//! Document assembly: content items → one self-contained HTML string.
//!
//! Items are visited in manifest order. Images become inline `<img>` tags,
//! stylesheets are collected into a single `<style>` element, and document
//! fragments contribute the inner markup of their `<body>`. The result is
//! always `<style>{styles}</style>{body}`, even when there are no styles.
//!
//! Decoding is strict: a stylesheet or fragment that is not valid UTF-8
//! aborts the conversion instead of being repaired.
//!
//! ## Why two body parsers?
//!
//! `application/xhtml+xml` fragments are XML. An HTML parser reads a
//! self-closing `<title/>` or `<div/>` as an open tag and swallows whatever
//! follows, so XHTML bodies are cut out with `quick-xml` and re-serialised
//! with non-void empty elements expanded to start/end pairs. `text/html`
//! fragments, and XHTML that is not well-formed, go through the HTML parser.

use crate::error::ConvertError;
use crate::pipeline::archive::{ContentItem, ItemKind};
use crate::pipeline::cancel::CancelToken;
use crate::pipeline::encode;
use once_cell::sync::Lazy;
use quick_xml::events::Event;
use quick_xml::{Reader, Writer};
use scraper::{Html, Selector};
use serde::Serialize;
use tracing::debug;

static BODY: Lazy<Selector> = Lazy::new(|| Selector::parse("body").unwrap());

/// HTML elements with no content model; these stay self-closing.
const VOID_ELEMENTS: &[&[u8]] = &[
    b"area", b"base", b"br", b"col", b"embed", b"hr", b"img", b"input", b"link", b"meta",
    b"param", b"source", b"track", b"wbr",
];

/// Accumulated style text and body markup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssembledDocument {
    styles: String,
    body: String,
}

impl AssembledDocument {
    pub fn styles(&self) -> &str {
        &self.styles
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// The full document handed to the renderer.
    pub fn markup(&self) -> String {
        format!("<style>{}</style>{}", self.styles, self.body)
    }
}

/// Counts of what the assembly consumed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExtractionStats {
    pub images: usize,
    pub stylesheets: usize,
    pub fragments: usize,
    pub skipped: usize,
    pub markup_bytes: usize,
}

/// Assemble the document from items in the order given.
pub fn assemble(items: &[ContentItem]) -> Result<(AssembledDocument, ExtractionStats), ConvertError> {
    assemble_until(items, &CancelToken::new())
}

/// [`assemble`], checking `cancel` before each item.
pub fn assemble_until(
    items: &[ContentItem],
    cancel: &CancelToken,
) -> Result<(AssembledDocument, ExtractionStats), ConvertError> {
    let mut doc = AssembledDocument::default();
    let mut stats = ExtractionStats::default();

    for item in items {
        cancel.check()?;
        match item.kind {
            ItemKind::Image => {
                doc.body
                    .push_str(&encode::image_tag(&item.data, &item.media_type, &item.href));
                stats.images += 1;
            }
            ItemKind::Stylesheet => {
                doc.styles.push_str(decode(item)?);
                stats.stylesheets += 1;
            }
            ItemKind::DocumentFragment => {
                let source = decode(item)?;
                let body = if is_xhtml(&item.media_type) {
                    xhtml_body(source).unwrap_or_else(|| {
                        debug!("{} has no well-formed XML body, parsing as HTML", item.href);
                        body_content(source)
                    })
                } else {
                    body_content(source)
                };
                doc.body.push_str(&body);
                stats.fragments += 1;
            }
            ItemKind::Other => {
                debug!("Skipping {} ({})", item.href, item.media_type);
                stats.skipped += 1;
            }
        }
    }

    stats.markup_bytes = "<style></style>".len() + doc.styles.len() + doc.body.len();
    debug!(
        "Assembled {} images, {} stylesheets, {} fragments ({} bytes)",
        stats.images, stats.stylesheets, stats.fragments, stats.markup_bytes
    );
    Ok((doc, stats))
}

fn decode(item: &ContentItem) -> Result<&str, ConvertError> {
    std::str::from_utf8(&item.data).map_err(|source| ConvertError::Decode {
        href: item.href.clone(),
        source,
    })
}

fn is_xhtml(media_type: &str) -> bool {
    media_type.trim().eq_ignore_ascii_case("application/xhtml+xml")
}

/// Inner markup of an XHTML `<body>`, parsed as XML.
///
/// Text, entity references, CDATA and comments are copied through
/// unchanged. `None` if the source is not well-formed or has no body.
fn xhtml_body(source: &str) -> Option<String> {
    let mut reader = Reader::from_str(source);
    let mut writer = Writer::new(Vec::new());
    let mut depth: Option<usize> = None;

    loop {
        let event = reader.read_event().ok()?;
        let Some(level) = depth else {
            match event {
                Event::Start(e) if e.local_name().as_ref() == b"body" => depth = Some(0),
                Event::Empty(e) if e.local_name().as_ref() == b"body" => {
                    return Some(String::new())
                }
                Event::Eof => return None,
                _ => {}
            }
            continue;
        };

        match event {
            Event::Start(e) => {
                depth = Some(level + 1);
                writer.write_event(Event::Start(e)).ok()?;
            }
            Event::End(_) if level == 0 => break,
            Event::End(e) => {
                depth = Some(level - 1);
                writer.write_event(Event::End(e)).ok()?;
            }
            Event::Empty(e) if !VOID_ELEMENTS.contains(&e.local_name().as_ref()) => {
                let end = e.to_end().into_owned();
                writer.write_event(Event::Start(e)).ok()?;
                writer.write_event(Event::End(end)).ok()?;
            }
            Event::Eof => return None,
            other => writer.write_event(other).ok()?,
        }
    }

    String::from_utf8(writer.into_inner()).ok()
}

/// Inner HTML of `<body>`. The HTML parser always synthesises a body, so a
/// fragment without one contributes its top-level content.
fn body_content(source: &str) -> String {
    let html = Html::parse_document(source);
    html.select(&BODY)
        .next()
        .map(|body| body.inner_html())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(href: &str, media_type: &str, data: &[u8]) -> ContentItem {
        ContentItem {
            id: href.to_string(),
            href: href.to_string(),
            media_type: media_type.to_string(),
            kind: ItemKind::from_media_type(media_type),
            data: data.to_vec(),
            size: data.len() as u64,
        }
    }

    const XHTML: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<html xmlns="http://www.w3.org/1999/xhtml"><head><title>c</title></head>
<body><p>Hello</p></body></html>"#;

    #[test]
    fn markup_has_style_prefix_even_when_empty() {
        let (doc, _) = assemble(&[item("c.xhtml", "application/xhtml+xml", XHTML.as_bytes())]).unwrap();
        assert_eq!(doc.markup(), "<style></style><p>Hello</p>");
    }

    #[test]
    fn stylesheets_accumulate_in_order() {
        let items = [
            item("a.css", "text/css", b"p { color: red; }"),
            item("c.xhtml", "application/xhtml+xml", XHTML.as_bytes()),
            item("b.css", "text/css", b"h1 { color: blue; }"),
        ];
        let (doc, stats) = assemble(&items).unwrap();
        assert_eq!(doc.styles(), "p { color: red; }h1 { color: blue; }");
        assert!(doc.markup().starts_with("<style>p { color: red; }h1"));
        assert_eq!(stats.stylesheets, 2);
        assert_eq!(stats.fragments, 1);
    }

    #[test]
    fn head_content_is_dropped() {
        let (doc, _) = assemble(&[item("c.xhtml", "application/xhtml+xml", XHTML.as_bytes())]).unwrap();
        assert!(!doc.body().contains("<title>"));
    }

    #[test]
    fn other_items_are_skipped() {
        let items = [item("toc.ncx", "application/x-dtbncx+xml", b"\xff\xfe")];
        let (doc, stats) = assemble(&items).unwrap();
        assert_eq!(doc.markup(), "<style></style>");
        assert_eq!(stats.skipped, 1);
    }

    #[test]
    fn invalid_utf8_stylesheet_aborts() {
        let items = [item("bad.css", "text/css", &[0x70, 0xff, 0xfe])];
        match assemble(&items).unwrap_err() {
            ConvertError::Decode { href, .. } => assert_eq!(href, "bad.css"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn images_are_inlined_between_fragments() {
        let items = [
            item("c1.xhtml", "application/xhtml+xml", b"<html><body><p>one</p></body></html>"),
            item("i.gif", "image/gif", b"GIF89a\x01\x00\x01\x00"),
            item("c2.xhtml", "application/xhtml+xml", b"<html><body><p>two</p></body></html>"),
        ];
        let (doc, stats) = assemble(&items).unwrap();
        let body = doc.body();
        let one = body.find("<p>one</p>").unwrap();
        let img = body.find("data:image/gif;base64,").unwrap();
        let two = body.find("<p>two</p>").unwrap();
        assert!(one < img && img < two);
        assert!(!body.contains("i.gif"));
        assert_eq!(stats.images, 1);
    }

    #[test]
    fn self_closing_head_element_keeps_body() {
        let source = br#"<html xmlns="http://www.w3.org/1999/xhtml"><head><title/></head><body><p>Chapter text</p></body></html>"#;
        let (doc, _) = assemble(&[item("c.xhtml", "application/xhtml+xml", source)]).unwrap();
        assert_eq!(doc.body(), "<p>Chapter text</p>");
    }

    #[test]
    fn empty_xhtml_elements_are_expanded_except_void() {
        let source = br#"<html><body><div class="sep"/><p>a<br/>b &amp; c</p></body></html>"#;
        let (doc, _) = assemble(&[item("c.xhtml", "application/xhtml+xml", source)]).unwrap();
        assert_eq!(
            doc.body(),
            r#"<div class="sep"></div><p>a<br/>b &amp; c</p>"#
        );
    }

    #[test]
    fn malformed_xhtml_falls_back_to_html_parser() {
        let source = b"<html><body><p>unclosed<br></body></html>";
        let (doc, _) = assemble(&[item("c.xhtml", "application/xhtml+xml", source)]).unwrap();
        assert!(doc.body().contains("unclosed"), "got: {}", doc.body());
    }

    #[test]
    fn cancelled_assembly_stops() {
        let token = CancelToken::new();
        token.cancel();
        let items = [item("a.css", "text/css", b"p{}")];
        assert!(matches!(
            assemble_until(&items, &token).unwrap_err(),
            ConvertError::Cancelled
        ));
    }

    #[test]
    fn assembly_is_deterministic() {
        let items = [
            item("a.css", "text/css", b"p{}"),
            item("c.xhtml", "application/xhtml+xml", XHTML.as_bytes()),
        ];
        let first = assemble(&items).unwrap().0.markup();
        let second = assemble(&items).unwrap().0.markup();
        assert_eq!(first, second);
    }
}
