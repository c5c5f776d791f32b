//! EPUB archive reading: zip container → package document → content items.
//!
//! An EPUB is a zip file whose `META-INF/container.xml` points at the
//! package document (OPF). The OPF carries the Dublin Core metadata and the
//! manifest: every resource in the book with its media type. We read the
//! first `dc:title` and load every manifest item, in declared order, with
//! its bytes.
//!
//! Inflated sizes are capped by [`ArchiveLimits`] whatever the compressed
//! size was. Items of kind [`ItemKind::Other`] are never inflated at all.
//!
//! ## Why manifest order and not spine order?
//!
//! The conversion concatenates items as they are declared in the manifest.
//! For most books the two orders agree; where they do not, manifest order is
//! the documented behaviour and keeps stylesheets and images interleaved the
//! way the publisher listed them.

use crate::error::ConvertError;
use percent_encoding::percent_decode_str;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zip::ZipArchive;

const CONTAINER_PATH: &str = "META-INF/container.xml";

/// Default cap on one inflated entry: 64 MiB.
pub const DEFAULT_MAX_ENTRY_BYTES: u64 = 64 * 1024 * 1024;
/// Default cap on all loaded items together: 512 MiB.
pub const DEFAULT_MAX_UNPACKED_BYTES: u64 = 512 * 1024 * 1024;

/// Decompression bounds applied while loading an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArchiveLimits {
    pub max_entry_bytes: u64,
    pub max_unpacked_bytes: u64,
}

impl Default for ArchiveLimits {
    fn default() -> Self {
        Self {
            max_entry_bytes: DEFAULT_MAX_ENTRY_BYTES,
            max_unpacked_bytes: DEFAULT_MAX_UNPACKED_BYTES,
        }
    }
}

/// Category of a manifest item, decided once from its declared media type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Image,
    Stylesheet,
    DocumentFragment,
    Other,
}

impl ItemKind {
    pub fn from_media_type(media_type: &str) -> Self {
        let media_type = media_type.trim().to_ascii_lowercase();
        if media_type.starts_with("image/") {
            ItemKind::Image
        } else if media_type == "text/css" {
            ItemKind::Stylesheet
        } else if media_type == "application/xhtml+xml" || media_type == "text/html" {
            ItemKind::DocumentFragment
        } else {
            ItemKind::Other
        }
    }
}

/// One manifest entry with its bytes.
#[derive(Debug, Clone)]
pub struct ContentItem {
    pub id: String,
    /// Zip path of the entry (OPF-relative href resolved and percent-decoded).
    pub href: String,
    pub media_type: String,
    pub kind: ItemKind,
    /// Inflated bytes. Empty for [`ItemKind::Other`], which is never loaded.
    pub data: Vec<u8>,
    /// Inflated size: `data.len()` for loaded items, the zip header's
    /// figure for skipped ones.
    pub size: u64,
}

/// A manifest entry before its bytes are loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ManifestEntry {
    id: String,
    href: String,
    media_type: String,
}

#[derive(Debug, Default)]
struct PackageDocument {
    title: Option<String>,
    manifest: Vec<ManifestEntry>,
}

/// An opened EPUB with its metadata and content items loaded.
#[derive(Debug)]
pub struct EpubArchive {
    title: Option<String>,
    items: Vec<ContentItem>,
}

impl EpubArchive {
    /// Open and fully load the EPUB at `path`. Blocking.
    pub fn open(path: &Path, limits: &ArchiveLimits) -> Result<Self, ConvertError> {
        let file = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ConvertError::FileNotFound {
                path: path.to_path_buf(),
            },
            std::io::ErrorKind::PermissionDenied => ConvertError::PermissionDenied {
                path: path.to_path_buf(),
            },
            _ => unreadable(path, e),
        })?;
        Self::from_reader(BufReader::new(file), path, limits)
    }

    /// Load an EPUB from any seekable reader. `origin` is used in errors.
    pub fn from_reader<R: Read + Seek>(
        reader: R,
        origin: &Path,
        limits: &ArchiveLimits,
    ) -> Result<Self, ConvertError> {
        let mut zip = ZipArchive::new(reader).map_err(|e| unreadable(origin, e))?;
        let entry_limit = limits.max_entry_bytes;

        let container = read_entry(&mut zip, CONTAINER_PATH, entry_limit)?
            .ok_or_else(|| unreadable(origin, "missing META-INF/container.xml"))?;
        let opf_path = parse_container(&container).map_err(|e| unreadable(origin, e))?;
        debug!("Package document: {}", opf_path);

        let opf = read_entry(&mut zip, &opf_path, entry_limit)?
            .ok_or_else(|| unreadable(origin, format!("missing package document '{opf_path}'")))?;
        let package = parse_package(&opf).map_err(|e| unreadable(origin, e))?;

        let base = opf_path
            .rfind('/')
            .map(|i| &opf_path[..i])
            .unwrap_or_default();

        let mut items = Vec::with_capacity(package.manifest.len());
        let mut unpacked: u64 = 0;
        for entry in package.manifest {
            let href = resolve_href(base, &entry.href);
            let missing = || ConvertError::MissingEntry { href: href.clone() };
            let kind = ItemKind::from_media_type(&entry.media_type);

            let (data, size) = if kind == ItemKind::Other {
                let size = entry_size(&mut zip, &href)?.ok_or_else(missing)?;
                (Vec::new(), size)
            } else {
                let data = read_entry(&mut zip, &href, entry_limit)?.ok_or_else(missing)?;
                unpacked += data.len() as u64;
                if unpacked > limits.max_unpacked_bytes {
                    return Err(ConvertError::UnpackedTooLarge {
                        limit: limits.max_unpacked_bytes,
                    });
                }
                let size = data.len() as u64;
                (data, size)
            };

            items.push(ContentItem {
                kind,
                id: entry.id,
                href,
                media_type: entry.media_type,
                data,
                size,
            });
        }

        info!(
            "Opened EPUB: title={:?}, {} manifest items",
            package.title,
            items.len()
        );

        Ok(Self {
            title: package.title,
            items,
        })
    }

    /// The first `dc:title` value, or `None` if it is absent or blank.
    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    /// Content items in manifest order.
    pub fn items(&self) -> &[ContentItem] {
        &self.items
    }

    pub fn into_items(self) -> Vec<ContentItem> {
        self.items
    }
}

fn unreadable(path: &Path, detail: impl ToString) -> ConvertError {
    ConvertError::ArchiveUnreadable {
        path: PathBuf::from(path),
        detail: detail.to_string(),
    }
}

fn entry_error(name: &str, detail: impl ToString) -> ConvertError {
    ConvertError::ArchiveUnreadable {
        path: PathBuf::from(name),
        detail: detail.to_string(),
    }
}

/// Read a zip entry by exact name, inflating at most `limit` bytes.
/// `Ok(None)` if it does not exist.
///
/// The header's size field is not trusted: the read itself is capped.
fn read_entry<R: Read + Seek>(
    zip: &mut ZipArchive<R>,
    name: &str,
    limit: u64,
) -> Result<Option<Vec<u8>>, ConvertError> {
    let file = match zip.by_name(name) {
        Ok(file) => file,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(entry_error(name, e)),
    };
    let mut data = Vec::new();
    file.take(limit.saturating_add(1))
        .read_to_end(&mut data)
        .map_err(|e| entry_error(name, e))?;
    if data.len() as u64 > limit {
        return Err(ConvertError::EntryTooLarge {
            href: name.to_string(),
            limit,
        });
    }
    Ok(Some(data))
}

/// Declared inflated size of an entry without reading it.
fn entry_size<R: Read + Seek>(
    zip: &mut ZipArchive<R>,
    name: &str,
) -> Result<Option<u64>, ConvertError> {
    match zip.by_name(name) {
        Ok(file) => Ok(Some(file.size())),
        Err(zip::result::ZipError::FileNotFound) => Ok(None),
        Err(e) => Err(entry_error(name, e)),
    }
}

/// Join a manifest href to the OPF directory, percent-decode it and fold
/// `.`/`..` segments.
fn resolve_href(base: &str, href: &str) -> String {
    let href = href.split('#').next().unwrap_or_default();
    let decoded = percent_decode_str(href).decode_utf8_lossy();
    let joined = if base.is_empty() {
        decoded.into_owned()
    } else {
        format!("{base}/{decoded}")
    };

    let mut parts: Vec<&str> = Vec::new();
    for segment in joined.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    parts.join("/")
}

// ── XML parsing ──────────────────────────────────────────────────────────

fn strip_bom(data: &[u8]) -> &[u8] {
    data.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(data)
}

fn local_name(name: &[u8]) -> &[u8] {
    name.iter()
        .rposition(|&b| b == b':')
        .map(|i| &name[i + 1..])
        .unwrap_or(name)
}

fn attr_value(e: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == key)
        .map(|a| String::from_utf8_lossy(&a.value).into_owned())
}

/// Find the `full-path` of the first `<rootfile>` in container.xml.
fn parse_container(bytes: &[u8]) -> Result<String, String> {
    let content = std::str::from_utf8(strip_bom(bytes)).map_err(|e| e.to_string())?;
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    loop {
        match reader.read_event() {
            Ok(Event::Empty(e)) | Ok(Event::Start(e))
                if local_name(e.name().as_ref()) == b"rootfile" =>
            {
                if let Some(path) = attr_value(&e, b"full-path") {
                    return Ok(path);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(format!("container.xml: {e}")),
            _ => {}
        }
    }
    Err("no rootfile in container.xml".to_string())
}

/// Extract the first `dc:title` and the manifest, in document order.
fn parse_package(bytes: &[u8]) -> Result<PackageDocument, String> {
    let content = std::str::from_utf8(strip_bom(bytes)).map_err(|e| e.to_string())?;
    // Untrimmed: spaces around entity references inside the title matter.
    let mut reader = Reader::from_str(content);

    let mut package = PackageDocument::default();
    let mut in_metadata = false;
    let mut in_title = false;
    let mut title_seen = false;
    let mut title_buf = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match local_name(e.name().as_ref()) {
                b"metadata" => in_metadata = true,
                b"title" if in_metadata && !title_seen => {
                    in_title = true;
                    title_buf.clear();
                }
                b"item" => push_item(&mut package, &e),
                _ => {}
            },
            Ok(Event::Empty(e)) => match local_name(e.name().as_ref()) {
                b"item" => push_item(&mut package, &e),
                // `<dc:title/>` is a first title with no text.
                b"title" if in_metadata => title_seen = true,
                _ => {}
            },
            Ok(Event::Text(e)) if in_title => {
                title_buf.push_str(&String::from_utf8_lossy(e.as_ref()));
            }
            Ok(Event::CData(e)) if in_title => {
                title_buf.push_str(&String::from_utf8_lossy(e.as_ref()));
            }
            Ok(Event::GeneralRef(e)) if in_title => {
                let entity = String::from_utf8_lossy(e.as_ref());
                if let Some(resolved) = resolve_entity(&entity) {
                    title_buf.push(resolved);
                }
            }
            Ok(Event::End(e)) => match local_name(e.name().as_ref()) {
                b"metadata" => in_metadata = false,
                b"title" if in_title => {
                    in_title = false;
                    title_seen = true;
                    // Only the first title counts; a blank one means no title.
                    let title = title_buf.trim();
                    if !title.is_empty() {
                        package.title = Some(title.to_string());
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(format!("package document: {e}")),
            _ => {}
        }
    }

    Ok(package)
}

fn push_item(package: &mut PackageDocument, e: &BytesStart<'_>) {
    let (Some(href), Some(media_type)) = (attr_value(e, b"href"), attr_value(e, b"media-type"))
    else {
        debug!("Skipping manifest item without href or media-type");
        return;
    };
    package.manifest.push(ManifestEntry {
        id: attr_value(e, b"id").unwrap_or_default(),
        href,
        media_type,
    });
}

fn resolve_entity(entity: &str) -> Option<char> {
    match entity {
        "apos" => Some('\''),
        "quot" => Some('"'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "amp" => Some('&'),
        _ => {
            let code = if let Some(hex) = entity.strip_prefix("#x") {
                u32::from_str_radix(hex, 16).ok()?
            } else {
                entity.strip_prefix('#')?.parse().ok()?
            };
            char::from_u32(code)
        }
    }
}
