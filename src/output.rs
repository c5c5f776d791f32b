//! Result types returned by the conversion entry points.

use crate::pipeline::archive::ItemKind;
use crate::pipeline::extract::ExtractionStats;
use serde::Serialize;

/// A finished conversion held in memory.
#[derive(Debug, Clone)]
pub struct ConversionOutput {
    /// First `dc:title` of the book.
    pub title: String,
    /// Download name, `{title}.pdf`.
    pub file_name: String,
    pub pdf: Vec<u8>,
    pub stats: ConversionStats,
}

/// Statistics about a completed conversion.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConversionStats {
    #[serde(flatten)]
    pub extraction: ExtractionStats,
    pub page_count: usize,
    pub pdf_bytes: usize,
    pub extract_duration_ms: u64,
    pub render_duration_ms: u64,
    pub total_duration_ms: u64,
}

/// What `inspect` reports about an archive without rendering it.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveSummary {
    pub title: Option<String>,
    pub items: Vec<ItemSummary>,
}

impl ArchiveSummary {
    pub fn count(&self, kind: ItemKind) -> usize {
        self.items.iter().filter(|i| i.kind == kind).count()
    }
}

/// One manifest entry as seen by `inspect`.
#[derive(Debug, Clone, Serialize)]
pub struct ItemSummary {
    pub id: String,
    pub href: String,
    pub media_type: String,
    pub kind: ItemKind,
    /// Inflated size. Taken from the zip header for items never loaded.
    pub bytes: u64,
}

/// Download filename for a title.
pub fn pdf_file_name(title: &str) -> String {
    format!("{title}.pdf")
}
