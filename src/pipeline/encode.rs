//! Image inlining: raw image bytes → `<img>` tag with a base64 `data:` URI.
//!
//! The assembled document must be self-contained, so every image item is
//! embedded rather than referenced. The subtype in the URI comes from the
//! byte signature, not from the manifest: EPUBs in the wild routinely
//! declare `image/jpeg` for PNG files, and renderers trust the URI.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::ImageFormat;
use tracing::{debug, warn};

/// Map the byte signature to a MIME subtype (`png`, `jpeg`, …).
pub fn sniff_image_subtype(data: &[u8]) -> Option<&'static str> {
    let format = image::guess_format(data).ok()?;
    let subtype = match format {
        ImageFormat::Png => "png",
        ImageFormat::Jpeg => "jpeg",
        ImageFormat::Gif => "gif",
        ImageFormat::WebP => "webp",
        ImageFormat::Tiff => "tiff",
        ImageFormat::Bmp => "bmp",
        ImageFormat::Ico => "x-icon",
        ImageFormat::Avif => "avif",
        _ => return None,
    };
    Some(subtype)
}

/// Subtype to put in the data URI: sniffed signature first, then the
/// declared media type's subtype, then `octet-stream`.
pub fn resolve_subtype(data: &[u8], declared_media_type: &str, href: &str) -> String {
    if let Some(sniffed) = sniff_image_subtype(data) {
        return sniffed.to_string();
    }
    let declared = declared_media_type
        .strip_prefix("image/")
        .filter(|s| !s.is_empty());
    match declared {
        Some(subtype) => {
            warn!(
                "Unrecognised image signature in '{}', using declared type image/{}",
                href, subtype
            );
            subtype.to_string()
        }
        None => {
            warn!("Unrecognised image signature in '{}', using octet-stream", href);
            "octet-stream".to_string()
        }
    }
}

/// Build the `<img>` element for an image item.
pub fn image_tag(data: &[u8], declared_media_type: &str, href: &str) -> String {
    let subtype = resolve_subtype(data, declared_media_type, href);
    let b64 = STANDARD.encode(data);
    debug!("Inlined {} as image/{} ({} bytes base64)", href, subtype, b64.len());
    format!(r#"<img src="data:image/{subtype};base64,{b64}" />"#)
}
