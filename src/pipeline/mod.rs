//! Pipeline stages for EPUB-to-PDF conversion.
//!
//! Each submodule implements exactly one transformation step.
//! Keeping stages separate makes each independently testable and lets us
//! swap the rendering backend without touching extraction.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ archive ──▶ extract ──▶ render ──▶ PDF
//! (gate)    (zip/OPF)   (+encode)   (layout)
//! ```
//!
//! 1. [`input`]: filename gate for uploads; path/URL resolution for the CLI
//! 2. [`archive`]: open the zip, read the first title and the manifest items
//! 3. [`extract`]: assemble `<style>…</style>` + body markup; [`encode`]
//!    inlines images as `data:` URIs
//! 4. [`render`]: the engine seam and the built-in engine, which uses
//!    [`layout`] to flow and paginate the markup

pub mod archive;
pub mod cancel;
pub mod encode;
pub mod extract;
pub mod input;
pub mod layout;
pub mod render;
