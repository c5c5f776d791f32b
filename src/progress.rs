//! Progress-callback trait for conversion stage events.
//!
//! Inject an [`Arc<dyn ConversionProgressCallback>`] via
//! [`crate::config::ConversionConfigBuilder::progress_callback`] to be told
//! as a job moves through its stages. The CLI binds a spinner to it; a host
//! application could forward events to a channel or a job table instead.
//!
//! # Example
//!
//! ```rust
//! use epub2pdf::{ConversionConfig, ConversionProgressCallback, Stage};
//! use std::sync::Arc;
//!
//! struct Printer;
//!
//! impl ConversionProgressCallback for Printer {
//!     fn on_stage(&self, stage: Stage) {
//!         eprintln!("→ {}", stage);
//!     }
//! }
//!
//! let config = ConversionConfig::builder()
//!     .progress_callback(Arc::new(Printer))
//!     .build()
//!     .unwrap();
//! ```

use crate::convert::Stage;
use std::sync::Arc;

/// Called by the pipeline as a conversion progresses.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. The server may run several jobs at once, so
/// implementations shared between jobs must synchronise their own state.
pub trait ConversionProgressCallback: Send + Sync {
    /// Called once when the job starts, with a label for the input.
    fn on_conversion_start(&self, input: &str) {
        let _ = input;
    }

    /// Called each time the job reaches a new stage.
    fn on_stage(&self, stage: Stage) {
        let _ = stage;
    }

    /// Called once after the PDF has been produced.
    ///
    /// # Arguments
    /// * `page_count` — pages in the rendered PDF
    /// * `pdf_bytes`  — size of the PDF
    fn on_conversion_complete(&self, page_count: usize, pdf_bytes: usize) {
        let _ = (page_count, pdf_bytes);
    }

    /// Called once if the job fails, with the operator-facing message.
    fn on_conversion_error(&self, error: &str) {
        let _ = error;
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl ConversionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ConversionConfig`].
pub type ProgressCallback = Arc<dyn ConversionProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        stages: Mutex<Vec<Stage>>,
        errors: Mutex<Vec<String>>,
    }

    impl ConversionProgressCallback for Recorder {
        fn on_stage(&self, stage: Stage) {
            self.stages.lock().unwrap().push(stage);
        }

        fn on_conversion_error(&self, error: &str) {
            self.errors.lock().unwrap().push(error.to_string());
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_conversion_start("book.epub");
        cb.on_stage(Stage::Extracted);
        cb.on_conversion_complete(3, 1024);
        cb.on_conversion_error("boom");
    }

    #[test]
    fn recorder_sees_stages_in_order() {
        let rec = Recorder::default();
        rec.on_stage(Stage::Received);
        rec.on_stage(Stage::Validated);
        rec.on_conversion_error("render failed");
        assert_eq!(
            *rec.stages.lock().unwrap(),
            vec![Stage::Received, Stage::Validated]
        );
        assert_eq!(rec.errors.lock().unwrap().len(), 1);
    }

    #[test]
    fn arc_dyn_callback_works() {
        let cb: ProgressCallback = Arc::new(NoopProgressCallback);
        cb.on_stage(Stage::Rendered);
    }
}
