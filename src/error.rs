//! Error types for the pagescribe library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`PipelineError`] is **fatal**. The run cannot proceed at all (missing
//!   file, unreadable PDF, provider not configured). Returned as
//!   `Err(PipelineError)` from the top-level `transcribe*` functions and from
//!   [`crate::scheduler::Pipeline::run`]. No partial report exists.
//!
//! * [`PageError`] is **non-fatal**. One attempt at one page failed (bad
//!   normalization, transient API error, output that does not validate), or
//!   the page ran out of attempts. Stored inside [`crate::record::PageResult`]
//!   so a single bad page never costs the rest of the document.

use crate::pipeline::validate::ValidationFailure;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the pagescribe library.
///
/// Page-level failures use [`PageError`] and are stored in
/// [`crate::record::PageResult`] rather than propagated here.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    // ── Render errors ─────────────────────────────────────────────────────
    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{path}' is corrupt: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    /// PDF requires a password but none was provided.
    #[error("PDF '{path}' is encrypted and requires a password.\nProvide it with --password <PASSWORD>.")]
    PasswordRequired { path: PathBuf },

    /// A password was provided but it is wrong.
    #[error("Wrong password for PDF '{path}'")]
    WrongPassword { path: PathBuf },

    /// pdfium could not rasterise one of the pages.
    #[error("Rendering failed for page {page}: {detail}")]
    RenderFailed { page: usize, detail: String },

    /// The document opened fine but has no pages to transcribe.
    #[error("PDF '{path}' has no pages")]
    EmptyDocument { path: PathBuf },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
Install pdfium system-wide, or set PDFIUM_LIB_PATH=/path/to/libpdfium."
    )]
    PdfiumBindingFailed(String),

    // ── Inference setup errors ────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the report or a failed-page file.
    #[error("Failed to write '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single page.
///
/// Every variant but [`PageError::ExhaustedRetries`] describes one failed
/// attempt and is retried by the worker. `ExhaustedRetries` is terminal and
/// is what a failed [`crate::record::PageResult`] carries.
#[derive(Debug, Clone, PartialEq, Error, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PageError {
    /// The normalizer rejected the page image.
    #[error("Page {page}: normalization failed: {detail}")]
    Normalize { page: usize, detail: String },

    /// The inference service returned an error.
    #[error("Page {page}: inference call failed: {detail}")]
    Inference { page: usize, detail: String },

    /// The inference call did not answer within the per-attempt deadline.
    #[error("Page {page}: inference call timed out after {secs}s")]
    Timeout { page: usize, secs: u64 },

    /// The model answered, but the answer is not a valid record.
    #[error("Page {page}: {failure}")]
    Validation {
        page: usize,
        failure: ValidationFailure,
    },

    /// Every attempt failed.
    #[error("Page {page}: exhausted {attempts} attempts; last error: {last_error}")]
    ExhaustedRetries {
        page: usize,
        attempts: u32,
        last_error: String,
    },
}

impl PageError {
    /// Stable machine-readable code, used in JSON output and logs.
    pub fn code(&self) -> &'static str {
        match self {
            PageError::Normalize { .. } => "normalize_failed",
            PageError::Inference { .. } => "inference_failed",
            PageError::Timeout { .. } => "timeout",
            PageError::Validation { .. } => "validation_failed",
            PageError::ExhaustedRetries { .. } => "exhausted_retries",
        }
    }

    /// True for failures of the model's output rather than of the call itself.
    pub fn is_validation(&self) -> bool {
        matches!(self, PageError::Validation { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_code_is_stable() {
        let e = PageError::ExhaustedRetries {
            page: 4,
            attempts: 3,
            last_error: "boom".into(),
        };
        assert_eq!(e.code(), "exhausted_retries");
        assert!(e.to_string().contains("Page 4"));
        assert!(e.to_string().contains("3 attempts"));
    }

    #[test]
    fn validation_is_distinguished_from_transport() {
        let v = PageError::Validation {
            page: 1,
            failure: ValidationFailure::Unparsable,
        };
        let t = PageError::Timeout { page: 1, secs: 30 };
        assert!(v.is_validation());
        assert!(!t.is_validation());
        assert_eq!(t.code(), "timeout");
        assert!(t.to_string().contains("30s"));
    }

    #[test]
    fn page_error_serialises_with_kind_tag() {
        let e = PageError::Inference {
            page: 2,
            detail: "503".into(),
        };
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["kind"], "inference");
        assert_eq!(json["page"], 2);
    }

    #[test]
    fn not_a_pdf_display() {
        let e = PipelineError::NotAPdf {
            path: PathBuf::from("/tmp/x.txt"),
            magic: *b"GIF8",
        };
        assert!(e.to_string().contains("/tmp/x.txt"));
    }
}
