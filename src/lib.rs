//! # pagescribe
//!
//! Transcribe scanned, handwritten notes into structured Markdown with a
//! vision model.
//!
//! ## Why this crate?
//!
//! OCR engines tuned for print do poorly on handwriting: mixed slant, faint
//! pencil and ruled paper all get in the way. Instead each page is rendered,
//! cleaned up into a crisp black-on-white image and read by a multimodal
//! model that returns a small JSON record (`page_content`, `tags`, `date`).
//! Records are validated strictly and a page is retried until it produces
//! one or runs out of attempts, so one bad answer never costs the document.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Input      check the file exists and is a PDF
//!  ├─ 2. Render     rasterise pages via pdfium (spawn_blocking)
//!  │
//!  │   for each page, at most `concurrency` at a time:
//!  ├─ 3. Normalize  grayscale, denoise, adaptive threshold (spawn_blocking)
//!  ├─ 4. Infer      PNG → base64 → vision model
//!  ├─ 5. Validate   recover JSON, enforce schema, canonical date
//!  │   └─ retry with exponential backoff + jitter on any failure
//!  │
//!  └─ 6. Aggregate  page-ordered Markdown report + failed-page files
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pagescribe::{transcribe_to_file, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from GEMINI_API_KEY / OPENAI_API_KEY / …
//!     let config = PipelineConfig::default();
//!     let report = transcribe_to_file(
//!         "notes.pdf",
//!         "llm_results/all_pages.md",
//!         "llm_results/failed_responses",
//!         &config,
//!     )
//!     .await?;
//!     eprintln!("{} succeeded, {} failed", report.succeeded, report.failed);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pagescribe` binary (clap + indicatif + anyhow + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! pagescribe = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod aggregate;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod record;
pub mod scheduler;
pub mod transcribe;
pub mod worker;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use aggregate::{aggregate, DirectoryStore, FailedPage, FailedPageStore, Report};
pub use config::{LocalContrast, NormalizeParams, PipelineConfig, PipelineConfigBuilder};
pub use error::{PageError, PipelineError};
pub use pipeline::infer::{InferenceClient, InferenceError, LlmInferenceClient};
pub use pipeline::normalize::{ImageNormalizer, NormalizeError, PageNormalizer};
pub use pipeline::render::{PageRenderer, PdfiumRenderer};
pub use pipeline::validate::{validate, ValidationFailure};
pub use progress::{NoopProgress, PipelineProgress, ProgressCallback};
pub use record::{PageResult, PageTask, PipelineRun, StructuredRecord};
pub use scheduler::{PageStream, Pipeline};
pub use transcribe::{
    save_report, transcribe, transcribe_bytes, transcribe_stream, transcribe_sync,
    transcribe_to_file, transcribe_with,
};
pub use worker::{PageWorker, RetryPolicy, Sleeper, TokioSleeper};
