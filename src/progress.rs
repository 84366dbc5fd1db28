//! Progress-callback trait for per-page pipeline events.
//!
//! Inject an [`Arc<dyn PipelineProgress>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to hear about
//! each page as workers pick it up, retry it, and finish it.
//!
//! # Example
//!
//! ```rust
//! use pagescribe::{PipelineConfig, PipelineProgress};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct RetryCounter {
//!     retries: AtomicUsize,
//! }
//!
//! impl PipelineProgress for RetryCounter {
//!     fn on_attempt_failed(&self, page: usize, attempt: u32, error: &str) {
//!         self.retries.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("page {page} attempt {attempt}: {error}");
//!     }
//! }
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(Arc::new(RetryCounter { retries: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the pipeline as it processes each page.
///
/// Workers run concurrently, so every method may be called from several
/// tasks at once and in any page order. Implementations must synchronise
/// their own state. All methods default to no-ops.
pub trait PipelineProgress: Send + Sync {
    /// Called once, after rendering, with the number of pages to process.
    fn on_run_start(&self, total_pages: usize) {
        let _ = total_pages;
    }

    /// Called when a worker acquires a slot and starts its first attempt.
    fn on_page_start(&self, page: usize) {
        let _ = page;
    }

    /// Called after a failed attempt, before the backoff sleep (if any).
    ///
    /// `error` is the human-readable attempt error; validation failures and
    /// transport failures both arrive here.
    fn on_attempt_failed(&self, page: usize, attempt: u32, error: &str) {
        let _ = (page, attempt, error);
    }

    /// Called when a page produces a valid record.
    fn on_page_complete(&self, page: usize, attempts: u32) {
        let _ = (page, attempts);
    }

    /// Called when a page exhausts its attempts.
    fn on_page_error(&self, page: usize, error: &str) {
        let _ = (page, error);
    }

    /// Called once after every page has reached a terminal state.
    fn on_run_complete(&self, total_pages: usize, succeeded: usize) {
        let _ = (total_pages, succeeded);
    }
}

/// A no-op implementation, used when no callback is configured.
pub struct NoopProgress;

impl PipelineProgress for NoopProgress {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn PipelineProgress>;
