//! Data model shared by the worker, scheduler and aggregator.

use crate::error::PageError;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A validated transcript for one page.
///
/// Only [`crate::pipeline::validate::validate`] constructs these from model
/// output, so a record in hand always satisfies the schema: non-empty
/// `page_content`, at least one tag with no blank tags, and `date` either
/// absent or canonical `DD-MM-YYYY`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredRecord {
    /// Markdown transcription of the page.
    pub page_content: String,
    /// Topic tags in the order the model gave them.
    pub tags: Vec<String>,
    /// Canonical `DD-MM-YYYY` date, if the page carries one.
    pub date: Option<String>,
}

/// One rendered page waiting for its worker.
///
/// The image sits behind an `Arc` only so each attempt can hand it to the
/// blocking pool without copying pixels; no other worker ever sees it.
#[derive(Debug, Clone)]
pub struct PageTask {
    /// 1-indexed position in render order.
    pub page_number: usize,
    pub image: Arc<DynamicImage>,
}

impl PageTask {
    pub fn new(page_number: usize, image: DynamicImage) -> Self {
        Self {
            page_number,
            image: Arc::new(image),
        }
    }

    /// Number pages from 1 in the order given.
    pub fn from_images(images: Vec<DynamicImage>) -> Vec<PageTask> {
        images
            .into_iter()
            .enumerate()
            .map(|(i, img)| PageTask::new(i + 1, img))
            .collect()
    }
}

/// Terminal outcome of one page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageResult {
    /// 1-indexed page number.
    pub page_number: usize,
    pub ok: bool,
    /// The validated record; `Some` exactly when `ok`.
    pub content: Option<StructuredRecord>,
    /// Text of the final attempt: the model output that validated, or for a
    /// failed page the model output or error text of the last failed attempt.
    pub raw_text: Option<String>,
    /// Attempts used, always within `1..=max_retries`.
    pub attempts: u32,
    /// `Some` exactly when `!ok`.
    pub error: Option<PageError>,
    /// Wall-clock time spent on this page, backoff included.
    pub duration_ms: u64,
}

impl PageResult {
    pub(crate) fn success(
        page_number: usize,
        record: StructuredRecord,
        raw_text: String,
        attempts: u32,
        duration_ms: u64,
    ) -> Self {
        Self {
            page_number,
            ok: true,
            content: Some(record),
            raw_text: Some(raw_text),
            attempts,
            error: None,
            duration_ms,
        }
    }

    pub(crate) fn exhausted(
        page_number: usize,
        raw_text: Option<String>,
        attempts: u32,
        last_error: String,
        duration_ms: u64,
    ) -> Self {
        Self {
            page_number,
            ok: false,
            content: None,
            raw_text,
            attempts,
            error: Some(PageError::ExhaustedRetries {
                page: page_number,
                attempts,
                last_error,
            }),
            duration_ms,
        }
    }
}

/// All page outcomes of one run, keyed by page number.
///
/// Finalized once the scheduler returns it; the aggregator only reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub concurrency_cap: usize,
    results: BTreeMap<usize, PageResult>,
}

impl PipelineRun {
    pub fn new(concurrency_cap: usize) -> Self {
        Self {
            concurrency_cap,
            results: BTreeMap::new(),
        }
    }

    /// Record a page outcome.
    ///
    /// Page numbers are unique within a run, so a second result for the same
    /// page is a scheduler bug; it is dropped and `false` is returned.
    pub fn record(&mut self, result: PageResult) -> bool {
        if self.results.contains_key(&result.page_number) {
            return false;
        }
        self.results.insert(result.page_number, result);
        true
    }

    /// Results in ascending page order.
    pub fn results(&self) -> impl Iterator<Item = &PageResult> {
        self.results.values()
    }

    pub fn get(&self, page_number: usize) -> Option<&PageResult> {
        self.results.get(&page_number)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.results.values().filter(|r| r.ok).count()
    }

    pub fn failed(&self) -> usize {
        self.len() - self.succeeded()
    }
}
