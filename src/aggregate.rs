//! Report assembly: a finalized [`PipelineRun`] → one Markdown document.
//!
//! [`aggregate`] is pure. It reads the run in page order and produces the
//! report text, the success/failure counts and the raw text of every failed
//! page. Writing any of it to disk is a separate step ([`write_report`],
//! [`FailedPageStore`]) so the report can be inspected or tested without a
//! filesystem.
//!
//! ## Layout
//!
//! ```text
//! # Combined OCR Pages
//!
//! ## Page 1
//!
//! <transcript>
//!
//! _Tags: a, b_
//!
//! _Date: 05-02-2022_
//!
//! ## Page 2
//!
//! > **UNREADABLE / FAILED — saved raw response for manual review**
//! ```

use crate::error::PipelineError;
use crate::pipeline::validate::INVISIBLE_CHARS;
use crate::record::{PageResult, PipelineRun};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// First line of every report.
pub const REPORT_TITLE: &str = "# Combined OCR Pages";

/// Stands in for the transcript of a page that exhausted its attempts.
pub const FAILED_PLACEHOLDER: &str =
    "> **UNREADABLE / FAILED — saved raw response for manual review**";

/// The aggregated outcome of a run.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub markdown: String,
    pub succeeded: usize,
    pub failed: usize,
    /// Every page result in ascending page order.
    pub pages: Vec<PageResult>,
    /// Raw text to keep for each failed page, in page order.
    pub failed_pages: Vec<FailedPage>,
}

/// What gets saved for manual review when a page fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedPage {
    pub page_number: usize,
    /// Model output or error text of the last failed attempt.
    pub raw_text: String,
}

/// Build the report for a finalized run.
pub fn aggregate(run: &PipelineRun) -> Report {
    let mut lines: Vec<String> = vec![format!("{REPORT_TITLE}\n")];
    let mut failed_pages = Vec::new();

    for result in run.results() {
        lines.push(format!("## Page {}\n", result.page_number));
        match (&result.content, result.ok) {
            (Some(record), true) => {
                lines.push(format!("{}\n", tidy_page_content(&record.page_content)));
                if !record.tags.is_empty() {
                    lines.push(format!("_Tags: {}_\n", record.tags.join(", ")));
                }
                if let Some(ref date) = record.date {
                    lines.push(format!("_Date: {}_\n", date));
                }
            }
            _ => {
                lines.push(format!("{FAILED_PLACEHOLDER}\n"));
                failed_pages.push(FailedPage {
                    page_number: result.page_number,
                    raw_text: result.raw_text.clone().unwrap_or_default(),
                });
            }
        }
    }

    Report {
        markdown: lines.join("\n"),
        succeeded: run.succeeded(),
        failed: run.failed(),
        pages: run.results().cloned().collect(),
        failed_pages,
    }
}

// ── Page-content tidy-up ─────────────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:markdown|md)?\n(.*)\n```$").unwrap());

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{4,}").unwrap());

/// Light, content-preserving cleanup of a transcript before it goes into
/// the report.
///
/// Normalises line endings, strips an outer code fence the model wrapped
/// the Markdown in, trims trailing whitespace per line, collapses runs of
/// blank lines and drops invisible Unicode (zero-width spaces, BOM, soft
/// hyphens).
pub fn tidy_page_content(input: &str) -> String {
    let s = input.replace("\r\n", "\n").replace('\r', "\n");
    let s = s.trim();
    let s = match RE_OUTER_FENCES.captures(s) {
        Some(caps) => caps[1].to_string(),
        None => s.to_string(),
    };
    let s = s
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n");
    let s = RE_BLANK_LINES.replace_all(&s, "\n\n\n");
    let s = s.replace(INVISIBLE_CHARS, "");
    s.trim().to_string()
}

// ── Persistence ──────────────────────────────────────────────────────────

/// File name for a failed page's raw text: `page_007_failed.txt`.
pub fn failed_page_file_name(page_number: usize) -> String {
    format!("page_{:03}_failed.txt", page_number)
}

/// Side channel for the raw text of failed pages, keyed by page number.
#[async_trait::async_trait]
pub trait FailedPageStore: Send + Sync {
    async fn save(&self, page_number: usize, raw_text: &str) -> Result<(), PipelineError>;
}

/// Writes each failed page to `<dir>/page_NNN_failed.txt`.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    dir: PathBuf,
}

impl DirectoryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, page_number: usize) -> PathBuf {
        self.dir.join(failed_page_file_name(page_number))
    }
}

#[async_trait::async_trait]
impl FailedPageStore for DirectoryStore {
    async fn save(&self, page_number: usize, raw_text: &str) -> Result<(), PipelineError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| PipelineError::OutputWriteFailed {
                path: self.dir.clone(),
                source: e,
            })?;

        let path = self.path_for(page_number);
        tokio::fs::write(&path, raw_text)
            .await
            .map_err(|e| PipelineError::OutputWriteFailed { path: path.clone(), source: e })?;
        debug!("Saved failed page {} to {}", page_number, path.display());
        Ok(())
    }
}

impl Report {
    /// Save every failed page's raw text. Returns how many were written.
    pub async fn persist_failed(&self, store: &dyn FailedPageStore) -> Result<usize, PipelineError> {
        for page in &self.failed_pages {
            store.save(page.page_number, &page.raw_text).await?;
        }
        if !self.failed_pages.is_empty() {
            info!("Saved raw text for {} failed page(s)", self.failed_pages.len());
        }
        Ok(self.failed_pages.len())
    }
}

/// Write the report Markdown to `path`.
///
/// Uses atomic write (temp file + rename) to prevent partial files.
pub async fn write_report(markdown: &str, path: &Path) -> Result<(), PipelineError> {
    let fail = |e: std::io::Error| PipelineError::OutputWriteFailed {
        path: path.to_path_buf(),
        source: e,
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(fail)?;
    }

    let tmp_path = path.with_extension("md.tmp");
    tokio::fs::write(&tmp_path, markdown).await.map_err(fail)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(fail)?;

    info!("Report written to {}", path.display());
    Ok(())
}
