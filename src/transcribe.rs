//! Top-level entry points: document in, [`Report`] out.
//!
//! These wire the stages together for the common case: validate the input,
//! build a [`Pipeline`] from the config, run it, aggregate. Callers that
//! inject their own client, renderer or normalizer build a [`Pipeline`]
//! directly and call [`transcribe_with`].

use crate::aggregate::{aggregate, write_report, DirectoryStore, Report};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::pipeline::input::{self, ResolvedInput};
use crate::scheduler::{PageStream, Pipeline};
use std::path::Path;
use std::time::Instant;
use tracing::info;

/// Transcribe a local PDF.
///
/// # Returns
/// `Ok(Report)` whenever the document rendered, even if some pages failed
/// (check `report.failed`).
///
/// # Errors
/// Returns `Err(PipelineError)` only for fatal errors:
/// - File not found, permission denied or not a PDF
/// - The PDF cannot be opened or rendered
/// - No inference provider could be configured
///
/// # Example
/// ```rust,no_run
/// use pagescribe::{transcribe, PipelineConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = PipelineConfig::builder().concurrency(4).build()?;
/// let report = transcribe("notes.pdf", &config).await?;
/// println!("{}", report.markdown);
/// # Ok(())
/// # }
/// ```
pub async fn transcribe(
    input: impl AsRef<Path>,
    config: &PipelineConfig,
) -> Result<Report, PipelineError> {
    let resolved = input::resolve_local(input)?;
    let pipeline = Pipeline::from_config(config.clone())?;
    run_resolved(&pipeline, &resolved).await
}

/// Transcribe a local PDF with a pre-built pipeline.
pub async fn transcribe_with(
    pipeline: &Pipeline,
    input: impl AsRef<Path>,
) -> Result<Report, PipelineError> {
    let resolved = input::resolve_local(input)?;
    run_resolved(pipeline, &resolved).await
}

/// Transcribe PDF bytes held in memory.
///
/// The bytes are spilled to a temporary file for the renderer; the file is
/// removed when this returns.
pub async fn transcribe_bytes(
    bytes: &[u8],
    config: &PipelineConfig,
) -> Result<Report, PipelineError> {
    let resolved = input::resolve_bytes(bytes)?;
    let pipeline = Pipeline::from_config(config.clone())?;
    run_resolved(&pipeline, &resolved).await
}

/// Transcribe a PDF, write the report to `report_path` and save each failed
/// page's raw text under `failed_dir`.
pub async fn transcribe_to_file(
    input: impl AsRef<Path>,
    report_path: impl AsRef<Path>,
    failed_dir: impl AsRef<Path>,
    config: &PipelineConfig,
) -> Result<Report, PipelineError> {
    let report = transcribe(input, config).await?;
    save_report(&report, report_path.as_ref(), failed_dir.as_ref()).await?;
    Ok(report)
}

/// Write `report` and its failed pages to disk.
pub async fn save_report(
    report: &Report,
    report_path: &Path,
    failed_dir: &Path,
) -> Result<(), PipelineError> {
    write_report(&report.markdown, report_path).await?;
    report
        .persist_failed(&DirectoryStore::new(failed_dir))
        .await?;
    Ok(())
}

/// Transcribe a PDF, yielding page results as they complete.
///
/// The document is rendered before this returns, so render errors surface
/// here rather than inside the stream.
pub async fn transcribe_stream(
    input: impl AsRef<Path>,
    config: &PipelineConfig,
) -> Result<PageStream, PipelineError> {
    let resolved = input::resolve_local(input)?;
    let pipeline = Pipeline::from_config(config.clone())?;
    let tasks = pipeline.render(resolved.path()).await?;
    Ok(pipeline.stream_pages(tasks))
}

/// Synchronous wrapper around [`transcribe`].
///
/// Creates a temporary tokio runtime internally.
pub fn transcribe_sync(
    input: impl AsRef<Path>,
    config: &PipelineConfig,
) -> Result<Report, PipelineError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| PipelineError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(transcribe(input, config))
}

async fn run_resolved(
    pipeline: &Pipeline,
    resolved: &ResolvedInput,
) -> Result<Report, PipelineError> {
    let start = Instant::now();
    let run = pipeline.run(resolved.path()).await?;
    let report = aggregate(&run);
    info!(
        "Transcription complete: {}/{} pages, {}ms total",
        report.succeeded,
        run.len(),
        start.elapsed().as_millis()
    );
    Ok(report)
}
