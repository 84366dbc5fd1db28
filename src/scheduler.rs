//! Bounded fan-out of page workers, and the streaming API built on it.
//!
//! ## Why `buffer_unordered`?
//!
//! Every page is independent, so pages run concurrently under a hard cap.
//! `stream::iter(tasks).buffer_unordered(cap)` polls at most `cap` worker
//! futures at a time and starts the next queued page, in page order, the
//! moment a slot frees up. No semaphore or thread pool to manage, and the
//! CPU-heavy parts (rendering, normalization) go to `spawn_blocking`.
//!
//! Results arrive in completion order. [`Pipeline::run`] collects them into
//! a [`PipelineRun`] keyed by page number; [`Pipeline::stream_pages`] hands
//! them out as they finish.

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::pipeline::infer::{InferenceClient, LlmInferenceClient};
use crate::pipeline::normalize::{ImageNormalizer, PageNormalizer};
use crate::pipeline::render::{PageRenderer, PdfiumRenderer};
use crate::prompts::DEFAULT_TRANSCRIBE_PROMPT;
use crate::record::{PageResult, PageTask, PipelineRun};
use crate::worker::{PageWorker, Sleeper};
use futures::stream::{self, StreamExt};
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::Stream;
use tracing::{info, warn};

/// A boxed stream of page results, in completion order.
pub type PageStream = Pin<Box<dyn Stream<Item = PageResult> + Send>>;

/// A configured transcription pipeline.
///
/// Holds everything a run needs: the config, the shared inference client,
/// the renderer and the normalizer. Nothing is read from globals.
///
/// # Example
/// ```rust,no_run
/// use pagescribe::{Pipeline, PipelineConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let pipeline = Pipeline::from_config(PipelineConfig::default())?;
/// let run = pipeline.run(std::path::Path::new("notes.pdf")).await?;
/// println!("{} of {} pages transcribed", run.succeeded(), run.len());
/// # Ok(())
/// # }
/// ```
pub struct Pipeline {
    config: PipelineConfig,
    renderer: Arc<dyn PageRenderer>,
    worker: PageWorker,
}

impl Pipeline {
    /// `config` may be hand-built; a zero concurrency cap or attempt limit is
    /// raised to 1.
    pub fn new(
        mut config: PipelineConfig,
        client: Arc<dyn InferenceClient>,
        renderer: Arc<dyn PageRenderer>,
        normalizer: Arc<dyn PageNormalizer>,
    ) -> Self {
        if config.concurrency == 0 {
            warn!("concurrency 0 is not allowed, using 1");
            config.concurrency = 1;
        }
        if config.max_retries == 0 {
            warn!("max_retries 0 is not allowed, using 1");
            config.max_retries = 1;
        }
        let prompt = config
            .prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_TRANSCRIBE_PROMPT.to_string());
        let mut worker = PageWorker::new(client, normalizer, config.retry_policy(), prompt);
        if let Some(ref cb) = config.progress_callback {
            worker = worker.with_progress(Arc::clone(cb));
        }
        Self {
            config,
            renderer,
            worker,
        }
    }

    /// Build the production pipeline: pdfium rendering, `imageproc`
    /// normalization and the provider resolved from `config`.
    pub fn from_config(config: PipelineConfig) -> Result<Self, PipelineError> {
        let client = Arc::new(LlmInferenceClient::from_config(&config)?);
        let renderer = Arc::new(PdfiumRenderer::from_config(&config));
        let normalizer = Arc::new(ImageNormalizer::new(config.normalize.clone()));
        Ok(Self::new(config, client, renderer, normalizer))
    }

    /// Replace the backoff sleeper (tests use one that returns immediately).
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.worker = self.worker.with_sleeper(sleeper);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Render `document` into page tasks numbered from 1.
    ///
    /// Any renderer failure, or a document with no pages, is fatal.
    pub async fn render(&self, document: &Path) -> Result<Vec<PageTask>, PipelineError> {
        let renderer = Arc::clone(&self.renderer);
        let path = document.to_path_buf();

        let images = tokio::task::spawn_blocking(move || renderer.render(&path))
            .await
            .map_err(|e| PipelineError::Internal(format!("Render task panicked: {}", e)))??;

        if images.is_empty() {
            return Err(PipelineError::EmptyDocument {
                path: document.to_path_buf(),
            });
        }
        Ok(PageTask::from_images(images))
    }

    /// Render `document` and process every page.
    ///
    /// Only rendering can fail; page failures are inside the returned run.
    pub async fn run(&self, document: &Path) -> Result<PipelineRun, PipelineError> {
        info!("Starting transcription: {}", document.display());
        let tasks = self.render(document).await?;
        Ok(self.run_tasks(tasks).await)
    }

    /// Process already-rendered pages and collect every result.
    ///
    /// Page numbers must be unique; a repeated page number keeps the first
    /// result to finish and the rest are dropped with a warning.
    pub async fn run_tasks(&self, tasks: Vec<PageTask>) -> PipelineRun {
        let total = tasks.len();
        let cap = self.config.concurrency;
        info!("Processing {} pages (concurrency={})", total, cap);
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_run_start(total);
        }

        let mut run = PipelineRun::new(cap);
        let mut results = self.stream_pages(tasks);
        while let Some(result) = results.next().await {
            let page = result.page_number;
            if !run.record(result) {
                warn!("Page {}: duplicate result dropped", page);
            }
        }

        info!(
            "Run complete: {} succeeded, {} failed",
            run.succeeded(),
            run.failed()
        );
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_run_complete(total, run.succeeded());
        }
        run
    }

    /// Process pages with at most `concurrency` in flight, yielding each
    /// [`PageResult`] as soon as its page reaches a terminal state.
    ///
    /// Pages start in the order given. The stream owns everything it needs
    /// and can outlive `self`.
    pub fn stream_pages(&self, tasks: Vec<PageTask>) -> PageStream {
        let worker = self.worker.clone();
        let s = stream::iter(tasks.into_iter().map(move |task| {
            let worker = worker.clone();
            async move { worker.process(task).await }
        }))
        .buffer_unordered(self.config.concurrency.max(1));

        Box::pin(s)
    }
}
