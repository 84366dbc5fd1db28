//! Whole-pipeline behaviour with in-memory doubles: no pdfium, no network.
//!
//! Each page image is `page_number` pixels wide so the fake model can tell
//! pages apart and script per-page behaviour.

use image::{DynamicImage, GrayImage};
use pagescribe::aggregate::{write_report, FAILED_PLACEHOLDER};
use pagescribe::{
    aggregate, DirectoryStore, InferenceClient, InferenceError, NormalizeError, PageError,
    PageNormalizer, PageRenderer, PageTask, Pipeline, PipelineConfig, PipelineError,
    PipelineProgress, Sleeper,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

// ── Doubles ──────────────────────────────────────────────────────────────────

struct WidthRenderer(usize);

impl PageRenderer for WidthRenderer {
    fn render(&self, _document: &Path) -> Result<Vec<DynamicImage>, PipelineError> {
        Ok((1..=self.0)
            .map(|n| DynamicImage::new_luma8(n as u32, 4))
            .collect())
    }
}

struct PassThrough;

impl PageNormalizer for PassThrough {
    fn normalize(&self, image: &DynamicImage) -> Result<GrayImage, NormalizeError> {
        Ok(image.to_luma8())
    }
}

fn valid_for(page: u32) -> String {
    format!(r#"{{"page_content":"text of page {page}","tags":["p{page}"],"date":"1-3-24"}}"#)
}

/// Answers every page validly after a short delay, tracking overlap.
#[derive(Default)]
struct OverlapClient {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

#[async_trait::async_trait]
impl InferenceClient for OverlapClient {
    async fn infer(&self, image: &GrayImage, _prompt: &str) -> Result<String, InferenceError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(valid_for(image.width()))
    }
}

/// Page 2 never produces JSON; page 3 errors once then recovers.
#[derive(Default)]
struct FlakyClient {
    calls: Mutex<HashMap<u32, u32>>,
}

#[async_trait::async_trait]
impl InferenceClient for FlakyClient {
    async fn infer(&self, image: &GrayImage, _prompt: &str) -> Result<String, InferenceError> {
        let page = image.width();
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let n = calls.entry(page).or_insert(0);
            *n += 1;
            *n
        };
        match (page, call) {
            (2, _) => Ok("I cannot read this page.".into()),
            (3, 1) => Err(InferenceError("503 Service Unavailable".into())),
            _ => Ok(valid_for(page)),
        }
    }
}

#[derive(Default)]
struct InstantSleeper {
    slept: Mutex<Vec<Duration>>,
}

#[async_trait::async_trait]
impl Sleeper for InstantSleeper {
    async fn sleep(&self, duration: Duration) {
        self.slept.lock().unwrap().push(duration);
    }
}

#[derive(Default)]
struct Counts {
    started: AtomicUsize,
    attempts_failed: AtomicUsize,
    completed: AtomicUsize,
    errored: AtomicUsize,
    run_total: AtomicUsize,
}

impl PipelineProgress for Counts {
    fn on_run_start(&self, total_pages: usize) {
        self.run_total.store(total_pages, Ordering::SeqCst);
    }
    fn on_page_start(&self, _page: usize) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }
    fn on_attempt_failed(&self, _page: usize, _attempt: u32, _error: &str) {
        self.attempts_failed.fetch_add(1, Ordering::SeqCst);
    }
    fn on_page_complete(&self, _page: usize, _attempts: u32) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }
    fn on_page_error(&self, _page: usize, _error: &str) {
        self.errored.fetch_add(1, Ordering::SeqCst);
    }
}

fn config(concurrency: usize) -> PipelineConfig {
    PipelineConfig::builder()
        .concurrency(concurrency)
        .max_retries(3)
        .retry_backoff_ms(100)
        .max_jitter_ms(0)
        .build()
        .unwrap()
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn concurrency_never_exceeds_cap() {
    let client = Arc::new(OverlapClient::default());
    let pipeline = Pipeline::new(
        config(2),
        client.clone(),
        Arc::new(WidthRenderer(5)),
        Arc::new(PassThrough),
    );

    let run = assert_ok!(pipeline.run(Path::new("notes.pdf")).await);

    assert_eq!(run.len(), 5);
    assert_eq!(run.succeeded(), 5);
    let peak = client.max_in_flight.load(Ordering::SeqCst);
    assert!(peak <= 2, "peak in-flight was {peak}");
    assert!(peak >= 1);
}

#[tokio::test]
async fn failing_page_exhausts_while_others_succeed() {
    let sleeper = Arc::new(InstantSleeper::default());
    let counts = Arc::new(Counts::default());
    let cfg = PipelineConfig::builder()
        .concurrency(2)
        .max_retries(3)
        .retry_backoff_ms(100)
        .max_jitter_ms(0)
        .progress_callback(counts.clone())
        .build()
        .unwrap();
    let pipeline = Pipeline::new(
        cfg,
        Arc::new(FlakyClient::default()),
        Arc::new(WidthRenderer(4)),
        Arc::new(PassThrough),
    )
    .with_sleeper(sleeper.clone());

    let run = assert_ok!(pipeline.run(Path::new("notes.pdf")).await);

    assert_eq!(run.len(), 4);
    assert_eq!(run.succeeded(), 3);
    assert_eq!(run.failed(), 1);

    let bad = run.get(2).unwrap();
    assert!(!bad.ok);
    assert_eq!(bad.attempts, 3);
    assert!(bad.content.is_none());
    assert_eq!(bad.raw_text.as_deref(), Some("I cannot read this page."));
    match bad.error.as_ref().unwrap() {
        PageError::ExhaustedRetries { page, attempts, .. } => {
            assert_eq!((*page, *attempts), (2, 3));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let recovered = run.get(3).unwrap();
    assert!(recovered.ok);
    assert_eq!(recovered.attempts, 2);
    assert_eq!(recovered.content.as_ref().unwrap().date.as_deref(), Some("01-03-2024"));

    assert_eq!(run.get(1).unwrap().attempts, 1);
    assert_eq!(run.get(4).unwrap().attempts, 1);

    // Page 2 slept twice (100ms, 200ms); page 3 slept once (100ms).
    let mut slept = sleeper.slept.lock().unwrap().clone();
    slept.sort();
    assert_eq!(
        slept,
        vec![
            Duration::from_millis(100),
            Duration::from_millis(100),
            Duration::from_millis(200)
        ]
    );

    assert_eq!(counts.run_total.load(Ordering::SeqCst), 4);
    assert_eq!(counts.started.load(Ordering::SeqCst), 4);
    assert_eq!(counts.attempts_failed.load(Ordering::SeqCst), 4);
    assert_eq!(counts.completed.load(Ordering::SeqCst), 3);
    assert_eq!(counts.errored.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn report_is_in_page_order_with_placeholder() {
    let pipeline = Pipeline::new(
        config(4),
        Arc::new(FlakyClient::default()),
        Arc::new(WidthRenderer(3)),
        Arc::new(PassThrough),
    )
    .with_sleeper(Arc::new(InstantSleeper::default()));

    let run = assert_ok!(pipeline.run(Path::new("notes.pdf")).await);
    let report = aggregate(&run);

    let md = &report.markdown;
    assert!(md.starts_with("# Combined OCR Pages\n"));
    let positions: Vec<usize> = (1..=3)
        .map(|n| md.find(&format!("## Page {n}\n")).unwrap())
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]));
    assert!(md.contains("text of page 1"));
    assert!(md.contains("_Tags: p3_"));
    assert!(md.contains("_Date: 01-03-2024_"));
    assert!(md.contains(FAILED_PLACEHOLDER));
    assert!(!md.contains("text of page 2"));

    assert_eq!((report.succeeded, report.failed), (2, 1));
    let pages: Vec<usize> = report.pages.iter().map(|p| p.page_number).collect();
    assert_eq!(pages, vec![1, 2, 3]);
}

#[tokio::test]
async fn failed_pages_and_report_are_written() {
    let pipeline = Pipeline::new(
        config(2),
        Arc::new(FlakyClient::default()),
        Arc::new(WidthRenderer(2)),
        Arc::new(PassThrough),
    )
    .with_sleeper(Arc::new(InstantSleeper::default()));
    let report = aggregate(&assert_ok!(pipeline.run(Path::new("notes.pdf")).await));

    let dir = tempfile::tempdir().unwrap();
    let store = DirectoryStore::new(dir.path().join("failed_responses"));
    let saved = assert_ok!(report.persist_failed(&store).await);
    assert_eq!(saved, 1);

    let failed = std::fs::read_to_string(store.path_for(2)).unwrap();
    assert_eq!(failed, "I cannot read this page.");
    assert!(store.dir().join("page_002_failed.txt").exists());
    assert!(!store.path_for(1).exists());

    let report_path = dir.path().join("out/all_pages.md");
    assert_ok!(write_report(&report.markdown, &report_path).await);
    assert_eq!(std::fs::read_to_string(&report_path).unwrap(), report.markdown);
    assert!(!report_path.with_extension("md.tmp").exists());
}

#[tokio::test]
async fn tasks_start_in_page_order() {
    struct OrderClient(Mutex<Vec<u32>>);

    #[async_trait::async_trait]
    impl InferenceClient for OrderClient {
        async fn infer(&self, image: &GrayImage, _prompt: &str) -> Result<String, InferenceError> {
            self.0.lock().unwrap().push(image.width());
            Ok(valid_for(image.width()))
        }
    }

    let client = Arc::new(OrderClient(Mutex::new(Vec::new())));
    let pipeline = Pipeline::new(
        config(1),
        client.clone(),
        Arc::new(WidthRenderer(0)),
        Arc::new(PassThrough),
    );
    let tasks = (1..=4)
        .map(|n| PageTask::new(n, DynamicImage::new_luma8(n as u32, 2)))
        .collect();
    let run = pipeline.run_tasks(tasks).await;

    assert_eq!(run.succeeded(), 4);
    assert_eq!(*client.0.lock().unwrap(), vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn document_without_pages_is_fatal() {
    let pipeline = Pipeline::new(
        config(2),
        Arc::new(OverlapClient::default()),
        Arc::new(WidthRenderer(0)),
        Arc::new(PassThrough),
    );
    let err = assert_err!(pipeline.run(Path::new("blank.pdf")).await);
    assert!(matches!(err, PipelineError::EmptyDocument { .. }));
}

#[tokio::test]
async fn missing_input_fails_before_any_provider_lookup() {
    let err = assert_err!(
        pagescribe::transcribe("/definitely/not/here.pdf", &PipelineConfig::default()).await
    );
    assert!(matches!(err, PipelineError::FileNotFound { .. }));
}
