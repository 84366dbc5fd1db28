//! Per-page retry loop: normalize → infer → validate, with bounded retries.
//!
//! Each page is driven through an explicit [`WorkerState`] machine:
//!
//! ```text
//! Pending ──▶ InFlight ──▶ Valid                               (done)
//!                │
//!                └──▶ Retryable ──▶ Backoff ──▶ InFlight …
//!                         │
//!                         └──▶ Exhausted                       (done)
//! ```
//!
//! Every failure is retryable: a normalizer error, a transport error, a
//! deadline miss and an answer that does not validate all cost one attempt.
//! Nothing escapes a worker; the outcome is always a [`PageResult`].
//!
//! ## Backoff
//!
//! HTTP 429 / 503 answers are common under concurrent load. The delay before
//! attempt `n + 1` is `base * 2^(n-1)` plus uniform jitter in
//! `[0, max_jitter]`, so with the defaults pages wait 1 s → 2 s (+ ≤ 0.5 s)
//! and concurrent workers do not retry in lockstep. Sleeping goes through a
//! [`Sleeper`] so tests can record delays instead of waiting them out.

use crate::error::PageError;
use crate::pipeline::infer::InferenceClient;
use crate::pipeline::normalize::{NormalizeError, PageNormalizer};
use crate::pipeline::validate::validate;
use crate::progress::{NoopProgress, ProgressCallback};
use crate::record::{PageResult, PageTask, StructuredRecord};
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Attempt limits, backoff and the per-attempt deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts allowed, the first included.
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_jitter: Duration,
    /// Deadline for one inference call; `None` waits indefinitely.
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_secs(1),
            max_jitter: Duration::from_millis(500),
            attempt_timeout: Some(Duration::from_secs(120)),
        }
    }
}

impl RetryPolicy {
    /// Backoff after the `attempts`-th failed attempt, plus `jitter`.
    pub fn delay(&self, attempts: u32, jitter: Duration) -> Duration {
        let factor = 2u32.saturating_pow(attempts.saturating_sub(1));
        self.base_backoff.saturating_mul(factor).saturating_add(jitter)
    }

    /// Uniform jitter in `[0, max_jitter]`, at millisecond resolution.
    pub fn sample_jitter(&self) -> Duration {
        let max_ms = self.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }

    /// Whether another attempt is allowed after `attempts` have been used.
    pub fn allows_another(&self, attempts: u32) -> bool {
        attempts < self.max_retries
    }
}

/// Suspends a worker between attempts.
#[async_trait::async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Real sleeping on the Tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait::async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Where a page is in its retry cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerState {
    Pending,
    InFlight,
    Retryable { error: PageError },
    Backoff { delay: Duration },
    Valid { record: StructuredRecord, raw_text: String },
    Exhausted { error: PageError },
}

impl WorkerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Valid { .. } | WorkerState::Exhausted { .. })
    }
}

/// One failed attempt: the error, plus the text to keep for manual review.
struct AttemptFailure {
    error: PageError,
    raw_text: String,
}

/// Drives single pages to a terminal [`PageResult`].
///
/// Cheap to share: everything inside is behind an `Arc`.
#[derive(Clone)]
pub struct PageWorker {
    client: Arc<dyn InferenceClient>,
    normalizer: Arc<dyn PageNormalizer>,
    sleeper: Arc<dyn Sleeper>,
    progress: ProgressCallback,
    policy: RetryPolicy,
    prompt: Arc<str>,
}

impl PageWorker {
    pub fn new(
        client: Arc<dyn InferenceClient>,
        normalizer: Arc<dyn PageNormalizer>,
        policy: RetryPolicy,
        prompt: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            client,
            normalizer,
            sleeper: Arc::new(TokioSleeper),
            progress: Arc::new(NoopProgress),
            policy,
            prompt: prompt.into(),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = progress;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run one page to completion. Never fails; failures are in the result.
    pub async fn process(&self, task: PageTask) -> PageResult {
        let start = Instant::now();
        let page = task.page_number;
        let max = self.policy.max_retries;
        let mut attempts = 0u32;
        let mut last_raw: Option<String> = None;
        let mut state = WorkerState::Pending;

        let outcome = loop {
            state = match state {
                WorkerState::Pending => {
                    self.progress.on_page_start(page);
                    WorkerState::InFlight
                }
                WorkerState::InFlight => {
                    attempts += 1;
                    debug!("Page {}: attempt {}/{}", page, attempts, max);
                    match self.attempt(&task).await {
                        Ok((record, raw_text)) => WorkerState::Valid { record, raw_text },
                        Err(failed) => {
                            last_raw = Some(failed.raw_text);
                            WorkerState::Retryable {
                                error: failed.error,
                            }
                        }
                    }
                }
                WorkerState::Retryable { error } => {
                    if error.is_validation() {
                        warn!("Page {}: attempt {}/{} rejected: {}", page, attempts, max, error);
                    } else {
                        warn!("Page {}: attempt {}/{} failed: {}", page, attempts, max, error);
                    }
                    self.progress
                        .on_attempt_failed(page, attempts, &error.to_string());

                    if self.policy.allows_another(attempts) {
                        let delay = self.policy.delay(attempts, self.policy.sample_jitter());
                        WorkerState::Backoff { delay }
                    } else {
                        WorkerState::Exhausted { error }
                    }
                }
                WorkerState::Backoff { delay } => {
                    debug!("Page {}: retrying in {:?}", page, delay);
                    self.sleeper.sleep(delay).await;
                    WorkerState::InFlight
                }
                WorkerState::Valid { record, raw_text } => break Ok((record, raw_text)),
                WorkerState::Exhausted { error } => break Err(error),
            };
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        match outcome {
            Ok((record, raw_text)) => {
                debug!("Page {}: valid after {} attempt(s)", page, attempts);
                self.progress.on_page_complete(page, attempts);
                PageResult::success(page, record, raw_text, attempts, duration_ms)
            }
            Err(error) => {
                warn!("Page {}: giving up after {} attempts", page, attempts);
                let result =
                    PageResult::exhausted(page, last_raw, attempts, error.to_string(), duration_ms);
                let message = result.error.as_ref().map(|e| e.to_string()).unwrap_or_default();
                self.progress.on_page_error(page, &message);
                result
            }
        }
    }

    /// One normalize → infer → validate cycle.
    async fn attempt(&self, task: &PageTask) -> Result<(StructuredRecord, String), AttemptFailure> {
        let page = task.page_number;

        let image = Arc::clone(&task.image);
        let normalizer = Arc::clone(&self.normalizer);
        let canonical = tokio::task::spawn_blocking(move || normalizer.normalize(&image))
            .await
            .unwrap_or_else(|e| Err(NormalizeError(format!("normalize task panicked: {e}"))))
            .map_err(|e| failure(PageError::Normalize {
                page,
                detail: e.to_string(),
            }))?;

        let call = self.client.infer(&canonical, &self.prompt);
        let outcome = match self.policy.attempt_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Err(failure(PageError::Timeout {
                        page,
                        secs: limit.as_secs(),
                    }))
                }
            },
            None => call.await,
        };
        let raw_text = outcome.map_err(|e| {
            failure(PageError::Inference {
                page,
                detail: e.to_string(),
            })
        })?;

        match validate(&raw_text) {
            Ok(record) => Ok((record, raw_text)),
            Err(reason) => Err(AttemptFailure {
                error: PageError::Validation {
                    page,
                    failure: reason,
                },
                raw_text,
            }),
        }
    }
}

/// A failure with no model output; its own text is what gets kept.
fn failure(error: PageError) -> AttemptFailure {
    let raw_text = error.to_string();
    AttemptFailure { error, raw_text }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::infer::InferenceError;
    use image::{DynamicImage, GrayImage};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const VALID: &str = r#"{"page_content":"Hello","tags":["greeting"],"date":"NONE"}"#;

    /// Replies from a script; repeats the last entry once the script runs out.
    struct ScriptedClient {
        replies: Mutex<VecDeque<Result<String, String>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedClient {
        fn new(replies: Vec<Result<&str, &str>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(
                    replies
                        .into_iter()
                        .map(|r| r.map(str::to_string).map_err(str::to_string))
                        .collect(),
                ),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait::async_trait]
    impl InferenceClient for ScriptedClient {
        async fn infer(&self, _image: &GrayImage, _prompt: &str) -> Result<String, InferenceError> {
            *self.calls.lock().unwrap() += 1;
            let mut q = self.replies.lock().unwrap();
            let next = if q.len() > 1 {
                q.pop_front().unwrap()
            } else {
                q.front().cloned().unwrap()
            };
            next.map_err(InferenceError)
        }
    }

    struct HangingClient;

    #[async_trait::async_trait]
    impl InferenceClient for HangingClient {
        async fn infer(&self, _image: &GrayImage, _prompt: &str) -> Result<String, InferenceError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(VALID.to_string())
        }
    }

    struct PassThrough;

    impl PageNormalizer for PassThrough {
        fn normalize(&self, image: &DynamicImage) -> Result<GrayImage, NormalizeError> {
            Ok(image.to_luma8())
        }
    }

    struct Broken;

    impl PageNormalizer for Broken {
        fn normalize(&self, _image: &DynamicImage) -> Result<GrayImage, NormalizeError> {
            Err(NormalizeError("bad pixels".into()))
        }
    }

    #[derive(Default)]
    struct RecordingSleeper {
        slept: Mutex<Vec<Duration>>,
    }

    #[async_trait::async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.slept.lock().unwrap().push(duration);
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_backoff: Duration::from_millis(1000),
            max_jitter: Duration::ZERO,
            attempt_timeout: None,
        }
    }

    fn task() -> PageTask {
        PageTask::new(1, DynamicImage::new_luma8(4, 4))
    }

    fn worker(
        client: Arc<dyn InferenceClient>,
        normalizer: Arc<dyn PageNormalizer>,
        policy: RetryPolicy,
    ) -> (PageWorker, Arc<RecordingSleeper>) {
        let sleeper = Arc::new(RecordingSleeper::default());
        let w = PageWorker::new(client, normalizer, policy, "prompt").with_sleeper(sleeper.clone());
        (w, sleeper)
    }

    #[test]
    fn delay_doubles_per_attempt() {
        let p = policy();
        assert_eq!(p.delay(1, Duration::ZERO), Duration::from_millis(1000));
        assert_eq!(p.delay(2, Duration::ZERO), Duration::from_millis(2000));
        assert_eq!(
            p.delay(3, Duration::from_millis(250)),
            Duration::from_millis(4250)
        );
    }

    #[test]
    fn delay_saturates_instead_of_overflowing() {
        let p = policy();
        assert!(p.delay(200, Duration::ZERO) >= Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let p = RetryPolicy {
            max_jitter: Duration::from_millis(500),
            ..policy()
        };
        for _ in 0..100 {
            assert!(p.sample_jitter() <= Duration::from_millis(500));
        }
        assert_eq!(policy().sample_jitter(), Duration::ZERO);
    }

    #[test]
    fn terminal_states() {
        assert!(!WorkerState::Pending.is_terminal());
        assert!(!WorkerState::InFlight.is_terminal());
        assert!(WorkerState::Exhausted {
            error: PageError::Timeout { page: 1, secs: 1 }
        }
        .is_terminal());
    }

    #[tokio::test]
    async fn first_attempt_success_does_not_sleep() {
        let client = ScriptedClient::new(vec![Ok(VALID)]);
        let (w, sleeper) = worker(client.clone(), Arc::new(PassThrough), policy());
        let r = w.process(task()).await;
        assert!(r.ok);
        assert_eq!(r.attempts, 1);
        assert_eq!(r.content.unwrap().page_content, "Hello");
        assert_eq!(r.raw_text.as_deref(), Some(VALID));
        assert!(sleeper.slept.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_then_valid_retries_once() {
        let client = ScriptedClient::new(vec![Ok("not json at all"), Ok(VALID)]);
        let (w, sleeper) = worker(client.clone(), Arc::new(PassThrough), policy());
        let r = w.process(task()).await;
        assert!(r.ok);
        assert_eq!(r.attempts, 2);
        assert_eq!(client.calls(), 2);
        assert_eq!(*sleeper.slept.lock().unwrap(), vec![Duration::from_millis(1000)]);
    }

    #[tokio::test]
    async fn raw_text_comes_from_the_last_failed_attempt() {
        let client = ScriptedClient::new(vec![Ok("garbled answer"), Err("connection reset")]);
        let policy = RetryPolicy {
            max_retries: 2,
            ..policy()
        };
        let (w, _) = worker(client, Arc::new(PassThrough), policy);
        let r = w.process(task()).await;
        assert!(!r.ok);
        let raw = r.raw_text.unwrap();
        assert!(raw.contains("connection reset"), "{raw}");
        assert!(!raw.contains("garbled answer"));
    }

    #[tokio::test]
    async fn always_failing_client_exhausts() {
        let client = ScriptedClient::new(vec![Err("503 Service Unavailable")]);
        let (w, sleeper) = worker(client.clone(), Arc::new(PassThrough), policy());
        let r = w.process(task()).await;
        assert!(!r.ok);
        assert_eq!(r.attempts, 3);
        assert_eq!(client.calls(), 3);
        assert_eq!(r.error.as_ref().unwrap().code(), "exhausted_retries");
        assert!(r.raw_text.unwrap().contains("503"));
        assert_eq!(
            *sleeper.slept.lock().unwrap(),
            vec![Duration::from_millis(1000), Duration::from_millis(2000)]
        );
    }

    #[tokio::test]
    async fn exhausted_on_validation_keeps_model_output() {
        let client = ScriptedClient::new(vec![Ok(r#"{"page_content":"","tags":["x"]}"#)]);
        let (w, _) = worker(client, Arc::new(PassThrough), policy());
        let r = w.process(task()).await;
        assert!(!r.ok);
        assert_eq!(r.raw_text.as_deref(), Some(r#"{"page_content":"","tags":["x"]}"#));
        match r.error.unwrap() {
            PageError::ExhaustedRetries { last_error, .. } => {
                assert!(last_error.contains("schema violation"))
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn normalization_failure_is_retried() {
        let client = ScriptedClient::new(vec![Ok(VALID)]);
        let (w, _) = worker(client.clone(), Arc::new(Broken), policy());
        let r = w.process(task()).await;
        assert!(!r.ok);
        assert_eq!(r.attempts, 3);
        assert_eq!(client.calls(), 0);
        assert!(r.raw_text.unwrap().contains("bad pixels"));
    }

    #[tokio::test]
    async fn hung_call_times_out_and_counts_as_attempt() {
        let p = RetryPolicy {
            max_retries: 2,
            attempt_timeout: Some(Duration::from_millis(20)),
            ..policy()
        };
        let (w, _) = worker(Arc::new(HangingClient), Arc::new(PassThrough), p);
        let r = w.process(task()).await;
        assert!(!r.ok);
        assert_eq!(r.attempts, 2);
        assert!(r.raw_text.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn single_attempt_policy_never_sleeps() {
        let client = ScriptedClient::new(vec![Err("boom")]);
        let p = RetryPolicy {
            max_retries: 1,
            ..policy()
        };
        let (w, sleeper) = worker(client, Arc::new(PassThrough), p);
        let r = w.process(task()).await;
        assert_eq!(r.attempts, 1);
        assert!(sleeper.slept.lock().unwrap().is_empty());
    }
}
