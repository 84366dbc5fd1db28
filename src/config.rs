//! Configuration types for a transcription run.
//!
//! Every run parameter lives in [`PipelineConfig`], built via its
//! [`PipelineConfigBuilder`], and is handed to the
//! [`crate::scheduler::Pipeline`] at construction. Nothing is read from
//! process-wide state once a pipeline exists.

use crate::error::PipelineError;
use crate::progress::ProgressCallback;
use crate::worker::RetryPolicy;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for one transcription run.
///
/// Built via [`PipelineConfig::builder()`] or using
/// [`PipelineConfig::default()`].
///
/// # Example
/// ```rust
/// use pagescribe::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .concurrency(2)
///     .max_retries(5)
///     .retry_backoff_ms(250)
///     .build()
///     .unwrap();
/// assert_eq!(config.concurrency, 2);
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Maximum number of pages in flight at once. Default: 4.
    ///
    /// Each in-flight page holds one open inference request. Lower this if
    /// the provider answers with rate-limit errors.
    pub concurrency: usize,

    /// Attempts per page before it is marked exhausted. Default: 3. Minimum: 1.
    ///
    /// Counts every attempt, the first included: `max_retries = 3` means at
    /// most three inference calls for a page.
    pub max_retries: u32,

    /// Backoff base in milliseconds. Default: 1000.
    ///
    /// Delay before attempt `n + 1` is `base * 2^(n-1)` plus jitter:
    /// 1 s → 2 s → 4 s with the default.
    pub retry_backoff_ms: u64,

    /// Upper bound of the uniform random jitter added to each backoff, in
    /// milliseconds. Default: 500.
    pub max_jitter_ms: u64,

    /// Deadline for one inference attempt, in seconds. Default: 120.
    ///
    /// `None` waits forever, which lets one hung request hold a concurrency
    /// slot for the rest of the run.
    pub attempt_timeout_secs: Option<u64>,

    /// Rendering DPI. Range: 72–600. Default: 300.
    ///
    /// Handwriting needs more pixels than print; 300 DPI keeps pen strokes
    /// legible after binarization.
    pub dpi: u32,

    /// Cap on either rendered dimension, in pixels. Default: 4000.
    pub max_rendered_pixels: u32,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// LLM model identifier. If None, uses the provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "gemini", "openai", "ollama").
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.0.
    pub temperature: f32,

    /// Maximum tokens the model may generate per page. Default: 8192.
    pub max_tokens: usize,

    /// Custom instruction prompt. If None, uses
    /// [`crate::prompts::DEFAULT_TRANSCRIBE_PROMPT`].
    pub prompt: Option<String>,

    /// Image clean-up parameters, fixed for the whole run.
    pub normalize: NormalizeParams,

    /// Optional per-page event sink.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_retries: 3,
            retry_backoff_ms: 1000,
            max_jitter_ms: 500,
            attempt_timeout_secs: Some(120),
            dpi: 300,
            max_rendered_pixels: 4000,
            password: None,
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.0,
            max_tokens: 8192,
            prompt: None,
            normalize: NormalizeParams::default(),
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("concurrency", &self.concurrency)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("max_jitter_ms", &self.max_jitter_ms)
            .field("attempt_timeout_secs", &self.attempt_timeout_secs)
            .field("dpi", &self.dpi)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("prompt", &self.prompt.as_ref().map(|p| p.len()))
            .field("normalize", &self.normalize)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn PipelineProgress>"),
            )
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// The retry policy workers follow.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_backoff: Duration::from_millis(self.retry_backoff_ms),
            max_jitter: Duration::from_millis(self.max_jitter_ms),
            attempt_timeout: self.attempt_timeout_secs.map(Duration::from_secs),
        }
    }
}

/// Image clean-up parameters for [`crate::pipeline::normalize::ImageNormalizer`].
///
/// Fixed for a whole run so every page, and every retry of a page, is
/// normalized identically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizeParams {
    /// Median-filter radius for denoising. 0 disables. Default: 1 (3×3).
    pub denoise_radius: u32,
    /// Side of the square erosion window that thickens strokes. 0 or 1
    /// disables. Default: 2.
    pub erosion_size: u32,
    /// Neighbourhood size for adaptive binarization. Default: 31.
    ///
    /// Forced odd by [`NormalizeParams::block_size`].
    pub adaptive_block: u32,
    /// Constant subtracted from the local mean before thresholding.
    /// Default: 20.
    pub adaptive_c: i32,
    /// Closing radius applied to the binary page. 0 disables. Default: 1.
    pub close_radius: u8,
    /// Tile-based local contrast enhancement. Default: off.
    pub local_contrast: Option<LocalContrast>,
    /// Detect and paint out horizontal ruled lines. Default: false.
    pub remove_lines: bool,
    /// A ruled line must span at least `width / line_kernel_factor` pixels.
    /// Default: 30.
    pub line_kernel_factor: u32,
    /// Rows sampled above and below a removed line when filling it in.
    /// Default: 3.
    pub inpaint_radius: u32,
}

impl Default for NormalizeParams {
    fn default() -> Self {
        Self {
            denoise_radius: 1,
            erosion_size: 2,
            adaptive_block: 31,
            adaptive_c: 20,
            close_radius: 1,
            local_contrast: None,
            remove_lines: false,
            line_kernel_factor: 30,
            inpaint_radius: 3,
        }
    }
}

impl NormalizeParams {
    /// Odd block size of at least 3.
    pub fn block_size(&self) -> u32 {
        match self.adaptive_block {
            0 | 1 => 3,
            b if b % 2 == 0 => b + 1,
            b => b,
        }
    }
}

/// Contrast-limited histogram equalization over a grid of tiles.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocalContrast {
    /// Histogram clip limit as a multiple of the mean bin height.
    pub clip_limit: f32,
    /// Tiles per side of the grid.
    pub tiles: u32,
}

impl Default for LocalContrast {
    fn default() -> Self {
        Self {
            clip_limit: 2.0,
            tiles: 8,
        }
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn max_jitter_ms(mut self, ms: u64) -> Self {
        self.config.max_jitter_ms = ms;
        self
    }

    pub fn attempt_timeout_secs(mut self, secs: Option<u64>) -> Self {
        self.config.attempt_timeout_secs = secs;
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi;
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.prompt = Some(prompt.into());
        self
    }

    pub fn normalize(mut self, params: NormalizeParams) -> Self {
        self.config.normalize = params;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        if c.concurrency == 0 {
            return Err(PipelineError::InvalidConfig(
                "Concurrency must be ≥ 1".into(),
            ));
        }
        if c.max_retries == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_retries must be ≥ 1 (it counts the first attempt)".into(),
            ));
        }
        if c.dpi < 72 || c.dpi > 600 {
            return Err(PipelineError::InvalidConfig(format!(
                "DPI must be 72–600, got {}",
                c.dpi
            )));
        }
        if c.attempt_timeout_secs == Some(0) {
            return Err(PipelineError::InvalidConfig(
                "attempt timeout must be ≥ 1s; use None to disable it".into(),
            ));
        }
        if let Some(lc) = c.normalize.local_contrast {
            if !lc.clip_limit.is_finite() || lc.clip_limit <= 0.0 || lc.tiles == 0 {
                return Err(PipelineError::InvalidConfig(format!(
                    "local contrast needs clip_limit > 0 and tiles ≥ 1, got {:?}",
                    lc
                )));
            }
        }
        if c.normalize.line_kernel_factor == 0 {
            return Err(PipelineError::InvalidConfig(
                "line_kernel_factor must be ≥ 1".into(),
            ));
        }
        if c.prompt.as_deref().is_some_and(|p| p.trim().is_empty()) {
            return Err(PipelineError::InvalidConfig("prompt must not be empty".into()));
        }
        Ok(self.config)
    }
}
