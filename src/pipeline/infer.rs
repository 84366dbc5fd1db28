//! Vision-model call: one normalized page plus the prompt in, raw text out.
//!
//! The worker owns retries, backoff and deadlines. This module makes
//! exactly one request per call and reports any failure as an
//! [`InferenceError`], all of which the worker treats as retryable.

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::pipeline::encode::encode_page;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use image::GrayImage;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Provider name read when no provider is configured explicitly.
pub const PROVIDER_ENV: &str = "PAGESCRIBE_LLM_PROVIDER";
/// Model name read alongside [`PROVIDER_ENV`].
pub const MODEL_ENV: &str = "PAGESCRIBE_MODEL";

/// One failed inference call.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct InferenceError(pub String);

/// A multimodal model that turns a page image into text.
///
/// Shared by every worker in a run, so it must be `Send + Sync`.
#[async_trait::async_trait]
pub trait InferenceClient: Send + Sync {
    async fn infer(&self, image: &GrayImage, prompt: &str) -> Result<String, InferenceError>;
}

/// [`InferenceClient`] backed by an `edgequake-llm` provider.
pub struct LlmInferenceClient {
    provider: Arc<dyn LLMProvider>,
    options: CompletionOptions,
}

impl LlmInferenceClient {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &PipelineConfig) -> Self {
        Self {
            provider,
            options: build_options(config),
        }
    }

    /// Resolve the provider from `config` and wrap it.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let provider = resolve_provider(config)?;
        info!(
            "Using provider={}, model={}",
            config.provider_name.as_deref().unwrap_or("auto"),
            config.model.as_deref().unwrap_or("default")
        );
        Ok(Self::new(provider, config))
    }
}

#[async_trait::async_trait]
impl InferenceClient for LlmInferenceClient {
    async fn infer(&self, image: &GrayImage, prompt: &str) -> Result<String, InferenceError> {
        let image_data =
            encode_page(image).map_err(|e| InferenceError(format!("image encoding failed: {e}")))?;

        // Instruction and image share a single user turn.
        let messages = vec![ChatMessage::user_with_images(prompt, vec![image_data])];

        let response = self
            .provider
            .chat(&messages, Some(&self.options))
            .await
            .map_err(|e| InferenceError(e.to_string()))?;

        debug!(
            "{} input tokens, {} output tokens",
            response.prompt_tokens, response.completion_tokens
        );
        Ok(response.content)
    }
}

/// Build `CompletionOptions` from the run config.
fn build_options(config: &PipelineConfig) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(config.temperature),
        max_tokens: Some(config.max_tokens),
        ..Default::default()
    }
}

/// Model used when a provider is named without one.
pub fn default_model(provider_name: &str) -> &'static str {
    match provider_name {
        "gemini" | "google" | "vertexai" => "gemini-2.5-flash",
        "anthropic" => "claude-sonnet-4-5",
        "ollama" | "lmstudio" => "llava",
        _ => "gpt-4.1-nano",
    }
}

/// Resolve the LLM provider, from most-specific to least-specific:
///
/// 1. a pre-built `config.provider`, used as-is;
/// 2. `config.provider_name` with `config.model` (or [`default_model`]);
/// 3. the `PAGESCRIBE_LLM_PROVIDER` + `PAGESCRIBE_MODEL` pair, when both are set;
/// 4. `ProviderFactory::from_env`, which picks whichever API key it finds.
pub fn resolve_provider(config: &PipelineConfig) -> Result<Arc<dyn LLMProvider>, PipelineError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or_else(|| default_model(name));
        return create_vision_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (std::env::var(PROVIDER_ENV), std::env::var(MODEL_ENV)) {
        if !prov.is_empty() && !model.is_empty() {
            return create_vision_provider(&prov, &model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| PipelineError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set GEMINI_API_KEY, OPENAI_API_KEY or ANTHROPIC_API_KEY, \
                or pass --provider and --model.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}

fn create_vision_provider(
    provider_name: &str,
    model: &str,
) -> Result<Arc<dyn LLMProvider>, PipelineError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        PipelineError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_options_follow_config() {
        let config = PipelineConfig::builder()
            .temperature(0.3)
            .max_tokens(1024)
            .build()
            .unwrap();
        let opts = build_options(&config);
        assert_eq!(opts.temperature, Some(0.3));
        assert_eq!(opts.max_tokens, Some(1024));
    }

    #[test]
    fn default_options_are_deterministic() {
        let opts = build_options(&PipelineConfig::default());
        assert_eq!(opts.temperature, Some(0.0));
        assert_eq!(opts.max_tokens, Some(8192));
    }

    #[test]
    fn default_model_depends_on_provider() {
        assert_eq!(default_model("gemini"), "gemini-2.5-flash");
        assert_eq!(default_model("openai"), "gpt-4.1-nano");
    }
}
