//! Model interaction: the [`VisionModel`] seam, its edgequake-llm adapter,
//! provider resolution, and the retry loop every workflow step goes through.
//!
//! ## Retry Strategy
//!
//! HTTP 429 / 503 errors are transient and common on free-tier keys.
//! Exponential backoff (`retry_backoff_ms * 2^(attempt-1)`) with the 500 ms
//! default waits 500 ms → 1 s → 2 s before giving up. Each attempt is bounded
//! by `api_timeout_secs`. When every attempt failed the step fails, and with
//! it the run: later steps depend on this one's output.

use crate::config::{ExtractionConfig, DEFAULT_GEMINI_MODEL, DEFAULT_MODEL};
use crate::error::ExtractError;
use crate::workflow::Step;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

/// One prompt sent to the model.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub step: Step,
    pub system: String,
    pub user_text: String,
    pub images: Vec<ImageData>,
}

/// The model's answer plus token accounting.
#[derive(Debug, Clone, Default)]
pub struct ModelReply {
    pub content: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
}

/// Model calls made by one step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub calls: u32,
    pub retries: u32,
    pub input_tokens: usize,
    pub output_tokens: usize,
}

impl Usage {
    pub fn record(&mut self, reply: &ModelReply, retries: u32) {
        self.calls += 1;
        self.retries += retries;
        self.input_tokens += reply.input_tokens;
        self.output_tokens += reply.output_tokens;
    }
}

/// A failed model call.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ModelError(pub String);

/// Anything that can answer a [`ModelRequest`].
///
/// [`LlmVisionModel`] talks to a hosted provider; tests plug in a scripted
/// implementation.
#[async_trait]
pub trait VisionModel: Send + Sync {
    /// Short label for logs and the health endpoint.
    fn name(&self) -> &str;

    async fn complete(&self, request: &ModelRequest) -> Result<ModelReply, ModelError>;
}

/// [`VisionModel`] backed by an edgequake-llm provider.
pub struct LlmVisionModel {
    provider: Arc<dyn LLMProvider>,
    label: String,
    options: CompletionOptions,
}

impl LlmVisionModel {
    pub fn new(provider: Arc<dyn LLMProvider>, label: impl Into<String>, config: &ExtractionConfig) -> Self {
        Self {
            provider,
            label: label.into(),
            options: build_options(config),
        }
    }
}

#[async_trait]
impl VisionModel for LlmVisionModel {
    fn name(&self) -> &str {
        &self.label
    }

    async fn complete(&self, request: &ModelRequest) -> Result<ModelReply, ModelError> {
        let messages = vec![
            ChatMessage::system(request.system.as_str()),
            ChatMessage::user_with_images(request.user_text.as_str(), request.images.clone()),
        ];

        let response = self
            .provider
            .chat(&messages, Some(&self.options))
            .await
            .map_err(|e| ModelError(format!("{}", e)))?;

        Ok(ModelReply {
            content: response.content,
            input_tokens: response.prompt_tokens,
            output_tokens: response.completion_tokens,
        })
    }
}

/// Build `CompletionOptions` from the extraction config.
fn build_options(config: &ExtractionConfig) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(config.temperature),
        max_tokens: Some(config.max_tokens),
        ..Default::default()
    }
}

/// Delay before retry `attempt` (1-based): `base * 2^(attempt-1)`, saturating.
fn backoff_ms(base: u64, attempt: u32) -> u64 {
    base.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
}

/// Send `request`, retrying failures and timeouts with exponential backoff.
///
/// Returns the reply and the number of retries it took.
pub async fn call_with_retry(
    model: &dyn VisionModel,
    request: &ModelRequest,
    config: &ExtractionConfig,
) -> Result<(ModelReply, u32), ExtractError> {
    let start = Instant::now();
    let mut last_err: Option<String> = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let backoff = backoff_ms(config.retry_backoff_ms, attempt);
            warn!(
                "{}: retry {}/{} after {}ms",
                request.step, attempt, config.max_retries, backoff
            );
            sleep(Duration::from_millis(backoff)).await;
        }

        let call = timeout(
            Duration::from_secs(config.api_timeout_secs),
            model.complete(request),
        )
        .await;

        match call {
            Ok(Ok(reply)) => {
                debug!(
                    "{}: {} input tokens, {} output tokens, {:?}",
                    request.step,
                    reply.input_tokens,
                    reply.output_tokens,
                    start.elapsed()
                );
                return Ok((reply, attempt));
            }
            Ok(Err(e)) => {
                warn!("{}: attempt {} failed: {}", request.step, attempt + 1, e);
                last_err = Some(e.to_string());
            }
            Err(_) => {
                warn!(
                    "{}: attempt {} timed out after {}s",
                    request.step,
                    attempt + 1,
                    config.api_timeout_secs
                );
                last_err = Some(format!("timed out after {}s", config.api_timeout_secs));
            }
        }
    }

    Err(ExtractError::StepFailed {
        step: request.step,
        detail: format!(
            "{} (after {} retries)",
            last_err.unwrap_or_else(|| "Unknown error".to_string()),
            config.max_retries
        ),
    })
}

/// Default model for a provider name.
pub fn default_model_for(provider_name: &str) -> &'static str {
    match provider_name {
        "gemini" | "google" => DEFAULT_GEMINI_MODEL,
        _ => DEFAULT_MODEL,
    }
}

fn create_vision_provider(
    provider_name: &str,
    model: &str,
    config: &ExtractionConfig,
) -> Result<Arc<dyn VisionModel>, ExtractError> {
    let provider = ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        ExtractError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })?;
    info!("Using {} / {}", provider_name, model);
    Ok(Arc::new(LlmVisionModel::new(
        provider,
        format!("{provider_name}/{model}"),
        config,
    )))
}

fn env_set(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Resolve the vision model, from most-specific to least-specific:
///
/// 1. `config.vision_model`: used as-is.
/// 2. `config.provider`: a pre-built edgequake-llm provider.
/// 3. `config.provider_name` (+ `config.model`).
/// 4. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`, both set.
/// 5. `GEMINI_API_KEY` present → gemini.
/// 6. `OPENAI_API_KEY` present → openai.
/// 7. `ProviderFactory::from_env()` auto-detection.
pub fn resolve_vision_model(config: &ExtractionConfig) -> Result<Arc<dyn VisionModel>, ExtractError> {
    if let Some(ref model) = config.vision_model {
        return Ok(Arc::clone(model));
    }

    if let Some(ref provider) = config.provider {
        let label = config.model.clone().unwrap_or_else(|| "custom".to_string());
        return Ok(Arc::new(LlmVisionModel::new(Arc::clone(provider), label, config)));
    }

    if let Some(ref name) = config.provider_name {
        let model = config
            .model
            .as_deref()
            .unwrap_or_else(|| default_model_for(name));
        return create_vision_provider(name, model, config);
    }

    if let (Some(prov), Some(model)) = (
        env_set("EDGEQUAKE_LLM_PROVIDER"),
        env_set("EDGEQUAKE_MODEL"),
    ) {
        return create_vision_provider(&prov, &model, config);
    }

    if env_set("GEMINI_API_KEY").is_some() {
        let model = config.model.as_deref().unwrap_or(DEFAULT_GEMINI_MODEL);
        return create_vision_provider("gemini", model, config);
    }

    if env_set("OPENAI_API_KEY").is_some() {
        let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
        return create_vision_provider("openai", model, config);
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| ExtractError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set GEMINI_API_KEY, OPENAI_API_KEY, or ANTHROPIC_API_KEY.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(Arc::new(LlmVisionModel::new(llm_provider, "auto", config)))
}
