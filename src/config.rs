//! Configuration types for invoice extraction.
//!
//! Every run is controlled through [`ExtractionConfig`], built via its
//! [`ExtractionConfigBuilder`]. One struct holds every knob so a config can be
//! cloned into a [`crate::Workflow`] that outlives the request and logged in
//! full when a run misbehaves.

use crate::error::ExtractError;
use crate::pipeline::llm::VisionModel;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Model used when the provider is Gemini and no model was named.
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";

/// Model used for every other provider when no model was named.
pub const DEFAULT_MODEL: &str = "gpt-4.1-nano";

/// Configuration for one extraction run.
///
/// Built via [`ExtractionConfig::builder()`] or using
/// [`ExtractionConfig::default()`].
///
/// # Example
/// ```rust
/// use edgequake_invoice::ExtractionConfig;
///
/// let config = ExtractionConfig::builder()
///     .provider_name("gemini")
///     .model("gemini-2.5-flash")
///     .max_pages(4)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ExtractionConfig {
    /// LLM model identifier, e.g. "gemini-2.5-flash", "gpt-4.1".
    /// If None, uses the provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "gemini", "openai", "anthropic", "ollama").
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Pre-constructed vision model. Takes precedence over everything else;
    /// tests use it to script replies.
    pub vision_model: Option<Arc<dyn VisionModel>>,

    /// Sampling temperature for every step. Default: 0.0.
    ///
    /// Extraction wants the same answer twice for the same invoice.
    pub temperature: f32,

    /// Maximum tokens the model may generate per step. Default: 8192.
    ///
    /// The OCR step transcribes every word with four coordinates; a dense
    /// single-page invoice easily needs 4 000 output tokens.
    pub max_tokens: usize,

    /// Maximum retry attempts on a failed model call. Default: 3.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds (exponential backoff). Default: 500.
    pub retry_backoff_ms: u64,

    /// Per-model-call timeout in seconds. Default: 120.
    pub api_timeout_secs: u64,

    /// Rendering DPI used when rasterising PDF pages. Range: 72–400. Default: 150.
    pub dpi: u32,

    /// Maximum rendered page edge in pixels. Default: 2000.
    pub max_rendered_pixels: u32,

    /// Maximum number of pages across all uploads of one run. Default: 10.
    pub max_pages: usize,

    /// Maximum height of the stitched image in pixels. Default: 12000.
    ///
    /// Taller stacks are scaled down uniformly; the normalized plane does not
    /// care, the model's eyesight does.
    pub max_stitched_height: u32,

    /// Which engine produces the word-level OCR tokens. Default: Vision.
    pub ocr_backend: OcrBackend,

    /// Extra normalized units added around each area before tokens are
    /// filtered into it. Default: 0 (strict containment).
    pub area_margin: i32,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Optional per-step progress hooks.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            model: None,
            provider_name: None,
            provider: None,
            vision_model: None,
            temperature: 0.0,
            max_tokens: 8192,
            max_retries: 3,
            retry_backoff_ms: 500,
            api_timeout_secs: 120,
            dpi: 150,
            max_rendered_pixels: 2000,
            max_pages: 10,
            max_stitched_height: 12_000,
            ocr_backend: OcrBackend::default(),
            area_margin: 0,
            password: None,
            download_timeout_secs: 120,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ExtractionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfig")
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field(
                "vision_model",
                &self.vision_model.as_ref().map(|m| m.name().to_string()),
            )
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_retries", &self.max_retries)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("dpi", &self.dpi)
            .field("max_pages", &self.max_pages)
            .field("ocr_backend", &self.ocr_backend)
            .field("area_margin", &self.area_margin)
            .finish()
    }
}

impl ExtractionConfig {
    /// Create a new builder for `ExtractionConfig`.
    pub fn builder() -> ExtractionConfigBuilder {
        ExtractionConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`ExtractionConfig`].
#[derive(Debug)]
pub struct ExtractionConfigBuilder {
    config: ExtractionConfig,
}

impl ExtractionConfigBuilder {
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

    pub fn vision_model(mut self, model: Arc<dyn VisionModel>) -> Self {
        self.config.vision_model = Some(model);
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

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
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

    pub fn max_pages(mut self, n: usize) -> Self {
        self.config.max_pages = n;
        self
    }

    pub fn max_stitched_height(mut self, px: u32) -> Self {
        self.config.max_stitched_height = px;
        self
    }

    pub fn ocr_backend(mut self, backend: OcrBackend) -> Self {
        self.config.ocr_backend = backend;
        self
    }

    pub fn area_margin(mut self, margin: i32) -> Self {
        self.config.area_margin = margin;
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ExtractionConfig, ExtractError> {
        let c = &self.config;
        if c.dpi < 72 || c.dpi > 400 {
            return Err(ExtractError::InvalidConfig(format!(
                "DPI must be 72–400, got {}",
                c.dpi
            )));
        }
        if c.max_pages == 0 {
            return Err(ExtractError::InvalidConfig("max_pages must be ≥ 1".into()));
        }
        if c.max_tokens == 0 {
            return Err(ExtractError::InvalidConfig("max_tokens must be ≥ 1".into()));
        }
        if c.max_retries > 10 {
            return Err(ExtractError::InvalidConfig(format!(
                "max_retries must be 0–10, got {}",
                c.max_retries
            )));
        }
        if c.retry_backoff_ms > 60_000 {
            return Err(ExtractError::InvalidConfig(format!(
                "retry_backoff_ms must be ≤ 60000, got {}",
                c.retry_backoff_ms
            )));
        }
        if c.max_stitched_height < 100 {
            return Err(ExtractError::InvalidConfig(format!(
                "max_stitched_height must be ≥ 100, got {}",
                c.max_stitched_height
            )));
        }
        if !(0..=500).contains(&c.area_margin) {
            return Err(ExtractError::InvalidConfig(format!(
                "area_margin must be 0–500, got {}",
                c.area_margin
            )));
        }
        if c.ocr_backend == OcrBackend::Tesseract && !cfg!(feature = "tesseract") {
            return Err(ExtractError::InvalidConfig(
                "the tesseract OCR backend needs the `tesseract` feature".into(),
            ));
        }
        Ok(self.config)
    }
}

/// Engine used for the `extract_structured_ocr` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OcrBackend {
    /// Ask the vision model to transcribe every word with its box. (default)
    #[default]
    Vision,
    /// Local Tesseract via `rusty-tesseract` (feature `tesseract`).
    Tesseract,
}

impl FromStr for OcrBackend {
    type Err = ExtractError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "vision" | "llm" => Ok(Self::Vision),
            "tesseract" => Ok(Self::Tesseract),
            other => Err(ExtractError::InvalidConfig(format!(
                "unknown OCR backend '{other}' (expected vision or tesseract)"
            ))),
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the server listens on. Default: 0.0.0.0:8000.
    pub bind: std::net::SocketAddr,
    /// Maximum request body size for uploads. Default: 25 MiB.
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: std::net::SocketAddr::from(([0, 0, 0, 0], 8000)),
            max_upload_bytes: 25 * 1024 * 1024,
        }
    }
}
