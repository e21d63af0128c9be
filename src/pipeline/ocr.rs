//! Word-level OCR on the stitched image: the `extract_structured_ocr` step.
//!
//! Two engines sit behind [`OcrEngine`]:
//!
//! * [`VisionOcr`] (default) asks the vision model to transcribe every word
//!   with a box on the 0–1000 plane. No local install needed.
//! * `TesseractOcr` (feature `tesseract`) runs the system tesseract through
//!   `rusty-tesseract` and converts its pixel boxes to the plane.
//!
//! Both return tokens in reading order, which is what the later prompts
//! expect when they list tokens line by line.

use crate::config::{ExtractionConfig, OcrBackend};
use crate::error::ExtractError;
use crate::pipeline::llm::{call_with_retry, ModelRequest, Usage, VisionModel};
use crate::pipeline::reply::parse_reply;
use crate::pipeline::PreparedInvoice;
use crate::prompts::{ocr_system_prompt, OcrReply};
use crate::schema::OcrToken;
use crate::workflow::Step;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Tokens plus what it cost to get them.
#[derive(Debug, Clone, Default)]
pub struct OcrOutcome {
    pub tokens: Vec<OcrToken>,
    pub usage: Usage,
}

/// Anything that can read words off the stitched invoice.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    fn name(&self) -> &str;

    async fn recognise(&self, invoice: &PreparedInvoice) -> Result<OcrOutcome, ExtractError>;
}

/// Pick the engine named by `config.ocr_backend`.
pub fn engine_for(
    config: &ExtractionConfig,
    model: Arc<dyn VisionModel>,
) -> Result<Arc<dyn OcrEngine>, ExtractError> {
    match config.ocr_backend {
        OcrBackend::Vision => Ok(Arc::new(VisionOcr::new(model, config.clone()))),
        #[cfg(feature = "tesseract")]
        OcrBackend::Tesseract => Ok(Arc::new(tesseract::TesseractOcr::default())),
        #[cfg(not(feature = "tesseract"))]
        OcrBackend::Tesseract => Err(ExtractError::InvalidConfig(
            "the tesseract OCR backend needs the `tesseract` feature".into(),
        )),
    }
}

/// Sort tokens top to bottom, then left to right within a line.
///
/// Two tokens share a line when their vertical centres are closer than half
/// the height of the line's first token.
pub fn reading_order(mut tokens: Vec<OcrToken>) -> Vec<OcrToken> {
    let centre = |t: &OcrToken| t.bbox.y1 + t.bbox.y2;
    tokens.sort_by_key(|t| (centre(t), t.bbox.x1));

    let mut lines: Vec<Vec<OcrToken>> = Vec::new();
    for token in tokens {
        match lines.last_mut() {
            Some(line)
                if (centre(&token) - centre(&line[0])).abs() <= line[0].bbox.height().max(1) =>
            {
                line.push(token)
            }
            _ => lines.push(vec![token]),
        }
    }

    lines
        .into_iter()
        .flat_map(|mut line| {
            line.sort_by_key(|t| t.bbox.x1);
            line
        })
        .collect()
}

// ── Vision model OCR ─────────────────────────────────────────────────────────

/// OCR by asking the vision model.
pub struct VisionOcr {
    model: Arc<dyn VisionModel>,
    config: ExtractionConfig,
}

impl VisionOcr {
    pub fn new(model: Arc<dyn VisionModel>, config: ExtractionConfig) -> Self {
        Self { model, config }
    }
}

/// The model may answer `{"tokens": [...]}` or just the array.
#[derive(Deserialize)]
#[serde(untagged)]
enum TokensReply {
    Wrapped(OcrReply),
    Bare(Vec<OcrToken>),
}

#[async_trait]
impl OcrEngine for VisionOcr {
    fn name(&self) -> &str {
        "vision"
    }

    async fn recognise(&self, invoice: &PreparedInvoice) -> Result<OcrOutcome, ExtractError> {
        let request = ModelRequest {
            step: Step::ExtractStructuredOcr,
            system: ocr_system_prompt(),
            user_text: format!(
                "Invoice image ({} pages stitched top to bottom). Transcribe every word.",
                invoice.stitched.pages.len()
            ),
            images: vec![invoice.image.clone()],
        };

        let (reply, retries) = call_with_retry(self.model.as_ref(), &request, &self.config).await?;
        let mut usage = Usage::default();
        usage.record(&reply, retries);

        // Without tokens no later step has anything to read, so an
        // unreadable transcription ends the run here.
        let tokens = match parse_reply::<TokensReply>(Step::ExtractStructuredOcr, &reply.content) {
            Ok(TokensReply::Wrapped(r)) => r.tokens,
            Ok(TokensReply::Bare(tokens)) => tokens,
            Err(e) => {
                warn!("{}", e);
                return Err(ExtractError::OcrFailed(e.to_string()));
            }
        };

        let tokens: Vec<OcrToken> = tokens
            .into_iter()
            .filter(|t| !t.text.trim().is_empty())
            .collect();
        info!("Vision OCR returned {} tokens", tokens.len());

        Ok(OcrOutcome {
            tokens: reading_order(tokens),
            usage,
        })
    }
}

// ── Tesseract OCR ────────────────────────────────────────────────────────────

#[cfg(feature = "tesseract")]
pub mod tesseract {
    use super::*;
    use crate::pipeline::stitch::to_normalized;
    use crate::schema::BoundingBox;
    use rusty_tesseract::{Args, Image};
    use std::collections::HashMap;

    /// OCR with the system tesseract binary.
    pub struct TesseractOcr {
        pub lang: String,
    }

    impl Default for TesseractOcr {
        fn default() -> Self {
            Self { lang: "eng".into() }
        }
    }

    #[async_trait]
    impl OcrEngine for TesseractOcr {
        fn name(&self) -> &str {
            "tesseract"
        }

        async fn recognise(&self, invoice: &PreparedInvoice) -> Result<OcrOutcome, ExtractError> {
            let image = invoice.stitched.image.clone();
            let lang = self.lang.clone();

            let tokens = tokio::task::spawn_blocking(move || {
                let (width, height) = (image.width(), image.height());
                let tess_img = Image::from_dynamic_image(&image)
                    .map_err(|e| ExtractError::OcrFailed(format!("tesseract image: {e}")))?;
                let args = Args {
                    lang,
                    config_variables: HashMap::new(),
                    dpi: Some(150),
                    psm: Some(3),
                    oem: Some(3),
                };
                let data = rusty_tesseract::image_to_data(&tess_img, &args)
                    .map_err(|e| ExtractError::OcrFailed(format!("tesseract: {e}")))?;

                let tokens: Vec<OcrToken> = data
                    .data
                    .into_iter()
                    .filter(|d| !d.text.trim().is_empty() && d.conf >= 0.0)
                    .map(|d| OcrToken {
                        text: d.text.trim().to_string(),
                        bbox: BoundingBox::new(
                            to_normalized(d.left as f64, width),
                            to_normalized(d.top as f64, height),
                            to_normalized((d.left + d.width) as f64, width),
                            to_normalized((d.top + d.height) as f64, height),
                        ),
                        confidence: Some(d.conf / 100.0),
                    })
                    .collect();
                Ok::<_, ExtractError>(tokens)
            })
            .await
            .map_err(|e| ExtractError::Internal(format!("OCR task panicked: {}", e)))??;

            info!("Tesseract returned {} tokens", tokens.len());
            Ok(OcrOutcome {
                tokens: reading_order(tokens),
                usage: Usage::default(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::BoundingBox;

    fn tok(text: &str, x1: i32, y1: i32, x2: i32, y2: i32) -> OcrToken {
        OcrToken {
            text: text.into(),
            bbox: BoundingBox::new(x1, y1, x2, y2),
            confidence: None,
        }
    }

    fn texts(tokens: &[OcrToken]) -> Vec<&str> {
        tokens.iter().map(|t| t.text.as_str()).collect()
    }

    #[test]
    fn reading_order_groups_lines() {
        let tokens = vec![
            tok("Total", 600, 901, 700, 920),
            tok("Invoice", 10, 10, 100, 30),
            tok("42.00", 800, 900, 900, 919),
            tok("#7", 110, 12, 140, 31),
        ];
        assert_eq!(
            texts(&reading_order(tokens)),
            vec!["Invoice", "#7", "Total", "42.00"]
        );
    }

    #[test]
    fn reading_order_keeps_separate_lines_apart() {
        let tokens = vec![
            tok("second", 10, 50, 80, 70),
            tok("first", 500, 10, 580, 30),
        ];
        assert_eq!(texts(&reading_order(tokens)), vec!["first", "second"]);
    }

    #[test]
    fn reading_order_empty() {
        assert!(reading_order(Vec::new()).is_empty());
    }

    #[cfg(not(feature = "tesseract"))]
    #[test]
    fn tesseract_without_feature_is_rejected() {
        use crate::pipeline::llm::{ModelError, ModelReply};

        struct Never;

        #[async_trait]
        impl VisionModel for Never {
            fn name(&self) -> &str {
                "never"
            }
            async fn complete(&self, _r: &ModelRequest) -> Result<ModelReply, ModelError> {
                Err(ModelError("unused".into()))
            }
        }

        let mut config = ExtractionConfig::default();
        config.ocr_backend = OcrBackend::Tesseract;
        assert!(engine_for(&config, Arc::new(Never)).is_err());
    }
}
