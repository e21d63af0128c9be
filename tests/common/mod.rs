//! Shared fixtures: a scripted vision model and generated page images.

#![allow(dead_code)]

use async_trait::async_trait;
use edgequake_invoice::{
    ExtractionConfig, ModelError, ModelReply, ModelRequest, Step, Upload, VisionModel,
};
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::sync::{Arc, Mutex};

pub const OCR_REPLY: &str = r#"{"tokens": [
  {"text": "ACME", "bbox": [50, 20, 200, 60]},
  {"text": "INV-7", "bbox": [700, 20, 850, 60]},
  {"text": "Widget", "bbox": [50, 400, 200, 430]},
  {"text": "2", "bbox": [500, 400, 520, 430]},
  {"text": "10.00", "bbox": [800, 400, 900, 430]},
  {"text": "Total", "bbox": [600, 900, 700, 930]},
  {"text": "20.00", "bbox": [800, 900, 900, 930]}
]}"#;

pub const AOI_REPLY: &str = r#"{
  "header_area": {"x1": 0, "y1": 0, "x2": 1000, "y2": 100},
  "line_items_area": {"x1": 0, "y1": 350, "x2": 1000, "y2": 500},
  "summary_area": {"x1": 500, "y1": 850, "x2": 1000, "y2": 950}
}"#;

pub const HEADER_REPLY: &str = "```json\n{\"invoice_number\": {\"value\": \"INV-7\", \"bbox\": [700, 20, 850, 60]}, \
\"vendor_name\": {\"value\": \"ACME\", \"bbox\": [50, 20, 200, 60]}, \"client_name\": null}\n```";

pub const LINE_ITEMS_REPLY: &str = r#"{"line_items": [
  {"description": {"value": "Widget", "bbox": [50, 400, 200, 430]},
   "quantity": {"value": 2},
   "unit_price": {"value": "5.00"},
   "total_price": {"value": "10.00", "bbox": [800, 400, 900, 430]},
   "bbox": [50, 400, 900, 430]}
]}"#;

pub const SUMMARY_REPLY: &str =
    r#"{"total_amount": {"value": "20.00", "bbox": [800, 900, 900, 930]}, "tax_amount": null}"#;

/// A [`VisionModel`] that answers from a per-step script and records every
/// request it sees.
pub struct ScriptedModel {
    replies: Mutex<HashMap<Step, VecDeque<Result<String, String>>>>,
    fallback: Mutex<HashMap<Step, Result<String, String>>>,
    pub seen: Mutex<Vec<(Step, String)>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(HashMap::new()),
            fallback: Mutex::new(HashMap::new()),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Every step answered with the happy-path fixtures.
    pub fn happy() -> Self {
        Self::new()
            .always(Step::ExtractStructuredOcr, OCR_REPLY)
            .always(Step::DecideAoi, AOI_REPLY)
            .always(Step::ExtractHeaderData, HEADER_REPLY)
            .always(Step::ExtractLineItemsData, LINE_ITEMS_REPLY)
            .always(Step::ExtractSummaryData, SUMMARY_REPLY)
    }

    /// Answer `step` with `content` every time.
    pub fn always(self, step: Step, content: &str) -> Self {
        self.fallback
            .lock()
            .unwrap()
            .insert(step, Ok(content.to_string()));
        self
    }

    /// Fail every call for `step`.
    pub fn failing(self, step: Step, error: &str) -> Self {
        self.fallback
            .lock()
            .unwrap()
            .insert(step, Err(error.to_string()));
        self
    }

    /// Answer the next call for `step` with `content`, before the fallback.
    pub fn then(self, step: Step, reply: Result<&str, &str>) -> Self {
        self.replies
            .lock()
            .unwrap()
            .entry(step)
            .or_default()
            .push_back(reply.map(str::to_string).map_err(str::to_string));
        self
    }

    pub fn calls_for(&self, step: Step) -> Vec<String> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| *s == step)
            .map(|(_, text)| text.clone())
            .collect()
    }

    pub fn steps_called(&self) -> Vec<Step> {
        self.seen.lock().unwrap().iter().map(|(s, _)| *s).collect()
    }
}

#[async_trait]
impl VisionModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &ModelRequest) -> Result<ModelReply, ModelError> {
        self.seen
            .lock()
            .unwrap()
            .push((request.step, request.user_text.clone()));

        let queued = self
            .replies
            .lock()
            .unwrap()
            .get_mut(&request.step)
            .and_then(|q| q.pop_front());
        let reply = queued.or_else(|| self.fallback.lock().unwrap().get(&request.step).cloned());

        match reply {
            Some(Ok(content)) => Ok(ModelReply {
                content,
                input_tokens: 100,
                output_tokens: 20,
            }),
            Some(Err(e)) => Err(ModelError(e)),
            None => Err(ModelError(format!("no reply scripted for {}", request.step))),
        }
    }
}

/// Config that talks to `model` and never waits long.
pub fn config_for(model: &Arc<ScriptedModel>) -> ExtractionConfig {
    ExtractionConfig::builder()
        .vision_model(Arc::clone(model) as Arc<dyn VisionModel>)
        .max_retries(0)
        .retry_backoff_ms(1)
        .api_timeout_secs(5)
        .build()
        .expect("valid test config")
}

/// A plain PNG page of the given size.
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(
        width,
        height,
        Rgba([250, 250, 250, 255]),
    ));
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .expect("encode png");
    buf
}

pub fn png_upload(name: &str, width: u32, height: u32) -> Upload {
    Upload::new(name, png_bytes(width, height))
}
