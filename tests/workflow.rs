//! Workflow integration tests driven by a scripted vision model.
//!
//! No network and no pdfium: uploads are generated PNGs and every model
//! reply comes from `common::ScriptedModel`.

mod common;

use common::*;
use edgequake_invoice::{
    extract, extract_stream, BoundingBox, ExtractError, ExtractionConfig,
    ExtractionProgressCallback, Step, StepUpdate, Upload, VisionModel,
};
use futures::StreamExt;
use serde_json::Value;
use std::sync::{Arc, Mutex};

async fn collect_stream(
    model: &Arc<ScriptedModel>,
    uploads: Vec<Upload>,
) -> Vec<Result<StepUpdate, ExtractError>> {
    extract_stream(uploads, &config_for(model))
        .await
        .expect("stream starts")
        .collect()
        .await
}

#[tokio::test]
async fn full_run_builds_the_invoice() {
    let model = Arc::new(ScriptedModel::happy());
    let output = extract(vec![png_upload("invoice.png", 200, 280)], &config_for(&model))
        .await
        .expect("extraction succeeds");

    let invoice = &output.invoice;
    assert_eq!(invoice.invoice_number.as_ref().unwrap().value, "INV-7");
    assert_eq!(
        invoice.vendor_name.as_ref().unwrap().bbox,
        Some(BoundingBox::new(50, 20, 200, 60))
    );
    assert!(invoice.client_name.is_none());
    assert_eq!(invoice.total_amount.as_ref().unwrap().value, 20.0);
    assert!(invoice.tax_amount.is_none());

    assert_eq!(invoice.line_items.len(), 1);
    let item = &invoice.line_items[0];
    assert_eq!(item.description.as_ref().unwrap().value, "Widget");
    assert_eq!(item.quantity.as_ref().unwrap().value, 2.0);
    assert_eq!(item.unit_price.as_ref().unwrap().value, 5.0);

    assert_eq!(output.ocr_tokens.len(), 7);
    assert!(output.areas.summary_area.is_some());
    assert_eq!(output.pages.len(), 1);

    assert_eq!(output.stats.steps.len(), 6);
    assert_eq!(output.stats.model_calls(), 5);
    assert_eq!(output.stats.total_input_tokens(), 500);
    assert_eq!(output.stats.ocr_tokens, 7);
}

#[tokio::test]
async fn steps_run_in_order() {
    let model = Arc::new(ScriptedModel::happy());
    extract(vec![png_upload("invoice.png", 100, 100)], &config_for(&model))
        .await
        .unwrap();

    assert_eq!(
        model.steps_called(),
        vec![
            Step::ExtractStructuredOcr,
            Step::DecideAoi,
            Step::ExtractHeaderData,
            Step::ExtractLineItemsData,
            Step::ExtractSummaryData,
        ]
    );
}

#[tokio::test]
async fn field_steps_only_see_tokens_in_their_area() {
    let model = Arc::new(ScriptedModel::happy());
    extract(vec![png_upload("invoice.png", 100, 100)], &config_for(&model))
        .await
        .unwrap();

    let aoi = &model.calls_for(Step::DecideAoi)[0];
    assert!(aoi.starts_with("OCR Token Data with Full Coordinates:"));
    assert!(aoi.contains("Widget") && aoi.contains("ACME"));

    let header = &model.calls_for(Step::ExtractHeaderData)[0];
    assert!(header.starts_with("Header Area OCR Tokens:"));
    assert!(header.contains("text: 'ACME', x1: 50, y1: 20, x2: 200, y2: 60"));
    assert!(!header.contains("Widget"));

    let items = &model.calls_for(Step::ExtractLineItemsData)[0];
    assert!(items.contains("Widget") && items.contains("10.00"));
    assert!(!items.contains("Total"));

    let summary = &model.calls_for(Step::ExtractSummaryData)[0];
    assert!(summary.contains("Total") && summary.contains("20.00"));
    assert!(!summary.contains("INV-7"));
}

#[tokio::test]
async fn stream_starts_with_stitched_image_then_each_node() {
    let model = Arc::new(ScriptedModel::happy());
    let updates = collect_stream(&model, vec![png_upload("invoice.png", 120, 160)]).await;

    let steps: Vec<Step> = updates
        .iter()
        .map(|u| u.as_ref().expect("no errors").step)
        .collect();
    let mut expected = vec![Step::StitchPages];
    expected.extend(Step::WORKFLOW);
    assert_eq!(steps, expected);

    let first = updates[0].as_ref().unwrap();
    let image = first.output["image"].as_str().unwrap();
    assert!(image.starts_with("data:image/png;base64,"));
    assert_eq!(first.output["width"], 120);
    assert_eq!(first.output["pages"][0]["y2"], 1000);

    let frame: Value = serde_json::to_value(updates[2].as_ref().unwrap()).unwrap();
    assert_eq!(
        frame["decide_aoi"]["areas_of_interest"]["header_area"],
        serde_json::json!({"x1": 0, "y1": 0, "x2": 1000, "y2": 100})
    );

    let last: Value = serde_json::to_value(updates[6].as_ref().unwrap()).unwrap();
    assert_eq!(
        last["aggregate_results"]["extracted_data"]["vendor_name"]["value"],
        "ACME"
    );
}

#[tokio::test]
async fn unparsable_reply_yields_null_and_run_continues() {
    let model = Arc::new(
        ScriptedModel::happy().always(Step::ExtractHeaderData, "I could not find a header, sorry."),
    );
    let updates = collect_stream(&model, vec![png_upload("invoice.png", 100, 100)]).await;
    assert_eq!(updates.len(), 7);

    let header = updates[3].as_ref().unwrap();
    assert_eq!(header.step, Step::ExtractHeaderData);
    assert_eq!(header.output["extracted_header"], Value::Null);

    let last = updates[6].as_ref().unwrap();
    let data = &last.output["extracted_data"];
    assert_eq!(data["vendor_name"], Value::Null);
    assert_eq!(data["total_amount"]["value"], 20.0);
    assert_eq!(data["line_items"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn missing_area_skips_its_step() {
    let model = Arc::new(ScriptedModel::happy().always(
        Step::DecideAoi,
        r#"{"header_area": [0, 0, 1000, 100], "line_items_area": [0, 350, 1000, 500], "summary_area": null}"#,
    ));
    let output = extract(vec![png_upload("invoice.png", 100, 100)], &config_for(&model))
        .await
        .unwrap();

    assert!(model.calls_for(Step::ExtractSummaryData).is_empty());
    assert!(output.invoice.total_amount.is_none());
    assert_eq!(output.invoice.invoice_number.unwrap().value, "INV-7");

    let summary = output
        .stats
        .steps
        .iter()
        .find(|s| s.step == Step::ExtractSummaryData)
        .unwrap();
    assert!(summary.skipped);
    assert_eq!(summary.model_calls, 0);
}

#[tokio::test]
async fn unparsable_areas_leave_an_empty_invoice() {
    let model = Arc::new(ScriptedModel::happy().always(Step::DecideAoi, "no idea"));
    let output = extract(vec![png_upload("invoice.png", 100, 100)], &config_for(&model))
        .await
        .unwrap();

    assert_eq!(
        model.steps_called(),
        vec![Step::ExtractStructuredOcr, Step::DecideAoi]
    );
    assert!(output.invoice.vendor_name.is_none());
    assert!(output.invoice.line_items.is_empty());
    assert_eq!(output.stats.steps.len(), 6);
}

#[tokio::test]
async fn failing_model_call_aborts_the_run() {
    let model = Arc::new(ScriptedModel::happy().failing(Step::ExtractLineItemsData, "HTTP 503"));
    let updates = collect_stream(&model, vec![png_upload("invoice.png", 100, 100)]).await;

    // stitch, ocr, aoi, header, then the error
    assert_eq!(updates.len(), 5);
    match updates.last().unwrap() {
        Err(ExtractError::StepFailed { step, detail }) => {
            assert_eq!(*step, Step::ExtractLineItemsData);
            assert!(detail.contains("HTTP 503"), "got: {detail}");
        }
        other => panic!("expected StepFailed, got {other:?}"),
    }
    assert!(model.calls_for(Step::ExtractSummaryData).is_empty());

    let err = extract(vec![png_upload("invoice.png", 100, 100)], &config_for(&model))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("extract_line_items_data"));
}

#[tokio::test]
async fn transient_failure_is_retried() {
    let model = Arc::new(
        ScriptedModel::happy().then(Step::DecideAoi, Err("HTTP 429 rate limited")),
    );
    let config = ExtractionConfig::builder()
        .vision_model(Arc::clone(&model) as Arc<dyn VisionModel>)
        .max_retries(2)
        .retry_backoff_ms(1)
        .build()
        .unwrap();

    let output = extract(vec![png_upload("invoice.png", 100, 100)], &config)
        .await
        .unwrap();
    assert_eq!(model.calls_for(Step::DecideAoi).len(), 2);

    let aoi = output
        .stats
        .steps
        .iter()
        .find(|s| s.step == Step::DecideAoi)
        .unwrap();
    assert_eq!(aoi.retries, 1);
    assert_eq!(aoi.model_calls, 1);
}

#[tokio::test]
async fn unreadable_ocr_reply_is_fatal() {
    let model = Arc::new(ScriptedModel::happy().always(Step::ExtractStructuredOcr, "<html>"));
    let err = extract(vec![png_upload("invoice.png", 100, 100)], &config_for(&model))
        .await
        .unwrap_err();
    assert!(matches!(err, ExtractError::OcrFailed(_)), "got: {err}");
    assert_eq!(model.steps_called(), vec![Step::ExtractStructuredOcr]);
}

#[tokio::test]
async fn pages_are_stitched_in_upload_order() {
    let model = Arc::new(ScriptedModel::happy());
    let output = extract(
        vec![
            png_upload("page1.png", 200, 100),
            png_upload("page2.png", 100, 100),
        ],
        &config_for(&model),
    )
    .await
    .unwrap();

    assert_eq!(output.pages.len(), 2);
    assert_eq!(output.pages[0].page, 1);
    assert_eq!(output.pages[0].y1, 0);
    assert_eq!(output.pages[0].y2, output.pages[1].y1);
    assert_eq!(output.pages[1].y2, 1000);
    assert_eq!(output.stats.pages, 2);
}

#[tokio::test]
async fn upload_problems_fail_before_any_model_call() {
    let model = Arc::new(ScriptedModel::happy());

    let err = extract_stream(
        vec![Upload::new("notes.txt", b"hello world".to_vec())],
        &config_for(&model),
    )
    .await
    .err()
    .expect("unsupported upload");
    assert!(matches!(err, ExtractError::UnsupportedUpload { .. }), "got: {err}");

    let config = ExtractionConfig::builder()
        .vision_model(Arc::clone(&model) as Arc<dyn VisionModel>)
        .max_pages(1)
        .build()
        .unwrap();
    let err = extract(
        vec![png_upload("a.png", 10, 10), png_upload("b.png", 10, 10)],
        &config,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ExtractError::TooManyPages { .. }), "got: {err}");

    let err = extract(Vec::new(), &config_for(&model)).await.unwrap_err();
    assert!(matches!(err, ExtractError::EmptyUpload { .. }), "got: {err}");

    assert!(model.steps_called().is_empty());
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl ExtractionProgressCallback for Recorder {
    fn on_run_start(&self, total_steps: usize) {
        self.events.lock().unwrap().push(format!("start {total_steps}"));
    }
    fn on_step_start(&self, step: Step) {
        self.events.lock().unwrap().push(format!("> {step}"));
    }
    fn on_step_complete(&self, step: Step, _elapsed_ms: u64) {
        self.events.lock().unwrap().push(format!("< {step}"));
    }
    fn on_step_error(&self, step: Step, _error: &str) {
        self.events.lock().unwrap().push(format!("! {step}"));
    }
    fn on_run_complete(&self, completed_steps: usize, succeeded: bool) {
        self.events
            .lock()
            .unwrap()
            .push(format!("done {completed_steps} {succeeded}"));
    }
}

#[tokio::test]
async fn progress_callback_sees_every_step() {
    let model = Arc::new(ScriptedModel::happy().always(Step::ExtractSummaryData, "???"));
    let recorder = Arc::new(Recorder::default());
    let config = ExtractionConfig::builder()
        .vision_model(Arc::clone(&model) as Arc<dyn VisionModel>)
        .progress_callback(Arc::clone(&recorder) as Arc<dyn ExtractionProgressCallback>)
        .max_retries(0)
        .build()
        .unwrap();

    extract(vec![png_upload("invoice.png", 100, 100)], &config)
        .await
        .unwrap();

    let events = recorder.events.lock().unwrap().clone();
    assert_eq!(events.first().unwrap(), "start 6");
    assert_eq!(events.last().unwrap(), "done 6 true");
    assert!(events.contains(&"! extract_summary_data".to_string()));
    assert_eq!(events.iter().filter(|e| e.starts_with("< ")).count(), 6);
}

#[tokio::test]
async fn progress_callback_reports_aborted_run() {
    let model = Arc::new(ScriptedModel::happy().failing(Step::DecideAoi, "boom"));
    let recorder = Arc::new(Recorder::default());
    let config = ExtractionConfig::builder()
        .vision_model(Arc::clone(&model) as Arc<dyn VisionModel>)
        .progress_callback(Arc::clone(&recorder) as Arc<dyn ExtractionProgressCallback>)
        .max_retries(0)
        .build()
        .unwrap();

    assert!(extract(vec![png_upload("invoice.png", 100, 100)], &config)
        .await
        .is_err());

    let events = recorder.events.lock().unwrap().clone();
    assert!(events.contains(&"! decide_aoi".to_string()));
    assert_eq!(events.last().unwrap(), "done 1 false");
}
