//! The extraction workflow: six nodes run strictly in order over one
//! shared [`WorkflowState`].
//!
//! ```text
//! extract_structured_ocr ─▶ decide_aoi ─▶ extract_header_data
//!   ─▶ extract_line_items_data ─▶ extract_summary_data ─▶ aggregate_results
//! ```
//!
//! Each node reads what earlier nodes wrote and emits a [`StepUpdate`] with
//! its own output. The three field extractors only see the OCR tokens that
//! fall inside their area of interest, so the model reads a header as a
//! header and a totals block as a totals block.
//!
//! Failure handling follows two rules:
//!
//! * A model call that keeps failing after every retry aborts the run with
//!   [`ExtractError::StepFailed`]; no later node runs.
//! * A reply that arrives but cannot be parsed yields `null` for that node
//!   and the run continues. Aggregation copes with any node being `null`.

use crate::config::ExtractionConfig;
use crate::error::ExtractError;
use crate::pipeline::encode::data_url;
use crate::pipeline::llm::{call_with_retry, resolve_vision_model, ModelRequest, Usage, VisionModel};
use crate::pipeline::ocr::{engine_for, OcrEngine};
use crate::pipeline::reply::parse_reply;
use crate::pipeline::PreparedInvoice;
use crate::prompts;
use crate::schema::{
    AreasOfInterest, BoundingBox, CompleteInvoice, ExtractedHeader, ExtractedLineItems,
    ExtractedSummary, LineItem, OcrToken, PageSpan,
};
use serde::de::DeserializeOwned;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

// ── Steps ────────────────────────────────────────────────────────────────

/// Names of everything that can show up in the update stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// Pages loaded and stacked; not a workflow node, but streamed first so
    /// the viewer can draw the image before any model call finishes.
    StitchPages,
    ExtractStructuredOcr,
    DecideAoi,
    ExtractHeaderData,
    ExtractLineItemsData,
    ExtractSummaryData,
    AggregateResults,
}

impl Step {
    /// The workflow nodes, in execution order.
    pub const WORKFLOW: [Step; 6] = [
        Step::ExtractStructuredOcr,
        Step::DecideAoi,
        Step::ExtractHeaderData,
        Step::ExtractLineItemsData,
        Step::ExtractSummaryData,
        Step::AggregateResults,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Step::StitchPages => "stitch_pages",
            Step::ExtractStructuredOcr => "extract_structured_ocr",
            Step::DecideAoi => "decide_aoi",
            Step::ExtractHeaderData => "extract_header_data",
            Step::ExtractLineItemsData => "extract_line_items_data",
            Step::ExtractSummaryData => "extract_summary_data",
            Step::AggregateResults => "aggregate_results",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Updates ──────────────────────────────────────────────────────────────

/// One node's output. Serialises as `{"<step_name>": <output>}`, the shape
/// each SSE frame carries.
#[derive(Debug, Clone, PartialEq)]
pub struct StepUpdate {
    pub step: Step,
    pub output: Value,
}

impl Serialize for StepUpdate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(self.step.as_str(), &self.output)?;
        map.end()
    }
}

/// The first update of every stream: the image the boxes refer to.
pub fn stitch_update(invoice: &PreparedInvoice) -> StepUpdate {
    StepUpdate {
        step: Step::StitchPages,
        output: json!({
            "image": data_url(&invoice.image),
            "width": invoice.stitched.width(),
            "height": invoice.stitched.height(),
            "pages": invoice.stitched.pages,
        }),
    }
}

// ── State and stats ──────────────────────────────────────────────────────

/// Everything the nodes have produced so far.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkflowState {
    pub ocr_data: Vec<OcrToken>,
    pub areas_of_interest: AreasOfInterest,
    pub extracted_header: Option<ExtractedHeader>,
    pub extracted_line_items: Option<ExtractedLineItems>,
    pub extracted_summary: Option<ExtractedSummary>,
    pub extracted_data: CompleteInvoice,
}

/// What one node cost.
#[derive(Debug, Clone, Serialize)]
pub struct StepStats {
    pub step: Step,
    pub duration_ms: u64,
    pub model_calls: u32,
    pub retries: u32,
    pub input_tokens: usize,
    pub output_tokens: usize,
    /// The node had no area to work on and made no call.
    pub skipped: bool,
    /// The model answered but the reply was unusable.
    pub unparsable: bool,
}

/// Statistics for a complete run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtractionStats {
    pub pages: usize,
    pub ocr_tokens: usize,
    /// Load + stitch + encode.
    pub prepare_duration_ms: u64,
    pub total_duration_ms: u64,
    pub steps: Vec<StepStats>,
}

impl ExtractionStats {
    pub fn model_calls(&self) -> u32 {
        self.steps.iter().map(|s| s.model_calls).sum()
    }

    pub fn total_input_tokens(&self) -> usize {
        self.steps.iter().map(|s| s.input_tokens).sum()
    }

    pub fn total_output_tokens(&self) -> usize {
        self.steps.iter().map(|s| s.output_tokens).sum()
    }
}

/// Result of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionOutput {
    pub invoice: CompleteInvoice,
    pub areas: AreasOfInterest,
    pub ocr_tokens: Vec<OcrToken>,
    pub pages: Vec<PageSpan>,
    pub stats: ExtractionStats,
}

// ── Token filtering and aggregation ──────────────────────────────────────

/// Tokens whose box lies entirely inside `area` grown by `margin`.
pub fn filter_tokens_by_area(tokens: &[OcrToken], area: &BoundingBox, margin: i32) -> Vec<OcrToken> {
    let area = area.expanded(margin);
    tokens
        .iter()
        .filter(|t| area.contains(&t.bbox))
        .cloned()
        .collect()
}

/// Merge the three extractor outputs into one invoice.
///
/// Every non-null header and summary field is copied; line items are copied
/// as-is, or `[]` when the line-items node produced nothing.
pub fn aggregate(
    header: Option<&ExtractedHeader>,
    line_items: Option<&ExtractedLineItems>,
    summary: Option<&ExtractedSummary>,
) -> CompleteInvoice {
    let mut invoice = CompleteInvoice::default();

    if let Some(h) = header {
        invoice.invoice_number = h.invoice_number.clone();
        invoice.vendor_name = h.vendor_name.clone();
        invoice.client_name = h.client_name.clone();
        invoice.invoice_date = h.invoice_date.clone();
        invoice.due_date = h.due_date.clone();
    }

    if let Some(s) = summary {
        invoice.total_amount = s.total_amount.clone();
        invoice.tax_amount = s.tax_amount.clone();
    }

    invoice.line_items = line_items
        .map(|l| l.line_items.clone())
        .unwrap_or_default();

    invoice
}

/// Line items may come back wrapped or as a bare array.
#[derive(Deserialize)]
#[serde(untagged)]
enum LineItemsReply {
    Wrapped(ExtractedLineItems),
    Bare(Vec<LineItem>),
}

impl From<LineItemsReply> for ExtractedLineItems {
    fn from(reply: LineItemsReply) -> Self {
        match reply {
            LineItemsReply::Wrapped(items) => items,
            LineItemsReply::Bare(line_items) => ExtractedLineItems { line_items },
        }
    }
}

// ── Workflow ─────────────────────────────────────────────────────────────

/// The model and OCR engine a run talks to, plus its config.
#[derive(Clone)]
pub struct Workflow {
    model: Arc<dyn VisionModel>,
    ocr: Arc<dyn OcrEngine>,
    config: ExtractionConfig,
}

impl Workflow {
    pub fn new(model: Arc<dyn VisionModel>, ocr: Arc<dyn OcrEngine>, config: ExtractionConfig) -> Self {
        Self { model, ocr, config }
    }

    /// Resolve the vision model and OCR engine named by `config`.
    pub fn from_config(config: &ExtractionConfig) -> Result<Self, ExtractError> {
        let model = resolve_vision_model(config)?;
        let ocr = engine_for(config, Arc::clone(&model))?;
        Ok(Self::new(model, ocr, config.clone()))
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    /// Start a run over a prepared invoice.
    pub fn start(&self, invoice: PreparedInvoice) -> WorkflowRun {
        WorkflowRun {
            workflow: self.clone(),
            stats: ExtractionStats {
                pages: invoice.stitched.pages.len(),
                ..Default::default()
            },
            invoice,
            state: WorkflowState::default(),
            next: 0,
            finished: false,
            started: Instant::now(),
        }
    }
}

/// Outcome of one node before it becomes an update.
struct NodeResult {
    output: Value,
    usage: Usage,
    skipped: bool,
    unparsable: bool,
}

impl NodeResult {
    fn local(output: Value) -> Self {
        Self {
            output,
            usage: Usage::default(),
            skipped: false,
            unparsable: false,
        }
    }
}

/// A run in progress. Call [`WorkflowRun::advance`] until it returns `None`.
pub struct WorkflowRun {
    workflow: Workflow,
    invoice: PreparedInvoice,
    state: WorkflowState,
    stats: ExtractionStats,
    next: usize,
    finished: bool,
    started: Instant,
}

impl WorkflowRun {
    pub fn invoice(&self) -> &PreparedInvoice {
        &self.invoice
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    /// Run the next node. `None` once every node ran or one failed.
    pub async fn advance(&mut self) -> Option<Result<StepUpdate, ExtractError>> {
        if self.finished {
            return None;
        }
        let Some(&step) = Step::WORKFLOW.get(self.next) else {
            self.finish(true);
            return None;
        };

        let callback = self.workflow.config.progress_callback.clone();
        if self.next == 0 {
            if let Some(ref cb) = callback {
                cb.on_run_start(Step::WORKFLOW.len());
            }
        }
        if let Some(ref cb) = callback {
            cb.on_step_start(step);
        }

        info!("Running {}", step);
        let start = Instant::now();
        let result = self.run_node(step).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(node) => {
                self.next += 1;
                self.stats.steps.push(StepStats {
                    step,
                    duration_ms,
                    model_calls: node.usage.calls,
                    retries: node.usage.retries,
                    input_tokens: node.usage.input_tokens,
                    output_tokens: node.usage.output_tokens,
                    skipped: node.skipped,
                    unparsable: node.unparsable,
                });
                if let Some(ref cb) = callback {
                    if node.unparsable {
                        cb.on_step_error(step, "unparsable model reply");
                    }
                    cb.on_step_complete(step, duration_ms);
                }
                debug!("{} finished in {}ms", step, duration_ms);

                if self.next == Step::WORKFLOW.len() {
                    self.finish(true);
                }
                Some(Ok(StepUpdate {
                    step,
                    output: node.output,
                }))
            }
            Err(e) => {
                warn!("{} failed: {}", step, e);
                if let Some(ref cb) = callback {
                    cb.on_step_error(step, &e.to_string());
                }
                self.finish(false);
                Some(Err(e))
            }
        }
    }

    /// Drive every remaining node, discarding updates.
    pub async fn run_to_end(&mut self) -> Result<(), ExtractError> {
        while let Some(update) = self.advance().await {
            update?;
        }
        Ok(())
    }

    pub fn into_output(self) -> ExtractionOutput {
        ExtractionOutput {
            invoice: self.state.extracted_data,
            areas: self.state.areas_of_interest,
            ocr_tokens: self.state.ocr_data,
            pages: self.invoice.stitched.pages,
            stats: self.stats,
        }
    }

    fn finish(&mut self, succeeded: bool) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.stats.ocr_tokens = self.state.ocr_data.len();
        self.stats.total_duration_ms = self.started.elapsed().as_millis() as u64;
        info!(
            "Workflow {} after {}/{} steps, {} model calls, {}ms",
            if succeeded { "complete" } else { "aborted" },
            self.next,
            Step::WORKFLOW.len(),
            self.stats.model_calls(),
            self.stats.total_duration_ms
        );
        if let Some(ref cb) = self.workflow.config.progress_callback {
            cb.on_run_complete(self.next, succeeded);
        }
    }

    async fn run_node(&mut self, step: Step) -> Result<NodeResult, ExtractError> {
        match step {
            Step::ExtractStructuredOcr => {
                let outcome = self.workflow.ocr.recognise(&self.invoice).await?;
                self.state.ocr_data = outcome.tokens;
                Ok(NodeResult {
                    output: json!({ "ocr_data": self.state.ocr_data }),
                    usage: outcome.usage,
                    skipped: false,
                    unparsable: false,
                })
            }
            Step::DecideAoi => {
                let user_text = format!(
                    "OCR Token Data with Full Coordinates:\n{}",
                    prompts::format_tokens(&self.state.ocr_data)
                );
                let (areas, mut node) = self
                    .ask::<AreasOfInterest>(step, prompts::aoi_system_prompt(), user_text)
                    .await?;
                self.state.areas_of_interest = areas.unwrap_or_default();
                node.output = json!({ "areas_of_interest": self.state.areas_of_interest });
                Ok(node)
            }
            Step::ExtractHeaderData => {
                let area = self.state.areas_of_interest.header_area;
                let (header, node) = self
                    .ask_area::<ExtractedHeader>(step, area, "Header Area", prompts::header_system_prompt())
                    .await?;
                self.state.extracted_header = header;
                Ok(with_output(node, json!({ "extracted_header": self.state.extracted_header })))
            }
            Step::ExtractLineItemsData => {
                let area = self.state.areas_of_interest.line_items_area;
                let (items, node) = self
                    .ask_area::<LineItemsReply>(
                        step,
                        area,
                        "Line Items Area",
                        prompts::line_items_system_prompt(),
                    )
                    .await?;
                self.state.extracted_line_items = items.map(ExtractedLineItems::from);
                Ok(with_output(
                    node,
                    json!({ "extracted_line_items": self.state.extracted_line_items }),
                ))
            }
            Step::ExtractSummaryData => {
                let area = self.state.areas_of_interest.summary_area;
                let (summary, node) = self
                    .ask_area::<ExtractedSummary>(step, area, "Summary Area", prompts::summary_system_prompt())
                    .await?;
                self.state.extracted_summary = summary;
                Ok(with_output(node, json!({ "extracted_summary": self.state.extracted_summary })))
            }
            Step::AggregateResults => {
                self.state.extracted_data = aggregate(
                    self.state.extracted_header.as_ref(),
                    self.state.extracted_line_items.as_ref(),
                    self.state.extracted_summary.as_ref(),
                );
                Ok(NodeResult::local(json!({ "extracted_data": self.state.extracted_data })))
            }
            Step::StitchPages => Err(ExtractError::Internal(
                "stitch_pages is not a workflow node".into(),
            )),
        }
    }

    /// Area-scoped extraction. No area means no call and a `null` output.
    async fn ask_area<T: DeserializeOwned>(
        &self,
        step: Step,
        area: Option<BoundingBox>,
        label: &str,
        system: String,
    ) -> Result<(Option<T>, NodeResult), ExtractError> {
        let Some(area) = area else {
            info!("{}: no area of interest, skipping", step);
            let mut node = NodeResult::local(Value::Null);
            node.skipped = true;
            return Ok((None, node));
        };

        let tokens = filter_tokens_by_area(&self.state.ocr_data, &area, self.workflow.config.area_margin);
        debug!("{}: {} of {} tokens inside {:?}", step, tokens.len(), self.state.ocr_data.len(), area);
        self.ask(step, system, prompts::area_user_message(label, &tokens))
            .await
    }

    /// One model call; an unparsable reply becomes `None`.
    async fn ask<T: DeserializeOwned>(
        &self,
        step: Step,
        system: String,
        user_text: String,
    ) -> Result<(Option<T>, NodeResult), ExtractError> {
        let request = ModelRequest {
            step,
            system,
            user_text,
            images: Vec::new(),
        };
        let (reply, retries) =
            call_with_retry(self.workflow.model.as_ref(), &request, &self.workflow.config).await?;

        let mut node = NodeResult::local(Value::Null);
        node.usage.record(&reply, retries);

        match parse_reply::<T>(step, &reply.content) {
            Ok(value) => Ok((Some(value), node)),
            Err(e) => {
                warn!("{}; continuing without it", e);
                node.unparsable = true;
                Ok((None, node))
            }
        }
    }
}

fn with_output(mut node: NodeResult, output: Value) -> NodeResult {
    node.output = output;
    node
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::WithValue;

    fn tok(text: &str, x1: i32, y1: i32, x2: i32, y2: i32) -> OcrToken {
        OcrToken {
            text: text.into(),
            bbox: BoundingBox::new(x1, y1, x2, y2),
            confidence: None,
        }
    }

    #[test]
    fn step_names_are_snake_case() {
        assert_eq!(Step::DecideAoi.to_string(), "decide_aoi");
        assert_eq!(
            serde_json::to_value(Step::ExtractLineItemsData).unwrap(),
            json!("extract_line_items_data")
        );
        assert_eq!(Step::WORKFLOW.len(), 6);
        assert_eq!(Step::WORKFLOW[0], Step::ExtractStructuredOcr);
        assert_eq!(Step::WORKFLOW[5], Step::AggregateResults);
    }

    #[test]
    fn update_serialises_under_step_name() {
        let update = StepUpdate {
            step: Step::ExtractSummaryData,
            output: json!({ "extracted_summary": null }),
        };
        assert_eq!(
            serde_json::to_string(&update).unwrap(),
            r#"{"extract_summary_data":{"extracted_summary":null}}"#
        );
    }

    #[test]
    fn filter_keeps_only_contained_tokens() {
        let tokens = vec![
            tok("inside", 10, 10, 50, 20),
            tok("edge", 0, 0, 100, 100),
            tok("straddles", 90, 90, 110, 95),
            tok("outside", 200, 200, 210, 210),
        ];
        let area = BoundingBox::new(0, 0, 100, 100);
        let kept: Vec<_> = filter_tokens_by_area(&tokens, &area, 0)
            .into_iter()
            .map(|t| t.text)
            .collect();
        assert_eq!(kept, vec!["inside", "edge"]);
    }

    #[test]
    fn margin_admits_tokens_just_outside() {
        let tokens = vec![tok("straddles", 90, 90, 110, 95)];
        let area = BoundingBox::new(0, 0, 100, 100);
        assert!(filter_tokens_by_area(&tokens, &area, 0).is_empty());
        assert_eq!(filter_tokens_by_area(&tokens, &area, 10).len(), 1);
    }

    #[test]
    fn aggregate_merges_non_null_fields() {
        let header = ExtractedHeader {
            vendor_name: Some(WithValue::new("ACME".to_string(), None)),
            ..Default::default()
        };
        let summary = ExtractedSummary {
            total_amount: Some(WithValue::new(99.5, Some(BoundingBox::new(1, 2, 3, 4)))),
            tax_amount: None,
        };
        let items = ExtractedLineItems {
            line_items: vec![
                LineItem {
                    description: Some(WithValue::new("Widget".to_string(), None)),
                    ..Default::default()
                },
                LineItem::default(),
            ],
        };

        let invoice = aggregate(Some(&header), Some(&items), Some(&summary));
        assert_eq!(invoice.vendor_name.unwrap().value, "ACME");
        assert!(invoice.invoice_number.is_none());
        assert_eq!(invoice.total_amount.unwrap().value, 99.5);
        assert!(invoice.tax_amount.is_none());
        assert_eq!(invoice.line_items.len(), 2);
    }

    #[test]
    fn aggregate_of_nothing_has_empty_line_items() {
        let invoice = aggregate(None, None, None);
        assert_eq!(invoice, CompleteInvoice::default());
        assert!(invoice.line_items.is_empty());
    }

    #[test]
    fn bare_line_item_array_is_accepted() {
        let reply: LineItemsReply =
            serde_json::from_value(json!([{ "description": "Hours", "total_price": "10.00" }])).unwrap();
        let items = ExtractedLineItems::from(reply);
        assert_eq!(items.line_items.len(), 1);
        assert_eq!(items.line_items[0].total_price.as_ref().unwrap().value, 10.0);
    }

    #[test]
    fn stats_sum_over_steps() {
        let step = |calls, input, output| StepStats {
            step: Step::DecideAoi,
            duration_ms: 1,
            model_calls: calls,
            retries: 0,
            input_tokens: input,
            output_tokens: output,
            skipped: false,
            unparsable: false,
        };
        let stats = ExtractionStats {
            steps: vec![step(1, 100, 10), step(2, 50, 5)],
            ..Default::default()
        };
        assert_eq!(stats.model_calls(), 3);
        assert_eq!(stats.total_input_tokens(), 150);
        assert_eq!(stats.total_output_tokens(), 15);
    }
}
