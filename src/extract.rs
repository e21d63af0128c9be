//! Eager extraction entry points.
//!
//! These wait for every workflow node and return the finished
//! [`ExtractionOutput`]. Use [`crate::stream::extract_stream`] instead when
//! each node's output should be shown as soon as it exists.

use crate::config::ExtractionConfig;
use crate::error::ExtractError;
use crate::pipeline::input::{self, Upload};
use crate::pipeline::prepare;
use crate::workflow::{ExtractionOutput, Workflow};
use std::time::Instant;
use tracing::info;

/// Extract an invoice from uploaded files.
///
/// The files are pages of one invoice, in order. PDFs contribute every page,
/// images one page each.
///
/// # Errors
/// Returns `Err(ExtractError)` only for fatal errors:
/// - No uploads, unsupported file type, too many pages
/// - Provider not configured
/// - A model call that failed after every retry
///
/// An unparsable reply is not fatal: that part of the invoice stays empty.
pub async fn extract(
    uploads: Vec<Upload>,
    config: &ExtractionConfig,
) -> Result<ExtractionOutput, ExtractError> {
    // Resolve the provider before rendering anything, so a missing key
    // fails fast.
    let workflow = Workflow::from_config(config)?;
    extract_with(&workflow, uploads).await
}

/// [`extract`] with an already resolved workflow (the server reuses one).
pub async fn extract_with(
    workflow: &Workflow,
    uploads: Vec<Upload>,
) -> Result<ExtractionOutput, ExtractError> {
    let total_start = Instant::now();
    info!("Starting extraction of {} upload(s)", uploads.len());

    let invoice = prepare(uploads, workflow.config()).await?;
    let prepare_duration_ms = total_start.elapsed().as_millis() as u64;

    let mut run = workflow.start(invoice);
    run.run_to_end().await?;

    let mut output = run.into_output();
    output.stats.prepare_duration_ms = prepare_duration_ms;
    output.stats.total_duration_ms = total_start.elapsed().as_millis() as u64;

    info!(
        "Extraction complete: {} line item(s), {} model calls, {}ms total",
        output.invoice.line_items.len(),
        output.stats.model_calls(),
        output.stats.total_duration_ms
    );
    Ok(output)
}

/// Resolve local paths or URLs into uploads, in order.
pub async fn load_inputs(
    inputs: &[impl AsRef<str>],
    config: &ExtractionConfig,
) -> Result<Vec<Upload>, ExtractError> {
    let mut uploads = Vec::with_capacity(inputs.len());
    for input in inputs {
        uploads.push(input::resolve_input(input.as_ref(), config.download_timeout_secs).await?);
    }
    Ok(uploads)
}

/// Synchronous wrapper around [`extract`].
///
/// Creates a temporary tokio runtime internally.
pub fn extract_sync(
    uploads: Vec<Upload>,
    config: &ExtractionConfig,
) -> Result<ExtractionOutput, ExtractError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| ExtractError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(extract(uploads, config))
}
