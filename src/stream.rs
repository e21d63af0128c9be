//! Streaming extraction API: emit each node's output as it completes.
//!
//! A run takes several model calls; the viewer draws the stitched image,
//! then the areas, then each field box as soon as it exists instead of
//! staring at a spinner. The stream is lazy: a node runs when the consumer
//! polls for the next update, so dropping the stream (a closed browser tab)
//! stops the run without further model calls.

use crate::config::ExtractionConfig;
use crate::error::ExtractError;
use crate::pipeline::input::Upload;
use crate::pipeline::prepare;
use crate::workflow::{stitch_update, StepUpdate, Workflow};
use futures::stream::{self, StreamExt};
use std::pin::Pin;
use tokio_stream::Stream;
use tracing::info;

/// A boxed stream of step updates.
pub type StepStream = Pin<Box<dyn Stream<Item = Result<StepUpdate, ExtractError>> + Send>>;

/// Extract an invoice, streaming one update per step.
///
/// The first item is the `stitch_pages` update (stitched image as a data URL
/// plus page spans), then one item per workflow node in order. An `Err` item
/// is always the last one.
///
/// # Returns
/// - `Ok(StepStream)` once the uploads are loaded and stitched
/// - `Err(ExtractError)` for problems found before any model call
///   (provider not configured, unsupported upload, too many pages)
pub async fn extract_stream(
    uploads: Vec<Upload>,
    config: &ExtractionConfig,
) -> Result<StepStream, ExtractError> {
    let workflow = Workflow::from_config(config)?;
    stream_with(&workflow, uploads).await
}

/// [`extract_stream`] with an already resolved workflow.
pub async fn stream_with(
    workflow: &Workflow,
    uploads: Vec<Upload>,
) -> Result<StepStream, ExtractError> {
    info!("Starting streaming extraction of {} upload(s)", uploads.len());

    let invoice = prepare(uploads, workflow.config()).await?;
    let first = stitch_update(&invoice);
    let run = workflow.start(invoice);

    let steps = stream::unfold(run, |mut run| async move {
        let item = run.advance().await?;
        Some((item, run))
    });

    Ok(Box::pin(stream::once(async move { Ok(first) }).chain(steps)))
}
