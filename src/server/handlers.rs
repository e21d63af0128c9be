use super::AppState;
use crate::error::ExtractError;
use crate::pipeline::input::Upload;
use crate::stream::stream_with;
use crate::workflow::StepUpdate;
use axum::extract::{Multipart, State};
use axum::response::sse::{Event, KeepAlive, KeepAliveStream, Sse};
use axum::response::Html;
use axum::Json;
use futures::stream::{self, Stream, StreamExt};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::pin::Pin;
use tracing::{info, warn};

type EventStream = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

const VIEWER: &str = include_str!("../../static/index.html");

pub async fn index() -> Html<&'static str> {
    Html(VIEWER)
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "model": state.workflow.model_name(),
    }))
}

pub async fn schema() -> Json<Value> {
    Json(crate::schema::invoice_schema())
}

/// `POST /api/extract-invoice`: every file field is one upload, in order.
///
/// Always answers with an event stream. Problems found before the first
/// step (bad multipart, no files, unsupported type) are sent as a single
/// error frame so the viewer has one error path.
pub async fn extract_invoice(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Sse<KeepAliveStream<EventStream>> {
    let events: EventStream = match read_uploads(multipart).await {
        Ok(uploads) => match stream_with(&state.workflow, uploads).await {
            Ok(updates) => Box::pin(updates.map(|item| {
                let data = match item {
                    Ok(update) => update_frame(&update),
                    Err(e) => {
                        warn!("Extraction failed: {}", e);
                        error_frame(&e.to_string())
                    }
                };
                Ok(Event::default().data(data))
            })),
            Err(e) => single_error(e),
        },
        Err(e) => single_error(e),
    };

    Sse::new(events).keep_alive(KeepAlive::default())
}

async fn read_uploads(mut multipart: Multipart) -> Result<Vec<Upload>, ExtractError> {
    let mut uploads = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ExtractError::InvalidInput {
            input: format!("multipart body: {}", e),
        })?
    {
        let Some(name) = field.file_name().map(str::to_string) else {
            continue;
        };
        let bytes = field.bytes().await.map_err(|e| ExtractError::InvalidInput {
            input: format!("upload '{}': {}", name, e),
        })?;
        info!("Received '{}' ({} bytes)", name, bytes.len());
        uploads.push(Upload::new(name, bytes.to_vec()));
    }

    if uploads.is_empty() {
        return Err(ExtractError::EmptyUpload {
            detail: "the request contained no files".into(),
        });
    }
    Ok(uploads)
}

fn single_error(e: ExtractError) -> EventStream {
    warn!("Rejected upload: {}", e);
    let event = Event::default().data(error_frame(&e.to_string()));
    Box::pin(stream::once(async move { Ok(event) }))
}

/// SSE payload for one step update: `{"<step_name>": {...}}`.
pub fn update_frame(update: &StepUpdate) -> String {
    serde_json::to_string(update)
        .unwrap_or_else(|e| error_frame(&format!("could not serialise {}: {}", update.step, e)))
}

/// SSE payload for a failure: `{"error": "<message>"}`.
pub fn error_frame(message: &str) -> String {
    json!({ "error": message }).to_string()
}
