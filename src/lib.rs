//! # edgequake-invoice
//!
//! Extract structured invoice data (vendor, dates, line items, totals, each
//! with a bounding box) from images and PDFs using Vision Language Models.
//!
//! ## Why this crate?
//!
//! Template-based invoice parsers break on the first vendor whose layout
//! they have not seen. Instead this crate stitches every page into one
//! image, reads its words with their positions, asks a VLM where the header,
//! line-items table and totals are, and then extracts each region from only
//! the words inside it. Every value comes back with the box it was read
//! from, so a viewer can show exactly where each number came from.
//!
//! ## Pipeline Overview
//!
//! ```text
//! uploads (PDF / PNG / JPEG)
//!  │
//!  ├─ 1. Input    sniff file type by magic bytes
//!  ├─ 2. Render   rasterise PDF pages via pdfium (spawn_blocking)
//!  ├─ 3. Stitch   stack pages into one image, one 0–1000 plane
//!  ├─ 4. OCR      word tokens with boxes (VLM or tesseract)
//!  ├─ 5. AOI      header / line items / summary areas
//!  ├─ 6. Fields   one model call per area, fed only that area's tokens
//!  └─ 7. Merge    CompleteInvoice + per-step stats
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_invoice::{extract, ExtractionConfig, Upload};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from GEMINI_API_KEY / OPENAI_API_KEY / ...
//!     let config = ExtractionConfig::default();
//!     let upload = Upload::new("invoice.pdf", std::fs::read("invoice.pdf")?);
//!     let output = extract(vec![upload], &config).await?;
//!     println!("{}", serde_json::to_string_pretty(&output.invoice)?);
//!     eprintln!("{} model calls", output.stats.model_calls());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature     | Default | Description |
//! |-------------|---------|-------------|
//! | `cli`       | on      | `invoice-extract` / `invoice-server` binaries (clap + anyhow + tracing-subscriber + indicatif) |
//! | `server`    | on      | axum HTTP server with the SSE endpoint and the embedded viewer |
//! | `tesseract` | off     | Local OCR through the system tesseract install |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod extract;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod schema;
#[cfg(feature = "server")]
pub mod server;
pub mod stream;
pub mod workflow;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ExtractionConfig, ExtractionConfigBuilder, OcrBackend, ServerConfig};
pub use error::{ExtractError, StepError};
pub use extract::{extract, extract_sync, extract_with, load_inputs};
pub use pipeline::input::Upload;
pub use pipeline::llm::{ModelError, ModelReply, ModelRequest, VisionModel};
pub use progress::{ExtractionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use schema::{
    AreasOfInterest, BoundingBox, CompleteInvoice, ExtractedHeader, ExtractedLineItems,
    ExtractedSummary, LineItem, OcrToken, PageSpan, WithValue,
};
pub use stream::{extract_stream, stream_with, StepStream};
pub use workflow::{ExtractionOutput, ExtractionStats, Step, StepStats, StepUpdate, Workflow};
