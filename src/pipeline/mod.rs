//! Pipeline stages that turn uploads into model-ready input, plus the model
//! plumbing every workflow step shares.
//!
//! Each submodule implements exactly one transformation, so each is testable
//! on its own and a backend (pdfium, OCR engine, provider) can be swapped
//! without touching the others.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ stitch ──▶ encode ──▶ ocr ──▶ (workflow steps)
//! (sniff)   (pdfium)   (one plane) (base64)   (tokens)
//! ```
//!
//! 1. [`input`] : classify uploads by magic bytes; resolve CLI paths/URLs
//! 2. [`render`]: rasterise PDF pages and decode images, off the async threads
//! 3. [`stitch`]: stack every page into one image with one 0–1000 plane
//! 4. [`encode`]: PNG-encode and base64-wrap the stitched image
//! 5. [`ocr`]   : word tokens with boxes on the plane
//! 6. [`llm`] / [`reply`]: model calls with retry, and lenient reply parsing

pub mod encode;
pub mod input;
pub mod llm;
pub mod ocr;
pub mod render;
pub mod reply;
pub mod stitch;

use crate::config::ExtractionConfig;
use crate::error::ExtractError;
use edgequake_llm::ImageData;
use input::Upload;
use stitch::StitchedImage;
use tracing::debug;

/// The stitched invoice and its encoded form, ready for the workflow.
#[derive(Debug, Clone)]
pub struct PreparedInvoice {
    pub stitched: StitchedImage,
    pub image: ImageData,
}

/// Load, stitch and encode every upload of one run.
pub async fn prepare(
    uploads: Vec<Upload>,
    config: &ExtractionConfig,
) -> Result<PreparedInvoice, ExtractError> {
    let pages = render::load_pages(uploads, config).await?;

    let max_width = config.max_rendered_pixels;
    let max_height = config.max_stitched_height;
    let stitched = tokio::task::spawn_blocking(move || {
        stitch::stitch_pages(pages, max_width, max_height)
    })
    .await
    .map_err(|e| ExtractError::Internal(format!("Stitch task panicked: {}", e)))??;

    let image = encode::encode_png(&stitched.image).map_err(|e| ExtractError::ImageDecodeFailed {
        name: "stitched invoice".into(),
        detail: format!("PNG encoding failed: {}", e),
    })?;
    debug!(
        "Prepared {}x{} px invoice from {} page(s)",
        stitched.width(),
        stitched.height(),
        stitched.pages.len()
    );

    Ok(PreparedInvoice { stitched, image })
}
