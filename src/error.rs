//! Error types for the edgequake-invoice library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`ExtractError`]: **Fatal**: the run cannot proceed (unreadable upload,
//!   provider not configured, a model call that kept failing). Returned as
//!   `Err(ExtractError)` from the `extract*` functions and sent to the viewer
//!   as the final `{"error": ...}` frame.
//!
//! * [`StepError`]: **Non-fatal**: the model answered, but its reply did
//!   not fit the step's schema. The step yields `null` and the workflow keeps
//!   going, so a bad header reply never costs the line items.

use crate::workflow::Step;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-invoice library.
#[derive(Debug, Error)]
pub enum ExtractError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Input file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The input string is not a valid file path or URL.
    #[error("Invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    /// No files were uploaded, or a file had no bytes.
    #[error("Nothing to extract: {detail}")]
    EmptyUpload { detail: String },

    /// The upload is neither a PDF nor a supported image.
    #[error("Unsupported upload '{name}': expected PDF, PNG or JPEG (first bytes: {magic:?})")]
    UnsupportedUpload { name: String, magic: Vec<u8> },

    /// Uploads add up to more pages than the configured limit.
    #[error("Upload has {pages} pages; at most {max} are accepted")]
    TooManyPages { pages: usize, max: usize },

    // ── PDF / image errors ────────────────────────────────────────────────
    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{name}' is corrupt: {detail}")]
    CorruptPdf { name: String, detail: String },

    /// PDF requires a password but none was provided.
    #[error("PDF '{name}' is encrypted and requires a password.")]
    PasswordRequired { name: String },

    /// A password was provided but it is wrong.
    #[error("Wrong password for PDF '{name}'")]
    WrongPassword { name: String },

    /// pdfium-render returned an error for a specific page.
    #[error("Rasterisation failed for '{name}' page {page}: {detail}")]
    RasterisationFailed {
        name: String,
        page: usize,
        detail: String,
    },

    /// An image upload could not be decoded.
    #[error("Could not decode image '{name}': {detail}")]
    ImageDecodeFailed { name: String, detail: String },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
Install libpdfium for your platform, or point PDFIUM_LIB_PATH at a directory\n\
containing it (libpdfium.so / libpdfium.dylib / pdfium.dll).\n"
    )]
    PdfiumBindingFailed(String),

    // ── LLM / OCR errors ──────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// A workflow step's model call failed after every retry.
    #[error("Step '{step}' failed: {detail}")]
    StepFailed { step: Step, detail: String },

    /// The OCR engine itself failed (not an unparsable reply).
    #[error("OCR failed: {0}")]
    OcrFailed(String),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single workflow step.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum StepError {
    /// The model reply could not be read as the step's schema.
    #[error("{step}: unparsable model reply: {detail}")]
    UnparsableReply { step: Step, detail: String },
}
