//! HTTP server binary: the extraction endpoint plus the browser viewer.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_invoice::server::serve;
use edgequake_invoice::{ExtractionConfig, OcrBackend, ServerConfig, Workflow};
use std::io;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Serve the invoice extractor and its viewer over HTTP.
#[derive(Parser, Debug)]
#[command(
    name = "invoice-server",
    version,
    about = "Serve the invoice extractor and its browser viewer",
    color = clap::ColorChoice::Auto
)]
struct Cli {
    /// Address to listen on.
    #[arg(long, env = "INVOICE_BIND", default_value = "0.0.0.0:8000")]
    bind: SocketAddr,

    /// Maximum upload size in bytes (all files of one request together).
    #[arg(long, env = "INVOICE_MAX_UPLOAD_BYTES", default_value_t = 25 * 1024 * 1024)]
    max_upload_bytes: usize,

    /// LLM model ID (e.g. gemini-2.5-flash, gpt-4.1).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: gemini, openai, anthropic, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// OCR engine: vision or tesseract.
    #[arg(long, env = "INVOICE_OCR", default_value = "vision")]
    ocr: OcrBackend,

    /// Maximum pages per request.
    #[arg(long, env = "INVOICE_MAX_PAGES", default_value_t = 10)]
    max_pages: usize,

    /// Grow each area of interest by this many units before selecting its tokens.
    #[arg(long, env = "INVOICE_AREA_MARGIN", default_value_t = 0)]
    area_margin: i32,

    /// Retries per step on LLM failure.
    #[arg(long, env = "INVOICE_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "INVOICE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "INVOICE_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "info,tower_http=debug"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let mut builder = ExtractionConfig::builder()
        .ocr_backend(cli.ocr)
        .max_pages(cli.max_pages)
        .area_margin(cli.area_margin)
        .max_retries(cli.max_retries);
    if let Some(ref model) = cli.model {
        builder = builder.model(model);
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider);
    }
    let config = builder.build().context("Invalid configuration")?;

    // Fails here, not on the first upload, when no API key is set.
    let workflow = Workflow::from_config(&config).context("Cannot start without an LLM provider")?;
    info!("Extraction model: {}", workflow.model_name());

    let server = ServerConfig {
        bind: cli.bind,
        max_upload_bytes: cli.max_upload_bytes,
    };
    serve(workflow, &server).await.context("Server failed")?;
    Ok(())
}
