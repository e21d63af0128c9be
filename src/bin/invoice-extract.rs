//! CLI binary: extract one invoice from files or URLs.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `ExtractionConfig` and prints the result as JSON.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_invoice::{
    extract, extract_stream, load_inputs, ExtractionConfig, ExtractionProgressCallback, OcrBackend,
    ProgressCallback, Step, StepUpdate,
};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// One bar over the workflow nodes, one log line per finished node.
struct CliProgressCallback {
    bar: ProgressBar,
    warnings: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Loading pages…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            warnings: AtomicUsize::new(0),
        })
    }
}

impl ExtractionProgressCallback for CliProgressCallback {
    fn on_run_start(&self, total_steps: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:30.green/238}] {pos}/{len} steps  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        self.bar.set_length(total_steps as u64);
        self.bar.set_style(style);
        self.bar.set_prefix("Extracting");
    }

    fn on_step_start(&self, step: Step) {
        self.bar.set_message(step.to_string());
    }

    fn on_step_complete(&self, step: Step, elapsed_ms: u64) {
        self.bar.println(format!(
            "  {} {:<26} {}",
            green("✓"),
            step,
            dim(&format!("{:.1}s", elapsed_ms as f64 / 1000.0)),
        ));
        self.bar.inc(1);
    }

    fn on_step_error(&self, step: Step, error: &str) {
        self.warnings.fetch_add(1, Ordering::SeqCst);
        let msg: String = error.chars().take(100).collect();
        self.bar
            .println(format!("  {} {:<26} {}", yellow("⚠"), step, red(&msg)));
    }

    fn on_run_complete(&self, completed_steps: usize, succeeded: bool) {
        self.bar.finish_and_clear();
        let warnings = self.warnings.load(Ordering::SeqCst);
        if succeeded && warnings == 0 {
            eprintln!("{} {} steps completed", green("✔"), bold(&completed_steps.to_string()));
        } else if succeeded {
            eprintln!(
                "{} {} steps completed ({} with warnings)",
                yellow("⚠"),
                bold(&completed_steps.to_string()),
                warnings
            );
        } else {
            eprintln!("{} aborted after {} steps", red("✘"), completed_steps);
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # One scanned invoice
  invoice-extract invoice.png

  # Two-page invoice photographed as two images, stitched in order
  invoice-extract page1.jpg page2.jpg -o invoice.json

  # Watch each step as JSON lines
  invoice-extract --stream invoice.pdf

  # Everything: invoice, areas, OCR tokens, page spans, stats
  invoice-extract --full invoice.pdf

  # Local OCR instead of the vision model (needs the `tesseract` feature)
  invoice-extract --ocr tesseract invoice.pdf

ENVIRONMENT VARIABLES:
  GEMINI_API_KEY          Google Gemini API key (default model gemini-2.5-flash)
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (gemini, openai, anthropic, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Path to libpdfium (file or directory)
"#;

/// Extract structured invoice data from images and PDFs using Vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "invoice-extract",
    version,
    about = "Extract structured invoice data from images and PDFs using Vision LLMs",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local files or HTTP/HTTPS URLs; together they are the pages of one invoice.
    #[arg(required = true)]
    inputs: Vec<String>,

    /// Write JSON to this file instead of stdout.
    #[arg(short, long, env = "INVOICE_OUTPUT")]
    output: Option<PathBuf>,

    /// LLM model ID (e.g. gemini-2.5-flash, gpt-4.1).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: gemini, openai, anthropic, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// OCR engine: vision or tesseract.
    #[arg(long, env = "INVOICE_OCR", default_value = "vision")]
    ocr: OcrBackend,

    /// Rendering DPI for PDF pages (72–400).
    #[arg(long, env = "INVOICE_DPI", default_value_t = 150,
          value_parser = clap::value_parser!(u32).range(72..=400))]
    dpi: u32,

    /// Maximum pages across all inputs.
    #[arg(long, env = "INVOICE_MAX_PAGES", default_value_t = 10)]
    max_pages: usize,

    /// Grow each area of interest by this many units (0–1000 plane) before
    /// selecting its tokens.
    #[arg(long, env = "INVOICE_AREA_MARGIN", default_value_t = 0)]
    area_margin: i32,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "INVOICE_PASSWORD")]
    password: Option<String>,

    /// Max LLM output tokens per step.
    #[arg(long, env = "INVOICE_MAX_TOKENS", default_value_t = 8192)]
    max_tokens: usize,

    /// LLM temperature (0.0–2.0).
    #[arg(long, env = "INVOICE_TEMPERATURE", default_value_t = 0.0)]
    temperature: f32,

    /// Retries per step on LLM failure.
    #[arg(long, env = "INVOICE_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Per-call LLM timeout in seconds.
    #[arg(long, env = "INVOICE_API_TIMEOUT", default_value_t = 120)]
    api_timeout: u64,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "INVOICE_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Print each step update as one JSON line as it completes.
    #[arg(long, conflicts_with = "full")]
    stream: bool,

    /// Keep the stitched image (data URL) in the `stitch_pages` line of `--stream`.
    #[arg(long, requires = "stream")]
    with_image: bool,

    /// Print the full output (invoice, areas, OCR tokens, pages, stats).
    #[arg(long)]
    full: bool,

    /// Disable progress bar.
    #[arg(long, env = "INVOICE_NO_PROGRESS")]
    no_progress: bool,

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

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs; --verbose brings everything back.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.stream;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn ExtractionProgressCallback>)
    } else {
        None
    };

    let config = build_config(&cli, progress_cb)?;
    let uploads = load_inputs(&cli.inputs, &config)
        .await
        .context("Failed to read input")?;

    if cli.stream {
        let mut updates = extract_stream(uploads, &config)
            .await
            .context("Extraction failed")?;
        let stdout = io::stdout();
        while let Some(update) = updates.next().await {
            let update = update.context("Extraction failed")?;
            let line = serde_json::to_string(&printable(update, cli.with_image))
                .context("Failed to serialise update")?;
            let mut handle = stdout.lock();
            writeln!(handle, "{line}").context("Failed to write to stdout")?;
            handle.flush().ok();
        }
        return Ok(());
    }

    let output = extract(uploads, &config)
        .await
        .context("Extraction failed")?;

    if !cli.quiet {
        eprintln!(
            "   {} line items  ·  {} model calls  ·  {} tokens in / {} out  ·  {}ms",
            output.invoice.line_items.len(),
            output.stats.model_calls(),
            dim(&output.stats.total_input_tokens().to_string()),
            dim(&output.stats.total_output_tokens().to_string()),
            output.stats.total_duration_ms,
        );
    }

    let json = if cli.full {
        serde_json::to_string_pretty(&output)
    } else {
        serde_json::to_string_pretty(&output.invoice)
    }
    .context("Failed to serialise output")?;

    match cli.output {
        Some(ref path) => {
            tokio::fs::write(path, format!("{json}\n"))
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            if !cli.quiet {
                eprintln!("{} wrote {}", green("✔"), bold(&path.display().to_string()));
            }
        }
        None => println!("{json}"),
    }

    Ok(())
}

/// Drop the stitched image from `stitch_pages` unless asked to keep it.
fn printable(mut update: StepUpdate, with_image: bool) -> StepUpdate {
    if update.step == Step::StitchPages && !with_image {
        if let Some(obj) = update.output.as_object_mut() {
            obj.remove("image");
        }
    }
    update
}

/// Map CLI args to `ExtractionConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<ExtractionConfig> {
    let mut builder = ExtractionConfig::builder()
        .ocr_backend(cli.ocr)
        .dpi(cli.dpi)
        .max_pages(cli.max_pages)
        .area_margin(cli.area_margin)
        .max_tokens(cli.max_tokens)
        .temperature(cli.temperature)
        .max_retries(cli.max_retries)
        .api_timeout_secs(cli.api_timeout)
        .download_timeout_secs(cli.download_timeout);

    if let Some(ref model) = cli.model {
        builder = builder.model(model);
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider);
    }
    if let Some(ref password) = cli.password {
        builder = builder.password(password);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}
