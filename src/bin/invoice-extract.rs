//! CLI binary for edgequake-invoice.
//!
//! A thin shim over the library crate: maps flags onto `PipelineConfig`,
//! keeps state (SQLite usage counters and sessions, uploaded blobs) under a
//! data directory, and prints sessions as JSON.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use edgequake_invoice::pipeline::backend::OfflineBackend;
use edgequake_invoice::upload::sniff;
use edgequake_invoice::{
    validate_upload, CallKind, CallerIdentity, CreateSessionRequest, ErrorCode,
    ExtractionProgressCallback, ExtractionService, FsBlobStore, PipelineConfig, PipelineError,
    SessionStatus, StoreBackend, Stores, UploadSource,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::{Path, PathBuf};
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

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Spinner that narrates a single session's run.
struct CliProgressCallback {
    bar: ProgressBar,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}  {elapsed:.dim}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix("Extracting");
        bar.set_message("Uploading…");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar })
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ExtractionProgressCallback for CliProgressCallback {
    fn on_status_change(&self, _session_id: &str, _from: SessionStatus, to: SessionStatus) {
        self.bar.set_message(to.to_string());
    }

    fn on_attempt(&self, _session_id: &str, kind: CallKind, attempt: u32, max_attempts: u32) {
        self.bar
            .set_message(format!("{kind} call, attempt {attempt}/{max_attempts}"));
    }

    fn on_retry(&self, _session_id: &str, kind: CallKind, attempt: u32, backoff_ms: u64, reason: &str) {
        self.bar.println(format!(
            "  {} {kind} attempt {attempt} failed: {}  {}",
            yellow("↻"),
            reason,
            dim(&format!("retry in {backoff_ms}ms"))
        ));
    }

    fn on_fallback(&self, _session_id: &str, code: ErrorCode) {
        self.bar.println(format!(
            "  {} structured extraction failed ({code}), trying plain OCR",
            yellow("⚠")
        ));
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Extract an invoice (prints the session as JSON)
  invoice-extract extract invoice.pdf

  # Keep the upload for re-runs, attribute usage to a user
  invoice-extract extract --keep-upload --user alice receipt.jpg

  # Validate only (no API key needed)
  invoice-extract inspect invoice.pdf

  # Remaining uploads today for an anonymous caller
  invoice-extract usage --ip 203.0.113.7

  # Delete expired uploads and sessions
  invoice-extract sweep

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  RUST_LOG                Log filter (overrides -v)

EXIT STATUS:
  0  completed or needs_review
  1  error outcome, rejected upload, or usage limit reached
"#;

/// Extract structured invoice data using Vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "invoice-extract",
    version,
    about = "Extract structured invoice and receipt data using Vision LLMs",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory holding the usage database and uploaded files.
    #[arg(long, global = true, env = "INVOICE_DATA_DIR", default_value = ".invoice-extract")]
    data_dir: PathBuf,

    /// Uploads per caller per UTC day.
    #[arg(long, global = true, env = "INVOICE_DAILY_LIMIT", default_value_t = 3)]
    daily_limit: u32,

    /// Raise log verbosity (-v info, -vv debug).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Compact JSON instead of pretty-printed output.
    #[arg(long, global = true)]
    compact: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate, reserve quota, and extract one document.
    Extract(ExtractArgs),
    /// Show today's usage for a caller.
    Usage(CallerArgs),
    /// Run one TTL sweep over stored uploads and sessions.
    Sweep,
    /// Validate a file without calling any model.
    Inspect {
        file: PathBuf,
        /// Declared MIME type. Sniffed from the content if omitted.
        #[arg(long = "type")]
        mime: Option<String>,
    },
}

#[derive(Args, Debug)]
struct CallerArgs {
    /// Authenticated user id.
    #[arg(long, env = "INVOICE_USER")]
    user: Option<String>,

    /// Client IP for anonymous callers.
    #[arg(long)]
    ip: Option<String>,
}

impl CallerArgs {
    fn identity(&self) -> CallerIdentity {
        CallerIdentity {
            user_id: self.user.clone(),
            client_ip: self.ip.clone(),
        }
    }
}

#[derive(Args, Debug)]
struct ExtractArgs {
    /// Invoice or receipt (PDF, JPEG or PNG).
    file: PathBuf,

    #[command(flatten)]
    caller: CallerArgs,

    /// Declared MIME type. Sniffed from the content if omitted.
    #[arg(long = "type")]
    mime: Option<String>,

    /// Keep the upload until the TTL sweep instead of deleting it after processing.
    #[arg(long)]
    keep_upload: bool,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// LLM model ID (e.g. gpt-4.1-mini, gemini-2.0-flash).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// Per-call timeout in seconds.
    #[arg(long, default_value_t = 60)]
    api_timeout: u64,

    /// Retries after the first attempt on transient failures.
    #[arg(long, default_value_t = 2)]
    max_retries: u32,

    /// Disable the progress spinner.
    #[arg(long)]
    no_progress: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let ok = match &cli.command {
        Command::Extract(args) => run_extract(&cli, args).await?,
        Command::Usage(caller) => run_usage(&cli, caller).await?,
        Command::Sweep => run_sweep(&cli).await?,
        Command::Inspect { file, mime } => run_inspect(&cli, file, mime.as_deref()).await?,
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

/// Make the pdfium library available before the first PDF is rendered.
///
/// With `bundled` the embedded library is unpacked to the cache. Otherwise
/// the first run downloads it (~30 MB) to the cache; later runs only check
/// that the file is there.
#[cfg(feature = "bundled")]
fn ensure_pdf_engine(_quiet: bool) -> Result<()> {
    tokio::task::block_in_place(pdfium_auto::ensure_pdfium_bundled)
        .context("Failed to extract bundled PDFium engine")?;
    Ok(())
}

#[cfg(not(feature = "bundled"))]
fn ensure_pdf_engine(quiet: bool) -> Result<()> {
    if pdfium_auto::is_pdfium_cached() {
        return Ok(());
    }
    if quiet {
        tokio::task::block_in_place(|| pdfium_auto::ensure_pdfium_library(None))
            .context("Failed to download PDFium engine")?;
        return Ok(());
    }

    let dl_bar = ProgressBar::new(0);
    dl_bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {bytes}/{total_bytes}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]),
    );
    dl_bar.set_prefix("PDF engine");
    dl_bar.enable_steady_tick(Duration::from_millis(80));

    let bar = dl_bar.clone();
    tokio::task::block_in_place(|| {
        pdfium_auto::ensure_pdfium_library(Some(&|downloaded, total| {
            if let Some(t) = total {
                if bar.length() != Some(t) {
                    bar.set_length(t);
                }
            }
            bar.set_position(downloaded);
        }))
    })
    .context("Failed to download PDFium engine")?;

    dl_bar.finish_with_message("ready");
    Ok(())
}

fn print_json<T: serde::Serialize>(cli: &Cli, value: &T) -> Result<()> {
    let out = if cli.compact {
        serde_json::to_string(value)?
    } else {
        serde_json::to_string_pretty(value)?
    };
    println!("{out}");
    Ok(())
}

/// Print a service error as an API error body. Returns `false` for the exit status.
fn report(cli: &Cli, e: &PipelineError) -> Result<bool> {
    eprintln!("{} {}", red("✘"), e);
    print_json(cli, &e.to_api_error())?;
    Ok(false)
}

fn base_config(cli: &Cli) -> edgequake_invoice::PipelineConfigBuilder {
    PipelineConfig::builder().daily_limit(cli.daily_limit)
}

async fn open_service(
    cli: &Cli,
    config: PipelineConfig,
    offline: bool,
) -> Result<ExtractionService> {
    tokio::fs::create_dir_all(&cli.data_dir)
        .await
        .with_context(|| format!("Failed to create data dir {}", cli.data_dir.display()))?;

    let stores = Stores::open_or_memory(&StoreBackend::Sqlite(cli.data_dir.join("invoice.db")));
    let blobs = Arc::new(FsBlobStore::new(cli.data_dir.join("blobs")));

    let mut builder = ExtractionService::builder(config).stores(stores).blobs(blobs);
    if offline {
        builder = builder.backend(Arc::new(OfflineBackend));
    }
    Ok(builder.build()?)
}

async fn read_document(file: &Path, mime: Option<&str>) -> Result<(Vec<u8>, String)> {
    let bytes = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let mime = match mime {
        Some(m) => m.to_string(),
        None => sniff(&bytes)
            .map(|k| k.mime_type().to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string()),
    };
    Ok((bytes, mime))
}

async fn run_extract(cli: &Cli, args: &ExtractArgs) -> Result<bool> {
    let (bytes, mime) = read_document(&args.file, args.mime.as_deref()).await?;
    if mime == "application/pdf" {
        ensure_pdf_engine(args.no_progress)?;
    }

    let progress = (!args.no_progress).then(CliProgressCallback::new);

    let mut builder = base_config(cli)
        .api_timeout_secs(args.api_timeout)
        .max_retries(args.max_retries);
    if let Some(ref p) = args.provider {
        builder = builder.provider_name(p.clone());
    }
    if let Some(ref m) = args.model {
        builder = builder.model(m.clone());
    }
    if let Some(ref cb) = progress {
        builder = builder.progress_callback(cb.clone());
    }
    let service = open_service(cli, builder.build()?, false).await?;

    let file_name = args
        .file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());
    let request = CreateSessionRequest {
        file_name,
        file_size: bytes.len() as u64,
        source: UploadSource::DataUrl(format!("data:{mime};base64,{}", STANDARD.encode(&bytes))),
        file_type: mime,
        delete_after_processing: !args.keep_upload,
    };

    let result = async {
        let session = service
            .create_session(request, &args.caller.identity())
            .await?;
        service.process_session(&session.id).await
    }
    .await;

    if let Some(ref cb) = progress {
        cb.finish();
    }

    let session = match result {
        Ok(s) => s,
        Err(e) => return report(cli, &e),
    };

    match session.status {
        SessionStatus::Completed => eprintln!(
            "{} {} fields extracted",
            green("✔"),
            session.extracted.as_ref().map_or(0, |d| d.fields.len())
        ),
        SessionStatus::NeedsReview => eprintln!(
            "{} needs review: {}",
            yellow("⚠"),
            session.error_message.as_deref().unwrap_or("structured extraction failed")
        ),
        _ => eprintln!(
            "{} {}",
            red("✘"),
            session.error_message.as_deref().unwrap_or("extraction failed")
        ),
    }
    print_json(cli, &session)?;
    Ok(session.status != SessionStatus::Error)
}

async fn run_usage(cli: &Cli, caller: &CallerArgs) -> Result<bool> {
    let service = open_service(cli, base_config(cli).build()?, true).await?;
    match service.usage(&caller.identity()).await {
        Ok(decision) => {
            print_json(cli, &decision)?;
            Ok(true)
        }
        Err(e) => report(cli, &e),
    }
}

async fn run_sweep(cli: &Cli) -> Result<bool> {
    let service = open_service(cli, base_config(cli).build()?, true).await?;
    match service.sweep(Utc::now()).await {
        Ok(swept) => {
            print_json(cli, &swept)?;
            Ok(true)
        }
        Err(e) => report(cli, &e),
    }
}

async fn run_inspect(cli: &Cli, file: &Path, mime: Option<&str>) -> Result<bool> {
    let (bytes, mime) = read_document(file, mime).await?;
    let policy = base_config(cli).build()?.upload_policy();
    let size = bytes.len() as u64;

    let result = tokio::task::spawn_blocking(move || validate_upload(&bytes, &mime, size, &policy))
        .await
        .context("Validation task panicked")?;

    match result {
        Ok(info) => {
            eprintln!("{} {} accepted", green("✔"), file.display());
            print_json(cli, &info)?;
            Ok(true)
        }
        Err(rejection) => report(cli, &PipelineError::from(rejection)),
    }
}
