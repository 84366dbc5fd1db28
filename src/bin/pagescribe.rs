//! CLI binary for pagescribe.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `PipelineConfig`, writes the report and prints a summary.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use pagescribe::{
    save_report, transcribe, LocalContrast, NormalizeParams, PipelineConfig, PipelineProgress,
    ProgressCallback,
};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
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
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

/// Cut `msg` to at most `max` characters, marking the cut with an ellipsis.
fn truncate(msg: &str, max: usize) -> String {
    if msg.chars().count() <= max {
        msg.to_string()
    } else {
        let head: String = msg.chars().take(max.saturating_sub(1)).collect();
        format!("{head}\u{2026}")
    }
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: a live progress bar plus one log line per
/// finished page and per failed attempt. Pages finish out of order.
struct CliProgress {
    bar: ProgressBar,
    start_times: Mutex<HashMap<usize, Instant>>,
    retries: AtomicUsize,
}

impl CliProgress {
    /// Spinner only until `on_run_start` tells us the page count.
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Rendering pages…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            retries: AtomicUsize::new(0),
        })
    }

    fn activate_bar(&self, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Transcribing");
        self.bar.reset_eta();
    }

    fn elapsed_secs(&self, page: usize) -> f64 {
        self.start_times
            .lock()
            .ok()
            .and_then(|mut m| m.remove(&page))
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl PipelineProgress for CliProgress {
    fn on_run_start(&self, total_pages: usize) {
        self.activate_bar(total_pages);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Transcribing {total_pages} pages…"))
        ));
    }

    fn on_page_start(&self, page: usize) {
        if let Ok(mut m) = self.start_times.lock() {
            m.insert(page, Instant::now());
        }
        self.bar.set_message(format!("page {page}"));
    }

    fn on_attempt_failed(&self, page: usize, attempt: u32, error: &str) {
        self.retries.fetch_add(1, Ordering::SeqCst);
        self.bar.println(format!(
            "  {} Page {:>3}  attempt {}  {}",
            yellow("↻"),
            page,
            attempt,
            dim(&truncate(error, 80)),
        ));
    }

    fn on_page_complete(&self, page: usize, attempts: u32) {
        let secs = self.elapsed_secs(page);
        let tries = if attempts == 1 {
            "1 attempt".to_string()
        } else {
            format!("{attempts} attempts")
        };
        self.bar.println(format!(
            "  {} Page {:>3}  {:<10}  {}",
            green("✓"),
            page,
            dim(&tries),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_page_error(&self, page: usize, error: &str) {
        let secs = self.elapsed_secs(page);
        self.bar.println(format!(
            "  {} Page {:>3}  {}  {}",
            red("✗"),
            page,
            red(&truncate(error, 80)),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_run_complete(&self, total_pages: usize, succeeded: usize) {
        let failed = total_pages.saturating_sub(succeeded);
        let retries = self.retries.load(Ordering::SeqCst);
        self.bar.finish_and_clear();

        if failed == 0 {
            eprintln!(
                "{} {} pages transcribed  {}",
                green("✔"),
                bold(&succeeded.to_string()),
                dim(&format!("({retries} retries)")),
            );
        } else {
            eprintln!(
                "{} {}/{} pages transcribed  ({} failed, {} retries)",
                if failed == total_pages {
                    red("✘")
                } else {
                    cyan("⚠")
                },
                bold(&succeeded.to_string()),
                total_pages,
                red(&failed.to_string()),
                retries,
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Transcribe into llm_results/all_pages.md
  pagescribe notes.pdf

  # Custom report path, more workers, fewer attempts
  pagescribe notes.pdf -o notebook.md -c 8 --max-retries 2

  # Lined paper with faint pencil
  pagescribe --remove-lines --clahe-clip 2.0 notes.pdf

  # Pick a model explicitly
  pagescribe --provider gemini --model gemini-2.0-flash notes.pdf

  # Machine-readable report on stdout
  pagescribe --json notes.pdf > report.json

OUTPUT:
  The report is written atomically to --output. Every page that exhausts
  its attempts gets its last raw response saved as page_NNN_failed.txt in
  --failed-dir for manual review.

ENVIRONMENT VARIABLES:
  GEMINI_API_KEY             Google Gemini API key
  OPENAI_API_KEY             OpenAI API key
  ANTHROPIC_API_KEY          Anthropic API key
  PAGESCRIBE_LLM_PROVIDER    Override provider (gemini, openai, anthropic, ollama)
  PAGESCRIBE_MODEL           Override model ID
  PDFIUM_LIB_PATH            Path to libpdfium (file or directory)
  RUST_LOG                   Log filter, e.g. pagescribe=debug
"#;

/// Transcribe scanned handwritten notes with a vision model.
#[derive(Parser, Debug)]
#[command(
    name = "pagescribe",
    version,
    about = "Transcribe scanned handwritten notes page by page with a vision model",
    long_about = "Render each page of a scanned PDF, clean it up into a black-on-white \
image, and ask a vision model for a structured transcript (Markdown, tags, date). \
Invalid answers are retried with exponential backoff; pages that never validate are \
saved for manual review.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local PDF file path.
    input: PathBuf,

    /// Where to write the Markdown report.
    #[arg(
        short,
        long,
        env = "PAGESCRIBE_OUTPUT",
        default_value = "llm_results/all_pages.md"
    )]
    output: PathBuf,

    /// Directory for the raw responses of failed pages.
    #[arg(
        long,
        env = "PAGESCRIBE_FAILED_DIR",
        default_value = "llm_results/failed_responses"
    )]
    failed_dir: PathBuf,

    /// Maximum number of pages processed at once.
    #[arg(short, long, env = "PAGESCRIBE_CONCURRENCY", default_value_t = 4,
          value_parser = clap::value_parser!(u64).range(1..))]
    concurrency: u64,

    /// Attempts per page before it is marked failed.
    #[arg(long, env = "PAGESCRIBE_MAX_RETRIES", default_value_t = 3,
          value_parser = clap::value_parser!(u32).range(1..))]
    max_retries: u32,

    /// Base backoff between attempts; doubles after each failure.
    #[arg(long, env = "PAGESCRIBE_RETRY_BACKOFF_MS", default_value_t = 1000)]
    retry_backoff_ms: u64,

    /// Per-attempt deadline for the model call in seconds (0 disables).
    #[arg(long, env = "PAGESCRIBE_ATTEMPT_TIMEOUT", default_value_t = 120)]
    attempt_timeout: u64,

    /// Rendering DPI (72–600).
    #[arg(long, env = "PAGESCRIBE_DPI", default_value_t = 300,
          value_parser = clap::value_parser!(u32).range(72..=600))]
    dpi: u32,

    /// Vision model ID (e.g. gemini-2.0-flash, gpt-4.1-mini).
    #[arg(long, env = "PAGESCRIBE_MODEL")]
    model: Option<String>,

    /// LLM provider: gemini, openai, anthropic, ollama, …
    #[arg(
        long,
        env = "PAGESCRIBE_LLM_PROVIDER",
        long_help = "LLM provider. Auto-detected from API key env vars if not set."
    )]
    provider: Option<String>,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "PAGESCRIBE_PASSWORD")]
    password: Option<String>,

    /// Path to a text file replacing the built-in transcription prompt.
    #[arg(long, env = "PAGESCRIBE_PROMPT")]
    prompt: Option<PathBuf>,

    /// Paint out horizontal ruled lines before thresholding.
    #[arg(long, env = "PAGESCRIBE_REMOVE_LINES")]
    remove_lines: bool,

    /// Enable local contrast equalization with this clip limit (e.g. 2.0).
    #[arg(long, env = "PAGESCRIBE_CLAHE_CLIP")]
    clahe_clip: Option<f32>,

    /// Print the full report (with per-page results) as JSON on stdout.
    #[arg(long, env = "PAGESCRIBE_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "PAGESCRIBE_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PAGESCRIBE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PAGESCRIBE_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar carries the per-page feedback, so library INFO logs
    // are hidden while it is shown.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
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

    // ── Build config ─────────────────────────────────────────────────────
    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgress::new_dynamic() as Arc<dyn PipelineProgress>)
    } else {
        None
    };

    let config = build_config(&cli, progress_cb).await?;

    // ── Run ──────────────────────────────────────────────────────────────
    let start = Instant::now();
    let report = transcribe(&cli.input, &config)
        .await
        .context("Transcription failed")?;
    save_report(&report, &cli.output, &cli.failed_dir)
        .await
        .context("Failed to save report")?;

    if cli.json {
        let json = serde_json::to_string_pretty(&report).context("Failed to serialise report")?;
        println!("{json}");
    }

    if !cli.quiet {
        let total = report.succeeded + report.failed;
        eprintln!(
            "{}  {}/{} pages  {}ms  →  {}",
            if report.failed == 0 {
                green("✔")
            } else {
                cyan("⚠")
            },
            report.succeeded,
            total,
            start.elapsed().as_millis(),
            bold(&cli.output.display().to_string()),
        );
        if report.failed > 0 {
            eprintln!(
                "   {} failed page(s) saved to {}",
                red(&report.failed.to_string()),
                dim(&cli.failed_dir.display().to_string()),
            );
        }
    }

    Ok(())
}

/// Map CLI args to `PipelineConfig`.
async fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<PipelineConfig> {
    let normalize = NormalizeParams {
        remove_lines: cli.remove_lines,
        local_contrast: cli.clahe_clip.map(|clip_limit| LocalContrast {
            clip_limit,
            ..LocalContrast::default()
        }),
        ..NormalizeParams::default()
    };

    let timeout = match cli.attempt_timeout {
        0 => None,
        secs => Some(secs),
    };

    let mut builder = PipelineConfig::builder()
        .concurrency(cli.concurrency as usize)
        .max_retries(cli.max_retries)
        .retry_backoff_ms(cli.retry_backoff_ms)
        .attempt_timeout_secs(timeout)
        .dpi(cli.dpi)
        .normalize(normalize);

    if let Some(ref path) = cli.prompt {
        let prompt = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read prompt from {:?}", path))?;
        builder = builder.prompt(prompt);
    }
    if let Some(ref model) = cli.model {
        builder = builder.model(model.clone());
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider.clone());
    }
    if let Some(ref password) = cli.password {
        builder = builder.password(password.clone());
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}
