//! CLI binary for edgequake-pdfchat.
//!
//! A thin shim over the library crate: flags map to `ProcessingConfig`,
//! saved settings come from the `ConfigStore`, and a terminal observer
//! renders the session's events.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use edgequake_pdfchat::pipeline::vision::check_api_key_format;
use edgequake_pdfchat::store::mask_key;
use edgequake_pdfchat::{
    Config, ConfigStore, ConversationMessage, ImageFormat, NoopObserver, NotifyLevel,
    OpenRouterClient, ProcessingConfig, ProviderVisionClient, RasterBackend, Role, RunOutcome,
    RunReport, Session, SessionObserver, SharedObserver, VisionApi,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers ──────────────────────────────────────────────────────

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

// ── Terminal observer using indicatif ────────────────────────────────────────

/// Renders session events: a spinner while rasterising, then a page bar with
/// one log line per page. With a hidden bar the same lines go to stderr.
struct CliObserver {
    bar: ProgressBar,
    page_started: Mutex<Option<Instant>>,
    page_failed: Mutex<bool>,
    errors: AtomicUsize,
}

impl CliObserver {
    fn new(show_bar: bool) -> Arc<Self> {
        let bar = if show_bar {
            let bar = ProgressBar::new(0);
            bar.set_style(
                ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner())
                    .tick_strings(TICKS),
            );
            bar.set_prefix("Preparing");
            bar.enable_steady_tick(Duration::from_millis(80));
            bar
        } else {
            ProgressBar::hidden()
        };

        Arc::new(Self {
            bar,
            page_started: Mutex::new(None),
            page_failed: Mutex::new(false),
            errors: AtomicUsize::new(0),
        })
    }

    fn line(&self, text: String) {
        if self.bar.is_hidden() {
            eprintln!("{text}");
        } else {
            self.bar.println(text);
        }
    }

    fn elapsed(&self) -> String {
        let secs = self
            .page_started
            .lock()
            .ok()
            .and_then(|mut t| t.take())
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        dim(&format!("{secs:.1}s"))
    }
}

impl SessionObserver for CliObserver {
    fn on_progress(&self, text: &str, _percent: f32) {
        self.bar.set_message(text.to_string());
    }

    fn on_run_start(&self, total_pages: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total_pages as u64);
        self.bar.set_style(style);
        self.bar.set_prefix("Reading");
        self.bar.reset_eta();
        self.line(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Processing {total_pages} pages…"))
        ));
    }

    fn on_page_start(&self, _page_num: usize, _total_pages: usize) {
        if let Ok(mut t) = self.page_started.lock() {
            *t = Some(Instant::now());
        }
    }

    fn on_page_error(&self, _page_num: usize, _total_pages: usize, _error: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut f) = self.page_failed.lock() {
            *f = true;
        }
    }

    fn on_message(&self, page_num: usize, message: &ConversationMessage) {
        if message.role != Role::Assistant {
            return;
        }
        let failed = self
            .page_failed
            .lock()
            .map(|mut f| std::mem::take(&mut *f))
            .unwrap_or(false);
        let total = self.bar.length().unwrap_or(0);

        let mark = if failed { red("✗") } else { green("✓") };
        let detail = if failed {
            red("failed")
        } else {
            dim(&format!("{:>5} chars", message.text().len()))
        };
        self.line(format!(
            "  {mark} Page {page_num:>3}/{total:<3}  {detail}  {}",
            self.elapsed()
        ));
        self.bar.inc(1);
    }

    fn on_notify(&self, level: NotifyLevel, message: &str) {
        let icon = match level {
            NotifyLevel::Info => cyan("ℹ"),
            NotifyLevel::Success => green("✔"),
            NotifyLevel::Warning => yellow("⚠"),
            NotifyLevel::Error => red("✘"),
        };
        self.line(format!("{icon} {message}"));
    }

    fn on_run_complete(&self, report: &RunReport) {
        self.bar.finish_and_clear();
        eprintln!(
            "{}  {}/{} pages  {}ms{}",
            match (report.outcome, report.failed_pages) {
                (RunOutcome::Completed, 0) => green("✔"),
                _ => yellow("⚠"),
            },
            report.succeeded_pages,
            report.total_pages,
            report.duration_ms,
            if self.errors.load(Ordering::SeqCst) > 0 {
                format!("  ({} failed)", red(&report.failed_pages.to_string()))
            } else {
                String::new()
            }
        );
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Save an OpenRouter key (validated before it is written)
  pdfchat config set --api-key sk-or-v1-...

  # Ask the same question of every page
  pdfchat process report.pdf -p "List the key figures on this page."

  # Export the conversation afterwards (default name: pdfchat-conversation-YYYY-MM-DD.json)
  pdfchat process report.pdf -p "Summarise" --export

  # Render with pdfium instead of pdftoppm
  pdfchat process --backend pdfium --dpi 150 slides.pdf -p "Describe the slide"

  # Use an edgequake-llm provider (credentials from its own env vars)
  pdfchat process --provider openai --model gpt-4.1-mini paper.pdf -p "Extract equations"

  # Is the API reachable? Is my key accepted?
  pdfchat check
  pdfchat validate-key

ENVIRONMENT VARIABLES:
  PDFCHAT_CONFIG          Path of the saved settings file
  PDFCHAT_API_KEY         OpenRouter API key (overrides the saved key for this run)
  PDFCHAT_MODEL           Model ID (default: google/gemini-2.5-pro-preview)
  PDFCHAT_BASE_URL        Chat-completions API base URL
  PDFIUM_LIB_PATH         Path to libpdfium for --backend pdfium
  RUST_LOG                Override log filtering

SETUP:
  pdftoppm comes with poppler:  apt install poppler-utils  |  brew install poppler
"#;

/// Have a vision LLM read a PDF page by page, with one running conversation.
#[derive(Parser, Debug)]
#[command(
    name = "pdfchat",
    version,
    about = "Read PDFs page by page with a vision LLM, keeping one conversation",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Settings file (default: <config dir>/pdfchat/config.json).
    #[arg(long, env = "PDFCHAT_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PDFCHAT_VERBOSE", global = true)]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PDFCHAT_QUIET", global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send every page of a PDF to the model with the same prompt.
    Process(ProcessArgs),

    /// Show or change the saved settings.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Check that the vision API is reachable.
    Check(ModelArgs),

    /// Check that the provider accepts an API key.
    ValidateKey {
        /// Key to check (default: the saved key).
        #[arg(long, env = "PDFCHAT_API_KEY")]
        api_key: Option<String>,

        #[command(flatten)]
        model: ModelArgs,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the saved settings (the key is masked).
    Show,

    /// Print the settings file location.
    Path,

    /// Validate and save new settings. Omitted fields keep their saved value.
    Set {
        #[arg(long)]
        api_key: Option<String>,

        #[arg(long, conflicts_with = "system_prompt_file")]
        system_prompt: Option<String>,

        /// Read the system prompt from a file.
        #[arg(long)]
        system_prompt_file: Option<PathBuf>,

        #[command(flatten)]
        model: ModelArgs,
    },
}

#[derive(Args, Debug)]
struct ProcessArgs {
    /// PDF file to read.
    input: PathBuf,

    /// Question or instruction sent with every page.
    #[arg(short, long, env = "PDFCHAT_PROMPT")]
    prompt: String,

    /// API key for this run (default: the saved key).
    #[arg(long, env = "PDFCHAT_API_KEY")]
    api_key: Option<String>,

    /// System prompt for this run (default: the saved one).
    #[arg(long)]
    system_prompt: Option<String>,

    /// Export the conversation as JSON, optionally to PATH.
    #[arg(long, value_name = "PATH", num_args = 0..=1)]
    export: Option<Option<PathBuf>>,

    /// Print the conversation as JSON on stdout instead of text.
    #[arg(long)]
    json: bool,

    /// Rasterizer backend.
    #[arg(long, env = "PDFCHAT_BACKEND", value_enum, default_value = "pdftoppm")]
    backend: BackendArg,

    /// Page image format.
    #[arg(long, env = "PDFCHAT_FORMAT", value_enum, default_value = "jpeg")]
    format: FormatArg,

    /// Rendering DPI (72–400).
    #[arg(long, env = "PDFCHAT_DPI", default_value_t = 200,
          value_parser = clap::value_parser!(u32).range(72..=400))]
    dpi: u32,

    /// Disable progress bar.
    #[arg(long, env = "PDFCHAT_NO_PROGRESS")]
    no_progress: bool,

    #[command(flatten)]
    model: ModelArgs,
}

/// Flags that select and tune the vision backend.
#[derive(Args, Debug, Clone)]
struct ModelArgs {
    /// Vision model ID.
    #[arg(long, env = "PDFCHAT_MODEL")]
    model: Option<String>,

    /// Use an edgequake-llm provider (openai, anthropic, gemini, ollama, …)
    /// instead of OpenRouter.
    #[arg(long, env = "PDFCHAT_PROVIDER")]
    provider: Option<String>,

    /// Chat-completions API base URL.
    #[arg(long, env = "PDFCHAT_BASE_URL")]
    base_url: Option<String>,

    /// LLM temperature (0.0–2.0).
    #[arg(long, env = "PDFCHAT_TEMPERATURE", default_value_t = 0.7)]
    temperature: f32,

    /// Max output tokens per page.
    #[arg(long, env = "PDFCHAT_MAX_TOKENS", default_value_t = 4000)]
    max_tokens: usize,

    /// Per-page request timeout in seconds.
    #[arg(long, env = "PDFCHAT_API_TIMEOUT", default_value_t = 30)]
    api_timeout: u64,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum BackendArg {
    Pdftoppm,
    Pdfium,
}

impl From<BackendArg> for RasterBackend {
    fn from(v: BackendArg) -> Self {
        match v {
            BackendArg::Pdftoppm => RasterBackend::Pdftoppm,
            BackendArg::Pdfium => RasterBackend::Pdfium,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum FormatArg {
    Jpeg,
    Png,
}

impl From<FormatArg> for ImageFormat {
    fn from(v: FormatArg) -> Self {
        match v {
            FormatArg::Jpeg => ImageFormat::Jpeg,
            FormatArg::Png => ImageFormat::Png,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar carries the user-facing feedback during a run, so
    // library INFO logs are suppressed while it is visible.
    let show_progress = match &cli.command {
        Command::Process(args) => !cli.quiet && !args.no_progress && !args.json,
        _ => false,
    };
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

    std::panic::set_hook(Box::new(|info| {
        tracing::error!("panic: {info}");
    }));

    let store = match &cli.config {
        Some(path) => ConfigStore::new(path),
        None => ConfigStore::from_env_or_default(),
    };

    match cli.command {
        Command::Process(ref args) => run_process(args, store, cli.quiet, show_progress).await,
        Command::Config { ref action } => run_config(action, store, cli.quiet).await,
        Command::Check(ref model) => {
            let config = build_config(model, None)?;
            let vision = build_vision(model, &config)?;
            if vision.check_connectivity().await {
                println!("{} {} is reachable", green("✔"), config.base_url);
                Ok(())
            } else {
                anyhow::bail!("No connection to {}", config.base_url)
            }
        }
        Command::ValidateKey {
            ref api_key,
            ref model,
        } => {
            let config = build_config(model, None)?;
            let key = match api_key {
                Some(k) => k.trim().to_string(),
                None => store.load().await.api_key,
            };
            check_api_key_format(&key, &config.api_key_prefix)?;
            let vision = build_vision(model, &config)?;
            if vision.validate_api_key(&key).await {
                println!("{} API key {} is valid", green("✔"), mask_key(&key));
                Ok(())
            } else {
                anyhow::bail!("API key {} was rejected", mask_key(&key))
            }
        }
    }
}

async fn run_process(
    args: &ProcessArgs,
    store: ConfigStore,
    quiet: bool,
    show_progress: bool,
) -> Result<()> {
    let config = build_config(&args.model, Some(args))?;
    let vision = build_vision(&args.model, &config)?;
    let rasterizer = RasterBackend::from(args.backend).build(&config);

    let mut settings = store.load().await;
    if let Some(key) = &args.api_key {
        settings.api_key = key.trim().to_string();
    }
    if let Some(prompt) = &args.system_prompt {
        settings.system_prompt = prompt.trim().to_string();
    }

    let observer: SharedObserver = if quiet {
        Arc::new(NoopObserver)
    } else {
        CliObserver::new(show_progress)
    };

    let mut session = Session::new(config, rasterizer, vision)
        .with_settings(settings)
        .with_store(store)
        .with_observer(observer);

    session
        .select_file(&args.input)
        .with_context(|| format!("Cannot use {}", args.input.display()))?;

    // Ctrl-C stops the run after the page in flight.
    let token = session.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", yellow("Stopping after the current page…"));
            token.cancel();
        }
    });

    let report = session
        .process(&args.prompt)
        .await
        .context("Processing failed")?;

    print_conversation(
        session.history().non_system(),
        args.json,
        &mut io::stdout().lock(),
    )?;

    if let Some(target) = &args.export {
        let path = session
            .export_history(target.as_deref())
            .await
            .context("Export failed")?;
        if !quiet {
            eprintln!("{} Exported to {}", green("✔"), bold(&path.display().to_string()));
        }
    }

    if report.total_pages > 0 && report.succeeded_pages == 0 && report.failed_pages > 0 {
        anyhow::bail!("All {} processed pages failed", report.failed_pages);
    }
    Ok(())
}

async fn run_config(action: &ConfigAction, store: ConfigStore, quiet: bool) -> Result<()> {
    match action {
        ConfigAction::Path => {
            println!("{}", store.path().display());
        }
        ConfigAction::Show => {
            let saved = store.load().await;
            println!("File:           {}", store.path().display());
            println!(
                "API key:        {}",
                if saved.api_key.is_empty() {
                    dim("(not set)")
                } else {
                    mask_key(&saved.api_key)
                }
            );
            println!(
                "System prompt:  {}",
                if saved.system_prompt.is_empty() {
                    dim("(default)")
                } else {
                    saved.system_prompt
                }
            );
        }
        ConfigAction::Set {
            api_key,
            system_prompt,
            system_prompt_file,
            model,
        } => {
            let saved = store.load().await;
            let system_prompt = match (system_prompt, system_prompt_file) {
                (Some(p), _) => p.clone(),
                (None, Some(path)) => tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("Failed to read system prompt from {path:?}"))?,
                (None, None) => saved.system_prompt.clone(),
            };
            let updated = Config {
                api_key: api_key.clone().unwrap_or(saved.api_key),
                system_prompt,
            };

            let config = build_config(model, None)?;
            let vision = build_vision(model, &config)?;
            let rasterizer = RasterBackend::default().build(&config);
            let observer: SharedObserver = if quiet {
                Arc::new(NoopObserver)
            } else {
                CliObserver::new(false)
            };
            let mut session = Session::new(config, rasterizer, vision)
                .with_store(store)
                .with_observer(observer);

            session
                .save_config(updated)
                .await
                .context("Settings were not saved")?;
        }
    }
    Ok(())
}

/// Map CLI args to `ProcessingConfig`.
fn build_config(model: &ModelArgs, process: Option<&ProcessArgs>) -> Result<ProcessingConfig> {
    let mut builder = ProcessingConfig::builder()
        .temperature(model.temperature)
        .max_tokens(model.max_tokens)
        .api_timeout_secs(model.api_timeout);

    if let Some(m) = &model.model {
        builder = builder.model(m.clone());
    }
    if let Some(url) = &model.base_url {
        builder = builder.base_url(url.clone());
    }
    if model.provider.is_some() {
        // Provider keys have their own formats.
        builder = builder.api_key_prefix("");
    }
    if let Some(p) = process {
        builder = builder.dpi(p.dpi).image_format(p.format.into());
    }

    builder.build().context("Invalid configuration")
}

fn build_vision(model: &ModelArgs, config: &ProcessingConfig) -> Result<Box<dyn VisionApi>> {
    let vision: Box<dyn VisionApi> = match &model.provider {
        Some(name) => Box::new(ProviderVisionClient::from_name(name, config)?),
        None => Box::new(OpenRouterClient::new(config)?),
    };
    Ok(vision)
}

/// Print the exchange: one section per page, or a JSON array.
fn print_conversation<'a>(
    messages: impl Iterator<Item = &'a ConversationMessage>,
    json: bool,
    out: &mut impl Write,
) -> Result<()> {
    let messages: Vec<&ConversationMessage> = messages.collect();

    if json {
        let text =
            serde_json::to_string_pretty(&messages).context("Failed to serialise conversation")?;
        writeln!(out, "{text}").context("Failed to write to stdout")?;
        return Ok(());
    }

    for (idx, pair) in messages.chunks(2).enumerate() {
        writeln!(out, "── Page {} ──", idx + 1).context("Failed to write to stdout")?;
        for msg in pair.iter().filter(|m| m.role == Role::Assistant) {
            let text = msg.text();
            out.write_all(text.as_bytes())
                .context("Failed to write to stdout")?;
            if !text.ends_with('\n') {
                out.write_all(b"\n")
                    .context("Failed to write to stdout")?;
            }
        }
        writeln!(out).context("Failed to write to stdout")?;
    }
    Ok(())
}
