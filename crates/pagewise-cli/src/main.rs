use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use pagewise_core::config_file;
use pagewise_core::{
    ChunkStatus, Config, DocumentId, DocumentOutcome, PdfBackend, Pipeline, PipelineError,
    ProgressEvent, ProgressEventKind, StorageBackend,
};
use pagewise_pdf_lopdf::LopdfBackend;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

mod output;

use output::ColorMode;

/// Pagewise - extract text from large PDFs, chunk by chunk
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log progress details (info level)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Read configuration from this TOML file instead of the default locations
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Keep records and uploads in memory for this run only
    #[arg(long, global = true)]
    memory: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(flatten)]
    overrides: Overrides,
}

/// Command-line values that win over environment and config file.
#[derive(Args, Debug, Default)]
struct Overrides {
    /// Pages per chunk
    #[arg(long, global = true)]
    chunk_size: Option<usize>,

    /// Chunk documents with more pages than this
    #[arg(long, global = true)]
    page_threshold: Option<usize>,

    /// Chunk documents larger than this many MB
    #[arg(long, global = true)]
    size_threshold_mb: Option<f64>,

    /// Chunks of one document extracted at once
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    /// Extraction calls in flight across all documents
    #[arg(long, global = true)]
    global_concurrency: Option<usize>,

    /// Pace extraction requests to this many per minute
    #[arg(long, global = true)]
    rpm: Option<u32>,

    /// Gemini model name
    #[arg(long, global = true)]
    model: Option<String>,
}

impl Overrides {
    fn apply(&self, config: &mut Config) {
        if let Some(v) = self.chunk_size {
            config.chunk_size_pages = v;
        }
        if let Some(v) = self.page_threshold {
            config.page_threshold = v;
        }
        if let Some(v) = self.size_threshold_mb {
            config.size_threshold_mb = v;
        }
        if let Some(v) = self.concurrency {
            config.per_document_concurrency = v;
        }
        if let Some(v) = self.global_concurrency {
            config.global_concurrency = v;
        }
        if self.rpm.is_some() {
            config.requests_per_minute = self.rpm;
        }
        if let Some(ref v) = self.model {
            config.model = v.clone();
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit a PDF and extract its text
    Process {
        /// Path to the PDF file
        file_path: PathBuf,

        /// Write the extracted text to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show how a PDF would be split, without calling the extraction service
    Plan {
        /// Path to the PDF file
        file_path: PathBuf,
    },

    /// List stored documents, newest first
    List,

    /// Show a document's record
    Show { id: String },

    /// Print a document's extracted text
    Text { id: String },

    /// Delete a document, its stored file and its progress
    Delete { id: String },

    /// Process a stored document again from the start
    Reprocess { id: String },

    /// Write the effective configuration to the platform config file
    InitConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let _guard = init_tracing(cli.verbose, cli.log_file.as_deref())?;

    let config = resolve_config(&cli)?;
    tracing::debug!(?config, "resolved configuration");
    let color = ColorMode(!cli.no_color);
    let mut out = std::io::stdout();

    match cli.command {
        Command::Plan { file_path } => plan(&file_path, &config, color),
        Command::Process { file_path, output } => {
            process(&file_path, output.as_deref(), &config, color).await
        }
        Command::Reprocess { id } => reprocess(&DocumentId::from(id), &config, color).await,
        Command::List => {
            let pipeline = open_pipeline(&config)?;
            output::print_document_list(&mut out, &pipeline.list()?, color)?;
            Ok(())
        }
        Command::Show { id } => {
            let pipeline = open_pipeline(&config)?;
            output::print_document(&mut out, &pipeline.get(&DocumentId::from(id))?, color)?;
            Ok(())
        }
        Command::Text { id } => {
            let pipeline = open_pipeline(&config)?;
            let text = pipeline.text(&DocumentId::from(id))?;
            writeln!(out, "{}", text)?;
            Ok(())
        }
        Command::Delete { id } => {
            let pipeline = open_pipeline(&config)?;
            let id = DocumentId::from(id);
            pipeline.delete(&id)?;
            println!("Deleted {}", id);
            Ok(())
        }
        Command::InitConfig => {
            let path = config_file::save_config(&config_file::ConfigFile::from(&config))
                .map_err(|e| anyhow::anyhow!(e))?;
            println!("Configuration written to {}", path.display());
            Ok(())
        }
    }
}

/// Install the stderr subscriber and, with `--log-file`, a non-blocking file
/// writer. The returned guard flushes the file on drop.
fn init_tracing(verbose: bool, log_file: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let default_filter = if verbose {
        "pagewise=info"
    } else {
        "pagewise=warn"
    };

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let name = path
                .file_name()
                .with_context(|| format!("invalid log file path: {}", path.display()))?;
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            std::fs::create_dir_all(dir)?;
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    Ok(guard)
}

/// Resolve configuration: CLI flags > env vars > config file > defaults
fn resolve_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::default();

    let file = match cli.config {
        Some(ref path) => config_file::load_from_path(path)
            .with_context(|| format!("could not read config file {}", path.display()))?,
        None => config_file::load_config(),
    };
    config_file::apply(&file, &mut config);

    if let Ok(key) = std::env::var("GEMINI_API_KEY")
        && !key.trim().is_empty()
    {
        config.api_key = Some(key);
    }
    if let Ok(model) = std::env::var("GEMINI_MODEL") {
        config.model = model;
    }
    if let Some(v) = env_parse("PAGEWISE_CHUNK_SIZE") {
        config.chunk_size_pages = v;
    }
    if let Some(v) = env_parse("PAGEWISE_MAX_CONCURRENT_CHUNKS") {
        config.per_document_concurrency = v;
    }
    if let Some(v) = env_parse("PAGEWISE_GLOBAL_CONCURRENCY") {
        config.global_concurrency = v;
    }
    if let Some(v) = env_parse("PAGEWISE_EXTRACTION_TIMEOUT") {
        config.extraction_timeout_secs = v;
    }
    if let Ok(path) = std::env::var("PAGEWISE_DATABASE_PATH") {
        config.storage.database_path = PathBuf::from(path);
    }

    cli.overrides.apply(&mut config);
    if cli.memory {
        config.storage.backend = StorageBackend::Memory;
    }

    if config.chunk_size_pages == 0 {
        anyhow::bail!("chunk size must be at least 1 page");
    }
    if config.per_document_concurrency == 0 || config.global_concurrency == 0 {
        anyhow::bail!("concurrency limits must be at least 1");
    }
    Ok(config)
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn open_pipeline(config: &Config) -> anyhow::Result<Pipeline> {
    let extractor = pagewise_core::build_gemini_backend(config, reqwest::Client::new());
    let pipeline = Pipeline::open(config, Arc::new(LopdfBackend::new()), Arc::new(extractor))?;
    Ok(pipeline)
}

fn require_api_key(config: &Config) -> anyhow::Result<()> {
    if config.api_key.as_deref().is_none_or(str::is_empty) {
        anyhow::bail!(
            "No Gemini API key configured. Set GEMINI_API_KEY or extraction.api_key in {}",
            config_file::config_path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "config.toml".into())
        );
    }
    Ok(())
}

fn display_name(file_path: &Path) -> String {
    file_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| file_path.display().to_string())
}

fn plan(file_path: &Path, config: &Config, color: ColorMode) -> anyhow::Result<()> {
    if !file_path.exists() {
        anyhow::bail!("File not found: {}", file_path.display());
    }
    let bytes = std::fs::read(file_path)?;
    let info = LopdfBackend::new()
        .inspect(&bytes)
        .with_context(|| format!("could not read {}", file_path.display()))?;
    output::print_plan(
        &mut std::io::stdout(),
        &display_name(file_path),
        &info,
        &config.planner(),
        color,
    )?;
    Ok(())
}

async fn process(
    file_path: &Path,
    text_out: Option<&Path>,
    config: &Config,
    color: ColorMode,
) -> anyhow::Result<()> {
    require_api_key(config)?;
    if !file_path.exists() {
        anyhow::bail!("File not found: {}", file_path.display());
    }
    let bytes = std::fs::read(file_path)?;
    let pipeline = open_pipeline(config)?;
    let document = pipeline.submit(&bytes, &display_name(file_path))?;

    let mut out = std::io::stdout();
    output::print_submitted(&mut out, &document, color)?;

    let subscription = pipeline.subscribe(&document.id)?;
    let bar = chunk_bar();
    let watcher = {
        let bar = bar.clone();
        tokio::spawn(async move {
            let mut subscription = subscription;
            while let Some(event) = subscription.next().await {
                update_bar(&bar, &event);
            }
        })
    };

    let outcome = interruptible(pipeline.process(&document.id)).await;
    match outcome {
        // The terminal event is published before `process` returns.
        Ok(_) => {
            let _ = watcher.await;
        }
        Err(_) => watcher.abort(),
    }
    bar.finish_and_clear();
    let outcome = outcome?;

    finish(&mut out, &pipeline, &outcome, text_out, color)
}

async fn reprocess(id: &DocumentId, config: &Config, color: ColorMode) -> anyhow::Result<()> {
    require_api_key(config)?;
    let pipeline = open_pipeline(config)?;
    let document = pipeline.get(id)?;

    // Reprocessing resets the progress topic, so only a spinner is shown.
    let bar = ProgressBar::new_spinner();
    bar.set_message(format!("Reprocessing {}...", document.filename));
    bar.enable_steady_tick(Duration::from_millis(120));
    let outcome = interruptible(pipeline.reprocess(id)).await;
    bar.finish_and_clear();

    finish(&mut std::io::stdout(), &pipeline, &outcome?, None, color)
}

/// Run `work`, giving up on Ctrl+C.
async fn interruptible<F>(work: F) -> anyhow::Result<DocumentOutcome>
where
    F: Future<Output = Result<DocumentOutcome, PipelineError>>,
{
    tokio::select! {
        result = work => Ok(result?),
        _ = tokio::signal::ctrl_c() => anyhow::bail!("Interrupted"),
    }
}

fn finish(
    out: &mut dyn Write,
    pipeline: &Pipeline,
    outcome: &DocumentOutcome,
    text_out: Option<&Path>,
    color: ColorMode,
) -> anyhow::Result<()> {
    output::print_outcome(out, outcome, color)?;
    if let Some(path) = text_out
        && outcome.status().has_text()
    {
        let text = pipeline.text(&outcome.document.id)?;
        std::fs::write(path, text)
            .with_context(|| format!("could not write {}", path.display()))?;
        writeln!(out, "Text written to {}", path.display())?;
    }
    Ok(())
}

fn chunk_bar() -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_message("Planning...");
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

/// Switch the spinner to a bar once the chunk total is known, then follow
/// the finished count.
fn update_bar(bar: &ProgressBar, event: &ProgressEvent) {
    let snapshot = &event.snapshot;
    if snapshot.total > 0 && bar.length() != Some(snapshot.total as u64) {
        bar.set_length(snapshot.total as u64);
        if let Ok(style) = ProgressStyle::with_template(
            "{spinner:.green} {msg} [{bar:40.green/dim}] {pos}/{len} chunks ({elapsed})",
        ) {
            bar.set_style(style.progress_chars("=> "));
        }
    }
    bar.set_position(snapshot.finished() as u64);

    if event.chunk_status == Some(ChunkStatus::Failed)
        && let Some(index) = event.chunk_index
    {
        bar.println(format!(
            "chunk {} failed: {}",
            index,
            event.error.as_deref().unwrap_or("unknown error")
        ));
    }

    match event.kind {
        ProgressEventKind::Initialized => {
            bar.set_message(format!("{} chunks planned", snapshot.total));
        }
        ProgressEventKind::Completed | ProgressEventKind::Error => {
            bar.set_message("done");
        }
        ProgressEventKind::Progress | ProgressEventKind::ChunkCompleted => {
            bar.set_message(format!(
                "{} processing, {} failed",
                snapshot.processing, snapshot.failed
            ));
        }
    }
}
