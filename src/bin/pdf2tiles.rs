//! CLI binary for edgequake-pdf2tiles.
//!
//! Submits local PDFs to a job queue, runs a worker pool over it in the same
//! process and writes tile pyramids into a local directory.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use edgequake_pdf2tiles::ingest::{submit_with_options, DEFAULT_MAX_UPLOAD};
use edgequake_pdf2tiles::queue::{drain, FailOutcome, JobSnapshot, Lease};
use edgequake_pdf2tiles::{
    DocumentPipeline, DocumentRecord, DocumentStatus, InMemoryMetadataStore, JobHandler, JobOptions, JobQueue,
    MetadataStore, PipelineConfig, PipelineError, PipelineResult, ProgressReporter,
    StorageGateway, Submission, TileFormat, TileJobHandler, Upload, WorkerConfig, WorkerEvents,
    WorkerPool,
};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers ──────────────────────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

// ── Worker events rendered with indicatif ────────────────────────────────────

/// One bar per document, 0–100 %.
struct CliEvents {
    multi: MultiProgress,
    bars: Mutex<HashMap<String, ProgressBar>>,
    started: Mutex<HashMap<u64, Instant>>,
}

impl CliEvents {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
            started: Mutex::new(HashMap::new()),
        })
    }

    /// Register a bar before its job starts so the ordering matches the
    /// command line.
    fn track(&self, document_id: &str, file_name: &str) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold:<24}  [{bar:36.green/238}] {pos:>3}%  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        let bar = self.multi.add(ProgressBar::new(100));
        bar.set_style(style);
        bar.set_prefix(file_name.to_string());
        bar.set_message(dim("queued"));
        bar.enable_steady_tick(Duration::from_millis(80));
        self.bars
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(document_id.to_string(), bar);
    }

    fn bar(&self, document_id: &str) -> Option<ProgressBar> {
        self.bars
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(document_id)
            .cloned()
    }

    fn elapsed(&self, job_id: u64) -> String {
        self.started
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&job_id)
            .map(|t| format!("{:.1}s", t.elapsed().as_secs_f64()))
            .unwrap_or_default()
    }
}

impl WorkerEvents for CliEvents {
    fn on_job_started(&self, lease: &Lease) {
        self.started
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(lease.job_id, Instant::now());
        if let Some(bar) = self.bar(&lease.payload.document_id) {
            bar.set_position(0);
            bar.set_message(format!("attempt {}/{}", lease.attempts_made + 1, lease.max_attempts));
        }
    }

    fn on_job_progress(&self, _job_id: u64, document_id: &str, percent: u8) {
        if let Some(bar) = self.bar(document_id) {
            bar.set_position(u64::from(percent));
        }
    }

    fn on_job_completed(&self, job_id: u64, document_id: &str) {
        let elapsed = self.elapsed(job_id);
        if let Some(bar) = self.bar(document_id) {
            bar.set_position(100);
            bar.finish_with_message(format!("{} {}", green("✓"), dim(&elapsed)));
        }
    }

    fn on_job_failed(&self, job_id: u64, document_id: &str, error: &str, outcome: FailOutcome) {
        let elapsed = self.elapsed(job_id);
        let msg = if error.len() > 60 {
            let cut = error
                .char_indices()
                .map(|(i, _)| i)
                .take_while(|&i| i <= 59)
                .last()
                .unwrap_or(0);
            format!("{}\u{2026}", &error[..cut])
        } else {
            error.to_string()
        };
        let Some(bar) = self.bar(document_id) else {
            return;
        };
        match outcome {
            FailOutcome::Retried { delay, .. } => {
                bar.set_message(format!("{}  retry in {}s", red(&msg), delay.as_secs()));
            }
            FailOutcome::Exhausted { attempts_made } => {
                bar.abandon_with_message(format!(
                    "{} {}  {}",
                    red("✗"),
                    red(&msg),
                    dim(&format!("{attempts_made} attempts, {elapsed}"))
                ));
            }
        }
    }
}

// ── Handler ──────────────────────────────────────────────────────────────────

/// Recreates the record for jobs restored from a previous run's queue file,
/// whose records lived only in that process.
struct ResumingHandler {
    metadata: Arc<dyn MetadataStore>,
    inner: TileJobHandler,
}

#[async_trait]
impl JobHandler for ResumingHandler {
    async fn handle(
        &self,
        lease: &Lease,
        progress: Arc<dyn ProgressReporter>,
    ) -> Result<serde_json::Value, PipelineError> {
        let p = &lease.payload;
        if self.metadata.get(&p.document_id).await.is_err() {
            self.metadata
                .insert(DocumentRecord::new(
                    p.document_id.clone(),
                    p.project_id.clone(),
                    p.file_name.clone(),
                ))
                .await?;
        }
        self.inner.handle(lease, progress).await
    }

    async fn on_abandoned(&self, job: &JobSnapshot) {
        self.inner.on_abandoned(job).await
    }
}

// ── CLI ──────────────────────────────────────────────────────────────────────

const AFTER_HELP: &str = r#"EXAMPLES:
  # Tile one plan into ./tiles-out
  pdf2tiles plan.pdf

  # Several plans, four pages at a time, PNG tiles
  pdf2tiles --page-concurrency 4 --format png a.pdf b.pdf -o out/

  # Durable queue: interrupted jobs resume on the next run
  pdf2tiles --queue .pdf2tiles-queue.json --drain plans/*.pdf

  # Machine-readable summary
  pdf2tiles --json plan.pdf > status.json

OUTPUT LAYOUT:
  <out>/<project>/<base>.pdf                      original upload
  <out>/<project>/previews/<base>-pageN.png       150 DPI preview
  <out>/<project>/tiles/<base>-pageN.dzi          deep-zoom descriptor
  <out>/<project>/tiles/<base>-pageN_files/L/C_R  tiles

REQUIREMENTS:
  qpdf and ghostscript must be installed. Override their paths with
  PDF2TILES_QPDF and PDF2TILES_GS.
"#;

/// Convert PDF plans into deep-zoom tile pyramids.
#[derive(Parser, Debug)]
#[command(
    name = "pdf2tiles",
    version,
    about = "Convert PDF plans into deep-zoom tile pyramids",
    long_about = "Rasterises every page of one or more PDFs at high resolution and cuts \
each page into a deep-zoom tile pyramid. Work runs through a retrying job queue with a \
bounded worker pool, exactly as it would behind an upload service.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// PDF files to process.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Directory that receives originals, previews and tiles.
    #[arg(short, long, env = "PDF2TILES_OUT", default_value = "tiles-out")]
    out: PathBuf,

    /// Project id used as the first storage path segment.
    #[arg(long, env = "PDF2TILES_PROJECT", default_value = "local")]
    project: String,

    /// Persist the job queue to this JSON file.
    #[arg(long, env = "PDF2TILES_QUEUE")]
    queue: Option<PathBuf>,

    /// Also finish jobs left in the queue file by earlier runs.
    #[arg(long, requires = "queue")]
    drain: bool,

    /// Scratch directory for per-job temporary files.
    #[arg(long, env = "PDF2TILES_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Tiling DPI.
    #[arg(long, env = "PDF2TILES_DPI", default_value_t = 600,
          value_parser = clap::value_parser!(u32).range(72..=1200))]
    dpi: u32,

    /// Preview DPI.
    #[arg(long, env = "PDF2TILES_PREVIEW_DPI", default_value_t = 150,
          value_parser = clap::value_parser!(u32).range(36..=600))]
    preview_dpi: u32,

    /// Tile edge length in pixels.
    #[arg(long, env = "PDF2TILES_TILE_SIZE", default_value_t = 512)]
    tile_size: u32,

    /// Tile overlap in pixels.
    #[arg(long, env = "PDF2TILES_OVERLAP", default_value_t = 0)]
    overlap: u32,

    /// Tile image format.
    #[arg(long, env = "PDF2TILES_FORMAT", value_enum, default_value = "jpeg")]
    format: FormatArg,

    /// Pages processed at once within a document.
    #[arg(long, env = "PDF2TILES_PAGE_CONCURRENCY", default_value_t = 4)]
    page_concurrency: usize,

    /// Tile uploads in flight per page.
    #[arg(long, env = "PDF2TILES_UPLOAD_CONCURRENCY", default_value_t = 10)]
    upload_concurrency: usize,

    /// Documents processed at once.
    #[arg(short = 'c', long, env = "PDF2TILES_CONCURRENCY", default_value_t = 2)]
    concurrency: usize,

    /// Job starts allowed per rate window.
    #[arg(long, env = "PDF2TILES_RATE_LIMIT", default_value_t = 5)]
    rate_limit: u32,

    /// Rate window in seconds.
    #[arg(long, env = "PDF2TILES_RATE_WINDOW", default_value_t = 60)]
    rate_window: u64,

    /// Attempts per document before it is marked failed.
    #[arg(long, env = "PDF2TILES_ATTEMPTS", default_value_t = 3)]
    attempts: u32,

    /// qpdf executable.
    #[arg(long, env = "PDF2TILES_QPDF", default_value = "qpdf")]
    qpdf: String,

    /// Ghostscript executable.
    #[arg(long, env = "PDF2TILES_GS")]
    gs: Option<String>,

    /// Print a JSON status array instead of text.
    #[arg(long, env = "PDF2TILES_JSON")]
    json: bool,

    /// Disable progress bars.
    #[arg(long, env = "PDF2TILES_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PDF2TILES_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PDF2TILES_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum FormatArg {
    Jpeg,
    Png,
}

impl From<FormatArg> for TileFormat {
    fn from(v: FormatArg) -> Self {
        match v {
            FormatArg::Jpeg => TileFormat::Jpeg,
            FormatArg::Png => TileFormat::Png,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
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

    // ── Build the pipeline ───────────────────────────────────────────────
    let config = build_config(&cli)?;
    let worker_config = WorkerConfig::builder()
        .concurrency(cli.concurrency)
        .rate_limit(cli.rate_limit, Duration::from_secs(cli.rate_window))
        .build()
        .context("Invalid worker configuration")?;

    let storage = StorageGateway::local(&cli.out)
        .with_context(|| format!("Cannot open output directory {}", cli.out.display()))?;
    let metadata: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::new());
    let queue = Arc::new(match &cli.queue {
        Some(path) => JobQueue::open(path)
            .await
            .with_context(|| format!("Cannot open queue file {}", path.display()))?,
        None => JobQueue::in_memory(),
    });

    let pipeline = DocumentPipeline::with_process_runner(config, storage, Arc::clone(&metadata));
    let handler = Arc::new(ResumingHandler {
        metadata: Arc::clone(&metadata),
        inner: TileJobHandler::new(pipeline),
    });
    let events = CliEvents::new();
    if !show_progress {
        events.multi.set_draw_target(indicatif::ProgressDrawTarget::hidden());
    }

    // ── Submit ───────────────────────────────────────────────────────────
    let options = JobOptions {
        attempts: cli.attempts.max(1),
        ..JobOptions::default()
    };
    let mut submissions = Vec::with_capacity(cli.inputs.len());
    for path in &cli.inputs {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document.pdf".to_string());
        let submission = submit_with_options(
            &queue,
            &*metadata,
            Upload {
                bytes,
                project_id: cli.project.clone(),
                file_name: file_name.clone(),
                document_id: None,
            },
            options.clone(),
            DEFAULT_MAX_UPLOAD,
        )
        .await
        .with_context(|| format!("Rejected {}", path.display()))?;
        events.track(&submission.document_id, &file_name);
        submissions.push((file_name, submission));
    }

    // ── Run ──────────────────────────────────────────────────────────────
    let shutdown = CancellationToken::new();
    let pool = WorkerPool::new(Arc::clone(&queue), handler, worker_config)
        .with_events(Arc::clone(&events) as Arc<dyn WorkerEvents>);
    let worker = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { pool.run(shutdown).await }
    });

    let waits = futures::future::join_all(
        submissions
            .iter()
            .map(|(_, s)| queue.wait_for_completion::<PipelineResult>(s.job.id)),
    );
    let interrupted = tokio::select! {
        _ = waits => false,
        _ = tokio::signal::ctrl_c() => true,
    };
    if !interrupted && cli.drain {
        tokio::select! {
            _ = drain(&queue, Duration::from_secs(1)) => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    }

    if interrupted && !cli.quiet {
        eprintln!("{}", dim("interrupted: waiting for running jobs to finish…"));
    }
    shutdown.cancel();
    worker
        .await
        .context("Worker pool task panicked")?
        .context("Worker pool failed")?;
    queue.close().await;

    // ── Report ───────────────────────────────────────────────────────────
    let failed = report(&cli, &*metadata, &submissions).await?;
    if interrupted {
        anyhow::bail!("Interrupted before all documents finished");
    }
    if failed > 0 {
        anyhow::bail!("{failed} of {} documents failed", submissions.len());
    }
    Ok(())
}

/// Map CLI args to `PipelineConfig`.
fn build_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder()
        .tile_dpi(cli.dpi)
        .preview_dpi(cli.preview_dpi)
        .tile_size(cli.tile_size)
        .tile_overlap(cli.overlap)
        .tile_format(cli.format.into())
        .page_concurrency(cli.page_concurrency)
        .upload_concurrency(cli.upload_concurrency)
        .qpdf_bin(cli.qpdf.clone());
    if let Some(gs) = &cli.gs {
        builder = builder.gs_bin(gs.clone());
    }
    if let Some(dir) = &cli.work_dir {
        builder = builder.work_root(dir.clone());
    }
    builder.build().context("Invalid configuration")
}

/// Print the final status of every submitted document and return how many
/// did not reach `ready`.
async fn report(
    cli: &Cli,
    metadata: &dyn MetadataStore,
    submissions: &[(String, Submission)],
) -> Result<usize> {
    let mut failed = 0;
    let mut rows = Vec::with_capacity(submissions.len());
    for (file_name, sub) in submissions {
        let record = metadata
            .get(&sub.document_id)
            .await
            .with_context(|| format!("Record for {file_name} disappeared"))?;
        let view = record.status_view();
        if view.status != DocumentStatus::Ready {
            failed += 1;
        }

        if cli.json {
            rows.push(serde_json::json!({
                "fileName": file_name,
                "documentId": sub.document_id,
                "jobId": sub.job.id,
                "correlationId": sub.correlation_id,
                "tilesRootRef": record.tiles_root_ref,
                "previewRef": record.preview_ref,
                "status": view,
            }));
        } else if !cli.quiet {
            match (view.status, &record.tiles_root_ref) {
                (DocumentStatus::Ready, Some(root)) => println!(
                    "{} {:<28} {:>3} pages  {}×{}  →  {}",
                    green("✔"),
                    bold(file_name),
                    view.page_count.unwrap_or(0),
                    view.width.unwrap_or(0),
                    view.height.unwrap_or(0),
                    cli.out.join(format!("{root}.dzi")).display(),
                ),
                (status, _) => println!(
                    "{} {:<28} {:<10} {:>3}%  {}",
                    red("✘"),
                    bold(file_name),
                    status.as_str(),
                    view.progress,
                    view.error_message.as_deref().map(red).unwrap_or_default(),
                ),
            }
        }
    }
    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&rows).context("Failed to serialise status")?
        );
    }
    Ok(failed)
}
