//! Configuration types for the tiling pipeline and the worker pool.
//!
//! Three knobs structs cover the whole system:
//!
//! * [`PipelineConfig`]: per-document processing. Tool timeouts, raster
//!   resolutions, tile geometry and the page/upload concurrency limits.
//! * [`WorkerConfig`]: how the pool leases jobs. Concurrency, lock lease,
//!   rate limit and queue cleaning cadence.
//! * [`JobOptions`]: per-job retry and retention policy, stored with the job.
//!
//! Both config structs are built through a builder whose `build()` validates
//! the combination, mirroring how the CLI maps flags onto them.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for processing one document into tile pyramids.
///
/// # Example
/// ```rust
/// use edgequake_pdf2tiles::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .page_concurrency(2)
///     .tile_dpi(300)
///     .build()
///     .unwrap();
/// assert_eq!(config.tile_size, 512);
/// ```
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Directory under which each job creates its scratch directory.
    /// Default: the system temp dir (`TMPDIR`).
    pub work_root: PathBuf,

    /// qpdf `--linearize` deadline. Default: 120s.
    pub linearize_timeout: Duration,

    /// qpdf `--show-npages` deadline. Default: 30s.
    pub page_count_timeout: Duration,

    /// qpdf single-page extraction deadline. Default: 60s.
    pub extract_timeout: Duration,

    /// Ghostscript deadline, applied to each of the two rasterisations. Default: 120s.
    pub rasterize_timeout: Duration,

    /// Deadline for generating one page's pyramid. Default: 300s.
    pub tiling_timeout: Duration,

    /// Resolution of the raster the pyramid is cut from. Default: 600.
    ///
    /// Plans are read zoomed in; 600 DPI keeps hairlines and small annotations
    /// legible at the deepest zoom level.
    pub tile_dpi: u32,

    /// Resolution of the quick-look preview PNG. Default: 150.
    pub preview_dpi: u32,

    /// Edge length of a square tile in pixels. Default: 512.
    pub tile_size: u32,

    /// Pixels shared between neighbouring tiles. Default: 0.
    pub tile_overlap: u32,

    /// Encoding of the pyramid tiles. Default: JPEG.
    pub tile_format: TileFormat,

    /// Concurrent page pipelines per document. Default: 4.
    ///
    /// Each page holds a full 600 DPI raster in memory while tiling; size this
    /// to the worker's RAM (8 GB ≈ 2, 16 GB ≈ 4, 32 GB ≈ 8).
    pub page_concurrency: usize,

    /// Concurrent tile uploads per page. Default: 10.
    pub upload_concurrency: usize,

    /// Output buffer cap for the high-resolution rasterisation. Default: 100 MiB.
    pub raster_max_buffer: usize,

    /// Output buffer cap for the preview rasterisation. Default: 50 MiB.
    pub preview_max_buffer: usize,

    /// `Cache-Control` max-age attached to every uploaded object. Default: "31536000".
    pub cache_control: String,

    /// qpdf executable. Default: "qpdf".
    pub qpdf_bin: String,

    /// Ghostscript executable. Default: "gs" ("gswin64c" on Windows).
    pub gs_bin: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            work_root: std::env::temp_dir(),
            linearize_timeout: Duration::from_secs(120),
            page_count_timeout: Duration::from_secs(30),
            extract_timeout: Duration::from_secs(60),
            rasterize_timeout: Duration::from_secs(120),
            tiling_timeout: Duration::from_secs(300),
            tile_dpi: 600,
            preview_dpi: 150,
            tile_size: 512,
            tile_overlap: 0,
            tile_format: TileFormat::default(),
            page_concurrency: 4,
            upload_concurrency: 10,
            raster_max_buffer: 100 * 1024 * 1024,
            preview_max_buffer: 50 * 1024 * 1024,
            cache_control: "31536000".to_string(),
            qpdf_bin: "qpdf".to_string(),
            gs_bin: if cfg!(windows) { "gswin64c" } else { "gs" }.to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn work_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.work_root = dir.into();
        self
    }

    pub fn linearize_timeout(mut self, d: Duration) -> Self {
        self.config.linearize_timeout = d;
        self
    }

    pub fn page_count_timeout(mut self, d: Duration) -> Self {
        self.config.page_count_timeout = d;
        self
    }

    pub fn extract_timeout(mut self, d: Duration) -> Self {
        self.config.extract_timeout = d;
        self
    }

    pub fn rasterize_timeout(mut self, d: Duration) -> Self {
        self.config.rasterize_timeout = d;
        self
    }

    pub fn tiling_timeout(mut self, d: Duration) -> Self {
        self.config.tiling_timeout = d;
        self
    }

    pub fn tile_dpi(mut self, dpi: u32) -> Self {
        self.config.tile_dpi = dpi;
        self
    }

    pub fn preview_dpi(mut self, dpi: u32) -> Self {
        self.config.preview_dpi = dpi;
        self
    }

    pub fn tile_size(mut self, px: u32) -> Self {
        self.config.tile_size = px;
        self
    }

    pub fn tile_overlap(mut self, px: u32) -> Self {
        self.config.tile_overlap = px;
        self
    }

    pub fn tile_format(mut self, format: TileFormat) -> Self {
        self.config.tile_format = format;
        self
    }

    pub fn page_concurrency(mut self, n: usize) -> Self {
        self.config.page_concurrency = n.max(1);
        self
    }

    pub fn upload_concurrency(mut self, n: usize) -> Self {
        self.config.upload_concurrency = n.max(1);
        self
    }

    pub fn cache_control(mut self, value: impl Into<String>) -> Self {
        self.config.cache_control = value.into();
        self
    }

    pub fn qpdf_bin(mut self, bin: impl Into<String>) -> Self {
        self.config.qpdf_bin = bin.into();
        self
    }

    pub fn gs_bin(mut self, bin: impl Into<String>) -> Self {
        self.config.gs_bin = bin.into();
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        if !(72..=1200).contains(&c.tile_dpi) {
            return Err(PipelineError::InvalidConfig(format!(
                "tile DPI must be 72–1200, got {}",
                c.tile_dpi
            )));
        }
        if !(36..=600).contains(&c.preview_dpi) {
            return Err(PipelineError::InvalidConfig(format!(
                "preview DPI must be 36–600, got {}",
                c.preview_dpi
            )));
        }
        if c.tile_size < 16 {
            return Err(PipelineError::InvalidConfig(format!(
                "tile size must be at least 16px, got {}",
                c.tile_size
            )));
        }
        if c.tile_overlap * 2 >= c.tile_size {
            return Err(PipelineError::InvalidConfig(format!(
                "tile overlap {} is too large for tile size {}",
                c.tile_overlap, c.tile_size
            )));
        }
        Ok(self.config)
    }
}

/// Image encoding of pyramid tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TileFormat {
    /// Lossy, small; the right choice for scanned and vector plans alike.
    #[default]
    Jpeg,
    /// Lossless; larger objects, useful when tiles are post-processed.
    Png,
}

impl TileFormat {
    /// File extension used in tile object keys.
    pub fn extension(self) -> &'static str {
        match self {
            TileFormat::Jpeg => "jpeg",
            TileFormat::Png => "png",
        }
    }
}

// ── Worker pool ──────────────────────────────────────────────────────────

/// Configuration for a [`crate::queue::WorkerPool`].
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Jobs processed at once by this pool. Default: 2.
    pub concurrency: usize,

    /// Lease length granted per lock. Default: 10 minutes.
    ///
    /// Tiling a large plan can take several minutes between progress
    /// updates; a short lease would let a second worker steal a live job.
    pub lock_duration: Duration,

    /// How often an active job's lock is extended. Default: 15s.
    pub lock_renew_interval: Duration,

    /// Maximum job starts per `rate_limit_window`. Default: 5.
    pub rate_limit_max: u32,

    /// Window for `rate_limit_max`. Default: 60s.
    pub rate_limit_window: Duration,

    /// Fallback poll interval when no enqueue notification arrives. Default: 1s.
    pub poll_interval: Duration,

    /// Cadence of the completed/failed job janitor. Default: 1 hour.
    pub clean_interval: Duration,

    /// Completed jobs older than this are cleaned. Default: 24 hours.
    pub completed_max_age: Duration,

    /// Failed jobs older than this are cleaned. Default: 7 days.
    pub failed_max_age: Duration,

    /// Most completed jobs removed per janitor pass. Default: 100.
    pub completed_clean_limit: usize,

    /// Most failed jobs removed per janitor pass. Default: 500.
    pub failed_clean_limit: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            lock_duration: Duration::from_secs(600),
            lock_renew_interval: Duration::from_secs(15),
            rate_limit_max: 5,
            rate_limit_window: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            clean_interval: Duration::from_secs(3600),
            completed_max_age: Duration::from_secs(24 * 3600),
            failed_max_age: Duration::from_secs(7 * 24 * 3600),
            completed_clean_limit: 100,
            failed_clean_limit: 500,
        }
    }
}

impl WorkerConfig {
    pub fn builder() -> WorkerConfigBuilder {
        WorkerConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`WorkerConfig`].
#[derive(Debug)]
pub struct WorkerConfigBuilder {
    config: WorkerConfig,
}

impl WorkerConfigBuilder {
    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn lock_duration(mut self, d: Duration) -> Self {
        self.config.lock_duration = d;
        self
    }

    pub fn lock_renew_interval(mut self, d: Duration) -> Self {
        self.config.lock_renew_interval = d;
        self
    }

    pub fn rate_limit(mut self, max: u32, window: Duration) -> Self {
        self.config.rate_limit_max = max;
        self.config.rate_limit_window = window;
        self
    }

    pub fn poll_interval(mut self, d: Duration) -> Self {
        self.config.poll_interval = d;
        self
    }

    pub fn clean_interval(mut self, d: Duration) -> Self {
        self.config.clean_interval = d;
        self
    }

    pub fn build(self) -> Result<WorkerConfig, PipelineError> {
        let c = &self.config;
        if c.lock_renew_interval >= c.lock_duration {
            return Err(PipelineError::InvalidConfig(format!(
                "lock renew interval ({:?}) must be shorter than the lock duration ({:?})",
                c.lock_renew_interval, c.lock_duration
            )));
        }
        if c.rate_limit_max == 0 || c.rate_limit_window.is_zero() {
            return Err(PipelineError::InvalidConfig(
                "rate limit needs a positive max and window".into(),
            ));
        }
        if c.poll_interval.is_zero() || c.clean_interval.is_zero() {
            return Err(PipelineError::InvalidConfig(
                "poll and clean intervals must be positive".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Job options ──────────────────────────────────────────────────────────

/// Retry and retention policy stored with each job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    /// Total attempts including the first run. Default: 3.
    pub attempts: u32,
    pub backoff: Backoff,
    /// Completed jobs kept once this job completes. Default: 100.
    pub retain_completed: usize,
    /// Failed jobs kept once this job fails terminally. Default: 500.
    pub retain_failed: usize,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Backoff::default(),
            retain_completed: 100,
            retain_failed: 500,
        }
    }
}

/// Delay policy between failed attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backoff {
    #[serde(rename = "type")]
    pub kind: BackoffKind,
    pub delay_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay_ms: 5000,
        }
    }
}

impl Backoff {
    /// Delay before the retry that follows failed attempt number `attempts_made` (1-based).
    ///
    /// Exponential with the default 5s base: 5s, 10s, 20s, …
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        let ms = match self.kind {
            BackoffKind::Fixed => self.delay_ms,
            BackoffKind::Exponential => {
                let shift = attempts_made.saturating_sub(1).min(20);
                self.delay_ms.saturating_mul(1u64 << shift)
            }
        };
        Duration::from_millis(ms)
    }
}
