//! Deep-zoom tile pyramid generation.
//!
//! Output for a base path `…/plan-page1`:
//!
//! ```text
//! plan-page1.dzi                  XML descriptor
//! plan-page1_files/{level}/{col}_{row}.{ext}
//! ```
//!
//! Level `max = ceil(log2(max(width, height)))` holds the full-resolution
//! image; each level below halves both dimensions (rounding up) down to the
//! single-pixel level 0. Tiles are `tile_size` squares, clipped at the right
//! and bottom edges, extended by `overlap` pixels on every interior side.
//!
//! Decoding, resizing and encoding are CPU-bound and run on the blocking pool,
//! spawned through the caller's [`TaskTracker`] so the caller can wait for
//! abandoned work before deleting the directory it writes into. The deadline
//! is enforced from the async side; when it fires the blocking loop is told
//! to stop at the next tile.
//!
//! Rasters are decoded without the image crate's default allocation cap: a
//! 600 DPI render of an A1 sheet is well over 512 MiB.

use crate::config::TileFormat;
use crate::error::ToolExecutionError;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, ImageReader};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;
use tracing::debug;

const TOOL: &str = "tiler";
const JPEG_QUALITY: u8 = 90;

/// Tile geometry and encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileSpec {
    pub tile_size: u32,
    pub overlap: u32,
    pub format: TileFormat,
}

/// What [`generate_pyramid`] produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pyramid {
    pub width: u32,
    pub height: u32,
    /// Number of levels, `max_level + 1`.
    pub levels: u32,
    pub tiles: usize,
    pub descriptor: PathBuf,
    pub files_dir: PathBuf,
}

/// Highest zoom level for an image of the given size.
pub fn max_level(width: u32, height: u32) -> u32 {
    let longest = width.max(height).max(1);
    // ceil(log2(n)) == bit length of (n - 1)
    u32::BITS - (longest - 1).leading_zeros()
}

/// Dimensions at `level` for a full-resolution image at `max`.
pub fn level_dimensions(width: u32, height: u32, level: u32, max: u32) -> (u32, u32) {
    let shift = max.saturating_sub(level);
    let scale = |v: u32| -> u32 {
        let div = 1u64 << shift;
        (u64::from(v).div_ceil(div)).max(1) as u32
    };
    (scale(width), scale(height))
}

/// `(col, row, x, y, w, h)` for every tile of one level, column-major.
pub fn tile_rects(width: u32, height: u32, spec: &TileSpec) -> Vec<(u32, u32, u32, u32, u32, u32)> {
    let size = spec.tile_size;
    let cols = width.div_ceil(size);
    let rows = height.div_ceil(size);
    let mut rects = Vec::with_capacity((cols * rows) as usize);
    for col in 0..cols {
        for row in 0..rows {
            let x = (col * size).saturating_sub(if col > 0 { spec.overlap } else { 0 });
            let y = (row * size).saturating_sub(if row > 0 { spec.overlap } else { 0 });
            let x_end = ((col + 1) * size + spec.overlap).min(width);
            let y_end = ((row + 1) * size + spec.overlap).min(height);
            rects.push((col, row, x, y, x_end - x, y_end - y));
        }
    }
    rects
}

/// The `.dzi` descriptor for a pyramid.
pub fn descriptor_xml(width: u32, height: u32, spec: &TileSpec) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <Image xmlns=\"http://schemas.microsoft.com/deepzoom/2008\" Format=\"{}\" Overlap=\"{}\" TileSize=\"{}\">\n  \
         <Size Height=\"{}\" Width=\"{}\"/>\n\
         </Image>\n",
        spec.format.extension(),
        spec.overlap,
        spec.tile_size,
        height,
        width
    )
}

/// Cut `raster` into a pyramid rooted at `out_base`.
///
/// The blocking work is spawned on `tasks`; it may outlive this future when
/// the deadline fires or the future is dropped, until its next cancel check.
pub async fn generate_pyramid(
    raster: &Path,
    out_base: &Path,
    spec: TileSpec,
    timeout: Duration,
    tasks: &TaskTracker,
) -> Result<Pyramid, ToolExecutionError> {
    let cancel = Arc::new(AtomicBool::new(false));
    // Also stops the blocking loop when this future is dropped mid-run.
    let _guard = CancelOnDrop(Arc::clone(&cancel));
    let task = {
        let raster = raster.to_path_buf();
        let out_base = out_base.to_path_buf();
        let cancel = Arc::clone(&cancel);
        tasks.spawn_blocking(move || build_blocking(&raster, &out_base, &spec, &cancel))
    };

    match tokio::time::timeout(timeout, task).await {
        Ok(joined) => joined.map_err(|e| transform(format!("tiling task panicked: {e}")))?,
        Err(_) => {
            cancel.store(true, Ordering::SeqCst);
            Err(ToolExecutionError::Timeout {
                tool: TOOL.into(),
                after: timeout,
            })
        }
    }
}

struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

fn transform(detail: String) -> ToolExecutionError {
    ToolExecutionError::Transform {
        tool: TOOL.into(),
        detail,
    }
}

/// Decode a PNG raster of any size.
pub fn decode_raster(raster: &Path) -> Result<DynamicImage, ToolExecutionError> {
    let fail = |e: String| transform(format!("cannot decode {}: {e}", raster.display()));
    let mut reader = ImageReader::open(raster)
        .and_then(|r| r.with_guessed_format())
        .map_err(|e| fail(e.to_string()))?;
    reader.no_limits();
    reader.decode().map_err(|e| fail(e.to_string()))
}

fn build_blocking(
    raster: &Path,
    out_base: &Path,
    spec: &TileSpec,
    cancel: &AtomicBool,
) -> Result<Pyramid, ToolExecutionError> {
    let full = decode_raster(raster)?;
    let (width, height) = (full.width(), full.height());
    let max = max_level(width, height);

    let files_dir = with_suffix(out_base, "_files");
    let descriptor = with_suffix(out_base, ".dzi");
    let mut tiles = 0usize;

    // Walk from full resolution downwards, halving the previous level.
    let mut current = full;
    for level in (0..=max).rev() {
        let (lw, lh) = level_dimensions(width, height, level, max);
        if current.width() != lw || current.height() != lh {
            current = current.resize_exact(lw, lh, FilterType::Triangle);
        }

        if cancel.load(Ordering::Relaxed) {
            return Err(transform("cancelled".into()));
        }
        let level_dir = files_dir.join(level.to_string());
        fs::create_dir_all(&level_dir)
            .map_err(|e| transform(format!("cannot create {}: {e}", level_dir.display())))?;

        for (col, row, x, y, w, h) in tile_rects(lw, lh, spec) {
            if cancel.load(Ordering::Relaxed) {
                return Err(transform("cancelled".into()));
            }
            let tile = current.crop_imm(x, y, w, h);
            let path = level_dir.join(format!("{col}_{row}.{}", spec.format.extension()));
            write_tile(&tile, &path, spec.format)?;
            tiles += 1;
        }
    }

    fs::write(&descriptor, descriptor_xml(width, height, spec))
        .map_err(|e| transform(format!("cannot write {}: {e}", descriptor.display())))?;

    debug!(width, height, levels = max + 1, tiles, "pyramid generated");
    Ok(Pyramid {
        width,
        height,
        levels: max + 1,
        tiles,
        descriptor,
        files_dir,
    })
}

fn write_tile(tile: &DynamicImage, path: &Path, format: TileFormat) -> Result<(), ToolExecutionError> {
    let result = match format {
        TileFormat::Jpeg => File::create(path)
            .map_err(image::ImageError::IoError)
            .and_then(|f| {
                let mut enc = JpegEncoder::new_with_quality(BufWriter::new(f), JPEG_QUALITY);
                enc.encode_image(&tile.to_rgb8())
            }),
        TileFormat::Png => tile.save_with_format(path, ImageFormat::Png),
    };
    result.map_err(|e| transform(format!("cannot write {}: {e}", path.display())))
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut s = base.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}
