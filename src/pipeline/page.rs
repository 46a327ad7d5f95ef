//! The per-page sub-pipeline.
//!
//! ```text
//! extract ─▶ raster@tile_dpi ─▶ raster@preview_dpi ─▶ upload preview
//!   20            40                  50                   55
//!         ─▶ pyramid ─▶ upload tiles + .dzi ─▶ cleanup
//!              70             90                 100
//! ```
//!
//! Steps are strictly sequential. Every intermediate file lives in a scratch
//! directory owned by this call, so it is released on every exit path: an
//! explicit close on success and failure, RAII if the future is dropped
//! because another page failed first. A tiling thread that outlives the page
//! is tracked by the document, which waits for it before removing the job
//! directory.
//!
//! Page 1 also stamps `previewRef` on the record. A failed stamp is logged
//! and does not fail the page; the preview itself is already stored.

use crate::config::PipelineConfig;
use crate::error::PageError;
use crate::metadata::{DocumentPatch, MetadataStore};
use crate::paths::StoragePaths;
use crate::pipeline::render::{self, RasterKind};
use crate::pipeline::tiles::{self, TileSpec};
use crate::pipeline::{qpdf, tools::ToolRunner};
use crate::progress::PageProgressSender;
use crate::storage::{PutRequest, StorageGateway};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio_util::task::TaskTracker;
use tracing::{debug, info_span, warn, Instrument};

/// Everything a page needs from its document.
pub struct PageContext<'a> {
    pub config: &'a PipelineConfig,
    pub runner: &'a dyn ToolRunner,
    pub storage: &'a StorageGateway,
    pub metadata: &'a dyn MetadataStore,
    pub paths: &'a StoragePaths,
    pub document_id: &'a str,
    /// The linearized document pages are extracted from.
    pub linearized: &'a Path,
    /// Job scratch directory; page directories are created inside it.
    pub job_dir: &'a Path,
    /// Blocking tiling work, awaited by the document before cleanup.
    pub tiling: &'a TaskTracker,
    pub page_count: u32,
}

/// Outcome of one page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRaster {
    pub page: u32,
    pub width: u32,
    pub height: u32,
    pub tiles: usize,
}

/// Run the page pipeline for `page` (1-based).
pub async fn process_page(
    ctx: &PageContext<'_>,
    page: u32,
    progress: PageProgressSender,
) -> Result<PageRaster, PageError> {
    let span = info_span!("page", page, page_count = ctx.page_count);
    async move {
        let scratch = tempfile::Builder::new()
            .prefix(&format!("page{page}-"))
            .tempdir_in(ctx.job_dir)
            .map_err(|e| PageError::Io {
                page,
                detail: format!("cannot create page directory: {e}"),
            })?;

        let result = run_steps(ctx, page, scratch.path(), &progress).await;

        let scratch_path = scratch.path().to_path_buf();
        if let Err(e) = scratch.close() {
            warn!(path = %scratch_path.display(), error = %e, "page cleanup failed");
        }
        if result.is_ok() {
            progress.set(100);
        }
        result
    }
    .instrument(span)
    .await
}

async fn run_steps(
    ctx: &PageContext<'_>,
    page: u32,
    dir: &Path,
    progress: &PageProgressSender,
) -> Result<PageRaster, PageError> {
    let tool_err = |source| PageError::Tool { page, source };
    let storage_err = |source| PageError::Storage { page, source };
    let config = ctx.config;

    let extracted = dir.join("page.pdf");
    qpdf::extract_page(ctx.runner, config, ctx.linearized, page, &extracted)
        .await
        .map_err(tool_err)?;
    progress.set(20);

    let raster = dir.join("raster.png");
    render::rasterize(ctx.runner, config, &extracted, &raster, RasterKind::Tiling)
        .await
        .map_err(tool_err)?;
    progress.set(40);

    let preview = dir.join("preview.png");
    render::rasterize(ctx.runner, config, &extracted, &preview, RasterKind::Preview)
        .await
        .map_err(tool_err)?;
    progress.set(50);

    let preview_key = ctx.paths.preview(page);
    let preview_bytes = tokio::fs::read(&preview).await.map_err(|e| PageError::Io {
        page,
        detail: format!("cannot read preview: {e}"),
    })?;
    ctx.storage
        .put(
            &preview_key,
            Bytes::from(preview_bytes),
            PutRequest::for_path(&preview_key, &config.cache_control),
        )
        .await
        .map_err(storage_err)?;
    if page == 1 {
        if let Err(e) = ctx
            .metadata
            .update(ctx.document_id, DocumentPatch::preview(preview_key))
            .await
        {
            warn!(error = %e, "could not record preview reference");
        }
    }
    progress.set(55);

    let spec = TileSpec {
        tile_size: config.tile_size,
        overlap: config.tile_overlap,
        format: config.tile_format,
    };
    let pyramid = tiles::generate_pyramid(
        &raster,
        &dir.join(ctx.paths.page_name(page)),
        spec,
        config.tiling_timeout,
        ctx.tiling,
    )
    .await
    .map_err(tool_err)?;
    progress.set(70);

    let uploaded = ctx
        .storage
        .upload_tree(
            &pyramid.files_dir,
            &ctx.paths.tiles_files_prefix(page),
            config.upload_concurrency,
            &config.cache_control,
        )
        .await
        .map_err(storage_err)?;
    let descriptor_key = ctx.paths.tiles_descriptor(page);
    let descriptor = tokio::fs::read(&pyramid.descriptor)
        .await
        .map_err(|e| PageError::Io {
            page,
            detail: format!("cannot read descriptor: {e}"),
        })?;
    ctx.storage
        .put(
            &descriptor_key,
            Bytes::from(descriptor),
            PutRequest::for_path(&descriptor_key, &config.cache_control),
        )
        .await
        .map_err(storage_err)?;
    progress.set(90);

    debug!(
        width = pyramid.width,
        height = pyramid.height,
        levels = pyramid.levels,
        tiles = uploaded,
        "page tiled"
    );
    Ok(PageRaster {
        page,
        width: pyramid.width,
        height: pyramid.height,
        tiles: uploaded,
    })
}
