//! The document pipeline: one PDF in, one `ready` or `failed` record out.
//!
//! ```text
//! upload original ─▶ linearize ─▶ count pages ─▶ fan out pages ─▶ finalize
//!        2                5            10          10 ‥ 90           100
//! ```
//!
//! Pages run under the `page_concurrency` limiter and may finish in any
//! order. The first page error stops the fan-out: in-flight pages are dropped
//! (their scratch directories go with them) and the document fails as a
//! whole. There is no partial `ready`. Tiling threads of dropped pages are
//! awaited before the job directory is removed, so nothing is written into
//! it afterwards.
//!
//! Every error is caught at this boundary, written to the record as
//! `status = failed` with its message, and returned so the queue can retry.

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::metadata::{DocumentPatch, MetadataStore, ReadyFields};
use crate::paths::StoragePaths;
use crate::pipeline::page::{process_page, PageContext, PageRaster};
use crate::pipeline::qpdf;
use crate::pipeline::tools::{ProcessRunner, ToolRunner};
use crate::progress::{ProgressAggregator, ProgressReporter, PAGE_BAND_START};
use crate::storage::{PutRequest, StorageGateway};
use bytes::Bytes;
use futures::{stream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempDir;
use tokio_util::task::TaskTracker;
use tracing::{info, info_span, warn, Instrument};

/// Progress written once the original is stored.
pub const PROGRESS_UPLOADED: u8 = 2;
/// Progress written once the document is linearized.
pub const PROGRESS_LINEARIZED: u8 = 5;

/// One document to process.
#[derive(Debug, Clone)]
pub struct DocumentInput {
    pub bytes: Bytes,
    pub project_id: String,
    pub document_id: String,
    pub file_name: String,
    pub correlation_id: String,
}

/// Aggregate outcome of a successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResult {
    pub page_count: u32,
    /// Page 1 width.
    pub width: u32,
    /// Page 1 height.
    pub height: u32,
    pub tiles_root_ref: String,
    /// Per-page outcomes, ordered by page number.
    pub pages: Vec<PageRaster>,
}

/// Turns PDFs into tile pyramids.
#[derive(Clone)]
pub struct DocumentPipeline {
    config: Arc<PipelineConfig>,
    runner: Arc<dyn ToolRunner>,
    storage: StorageGateway,
    metadata: Arc<dyn MetadataStore>,
}

impl DocumentPipeline {
    pub fn new(
        config: PipelineConfig,
        runner: Arc<dyn ToolRunner>,
        storage: StorageGateway,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            runner,
            storage,
            metadata,
        }
    }

    /// A pipeline that runs the real qpdf and ghostscript binaries.
    pub fn with_process_runner(
        config: PipelineConfig,
        storage: StorageGateway,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        Self::new(config, Arc::new(ProcessRunner), storage, metadata)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    pub fn storage(&self) -> &StorageGateway {
        &self.storage
    }

    /// Process one document. The record identified by `input.document_id`
    /// must already exist.
    pub async fn run(
        &self,
        input: DocumentInput,
        reporter: Arc<dyn ProgressReporter>,
    ) -> Result<PipelineResult, PipelineError> {
        let span = info_span!(
            "document",
            document_id = %input.document_id,
            correlation_id = %input.correlation_id,
        );
        async move {
            let start = Instant::now();
            let outcome = match self.create_job_dir(&input) {
                Ok(job_dir) => {
                    let tiling = TaskTracker::new();
                    let outcome = self
                        .process(&input, job_dir.path(), &tiling, reporter)
                        .await;
                    tiling.close();
                    tiling.wait().await;
                    let path = job_dir.path().to_path_buf();
                    if let Err(e) = job_dir.close() {
                        warn!(path = %path.display(), error = %e, "job cleanup failed");
                    }
                    outcome
                }
                Err(e) => Err(e),
            };

            match &outcome {
                Ok(result) => info!(
                    pages = result.page_count,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "document ready"
                ),
                Err(e) => {
                    warn!(error = %e, page = ?e.page(), "document failed");
                    if let Err(me) = self
                        .metadata
                        .update(&input.document_id, DocumentPatch::failed(e.to_string()))
                        .await
                    {
                        warn!(error = %me, "could not record failure");
                    }
                }
            }
            outcome
        }
        .instrument(span)
        .await
    }

    fn create_job_dir(&self, input: &DocumentInput) -> Result<TempDir, PipelineError> {
        std::fs::create_dir_all(&self.config.work_root)
            .and_then(|_| {
                tempfile::Builder::new()
                    .prefix(&format!("tiles-{}-", input.correlation_id))
                    .tempdir_in(&self.config.work_root)
            })
            .map_err(|e| {
                PipelineError::Internal(format!(
                    "cannot create work directory in {}: {e}",
                    self.config.work_root.display()
                ))
            })
    }

    async fn process(
        &self,
        input: &DocumentInput,
        job_dir: &Path,
        tiling: &TaskTracker,
        reporter: Arc<dyn ProgressReporter>,
    ) -> Result<PipelineResult, PipelineError> {
        let config = &*self.config;
        let runner = &*self.runner;
        let paths = StoragePaths::new(&input.project_id, &input.file_name);
        let id = input.document_id.as_str();

        // 1. store the original
        let source_key = paths.source_pdf();
        self.storage
            .put(
                &source_key,
                input.bytes.clone(),
                PutRequest::for_path(&source_key, &config.cache_control),
            )
            .await?;
        self.metadata
            .update(
                id,
                DocumentPatch::processing(PROGRESS_UPLOADED).with_source_file(source_key),
            )
            .await?;
        reporter.report(PROGRESS_UPLOADED).await;

        // 2. linearize
        let source = job_dir.join("source.pdf");
        tokio::fs::write(&source, &input.bytes)
            .await
            .map_err(|e| PipelineError::Internal(format!("cannot stage source PDF: {e}")))?;
        let linearized = job_dir.join("linearized.pdf");
        qpdf::linearize(runner, config, &source, &linearized).await?;
        self.set_progress(id, PROGRESS_LINEARIZED, &*reporter).await?;

        // 3. count pages
        let page_count = qpdf::page_count(runner, config, &linearized).await?;
        info!(page_count, "document linearized");
        self.set_progress(id, PAGE_BAND_START, &*reporter).await?;

        // 4. fan out
        let aggregator = ProgressAggregator::spawn(
            id.to_string(),
            page_count,
            PAGE_BAND_START,
            Arc::clone(&self.metadata),
            Arc::clone(&reporter),
        );
        let ctx = PageContext {
            config,
            runner,
            storage: &self.storage,
            metadata: &*self.metadata,
            paths: &paths,
            document_id: id,
            linearized: &linearized,
            job_dir,
            tiling,
            page_count,
        };
        let pages: Result<Vec<PageRaster>, _> = stream::iter(1..=page_count)
            .map(|page| process_page(&ctx, page, aggregator.sender(page)))
            .buffer_unordered(config.page_concurrency)
            .try_collect()
            .await;
        // No page update may follow finalization.
        aggregator.finish().await;
        let mut pages = pages?;
        pages.sort_by_key(|p| p.page);

        // 5. finalize
        let first = pages
            .first()
            .filter(|p| p.page == 1)
            .ok_or_else(|| PipelineError::Internal("page 1 produced no result".into()))?;
        let result = PipelineResult {
            page_count,
            width: first.width,
            height: first.height,
            tiles_root_ref: paths.tiles_root(1),
            pages: pages.clone(),
        };
        self.metadata
            .update(
                id,
                DocumentPatch::ready(ReadyFields {
                    tiles_root_ref: result.tiles_root_ref.clone(),
                    width: result.width,
                    height: result.height,
                    page_count,
                }),
            )
            .await?;
        reporter.report(100).await;
        Ok(result)
    }

    async fn set_progress(
        &self,
        id: &str,
        percent: u8,
        reporter: &dyn ProgressReporter,
    ) -> Result<(), PipelineError> {
        self.metadata.update(id, DocumentPatch::progress(percent)).await?;
        reporter.report(percent).await;
        Ok(())
    }
}
