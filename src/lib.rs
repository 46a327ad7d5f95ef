//! # edgequake-pdf2tiles
//!
//! Turn large multi-page PDF plans into deep-zoom tile pyramids, driven by a
//! durable job queue and a bounded worker pool.
//!
//! ## Why this crate?
//!
//! Architectural and engineering sheets are huge: an A0 page at 600 DPI is
//! roughly 20 000 × 28 000 pixels. Shipping that as one image is useless in a
//! browser, so each page is cut into a pyramid of 512 px tiles a viewer can
//! pan and zoom through. Rasterising and tiling take minutes per document, so
//! the work runs in the background with retries, progress reporting and
//! at-least-once delivery.
//!
//! ## Pipeline Overview
//!
//! ```text
//! upload
//!  │
//!  ├─ ingest     validate %PDF, create `queued` record, enqueue job
//!  ├─ queue      lease (renewable lock), rate limit, retry with backoff
//!  └─ document   store original → qpdf --linearize → page count
//!      │
//!      └─ page × N (bounded fan-out)
//!          ├─ qpdf extract page
//!          ├─ gs raster @600 DPI + preview @150 DPI
//!          ├─ upload preview (page 1 → record.previewRef)
//!          ├─ deep-zoom pyramid (spawn_blocking)
//!          └─ upload tiles + .dzi (bounded fan-out)
//!      │
//!      └─ record: ready, 100%, width/height/pageCount/tilesRootRef
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_pdf2tiles::{
//!     DocumentInput, DocumentPipeline, DocumentRecord, InMemoryMetadataStore,
//!     MetadataStore, NoopProgressReporter, PipelineConfig, StorageGateway,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let metadata = Arc::new(InMemoryMetadataStore::new());
//!     metadata.insert(DocumentRecord::new("doc1", "proj1", "plan.pdf")).await?;
//!
//!     let pipeline = DocumentPipeline::with_process_runner(
//!         PipelineConfig::default(),
//!         StorageGateway::local("out")?,
//!         metadata.clone(),
//!     );
//!     let result = pipeline
//!         .run(
//!             DocumentInput {
//!                 bytes: std::fs::read("plan.pdf")?.into(),
//!                 project_id: "proj1".into(),
//!                 document_id: "doc1".into(),
//!                 file_name: "plan.pdf".into(),
//!                 correlation_id: "local".into(),
//!             },
//!             Arc::new(NoopProgressReporter),
//!         )
//!         .await?;
//!     println!("{} pages, tiles at {}", result.page_count, result.tiles_root_ref);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdf2tiles` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-pdf2tiles = { version = "0.1", default-features = false }
//! ```
//!
//! ## External tools
//!
//! `qpdf` and ghostscript (`gs`) must be on `PATH`, or configured through
//! [`PipelineConfig::qpdf_bin`] and [`PipelineConfig::gs_bin`].

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod document;
pub mod error;
pub mod ingest;
pub mod metadata;
pub mod paths;
pub mod pipeline;
pub mod progress;
pub mod queue;
pub mod storage;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    Backoff, BackoffKind, JobOptions, PipelineConfig, PipelineConfigBuilder, TileFormat,
    WorkerConfig, WorkerConfigBuilder,
};
pub use document::{DocumentInput, DocumentPipeline, PipelineResult};
pub use error::{
    MetadataError, PageError, PipelineError, QueueError, StorageError, SubmitError,
    ToolErrorKind, ToolExecutionError, ValidationError,
};
pub use ingest::{submit_document, validate_pdf, Submission, Upload};
pub use metadata::{
    DocumentPatch, DocumentRecord, DocumentStatus, InMemoryMetadataStore, MetadataStore,
    StatusView,
};
pub use paths::{safe_base_name, StoragePaths};
pub use pipeline::page::PageRaster;
pub use pipeline::tools::{ProcessRunner, ToolInvocation, ToolOutput, ToolRunner};
pub use progress::{NoopProgressReporter, ProgressReporter};
pub use queue::{
    JobCounts, JobHandler, JobPayload, JobQueue, JobSnapshot, JobState, TileJobHandler,
    WorkerEvents, WorkerPool,
};
pub use storage::StorageGateway;
