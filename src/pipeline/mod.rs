//! Pipeline stages for PDF-to-tiles processing.
//!
//! Each submodule wraps exactly one external collaborator or one step of the
//! per-page flow, so each can be tested on its own and the tool layer can be
//! swapped without touching the orchestration.
//!
//! ## Data Flow
//!
//! ```text
//! qpdf ──▶ render ──▶ tiles ──▶ (storage)
//! (split)   (gs)     (pyramid)
//!    ╰──────────── page ────────────╯
//! ```
//!
//! 1. [`tools`]: bounded, timeout-guarded child-process calls behind the
//!    [`tools::ToolRunner`] seam
//! 2. [`qpdf`]: linearize, count pages, extract a single page
//! 3. [`render`]: ghostscript rasterisation at tiling and preview resolution
//! 4. [`tiles`]: deep-zoom pyramid; runs in `spawn_blocking` because
//!    decoding and resampling a 600 DPI sheet is CPU-bound
//! 5. [`page`]: the per-page sequence tying the above to the object store

pub mod page;
pub mod qpdf;
pub mod render;
pub mod tiles;
pub mod tools;
