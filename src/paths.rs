//! Deterministic object-store keys.
//!
//! The tile server reads these keys back without consulting anything but the
//! record's `tiles_root_ref`, so every function here must stay bit-exact:
//!
//! ```text
//! {projectId}/{baseName}.pdf                          original upload
//! {projectId}/previews/{baseName}-page{N}.png         150 DPI preview
//! {projectId}/tiles/{baseName}-page{N}                tile root (record value)
//! {projectId}/tiles/{baseName}-page{N}.dzi            deep-zoom descriptor
//! {projectId}/tiles/{baseName}-page{N}_files/{z}/{col}_{row}.{ext}
//! ```
//!
//! Keys depend only on `(projectId, fileName, pageNumber)`, which is what
//! makes a retried job overwrite its own artefacts instead of duplicating them.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static PDF_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\.pdf$").expect("valid regex"));
static UNSAFE_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9]").expect("valid regex"));

/// Reduce an uploaded file name to the storage-safe base used in every key.
///
/// Strips one trailing `.pdf` (any case), then maps every character outside
/// `[A-Za-z0-9]` to `_`, one per UTF-16 code unit: characters outside the
/// Basic Multilingual Plane become `__`, as the tile server expects.
pub fn safe_base_name(file_name: &str) -> String {
    let stem = PDF_SUFFIX.replace(file_name, "");
    UNSAFE_CHARS
        .replace_all(&stem, |caps: &Captures| "_".repeat(caps[0].encode_utf16().count()))
        .into_owned()
}

/// Key builder for one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePaths {
    project_id: String,
    base_name: String,
}

impl StoragePaths {
    pub fn new(project_id: impl Into<String>, file_name: &str) -> Self {
        Self {
            project_id: project_id.into(),
            base_name: safe_base_name(file_name),
        }
    }

    /// `{baseName}-page{N}`, the per-page stem shared by previews and tiles.
    pub fn page_name(&self, page: u32) -> String {
        format!("{}-page{}", self.base_name, page)
    }

    pub fn source_pdf(&self) -> String {
        format!("{}/{}.pdf", self.project_id, self.base_name)
    }

    pub fn preview(&self, page: u32) -> String {
        format!("{}/previews/{}.png", self.project_id, self.page_name(page))
    }

    pub fn tiles_root(&self, page: u32) -> String {
        format!("{}/tiles/{}", self.project_id, self.page_name(page))
    }

    pub fn tiles_descriptor(&self, page: u32) -> String {
        format!("{}.dzi", self.tiles_root(page))
    }

    pub fn tiles_files_prefix(&self, page: u32) -> String {
        format!("{}_files", self.tiles_root(page))
    }
}
