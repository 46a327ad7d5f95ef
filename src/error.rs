//! Error types for the edgequake-pdf2tiles library.
//!
//! Failures are split by the layer that produces them:
//!
//! * [`ValidationError`]: the upload is unusable (empty, not a PDF, too big).
//!   Raised by [`crate::ingest`] before anything is enqueued.
//!
//! * [`SubmitError`]: a rejected upload, a failed record write or a closed
//!   queue, as seen by the submitting caller.
//!
//! * [`ToolExecutionError`] / [`StorageError`] / [`MetadataError`]: a single
//!   collaborator call failed (qpdf, ghostscript, the tiler, the object store
//!   or the metadata store).
//!
//! * [`PageError`]: one page failed; tags the failing collaborator so the
//!   document pipeline can report which page broke and why.
//!
//! * [`PipelineError`]: the whole document failed. This is what a job handler
//!   returns and what ends up in the record's `error_message`.
//!
//! * [`QueueError`]: job-queue bookkeeping: unknown job, lost lock, retries
//!   exhausted, snapshot persistence.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

// ── Ingestion ──────────────────────────────────────────────────────────────

/// The uploaded payload was rejected before being enqueued.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Uploaded file is empty")]
    Empty,

    #[error("Uploaded file is not a valid PDF (first bytes: {magic:?})")]
    NotAPdf { magic: Vec<u8> },

    #[error("Uploaded file is {size} bytes, the limit is {limit} bytes")]
    TooLarge { size: usize, limit: usize },

    #[error("Missing required field '{field}'")]
    MissingField { field: &'static str },
}

/// Submitting an upload failed: rejected input, or the record or queue write.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

// ── External tools ─────────────────────────────────────────────────────────

/// Coarse classification of a [`ToolExecutionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolErrorKind {
    NonZero,
    Timeout,
    Spawn,
    OutputTooLarge,
    Transform,
}

/// An external tool invocation did not succeed.
#[derive(Debug, Error)]
pub enum ToolExecutionError {
    /// The process ran but exited with a status outside its success set.
    #[error("{tool} exited with {}: {stderr}", describe_exit(.code))]
    NonZeroExit {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    /// The process was still running when its deadline elapsed and was killed.
    #[error("{tool} timed out after {}s", .after.as_secs())]
    Timeout { tool: String, after: Duration },

    /// The process could not be started at all (binary missing, permissions).
    #[error("Failed to launch {tool}: {source}\nIs it installed and on PATH?")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    /// Captured stdout/stderr grew beyond the configured buffer.
    #[error("{tool} produced more than {limit} bytes of output")]
    OutputTooLarge { tool: String, limit: usize },

    /// An in-process transform (tiling, image decoding) failed.
    #[error("{tool} failed: {detail}")]
    Transform { tool: String, detail: String },
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("code {c}"),
        None => "a signal".to_string(),
    }
}

impl ToolExecutionError {
    pub fn kind(&self) -> ToolErrorKind {
        match self {
            Self::NonZeroExit { .. } => ToolErrorKind::NonZero,
            Self::Timeout { .. } => ToolErrorKind::Timeout,
            Self::Spawn { .. } => ToolErrorKind::Spawn,
            Self::OutputTooLarge { .. } => ToolErrorKind::OutputTooLarge,
            Self::Transform { .. } => ToolErrorKind::Transform,
        }
    }

    pub fn tool(&self) -> &str {
        match self {
            Self::NonZeroExit { tool, .. }
            | Self::Timeout { tool, .. }
            | Self::Spawn { tool, .. }
            | Self::OutputTooLarge { tool, .. }
            | Self::Transform { tool, .. } => tool,
        }
    }
}

// ── Object storage ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Upload to '{path}' failed: {detail}")]
    Upload { path: String, detail: String },

    #[error("Download of '{path}' failed: {detail}")]
    Download { path: String, detail: String },

    #[error("Object '{path}' not found")]
    NotFound { path: String },

    /// Only raised for writes with `upsert = false`.
    #[error("Object '{path}' already exists")]
    AlreadyExists { path: String },

    #[error("Local file error on '{path}': {source}")]
    LocalIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// ── Metadata store ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Document record '{id}' not found")]
    NotFound { id: String },

    #[error("Document '{id}' cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("Metadata store error: {0}")]
    Backend(String),
}

// ── Pipeline ───────────────────────────────────────────────────────────────

/// A failure inside the page sub-pipeline, tagged by the collaborator that
/// produced it.
#[derive(Debug, Error)]
pub enum PageError {
    #[error("Page {page}: {source}")]
    Tool {
        page: u32,
        #[source]
        source: ToolExecutionError,
    },

    #[error("Page {page}: {source}")]
    Storage {
        page: u32,
        #[source]
        source: StorageError,
    },

    #[error("Page {page}: {detail}")]
    Io { page: u32, detail: String },
}

impl PageError {
    pub fn page(&self) -> u32 {
        match self {
            Self::Tool { page, .. }
            | Self::Storage { page, .. }
            | Self::Io { page, .. } => *page,
        }
    }
}

/// All fatal errors of a document run.
///
/// Whatever the cause, the document pipeline records `to_string()` as the
/// record's `error_message` before returning this to the queue.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Tool(#[from] ToolExecutionError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Page(#[from] PageError),

    #[error("Could not read a page count from qpdf output {output:?}")]
    InvalidPageCount { output: String },

    #[error("Job payload is unusable: {0}")]
    InvalidPayload(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// The page that caused the failure, when it was page-scoped.
    pub fn page(&self) -> Option<u32> {
        match self {
            Self::Page(e) => Some(e.page()),
            _ => None,
        }
    }
}

// ── Queue ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Job {job_id} not found")]
    NotFound { job_id: u64 },

    /// The caller's lock token no longer matches: the lease expired and the
    /// job was reclaimed (or finished) elsewhere.
    #[error("Lock on job {job_id} was lost")]
    LockLost { job_id: u64 },

    /// Active jobs cannot be removed; cancellation only affects queued runs.
    #[error("Job {job_id} is active and cannot be removed")]
    JobActive { job_id: u64 },

    #[error("Job {job_id} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        job_id: u64,
        attempts: u32,
        last_error: String,
    },

    #[error("Failed to persist queue snapshot '{path}': {detail}")]
    Persistence { path: PathBuf, detail: String },

    /// A completed job's stored result does not match the requested type.
    #[error("Job {job_id} result is unreadable: {detail}")]
    InvalidReturnValue { job_id: u64, detail: String },

    /// The queue was closed; no further jobs are accepted.
    #[error("Queue is closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonzero_exit_display_includes_code() {
        let e = ToolExecutionError::NonZeroExit {
            tool: "gs".into(),
            code: Some(1),
            stderr: "Unrecoverable error".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("code 1"), "got: {msg}");
        assert!(msg.contains("gs"));
        assert_eq!(e.kind(), ToolErrorKind::NonZero);
    }

    #[test]
    fn signal_exit_display() {
        let e = ToolExecutionError::NonZeroExit {
            tool: "qpdf".into(),
            code: None,
            stderr: String::new(),
        };
        assert!(e.to_string().contains("a signal"));
    }

    #[test]
    fn timeout_display() {
        let e = ToolExecutionError::Timeout {
            tool: "qpdf".into(),
            after: Duration::from_secs(120),
        };
        assert!(e.to_string().contains("120s"));
        assert_eq!(e.kind(), ToolErrorKind::Timeout);
        assert_eq!(e.tool(), "qpdf");
    }

    #[test]
    fn pipeline_error_reports_failing_page() {
        let e = PipelineError::from(PageError::Tool {
            page: 3,
            source: ToolExecutionError::Timeout {
                tool: "gs".into(),
                after: Duration::from_secs(1),
            },
        });
        assert_eq!(e.page(), Some(3));
        assert!(e.to_string().starts_with("Page 3"));
    }

    #[test]
    fn retries_exhausted_display() {
        let e = QueueError::RetriesExhausted {
            job_id: 7,
            attempts: 3,
            last_error: "boom".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("3 attempts"));
        assert!(msg.contains("boom"));
    }
}
