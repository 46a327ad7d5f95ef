//! Job records as stored by the queue.

use crate::config::JobOptions;
use crate::document::DocumentInput;
use crate::error::PipelineError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a producer enqueues: the document itself plus where it belongs.
///
/// The document travels as base64 so the payload stays plain JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub document_bytes: String,
    pub project_id: String,
    pub document_id: String,
    pub file_name: String,
    pub correlation_id: String,
}

impl JobPayload {
    pub fn new(
        document: &[u8],
        project_id: impl Into<String>,
        document_id: impl Into<String>,
        file_name: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            document_bytes: BASE64.encode(document),
            project_id: project_id.into(),
            document_id: document_id.into(),
            file_name: file_name.into(),
            correlation_id: correlation_id.into(),
        }
    }

    /// Decode into the document pipeline's input.
    pub fn to_input(&self) -> Result<DocumentInput, PipelineError> {
        let bytes = BASE64
            .decode(self.document_bytes.as_bytes())
            .map_err(|e| PipelineError::InvalidPayload(format!("documentBytes: {e}")))?;
        if bytes.is_empty() {
            return Err(PipelineError::InvalidPayload("documentBytes is empty".into()));
        }
        Ok(DocumentInput {
            bytes: Bytes::from(bytes),
            project_id: self.project_id.clone(),
            document_id: self.document_id.clone(),
            file_name: self.file_name.clone(),
            correlation_id: self.correlation_id.clone(),
        })
    }
}

/// Lifecycle of a job.
///
/// `waiting → active → completed`, or `active → delayed → waiting → …` on
/// retry, ending in `failed` once attempts run out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Delayed => "delayed",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// The full stored job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Job {
    pub id: u64,
    pub payload: JobPayload,
    pub options: JobOptions,
    pub state: JobState,
    pub attempts_made: u32,
    pub progress: u8,
    pub lock_token: Option<Uuid>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    /// Earliest time a `delayed` job may run again.
    pub run_at: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
    pub return_value: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(id: u64, payload: JobPayload, options: JobOptions) -> Self {
        Self {
            id,
            payload,
            options,
            state: JobState::Waiting,
            attempts_made: 0,
            progress: 0,
            lock_token: None,
            lock_expires_at: None,
            worker_id: None,
            run_at: None,
            failed_reason: None,
            return_value: None,
            created_at: Utc::now(),
            processed_at: None,
            finished_at: None,
        }
    }

    pub fn release_lock(&mut self) {
        self.lock_token = None;
        self.lock_expires_at = None;
        self.worker_id = None;
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            state: self.state,
            progress: self.progress,
            attempts_made: self.attempts_made,
            max_attempts: self.options.attempts,
            failed_reason: self.failed_reason.clone(),
            project_id: self.payload.project_id.clone(),
            document_id: self.payload.document_id.clone(),
            file_name: self.payload.file_name.clone(),
            correlation_id: self.payload.correlation_id.clone(),
            lock_expires_at: self.lock_expires_at,
            return_value: self.return_value.clone(),
            created_at: self.created_at,
            finished_at: self.finished_at,
        }
    }
}

/// Read-only view of a job, without the document bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: u64,
    pub state: JobState,
    pub progress: u8,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub failed_reason: Option<String>,
    pub project_id: String,
    pub document_id: String,
    pub file_name: String,
    pub correlation_id: String,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub return_value: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A granted lease: the right to run one attempt of a job.
#[derive(Debug, Clone)]
pub struct Lease {
    pub job_id: u64,
    pub token: Uuid,
    pub payload: JobPayload,
    /// Attempts already used before this one.
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub lock_expires_at: DateTime<Utc>,
}

/// Jobs per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobCounts {
    pub(crate) fn add(&mut self, state: JobState) {
        match state {
            JobState::Waiting => self.waiting += 1,
            JobState::Delayed => self.delayed += 1,
            JobState::Active => self.active += 1,
            JobState::Completed => self.completed += 1,
            JobState::Failed => self.failed += 1,
        }
    }

    /// Jobs that have not reached a terminal state.
    pub fn pending(&self) -> usize {
        self.waiting + self.delayed + self.active
    }
}

/// What happened to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Another attempt is scheduled after `delay`.
    Retried { attempts_made: u32, delay: std::time::Duration },
    /// Attempts are used up; the job is `failed`.
    Exhausted { attempts_made: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_serialises_in_camel_case() {
        let p = JobPayload::new(b"%PDF-1.7", "proj1", "doc1", "plan.pdf", "a1b2c3d4");
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["documentBytes"], "JVBERi0xLjc=");
        assert_eq!(json["projectId"], "proj1");
        assert_eq!(json["correlationId"], "a1b2c3d4");
    }

    #[test]
    fn payload_decodes_to_pipeline_input() {
        let p = JobPayload::new(b"%PDF-1.7", "proj1", "doc1", "plan.pdf", "c");
        let input = p.to_input().unwrap();
        assert_eq!(&input.bytes[..], b"%PDF-1.7");
        assert_eq!(input.file_name, "plan.pdf");
    }

    #[test]
    fn corrupt_payload_is_rejected() {
        let mut p = JobPayload::new(b"x", "p", "d", "f.pdf", "c");
        p.document_bytes = "***".into();
        assert!(matches!(p.to_input(), Err(PipelineError::InvalidPayload(_))));
        p.document_bytes = String::new();
        assert!(matches!(p.to_input(), Err(PipelineError::InvalidPayload(_))));
    }

    #[test]
    fn snapshot_hides_document_bytes() {
        let job = Job::new(1, JobPayload::new(b"%PDF", "p", "d", "f.pdf", "c"), JobOptions::default());
        let json = serde_json::to_value(job.snapshot()).unwrap();
        assert!(json.get("documentBytes").is_none());
        assert_eq!(json["state"], "waiting");
        assert_eq!(json["maxAttempts"], 3);
    }
}
