//! Accepting an upload: validate, register the record, enqueue.
//!
//! This is the producer side of the queue without any HTTP around it. A
//! rejected upload never reaches the queue and never creates a record; when
//! the queue refuses the job, the record created for it is removed again.

use crate::config::JobOptions;
use crate::error::{PipelineError, SubmitError, ValidationError};
use crate::metadata::{DocumentRecord, MetadataStore};
use crate::queue::{JobPayload, JobQueue, JobSnapshot};
use tracing::{info, warn};
use uuid::Uuid;

/// Largest accepted upload. 100 MiB.
pub const DEFAULT_MAX_UPLOAD: usize = 100 * 1024 * 1024;

const PDF_MAGIC: &[u8] = b"%PDF";

/// Reject anything that is not a plausible PDF within `limit` bytes.
pub fn validate_pdf(bytes: &[u8], limit: usize) -> Result<(), ValidationError> {
    if bytes.is_empty() {
        return Err(ValidationError::Empty);
    }
    if bytes.len() > limit {
        return Err(ValidationError::TooLarge {
            size: bytes.len(),
            limit,
        });
    }
    if !bytes.starts_with(PDF_MAGIC) {
        return Err(ValidationError::NotAPdf {
            magic: bytes.iter().take(8).copied().collect(),
        });
    }
    Ok(())
}

/// One uploaded document.
#[derive(Debug, Clone)]
pub struct Upload {
    pub bytes: Vec<u8>,
    pub project_id: String,
    pub file_name: String,
    /// Reuse an existing record id; a fresh one is generated otherwise.
    pub document_id: Option<String>,
}

/// What the caller gets back after a successful submission.
#[derive(Debug, Clone)]
pub struct Submission {
    pub document_id: String,
    pub correlation_id: String,
    pub job: JobSnapshot,
}

/// A short request id for log correlation.
pub fn correlation_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Validate `upload`, create its `queued` record and enqueue it with the
/// default job options.
pub async fn submit_document(
    queue: &JobQueue,
    metadata: &dyn MetadataStore,
    upload: Upload,
) -> Result<Submission, SubmitError> {
    submit_with_options(queue, metadata, upload, JobOptions::default(), DEFAULT_MAX_UPLOAD).await
}

pub async fn submit_with_options(
    queue: &JobQueue,
    metadata: &dyn MetadataStore,
    upload: Upload,
    options: JobOptions,
    max_upload: usize,
) -> Result<Submission, SubmitError> {
    if upload.project_id.trim().is_empty() {
        return Err(ValidationError::MissingField { field: "projectId" }.into());
    }
    if upload.file_name.trim().is_empty() {
        return Err(ValidationError::MissingField { field: "fileName" }.into());
    }
    validate_pdf(&upload.bytes, max_upload)?;

    let correlation_id = correlation_id();
    let document_id = upload
        .document_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    metadata
        .insert(DocumentRecord::new(
            document_id.clone(),
            upload.project_id.clone(),
            upload.file_name.clone(),
        ))
        .await
        .map_err(PipelineError::from)?;

    let payload = JobPayload::new(
        &upload.bytes,
        upload.project_id,
        document_id.clone(),
        upload.file_name,
        correlation_id.clone(),
    );
    let job = match queue.enqueue(payload, options).await {
        Ok(job) => job,
        Err(e) => {
            if let Err(de) = metadata.delete(&document_id).await {
                warn!(document_id = %document_id, error = %de, "could not remove orphaned record");
            }
            return Err(e.into());
        }
    };
    info!(
        job_id = job.id,
        document_id = %document_id,
        correlation_id = %correlation_id,
        size = upload.bytes.len(),
        "document submitted"
    );
    Ok(Submission {
        document_id,
        correlation_id,
        job,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{MetadataError, QueueError};
    use crate::metadata::{DocumentStatus, InMemoryMetadataStore};

    #[test]
    fn validation_rules() {
        assert!(matches!(validate_pdf(b"", 10), Err(ValidationError::Empty)));
        assert!(matches!(
            validate_pdf(b"GIF89a....", 100),
            Err(ValidationError::NotAPdf { .. })
        ));
        assert!(matches!(
            validate_pdf(b"%PDF-1.7 xxxxxxxx", 8),
            Err(ValidationError::TooLarge { size: 17, limit: 8 })
        ));
        assert!(validate_pdf(b"%PDF-1.7", 100).is_ok());
    }

    #[test]
    fn correlation_ids_are_short() {
        let id = correlation_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn submit_creates_record_and_job() {
        let queue = JobQueue::in_memory();
        let store = InMemoryMetadataStore::new();
        let sub = submit_document(
            &queue,
            &store,
            Upload {
                bytes: b"%PDF-1.7\n".to_vec(),
                project_id: "proj1".into(),
                file_name: "plan.pdf".into(),
                document_id: Some("doc1".into()),
            },
        )
        .await
        .unwrap();

        assert_eq!(sub.document_id, "doc1");
        let rec = store.get("doc1").await.unwrap();
        assert_eq!(rec.status, DocumentStatus::Queued);
        assert_eq!(rec.progress, 0);
        assert_eq!(sub.job.max_attempts, 3);
        assert_eq!(queue.find_by_document("doc1").await.len(), 1);
    }

    #[tokio::test]
    async fn rejected_upload_leaves_no_trace() {
        let queue = JobQueue::in_memory();
        let store = InMemoryMetadataStore::new();
        let err = submit_document(
            &queue,
            &store,
            Upload {
                bytes: b"<html>".to_vec(),
                project_id: "proj1".into(),
                file_name: "plan.pdf".into(),
                document_id: Some("doc1".into()),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SubmitError::Validation(_)));
        assert!(store.get("doc1").await.is_err());
        assert_eq!(queue.counts().await.waiting, 0);
    }

    #[tokio::test]
    async fn closed_queue_rolls_back_the_record() {
        let queue = JobQueue::in_memory();
        queue.close().await;
        let store = InMemoryMetadataStore::new();
        let err = submit_document(
            &queue,
            &store,
            Upload {
                bytes: b"%PDF-1.7\n".to_vec(),
                project_id: "proj1".into(),
                file_name: "plan.pdf".into(),
                document_id: Some("doc1".into()),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SubmitError::Queue(QueueError::Closed)), "{err:?}");
        assert!(matches!(
            store.get("doc1").await,
            Err(MetadataError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn unwritable_snapshot_rolls_back_record_and_job() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        let queue = JobQueue::open(&path).await.unwrap();
        // A directory where the temp snapshot goes makes every write fail.
        std::fs::create_dir(dir.path().join("queue.json.tmp")).unwrap();
        let store = InMemoryMetadataStore::new();
        let err = submit_document(
            &queue,
            &store,
            Upload {
                bytes: b"%PDF-1.7\n".to_vec(),
                project_id: "proj1".into(),
                file_name: "plan.pdf".into(),
                document_id: Some("doc1".into()),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SubmitError::Queue(QueueError::Persistence { .. })), "{err:?}");
        assert!(store.get("doc1").await.is_err());
        assert_eq!(queue.counts().await.pending(), 0);
    }
}
