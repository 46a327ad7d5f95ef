//! Document records and the metadata-store seam.
//!
//! The metadata store is the single source of truth pollers read. The
//! pipeline only ever touches it through [`DocumentPatch`], a field-level
//! update applied atomically per call, and the patch constructors encode the
//! record invariants:
//!
//! * `tiles_root_ref`, `width`, `height` and `page_count` can only be written
//!   by [`DocumentPatch::ready`], together with `status = ready` and
//!   `progress = 100`.
//! * status moves `queued → processing → ready | failed`; a failed record may
//!   re-enter `processing` when the queue retries the job; `ready` is final.
//! * progress-only writes are accepted only while `processing`.

use crate::error::MetadataError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Processing status of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Queued,
    Processing,
    Ready,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }

    pub fn can_transition_to(self, next: DocumentStatus) -> bool {
        use DocumentStatus::*;
        matches!(
            (self, next),
            (Queued, Processing)
                | (Queued, Failed)
                | (Processing, Processing)
                | (Processing, Ready)
                | (Processing, Failed)
                | (Failed, Processing)
                | (Failed, Failed)
        )
    }
}

/// One uploaded PDF and the references to everything derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRecord {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub status: DocumentStatus,
    pub progress: u8,
    pub error_message: Option<String>,
    pub source_file_ref: Option<String>,
    pub preview_ref: Option<String>,
    pub tiles_root_ref: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub page_count: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DocumentRecord {
    /// A fresh `queued` record, as created by ingestion.
    pub fn new(id: impl Into<String>, project_id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            project_id: project_id.into(),
            name: name.into(),
            status: DocumentStatus::Queued,
            progress: 0,
            error_message: None,
            source_file_ref: None,
            preview_ref: None,
            tiles_root_ref: None,
            width: None,
            height: None,
            page_count: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The status-poll view exposed to clients.
    pub fn status_view(&self) -> StatusView {
        StatusView {
            status: self.status,
            progress: self.progress,
            error_message: self.error_message.clone(),
            width: self.width,
            height: self.height,
            page_count: self.page_count,
        }
    }

    fn apply(&mut self, patch: DocumentPatch) -> Result<(), MetadataError> {
        match patch.status {
            Some(next) if !self.status.can_transition_to(next) => {
                return Err(MetadataError::InvalidTransition {
                    id: self.id.clone(),
                    from: self.status.as_str(),
                    to: next.as_str(),
                });
            }
            None if patch.progress.is_some() && self.status != DocumentStatus::Processing => {
                return Err(MetadataError::InvalidTransition {
                    id: self.id.clone(),
                    from: self.status.as_str(),
                    to: "progress update",
                });
            }
            _ => {}
        }

        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(progress) = patch.progress {
            self.progress = progress.min(100);
        }
        if let Some(message) = patch.error_message {
            self.error_message = message;
        }
        if let Some(source) = patch.source_file_ref {
            self.source_file_ref = Some(source);
        }
        if let Some(preview) = patch.preview_ref {
            self.preview_ref = Some(preview);
        }
        if let Some(ready) = patch.ready {
            self.tiles_root_ref = Some(ready.tiles_root_ref);
            self.width = Some(ready.width);
            self.height = Some(ready.height);
            self.page_count = Some(ready.page_count);
        }
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// `{ status, progress, errorMessage, width, height, pageCount }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    pub status: DocumentStatus,
    pub progress: u8,
    pub error_message: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub page_count: Option<u32>,
}

/// Fields written only by the `ready` transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyFields {
    pub tiles_root_ref: String,
    pub width: u32,
    pub height: u32,
    pub page_count: u32,
}

/// A field-level update, applied atomically by [`MetadataStore::update`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentPatch {
    status: Option<DocumentStatus>,
    progress: Option<u8>,
    error_message: Option<Option<String>>,
    source_file_ref: Option<String>,
    preview_ref: Option<String>,
    ready: Option<ReadyFields>,
}

impl DocumentPatch {
    /// Start (or restart) an attempt: `status = processing`, clears any
    /// previous error.
    pub fn processing(progress: u8) -> Self {
        Self {
            status: Some(DocumentStatus::Processing),
            progress: Some(progress),
            error_message: Some(None),
            ..Default::default()
        }
    }

    pub fn progress(progress: u8) -> Self {
        Self {
            progress: Some(progress),
            ..Default::default()
        }
    }

    pub fn preview(preview_ref: impl Into<String>) -> Self {
        Self {
            preview_ref: Some(preview_ref.into()),
            ..Default::default()
        }
    }

    pub fn ready(fields: ReadyFields) -> Self {
        Self {
            status: Some(DocumentStatus::Ready),
            progress: Some(100),
            ready: Some(fields),
            ..Default::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(DocumentStatus::Failed),
            error_message: Some(Some(message.into())),
            ..Default::default()
        }
    }

    pub fn with_source_file(mut self, source_ref: impl Into<String>) -> Self {
        self.source_file_ref = Some(source_ref.into());
        self
    }
}

/// The record store the pipeline reports into.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Create or replace a record. A replaced record starts a new lifecycle.
    async fn insert(&self, record: DocumentRecord) -> Result<(), MetadataError>;

    async fn get(&self, id: &str) -> Result<DocumentRecord, MetadataError>;

    /// Apply `patch` atomically and return the updated record.
    async fn update(&self, id: &str, patch: DocumentPatch) -> Result<DocumentRecord, MetadataError>;

    /// Returns `true` when a record was removed.
    async fn delete(&self, id: &str) -> Result<bool, MetadataError>;
}

/// Process-local [`MetadataStore`].
///
/// Keeps an append-only `(status, progress)` log per record so callers can
/// audit how a record evolved.
#[derive(Debug, Default)]
pub struct InMemoryMetadataStore {
    inner: RwLock<InMemoryState>,
}

#[derive(Debug, Default)]
struct InMemoryState {
    records: HashMap<String, DocumentRecord>,
    history: HashMap<String, Vec<(DocumentStatus, u8)>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `(status, progress)` pair the record has held, oldest first.
    pub async fn history(&self, id: &str) -> Vec<(DocumentStatus, u8)> {
        self.inner
            .read()
            .await
            .history
            .get(id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn insert(&self, record: DocumentRecord) -> Result<(), MetadataError> {
        let mut state = self.inner.write().await;
        state
            .history
            .insert(record.id.clone(), vec![(record.status, record.progress)]);
        state.records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<DocumentRecord, MetadataError> {
        self.inner
            .read()
            .await
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| MetadataError::NotFound { id: id.to_string() })
    }

    async fn update(&self, id: &str, patch: DocumentPatch) -> Result<DocumentRecord, MetadataError> {
        let mut state = self.inner.write().await;
        let record = state
            .records
            .get_mut(id)
            .ok_or_else(|| MetadataError::NotFound { id: id.to_string() })?;
        record.apply(patch)?;
        let updated = record.clone();
        state
            .history
            .entry(id.to_string())
            .or_default()
            .push((updated.status, updated.progress));
        Ok(updated)
    }

    async fn delete(&self, id: &str) -> Result<bool, MetadataError> {
        let mut state = self.inner.write().await;
        state.history.remove(id);
        Ok(state.records.remove(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_fields() -> ReadyFields {
        ReadyFields {
            tiles_root_ref: "p/tiles/plan-page1".into(),
            width: 100,
            height: 50,
            page_count: 2,
        }
    }

    #[tokio::test]
    async fn ready_sets_dimensions_atomically() {
        let store = InMemoryMetadataStore::new();
        store.insert(DocumentRecord::new("d1", "p", "plan.pdf")).await.unwrap();
        store.update("d1", DocumentPatch::processing(2)).await.unwrap();

        let rec = store.get("d1").await.unwrap();
        assert!(rec.tiles_root_ref.is_none() && rec.width.is_none());

        let rec = store.update("d1", DocumentPatch::ready(ready_fields())).await.unwrap();
        assert_eq!(rec.status, DocumentStatus::Ready);
        assert_eq!(rec.progress, 100);
        assert_eq!(rec.width, Some(100));
        assert_eq!(rec.page_count, Some(2));
        assert_eq!(rec.tiles_root_ref.as_deref(), Some("p/tiles/plan-page1"));
    }

    #[tokio::test]
    async fn ready_is_terminal() {
        let store = InMemoryMetadataStore::new();
        store.insert(DocumentRecord::new("d1", "p", "plan.pdf")).await.unwrap();
        store.update("d1", DocumentPatch::processing(2)).await.unwrap();
        store.update("d1", DocumentPatch::ready(ready_fields())).await.unwrap();

        let err = store.update("d1", DocumentPatch::progress(40)).await.unwrap_err();
        assert!(matches!(err, MetadataError::InvalidTransition { .. }));
        let err = store.update("d1", DocumentPatch::failed("late")).await.unwrap_err();
        assert!(matches!(err, MetadataError::InvalidTransition { .. }));
        assert_eq!(store.get("d1").await.unwrap().progress, 100);
    }

    #[tokio::test]
    async fn failed_record_can_restart_processing() {
        let store = InMemoryMetadataStore::new();
        store.insert(DocumentRecord::new("d1", "p", "plan.pdf")).await.unwrap();
        store.update("d1", DocumentPatch::processing(2)).await.unwrap();
        let rec = store.update("d1", DocumentPatch::failed("gs crashed")).await.unwrap();
        assert_eq!(rec.error_message.as_deref(), Some("gs crashed"));

        let rec = store.update("d1", DocumentPatch::processing(2)).await.unwrap();
        assert_eq!(rec.status, DocumentStatus::Processing);
        assert!(rec.error_message.is_none());
    }

    #[tokio::test]
    async fn queued_record_rejects_ready() {
        let store = InMemoryMetadataStore::new();
        store.insert(DocumentRecord::new("d1", "p", "plan.pdf")).await.unwrap();
        let err = store.update("d1", DocumentPatch::ready(ready_fields())).await.unwrap_err();
        assert!(err.to_string().contains("queued"));
    }

    #[tokio::test]
    async fn history_tracks_progress_writes() {
        let store = InMemoryMetadataStore::new();
        store.insert(DocumentRecord::new("d1", "p", "plan.pdf")).await.unwrap();
        store.update("d1", DocumentPatch::processing(2)).await.unwrap();
        store.update("d1", DocumentPatch::progress(10)).await.unwrap();
        assert_eq!(
            store.history("d1").await,
            vec![
                (DocumentStatus::Queued, 0),
                (DocumentStatus::Processing, 2),
                (DocumentStatus::Processing, 10)
            ]
        );
    }

    #[test]
    fn status_view_serialises_poll_contract() {
        let rec = DocumentRecord::new("d1", "p", "plan.pdf");
        let json = serde_json::to_value(rec.status_view()).unwrap();
        assert_eq!(json["status"], "queued");
        assert_eq!(json["progress"], 0);
        assert!(json["errorMessage"].is_null());
        assert!(json.get("pageCount").is_some());
    }
}
