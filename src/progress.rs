//! Progress reporting for a document run.
//!
//! Two seams carry progress out of the pipeline:
//!
//! * [`ProgressReporter`] is the job-level sink. The worker pool hands one to
//!   each run so that every value written to the record is also persisted on
//!   the queued job for status pollers.
//!
//! * [`ProgressAggregator`] owns the page fan-out band. Each page pipeline
//!   sends its local `0..=100` value through a [`PageProgressSender`]; a single
//!   task folds them into the document value
//!   `10 + 80 * Σ page_progress / (pageCount * 100)` and is the only writer of
//!   progress while pages run. The document pipeline joins it with
//!   [`ProgressAggregator::finish`] before it writes `ready` or `failed`, so no
//!   page update can land after finalization.
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use edgequake_pdf2tiles::ProgressReporter;
//! use std::sync::atomic::{AtomicU8, Ordering};
//!
//! struct LastValue(AtomicU8);
//!
//! #[async_trait]
//! impl ProgressReporter for LastValue {
//!     async fn report(&self, percent: u8) {
//!         self.0.store(percent, Ordering::SeqCst);
//!     }
//! }
//! ```

use crate::metadata::{DocumentPatch, MetadataStore};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Receives document progress, `0..=100`, at each stage boundary.
///
/// Values arrive in non-decreasing order within one attempt.
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    async fn report(&self, percent: u8);
}

/// Discards progress. Used when a document is processed outside the queue.
pub struct NoopProgressReporter;

#[async_trait]
impl ProgressReporter for NoopProgressReporter {
    async fn report(&self, _percent: u8) {}
}

/// Lower edge of the page fan-out band.
pub const PAGE_BAND_START: u8 = 10;
/// Width of the page fan-out band.
pub const PAGE_BAND_WIDTH: u8 = 80;

/// Document progress for the given per-page values.
pub fn document_progress(page_values: &[u8]) -> u8 {
    if page_values.is_empty() {
        return PAGE_BAND_START;
    }
    let sum: u64 = page_values.iter().map(|&p| u64::from(p.min(100))).sum();
    let total = page_values.len() as u64 * 100;
    let band = u64::from(PAGE_BAND_WIDTH) * sum / total;
    PAGE_BAND_START + band as u8
}

#[derive(Debug, Clone, Copy)]
struct PageProgress {
    page: u32,
    percent: u8,
}

/// Handle a page pipeline uses to publish its local progress.
#[derive(Debug, Clone)]
pub struct PageProgressSender {
    page: u32,
    tx: mpsc::UnboundedSender<PageProgress>,
}

impl PageProgressSender {
    pub fn set(&self, percent: u8) {
        // The receiver only goes away once the document stops listening.
        let _ = self.tx.send(PageProgress {
            page: self.page,
            percent,
        });
    }
}

/// Single owner of document progress during page fan-out.
pub struct ProgressAggregator {
    tx: mpsc::UnboundedSender<PageProgress>,
    handle: JoinHandle<u8>,
}

impl ProgressAggregator {
    /// Start the aggregation task. `last` is the progress already written for
    /// this attempt; nothing at or below it is written again.
    pub fn spawn(
        document_id: String,
        page_count: u32,
        last: u8,
        metadata: Arc<dyn MetadataStore>,
        reporter: Arc<dyn ProgressReporter>,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<PageProgress>();
        let handle = tokio::spawn(async move {
            let mut pages = vec![0u8; page_count as usize];
            let mut last = last;
            while let Some(update) = rx.recv().await {
                let Some(slot) = update
                    .page
                    .checked_sub(1)
                    .and_then(|i| pages.get_mut(i as usize))
                else {
                    warn!(page = update.page, "progress for unknown page ignored");
                    continue;
                };
                *slot = (*slot).max(update.percent.min(100));

                let value = document_progress(&pages);
                if value <= last {
                    continue;
                }
                last = value;
                debug!(document_id = %document_id, progress = value, "document progress");
                if let Err(e) = metadata
                    .update(&document_id, DocumentPatch::progress(value))
                    .await
                {
                    warn!(document_id = %document_id, error = %e, "progress write failed");
                }
                reporter.report(value).await;
            }
            last
        });
        Self { tx, handle }
    }

    pub fn sender(&self, page: u32) -> PageProgressSender {
        PageProgressSender {
            page,
            tx: self.tx.clone(),
        }
    }

    /// Stop accepting updates once every sender is gone, drain what was sent,
    /// and return the last value written.
    pub async fn finish(self) -> u8 {
        drop(self.tx);
        match self.handle.await {
            Ok(last) => last,
            Err(e) => {
                warn!(error = %e, "progress aggregator task ended abnormally");
                PAGE_BAND_START
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{DocumentRecord, InMemoryMetadataStore};
    use std::sync::Mutex;

    struct Recording(Mutex<Vec<u8>>);

    #[async_trait]
    impl ProgressReporter for Recording {
        async fn report(&self, percent: u8) {
            self.0.lock().unwrap().push(percent);
        }
    }

    #[test]
    fn band_formula() {
        assert_eq!(document_progress(&[0, 0, 0]), 10);
        assert_eq!(document_progress(&[100, 0]), 50);
        assert_eq!(document_progress(&[100, 100, 100]), 90);
        assert_eq!(document_progress(&[20]), 26);
        assert_eq!(document_progress(&[]), 10);
    }

    #[tokio::test]
    async fn aggregator_emits_strictly_increasing_values() {
        let store = Arc::new(InMemoryMetadataStore::new());
        store.insert(DocumentRecord::new("d1", "p", "a.pdf")).await.unwrap();
        store
            .update("d1", DocumentPatch::processing(10))
            .await
            .unwrap();

        let reporter = Arc::new(Recording(Mutex::new(Vec::new())));
        let agg = ProgressAggregator::spawn(
            "d1".into(),
            2,
            10,
            store.clone(),
            reporter.clone(),
        );
        let p1 = agg.sender(1);
        let p2 = agg.sender(2);
        p1.set(20);
        p2.set(20);
        // Regressions and repeats do not move document progress.
        p1.set(10);
        p2.set(20);
        p1.set(100);
        p2.set(100);
        drop((p1, p2));

        assert_eq!(agg.finish().await, 90);
        let seen = reporter.0.lock().unwrap().clone();
        assert_eq!(seen, vec![18, 26, 58, 90]);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(store.get("d1").await.unwrap().progress, 90);
    }

    #[tokio::test]
    async fn unknown_pages_are_ignored() {
        let store = Arc::new(InMemoryMetadataStore::new());
        store.insert(DocumentRecord::new("d1", "p", "a.pdf")).await.unwrap();
        store.update("d1", DocumentPatch::processing(10)).await.unwrap();
        let agg = ProgressAggregator::spawn(
            "d1".into(),
            1,
            10,
            store.clone(),
            Arc::new(NoopProgressReporter),
        );
        agg.sender(0).set(100);
        agg.sender(7).set(100);
        assert_eq!(agg.finish().await, 10);
    }
}
