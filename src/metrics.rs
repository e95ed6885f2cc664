//! Lightweight ingestion counters used for diagnostics.
//!
//! The `PipelineMetrics` type exposes lock-free counters that track:
//! - Documents ingested
//! - Chunks produced (cumulative)
//! - Vectors indexed (cumulative)
//! - Uploads completed / failed
//!
//! The snapshot is surfaced via `GET /stats` alongside vector-store and rate-limiter
//! statistics so operators can watch ingestion activity without extra tooling.

use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters describing ingestion activity.
///
/// The struct intentionally stays minimal, just atomic counters, so it can be shared freely
/// and queried without holding locks.
#[derive(Default)]
pub struct PipelineMetrics {
    documents_ingested: AtomicU64,
    chunks_produced: AtomicU64,
    vectors_indexed: AtomicU64,
    uploads_completed: AtomicU64,
    uploads_failed: AtomicU64,
}

impl PipelineMetrics {
    /// Create an empty metrics accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successfully completed upload and its totals.
    pub fn record_completed(&self, documents: u64, chunks: u64, vectors: u64) {
        self.documents_ingested.fetch_add(documents, Ordering::Relaxed);
        self.chunks_produced.fetch_add(chunks, Ordering::Relaxed);
        self.vectors_indexed.fetch_add(vectors, Ordering::Relaxed);
        self.uploads_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an upload that terminated in failure.
    pub fn record_failed(&self) {
        self.uploads_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Return a snapshot of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            documents_ingested: self.documents_ingested.load(Ordering::Relaxed),
            chunks_produced: self.chunks_produced.load(Ordering::Relaxed),
            vectors_indexed: self.vectors_indexed.load(Ordering::Relaxed),
            uploads_completed: self.uploads_completed.load(Ordering::Relaxed),
            uploads_failed: self.uploads_failed.load(Ordering::Relaxed),
        }
    }
}

/// Immutable view of ingestion counters used for reporting.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Number of documents ingested since startup.
    pub documents_ingested: u64,
    /// Total chunk count produced across all uploads.
    pub chunks_produced: u64,
    /// Total vectors written to the store across all uploads.
    pub vectors_indexed: u64,
    /// Uploads that reached the `completed` state.
    pub uploads_completed: u64,
    /// Uploads that reached the `failed` state.
    pub uploads_failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_completed_uploads() {
        let metrics = PipelineMetrics::new();
        metrics.record_completed(1, 4, 4);
        metrics.record_completed(2, 6, 5);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.documents_ingested, 3);
        assert_eq!(snapshot.chunks_produced, 10);
        assert_eq!(snapshot.vectors_indexed, 9);
        assert_eq!(snapshot.uploads_completed, 2);
        assert_eq!(snapshot.uploads_failed, 0);
    }

    #[test]
    fn records_failures_independently() {
        let metrics = PipelineMetrics::new();
        metrics.record_failed();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.uploads_failed, 1);
        assert_eq!(snapshot.uploads_completed, 0);
    }
}
