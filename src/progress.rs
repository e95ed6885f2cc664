//! Per-upload progress state and subscriber fan-out.
//!
//! The tracker holds an in-memory map from `upload_id` to job state. The ingestion
//! pipeline is the only writer; WebSocket handlers subscribe and receive every event in
//! issue order over a bounded per-subscriber queue. Delivery never blocks the updater:
//! a subscriber whose queue overflows is dropped and the job continues uninterrupted.
//! Late subscribers immediately receive a snapshot of the latest state. Terminal jobs
//! are retained for a TTL so stragglers can still observe the outcome, then evicted.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Queue depth per subscriber; overflow drops the subscriber, not the event.
const SUBSCRIBER_QUEUE: usize = 32;

/// Errors surfaced by tracker operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProgressError {
    /// The upload id is not (or no longer) known.
    #[error("unknown upload id")]
    Unknown,
    /// An upload with this id already exists.
    #[error("upload id already registered")]
    AlreadyExists,
    /// The job already reached a terminal state; no further updates are accepted.
    #[error("upload already finished")]
    Terminal,
}

/// Lifecycle states of an upload job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    /// Accepted, background task not yet started.
    Received,
    /// Documents are being materialized.
    Extracting,
    /// Splitting documents into chunks.
    Chunking,
    /// Enriching chunk metadata via the LLM provider.
    Enriching,
    /// Embedding and writing vectors to the store.
    Indexing,
    /// Terminal success.
    Completed,
    /// Terminal failure.
    Failed,
}

impl UploadStatus {
    /// Whether this state ends the job.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One progress event as delivered to subscribers and WebSocket clients.
#[derive(Clone, Debug, Serialize)]
pub struct ProgressEvent {
    /// Upload this event belongs to.
    pub upload_id: Uuid,
    /// Job state at the time of the event.
    pub status: UploadStatus,
    /// Monotonic completion percentage, 0–100.
    pub progress_percent: u8,
    /// Chunks processed so far in the current stage.
    pub current_chunk: usize,
    /// Total chunks known for the upload.
    pub total_chunks: usize,
    /// Human-readable stage description.
    pub message: String,
    /// RFC3339 timestamp of the event.
    pub timestamp: String,
    /// Result payload, present on `completed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure detail, present on `failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Partial mutation applied through [`ProgressTracker::update`].
#[derive(Clone, Debug, Default)]
pub struct ProgressUpdate {
    /// New lifecycle state, if it changed.
    pub status: Option<UploadStatus>,
    /// Chunks processed so far.
    pub current_chunk: Option<usize>,
    /// Total chunk count, once known.
    pub total_chunks: Option<usize>,
    /// Stage description.
    pub message: Option<String>,
    /// Explicit percentage override; recomputed from chunk counts when absent.
    pub progress_percent: Option<u8>,
}

struct UploadJob {
    status: UploadStatus,
    current_chunk: usize,
    total_chunks: usize,
    progress_percent: u8,
    message: String,
    last_update: String,
    result: Option<Value>,
    error: Option<String>,
    subscribers: Vec<mpsc::Sender<ProgressEvent>>,
}

impl UploadJob {
    fn snapshot(&self, upload_id: Uuid) -> ProgressEvent {
        ProgressEvent {
            upload_id,
            status: self.status,
            progress_percent: self.progress_percent,
            current_chunk: self.current_chunk,
            total_chunks: self.total_chunks,
            message: self.message.clone(),
            timestamp: self.last_update.clone(),
            result: self.result.clone(),
            error: self.error.clone(),
        }
    }
}

/// Thread-safe upload job registry with subscriber fan-out.
pub struct ProgressTracker {
    // Behind an inner Arc so eviction timers can outlive the borrow that spawned them.
    jobs: Arc<Mutex<HashMap<Uuid, UploadJob>>>,
    ttl: Duration,
}

impl ProgressTracker {
    /// Build a tracker retaining terminal jobs for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    /// Register a new upload in state `received`.
    pub fn create(&self, upload_id: Uuid) -> Result<(), ProgressError> {
        let mut jobs = self.jobs.lock().expect("progress lock poisoned");
        if jobs.contains_key(&upload_id) {
            return Err(ProgressError::AlreadyExists);
        }
        jobs.insert(
            upload_id,
            UploadJob {
                status: UploadStatus::Received,
                current_chunk: 0,
                total_chunks: 0,
                progress_percent: 0,
                message: "Upload received".to_string(),
                last_update: now_rfc3339(),
                result: None,
                error: None,
                subscribers: Vec::new(),
            },
        );
        Ok(())
    }

    /// Apply a partial update and fan the resulting event out to subscribers.
    ///
    /// `progress_percent` is recomputed from chunk counts unless explicitly provided,
    /// and never decreases.
    pub fn update(
        &self,
        upload_id: Uuid,
        update: ProgressUpdate,
    ) -> Result<ProgressEvent, ProgressError> {
        let mut jobs = self.jobs.lock().expect("progress lock poisoned");
        let job = jobs.get_mut(&upload_id).ok_or(ProgressError::Unknown)?;
        if job.status.is_terminal() {
            return Err(ProgressError::Terminal);
        }

        if let Some(status) = update.status {
            job.status = status;
        }
        if let Some(current) = update.current_chunk {
            job.current_chunk = current;
        }
        if let Some(total) = update.total_chunks {
            job.total_chunks = total;
        }
        if let Some(message) = update.message {
            job.message = message;
        }
        let computed = match update.progress_percent {
            Some(explicit) => explicit.min(100),
            None if job.total_chunks > 0 => {
                ((job.current_chunk * 100) / job.total_chunks).min(100) as u8
            }
            None => job.progress_percent,
        };
        job.progress_percent = job.progress_percent.max(computed);
        job.last_update = now_rfc3339();

        let event = job.snapshot(upload_id);
        deliver(job, &event);
        Ok(event)
    }

    /// Atomically transition to a terminal state, deliver the final event, and schedule
    /// eviction after the TTL.
    pub fn finish(
        &self,
        upload_id: Uuid,
        status: UploadStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<ProgressEvent, ProgressError> {
        debug_assert!(status.is_terminal());
        let event = {
            let mut jobs = self.jobs.lock().expect("progress lock poisoned");
            let job = jobs.get_mut(&upload_id).ok_or(ProgressError::Unknown)?;
            if job.status.is_terminal() {
                return Err(ProgressError::Terminal);
            }

            job.status = status;
            if matches!(status, UploadStatus::Completed) {
                job.progress_percent = 100;
                job.current_chunk = job.total_chunks;
            }
            job.result = result;
            job.error = error.clone();
            if let Some(error) = error {
                job.message = error;
            }
            job.last_update = now_rfc3339();

            let event = job.snapshot(upload_id);
            deliver(job, &event);
            // Terminal: release every subscriber so their streams end.
            job.subscribers.clear();
            event
        };

        let jobs = Arc::clone(&self.jobs);
        let ttl = self.ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let mut jobs = jobs.lock().expect("progress lock poisoned");
            if jobs.remove(&upload_id).is_some() {
                tracing::debug!(%upload_id, "Evicted terminal upload job");
            }
        });

        Ok(event)
    }

    /// Subscribe to a job's event stream.
    ///
    /// The latest known state is replayed immediately; subsequent events arrive in issue
    /// order. Subscribing to a terminal (but not yet evicted) job yields the terminal
    /// snapshot and then ends.
    pub fn subscribe(
        &self,
        upload_id: Uuid,
    ) -> Result<mpsc::Receiver<ProgressEvent>, ProgressError> {
        let mut jobs = self.jobs.lock().expect("progress lock poisoned");
        let job = jobs.get_mut(&upload_id).ok_or(ProgressError::Unknown)?;

        let (sender, receiver) = mpsc::channel(SUBSCRIBER_QUEUE);
        let snapshot = job.snapshot(upload_id);
        // The queue is empty, so the snapshot always fits.
        let _ = sender.try_send(snapshot);
        if !job.status.is_terminal() {
            job.subscribers.push(sender);
        }
        Ok(receiver)
    }

    /// Latest state snapshot without subscribing.
    pub fn peek(&self, upload_id: Uuid) -> Result<ProgressEvent, ProgressError> {
        let jobs = self.jobs.lock().expect("progress lock poisoned");
        jobs.get(&upload_id)
            .map(|job| job.snapshot(upload_id))
            .ok_or(ProgressError::Unknown)
    }
}

/// Fan an event out without blocking: slow or closed subscribers are dropped.
fn deliver(job: &mut UploadJob, event: &ProgressEvent) {
    job.subscribers.retain(|sender| {
        match sender.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(upload_id = %event.upload_id, "Dropping slow progress subscriber");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    });
}

/// RFC3339 timestamp for events and API responses.
pub(crate) fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> Arc<ProgressTracker> {
        Arc::new(ProgressTracker::new(Duration::from_millis(50)))
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let tracker = tracker();
        let id = Uuid::new_v4();
        tracker.create(id).expect("first registration");
        assert_eq!(tracker.create(id), Err(ProgressError::AlreadyExists));
    }

    #[tokio::test]
    async fn subscribers_see_events_in_issue_order() {
        let tracker = tracker();
        let id = Uuid::new_v4();
        tracker.create(id).expect("create");
        let mut stream = tracker.subscribe(id).expect("subscribe");

        // Snapshot first.
        let snapshot = stream.recv().await.expect("snapshot");
        assert_eq!(snapshot.status, UploadStatus::Received);

        tracker
            .update(
                id,
                ProgressUpdate {
                    status: Some(UploadStatus::Chunking),
                    message: Some("Splitting documents".into()),
                    ..Default::default()
                },
            )
            .expect("chunking update");
        tracker
            .update(
                id,
                ProgressUpdate {
                    status: Some(UploadStatus::Indexing),
                    total_chunks: Some(4),
                    current_chunk: Some(2),
                    ..Default::default()
                },
            )
            .expect("indexing update");

        let first = stream.recv().await.expect("first event");
        assert_eq!(first.status, UploadStatus::Chunking);
        let second = stream.recv().await.expect("second event");
        assert_eq!(second.status, UploadStatus::Indexing);
        assert_eq!(second.progress_percent, 50);
    }

    #[tokio::test]
    async fn progress_is_monotonic_non_decreasing() {
        let tracker = tracker();
        let id = Uuid::new_v4();
        tracker.create(id).expect("create");

        tracker
            .update(
                id,
                ProgressUpdate {
                    total_chunks: Some(10),
                    current_chunk: Some(8),
                    ..Default::default()
                },
            )
            .expect("advance");
        let event = tracker
            .update(
                id,
                ProgressUpdate {
                    current_chunk: Some(2),
                    ..Default::default()
                },
            )
            .expect("regress attempt");
        assert_eq!(event.progress_percent, 80);
    }

    #[tokio::test]
    async fn late_subscribers_get_current_state_then_new_events() {
        let tracker = tracker();
        let id = Uuid::new_v4();
        tracker.create(id).expect("create");
        tracker
            .update(
                id,
                ProgressUpdate {
                    status: Some(UploadStatus::Enriching),
                    total_chunks: Some(4),
                    current_chunk: Some(1),
                    ..Default::default()
                },
            )
            .expect("advance");

        let mut stream = tracker.subscribe(id).expect("late subscribe");
        let snapshot = stream.recv().await.expect("snapshot");
        assert_eq!(snapshot.status, UploadStatus::Enriching);
        assert_eq!(snapshot.progress_percent, 25);

        tracker
            .update(
                id,
                ProgressUpdate {
                    current_chunk: Some(2),
                    ..Default::default()
                },
            )
            .expect("next");
        let next = stream.recv().await.expect("next event");
        assert_eq!(next.progress_percent, 50);
    }

    #[tokio::test]
    async fn terminal_event_ends_every_stream_and_blocks_updates() {
        let tracker = tracker();
        let id = Uuid::new_v4();
        tracker.create(id).expect("create");
        let mut stream = tracker.subscribe(id).expect("subscribe");
        let _ = stream.recv().await;

        tracker
            .finish(
                id,
                UploadStatus::Completed,
                Some(serde_json::json!({ "total_vectors": 3 })),
                None,
            )
            .expect("finish");

        let terminal = stream.recv().await.expect("terminal event");
        assert_eq!(terminal.status, UploadStatus::Completed);
        assert_eq!(terminal.progress_percent, 100);
        assert!(terminal.result.is_some());
        assert!(stream.recv().await.is_none(), "stream must end after terminal");

        assert_eq!(
            tracker
                .update(id, ProgressUpdate::default())
                .expect_err("no updates after terminal"),
            ProgressError::Terminal
        );
    }

    #[tokio::test]
    async fn subscribing_after_finish_replays_terminal_snapshot() {
        let tracker = tracker();
        let id = Uuid::new_v4();
        tracker.create(id).expect("create");
        tracker
            .finish(id, UploadStatus::Failed, None, Some("boom".into()))
            .expect("finish");

        let mut stream = tracker.subscribe(id).expect("subscribe after finish");
        let snapshot = stream.recv().await.expect("terminal snapshot");
        assert_eq!(snapshot.status, UploadStatus::Failed);
        assert_eq!(snapshot.error.as_deref(), Some("boom"));
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn terminal_jobs_are_evicted_after_the_ttl() {
        let tracker = tracker();
        let id = Uuid::new_v4();
        tracker.create(id).expect("create");
        tracker
            .finish(id, UploadStatus::Completed, None, None)
            .expect("finish");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            tracker.subscribe(id).expect_err("evicted"),
            ProgressError::Unknown
        );
    }

    #[tokio::test]
    async fn slow_subscribers_are_dropped_without_stalling_the_job() {
        let tracker = tracker();
        let id = Uuid::new_v4();
        tracker.create(id).expect("create");
        // Subscribe but never drain, so the bounded queue eventually overflows.
        let stream = tracker.subscribe(id).expect("subscribe");

        for round in 0..(SUBSCRIBER_QUEUE + 4) {
            tracker
                .update(
                    id,
                    ProgressUpdate {
                        current_chunk: Some(round),
                        total_chunks: Some(SUBSCRIBER_QUEUE + 4),
                        ..Default::default()
                    },
                )
                .expect("updates keep flowing");
        }
        drop(stream);
    }
}
