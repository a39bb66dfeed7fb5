//! Debounced checkpoint writer.
//!
//! Mutations call [`AutosaveScheduler::request_save`] with the full current
//! state; rapid calls coalesce into one write after a quiet interval.
//! Navigation and the submit dialog use [`AutosaveScheduler::save_now`], and
//! submission and teardown await [`AutosaveScheduler::flush`]. At most one
//! write is in flight at any time, and writes leave in request order.
//!
//! A failed write is logged and the indicator drops back to `Unsaved`; the
//! next mutation or navigation carries the full state again.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::clock::TimeSource;
use crate::error::ApiError;
use crate::model::Checkpoint;
use crate::traits::AttemptApi;

/// Save indicator shown next to the timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SaveStatus {
    /// Nothing has been written or requested yet.
    Idle,
    /// A checkpoint is waiting for its debounce interval.
    Pending,
    /// A write is in flight.
    Saving,
    /// The latest state is durable.
    Saved { at: DateTime<Utc> },
    /// The last write failed; local state is newer than the server's.
    Unsaved,
}

/// Observable state of the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SaveReport {
    pub status: SaveStatus,
    pub last_saved_at: Option<DateTime<Utc>>,
    pub writes_ok: u64,
    pub writes_failed: u64,
}

impl Default for SaveReport {
    fn default() -> Self {
        Self {
            status: SaveStatus::Idle,
            last_saved_at: None,
            writes_ok: 0,
            writes_failed: 0,
        }
    }
}

#[derive(Default)]
struct Queue {
    pending: Option<Checkpoint>,
    due: Option<Instant>,
    /// Held during final submission so no checkpoint can land after it.
    suspended: bool,
    closed: bool,
}

struct Shared {
    api: Arc<dyn AttemptApi>,
    attempt_id: String,
    time: Arc<dyn TimeSource>,
    debounce: Duration,
    queue: Mutex<Queue>,
    wake: Notify,
    /// Single in-flight guard.
    gate: tokio::sync::Mutex<()>,
    report: watch::Sender<SaveReport>,
}

/// Owned checkpoint scheduler for one attempt.
pub struct AutosaveScheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AutosaveScheduler {
    /// Spawn the scheduler's worker on the current tokio runtime.
    pub fn spawn(
        api: Arc<dyn AttemptApi>,
        attempt_id: impl Into<String>,
        time: Arc<dyn TimeSource>,
        debounce: Duration,
    ) -> Self {
        let (report, _) = watch::channel(SaveReport::default());
        let shared = Arc::new(Shared {
            api,
            attempt_id: attempt_id.into(),
            time,
            debounce,
            queue: Mutex::new(Queue::default()),
            wake: Notify::new(),
            gate: tokio::sync::Mutex::new(()),
            report,
        });
        let worker = tokio::spawn(run(Arc::clone(&shared)));
        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queue `checkpoint`, replacing any queued one, and restart the quiet interval.
    pub fn request_save(&self, checkpoint: Checkpoint) {
        self.enqueue(checkpoint, self.shared.debounce);
    }

    /// Queue `checkpoint` for writing without waiting for the quiet interval.
    /// Returns immediately.
    pub fn save_now(&self, checkpoint: Checkpoint) {
        self.enqueue(checkpoint, Duration::ZERO);
    }

    /// Write `checkpoint` now and wait for the result.
    ///
    /// Waits for any in-flight write first; anything still queued is
    /// superseded by `checkpoint`.
    pub async fn flush(&self, checkpoint: Checkpoint) -> Result<(), ApiError> {
        let _gate = self.shared.gate.lock().await;
        {
            let mut queue = crate::lock(&self.shared.queue);
            if queue.closed {
                return Ok(());
            }
            queue.pending = None;
            queue.due = None;
        }
        self.shared.write(checkpoint).await
    }

    /// Flush `checkpoint` and hold all further checkpoint writes until
    /// [`resume`](Self::resume). Used right before the final submission.
    pub async fn flush_final(&self, checkpoint: Checkpoint) -> Result<(), ApiError> {
        crate::lock(&self.shared.queue).suspended = true;
        self.flush(checkpoint).await
    }

    /// Lift a hold placed by [`flush_final`](Self::flush_final).
    pub fn resume(&self) {
        crate::lock(&self.shared.queue).suspended = false;
        self.shared.wake.notify_one();
    }

    /// Drop anything queued and stop the worker. No write starts afterwards.
    pub fn dispose(&self) {
        {
            let mut queue = crate::lock(&self.shared.queue);
            queue.closed = true;
            queue.pending = None;
            queue.due = None;
        }
        if let Some(worker) = crate::lock(&self.worker).take() {
            worker.abort();
        }
    }

    pub fn report(&self) -> SaveReport {
        self.shared.report.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SaveReport> {
        self.shared.report.subscribe()
    }

    fn enqueue(&self, checkpoint: Checkpoint, delay: Duration) {
        {
            let mut queue = crate::lock(&self.shared.queue);
            if queue.closed {
                return;
            }
            queue.pending = Some(checkpoint);
            queue.due = Some(Instant::now() + delay);
        }
        self.shared.report.send_modify(|r| {
            if r.status != SaveStatus::Saving {
                r.status = SaveStatus::Pending;
            }
        });
        self.shared.wake.notify_one();
    }
}

impl Drop for AutosaveScheduler {
    fn drop(&mut self) {
        if let Some(worker) = crate::lock(&self.worker).take() {
            worker.abort();
        }
    }
}

impl Shared {
    /// When the worker should next write, if at all.
    fn next_due(&self) -> Option<Option<Instant>> {
        let queue = crate::lock(&self.queue);
        if queue.closed {
            return None;
        }
        if queue.suspended || queue.pending.is_none() {
            return Some(None);
        }
        Some(queue.due)
    }

    async fn write_due(&self) {
        let _gate = self.gate.lock().await;
        let checkpoint = {
            let mut queue = crate::lock(&self.queue);
            if queue.closed || queue.suspended {
                return;
            }
            if queue.due.is_some_and(|due| due > Instant::now()) {
                return;
            }
            queue.due = None;
            queue.pending.take()
        };
        if let Some(checkpoint) = checkpoint {
            // Failure is already logged and reflected in the report.
            let _ = self.write(checkpoint).await;
        }
    }

    async fn write(&self, checkpoint: Checkpoint) -> Result<(), ApiError> {
        self.report.send_modify(|r| r.status = SaveStatus::Saving);
        let result = self.api.save_checkpoint(&self.attempt_id, &checkpoint).await;
        let still_queued = crate::lock(&self.queue).pending.is_some();

        match &result {
            Ok(()) => {
                let at = self.time.now();
                tracing::debug!(attempt = %self.attempt_id, "checkpoint saved");
                self.report.send_modify(|r| {
                    r.writes_ok += 1;
                    r.last_saved_at = Some(at);
                    r.status = if still_queued {
                        SaveStatus::Pending
                    } else {
                        SaveStatus::Saved { at }
                    };
                });
            }
            Err(e) => {
                tracing::warn!(attempt = %self.attempt_id, "checkpoint write failed: {e}");
                self.report.send_modify(|r| {
                    r.writes_failed += 1;
                    r.status = SaveStatus::Unsaved;
                });
            }
        }
        result
    }
}

async fn run(shared: Arc<Shared>) {
    loop {
        match shared.next_due() {
            None => return,
            Some(None) => shared.wake.notified().await,
            Some(Some(due)) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(due) => shared.write_due().await,
                    _ = shared.wake.notified() => {}
                }
            }
        }
    }
}
