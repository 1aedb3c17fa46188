//! In-process queue for development and tests.

use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, warn, Instrument};

use crate::config::QueueConfig;
use crate::error::ControlResult;

use super::{retry_delay, InsertResult, JobQueue, QueueHandler, QueueJob};

#[derive(Debug)]
struct Entry {
    id: i64,
    key: String,
    job: QueueJob,
    attempt: u32,
    run_at: Instant,
    running: bool,
}

#[derive(Debug, Default)]
struct State {
    next_id: i64,
    pending: Vec<Entry>,
    completed: u64,
    failed: u64,
}

/// Counters of a [`MemoryQueue`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub completed: u64,
    pub failed: u64,
}

/// Queue held in process memory. Jobs are lost on restart.
#[derive(Clone)]
pub struct MemoryQueue {
    state: Arc<Mutex<State>>,
    wake: Arc<Notify>,
    handler: Arc<dyn QueueHandler>,
    config: QueueConfig,
}

impl MemoryQueue {
    pub fn new(handler: Arc<dyn QueueHandler>, config: QueueConfig) -> Self {
        Self {
            state: Arc::default(),
            wake: Arc::new(Notify::new()),
            handler,
            config,
        }
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        QueueStats {
            pending: state.pending.len(),
            completed: state.completed,
            failed: state.failed,
        }
    }

    async fn claim(&self) -> Option<(i64, QueueJob, u32)> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let entry = state
            .pending
            .iter_mut()
            .filter(|entry| !entry.running && entry.run_at <= now)
            .min_by_key(|entry| entry.id)?;
        entry.running = true;
        entry.attempt = entry.attempt.saturating_add(1);
        Some((entry.id, entry.job.clone(), entry.attempt))
    }

    async fn process(&self, id: i64, job: QueueJob, attempt: u32) {
        let result = self.handler.handle(&job).await;

        let mut state = self.state.lock().await;
        let Some(index) = state.pending.iter().position(|entry| entry.id == id) else {
            return;
        };

        match result {
            Ok(()) => {
                state.pending.remove(index);
                state.completed = state.completed.saturating_add(1);
                counter!("tessera.queue.jobs", "kind" => job.kind(), "outcome" => "ok").increment(1);
                debug!(attempt, "job completed");
            }
            Err(e) if attempt >= self.config.max_attempts => {
                state.pending.remove(index);
                state.failed = state.failed.saturating_add(1);
                counter!("tessera.queue.jobs", "kind" => job.kind(), "outcome" => "failed")
                    .increment(1);
                error!(attempt, error = %e, "job failed permanently");
            }
            Err(e) => {
                let delay = retry_delay(self.config.retry_delay(), attempt);
                if let Some(entry) = state.pending.get_mut(index) {
                    entry.running = false;
                    entry.run_at = Instant::now() + delay;
                }
                counter!("tessera.queue.jobs", "kind" => job.kind(), "outcome" => "retry")
                    .increment(1);
                warn!(attempt, retry_in = ?delay, error = %e, "job failed, will retry");
            }
        }
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn migrate(&self) -> ControlResult<()> {
        Ok(())
    }

    async fn enqueue(&self, job: QueueJob) -> ControlResult<InsertResult> {
        let key = job.unique_key();
        let mut state = self.state.lock().await;

        if let Some(existing) = state.pending.iter().find(|entry| entry.key == key) {
            return Ok(InsertResult {
                id: existing.id,
                duplicate: true,
            });
        }

        state.next_id = state.next_id.saturating_add(1);
        let id = state.next_id;
        state.pending.push(Entry {
            id,
            key,
            job,
            attempt: 0,
            run_at: Instant::now(),
            running: false,
        });
        drop(state);

        self.wake.notify_one();
        Ok(InsertResult {
            id,
            duplicate: false,
        })
    }

    async fn work(&self, cancel: CancellationToken) -> ControlResult<()> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            match self.claim().await {
                Some((id, job, attempt)) => {
                    let span = info_span!("queue_job", id, kind = job.kind());
                    self.process(id, job, attempt).instrument(span).await;
                }
                None => {
                    tokio::select! {
                        () = cancel.cancelled() => return Ok(()),
                        () = self.wake.notified() => {}
                        () = tokio::time::sleep(self.config.poll_interval()) => {}
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for MemoryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryQueue")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
