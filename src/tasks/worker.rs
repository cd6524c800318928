use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, info_span, warn, Instrument};

use super::redis_queue::RedisQueue;
use super::{QueuedJob, TaskEnvelope};

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const BASE_BACKOFF: Duration = Duration::from_secs(10);
const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// Processes one task type. `Ok` acknowledges; `Err` asks for a retry.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, envelope: &TaskEnvelope) -> anyhow::Result<()>;
}

/// What the queue should do with a job after one attempt.
#[derive(Debug)]
pub enum Disposition {
    Done(QueuedJob),
    Retry { job: QueuedJob, delay: Duration },
    Dead { job: Option<QueuedJob>, reason: String },
}

/// Delay before retry number `attempt + 1`: 10s, 20s, 40s ... capped at 1h.
pub fn backoff(attempt: u32) -> Duration {
    BASE_BACKOFF
        .checked_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
        .map_or(MAX_BACKOFF, |d| d.min(MAX_BACKOFF))
}

#[derive(Default)]
pub struct Worker {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl Worker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, task_type: &str, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.insert(task_type.to_string(), handler);
        self
    }

    /// Runs one attempt of the job encoded in `raw`.
    pub async fn process(&self, raw: &str) -> Disposition {
        let mut job: QueuedJob = match serde_json::from_str(raw) {
            Ok(job) => job,
            Err(e) => {
                error!(error = %e, "undecodable job");
                return Disposition::Dead {
                    job: None,
                    reason: format!("undecodable job: {e}"),
                };
            }
        };
        let Some(handler) = self.handlers.get(&job.task_type) else {
            error!(task_type = %job.task_type, "no handler registered");
            let reason = format!("no handler for task type {}", job.task_type);
            return Disposition::Dead {
                job: Some(job),
                reason,
            };
        };

        let meta = &job.envelope.metadata;
        let span = info_span!(
            "task",
            task_type = %job.task_type,
            job_id = %meta.job_id,
            request_id = ?meta.request_id,
            user_id = ?meta.user_id,
            attempt = job.attempt,
        );
        let outcome = tokio::time::timeout(job.options.timeout(), handler.handle(&job.envelope))
            .instrument(span.clone())
            .await;

        let err = match outcome {
            Ok(Ok(())) => return Disposition::Done(job),
            Ok(Err(e)) => e,
            Err(_) => anyhow::anyhow!("task timed out after {}s", job.options.timeout_secs),
        };

        let _entered = span.enter();
        if job.attempt < job.options.max_retry {
            let delay = backoff(job.attempt);
            warn!(error = %format!("{err:#}"), retry_in = ?delay, "task failed, will retry");
            job.attempt += 1;
            Disposition::Retry { job, delay }
        } else {
            error!(error = %format!("{err:#}"), "task failed, retries exhausted");
            Disposition::Dead {
                job: Some(job),
                reason: format!("{err:#}"),
            }
        }
    }

    /// Poll loop. Run several copies for concurrency.
    pub async fn run(self: Arc<Self>, queue: RedisQueue) {
        info!("task worker started");
        loop {
            if let Err(e) = queue.promote_due().await {
                warn!(error = %e, "promoting due retries failed");
            }
            match queue.pop().await {
                Ok(Some(raw)) => {
                    let disposition = self.process(&raw).await;
                    if let Err(e) = queue.settle(disposition).await {
                        error!(error = %e, "settling job failed");
                    }
                }
                Ok(None) => tokio::time::sleep(POLL_INTERVAL).await,
                Err(e) => {
                    error!(error = %e, "queue pop failed");
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }
    }
}
