use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::context::CallContext;
use crate::reporting::ErrorReporter;

pub mod cleanup;
pub mod email;
pub mod redis_queue;
pub mod worker;

/// Tracing identifiers copied from the caller's context at dispatch time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl TaskMetadata {
    pub fn from_context(ctx: &CallContext) -> Self {
        Self {
            job_id: Uuid::new_v4().to_string(),
            request_id: ctx.request_id().map(str::to_string),
            user_id: ctx.user_id().map(|id| id.to_string()),
        }
    }
}

/// `{job_id, request_id?, user_id?, payload}` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    #[serde(flatten)]
    pub metadata: TaskMetadata,
    pub payload: Value,
}

impl TaskEnvelope {
    pub fn wrap<P: Serialize>(ctx: &CallContext, payload: &P) -> anyhow::Result<Self> {
        Ok(Self {
            metadata: TaskMetadata::from_context(ctx),
            payload: serde_json::to_value(payload).context("encode task payload")?,
        })
    }

    pub fn decode_payload<P: for<'de> Deserialize<'de>>(&self) -> anyhow::Result<P> {
        serde_json::from_value(self.payload.clone()).context("decode task payload")
    }
}

/// Retry and retention policy attached to each job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOptions {
    pub max_retry: u32,
    pub timeout_secs: u64,
    pub retention_secs: u64,
}

impl TaskOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl From<&WorkerConfig> for TaskOptions {
    fn from(cfg: &WorkerConfig) -> Self {
        Self {
            max_retry: cfg.max_retry,
            timeout_secs: cfg.task_timeout.as_secs(),
            retention_secs: cfg.retention.as_secs(),
        }
    }
}

/// What actually sits in the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    pub task_type: String,
    pub envelope: TaskEnvelope,
    pub options: TaskOptions,
    /// Failed attempts so far.
    #[serde(default)]
    pub attempt: u32,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, job: &QueuedJob) -> anyhow::Result<()>;
}

/// Fire-and-forget entry point used by services after their transaction
/// has committed.
#[derive(Clone)]
pub struct TaskDispatcher {
    queue: Arc<dyn TaskQueue>,
    reporter: Arc<dyn ErrorReporter>,
    options: TaskOptions,
}

impl TaskDispatcher {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        reporter: Arc<dyn ErrorReporter>,
        options: TaskOptions,
    ) -> Self {
        Self {
            queue,
            reporter,
            options,
        }
    }

    /// Never fails. Encoding, enqueue and deadline errors go to the reporter.
    pub async fn dispatch<P: Serialize>(&self, ctx: &CallContext, task_type: &str, payload: &P) {
        let envelope = match TaskEnvelope::wrap(ctx, payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.report(e, ctx, task_type, None);
                return;
            }
        };
        let job = QueuedJob {
            task_type: task_type.to_string(),
            envelope,
            options: self.options,
            attempt: 0,
        };

        let job_id = job.envelope.metadata.job_id.clone();
        match ctx.within(self.queue.enqueue(&job)).await {
            Ok(Ok(())) => debug!(task_type, job_id = %job_id, "task enqueued"),
            Ok(Err(e)) => self.report(e, ctx, task_type, Some(&job_id)),
            Err(deadline) => self.report(deadline.into_anyhow(), ctx, task_type, Some(&job_id)),
        }
    }

    fn report(&self, err: anyhow::Error, ctx: &CallContext, task_type: &str, job_id: Option<&str>) {
        self.reporter.capture(
            &err.context("dispatch task"),
            &json!({
                "task_type": task_type,
                "job_id": job_id,
                "request_id": ctx.request_id(),
                "user_id": ctx.user_id(),
            }),
        );
    }
}
