use anyhow::Context;
use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};
use serde_json::json;
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use super::worker::Disposition;
use super::{QueuedJob, TaskQueue};

const DEFAULT_PREFIX: &str = "authcore:tasks:";
/// Retention for jobs whose options could not be decoded.
const FALLBACK_RETENTION_SECS: u64 = 24 * 60 * 60;

/// Durable queue on Redis.
///
/// `{prefix}ready` is a list of encoded jobs, `{prefix}scheduled` a sorted
/// set of retries scored by due unix time, and `{prefix}result:{job_id}`
/// keeps finished or dead jobs for the retention window.
#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisQueue {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url).context("invalid REDIS_URL")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("connect to redis")?;
        Ok(Self {
            conn,
            prefix: DEFAULT_PREFIX.to_string(),
        })
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}{}", self.prefix, suffix)
    }

    pub async fn pop(&self) -> anyhow::Result<Option<String>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .lpop(self.key("ready"), None)
            .await
            .context("pop ready job")?;
        Ok(raw)
    }

    /// Moves retries whose time has come back onto the ready list.
    pub async fn promote_due(&self) -> anyhow::Result<usize> {
        let mut conn = self.conn.clone();
        let scheduled = self.key("scheduled");
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let due: Vec<String> = conn
            .zrangebyscore(&scheduled, "-inf", now)
            .await
            .context("read due retries")?;

        let mut promoted = 0;
        for raw in due {
            // Only the worker that removed the member may push it.
            let removed: i64 = conn.zrem(&scheduled, &raw).await.context("claim retry")?;
            if removed == 1 {
                let _: () = conn
                    .rpush(self.key("ready"), &raw)
                    .await
                    .context("requeue retry")?;
                promoted += 1;
            }
        }
        if promoted > 0 {
            debug!(promoted, "retries promoted");
        }
        Ok(promoted)
    }

    pub async fn settle(&self, disposition: Disposition) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        match disposition {
            Disposition::Done(job) => {
                let record = json!({ "state": "completed", "job": job });
                self.keep_result(&job.envelope.metadata.job_id, &record, job.options.retention_secs)
                    .await
            }
            Disposition::Retry { job, delay } => {
                let due = OffsetDateTime::now_utc().unix_timestamp() + delay.as_secs() as i64;
                let raw = serde_json::to_string(&job).context("encode job")?;
                let _: () = conn
                    .zadd(self.key("scheduled"), raw, due)
                    .await
                    .context("schedule retry")?;
                Ok(())
            }
            Disposition::Dead { job, reason } => {
                let (job_id, retention) = match &job {
                    Some(job) => (job.envelope.metadata.job_id.clone(), job.options.retention_secs),
                    None => (Uuid::new_v4().to_string(), FALLBACK_RETENTION_SECS),
                };
                let record = json!({ "state": "dead", "reason": reason, "job": job });
                self.keep_result(&job_id, &record, retention).await
            }
        }
    }

    async fn keep_result(
        &self,
        job_id: &str,
        record: &serde_json::Value,
        retention_secs: u64,
    ) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(
                self.key(&format!("result:{job_id}")),
                record.to_string(),
                retention_secs.max(1),
            )
            .await
            .context("store job result")?;
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for RedisQueue {
    async fn enqueue(&self, job: &QueuedJob) -> anyhow::Result<()> {
        let raw = serde_json::to_string(job).context("encode job")?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .rpush(self.key("ready"), raw)
            .await
            .context("enqueue job")?;
        Ok(())
    }
}
