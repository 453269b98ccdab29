// src/queue.rs
use crate::{
    Job, JobId, JobOptions, JobRecord, JobState, RelayqError, Result, lua::LuaScripts,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client as RedisClient};
use std::collections::HashMap;
use std::time::Duration;

/// Options for queue configuration
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub redis_url: String,
    pub key_prefix: String,
    /// How long terminal jobs stay queryable before the reaper deletes them.
    pub retention: Duration,
}

/// How many ready entries `stats` inspects when computing the age of the
/// oldest pending job.
const STATS_SCAN_WINDOW: isize = 100;

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "relayq".to_string(),
            retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Outcome of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was pending or delayed and is now cancelled.
    Cancelled,
    /// The job is active; cancellation was requested and will be honored
    /// when its lock owner reports back.
    Requested,
    /// The job had already reached a terminal state.
    AlreadyFinished,
}

/// Per-queue counters for the observability surface.
#[derive(Debug, Clone)]
pub struct QueueStats {
    pub pending: usize,
    pub delayed: usize,
    pub active: usize,
    pub failed: usize,
    pub oldest_pending_age: Option<Duration>,
}

/// Redis-backed job record store. The store is the single source of truth
/// and the only synchronization point between processes; every transition
/// runs as an atomic Lua script.
pub struct Queue {
    conn: ConnectionManager,
    options: QueueOptions,
    scripts: LuaScripts,
}

impl Queue {
    pub async fn new(options: QueueOptions) -> Result<Self> {
        let client = RedisClient::open(options.redis_url.as_str())?;
        let conn = ConnectionManager::new(client).await?;

        Ok(Self {
            conn,
            options,
            scripts: LuaScripts::new(),
        })
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    /// Enqueue a job with its type's default options
    pub async fn enqueue<T: Job>(&self, job: T) -> Result<JobId> {
        self.enqueue_with_options(job, T::default_options()).await
    }

    /// Enqueue a job with custom options
    pub async fn enqueue_with_options<T: Job>(&self, job: T, options: JobOptions) -> Result<JobId> {
        let payload = serde_json::to_value(&job)?;
        self.enqueue_raw(T::queue_name(), T::kind(), payload, options)
            .await
    }

    /// Enqueue by queue and kind string, without a typed job value. This is
    /// the path the scheduler and operator replay tooling use.
    pub async fn enqueue_raw(
        &self,
        queue: &str,
        kind: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<JobId> {
        let record = JobRecord::new(queue, kind, payload, &options, Utc::now());
        let job_id = record.id.clone();

        let mut invocation = self.scripts.enqueue.prepare_invoke();
        invocation
            .key(self.ready_key(queue))
            .key(self.delayed_key(queue))
            .key(self.seq_key(queue))
            .key(self.queues_key())
            .arg(self.job_key_prefix())
            .arg(job_id.to_string())
            .arg(queue)
            .arg(record.state.as_str())
            .arg(record.priority)
            .arg(record.run_at.timestamp_millis());
        for (field, value) in record.to_field_pairs()? {
            invocation.arg(field).arg(value);
        }

        let _: i64 = invocation.invoke_async(&mut self.conn()).await?;
        Ok(job_id)
    }

    /// Get job by ID
    pub async fn get_job(&self, job_id: &JobId) -> Result<Option<JobRecord>> {
        let mut con = self.conn();
        let hash: HashMap<String, String> = con.hgetall(self.job_key(job_id)).await?;

        if hash.is_empty() {
            return Ok(None);
        }
        JobRecord::from_hash(&hash).map(Some)
    }

    /// Claim the next eligible job across `queues`, in the given order.
    /// Eligibility and ordering are (priority, run_at, insertion order);
    /// the claim is a single compare-and-swap per queue, so no two callers
    /// ever receive the same job.
    pub async fn claim_next(
        &self,
        queues: &[String],
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<JobRecord>> {
        let now = Utc::now().timestamp_millis();

        for queue in queues {
            let claimed: Option<String> = self
                .scripts
                .claim
                .prepare_invoke()
                .key(self.ready_key(queue))
                .key(self.active_key(queue))
                .arg(self.job_key_prefix())
                .arg(now)
                .arg(worker_id)
                .arg(lease.as_millis() as i64)
                .invoke_async(&mut self.conn())
                .await?;

            if let Some(id) = claimed {
                let job_id = JobId::parse(&id)?;
                match self.get_job(&job_id).await? {
                    Some(record) => return Ok(Some(record)),
                    None => return Err(RelayqError::JobNotFound(job_id)),
                }
            }
        }

        Ok(None)
    }

    /// Extend the lease on a claimed job. Fails with `LostLock` when the
    /// lease already expired and the store reassigned the job.
    pub async fn renew_lease(
        &self,
        job_id: &JobId,
        queue: &str,
        worker_id: &str,
        lease: Duration,
    ) -> Result<()> {
        let renewed: i64 = self
            .scripts
            .renew
            .prepare_invoke()
            .key(self.active_key(queue))
            .arg(self.job_key_prefix())
            .arg(job_id.to_string())
            .arg(worker_id)
            .arg(Utc::now().timestamp_millis())
            .arg(lease.as_millis() as i64)
            .invoke_async(&mut self.conn())
            .await?;

        if renewed == 1 {
            Ok(())
        } else {
            Err(RelayqError::LostLock(job_id.clone()))
        }
    }

    /// Complete a job. Returns the resulting state: `Completed`, or
    /// `Cancelled` when a cancellation arrived while the job was active.
    pub async fn complete(
        &self,
        job_id: &JobId,
        queue: &str,
        worker_id: &str,
        result: serde_json::Value,
    ) -> Result<JobState> {
        let status: i64 = self
            .scripts
            .complete
            .prepare_invoke()
            .key(self.active_key(queue))
            .key(self.terminal_key(queue))
            .arg(self.job_key_prefix())
            .arg(job_id.to_string())
            .arg(worker_id)
            .arg(Utc::now().timestamp_millis())
            .arg(serde_json::to_string(&result)?)
            .invoke_async(&mut self.conn())
            .await?;

        match status {
            1 => Ok(JobState::Completed),
            2 => Ok(JobState::Cancelled),
            _ => Err(RelayqError::LostLock(job_id.clone())),
        }
    }

    /// Record a failed attempt for a job the caller holds the lock on.
    /// The record's own backoff policy decides between rescheduling and
    /// permanent failure.
    pub async fn fail(
        &self,
        record: &JobRecord,
        worker_id: &str,
        error: &str,
    ) -> Result<JobState> {
        let now = Utc::now();
        let (retry, next_run_at) = retry_decision(record, now);

        let status: i64 = self
            .scripts
            .fail
            .prepare_invoke()
            .key(self.active_key(&record.queue))
            .key(self.delayed_key(&record.queue))
            .key(self.dead_key(&record.queue))
            .key(self.terminal_key(&record.queue))
            .arg(self.job_key_prefix())
            .arg(record.id.to_string())
            .arg(worker_id)
            .arg(now.timestamp_millis())
            .arg(error)
            .arg(if retry { "1" } else { "0" })
            .arg(next_run_at.timestamp_millis())
            .invoke_async(&mut self.conn())
            .await?;

        match status {
            1 => Ok(JobState::Delayed),
            2 => Ok(JobState::Failed),
            3 => Ok(JobState::Cancelled),
            _ => Err(RelayqError::LostLock(record.id.clone())),
        }
    }

    /// Cancel a job by id.
    pub async fn cancel(&self, job_id: &JobId) -> Result<CancelOutcome> {
        let record = self
            .get_job(job_id)
            .await?
            .ok_or_else(|| RelayqError::JobNotFound(job_id.clone()))?;

        let status: i64 = self
            .scripts
            .cancel
            .prepare_invoke()
            .key(self.ready_key(&record.queue))
            .key(self.delayed_key(&record.queue))
            .key(self.terminal_key(&record.queue))
            .arg(self.job_key_prefix())
            .arg(job_id.to_string())
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut self.conn())
            .await?;

        match status {
            1 => Ok(CancelOutcome::Cancelled),
            2 => Ok(CancelOutcome::Requested),
            0 => Ok(CancelOutcome::AlreadyFinished),
            _ => Err(RelayqError::JobNotFound(job_id.clone())),
        }
    }

    /// Move delayed jobs whose `run_at` has passed into the ready index.
    pub async fn promote_due(&self, queue: &str, limit: usize) -> Result<usize> {
        let moved: i64 = self
            .scripts
            .promote
            .prepare_invoke()
            .key(self.delayed_key(queue))
            .key(self.ready_key(queue))
            .key(self.seq_key(queue))
            .arg(self.job_key_prefix())
            .arg(Utc::now().timestamp_millis())
            .arg(limit as i64)
            .invoke_async(&mut self.conn())
            .await?;

        Ok(moved as usize)
    }

    /// Reclaim active jobs whose lease has lapsed, counting the lapse as a
    /// failed attempt. This pass is what guarantees at-least-once
    /// execution when a worker dies mid-job.
    pub async fn sweep_expired(&self, queue: &str, limit: usize) -> Result<usize> {
        let now = Utc::now();
        let mut con = self.conn();
        let lapsed: Vec<String> = con
            .zrangebyscore_limit(
                self.active_key(queue),
                "-inf",
                now.timestamp_millis(),
                0,
                limit as isize,
            )
            .await?;

        let mut reclaimed = 0;
        for id in lapsed {
            let job_id = JobId::parse(&id)?;
            let Some(record) = self.get_job(&job_id).await? else {
                continue;
            };
            let (retry, next_run_at) = retry_decision(&record, now);

            let status: i64 = self
                .scripts
                .expire
                .prepare_invoke()
                .key(self.active_key(queue))
                .key(self.delayed_key(queue))
                .key(self.dead_key(queue))
                .key(self.terminal_key(queue))
                .arg(self.job_key_prefix())
                .arg(id.as_str())
                .arg(now.timestamp_millis())
                .arg("lease expired")
                .arg(if retry { "1" } else { "0" })
                .arg(next_run_at.timestamp_millis())
                .invoke_async(&mut self.conn())
                .await?;

            if status != 0 {
                reclaimed += 1;
            }
        }

        Ok(reclaimed)
    }

    /// Delete terminal job records older than the configured retention.
    pub async fn purge_finished(&self, queue: &str, limit: usize) -> Result<usize> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(self.options.retention)
                .unwrap_or_else(|_| ChronoDuration::zero());

        let purged: i64 = self
            .scripts
            .purge
            .prepare_invoke()
            .key(self.terminal_key(queue))
            .key(self.dead_key(queue))
            .arg(self.job_key_prefix())
            .arg(cutoff.timestamp_millis())
            .arg(limit as i64)
            .invoke_async(&mut self.conn())
            .await?;

        Ok(purged as usize)
    }

    /// All queue names that have ever seen an enqueue.
    pub async fn queue_names(&self) -> Result<Vec<String>> {
        let mut con = self.conn();
        let names: Vec<String> = con.smembers(self.queues_key()).await?;
        Ok(names)
    }

    /// Get queue statistics
    pub async fn stats(&self, queue: &str) -> Result<QueueStats> {
        let mut con = self.conn();

        let pending: usize = con.zcard(self.ready_key(queue)).await?;
        let delayed: usize = con.zcard(self.delayed_key(queue)).await?;
        let active: usize = con.zcard(self.active_key(queue)).await?;
        let failed: usize = con.llen(self.dead_key(queue)).await?;

        // The ready index orders by (priority, insertion), so its head is
        // the next job to dequeue, not the oldest one waiting. Scan a
        // bounded window and take the minimum created_at instead.
        let head: Vec<String> = con
            .zrange(self.ready_key(queue), 0, STATS_SCAN_WINDOW - 1)
            .await?;
        let now_ms = Utc::now().timestamp_millis();
        let mut oldest_ms: Option<i64> = None;
        for id in &head {
            let created: Option<i64> = con
                .hget(format!("{}{}", self.job_key_prefix(), id), "created_at")
                .await?;
            if let Some(ms) = created {
                oldest_ms = Some(oldest_ms.map_or(ms, |seen| seen.min(ms)));
            }
        }
        let oldest_pending_age =
            oldest_ms.map(|ms| Duration::from_millis(now_ms.saturating_sub(ms).max(0) as u64));

        Ok(QueueStats {
            pending,
            delayed,
            active,
            failed,
            oldest_pending_age,
        })
    }

    // Redis key helpers
    fn job_key_prefix(&self) -> String {
        format!("{}:job:", self.options.key_prefix)
    }

    fn job_key(&self, job_id: &JobId) -> String {
        format!("{}:job:{}", self.options.key_prefix, job_id)
    }

    fn ready_key(&self, queue: &str) -> String {
        format!("{}:queue:{}:ready", self.options.key_prefix, queue)
    }

    fn delayed_key(&self, queue: &str) -> String {
        format!("{}:queue:{}:delayed", self.options.key_prefix, queue)
    }

    fn active_key(&self, queue: &str) -> String {
        format!("{}:queue:{}:active", self.options.key_prefix, queue)
    }

    fn dead_key(&self, queue: &str) -> String {
        format!("{}:queue:{}:dead", self.options.key_prefix, queue)
    }

    fn terminal_key(&self, queue: &str) -> String {
        format!("{}:queue:{}:terminal", self.options.key_prefix, queue)
    }

    fn seq_key(&self, queue: &str) -> String {
        format!("{}:queue:{}:seq", self.options.key_prefix, queue)
    }

    fn queues_key(&self) -> String {
        format!("{}:queues", self.options.key_prefix)
    }
}

/// Whether a failed attempt is retried, and when. `attempts` on the record
/// already includes the attempt that just failed.
fn retry_decision(record: &JobRecord, now: DateTime<Utc>) -> (bool, DateTime<Utc>) {
    if record.should_retry() {
        (true, record.next_retry_at(now))
    } else {
        (false, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JobOptions;

    #[test]
    fn retry_decision_respects_attempt_ceiling() {
        let now = Utc::now();
        let mut record = JobRecord::new(
            "default",
            "noop",
            serde_json::Value::Null,
            &JobOptions {
                max_attempts: 2,
                jitter_secs: 0,
                ..Default::default()
            },
            now,
        );

        record.attempts = 1;
        let (retry, at) = retry_decision(&record, now);
        assert!(retry);
        assert!(at > now);

        record.attempts = 2;
        let (retry, _) = retry_decision(&record, now);
        assert!(!retry);
    }

    #[test]
    fn retry_delays_grow_with_attempts() {
        let now = Utc::now();
        let mut record = JobRecord::new(
            "default",
            "noop",
            serde_json::Value::Null,
            &JobOptions {
                max_attempts: 10,
                jitter_secs: 0,
                ..Default::default()
            },
            now,
        );

        let mut previous = now;
        for attempts in 1..6 {
            record.attempts = attempts;
            let (_, at) = retry_decision(&record, now);
            assert!(at >= previous, "delay regressed at attempt {attempts}");
            previous = at;
        }
    }
}
