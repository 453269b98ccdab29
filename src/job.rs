// src/job.rs
use crate::{BackoffStrategy, JobContext, RelayqError, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a job
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self> {
        let uuid = s
            .parse()
            .map_err(|_| RelayqError::Worker(format!("invalid job id '{s}'")))?;
        Ok(Self(uuid))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Delayed,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobState::Pending),
            "delayed" => Ok(JobState::Delayed),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "cancelled" => Ok(JobState::Cancelled),
            other => Err(RelayqError::Worker(format!("unknown job state '{other}'"))),
        }
    }

    /// Terminal states are never claimed again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The ready index packs `priority * 2^40 + insertion seq` into a Redis
/// zset score, which is a 64-bit float. Priorities beyond this magnitude
/// would push the score past 2^53 and corrupt the insertion tie-break,
/// so enqueue clamps to this range.
pub const PRIORITY_LIMIT: i32 = 8191;

/// Job execution options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOptions {
    /// Lower values dequeue first. Clamped to `-PRIORITY_LIMIT..=PRIORITY_LIMIT`
    /// at enqueue.
    pub priority: i32,
    /// Earliest execution is `now + delay`.
    pub delay: Option<Duration>,
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    /// Random extra delay added on top of the backoff between retries.
    pub jitter_secs: u64,
    /// Handler deadline; a run past it counts as a failed attempt.
    pub timeout: Duration,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            delay: None,
            max_attempts: 3,
            backoff: BackoffStrategy::default(),
            jitter_secs: 1,
            timeout: Duration::from_secs(300),
        }
    }
}

/// A job record as stored in Redis, one hash per job.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: JobId,
    pub queue: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub state: JobState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub priority: i32,
    pub run_at: DateTime<Utc>,
    pub backoff: BackoffStrategy,
    pub jitter_secs: u64,
    pub timeout: Duration,
    pub created_at: DateTime<Utc>,
    pub lock_owner: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
}

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

impl JobRecord {
    /// Build a fresh record from producer input; state depends on whether
    /// `run_at` lies in the future.
    pub fn new(
        queue: &str,
        kind: &str,
        payload: serde_json::Value,
        options: &JobOptions,
        now: DateTime<Utc>,
    ) -> Self {
        let run_at = match options.delay {
            Some(delay) => {
                now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
            }
            None => now,
        };
        let state = if run_at > now {
            JobState::Delayed
        } else {
            JobState::Pending
        };

        Self {
            id: JobId::new(),
            queue: queue.to_string(),
            kind: kind.to_string(),
            payload,
            state,
            attempts: 0,
            max_attempts: options.max_attempts.max(1),
            priority: options.priority.clamp(-PRIORITY_LIMIT, PRIORITY_LIMIT),
            run_at,
            backoff: options.backoff.clone(),
            jitter_secs: options.jitter_secs,
            timeout: options.timeout,
            created_at: now,
            lock_owner: None,
            lock_expires_at: None,
            result: None,
            error: None,
            finished_at: None,
            cancel_requested: false,
        }
    }

    /// Field/value pairs for the initial HSET of the job hash.
    pub fn to_field_pairs(&self) -> Result<Vec<(&'static str, String)>> {
        Ok(vec![
            ("id", self.id.to_string()),
            ("queue", self.queue.clone()),
            ("kind", self.kind.clone()),
            ("payload", serde_json::to_string(&self.payload)?),
            ("state", self.state.as_str().to_string()),
            ("attempts", self.attempts.to_string()),
            ("max_attempts", self.max_attempts.to_string()),
            ("priority", self.priority.to_string()),
            ("run_at", millis(self.run_at).to_string()),
            ("backoff", serde_json::to_string(&self.backoff)?),
            ("jitter_secs", self.jitter_secs.to_string()),
            ("timeout_ms", self.timeout.as_millis().to_string()),
            ("created_at", millis(self.created_at).to_string()),
        ])
    }

    /// Reconstruct a record from an HGETALL of the job hash.
    pub fn from_hash(hash: &HashMap<String, String>) -> Result<Self> {
        fn req<'a>(hash: &'a HashMap<String, String>, field: &str) -> Result<&'a str> {
            hash.get(field)
                .map(String::as_str)
                .ok_or_else(|| RelayqError::Worker(format!("job hash missing field '{field}'")))
        }
        fn num<T: std::str::FromStr>(hash: &HashMap<String, String>, field: &str) -> Result<T> {
            req(hash, field)?
                .parse()
                .map_err(|_| RelayqError::Worker(format!("job hash field '{field}' is malformed")))
        }

        Ok(Self {
            id: JobId::parse(req(hash, "id")?)?,
            queue: req(hash, "queue")?.to_string(),
            kind: req(hash, "kind")?.to_string(),
            payload: serde_json::from_str(req(hash, "payload")?)?,
            state: JobState::parse(req(hash, "state")?)?,
            attempts: num(hash, "attempts")?,
            max_attempts: num(hash, "max_attempts")?,
            priority: num(hash, "priority")?,
            run_at: from_millis(num(hash, "run_at")?),
            backoff: serde_json::from_str(req(hash, "backoff")?)?,
            jitter_secs: num(hash, "jitter_secs")?,
            timeout: Duration::from_millis(num(hash, "timeout_ms")?),
            created_at: from_millis(num(hash, "created_at")?),
            lock_owner: hash.get("lock_owner").filter(|s| !s.is_empty()).cloned(),
            lock_expires_at: match hash.get("lock_expires_at") {
                Some(raw) if !raw.is_empty() => Some(from_millis(raw.parse().map_err(|_| {
                    RelayqError::Worker("job hash field 'lock_expires_at' is malformed".into())
                })?)),
                _ => None,
            },
            result: match hash.get("result") {
                Some(raw) if !raw.is_empty() => Some(serde_json::from_str(raw)?),
                _ => None,
            },
            error: hash.get("error").filter(|s| !s.is_empty()).cloned(),
            finished_at: match hash.get("finished_at") {
                Some(raw) if !raw.is_empty() => Some(from_millis(raw.parse().map_err(|_| {
                    RelayqError::Worker("job hash field 'finished_at' is malformed".into())
                })?)),
                _ => None,
            },
            cancel_requested: hash.get("cancel_requested").map(String::as_str) == Some("1"),
        })
    }

    /// Whether a further failed attempt should be retried rather than
    /// dead-lettered. `attempts` already counts the attempt that failed.
    pub fn should_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// The `run_at` for the next retry of this record.
    pub fn next_retry_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.backoff.delay_with_jitter(self.attempts, self.jitter_secs);
        now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

/// Core trait that all jobs must implement
#[async_trait::async_trait]
pub trait Job: Send + Sync + 'static + serde::de::DeserializeOwned + serde::Serialize {
    /// Execute the job; the returned value is persisted as the job result.
    async fn perform(&self, ctx: &JobContext) -> Result<serde_json::Value>;

    /// Job type name for registration and deserialization
    fn kind() -> &'static str
    where
        Self: Sized;

    /// Queue name for this job type
    fn queue_name() -> &'static str
    where
        Self: Sized,
    {
        "default"
    }

    /// Default options for this job type
    fn default_options() -> JobOptions
    where
        Self: Sized,
    {
        JobOptions::default()
    }
}
