// src/scheduler.rs
use crate::{JobOptions, Queue, RelayqError, Result};
use chrono::{DateTime, TimeZone, Utc};
use cron::Schedule;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client as RedisClient};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::broadcast;
use tokio::time::{Duration, interval};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A recurring trigger, shared by every scheduler instance through the
/// store.
#[derive(Debug, Clone)]
pub struct ScheduleDefinition {
    pub id: String,
    pub queue: String,
    pub kind: String,
    /// Payload template enqueued verbatim on each fire.
    pub payload: serde_json::Value,
    pub cron: String,
    pub next_run_at: DateTime<Utc>,
}

impl ScheduleDefinition {
    fn from_hash(hash: &HashMap<String, String>) -> Result<Self> {
        fn req<'a>(hash: &'a HashMap<String, String>, field: &str) -> Result<&'a str> {
            hash.get(field).map(String::as_str).ok_or_else(|| {
                RelayqError::Worker(format!("schedule hash missing field '{field}'"))
            })
        }

        let next_run_ms: i64 = req(hash, "next_run_at")?
            .parse()
            .map_err(|_| RelayqError::Worker("schedule next_run_at is malformed".into()))?;

        Ok(Self {
            id: req(hash, "id")?.to_string(),
            queue: req(hash, "queue")?.to_string(),
            kind: req(hash, "kind")?.to_string(),
            payload: serde_json::from_str(req(hash, "payload")?)?,
            cron: req(hash, "cron")?.to_string(),
            next_run_at: Utc
                .timestamp_millis_opt(next_run_ms)
                .single()
                .unwrap_or_default(),
        })
    }
}

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    /// TTL of the per-tick lock; long enough for the winner to enqueue,
    /// short enough not to shadow the next tick.
    pub lock_ttl: Duration,
    /// Ticks older than this are skipped rather than fired late; recurring
    /// jobs are never queued retroactively.
    pub missed_tick_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            lock_ttl: Duration::from_secs(60),
            missed_tick_grace: Duration::from_secs(60),
        }
    }
}

/// Scheduler statistics.
#[derive(Debug, Clone)]
pub struct SchedulerStats {
    pub id: String,
    pub fired: u64,
    pub skipped_ticks: u64,
    pub running: bool,
}

/// Fires recurring schedules exactly once per tick across any number of
/// redundant processes. There is no standing leader: every instance runs
/// the same loop and a short-lived lock keyed on `(schedule, tick)`
/// decides who enqueues. Losing that race is the normal case for all but
/// one instance and is not an error.
pub struct Scheduler {
    id: String,
    queue: Arc<Queue>,
    config: SchedulerConfig,
    conn: ConnectionManager,
    key_prefix: String,
    shutdown_tx: broadcast::Sender<()>,
    running: Arc<AtomicBool>,
    fired: Arc<AtomicU64>,
    skipped_ticks: Arc<AtomicU64>,
}

impl Scheduler {
    pub async fn new(queue: Arc<Queue>, config: SchedulerConfig) -> Result<Self> {
        let client = RedisClient::open(queue.options().redis_url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        let key_prefix = queue.options().key_prefix.clone();
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            id: format!("scheduler-{}", Uuid::new_v4()),
            queue,
            config,
            conn,
            key_prefix,
            shutdown_tx,
            running: Arc::new(AtomicBool::new(false)),
            fired: Arc::new(AtomicU64::new(0)),
            skipped_ticks: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        SchedulerStats {
            id: self.id.clone(),
            fired: self.fired.load(Ordering::Relaxed),
            skipped_ticks: self.skipped_ticks.load(Ordering::Relaxed),
            running: self.running.load(Ordering::SeqCst),
        }
    }

    /// Register (or update) a recurring schedule in the store, visible to
    /// every scheduler instance. `next_run_at` is only initialized when
    /// absent, so re-registration on restart does not reset the cadence.
    pub async fn register_schedule(
        &self,
        id: &str,
        cron_expr: &str,
        queue: &str,
        kind: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        let schedule = parse_cron(cron_expr)?;
        let first_run = next_fire_after(&schedule, Utc::now()).ok_or_else(|| {
            RelayqError::InvalidCron(cron_expr.to_string(), "schedule never fires".to_string())
        })?;

        let mut conn = self.conn.clone();
        let key = self.schedule_key(id);

        let _: () = conn
            .hset_multiple(
                &key,
                &[
                    ("id", id.to_string()),
                    ("queue", queue.to_string()),
                    ("kind", kind.to_string()),
                    ("payload", serde_json::to_string(&payload)?),
                    ("cron", cron_expr.to_string()),
                ],
            )
            .await?;
        let _: bool = conn
            .hset_nx(&key, "next_run_at", first_run.timestamp_millis())
            .await?;
        let _: () = conn.sadd(self.schedules_key(), id).await?;

        info!(schedule_id = %id, cron = %cron_expr, queue = %queue, kind = %kind, "registered schedule");
        Ok(())
    }

    /// Remove a schedule; in-flight jobs it already enqueued are untouched.
    pub async fn unregister_schedule(&self, id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.srem(self.schedules_key(), id).await?;
        let _: () = conn.del(self.schedule_key(id)).await?;
        info!(schedule_id = %id, "unregistered schedule");
        Ok(())
    }

    pub async fn list_schedules(&self) -> Result<Vec<ScheduleDefinition>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(self.schedules_key()).await?;

        let mut schedules = Vec::with_capacity(ids.len());
        for id in ids {
            let hash: HashMap<String, String> = conn.hgetall(self.schedule_key(&id)).await?;
            if !hash.is_empty() {
                schedules.push(ScheduleDefinition::from_hash(&hash)?);
            }
        }
        Ok(schedules)
    }

    /// Run the scheduler loop until `stop` is called.
    pub async fn run(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(RelayqError::Worker("scheduler already running".to_string()));
        }

        info!(scheduler_id = %self.id, "starting scheduler");

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut ticker = interval(self.config.poll_interval);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(scheduler_id = %self.id, "scheduler shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.fire_due_schedules().await {
                        error!(error = %e, "scheduler pass failed");
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// One scheduling pass: fire every due schedule whose per-tick lock we
    /// win. Public so embedders can drive the cadence themselves.
    pub async fn fire_due_schedules(&self) -> Result<usize> {
        let now = Utc::now();
        let mut fired = 0;

        for definition in self.list_schedules().await? {
            if definition.next_run_at > now {
                continue;
            }
            if self.fire_one(&definition, now).await? {
                fired += 1;
            }
        }

        Ok(fired)
    }

    async fn fire_one(&self, definition: &ScheduleDefinition, now: DateTime<Utc>) -> Result<bool> {
        let tick = definition.next_run_at;

        // Single conditional write decides the winner for this tick.
        if !self.acquire_tick_lock(&definition.id, tick).await? {
            debug!(schedule_id = %definition.id, %tick, "lost tick lock; another instance fires");
            return Ok(false);
        }

        let schedule = parse_cron(&definition.cron)?;
        let next = next_fire_after(&schedule, std::cmp::max(now, tick)).ok_or_else(|| {
            RelayqError::InvalidCron(definition.cron.clone(), "schedule never fires".to_string())
        })?;

        // Advance before enqueuing: a crash between the two skips a tick,
        // which the skip-missed-ticks policy already tolerates. The other
        // order could fire the same tick twice once the lock lapses.
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(
                self.schedule_key(&definition.id),
                "next_run_at",
                next.timestamp_millis(),
            )
            .await?;

        if tick_is_stale(tick, now, self.config.missed_tick_grace) {
            self.skipped_ticks.fetch_add(1, Ordering::Relaxed);
            warn!(schedule_id = %definition.id, %tick, "tick window closed; skipping, not backfilling");
            return Ok(false);
        }

        let job_id = self
            .queue
            .enqueue_raw(
                &definition.queue,
                &definition.kind,
                definition.payload.clone(),
                JobOptions::default(),
            )
            .await?;

        self.fired.fetch_add(1, Ordering::Relaxed);
        info!(
            schedule_id = %definition.id,
            %job_id,
            %tick,
            next_run_at = %next,
            "fired recurring schedule"
        );
        Ok(true)
    }

    async fn acquire_tick_lock(&self, schedule_id: &str, tick: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.conn.clone();
        let key = self.tick_lock_key(schedule_id, tick);
        let ttl_secs = self.config.lock_ttl.as_secs().max(1);

        let acquired: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(&self.id)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;

        Ok(acquired.is_some())
    }

    fn schedules_key(&self) -> String {
        format!("{}:schedules", self.key_prefix)
    }

    fn schedule_key(&self, id: &str) -> String {
        format!("{}:schedule:{}", self.key_prefix, id)
    }

    fn tick_lock_key(&self, id: &str, tick: DateTime<Utc>) -> String {
        format!(
            "{}:schedule:{}:lock:{}",
            self.key_prefix,
            id,
            tick.timestamp_millis()
        )
    }
}

fn parse_cron(expr: &str) -> Result<Schedule> {
    Schedule::from_str(expr)
        .map_err(|e| RelayqError::InvalidCron(expr.to_string(), e.to_string()))
}

fn next_fire_after(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

/// A tick whose window has closed is skipped, never fired late.
fn tick_is_stale(tick: DateTime<Utc>, now: DateTime<Utc>, grace: Duration) -> bool {
    now.signed_duration_since(tick)
        > chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::seconds(60))
}
