//! Integration tests against a live Redis.
//!
//! Each test isolates itself under a unique key prefix, so a shared Redis
//! is safe. Run with:
//!
//! ```sh
//! REDIS_URL=redis://127.0.0.1:6379 cargo test -- --ignored
//! ```

use relayq::{
    AppContext, CancelOutcome, Job, JobContext, JobOptions, JobRegistry, JobState, Queue,
    QueueOptions, RelayqError, Result, Scheduler, SchedulerConfig, WorkerBuilder, async_trait,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use uuid::Uuid;

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

fn isolated_options() -> QueueOptions {
    QueueOptions {
        redis_url: redis_url(),
        key_prefix: format!("relayq-test-{}", Uuid::new_v4()),
        ..Default::default()
    }
}

async fn isolated_queue() -> Queue {
    Queue::new(isolated_options()).await.expect("redis reachable")
}

fn no_jitter() -> JobOptions {
    JobOptions {
        jitter_secs: 0,
        ..Default::default()
    }
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn claims_follow_priority_then_insertion_order() {
    let queue = isolated_queue().await;
    let queues = vec!["orders".to_string()];

    let mut ids = Vec::new();
    for priority in [3, 1, 2, 1, 5] {
        let options = JobOptions {
            priority,
            ..no_jitter()
        };
        let id = queue
            .enqueue_raw("orders", "noop", serde_json::json!({"p": priority}), options)
            .await
            .unwrap();
        ids.push(id);
    }

    let mut claimed_priorities = Vec::new();
    let mut claimed_ids = Vec::new();
    while let Some(record) = queue
        .claim_next(&queues, "w1", Duration::from_secs(30))
        .await
        .unwrap()
    {
        claimed_priorities.push(record.priority);
        claimed_ids.push(record.id);
    }

    assert_eq!(claimed_priorities, vec![1, 1, 2, 3, 5]);
    // the two priority-1 jobs keep their insertion order
    assert_eq!(claimed_ids[0], ids[1]);
    assert_eq!(claimed_ids[1], ids[3]);
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn failing_job_walks_backoff_then_dead_letters() {
    let queue = isolated_queue().await;
    let queues = vec!["emails".to_string()];
    let options = JobOptions {
        max_attempts: 3,
        ..no_jitter()
    };

    let job_id = queue
        .enqueue_raw("emails", "send_email", serde_json::json!({}), options)
        .await
        .unwrap();

    let mut previous_delay = chrono::Duration::zero();
    for attempt in 1..=3u32 {
        let record = loop {
            promote_all(&queue, "emails").await;
            if let Some(record) = queue
                .claim_next(&queues, "w1", Duration::from_secs(30))
                .await
                .unwrap()
            {
                break record;
            }
            // retry is parked in the delayed index; pull run_at forward
            rewind_delayed(&queue.options().key_prefix, "emails").await;
        };
        assert_eq!(record.attempts, attempt);

        let before = chrono::Utc::now();
        let state = queue.fail(&record, "w1", "smtp unreachable").await.unwrap();

        if attempt < 3 {
            assert_eq!(state, JobState::Delayed);
            let stored = queue.get_job(&job_id).await.unwrap().unwrap();
            let delay = stored.run_at.signed_duration_since(before);
            assert!(delay >= previous_delay, "backoff shrank on attempt {attempt}");
            previous_delay = delay;
        } else {
            assert_eq!(state, JobState::Failed);
        }
    }

    let stored = queue.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Failed);
    assert_eq!(stored.error.as_deref(), Some("smtp unreachable"));

    // dead-lettered jobs are never claimed again
    promote_all(&queue, "emails").await;
    assert!(queue
        .claim_next(&queues, "w1", Duration::from_secs(30))
        .await
        .unwrap()
        .is_none());
}

async fn promote_all(queue: &Queue, name: &str) {
    queue.promote_due(name, 100).await.unwrap();
}

/// Pull every delayed job's score (run_at) back to now so the next
/// promote pass moves it, without waiting out real backoff.
async fn rewind_delayed(prefix: &str, queue_name: &str) {
    let client = redis::Client::open(redis_url()).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    let delayed_key = format!("{prefix}:queue:{queue_name}:delayed");
    let now = chrono::Utc::now().timestamp_millis();

    let ids: Vec<String> = redis::AsyncCommands::zrange(&mut conn, &delayed_key, 0, -1)
        .await
        .unwrap();
    for id in ids {
        let _: () = redis::AsyncCommands::zadd(&mut conn, &delayed_key, &id, now)
            .await
            .unwrap();
        let _: () = redis::AsyncCommands::hset(
            &mut conn,
            format!("{prefix}:job:{id}"),
            "run_at",
            now,
        )
        .await
        .unwrap();
    }
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn lapsed_lease_is_reclaimed_only_after_expiry() {
    let queue = isolated_queue().await;
    let queues = vec!["default".to_string()];

    queue
        .enqueue_raw("default", "noop", serde_json::Value::Null, no_jitter())
        .await
        .unwrap();

    let record = queue
        .claim_next(&queues, "crashed-worker", Duration::from_millis(500))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.state, JobState::Active);

    // before expiry: nothing to reclaim, job is not claimable
    assert_eq!(queue.sweep_expired("default", 100).await.unwrap(), 0);
    assert!(queue
        .claim_next(&queues, "w2", Duration::from_secs(5))
        .await
        .unwrap()
        .is_none());

    tokio::time::sleep(Duration::from_millis(600)).await;

    // after expiry: exactly one reclaim, counted as a failed attempt
    assert_eq!(queue.sweep_expired("default", 100).await.unwrap(), 1);
    assert_eq!(queue.sweep_expired("default", 100).await.unwrap(), 0);

    let stored = queue.get_job(&record.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Delayed);
    assert_eq!(stored.error.as_deref(), Some("lease expired"));

    rewind_delayed(&queue.options().key_prefix, "default").await;
    promote_all(&queue, "default").await;
    let reclaimed = queue
        .claim_next(&queues, "w2", Duration::from_secs(5))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reclaimed.id, record.id);
    assert_eq!(reclaimed.attempts, 2);
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn renewed_lease_is_not_swept() {
    let queue = isolated_queue().await;
    let queues = vec!["default".to_string()];

    queue
        .enqueue_raw("default", "noop", serde_json::Value::Null, no_jitter())
        .await
        .unwrap();
    let record = queue
        .claim_next(&queues, "w1", Duration::from_millis(800))
        .await
        .unwrap()
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    queue
        .renew_lease(&record.id, "default", "w1", Duration::from_millis(800))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    // original lease would have lapsed by now; the renewal keeps it held
    assert_eq!(queue.sweep_expired("default", 100).await.unwrap(), 0);

    // and a stranger cannot renew or complete it
    let err = queue
        .renew_lease(&record.id, "default", "impostor", Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, RelayqError::LostLock(_)));
    let err = queue
        .complete(&record.id, "default", "impostor", serde_json::Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(err, RelayqError::LostLock(_)));
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn concurrent_claims_never_share_a_job() {
    let queue = Arc::new(isolated_queue().await);
    let queues = vec!["default".to_string()];

    let total = 50;
    for i in 0..total {
        queue
            .enqueue_raw("default", "noop", serde_json::json!({"i": i}), no_jitter())
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for worker in 0..8 {
        let queue = Arc::clone(&queue);
        let queues = queues.clone();
        handles.push(tokio::spawn(async move {
            let worker_id = format!("w{worker}");
            let mut claimed = Vec::new();
            while let Some(record) = queue
                .claim_next(&queues, &worker_id, Duration::from_secs(30))
                .await
                .unwrap()
            {
                claimed.push(record.id);
            }
            claimed
        }));
    }

    let mut seen = HashSet::new();
    let mut count = 0;
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id), "job claimed twice");
            count += 1;
        }
    }
    assert_eq!(count, total);
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn cancellation_semantics() {
    let queue = isolated_queue().await;
    let queues = vec!["default".to_string()];

    // pending: cancelled immediately, never claimed
    let pending = queue
        .enqueue_raw("default", "noop", serde_json::Value::Null, no_jitter())
        .await
        .unwrap();
    assert_eq!(queue.cancel(&pending).await.unwrap(), CancelOutcome::Cancelled);
    assert!(queue
        .claim_next(&queues, "w1", Duration::from_secs(5))
        .await
        .unwrap()
        .is_none());
    let stored = queue.get_job(&pending).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Cancelled);

    // active: cancellation is requested, and the reported result is discarded
    let active = queue
        .enqueue_raw("default", "noop", serde_json::Value::Null, no_jitter())
        .await
        .unwrap();
    let record = queue
        .claim_next(&queues, "w1", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.id, active);
    assert_eq!(queue.cancel(&active).await.unwrap(), CancelOutcome::Requested);

    let state = queue
        .complete(&active, "default", "w1", serde_json::json!({"ok": true}))
        .await
        .unwrap();
    assert_eq!(state, JobState::Cancelled);
    let stored = queue.get_job(&active).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Cancelled);
    assert!(stored.result.is_none());

    // terminal: cancel is a no-op
    assert_eq!(
        queue.cancel(&active).await.unwrap(),
        CancelOutcome::AlreadyFinished
    );
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn completed_jobs_keep_their_result() {
    let queue = isolated_queue().await;
    let queues = vec!["default".to_string()];

    let job_id = queue
        .enqueue_raw("default", "noop", serde_json::Value::Null, no_jitter())
        .await
        .unwrap();
    let record = queue
        .claim_next(&queues, "w1", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();

    let state = queue
        .complete(&record.id, "default", "w1", serde_json::json!({"rows": 42}))
        .await
        .unwrap();
    assert_eq!(state, JobState::Completed);

    let stored = queue.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Completed);
    assert_eq!(stored.result, Some(serde_json::json!({"rows": 42})));
    assert!(stored.finished_at.is_some());
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn retention_purges_only_terminal_jobs_past_the_window() {
    let options = QueueOptions {
        retention: Duration::from_secs(1),
        ..isolated_options()
    };
    let queue = Queue::new(options).await.unwrap();
    let queues = vec!["default".to_string()];

    // one completed and one dead-lettered job, both about to age out
    let completed = queue
        .enqueue_raw("default", "noop", serde_json::Value::Null, no_jitter())
        .await
        .unwrap();
    let record = queue
        .claim_next(&queues, "w1", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    queue
        .complete(&record.id, "default", "w1", serde_json::Value::Null)
        .await
        .unwrap();

    let dead = queue
        .enqueue_raw(
            "default",
            "noop",
            serde_json::Value::Null,
            JobOptions {
                max_attempts: 1,
                ..no_jitter()
            },
        )
        .await
        .unwrap();
    let record = queue
        .claim_next(&queues, "w1", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        queue.fail(&record, "w1", "boom").await.unwrap(),
        JobState::Failed
    );
    assert_eq!(queue.stats("default").await.unwrap().failed, 1);

    tokio::time::sleep(Duration::from_millis(1200)).await;

    // this one finishes inside the window and must survive the purge
    let fresh = queue
        .enqueue_raw("default", "noop", serde_json::Value::Null, no_jitter())
        .await
        .unwrap();
    let record = queue
        .claim_next(&queues, "w1", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    queue
        .complete(&record.id, "default", "w1", serde_json::json!({"kept": true}))
        .await
        .unwrap();

    assert_eq!(queue.purge_finished("default", 100).await.unwrap(), 2);

    assert!(queue.get_job(&completed).await.unwrap().is_none());
    assert!(queue.get_job(&dead).await.unwrap().is_none());
    assert_eq!(queue.stats("default").await.unwrap().failed, 0);

    let stored = queue.get_job(&fresh).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Completed);
    assert_eq!(stored.result, Some(serde_json::json!({"kept": true})));
    assert_eq!(queue.purge_finished("default", 100).await.unwrap(), 0);
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn stats_age_tracks_oldest_pending_not_head_of_queue() {
    let queue = isolated_queue().await;

    // an old low-priority job parked behind a fresh high-priority one
    queue
        .enqueue_raw(
            "default",
            "noop",
            serde_json::Value::Null,
            JobOptions {
                priority: 5,
                ..no_jitter()
            },
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1200)).await;
    queue
        .enqueue_raw(
            "default",
            "noop",
            serde_json::Value::Null,
            JobOptions {
                priority: 1,
                ..no_jitter()
            },
        )
        .await
        .unwrap();

    let stats = queue.stats("default").await.unwrap();
    assert_eq!(stats.pending, 2);
    let age = stats.oldest_pending_age.expect("pending jobs present");
    assert!(age >= Duration::from_secs(1), "reported age {age:?}");
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn redundant_schedulers_fire_each_tick_once() {
    let options = isolated_options();
    let config = SchedulerConfig {
        poll_interval: Duration::from_millis(200),
        lock_ttl: Duration::from_secs(30),
        missed_tick_grace: Duration::from_secs(30),
    };

    let mut schedulers = Vec::new();
    for _ in 0..3 {
        let queue = Arc::new(Queue::new(options.clone()).await.unwrap());
        schedulers.push(Scheduler::new(queue, config.clone()).await.unwrap());
    }

    // fires every second
    schedulers[0]
        .register_schedule(
            "every-second",
            "* * * * * *",
            "ticks",
            "tick",
            serde_json::Value::Null,
        )
        .await
        .unwrap();

    let run_secs = 5i64;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(run_secs as u64);
    while tokio::time::Instant::now() < deadline {
        for scheduler in &schedulers {
            scheduler.fire_due_schedules().await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let queue = Queue::new(options).await.unwrap();
    let stats = queue.stats("ticks").await.unwrap();
    let total = stats.pending + stats.delayed;

    // one job per elapsed tick, +/-1 at the window edges; never 3x
    assert!(
        (total as i64) >= run_secs - 1 && (total as i64) <= run_secs + 1,
        "expected ~{run_secs} enqueues, got {total}"
    );
}

#[derive(Serialize, Deserialize)]
struct CountedJob;

struct CounterContext {
    executed: Arc<AtomicU32>,
}

impl AppContext for CounterContext {
    fn clone_context(&self) -> Arc<dyn AppContext> {
        Arc::new(CounterContext {
            executed: Arc::clone(&self.executed),
        })
    }
}

#[async_trait]
impl Job for CountedJob {
    async fn perform(&self, ctx: &JobContext) -> Result<serde_json::Value> {
        let counter = ctx
            .app::<CounterContext>()
            .expect("counter context installed");
        counter.executed.fetch_add(1, Ordering::SeqCst);
        Ok(serde_json::Value::Null)
    }

    fn kind() -> &'static str {
        "counted"
    }
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn worker_executes_jobs_end_to_end() {
    let options = isolated_options();
    let queue = Queue::new(options.clone()).await.unwrap();

    let executed = Arc::new(AtomicU32::new(0));
    let mut registry = JobRegistry::new();
    registry.register::<CountedJob>();

    let mut worker = WorkerBuilder::new(options.redis_url.clone(), registry)
        .with_queue_options(options)
        .with_queues(["default"])
        .with_concurrency(2)
        .with_app_context(Arc::new(CounterContext {
            executed: Arc::clone(&executed),
        }))
        .with_poll_interval(Duration::from_millis(50))
        .spawn()
        .await
        .unwrap();

    let ids = {
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(queue.enqueue(CountedJob).await.unwrap());
        }
        ids
    };

    let handle = tokio::spawn(async move { worker.start().await });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while executed.load(Ordering::SeqCst) < 5 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    // let the slots record their completions before tearing the worker down
    tokio::time::sleep(Duration::from_millis(500)).await;
    handle.abort();

    assert_eq!(executed.load(Ordering::SeqCst), 5);
    for id in ids {
        let stored = queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
    }
}

#[derive(Serialize, Deserialize)]
struct LongHaulJob;

struct CancelWatchContext {
    saw_cancel: Arc<AtomicBool>,
}

impl AppContext for CancelWatchContext {
    fn clone_context(&self) -> Arc<dyn AppContext> {
        Arc::new(CancelWatchContext {
            saw_cancel: Arc::clone(&self.saw_cancel),
        })
    }
}

#[async_trait]
impl Job for LongHaulJob {
    async fn perform(&self, ctx: &JobContext) -> Result<serde_json::Value> {
        let watch = ctx
            .app::<CancelWatchContext>()
            .expect("watch context installed");
        for _ in 0..200 {
            if ctx.is_cancel_requested().await? {
                watch.saw_cancel.store(true, Ordering::SeqCst);
                return Ok(serde_json::Value::Null);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok(serde_json::json!({"finished": "uninterrupted"}))
    }

    fn kind() -> &'static str {
        "long_haul"
    }
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn active_job_handler_observes_cancellation() {
    let options = isolated_options();
    let queue = Queue::new(options.clone()).await.unwrap();

    let saw_cancel = Arc::new(AtomicBool::new(false));
    let mut registry = JobRegistry::new();
    registry.register::<LongHaulJob>();

    let mut worker = WorkerBuilder::new(options.redis_url.clone(), registry)
        .with_queue_options(options)
        .with_queues(["default"])
        .with_concurrency(1)
        .with_app_context(Arc::new(CancelWatchContext {
            saw_cancel: Arc::clone(&saw_cancel),
        }))
        .with_poll_interval(Duration::from_millis(50))
        .spawn()
        .await
        .unwrap();

    let job_id = queue.enqueue(LongHaulJob).await.unwrap();
    let handle = tokio::spawn(async move { worker.start().await });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let state = queue.get_job(&job_id).await.unwrap().unwrap().state;
        if state == JobState::Active {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job never became active"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(
        queue.cancel(&job_id).await.unwrap(),
        CancelOutcome::Requested
    );

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let stored = queue.get_job(&job_id).await.unwrap().unwrap();
        if stored.state == JobState::Cancelled {
            assert!(stored.result.is_none());
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job never landed cancelled"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert!(
        saw_cancel.load(Ordering::SeqCst),
        "handler never observed the cancellation request"
    );
    handle.abort();
}
