// src/worker.rs
use crate::{
    AppContext, JobContext, JobRecord, JobRegistry, JobState, NoopContext, Queue, QueueOptions,
    RelayqError, Result,
};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::{
    sync::{Notify, Semaphore, broadcast},
    task::JoinHandle,
    time::{Duration, interval, sleep, timeout},
};
use tracing::{debug, error, info, instrument, warn};

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub queue_options: QueueOptions,
    /// Queues this worker claims from, in preference order.
    pub queues: Vec<String>,
    pub concurrency: usize,
    pub poll_interval: Duration,
    /// Exclusive claim duration; renewed at a third of this while a
    /// handler runs.
    pub lease_duration: Duration,
    pub promote_interval: Duration,
    pub sweep_interval: Duration,
    pub reap_interval: Duration,
    pub worker_id: String,
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_options: QueueOptions::default(),
            queues: vec!["default".to_string()],
            concurrency: 10,
            poll_interval: Duration::from_millis(100),
            lease_duration: Duration::from_secs(30),
            promote_interval: Duration::from_millis(500),
            sweep_interval: Duration::from_secs(15),
            reap_interval: Duration::from_secs(60),
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Worker builder for fluent configuration
pub struct WorkerBuilder {
    config: WorkerConfig,
    registry: JobRegistry,
    app_context: Option<Arc<dyn AppContext>>,
}

impl WorkerBuilder {
    pub fn new(redis_url: impl Into<String>, registry: JobRegistry) -> Self {
        let mut config = WorkerConfig::default();
        config.queue_options.redis_url = redis_url.into();

        Self {
            config,
            registry,
            app_context: None,
        }
    }

    pub fn with_queue_options(mut self, options: QueueOptions) -> Self {
        self.config.queue_options = options;
        self
    }

    pub fn with_queues(mut self, queues: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.config.queues = queues.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.config.concurrency = concurrency.max(1);
        self
    }

    pub fn with_app_context(mut self, ctx: Arc<dyn AppContext>) -> Self {
        self.app_context = Some(ctx);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.config.poll_interval = poll_interval;
        self
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.config.lease_duration = lease;
        self
    }

    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.config.shutdown_timeout = shutdown_timeout;
        self
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.config.worker_id = worker_id.into();
        self
    }

    pub async fn spawn(self) -> Result<Worker> {
        let app_context = self
            .app_context
            .unwrap_or_else(|| Arc::new(NoopContext));

        Worker::new(self.config, self.registry, app_context).await
    }
}

/// Job worker that claims and executes queued jobs
pub struct Worker {
    config: WorkerConfig,
    queue: Arc<Queue>,
    registry: Arc<JobRegistry>,
    app_context: Arc<dyn AppContext>,
    semaphore: Arc<Semaphore>,
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: broadcast::Sender<()>,
    is_shutting_down: Arc<AtomicBool>,
}

impl Worker {
    async fn new(
        config: WorkerConfig,
        registry: JobRegistry,
        app_context: Arc<dyn AppContext>,
    ) -> Result<Self> {
        if config.queues.is_empty() {
            return Err(RelayqError::Worker(
                "worker needs at least one queue".to_string(),
            ));
        }

        let queue = Arc::new(Queue::new(config.queue_options.clone()).await?);
        let semaphore = Arc::new(Semaphore::new(config.concurrency));
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            queue,
            registry: Arc::new(registry),
            app_context,
            semaphore,
            handles: Vec::new(),
            shutdown_tx,
            is_shutting_down: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The store handle this worker operates on.
    pub fn queue(&self) -> Arc<Queue> {
        Arc::clone(&self.queue)
    }

    /// Start the worker and run until a shutdown signal arrives.
    pub async fn start(&mut self) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            concurrency = self.config.concurrency,
            queues = ?self.config.queues,
            "starting worker"
        );

        self.setup_signal_handlers();

        let claim_handle = self.spawn_claim_loop();
        self.handles.push(claim_handle);

        let promoter_handle = self.spawn_promoter();
        self.handles.push(promoter_handle);

        let sweeper_handle = self.spawn_sweeper();
        self.handles.push(sweeper_handle);

        let reaper_handle = self.spawn_reaper();
        self.handles.push(reaper_handle);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        shutdown_rx.recv().await.ok();

        self.graceful_shutdown().await;

        Ok(())
    }

    fn setup_signal_handlers(&self) {
        let shutdown_tx = self.shutdown_tx.clone();
        let worker_id = self.config.worker_id.clone();

        tokio::spawn(async move {
            Self::wait_for_shutdown_signal().await;
            info!(worker_id = %worker_id, "shutdown signal received");
            let _ = shutdown_tx.send(());
        });
    }

    async fn wait_for_shutdown_signal() {
        use tokio::signal;

        #[cfg(unix)]
        {
            use signal::unix::{SignalKind, signal};

            let mut sigterm =
                signal(SignalKind::terminate()).expect("Failed to setup SIGTERM handler");
            let mut sigint =
                signal(SignalKind::interrupt()).expect("Failed to setup SIGINT handler");

            tokio::select! {
                _ = sigterm.recv() => info!("SIGTERM received"),
                _ = sigint.recv() => info!("SIGINT received"),
            }
        }

        #[cfg(not(unix))]
        {
            signal::ctrl_c()
                .await
                .expect("Failed to setup CTRL+C handler");
            info!("CTRL+C received");
        }
    }

    /// Perform graceful shutdown: stop claiming, cancel background loops,
    /// then wait for in-flight jobs up to the configured timeout.
    async fn graceful_shutdown(&mut self) {
        info!(worker_id = %self.config.worker_id, "initiating graceful shutdown");

        self.is_shutting_down.store(true, Ordering::SeqCst);

        for handle in self.handles.drain(..) {
            handle.abort();
        }

        let active = self.config.concurrency - self.semaphore.available_permits();
        if active > 0 {
            info!(active, "waiting for in-flight jobs to finish");

            match timeout(self.config.shutdown_timeout, self.wait_for_jobs_completion()).await {
                Ok(_) => info!("all in-flight jobs finished"),
                Err(_) => {
                    let remaining = self.config.concurrency - self.semaphore.available_permits();
                    warn!(
                        remaining,
                        "shutdown timeout reached; abandoned jobs will be reclaimed on lease expiry"
                    );
                }
            }
        }

        info!(worker_id = %self.config.worker_id, "worker shutdown complete");
    }

    async fn wait_for_jobs_completion(&self) {
        let permits = match self
            .semaphore
            .clone()
            .acquire_many_owned(self.config.concurrency as u32)
            .await
        {
            Ok(permits) => permits,
            Err(_) => return,
        };
        drop(permits);
    }

    /// Request a graceful stop (public API)
    pub fn stop(&self) {
        info!(worker_id = %self.config.worker_id, "stop requested");
        let _ = self.shutdown_tx.send(());
    }

    /// Force immediate shutdown; unfinished jobs are recovered later by
    /// the lease-expiry sweep.
    pub fn force_stop(&mut self) {
        self.is_shutting_down.store(true, Ordering::SeqCst);
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }

    fn spawn_claim_loop(&self) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let registry = Arc::clone(&self.registry);
        let app_context = self.app_context.clone_context();
        let semaphore = Arc::clone(&self.semaphore);
        let queues = self.config.queues.clone();
        let worker_id = self.config.worker_id.clone();
        let lease = self.config.lease_duration;
        let poll_interval = self.config.poll_interval;
        let is_shutting_down = Arc::clone(&self.is_shutting_down);

        tokio::spawn(async move {
            // doubles on store errors, capped; resets on success
            let mut store_backoff = Duration::from_secs(1);

            loop {
                if is_shutting_down.load(Ordering::SeqCst) {
                    break;
                }

                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };

                match queue.claim_next(&queues, &worker_id, lease).await {
                    Ok(Some(record)) => {
                        store_backoff = Duration::from_secs(1);

                        let slot_queue = Arc::clone(&queue);
                        let slot_registry = Arc::clone(&registry);
                        let slot_context = app_context.clone_context();
                        let slot_worker_id = worker_id.clone();

                        tokio::spawn(async move {
                            let _permit = permit;
                            Self::execute_job(
                                slot_queue,
                                slot_registry,
                                slot_context,
                                record,
                                slot_worker_id,
                                lease,
                            )
                            .await;
                        });
                    }
                    Ok(None) => {
                        drop(permit);
                        store_backoff = Duration::from_secs(1);
                        sleep(poll_interval).await;
                    }
                    Err(e) => {
                        drop(permit);
                        error!(error = %e, "failed to claim job");
                        sleep(store_backoff).await;
                        store_backoff = (store_backoff * 2).min(Duration::from_secs(30));
                    }
                }
            }

            debug!("claim loop terminated");
        })
    }

    fn spawn_promoter(&self) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let queues = self.config.queues.clone();
        let promote_interval = self.config.promote_interval;
        let is_shutting_down = Arc::clone(&self.is_shutting_down);

        tokio::spawn(async move {
            let mut ticker = interval(promote_interval);

            loop {
                if is_shutting_down.load(Ordering::SeqCst) {
                    break;
                }
                ticker.tick().await;

                for name in &queues {
                    match queue.promote_due(name, 100).await {
                        Ok(moved) if moved > 0 => {
                            debug!(queue = %name, moved, "promoted delayed jobs")
                        }
                        Ok(_) => {}
                        Err(e) => error!(queue = %name, error = %e, "failed to promote delayed jobs"),
                    }
                }
            }
        })
    }

    fn spawn_sweeper(&self) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let queues = self.config.queues.clone();
        let sweep_interval = self.config.sweep_interval;
        let is_shutting_down = Arc::clone(&self.is_shutting_down);

        tokio::spawn(async move {
            let mut ticker = interval(sweep_interval);

            loop {
                if is_shutting_down.load(Ordering::SeqCst) {
                    break;
                }
                ticker.tick().await;

                for name in &queues {
                    match queue.sweep_expired(name, 100).await {
                        Ok(reclaimed) if reclaimed > 0 => {
                            warn!(queue = %name, reclaimed, "reclaimed jobs with lapsed leases")
                        }
                        Ok(_) => {}
                        Err(e) => error!(queue = %name, error = %e, "lease sweep failed"),
                    }
                }
            }
        })
    }

    fn spawn_reaper(&self) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let queues = self.config.queues.clone();
        let reap_interval = self.config.reap_interval;
        let is_shutting_down = Arc::clone(&self.is_shutting_down);

        tokio::spawn(async move {
            let mut ticker = interval(reap_interval);

            loop {
                if is_shutting_down.load(Ordering::SeqCst) {
                    break;
                }
                ticker.tick().await;

                for name in &queues {
                    match queue.purge_finished(name, 200).await {
                        Ok(purged) if purged > 0 => {
                            debug!(queue = %name, purged, "purged terminal jobs past retention")
                        }
                        Ok(_) => {}
                        Err(e) => error!(queue = %name, error = %e, "retention purge failed"),
                    }
                }
            }
        })
    }

    #[instrument(skip_all, fields(job_id = %record.id, kind = %record.kind))]
    async fn execute_job(
        queue: Arc<Queue>,
        registry: Arc<JobRegistry>,
        app_context: Arc<dyn AppContext>,
        record: JobRecord,
        worker_id: String,
        lease: Duration,
    ) {
        let started = std::time::Instant::now();
        let ctx = JobContext::new(record.clone(), app_context, Arc::clone(&queue));

        // Heartbeat renews the lease while the handler runs. If a renewal
        // comes back LostLock the slot must abandon the job: another worker
        // owns it now and reporting anything would violate the lock.
        let lost_lock = Arc::new(Notify::new());
        let heartbeat = {
            let queue = Arc::clone(&queue);
            let job_id = record.id.clone();
            let queue_name = record.queue.clone();
            let worker_id = worker_id.clone();
            let lost_lock = Arc::clone(&lost_lock);

            tokio::spawn(async move {
                let period = lease / 3;
                loop {
                    sleep(period).await;
                    match queue.renew_lease(&job_id, &queue_name, &worker_id, lease).await {
                        Ok(()) => {}
                        Err(RelayqError::LostLock(_)) => {
                            lost_lock.notify_waiters();
                            break;
                        }
                        Err(e) => {
                            // transient store trouble; the next beat retries
                            warn!(error = %e, "lease renewal failed");
                        }
                    }
                }
            })
        };

        let outcome = tokio::select! {
            run = timeout(record.timeout, registry.execute(&record.kind, record.payload.clone(), &ctx)) => {
                match run {
                    Ok(result) => Some(result),
                    Err(_) => Some(Err(RelayqError::Worker(format!(
                        "handler exceeded deadline of {:?}",
                        record.timeout
                    )))),
                }
            }
            _ = lost_lock.notified() => None,
        };

        heartbeat.abort();
        let elapsed = started.elapsed();

        match outcome {
            None => {
                warn!(?elapsed, "lease lost mid-execution; job abandoned");
            }
            Some(Ok(result)) => {
                match queue.complete(&record.id, &record.queue, &worker_id, result).await {
                    Ok(JobState::Completed) => info!(?elapsed, "job completed"),
                    Ok(state) => info!(?elapsed, %state, "job finished"),
                    Err(RelayqError::LostLock(_)) => {
                        warn!(?elapsed, "lease lost before completion could be recorded")
                    }
                    Err(e) => error!(error = %e, "failed to record completion"),
                }
            }
            Some(Err(failure)) => {
                let message = failure.to_string();
                match queue.fail(&record, &worker_id, &message).await {
                    Ok(JobState::Delayed) => {
                        warn!(?elapsed, error = %message, attempt = record.attempts, "job failed; retry scheduled")
                    }
                    Ok(JobState::Failed) => {
                        error!(?elapsed, error = %message, attempt = record.attempts, "job failed permanently")
                    }
                    Ok(state) => info!(?elapsed, %state, "job finished"),
                    Err(RelayqError::LostLock(_)) => {
                        warn!(?elapsed, "lease lost before failure could be recorded")
                    }
                    Err(e) => error!(error = %e, "failed to record failure"),
                }
            }
        }
    }

    /// Get worker statistics
    pub fn worker_stats(&self) -> WorkerStats {
        WorkerStats {
            worker_id: self.config.worker_id.clone(),
            concurrency: self.config.concurrency,
            available_permits: self.semaphore.available_permits(),
            queues: self.config.queues.clone(),
            is_shutting_down: self.is_shutting_down.load(Ordering::SeqCst),
            active_jobs: self.config.concurrency - self.semaphore.available_permits(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerStats {
    pub worker_id: String,
    pub concurrency: usize,
    pub available_permits: usize,
    pub queues: Vec<String>,
    pub is_shutting_down: bool,
    pub active_jobs: usize,
}
