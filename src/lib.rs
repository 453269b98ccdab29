// src/lib.rs
//! relayq: a Redis-backed durable job queue for Rust
//!
//! Jobs are persisted in a shared Redis store, claimed under time-bounded
//! leases, retried with backoff, and dead-lettered when retries run out.
//! An integrated scheduler fires cron-style recurring jobs exactly once
//! per tick across any number of redundant processes.

pub mod backoff;
pub mod context;
pub mod error;
pub mod job;
pub mod lua;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod worker;

pub use backoff::BackoffStrategy;
pub use context::{AppContext, AsAny, JobContext, NoopContext};
pub use error::{RelayqError, Result};
pub use job::{Job, JobId, JobOptions, JobRecord, JobState, PRIORITY_LIMIT};
pub use queue::{CancelOutcome, Queue, QueueOptions, QueueStats};
pub use registry::JobRegistry;
pub use scheduler::{ScheduleDefinition, Scheduler, SchedulerConfig, SchedulerStats};
pub use worker::{Worker, WorkerBuilder, WorkerConfig, WorkerStats};

// Re-export commonly used types
pub use async_trait::async_trait;
pub use serde::{Deserialize, Serialize};
