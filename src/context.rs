// src/context.rs
use crate::{JobId, JobRecord, Queue, Result};
use std::sync::Arc;
use tracing::Span;

/// Application context containing shared resources
pub trait AppContext: AsAny + Send + Sync + 'static {
    /// Clone the context for use in another thread
    fn clone_context(&self) -> Arc<dyn AppContext>;
}

/// Context provided to job execution
pub struct JobContext {
    pub job_id: JobId,
    pub record: JobRecord,
    pub app_context: Arc<dyn AppContext>,
    pub span: Span,
    store: Option<Arc<Queue>>,
}

impl JobContext {
    pub fn new(record: JobRecord, app_context: Arc<dyn AppContext>, store: Arc<Queue>) -> Self {
        let span = tracing::info_span!(
            "job_execution",
            job_id = %record.id,
            kind = %record.kind,
            queue = %record.queue,
            attempt = record.attempts,
        );

        Self {
            job_id: record.id.clone(),
            record,
            app_context,
            span,
            store: Some(store),
        }
    }

    /// A context with no store behind it, for exercising handlers directly.
    pub fn detached(record: JobRecord, app_context: Arc<dyn AppContext>) -> Self {
        let span = tracing::info_span!("job_execution", job_id = %record.id);
        Self {
            job_id: record.id.clone(),
            record,
            app_context,
            span,
            store: None,
        }
    }

    /// The attempt number of this execution, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.record.attempts
    }

    /// Whether a cancellation was requested while this job is running.
    /// Long-running handlers can poll this and bail out early; the result
    /// of a cancelled job is discarded either way.
    pub async fn is_cancel_requested(&self) -> Result<bool> {
        match &self.store {
            Some(store) => Ok(store
                .get_job(&self.job_id)
                .await?
                .map(|record| record.cancel_requested)
                .unwrap_or(false)),
            None => Ok(false),
        }
    }

    /// Get typed app context
    pub fn app<T: AppContext>(&self) -> Option<&T> {
        self.app_context.as_ref().as_any().downcast_ref::<T>()
    }
}

// Helper trait for downcasting
pub trait AsAny {
    fn as_any(&self) -> &dyn std::any::Any;
}

impl<T: AppContext> AsAny for T {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// An `AppContext` for workers that do not need shared resources.
#[derive(Clone, Default)]
pub struct NoopContext;

impl AppContext for NoopContext {
    fn clone_context(&self) -> Arc<dyn AppContext> {
        Arc::new(self.clone())
    }
}
