// src/registry.rs
use crate::{Job, JobContext, RelayqError, Result};
use std::any::TypeId;
use std::collections::HashMap;

/// Registry mapping job kind names to their handlers, enabling payload
/// deserialization and dispatch by the string stored on the record.
pub struct JobRegistry {
    jobs: HashMap<String, Box<dyn JobExecutor>>,
    type_names: HashMap<TypeId, String>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            type_names: HashMap::new(),
        }
    }

    /// Register a job type
    pub fn register<T: Job>(&mut self) -> &mut Self {
        let kind = T::kind().to_string();
        let type_id = TypeId::of::<T>();

        self.jobs
            .insert(kind.clone(), Box::new(TypedJobExecutor::<T>::new()));
        self.type_names.insert(type_id, kind);
        self
    }

    /// Execute a job by kind with its stored payload. The returned value
    /// is persisted as the job result.
    pub async fn execute(
        &self,
        kind: &str,
        payload: serde_json::Value,
        ctx: &JobContext,
    ) -> Result<serde_json::Value> {
        let executor = self
            .jobs
            .get(kind)
            .ok_or_else(|| RelayqError::Registry(format!("job kind '{kind}' not registered")))?;

        executor.execute(payload, ctx).await
    }

    /// Get registered job kind names
    pub fn kinds(&self) -> Vec<String> {
        self.jobs.keys().cloned().collect()
    }

    /// Check if a job kind is registered
    pub fn contains(&self, kind: &str) -> bool {
        self.jobs.contains_key(kind)
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
trait JobExecutor: Send + Sync {
    async fn execute(&self, payload: serde_json::Value, ctx: &JobContext)
        -> Result<serde_json::Value>;
}

struct TypedJobExecutor<T: Job> {
    _phantom: std::marker::PhantomData<T>,
}

impl<T: Job> TypedJobExecutor<T> {
    fn new() -> Self {
        Self {
            _phantom: std::marker::PhantomData,
        }
    }
}

#[async_trait::async_trait]
impl<T: Job> JobExecutor for TypedJobExecutor<T> {
    async fn execute(
        &self,
        payload: serde_json::Value,
        ctx: &JobContext,
    ) -> Result<serde_json::Value> {
        let job: T = serde_json::from_value(payload)?;
        job.perform(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{JobOptions, JobRecord, NoopContext};
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;

    #[derive(Serialize, Deserialize)]
    struct Doubler {
        value: i64,
    }

    #[async_trait::async_trait]
    impl Job for Doubler {
        async fn perform(&self, _ctx: &JobContext) -> Result<serde_json::Value> {
            Ok(serde_json::json!(self.value * 2))
        }

        fn kind() -> &'static str {
            "doubler"
        }
    }

    #[derive(Serialize, Deserialize)]
    struct AlwaysFails;

    #[async_trait::async_trait]
    impl Job for AlwaysFails {
        async fn perform(&self, _ctx: &JobContext) -> Result<serde_json::Value> {
            Err(anyhow::anyhow!("boom").into())
        }

        fn kind() -> &'static str {
            "always_fails"
        }
    }

    fn test_ctx(kind: &str, payload: serde_json::Value) -> JobContext {
        let record = JobRecord::new(
            "default",
            kind,
            payload,
            &JobOptions::default(),
            chrono::Utc::now(),
        );
        JobContext::detached(record, Arc::new(NoopContext))
    }

    #[tokio::test]
    async fn dispatches_by_kind_and_returns_result() {
        let mut registry = JobRegistry::new();
        registry.register::<Doubler>();

        let payload = serde_json::json!({"value": 21});
        let ctx = test_ctx("doubler", payload.clone());
        let result = registry.execute("doubler", payload, &ctx).await.unwrap();
        assert_eq!(result, serde_json::json!(42));
    }

    #[tokio::test]
    async fn unknown_kind_is_a_registry_error() {
        let registry = JobRegistry::new();
        let ctx = test_ctx("missing", serde_json::Value::Null);
        let err = registry
            .execute("missing", serde_json::Value::Null, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayqError::Registry(_)));
    }

    #[tokio::test]
    async fn handler_errors_surface_as_handler_failures() {
        let mut registry = JobRegistry::new();
        registry.register::<AlwaysFails>();

        let payload = serde_json::to_value(AlwaysFails).unwrap();
        let ctx = test_ctx("always_fails", payload.clone());
        let err = registry
            .execute("always_fails", payload, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayqError::Handler(_)));
    }

    #[test]
    fn tracks_registered_kinds() {
        let mut registry = JobRegistry::new();
        registry.register::<Doubler>().register::<AlwaysFails>();
        assert!(registry.contains("doubler"));
        assert!(registry.contains("always_fails"));
        assert!(!registry.contains("mystery"));
        assert_eq!(registry.kinds().len(), 2);
    }
}
