use relayq::{
    Job, JobContext, JobRegistry, Result, WorkerBuilder, async_trait,
};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
struct EmailJob {
    to: String,
    subject: String,
    body: String,
}

#[async_trait]
impl Job for EmailJob {
    async fn perform(&self, ctx: &JobContext) -> Result<serde_json::Value> {
        println!(
            "[worker] attempt {} sending to='{}' subject='{}'",
            ctx.attempt(),
            self.to,
            self.subject
        );
        Ok(serde_json::json!({"delivered": true}))
    }

    fn kind() -> &'static str {
        "send_email"
    }

    fn queue_name() -> &'static str {
        "emails"
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();

    let mut registry = JobRegistry::new();
    registry.register::<EmailJob>();

    let mut worker = WorkerBuilder::new("redis://127.0.0.1:6379", registry)
        .with_queues(["emails"])
        .with_concurrency(4)
        .spawn()
        .await?;

    // Runs until SIGTERM/SIGINT.
    worker.start().await?;
    Ok(())
}
