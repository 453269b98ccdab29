use relayq::{Queue, QueueOptions, Scheduler, SchedulerConfig};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();

    let queue = Arc::new(Queue::new(QueueOptions::default()).await?);
    let scheduler = Scheduler::new(Arc::clone(&queue), SchedulerConfig::default()).await?;

    // Fires at second 0 of every minute; with several redundant processes
    // running this demo, each tick still enqueues exactly one job.
    scheduler
        .register_schedule(
            "minutely-digest",
            "0 * * * * *",
            "emails",
            "send_digest",
            serde_json::json!({"scope": "all-users"}),
        )
        .await?;

    println!("[scheduler] id={} running; ctrl-c to stop", scheduler.id());
    scheduler.run().await?;
    Ok(())
}
