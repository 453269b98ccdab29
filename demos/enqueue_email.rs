use relayq::{
    Job, JobContext, JobOptions, Queue, QueueOptions, Result, async_trait,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Serialize, Deserialize)]
struct EmailJob {
    to: String,
    subject: String,
    body: String,
}

#[async_trait]
impl Job for EmailJob {
    async fn perform(&self, _ctx: &JobContext) -> Result<serde_json::Value> {
        println!("[worker] to='{}' subject='{}'", self.to, self.subject);
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

    let queue = Queue::new(QueueOptions::default()).await?;

    let job = EmailJob {
        to: "user@example.com".into(),
        subject: "Welcome!".into(),
        body: "Thanks for signing up".into(),
    };
    let job_id = queue.enqueue(job).await?;
    println!("[enqueue] enqueued send_email id={job_id}");

    let urgent = EmailJob {
        to: "user@example.com".into(),
        subject: "Password reset".into(),
        body: "Your reset link".into(),
    };
    let opts = JobOptions {
        priority: -10,
        max_attempts: 5,
        ..Default::default()
    };
    let urgent_id = queue.enqueue_with_options(urgent, opts).await?;
    println!("[enqueue] enqueued urgent send_email id={urgent_id}");

    let digest = EmailJob {
        to: "user@example.com".into(),
        subject: "Your weekly digest".into(),
        body: "What you missed".into(),
    };
    let delayed = JobOptions {
        delay: Some(Duration::from_secs(60)),
        ..Default::default()
    };
    let digest_id = queue.enqueue_with_options(digest, delayed).await?;
    println!("[enqueue] enqueued delayed send_email id={digest_id}");

    if let Some(record) = queue.get_job(&digest_id).await? {
        println!("[status] id={} state={}", record.id, record.state);
    }

    let outcome = queue.cancel(&digest_id).await?;
    println!("[cancel] id={digest_id} outcome={outcome:?}");

    let stats = queue.stats("emails").await?;
    println!(
        "[stats] pending={} delayed={} active={} failed={}",
        stats.pending, stats.delayed, stats.active, stats.failed
    );

    Ok(())
}
