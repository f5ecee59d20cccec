//! Demo worker process.
//!
//! Run with: cargo run --bin deferred-worker
//! Start several copies against the same database to watch them share work.

use anyhow::bail;
use deferred_jobs::{FailedJobPolicy, JobQueue, Payload, WorkerConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize, Deserialize)]
struct SendEmail {
    to: String,
    subject: String,
}

impl Payload for SendEmail {
    const JOB_TYPE: &'static str = "send_email";

    fn display_name(&self) -> String {
        format!("send_email to {}", self.to)
    }

    async fn perform(&self) -> anyhow::Result<()> {
        println!("Sending email to {}: {}", self.to, self.subject);
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ProcessPayment {
    order_id: String,
    amount: f64,
}

impl Payload for ProcessPayment {
    const JOB_TYPE: &'static str = "process_payment";

    async fn perform(&self) -> anyhow::Result<()> {
        if self.amount > 1000.0 {
            bail!("order {} requires manual review", self.order_id);
        }
        println!("Processing ${} for order {}", self.amount, self.order_id);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // 1. Open the shared store
    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://jobs.db?mode=rwc".to_string());
    let queue = JobQueue::connect(&database_url).await?;

    // 2. Register the payloads this worker can run
    queue.register::<SendEmail>().register::<ProcessPayment>();

    // 3. Enqueue some work: a high priority email, a payment due in 10 seconds,
    //    and a payment that keeps failing
    queue
        .enqueue_with(
            &SendEmail {
                to: "user@example.com".to_string(),
                subject: "Welcome!".to_string(),
            },
            10,
            None,
        )
        .await?;

    let due = chrono::Utc::now() + chrono::Duration::seconds(10);
    queue
        .enqueue_with(
            &ProcessPayment {
                order_id: "ORD-123".to_string(),
                amount: 99.99,
            },
            0,
            Some(due),
        )
        .await?;

    queue
        .enqueue(&ProcessPayment {
            order_id: "ORD-999".to_string(),
            amount: 5000.0,
        })
        .await?;

    // 4. Run until Ctrl+C / SIGTERM; failed jobs stay around for inspection
    let config = WorkerConfig::default()
        .with_sleep_interval(Duration::from_secs(5))
        .with_failed_jobs(FailedJobPolicy::Retain);
    let worker = queue.worker(config)?;
    worker.start().await?;

    let stats = queue.stats().await?;
    println!(
        "Shutdown complete: {} jobs left, {} failed",
        stats.total, stats.failed
    );

    Ok(())
}
