//! Fan-out/fan-in: schedule one activity per item in parallel, then aggregate.
//!
//! Run with: `cargo run --example fan_out_fan_in`

use std::sync::Arc;
use std::time::Duration;

use durabletask_worker::runtime::observability::ObservabilityConfig;
use durabletask_worker::transport::InMemoryTaskHub;
use durabletask_worker::{ActivityRegistry, OrchestrationContext, OrchestrationRegistry, Worker, WorkerOptions};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let activities = ActivityRegistry::builder()
        .register("WordCount", |_ctx, text: String| async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(text.split_whitespace().count().to_string())
        })
        .build();

    let orchestrations = OrchestrationRegistry::builder()
        .register("CountWords", |ctx: OrchestrationContext, input: String| async move {
            let documents: Vec<String> = serde_json::from_str(&input)?;
            durabletask_worker::durable_info!(ctx, documents = documents.len(), "fanning out");

            let counts = futures::future::join_all(
                documents.into_iter().map(|doc| ctx.call_activity("WordCount", doc)),
            )
            .await;

            let mut total = 0usize;
            for count in counts {
                total += count?.parse::<usize>()?;
            }
            Ok(total.to_string())
        })
        .build();

    let hub = InMemoryTaskHub::new();
    let options = WorkerOptions {
        observability: Some(ObservabilityConfig::default()),
        ..WorkerOptions::default()
    };
    let worker = Worker::start(Arc::new(hub.clone()), activities, orchestrations, options).await;

    let documents = serde_json::to_string(&[
        "the quick brown fox",
        "jumps over the lazy dog",
        "durable functions replay from history",
    ])?;
    let instance_id = hub.schedule_new_orchestration("CountWords", documents).await?;
    let state = hub.wait_for_completion(&instance_id, Duration::from_secs(10)).await?;

    println!("status: {:?}", state.status);
    println!("total words: {}", state.output.unwrap_or_default());

    worker.shutdown(Duration::from_secs(5)).await;
    Ok(())
}
