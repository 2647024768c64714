//! Human approval: wait for an external event, escalating if it does not arrive in time.
//!
//! Run with: `cargo run --example approval_with_timeout`

use std::sync::Arc;
use std::time::Duration;

use durabletask_worker::runtime::observability::{LogFormat, ObservabilityConfig};
use durabletask_worker::transport::InMemoryTaskHub;
use durabletask_worker::{ActivityRegistry, OrchestrationContext, OrchestrationRegistry, Worker, WorkerOptions};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let activities = ActivityRegistry::builder()
        .register("Notify", |ctx, message: String| async move {
            println!("[{}] notify: {message}", ctx.instance_id());
            Ok(String::new())
        })
        .build();

    let orchestrations = OrchestrationRegistry::builder()
        .register("Approval", |ctx: OrchestrationContext, request: String| async move {
            ctx.call_activity("Notify", format!("approval requested for {request}"))
                .await?;
            ctx.set_custom_status("awaiting approval");

            let decision = match ctx
                .wait_for_external_event_with_timeout("Approval", Duration::from_millis(500))
                .await
            {
                Ok(answer) => answer,
                Err(e) if e.is_cancelled() => {
                    ctx.call_activity("Notify", format!("escalating {request}")).await?;
                    "escalated".to_string()
                }
                Err(e) => return Err(e.into()),
            };

            ctx.set_custom_status(decision.clone());
            Ok(format!("{request}: {decision}"))
        })
        .build();

    let hub = InMemoryTaskHub::new();
    let options = WorkerOptions {
        observability: Some(ObservabilityConfig {
            log_format: LogFormat::Pretty,
            log_level: "info".to_string(),
            ..ObservabilityConfig::default()
        }),
        ..WorkerOptions::default()
    };
    let worker = Worker::start(Arc::new(hub.clone()), activities, orchestrations, options).await;

    // One request gets approved in time, the other is left to escalate.
    let approved = hub.schedule_new_orchestration("Approval", "expense-17").await?;
    let ignored = hub.schedule_new_orchestration("Approval", "expense-18").await?;

    tokio::time::sleep(Duration::from_millis(100)).await;
    hub.raise_event(&approved, "approval", "approved").await?;

    for id in [&approved, &ignored] {
        let state = hub.wait_for_completion(id, Duration::from_secs(10)).await?;
        println!(
            "{id}: {:?} -> {} (custom status {:?})",
            state.status,
            state.output.unwrap_or_default(),
            state.custom_status
        );
    }

    worker.shutdown(Duration::from_secs(5)).await;
    Ok(())
}
