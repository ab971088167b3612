//! Drive the dispatcher end to end with the simulated solver
//!
//! Run with: cargo run -p turnstile-dispatch --example simulated_dispatch
//!
//! Settings come from the environment (or a `.env` file), e.g.
//! `THREADS=4 MAX_CONNECTIONS=10 LOG_FORMAT=json`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use turnstile_dispatch::prelude::*;
use turnstile_dispatch::telemetry::{init_telemetry, TelemetryConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_telemetry(TelemetryConfig::from_env())?;

    let config = DispatcherConfig::from_env().context("invalid dispatcher configuration")?;

    let backend = SimulatedBackend::new()
        .with_latency(Duration::from_millis(250))
        .script(
            "0xFLAKY",
            vec![SimulatedStep::Fail(SolverError::transient(
                "render_timeout",
                "widget did not render",
            ))],
        )
        .script(
            "0xBAD",
            vec![SimulatedStep::Fail(SolverError::permanent(
                "invalid_sitekey",
                "sitekey rejected by the widget",
            ))],
        );

    let dispatcher = Dispatcher::new(config, Arc::new(backend))?;
    dispatcher.start()?;

    let sitekeys = ["0x4AAAAAAA", "0xFLAKY", "0xBAD", "0x4BBBBBBB", "0x4CCCCCCC"];
    let mut task_ids = Vec::new();
    for sitekey in sitekeys {
        match dispatcher.submit(TaskInput::new("https://example.com/login", sitekey)) {
            Ok(task_id) => {
                tracing::info!(%task_id, sitekey, "submitted");
                task_ids.push(task_id);
            }
            Err(e) => tracing::warn!(sitekey, error = %e, "submission rejected"),
        }
    }

    let mut pending = task_ids.clone();
    while !pending.is_empty() {
        tokio::time::sleep(Duration::from_millis(100)).await;
        pending.retain(|id| match dispatcher.poll(*id) {
            Ok(view) if view.is_terminal() => {
                tracing::info!(
                    task_id = %id,
                    state = %view.state,
                    attempts = view.attempt_count,
                    "settled"
                );
                false
            }
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(task_id = %id, error = %e, "lost track of task");
                false
            }
        });
    }

    for id in &task_ids {
        if let Ok(view) = dispatcher.poll(*id) {
            println!("{}", serde_json::to_string(&view)?);
        }
    }
    println!("{}", serde_json::to_string(&dispatcher.stats())?);

    let report = dispatcher.shutdown().await?;
    tracing::info!(cancelled = report.cancelled, "done");
    Ok(())
}
