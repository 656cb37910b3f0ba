//! `tflow sweep` and `tflow serve`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use console::style;
use serde_json::json;
use talentflow_core::workflow::scheduler::CronScheduler;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use super::output::print_json;
use crate::state::AppState;

/// One pass: wake due delays, expire overdue work, archive old instances.
pub async fn sweep(state: &AppState, json: bool) -> Result<()> {
    let now = Utc::now();
    let report = state.sweeper().sweep(now).await.context("sweep failed")?;
    let archived = state.engine.archive_terminal(now).await?;

    if json {
        return print_json(&json!({
            "delays_woken": report.delays_woken,
            "work_expired": report.work_expired,
            "archived": archived,
        }));
    }
    println!();
    println!("  Delays woken:  {}", report.delays_woken);
    println!("  Work expired:  {}", report.work_expired);
    println!("  Archived:      {archived}");
    println!();
    Ok(())
}

/// Run the timer sweeper and cron triggers until Ctrl+C or SIGTERM.
pub async fn serve(state: AppState) -> Result<()> {
    let recovered = state.engine.recover().await.context("crash recovery failed")?;
    if recovered > 0 {
        tracing::warn!(recovered, "recovered interrupted step executions");
    }

    let scheduler = Arc::new(CronScheduler::new());
    scheduler.start().await?;
    let cron_jobs = state.triggers.schedule_cron(&scheduler).await?;

    let shutdown = CancellationToken::new();
    let interval = Duration::from_secs(state.config.sweep_interval_secs.max(1));

    let sweeper = state.sweeper();
    let sweep_token = shutdown.clone();
    let sweep_task = tokio::spawn(async move { sweeper.run(interval, sweep_token).await });

    let housekeeping = tokio::spawn(housekeeping(
        state.clone(),
        Arc::clone(&scheduler),
        shutdown.clone(),
    ));
    let event_log = tokio::spawn(log_events(state.clone(), shutdown.clone()));

    println!(
        "  {} talentflow running: {} templates, {} cron jobs, sweep every {}s",
        style("⚡").bold(),
        state.catalog.len(),
        cron_jobs,
        interval.as_secs()
    );
    println!("  {}", style("Press Ctrl+C to stop").dim());

    shutdown_signal().await;
    tracing::info!("shutdown requested");
    shutdown.cancel();

    scheduler.stop().await?;
    for task in [sweep_task, housekeeping, event_log] {
        if let Err(err) = task.await {
            tracing::error!(error = %err, "background task panicked");
        }
    }
    state.db_pool.close().await;

    println!("\n  Stopped.");
    Ok(())
}

/// Hourly archival and missed cron run detection.
async fn housekeeping(state: AppState, scheduler: Arc<CronScheduler>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(Duration::from_secs(3600));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                let now = Utc::now();
                if let Err(err) = state.engine.archive_terminal(now).await {
                    tracing::error!(error = %err, "archival failed");
                }
                scheduler.check_missed_runs(now).await;
            }
        }
    }
}

/// Mirror engine events into the log.
async fn log_events(state: AppState, shutdown: CancellationToken) {
    let mut events = state.engine.events().subscribe();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            received = events.recv() => match received {
                Ok(event) => tracing::debug!(
                    instance_id = %event.instance_id(),
                    event = ?event,
                    "workflow event"
                ),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event log fell behind");
                }
                Err(RecvError::Closed) => return,
            },
        }
    }
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
