//! Periodic sweeps: wake delay steps whose timer is due and expire overdue
//! tasks and approvals.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use talentflow_types::instance::{ExecutionStatus, Suspension};
use talentflow_types::workflow::StepKind;
use tokio_util::sync::CancellationToken;

use super::engine::{EngineError, ResumeOutcome};
use super::gateway::ResumptionGateway;
use crate::repository::InstanceStore;

/// What one sweep pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub delays_woken: usize,
    pub work_expired: usize,
}

pub struct TimerSweeper<S: InstanceStore> {
    gateway: ResumptionGateway<S>,
}

impl<S: InstanceStore> TimerSweeper<S> {
    pub fn new(gateway: ResumptionGateway<S>) -> Self {
        Self { gateway }
    }

    /// Resume every delay step whose wake time is at or before `now`.
    pub async fn wake_due_delays(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let engine = self.gateway.engine();
        let mut woken = 0;
        for instance in engine.store().list_suspended(StepKind::Delay).await? {
            let due: Vec<String> = instance
                .running_steps
                .iter()
                .filter(|e| e.status == ExecutionStatus::Suspended)
                .filter_map(|e| match e.suspension {
                    Some(Suspension::Timer { wake_at }) if wake_at <= now => Some(e.step_id.clone()),
                    _ => None,
                })
                .collect();
            for step_id in due {
                let outcome = ResumeOutcome::Completed {
                    result: json!({ "woke_at": now }),
                };
                match engine.resume(instance.id, &step_id, outcome).await {
                    Ok(_) => woken += 1,
                    // Woken by a concurrent sweep.
                    Err(EngineError::NotSuspended { .. }) => {}
                    Err(err) => {
                        tracing::error!(instance_id = %instance.id, %step_id, error = %err, "failed to wake delay");
                    }
                }
            }
        }
        Ok(woken)
    }

    /// Expire every pending task and approval whose deadline is at or
    /// before `now`.
    pub async fn expire_overdue_work(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let store = self.gateway.engine().store();
        let mut expired = 0;
        for kind in [StepKind::Approval, StepKind::Task] {
            for instance in store.list_suspended(kind).await? {
                let overdue: Vec<_> = instance
                    .running_steps
                    .iter()
                    .filter(|e| e.kind == kind && e.status == ExecutionStatus::Suspended)
                    .filter_map(|e| match e.suspension {
                        Some(Suspension::Work {
                            work_id,
                            expires_at: Some(at),
                        }) if at <= now => Some(work_id),
                        _ => None,
                    })
                    .collect();
                for work_id in overdue {
                    match self.gateway.expire_work(work_id, now).await {
                        Ok(resolution) if !resolution.already_resolved => {
                            tracing::warn!(
                                instance_id = %instance.id,
                                step_id = %resolution.work.step_id,
                                %work_id,
                                "work expired"
                            );
                            expired += 1;
                        }
                        Ok(_) => {}
                        Err(err) => {
                            tracing::error!(
                                instance_id = %instance.id,
                                %work_id,
                                error = %err,
                                "failed to expire work"
                            );
                        }
                    }
                }
            }
        }
        Ok(expired)
    }

    /// One pass of both sweeps.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, EngineError> {
        Ok(SweepReport {
            delays_woken: self.wake_due_delays(now).await?,
            work_expired: self.expire_overdue_work(now).await?,
        })
    }

    /// Sweep every `interval` until `shutdown` is cancelled.
    pub async fn run(&self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_secs = interval.as_secs(), "timer sweeper started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("timer sweeper stopped");
                    return;
                }
                _ = ticker.tick() => {
                    match self.sweep(Utc::now()).await {
                        Ok(report) if report != SweepReport::default() => {
                            tracing::info!(
                                delays_woken = report.delays_woken,
                                work_expired = report.work_expired,
                                "sweep finished"
                            );
                        }
                        Ok(_) => {}
                        Err(err) => tracing::error!(error = %err, "sweep failed"),
                    }
                }
            }
        }
    }
}
