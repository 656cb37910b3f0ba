//! Resumption gateway: the boundary through which assignees, approvers and
//! the expiry sweep push a suspended instance back into execution.
//!
//! Resolving a work item is one-way. A second resolution of the same item
//! returns the recorded outcome without touching the instance.

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use talentflow_types::error::RepositoryError;
use talentflow_types::event::WorkflowEvent;
use talentflow_types::instance::{
    ApprovalDecision, InstanceStatus, PendingWork, WorkKind, WorkStatus,
};
use thiserror::Error;
use uuid::Uuid;

use super::engine::{EngineError, ResumeOutcome, WorkflowEngine};
use crate::repository::InstanceStore;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("work item {0} not found")]
    WorkNotFound(Uuid),

    #[error("work item {id} is a {actual:?}, expected a {expected:?}")]
    WrongKind {
        id: Uuid,
        expected: WorkKind,
        actual: WorkKind,
    },

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl From<RepositoryError> for GatewayError {
    fn from(err: RepositoryError) -> Self {
        GatewayError::Engine(EngineError::Repository(err))
    }
}

/// Result of a resolution call.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// The work item as stored after the call.
    pub work: PendingWork,
    /// True when the item was already resolved and nothing was re-run.
    pub already_resolved: bool,
    /// Instance status after the call, `None` if the instance is gone.
    pub instance_status: Option<InstanceStatus>,
}

/// Entry points that resolve pending work and resume the owning instance.
pub struct ResumptionGateway<S: InstanceStore> {
    engine: WorkflowEngine<S>,
}

impl<S: InstanceStore> Clone for ResumptionGateway<S> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
        }
    }
}

impl<S: InstanceStore> ResumptionGateway<S> {
    pub fn new(engine: WorkflowEngine<S>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &WorkflowEngine<S> {
        &self.engine
    }

    /// Complete a task with `result`.
    pub async fn complete_task(
        &self,
        work_id: Uuid,
        result: Value,
    ) -> Result<Resolution, GatewayError> {
        self.resolve(work_id, Some(WorkKind::Task), |_| {
            (WorkStatus::Completed, result)
        })
        .await
    }

    /// Approve or reject an approval.
    pub async fn decide_approval(
        &self,
        work_id: Uuid,
        decision: ApprovalDecision,
        comments: Option<String>,
    ) -> Result<Resolution, GatewayError> {
        let status = match decision {
            ApprovalDecision::Approve => WorkStatus::Approved,
            ApprovalDecision::Reject => WorkStatus::Rejected,
        };
        self.resolve(work_id, Some(WorkKind::Approval), |_| {
            (status, json!({ "decision": decision, "comments": comments }))
        })
        .await
    }

    /// Expire a task or approval whose deadline passed.
    pub async fn expire_work(
        &self,
        work_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Resolution, GatewayError> {
        self.resolve(work_id, None, |work| {
            (
                WorkStatus::Expired,
                json!({ "expired_at": now, "expires_at": work.expires_at }),
            )
        })
        .await
    }

    async fn resolve(
        &self,
        work_id: Uuid,
        expected: Option<WorkKind>,
        resolution: impl FnOnce(&PendingWork) -> (WorkStatus, Value),
    ) -> Result<Resolution, GatewayError> {
        let store = self.engine.store();
        let work = store
            .load_work(&work_id)
            .await?
            .ok_or(GatewayError::WorkNotFound(work_id))?;
        if let Some(expected) = expected {
            if work.kind != expected {
                return Err(GatewayError::WrongKind {
                    id: work_id,
                    expected,
                    actual: work.kind,
                });
            }
        }

        // Resolve under the instance lock so a concurrent resolution, or a
        // cancellation expiring the item, is observed.
        let work = {
            let _guard = self.engine.lock_instance(work.instance_id).await;
            let mut work = store
                .load_work(&work_id)
                .await?
                .ok_or(GatewayError::WorkNotFound(work_id))?;
            if work.status.is_resolved() {
                tracing::debug!(%work_id, status = %work.status, "work already resolved");
                let instance_status = self.instance_status(work.instance_id).await?;
                return Ok(Resolution {
                    work,
                    already_resolved: true,
                    instance_status,
                });
            }
            let (status, value) = resolution(&work);
            work.resolve(status, Some(value));
            store.save_work(&work).await?;
            work
        };

        tracing::info!(
            %work_id,
            instance_id = %work.instance_id,
            step_id = %work.step_id,
            status = %work.status,
            "work resolved"
        );
        self.engine.events().publish(WorkflowEvent::WorkResolved {
            instance_id: work.instance_id,
            work_id,
            status: work.status,
        });

        let Some(outcome) = ResumeOutcome::from_work(&work) else {
            return Ok(Resolution {
                instance_status: self.instance_status(work.instance_id).await?,
                work,
                already_resolved: false,
            });
        };
        let instance_status = match self.engine.resume(work.instance_id, &work.step_id, outcome).await {
            Ok(status) => Some(status),
            // The branch was closed by another path (cancellation, recovery).
            Err(EngineError::NotSuspended { .. }) => self.instance_status(work.instance_id).await?,
            Err(EngineError::InstanceNotFound(_)) => None,
            Err(err) => return Err(err.into()),
        };
        Ok(Resolution {
            work,
            already_resolved: false,
            instance_status,
        })
    }

    async fn instance_status(
        &self,
        instance_id: Uuid,
    ) -> Result<Option<InstanceStatus>, GatewayError> {
        Ok(self
            .engine
            .store()
            .load(&instance_id)
            .await?
            .map(|i| i.status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryInstanceStore;
    use crate::workflow::collaborator::Collaborators;
    use crate::workflow::collaborator::testing::*;
    use std::sync::Arc;
    use talentflow_types::config::EngineConfig;
    use talentflow_types::instance::FailureKind;
    use talentflow_types::workflow::{Step, StepConfig, WorkflowDefinition};

    fn step(id: &str, config: StepConfig, next: &[&str]) -> Step {
        Step {
            id: id.to_string(),
            name: id.to_string(),
            config,
            next: next.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn leave_request() -> WorkflowDefinition {
        WorkflowDefinition {
            id: Uuid::now_v7(),
            name: "leave-request".into(),
            description: None,
            version: "1.0.0".into(),
            triggers: vec![],
            variables: Default::default(),
            steps: vec![
                step("start", StepConfig::Start, &["fork"]),
                step(
                    "fork",
                    StepConfig::Parallel {
                        branches: vec!["approve".into(), "handover".into()],
                    },
                    &[],
                ),
                step(
                    "approve",
                    StepConfig::Approval {
                        approver: "{{context.manager}}".into(),
                        prompt: Some("{{context.days}} days off".into()),
                        payload: Value::Null,
                        expires_in_secs: Some(3600),
                        expires_at: None,
                        escalation: None,
                        output_key: Some("manager_decision".into()),
                    },
                    &["join"],
                ),
                step(
                    "handover",
                    StepConfig::Task {
                        assignee: "{{context.employee}}".into(),
                        title: Some("Write handover notes".into()),
                        payload: Value::Null,
                        due_in_secs: None,
                        escalation: None,
                        output_key: None,
                    },
                    &["join"],
                ),
                step("join", StepConfig::Merge, &["end"]),
                step("end", StepConfig::End, &[]),
            ],
            metadata: Default::default(),
        }
    }

    struct Fixture {
        gateway: ResumptionGateway<MemoryInstanceStore>,
        work: Arc<RecordingWorkAssigner>,
        instance_id: Uuid,
    }

    async fn started() -> Fixture {
        let work = Arc::new(RecordingWorkAssigner::default());
        let engine = WorkflowEngine::new(
            MemoryInstanceStore::new(),
            Collaborators::new(work.clone()),
            EngineConfig::default(),
        );
        let def = engine.activate(leave_request()).await.unwrap();
        let instance_id = engine
            .start(
                def.id(),
                json!({ "manager": "lee@example.com", "employee": "dana@example.com", "days": 3 }),
            )
            .await
            .unwrap();
        Fixture {
            gateway: ResumptionGateway::new(engine),
            work,
            instance_id,
        }
    }

    fn only(ids: Vec<Uuid>) -> Uuid {
        assert_eq!(ids.len(), 1);
        ids[0]
    }

    #[tokio::test]
    async fn approve_and_complete_finish_the_instance() {
        let fx = started().await;
        let approval = only(fx.work.ids_for("approve"));
        let task = only(fx.work.ids_for("handover"));

        let approved = fx
            .gateway
            .decide_approval(approval, ApprovalDecision::Approve, Some("enjoy".into()))
            .await
            .unwrap();
        assert!(!approved.already_resolved);
        assert_eq!(approved.work.status, WorkStatus::Approved);
        assert_eq!(approved.instance_status, Some(InstanceStatus::Suspended));

        let done = fx
            .gateway
            .complete_task(task, json!({ "notes": "wiki/handover" }))
            .await
            .unwrap();
        assert_eq!(done.instance_status, Some(InstanceStatus::Completed));

        let instance = fx.gateway.engine().get_instance(fx.instance_id).await.unwrap();
        assert_eq!(instance.variables["manager_decision"]["decision"], "approve");
        assert_eq!(instance.variables["manager_decision"]["comments"], "enjoy");
        assert_eq!(instance.variables["handover"]["notes"], "wiki/handover");
    }

    #[tokio::test]
    async fn second_resolution_is_a_no_op() {
        let fx = started().await;
        let task = only(fx.work.ids_for("handover"));

        fx.gateway.complete_task(task, json!({ "v": 1 })).await.unwrap();
        let before = fx.gateway.engine().get_instance(fx.instance_id).await.unwrap();

        let again = fx.gateway.complete_task(task, json!({ "v": 2 })).await.unwrap();
        assert!(again.already_resolved);
        assert_eq!(again.work.resolution, Some(json!({ "v": 1 })));

        let after = fx.gateway.engine().get_instance(fx.instance_id).await.unwrap();
        assert_eq!(after.version, before.version);
        assert_eq!(after.completed_steps.len(), before.completed_steps.len());
    }

    #[tokio::test]
    async fn rejection_cancels_and_late_task_completion_is_ignored() {
        let fx = started().await;
        let approval = only(fx.work.ids_for("approve"));
        let task = only(fx.work.ids_for("handover"));

        let rejected = fx
            .gateway
            .decide_approval(approval, ApprovalDecision::Reject, Some("busy season".into()))
            .await
            .unwrap();
        assert_eq!(rejected.instance_status, Some(InstanceStatus::Cancelled));
        let instance = fx.gateway.engine().get_instance(fx.instance_id).await.unwrap();
        let termination = instance.termination.unwrap();
        assert_eq!(termination.kind, FailureKind::ApprovalRejected);
        assert_eq!(termination.message, "busy season");

        let late = fx.gateway.complete_task(task, json!({})).await.unwrap();
        assert!(late.already_resolved);
        assert_eq!(late.work.status, WorkStatus::Expired);
        assert_eq!(late.instance_status, Some(InstanceStatus::Cancelled));
    }

    #[tokio::test]
    async fn expire_work_without_escalation_cancels_on_approval() {
        let fx = started().await;
        let approval = only(fx.work.ids_for("approve"));

        let expired = fx.gateway.expire_work(approval, Utc::now()).await.unwrap();
        assert_eq!(expired.work.status, WorkStatus::Expired);
        assert_eq!(expired.instance_status, Some(InstanceStatus::Cancelled));
        let instance = fx.gateway.engine().get_instance(fx.instance_id).await.unwrap();
        assert_eq!(instance.termination.unwrap().kind, FailureKind::ApprovalExpired);
    }

    #[tokio::test]
    async fn kind_mismatch_and_unknown_ids_are_errors() {
        let fx = started().await;
        let approval = only(fx.work.ids_for("approve"));

        let err = fx.gateway.complete_task(approval, json!({})).await.unwrap_err();
        assert!(matches!(err, GatewayError::WrongKind { .. }), "got: {err}");
        let err = fx.gateway.complete_task(Uuid::now_v7(), json!({})).await.unwrap_err();
        assert!(matches!(err, GatewayError::WorkNotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_duplicate_resolutions_run_the_branch_once() {
        let fx = started().await;
        let task = only(fx.work.ids_for("handover"));

        let calls: Vec<_> = (0..4)
            .map(|i| {
                let gateway = fx.gateway.clone();
                tokio::spawn(async move { gateway.complete_task(task, json!({ "i": i })).await })
            })
            .collect();
        let mut fresh = 0;
        for call in calls {
            if !call.await.unwrap().unwrap().already_resolved {
                fresh += 1;
            }
        }
        assert_eq!(fresh, 1);

        let instance = fx.gateway.engine().get_instance(fx.instance_id).await.unwrap();
        let handovers = instance
            .completed_steps
            .iter()
            .filter(|e| e.step_id == "handover")
            .count();
        assert_eq!(handovers, 1);
        assert_eq!(instance.pending_joins["join"].arrived.len(), 1);
    }
}
