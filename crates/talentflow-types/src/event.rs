//! Event types for the workflow event bus.
//!
//! `WorkflowEvent` is broadcast by the engine on every lifecycle transition.
//! All variants are Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::instance::{FailureKind, WorkStatus};
use crate::workflow::StepKind;

/// Lifecycle events emitted by the execution engine and resumption gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// A new instance was created from a definition.
    InstanceStarted {
        instance_id: Uuid,
        workflow_name: String,
        trigger: String,
    },

    /// A step handler was dispatched.
    StepStarted {
        instance_id: Uuid,
        step_id: String,
        kind: StepKind,
        attempt: u32,
    },

    /// A step completed and its successors were scheduled.
    StepCompleted {
        instance_id: Uuid,
        step_id: String,
        duration_ms: u64,
    },

    /// A step parked its branch on work or a timer.
    StepSuspended {
        instance_id: Uuid,
        step_id: String,
        /// Work item id for tasks and approvals.
        work_id: Option<Uuid>,
    },

    /// A step failed.
    StepFailed {
        instance_id: Uuid,
        step_id: String,
        kind: FailureKind,
        error: String,
    },

    /// A branch arrived at a merge step.
    JoinArrived {
        instance_id: Uuid,
        merge_step_id: String,
        from_step_id: String,
        remaining: u32,
    },

    /// No branch can progress without external input.
    InstanceSuspended { instance_id: Uuid },

    InstanceCompleted {
        instance_id: Uuid,
        workflow_name: String,
        steps_completed: u32,
    },

    InstanceFailed {
        instance_id: Uuid,
        kind: FailureKind,
        error: String,
    },

    InstanceCancelled {
        instance_id: Uuid,
        kind: FailureKind,
        reason: String,
    },

    /// A pending work item was resolved through the gateway or expiry sweep.
    WorkResolved {
        instance_id: Uuid,
        work_id: Uuid,
        status: WorkStatus,
    },
}

impl WorkflowEvent {
    /// Instance the event belongs to.
    pub fn instance_id(&self) -> Uuid {
        match self {
            WorkflowEvent::InstanceStarted { instance_id, .. }
            | WorkflowEvent::StepStarted { instance_id, .. }
            | WorkflowEvent::StepCompleted { instance_id, .. }
            | WorkflowEvent::StepSuspended { instance_id, .. }
            | WorkflowEvent::StepFailed { instance_id, .. }
            | WorkflowEvent::JoinArrived { instance_id, .. }
            | WorkflowEvent::InstanceSuspended { instance_id }
            | WorkflowEvent::InstanceCompleted { instance_id, .. }
            | WorkflowEvent::InstanceFailed { instance_id, .. }
            | WorkflowEvent::InstanceCancelled { instance_id, .. }
            | WorkflowEvent::WorkResolved { instance_id, .. } => *instance_id,
        }
    }
}
