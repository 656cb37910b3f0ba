//! Runtime state of workflow instances.
//!
//! A `WorkflowInstance` is owned by the execution engine and persisted as a
//! whole document after every mutation. Step executions move from
//! `running_steps` into exactly one of the two terminal logs and are never
//! touched again once there.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::workflow::StepKind;

// ---------------------------------------------------------------------------
// Instance status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// At least one branch is executing.
    Active,
    /// Every live branch is waiting on external input or a timer.
    Suspended,
    Completed,
    Cancelled,
    Failed,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed | InstanceStatus::Cancelled | InstanceStatus::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Active => "active",
            InstanceStatus::Suspended => "suspended",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Cancelled => "cancelled",
            InstanceStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Failure taxonomy
// ---------------------------------------------------------------------------

/// Why a step or an instance ended unsuccessfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InvalidDefinition,
    HandlerFailure,
    NoMatchingBranch,
    ApprovalRejected,
    ApprovalExpired,
    TaskExpired,
    JoinTimeout,
    /// Cancelled by an operator through the admin surface.
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::InvalidDefinition => "invalid_definition",
            FailureKind::HandlerFailure => "handler_failure",
            FailureKind::NoMatchingBranch => "no_matching_branch",
            FailureKind::ApprovalRejected => "approval_rejected",
            FailureKind::ApprovalExpired => "approval_expired",
            FailureKind::TaskExpired => "task_expired",
            FailureKind::JoinTimeout => "join_timeout",
            FailureKind::Cancelled => "cancelled",
        }
    }

    /// Instance status this failure drives the instance into.
    pub fn terminal_status(&self) -> InstanceStatus {
        match self {
            FailureKind::ApprovalRejected | FailureKind::ApprovalExpired | FailureKind::Cancelled => {
                InstanceStatus::Cancelled
            }
            _ => InstanceStatus::Failed,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded failure: taxonomy kind plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl StepFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Terminal reason recorded on a failed or cancelled instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Termination {
    pub kind: FailureKind,
    pub message: String,
    /// Step that caused the termination, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Step executions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Suspended,
}

/// What a suspended execution is waiting for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Suspension {
    /// A task or approval work item.
    Work {
        work_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expires_at: Option<DateTime<Utc>>,
    },
    /// A delay timer.
    Timer { wake_at: DateTime<Utc> },
}

/// One execution of one step within an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    /// UUIDv7 execution id.
    pub id: Uuid,
    pub step_id: String,
    pub kind: StepKind,
    pub status: ExecutionStatus,
    /// 1-based attempt counter.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspension: Option<Suspension>,
}

impl StepExecution {
    pub fn running(step_id: impl Into<String>, kind: StepKind, attempt: u32) -> Self {
        Self {
            id: Uuid::now_v7(),
            step_id: step_id.into(),
            kind,
            status: ExecutionStatus::Running,
            attempt,
            started_at: Utc::now(),
            ended_at: None,
            result: None,
            error: None,
            suspension: None,
        }
    }

    pub fn work_id(&self) -> Option<Uuid> {
        match &self.suspension {
            Some(Suspension::Work { work_id, .. }) => Some(*work_id),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Joins
// ---------------------------------------------------------------------------

/// Arrival bookkeeping for one merge step.
///
/// A join resets each time it fires, so a merge inside a loop joins again
/// on every lap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingJoin {
    /// Number of distinct predecessor steps with an edge into the merge.
    pub expected: u32,
    /// Predecessor step ids that have arrived in the current lap.
    #[serde(default)]
    pub arrived: BTreeSet<String>,
    /// How many times the merge has been advanced.
    #[serde(default)]
    pub fired: u32,
}

impl PendingJoin {
    pub fn new(expected: u32) -> Self {
        Self {
            expected,
            arrived: BTreeSet::new(),
            fired: 0,
        }
    }

    /// Incoming branches not yet arrived in the current lap.
    pub fn remaining(&self) -> u32 {
        self.expected.saturating_sub(self.arrived.len() as u32)
    }

    /// Record an arrival from `predecessor`.
    ///
    /// Returns `true` on the arrival that completes the current lap and
    /// clears the arrivals for the next one. A repeated arrival from the
    /// same predecessor within a lap is ignored.
    pub fn arrive(&mut self, predecessor: &str) -> bool {
        self.arrived.insert(predecessor.to_string());
        if self.remaining() == 0 {
            self.arrived.clear();
            self.fired += 1;
            true
        } else {
            false
        }
    }

    /// Some but not all branches have arrived.
    pub fn is_partial(&self) -> bool {
        !self.arrived.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Workflow instance
// ---------------------------------------------------------------------------

/// One triggered execution of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub definition_id: Uuid,
    /// Denormalized for display and filtering.
    pub definition_name: String,
    pub status: InstanceStatus,
    /// Trigger input. Read-only for the life of the instance.
    pub context: Value,
    /// Mutable scratch space seeded from the definition defaults.
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub running_steps: Vec<StepExecution>,
    #[serde(default)]
    pub completed_steps: Vec<StepExecution>,
    #[serde(default)]
    pub failed_steps: Vec<StepExecution>,
    /// merge step id -> join bookkeeping.
    #[serde(default)]
    pub pending_joins: BTreeMap<String, PendingJoin>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination: Option<Termination>,
    /// Optimistic concurrency version, bumped by every successful save.
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    pub fn new(
        definition_id: Uuid,
        definition_name: impl Into<String>,
        context: Value,
        variables: Map<String, Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            definition_id,
            definition_name: definition_name.into(),
            status: InstanceStatus::Active,
            context,
            variables,
            running_steps: Vec::new(),
            completed_steps: Vec::new(),
            failed_steps: Vec::new(),
            pending_joins: BTreeMap::new(),
            termination: None,
            version: 0,
            created_at: now,
            updated_at: now,
            ended_at: None,
        }
    }

    /// Total executions recorded so far, across all logs.
    pub fn execution_count(&self) -> usize {
        self.running_steps.len() + self.completed_steps.len() + self.failed_steps.len()
    }

    /// Running execution by its id.
    pub fn running_mut(&mut self, execution_id: Uuid) -> Option<&mut StepExecution> {
        self.running_steps.iter_mut().find(|e| e.id == execution_id)
    }

    /// Oldest suspended execution for `step_id`.
    pub fn suspended_execution(&self, step_id: &str) -> Option<&StepExecution> {
        self.running_steps
            .iter()
            .find(|e| e.step_id == step_id && e.status == ExecutionStatus::Suspended)
    }

    /// Whether any branch is still executing a handler.
    pub fn has_running(&self) -> bool {
        self.running_steps
            .iter()
            .any(|e| e.status == ExecutionStatus::Running)
    }

    /// Whether any branch is parked on work or a timer.
    pub fn has_suspended(&self) -> bool {
        self.running_steps
            .iter()
            .any(|e| e.status == ExecutionStatus::Suspended)
    }

    /// Whether a suspended execution of the given kind exists.
    pub fn is_suspended_on(&self, kind: StepKind) -> bool {
        self.running_steps
            .iter()
            .any(|e| e.kind == kind && e.status == ExecutionStatus::Suspended)
    }

    /// Take a running/suspended execution out of `running_steps`.
    pub fn take_running(&mut self, execution_id: Uuid) -> Option<StepExecution> {
        let pos = self.running_steps.iter().position(|e| e.id == execution_id)?;
        Some(self.running_steps.remove(pos))
    }

    /// Move an execution into the completed log.
    pub fn record_completed(&mut self, mut execution: StepExecution, result: Value) {
        execution.status = ExecutionStatus::Completed;
        execution.ended_at = Some(Utc::now());
        execution.result = Some(result);
        execution.suspension = None;
        self.completed_steps.push(execution);
    }

    /// Move an execution into the failed log.
    pub fn record_failed(&mut self, mut execution: StepExecution, failure: StepFailure) {
        execution.status = ExecutionStatus::Failed;
        execution.ended_at = Some(Utc::now());
        execution.error = Some(failure);
        execution.suspension = None;
        self.failed_steps.push(execution);
    }

    /// Put the instance into its terminal state for `failure`.
    ///
    /// The first termination wins; later calls leave it untouched.
    pub fn terminate(&mut self, failure: &StepFailure, step_id: Option<&str>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = failure.kind.terminal_status();
        self.termination = Some(Termination {
            kind: failure.kind,
            message: failure.message.clone(),
            step_id: step_id.map(str::to_string),
        });
        self.ended_at = Some(Utc::now());
    }
}

// ---------------------------------------------------------------------------
// Pending work
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
    Task,
    Approval,
}

impl WorkKind {
    pub fn step_kind(&self) -> StepKind {
        match self {
            WorkKind::Task => StepKind::Task,
            WorkKind::Approval => StepKind::Approval,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Pending,
    Completed,
    Approved,
    Rejected,
    Expired,
}

impl WorkStatus {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, WorkStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::Pending => "pending",
            WorkStatus::Completed => "completed",
            WorkStatus::Approved => "approved",
            WorkStatus::Rejected => "rejected",
            WorkStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An approver's verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    Reject,
}

impl std::str::FromStr for ApprovalDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "approve" | "approved" => Ok(ApprovalDecision::Approve),
            "reject" | "rejected" => Ok(ApprovalDecision::Reject),
            other => Err(format!("unknown approval decision: '{other}'")),
        }
    }
}

/// A task or approval handed to a human, created when its step suspends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWork {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub step_id: String,
    pub kind: WorkKind,
    /// Assignee for tasks, approver for approvals.
    pub assignee: String,
    pub status: WorkStatus,
    /// Resolved step payload handed to the collaborator.
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    /// Task result, or `{ decision, comments }` for approvals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Value>,
}

impl PendingWork {
    /// Mark the item resolved. Resolution is one-way.
    pub fn resolve(&mut self, status: WorkStatus, resolution: Option<Value>) {
        self.status = status;
        self.resolved_at = Some(Utc::now());
        self.resolution = resolution;
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
