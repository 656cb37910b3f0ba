//! Execution engine: drives workflow instances through their step graph.
//!
//! Every mutation of an instance happens while holding that instance's lock
//! (a `tokio::sync::Mutex` kept in a `DashMap`). Step handlers run outside the
//! lock on a snapshot, so sibling branches of one instance execute
//! concurrently and only serialize when recording their outcomes.
//!
//! Scheduling model:
//! 1. A step about to run is recorded as a `Running` execution under the lock.
//! 2. A `JoinSet` task picks it up, snapshots the instance and runs the handler.
//! 3. The outcome is applied under the lock; successors (after merge join
//!    counting) are recorded as new `Running` executions and spawned.
//! 4. When no task is left the instance is finalized: `Suspended` if some
//!    branch waits on work or a timer, `Completed` if every branch ended.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde_json::{Value, json};
use talentflow_types::config::EngineConfig;
use talentflow_types::error::RepositoryError;
use talentflow_types::event::WorkflowEvent;
use talentflow_types::instance::{
    ExecutionStatus, FailureKind, InstanceStatus, PendingJoin, PendingWork, StepExecution,
    StepFailure, Suspension, WorkStatus, WorkflowInstance,
};
use talentflow_types::workflow::{Step, StepKind, WorkflowDefinition};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinSet;
use uuid::Uuid;

use super::collaborator::Collaborators;
use super::definition::WorkflowError;
use super::graph::ValidatedDefinition;
use super::handlers::{HandlerOutcome, HandlerReport, StepInput, StepRunner, expiry_outcome};
use crate::event::EventBus;
use crate::repository::InstanceStore;

// ---------------------------------------------------------------------------
// Errors and outcomes
// ---------------------------------------------------------------------------

/// Infrastructure-level engine errors. Step failures are not errors; they
/// are recorded on the instance.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Definition(#[from] WorkflowError),

    #[error("workflow definition {0} is not registered")]
    UnknownDefinition(Uuid),

    #[error("instance {0} not found")]
    InstanceNotFound(Uuid),

    #[error("step '{step_id}' of instance {instance_id} is not suspended")]
    NotSuspended { instance_id: Uuid, step_id: String },

    #[error("step '{0}' is not part of the definition")]
    UnknownStep(String),
}

/// How a suspended step is brought back into execution.
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeOutcome {
    /// Task completed, approval granted, or timer fired.
    Completed { result: Value },
    /// Approval rejected; cancels the instance.
    Rejected { reason: String },
    /// The deadline passed; escalates or terminates.
    Expired,
}

impl ResumeOutcome {
    /// Outcome implied by a resolved work item, `None` while still pending.
    pub fn from_work(work: &PendingWork) -> Option<Self> {
        let resolution = work.resolution.clone().unwrap_or(Value::Null);
        match work.status {
            WorkStatus::Pending => None,
            WorkStatus::Completed | WorkStatus::Approved => {
                Some(ResumeOutcome::Completed { result: resolution })
            }
            WorkStatus::Rejected => {
                let reason = resolution
                    .get("comments")
                    .and_then(Value::as_str)
                    .filter(|c| !c.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("approval '{}' was rejected", work.step_id));
                Some(ResumeOutcome::Rejected { reason })
            }
            WorkStatus::Expired => Some(ResumeOutcome::Expired),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

struct EngineInner<S> {
    store: S,
    runner: StepRunner,
    events: EventBus,
    config: EngineConfig,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
    definitions: DashMap<Uuid, Arc<ValidatedDefinition>>,
}

/// The execution engine. Cheap to clone; clones share all state.
pub struct WorkflowEngine<S: InstanceStore> {
    inner: Arc<EngineInner<S>>,
}

impl<S: InstanceStore> Clone for WorkflowEngine<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: InstanceStore> std::fmt::Debug for WorkflowEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("definitions", &self.inner.definitions.len())
            .field("locked_instances", &self.inner.locks.len())
            .finish()
    }
}

impl<S: InstanceStore> WorkflowEngine<S> {
    pub fn new(store: S, collaborators: Collaborators, config: EngineConfig) -> Self {
        let events = EventBus::new(config.event_capacity);
        Self {
            inner: Arc::new(EngineInner {
                store,
                runner: StepRunner::new(collaborators),
                events,
                config,
                locks: DashMap::new(),
                definitions: DashMap::new(),
            }),
        }
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Validate, persist, and register a definition.
    pub async fn activate(
        &self,
        def: WorkflowDefinition,
    ) -> Result<Arc<ValidatedDefinition>, EngineError> {
        let validated = Arc::new(ValidatedDefinition::new(def)?);
        self.register(Arc::clone(&validated)).await?;
        Ok(validated)
    }

    /// Persist and register an already validated definition.
    pub async fn register(&self, def: Arc<ValidatedDefinition>) -> Result<(), EngineError> {
        self.inner.store.save_definition(def.definition()).await?;
        tracing::info!(
            definition_id = %def.id(),
            workflow = def.name(),
            version = %def.definition().version,
            "workflow definition activated"
        );
        self.inner.definitions.insert(def.id(), def);
        Ok(())
    }

    /// Registered definition by id, reloading from the store after a restart.
    pub async fn definition(&self, id: Uuid) -> Result<Arc<ValidatedDefinition>, EngineError> {
        let cached = self.inner.definitions.get(&id).map(|d| Arc::clone(&d));
        if let Some(def) = cached {
            return Ok(def);
        }
        let stored = self
            .inner
            .store
            .load_definition(&id)
            .await?
            .ok_or(EngineError::UnknownDefinition(id))?;
        let validated = Arc::new(ValidatedDefinition::new(stored)?);
        self.inner.definitions.insert(id, Arc::clone(&validated));
        Ok(validated)
    }

    // -----------------------------------------------------------------------
    // Locking and persistence helpers
    // -----------------------------------------------------------------------

    /// Acquire the per-instance lock.
    pub(crate) async fn lock_instance(&self, id: Uuid) -> OwnedMutexGuard<()> {
        let lock = self
            .inner
            .locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drop the lock entry of a finished instance if nobody holds it.
    fn forget_lock(&self, id: Uuid) {
        self.inner
            .locks
            .remove_if(&id, |_, lock| Arc::strong_count(lock) == 1);
    }

    async fn load(&self, id: Uuid) -> Result<WorkflowInstance, EngineError> {
        self.inner
            .store
            .load(&id)
            .await?
            .ok_or(EngineError::InstanceNotFound(id))
    }

    async fn persist(&self, instance: &mut WorkflowInstance) -> Result<(), EngineError> {
        instance.updated_at = Utc::now();
        instance.version = self.inner.store.save(instance).await?;
        Ok(())
    }

    fn publish_all(&self, events: Vec<WorkflowEvent>) {
        for event in events {
            self.inner.events.publish(event);
        }
    }

    // -----------------------------------------------------------------------
    // Public operations
    // -----------------------------------------------------------------------

    /// Create an instance and run it until every branch has completed,
    /// suspended, or the instance has terminated.
    pub async fn start(&self, definition_id: Uuid, context: Value) -> Result<Uuid, EngineError> {
        self.start_with_trigger(definition_id, context, "manual").await
    }

    /// `start`, recording what triggered the instance.
    pub async fn start_with_trigger(
        &self,
        definition_id: Uuid,
        context: Value,
        trigger: &str,
    ) -> Result<Uuid, EngineError> {
        let def = self.definition(definition_id).await?;
        let mut instance = WorkflowInstance::new(
            def.id(),
            def.name(),
            context,
            def.definition().variables.clone(),
        );
        for (merge_id, fan_in) in def.merges() {
            instance
                .pending_joins
                .insert(merge_id.to_string(), PendingJoin::new(fan_in as u32));
        }
        let start = def.start();
        let exec = StepExecution::running(start.id.clone(), start.kind(), 1);
        let scheduled = vec![exec.id];
        instance.running_steps.push(exec);

        self.inner.store.create(&instance).await?;
        tracing::info!(
            instance_id = %instance.id,
            workflow = def.name(),
            trigger,
            "workflow instance started"
        );
        self.inner.events.publish(WorkflowEvent::InstanceStarted {
            instance_id: instance.id,
            workflow_name: def.name().to_string(),
            trigger: trigger.to_string(),
        });

        self.drive(instance.id, def, scheduled).await?;
        Ok(instance.id)
    }

    /// Run `step_id` on an existing, non-terminal instance and everything
    /// downstream of it.
    pub async fn advance(
        &self,
        instance_id: Uuid,
        step_id: &str,
    ) -> Result<InstanceStatus, EngineError> {
        let (def, scheduled) = {
            let _guard = self.lock_instance(instance_id).await;
            let mut instance = self.load(instance_id).await?;
            if instance.status.is_terminal() {
                return Ok(instance.status);
            }
            let def = self.definition(instance.definition_id).await?;
            let scheduled = Self::schedule(&mut instance, &def, [step_id.to_string()]);
            self.persist(&mut instance).await?;
            (def, scheduled)
        };
        self.drive(instance_id, def, scheduled).await
    }

    /// Record the arrival of `from_step` at each successor and return the
    /// successors that are ready to run.
    ///
    /// Non-merge successors are always ready. A merge step is ready on the
    /// arrival that completes its distinct-predecessor count, once per lap.
    pub fn execute_next(
        &self,
        instance: &mut WorkflowInstance,
        def: &ValidatedDefinition,
        from_step: &str,
        successors: Vec<String>,
    ) -> Vec<String> {
        let mut ready = Vec::with_capacity(successors.len());
        for succ in successors {
            let Some(step) = def.step(&succ) else {
                tracing::warn!(instance_id = %instance.id, step_id = %succ, "successor not in definition");
                continue;
            };
            if step.kind() != StepKind::Merge {
                ready.push(succ);
                continue;
            }

            let expected = def.graph().fan_in(&succ) as u32;
            let join = instance
                .pending_joins
                .entry(succ.clone())
                .or_insert_with(|| PendingJoin::new(expected));
            let fired = join.arrive(from_step);
            let remaining = join.remaining();
            tracing::debug!(
                instance_id = %instance.id,
                merge_step_id = %succ,
                from_step_id = from_step,
                remaining,
                fired,
                "branch arrived at merge"
            );
            self.inner.events.publish(WorkflowEvent::JoinArrived {
                instance_id: instance.id,
                merge_step_id: succ.clone(),
                from_step_id: from_step.to_string(),
                remaining,
            });
            if fired {
                ready.push(succ);
            }
        }
        ready
    }

    /// Re-enter a suspended step with `outcome` and continue from there.
    ///
    /// A no-op on terminal instances. Fails with `NotSuspended` if the step
    /// has no suspended execution.
    pub async fn resume(
        &self,
        instance_id: Uuid,
        step_id: &str,
        outcome: ResumeOutcome,
    ) -> Result<InstanceStatus, EngineError> {
        let (def, scheduled) = {
            let _guard = self.lock_instance(instance_id).await;
            let mut instance = self.load(instance_id).await?;
            if instance.status.is_terminal() {
                tracing::debug!(%instance_id, step_id, "resume on terminal instance ignored");
                return Ok(instance.status);
            }
            let exec_id = instance
                .suspended_execution(step_id)
                .map(|e| e.id)
                .ok_or_else(|| EngineError::NotSuspended {
                    instance_id,
                    step_id: step_id.to_string(),
                })?;
            let def = self.definition(instance.definition_id).await?;
            let Some(step) = def.step(step_id) else {
                return Err(EngineError::UnknownStep(step_id.to_string()));
            };
            let Some(mut exec) = instance.take_running(exec_id) else {
                return Err(EngineError::NotSuspended {
                    instance_id,
                    step_id: step_id.to_string(),
                });
            };

            let expires_at = match &exec.suspension {
                Some(Suspension::Work { expires_at, .. }) => *expires_at,
                _ => None,
            };
            let outcome = match outcome {
                ResumeOutcome::Completed { result } => {
                    // Delays wake without output; work results land under
                    // the output key, defaulting to the step id.
                    let writes = if step.kind() == StepKind::Delay {
                        Vec::new()
                    } else {
                        let key = step.config.output_key().unwrap_or(&step.id);
                        vec![(key.to_string(), result.clone())]
                    };
                    HandlerOutcome::Completed {
                        result,
                        writes,
                        successors: step.next.clone(),
                    }
                }
                ResumeOutcome::Rejected { reason } => {
                    HandlerOutcome::Failed(StepFailure::new(FailureKind::ApprovalRejected, reason))
                }
                ResumeOutcome::Expired => {
                    tracing::warn!(%instance_id, step_id, "work expired before resolution");
                    expiry_outcome(step, expires_at)
                }
            };

            instance.status = InstanceStatus::Active;
            exec.status = ExecutionStatus::Running;
            let mut events = Vec::new();
            let scheduled = self
                .record_outcome(&mut instance, &def, exec, step, outcome, &mut events)
                .await?;
            self.persist(&mut instance).await?;
            self.publish_all(events);
            (def, scheduled)
        };
        self.drive(instance_id, def, scheduled).await
    }

    pub async fn get_instance(&self, id: Uuid) -> Result<WorkflowInstance, EngineError> {
        self.load(id).await
    }

    /// Cancel an instance. Idempotent: a terminal instance is returned as is.
    ///
    /// Suspended executions move to the failed log and outstanding work items
    /// are expired, so late resolutions become no-ops.
    pub async fn cancel_instance(
        &self,
        id: Uuid,
        reason: &str,
    ) -> Result<InstanceStatus, EngineError> {
        let _guard = self.lock_instance(id).await;
        let mut instance = self.load(id).await?;
        if instance.status.is_terminal() {
            return Ok(instance.status);
        }
        let failure = StepFailure::new(FailureKind::Cancelled, reason);
        instance.terminate(&failure, None);
        self.close_outstanding(&mut instance).await?;
        self.persist(&mut instance).await?;
        tracing::info!(instance_id = %id, reason, "workflow instance cancelled");
        self.publish_all(termination_event(&instance).into_iter().collect());
        Ok(instance.status)
    }

    /// `Failed` instances that ended in `[from, to)`.
    pub async fn list_failed(
        &self,
        definition_id: Option<Uuid>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<WorkflowInstance>, EngineError> {
        Ok(self
            .inner
            .store
            .list_failed(definition_id.as_ref(), from, to)
            .await?)
    }

    /// Delete terminal instances older than the retention window.
    pub async fn archive_terminal(&self, now: DateTime<Utc>) -> Result<u64, EngineError> {
        let cutoff = now - Duration::days(i64::from(self.inner.config.retention_days));
        let removed = self.inner.store.delete_terminal_before(cutoff).await?;
        if removed > 0 {
            tracing::info!(removed, %cutoff, "archived terminal instances");
        }
        Ok(removed)
    }

    /// Re-drive work interrupted by a crash.
    ///
    /// Executions left `Running` are run again with their attempt counter
    /// incremented. Suspended executions whose work item was resolved but
    /// never resumed are resumed with the recorded resolution. Returns the
    /// number of executions recovered.
    pub async fn recover(&self) -> Result<usize, EngineError> {
        let mut recovered = 0;
        for instance in self.inner.store.list_active().await? {
            let id = instance.id;
            let rerun: Vec<Uuid> = instance
                .running_steps
                .iter()
                .filter(|e| e.status == ExecutionStatus::Running)
                .map(|e| e.id)
                .collect();
            if !rerun.is_empty() {
                let (def, scheduled) = {
                    let _guard = self.lock_instance(id).await;
                    let mut current = self.load(id).await?;
                    for exec in current
                        .running_steps
                        .iter_mut()
                        .filter(|e| rerun.contains(&e.id))
                    {
                        exec.attempt += 1;
                        exec.started_at = Utc::now();
                    }
                    self.persist(&mut current).await?;
                    (self.definition(current.definition_id).await?, rerun)
                };
                tracing::info!(instance_id = %id, executions = scheduled.len(), "re-driving interrupted steps");
                recovered += scheduled.len();
                self.drive(id, def, scheduled).await?;
            }

            for exec in instance
                .running_steps
                .iter()
                .filter(|e| e.status == ExecutionStatus::Suspended)
            {
                let Some(work_id) = exec.work_id() else {
                    continue;
                };
                let Some(work) = self.inner.store.load_work(&work_id).await? else {
                    continue;
                };
                if let Some(outcome) = ResumeOutcome::from_work(&work) {
                    tracing::info!(instance_id = %id, step_id = %exec.step_id, "resuming resolved work");
                    match self.resume(id, &exec.step_id, outcome).await {
                        Ok(_) => recovered += 1,
                        Err(EngineError::NotSuspended { .. }) => {}
                        Err(err) => return Err(err),
                    }
                }
            }
        }
        Ok(recovered)
    }

    // -----------------------------------------------------------------------
    // Driver
    // -----------------------------------------------------------------------

    /// Record `step_ids` as running executions; returns their ids.
    fn schedule(
        instance: &mut WorkflowInstance,
        def: &ValidatedDefinition,
        step_ids: impl IntoIterator<Item = String>,
    ) -> Vec<Uuid> {
        let mut scheduled = Vec::new();
        for step_id in step_ids {
            let Some(step) = def.step(&step_id) else {
                continue;
            };
            let exec = StepExecution::running(step_id, step.kind(), 1);
            scheduled.push(exec.id);
            instance.running_steps.push(exec);
        }
        scheduled
    }

    /// Run scheduled executions and everything they schedule, then finalize.
    async fn drive(
        &self,
        instance_id: Uuid,
        def: Arc<ValidatedDefinition>,
        scheduled: Vec<Uuid>,
    ) -> Result<InstanceStatus, EngineError> {
        let mut tasks = JoinSet::new();
        for exec_id in scheduled {
            let engine = self.clone();
            let def = Arc::clone(&def);
            tasks.spawn(async move { engine.run_execution(instance_id, &def, exec_id).await });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(next)) => {
                    for exec_id in next {
                        let engine = self.clone();
                        let def = Arc::clone(&def);
                        tasks.spawn(async move {
                            engine.run_execution(instance_id, &def, exec_id).await
                        });
                    }
                }
                Ok(Err(err)) => {
                    tracing::error!(%instance_id, error = %err, "branch aborted");
                    first_error.get_or_insert(err);
                }
                Err(join_err) => {
                    tracing::error!(%instance_id, error = %join_err, "branch task panicked");
                }
            }
        }

        let status = self.finalize(instance_id).await?;
        match first_error {
            Some(err) => Err(err),
            None => Ok(status),
        }
    }

    /// Run one scheduled execution and apply its outcome.
    async fn run_execution(
        &self,
        instance_id: Uuid,
        def: &ValidatedDefinition,
        exec_id: Uuid,
    ) -> Result<Vec<Uuid>, EngineError> {
        let (snapshot, step, attempt) = {
            let _guard = self.lock_instance(instance_id).await;
            let mut instance = self.load(instance_id).await?;
            let Some(exec) = instance.running_steps.iter().find(|e| e.id == exec_id) else {
                return Ok(Vec::new());
            };
            let (step_id, attempt) = (exec.step_id.clone(), exec.attempt);
            let Some(step) = def.step(&step_id) else {
                return Ok(Vec::new());
            };

            if instance.status.is_terminal() {
                if let Some(exec) = instance.take_running(exec_id) {
                    instance.record_failed(
                        exec,
                        StepFailure::new(FailureKind::Cancelled, "instance ended before the step ran"),
                    );
                    self.persist(&mut instance).await?;
                }
                return Ok(Vec::new());
            }

            let limit = self.inner.config.max_steps_per_instance as usize;
            if instance.execution_count() > limit {
                let mut events = Vec::new();
                if let Some(exec) = instance.take_running(exec_id) {
                    let failure = StepFailure::new(
                        FailureKind::HandlerFailure,
                        format!("instance exceeded the limit of {limit} step executions"),
                    );
                    self.fail_branch(&mut instance, exec, &step.id, failure, &mut events)
                        .await?;
                }
                self.persist(&mut instance).await?;
                self.publish_all(events);
                return Ok(Vec::new());
            }

            (instance, step, attempt)
        };

        tracing::debug!(%instance_id, step_id = %step.id, kind = %step.kind(), attempt, "dispatching step");
        self.inner.events.publish(WorkflowEvent::StepStarted {
            instance_id,
            step_id: step.id.clone(),
            kind: step.kind(),
            attempt,
        });

        let report = self
            .inner
            .runner
            .run(StepInput {
                instance: &snapshot,
                step,
                definition: def,
                now: Utc::now(),
            })
            .await;
        drop(snapshot);

        self.apply(instance_id, def, exec_id, step, report).await
    }

    /// Apply a handler report under the lock; returns newly scheduled executions.
    async fn apply(
        &self,
        instance_id: Uuid,
        def: &ValidatedDefinition,
        exec_id: Uuid,
        step: &Step,
        report: HandlerReport,
    ) -> Result<Vec<Uuid>, EngineError> {
        let _guard = self.lock_instance(instance_id).await;
        let mut instance = self.load(instance_id).await?;
        let Some(mut exec) = instance.take_running(exec_id) else {
            tracing::warn!(%instance_id, step_id = %step.id, "execution vanished before its outcome was applied");
            return Ok(Vec::new());
        };
        exec.attempt += report.attempts.saturating_sub(1);

        // Already-running branches of a terminated instance may finish their
        // handler call but are not advanced.
        if instance.status.is_terminal() {
            match report.outcome {
                HandlerOutcome::Completed { result, .. } => instance.record_completed(exec, result),
                HandlerOutcome::Suspended { work, .. } => {
                    if let Some(mut work) = work {
                        work.resolve(WorkStatus::Expired, None);
                        self.inner.store.save_work(&work).await?;
                    }
                    instance.record_failed(
                        exec,
                        StepFailure::new(FailureKind::Cancelled, "instance ended while the step was running"),
                    );
                }
                HandlerOutcome::Failed(failure) => instance.record_failed(exec, failure),
            }
            self.persist(&mut instance).await?;
            return Ok(Vec::new());
        }

        let mut events = Vec::new();
        let scheduled = self
            .record_outcome(&mut instance, def, exec, step, report.outcome, &mut events)
            .await?;
        self.persist(&mut instance).await?;
        self.publish_all(events);
        Ok(scheduled)
    }

    /// Move `exec` into the log matching `outcome` and schedule successors.
    async fn record_outcome(
        &self,
        instance: &mut WorkflowInstance,
        def: &ValidatedDefinition,
        mut exec: StepExecution,
        step: &Step,
        outcome: HandlerOutcome,
        events: &mut Vec<WorkflowEvent>,
    ) -> Result<Vec<Uuid>, EngineError> {
        let instance_id = instance.id;
        match outcome {
            HandlerOutcome::Completed {
                result,
                writes,
                successors,
            } => {
                let duration_ms = (Utc::now() - exec.started_at).num_milliseconds().max(0) as u64;
                for (key, value) in writes {
                    instance.variables.insert(key, value);
                }
                instance.record_completed(exec, result);
                events.push(WorkflowEvent::StepCompleted {
                    instance_id,
                    step_id: step.id.clone(),
                    duration_ms,
                });
                let ready = self.execute_next(instance, def, &step.id, successors);
                Ok(Self::schedule(instance, def, ready))
            }
            HandlerOutcome::Suspended { suspension, work } => {
                if let Some(work) = &work {
                    self.inner.store.save_work(work).await?;
                }
                let work_id = work.as_ref().map(|w| w.id);
                tracing::debug!(%instance_id, step_id = %step.id, ?work_id, "step suspended");
                exec.status = ExecutionStatus::Suspended;
                exec.suspension = Some(suspension);
                instance.running_steps.push(exec);
                events.push(WorkflowEvent::StepSuspended {
                    instance_id,
                    step_id: step.id.clone(),
                    work_id,
                });
                Ok(Vec::new())
            }
            HandlerOutcome::Failed(failure) => {
                self.fail_branch(instance, exec, &step.id, failure, events)
                    .await?;
                Ok(Vec::new())
            }
        }
    }

    /// Record a failed execution and terminate the instance.
    async fn fail_branch(
        &self,
        instance: &mut WorkflowInstance,
        exec: StepExecution,
        step_id: &str,
        failure: StepFailure,
        events: &mut Vec<WorkflowEvent>,
    ) -> Result<(), EngineError> {
        tracing::warn!(
            instance_id = %instance.id,
            step_id,
            kind = failure.kind.as_str(),
            error = %failure.message,
            "step failed"
        );
        events.push(WorkflowEvent::StepFailed {
            instance_id: instance.id,
            step_id: step_id.to_string(),
            kind: failure.kind,
            error: failure.message.clone(),
        });
        instance.record_failed(exec, failure.clone());
        instance.terminate(&failure, Some(step_id));
        self.close_outstanding(instance).await?;
        events.extend(termination_event(instance));
        Ok(())
    }

    /// Expire outstanding work and close suspended executions of a
    /// terminated instance.
    async fn close_outstanding(&self, instance: &mut WorkflowInstance) -> Result<(), EngineError> {
        let reason = format!("instance {}", instance.status);
        let (suspended, running): (Vec<_>, Vec<_>) = std::mem::take(&mut instance.running_steps)
            .into_iter()
            .partition(|e| e.status == ExecutionStatus::Suspended);
        instance.running_steps = running;
        for exec in suspended {
            instance.record_failed(exec, StepFailure::new(FailureKind::Cancelled, reason.clone()));
        }

        for mut work in self.inner.store.list_work(&instance.id).await? {
            if work.status == WorkStatus::Pending {
                work.resolve(WorkStatus::Expired, Some(json!({ "reason": reason })));
                self.inner.store.save_work(&work).await?;
            }
        }
        Ok(())
    }

    /// Settle the instance status once no branch of this driver is left.
    async fn finalize(&self, instance_id: Uuid) -> Result<InstanceStatus, EngineError> {
        let guard = self.lock_instance(instance_id).await;
        let mut instance = self.load(instance_id).await?;
        if instance.status.is_terminal() {
            drop(guard);
            self.forget_lock(instance_id);
            return Ok(instance.status);
        }
        // Another driver still owns running branches and will finalize.
        if instance.has_running() {
            return Ok(instance.status);
        }

        let stalled = instance
            .pending_joins
            .iter()
            .find(|(_, j)| j.is_partial())
            .map(|(id, j)| (id.clone(), j.arrived.len(), j.expected));

        let mut events = Vec::new();
        if instance.has_suspended() {
            if instance.status == InstanceStatus::Suspended {
                return Ok(instance.status);
            }
            instance.status = InstanceStatus::Suspended;
            tracing::info!(%instance_id, "workflow instance suspended");
            events.push(WorkflowEvent::InstanceSuspended { instance_id });
        } else if let Some((merge_id, arrived, expected)) = stalled {
            let failure = StepFailure::new(
                FailureKind::JoinTimeout,
                format!(
                    "merge '{merge_id}' received {arrived} of {expected} branches and no branch can still arrive"
                ),
            );
            tracing::warn!(%instance_id, merge_step_id = %merge_id, "join stalled");
            instance.terminate(&failure, Some(&merge_id));
            self.close_outstanding(&mut instance).await?;
            events.extend(termination_event(&instance));
        } else {
            instance.status = InstanceStatus::Completed;
            instance.ended_at = Some(Utc::now());
            tracing::info!(
                %instance_id,
                workflow = %instance.definition_name,
                steps = instance.completed_steps.len(),
                "workflow instance completed"
            );
            events.push(WorkflowEvent::InstanceCompleted {
                instance_id,
                workflow_name: instance.definition_name.clone(),
                steps_completed: instance.completed_steps.len() as u32,
            });
        }

        self.persist(&mut instance).await?;
        drop(guard);
        if instance.status.is_terminal() {
            self.forget_lock(instance_id);
        }
        self.publish_all(events);
        Ok(instance.status)
    }
}

fn termination_event(instance: &WorkflowInstance) -> Option<WorkflowEvent> {
    let termination = instance.termination.as_ref()?;
    match instance.status {
        InstanceStatus::Cancelled => Some(WorkflowEvent::InstanceCancelled {
            instance_id: instance.id,
            kind: termination.kind,
            reason: termination.message.clone(),
        }),
        InstanceStatus::Failed => Some(WorkflowEvent::InstanceFailed {
            instance_id: instance.id,
            kind: termination.kind,
            error: termination.message.clone(),
        }),
        _ => None,
    }
}
