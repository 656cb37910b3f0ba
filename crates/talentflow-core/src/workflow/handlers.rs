//! Step handlers: one dispatch arm per step kind.
//!
//! A handler sees a snapshot of the instance and returns what happened:
//! completed with a result and the successors to follow, suspended on work or
//! a timer, or failed. Handlers never touch stored state; the engine applies
//! the outcome under the instance lock.

use chrono::{DateTime, Duration, Utc};
use serde_json::{Value, json};
use talentflow_types::instance::{
    FailureKind, PendingWork, StepFailure, Suspension, WorkKind, WorkStatus, WorkflowInstance,
};
use talentflow_types::workflow::{RetryPolicy, Step, StepConfig, StepKind};
use uuid::Uuid;

use super::collaborator::{
    ApiRequest, CollaboratorError, Collaborators, NotificationRequest, WorkRequest,
};
use super::condition::ConditionEvaluator;
use super::graph::ValidatedDefinition;
use super::resolver::{VariableResolver, value_to_string};
use super::retry::with_retry;

/// Everything a handler may read.
#[derive(Debug, Clone, Copy)]
pub struct StepInput<'a> {
    pub instance: &'a WorkflowInstance,
    pub step: &'a Step,
    pub definition: &'a ValidatedDefinition,
    pub now: DateTime<Utc>,
}

impl<'a> StepInput<'a> {
    fn resolver(&self) -> VariableResolver<'a> {
        VariableResolver::new(&self.instance.variables, &self.instance.context)
    }
}

/// What a handler run produced.
#[derive(Debug, Clone)]
pub enum HandlerOutcome {
    Completed {
        result: Value,
        /// Variable writes applied to the instance.
        writes: Vec<(String, Value)>,
        /// Successors to follow, in order.
        successors: Vec<String>,
    },
    Suspended {
        suspension: Suspension,
        /// Work item to persist for tasks and approvals.
        work: Option<PendingWork>,
    },
    Failed(StepFailure),
}

impl HandlerOutcome {
    fn completed(result: Value, successors: Vec<String>) -> Self {
        HandlerOutcome::Completed {
            result,
            writes: Vec::new(),
            successors,
        }
    }

    fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        HandlerOutcome::Failed(StepFailure::new(kind, message))
    }
}

/// A handler outcome plus the number of collaborator attempts it took.
#[derive(Debug, Clone)]
pub struct HandlerReport {
    pub outcome: HandlerOutcome,
    pub attempts: u32,
}

impl From<HandlerOutcome> for HandlerReport {
    fn from(outcome: HandlerOutcome) -> Self {
        Self {
            outcome,
            attempts: 1,
        }
    }
}

/// Outcome for a task/approval whose deadline passed without resolution.
///
/// Takes the escalation edge when the step has one; otherwise the branch
/// terminates with `ApprovalExpired` or `TaskExpired`.
pub fn expiry_outcome(step: &Step, expired_at: Option<DateTime<Utc>>) -> HandlerOutcome {
    if let Some(escalation) = step.config.escalation() {
        return HandlerOutcome::completed(
            json!({ "expired": true, "expires_at": expired_at, "escalated_to": escalation }),
            vec![escalation.to_string()],
        );
    }
    let kind = match step.kind() {
        StepKind::Approval => FailureKind::ApprovalExpired,
        _ => FailureKind::TaskExpired,
    };
    HandlerOutcome::failed(
        kind,
        format!("{} '{}' expired without a decision", step.kind(), step.id),
    )
}

// ---------------------------------------------------------------------------
// StepRunner
// ---------------------------------------------------------------------------

/// Executes individual steps by dispatching to kind-specific handlers.
pub struct StepRunner {
    collaborators: Collaborators,
    conditions: ConditionEvaluator,
}

impl StepRunner {
    pub fn new(collaborators: Collaborators) -> Self {
        Self {
            collaborators,
            conditions: ConditionEvaluator::new(),
        }
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    /// Run one step.
    pub async fn run(&self, input: StepInput<'_>) -> HandlerReport {
        let step = input.step;
        match &step.config {
            StepConfig::Start | StepConfig::Merge => {
                HandlerOutcome::completed(Value::Null, step.next.clone()).into()
            }
            StepConfig::End => HandlerOutcome::completed(Value::Null, Vec::new()).into(),
            StepConfig::Task {
                assignee,
                title,
                payload,
                due_in_secs,
                ..
            } => {
                let expires_at = due_in_secs.map(|s| input.now + secs(s));
                self.run_work(input, WorkKind::Task, assignee, title.as_deref(), payload, expires_at)
                    .await
                    .into()
            }
            StepConfig::Approval {
                approver,
                prompt,
                payload,
                expires_in_secs,
                expires_at,
                ..
            } => {
                let expires_at = expires_at.or(expires_in_secs.map(|s| input.now + secs(s)));
                self.run_work(input, WorkKind::Approval, approver, prompt.as_deref(), payload, expires_at)
                    .await
                    .into()
            }
            StepConfig::Notification {
                channel,
                recipients,
                template,
                data,
                ..
            } => self
                .run_notification(input, channel, recipients, template, data)
                .await
                .into(),
            StepConfig::ApiCall {
                service,
                method,
                path,
                headers,
                body,
                retry,
                ..
            } => {
                let resolver = input.resolver();
                let request = ApiRequest {
                    service: service.clone(),
                    method: method.to_ascii_uppercase(),
                    path: resolver.render(path),
                    headers: headers
                        .iter()
                        .map(|(k, v)| (k.clone(), resolver.render(v)))
                        .collect(),
                    body: body.as_ref().map(|b| resolver.resolve(b)),
                };
                self.run_api_call(input, request, retry.as_ref()).await
            }
            StepConfig::DataTransform {
                transform, input: data, ..
            } => self.run_transform(input, transform, data).await.into(),
            StepConfig::Decision { rules, default } => {
                let vars = &input.instance.variables;
                let ctx = &input.instance.context;
                let outcome = match self.conditions.choose(rules, default.as_deref(), vars, ctx) {
                    Ok(Some(target)) => {
                        tracing::debug!(step_id = %step.id, branch = target, "decision matched");
                        HandlerOutcome::completed(json!({ "branch": target }), vec![target.to_string()])
                    }
                    Ok(None) => HandlerOutcome::failed(
                        FailureKind::NoMatchingBranch,
                        format!("no rule matched in decision '{}' and no default is set", step.id),
                    ),
                    Err(err) => HandlerOutcome::failed(
                        FailureKind::HandlerFailure,
                        format!("decision '{}': {err}", step.id),
                    ),
                };
                outcome.into()
            }
            StepConfig::Delay {
                duration_secs,
                until,
            } => self.run_delay(input, *duration_secs, until.as_deref()).into(),
            StepConfig::Parallel { .. } => {
                // Branches first, then any plain `next` entries.
                HandlerOutcome::completed(Value::Null, step.edges()).into()
            }
        }
    }

    async fn run_work(
        &self,
        input: StepInput<'_>,
        kind: WorkKind,
        assignee: &str,
        title: Option<&str>,
        payload: &Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> HandlerOutcome {
        let step = input.step;
        if expires_at.is_some_and(|at| at <= input.now) {
            tracing::warn!(
                instance_id = %input.instance.id,
                step_id = %step.id,
                "work expired before it was assigned"
            );
            return expiry_outcome(step, expires_at);
        }

        let resolver = input.resolver();
        let assignee = resolver.render(assignee);
        if assignee.trim().is_empty() {
            return HandlerOutcome::failed(
                FailureKind::HandlerFailure,
                format!("{} '{}' resolved to an empty assignee", step.kind(), step.id),
            );
        }
        let request = WorkRequest {
            instance_id: input.instance.id,
            step_id: step.id.clone(),
            kind,
            assignee: assignee.clone(),
            title: title.map(|t| resolver.render(t)),
            payload: resolver.resolve(payload),
            expires_at,
        };

        match self.collaborators.work().create_work(&request).await {
            Ok(work_id) => HandlerOutcome::Suspended {
                suspension: Suspension::Work {
                    work_id,
                    expires_at,
                },
                work: Some(PendingWork {
                    id: work_id,
                    instance_id: request.instance_id,
                    step_id: request.step_id,
                    kind,
                    assignee,
                    status: WorkStatus::Pending,
                    payload: request.payload,
                    expires_at,
                    created_at: input.now,
                    resolved_at: None,
                    resolution: None,
                }),
            },
            Err(err) => collaborator_failure(step, &err),
        }
    }

    async fn run_notification(
        &self,
        input: StepInput<'_>,
        channel: &str,
        recipients: &[String],
        template: &str,
        data: &Value,
    ) -> HandlerOutcome {
        let resolver = input.resolver();
        let mut resolved = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            match resolver.resolve_str(recipient) {
                Value::Array(items) => resolved.extend(items.iter().map(value_to_string)),
                other => resolved.push(value_to_string(&other)),
            }
        }
        let request = NotificationRequest {
            instance_id: input.instance.id,
            step_id: input.step.id.clone(),
            channel: channel.to_string(),
            recipients: resolved,
            message: resolver.render(template),
            data: resolver.resolve(data),
        };

        let sent = match self.collaborators.notifier(channel) {
            Ok(notifier) => notifier.send(&request).await,
            Err(err) => Err(err),
        };
        match sent {
            Ok(value) => with_output(input.step, value),
            Err(err) => collaborator_failure(input.step, &err),
        }
    }

    async fn run_api_call(
        &self,
        input: StepInput<'_>,
        request: ApiRequest,
        retry: Option<&RetryPolicy>,
    ) -> HandlerReport {
        let client = match self.collaborators.api(&request.service) {
            Ok(client) => client,
            Err(err) => return collaborator_failure(input.step, &err).into(),
        };
        let request = &request;
        let (result, attempts) = with_retry(retry, move |_| client.call(request)).await;
        let outcome = match result {
            Ok(value) => with_output(input.step, value),
            Err(err) => collaborator_failure(input.step, &err),
        };
        HandlerReport { outcome, attempts }
    }

    async fn run_transform(&self, input: StepInput<'_>, name: &str, data: &Value) -> HandlerOutcome {
        let data = input.resolver().resolve(data);
        let result = match self.collaborators.transformer(name) {
            Ok(transformer) => transformer.transform(name, &data).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(value) => with_output(input.step, value),
            Err(err) => collaborator_failure(input.step, &err),
        }
    }

    fn run_delay(
        &self,
        input: StepInput<'_>,
        duration_secs: Option<u64>,
        until: Option<&str>,
    ) -> HandlerOutcome {
        let step = input.step;
        let wake_at = match (duration_secs, until) {
            (Some(d), _) => input.now + secs(d),
            (None, Some(until)) => {
                let resolved = input.resolver().resolve_str(until);
                let text = value_to_string(&resolved);
                match DateTime::parse_from_rfc3339(&text) {
                    Ok(at) => at.with_timezone(&Utc),
                    Err(err) => {
                        return HandlerOutcome::failed(
                            FailureKind::HandlerFailure,
                            format!("delay '{}' has an invalid wake time '{text}': {err}", step.id),
                        );
                    }
                }
            }
            (None, None) => input.now,
        };

        if wake_at <= input.now {
            return HandlerOutcome::completed(json!({ "woke_at": input.now }), step.next.clone());
        }
        HandlerOutcome::Suspended {
            suspension: Suspension::Timer { wake_at },
            work: None,
        }
    }
}

impl std::fmt::Debug for StepRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRunner")
            .field("collaborators", &self.collaborators)
            .finish()
    }
}

/// Relative deadlines are capped at a hundred years.
fn secs(s: u64) -> Duration {
    const MAX_SECS: u64 = 100 * 365 * 24 * 60 * 60;
    Duration::seconds(s.min(MAX_SECS) as i64)
}

/// Completed outcome that stores `value` under the step's output key
/// (defaulting to the step id).
fn with_output(step: &Step, value: Value) -> HandlerOutcome {
    let key = step.config.output_key().unwrap_or(&step.id).to_string();
    HandlerOutcome::Completed {
        result: value.clone(),
        writes: vec![(key, value)],
        successors: step.next.clone(),
    }
}

fn collaborator_failure(step: &Step, err: &CollaboratorError) -> HandlerOutcome {
    HandlerOutcome::failed(
        FailureKind::HandlerFailure,
        format!("{} '{}' failed: {err}", step.kind(), step.id),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
