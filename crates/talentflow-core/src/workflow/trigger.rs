//! Trigger manager: turns manual starts, named events and cron fires into
//! `WorkflowEngine::start` calls.
//!
//! Each registered definition contributes its `TriggerSpec`s. Event triggers
//! may carry a JEXL `when` clause evaluated against `{ event: <payload> }`;
//! a trigger whose clause is falsy is skipped.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use talentflow_types::workflow::TriggerSpec;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::engine::{EngineError, WorkflowEngine};
use super::expression::WorkflowEvaluator;
use super::graph::ValidatedDefinition;
use super::scheduler::{CronCallback, CronScheduler, SchedulerError, normalize_schedule};
use crate::repository::InstanceStore;

#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("trigger registration failed for '{workflow}': {reason}")]
    Registration { workflow: String, reason: String },

    #[error("no workflow named '{0}' is registered")]
    UnknownWorkflow(String),

    #[error("when clause '{clause}' failed: {reason}")]
    WhenClause { clause: String, reason: String },

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// One registered definition with its triggers.
#[derive(Debug, Clone)]
struct Registration {
    definition_id: Uuid,
    triggers: Vec<TriggerSpec>,
}

/// Routes trigger sources to the engine.
pub struct TriggerManager<S: InstanceStore> {
    engine: WorkflowEngine<S>,
    by_name: Arc<RwLock<HashMap<String, Registration>>>,
}

impl<S: InstanceStore> Clone for TriggerManager<S> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            by_name: Arc::clone(&self.by_name),
        }
    }
}

impl<S: InstanceStore> TriggerManager<S> {
    pub fn new(engine: WorkflowEngine<S>) -> Self {
        Self {
            engine,
            by_name: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn engine(&self) -> &WorkflowEngine<S> {
        &self.engine
    }

    /// Activate `def` in the engine and register its triggers.
    ///
    /// Re-registering a name replaces the previous version.
    pub async fn register(&self, def: Arc<ValidatedDefinition>) -> Result<(), TriggerError> {
        for spec in &def.definition().triggers {
            validate_trigger(spec).map_err(|reason| TriggerError::Registration {
                workflow: def.name().to_string(),
                reason,
            })?;
        }
        self.engine.register(Arc::clone(&def)).await?;
        let registration = Registration {
            definition_id: def.id(),
            triggers: def.definition().triggers.clone(),
        };
        tracing::info!(
            workflow = def.name(),
            trigger_count = registration.triggers.len(),
            "registered workflow triggers"
        );
        self.by_name
            .write()
            .await
            .insert(def.name().to_string(), registration);
        Ok(())
    }

    /// Definition id registered under `name`.
    pub async fn definition_id(&self, name: &str) -> Option<Uuid> {
        self.by_name.read().await.get(name).map(|r| r.definition_id)
    }

    /// Start `name` by hand. Always allowed, whatever triggers it declares.
    pub async fn start_manual(&self, name: &str, context: Value) -> Result<Uuid, TriggerError> {
        let definition_id = self
            .definition_id(name)
            .await
            .ok_or_else(|| TriggerError::UnknownWorkflow(name.to_string()))?;
        Ok(self
            .engine
            .start_with_trigger(definition_id, context, "manual")
            .await?)
    }

    /// Start every workflow subscribed to `event` whose `when` clause holds.
    ///
    /// The payload becomes the instance context. Returns the started ids. A
    /// failing `when` clause or a failed start skips that workflow with a
    /// logged error; the other subscribers still start.
    pub async fn fire_event(&self, event: &str, payload: Value) -> Result<Vec<Uuid>, TriggerError> {
        let matching = self.matching_event_triggers(event, &payload).await;
        let trigger = format!("event:{event}");
        let mut started = Vec::with_capacity(matching.len());
        for (name, definition_id) in matching {
            match self
                .engine
                .start_with_trigger(definition_id, payload.clone(), &trigger)
                .await
            {
                Ok(id) => {
                    tracing::info!(workflow = %name, instance_id = %id, event, "event trigger fired");
                    started.push(id);
                }
                Err(err) => {
                    tracing::error!(workflow = %name, event, error = %err, "event-triggered start failed");
                }
            }
        }
        Ok(started)
    }

    /// Start `definition_id` for a cron fire at `scheduled_at`.
    pub async fn fire_cron(
        &self,
        definition_id: Uuid,
        scheduled_at: DateTime<Utc>,
    ) -> Result<Uuid, TriggerError> {
        let context = json!({ "scheduled_at": scheduled_at });
        Ok(self
            .engine
            .start_with_trigger(definition_id, context, "cron")
            .await?)
    }

    /// Register every cron trigger with `scheduler`. Returns the job count.
    pub async fn schedule_cron(&self, scheduler: &CronScheduler) -> Result<usize, TriggerError> {
        let crons: Vec<(Uuid, String)> = self
            .by_name
            .read()
            .await
            .values()
            .flat_map(|r| {
                r.triggers.iter().filter_map(move |t| match t {
                    TriggerSpec::Cron { schedule, .. } => Some((r.definition_id, schedule.clone())),
                    _ => None,
                })
            })
            .collect();

        for (definition_id, schedule) in &crons {
            let manager = self.clone();
            let callback: CronCallback = Arc::new(move |definition_id, fired_at| {
                let manager = manager.clone();
                Box::pin(async move {
                    if let Err(err) = manager.fire_cron(definition_id, fired_at).await {
                        tracing::error!(%definition_id, error = %err, "cron-triggered start failed");
                    }
                })
            });
            scheduler.schedule(*definition_id, schedule, callback).await?;
        }
        Ok(crons.len())
    }

    async fn matching_event_triggers(&self, event: &str, payload: &Value) -> Vec<(String, Uuid)> {
        let registrations = self.by_name.read().await;
        let scope = json!({ "event": payload });
        let evaluator = WorkflowEvaluator::new();
        let mut matching = Vec::new();
        for (name, registration) in registrations.iter() {
            let subscribed = registration.triggers.iter().find_map(|t| match t {
                TriggerSpec::Event { event: e, when } if e == event => Some(when.as_deref()),
                _ => None,
            });
            let Some(when) = subscribed else {
                continue;
            };
            match evaluate_when(&evaluator, when, &scope) {
                Ok(true) => matching.push((name.clone(), registration.definition_id)),
                Ok(false) => {
                    tracing::debug!(workflow = %name, event, "when clause suppressed trigger");
                }
                Err(err) => tracing::warn!(workflow = %name, event, error = %err, "skipping trigger"),
            }
        }
        matching.sort();
        matching
    }
}

fn evaluate_when(
    evaluator: &WorkflowEvaluator,
    when: Option<&str>,
    scope: &Value,
) -> Result<bool, TriggerError> {
    let Some(clause) = when else {
        return Ok(true);
    };
    evaluator
        .evaluate_bool(clause, scope)
        .map_err(|e| TriggerError::WhenClause {
            clause: clause.to_string(),
            reason: e.to_string(),
        })
}

fn validate_trigger(spec: &TriggerSpec) -> Result<(), String> {
    match spec {
        TriggerSpec::Manual {} => Ok(()),
        TriggerSpec::Event { event, .. } if event.trim().is_empty() => {
            Err("event name must not be empty".to_string())
        }
        TriggerSpec::Event { .. } => Ok(()),
        TriggerSpec::Cron { schedule, timezone } => {
            if let Some(tz) = timezone {
                if !tz.eq_ignore_ascii_case("utc") {
                    return Err(format!("unsupported timezone '{tz}', schedules run in UTC"));
                }
            }
            normalize_schedule(schedule)
                .map(|_| ())
                .map_err(|e| format!("invalid cron schedule '{schedule}': {e}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryInstanceStore;
    use crate::workflow::catalog::TemplateCatalog;
    use crate::workflow::collaborator::Collaborators;
    use crate::workflow::collaborator::testing::*;
    use talentflow_types::config::EngineConfig;
    use talentflow_types::instance::InstanceStatus;
    use talentflow_types::workflow::{Step, StepConfig, WorkflowDefinition};

    fn manager() -> TriggerManager<MemoryInstanceStore> {
        let collaborators = Collaborators::new(Arc::new(RecordingWorkAssigner::default()))
            .with_default_notifier(Arc::new(RecordingNotifier::default()))
            .with_api_client(Arc::new(FlakyApiClient::default()))
            .with_transformer(["sum"], Arc::new(MathTransformer));
        TriggerManager::new(WorkflowEngine::new(
            MemoryInstanceStore::new(),
            collaborators,
            EngineConfig::default(),
        ))
    }

    fn simple(name: &str, triggers: Vec<TriggerSpec>) -> Arc<ValidatedDefinition> {
        let step = |id: &str, config, next: &[&str]| Step {
            id: id.to_string(),
            name: id.to_string(),
            config,
            next: next.iter().map(|s| s.to_string()).collect(),
        };
        Arc::new(
            ValidatedDefinition::new(WorkflowDefinition {
                id: Uuid::now_v7(),
                name: name.to_string(),
                description: None,
                version: "1.0.0".into(),
                triggers,
                variables: Default::default(),
                steps: vec![
                    step("start", StepConfig::Start, &["end"]),
                    step("end", StepConfig::End, &[]),
                ],
                metadata: Default::default(),
            })
            .unwrap(),
        )
    }

    fn event(name: &str, when: Option<&str>) -> TriggerSpec {
        TriggerSpec::Event {
            event: name.to_string(),
            when: when.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn event_starts_subscribers_whose_clause_holds() {
        let triggers = manager();
        triggers
            .register(simple("big-hire", vec![event("candidate.hired", Some("event.level >= 5"))]))
            .await
            .unwrap();
        triggers
            .register(simple("any-hire", vec![event("candidate.hired", None)]))
            .await
            .unwrap();
        triggers
            .register(simple("exit", vec![event("employee.left", None)]))
            .await
            .unwrap();

        let junior = triggers
            .fire_event("candidate.hired", json!({ "level": 2 }))
            .await
            .unwrap();
        assert_eq!(junior.len(), 1);

        let senior = triggers
            .fire_event("candidate.hired", json!({ "level": 7 }))
            .await
            .unwrap();
        assert_eq!(senior.len(), 2);

        let instance = triggers.engine().get_instance(senior[0]).await.unwrap();
        assert_eq!(instance.context["level"], 7);
        assert_eq!(instance.status, InstanceStatus::Completed);

        assert!(triggers.fire_event("nobody.cares", json!({})).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn broken_when_clause_skips_only_that_workflow() {
        let triggers = manager();
        triggers
            .register(simple("broken", vec![event("leave.requested", Some("event.days >"))]))
            .await
            .unwrap();
        triggers
            .register(simple("fine", vec![event("leave.requested", None)]))
            .await
            .unwrap();
        let started = triggers
            .fire_event("leave.requested", json!({ "days": 3 }))
            .await
            .unwrap();
        assert_eq!(started.len(), 1);
    }

    #[tokio::test]
    async fn failed_start_does_not_block_other_subscribers() {
        let triggers = manager();
        triggers
            .register(simple("welcome", vec![event("candidate.hired", None)]))
            .await
            .unwrap();
        // Registered by name only; the engine has never seen this definition.
        triggers.by_name.write().await.insert(
            "aaa-orphan".to_string(),
            Registration {
                definition_id: Uuid::now_v7(),
                triggers: vec![event("candidate.hired", None)],
            },
        );

        let started = triggers
            .fire_event("candidate.hired", json!({ "level": 3 }))
            .await
            .unwrap();
        assert_eq!(started.len(), 1);
        let instance = triggers.engine().get_instance(started[0]).await.unwrap();
        assert_eq!(instance.definition_name, "welcome");
    }

    #[tokio::test]
    async fn manual_start_by_name() {
        let triggers = manager();
        triggers.register(simple("adhoc", vec![])).await.unwrap();
        let id = triggers.start_manual("adhoc", json!({ "who": "ops" })).await.unwrap();
        let instance = triggers.engine().get_instance(id).await.unwrap();
        assert_eq!(instance.definition_name, "adhoc");

        let err = triggers.start_manual("missing", json!({})).await.unwrap_err();
        assert!(matches!(err, TriggerError::UnknownWorkflow(_)));
    }

    #[tokio::test]
    async fn cron_fire_passes_schedule_time_as_context() {
        let triggers = manager();
        let def = simple(
            "nightly",
            vec![TriggerSpec::Cron {
                schedule: "every day at 02:00".into(),
                timezone: None,
            }],
        );
        triggers.register(Arc::clone(&def)).await.unwrap();

        let at = Utc::now();
        let id = triggers.fire_cron(def.id(), at).await.unwrap();
        let instance = triggers.engine().get_instance(id).await.unwrap();
        assert_eq!(instance.context["scheduled_at"], json!(at));

        let scheduler = CronScheduler::new();
        scheduler.start().await.unwrap();
        assert_eq!(triggers.schedule_cron(&scheduler).await.unwrap(), 1);
        assert_eq!(scheduler.scheduled_count().await, 1);
        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_trigger_specs_are_rejected() {
        let triggers = manager();
        let bad_cron = simple(
            "bad-cron",
            vec![TriggerSpec::Cron {
                schedule: "whenever".into(),
                timezone: None,
            }],
        );
        assert!(matches!(
            triggers.register(bad_cron).await,
            Err(TriggerError::Registration { .. })
        ));

        let bad_fields = simple(
            "bad-fields",
            vec![TriggerSpec::Cron {
                schedule: "0 99 * * *".into(),
                timezone: None,
            }],
        );
        assert!(triggers.register(bad_fields).await.is_err());

        let bad_tz = simple(
            "bad-tz",
            vec![TriggerSpec::Cron {
                schedule: "daily".into(),
                timezone: Some("Europe/Berlin".into()),
            }],
        );
        assert!(triggers.register(bad_tz).await.is_err());
        assert!(triggers.register(simple("blank", vec![event(" ", None)])).await.is_err());
        assert!(triggers.definition_id("bad-cron").await.is_none());
    }

    #[tokio::test]
    async fn leave_template_filters_on_requested_days() {
        let triggers = manager();
        let catalog = TemplateCatalog::builtin().unwrap();
        triggers
            .register(Arc::clone(catalog.get("leave-approval").unwrap()))
            .await
            .unwrap();

        let none = triggers
            .fire_event("leave.requested", json!({ "days": 0 }))
            .await
            .unwrap();
        assert!(none.is_empty());

        let short = json!({
            "days": 1,
            "from": "2030-03-02",
            "employee_id": "e-17",
            "employee_email": "dana@example.com",
            "manager_email": "lee@example.com",
        });
        let started = triggers.fire_event("leave.requested", short).await.unwrap();
        let instance = triggers.engine().get_instance(started[0]).await.unwrap();
        // Short leave is auto-approved and recorded without a human step.
        assert_eq!(instance.status, InstanceStatus::Completed);
        assert!(instance.completed_steps.iter().any(|e| e.step_id == "auto_approved"));
        assert_eq!(instance.variables["leave_record"]["path"], "/employees/e-17/leave");
    }
}
