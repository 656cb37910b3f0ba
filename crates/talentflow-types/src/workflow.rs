//! Workflow definition types.
//!
//! A `WorkflowDefinition` is the immutable, authored shape of a process:
//! an ordered list of typed steps connected by explicit `next` edges. YAML
//! files and the built-in template catalog both deserialize into it.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// The canonical workflow definition.
///
/// Never mutated after activation; a new version replaces the whole value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// UUIDv7 assigned when the definition is authored.
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    /// Machine-friendly workflow name (e.g. "employee-onboarding").
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Semantic version string (e.g. "1.0.0").
    #[serde(default = "default_version")]
    pub version: String,
    /// How instances get created. Manual starts are always allowed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggers: Vec<TriggerSpec>,
    /// Initial variable defaults copied into every new instance.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub variables: Map<String, Value>,
    /// Ordered steps with unique ids.
    pub steps: Vec<Step>,
    /// Free-form metadata for integrations.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl WorkflowDefinition {
    /// Look up a step by id.
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// The single `start` step, if the definition has exactly one.
    pub fn start_step(&self) -> Option<&Step> {
        let mut starts = self.steps.iter().filter(|s| s.kind() == StepKind::Start);
        match (starts.next(), starts.next()) {
            (Some(step), None) => Some(step),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// A single node in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Unique step id within the definition (e.g. "manager-approval").
    pub id: String,
    /// Human-readable name.
    #[serde(default)]
    pub name: String,
    /// Kind-specific typed configuration.
    pub config: StepConfig,
    /// Ordered successor ids. Empty for `end`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next: Vec<String>,
}

impl Step {
    pub fn kind(&self) -> StepKind {
        self.config.kind()
    }

    /// Every outgoing edge of this step, in declaration order, without duplicates.
    ///
    /// This is `next` plus the targets carried by the config: decision rule
    /// targets and default, parallel branches, and task/approval escalation.
    pub fn edges(&self) -> Vec<String> {
        let mut edges: Vec<String> = Vec::new();
        let mut push = |id: &str| {
            if !edges.iter().any(|e| e == id) {
                edges.push(id.to_string());
            }
        };

        match &self.config {
            StepConfig::Decision { rules, default } => {
                for rule in rules {
                    push(&rule.next);
                }
                if let Some(default) = default {
                    push(default);
                }
            }
            StepConfig::Parallel { branches } => {
                for branch in branches {
                    push(branch);
                }
            }
            _ => {}
        }

        for id in &self.next {
            push(id);
        }

        if let Some(escalation) = self.config.escalation() {
            push(escalation);
        }

        edges
    }
}

/// The closed set of step kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Start,
    End,
    Task,
    Approval,
    Notification,
    ApiCall,
    DataTransform,
    Decision,
    Delay,
    Parallel,
    Merge,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Start => "start",
            StepKind::End => "end",
            StepKind::Task => "task",
            StepKind::Approval => "approval",
            StepKind::Notification => "notification",
            StepKind::ApiCall => "api_call",
            StepKind::DataTransform => "data_transform",
            StepKind::Decision => "decision",
            StepKind::Delay => "delay",
            StepKind::Parallel => "parallel",
            StepKind::Merge => "merge",
        }
    }

    /// Kinds whose handlers may suspend a branch.
    pub fn is_suspension_point(&self) -> bool {
        matches!(self, StepKind::Task | StepKind::Approval | StepKind::Delay)
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| format!("unknown step kind: '{s}'"))
    }
}

/// Step-specific configuration payload, internally tagged by `kind`:
///
/// ```yaml
/// config:
///   kind: approval
///   approver: "{{manager_email}}"
///   expires_in_secs: 172800
///   escalation: hr-review
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepConfig {
    /// Entry point of the graph.
    Start,
    /// Terminal node.
    End,
    /// Human task assigned to someone; suspends until completed.
    Task {
        assignee: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        payload: Value,
        /// Seconds until the task is considered overdue.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        due_in_secs: Option<u64>,
        /// Successor taken when the task expires unresolved.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        escalation: Option<String>,
        /// Variable that receives the completion result.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_key: Option<String>,
    },
    /// Human approval gate; suspends until approved, rejected, or expired.
    Approval {
        approver: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expires_in_secs: Option<u64>,
        /// Absolute expiry; mutually exclusive with `expires_in_secs`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expires_at: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        escalation: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_key: Option<String>,
    },
    /// Templated message through a named channel collaborator.
    Notification {
        channel: String,
        #[serde(default)]
        recipients: Vec<String>,
        template: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_key: Option<String>,
    },
    /// Call to a named external service.
    ApiCall {
        service: String,
        #[serde(default = "default_method")]
        method: String,
        path: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry: Option<RetryPolicy>,
    },
    /// Named data transform applied to resolved input.
    DataTransform {
        transform: String,
        #[serde(default)]
        input: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_key: Option<String>,
    },
    /// Ordered predicate rules; first match wins.
    Decision {
        rules: Vec<DecisionRule>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<String>,
    },
    /// Timed wait, either relative or until an absolute (templated) instant.
    Delay {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_secs: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        until: Option<String>,
    },
    /// Starts every branch concurrently.
    Parallel { branches: Vec<String> },
    /// Join point for concurrent branches.
    Merge,
}

fn default_method() -> String {
    "GET".to_string()
}

impl StepConfig {
    pub fn kind(&self) -> StepKind {
        match self {
            StepConfig::Start => StepKind::Start,
            StepConfig::End => StepKind::End,
            StepConfig::Task { .. } => StepKind::Task,
            StepConfig::Approval { .. } => StepKind::Approval,
            StepConfig::Notification { .. } => StepKind::Notification,
            StepConfig::ApiCall { .. } => StepKind::ApiCall,
            StepConfig::DataTransform { .. } => StepKind::DataTransform,
            StepConfig::Decision { .. } => StepKind::Decision,
            StepConfig::Delay { .. } => StepKind::Delay,
            StepConfig::Parallel { .. } => StepKind::Parallel,
            StepConfig::Merge => StepKind::Merge,
        }
    }

    /// Escalation successor for task/approval steps.
    pub fn escalation(&self) -> Option<&str> {
        match self {
            StepConfig::Task { escalation, .. } | StepConfig::Approval { escalation, .. } => {
                escalation.as_deref()
            }
            _ => None,
        }
    }

    /// Variable key a handler writes its result to, if the kind writes one.
    pub fn output_key(&self) -> Option<&str> {
        match self {
            StepConfig::Task { output_key, .. }
            | StepConfig::Approval { output_key, .. }
            | StepConfig::Notification { output_key, .. }
            | StepConfig::ApiCall { output_key, .. }
            | StepConfig::DataTransform { output_key, .. } => output_key.as_deref(),
            _ => None,
        }
    }
}

/// One `(predicate -> branch)` rule of a decision step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRule {
    /// Predicate expression, e.g. `{{amount}} < 1000`.
    pub when: String,
    /// Step taken when the predicate holds.
    pub next: String,
}

// ---------------------------------------------------------------------------
// Retry Policy
// ---------------------------------------------------------------------------

/// Handler-local retry policy for api_call steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts including the first (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt in milliseconds (default 500).
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Growth factor applied to the delay on each further attempt (default 2.0).
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    500
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

// ---------------------------------------------------------------------------
// Trigger Specification
// ---------------------------------------------------------------------------

/// How instances of a workflow get created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerSpec {
    /// Started explicitly by an operator or another system.
    Manual {},
    /// Started when a named event is published.
    Event {
        /// Event name, e.g. "candidate.hired".
        event: String,
        /// Optional JEXL filter over `{ event: <payload> }`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        when: Option<String>,
    },
    /// Started on a cron schedule.
    Cron {
        /// Cron expression or human-readable schedule ("every day at 06:00").
        schedule: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
