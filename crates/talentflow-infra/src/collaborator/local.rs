//! In-process collaborators for standalone deployments.

use serde_json::{Map, Value, json};
use talentflow_core::workflow::collaborator::{
    CollaboratorError, CollaboratorFuture, DataTransformer, NotificationRequest, Notifier,
    WorkAssigner, WorkRequest,
};
use uuid::Uuid;

/// Writes every notification to the log instead of delivering it.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn send<'a>(&'a self, request: &'a NotificationRequest) -> CollaboratorFuture<'a, Value> {
        Box::pin(async move {
            if request.recipients.is_empty() {
                return Err(CollaboratorError::InvalidInput(
                    "notification has no recipients".into(),
                ));
            }
            tracing::info!(
                instance_id = %request.instance_id,
                step_id = %request.step_id,
                channel = %request.channel,
                recipients = ?request.recipients,
                message = %request.message,
                "notification"
            );
            Ok(json!({
                "channel": request.channel,
                "delivered": request.recipients.len(),
            }))
        })
    }
}

/// Hands out work ids and logs the assignment.
///
/// The engine persists the work item itself, so assignees find their work
/// through `tflow work`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingWorkAssigner;

impl WorkAssigner for LoggingWorkAssigner {
    fn create_work<'a>(&'a self, request: &'a WorkRequest) -> CollaboratorFuture<'a, Uuid> {
        Box::pin(async move {
            let id = Uuid::now_v7();
            tracing::info!(
                work_id = %id,
                instance_id = %request.instance_id,
                step_id = %request.step_id,
                kind = ?request.kind,
                assignee = %request.assignee,
                expires_at = ?request.expires_at,
                "work assigned"
            );
            Ok(id)
        })
    }
}

/// Data transforms that ship with the engine.
///
/// - `sum`, `average`, `min`, `max`: over the numbers in an array (non-numbers ignored)
/// - `count`: length of an array or object
/// - `merge`: shallow merge of an array of objects, later keys win
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinTransforms;

impl BuiltinTransforms {
    pub const NAMES: [&'static str; 6] = ["sum", "average", "min", "max", "count", "merge"];

    pub fn apply(name: &str, input: &Value) -> Result<Value, CollaboratorError> {
        match name {
            "sum" => Ok(json!(numbers(name, input)?.iter().sum::<f64>())),
            "average" => {
                let nums = numbers(name, input)?;
                if nums.is_empty() {
                    return Ok(Value::Null);
                }
                Ok(json!(nums.iter().sum::<f64>() / nums.len() as f64))
            }
            "min" => Ok(numbers(name, input)?
                .into_iter()
                .reduce(f64::min)
                .map_or(Value::Null, |n| json!(n))),
            "max" => Ok(numbers(name, input)?
                .into_iter()
                .reduce(f64::max)
                .map_or(Value::Null, |n| json!(n))),
            "count" => match input {
                Value::Array(items) => Ok(json!(items.len())),
                Value::Object(map) => Ok(json!(map.len())),
                _ => Err(CollaboratorError::InvalidInput(
                    "count expects an array or object".into(),
                )),
            },
            "merge" => {
                let items = array(name, input)?;
                let mut merged = Map::new();
                for item in items {
                    let Value::Object(fields) = item else {
                        return Err(CollaboratorError::InvalidInput(
                            "merge expects an array of objects".into(),
                        ));
                    };
                    merged.extend(fields.clone());
                }
                Ok(Value::Object(merged))
            }
            other => Err(CollaboratorError::NotRegistered {
                role: "data transform",
                name: other.to_string(),
            }),
        }
    }
}

fn array<'v>(name: &str, input: &'v Value) -> Result<&'v Vec<Value>, CollaboratorError> {
    input
        .as_array()
        .ok_or_else(|| CollaboratorError::InvalidInput(format!("{name} expects an array")))
}

fn numbers(name: &str, input: &Value) -> Result<Vec<f64>, CollaboratorError> {
    Ok(array(name, input)?.iter().filter_map(Value::as_f64).collect())
}

impl DataTransformer for BuiltinTransforms {
    fn transform<'a>(&'a self, name: &'a str, input: &'a Value) -> CollaboratorFuture<'a, Value> {
        Box::pin(async move {
            let output = Self::apply(name, input)?;
            tracing::debug!(transform = name, "data transform applied");
            Ok(output)
        })
    }
}
