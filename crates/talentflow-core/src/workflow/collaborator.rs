//! External collaborator ports invoked by step handlers.
//!
//! The engine never talks to email gateways, HRIS inboxes or payroll services
//! directly. Handlers call these object-safe traits with fully resolved
//! input; implementations live in talentflow-infra (or in tests).

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use talentflow_types::instance::WorkKind;
use thiserror::Error;
use uuid::Uuid;

/// Boxed future returned by collaborator calls.
pub type CollaboratorFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, CollaboratorError>> + Send + 'a>>;

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("no {role} registered for '{name}'")]
    NotRegistered { role: &'static str, name: String },

    #[error("request failed: {0}")]
    Request(String),

    #[error("remote returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl CollaboratorError {
    /// Whether a retry has a chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        match self {
            CollaboratorError::Request(_) => true,
            CollaboratorError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// A human task or approval to hand to an assignee.
#[derive(Debug, Clone)]
pub struct WorkRequest {
    pub instance_id: Uuid,
    pub step_id: String,
    pub kind: WorkKind,
    pub assignee: String,
    /// Task title or approval prompt, already resolved.
    pub title: Option<String>,
    pub payload: Value,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NotificationRequest {
    pub instance_id: Uuid,
    pub step_id: String,
    pub channel: String,
    pub recipients: Vec<String>,
    pub message: String,
    pub data: Value,
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub service: String,
    pub method: String,
    pub path: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
}

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

/// Creates human work items (task inboxes, approval queues).
pub trait WorkAssigner: Send + Sync {
    /// Register the work and return its id. The assignee later resolves it
    /// through the resumption gateway.
    fn create_work<'a>(&'a self, request: &'a WorkRequest) -> CollaboratorFuture<'a, Uuid>;
}

/// Delivers a rendered message on one channel (email, sms, chat).
pub trait Notifier: Send + Sync {
    fn send<'a>(&'a self, request: &'a NotificationRequest) -> CollaboratorFuture<'a, Value>;
}

/// Calls a named external service.
pub trait ApiClient: Send + Sync {
    fn call<'a>(&'a self, request: &'a ApiRequest) -> CollaboratorFuture<'a, Value>;
}

/// Applies a named transform (payroll calculation, field mapping).
pub trait DataTransformer: Send + Sync {
    fn transform<'a>(&'a self, name: &'a str, input: &'a Value) -> CollaboratorFuture<'a, Value>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// The set of collaborators available to step handlers.
#[derive(Clone)]
pub struct Collaborators {
    work: Arc<dyn WorkAssigner>,
    notifiers: HashMap<String, Arc<dyn Notifier>>,
    default_notifier: Option<Arc<dyn Notifier>>,
    api: Option<Arc<dyn ApiClient>>,
    transforms: HashMap<String, Arc<dyn DataTransformer>>,
}

impl Collaborators {
    pub fn new(work: Arc<dyn WorkAssigner>) -> Self {
        Self {
            work,
            notifiers: HashMap::new(),
            default_notifier: None,
            api: None,
            transforms: HashMap::new(),
        }
    }

    pub fn with_notifier(mut self, channel: impl Into<String>, notifier: Arc<dyn Notifier>) -> Self {
        self.notifiers.insert(channel.into(), notifier);
        self
    }

    /// Notifier used for channels without a dedicated one.
    pub fn with_default_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.default_notifier = Some(notifier);
        self
    }

    pub fn with_api_client(mut self, client: Arc<dyn ApiClient>) -> Self {
        self.api = Some(client);
        self
    }

    /// Register `transformer` under each of `names`.
    pub fn with_transformer<I, N>(mut self, names: I, transformer: Arc<dyn DataTransformer>) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        for name in names {
            self.transforms.insert(name.into(), Arc::clone(&transformer));
        }
        self
    }

    pub fn work(&self) -> &dyn WorkAssigner {
        self.work.as_ref()
    }

    pub fn notifier(&self, channel: &str) -> Result<&dyn Notifier, CollaboratorError> {
        self.notifiers
            .get(channel)
            .or(self.default_notifier.as_ref())
            .map(|n| n.as_ref())
            .ok_or_else(|| CollaboratorError::NotRegistered {
                role: "notifier",
                name: channel.to_string(),
            })
    }

    pub fn api(&self, service: &str) -> Result<&dyn ApiClient, CollaboratorError> {
        self.api
            .as_deref()
            .ok_or_else(|| CollaboratorError::NotRegistered {
                role: "api client",
                name: service.to_string(),
            })
    }

    pub fn transformer(&self, name: &str) -> Result<&dyn DataTransformer, CollaboratorError> {
        self.transforms
            .get(name)
            .map(|t| t.as_ref())
            .ok_or_else(|| CollaboratorError::NotRegistered {
                role: "data transform",
                name: name.to_string(),
            })
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut channels: Vec<&String> = self.notifiers.keys().collect();
        channels.sort();
        let mut transforms: Vec<&String> = self.transforms.keys().collect();
        transforms.sort();
        f.debug_struct("Collaborators")
            .field("channels", &channels)
            .field("default_notifier", &self.default_notifier.is_some())
            .field("api", &self.api.is_some())
            .field("transforms", &transforms)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records every work request and hands out fresh ids.
    #[derive(Default)]
    pub struct RecordingWorkAssigner {
        pub requests: Mutex<Vec<(Uuid, WorkRequest)>>,
    }

    impl RecordingWorkAssigner {
        pub fn ids_for(&self, step_id: &str) -> Vec<Uuid> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, r)| r.step_id == step_id)
                .map(|(id, _)| *id)
                .collect()
        }
    }

    impl WorkAssigner for RecordingWorkAssigner {
        fn create_work<'a>(&'a self, request: &'a WorkRequest) -> CollaboratorFuture<'a, Uuid> {
            Box::pin(async move {
                let id = Uuid::now_v7();
                self.requests.lock().unwrap().push((id, request.clone()));
                Ok(id)
            })
        }
    }

    #[derive(Default)]
    pub struct RecordingNotifier {
        pub sent: Mutex<Vec<NotificationRequest>>,
    }

    impl Notifier for RecordingNotifier {
        fn send<'a>(&'a self, request: &'a NotificationRequest) -> CollaboratorFuture<'a, Value> {
            Box::pin(async move {
                self.sent.lock().unwrap().push(request.clone());
                Ok(serde_json::json!({ "delivered": request.recipients.len() }))
            })
        }
    }

    /// Fails the first `failures` calls with a retryable error, then echoes.
    #[derive(Default)]
    pub struct FlakyApiClient {
        pub failures: u32,
        pub status: Option<u16>,
        pub calls: Mutex<Vec<ApiRequest>>,
    }

    impl ApiClient for FlakyApiClient {
        fn call<'a>(&'a self, request: &'a ApiRequest) -> CollaboratorFuture<'a, Value> {
            Box::pin(async move {
                let attempt = {
                    let mut calls = self.calls.lock().unwrap();
                    calls.push(request.clone());
                    calls.len() as u32
                };
                if attempt <= self.failures {
                    return Err(match self.status {
                        Some(status) => CollaboratorError::Status {
                            status,
                            body: "unavailable".into(),
                        },
                        None => CollaboratorError::Request("connection reset".into()),
                    });
                }
                Ok(serde_json::json!({
                    "service": request.service,
                    "path": request.path,
                    "body": request.body,
                }))
            })
        }
    }

    /// `sum` adds the numbers in an array; `fail` always errors.
    pub struct MathTransformer;

    impl DataTransformer for MathTransformer {
        fn transform<'a>(&'a self, name: &'a str, input: &'a Value) -> CollaboratorFuture<'a, Value> {
            Box::pin(async move {
                match name {
                    "sum" => {
                        let items = input.as_array().ok_or_else(|| {
                            CollaboratorError::InvalidInput("sum expects an array".into())
                        })?;
                        let total: f64 = items.iter().filter_map(Value::as_f64).sum();
                        Ok(serde_json::json!(total))
                    }
                    _ => Err(CollaboratorError::InvalidInput(format!("cannot run '{name}'"))),
                }
            })
        }
    }
}
