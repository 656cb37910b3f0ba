//! Collaborator implementations wired into the engine by the CLI.
//!
//! - `http`: `ApiClient` that calls configured services over HTTP.
//! - `local`: in-process notifier, work assigner and data transforms.

pub mod http;
pub mod local;

use std::sync::Arc;

use talentflow_core::workflow::collaborator::{Collaborators, CollaboratorError};
use talentflow_types::config::EngineConfig;

pub use http::HttpApiClient;
pub use local::{BuiltinTransforms, LoggingWorkAssigner, TracingNotifier};

/// Default collaborator set for a standalone deployment.
///
/// Work items are logged (the store keeps them for the CLI), notifications
/// are written to the log, and api_call steps go to `config.services`.
pub fn default_collaborators(config: &EngineConfig) -> Result<Collaborators, CollaboratorError> {
    let api = HttpApiClient::new(config.services.clone(), config.http_timeout_secs)?;
    Ok(Collaborators::new(Arc::new(LoggingWorkAssigner))
        .with_default_notifier(Arc::new(TracingNotifier))
        .with_api_client(Arc::new(api))
        .with_transformer(BuiltinTransforms::NAMES, Arc::new(BuiltinTransforms)))
}
