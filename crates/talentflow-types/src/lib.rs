//! Shared domain types for talentflow.
//!
//! Workflow definitions, instance state, pending work, engine events,
//! configuration, and the repository error used by store ports.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod instance;
pub mod workflow;
