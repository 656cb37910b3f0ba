//! Workflow engine core.
//!
//! - `definition` -- YAML parsing, validation rules, filesystem load/save
//! - `graph` -- step graph, merge fan-in, validated definitions
//! - `resolver` -- `{{path}}` placeholder resolution
//! - `expression` / `condition` -- JEXL predicates for decisions and triggers
//! - `collaborator` / `retry` -- external ports called by handlers
//! - `handlers` -- one dispatch arm per step kind
//! - `engine` -- instance execution, join counting, failure propagation
//! - `gateway` -- task completion and approval decisions
//! - `timers` -- delay wake-ups and work expiry sweeps
//! - `catalog` -- read-only template catalog
//! - `trigger` / `scheduler` -- manual, event and cron starts

pub mod catalog;
pub mod collaborator;
pub mod condition;
pub mod definition;
pub mod engine;
pub mod expression;
pub mod gateway;
pub mod graph;
pub mod handlers;
pub mod resolver;
pub mod retry;
pub mod scheduler;
pub mod timers;
pub mod trigger;
