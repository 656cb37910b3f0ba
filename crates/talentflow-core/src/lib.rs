//! Workflow engine and port definitions for talentflow.
//!
//! This crate holds the engine and the "ports" (store and collaborator
//! traits) that the infrastructure layer implements. It depends only on
//! `talentflow-types` -- never on `talentflow-infra` or any database/IO crate.

pub mod event;
pub mod repository;
pub mod workflow;
