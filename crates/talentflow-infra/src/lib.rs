//! Infrastructure adapters for talentflow.
//!
//! Implements the storage and collaborator ports defined in
//! `talentflow-core`: a SQLite `InstanceStore`, an HTTP `ApiClient`, and
//! local notifier/work-assigner/transform implementations, plus the
//! `config.toml` loader.

pub mod collaborator;
pub mod config;
pub mod sqlite;
