//! Instance store trait definition.
//!
//! Durable storage for definitions, instances, and pending work. Saves are
//! optimistic: an instance is written only if the stored version still
//! equals the version the caller loaded.

use chrono::{DateTime, Utc};
use talentflow_types::error::RepositoryError;
use talentflow_types::instance::{PendingWork, WorkflowInstance};
use talentflow_types::workflow::{StepKind, WorkflowDefinition};
use uuid::Uuid;

/// Repository trait for workflow engine persistence.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait InstanceStore: Send + Sync + 'static {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Upsert a definition by id.
    fn save_definition(
        &self,
        def: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn load_definition(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Instances
    // -----------------------------------------------------------------------

    /// Insert a new instance. Fails with `Conflict` if the id exists.
    fn create(
        &self,
        instance: &WorkflowInstance,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn load(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowInstance>, RepositoryError>> + Send;

    /// Write `instance` if the stored version equals `instance.version`.
    ///
    /// Returns the new version. A mismatch is `RepositoryError::Conflict`;
    /// a missing row is `RepositoryError::NotFound`.
    fn save(
        &self,
        instance: &WorkflowInstance,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    /// Non-terminal instances with at least one suspended execution of `kind`.
    fn list_suspended(
        &self,
        kind: StepKind,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowInstance>, RepositoryError>> + Send;

    /// `Failed` instances that ended in `[from, to)`, optionally for one definition.
    fn list_failed(
        &self,
        definition_id: Option<&Uuid>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowInstance>, RepositoryError>> + Send;

    /// All `Active` and `Suspended` instances.
    fn list_active(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowInstance>, RepositoryError>> + Send;

    /// Delete terminal instances (and their work items) that ended before
    /// `cutoff`. Returns the number of instances removed.
    fn delete_terminal_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Pending work
    // -----------------------------------------------------------------------

    /// Upsert a work item by id.
    fn save_work(
        &self,
        work: &PendingWork,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn load_work(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<PendingWork>, RepositoryError>> + Send;

    /// Work items of one instance, oldest first.
    fn list_work(
        &self,
        instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<PendingWork>, RepositoryError>> + Send;
}
