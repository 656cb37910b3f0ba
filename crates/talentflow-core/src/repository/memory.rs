//! In-memory `InstanceStore` backed by `DashMap`.
//!
//! Same optimistic-versioning contract as the SQLite store. Clones share the
//! same maps.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use talentflow_types::error::RepositoryError;
use talentflow_types::instance::{InstanceStatus, PendingWork, WorkflowInstance};
use talentflow_types::workflow::{StepKind, WorkflowDefinition};
use uuid::Uuid;

use super::InstanceStore;

#[derive(Default)]
struct Maps {
    definitions: DashMap<Uuid, WorkflowDefinition>,
    instances: DashMap<Uuid, WorkflowInstance>,
    work: DashMap<Uuid, PendingWork>,
}

#[derive(Clone, Default)]
pub struct MemoryInstanceStore {
    maps: Arc<Maps>,
}

impl MemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored instances.
    pub fn instance_count(&self) -> usize {
        self.maps.instances.len()
    }

    fn collect(&self, pred: impl Fn(&WorkflowInstance) -> bool) -> Vec<WorkflowInstance> {
        let mut out: Vec<WorkflowInstance> = self
            .maps
            .instances
            .iter()
            .filter(|e| pred(e.value()))
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|i| i.created_at);
        out
    }
}

impl std::fmt::Debug for MemoryInstanceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryInstanceStore")
            .field("instances", &self.maps.instances.len())
            .field("work", &self.maps.work.len())
            .finish()
    }
}

impl InstanceStore for MemoryInstanceStore {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        self.maps.definitions.insert(def.id, def.clone());
        Ok(())
    }

    async fn load_definition(
        &self,
        id: &Uuid,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self.maps.definitions.get(id).map(|d| d.clone()))
    }

    async fn create(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        use dashmap::mapref::entry::Entry;
        match self.maps.instances.entry(instance.id) {
            Entry::Occupied(_) => Err(RepositoryError::Conflict(format!(
                "instance {} already exists",
                instance.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(instance.clone());
                Ok(())
            }
        }
    }

    async fn load(&self, id: &Uuid) -> Result<Option<WorkflowInstance>, RepositoryError> {
        Ok(self.maps.instances.get(id).map(|i| i.clone()))
    }

    async fn save(&self, instance: &WorkflowInstance) -> Result<u64, RepositoryError> {
        let mut stored = self
            .maps
            .instances
            .get_mut(&instance.id)
            .ok_or(RepositoryError::NotFound)?;
        if stored.version != instance.version {
            return Err(RepositoryError::Conflict(format!(
                "instance {} is at version {}, write was based on {}",
                instance.id, stored.version, instance.version
            )));
        }
        let mut next = instance.clone();
        next.version += 1;
        next.updated_at = Utc::now();
        let version = next.version;
        *stored = next;
        Ok(version)
    }

    async fn list_suspended(
        &self,
        kind: StepKind,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        Ok(self.collect(|i| !i.status.is_terminal() && i.is_suspended_on(kind)))
    }

    async fn list_failed(
        &self,
        definition_id: Option<&Uuid>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        Ok(self.collect(|i| {
            i.status == InstanceStatus::Failed
                && definition_id.is_none_or(|d| *d == i.definition_id)
                && i.ended_at.is_some_and(|t| t >= from && t < to)
        }))
    }

    async fn list_active(&self) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        Ok(self.collect(|i| !i.status.is_terminal()))
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let expired: Vec<Uuid> = self
            .maps
            .instances
            .iter()
            .filter(|e| e.status.is_terminal() && e.ended_at.is_some_and(|t| t < cutoff))
            .map(|e| e.id)
            .collect();
        for id in &expired {
            self.maps.instances.remove(id);
            self.maps.work.retain(|_, w| w.instance_id != *id);
        }
        Ok(expired.len() as u64)
    }

    async fn save_work(&self, work: &PendingWork) -> Result<(), RepositoryError> {
        self.maps.work.insert(work.id, work.clone());
        Ok(())
    }

    async fn load_work(&self, id: &Uuid) -> Result<Option<PendingWork>, RepositoryError> {
        Ok(self.maps.work.get(id).map(|w| w.clone()))
    }

    async fn list_work(&self, instance_id: &Uuid) -> Result<Vec<PendingWork>, RepositoryError> {
        let mut out: Vec<PendingWork> = self
            .maps
            .work
            .iter()
            .filter(|w| w.instance_id == *instance_id)
            .map(|w| w.clone())
            .collect();
        out.sort_by_key(|w| w.created_at);
        Ok(out)
    }
}
