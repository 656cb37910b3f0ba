//! SQLite implementation of `InstanceStore`.
//!
//! Definitions and instances are stored as JSON documents. Instance rows
//! carry denormalized `status`, `definition_id`, `suspended_kinds` and
//! timestamp columns for filtering, plus the `version` column that backs
//! optimistic saves.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use talentflow_core::repository::InstanceStore;
use talentflow_types::error::RepositoryError;
use talentflow_types::instance::{
    ExecutionStatus, PendingWork, WorkKind, WorkStatus, WorkflowInstance,
};
use talentflow_types::workflow::{StepKind, WorkflowDefinition};
use uuid::Uuid;

use super::pool::DatabasePool;

const INSTANCE_COLUMNS: &str = "id, state, version";

const WORK_COLUMNS: &str = "id, instance_id, step_id, kind, assignee, status, payload, \
                            expires_at, created_at, resolved_at, resolution";

/// SQLite-backed implementation of `InstanceStore`.
#[derive(Debug, Clone)]
pub struct SqliteInstanceStore {
    pool: DatabasePool,
}

impl SqliteInstanceStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }

    async fn fetch_instances<'a>(
        &self,
        query: sqlx::query::Query<'a, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'a>>,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let rows = query
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;
        rows.iter().map(instance_from_row).collect()
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn instance_from_row(row: &SqliteRow) -> Result<WorkflowInstance, RepositoryError> {
    let state: String = row.try_get("state").map_err(query_error)?;
    let version: i64 = row.try_get("version").map_err(query_error)?;
    let mut instance: WorkflowInstance = serde_json::from_str(&state)
        .map_err(|e| RepositoryError::Query(format!("invalid instance JSON: {e}")))?;
    // The column is authoritative; the document copy may lag one save.
    instance.version = version as u64;
    Ok(instance)
}

struct PendingWorkRow {
    id: String,
    instance_id: String,
    step_id: String,
    kind: String,
    assignee: String,
    status: String,
    payload: String,
    expires_at: Option<String>,
    created_at: String,
    resolved_at: Option<String>,
    resolution: Option<String>,
}

impl PendingWorkRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            instance_id: row.try_get("instance_id")?,
            step_id: row.try_get("step_id")?,
            kind: row.try_get("kind")?,
            assignee: row.try_get("assignee")?,
            status: row.try_get("status")?,
            payload: row.try_get("payload")?,
            expires_at: row.try_get("expires_at")?,
            created_at: row.try_get("created_at")?,
            resolved_at: row.try_get("resolved_at")?,
            resolution: row.try_get("resolution")?,
        })
    }

    fn into_work(self) -> Result<PendingWork, RepositoryError> {
        let kind: WorkKind = parse_enum(&self.kind, "work kind")?;
        let status: WorkStatus = parse_enum(&self.status, "work status")?;
        let payload = serde_json::from_str(&self.payload)
            .map_err(|e| RepositoryError::Query(format!("invalid work payload: {e}")))?;
        let resolution = self
            .resolution
            .as_deref()
            .map(|s| {
                serde_json::from_str(s)
                    .map_err(|e| RepositoryError::Query(format!("invalid work resolution: {e}")))
            })
            .transpose()?;

        Ok(PendingWork {
            id: parse_uuid(&self.id)?,
            instance_id: parse_uuid(&self.instance_id)?,
            step_id: self.step_id,
            kind,
            assignee: self.assignee,
            status,
            payload,
            expires_at: self.expires_at.as_deref().map(parse_datetime).transpose()?,
            created_at: parse_datetime(&self.created_at)?,
            resolved_at: self.resolved_at.as_deref().map(parse_datetime).transpose()?,
            resolution,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn query_error(e: sqlx::Error) -> RepositoryError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            RepositoryError::Connection
        }
        other => RepositoryError::Query(other.to_string()),
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width RFC 3339 so that text comparison in SQL orders correctly.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_enum<T: serde::de::DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| RepositoryError::Query(format!("invalid {what}: {s}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(format!("serialize: {e}")))
}

/// `,task,delay,` for an instance with suspended task and delay branches.
fn suspended_kinds(instance: &WorkflowInstance) -> String {
    let mut kinds: Vec<&str> = instance
        .running_steps
        .iter()
        .filter(|e| e.status == ExecutionStatus::Suspended)
        .map(|e| e.kind.as_str())
        .collect();
    if kinds.is_empty() {
        return String::new();
    }
    kinds.sort_unstable();
    kinds.dedup();
    format!(",{},", kinds.join(","))
}

// ---------------------------------------------------------------------------
// InstanceStore impl
// ---------------------------------------------------------------------------

impl InstanceStore for SqliteInstanceStore {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let definition_json = to_json(def)?;
        let now = format_datetime(&Utc::now());

        sqlx::query(
            r#"INSERT INTO workflow_definitions (id, name, version, definition, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 version = excluded.version,
                 definition = excluded.definition,
                 updated_at = excluded.updated_at"#,
        )
        .bind(def.id.to_string())
        .bind(&def.name)
        .bind(&def.version)
        .bind(&definition_json)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn load_definition(
        &self,
        id: &Uuid,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT definition FROM workflow_definitions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        row.map(|row| {
            let definition: String = row.try_get("definition").map_err(query_error)?;
            serde_json::from_str(&definition)
                .map_err(|e| RepositoryError::Query(format!("invalid workflow definition JSON: {e}")))
        })
        .transpose()
    }

    async fn create(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"INSERT INTO workflow_instances
               (id, definition_id, definition_name, status, suspended_kinds, state, version,
                created_at, updated_at, ended_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO NOTHING"#,
        )
        .bind(instance.id.to_string())
        .bind(instance.definition_id.to_string())
        .bind(&instance.definition_name)
        .bind(instance.status.as_str())
        .bind(suspended_kinds(instance))
        .bind(to_json(instance)?)
        .bind(instance.version as i64)
        .bind(format_datetime(&instance.created_at))
        .bind(format_datetime(&instance.updated_at))
        .bind(instance.ended_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::Conflict(format!(
                "instance {} already exists",
                instance.id
            )));
        }
        Ok(())
    }

    async fn load(&self, id: &Uuid) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM workflow_instances WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        row.as_ref().map(instance_from_row).transpose()
    }

    async fn save(&self, instance: &WorkflowInstance) -> Result<u64, RepositoryError> {
        let mut next = instance.clone();
        next.version += 1;
        next.updated_at = Utc::now();

        let result = sqlx::query(
            r#"UPDATE workflow_instances SET
                 status = ?,
                 suspended_kinds = ?,
                 state = ?,
                 version = ?,
                 updated_at = ?,
                 ended_at = ?
               WHERE id = ? AND version = ?"#,
        )
        .bind(next.status.as_str())
        .bind(suspended_kinds(&next))
        .bind(to_json(&next)?)
        .bind(next.version as i64)
        .bind(format_datetime(&next.updated_at))
        .bind(next.ended_at.as_ref().map(format_datetime))
        .bind(instance.id.to_string())
        .bind(instance.version as i64)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 1 {
            return Ok(next.version);
        }

        let stored: Option<(i64,)> =
            sqlx::query_as("SELECT version FROM workflow_instances WHERE id = ?")
                .bind(instance.id.to_string())
                .fetch_optional(&self.pool.writer)
                .await
                .map_err(query_error)?;

        match stored {
            None => Err(RepositoryError::NotFound),
            Some((version,)) => Err(RepositoryError::Conflict(format!(
                "instance {} is at version {version}, write was based on {}",
                instance.id, instance.version
            ))),
        }
    }

    async fn list_suspended(
        &self,
        kind: StepKind,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let sql = format!(
            "SELECT {INSTANCE_COLUMNS} FROM workflow_instances \
             WHERE status IN ('active', 'suspended') AND suspended_kinds LIKE ? \
             ORDER BY created_at ASC, id ASC"
        );
        self.fetch_instances(sqlx::query(&sql).bind(format!("%,{},%", kind.as_str())))
            .await
    }

    async fn list_failed(
        &self,
        definition_id: Option<&Uuid>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let sql = format!(
            "SELECT {INSTANCE_COLUMNS} FROM workflow_instances \
             WHERE status = 'failed' AND ended_at >= ? AND ended_at < ? \
               AND (? IS NULL OR definition_id = ?) \
             ORDER BY created_at ASC, id ASC"
        );
        let definition_id = definition_id.map(Uuid::to_string);
        self.fetch_instances(
            sqlx::query(&sql)
                .bind(format_datetime(&from))
                .bind(format_datetime(&to))
                .bind(definition_id.clone())
                .bind(definition_id),
        )
        .await
    }

    async fn list_active(&self) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let sql = format!(
            "SELECT {INSTANCE_COLUMNS} FROM workflow_instances \
             WHERE status IN ('active', 'suspended') ORDER BY created_at ASC, id ASC"
        );
        self.fetch_instances(sqlx::query(&sql)).await
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        // pending_work rows go with their instance (ON DELETE CASCADE).
        let result = sqlx::query(
            "DELETE FROM workflow_instances \
             WHERE status IN ('completed', 'cancelled', 'failed') \
               AND ended_at IS NOT NULL AND ended_at < ?",
        )
        .bind(format_datetime(&cutoff))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(result.rows_affected())
    }

    async fn save_work(&self, work: &PendingWork) -> Result<(), RepositoryError> {
        let resolution = work.resolution.as_ref().map(to_json).transpose()?;

        sqlx::query(
            r#"INSERT INTO pending_work
               (id, instance_id, step_id, kind, assignee, status, payload,
                expires_at, created_at, resolved_at, resolution)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 assignee = excluded.assignee,
                 status = excluded.status,
                 payload = excluded.payload,
                 expires_at = excluded.expires_at,
                 resolved_at = excluded.resolved_at,
                 resolution = excluded.resolution"#,
        )
        .bind(work.id.to_string())
        .bind(work.instance_id.to_string())
        .bind(&work.step_id)
        .bind(match work.kind {
            WorkKind::Task => "task",
            WorkKind::Approval => "approval",
        })
        .bind(&work.assignee)
        .bind(work.status.as_str())
        .bind(to_json(&work.payload)?)
        .bind(work.expires_at.as_ref().map(format_datetime))
        .bind(format_datetime(&work.created_at))
        .bind(work.resolved_at.as_ref().map(format_datetime))
        .bind(resolution)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn load_work(&self, id: &Uuid) -> Result<Option<PendingWork>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {WORK_COLUMNS} FROM pending_work WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = PendingWorkRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_work()?))
            }
            None => Ok(None),
        }
    }

    async fn list_work(&self, instance_id: &Uuid) -> Result<Vec<PendingWork>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {WORK_COLUMNS} FROM pending_work WHERE instance_id = ? ORDER BY created_at ASC, id ASC"
        ))
        .bind(instance_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = PendingWorkRow::from_row(row).map_err(query_error)?;
            items.push(r.into_work()?);
        }
        Ok(items)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
