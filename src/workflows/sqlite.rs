use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use super::store::{ActiveFlagRefresh, StoreError, WorkflowStore};
use super::terminal::TerminalStates;
use super::types::{NewWorkflow, Payload, Workflow, WorkflowUpdate};

const SELECT_COLUMNS: &str = r#"
    id, workflow_type, workflow_reference_id, current_state, payload, version,
    context_key, correlation_id, transition_reason, last_modified_by,
    last_transition_at, expires_at, created_at, updated_at
"#;

/// SQLite-backed workflow store.
///
/// Uniqueness of active records is enforced by the partial unique index
/// `workflows_one_active_per_reference`; the store only translates the
/// resulting constraint violation.
#[derive(Debug, Clone)]
pub struct SqliteWorkflowStore {
    pool: SqlitePool,
}

impl SqliteWorkflowStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(id: &str, column: &str, millis: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| StoreError::Corrupt {
        id: id.to_string(),
        reason: format!("{column} holds out-of-range timestamp {millis}"),
    })
}

fn optional_millis(
    id: &str,
    column: &str,
    millis: Option<i64>,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    millis.map(|ms| from_millis(id, column, ms)).transpose()
}

fn row_to_workflow(row: &SqliteRow) -> Result<Workflow, StoreError> {
    let raw_id: String = row.try_get("id")?;
    let id = Uuid::parse_str(&raw_id).map_err(|e| StoreError::Corrupt {
        id: raw_id.clone(),
        reason: format!("invalid id: {e}"),
    })?;

    let raw_payload: String = row.try_get("payload")?;
    let payload: Payload = serde_json::from_str(&raw_payload).map_err(|e| StoreError::Corrupt {
        id: raw_id.clone(),
        reason: format!("payload is not a JSON object: {e}"),
    })?;

    Ok(Workflow {
        id,
        workflow_type: row.try_get("workflow_type")?,
        workflow_reference_id: row.try_get("workflow_reference_id")?,
        current_state: row.try_get("current_state")?,
        payload,
        version: row.try_get("version")?,
        context_key: row.try_get("context_key")?,
        correlation_id: row.try_get("correlation_id")?,
        transition_reason: row.try_get("transition_reason")?,
        last_modified_by: row.try_get("last_modified_by")?,
        last_transition_at: optional_millis(
            &raw_id,
            "last_transition_at",
            row.try_get("last_transition_at")?,
        )?,
        expires_at: optional_millis(&raw_id, "expires_at", row.try_get("expires_at")?)?,
        created_at: from_millis(&raw_id, "created_at", row.try_get("created_at")?)?,
        updated_at: from_millis(&raw_id, "updated_at", row.try_get("updated_at")?)?,
    })
}

fn rows_to_workflows(rows: Vec<SqliteRow>) -> Result<Vec<Workflow>, StoreError> {
    rows.iter().map(row_to_workflow).collect()
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl WorkflowStore for SqliteWorkflowStore {
    async fn insert(&self, record: NewWorkflow) -> Result<Workflow, StoreError> {
        let id = Uuid::new_v4();
        let payload = serde_json::to_string(&record.payload)?;

        let result = sqlx::query(
            r#"
            INSERT INTO workflows (
                id, workflow_type, workflow_reference_id, current_state, payload,
                version, is_active, context_key, correlation_id, last_modified_by,
                expires_at, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
            "#,
        )
        .bind(id.to_string())
        .bind(&record.workflow_type)
        .bind(&record.workflow_reference_id)
        .bind(&record.initial_state)
        .bind(&payload)
        .bind(record.is_active)
        .bind(&record.context_key)
        .bind(&record.correlation_id)
        .bind(&record.last_modified_by)
        .bind(record.expires_at.map(to_millis))
        .bind(to_millis(record.created_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(StoreError::DuplicateActive {
                    workflow_type: record.workflow_type,
                    reference_id: record.workflow_reference_id,
                });
            }
            Err(e) => return Err(e.into()),
        }

        debug!(workflow_id = %id, "Inserted workflow row");

        // Round-trip timestamps through the stored precision so callers see
        // exactly what a later read returns.
        let created_at = from_millis(&id.to_string(), "created_at", to_millis(record.created_at))?;
        let expires_at = optional_millis(
            &id.to_string(),
            "expires_at",
            record.expires_at.map(to_millis),
        )?;

        Ok(Workflow {
            id,
            workflow_type: record.workflow_type,
            workflow_reference_id: record.workflow_reference_id,
            current_state: record.initial_state,
            payload: record.payload,
            version: 1,
            context_key: record.context_key,
            correlation_id: record.correlation_id,
            transition_reason: None,
            last_modified_by: record.last_modified_by,
            last_transition_at: None,
            expires_at,
            created_at,
            updated_at: created_at,
        })
    }

    async fn compare_and_swap_update(
        &self,
        id: Uuid,
        expected_version: i64,
        update: WorkflowUpdate,
    ) -> Result<Option<Workflow>, StoreError> {
        let payload = serde_json::to_string(&update.payload)?;
        let sql = format!(
            r#"
            UPDATE workflows
            SET current_state = ?1,
                payload = ?2,
                version = ?3 + 1,
                is_active = ?4,
                transition_reason = ?5,
                last_modified_by = ?6,
                last_transition_at = ?7,
                updated_at = ?8
            WHERE id = ?9 AND version = ?3
            RETURNING {SELECT_COLUMNS}
            "#
        );

        let result = sqlx::query(&sql)
            .bind(&update.current_state)
            .bind(&payload)
            .bind(expected_version)
            .bind(update.is_active)
            .bind(&update.transition_reason)
            .bind(&update.last_modified_by)
            .bind(to_millis(update.last_transition_at))
            .bind(to_millis(update.updated_at))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await;

        match result {
            Ok(Some(row)) => Ok(Some(row_to_workflow(&row)?)),
            Ok(None) => Ok(None),
            Err(e) if is_unique_violation(&e) => {
                // The row exists; only its identity pair is needed for the error.
                let current = self.find_by_id(id).await?;
                let (workflow_type, reference_id) = current
                    .map(|w| (w.workflow_type, w.workflow_reference_id))
                    .unwrap_or_default();
                Err(StoreError::DuplicateActive {
                    workflow_type,
                    reference_id,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Workflow>, StoreError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM workflows WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_workflow).transpose()
    }

    async fn find_active_by_type_and_reference(
        &self,
        workflow_type: &str,
        reference_id: &str,
    ) -> Result<Option<Workflow>, StoreError> {
        let sql = format!(
            r#"
            SELECT {SELECT_COLUMNS} FROM workflows
            WHERE workflow_type = ?1 AND workflow_reference_id = ?2 AND is_active = 1
            LIMIT 1
            "#
        );
        let row = sqlx::query(&sql)
            .bind(workflow_type)
            .bind(reference_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_workflow).transpose()
    }

    async fn find_by_type_and_state(
        &self,
        workflow_type: &str,
        state: &str,
    ) -> Result<Vec<Workflow>, StoreError> {
        let sql = format!(
            r#"
            SELECT {SELECT_COLUMNS} FROM workflows
            WHERE workflow_type = ?1 AND current_state = ?2
            ORDER BY created_at ASC
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(workflow_type)
            .bind(state)
            .fetch_all(&self.pool)
            .await?;

        rows_to_workflows(rows)
    }

    async fn find_active_by_context_key(
        &self,
        context_key: &str,
    ) -> Result<Vec<Workflow>, StoreError> {
        let sql = format!(
            r#"
            SELECT {SELECT_COLUMNS} FROM workflows
            WHERE context_key = ?1 AND is_active = 1
            ORDER BY created_at ASC
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(context_key)
            .fetch_all(&self.pool)
            .await?;

        rows_to_workflows(rows)
    }

    async fn refresh_active_flags(
        &self,
        terminal_states: &TerminalStates,
    ) -> Result<ActiveFlagRefresh, StoreError> {
        let terminal = serde_json::to_string(&terminal_states.iter().collect::<Vec<_>>())?;
        let mut tx = self.pool.begin().await?;

        let deactivated = sqlx::query(
            r#"
            UPDATE workflows SET is_active = 0
            WHERE is_active = 1
              AND current_state IN (SELECT value FROM json_each(?1))
            "#,
        )
        .bind(&terminal)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        // Candidates are chosen against the table as it was before this
        // statement, so at most one row per pair turns active.
        let reactivated = sqlx::query(
            r#"
            UPDATE workflows SET is_active = 1
            WHERE is_active = 0
              AND current_state NOT IN (SELECT value FROM json_each(?1))
              AND NOT EXISTS (
                  SELECT 1 FROM workflows live
                  WHERE live.workflow_type = workflows.workflow_type
                    AND live.workflow_reference_id = workflows.workflow_reference_id
                    AND live.is_active = 1
              )
              AND id = (
                  SELECT candidate.id FROM workflows candidate
                  WHERE candidate.workflow_type = workflows.workflow_type
                    AND candidate.workflow_reference_id = workflows.workflow_reference_id
                    AND candidate.is_active = 0
                    AND candidate.current_state NOT IN (SELECT value FROM json_each(?1))
                  ORDER BY candidate.updated_at DESC, candidate.id DESC
                  LIMIT 1
              )
            "#,
        )
        .bind(&terminal)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        if deactivated > 0 || reactivated > 0 {
            debug!(deactivated, reactivated, "Refreshed workflow activity flags");
        }
        Ok(ActiveFlagRefresh {
            deactivated,
            reactivated,
        })
    }

    async fn find_where_expires_at_before_and_not_terminal(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Workflow>, StoreError> {
        let sql = format!(
            r#"
            SELECT {SELECT_COLUMNS} FROM workflows
            WHERE is_active = 1 AND expires_at IS NOT NULL AND expires_at < ?1
            ORDER BY expires_at ASC
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(to_millis(now))
            .fetch_all(&self.pool)
            .await?;

        rows_to_workflows(rows)
    }
}
