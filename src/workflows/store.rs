use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use super::terminal::TerminalStates;
use super::types::{NewWorkflow, Workflow, WorkflowUpdate};

/// Errors raised by workflow storage backends
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("an active {workflow_type} workflow already exists for reference {reference_id}")]
    DuplicateActive {
        workflow_type: String,
        reference_id: String,
    },

    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Stored workflow {id} is unreadable: {reason}")]
    Corrupt { id: String, reason: String },
}

/// Rows whose stored activity flag was rewritten by a refresh
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActiveFlagRefresh {
    pub deactivated: u64,
    pub reactivated: u64,
}

/// Durable storage for workflow records.
///
/// Implementations own two guarantees: at most one active record per
/// (workflow type, reference id), enforced atomically by the backend itself,
/// and compare-and-swap semantics on `version`.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Persist a new record at version 1. Fails with `DuplicateActive` if the
    /// record is active and another active record exists for the same pair.
    async fn insert(&self, record: NewWorkflow) -> Result<Workflow, StoreError>;

    /// Apply `update` only if the stored version equals `expected_version`,
    /// bumping the version by one. `Ok(None)` means no row matched: the id is
    /// unknown or the version moved on.
    async fn compare_and_swap_update(
        &self,
        id: Uuid,
        expected_version: i64,
        update: WorkflowUpdate,
    ) -> Result<Option<Workflow>, StoreError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Workflow>, StoreError>;

    async fn find_active_by_type_and_reference(
        &self,
        workflow_type: &str,
        reference_id: &str,
    ) -> Result<Option<Workflow>, StoreError>;

    async fn find_by_type_and_state(
        &self,
        workflow_type: &str,
        state: &str,
    ) -> Result<Vec<Workflow>, StoreError>;

    /// Active records sharing a secondary correlation key, oldest first
    async fn find_active_by_context_key(
        &self,
        context_key: &str,
    ) -> Result<Vec<Workflow>, StoreError>;

    /// Recompute the stored activity flag of every record against
    /// `terminal_states`.
    ///
    /// Records whose state is now terminal are deactivated. A record whose
    /// state is now active is reactivated only when its pair has no active
    /// record; among several candidates for one pair the most recently
    /// updated wins and the rest stay inactive.
    async fn refresh_active_flags(
        &self,
        terminal_states: &TerminalStates,
    ) -> Result<ActiveFlagRefresh, StoreError>;

    /// Active records whose deadline is strictly before `now`, oldest deadline first
    async fn find_where_expires_at_before_and_not_terminal(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Workflow>, StoreError>;
}
