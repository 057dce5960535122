use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use super::store::{ActiveFlagRefresh, StoreError, WorkflowStore};
use super::terminal::TerminalStates;
use super::types::{
    merge_payload, NewWorkflow, Payload, StartOptions, TransitionRequest, Workflow, WorkflowUpdate,
};
use crate::observability::WorkflowMetrics;

/// Domain errors surfaced by the workflow manager
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("workflow {id} not found")]
    NotFound { id: Uuid },

    #[error("an active {workflow_type} workflow is already in progress for reference {reference_id}")]
    DuplicateActive {
        workflow_type: String,
        reference_id: String,
    },

    #[error("workflow {id} version conflict: expected {expected}, found {actual}")]
    VersionConflict { id: Uuid, expected: i64, actual: i64 },

    #[error("invalid workflow request: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Store(StoreError),
}

impl WorkflowError {
    /// True for both flavours of conflict: a duplicate active instance on
    /// `start` and a stale version on `transition`.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            WorkflowError::DuplicateActive { .. } | WorkflowError::VersionConflict { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, WorkflowError::NotFound { .. })
    }
}

impl From<StoreError> for WorkflowError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateActive {
                workflow_type,
                reference_id,
            } => WorkflowError::DuplicateActive {
                workflow_type,
                reference_id,
            },
            other => WorkflowError::Store(other),
        }
    }
}

/// Entry point for every workflow consumer.
///
/// Holds no mutable state of its own; each call is a fresh round-trip to the
/// store, so one manager can be cloned into any number of handlers.
#[derive(Clone)]
pub struct WorkflowManager {
    store: Arc<dyn WorkflowStore>,
    terminal_states: TerminalStates,
    metrics: Arc<WorkflowMetrics>,
}

impl std::fmt::Debug for WorkflowManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowManager")
            .field("terminal_states", &self.terminal_states)
            .finish_non_exhaustive()
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<(), WorkflowError> {
    if value.trim().is_empty() {
        return Err(WorkflowError::InvalidArgument(format!(
            "{field} must not be empty"
        )));
    }
    Ok(())
}

impl WorkflowManager {
    pub fn new(store: Arc<dyn WorkflowStore>, terminal_states: TerminalStates) -> Self {
        Self {
            store,
            terminal_states,
            metrics: Arc::new(WorkflowMetrics::new()),
        }
    }

    /// Share a metrics sink across managers (e.g. one per process)
    pub fn with_metrics(mut self, metrics: Arc<WorkflowMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn terminal_states(&self) -> &TerminalStates {
        &self.terminal_states
    }

    pub fn metrics(&self) -> &WorkflowMetrics {
        &self.metrics
    }

    pub fn is_terminal(&self, state: &str) -> bool {
        self.terminal_states.is_terminal(state)
    }

    /// Create a workflow in `initial_state` at version 1.
    ///
    /// Fails with `DuplicateActive` when another active instance exists for
    /// the same type and reference id. The store decides that atomically;
    /// there is no pre-check here.
    pub async fn start(
        &self,
        workflow_type: &str,
        workflow_reference_id: &str,
        initial_state: &str,
        payload: Payload,
        options: StartOptions,
    ) -> Result<Workflow, WorkflowError> {
        let span = tracing::info_span!(
            "workflow_start",
            workflow_type = workflow_type,
            workflow.reference_id = workflow_reference_id,
            correlation.id = options.correlation_id.as_deref()
        );

        async move {
            require_non_empty("workflow type", workflow_type)?;
            require_non_empty("workflow reference id", workflow_reference_id)?;
            require_non_empty("initial state", initial_state)?;

            let now = Utc::now();
            let expires_at = match options.expires_in_seconds {
                Some(seconds) if seconds < 0 => {
                    return Err(WorkflowError::InvalidArgument(format!(
                        "expires_in_seconds must not be negative, got {seconds}"
                    )));
                }
                Some(seconds) => Some(
                    Duration::try_seconds(seconds)
                        .and_then(|ttl| now.checked_add_signed(ttl))
                        .ok_or_else(|| {
                            WorkflowError::InvalidArgument(format!(
                                "expires_in_seconds {seconds} is out of range"
                            ))
                        })?,
                ),
                None => None,
            };

            let record = NewWorkflow {
                workflow_type: workflow_type.to_string(),
                workflow_reference_id: workflow_reference_id.to_string(),
                initial_state: initial_state.to_string(),
                payload,
                is_active: self.terminal_states.is_active(initial_state),
                context_key: options.context_key,
                correlation_id: options.correlation_id,
                last_modified_by: options.created_by,
                expires_at,
                created_at: now,
            };

            match self.store.insert(record).await {
                Ok(workflow) => {
                    self.metrics.record_start();
                    info!(
                        workflow_id = %workflow.id,
                        state = %workflow.current_state,
                        expires_at = ?workflow.expires_at,
                        "Workflow started"
                    );
                    Ok(workflow)
                }
                Err(StoreError::DuplicateActive { .. }) => {
                    self.metrics.record_conflict();
                    warn!("Workflow already in progress for reference");
                    Err(WorkflowError::DuplicateActive {
                        workflow_type: workflow_type.to_string(),
                        reference_id: workflow_reference_id.to_string(),
                    })
                }
                Err(e) => Err(e.into()),
            }
        }
        .instrument(span)
        .await
    }

    /// Advance a workflow that is still at `expected_version`.
    ///
    /// The payload update is overlaid shallowly on the current payload. A lost
    /// race surfaces as `VersionConflict`; the write is never retried here.
    pub async fn transition(
        &self,
        id: Uuid,
        expected_version: i64,
        request: TransitionRequest,
    ) -> Result<Workflow, WorkflowError> {
        let span = tracing::info_span!(
            "workflow_transition",
            workflow.id = %id,
            expected_version,
            to_state = %request.to_state
        );

        async move {
            require_non_empty("target state", &request.to_state)?;

            let Some(current) = self.store.find_by_id(id).await? else {
                self.metrics.record_not_found();
                return Err(WorkflowError::NotFound { id });
            };
            if current.version != expected_version {
                self.metrics.record_conflict();
                warn!(
                    expected = expected_version,
                    actual = current.version,
                    "Workflow transition requested against a stale version"
                );
                return Err(WorkflowError::VersionConflict {
                    id,
                    expected: expected_version,
                    actual: current.version,
                });
            }

            let payload = match &request.update_payload {
                Some(overlay) => merge_payload(&current.payload, overlay),
                None => current.payload.clone(),
            };
            let now = Utc::now();
            let update = WorkflowUpdate {
                is_active: self.terminal_states.is_active(&request.to_state),
                current_state: request.to_state,
                payload,
                transition_reason: request.reason,
                last_modified_by: request.last_modified_by,
                last_transition_at: now,
                updated_at: now,
            };

            match self
                .store
                .compare_and_swap_update(id, expected_version, update)
                .await
            {
                Ok(Some(updated)) => {
                    self.metrics.record_transition();
                    if self.terminal_states.is_terminal(&updated.current_state) {
                        self.metrics.record_terminal(&updated.current_state);
                    }
                    info!(
                        from_state = %current.current_state,
                        state = %updated.current_state,
                        version = updated.version,
                        "Workflow transitioned"
                    );
                    Ok(updated)
                }
                Ok(None) => Err(self.explain_failed_swap(id, expected_version).await),
                Err(StoreError::DuplicateActive {
                    workflow_type,
                    reference_id,
                }) => {
                    self.metrics.record_conflict();
                    Err(WorkflowError::DuplicateActive {
                        workflow_type,
                        reference_id,
                    })
                }
                Err(e) => Err(e.into()),
            }
        }
        .instrument(span)
        .await
    }

    /// One best-effort re-read after a compare-and-swap matched no row.
    async fn explain_failed_swap(&self, id: Uuid, expected_version: i64) -> WorkflowError {
        match self.store.find_by_id(id).await {
            Ok(Some(latest)) => {
                self.metrics.record_conflict();
                warn!(
                    expected = expected_version,
                    actual = latest.version,
                    "Workflow transition lost a version race"
                );
                WorkflowError::VersionConflict {
                    id,
                    expected: expected_version,
                    actual: latest.version,
                }
            }
            Ok(None) => {
                self.metrics.record_not_found();
                WorkflowError::NotFound { id }
            }
            Err(e) => e.into(),
        }
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Workflow>, WorkflowError> {
        Ok(self.store.find_by_id(id).await?)
    }

    /// The single active workflow for a type and reference id, if any
    pub async fn find_active_by_reference_id(
        &self,
        workflow_type: &str,
        workflow_reference_id: &str,
    ) -> Result<Option<Workflow>, WorkflowError> {
        Ok(self
            .store
            .find_active_by_type_and_reference(workflow_type, workflow_reference_id)
            .await?)
    }

    pub async fn find_by_type_and_state(
        &self,
        workflow_type: &str,
        state: &str,
    ) -> Result<Vec<Workflow>, WorkflowError> {
        Ok(self
            .store
            .find_by_type_and_state(workflow_type, state)
            .await?)
    }

    /// Active workflows sharing a secondary correlation key
    pub async fn find_active_by_context_key(
        &self,
        context_key: &str,
    ) -> Result<Vec<Workflow>, WorkflowError> {
        Ok(self.store.find_active_by_context_key(context_key).await?)
    }

    /// Active workflows whose deadline has passed. Nothing is transitioned.
    pub async fn find_expired(&self) -> Result<Vec<Workflow>, WorkflowError> {
        self.find_expired_at(Utc::now()).await
    }

    pub async fn find_expired_at(&self, now: DateTime<Utc>) -> Result<Vec<Workflow>, WorkflowError> {
        let expired = self
            .store
            .find_where_expires_at_before_and_not_terminal(now)
            .await?;
        debug!(count = expired.len(), %now, "Found expired workflows");
        Ok(expired)
    }

    /// Bring stored activity flags in line with this manager's terminal set.
    ///
    /// Lookups, expiry queries and the one-active-per-reference rule all read
    /// the stored flag, so run this once at startup whenever the configured
    /// set may differ from the one the records were written under.
    pub async fn refresh_active_flags(&self) -> Result<ActiveFlagRefresh, WorkflowError> {
        let refresh = self
            .store
            .refresh_active_flags(&self.terminal_states)
            .await?;
        if refresh != ActiveFlagRefresh::default() {
            info!(
                deactivated = refresh.deactivated,
                reactivated = refresh.reactivated,
                "Workflow activity flags refreshed for terminal state configuration"
            );
        }
        Ok(refresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflows::store::MockWorkflowStore;
    use crate::workflows::types::STATE_COMPLETED;
    use mockall::predicate::eq;

    fn workflow(version: i64) -> Workflow {
        Workflow {
            id: Uuid::nil(),
            workflow_type: "APPROVAL".to_string(),
            workflow_reference_id: "C42:1700.1".to_string(),
            current_state: "PENDING".to_string(),
            payload: Payload::new(),
            version,
            context_key: None,
            correlation_id: None,
            transition_reason: None,
            last_modified_by: None,
            last_transition_at: None,
            expires_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn manager(store: MockWorkflowStore) -> WorkflowManager {
        WorkflowManager::new(Arc::new(store), TerminalStates::default())
    }

    #[tokio::test]
    async fn start_translates_duplicate_into_conflict() {
        let mut store = MockWorkflowStore::new();
        store.expect_insert().times(1).returning(|record| {
            Err(StoreError::DuplicateActive {
                workflow_type: record.workflow_type,
                reference_id: record.workflow_reference_id,
            })
        });

        let err = manager(store)
            .start("APPROVAL", "C42:1700.1", "PENDING", Payload::new(), StartOptions::new())
            .await
            .unwrap_err();

        assert!(err.is_conflict());
        assert!(matches!(err, WorkflowError::DuplicateActive { ref reference_id, .. } if reference_id == "C42:1700.1"));
    }

    #[tokio::test]
    async fn start_marks_terminal_initial_state_inactive() {
        let mut store = MockWorkflowStore::new();
        store
            .expect_insert()
            .withf(|record| !record.is_active && record.initial_state == STATE_COMPLETED)
            .times(1)
            .returning(|_| Ok(workflow(1)));

        manager(store)
            .start("APPROVAL", "C42:1700.1", STATE_COMPLETED, Payload::new(), StartOptions::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn start_rejects_blank_arguments_without_touching_store() {
        let store = MockWorkflowStore::new();
        let manager = manager(store);

        for (kind, reference, state) in [("", "r", "S"), ("T", " ", "S"), ("T", "r", "")] {
            let err = manager
                .start(kind, reference, state, Payload::new(), StartOptions::new())
                .await
                .unwrap_err();
            assert!(matches!(err, WorkflowError::InvalidArgument(_)));
        }
    }

    #[tokio::test]
    async fn start_rejects_negative_expiry() {
        let manager = manager(MockWorkflowStore::new());
        let err = manager
            .start(
                "APPROVAL",
                "r",
                "PENDING",
                Payload::new(),
                StartOptions::new().expires_in_seconds(-5),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn transition_reports_actual_version_after_failed_swap() {
        let mut store = MockWorkflowStore::new();
        let mut reads = 0;
        store
            .expect_find_by_id()
            .with(eq(Uuid::nil()))
            .times(2)
            .returning(move |_| {
                reads += 1;
                Ok(Some(workflow(if reads == 1 { 3 } else { 4 })))
            });
        store
            .expect_compare_and_swap_update()
            .withf(|_, expected, _| *expected == 3)
            .times(1)
            .returning(|_, _, _| Ok(None));

        let err = manager(store)
            .transition(Uuid::nil(), 3, TransitionRequest::to("APPROVED"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            WorkflowError::VersionConflict { expected: 3, actual: 4, .. }
        ));
    }

    #[tokio::test]
    async fn transition_reports_not_found_when_record_vanishes_mid_swap() {
        let mut store = MockWorkflowStore::new();
        let mut reads = 0;
        store.expect_find_by_id().times(2).returning(move |_| {
            reads += 1;
            Ok(if reads == 1 { Some(workflow(1)) } else { None })
        });
        store
            .expect_compare_and_swap_update()
            .returning(|_, _, _| Ok(None));

        let err = manager(store)
            .transition(Uuid::nil(), 1, TransitionRequest::to("APPROVED"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn storage_failures_propagate_unmodified() {
        let mut store = MockWorkflowStore::new();
        store.expect_find_by_id().returning(|id| {
            Err(StoreError::Corrupt {
                id: id.to_string(),
                reason: "payload is not a JSON object".to_string(),
            })
        });

        let manager = manager(store);
        let err = manager.get(Uuid::nil()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Store(StoreError::Corrupt { .. })));
        assert!(!err.is_conflict());
    }

    #[tokio::test]
    async fn transition_rejects_stale_version_before_swapping() {
        let mut store = MockWorkflowStore::new();
        store
            .expect_find_by_id()
            .times(1)
            .returning(|_| Ok(Some(workflow(5))));
        store.expect_compare_and_swap_update().times(0);

        let manager = manager(store);
        let err = manager
            .transition(Uuid::nil(), 3, TransitionRequest::to("APPROVED"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            WorkflowError::VersionConflict { expected: 3, actual: 5, .. }
        ));
        assert_eq!(manager.metrics().get_stats().conflicts, 1);
    }

    #[tokio::test]
    async fn refresh_hands_the_configured_set_to_the_store() {
        let mut store = MockWorkflowStore::new();
        store
            .expect_refresh_active_flags()
            .withf(|terminal| terminal.is_terminal("ARCHIVED") && terminal.is_terminal("EXPIRED"))
            .times(1)
            .returning(|_| {
                Ok(ActiveFlagRefresh {
                    deactivated: 2,
                    reactivated: 0,
                })
            });

        let manager = WorkflowManager::new(
            Arc::new(store),
            TerminalStates::default().with("ARCHIVED"),
        );
        let refresh = manager.refresh_active_flags().await.unwrap();
        assert_eq!(refresh.deactivated, 2);
    }
}
