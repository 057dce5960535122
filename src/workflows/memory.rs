use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::store::{ActiveFlagRefresh, StoreError, WorkflowStore};
use super::terminal::TerminalStates;
use super::types::{NewWorkflow, Workflow, WorkflowUpdate};

#[derive(Debug, Clone)]
struct StoredWorkflow {
    workflow: Workflow,
    is_active: bool,
}

/// In-process workflow store.
///
/// Every write takes the single write lock, so the uniqueness check and the
/// insert (or the version check and the update) happen as one step.
#[derive(Debug, Default)]
pub struct MemoryWorkflowStore {
    records: RwLock<HashMap<Uuid, StoredWorkflow>>,
}

impl MemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

fn conflicting_active<'a>(
    records: &'a HashMap<Uuid, StoredWorkflow>,
    workflow_type: &str,
    reference_id: &str,
    except: Option<Uuid>,
) -> Option<&'a StoredWorkflow> {
    records.values().find(|stored| {
        stored.is_active
            && Some(stored.workflow.id) != except
            && stored.workflow.workflow_type == workflow_type
            && stored.workflow.workflow_reference_id == reference_id
    })
}

fn pair_of(workflow: &Workflow) -> (&str, &str) {
    (&workflow.workflow_type, &workflow.workflow_reference_id)
}

#[async_trait]
impl WorkflowStore for MemoryWorkflowStore {
    async fn insert(&self, record: NewWorkflow) -> Result<Workflow, StoreError> {
        let mut records = self.records.write().await;

        if record.is_active
            && conflicting_active(
                &records,
                &record.workflow_type,
                &record.workflow_reference_id,
                None,
            )
            .is_some()
        {
            return Err(StoreError::DuplicateActive {
                workflow_type: record.workflow_type,
                reference_id: record.workflow_reference_id,
            });
        }

        let workflow = Workflow {
            id: Uuid::new_v4(),
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
            expires_at: record.expires_at,
            created_at: record.created_at,
            updated_at: record.created_at,
        };

        records.insert(
            workflow.id,
            StoredWorkflow {
                workflow: workflow.clone(),
                is_active: record.is_active,
            },
        );
        debug!(workflow_id = %workflow.id, "Inserted workflow into memory store");

        Ok(workflow)
    }

    async fn compare_and_swap_update(
        &self,
        id: Uuid,
        expected_version: i64,
        update: WorkflowUpdate,
    ) -> Result<Option<Workflow>, StoreError> {
        let mut records = self.records.write().await;

        let (workflow_type, reference_id) = match records.get(&id) {
            Some(stored) if stored.workflow.version == expected_version => (
                stored.workflow.workflow_type.clone(),
                stored.workflow.workflow_reference_id.clone(),
            ),
            _ => return Ok(None),
        };

        if update.is_active
            && conflicting_active(&records, &workflow_type, &reference_id, Some(id)).is_some()
        {
            return Err(StoreError::DuplicateActive {
                workflow_type,
                reference_id,
            });
        }

        let Some(stored) = records.get_mut(&id) else {
            return Ok(None);
        };
        let workflow = &mut stored.workflow;
        workflow.current_state = update.current_state;
        workflow.payload = update.payload;
        workflow.version = expected_version + 1;
        workflow.transition_reason = update.transition_reason;
        workflow.last_modified_by = update.last_modified_by;
        workflow.last_transition_at = Some(update.last_transition_at);
        workflow.updated_at = update.updated_at;
        stored.is_active = update.is_active;

        Ok(Some(stored.workflow.clone()))
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Workflow>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .get(&id)
            .map(|stored| stored.workflow.clone()))
    }

    async fn find_active_by_type_and_reference(
        &self,
        workflow_type: &str,
        reference_id: &str,
    ) -> Result<Option<Workflow>, StoreError> {
        let records = self.records.read().await;
        Ok(conflicting_active(&records, workflow_type, reference_id, None)
            .map(|stored| stored.workflow.clone()))
    }

    async fn find_by_type_and_state(
        &self,
        workflow_type: &str,
        state: &str,
    ) -> Result<Vec<Workflow>, StoreError> {
        let records = self.records.read().await;
        let mut found: Vec<Workflow> = records
            .values()
            .filter(|stored| {
                stored.workflow.workflow_type == workflow_type
                    && stored.workflow.current_state == state
            })
            .map(|stored| stored.workflow.clone())
            .collect();
        found.sort_by_key(|w| w.created_at);
        Ok(found)
    }

    async fn find_active_by_context_key(
        &self,
        context_key: &str,
    ) -> Result<Vec<Workflow>, StoreError> {
        let records = self.records.read().await;
        let mut found: Vec<Workflow> = records
            .values()
            .filter(|stored| {
                stored.is_active && stored.workflow.context_key.as_deref() == Some(context_key)
            })
            .map(|stored| stored.workflow.clone())
            .collect();
        found.sort_by_key(|w| w.created_at);
        Ok(found)
    }

    async fn refresh_active_flags(
        &self,
        terminal_states: &TerminalStates,
    ) -> Result<ActiveFlagRefresh, StoreError> {
        let mut records = self.records.write().await;
        let mut refresh = ActiveFlagRefresh::default();

        for stored in records.values_mut() {
            if stored.is_active && terminal_states.is_terminal(&stored.workflow.current_state) {
                stored.is_active = false;
                refresh.deactivated += 1;
            }
        }

        let reactivate: Vec<Uuid> = {
            let held: HashSet<(&str, &str)> = records
                .values()
                .filter(|stored| stored.is_active)
                .map(|stored| pair_of(&stored.workflow))
                .collect();

            let mut chosen: HashMap<(&str, &str), (DateTime<Utc>, Uuid)> = HashMap::new();
            for stored in records.values() {
                let pair = pair_of(&stored.workflow);
                if stored.is_active
                    || terminal_states.is_terminal(&stored.workflow.current_state)
                    || held.contains(&pair)
                {
                    continue;
                }
                let candidate = (stored.workflow.updated_at, stored.workflow.id);
                chosen
                    .entry(pair)
                    .and_modify(|best| *best = (*best).max(candidate))
                    .or_insert(candidate);
            }
            chosen.into_values().map(|(_, id)| id).collect()
        };

        for id in reactivate {
            if let Some(stored) = records.get_mut(&id) {
                stored.is_active = true;
                refresh.reactivated += 1;
            }
        }

        Ok(refresh)
    }

    async fn find_where_expires_at_before_and_not_terminal(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Workflow>, StoreError> {
        let records = self.records.read().await;
        let mut found: Vec<Workflow> = records
            .values()
            .filter(|stored| stored.is_active && stored.workflow.is_expired_at(now))
            .map(|stored| stored.workflow.clone())
            .collect();
        found.sort_by_key(|w| w.expires_at);
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflows::types::Payload;

    fn new_record(reference_id: &str, is_active: bool) -> NewWorkflow {
        NewWorkflow {
            workflow_type: "DEMAND_REQUEST".to_string(),
            workflow_reference_id: reference_id.to_string(),
            initial_state: "COLLECTING".to_string(),
            payload: Payload::new(),
            is_active,
            context_key: None,
            correlation_id: None,
            last_modified_by: None,
            expires_at: None,
            created_at: Utc::now(),
        }
    }

    fn update(state: &str, is_active: bool) -> WorkflowUpdate {
        WorkflowUpdate {
            current_state: state.to_string(),
            payload: Payload::new(),
            is_active,
            transition_reason: None,
            last_modified_by: None,
            last_transition_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn insert_rejects_second_active_record_for_pair() {
        let store = MemoryWorkflowStore::new();
        store.insert(new_record("T1", true)).await.unwrap();

        let err = store.insert(new_record("T1", true)).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateActive { .. }));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn inactive_records_do_not_block_inserts() {
        let store = MemoryWorkflowStore::new();
        store.insert(new_record("T1", false)).await.unwrap();
        store.insert(new_record("T1", true)).await.unwrap();
        store.insert(new_record("T1", false)).await.unwrap();
        assert_eq!(store.len().await, 3);
    }

    #[tokio::test]
    async fn cas_only_applies_on_matching_version() {
        let store = MemoryWorkflowStore::new();
        let created = store.insert(new_record("T1", true)).await.unwrap();

        let stale = store
            .compare_and_swap_update(created.id, 0, update("REVIEW", true))
            .await
            .unwrap();
        assert!(stale.is_none());

        let updated = store
            .compare_and_swap_update(created.id, 1, update("REVIEW", true))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.current_state, "REVIEW");
        assert!(updated.last_transition_at.is_some());
    }

    #[tokio::test]
    async fn cas_on_unknown_id_matches_nothing() {
        let store = MemoryWorkflowStore::new();
        let result = store
            .compare_and_swap_update(Uuid::new_v4(), 1, update("REVIEW", true))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn reactivating_a_finished_record_respects_uniqueness() {
        let store = MemoryWorkflowStore::new();
        let first = store.insert(new_record("T1", true)).await.unwrap();
        store
            .compare_and_swap_update(first.id, 1, update("COMPLETED", false))
            .await
            .unwrap()
            .unwrap();
        store.insert(new_record("T1", true)).await.unwrap();

        let err = store
            .compare_and_swap_update(first.id, 2, update("REOPENED", true))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateActive { .. }));
        assert_eq!(
            store.find_by_id(first.id).await.unwrap().unwrap().version,
            2
        );
    }

    #[tokio::test]
    async fn refresh_follows_a_changed_terminal_set() {
        let store = MemoryWorkflowStore::new();
        let archived = store.insert(new_record("T1", true)).await.unwrap();
        store
            .compare_and_swap_update(archived.id, 1, update("ARCHIVED", true))
            .await
            .unwrap()
            .unwrap();

        let refresh = store
            .refresh_active_flags(&TerminalStates::default().with("ARCHIVED"))
            .await
            .unwrap();
        assert_eq!(refresh, ActiveFlagRefresh { deactivated: 1, reactivated: 0 });
        assert!(store
            .find_active_by_type_and_reference("DEMAND_REQUEST", "T1")
            .await
            .unwrap()
            .is_none());

        let refresh = store
            .refresh_active_flags(&TerminalStates::default())
            .await
            .unwrap();
        assert_eq!(refresh, ActiveFlagRefresh { deactivated: 0, reactivated: 1 });
        let found = store
            .find_active_by_type_and_reference("DEMAND_REQUEST", "T1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, archived.id);
    }

    #[tokio::test]
    async fn refresh_never_reactivates_over_a_live_record() {
        let store = MemoryWorkflowStore::new();
        let old = store.insert(new_record("T1", true)).await.unwrap();
        store
            .compare_and_swap_update(old.id, 1, update("ARCHIVED", false))
            .await
            .unwrap()
            .unwrap();
        let live = store.insert(new_record("T1", true)).await.unwrap();

        let refresh = store
            .refresh_active_flags(&TerminalStates::default())
            .await
            .unwrap();
        assert_eq!(refresh, ActiveFlagRefresh::default());
        let found = store
            .find_active_by_type_and_reference("DEMAND_REQUEST", "T1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, live.id);
    }
}
