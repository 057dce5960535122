//! Typed sessions layered on the workflow manager.
//!
//! A feature (clarification Q&A, modal data collection, approvals) names its
//! workflow type, its payload shape, and who may continue a session. The
//! engine stays transport-agnostic: the same session is driven by a chat
//! reply handler, a form submission handler, or a scheduled job.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use thiserror::Error;
use tracing::{debug, warn};

use super::manager::{WorkflowError, WorkflowManager};
use super::types::{payload_from, StartOptions, TransitionRequest, Workflow};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error("no active {workflow_type} session for reference {reference_id}")]
    NoActiveSession {
        workflow_type: String,
        reference_id: String,
    },

    #[error("{actor} is not allowed to continue this session")]
    Unauthorized { actor: String },

    #[error("session payload could not be decoded: {0}")]
    PayloadDecode(#[from] serde_json::Error),
}

/// Feature-side contract for a workflow-backed session
pub trait SessionAdapter: Send + Sync {
    /// Feature-owned payload, stored as a JSON object
    type Payload: Serialize + DeserializeOwned + Send + Sync;

    /// Discriminator stored as the workflow type
    const WORKFLOW_TYPE: &'static str;

    fn initial_state(&self) -> &str;

    /// Expiry applied on `begin` unless the caller overrides it
    fn default_ttl_seconds(&self) -> Option<i64> {
        None
    }

    /// Decide whether `actor` may continue the session. Defaults to anyone.
    fn authorize(&self, _workflow: &Workflow, _payload: &Self::Payload, _actor: &str) -> bool {
        true
    }
}

/// A workflow rediscovered from a later event, with its decoded payload
#[derive(Debug, Clone)]
pub struct ActiveSession<P> {
    pub workflow: Workflow,
    pub payload: P,
}

/// Drives one `SessionAdapter` through the manager
#[derive(Debug, Clone)]
pub struct Session<A: SessionAdapter> {
    manager: WorkflowManager,
    adapter: A,
    _payload: PhantomData<fn() -> A::Payload>,
}

impl<A: SessionAdapter> Session<A> {
    pub fn new(manager: WorkflowManager, adapter: A) -> Self {
        Self {
            manager,
            adapter,
            _payload: PhantomData,
        }
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    /// Start a session on the triggering event.
    pub async fn begin(
        &self,
        reference_id: &str,
        payload: &A::Payload,
        mut options: StartOptions,
    ) -> Result<ActiveSession<A::Payload>, SessionError>
    where
        A::Payload: Clone,
    {
        if options.expires_in_seconds.is_none() {
            options.expires_in_seconds = self.adapter.default_ttl_seconds();
        }
        let workflow = self
            .manager
            .start(
                A::WORKFLOW_TYPE,
                reference_id,
                self.adapter.initial_state(),
                payload_from(payload)?,
                options,
            )
            .await?;

        Ok(ActiveSession {
            workflow,
            payload: payload.clone(),
        })
    }

    /// Rediscover the active session for `reference_id` on behalf of `actor`.
    pub async fn resume(
        &self,
        reference_id: &str,
        actor: &str,
    ) -> Result<ActiveSession<A::Payload>, SessionError> {
        let workflow = self
            .manager
            .find_active_by_reference_id(A::WORKFLOW_TYPE, reference_id)
            .await?
            .ok_or_else(|| SessionError::NoActiveSession {
                workflow_type: A::WORKFLOW_TYPE.to_string(),
                reference_id: reference_id.to_string(),
            })?;
        let payload: A::Payload = workflow.payload_as()?;

        if !self.adapter.authorize(&workflow, &payload, actor) {
            warn!(
                workflow_id = %workflow.id,
                workflow_type = A::WORKFLOW_TYPE,
                actor,
                "Rejected session continuation from unauthorized actor"
            );
            return Err(SessionError::Unauthorized {
                actor: actor.to_string(),
            });
        }

        debug!(workflow_id = %workflow.id, state = %workflow.current_state, "Resumed session");
        Ok(ActiveSession { workflow, payload })
    }

    /// Move the session to `to_state`, overlaying `update` (any serializable
    /// object) onto the stored payload.
    pub async fn advance<U: Serialize>(
        &self,
        session: &ActiveSession<A::Payload>,
        to_state: &str,
        update: Option<&U>,
        actor: &str,
        reason: Option<&str>,
    ) -> Result<ActiveSession<A::Payload>, SessionError> {
        let mut request = TransitionRequest::to(to_state).by(actor);
        if let Some(update) = update {
            request = request.update_payload(payload_from(update)?);
        }
        if let Some(reason) = reason {
            request = request.reason(reason);
        }

        let workflow = self
            .manager
            .transition(session.workflow.id, session.workflow.version, request)
            .await?;
        let payload = workflow.payload_as()?;

        Ok(ActiveSession { workflow, payload })
    }
}
