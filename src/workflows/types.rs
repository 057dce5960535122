use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Feature-owned workflow data. The engine only ever merges it shallowly.
pub type Payload = Map<String, Value>;

pub const STATE_COMPLETED: &str = "COMPLETED";
pub const STATE_FAILED: &str = "FAILED";
pub const STATE_EXPIRED: &str = "EXPIRED";
pub const STATE_CANCELLED: &str = "CANCELLED";

/// Actor recorded on transitions made by the engine's own callers (e.g. the expiry sweep).
pub const SYSTEM_ACTOR: &str = "system";

/// A persisted workflow instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: Uuid,
    pub workflow_type: String,
    pub workflow_reference_id: String,
    pub current_state: String,
    pub payload: Payload,
    pub version: i64,
    pub context_key: Option<String>,
    pub correlation_id: Option<String>,
    pub transition_reason: Option<String>,
    pub last_modified_by: Option<String>,
    pub last_transition_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    /// Decode the payload into a feature-defined structure.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.payload.clone()))
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|deadline| deadline < now)
    }
}

/// Encode a feature-defined structure as a payload. Anything that does not
/// serialize to a JSON object is rejected.
pub fn payload_from<T: Serialize>(value: &T) -> Result<Payload, serde_json::Error> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Payload::new()),
        other => Err(serde::ser::Error::custom(format!(
            "workflow payload must serialize to an object, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Shallow overlay: keys in `overlay` replace same-named keys in `base`.
/// Nested objects are replaced wholesale, never merged.
pub fn merge_payload(base: &Payload, overlay: &Payload) -> Payload {
    let mut merged = base.clone();
    for (key, value) in overlay {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Optional settings for `WorkflowManager::start`
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub context_key: Option<String>,
    pub correlation_id: Option<String>,
    pub expires_in_seconds: Option<i64>,
    pub created_by: Option<String>,
}

impl StartOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn context_key(mut self, key: impl Into<String>) -> Self {
        self.context_key = Some(key.into());
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn expires_in_seconds(mut self, seconds: i64) -> Self {
        self.expires_in_seconds = Some(seconds);
        self
    }

    pub fn created_by(mut self, actor: impl Into<String>) -> Self {
        self.created_by = Some(actor.into());
        self
    }
}

/// What a caller wants a transition to do
#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub to_state: String,
    pub reason: Option<String>,
    pub update_payload: Option<Payload>,
    pub last_modified_by: Option<String>,
}

impl TransitionRequest {
    pub fn to(state: impl Into<String>) -> Self {
        Self {
            to_state: state.into(),
            reason: None,
            update_payload: None,
            last_modified_by: None,
        }
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn update_payload(mut self, payload: Payload) -> Self {
        self.update_payload = Some(payload);
        self
    }

    pub fn by(mut self, actor: impl Into<String>) -> Self {
        self.last_modified_by = Some(actor.into());
        self
    }
}

/// Insert shape handed to the store. Version and id are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewWorkflow {
    pub workflow_type: String,
    pub workflow_reference_id: String,
    pub initial_state: String,
    pub payload: Payload,
    pub is_active: bool,
    pub context_key: Option<String>,
    pub correlation_id: Option<String>,
    pub last_modified_by: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Field set written by a compare-and-swap update
#[derive(Debug, Clone)]
pub struct WorkflowUpdate {
    pub current_state: String,
    pub payload: Payload,
    pub is_active: bool,
    pub transition_reason: Option<String>,
    pub last_modified_by: Option<String>,
    pub last_transition_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
