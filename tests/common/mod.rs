//! Shared fixtures for workflow engine integration tests

#![allow(dead_code)]

use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;

use deskflow::config::DatabaseConfig;
use deskflow::{DatabaseManager, MemoryWorkflowStore, Payload, TerminalStates, WorkflowManager};

pub const DEMAND: &str = "DEMAND_REQUEST";

/// An engine under test plus whatever must outlive it
pub struct Fixture {
    pub manager: WorkflowManager,
    pub database: Option<DatabaseManager>,
    pub dir: Option<TempDir>,
}

pub fn memory() -> Fixture {
    Fixture {
        manager: WorkflowManager::new(
            Arc::new(MemoryWorkflowStore::new()),
            TerminalStates::default(),
        ),
        database: None,
        dir: None,
    }
}

pub fn database_config(dir: &TempDir) -> DatabaseConfig {
    DatabaseConfig {
        url: format!("sqlite://{}/workflows.db", dir.path().display()),
        max_connections: 4,
        auto_migrate: true,
        busy_timeout_seconds: 10,
    }
}

pub async fn sqlite() -> Fixture {
    let dir = tempfile::tempdir().expect("temp dir");
    let database = DatabaseManager::connect(&database_config(&dir))
        .await
        .expect("connect sqlite");
    Fixture {
        manager: WorkflowManager::new(
            Arc::new(database.workflow_store()),
            TerminalStates::default(),
        ),
        database: Some(database),
        dir: Some(dir),
    }
}

/// Both backends, labelled for assertion messages
pub async fn all_backends() -> Vec<(&'static str, Fixture)> {
    vec![("memory", memory()), ("sqlite", sqlite().await)]
}

pub fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        other => panic!("fixture payload must be an object, got {other}"),
    }
}

pub fn demand_payload(requester: &str) -> Payload {
    payload(json!({
        "requester": requester,
        "summary": "Need a new laptop",
        "answers": {"budget": "2000"},
    }))
}
