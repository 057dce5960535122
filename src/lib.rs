// Deskflow Library - persisted workflow orchestration for service-desk features
// This exposes the engine and its ambient plumbing for handlers, jobs and tests

pub mod config;
pub mod database;
pub mod observability;
pub mod shutdown;
pub mod telemetry;
pub mod workflows;

// Re-export key types for easy access
pub use config::DeskflowConfig;
#[cfg(feature = "database")]
pub use database::DatabaseManager;
pub use observability::{OperationTimer, WorkflowMetrics, WorkflowStats};
pub use shutdown::ShutdownCoordinator;
pub use telemetry::{create_workflow_span, generate_correlation_id, init_telemetry, shutdown_telemetry};
pub use workflows::{
    ActiveFlagRefresh, ExpirySweeper, MemoryWorkflowStore, Payload, Session, SessionAdapter, SessionError,
    StartOptions, StoreError, SweepReport, TerminalStates, TransitionRequest, Workflow,
    WorkflowError, WorkflowManager, WorkflowStore,
};
#[cfg(feature = "database")]
pub use workflows::SqliteWorkflowStore;
