// Workflow orchestration engine: persisted state machines that survive
// restarts and are advanced by independent asynchronous events.

pub mod manager;
pub mod memory;
pub mod session;
#[cfg(feature = "database")]
pub mod sqlite;
pub mod store;
pub mod sweep;
pub mod terminal;
pub mod types;

pub use manager::{WorkflowError, WorkflowManager};
pub use memory::MemoryWorkflowStore;
pub use session::{ActiveSession, Session, SessionAdapter, SessionError};
#[cfg(feature = "database")]
pub use sqlite::SqliteWorkflowStore;
pub use store::{ActiveFlagRefresh, StoreError, WorkflowStore};
pub use sweep::{ExpirySweeper, SweepReport};
pub use terminal::TerminalStates;
pub use types::{
    merge_payload, payload_from, Payload, StartOptions, TransitionRequest, Workflow,
    STATE_CANCELLED, STATE_COMPLETED, STATE_EXPIRED, STATE_FAILED, SYSTEM_ACTOR,
};
