//! An LLM-driven agent that works a live web page toward a goal: scan the
//! interactive elements, ask an oracle for the next action, perform it with
//! synthetic input, and persist enough state to survive a page reload.

pub mod agent;
pub mod brain;
pub mod chrome;
pub mod config;
pub mod error;
pub mod hands;
pub mod page;
pub mod scanner;
pub mod scorer;
pub mod stabilize;
pub mod state;
pub mod store;
pub mod types;

pub use agent::{Agent, AgentEvent, AgentHandle, LoopExit};
pub use brain::{DecisionContext, OpenAiOracle, Oracle, OracleDecision};
pub use config::{AgentConfig, ConfigLoader};
pub use error::{BreakReason, ExecutorError, OracleError, PageError};
pub use page::Page;
pub use state::{TaskState, TaskStatus};
pub use store::{JsonFileStore, KeyValueStore, MemoryStore, SnapshotStore};
pub use types::{ActionDecision, ActionKind, ActionOutcome, ActionResult, InteractiveElement};
