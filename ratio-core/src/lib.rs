//! Core of the Ratio tool-orchestration platform: the execution engine
//! for composite tools, the event-driven lifecycle coordinator, the
//! `REF:` reference language, and the execution token service.
//!
//! External collaborators (content storage, the event bus, the JWT
//! signer) are traits; in-memory implementations back the worker binary
//! and the test suites.

pub mod bus;
pub mod bus_local;
pub mod conditions;
pub mod engine;
pub mod error;
pub mod events;
pub mod handlers;
pub mod jwt;
mod noop;
pub mod process_table;
pub mod process_table_memory;
#[cfg(feature = "postgres")]
pub mod process_table_postgres;
pub mod reconcile;
pub mod reference;
pub mod schema;
pub mod storage;
pub mod storage_memory;
pub mod subscriptions;
pub mod token;
pub mod transform;
pub mod types;
pub mod validator;

pub use engine::{EngineConfig, ExecutionEngine};
pub use error::{EngineError, EngineResult, MappingError};
pub use handlers::{Coordinator, CoordinatorConfig, ExecuteToolRequest};
pub use reconcile::{Reconciler, ReconcilerConfig};
pub use types::{Process, ProcessStatus, ToolDefinition};
