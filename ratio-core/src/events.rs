use crate::types::AttributeDef;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ─── Event types consumed/emitted by the core ─────────────────

/// Start a composite execution for an already-created process.
pub const EXECUTE_COMPOSITE_TOOL: &str = "ratio::execute_composite_tool";

/// A tool (leaf or composite) finished; drives the parent's scheduler.
pub const TOOL_RESPONSE: &str = "ratio::tool_response";

/// Delayed defense against lost events near a parallel group's join.
pub const PARALLEL_COMPLETION_RECONCILIATION: &str = "ratio::parallel_completion_reconciliation";

/// General system events that may match subscriptions.
pub const GENERAL_SYSTEM_EVENT: &str = "ratio::general_system_event";

/// File create/update/delete notifications from the content store.
pub const FILE_UPDATE_EVENT: &str = "ratio::file_update";

// ─── Event bodies ─────────────────────────────────────────────

/// Body of [`EXECUTE_COMPOSITE_TOOL`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecuteToolInternalRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments_path: Option<String>,
    pub tool_definition_path: String,
    pub parent_process_id: String,
    pub process_id: String,
    pub token: String,
    pub working_directory: String,
}

/// Body published to a leaf tool's `system_event_endpoint`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SystemExecuteToolRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments_path: Option<String>,
    #[serde(default)]
    pub argument_schema: Vec<AttributeDef>,
    pub parent_process_id: String,
    pub process_id: String,
    #[serde(default)]
    pub response_schema: Vec<AttributeDef>,
    pub token: String,
    pub working_directory: String,
}

/// Body of [`TOOL_RESPONSE`]: what every tool emits when done.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SystemExecuteToolResponse {
    /// Failure message; presence means the execution failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub parent_process_id: String,
    pub process_id: String,
    /// Path to the response file, when one was written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    pub status: String,
    pub token: String,
}

/// Body of [`PARALLEL_COMPLETION_RECONCILIATION`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParallelCompletionReconciliationRequest {
    pub parent_process_id: String,
    /// The logical group id, without the `[index]` suffix.
    pub original_execution_id: String,
    pub token: String,
}

/// Body of [`GENERAL_SYSTEM_EVENT`], matched against subscriptions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GeneralSystemEvent {
    pub system_event_type: String,
    #[serde(default)]
    pub event_details: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_system: Option<String>,
}

/// Body of [`FILE_UPDATE_EVENT`], matched against filesystem
/// subscriptions on the file itself or its parent directory.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileUpdateEvent {
    pub file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    /// `created`, `updated`, or `deleted`.
    pub file_event_type: String,
    #[serde(default)]
    pub details: Map<String, Value>,
}
