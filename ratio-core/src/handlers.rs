use crate::bus::{Event, EventBus};
use crate::engine::{EngineConfig, ExecutionEngine};
use crate::error::{EngineError, EngineResult};
use crate::events::*;
use crate::jwt::InternalJwtManager;
use crate::process_table::ProcessTable;
use crate::schema::ObjectSchema;
use crate::storage::{
    self, GetFileVersionRequest, PutFileRequest, PutFileVersionRequest, StorageClient,
    ValidateFileAccessRequest,
};
use crate::token::{create_execution_token, token_check_and_refresh};
use crate::types::*;
use crate::validator::{RefValidator, ValidationFinding};
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

// ─── Submission request ───────────────────────────────────────

/// A user-facing execute request: an inline definition or a path to
/// one, plus arguments and an optional working directory.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecuteToolRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_definition: Option<ToolDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_definition_path: Option<String>,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
}

// ─── Coordinator ──────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Working directory used when a request names none and the caller
    /// has no home directory.
    pub default_working_directory: Option<String>,
    /// Delay before a parallel-join reconciliation event fires.
    pub reconciliation_delay: Duration,
    /// Delay on synthetic no-op response events, so the parent's
    /// still-running handler finishes first.
    pub noop_response_delay: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_working_directory: None,
            reconciliation_delay: Duration::from_secs(15),
            noop_response_delay: Duration::from_secs(10),
        }
    }
}

struct CloseOut<'a> {
    failure_reason: Option<String>,
    response_path: Option<&'a str>,
    notify_parent: bool,
    skip_failure_notification: bool,
}

impl<'a> CloseOut<'a> {
    fn completed(response_path: Option<&'a str>, notify_parent: bool) -> Self {
        Self {
            failure_reason: None,
            response_path,
            notify_parent,
            skip_failure_notification: false,
        }
    }

    fn failed(failure_reason: impl Into<String>) -> Self {
        Self {
            failure_reason: Some(failure_reason.into()),
            response_path: None,
            notify_parent: false,
            skip_failure_notification: false,
        }
    }

    fn failed_quietly(failure_reason: impl Into<String>) -> Self {
        Self {
            skip_failure_notification: true,
            ..Self::failed(failure_reason)
        }
    }
}

/// The lifecycle coordinator: event-driven handlers that create child
/// processes, publish tool invocations, mark completions, and join
/// parallel groups. Stateless between events; all state lives in the
/// storage collaborator, the process table, and the arbitration files.
pub struct Coordinator {
    pub(crate) storage: Arc<dyn StorageClient>,
    pub(crate) processes: Arc<dyn ProcessTable>,
    pub(crate) bus: Arc<dyn EventBus>,
    pub(crate) jwt: Arc<InternalJwtManager>,
    pub(crate) config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(
        storage: Arc<dyn StorageClient>,
        processes: Arc<dyn ProcessTable>,
        bus: Arc<dyn EventBus>,
        jwt: Arc<InternalJwtManager>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            storage,
            processes,
            bus,
            jwt,
            config,
        }
    }

    // ─── Submission ───────────────────────────────────────────

    /// Execute a tool on behalf of a caller: mint the execution token,
    /// verify access, create the root process, validate arguments, and
    /// schedule the first wave. Returns the root process id.
    pub async fn execute_tool(
        &self,
        request: ExecuteToolRequest,
        caller_token: &str,
    ) -> EngineResult<String> {
        let token = create_execution_token(&self.jwt, caller_token)?;
        let claims = self.jwt.verify_token(&token)?;

        let working_directory = request
            .working_directory
            .clone()
            .or_else(|| self.config.default_working_directory.clone())
            .or_else(|| claims.home.clone().filter(|home| !home.is_empty()))
            .ok_or_else(|| {
                EngineError::InvalidSchema("must provide valid working directory".into())
            })?;

        self.check_access(
            &token,
            &working_directory,
            &["read", "write"],
            "working directory",
        )
        .await?;

        let definition = match (&request.tool_definition, &request.tool_definition_path) {
            (_, Some(path)) => {
                self.check_access(&token, path, &["execute"], "tool definition path")
                    .await?;
                ToolDefinition::load_from_fs(&self.storage, path, &token).await?
            }
            (Some(inline), None) => {
                inline.validate_shape()?;
                inline.clone()
            }
            (None, None) => {
                return Err(EngineError::InvalidSchema(
                    "must provide tool_definition or tool_definition_path".into(),
                ))
            }
        };

        let proc = Process::new(claims.entity(), &working_directory);
        self.processes.put(&proc).await?;

        // Validate the submitted arguments before anything runs; a bad
        // submission deletes the never-started process.
        let validated_arguments = match ObjectSchema::new(&definition.arguments)
            .and_then(|schema| schema.with_file_as_string().validate(&request.arguments))
        {
            Ok(arguments) => arguments,
            Err(err) => {
                self.processes.delete(&proc.process_id).await?;
                return Err(err);
            }
        };

        let engine_result = ExecutionEngine::new(
            self.storage.clone(),
            EngineConfig::from_definition(
                &definition,
                validated_arguments.clone(),
                &proc.process_id,
                &token,
                &working_directory,
            ),
        )
        .await;

        let mut engine = match engine_result {
            Ok(engine) => engine,
            Err(err) => {
                self.processes.delete(&proc.process_id).await?;
                return Err(err);
            }
        };

        engine.initialize_path().await?;

        if !validated_arguments.is_empty() {
            let parent_instruction = ToolInstruction {
                execution_id: proc.process_id.clone(),
                definition: definition.clone(),
                provided_arguments: validated_arguments,
                conditions: Vec::new(),
                parallel_execution: None,
                transform_arguments: None,
                transform_responses: None,
                dependencies: Vec::new(),
            };

            match engine
                .prepare_for_execution(&parent_instruction, None, None)
                .await
            {
                Ok(Some(arguments_path)) => {
                    let mut updated = proc.clone();
                    updated.arguments_path = Some(arguments_path);
                    self.processes.put(&updated).await?;
                }
                Ok(None) => {}
                Err(err) => {
                    self.processes.delete(&proc.process_id).await?;
                    return Err(err);
                }
            }
        }

        if engine.is_composite() {
            let (execution_ids, skipped) = engine.get_available_executions().await?;

            if !skipped.is_empty() {
                tracing::debug!(?skipped, "skipped execution ids");
                self.execute_no_ops(&mut engine, &skipped, &proc, claims.entity(), &token)
                    .await?;
            }

            if execution_ids.is_empty() && skipped.is_empty() {
                // Empty composite: nothing to run, complete immediately.
                let response_path = engine.close().await?;
                self.close_out_process(
                    &proc,
                    &token,
                    CloseOut::completed(response_path.as_deref(), false),
                )
                .await?;
                return Ok(proc.process_id);
            }

            self.execute_children(&mut engine, &execution_ids, &proc, claims.entity(), &token)
                .await?;
        } else {
            let instruction = ToolInstruction {
                execution_id: proc.process_id.clone(),
                definition: definition.clone(),
                provided_arguments: request.arguments,
                conditions: Vec::new(),
                parallel_execution: None,
                transform_arguments: None,
                transform_responses: None,
                dependencies: Vec::new(),
            };

            let arguments_path = engine.prepare_for_execution(&instruction, None, None).await?;
            let mut updated = proc.clone();
            updated.arguments_path = arguments_path.clone();
            self.processes.put(&updated).await?;

            let endpoint = definition
                .system_event_endpoint
                .clone()
                .unwrap_or_default();
            self.bus
                .publish(
                    Event::new(
                        endpoint,
                        &SystemExecuteToolRequest {
                            arguments_path,
                            argument_schema: definition.arguments.clone(),
                            parent_process_id: proc.parent_process_id.clone(),
                            process_id: proc.process_id.clone(),
                            response_schema: definition.responses.clone(),
                            token: token.clone(),
                            working_directory: engine.get_path(None, None),
                        },
                    )?,
                    None,
                )
                .await?;
        }

        Ok(proc.process_id)
    }

    /// Statically validate a tool definition without executing it:
    /// `REF:` type consistency, unknown ids, and dependency cycles.
    /// Returns findings; an empty list means the definition passed.
    pub async fn validate_tool_definition(
        &self,
        tool_definition: Option<ToolDefinition>,
        tool_definition_path: Option<&str>,
        caller_token: &str,
    ) -> EngineResult<Vec<ValidationFinding>> {
        self.jwt.verify_token(caller_token)?;

        let definition = match (tool_definition, tool_definition_path) {
            (_, Some(path)) => {
                self.check_access(caller_token, path, &["read"], "tool definition path")
                    .await?;
                ToolDefinition::load_from_fs(&self.storage, path, caller_token).await?
            }
            (Some(inline), None) => {
                inline.validate_shape()?;
                inline
            }
            (None, None) => {
                return Err(EngineError::InvalidSchema(
                    "must provide tool_definition or tool_definition_path".into(),
                ))
            }
        };

        Ok(RefValidator::new(&definition).validate())
    }

    async fn check_access(
        &self,
        token: &str,
        file_path: &str,
        permissions: &[&str],
        what: &str,
    ) -> EngineResult<()> {
        let response = self
            .storage
            .validate_file_access(
                token,
                ValidateFileAccessRequest {
                    file_path: file_path.to_string(),
                    requested_permission_names: permissions
                        .iter()
                        .map(|p| p.to_string())
                        .collect(),
                },
            )
            .await?;

        if response.status_code == 404 {
            return Err(EngineError::InvalidSchema(format!("{what} not found")));
        }

        let entity_has_access = response
            .body
            .get("entity_has_access")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !entity_has_access {
            return Err(EngineError::AccessDenied(format!(
                "unauthorized to access {what} {file_path}"
            )));
        }

        Ok(())
    }

    // ─── Event: execute composite ─────────────────────────────

    /// Begin a composite execution for an already-created process.
    pub async fn handle_execute_composite(
        &self,
        body: ExecuteToolInternalRequest,
    ) -> EngineResult<()> {
        let token = token_check_and_refresh(&self.jwt, &body.token)?;
        let claims = self.jwt.verify_token(&token)?;

        let proc = self
            .processes
            .get_by_id(&body.process_id)
            .await?
            .ok_or_else(|| {
                EngineError::Other(anyhow::anyhow!("process {} not found", body.process_id))
            })?;

        if proc.execution_status.is_terminal() {
            return Err(EngineError::Other(anyhow::anyhow!(
                "process {} is already closed with status {}",
                proc.process_id,
                proc.execution_status.as_str()
            )));
        }

        if let Err(err) = self
            .check_access(
                &token,
                &body.working_directory,
                &["read", "write"],
                "working directory",
            )
            .await
        {
            self.close_out_process(&proc, &token, CloseOut::failed(err.to_string()))
                .await?;
            return Ok(());
        }

        let definition = match ToolDefinition::load_from_fs(
            &self.storage,
            &body.tool_definition_path,
            &token,
        )
        .await
        {
            Ok(definition) => definition,
            Err(err) => {
                self.close_out_process(
                    &proc,
                    &token,
                    CloseOut::failed(format!("error loading tool definition: {err}")),
                )
                .await?;
                return Ok(());
            }
        };

        if !proc.is_root() {
            let parent = self
                .processes
                .get_by_id(&proc.parent_process_id)
                .await?
                .ok_or_else(|| {
                    EngineError::Other(anyhow::anyhow!(
                        "parent process {} not found",
                        proc.parent_process_id
                    ))
                })?;
            if parent.execution_status.is_terminal() {
                self.close_out_process(
                    &proc,
                    &token,
                    CloseOut::failed_quietly("parent process is already closed, cannot execute tool"),
                )
                .await?;
                return Ok(());
            }
        }

        let arguments = match &body.arguments_path {
            Some(arguments_path) => {
                let loaded = storage::fetch_json(&self.storage, &token, arguments_path).await?;
                loaded
                    .as_object()
                    .cloned()
                    .ok_or_else(|| {
                        EngineError::InvalidSchema(format!(
                            "arguments at {arguments_path} are not an object"
                        ))
                    })?
            }
            None => Map::new(),
        };

        let engine_result = ExecutionEngine::new(
            self.storage.clone(),
            EngineConfig::from_definition(
                &definition,
                arguments.clone(),
                &proc.process_id,
                &token,
                &body.working_directory,
            ),
        )
        .await;

        let mut engine = match engine_result {
            Ok(engine) => engine,
            Err(err) => {
                self.close_out_process(
                    &proc,
                    &token,
                    CloseOut::failed(format!("error initializing execution engine: {err}")),
                )
                .await?;
                return Ok(());
            }
        };

        engine.initialize_path().await?;

        if engine.is_composite() {
            let (execution_ids, skipped) = engine.get_available_executions().await?;

            if !skipped.is_empty() {
                self.execute_no_ops(&mut engine, &skipped, &proc, claims.entity(), &token)
                    .await?;
            }

            if execution_ids.is_empty() && skipped.is_empty() {
                let response_path = engine.close().await?;
                self.close_out_process(
                    &proc,
                    &token,
                    CloseOut::completed(response_path.as_deref(), !proc.is_root()),
                )
                .await?;
                return Ok(());
            }

            self.execute_children(&mut engine, &execution_ids, &proc, claims.entity(), &token)
                .await?;
        } else {
            let instruction = ToolInstruction {
                execution_id: proc.process_id.clone(),
                definition: definition.clone(),
                provided_arguments: arguments,
                conditions: Vec::new(),
                parallel_execution: None,
                transform_arguments: None,
                transform_responses: None,
                dependencies: Vec::new(),
            };

            let arguments_path = match engine.prepare_for_execution(&instruction, None, None).await
            {
                Ok(path) => path,
                Err(err) => {
                    self.close_out_process(
                        &proc,
                        &token,
                        CloseOut::failed(format!("error preparing for execution: {err}")),
                    )
                    .await?;
                    return Ok(());
                }
            };

            let mut updated = proc.clone();
            updated.arguments_path = arguments_path.clone();
            self.processes.put(&updated).await?;

            let endpoint = definition.system_event_endpoint.clone().unwrap_or_default();
            self.bus
                .publish(
                    Event::new(
                        endpoint,
                        &SystemExecuteToolRequest {
                            arguments_path,
                            argument_schema: definition.arguments.clone(),
                            parent_process_id: proc.parent_process_id.clone(),
                            process_id: proc.process_id.clone(),
                            response_schema: definition.responses.clone(),
                            token: token.clone(),
                            working_directory: engine.get_path(None, None),
                        },
                    )?,
                    None,
                )
                .await?;
        }

        Ok(())
    }

    // ─── Event: tool response ─────────────────────────────────

    /// Drive a parent's scheduler after one of its executions responded.
    pub async fn handle_tool_response(
        &self,
        body: SystemExecuteToolResponse,
    ) -> EngineResult<()> {
        let token = token_check_and_refresh(&self.jwt, &body.token)?;

        let proc = self
            .processes
            .get(&body.parent_process_id, &body.process_id)
            .await?
            .ok_or_else(|| {
                EngineError::Other(anyhow::anyhow!("process {} not found", body.process_id))
            })?;

        if let Some(failure) = &body.failure {
            tracing::debug!(process_id = %proc.process_id, failure, "process failed");
            self.close_out_process(
                &proc,
                &token,
                CloseOut {
                    failure_reason: Some(failure.clone()),
                    response_path: body.response.as_deref(),
                    notify_parent: false,
                    skip_failure_notification: false,
                },
            )
            .await?;
            return Ok(());
        }

        let (parent_proc, self_is_parent) = if proc.is_root() {
            (proc.clone(), true)
        } else {
            let parent = self
                .processes
                .get_by_id(&proc.parent_process_id)
                .await?
                .ok_or_else(|| {
                    EngineError::Other(anyhow::anyhow!(
                        "parent process {} not found",
                        proc.parent_process_id
                    ))
                })?;
            (parent, false)
        };

        if parent_proc.execution_status.is_terminal() {
            tracing::debug!(
                parent_process_id = %parent_proc.process_id,
                status = parent_proc.execution_status.as_str(),
                "parent already closed; late response discarded"
            );
            return Ok(());
        }

        let mut engine = ExecutionEngine::load_from_fs(
            self.storage.clone(),
            &parent_proc.process_id,
            &token,
            &parent_proc.working_directory,
        )
        .await?;

        if !engine.is_composite() {
            self.close_out_process(
                &proc,
                &token,
                CloseOut::completed(body.response.as_deref(), true),
            )
            .await?;
            return Ok(());
        }

        if !self_is_parent {
            self.close_out_process(
                &proc,
                &token,
                CloseOut::completed(body.response.as_deref(), false),
            )
            .await?;
        }

        let all_children = self.processes.get_by_parent(&parent_proc.process_id).await?;
        if all_children.is_empty() {
            return Err(EngineError::Other(anyhow::anyhow!(
                "no children found for composite parent process {}",
                parent_proc.process_id
            )));
        }

        // Rebuild the engine's progress sets from the process table.
        let mut parallel_groups: BTreeSet<String> = BTreeSet::new();
        for child in &all_children {
            let Some(execution_id) = &child.execution_id else {
                return Err(EngineError::Other(anyhow::anyhow!(
                    "child process {} missing an execution id",
                    child.process_id
                )));
            };
            let parallel = split_parallel_id(execution_id);

            match child.execution_status {
                ProcessStatus::Running => match parallel {
                    Some((base, _)) => engine.mark_in_progress(base),
                    None => engine.mark_in_progress(execution_id),
                },
                ProcessStatus::Completed | ProcessStatus::Skipped => {
                    if let Some((base, _)) = parallel {
                        if child.execution_status == ProcessStatus::Completed {
                            let (all_done, remaining) = self
                                .all_parallel_siblings_complete(base, &parent_proc)
                                .await?;
                            if all_done {
                                parallel_groups.insert(base.to_string());
                            } else if remaining == 1 {
                                // Defense against a lost final event:
                                // re-check the group after a delay.
                                self.bus
                                    .publish(
                                        Event::new(
                                            PARALLEL_COMPLETION_RECONCILIATION,
                                            &ParallelCompletionReconciliationRequest {
                                                parent_process_id: parent_proc.process_id.clone(),
                                                original_execution_id: base.to_string(),
                                                token: token.clone(),
                                            },
                                        )?,
                                        Some(self.config.reconciliation_delay),
                                    )
                                    .await?;
                                tracing::info!(
                                    group = %base,
                                    "sent delayed reconciliation event for parallel group"
                                );
                            }
                        }
                    } else if let Err(err) = engine
                        .mark_completed(execution_id, child.response_path.as_deref())
                        .await
                    {
                        self.close_out_process(
                            &parent_proc,
                            &token,
                            CloseOut::failed(format!(
                                "error marking execution {execution_id} as completed: {err}"
                            )),
                        )
                        .await?;
                        return Ok(());
                    }
                }
                ProcessStatus::Failed => {
                    let reason = child
                        .status_message
                        .clone()
                        .unwrap_or_else(|| format!("execution {execution_id} failed"));
                    self.close_out_process(&parent_proc, &token, CloseOut::failed(reason))
                        .await?;
                    return Ok(());
                }
                ProcessStatus::Terminated | ProcessStatus::TimedOut => {
                    // Reconciliation already raised the failure event.
                }
            }
        }

        for base in &parallel_groups {
            let is_winner = self
                .try_complete_parallel_group(base, &parent_proc, &engine, &token)
                .await?;

            if !is_winner {
                tracing::debug!(group = %base, "another handler is coordinating this parallel group");
                return Ok(());
            }

            let responses = self
                .aggregate_parallel_responses(&all_children, base, &token)
                .await?;
            engine.add_parallel_response(base, responses);
            engine.mark_completed(base, None).await?;
        }

        let (execution_ids, skipped_ids) = engine.get_available_executions().await?;
        let claims = self.jwt.verify_token(&token)?;

        if !skipped_ids.is_empty() {
            tracing::debug!(?skipped_ids, "skipped execution ids");
            self.execute_no_ops(&mut engine, &skipped_ids, &parent_proc, claims.entity(), &token)
                .await?;
        }

        if execution_ids.is_empty() && !engine.has_in_progress() {
            tracing::debug!(
                parent_process_id = %parent_proc.process_id,
                "no more executions for composite process"
            );

            let response_path = match engine.close().await {
                Ok(path) => path,
                Err(err) => {
                    self.close_out_process(
                        &parent_proc,
                        &token,
                        CloseOut::failed(format!("error closing execution engine: {err}")),
                    )
                    .await?;
                    return Ok(());
                }
            };

            self.close_out_process(
                &parent_proc,
                &token,
                CloseOut::completed(response_path.as_deref(), !self_is_parent),
            )
            .await?;
            return Ok(());
        }

        self.execute_children(&mut engine, &execution_ids, &parent_proc, claims.entity(), &token)
            .await?;

        Ok(())
    }

    // ─── Event: parallel completion reconciliation ────────────

    /// Re-check a parallel group after the delayed defense timer: if the
    /// group quietly finished, re-drive the parent with a synthetic
    /// response event.
    pub async fn handle_parallel_reconciliation(
        &self,
        body: ParallelCompletionReconciliationRequest,
    ) -> EngineResult<()> {
        let Some(parent) = self.processes.get_by_id(&body.parent_process_id).await? else {
            tracing::warn!(
                parent_process_id = %body.parent_process_id,
                "parent process not found during parallel reconciliation"
            );
            return Ok(());
        };

        if parent.execution_status.is_terminal() {
            return Ok(());
        }

        let all_children = self.processes.get_by_parent(&parent.process_id).await?;
        let siblings: Vec<&Process> = all_children
            .iter()
            .filter(|child| {
                child
                    .execution_id
                    .as_deref()
                    .and_then(split_parallel_id)
                    .map(|(base, _)| base == body.original_execution_id)
                    .unwrap_or(false)
            })
            .collect();

        if siblings.is_empty() {
            tracing::warn!(
                group = %body.original_execution_id,
                "no parallel children found during reconciliation"
            );
            return Ok(());
        }

        if !siblings.iter().all(|s| s.execution_status.is_terminal()) {
            tracing::debug!(group = %body.original_execution_id, "parallel group still running");
            return Ok(());
        }

        tracing::warn!(
            group = %body.original_execution_id,
            parent_process_id = %parent.process_id,
            "found stuck parallel group, triggering completion"
        );

        let mut noted = parent.clone();
        crate::reconcile::append_reconciliation(
            &mut noted,
            &format!("stuck parallel group {} reconciled", body.original_execution_id),
        );
        self.processes.put(&noted).await?;

        let failed = siblings
            .iter()
            .find(|s| s.execution_status == ProcessStatus::Failed);
        let completed = siblings
            .iter()
            .find(|s| s.execution_status == ProcessStatus::Completed);

        let event_body = if let Some(failed) = failed {
            // A failed sibling fails the whole group.
            SystemExecuteToolResponse {
                failure: Some(failed.status_message.clone().unwrap_or_else(|| {
                    format!(
                        "parallel child {} failed",
                        failed.execution_id.as_deref().unwrap_or_default()
                    )
                })),
                parent_process_id: parent.parent_process_id.clone(),
                process_id: parent.process_id.clone(),
                response: None,
                status: "failure".to_string(),
                token: body.token.clone(),
            }
        } else {
            // Re-drive the parent through one of its terminal siblings.
            let trigger = completed.unwrap_or(&siblings[0]);
            SystemExecuteToolResponse {
                failure: None,
                parent_process_id: parent.process_id.clone(),
                process_id: trigger.process_id.clone(),
                response: trigger.response_path.clone(),
                status: "success".to_string(),
                token: body.token.clone(),
            }
        };

        self.bus
            .publish(Event::new(TOOL_RESPONSE, &event_body)?, None)
            .await?;

        Ok(())
    }

    // ─── Shared helpers ───────────────────────────────────────

    /// Close out a process row. Re-reads the row and short-circuits if
    /// it is already terminal, keeping status transitions monotone and
    /// terminal writes idempotent.
    async fn close_out_process(
        &self,
        process: &Process,
        token: &str,
        close: CloseOut<'_>,
    ) -> EngineResult<()> {
        let Some(mut current) = self.processes.get_by_id(&process.process_id).await? else {
            return Ok(());
        };

        if current.execution_status.is_terminal() {
            tracing::debug!(
                process_id = %current.process_id,
                status = current.execution_status.as_str(),
                "process already closed"
            );
            return Ok(());
        }

        current.execution_status = if close.failure_reason.is_some() {
            ProcessStatus::Failed
        } else {
            ProcessStatus::Completed
        };
        current.ended_on = Some(Utc::now());
        current.status_message = close.failure_reason.clone();
        if let Some(response_path) = close.response_path {
            current.response_path = Some(response_path.to_string());
        }

        self.processes.put(&current).await?;

        if current.is_root() {
            return Ok(());
        }

        if close.notify_parent && close.failure_reason.is_none() {
            self.bus
                .publish(
                    Event::new(
                        TOOL_RESPONSE,
                        &SystemExecuteToolResponse {
                            failure: None,
                            parent_process_id: current.parent_process_id.clone(),
                            process_id: current.process_id.clone(),
                            response: current.response_path.clone(),
                            status: "success".to_string(),
                            token: token.to_string(),
                        },
                    )?,
                    None,
                )
                .await?;
        }

        if let Some(failure) = &close.failure_reason {
            if !close.skip_failure_notification {
                // The failure event describes the parent itself: its
                // handler closes the parent FAILED, which cascades one
                // more failure event up the tree.
                if let Some(parent) = self.processes.get_by_id(&current.parent_process_id).await? {
                    self.bus
                        .publish(
                            Event::new(
                                TOOL_RESPONSE,
                                &SystemExecuteToolResponse {
                                    failure: Some(failure.clone()),
                                    parent_process_id: parent.parent_process_id.clone(),
                                    process_id: parent.process_id.clone(),
                                    response: None,
                                    status: "failure".to_string(),
                                    token: token.to_string(),
                                },
                            )?,
                            None,
                        )
                        .await?;
                }
            }
        }

        Ok(())
    }

    /// Create child processes for the ready executions, stage their
    /// arguments, and publish an invocation event per child.
    pub(crate) async fn execute_children(
        &self,
        engine: &mut ExecutionEngine,
        execution_ids: &[String],
        parent_process: &Process,
        owner: &str,
        token: &str,
    ) -> EngineResult<()> {
        // Children live inside the parent's execution directory.
        let base_working_dir = engine.get_path(None, None);

        for execution_id in execution_ids {
            tracing::debug!(execution_id, "creating child process");

            let instruction = engine.instruction(execution_id).await?;
            let child = parent_process.create_child(
                execution_id,
                owner,
                &base_working_dir,
                ProcessStatus::Running,
            );
            self.processes.put(&child).await?;

            let arguments_path = match engine
                .prepare_for_execution(
                    &instruction,
                    Some(&child.process_id),
                    Some(&base_working_dir),
                )
                .await
            {
                Ok(path) => path,
                Err(
                    err @ (EngineError::InvalidSchema(_)
                    | EngineError::InvalidObjectSchema { .. }
                    | EngineError::InvalidReference(_)
                    | EngineError::Mapping(_)),
                ) => {
                    let reason = format!("error preparing for execution: {err}");
                    // The parent is closed right after; a second failure
                    // event would be a duplicate.
                    self.close_out_process(&child, token, CloseOut::failed_quietly(reason.clone()))
                        .await?;
                    self.close_out_process(parent_process, token, CloseOut::failed(reason))
                        .await?;
                    return Ok(());
                }
                Err(other) => return Err(other),
            };

            let mut child = child;
            child.arguments_path = arguments_path.clone();
            self.processes.put(&child).await?;

            let event = if instruction.definition.is_composite() {
                let definition_path = match &instruction.definition.original_file_path {
                    Some(path) => path.clone(),
                    None => {
                        // Inline composite definitions are exported so
                        // the child handler can reload them by path.
                        let export_path = storage::join_path(
                            &engine.get_path(Some(&child.process_id), Some(&base_working_dir)),
                            "tool_definition.tool",
                        );
                        tracing::debug!(path = %export_path, "exporting tool definition");
                        instruction
                            .definition
                            .export_to_fs(&self.storage, &export_path, token)
                            .await?;
                        export_path
                    }
                };

                Event::new(
                    EXECUTE_COMPOSITE_TOOL,
                    &ExecuteToolInternalRequest {
                        arguments_path,
                        tool_definition_path: definition_path,
                        parent_process_id: parent_process.process_id.clone(),
                        process_id: child.process_id.clone(),
                        token: token.to_string(),
                        working_directory: base_working_dir.clone(),
                    },
                )?
            } else {
                let endpoint = instruction
                    .definition
                    .system_event_endpoint
                    .clone()
                    .unwrap_or_default();
                Event::new(
                    endpoint,
                    &SystemExecuteToolRequest {
                        arguments_path,
                        argument_schema: instruction.definition.arguments.clone(),
                        parent_process_id: parent_process.process_id.clone(),
                        process_id: child.process_id.clone(),
                        response_schema: instruction.definition.responses.clone(),
                        token: token.to_string(),
                        working_directory: base_working_dir.clone(),
                    },
                )?
            };

            self.bus.publish(event, None).await?;
            engine.mark_in_progress(execution_id);
            tracing::debug!(execution_id, "invocation published");
        }

        Ok(())
    }

    /// Whether every sibling of a parallel group is complete, plus how
    /// many are still outstanding.
    pub(crate) async fn all_parallel_siblings_complete(
        &self,
        base_execution_id: &str,
        parent_proc: &Process,
    ) -> EngineResult<(bool, usize)> {
        let all_children = self.processes.get_by_parent(&parent_proc.process_id).await?;

        let mut remaining = 0usize;
        for child in &all_children {
            let is_sibling = child
                .execution_id
                .as_deref()
                .and_then(split_parallel_id)
                .map(|(base, _)| base == base_execution_id)
                .unwrap_or(false);
            if is_sibling
                && !matches!(
                    child.execution_status,
                    ProcessStatus::Completed | ProcessStatus::Skipped
                )
            {
                remaining += 1;
            }
        }

        Ok((remaining == 0, remaining))
    }

    /// The parallel-join arbitration protocol: re-verify the group is
    /// fully terminal, then write a fresh nonce to the group's lock
    /// file, sleep a short random interval, read it back, and win only
    /// if our nonce survived (last write wins on the content store).
    async fn try_complete_parallel_group(
        &self,
        base_execution_id: &str,
        parent_proc: &Process,
        engine: &ExecutionEngine,
        token: &str,
    ) -> EngineResult<bool> {
        let (all_complete, _) = self
            .all_parallel_siblings_complete(base_execution_id, parent_proc)
            .await?;

        if !all_complete {
            tracing::debug!(
                group = %base_execution_id,
                "not all parallel siblings are complete, cannot complete yet"
            );
            return Ok(false);
        }

        let lock_file_path = storage::join_path(
            &engine.get_path(None, None),
            &format!("parallel_completion_{base_execution_id}.lock"),
        );

        let nonce = Uuid::now_v7().to_string();

        self.storage
            .put_file(
                token,
                PutFileRequest {
                    file_path: lock_file_path.clone(),
                    file_type: PLAIN_FILE_TYPE.to_string(),
                    metadata: None,
                    permissions: Some("644".to_string()),
                },
            )
            .await?;
        self.storage
            .put_file_version(
                token,
                PutFileVersionRequest {
                    file_path: lock_file_path.clone(),
                    data: nonce.clone(),
                    metadata: None,
                    source_files: None,
                    origin: Some("internal".to_string()),
                },
            )
            .await?;

        // Timing variability so racing writers interleave.
        let wait_ms: u64 = {
            let mut rng = rand::thread_rng();
            rng.gen_range(100..800)
        };
        tokio::time::sleep(Duration::from_millis(wait_ms)).await;

        let read_back = self
            .storage
            .get_file_version(
                token,
                GetFileVersionRequest {
                    file_path: lock_file_path,
                    version_id: None,
                },
            )
            .await?;

        if read_back.status_code != 200 {
            return Ok(false);
        }

        let winner = read_back
            .data()
            .and_then(Value::as_str)
            .map(|data| data == nonce)
            .unwrap_or(false);
        tracing::debug!(group = %base_execution_id, winner, "parallel arbitration result");
        Ok(winner)
    }

    /// Load each completed sibling's response in index order and return
    /// the ordered aggregate.
    async fn aggregate_parallel_responses(
        &self,
        all_children: &[Process],
        base_execution_id: &str,
        token: &str,
    ) -> EngineResult<Vec<Value>> {
        let mut siblings: Vec<(usize, &Process)> = all_children
            .iter()
            .filter_map(|child| {
                let (base, index) = split_parallel_id(child.execution_id.as_deref()?)?;
                (base == base_execution_id
                    && child.execution_status == ProcessStatus::Completed
                    && child.response_path.is_some())
                .then_some((index, child))
            })
            .collect();
        siblings.sort_by_key(|(index, _)| *index);

        let mut responses = Vec::with_capacity(siblings.len());
        for (_, child) in siblings {
            let response_path = child.response_path.as_deref().unwrap_or_default();
            match storage::fetch_json(&self.storage, token, response_path).await {
                Ok(body) => responses.push(body),
                Err(err) => {
                    tracing::warn!(
                        path = %response_path,
                        error = %err,
                        "missing parallel sibling response"
                    );
                    responses.push(Value::Null);
                }
            }
        }

        tracing::debug!(
            group = %base_execution_id,
            count = responses.len(),
            "aggregated parallel responses"
        );
        Ok(responses)
    }
}
