use crate::conditions::ConditionEvaluator;
use crate::error::{EngineError, EngineResult};
use crate::reference::Reference;
use crate::schema::ObjectSchema;
use crate::storage::{self, GetFileVersionRequest, PutFileRequest, StorageClient};
use crate::transform::{self, TransformContext};
use crate::types::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

// ─── Definition loading ───────────────────────────────────────

impl ToolDefinition {
    /// Load a definition document from storage.
    pub async fn load_from_fs(
        storage: &Arc<dyn StorageClient>,
        tool_file_location: &str,
        token: &str,
    ) -> EngineResult<ToolDefinition> {
        let response = storage
            .get_file_version(
                token,
                GetFileVersionRequest {
                    file_path: tool_file_location.to_string(),
                    version_id: None,
                },
            )
            .await?;

        if response.status_code != 200 {
            tracing::debug!(
                path = %tool_file_location,
                status = response.status_code,
                "failed to load tool definition"
            );
            return Err(EngineError::MissingDefinition(tool_file_location.to_string()));
        }

        let data = response
            .data()
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::MissingDefinition(tool_file_location.to_string()))?;

        let mut definition: ToolDefinition =
            serde_json::from_str(data).map_err(|err| EngineError::InvalidDefinition {
                path: tool_file_location.to_string(),
                reason: err.to_string(),
            })?;

        definition
            .validate_shape()
            .map_err(|err| EngineError::InvalidDefinition {
                path: tool_file_location.to_string(),
                reason: err.to_string(),
            })?;

        definition.original_file_path = Some(tool_file_location.to_string());
        Ok(definition)
    }

    /// Export this definition to storage so a child handler can reload
    /// it by path.
    pub async fn export_to_fs(
        &self,
        storage: &Arc<dyn StorageClient>,
        file_path: &str,
        token: &str,
    ) -> EngineResult<()> {
        let data = serde_json::to_string(self).map_err(|err| EngineError::InvalidDefinition {
            path: file_path.to_string(),
            reason: err.to_string(),
        })?;

        storage::write_file(
            storage,
            token,
            file_path,
            TOOL_DEFINITION_FILE_TYPE,
            "644",
            None,
            &data,
        )
        .await
    }
}

// ─── Persisted engine state ───────────────────────────────────

/// What `execution.json` holds: the full constructor state, so event
/// handlers can reload the engine instead of sharing in-memory state.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedEngine {
    arguments: Map<String, Value>,
    #[serde(default)]
    argument_schema: Vec<AttributeDef>,
    #[serde(default)]
    instructions: Option<Vec<RawInstruction>>,
    #[serde(default)]
    response_definition: Vec<AttributeDef>,
    #[serde(default)]
    response_reference_map: Option<Map<String, Value>>,
    #[serde(default)]
    system_event_endpoint: Option<String>,
}

// ─── Engine configuration ─────────────────────────────────────

pub struct EngineConfig {
    pub arguments: Map<String, Value>,
    pub argument_schema: Vec<AttributeDef>,
    pub process_id: String,
    pub token: String,
    pub working_directory: String,
    pub instructions: Option<Vec<RawInstruction>>,
    pub response_definition: Vec<AttributeDef>,
    pub response_reference_map: Option<Map<String, Value>>,
    pub system_event_endpoint: Option<String>,
}

impl EngineConfig {
    /// Config for executing `definition` as process `process_id`.
    pub fn from_definition(
        definition: &ToolDefinition,
        arguments: Map<String, Value>,
        process_id: &str,
        token: &str,
        working_directory: &str,
    ) -> Self {
        Self {
            arguments,
            argument_schema: definition.arguments.clone(),
            process_id: process_id.to_string(),
            token: token.to_string(),
            working_directory: working_directory.to_string(),
            instructions: definition.instructions.clone(),
            response_definition: definition.responses.clone(),
            response_reference_map: definition.response_reference_map.clone(),
            system_event_endpoint: definition.system_event_endpoint.clone(),
        }
    }
}

// ─── Execution engine ─────────────────────────────────────────

/// Owns a single composite execution: loads instructions, builds the
/// dependency graph, expands parallel fan-outs, stages arguments, tracks
/// progress, and assembles the final response.
pub struct ExecutionEngine {
    storage: Arc<dyn StorageClient>,
    token: String,
    pub process_id: String,
    pub working_directory: String,
    arguments: Map<String, Value>,
    argument_schema: Vec<AttributeDef>,
    raw_instructions: Option<Vec<RawInstruction>>,
    /// Declaration order is preserved; scheduling ties break on it.
    instructions: Vec<ToolInstruction>,
    response_definition: Vec<AttributeDef>,
    response_reference_map: Option<Map<String, Value>>,
    pub system_event_endpoint: Option<String>,
    dependency_graph: BTreeMap<String, BTreeSet<String>>,
    completed: BTreeSet<String>,
    in_progress: BTreeSet<String>,
    pub reference: Reference,
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("process_id", &self.process_id)
            .field("working_directory", &self.working_directory)
            .field("system_event_endpoint", &self.system_event_endpoint)
            .finish()
    }
}

impl ExecutionEngine {
    pub async fn new(
        storage: Arc<dyn StorageClient>,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        let is_composite = config.system_event_endpoint.is_none();

        if is_composite && config.instructions.is_none() {
            return Err(EngineError::InvalidSchema(
                "instructions must be provided if system_event_endpoint is not set".into(),
            ));
        }

        if is_composite
            && !config.response_definition.is_empty()
            && config.response_reference_map.is_none()
        {
            return Err(EngineError::InvalidSchema(
                "response reference map must be provided if response definition is set for composite tools"
                    .into(),
            ));
        }

        if let Some(reference_map) = &config.response_reference_map {
            validate_response_reference_map(&config.response_definition, reference_map)?;
        }

        let instructions = if is_composite {
            load_instructions(
                &storage,
                config.instructions.as_deref().unwrap_or_default(),
                &config.token,
            )
            .await?
        } else {
            Vec::new()
        };

        let dependency_graph = build_dependency_graph(&instructions)?;
        tracing::debug!(?dependency_graph, "generated dependency graph");

        let mut reference = Reference::new(storage.clone());
        reference.set_arguments(&config.arguments, &config.argument_schema);

        Ok(Self {
            storage,
            token: config.token,
            process_id: config.process_id,
            working_directory: config.working_directory,
            arguments: config.arguments,
            argument_schema: config.argument_schema,
            raw_instructions: config.instructions,
            instructions,
            response_definition: config.response_definition,
            response_reference_map: config.response_reference_map,
            system_event_endpoint: config.system_event_endpoint,
            dependency_graph,
            completed: BTreeSet::new(),
            in_progress: BTreeSet::new(),
            reference,
        })
    }

    /// Reload an engine from its persisted `execution.json`.
    pub async fn load_from_fs(
        storage: Arc<dyn StorageClient>,
        process_id: &str,
        token: &str,
        working_directory: &str,
    ) -> EngineResult<Self> {
        let execution_file_path = storage::join_path(
            &exec_path_for(working_directory, process_id),
            "execution.json",
        );
        tracing::debug!(path = %execution_file_path, "loading engine state");

        let data = storage::fetch_json(&storage, token, &execution_file_path).await?;
        let persisted: PersistedEngine = serde_json::from_value(data).map_err(|err| {
            EngineError::InvalidDefinition {
                path: execution_file_path.clone(),
                reason: err.to_string(),
            }
        })?;

        Self::new(
            storage,
            EngineConfig {
                arguments: persisted.arguments,
                argument_schema: persisted.argument_schema,
                process_id: process_id.to_string(),
                token: token.to_string(),
                working_directory: working_directory.to_string(),
                instructions: persisted.instructions,
                response_definition: persisted.response_definition,
                response_reference_map: persisted.response_reference_map,
                system_event_endpoint: persisted.system_event_endpoint,
            },
        )
        .await
    }

    pub fn is_composite(&self) -> bool {
        self.system_event_endpoint.is_none()
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn completed_ids(&self) -> &BTreeSet<String> {
        &self.completed
    }

    pub fn has_in_progress(&self) -> bool {
        !self.in_progress.is_empty()
    }

    fn find_instruction(&self, execution_id: &str) -> Option<&ToolInstruction> {
        self.instructions
            .iter()
            .find(|instruction| instruction.execution_id == execution_id)
    }

    /// Directory of this (or a child) process under the working
    /// directory tree.
    pub fn get_path(&self, process_id: Option<&str>, working_dir: Option<&str>) -> String {
        exec_path_for(
            working_dir.unwrap_or(&self.working_directory),
            process_id.unwrap_or(&self.process_id),
        )
    }

    /// Create the per-execution directory and persist the engine state
    /// to `execution.json` inside it.
    pub async fn initialize_path(&self) -> EngineResult<()> {
        let root_dir = self.get_path(None, None);

        let created = self
            .storage
            .put_file(
                &self.token,
                PutFileRequest {
                    file_path: root_dir.clone(),
                    file_type: DIRECTORY_FILE_TYPE.to_string(),
                    metadata: None,
                    permissions: Some("755".to_string()),
                },
            )
            .await?;
        if !created.is_success() {
            return Err(EngineError::FileCreationFailure {
                path: root_dir,
                reason: format!(
                    "unexpected response code: {} - {}",
                    created.status_code,
                    created.message()
                ),
            });
        }

        let persisted = PersistedEngine {
            arguments: self.arguments.clone(),
            argument_schema: self.argument_schema.clone(),
            instructions: self.raw_instructions.clone(),
            response_definition: self.response_definition.clone(),
            response_reference_map: self.response_reference_map.clone(),
            system_event_endpoint: self.system_event_endpoint.clone(),
        };
        let data = serde_json::to_string(&persisted)
            .map_err(|err| EngineError::Other(anyhow::anyhow!("state serialization: {err}")))?;

        let mut metadata = Map::new();
        metadata.insert("description".to_string(), json!("Execution details"));
        metadata.insert("process_id".to_string(), json!(self.process_id));

        storage::write_file(
            &self.storage,
            &self.token,
            &storage::join_path(&root_dir, "execution.json"),
            PLAIN_FILE_TYPE,
            "644",
            Some(metadata),
            &data,
        )
        .await
    }

    /// Resolve the list a parallel instruction iterates over.
    async fn resolve_parallel_items(&self, parallel: &ParallelSpec) -> EngineResult<Vec<Value>> {
        let resolved = self
            .reference
            .resolve_value(&parallel.iterate_over, Some(&self.token))
            .await?;
        match resolved {
            Value::Array(items) => Ok(items),
            other => Err(EngineError::InvalidSchema(format!(
                "parallel_execution iterate_over must resolve to a list, got {other}"
            ))),
        }
    }

    /// One scheduling step. Returns `(executable_ids, skipped_ids)`:
    /// instructions whose dependencies are complete, split into those
    /// ready to run (parallel groups pre-expanded into sibling ids) and
    /// those whose conditions evaluated false.
    ///
    /// Skipped instructions complete in place with type-appropriate null
    /// responses, and a parallel group over an empty list completes with
    /// an empty aggregate; either can make downstream nodes ready
    /// within the same call, so the scan runs to a fixpoint.
    pub async fn get_available_executions(&mut self) -> EngineResult<(Vec<String>, Vec<String>)> {
        let mut executable: Vec<String> = Vec::new();
        let mut skipped: Vec<String> = Vec::new();

        loop {
            let mut newly_skipped: Vec<String> = Vec::new();
            let mut empty_groups: Vec<String> = Vec::new();
            let mut newly_executable: Vec<String> = Vec::new();

            for instruction in &self.instructions {
                let execution_id = instruction.execution_id.clone();
                if self.completed.contains(&execution_id)
                    || self.in_progress.contains(&execution_id)
                    || executable.iter().any(|id: &String| {
                        id == &execution_id
                            || split_parallel_id(id).map(|(base, _)| base)
                                == Some(execution_id.as_str())
                    })
                {
                    continue;
                }

                let deps_complete = self
                    .dependency_graph
                    .get(&execution_id)
                    .map(|deps| deps.iter().all(|dep| self.completed.contains(dep)))
                    .unwrap_or(true);
                if !deps_complete {
                    continue;
                }

                // Conditions may reference prior responses, so they are
                // only evaluated once the dependencies are complete.
                if !instruction.conditions.is_empty() {
                    let evaluator = ConditionEvaluator::new(&self.reference, &self.token);
                    if !evaluator.evaluate(&instruction.conditions).await {
                        newly_skipped.push(execution_id);
                        continue;
                    }
                }

                match &instruction.parallel_execution {
                    Some(parallel) => {
                        let items = self.resolve_parallel_items(parallel).await?;
                        if items.is_empty() {
                            empty_groups.push(execution_id);
                        } else {
                            newly_executable.extend(
                                (0..items.len()).map(|i| parallel_sibling_id(&execution_id, i)),
                            );
                        }
                    }
                    None => newly_executable.push(execution_id),
                }
            }

            executable.extend(newly_executable);

            if newly_skipped.is_empty() && empty_groups.is_empty() {
                break;
            }

            for execution_id in newly_skipped {
                // The skipped node satisfies downstream dependencies
                // with the null value of each declared response.
                let null_responses: Vec<(String, AttributeType)> = self
                    .find_instruction(&execution_id)
                    .map(|instruction| {
                        instruction
                            .definition
                            .responses
                            .iter()
                            .map(|response_def| {
                                (response_def.name.clone(), response_def.type_name)
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                for (name, type_name) in null_responses {
                    self.reference.add_response(
                        &execution_id,
                        &name,
                        type_name.null_value(),
                        type_name,
                    );
                }
                self.completed.insert(execution_id.clone());
                skipped.push(execution_id);
            }

            for base in empty_groups {
                self.add_parallel_response(&base, Vec::new());
                self.completed.insert(base);
            }
        }

        Ok((executable, skipped))
    }

    /// Materialize the instruction behind an execution id. Synthetic
    /// sibling ids get the base instruction with the indexed element
    /// bound under the parallel spec's item argument.
    pub async fn instruction(&self, execution_id: &str) -> EngineResult<ToolInstruction> {
        if let Some(found) = self.find_instruction(execution_id) {
            return Ok(found.clone());
        }

        let Some((base, index)) = split_parallel_id(execution_id) else {
            return Err(EngineError::InvalidSchema(format!(
                "unknown execution id: {execution_id}"
            )));
        };

        let base_instruction = self.find_instruction(base).ok_or_else(|| {
            EngineError::InvalidSchema(format!("unknown execution id: {base}"))
        })?;
        let parallel = base_instruction.parallel_execution.as_ref().ok_or_else(|| {
            EngineError::InvalidSchema(format!(
                "execution id {base} is not a parallel instruction"
            ))
        })?;

        let items = self.resolve_parallel_items(parallel).await?;
        let item = items.get(index).cloned().ok_or_else(|| {
            EngineError::InvalidReference(format!(
                "parallel index {index} out of range for {base}"
            ))
        })?;

        let mut sibling = base_instruction.clone();
        sibling.execution_id = execution_id.to_string();
        sibling.parallel_execution = None;
        sibling
            .provided_arguments
            .insert(parallel.item_argument.clone(), item);
        Ok(sibling)
    }

    /// Stage a child execution: render its arguments (reference
    /// resolution, then transforms), validate them against the child's
    /// schema, and write `arguments.aio` into the child's directory.
    ///
    /// Returns the arguments path, or `None` when the tool declares no
    /// arguments.
    pub async fn prepare_for_execution(
        &self,
        instruction: &ToolInstruction,
        process_id: Option<&str>,
        working_directory: Option<&str>,
    ) -> EngineResult<Option<String>> {
        let definition = &instruction.definition;
        if definition.arguments.is_empty() {
            tracing::debug!(execution_id = %instruction.execution_id, "tool takes no arguments");
            return Ok(None);
        }

        let schema = ObjectSchema::new(&definition.arguments)?.with_file_as_string();

        let mut rendered = Map::new();
        for (arg_name, arg_value) in &instruction.provided_arguments {
            tracing::debug!(argument = %arg_name, "rendering argument");
            let value = self
                .reference
                .resolve_value(arg_value, Some(&self.token))
                .await?;
            rendered.insert(arg_name.clone(), value);
        }

        if let Some(spec) = &instruction.transform_arguments {
            rendered = self.apply_transform(spec, rendered).await?;
        }

        let validated = schema.validate(&rendered)?;

        let target_dir = self.get_path(process_id, working_directory);
        storage::ensure_directory(&self.storage, &self.token, &target_dir).await?;

        let args_file_path = storage::join_path(&target_dir, &format!("arguments{AIO_EXT}"));

        let mut metadata = Map::new();
        metadata.insert("description".to_string(), json!("Tool arguments"));
        metadata.insert("execution_id".to_string(), json!(instruction.execution_id));
        metadata.insert("process_id".to_string(), json!(self.process_id));

        storage::write_file(
            &self.storage,
            &self.token,
            &args_file_path,
            TOOL_IO_FILE_TYPE,
            "644",
            Some(metadata),
            &serde_json::to_string(&Value::Object(validated))
                .map_err(|err| EngineError::Other(anyhow::anyhow!("arguments serialization: {err}")))?,
        )
        .await?;

        Ok(Some(args_file_path))
    }

    /// Resolve a transform block's variables and evaluate its rules on
    /// top of the rendered body. Transform outputs overwrite same-named
    /// keys.
    async fn apply_transform(
        &self,
        spec: &TransformSpec,
        body: Map<String, Value>,
    ) -> EngineResult<Map<String, Value>> {
        let mut variables = Map::new();
        for (name, value) in &spec.variables {
            variables.insert(
                name.clone(),
                self.reference.resolve_value(value, Some(&self.token)).await?,
            );
        }
        for (name, value) in &body {
            variables.entry(name.clone()).or_insert_with(|| value.clone());
        }

        let ctx = TransformContext::new(variables, &self.token, self.storage.clone());
        let outputs = transform::map_object(&ctx, &spec.transforms).await?;

        let mut result = body;
        for (name, value) in outputs {
            result.insert(name, value);
        }
        Ok(result)
    }

    pub fn mark_in_progress(&mut self, execution_id: &str) {
        self.in_progress.insert(execution_id.to_string());
    }

    /// Record a completed execution, loading its response file into the
    /// reference store under the declared response types. Idempotent for
    /// an already-completed id.
    pub async fn mark_completed(
        &mut self,
        execution_id: &str,
        response_path: Option<&str>,
    ) -> EngineResult<()> {
        if self.completed.contains(execution_id) {
            tracing::debug!(execution_id, "execution already completed");
            return Ok(());
        }

        tracing::debug!(execution_id, "marking execution as completed");
        self.completed.insert(execution_id.to_string());
        self.in_progress.remove(execution_id);

        let Some(response_path) = response_path else {
            return Ok(());
        };

        let instruction = match self.find_instruction(execution_id) {
            Some(instruction) => instruction.clone(),
            // Aggregated parallel groups inject their response directly.
            None => return Ok(()),
        };

        if instruction.definition.responses.is_empty() {
            return Ok(());
        }

        let response_file = if response_path.ends_with(AIO_EXT) {
            response_path.to_string()
        } else {
            storage::join_path(response_path, &format!("response{AIO_EXT}"))
        };

        let body = storage::fetch_json(&self.storage, &self.token, &response_file).await?;
        let Value::Object(body) = body else {
            return Err(EngineError::InvalidSchema(format!(
                "response body at {response_file} is not an object"
            )));
        };

        let body = match &instruction.transform_responses {
            Some(spec) => self.apply_transform(spec, body).await?,
            None => body,
        };

        for response_def in &instruction.definition.responses {
            let value = body.get(&response_def.name);
            if response_def.required && value.is_none() {
                return Err(EngineError::InvalidSchema(format!(
                    "missing required response key: {}",
                    response_def.name
                )));
            }
            self.reference.add_response(
                execution_id,
                &response_def.name,
                value.cloned().unwrap_or(Value::Null),
                response_def.type_name,
            );
        }

        Ok(())
    }

    /// Inject the ordered aggregate of a parallel group as
    /// `<base>.response` (type list).
    pub fn add_parallel_response(&mut self, base_execution_id: &str, responses: Vec<Value>) {
        self.reference.add_response(
            base_execution_id,
            "response",
            Value::Array(responses),
            AttributeType::List,
        );
    }

    /// Assemble and write the composite response per the response
    /// reference map. Returns the written path, or `None` when this
    /// engine has no response definition (no file is written).
    pub async fn close(&self) -> EngineResult<Option<String>> {
        if !self.is_composite() {
            tracing::debug!("direct tool execution, tool is responsible for writing its response");
            return Ok(None);
        }

        if self.response_definition.is_empty() {
            tracing::debug!("no defined response for this execution");
            return Ok(None);
        }

        let reference_map = self.response_reference_map.as_ref().ok_or_else(|| {
            EngineError::InvalidSchema("response reference map missing at close".into())
        })?;

        let mut resolved_mapping = Map::new();
        for (response_key, reference_value) in reference_map {
            let response_value = match reference_value {
                Value::String(s) if s.starts_with("REF:") => {
                    self.reference.resolve(s, Some(&self.token)).await?
                }
                other => other.clone(),
            };
            resolved_mapping.insert(response_key.clone(), response_value);
        }

        let schema = ObjectSchema::new(&self.response_definition)?.with_file_as_string();
        let validated = schema.validate(&resolved_mapping)?;

        let response_path = storage::join_path(
            &self.get_path(None, None),
            &format!("response{AIO_EXT}"),
        );

        let mut metadata = Map::new();
        metadata.insert("description".to_string(), json!("Tool response"));
        metadata.insert("process_id".to_string(), json!(self.process_id));

        storage::write_file(
            &self.storage,
            &self.token,
            &response_path,
            TOOL_IO_FILE_TYPE,
            "444",
            Some(metadata),
            &serde_json::to_string(&Value::Object(validated))
                .map_err(|err| EngineError::Other(anyhow::anyhow!("response serialization: {err}")))?,
        )
        .await?;

        Ok(Some(response_path))
    }
}

// ─── Free helpers ─────────────────────────────────────────────

/// `<working_directory>/agent_exec-<process_id>`, unless the working
/// directory already points into the process directory.
pub fn exec_path_for(working_directory: &str, process_id: &str) -> String {
    let dir_name = format!("{EXEC_DIR_PREFIX}{process_id}");
    if working_directory.ends_with(&dir_name) {
        working_directory.to_string()
    } else {
        storage::join_path(working_directory, &dir_name)
    }
}

fn validate_response_reference_map(
    response_definition: &[AttributeDef],
    reference_map: &Map<String, Value>,
) -> EngineResult<()> {
    for response_def in response_definition {
        if response_def.required && !reference_map.contains_key(&response_def.name) {
            return Err(EngineError::InvalidSchema(format!(
                "missing required response map key: {}",
                response_def.name
            )));
        }
    }
    Ok(())
}

async fn load_instructions(
    storage: &Arc<dyn StorageClient>,
    raw_instructions: &[RawInstruction],
    token: &str,
) -> EngineResult<Vec<ToolInstruction>> {
    let mut loaded: Vec<ToolInstruction> = Vec::with_capacity(raw_instructions.len());

    for raw in raw_instructions {
        if !is_valid_execution_id(&raw.execution_id) {
            return Err(EngineError::InvalidSchema(format!(
                "invalid execution id: {}",
                raw.execution_id
            )));
        }
        if loaded
            .iter()
            .any(|instruction| instruction.execution_id == raw.execution_id)
        {
            return Err(EngineError::InvalidSchema(format!(
                "duplicate execution id found: {}",
                raw.execution_id
            )));
        }

        let definition = match (&raw.tool_definition, &raw.tool_definition_path) {
            (Some(inline), _) => {
                inline.validate_shape()?;
                inline.clone()
            }
            (None, Some(path)) => ToolDefinition::load_from_fs(storage, path, token).await?,
            (None, None) => {
                return Err(EngineError::InvalidSchema(format!(
                    "instruction {} must provide tool_definition or tool_definition_path",
                    raw.execution_id
                )))
            }
        };

        loaded.push(ToolInstruction {
            execution_id: raw.execution_id.clone(),
            definition,
            provided_arguments: raw.arguments.clone(),
            conditions: raw.conditions.clone(),
            parallel_execution: raw.parallel_execution.clone(),
            transform_arguments: raw.transform_arguments.clone(),
            transform_responses: raw.transform_responses.clone(),
            dependencies: raw.dependencies.clone(),
        });
    }

    Ok(loaded)
}

fn build_dependency_graph(
    instructions: &[ToolInstruction],
) -> EngineResult<BTreeMap<String, BTreeSet<String>>> {
    let ids: BTreeSet<&str> = instructions
        .iter()
        .map(|instruction| instruction.execution_id.as_str())
        .collect();

    let mut graph = BTreeMap::new();
    for instruction in instructions {
        let deps = instruction.dependency_ids();
        for dep in &deps {
            if !ids.contains(dep.as_str()) {
                return Err(EngineError::InvalidSchema(format!(
                    "instruction '{}' depends on unknown execution id '{dep}'",
                    instruction.execution_id
                )));
            }
        }
        graph.insert(instruction.execution_id.clone(), deps);
    }
    Ok(graph)
}
