use crate::bus::Event;
use crate::engine::ExecutionEngine;
use crate::error::EngineResult;
use crate::events::{SystemExecuteToolResponse, TOOL_RESPONSE};
use crate::handlers::Coordinator;
use crate::storage;
use crate::types::*;
use chrono::Utc;
use serde_json::{json, Map, Value};

impl Coordinator {
    /// Run skipped instructions as no-ops: create a child process in
    /// SKIPPED state, stage its arguments normally (the rendered body is
    /// still validated), synthesize a response file whose declared
    /// fields are type-appropriate nulls, and publish a delayed
    /// synthetic response event so the parent reschedules.
    pub(crate) async fn execute_no_ops(
        &self,
        engine: &mut ExecutionEngine,
        skipped_ids: &[String],
        parent_process: &Process,
        owner: &str,
        token: &str,
    ) -> EngineResult<()> {
        let base_working_dir = engine.get_path(None, None);

        for execution_id in skipped_ids {
            tracing::info!(execution_id, "executing no-op, conditions not met");

            let child = parent_process.create_child(
                execution_id,
                owner,
                &base_working_dir,
                ProcessStatus::Skipped,
            );
            self.processes.put(&child).await?;

            let result = self
                .run_single_no_op(engine, execution_id, &child, parent_process, token)
                .await;

            if let Err(err) = result {
                tracing::error!(execution_id, error = %err, "no-op execution failed");

                self.bus
                    .publish(
                        Event::new(
                            TOOL_RESPONSE,
                            &SystemExecuteToolResponse {
                                failure: Some(format!("no-op preparation failed: {err}")),
                                parent_process_id: parent_process.process_id.clone(),
                                process_id: child.process_id.clone(),
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

        Ok(())
    }

    async fn run_single_no_op(
        &self,
        engine: &mut ExecutionEngine,
        execution_id: &str,
        child: &Process,
        parent_process: &Process,
        token: &str,
    ) -> EngineResult<()> {
        let base_working_dir = engine.get_path(None, None);
        let instruction = engine.instruction(execution_id).await?;

        engine
            .prepare_for_execution(&instruction, Some(&child.process_id), Some(&base_working_dir))
            .await?;

        let response_path = self
            .create_noop_response_file(engine, &instruction, &child.process_id, token)
            .await?;

        let mut updated = child.clone();
        updated.response_path = response_path.clone();
        updated.ended_on = Some(Utc::now());
        self.processes.put(&updated).await?;

        engine
            .mark_completed(execution_id, response_path.as_deref())
            .await?;

        self.bus
            .publish(
                Event::new(
                    TOOL_RESPONSE,
                    &SystemExecuteToolResponse {
                        failure: None,
                        parent_process_id: parent_process.process_id.clone(),
                        process_id: child.process_id.clone(),
                        response: response_path,
                        status: "success".to_string(),
                        token: token.to_string(),
                    },
                )?,
                // Give the parent's current handler time to finish, so
                // the synthetic event does not race it.
                Some(self.config.noop_response_delay),
            )
            .await?;

        tracing::info!(execution_id, "no-op execution completed, response event sent");
        Ok(())
    }

    /// Write the synthetic response for a skipped execution. Returns
    /// `None` (and writes nothing) when the tool declares no responses.
    async fn create_noop_response_file(
        &self,
        engine: &ExecutionEngine,
        instruction: &ToolInstruction,
        process_id: &str,
        token: &str,
    ) -> EngineResult<Option<String>> {
        if instruction.definition.responses.is_empty() {
            tracing::debug!(
                execution_id = %instruction.execution_id,
                "no responses expected, skipping response file creation"
            );
            return Ok(None);
        }

        let mut null_responses = Map::new();
        for response_def in &instruction.definition.responses {
            null_responses.insert(
                response_def.name.clone(),
                response_def.type_name.null_value(),
            );
        }

        let process_dir = engine.get_path(Some(process_id), Some(&engine.get_path(None, None)));
        let response_path = storage::join_path(&process_dir, &format!("response{AIO_EXT}"));

        let mut metadata = Map::new();
        metadata.insert(
            "description".to_string(),
            json!("No-op response (conditions not met)"),
        );
        metadata.insert("execution_id".to_string(), json!(instruction.execution_id));
        metadata.insert("process_id".to_string(), json!(process_id));
        metadata.insert("execution_type".to_string(), json!("noop"));
        metadata.insert("skip_reason".to_string(), json!("conditions_not_met"));

        storage::write_file(
            &self.storage,
            token,
            &response_path,
            TOOL_IO_FILE_TYPE,
            "444",
            Some(metadata),
            &serde_json::to_string(&Value::Object(null_responses)).map_err(|err| {
                crate::error::EngineError::Other(anyhow::anyhow!(
                    "no-op response serialization: {err}"
                ))
            })?,
        )
        .await?;

        tracing::debug!(path = %response_path, "created no-op response file");
        Ok(Some(response_path))
    }
}
