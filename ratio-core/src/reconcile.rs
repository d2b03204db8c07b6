use crate::bus::{Event, EventBus};
use crate::events::{SystemExecuteToolResponse, TOOL_RESPONSE};
use crate::jwt::{InternalJwtManager, TokenRequest};
use crate::process_table::ProcessTable;
use crate::types::{Process, ProcessStatus};
use anyhow::Result;
use chrono::{Duration, Utc};
use serde_json::Map;
use std::sync::Arc;

/// Append an audit line to a process's status message:
/// `reconciled: <reason> at <iso-timestamp>`.
pub(crate) fn append_reconciliation(process: &mut Process, reason: &str) {
    let note = format!("reconciled: {reason} at {}", Utc::now().to_rfc3339());
    process.status_message = match process.status_message.take() {
        Some(existing) if !existing.is_empty() => Some(format!("{existing} | {note}")),
        _ => Some(note),
    };
}

#[derive(Clone, Debug)]
pub struct ReconcilerConfig {
    /// RUNNING processes older than this are timed out.
    pub global_process_timeout_minutes: i64,
    /// Expiry on the system tokens minted for notifications.
    pub system_token_expiry_minutes: i64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            global_process_timeout_minutes: 15,
            system_token_expiry_minutes: 5,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ReconcileSummary {
    pub timed_out: Vec<String>,
    pub stuck_parents: Vec<String>,
}

/// The periodic sweep: times out long-running processes and unsticks
/// parents whose children all finished without the parent hearing about
/// it. Time-driven, not event-driven.
pub struct Reconciler {
    processes: Arc<dyn ProcessTable>,
    bus: Arc<dyn EventBus>,
    jwt: Arc<InternalJwtManager>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        processes: Arc<dyn ProcessTable>,
        bus: Arc<dyn EventBus>,
        jwt: Arc<InternalJwtManager>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            processes,
            bus,
            jwt,
            config,
        }
    }

    /// Run both tasks once.
    pub async fn run_sweep(&self) -> Result<ReconcileSummary> {
        tracing::info!("starting process reconciliation");

        let stuck_parents = self.handle_stuck_parent_processes().await?;
        let timed_out = self.handle_timed_out_processes().await?;

        tracing::info!(
            timed_out = timed_out.len(),
            stuck_parents = stuck_parents.len(),
            "process reconciliation completed"
        );

        Ok(ReconcileSummary {
            timed_out,
            stuck_parents,
        })
    }

    fn system_token(&self, entity: &str) -> Result<String> {
        let (token, _) = self.jwt.create_token_with_expiry(
            TokenRequest {
                entity: entity.to_string(),
                authorized_groups: vec!["system".to_string()],
                primary_group: "system".to_string(),
                home: None,
                is_admin: false,
                custom_claims: Map::new(),
            },
            self.config.system_token_expiry_minutes,
        )?;
        Ok(token)
    }

    /// Find RUNNING processes older than the global timeout, mark them
    /// TIMED_OUT, and notify their parents with a failure event.
    pub async fn handle_timed_out_processes(&self) -> Result<Vec<String>> {
        let timeout_minutes = self.config.global_process_timeout_minutes;
        let cutoff = Utc::now() - Duration::minutes(timeout_minutes);
        tracing::info!(cutoff = %cutoff.to_rfc3339(), "checking for timed out processes");

        let running = self.processes.list_by_status(ProcessStatus::Running).await?;
        let mut reconciled = Vec::new();

        for mut process in running {
            if process.started_on >= cutoff {
                continue;
            }

            tracing::warn!(
                process_id = %process.process_id,
                "process has timed out (running for more than {timeout_minutes} minutes)"
            );

            process.execution_status = ProcessStatus::TimedOut;
            process.ended_on = Some(Utc::now());
            append_reconciliation(
                &mut process,
                &format!("timed out after {timeout_minutes} minutes"),
            );
            self.processes.put(&process).await?;

            if !process.is_root() {
                if let Some(parent) = self.processes.get_by_id(&process.parent_process_id).await? {
                    let token = self.system_token(&parent.process_owner)?;
                    self.bus
                        .publish(
                            Event::new(
                                TOOL_RESPONSE,
                                &SystemExecuteToolResponse {
                                    failure: Some(format!(
                                        "process timed out after {timeout_minutes} minutes"
                                    )),
                                    parent_process_id: parent.parent_process_id.clone(),
                                    process_id: parent.process_id.clone(),
                                    response: None,
                                    status: "TIMED_OUT".to_string(),
                                    token,
                                },
                            )?,
                            None,
                        )
                        .await?;
                    tracing::info!(
                        parent_process_id = %parent.process_id,
                        "sent timeout notification to parent process"
                    );
                }
            }

            reconciled.push(process.process_id.clone());
        }

        tracing::info!(count = reconciled.len(), "handled timed out processes");
        Ok(reconciled)
    }

    /// Find RUNNING parents whose children are all terminal and emit a
    /// synthetic completion event (through one of the terminal children)
    /// to resume their handler.
    pub async fn handle_stuck_parent_processes(&self) -> Result<Vec<String>> {
        tracing::info!("checking for stuck parent processes");

        let running = self.processes.list_by_status(ProcessStatus::Running).await?;
        let mut reconciled = Vec::new();

        for mut parent in running {
            let children = self.processes.get_by_parent(&parent.process_id).await?;
            if children.is_empty() {
                // Not a parent process.
                continue;
            }

            let all_children_done = children
                .iter()
                .all(|child| child.execution_status.is_terminal());
            if !all_children_done {
                continue;
            }

            tracing::warn!(
                process_id = %parent.process_id,
                "found stuck parent process, all children complete but parent still running"
            );

            append_reconciliation(&mut parent, "stuck parent process unstuck");
            self.processes.put(&parent).await?;

            let token = self.system_token(&parent.process_owner)?;

            // Prefer a completed child as the trigger, so its response
            // path rides along.
            let trigger = children
                .iter()
                .find(|child| child.execution_status == ProcessStatus::Completed)
                .unwrap_or(&children[0]);

            self.bus
                .publish(
                    Event::new(
                        TOOL_RESPONSE,
                        &SystemExecuteToolResponse {
                            failure: None,
                            parent_process_id: parent.process_id.clone(),
                            process_id: trigger.process_id.clone(),
                            response: trigger.response_path.clone(),
                            status: "success".to_string(),
                            token,
                        },
                    )?,
                    None,
                )
                .await?;

            tracing::info!(
                process_id = %parent.process_id,
                "triggered completion event for stuck parent process"
            );
            reconciled.push(parent.process_id.clone());
        }

        tracing::info!(count = reconciled.len(), "handled stuck parent processes");
        Ok(reconciled)
    }
}
