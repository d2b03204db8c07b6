use crate::process_table::ProcessTable;
use crate::types::{Process, ProcessStatus};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

/// PostgreSQL-backed implementation of [`ProcessTable`].
pub struct PostgresProcessTable {
    pool: sqlx::PgPool,
}

impl PostgresProcessTable {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// Run embedded migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run ratio migrations")?;
        Ok(())
    }
}

fn status_to_str(status: ProcessStatus) -> &'static str {
    status.as_str()
}

fn status_from_str(s: &str) -> Result<ProcessStatus> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| anyhow!("unknown process status: {s}"))
}

fn row_to_process(row: &sqlx::postgres::PgRow) -> Result<Process> {
    Ok(Process {
        process_id: row.try_get("process_id")?,
        parent_process_id: row.try_get("parent_process_id")?,
        process_owner: row.try_get("process_owner")?,
        working_directory: row.try_get("working_directory")?,
        execution_id: row.try_get("execution_id")?,
        execution_status: status_from_str(row.try_get::<String, _>("execution_status")?.as_str())?,
        arguments_path: row.try_get("arguments_path")?,
        response_path: row.try_get("response_path")?,
        status_message: row.try_get("status_message")?,
        started_on: row.try_get::<DateTime<Utc>, _>("started_on")?,
        ended_on: row.try_get::<Option<DateTime<Utc>>, _>("ended_on")?,
    })
}

#[async_trait]
impl ProcessTable for PostgresProcessTable {
    async fn put(&self, process: &Process) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO processes (
                process_id, parent_process_id, process_owner, working_directory,
                execution_id, execution_status, arguments_path, response_path,
                status_message, started_on, ended_on
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (process_id) DO UPDATE SET
                execution_status = EXCLUDED.execution_status,
                arguments_path = EXCLUDED.arguments_path,
                response_path = EXCLUDED.response_path,
                status_message = EXCLUDED.status_message,
                ended_on = EXCLUDED.ended_on
            "#,
        )
        .bind(&process.process_id)
        .bind(&process.parent_process_id)
        .bind(&process.process_owner)
        .bind(&process.working_directory)
        .bind(&process.execution_id)
        .bind(status_to_str(process.execution_status))
        .bind(&process.arguments_path)
        .bind(&process.response_path)
        .bind(&process.status_message)
        .bind(process.started_on)
        .bind(process.ended_on)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_by_id(&self, process_id: &str) -> Result<Option<Process>> {
        let row = sqlx::query("SELECT * FROM processes WHERE process_id = $1")
            .bind(process_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_process).transpose()
    }

    async fn get(&self, parent_process_id: &str, process_id: &str) -> Result<Option<Process>> {
        let row = sqlx::query(
            "SELECT * FROM processes WHERE process_id = $1 AND parent_process_id = $2",
        )
        .bind(process_id)
        .bind(parent_process_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_process).transpose()
    }

    async fn get_by_parent(&self, parent_process_id: &str) -> Result<Vec<Process>> {
        let rows = sqlx::query(
            "SELECT * FROM processes WHERE parent_process_id = $1 ORDER BY started_on",
        )
        .bind(parent_process_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_process).collect()
    }

    async fn delete(&self, process_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM processes WHERE process_id = $1")
            .bind(process_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_by_status(&self, status: ProcessStatus) -> Result<Vec<Process>> {
        let rows = sqlx::query("SELECT * FROM processes WHERE execution_status = $1")
            .bind(status_to_str(status))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_process).collect()
    }
}
