use crate::types::{Process, ProcessStatus};
use anyhow::Result;
use async_trait::async_trait;

/// Persistence for process rows. Supports lookup by id and by parent id;
/// the reconciliation sweep additionally scans by status.
///
/// Writers follow the monotone-transition discipline: re-read the row and
/// short-circuit when it is already terminal before writing a terminal
/// state. The table itself is a plain last-write store.
#[async_trait]
pub trait ProcessTable: Send + Sync {
    /// Insert or update a process row.
    async fn put(&self, process: &Process) -> Result<()>;

    async fn get_by_id(&self, process_id: &str) -> Result<Option<Process>>;

    /// Lookup scoped to a parent; used when handling response events.
    async fn get(&self, parent_process_id: &str, process_id: &str) -> Result<Option<Process>>;

    async fn get_by_parent(&self, parent_process_id: &str) -> Result<Vec<Process>>;

    async fn delete(&self, process_id: &str) -> Result<()>;

    /// All rows currently in the given status (reconciliation sweep).
    async fn list_by_status(&self, status: ProcessStatus) -> Result<Vec<Process>>;
}
