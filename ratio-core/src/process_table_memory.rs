use crate::process_table::ProcessTable;
use crate::types::{Process, ProcessStatus};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// In-memory implementation of [`ProcessTable`] for POC/testing.
pub struct MemoryProcessTable {
    inner: RwLock<HashMap<String, Process>>,
}

impl MemoryProcessTable {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessTable for MemoryProcessTable {
    async fn put(&self, process: &Process) -> Result<()> {
        let mut w = self.inner.write().await;
        w.insert(process.process_id.clone(), process.clone());
        Ok(())
    }

    async fn get_by_id(&self, process_id: &str) -> Result<Option<Process>> {
        let r = self.inner.read().await;
        Ok(r.get(process_id).cloned())
    }

    async fn get(&self, parent_process_id: &str, process_id: &str) -> Result<Option<Process>> {
        let r = self.inner.read().await;
        Ok(r.get(process_id)
            .filter(|p| p.parent_process_id == parent_process_id)
            .cloned())
    }

    async fn get_by_parent(&self, parent_process_id: &str) -> Result<Vec<Process>> {
        let r = self.inner.read().await;
        let mut children: Vec<Process> = r
            .values()
            .filter(|p| p.parent_process_id == parent_process_id)
            .cloned()
            .collect();
        children.sort_by(|a, b| a.started_on.cmp(&b.started_on));
        Ok(children)
    }

    async fn delete(&self, process_id: &str) -> Result<()> {
        let mut w = self.inner.write().await;
        w.remove(process_id);
        Ok(())
    }

    async fn list_by_status(&self, status: ProcessStatus) -> Result<Vec<Process>> {
        let r = self.inner.read().await;
        Ok(r.values()
            .filter(|p| p.execution_status == status)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip_and_parent_lookup() {
        let table = MemoryProcessTable::new();
        let root = Process::new("ada", "/work");
        table.put(&root).await.unwrap();

        let child_a = root.create_child("step_a", "ada", "/work", ProcessStatus::Running);
        let child_b = root.create_child("step_b", "ada", "/work", ProcessStatus::Running);
        table.put(&child_a).await.unwrap();
        table.put(&child_b).await.unwrap();

        let loaded = table.get_by_id(&root.process_id).await.unwrap().unwrap();
        assert!(loaded.is_root());

        let children = table.get_by_parent(&root.process_id).await.unwrap();
        assert_eq!(children.len(), 2);

        let scoped = table
            .get(&root.process_id, &child_a.process_id)
            .await
            .unwrap();
        assert!(scoped.is_some());
        let wrong_parent = table.get("someone-else", &child_a.process_id).await.unwrap();
        assert!(wrong_parent.is_none());
    }

    #[tokio::test]
    async fn test_status_scan() {
        let table = MemoryProcessTable::new();
        let mut process = Process::new("ada", "/work");
        table.put(&process).await.unwrap();

        assert_eq!(
            table
                .list_by_status(ProcessStatus::Running)
                .await
                .unwrap()
                .len(),
            1
        );

        process.execution_status = ProcessStatus::Completed;
        table.put(&process).await.unwrap();
        assert!(table
            .list_by_status(ProcessStatus::Running)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_delete() {
        let table = MemoryProcessTable::new();
        let process = Process::new("ada", "/work");
        table.put(&process).await.unwrap();
        table.delete(&process.process_id).await.unwrap();
        assert!(table.get_by_id(&process.process_id).await.unwrap().is_none());
    }
}
