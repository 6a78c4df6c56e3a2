//! 内存存储（默认后端，也用于测试）

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{CallStackStore, ConversationStore, SessionKey, StoreError, TaskResultStore};
use crate::agent::AgentState;
use crate::workflow::TaskRecord;

/// 进程内存储：重启即丢失
#[derive(Debug, Default)]
pub struct MemoryStore {
    agents: RwLock<HashMap<SessionKey, BTreeMap<String, AgentState>>>,
    results: RwLock<HashMap<SessionKey, Vec<TaskRecord>>>,
    stacks: RwLock<HashMap<SessionKey, Vec<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn load(&self, key: &SessionKey, agent: &str) -> Result<Option<AgentState>, StoreError> {
        Ok(self
            .agents
            .read()
            .await
            .get(key)
            .and_then(|m| m.get(agent))
            .cloned())
    }

    async fn save(&self, key: &SessionKey, state: &AgentState) -> Result<(), StoreError> {
        self.agents
            .write()
            .await
            .entry(key.clone())
            .or_default()
            .insert(state.name.clone(), state.clone());
        Ok(())
    }

    async fn load_all(&self, key: &SessionKey) -> Result<Vec<AgentState>, StoreError> {
        Ok(self
            .agents
            .read()
            .await
            .get(key)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl TaskResultStore for MemoryStore {
    async fn load(&self, key: &SessionKey) -> Result<Vec<TaskRecord>, StoreError> {
        Ok(self.results.read().await.get(key).cloned().unwrap_or_default())
    }

    async fn upsert(&self, key: &SessionKey, record: &TaskRecord) -> Result<(), StoreError> {
        let mut results = self.results.write().await;
        let rows = results.entry(key.clone()).or_default();
        match rows.iter_mut().find(|r| r.task_id == record.task_id) {
            Some(row) => *row = record.clone(),
            None => rows.push(record.clone()),
        }
        Ok(())
    }
}

#[async_trait]
impl CallStackStore for MemoryStore {
    async fn load(&self, key: &SessionKey) -> Result<Vec<String>, StoreError> {
        Ok(self.stacks.read().await.get(key).cloned().unwrap_or_default())
    }

    async fn save(&self, key: &SessionKey, stack: &[String]) -> Result<(), StoreError> {
        self.stacks.write().await.insert(key.clone(), stack.to_vec());
        Ok(())
    }
}
