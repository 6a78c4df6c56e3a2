//! 存储抽象层
//!
//! 三个仓储端口（对话/Agent 状态、任务结果缓存、调用栈），均按会话 (client, chat) 隔离，
//! 支持幂等 upsert 与整体重载；提供内存与 SQLite 两种实现，Stores 统一加上有界退避重试。

pub mod memory;
#[cfg(feature = "async-sqlite")]
pub mod sqlite;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agent::AgentState;
use crate::config::StoreSection;
use crate::core::{RetryPolicy, Retryable};
use crate::workflow::TaskRecord;

pub use memory::MemoryStore;
#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteStore;

/// 会话标识
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub client_id: String,
    pub chat_id: String,
}

impl SessionKey {
    pub fn new(client_id: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            chat_id: chat_id.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.client_id, self.chat_id)
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    /// 后端 I/O 失败（可重试）
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Backend(_))
    }
}

#[cfg(feature = "async-sqlite")]
impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Agent 状态（含对话历史与计划代次），按 (client, chat, agent) 存取
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn load(&self, key: &SessionKey, agent: &str) -> Result<Option<AgentState>, StoreError>;

    async fn save(&self, key: &SessionKey, state: &AgentState) -> Result<(), StoreError>;

    /// 会话内全部 Agent 的状态（按 Agent 名排序）
    async fn load_all(&self, key: &SessionKey) -> Result<Vec<AgentState>, StoreError>;
}

/// 观测缓存：task_id -> 结果
#[async_trait]
pub trait TaskResultStore: Send + Sync {
    async fn load(&self, key: &SessionKey) -> Result<Vec<TaskRecord>, StoreError>;

    async fn upsert(&self, key: &SessionKey, record: &TaskRecord) -> Result<(), StoreError>;
}

/// 调用栈：Agent 名列表，栈顶在末尾
#[async_trait]
pub trait CallStackStore: Send + Sync {
    async fn load(&self, key: &SessionKey) -> Result<Vec<String>, StoreError>;

    async fn save(&self, key: &SessionKey, stack: &[String]) -> Result<(), StoreError>;
}

/// 三个仓储的组合，所有调用经 RetryPolicy 重试
#[derive(Clone)]
pub struct Stores {
    conversations: Arc<dyn ConversationStore>,
    results: Arc<dyn TaskResultStore>,
    call_stacks: Arc<dyn CallStackStore>,
    retry: RetryPolicy,
}

impl Stores {
    pub fn new(
        conversations: Arc<dyn ConversationStore>,
        results: Arc<dyn TaskResultStore>,
        call_stacks: Arc<dyn CallStackStore>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            conversations,
            results,
            call_stacks,
            retry,
        }
    }

    /// 三个端口共用同一个实现
    pub fn shared<S>(store: Arc<S>, retry: RetryPolicy) -> Self
    where
        S: ConversationStore + TaskResultStore + CallStackStore + 'static,
    {
        Self::new(store.clone(), store.clone(), store, retry)
    }

    pub fn in_memory() -> Self {
        Self::shared(Arc::new(MemoryStore::new()), RetryPolicy::default())
    }

    pub async fn load_agent(&self, key: &SessionKey, agent: &str) -> Result<Option<AgentState>, StoreError> {
        let store = &self.conversations;
        self.retry.run("load_agent", move || store.load(key, agent)).await
    }

    pub async fn save_agent(&self, key: &SessionKey, state: &AgentState) -> Result<(), StoreError> {
        let store = &self.conversations;
        self.retry.run("save_agent", move || store.save(key, state)).await
    }

    pub async fn load_agents(&self, key: &SessionKey) -> Result<Vec<AgentState>, StoreError> {
        let store = &self.conversations;
        self.retry.run("load_agents", move || store.load_all(key)).await
    }

    pub async fn load_results(&self, key: &SessionKey) -> Result<Vec<TaskRecord>, StoreError> {
        let store = &self.results;
        self.retry.run("load_results", move || store.load(key)).await
    }

    pub async fn save_result(&self, key: &SessionKey, record: &TaskRecord) -> Result<(), StoreError> {
        let store = &self.results;
        self.retry.run("save_result", move || store.upsert(key, record)).await
    }

    pub async fn load_stack(&self, key: &SessionKey) -> Result<Vec<String>, StoreError> {
        let store = &self.call_stacks;
        self.retry.run("load_stack", move || store.load(key)).await
    }

    pub async fn save_stack(&self, key: &SessionKey, stack: &[String]) -> Result<(), StoreError> {
        let store = &self.call_stacks;
        self.retry.run("save_stack", move || store.save(key, stack)).await
    }
}

/// 按配置创建存储
///
/// backend = "sqlite" 且启用了 async-sqlite feature 时使用 SQLite；否则（或打开失败时）使用内存存储
pub async fn create_stores(cfg: &StoreSection) -> Stores {
    if cfg.backend == "sqlite" {
        #[cfg(feature = "async-sqlite")]
        match SqliteStore::new(&cfg.db_path).await {
            Ok(store) => {
                tracing::info!("Using SQLite store: {:?}", cfg.db_path);
                return Stores::shared(Arc::new(store), cfg.retry.clone());
            }
            Err(e) => {
                tracing::warn!("Failed to open SQLite store, falling back to memory: {}", e);
            }
        }

        #[cfg(not(feature = "async-sqlite"))]
        tracing::warn!("SQLite store requested but async-sqlite feature not enabled, using memory store");
    }

    tracing::info!("Using in-memory store");
    Stores::shared(Arc::new(MemoryStore::new()), cfg.retry.clone())
}
