//! SQLite 存储
//!
//! 使用 sqlx 异步连接池；Agent 状态、任务结果、调用栈均以 JSON 文本存一列，按会话主键 upsert，支持跨重启恢复。

use std::path::Path;

use async_trait::async_trait;
use sqlx::Row;

use super::{CallStackStore, ConversationStore, SessionKey, StoreError, TaskResultStore};
use crate::agent::AgentState;
use crate::workflow::TaskRecord;

pub struct SqliteStore {
    pool: sqlx::sqlite::SqlitePool,
}

impl SqliteStore {
    /// 打开（不存在则创建）数据库并建表
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self, sqlx::Error> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());

        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    async fn init_tables(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS agent_states (
                client_id TEXT NOT NULL,
                chat_id TEXT NOT NULL,
                agent TEXT NOT NULL,
                state TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (client_id, chat_id, agent)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS task_results (
                client_id TEXT NOT NULL,
                chat_id TEXT NOT NULL,
                task_id TEXT NOT NULL,
                observation TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (client_id, chat_id, task_id)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS call_stacks (
                client_id TEXT NOT NULL,
                chat_id TEXT NOT NULL,
                stack TEXT NOT NULL,
                PRIMARY KEY (client_id, chat_id)
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn load(&self, key: &SessionKey, agent: &str) -> Result<Option<AgentState>, StoreError> {
        let row = sqlx::query(
            "SELECT state FROM agent_states WHERE client_id = ? AND chat_id = ? AND agent = ?",
        )
        .bind(&key.client_id)
        .bind(&key.chat_id)
        .bind(agent)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let json: String = row.get("state");
                Ok(Some(serde_json::from_str(&json)?))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, key: &SessionKey, state: &AgentState) -> Result<(), StoreError> {
        let json = serde_json::to_string(state)?;
        sqlx::query(
            "INSERT INTO agent_states (client_id, chat_id, agent, state, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (client_id, chat_id, agent)
             DO UPDATE SET state = excluded.state, updated_at = excluded.updated_at",
        )
        .bind(&key.client_id)
        .bind(&key.chat_id)
        .bind(&state.name)
        .bind(json)
        .bind(state.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_all(&self, key: &SessionKey) -> Result<Vec<AgentState>, StoreError> {
        let rows = sqlx::query(
            "SELECT state FROM agent_states WHERE client_id = ? AND chat_id = ? ORDER BY agent ASC",
        )
        .bind(&key.client_id)
        .bind(&key.chat_id)
        .fetch_all(&self.pool)
        .await?;

        let mut states = Vec::with_capacity(rows.len());
        for row in rows {
            let json: String = row.get("state");
            states.push(serde_json::from_str(&json)?);
        }
        Ok(states)
    }
}

#[async_trait]
impl TaskResultStore for SqliteStore {
    async fn load(&self, key: &SessionKey) -> Result<Vec<TaskRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT task_id, observation FROM task_results
             WHERE client_id = ? AND chat_id = ? ORDER BY rowid ASC",
        )
        .bind(&key.client_id)
        .bind(&key.chat_id)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let task_id: String = row.get("task_id");
            let json: String = row.get("observation");
            records.push(TaskRecord {
                task_id,
                observation: serde_json::from_str(&json)?,
            });
        }
        Ok(records)
    }

    async fn upsert(&self, key: &SessionKey, record: &TaskRecord) -> Result<(), StoreError> {
        let json = serde_json::to_string(&record.observation)?;
        sqlx::query(
            "INSERT INTO task_results (client_id, chat_id, task_id, observation, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (client_id, chat_id, task_id)
             DO UPDATE SET observation = excluded.observation",
        )
        .bind(&key.client_id)
        .bind(&key.chat_id)
        .bind(&record.task_id)
        .bind(json)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl CallStackStore for SqliteStore {
    async fn load(&self, key: &SessionKey) -> Result<Vec<String>, StoreError> {
        let row = sqlx::query("SELECT stack FROM call_stacks WHERE client_id = ? AND chat_id = ?")
            .bind(&key.client_id)
            .bind(&key.chat_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let json: String = row.get("stack");
                Ok(serde_json::from_str(&json)?)
            }
            None => Ok(Vec::new()),
        }
    }

    async fn save(&self, key: &SessionKey, stack: &[String]) -> Result<(), StoreError> {
        let json = serde_json::to_string(stack)?;
        sqlx::query(
            "INSERT INTO call_stacks (client_id, chat_id, stack) VALUES (?, ?, ?)
             ON CONFLICT (client_id, chat_id) DO UPDATE SET stack = excluded.stack",
        )
        .bind(&key.client_id)
        .bind(&key.chat_id)
        .bind(json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
