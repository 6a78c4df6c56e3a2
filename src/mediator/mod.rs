//! Mediator：按会话路由消息
//!
//! 每个 (client, chat) 一个 worker 任务，命令经 mpsc 串行处理，结果经 oneshot 返回；
//! 取消不经过队列，直接触发该会话 SessionSupervisor 的 CancellationToken。
//! worker 空闲超过 `session_idle` 后关闭队列并退出，会话状态留在存储里，下一条命令到来时重建。

pub mod events;
pub mod history;
pub mod session;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentRuntime, ExecutorSettings, SharedObservations};
use crate::core::{OrchestratorError, SessionSupervisor, TaskScheduler};
use crate::llm::CompletionService;
use crate::memory::Message;
use crate::store::{SessionKey, Stores};
use crate::tools::ToolExecutor;

pub use events::{EventKind, EventSink, OutboundEvent};
pub use session::{AgentCatalog, SessionRuntime};

const SESSION_QUEUE: usize = 32;

type Reply<T> = oneshot::Sender<Result<T, OrchestratorError>>;

enum SessionCommand {
    Message {
        text: String,
        cancel: CancellationToken,
        reply: Reply<()>,
    },
    History {
        reply: Reply<Vec<Message>>,
    },
    DeleteMessage {
        content: String,
        reply: Reply<usize>,
    },
    CallStack {
        reply: Reply<Vec<String>>,
    },
}

#[derive(Clone)]
struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
    supervisor: Arc<SessionSupervisor>,
}

/// 所有会话共享的组件
#[derive(Clone)]
pub struct MediatorParts {
    pub catalog: Arc<AgentCatalog>,
    pub completion: Arc<dyn CompletionService>,
    pub tools: Arc<ToolExecutor>,
    pub scheduler: Arc<TaskScheduler>,
    pub stores: Stores,
    pub settings: ExecutorSettings,
    pub max_turns: usize,
    pub session_idle: Duration,
}

#[derive(Clone)]
pub struct Mediator {
    parts: MediatorParts,
    events: EventSink,
    sessions: Arc<Mutex<HashMap<SessionKey, SessionHandle>>>,
}

impl Mediator {
    pub fn new(parts: MediatorParts) -> Self {
        Self {
            parts,
            events: EventSink::default(),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OutboundEvent> {
        self.events.subscribe()
    }

    pub fn catalog(&self) -> &AgentCatalog {
        &self.parts.catalog
    }

    async fn session(&self, key: &SessionKey) -> SessionHandle {
        let mut sessions = self.sessions.lock().await;
        if let Some(handle) = sessions.get(key).filter(|h| !h.tx.is_closed()) {
            return handle.clone();
        }
        // 沿用旧的 supervisor，已发出的取消令牌仍然有效
        let supervisor = sessions
            .remove(key)
            .map(|h| h.supervisor)
            .unwrap_or_else(|| Arc::new(SessionSupervisor::new()));
        sessions.retain(|_, h| !h.tx.is_closed());
        let handle = self.spawn_session(key.clone(), supervisor);
        sessions.insert(key.clone(), handle.clone());
        handle
    }

    fn spawn_session(&self, key: SessionKey, supervisor: Arc<SessionSupervisor>) -> SessionHandle {
        let (tx, mut rx) = mpsc::channel::<SessionCommand>(SESSION_QUEUE);
        let runtime = AgentRuntime {
            key: key.clone(),
            completion: Arc::clone(&self.parts.completion),
            tools: Arc::clone(&self.parts.tools),
            scheduler: Arc::clone(&self.parts.scheduler),
            stores: self.parts.stores.clone(),
            observations: SharedObservations::default(),
            settings: self.parts.settings.clone(),
            max_turns: self.parts.max_turns,
        };
        let mut session = SessionRuntime::new(Arc::clone(&self.parts.catalog), runtime, self.events.clone());
        let events = self.events.clone();
        let idle = self.parts.session_idle;

        tokio::spawn(async move {
            tracing::debug!(session = %key, "Session worker started");
            loop {
                let command = match tokio::time::timeout(idle, rx.recv()).await {
                    Ok(Some(command)) => command,
                    Ok(None) => break,
                    Err(_) => {
                        // 先关闭队列，已排队的命令照常处理完
                        tracing::debug!(session = %key, "Session idle, closing");
                        rx.close();
                        continue;
                    }
                };
                match command {
                    SessionCommand::Message { text, cancel, reply } => {
                        let result = session.handle_message(&text, &cancel).await;
                        if let Err(e) = &result {
                            match e {
                                OrchestratorError::Cancelled => {
                                    tracing::info!(session = %key, "Turn cancelled");
                                }
                                other => tracing::error!(session = %key, error = %other, "Turn failed"),
                            }
                            events.error(&key, e);
                        }
                        let _ = reply.send(result);
                    }
                    SessionCommand::History { reply } => {
                        let _ = reply.send(session.history().await);
                    }
                    SessionCommand::DeleteMessage { content, reply } => {
                        let _ = reply.send(session.delete_message(&content).await);
                    }
                    SessionCommand::CallStack { reply } => {
                        let result = session.load().await.map(|_| session.call_stack().to_vec());
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::debug!(session = %key, "Session worker stopped");
        });

        SessionHandle { tx, supervisor }
    }

    async fn request<T>(
        &self,
        key: &SessionKey,
        handle: SessionHandle,
        build: impl FnOnce(Reply<T>) -> SessionCommand,
    ) -> Result<T, OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        let mut command = build(reply);
        let mut handle = handle;
        // worker 可能恰好因空闲退出：换一个新 worker 再投递一次
        for _ in 0..2 {
            match handle.tx.send(command).await {
                Ok(()) => {
                    return rx
                        .await
                        .map_err(|_| OrchestratorError::SessionClosed(key.to_string()))?;
                }
                Err(mpsc::error::SendError(returned)) => {
                    command = returned;
                    handle = self.session(key).await;
                }
            }
        }
        Err(OrchestratorError::SessionClosed(key.to_string()))
    }

    /// 处理一条用户消息；回复通过事件广播
    pub async fn handle_message(&self, key: &SessionKey, text: &str) -> Result<(), OrchestratorError> {
        let handle = self.session(key).await;
        let cancel = handle.supervisor.begin_turn().await;
        let text = text.to_string();
        self.request(key, handle, |reply| SessionCommand::Message { text, cancel, reply })
            .await
    }

    /// 中止该会话正在进行的处理；下一条消息使用新的 token
    pub async fn cancel(&self, key: &SessionKey) {
        let handle = self.sessions.lock().await.get(key).cloned();
        if let Some(handle) = handle {
            handle.supervisor.cancel().await;
            tracing::info!(session = %key, "Cancellation requested");
        }
    }

    pub async fn history(&self, key: &SessionKey) -> Result<Vec<Message>, OrchestratorError> {
        let handle = self.session(key).await;
        self.request(key, handle, |reply| SessionCommand::History { reply })
            .await
    }

    pub async fn delete_message(&self, key: &SessionKey, content: &str) -> Result<usize, OrchestratorError> {
        let handle = self.session(key).await;
        let text = content.to_string();
        let removed = self
            .request(key, handle, |reply| SessionCommand::DeleteMessage { content: text, reply })
            .await?;
        self.events.emit(
            key,
            EventKind::MessageDeleted,
            json!({ "content": content, "removed": removed }),
        );
        Ok(removed)
    }

    pub async fn call_stack(&self, key: &SessionKey) -> Result<Vec<String>, OrchestratorError> {
        let handle = self.session(key).await;
        self.request(key, handle, |reply| SessionCommand::CallStack { reply })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use crate::agent::AgentProfile;
    use crate::llm::ScriptedCompletion;
    use crate::tools::{JoinTool, Tool, ToolContext, ToolRegistry};

    struct StaticTool {
        name: &'static str,
        output: &'static str,
        delay: Duration,
    }

    #[async_trait]
    impl Tool for StaticTool {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "returns a fixed text"
        }

        async fn execute(&self, _ctx: &ToolContext) -> Result<Value, String> {
            tokio::time::sleep(self.delay).await;
            Ok(Value::String(self.output.to_string()))
        }
    }

    fn mediator(service: Arc<ScriptedCompletion>, stores: Stores, tool_delay: Duration) -> Mediator {
        let mut registry = ToolRegistry::new();
        registry.register(JoinTool);
        registry.register(StaticTool {
            name: "caption_tool",
            output: "Cats are purrfect",
            delay: tool_delay,
        });
        let catalog = AgentCatalog::new(
            vec![
                AgentProfile::new("init_agent").with_delegates(["caption_agent"]),
                AgentProfile::new("caption_agent")
                    .describe("Writes captions")
                    .with_tools(["caption_tool"]),
            ],
            "init_agent",
        );
        Mediator::new(MediatorParts {
            catalog: Arc::new(catalog),
            completion: service,
            tools: Arc::new(ToolExecutor::new(registry, 30)),
            scheduler: Arc::new(TaskScheduler::new(2)),
            stores,
            settings: ExecutorSettings::default(),
            max_turns: 10,
            session_idle: Duration::from_secs(60),
        })
    }

    /// 根 Agent 规划一个委派给 caption_agent 的任务，随后批准
    fn script_root_plan(service: &ScriptedCompletion) {
        service
            .push_structured(json!({"message": "Got it", "requirements": {"summary": "User decided to post cats"}}))
            .push_structured(json!({
                "tasks": [
                    {"id": "1", "tool": "caption_agent", "arguments": [{"name": "topic", "value": "cats"}]},
                    {"id": "2", "tool": "join", "dependencies": ["1"]}
                ],
                "overview": "I will ask the caption agent. OK?"
            }))
            .push_structured(json!({
                "message": "Starting",
                "requirements": {"summary": "User decided to post cats"},
                "plan_approved": true
            }))
            .push_structured(json!({"message": "Which caption style do you like?"}));
    }

    fn script_child_plan(service: &ScriptedCompletion) {
        service
            .push_structured(json!({"message": "Funny it is", "requirements": {"summary": "funny caption"}}))
            .push_structured(json!({
                "tasks": [
                    {"id": "1", "tool": "caption_tool", "arguments": [{"name": "style", "value": "funny"}]},
                    {"id": "2", "tool": "join", "dependencies": ["1"]}
                ],
                "overview": "I will write a funny caption. OK?"
            }))
            .push_structured(json!({
                "message": "Writing",
                "requirements": {"summary": "funny caption"},
                "plan_approved": true
            }));
    }

    fn drain(rx: &mut broadcast::Receiver<OutboundEvent>) -> Vec<OutboundEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[tokio::test]
    async fn test_delegation_pushes_exactly_one_frame() {
        let service = Arc::new(ScriptedCompletion::new());
        script_root_plan(&service);
        let m = mediator(service, Stores::in_memory(), Duration::ZERO);
        let key = SessionKey::new("alice", "chat");
        let mut rx = m.subscribe();

        m.handle_message(&key, "make a cat post").await.unwrap();
        assert_eq!(m.call_stack(&key).await.unwrap(), vec!["init_agent"]);
        let kinds: Vec<EventKind> = drain(&mut rx).into_iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&EventKind::PlanningStarted));
        assert!(kinds.contains(&EventKind::Plan));

        m.handle_message(&key, "yes").await.unwrap();
        assert_eq!(m.call_stack(&key).await.unwrap(), vec!["init_agent", "caption_agent"]);
        let messages: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter(|e| e.kind == EventKind::Message)
            .map(|e| e.text())
            .collect();
        assert!(messages.contains(&"Which caption style do you like?".to_string()));
    }

    #[tokio::test]
    async fn test_child_result_flows_back_to_parent() {
        let service = Arc::new(ScriptedCompletion::new());
        script_root_plan(&service);
        script_child_plan(&service);
        service.push_structured(json!({"message": "Great!", "result_accepted": true}));
        let m = mediator(service.clone(), Stores::in_memory(), Duration::ZERO);
        let key = SessionKey::new("alice", "chat");
        let mut rx = m.subscribe();

        for text in ["make a cat post", "yes", "funny please", "go ahead"] {
            m.handle_message(&key, text).await.unwrap();
        }
        let last = drain(&mut rx)
            .into_iter()
            .filter(|e| e.kind == EventKind::Message)
            .last()
            .unwrap();
        assert_eq!(last.text(), "Cats are purrfect");

        m.handle_message(&key, "love it").await.unwrap();
        assert_eq!(m.call_stack(&key).await.unwrap(), vec!["init_agent"]);
        let messages: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter(|e| e.kind == EventKind::Message)
            .map(|e| e.text())
            .collect();
        // 子 Agent 的确认消息，然后是父计划 join 的结果
        assert_eq!(messages, vec!["Great!".to_string(), "Cats are purrfect".to_string()]);
        assert_eq!(service.remaining(), 0);
    }

    #[tokio::test]
    async fn test_session_restored_from_store() {
        let stores = Stores::in_memory();
        let service = Arc::new(ScriptedCompletion::new());
        script_root_plan(&service);
        let key = SessionKey::new("alice", "chat");
        {
            let m = mediator(service.clone(), stores.clone(), Duration::ZERO);
            m.handle_message(&key, "make a cat post").await.unwrap();
            m.handle_message(&key, "yes").await.unwrap();
        }

        let restarted = mediator(service, stores, Duration::ZERO);
        assert_eq!(
            restarted.call_stack(&key).await.unwrap(),
            vec!["init_agent", "caption_agent"]
        );
        let history = restarted.history(&key).await.unwrap();
        let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
        assert!(contents.contains(&"make a cat post"));
        assert!(contents.contains(&"Which caption style do you like?"));
        assert!(!contents.iter().any(|c| c.starts_with("Use these arguments")));
    }

    #[tokio::test]
    async fn test_delegation_interrupted_before_push_is_reissued() {
        let stores = Stores::in_memory();
        let service = Arc::new(ScriptedCompletion::new());
        script_root_plan(&service);
        let key = SessionKey::new("alice", "chat");
        {
            let m = mediator(service.clone(), stores.clone(), Duration::ZERO);
            m.handle_message(&key, "make a cat post").await.unwrap();
            m.handle_message(&key, "yes").await.unwrap();
        }
        // 父 Agent 已记下委派，但调用栈停在压栈之前
        stores.save_stack(&key, &["init_agent".to_string()]).await.unwrap();
        let parent = stores.load_agent(&key, "init_agent").await.unwrap().unwrap();
        assert_eq!(parent.execution.delegated.len(), 1);

        service.push_structured(json!({"message": "Which caption style do you like?"}));
        let restarted = mediator(service.clone(), stores.clone(), Duration::ZERO);
        let mut rx = restarted.subscribe();
        restarted.handle_message(&key, "hello?").await.unwrap();

        assert_eq!(
            restarted.call_stack(&key).await.unwrap(),
            vec!["init_agent", "caption_agent"]
        );
        let messages: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter(|e| e.kind == EventKind::Message)
            .map(|e| e.text())
            .collect();
        assert_eq!(messages, vec!["Which caption style do you like?".to_string()]);
        let parent = stores.load_agent(&key, "init_agent").await.unwrap().unwrap();
        assert_eq!(parent.execution.delegated.len(), 1);
        assert_eq!(service.remaining(), 0);
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let service = Arc::new(ScriptedCompletion::new());
        service.push_structured(json!({"message": "Hello alice"}));
        service.push_structured(json!({"message": "Hello bob"}));
        let m = mediator(service, Stores::in_memory(), Duration::ZERO);
        let alice = SessionKey::new("alice", "chat");
        let bob = SessionKey::new("bob", "chat");

        m.handle_message(&alice, "hi").await.unwrap();
        m.handle_message(&bob, "hi").await.unwrap();

        let history = m.history(&alice).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].content, "Hello alice");
        assert_eq!(m.history(&bob).await.unwrap()[1].content, "Hello bob");
    }

    #[tokio::test]
    async fn test_idle_session_is_evicted_and_rebuilt() {
        let service = Arc::new(ScriptedCompletion::new());
        service.push_structured(json!({"message": "What is the post about?"}));
        service.push_structured(json!({"message": "Nice, cats it is"}));
        let mut m = mediator(service, Stores::in_memory(), Duration::ZERO);
        m.parts.session_idle = Duration::from_millis(50);
        let key = SessionKey::new("alice", "chat");

        m.handle_message(&key, "hi").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let closed = m.sessions.lock().await.get(&key).map(|h| h.tx.is_closed());
        assert_eq!(closed, Some(true));

        // 新 worker 从存储恢复
        m.handle_message(&key, "cats").await.unwrap();
        let history = m.history(&key).await.unwrap();
        let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["hi", "What is the post about?", "cats", "Nice, cats it is"]);
        assert_eq!(m.sessions.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_message_emits_event() {
        let service = Arc::new(ScriptedCompletion::new());
        service.push_structured(json!({"message": "What is the post about?"}));
        let m = mediator(service, Stores::in_memory(), Duration::ZERO);
        let key = SessionKey::new("alice", "chat");
        m.handle_message(&key, "hi").await.unwrap();
        let mut rx = m.subscribe();

        assert_eq!(m.delete_message(&key, "hi").await.unwrap(), 1);
        let history = m.history(&key).await.unwrap();
        assert_eq!(history.len(), 1);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::MessageDeleted);
        assert_eq!(event.content["removed"], json!(1));
    }

    #[tokio::test]
    async fn test_validation_error_is_reported() {
        let service = Arc::new(ScriptedCompletion::new());
        service.push_structured(json!({"requirements": {}}));
        let m = mediator(service, Stores::in_memory(), Duration::ZERO);
        let key = SessionKey::new("alice", "chat");
        let mut rx = m.subscribe();

        let err = m.handle_message(&key, "hi").await.unwrap_err();
        assert!(err.is_validation());
        let kinds: Vec<EventKind> = drain(&mut rx).into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::ValidationError]);
    }

    #[tokio::test]
    async fn test_cancel_aborts_running_turn() {
        let service = Arc::new(ScriptedCompletion::new());
        script_root_plan(&service);
        script_child_plan(&service);
        let m = mediator(service, Stores::in_memory(), Duration::from_secs(30));
        let key = SessionKey::new("alice", "chat");
        for text in ["make a cat post", "yes", "funny please"] {
            m.handle_message(&key, text).await.unwrap();
        }
        let mut rx = m.subscribe();

        let running = {
            let m = m.clone();
            let key = key.clone();
            tokio::spawn(async move { m.handle_message(&key, "go ahead").await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        m.cancel(&key).await;

        let result = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(OrchestratorError::Cancelled)));
        let errors: Vec<OutboundEvent> = drain(&mut rx)
            .into_iter()
            .filter(|e| e.kind == EventKind::Error)
            .collect();
        assert_eq!(errors.len(), 1);
        // 被取消的子 Agent 仍在栈顶
        assert_eq!(m.call_stack(&key).await.unwrap(), vec!["init_agent", "caption_agent"]);
    }
}
