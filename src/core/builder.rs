//! Mediator 构建器：按配置装配补全服务、工具、存储与 Agent 目录
//!
//! 控制台与网关共用同一套装配逻辑；测试可用 with_* 方法替换补全服务与存储。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::agent::{AgentProfile, ExecutorSettings};
use crate::config::AppConfig;
use crate::core::{OrchestratorError, TaskScheduler};
use crate::llm::{CompletionService, MockCompletion, OpenAiCompletion};
use crate::mediator::{AgentCatalog, Mediator, MediatorParts};
use crate::store::{create_stores, Stores};
use crate::tools::{CompletionJoinTool, CompletionTool, JoinTool, Tool, ToolExecutor, ToolRegistry};

const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";

/// 按 provider 与环境变量中的 API Key 选择补全后端；都没有时使用 Mock
///
/// 返回值第二项表示是否为真实后端（决定 join 是否走补全服务）
pub fn create_completion_from_config(cfg: &AppConfig) -> (Arc<dyn CompletionService>, bool) {
    let provider = cfg.llm.provider.to_lowercase();
    let timeout = cfg.llm.timeouts.request;
    let deepseek_key = std::env::var("DEEPSEEK_API_KEY").ok();
    let openai_key = std::env::var("OPENAI_API_KEY").ok();

    if provider == "mock" {
        tracing::info!("Using Mock completion (configured)");
        return (Arc::new(MockCompletion), false);
    }

    match (provider.as_str(), deepseek_key, openai_key) {
        ("deepseek", Some(key), _) | ("deepseek", None, Some(key)) => {
            let base = cfg.llm.base_url.as_deref().unwrap_or(DEEPSEEK_BASE_URL);
            tracing::info!("Using DeepSeek completion ({})", cfg.llm.model);
            (
                Arc::new(OpenAiCompletion::new(Some(base), &cfg.llm.model, Some(&key), timeout)),
                true,
            )
        }
        (_, _, Some(key)) => {
            tracing::info!("Using OpenAI-compatible completion ({})", cfg.llm.model);
            (
                Arc::new(OpenAiCompletion::new(
                    cfg.llm.base_url.as_deref(),
                    &cfg.llm.model,
                    Some(&key),
                    timeout,
                )),
                true,
            )
        }
        _ => {
            tracing::warn!("No API key set or provider unknown, using Mock completion");
            (Arc::new(MockCompletion), false)
        }
    }
}

pub struct MediatorBuilder {
    config: AppConfig,
    completion: Option<Arc<dyn CompletionService>>,
    stores: Option<Stores>,
    extra_tools: Vec<Arc<dyn Tool>>,
    completion_join: Option<bool>,
}

impl MediatorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            completion: None,
            stores: None,
            extra_tools: Vec::new(),
            completion_join: None,
        }
    }

    /// 指定补全服务（默认按配置与环境变量选择）
    pub fn with_completion(mut self, completion: Arc<dyn CompletionService>) -> Self {
        self.completion = Some(completion);
        self
    }

    /// 指定存储（默认按 [store] 段创建）
    pub fn with_stores(mut self, stores: Stores) -> Self {
        self.stores = Some(stores);
        self
    }

    /// 追加代码中实现的工具
    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.extra_tools.push(tool);
        self
    }

    /// join 是否使用补全服务；默认仅在真实后端下启用
    pub fn with_completion_join(mut self, enabled: bool) -> Self {
        self.completion_join = Some(enabled);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    fn build_tool_registry(&self, completion: &Arc<dyn CompletionService>, completion_join: bool) -> ToolRegistry {
        let mut tools = ToolRegistry::new();
        if completion_join {
            tools.register(CompletionJoinTool::new(Arc::clone(completion)));
        } else {
            tools.register(JoinTool);
        }
        for def in &self.config.tools {
            tools.register(CompletionTool::new(
                def.name.clone(),
                def.description.clone(),
                def.prompt.clone(),
                Arc::clone(completion),
            ));
        }
        for tool in &self.extra_tools {
            tools.register_arc(Arc::clone(tool));
        }
        tools
    }

    fn build_catalog(&self) -> Result<AgentCatalog, OrchestratorError> {
        let default_agent = self.config.app.default_agent.clone();
        let profiles = if self.config.agents.is_empty() {
            tracing::warn!(agent = %default_agent, "No [[agents]] configured, using a bare entry agent");
            vec![AgentProfile::new(default_agent.clone())]
        } else {
            self.config.agents.clone()
        };

        let catalog = AgentCatalog::new(profiles, default_agent.clone());
        if !catalog.contains(&default_agent) {
            return Err(OrchestratorError::ConfigError(format!(
                "default agent {default_agent} has no profile"
            )));
        }
        Ok(catalog)
    }

    pub async fn build(self) -> Result<Mediator, OrchestratorError> {
        let (completion, real_backend) = match &self.completion {
            Some(c) => (Arc::clone(c), false),
            None => create_completion_from_config(&self.config),
        };
        let completion_join = self.completion_join.unwrap_or(real_backend);
        let registry = self.build_tool_registry(&completion, completion_join);
        tracing::info!(tools = ?registry.tool_names(), "Tool registry built");

        let catalog = self.build_catalog()?;
        let stores = match self.stores {
            Some(stores) => stores,
            None => create_stores(&self.config.store).await,
        };
        let exec = &self.config.executor;

        Ok(Mediator::new(MediatorParts {
            catalog: Arc::new(catalog),
            completion,
            tools: Arc::new(ToolExecutor::new(registry, exec.tool_timeout_secs)),
            scheduler: Arc::new(TaskScheduler::new(exec.max_concurrent_tools)),
            stores,
            settings: ExecutorSettings {
                dependency_timeout: Duration::from_secs(exec.dependency_timeout_secs.max(1)),
            },
            max_turns: self.config.app.max_context_turns,
            session_idle: Duration::from_secs(self.config.app.session_idle_secs.max(1)),
        }))
    }
}

/// 便捷函数：加载配置（失败时使用默认值）并构建 Mediator
pub async fn build_mediator(config_path: Option<PathBuf>) -> Result<Mediator, OrchestratorError> {
    let config = crate::config::load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    MediatorBuilder::new(config).build().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolDefinition;
    use crate::workflow::JOIN_TOOL;

    #[tokio::test]
    async fn test_missing_default_agent_profile() {
        let mut config = AppConfig::default();
        config.app.default_agent = "root".into();
        config.agents = vec![AgentProfile::new("other")];
        let err = MediatorBuilder::new(config)
            .with_completion(Arc::new(MockCompletion))
            .with_stores(Stores::in_memory())
            .build()
            .await
            .err()
            .unwrap();
        assert!(matches!(err, OrchestratorError::ConfigError(_)));
    }

    #[test]
    fn test_registry_contains_configured_tools() {
        let mut config = AppConfig::default();
        config.tools = vec![ToolDefinition {
            name: "caption".into(),
            description: "writes a caption".into(),
            prompt: "Write a caption.".into(),
        }];
        let builder = MediatorBuilder::new(config);
        let completion: Arc<dyn CompletionService> = Arc::new(MockCompletion);
        let registry = builder.build_tool_registry(&completion, false);
        assert!(registry.contains(JOIN_TOOL));
        assert!(registry.contains("caption"));
        assert_eq!(registry.get("caption").unwrap().description(), "writes a caption");
    }
}
