//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__LLM__PROVIDER=openai`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::agent::AgentProfile;
use crate::core::RetryPolicy;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub executor: ExecutorSection,
    pub store: StoreSection,
    pub gateway: GatewaySection,
    /// `[[agents]]`：Agent 档案
    pub agents: Vec<AgentProfile>,
    /// `[[tools]]`：由补全服务驱动的工具
    pub tools: Vec<ToolDefinition>,
}

/// [app] 段：应用名、入口 Agent、对话轮数上限
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// 调用栈为空时接收用户消息的 Agent
    #[serde(default = "default_agent")]
    pub default_agent: String,
    /// 每次补全携带的历史轮数
    #[serde(default = "default_max_context_turns")]
    pub max_context_turns: usize,
    /// 会话 worker 空闲多久后退出（秒）；状态留在存储里，下一条消息时重建
    #[serde(default = "default_session_idle_secs")]
    pub session_idle_secs: u64,
}

fn default_agent() -> String {
    "init_agent".to_string()
}

fn default_max_context_turns() -> usize {
    20
}

fn default_session_idle_secs() -> u64 {
    1800
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            default_agent: default_agent(),
            max_context_turns: default_max_context_turns(),
            session_idle_secs: default_session_idle_secs(),
        }
    }
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：deepseek / openai / mock；没有 API Key 时回退到 mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

fn default_provider() -> String {
    "deepseek".to_string()
}

fn default_model() -> String {
    "deepseek-chat".to_string()
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

fn default_request_timeout() -> u64 {
    60
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

/// [executor] 段：工具并发、依赖等待上限、单次工具超时
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorSection {
    #[serde(default = "default_max_concurrent_tools")]
    pub max_concurrent_tools: usize,
    /// 工具任务等待依赖就绪的最长时间（秒）
    #[serde(default = "default_dependency_timeout_secs")]
    pub dependency_timeout_secs: u64,
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
}

fn default_max_concurrent_tools() -> usize {
    3
}

fn default_dependency_timeout_secs() -> u64 {
    300
}

fn default_tool_timeout_secs() -> u64 {
    120
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            max_concurrent_tools: default_max_concurrent_tools(),
            dependency_timeout_secs: default_dependency_timeout_secs(),
            tool_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

/// [store] 段：存储后端与重试策略
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    /// memory / sqlite
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_backend() -> String {
    "memory".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/hive.db")
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            db_path: default_db_path(),
            retry: RetryPolicy::default(),
        }
    }
}

/// [gateway] 段
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySection {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_bind_addr() -> String {
    "127.0.0.1:9000".to_string()
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

/// `[[tools]]`：固定 system prompt 的补全工具
#[derive(Debug, Clone, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub prompt: String,
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!("Config file {:?} not found, ignoring", path);
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
