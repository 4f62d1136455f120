//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `PROJECTWISE__*` 覆盖（双下划线表示嵌套，如 `PROJECTWISE__MCP__SERVER_URL=http://...`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::mcp::SessionConfig;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub mcp: McpSection,
    pub llm: LlmSection,
    pub tools: ToolsSection,
    pub agent: AgentSection,
    pub memory: MemorySection,
}

/// [mcp] 段：工具服务器地址、心跳与目录刷新间隔
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct McpSection {
    pub server_url: String,
    pub heartbeat_interval_secs: u64,
    pub refresh_interval_secs: u64,
    /// 会话断开后是否自动重连（手动断开会临时关闭）
    pub auto_reconnect: bool,
    /// 单次 MCP 请求（握手 / tools/list / tools/call）超时
    pub request_timeout_secs: u64,
}

impl Default for McpSection {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:5000/projectwise/mcp".to_string(),
            heartbeat_interval_secs: 30,
            refresh_interval_secs: 60,
            auto_reconnect: true,
            request_timeout_secs: 60,
        }
    }
}

impl McpSection {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            endpoint: self.server_url.clone(),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs.max(1)),
            refresh_interval: Duration::from_secs(self.refresh_interval_secs.max(1)),
            auto_reconnect: self.auto_reconnect,
        }
    }
}

/// [llm] 段：模型、端点与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub model: String,
    pub base_url: Option<String>,
    pub temperature: f32,
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            temperature: 0.0,
            request_timeout_secs: 60,
        }
    }
}

/// [tools] 段：工具超时、流水线超时、并行上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    /// 整条文档生成流水线超时（秒）
    pub pipeline_timeout_secs: u64,
    pub max_parallel_tools: usize,
    /// generate_proposal_docx 的默认模板（未设置则不注入）
    pub override_template: Option<String>,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
            pipeline_timeout_secs: 180,
            max_parallel_tools: 5,
            override_template: None,
        }
    }
}

/// [agent] 段：轮数预算与记忆注入
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub max_turns: usize,
    pub pipeline_max_turns: usize,
    /// 注入 system prompt 的记忆条数
    pub memory_limit: usize,
    /// 每条记忆的 token 上限
    pub memory_token_budget: usize,
    /// 对话历史保留轮数（短期记忆）
    pub max_context_turns: usize,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_turns: 20,
            pipeline_max_turns: 12,
            memory_limit: 5,
            memory_token_budget: 200,
            max_context_turns: 20,
        }
    }
}

/// [memory] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    /// 每个用户保留的长期记忆条数上限
    pub max_entries: usize,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self { max_entries: 2000 }
    }
}

/// 从 config 目录加载配置，环境变量 PROJECTWISE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 PROJECTWISE__*（双下划线表示嵌套键）
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
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("PROJECTWISE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
