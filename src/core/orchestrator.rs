//! 客户端编排器：ProjectWiseClient
//!
//! 负责：按配置创建 LLM / MCP 会话 / 记忆，处理一次查询（意图识别 → 文档流水线或通用工具循环），
//! 维护每个用户的短期对话历史，并提供手动连接 / 断开 / 状态查询。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use regex::Regex;
use serde_json::{Map, Value};
use tracing::{error, info, warn, Instrument};

use crate::config::AppConfig;
use crate::core::{Intent, IntentRouter, TaskScheduler};
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient, TokenUsage};
use crate::mcp::{Connector, RemoteConnector, SessionManager, SessionStatus};
use crate::memory::{ConversationMemory, InMemoryStore, MemoryStore, Message, NoopMemory};
use crate::react::ToolOrchestrator;
use crate::tools::ToolExecutor;
use crate::workflow::DocGenPipeline;

pub const PIPELINE_TIMEOUT_MESSAGE: &str = "Maaf, pembuatan proposal melebihi batas waktu.";
const LIST_KAK_FILES: &str = "list_kak_files";
/// 模糊匹配最低得分（查询词在文件名中的覆盖率）
const MIN_MATCH_SCORE: f64 = 0.5;

/// 根据配置与环境变量选择 LLM 后端（OpenAI 兼容 / Mock）
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let api_key = std::env::var("OPENAI_API_KEY").ok();
    let base = cfg.llm.base_url.as_deref();
    if api_key.is_some() || base.is_some() {
        let client = OpenAiClient::new(base, &cfg.llm.model, api_key.as_deref())
            .with_temperature(cfg.llm.temperature)
            .with_request_timeout(Duration::from_secs(cfg.llm.request_timeout_secs));
        tracing::info!("Using OpenAI-compatible LLM ({})", client.model());
        Arc::new(client)
    } else {
        tracing::warn!("No API key or base_url set, using Mock LLM");
        Arc::new(MockLlmClient::new())
    }
}

/// 长期记忆：max_entries 为 0 表示关闭
pub fn create_memory_from_config(cfg: &AppConfig) -> Arc<dyn MemoryStore> {
    if cfg.memory.max_entries == 0 {
        tracing::info!("Long-term memory disabled");
        Arc::new(NoopMemory)
    } else {
        Arc::new(InMemoryStore::new(cfg.memory.max_entries))
    }
}

fn quoted_pattern() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"['"“”‘’]([^'"“”‘’]{2,})['"“”‘’]"#).ok())
        .as_ref()
}

fn keyword_pattern() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(?:proyek|project)\s+([\p{L}\p{N}_.\- ]+)").ok())
        .as_ref()
}

/// 从查询中推断项目名：优先引号内文本，其次 "proyek"/"project" 之后的词，最后退回整句
pub fn infer_project_slug(query: &str) -> String {
    if let Some(caps) = quoted_pattern().and_then(|re| re.captures(query)) {
        if let Some(m) = caps.get(1) {
            return m.as_str().trim().to_string();
        }
    }
    if let Some(caps) = keyword_pattern().and_then(|re| re.captures(query)) {
        if let Some(m) = caps.get(1) {
            let name = m.as_str().trim().trim_end_matches('.');
            if !name.is_empty() {
                return name.to_string();
            }
        }
    }
    query.trim().to_string()
}

fn name_tokens(name: &str) -> Vec<String> {
    let lower = name.to_lowercase();
    let stem = lower
        .strip_suffix(".md")
        .or_else(|| lower.strip_suffix(".txt"))
        .unwrap_or(&lower);
    stem.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// 在文件列表中找与 slug 最相近的文件（词覆盖率最高且不低于阈值）
pub fn best_match(files: &[String], slug: &str) -> Option<String> {
    let wanted = name_tokens(slug);
    if wanted.is_empty() {
        return None;
    }
    let mut best: Option<(f64, &String)> = None;
    for file in files {
        let have = name_tokens(file);
        let hits = wanted.iter().filter(|w| have.contains(w)).count();
        let score = hits as f64 / wanted.len() as f64;
        if score >= MIN_MATCH_SCORE && best.map_or(true, |(s, _)| score > s) {
            best = Some((score, file));
        }
    }
    best.map(|(_, f)| f.clone())
}

/// list_kak_files 结果：字符串数组、对象数组（name / filename 字段）或 {"files": [...]}
fn parse_file_list(raw: &str) -> Vec<String> {
    let value = match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(mut map)) => map.remove("files").unwrap_or(Value::Null),
        Ok(v) => v,
        Err(_) => return Vec::new(),
    };
    let Value::Array(items) = value else {
        return Vec::new();
    };
    items
        .into_iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(s),
            Value::Object(obj) => ["name", "filename", "file_name"]
                .iter()
                .find_map(|k| obj.get(*k).and_then(Value::as_str).map(str::to_string)),
            _ => None,
        })
        .collect()
}

/// ProjectWise 客户端：单一持有者，内部组件共享同一个 SessionManager
pub struct ProjectWiseClient {
    session: SessionManager,
    llm: Arc<dyn LlmClient>,
    executor: ToolExecutor,
    router: IntentRouter,
    orchestrator: ToolOrchestrator,
    pipeline: DocGenPipeline,
    memory: Arc<dyn MemoryStore>,
    histories: Mutex<HashMap<String, ConversationMemory>>,
    pipeline_timeout: Duration,
    max_context_turns: usize,
    default_max_turns: usize,
}

impl ProjectWiseClient {
    /// 用显式依赖组装客户端（测试注入 mock）
    pub fn new(
        cfg: &AppConfig,
        connector: Arc<dyn Connector>,
        llm: Arc<dyn LlmClient>,
        memory: Arc<dyn MemoryStore>,
    ) -> Self {
        let session = SessionManager::new(connector, cfg.mcp.session_config());
        let executor = ToolExecutor::new(session.clone(), cfg.tools.tool_timeout_secs);
        let pipeline_executor = executor
            .clone()
            .with_scheduler(TaskScheduler::new(cfg.tools.max_parallel_tools));

        let orchestrator = ToolOrchestrator::new(llm.clone(), executor.clone(), memory.clone())
            .with_memory_limits(cfg.agent.memory_limit, cfg.agent.memory_token_budget);
        let pipeline = DocGenPipeline::new(llm.clone(), pipeline_executor)
            .with_max_turns(cfg.agent.pipeline_max_turns)
            .with_override_template(cfg.tools.override_template.clone());

        Self {
            session,
            executor,
            router: IntentRouter::new(llm.clone()),
            llm,
            orchestrator,
            pipeline,
            memory,
            histories: Mutex::new(HashMap::new()),
            pipeline_timeout: Duration::from_secs(cfg.tools.pipeline_timeout_secs),
            max_context_turns: cfg.agent.max_context_turns,
            default_max_turns: cfg.agent.max_turns,
        }
    }

    /// 生产组装：Streamable HTTP 连接器、按配置选择的 LLM、进程内记忆
    pub fn from_config(cfg: &AppConfig) -> Self {
        let connector = Arc::new(RemoteConnector::new(Duration::from_secs(cfg.mcp.request_timeout_secs)));
        let llm = create_llm_from_config(cfg);
        Self::new(cfg, connector, llm, create_memory_from_config(cfg))
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub async fn connect(&self) -> bool {
        self.session.connect(None).await
    }

    /// 手动连接：恢复自动重连后建立会话
    pub async fn connect_manual(&self) -> bool {
        self.session.set_auto_reconnect(true);
        self.session.connect(None).await
    }

    /// 手动断开：关闭自动重连后清理会话，之后的工具调用立即失败
    pub async fn disconnect_manual(&self) {
        self.session.set_auto_reconnect(false);
        self.session.cleanup().await;
    }

    pub async fn status(&self) -> SessionStatus {
        self.session.status().await
    }

    /// LLM 后端自启动以来的累计 token 用量
    pub fn token_usage(&self) -> TokenUsage {
        self.llm.token_usage()
    }

    pub async fn cleanup(&self) {
        self.session.cleanup().await;
    }

    /// 处理一次查询；max_turns 为 None 时使用配置值。返回值始终是面向用户的文本
    pub async fn process_query(&self, query: &str, user_id: &str, max_turns: Option<usize>) -> String {
        let trace = uuid::Uuid::new_v4().simple().to_string();
        let trace = trace.get(..8).unwrap_or(&trace).to_string();
        let span = tracing::info_span!("query", trace = %trace);

        async {
            let start = Instant::now();
            let usage_before = self.llm.token_usage();
            info!(query, "Processing query");

            let route = self.router.classify(query).await;
            let intent = route.accepted();
            info!(intent = intent.as_str(), confidence = route.confidence_score, "Intent");

            let answer = match intent {
                Intent::GenerateDocument => self.run_docgen(query, user_id, max_turns).await,
                Intent::Other => {
                    let max_turns = max_turns.unwrap_or(self.default_max_turns);
                    self.run_other(query, user_id, max_turns).await
                }
            };

            let used = self.llm.token_usage().since(&usage_before);
            info!(
                latency_ms = start.elapsed().as_millis() as u64,
                prompt_tokens = used.prompt,
                completion_tokens = used.completion,
                total_tokens = used.total,
                "Total latency"
            );
            answer
        }
        .instrument(span)
        .await
    }

    fn history_for(&self, user_id: &str) -> Vec<Message> {
        self.histories
            .lock()
            .ok()
            .and_then(|h| h.get(user_id).map(|m| m.messages().to_vec()))
            .unwrap_or_default()
    }

    fn remember_exchange(&self, user_id: &str, query: &str, answer: &str) {
        if let Ok(mut histories) = self.histories.lock() {
            let history = histories
                .entry(user_id.to_string())
                .or_insert_with(|| ConversationMemory::new(self.max_context_turns));
            history.push(Message::user(query));
            history.push(Message::assistant(answer));
        }
    }

    async fn run_other(&self, query: &str, user_id: &str, max_turns: usize) -> String {
        let history = self.history_for(user_id);
        let answer = self.orchestrator.run(query, &history, user_id, max_turns).await;
        self.remember_exchange(user_id, query, &answer);
        answer
    }

    async fn list_kak_files(&self) -> Vec<String> {
        match self.executor.execute(LIST_KAK_FILES, Map::new()).await {
            Ok(raw) => parse_file_list(&raw),
            Err(e) => {
                warn!(error = %e, "list_kak_files failed");
                Vec::new()
            }
        }
    }

    /// 解析项目名：推断 slug，与服务器上的 KAK 文件做模糊匹配，找不到则用 slug
    pub async fn resolve_project_name(&self, query: &str) -> String {
        let slug = infer_project_slug(query);
        let files = self.list_kak_files().await;
        best_match(&files, &slug).unwrap_or(slug)
    }

    /// max_turns 为 Some 时覆盖流水线默认轮数
    async fn run_docgen(&self, query: &str, user_id: &str, max_turns: Option<usize>) -> String {
        let project = self.resolve_project_name(query).await;
        info!(project = %project, "running proposal pipeline");

        let run = self.pipeline.run_with_turns(&project, Some(query), max_turns);
        let reply = match tokio::time::timeout(self.pipeline_timeout, run).await {
            Err(_) => {
                error!("proposal pipeline TIMEOUT");
                PIPELINE_TIMEOUT_MESSAGE.to_string()
            }
            Ok(Err(e)) => {
                error!(error = %e, "proposal pipeline error");
                format!("Terjadi kesalahan saat generate proposal: {e}")
            }
            Ok(Ok(outcome)) => match outcome.doc_path() {
                Some(path) => format!("Proposal berhasil dibuat untuk proyek “{project}”.\n\nLokasi file: {path}"),
                None => outcome.message(),
            },
        };

        let exchange = [Message::user(query), Message::assistant(reply.clone())];
        if let Err(e) = self.memory.add_conversation(&exchange, user_id).await {
            error!(error = %e, "memory add_conversation failed");
        }
        self.remember_exchange(user_id, query, &reply);
        reply
    }
}
