//! 提案文档生成流水线
//!
//! 有限状态机：read_project_markdown → get_template_placeholders → 上下文 JSON 校验 → generate_proposal_docx。
//! 每个状态首次尝试强制指定工具，失败后允许重试一次（改为 auto），再失败即以文本结束。
//! 工具调用经 ToolExecutor（信号量限制并发、单次超时），失败转为 `{"status":"failure",...}` 结果交给状态机。

use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::core::{AgentError, McpError};
use crate::llm::{LlmClient, ToolChoice};
use crate::memory::{Message, ToolCallRequest};
use crate::tools::{ToolExecutor, ToolPayload};
use crate::workflow::types::{
    PipelineOutcome, PipelineState, RetryCounters, CONTEXT_STEP, GENERATE_PROPOSAL_DOCX,
    GET_TEMPLATE_PLACEHOLDERS, READ_PROJECT_MARKDOWN,
};

pub const PLACEHOLDERS_INCOMPLETE_MESSAGE: &str = "Placeholder masih belum lengkap setelah 2× percobaan.";
const PROJECT_NOT_FOUND_MESSAGE: &str = "Dokumen proyek tidak ditemukan.";
const PLACEHOLDERS_FAILED_MESSAGE: &str = "Gagal mengambil daftar placeholder template.";
const GENERATION_FAILED_MESSAGE: &str = "Gagal membuat proposal.";

const PROPOSAL_GUIDELINES: &str = "Anda adalah \"ProjectWise\", asisten virtual untuk tim Presales & Project Manager.\n\
Tugas: buat file proposal .docx dari template dan context proyek. \
1. read_project_markdown(project_name) simpan raw_context; \
2. get_template_placeholders() simpan placeholders; \
3. isi setiap placeholder dari raw_context dan kembalikan sebagai satu objek JSON; \
4. generate_proposal_docx(context, override_template) kembalikan path file. \
Validasi: semua placeholder harus ada; list gunakan array; jangan sebut nama tool.";

/// 去掉 .md / .txt 后缀（大小写不敏感）
pub fn normalize_project_name(name: &str) -> String {
    let trimmed = name.trim();
    let lower = trimmed.to_lowercase();
    for ext in [".md", ".txt"] {
        if lower.ends_with(ext) {
            return trimmed[..trimmed.len() - ext.len()].to_string();
        }
    }
    trimmed.to_string()
}

/// 去掉 ```json 代码块包裹
fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

/// 校验上下文 JSON：必须是对象且包含全部占位符；不完整时返回缺失的键
pub fn context_gaps(content: &str, placeholders: &[String]) -> Result<(), Vec<String>> {
    match serde_json::from_str::<Value>(strip_code_fence(content)) {
        Ok(Value::Object(map)) => {
            let missing: Vec<String> = placeholders
                .iter()
                .filter(|p| !map.contains_key(p.as_str()))
                .cloned()
                .collect();
            if missing.is_empty() {
                Ok(())
            } else {
                Err(missing)
            }
        }
        _ => Err(placeholders.to_vec()),
    }
}

/// 提案文档生成流水线
pub struct DocGenPipeline {
    llm: Arc<dyn LlmClient>,
    executor: ToolExecutor,
    max_turns: usize,
    override_template: Option<String>,
}

impl DocGenPipeline {
    pub fn new(llm: Arc<dyn LlmClient>, executor: ToolExecutor) -> Self {
        Self {
            llm,
            executor,
            max_turns: 12,
            override_template: None,
        }
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_override_template(mut self, template: Option<String>) -> Self {
        self.override_template = template;
        self
    }

    fn tool_choice(state: PipelineState, retries: &RetryCounters) -> ToolChoice {
        match state.forced_tool() {
            Some(tool) if retries.attempts(tool) == 0 => ToolChoice::Forced(tool.to_string()),
            _ => ToolChoice::Auto,
        }
    }

    /// 解析参数并补默认值；参数不是合法 JSON 对象时返回失败信封
    fn prepare_args(&self, call: &ToolCallRequest, project: &str) -> Result<Map<String, Value>, String> {
        let mut args = call
            .parsed_arguments()
            .map_err(|e| McpError::InvalidArguments(e).to_string())?;
        if call.name == READ_PROJECT_MARKDOWN {
            args.entry("project_name")
                .or_insert_with(|| Value::String(project.to_string()));
        } else if call.name == GENERATE_PROPOSAL_DOCX {
            if let Some(template) = &self.override_template {
                args.entry("override_template")
                    .or_insert_with(|| Value::String(template.clone()));
            }
        }
        Ok(args)
    }

    async fn call_tool(&self, name: &str, args: Result<Map<String, Value>, String>) -> String {
        let args = match args {
            Ok(args) => args,
            Err(e) => return ToolPayload::failure(e).to_value().to_string(),
        };
        info!(tool = name, "calling pipeline tool");
        match self.executor.execute(name, args).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(tool = name, error = %e, "pipeline tool failed");
                ToolPayload::failure(e.to_string()).to_value().to_string()
            }
        }
    }

    /// 运行流水线；补全服务或工具目录不可用时返回 Err，由调用方转为文本
    pub async fn run(&self, project_name: &str, user_query: Option<&str>) -> Result<PipelineOutcome, AgentError> {
        self.run_with_turns(project_name, user_query, None).await
    }

    /// 同 run，max_turns 为 Some 时覆盖默认轮数
    pub async fn run_with_turns(
        &self,
        project_name: &str,
        user_query: Option<&str>,
        max_turns: Option<usize>,
    ) -> Result<PipelineOutcome, AgentError> {
        let max_turns = max_turns.unwrap_or(self.max_turns);
        let project = normalize_project_name(project_name);
        let system = Message::system(PROPOSAL_GUIDELINES);
        let first = user_query
            .map(str::to_string)
            .unwrap_or_else(|| format!("Buatkan proposal untuk proyek '{project}'. Ikuti prosedur."));
        let mut messages = vec![system.clone(), Message::user(first)];

        let mut state = PipelineState::Initial;
        let mut placeholders: Vec<String> = Vec::new();
        let mut doc_path: Option<String> = None;
        let mut retries = RetryCounters::new();

        for turn in 0..max_turns {
            info!(turn = turn + 1, max_turns, state = state.as_str(), "pipeline turn");

            let choice = Self::tool_choice(state, &retries);
            let tools = self.executor.session().list_tools().await?;
            let reply = self.llm.complete(&messages, &tools, &choice).await?;
            messages.push(reply.to_message());

            if !reply.has_tool_calls() {
                let content = reply.content.unwrap_or_default();
                match state {
                    PipelineState::PlaceholdersObtained => match context_gaps(&content, &placeholders) {
                        Ok(()) => {
                            messages = vec![system.clone(), Message::user(content)];
                            state = PipelineState::ContextSent;
                        }
                        Err(missing) => {
                            if !retries.record_failure(CONTEXT_STEP) {
                                return Ok(PipelineOutcome::Failed(PLACEHOLDERS_INCOMPLETE_MESSAGE.to_string()));
                            }
                            warn!(?missing, "context JSON incomplete");
                            messages.push(Message::user(format!(
                                "Beberapa placeholder masih kosong: {missing:?}. Mohon lengkapi JSON context sepenuhnya."
                            )));
                        }
                    },
                    PipelineState::DocSaved => {
                        let message = if content.trim().is_empty() {
                            format!("Proposal berhasil dibuat di {}", doc_path.as_deref().unwrap_or_default())
                        } else {
                            content
                        };
                        return Ok(PipelineOutcome::Completed { doc_path, message });
                    }
                    _ => {}
                }
                continue;
            }

            let prepared: Vec<_> = reply
                .tool_calls
                .iter()
                .map(|call| self.prepare_args(call, &project))
                .collect();
            let raws = join_all(
                reply
                    .tool_calls
                    .iter()
                    .zip(prepared)
                    .map(|(call, args)| self.call_tool(&call.name, args)),
            )
            .await;

            for (call, raw) in reply.tool_calls.iter().zip(&raws) {
                messages.push(Message::tool(call.id.clone(), call.name.clone(), raw.clone()));
            }

            for (call, raw) in reply.tool_calls.iter().zip(&raws) {
                let name = call.name.as_str();
                let payload = if name == GENERATE_PROPOSAL_DOCX {
                    ToolPayload::parse_generated_path(raw)
                } else {
                    ToolPayload::parse(raw)
                };

                if name == READ_PROJECT_MARKDOWN && state == PipelineState::Initial {
                    if !payload.is_success() {
                        if retries.record_failure(name) {
                            break;
                        }
                        let reason = payload.error().unwrap_or(PROJECT_NOT_FOUND_MESSAGE);
                        return Ok(PipelineOutcome::Failed(reason.to_string()));
                    }
                    messages.push(Message::user(payload.text().unwrap_or_default()));
                    state = PipelineState::RawReady;
                } else if name == GET_TEMPLATE_PLACEHOLDERS && state == PipelineState::RawReady {
                    if payload.is_failure() {
                        if retries.record_failure(name) {
                            break;
                        }
                        let reason = payload.error().unwrap_or(PLACEHOLDERS_FAILED_MESSAGE);
                        return Ok(PipelineOutcome::Failed(reason.to_string()));
                    }
                    placeholders = payload.placeholders().unwrap_or_default();
                    messages.push(Message::user(format!("Daftar placeholder: {placeholders:?}")));
                    state = PipelineState::PlaceholdersObtained;
                } else if name == GENERATE_PROPOSAL_DOCX {
                    if !payload.is_success() {
                        if retries.record_failure(name) {
                            state = PipelineState::ContextSent;
                            break;
                        }
                        let reason = payload.error().unwrap_or(GENERATION_FAILED_MESSAGE);
                        return Ok(PipelineOutcome::Failed(reason.to_string()));
                    }
                    doc_path = payload.path().map(str::to_string);
                    state = PipelineState::DocSaved;
                }
            }
        }

        warn!(max_turns, "pipeline reached max turns");
        Ok(PipelineOutcome::Exhausted { doc_path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{McpError, TaskScheduler};
    use crate::llm::{AssistantTurn, MockLlmClient};
    use crate::mcp::mock::{MockConnector, MockToolServer};
    use crate::mcp::{SessionConfig, SessionManager};
    use crate::memory::Role;

    fn call(id: &str, name: &str, args: &str) -> AssistantTurn {
        AssistantTurn::with_tool_calls(vec![ToolCallRequest::new(id, name, args)])
    }

    fn pipeline(server: Arc<MockToolServer>, llm: Arc<MockLlmClient>) -> DocGenPipeline {
        let session = SessionManager::new(Arc::new(MockConnector::new(server)), SessionConfig::default());
        let executor = ToolExecutor::new(session, 30).with_scheduler(TaskScheduler::new(5));
        DocGenPipeline::new(llm, executor)
    }

    fn happy_server() -> Arc<MockToolServer> {
        let server = Arc::new(MockToolServer::with_default_tools());
        server.set_default(READ_PROJECT_MARKDOWN, r#"{"status":"success","text":"T"}"#);
        server.set_default(GET_TEMPLATE_PLACEHOLDERS, r#"{"placeholders":["a","b"]}"#);
        server.set_default(GENERATE_PROPOSAL_DOCX, r#"{"status":"success","path":"/out.docx"}"#);
        server
    }

    #[test]
    fn test_normalize_project_name() {
        assert_eq!(normalize_project_name("Proyek_A.md"), "Proyek_A");
        assert_eq!(normalize_project_name("Proyek_B.TXT"), "Proyek_B");
        assert_eq!(normalize_project_name("Proyek_C"), "Proyek_C");
    }

    #[test]
    fn test_context_gaps() {
        let ph = vec!["a".to_string(), "b".to_string()];
        assert!(context_gaps(r#"{"a":"x","b":"y"}"#, &ph).is_ok());
        assert!(context_gaps("```json\n{\"a\":\"x\",\"b\":\"y\"}\n```", &ph).is_ok());
        assert_eq!(context_gaps(r#"{"a":"x"}"#, &ph), Err(vec!["b".to_string()]));
        assert_eq!(context_gaps("bukan json", &ph), Err(ph.clone()));
    }

    #[tokio::test]
    async fn test_happy_path_reaches_doc_saved() {
        let server = happy_server();
        let llm = Arc::new(MockLlmClient::new());
        llm.push_turn(call("c1", READ_PROJECT_MARKDOWN, "{}"))
            .push_turn(call("c2", GET_TEMPLATE_PLACEHOLDERS, "{}"))
            .push_turn(AssistantTurn::text(r#"{"a":"x","b":"y"}"#))
            .push_turn(call("c3", GENERATE_PROPOSAL_DOCX, r#"{"context":{"a":"x","b":"y"}}"#))
            .push_turn(AssistantTurn::text(""));
        let p = pipeline(server.clone(), llm.clone());

        let outcome = p.run("Proyek_A.md", None).await.unwrap();
        assert_eq!(outcome.doc_path(), Some("/out.docx"));
        assert!(outcome.message().contains("/out.docx"));

        let requests = llm.requests();
        assert_eq!(
            requests[0].tool_choice,
            Some(ToolChoice::Forced(READ_PROJECT_MARKDOWN.to_string()))
        );
        assert_eq!(
            requests[1].tool_choice,
            Some(ToolChoice::Forced(GET_TEMPLATE_PLACEHOLDERS.to_string()))
        );
        // 上下文完整后对话被重置为 system + context
        assert_eq!(requests[3].messages.len(), 2);
        assert_eq!(requests[3].messages[1].content, r#"{"a":"x","b":"y"}"#);
        assert_eq!(requests[3].messages[1].role, Role::User);

        // project_name 默认值
        let read_call = server
            .calls()
            .into_iter()
            .find(|(name, _)| name == READ_PROJECT_MARKDOWN)
            .unwrap();
        assert_eq!(read_call.1["project_name"], "Proyek_A");
        p.executor.session().cleanup().await;
    }

    #[tokio::test]
    async fn test_incomplete_context_twice_fails_without_third_attempt() {
        let server = happy_server();
        let llm = Arc::new(MockLlmClient::new());
        llm.push_turn(call("c1", READ_PROJECT_MARKDOWN, "{}"))
            .push_turn(call("c2", GET_TEMPLATE_PLACEHOLDERS, "{}"))
            .push_turn(AssistantTurn::text(r#"{"a":"x"}"#))
            .push_turn(AssistantTurn::text(r#"{"a":"x"}"#))
            .push_turn(AssistantTurn::text(r#"{"a":"x","b":"y"}"#));
        let p = pipeline(server, llm.clone());

        let outcome = p.run("Proyek_A", None).await.unwrap();
        assert_eq!(outcome.message(), PLACEHOLDERS_INCOMPLETE_MESSAGE);
        assert_eq!(llm.request_count(), 4);

        let correction = &llm.requests()[3].messages;
        let last = correction.last().map(|m| m.content.clone()).unwrap_or_default();
        assert!(last.starts_with("Beberapa placeholder masih kosong"));
        assert!(last.contains("\"b\""));
        p.executor.session().cleanup().await;
    }

    #[tokio::test]
    async fn test_read_failure_retries_once_with_auto() {
        let server = happy_server();
        server.push_response(READ_PROJECT_MARKDOWN, Ok(r#"{"status":"failure","error":"not found"}"#.into()));
        server.push_response(READ_PROJECT_MARKDOWN, Err(McpError::Tool("still missing".into())));
        let llm = Arc::new(MockLlmClient::new());
        llm.push_turn(call("c1", READ_PROJECT_MARKDOWN, "{}"))
            .push_turn(call("c2", READ_PROJECT_MARKDOWN, "{}"));
        let p = pipeline(server, llm.clone());

        let outcome = p.run("X", None).await.unwrap();
        assert!(matches!(outcome, PipelineOutcome::Failed(_)));
        assert!(outcome.message().contains("still missing"));
        assert_eq!(llm.requests()[1].tool_choice, Some(ToolChoice::Auto));
        p.executor.session().cleanup().await;
    }

    #[tokio::test]
    async fn test_bare_path_from_generator() {
        let server = happy_server();
        server.set_default(GENERATE_PROPOSAL_DOCX, "/srv/out/proposal.docx");
        server.set_default(GET_TEMPLATE_PLACEHOLDERS, r#"["a"]"#);
        let llm = Arc::new(MockLlmClient::new());
        llm.push_turn(call("c1", READ_PROJECT_MARKDOWN, "{}"))
            .push_turn(call("c2", GET_TEMPLATE_PLACEHOLDERS, "{}"))
            .push_turn(call("c3", GENERATE_PROPOSAL_DOCX, r#"{"context":{"a":"x"}}"#))
            .push_turn(AssistantTurn::text("Selesai."));
        let p = pipeline(server, llm)
            .with_override_template(Some("tpl.docx".into()));

        let outcome = p.run("X", None).await.unwrap();
        assert_eq!(
            outcome,
            PipelineOutcome::Completed {
                doc_path: Some("/srv/out/proposal.docx".into()),
                message: "Selesai.".into(),
            }
        );
        p.executor.session().cleanup().await;
    }

    #[tokio::test]
    async fn test_generation_failure_twice() {
        let server = happy_server();
        server.set_default(GENERATE_PROPOSAL_DOCX, r#"{"status":"failure"}"#);
        let llm = Arc::new(MockLlmClient::new());
        llm.push_turn(call("c1", READ_PROJECT_MARKDOWN, "{}"))
            .push_turn(call("c2", GET_TEMPLATE_PLACEHOLDERS, "{}"))
            .push_turn(call("c3", GENERATE_PROPOSAL_DOCX, "{}"))
            .push_turn(call("c4", GENERATE_PROPOSAL_DOCX, "{}"));
        let p = pipeline(server, llm);

        let outcome = p.run("X", None).await.unwrap();
        assert_eq!(outcome, PipelineOutcome::Failed("Gagal membuat proposal.".into()));
        p.executor.session().cleanup().await;
    }

    #[tokio::test]
    async fn test_max_turns_exhausted() {
        let server = happy_server();
        let llm = Arc::new(MockLlmClient::new());
        llm.set_fallback(AssistantTurn::text("hmm"));
        let p = pipeline(server, llm.clone()).with_max_turns(3);

        let outcome = p.run("X", None).await.unwrap();
        assert_eq!(outcome, PipelineOutcome::Exhausted { doc_path: None });
        assert_eq!(llm.request_count(), 3);
        p.executor.session().cleanup().await;
    }

    #[tokio::test]
    async fn test_placeholder_failure_retries_once() {
        let server = happy_server();
        for _ in 0..2 {
            server.push_response(
                GET_TEMPLATE_PLACEHOLDERS,
                Ok(r#"{"status":"error","error":"template hilang"}"#.into()),
            );
        }
        let llm = Arc::new(MockLlmClient::new());
        llm.push_turn(call("c1", READ_PROJECT_MARKDOWN, "{}"))
            .push_turn(call("c2", GET_TEMPLATE_PLACEHOLDERS, "{}"))
            .push_turn(call("c3", GET_TEMPLATE_PLACEHOLDERS, "{}"));
        let p = pipeline(server.clone(), llm.clone());

        let outcome = p.run("X", None).await.unwrap();
        assert_eq!(outcome, PipelineOutcome::Failed("template hilang".into()));
        assert_eq!(server.calls_to(GET_TEMPLATE_PLACEHOLDERS), 2);
        assert_eq!(llm.request_count(), 3);
        let requests = llm.requests();
        assert_eq!(
            requests[1].tool_choice,
            Some(ToolChoice::Forced(GET_TEMPLATE_PLACEHOLDERS.to_string()))
        );
        assert_eq!(requests[2].tool_choice, Some(ToolChoice::Auto));
        p.executor.session().cleanup().await;
    }

    #[tokio::test]
    async fn test_placeholder_failure_without_reason() {
        let server = happy_server();
        server.set_default(GET_TEMPLATE_PLACEHOLDERS, r#"{"status":"failure"}"#);
        let llm = Arc::new(MockLlmClient::new());
        llm.push_turn(call("c1", READ_PROJECT_MARKDOWN, "{}"))
            .push_turn(call("c2", GET_TEMPLATE_PLACEHOLDERS, "{}"))
            .push_turn(call("c3", GET_TEMPLATE_PLACEHOLDERS, "{}"));
        let p = pipeline(server.clone(), llm);

        let outcome = p.run("X", None).await.unwrap();
        assert_eq!(
            outcome,
            PipelineOutcome::Failed("Gagal mengambil daftar placeholder template.".into())
        );
        assert_eq!(server.calls_to(GET_TEMPLATE_PLACEHOLDERS), 2);
        p.executor.session().cleanup().await;
    }

    #[tokio::test]
    async fn test_turn_override() {
        let server = happy_server();
        let llm = Arc::new(MockLlmClient::new());
        llm.set_fallback(AssistantTurn::text("hmm"));
        let p = pipeline(server, llm.clone());

        let outcome = p.run_with_turns("X", None, Some(2)).await.unwrap();
        assert_eq!(outcome, PipelineOutcome::Exhausted { doc_path: None });
        assert_eq!(llm.request_count(), 2);
        p.executor.session().cleanup().await;
    }
}
