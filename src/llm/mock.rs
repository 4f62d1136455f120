//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按顺序返回预置的补全结果，并记录每次请求（消息、工具名、tool_choice），便于断言编排流程。
//! 队列耗尽后返回 fallback（若设置），否则返回空文本。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::LlmError;
use crate::llm::{AssistantTurn, LlmClient, TokenUsage, ToolChoice};
use crate::mcp::ToolDescriptor;
use crate::memory::Message;

/// 一次被记录的补全请求
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub messages: Vec<Message>,
    pub tool_names: Vec<String>,
    pub tool_choice: Option<ToolChoice>,
    pub schema_name: Option<String>,
}

/// 脚本化 Mock 客户端
#[derive(Debug, Default)]
pub struct MockLlmClient {
    turns: Mutex<VecDeque<Result<AssistantTurn, LlmError>>>,
    structured: Mutex<VecDeque<Result<String, LlmError>>>,
    fallback: Mutex<Option<AssistantTurn>>,
    requests: Mutex<Vec<RecordedRequest>>,
    per_request_usage: Mutex<TokenUsage>,
    usage: Mutex<TokenUsage>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_turn(&self, turn: AssistantTurn) -> &Self {
        if let Ok(mut q) = self.turns.lock() {
            q.push_back(Ok(turn));
        }
        self
    }

    pub fn push_error(&self, err: LlmError) -> &Self {
        if let Ok(mut q) = self.turns.lock() {
            q.push_back(Err(err));
        }
        self
    }

    pub fn push_structured(&self, result: Result<String, LlmError>) -> &Self {
        if let Ok(mut q) = self.structured.lock() {
            q.push_back(result);
        }
        self
    }

    /// 队列耗尽后重复返回的结果
    pub fn set_fallback(&self, turn: AssistantTurn) {
        if let Ok(mut f) = self.fallback.lock() {
            *f = Some(turn);
        }
    }

    /// 之后每次请求计入的 token 用量
    pub fn set_usage_per_request(&self, prompt: u64, completion: u64) {
        if let Ok(mut u) = self.per_request_usage.lock() {
            *u = TokenUsage::new(prompt, completion);
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    fn record(&self, request: RecordedRequest) {
        if let Ok(mut r) = self.requests.lock() {
            r.push(request);
        }
        let step = self.per_request_usage.lock().map(|u| *u).unwrap_or_default();
        if let Ok(mut usage) = self.usage.lock() {
            *usage = TokenUsage::new(usage.prompt + step.prompt, usage.completion + step.completion);
        }
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    fn token_usage(&self) -> TokenUsage {
        self.usage.lock().map(|u| *u).unwrap_or_default()
    }

    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolDescriptor],
        tool_choice: &ToolChoice,
    ) -> Result<AssistantTurn, LlmError> {
        self.record(RecordedRequest {
            messages: messages.to_vec(),
            tool_names: tools.iter().map(|t| t.name.clone()).collect(),
            tool_choice: Some(tool_choice.clone()),
            schema_name: None,
        });

        if let Some(next) = self.turns.lock().ok().and_then(|mut q| q.pop_front()) {
            return next;
        }
        let fallback = self.fallback.lock().ok().and_then(|f| f.clone());
        Ok(fallback.unwrap_or_else(|| AssistantTurn::text("")))
    }

    async fn complete_structured(
        &self,
        messages: &[Message],
        schema_name: &str,
        _schema: Value,
    ) -> Result<String, LlmError> {
        self.record(RecordedRequest {
            messages: messages.to_vec(),
            tool_names: Vec::new(),
            tool_choice: None,
            schema_name: Some(schema_name.to_string()),
        });

        self.structured
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .unwrap_or(Err(LlmError::EmptyResponse))
    }
}
