//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）。请求体按 chat/completions 线格式
//! 自行组装（含 tools / tool_choice / response_format），经 byot 接口发送，响应解析为 AssistantTurn。

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::Client;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::core::LlmError;
use crate::llm::{AssistantTurn, LlmClient, TokenUsage, ToolChoice};
use crate::mcp::ToolDescriptor;
use crate::memory::{Message, Role, ToolCallRequest};

/// 响应 usage 字段的累加器
#[derive(Debug, Default)]
struct UsageCounter {
    prompt: AtomicU64,
    completion: AtomicU64,
}

impl UsageCounter {
    fn record(&self, usage: &Usage) {
        self.prompt.fetch_add(usage.prompt_tokens, Ordering::Relaxed);
        self.completion.fetch_add(usage.completion_tokens, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TokenUsage {
        TokenUsage::new(
            self.prompt.load(Ordering::Relaxed),
            self.completion.load(Ordering::Relaxed),
        )
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// OpenAI 兼容客户端：持有 Client、model 名与采样温度
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    temperature: f32,
    request_timeout: Duration,
    usage: UsageCounter,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            temperature: 0.0,
            request_timeout: Duration::from_secs(60),
            usage: UsageCounter::default(),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn send(&self, body: Value) -> Result<ResponseMessage, LlmError> {
        let chat = self.client.chat();
        let fut = chat.create_byot::<Value, ChatResponse>(body);
        let response = tokio::time::timeout(self.request_timeout, fut)
            .await
            .map_err(|_| LlmError::Request(format!("request exceeded {:?}", self.request_timeout)))?
            .map_err(|e| LlmError::Request(e.to_string()))?;

        if let Some(usage) = &response.usage {
            self.usage.record(usage);
        }

        response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or(LlmError::EmptyResponse)
    }
}

/// Message → chat/completions 消息
pub(crate) fn to_wire_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| match m.role {
            Role::System | Role::User => json!({ "role": m.role.as_str(), "content": m.content }),
            Role::Assistant if m.tool_calls.is_empty() => {
                json!({ "role": "assistant", "content": m.content })
            }
            Role::Assistant => {
                let calls: Vec<Value> = m
                    .tool_calls
                    .iter()
                    .map(|c| {
                        json!({
                            "id": c.id,
                            "type": "function",
                            "function": { "name": c.name, "arguments": c.arguments },
                        })
                    })
                    .collect();
                let content = if m.content.is_empty() {
                    Value::Null
                } else {
                    Value::String(m.content.clone())
                };
                json!({ "role": "assistant", "content": content, "tool_calls": calls })
            }
            Role::Tool => json!({
                "role": "tool",
                "tool_call_id": m.tool_call_id.clone().unwrap_or_default(),
                "content": m.content,
            }),
        })
        .collect()
}

/// ToolDescriptor → function 工具定义
pub(crate) fn to_wire_tools(tools: &[ToolDescriptor]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.input_schema,
                },
            })
        })
        .collect()
}

pub(crate) fn to_wire_tool_choice(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Auto => json!("auto"),
        ToolChoice::Forced(name) => json!({ "type": "function", "function": { "name": name } }),
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn token_usage(&self) -> TokenUsage {
        self.usage.snapshot()
    }

    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolDescriptor],
        tool_choice: &ToolChoice,
    ) -> Result<AssistantTurn, LlmError> {
        let mut body = json!({
            "model": self.model,
            "messages": to_wire_messages(messages),
            "temperature": self.temperature,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(to_wire_tools(tools));
            body["tool_choice"] = to_wire_tool_choice(tool_choice);
        }

        let message = self.send(body).await?;
        let tool_calls = message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|c| ToolCallRequest::new(c.id, c.function.name, c.function.arguments))
            .collect();

        Ok(AssistantTurn {
            content: message.content,
            tool_calls,
        })
    }

    async fn complete_structured(
        &self,
        messages: &[Message],
        schema_name: &str,
        schema: Value,
    ) -> Result<String, LlmError> {
        let body = json!({
            "model": self.model,
            "messages": to_wire_messages(messages),
            "temperature": self.temperature,
            "response_format": {
                "type": "json_schema",
                "json_schema": { "name": schema_name, "schema": schema },
            },
        });

        let message = self.send(body).await?;
        message
            .content
            .filter(|c| !c.trim().is_empty())
            .ok_or(LlmError::EmptyResponse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_messages_tool_round() {
        let messages = vec![
            Message::system("sys"),
            Message::assistant_with_tools("", vec![ToolCallRequest::new("c1", "websearch", r#"{"query":"x"}"#)]),
            Message::tool("c1", "websearch", "hasil"),
        ];
        let wire = to_wire_messages(&messages);
        assert_eq!(wire[0]["role"], "system");
        assert!(wire[1]["content"].is_null());
        assert_eq!(wire[1]["tool_calls"][0]["function"]["name"], "websearch");
        assert_eq!(wire[2]["tool_call_id"], "c1");
    }

    #[test]
    fn test_forced_tool_choice() {
        let v = to_wire_tool_choice(&ToolChoice::Forced("read_project_markdown".into()));
        assert_eq!(v["function"]["name"], "read_project_markdown");
        assert_eq!(to_wire_tool_choice(&ToolChoice::Auto), json!("auto"));
    }

    #[test]
    fn test_wire_tools() {
        let tools = vec![ToolDescriptor::no_args("heartbeat", "ping")];
        let wire = to_wire_tools(&tools);
        assert_eq!(wire[0]["type"], "function");
        assert_eq!(wire[0]["function"]["parameters"]["type"], "object");
    }

    #[test]
    fn test_response_without_tool_calls() {
        let raw = r#"{"choices":[{"message":{"role":"assistant","content":"hai","tool_calls":null}}],"usage":{"prompt_tokens":3,"completion_tokens":1}}"#;
        let resp: ChatResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.choices[0].message.content.as_deref(), Some("hai"));
        assert!(resp.choices[0].message.tool_calls.is_none());
    }

    #[test]
    fn test_usage_accumulates_across_responses() {
        let counter = UsageCounter::default();
        let first: ChatResponse =
            serde_json::from_value(json!({"choices": [], "usage": {"prompt_tokens": 120, "completion_tokens": 8}}))
                .unwrap();
        let second: ChatResponse =
            serde_json::from_value(json!({"choices": [], "usage": {"prompt_tokens": 30}})).unwrap();
        for response in [&first, &second] {
            if let Some(usage) = &response.usage {
                counter.record(usage);
            }
        }
        assert_eq!(counter.snapshot(), TokenUsage::new(150, 8));
        assert_eq!(counter.snapshot().total, 158);
    }
}
