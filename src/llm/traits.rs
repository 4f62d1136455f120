//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient：complete（带工具定义的对话补全）、
//! complete_structured（按 JSON Schema 输出结构化结果）。

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::core::LlmError;
use crate::mcp::ToolDescriptor;
use crate::memory::{Message, ToolCallRequest};

/// 工具选择策略
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ToolChoice {
    /// 由模型决定是否调用工具
    #[default]
    Auto,
    /// 强制调用指定工具
    Forced(String),
}

/// 一次补全的 assistant 输出：文本与（可能为空的）工具调用列表
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssistantTurn {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
}

impl AssistantTurn {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn with_tool_calls(tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            content: None,
            tool_calls,
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// 转为可追加进对话的 assistant 消息
    pub fn to_message(&self) -> Message {
        let content = self.content.clone().unwrap_or_default();
        if self.tool_calls.is_empty() {
            Message::assistant(content)
        } else {
            Message::assistant_with_tools(content, self.tool_calls.clone())
        }
    }
}

/// token 用量（累计值或两次快照之差）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
}

impl TokenUsage {
    pub fn new(prompt: u64, completion: u64) -> Self {
        Self {
            prompt,
            completion,
            total: prompt + completion,
        }
    }

    /// 相对更早快照的增量
    pub fn since(&self, earlier: &TokenUsage) -> TokenUsage {
        TokenUsage::new(
            self.prompt.saturating_sub(earlier.prompt),
            self.completion.saturating_sub(earlier.completion),
        )
    }
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 对话补全；tools 为空时不附带工具定义
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolDescriptor],
        tool_choice: &ToolChoice,
    ) -> Result<AssistantTurn, LlmError>;

    /// 结构化输出：返回符合 schema 的 JSON 文本
    async fn complete_structured(
        &self,
        messages: &[Message],
        schema_name: &str,
        schema: Value,
    ) -> Result<String, LlmError>;

    /// 自创建以来累计的 token 用量；不上报用量的实现保持默认的全零
    fn token_usage(&self) -> TokenUsage {
        TokenUsage::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Role;

    #[test]
    fn test_turn_to_message() {
        let turn = AssistantTurn::with_tool_calls(vec![ToolCallRequest::new("c1", "websearch", "{}")]);
        let msg = turn.to_message();
        assert_eq!(msg.role, Role::Assistant);
        assert_eq!(msg.tool_calls.len(), 1);
        assert!(msg.content.is_empty());

        let msg = AssistantTurn::text("halo").to_message();
        assert!(msg.tool_calls.is_empty());
        assert_eq!(msg.content, "halo");
    }

    #[test]
    fn test_usage_since_snapshot() {
        let before = TokenUsage::new(100, 10);
        let after = TokenUsage::new(160, 25);
        assert_eq!(after.since(&before), TokenUsage::new(60, 15));
        assert_eq!(before.since(&after), TokenUsage::default());
    }
}
