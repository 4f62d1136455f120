//! 工具调用主循环
//!
//! 每轮：带完整工具目录、tool_choice=auto 请求补全 → 追加 assistant 轮 → 无工具调用则其文本即最终回答；
//! 否则并发执行本轮全部工具调用（各自超时，失败只影响该调用的结果文本），按原调用顺序追加 tool 轮。
//! 轮数耗尽返回固定提示。无论成功、耗尽还是出错，回答都会写入长期记忆后再返回。

use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{debug, error, info, warn};

use crate::core::AgentError;
use crate::llm::{LlmClient, ToolChoice};
use crate::mcp::ToolDescriptor;
use crate::memory::{truncate_by_tokens, MemoryStore, Message};
use crate::tools::ToolExecutor;

pub const PERSONA_PROMPT: &str = "Anda adalah “ProjectWise”, asisten virtual untuk tim Presales & PM.";
pub const TURN_BUDGET_MESSAGE: &str = "Maaf, saya belum bisa menyelesaikan permintaan dalam batas waktu.";
pub const INTERNAL_FAILURE_MESSAGE: &str = "Maaf, terjadi kegagalan internal.";
pub const NO_ANSWER_MESSAGE: &str = "Tidak ada jawaban.";
const EMPTY_MEMORY_PLACEHOLDER: &str = "[Tidak ada]";

/// 通用多轮工具编排器
pub struct ToolOrchestrator {
    llm: Arc<dyn LlmClient>,
    executor: ToolExecutor,
    memory: Arc<dyn MemoryStore>,
    memory_limit: usize,
    memory_token_budget: usize,
}

impl ToolOrchestrator {
    pub fn new(llm: Arc<dyn LlmClient>, executor: ToolExecutor, memory: Arc<dyn MemoryStore>) -> Self {
        Self {
            llm,
            executor,
            memory,
            memory_limit: 5,
            memory_token_budget: 200,
        }
    }

    /// 注入的记忆条数与每条的 token 上限
    pub fn with_memory_limits(mut self, limit: usize, token_budget: usize) -> Self {
        self.memory_limit = limit;
        self.memory_token_budget = token_budget;
        self
    }

    /// 记忆上下文 system 消息；检索失败时按无记忆处理
    async fn memory_context(&self, query: &str, user_id: &str) -> Message {
        let memories = match self.memory.get_memories(query, user_id, self.memory_limit).await {
            Ok(m) => m,
            Err(e) => {
                error!(error = %e, "memory search error");
                Vec::new()
            }
        };
        let block = if memories.is_empty() {
            EMPTY_MEMORY_PLACEHOLDER.to_string()
        } else {
            memories
                .iter()
                .map(|m| format!("- {}", truncate_by_tokens(m, self.memory_token_budget)))
                .collect::<Vec<_>>()
                .join("\n")
        };
        Message::system(format!(
            "Memori historis relevan:\n{block}\n\nGunakan memori di atas jika membantu."
        ))
    }

    /// 运行一次查询；返回值始终是面向用户的文本
    pub async fn run(&self, query: &str, history: &[Message], user_id: &str, max_turns: usize) -> String {
        let mut messages = Vec::with_capacity(history.len() + 3);
        messages.push(self.memory_context(query, user_id).await);
        messages.push(Message::system(PERSONA_PROMPT));
        messages.extend_from_slice(history);
        messages.push(Message::user(query));

        let tools = match self.executor.session().list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                warn!(error = %e, "tool catalog unavailable, continuing without tools");
                Vec::new()
            }
        };

        let answer = match self.drive(&mut messages, &tools, max_turns).await {
            Ok(Some(answer)) => answer,
            Ok(None) => {
                warn!(max_turns, "turn budget exhausted");
                TURN_BUDGET_MESSAGE.to_string()
            }
            Err(e) => {
                error!(error = %e, "tool loop failed");
                INTERNAL_FAILURE_MESSAGE.to_string()
            }
        };

        self.persist(query, &answer, user_id).await;
        answer
    }

    /// 多轮循环；Ok(None) 表示轮数耗尽
    async fn drive(
        &self,
        messages: &mut Vec<Message>,
        tools: &[ToolDescriptor],
        max_turns: usize,
    ) -> Result<Option<String>, AgentError> {
        for turn in 0..max_turns {
            info!(turn = turn + 1, max_turns, "turn");
            let reply = self.llm.complete(messages, tools, &ToolChoice::Auto).await?;
            messages.push(reply.to_message());

            if !reply.has_tool_calls() {
                let answer = reply
                    .content
                    .filter(|c| !c.trim().is_empty())
                    .unwrap_or_else(|| NO_ANSWER_MESSAGE.to_string());
                return Ok(Some(answer));
            }

            for call in &reply.tool_calls {
                debug!(tool = %call.name, id = %call.id, "tool requested");
            }
            let results = join_all(reply.tool_calls.iter().map(|call| self.executor.execute_call(call))).await;
            for (call, output) in reply.tool_calls.iter().zip(results) {
                messages.push(Message::tool(call.id.clone(), call.name.clone(), output));
            }
        }
        Ok(None)
    }

    async fn persist(&self, query: &str, answer: &str, user_id: &str) {
        let exchange = [Message::user(query), Message::assistant(answer)];
        if let Err(e) = self.memory.add_conversation(&exchange, user_id).await {
            error!(error = %e, "memory add_conversation failed");
        }
    }
}
