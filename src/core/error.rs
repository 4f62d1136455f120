//! 错误类型
//!
//! 按来源划分三层：McpError（工具服务器会话/传输）、LlmError（补全服务）、AgentError（编排层，
//! 汇总前两者并补充工具超时、流水线超时等）。面向用户的失败始终转为文本，不向上抛出底层异常。

use thiserror::Error;

/// MCP 会话与传输层错误
#[derive(Error, Debug, Clone)]
pub enum McpError {
    /// 底层流已关闭（连接断开、服务端关闭会话）；可通过一次重连重试恢复
    #[error("MCP stream closed: {0}")]
    StreamClosed(String),

    /// 调用方显式断开且关闭了自动重连，不做任何网络操作
    #[error("MCP session manually disconnected")]
    ManuallyDisconnected,

    #[error("MCP session not connected")]
    NotConnected,

    #[error("MCP handshake failed: {0}")]
    Handshake(String),

    #[error("MCP transport error: {0}")]
    Transport(String),

    #[error("MCP request timed out: {0}")]
    Timeout(String),

    /// 服务端返回 isError 的工具结果
    #[error("MCP tool error: {0}")]
    Tool(String),

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),
}

impl McpError {
    /// 是否属于「流已关闭」类故障（重连后可重试）
    pub fn is_stream_closed(&self) -> bool {
        matches!(self, McpError::StreamClosed(_))
    }

    /// 关闭过程中的良性结果：流正在关闭 / 已关闭、任务被取消。清理与心跳中只记录 debug，不视为错误
    pub fn is_benign_shutdown(&self) -> bool {
        match self {
            McpError::StreamClosed(_) => true,
            McpError::Transport(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("cancel") || msg.contains("closing") || msg.contains("already closed")
            }
            _ => false,
        }
    }
}

/// 补全服务错误
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    #[error("LLM request failed: {0}")]
    Request(String),

    #[error("LLM returned no choices")]
    EmptyResponse,

    #[error("LLM output parse error: {0}")]
    Parse(String),

    #[error("LLM request build error: {0}")]
    Build(String),
}

/// 编排层错误（工具调用循环、文档流水线、意图识别）
#[derive(Error, Debug)]
pub enum AgentError {
    #[error(transparent)]
    Mcp(#[from] McpError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_closed_is_benign() {
        let err = McpError::StreamClosed("eof".into());
        assert!(err.is_stream_closed());
        assert!(err.is_benign_shutdown());
    }

    #[test]
    fn test_transport_closing_is_benign() {
        assert!(McpError::Transport("stream already closing".into()).is_benign_shutdown());
        assert!(McpError::Transport("task Cancelled".into()).is_benign_shutdown());
        assert!(!McpError::Transport("connection refused".into()).is_benign_shutdown());
    }

    #[test]
    fn test_tool_error_not_stream_closed() {
        let err = McpError::Tool("boom".into());
        assert!(!err.is_stream_closed());
        assert!(!err.is_benign_shutdown());
    }

    #[test]
    fn test_agent_error_from_mcp() {
        let err: AgentError = McpError::ManuallyDisconnected.into();
        assert_eq!(err.to_string(), "MCP session manually disconnected");
    }
}
