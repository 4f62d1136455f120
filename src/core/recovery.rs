//! 错误恢复策略
//!
//! RecoveryEngine 根据 McpError 决定会话层的动作（重连重试 / 标记断开 / 立即失败）；
//! RetryPolicy 给出有限次数的指数退避（意图识别等对补全服务的调用使用）。

use std::time::Duration;

use crate::core::McpError;

/// 会话层对一次失败调用的处理动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 流已关闭：重连一次后重试同一调用
    ReconnectAndRetry,
    /// 其它故障：清除连接标志，把错误交还给调用方
    MarkDisconnected,
    /// 不可恢复且不应触碰会话状态（手动断开、参数错误、工具自身报错）
    FailFast,
}

/// 将 MCP 错误映射为恢复动作
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &McpError) -> RecoveryAction {
        match err {
            McpError::StreamClosed(_) => RecoveryAction::ReconnectAndRetry,
            McpError::ManuallyDisconnected
            | McpError::InvalidArguments(_)
            | McpError::Tool(_) => RecoveryAction::FailFast,
            McpError::NotConnected
            | McpError::Handshake(_)
            | McpError::Transport(_)
            | McpError::Timeout(_) => RecoveryAction::MarkDisconnected,
        }
    }
}

/// 指数退避重试策略：第 n 次失败后等待 base_delay * 2^n
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// 第 attempt 次（从 0 开始）失败后的等待时长
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}
