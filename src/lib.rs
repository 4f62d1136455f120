//! ProjectWise - 常驻 MCP 会话的工具调用客户端
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误与恢复、意图识别、任务调度、优雅关闭、客户端编排器
//! - **mcp**: 工具服务器会话（Streamable HTTP、心跳、重连、工具目录）
//! - **llm**: 补全服务客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **memory**: 对话消息、短期历史、长期记忆、token 预算
//! - **react**: 通用多轮工具调用循环
//! - **tools**: 远程工具执行器与结果载荷
//! - **workflow**: 提案文档生成流水线

pub mod config;
pub mod core;
pub mod llm;
pub mod mcp;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;
pub mod workflow;

pub use crate::core::ProjectWiseClient;
