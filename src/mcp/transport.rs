//! 工具服务器传输抽象
//!
//! Connector 负责打开传输并完成 initialize 握手，得到一个 ToolServer 会话句柄；
//! ToolServer 提供 list_tools / call_tool / close。SessionManager 只依赖这两个 trait，
//! 生产环境由 rmcp Streamable HTTP 实现，测试用 mock 实现。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::McpError;

/// 工具描述：名称、描述、参数 JSON Schema；获取后不可变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }

    /// 无参数工具（input_schema 为空对象 schema）
    pub fn no_args(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(
            name,
            description,
            serde_json::json!({ "type": "object", "properties": {} }),
        )
    }
}

/// 一个已握手的工具服务器会话
#[async_trait]
pub trait ToolServer: Send + Sync {
    /// 拉取完整工具列表（含分页）
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, McpError>;

    /// 调用工具，返回首个文本内容
    async fn call_tool(&self, name: &str, args: Map<String, Value>) -> Result<String, McpError>;

    /// 关闭会话与传输；可能返回良性的「正在关闭」错误
    async fn close(&self) -> Result<(), McpError>;
}

/// 打开传输并完成协议握手
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn ToolServer>, McpError>;
}
