//! 远程 MCP 传输（Streamable HTTP）
//!
//! 基于官方 rmcp SDK：RemoteConnector 建立 Streamable HTTP 传输并完成 initialize 握手，
//! RemoteSession 持有 Peer 发起 tools/list、tools/call，close 时取消后台服务任务。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rmcp::model::{
    CallToolRequestParam, CallToolResult, ClientCapabilities, ClientInfo, Implementation,
    PaginatedRequestParam, ProtocolVersion, RawContent,
};
use rmcp::service::{Peer, RunningService, ServiceError};
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::transport::StreamableHttpClientTransport;
use rmcp::{ClientHandler, RoleClient};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::core::McpError;
use crate::mcp::{Connector, ToolDescriptor, ToolServer};

const CLIENT_NAME: &str = "projectwise";

#[derive(Clone)]
struct ProjectWiseClientHandler {
    info: ClientInfo,
}

impl ClientHandler for ProjectWiseClientHandler {
    fn get_info(&self) -> ClientInfo {
        self.info.clone()
    }
}

fn build_client_info() -> ClientInfo {
    ClientInfo {
        protocol_version: ProtocolVersion::LATEST,
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: CLIENT_NAME.to_string(),
            title: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
            icons: None,
            website_url: None,
        },
    }
}

/// rmcp 的服务错误映射到会话层错误；传输关闭 / 发送失败 / 任务取消都视为「流已关闭」
fn map_service_error(err: ServiceError) -> McpError {
    let text = err.to_string();
    match err {
        ServiceError::TransportClosed
        | ServiceError::TransportSend(_)
        | ServiceError::Cancelled { .. } => McpError::StreamClosed(text),
        _ => McpError::Transport(text),
    }
}

fn map_tool(tool: rmcp::model::Tool) -> ToolDescriptor {
    ToolDescriptor {
        name: tool.name.to_string(),
        description: tool.description.map(|d| d.to_string()).unwrap_or_default(),
        input_schema: Value::Object((*tool.input_schema).clone()),
    }
}

/// 取首个文本内容；没有文本时退回 structured_content
fn first_text(result: CallToolResult) -> String {
    let text = result.content.into_iter().find_map(|content| match content.raw {
        RawContent::Text(text) => Some(text.text),
        _ => None,
    });
    match (text, result.structured_content) {
        (Some(text), _) => text,
        (None, Some(value)) => value.to_string(),
        (None, None) => String::new(),
    }
}

/// Streamable HTTP 连接器
pub struct RemoteConnector {
    http: reqwest::Client,
    request_timeout: Duration,
}

impl RemoteConnector {
    pub fn new(request_timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("ProjectWise-MCP-Client/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to create HTTP client, using default config: {}", e);
                reqwest::Client::new()
            });
        Self {
            http,
            request_timeout,
        }
    }
}

#[async_trait]
impl Connector for RemoteConnector {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn ToolServer>, McpError> {
        let transport = StreamableHttpClientTransport::with_client(
            self.http.clone(),
            StreamableHttpClientTransportConfig::with_uri(endpoint.to_string()),
        );
        let handler = ProjectWiseClientHandler {
            info: build_client_info(),
        };

        let service = tokio::time::timeout(self.request_timeout, rmcp::serve_client(handler, transport))
            .await
            .map_err(|_| {
                McpError::Timeout(format!(
                    "handshake with {} exceeded {:?}",
                    endpoint, self.request_timeout
                ))
            })?
            .map_err(|e| McpError::Handshake(e.to_string()))?;

        if let Some(info) = service.peer().peer_info() {
            debug!(
                server = %info.server_info.name,
                version = %info.server_info.version,
                "MCP handshake completed"
            );
        }

        Ok(Arc::new(RemoteSession {
            peer: service.peer().clone(),
            service: Mutex::new(Some(service)),
            request_timeout: self.request_timeout,
        }))
    }
}

/// 已握手的远程会话
pub struct RemoteSession {
    peer: Peer<RoleClient>,
    service: Mutex<Option<RunningService<RoleClient, ProjectWiseClientHandler>>>,
    request_timeout: Duration,
}

#[async_trait]
impl ToolServer for RemoteSession {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, McpError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let fut = self.peer.list_tools(Some(PaginatedRequestParam {
                cursor: cursor.take(),
            }));
            let page = tokio::time::timeout(self.request_timeout, fut)
                .await
                .map_err(|_| McpError::Timeout("tools/list".to_string()))?
                .map_err(map_service_error)?;
            tools.extend(page.tools.into_iter().map(map_tool));
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(tools)
    }

    async fn call_tool(&self, name: &str, args: Map<String, Value>) -> Result<String, McpError> {
        let fut = self.peer.call_tool(CallToolRequestParam {
            name: name.to_string().into(),
            arguments: Some(args),
        });
        let result = tokio::time::timeout(self.request_timeout, fut)
            .await
            .map_err(|_| McpError::Timeout(format!("tools/call {name}")))?
            .map_err(map_service_error)?;

        let is_error = result.is_error.unwrap_or(false);
        let text = first_text(result);
        if is_error {
            return Err(McpError::Tool(text));
        }
        Ok(text)
    }

    async fn close(&self) -> Result<(), McpError> {
        let Some(service) = self.service.lock().await.take() else {
            return Err(McpError::StreamClosed("session already closed".to_string()));
        };
        match service.cancel().await {
            Ok(reason) => {
                debug!(?reason, "MCP service stopped");
                Ok(())
            }
            Err(e) if e.is_cancelled() => Err(McpError::Transport(format!("service task cancelled: {e}"))),
            Err(e) => Err(McpError::Transport(e.to_string())),
        }
    }
}
