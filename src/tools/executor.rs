//! 工具执行器
//!
//! 持有 SessionManager 与单次调用超时，execute(tool_name, args) 在超时内调用远程工具，
//! 超时或失败时转为 AgentError（ToolTimeout / ToolExecutionFailed）；每次调用输出结构化审计日志（JSON）。
//! 可选挂载 TaskScheduler，用信号量限制同时在途的调用数。

use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::time::timeout;

use crate::core::{AgentError, McpError, TaskScheduler};
use crate::mcp::SessionManager;
use crate::memory::{args_preview, ToolCallRequest};

/// 工具执行器：对每次调用施加超时，并将结果映射为 AgentError
#[derive(Clone)]
pub struct ToolExecutor {
    session: SessionManager,
    timeout: Duration,
    scheduler: Option<TaskScheduler>,
}

impl ToolExecutor {
    pub fn new(session: SessionManager, timeout_secs: u64) -> Self {
        Self {
            session,
            timeout: Duration::from_secs(timeout_secs),
            scheduler: None,
        }
    }

    /// 挂载并发限制（文档流水线使用）
    pub fn with_scheduler(mut self, scheduler: TaskScheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    /// 执行指定工具；超时返回 ToolTimeout，工具返回 Err 则转为 ToolExecutionFailed；输出 JSON 审计日志
    pub async fn execute(&self, tool_name: &str, args: Map<String, Value>) -> Result<String, AgentError> {
        let _permit = match &self.scheduler {
            Some(scheduler) => scheduler.acquire_tool().await,
            None => None,
        };

        let start = Instant::now();
        let preview = args_preview(&Value::Object(args.clone()));
        let result = timeout(self.timeout, self.session.call_tool(tool_name, args)).await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "ts": chrono::Utc::now().to_rfc3339(),
            "tool": tool_name,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(Ok(content)) => Ok(content),
            Ok(Err(e)) => Err(AgentError::ToolExecutionFailed(e.to_string())),
            Err(_) => Err(AgentError::ToolTimeout(tool_name.to_string())),
        }
    }

    /// 执行模型请求的一次工具调用；任何失败都转为该调用自己的文本结果，不影响同批其它调用
    pub async fn execute_call(&self, call: &ToolCallRequest) -> String {
        let args = match call.parsed_arguments() {
            Ok(args) => args,
            Err(e) => {
                let err = McpError::InvalidArguments(e);
                tracing::warn!(tool = %call.name, error = %err, "rejected tool call");
                return format!("Error executing {}: {}", call.name, err);
            }
        };
        match self.execute(&call.name, args).await {
            Ok(content) => content,
            Err(AgentError::ToolTimeout(_)) => format!("TIMEOUT executing {}", call.name),
            Err(AgentError::ToolExecutionFailed(e)) => format!("Error executing {}: {}", call.name, e),
            Err(e) => format!("Error executing {}: {}", call.name, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::mock::{MockConnector, MockToolServer};
    use crate::mcp::SessionConfig;
    use std::sync::Arc;

    fn executor_with(server: Arc<MockToolServer>, timeout: Duration) -> ToolExecutor {
        let connector = Arc::new(MockConnector::new(server));
        let session = SessionManager::new(connector, SessionConfig::default());
        ToolExecutor::new(session, 30).with_timeout(timeout)
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_becomes_text() {
        let server = Arc::new(MockToolServer::with_default_tools());
        server.set_default("websearch", "late");
        server.set_delay("websearch", Duration::from_secs(60));
        let executor = executor_with(server, Duration::from_secs(30));

        let out = executor
            .execute_call(&ToolCallRequest::new("c1", "websearch", "{}"))
            .await;
        assert_eq!(out, "TIMEOUT executing websearch");
        executor.session().cleanup().await;
    }

    #[tokio::test]
    async fn test_error_becomes_text() {
        let server = Arc::new(MockToolServer::with_default_tools());
        server.push_response("websearch", Err(McpError::Tool("boom".into())));
        let executor = executor_with(server, Duration::from_secs(30));

        let out = executor
            .execute_call(&ToolCallRequest::new("c1", "websearch", "{}"))
            .await;
        assert!(out.starts_with("Error executing websearch:"));
        assert!(out.contains("boom"));
        executor.session().cleanup().await;
    }

    #[tokio::test]
    async fn test_invalid_arguments_skip_network() {
        let server = Arc::new(MockToolServer::with_default_tools());
        let executor = executor_with(server.clone(), Duration::from_secs(30));

        let out = executor
            .execute_call(&ToolCallRequest::new("c1", "websearch", "[1,2]"))
            .await;
        assert!(out.starts_with("Error executing websearch: Invalid tool arguments:"));
        assert_eq!(server.calls_to("websearch"), 0);
    }

    #[tokio::test]
    async fn test_execute_ok() {
        let server = Arc::new(MockToolServer::with_default_tools());
        server.set_default("websearch", "hasil");
        let executor = executor_with(server.clone(), Duration::from_secs(30))
            .with_scheduler(TaskScheduler::new(1));

        let mut args = Map::new();
        args.insert("query".into(), Value::String("rust".into()));
        let out = executor.execute("websearch", args).await.unwrap();
        assert_eq!(out, "hasil");
        assert_eq!(server.calls()[0].1["query"], "rust");
        executor.session().cleanup().await;
    }
}
