//! Mock 工具服务器（用于测试）
//!
//! MockToolServer 按工具名返回脚本化结果，可注入 list_tools / close 失败并记录调用；
//! MockConnector 每次 connect 返回同一个 MockToolServer，并统计连接尝试次数。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::core::McpError;
use crate::mcp::{Connector, ToolDescriptor, ToolServer};

/// 脚本化的工具服务器
pub struct MockToolServer {
    tools: Mutex<Vec<ToolDescriptor>>,
    scripted: Mutex<HashMap<String, VecDeque<Result<String, McpError>>>>,
    defaults: Mutex<HashMap<String, String>>,
    delays: Mutex<HashMap<String, Duration>>,
    calls: Mutex<Vec<(String, Map<String, Value>)>>,
    list_errors: Mutex<VecDeque<McpError>>,
    close_error: Mutex<Option<McpError>>,
    closes: AtomicUsize,
}

impl MockToolServer {
    pub fn new(tools: Vec<ToolDescriptor>) -> Self {
        let mut defaults = HashMap::new();
        defaults.insert("heartbeat".to_string(), "ok".to_string());
        Self {
            tools: Mutex::new(tools),
            scripted: Mutex::new(HashMap::new()),
            defaults: Mutex::new(defaults),
            delays: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            list_errors: Mutex::new(VecDeque::new()),
            close_error: Mutex::new(None),
            closes: AtomicUsize::new(0),
        }
    }

    /// ProjectWise 服务端的常见工具集
    pub fn with_default_tools() -> Self {
        Self::new(default_tools())
    }

    pub fn set_tools(&self, tools: Vec<ToolDescriptor>) {
        if let Ok(mut t) = self.tools.lock() {
            *t = tools;
        }
    }

    /// 工具的默认返回（脚本队列耗尽后使用）
    pub fn set_default(&self, tool: &str, output: impl Into<String>) {
        if let Ok(mut d) = self.defaults.lock() {
            d.insert(tool.to_string(), output.into());
        }
    }

    /// 追加一次性的脚本结果，按 FIFO 消费
    pub fn push_response(&self, tool: &str, result: Result<String, McpError>) {
        if let Ok(mut s) = self.scripted.lock() {
            s.entry(tool.to_string()).or_default().push_back(result);
        }
    }

    pub fn set_delay(&self, tool: &str, delay: Duration) {
        if let Ok(mut d) = self.delays.lock() {
            d.insert(tool.to_string(), delay);
        }
    }

    /// 下一次 list_tools 失败
    pub fn fail_list_tools(&self, err: McpError) {
        if let Ok(mut e) = self.list_errors.lock() {
            e.push_back(err);
        }
    }

    /// 之后每次 close 都返回该错误
    pub fn fail_close(&self, err: McpError) {
        if let Ok(mut e) = self.close_error.lock() {
            *e = Some(err);
        }
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<(String, Map<String, Value>)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn calls_to(&self, tool: &str) -> usize {
        self.calls
            .lock()
            .map(|c| c.iter().filter(|(name, _)| name == tool).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl ToolServer for MockToolServer {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, McpError> {
        if let Some(err) = self.list_errors.lock().ok().and_then(|mut e| e.pop_front()) {
            return Err(err);
        }
        Ok(self.tools.lock().map(|t| t.clone()).unwrap_or_default())
    }

    async fn call_tool(&self, name: &str, args: Map<String, Value>) -> Result<String, McpError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((name.to_string(), args));
        }
        let delay = self.delays.lock().ok().and_then(|d| d.get(name).copied());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self
            .scripted
            .lock()
            .ok()
            .and_then(|mut s| s.get_mut(name).and_then(|q| q.pop_front()));
        if let Some(result) = scripted {
            return result;
        }
        match self.defaults.lock().ok().and_then(|d| d.get(name).cloned()) {
            Some(output) => Ok(output),
            None => Err(McpError::Tool(format!("unknown tool: {name}"))),
        }
    }

    async fn close(&self) -> Result<(), McpError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        match self.close_error.lock().ok().and_then(|e| e.clone()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// 返回共享 MockToolServer 的连接器
pub struct MockConnector {
    server: Arc<MockToolServer>,
    attempts: AtomicUsize,
    failures: Mutex<VecDeque<McpError>>,
    delay: Duration,
}

impl MockConnector {
    pub fn new(server: Arc<MockToolServer>) -> Self {
        Self {
            server,
            attempts: AtomicUsize::new(0),
            failures: Mutex::new(VecDeque::new()),
            delay: Duration::ZERO,
        }
    }

    /// 每次连接前等待一段时间，便于构造并发场景
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// 下一次连接失败
    pub fn fail_next(&self, err: McpError) {
        if let Ok(mut f) = self.failures.lock() {
            f.push_back(err);
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _endpoint: &str) -> Result<Arc<dyn ToolServer>, McpError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(err) = self.failures.lock().ok().and_then(|mut f| f.pop_front()) {
            return Err(err);
        }
        Ok(self.server.clone())
    }
}

fn default_tools() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor::no_args("heartbeat", "Cek koneksi server"),
        ToolDescriptor::no_args("list_kak_files", "Daftar file KAK/TOR proyek"),
        ToolDescriptor::new(
            "read_project_markdown",
            "Baca dokumen proyek (markdown)",
            json!({
                "type": "object",
                "properties": { "project_name": { "type": "string" } },
                "required": ["project_name"]
            }),
        ),
        ToolDescriptor::no_args("get_template_placeholders", "Daftar placeholder template proposal"),
        ToolDescriptor::new(
            "generate_proposal_docx",
            "Buat dokumen proposal dari context JSON",
            json!({
                "type": "object",
                "properties": {
                    "context": { "type": "object" },
                    "override_template": { "type": ["string", "null"] }
                },
                "required": ["context"]
            }),
        ),
        ToolDescriptor::new(
            "websearch",
            "Cari informasi di web",
            json!({
                "type": "object",
                "properties": { "query": { "type": "string" } },
                "required": ["query"]
            }),
        ),
    ]
}
