//! MCP 会话管理
//!
//! SessionManager 独占工具服务器会话：connect / call_tool / list_tools / cleanup / is_connected，
//! 并在连接期间运行两个后台任务（心跳、工具目录刷新）。
//!
//! 不变量：
//! - 同一时刻最多一个活动会话；会话句柄与 connected 标志只在 lifecycle 锁内被替换。
//! - lifecycle 锁即「重连锁」：所有发现会话已断开的调用方在此串行，同一时刻最多一次重连在途；
//!   等锁期间若已有一次连接尝试完成（epoch 变化），直接采用那次的结果而不再发起新的尝试。
//! - 任何检测到的故障都会立即清除 connected 标志，下一次操作据此走重连逻辑。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::{McpError, RecoveryAction, RecoveryEngine};
use crate::mcp::{Connector, ToolCatalog, ToolDescriptor, ToolServer};

/// 服务端约定存在的无参心跳工具
pub const HEARTBEAT_TOOL: &str = "heartbeat";

/// 会话参数
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub endpoint: String,
    pub heartbeat_interval: Duration,
    pub refresh_interval: Duration,
    pub auto_reconnect: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:5000/projectwise/mcp".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            refresh_interval: Duration::from_secs(60),
            auto_reconnect: true,
        }
    }
}

/// 会话状态快照（供控制接口 / CLI 展示）
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub connected: bool,
    pub auto_reconnect: bool,
    pub endpoint: String,
    pub tool_count: usize,
    /// 距上次目录刷新的秒数；从未拉取过目录时为 None
    pub catalog_age_secs: Option<u64>,
}

struct BackgroundTasks {
    cancel: CancellationToken,
    heartbeat: JoinHandle<()>,
    refresh: JoinHandle<()>,
}

/// 受重连锁保护的生命周期状态
struct Lifecycle {
    endpoint: String,
    tasks: Option<BackgroundTasks>,
}

/// 活动会话：id 取自建立它的那次连接尝试的 epoch
type LiveSession = (u64, Arc<dyn ToolServer>);

struct Inner {
    connector: Arc<dyn Connector>,
    heartbeat_interval: Duration,
    refresh_interval: Duration,
    lifecycle: Mutex<Lifecycle>,
    session: RwLock<Option<LiveSession>>,
    connected: AtomicBool,
    auto_reconnect: AtomicBool,
    /// 每次连接尝试（无论成败）结束时递增
    epoch: AtomicU64,
    catalog: ToolCatalog,
    recovery: RecoveryEngine,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(tasks) = self.lifecycle.get_mut().tasks.take() {
            tasks.cancel.cancel();
        }
    }
}

/// 工具服务器会话管理器；clone 后共享同一会话
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(connector: Arc<dyn Connector>, config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                heartbeat_interval: config.heartbeat_interval,
                refresh_interval: config.refresh_interval,
                lifecycle: Mutex::new(Lifecycle {
                    endpoint: config.endpoint,
                    tasks: None,
                }),
                session: RwLock::new(None),
                connected: AtomicBool::new(false),
                auto_reconnect: AtomicBool::new(config.auto_reconnect),
                epoch: AtomicU64::new(0),
                catalog: ToolCatalog::new(),
                recovery: RecoveryEngine::new(),
            }),
        }
    }

    /// 会话句柄存在且 connected 标志为真
    pub fn is_connected(&self) -> bool {
        self.live_session().is_some()
    }

    pub fn auto_reconnect(&self) -> bool {
        self.inner.auto_reconnect.load(Ordering::SeqCst)
    }

    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.inner.auto_reconnect.store(enabled, Ordering::SeqCst);
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.inner.catalog
    }

    pub async fn status(&self) -> SessionStatus {
        let endpoint = self.inner.lifecycle.lock().await.endpoint.clone();
        SessionStatus {
            connected: self.is_connected(),
            auto_reconnect: self.auto_reconnect(),
            endpoint,
            tool_count: self.inner.catalog.len(),
            catalog_age_secs: self.inner.catalog.refreshed_at().map(|at| at.elapsed().as_secs()),
        }
    }

    /// 建立会话。已连接时直接返回 true；失败时完整回滚（无后台任务、无句柄）后返回 false。
    /// endpoint 为 None 时沿用上一次（或配置中）的地址
    pub async fn connect(&self, endpoint: Option<&str>) -> bool {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        self.connect_locked(&mut lifecycle, endpoint).await
    }

    /// 调用远程工具。会话断开且允许自动重连时，先等待（唯一一次）重连完成；
    /// 流已关闭时重连并重试一次；手动断开时立即失败，不产生任何网络请求
    pub async fn call_tool(&self, name: &str, args: Map<String, Value>) -> Result<String, McpError> {
        let (session_id, server) = self.ensure_session().await?;
        let err = match server.call_tool(name, args.clone()).await {
            Ok(text) => return Ok(text),
            Err(err) => err,
        };

        match self.inner.recovery.handle(&err) {
            RecoveryAction::ReconnectAndRetry => {
                warn!(tool = name, error = %err, "MCP stream closed, reconnecting before retry");
                self.mark_failed(session_id);
                if !self.auto_reconnect() {
                    return Err(err);
                }
                let (retry_id, server) = self.reconnect(session_id).await?;
                server.call_tool(name, args).await.map_err(|retry_err| {
                    if self.inner.recovery.handle(&retry_err) != RecoveryAction::FailFast {
                        self.mark_failed(retry_id);
                    }
                    error!(tool = name, error = %retry_err, "Tool call failed after reconnect");
                    retry_err
                })
            }
            RecoveryAction::MarkDisconnected => {
                error!(tool = name, error = %err, "Tool call failed, marking session disconnected");
                self.mark_failed(session_id);
                Err(err)
            }
            RecoveryAction::FailFast => {
                error!(tool = name, error = %err, "Tool call failed");
                Err(err)
            }
        }
    }

    /// 返回缓存的工具目录；目录为空时同步拉取一次。从不等待周期刷新任务
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, McpError> {
        let cached = self.inner.catalog.snapshot();
        if !cached.is_empty() {
            return Ok(cached);
        }
        self.fetch_tools().await
    }

    /// 按需拉取工具目录；遇到流关闭时重连并再试一次
    pub async fn fetch_tools(&self) -> Result<Vec<ToolDescriptor>, McpError> {
        let mut last_err = McpError::NotConnected;
        for attempt in 1..=2 {
            let (session_id, server) = self.ensure_session().await?;
            match server.list_tools().await {
                Ok(tools) => {
                    self.inner.catalog.replace(tools.clone());
                    return Ok(tools);
                }
                Err(e) if e.is_stream_closed() => {
                    warn!(attempt, error = %e, "tools/list hit a closed stream, reconnecting");
                    self.mark_failed(session_id);
                    last_err = e;
                }
                Err(e) => {
                    if self.inner.recovery.handle(&e) == RecoveryAction::MarkDisconnected {
                        self.mark_failed(session_id);
                    }
                    error!(error = %e, "tools/list failed");
                    return Err(e);
                }
            }
        }
        Err(last_err)
    }

    /// 关闭会话：取消并等待后台任务，关闭传输；任何失败只记录日志，结束后实例处于可复用的断开状态
    pub async fn cleanup(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        self.teardown_locked(&mut lifecycle).await;
    }

    fn live_session(&self) -> Option<LiveSession> {
        if !self.inner.connected.load(Ordering::SeqCst) {
            return None;
        }
        self.inner.session.read().ok().and_then(|s| s.clone())
    }

    /// 仅当失败的会话仍是当前会话时才清除标志，避免误伤别人刚重建的会话
    fn mark_failed(&self, session_id: u64) {
        let current = self
            .inner
            .session
            .read()
            .ok()
            .and_then(|s| s.as_ref().map(|(id, _)| *id));
        if current == Some(session_id) {
            self.inner.connected.store(false, Ordering::SeqCst);
        }
    }

    async fn ensure_session(&self) -> Result<LiveSession, McpError> {
        if let Some(live) = self.live_session() {
            return Ok(live);
        }
        if !self.auto_reconnect() {
            return Err(McpError::ManuallyDisconnected);
        }
        let seen = self.inner.epoch.load(Ordering::SeqCst);
        self.reconnect(seen).await
    }

    /// 单飞重连：seen_epoch 是调用方发现故障时看到的 epoch
    async fn reconnect(&self, seen_epoch: u64) -> Result<LiveSession, McpError> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if self.inner.epoch.load(Ordering::SeqCst) != seen_epoch {
            // 等锁期间已有一次连接尝试，采用它的结果
            return self.live_session().ok_or(McpError::NotConnected);
        }
        if let Some(live) = self.live_session() {
            return Ok(live);
        }
        if !self.auto_reconnect() {
            return Err(McpError::ManuallyDisconnected);
        }
        info!("MCP session lost, reconnecting...");
        if self.connect_locked(&mut lifecycle, None).await {
            self.live_session().ok_or(McpError::NotConnected)
        } else {
            Err(McpError::NotConnected)
        }
    }

    async fn connect_locked(&self, lifecycle: &mut Lifecycle, endpoint: Option<&str>) -> bool {
        if self.is_connected() {
            return true;
        }
        // 清掉上一次会话残留的任务与句柄
        self.teardown_locked(lifecycle).await;

        if let Some(url) = endpoint {
            lifecycle.endpoint = url.to_string();
        }
        let url = lifecycle.endpoint.clone();
        info!(endpoint = %url, "Connecting to MCP server via Streamable HTTP");

        let attempt = self.inner.epoch.load(Ordering::SeqCst) + 1;
        let result = self.open(&url).await;
        self.inner.epoch.store(attempt, Ordering::SeqCst);

        match result {
            Ok((server, tools)) => {
                self.inner.catalog.replace(tools);
                info!(tools = ?self.inner.catalog.names(), "Connected to MCP server");
                if let Ok(mut session) = self.inner.session.write() {
                    *session = Some((attempt, server.clone()));
                }
                self.inner.connected.store(true, Ordering::SeqCst);
                lifecycle.tasks = Some(self.spawn_background_tasks(attempt, server));
                true
            }
            Err(e) => {
                error!(endpoint = %url, error = %e, "Connection to MCP server failed");
                false
            }
        }
    }

    /// 打开传输、握手并拉取初始工具目录；目录拉取失败时关闭刚建立的会话
    async fn open(&self, url: &str) -> Result<(Arc<dyn ToolServer>, Vec<ToolDescriptor>), McpError> {
        let server = self.inner.connector.connect(url).await?;
        match server.list_tools().await {
            Ok(tools) => Ok((server, tools)),
            Err(e) => {
                if let Err(close_err) = server.close().await {
                    debug!(error = %close_err, "close after failed tools/list");
                }
                Err(e)
            }
        }
    }

    async fn teardown_locked(&self, lifecycle: &mut Lifecycle) {
        let had_tasks = lifecycle.tasks.is_some();
        if let Some(tasks) = lifecycle.tasks.take() {
            tasks.cancel.cancel();
            for (name, handle) in [("heartbeat", tasks.heartbeat), ("catalog_refresh", tasks.refresh)] {
                match handle.await {
                    Ok(()) => {}
                    Err(e) if e.is_cancelled() => debug!(task = name, "background task cancelled"),
                    Err(e) => warn!(task = name, error = %e, "background task ended abnormally"),
                }
            }
        }

        self.inner.connected.store(false, Ordering::SeqCst);
        let session = self.inner.session.write().ok().and_then(|mut s| s.take());
        let had_session = session.is_some();
        if let Some((_, server)) = session {
            match server.close().await {
                Ok(()) => {}
                Err(e) if e.is_benign_shutdown() => {
                    debug!(error = %e, "cleanup: ignored benign shutdown condition")
                }
                Err(e) => error!(error = %e, "cleanup: transport teardown failed"),
            }
        }

        if had_tasks || had_session {
            info!("MCP session disconnected");
        }
    }

    fn spawn_background_tasks(&self, session_id: u64, server: Arc<dyn ToolServer>) -> BackgroundTasks {
        let cancel = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::downgrade(&self.inner),
            session_id,
            server,
            self.inner.heartbeat_interval,
            cancel.clone(),
        ));
        let refresh = tokio::spawn(refresh_loop(
            Arc::downgrade(&self.inner),
            self.inner.refresh_interval,
            cancel.clone(),
        ));
        BackgroundTasks {
            cancel,
            heartbeat,
            refresh,
        }
    }

    /// 心跳失败后的恢复：先清理，再（若允许）重连。期间若已有人重连则什么都不做
    async fn recover_after_heartbeat(&self, failed_session: u64) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if self.inner.epoch.load(Ordering::SeqCst) != failed_session {
            return;
        }
        self.teardown_locked(&mut lifecycle).await;
        if !self.auto_reconnect() {
            return;
        }
        if !self.connect_locked(&mut lifecycle, None).await {
            warn!("Reconnect after heartbeat failure did not succeed");
        }
    }
}

async fn heartbeat_loop(
    inner: Weak<Inner>,
    session_id: u64,
    server: Arc<dyn ToolServer>,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("heartbeat loop cancelled");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("heartbeat loop cancelled");
                return;
            }
            r = server.call_tool(HEARTBEAT_TOOL, Map::new()) => r,
        };

        let err = match result {
            Ok(_) => {
                debug!("heartbeat ok");
                continue;
            }
            Err(e) => e,
        };

        if is_quiet_failure(&err, &cancel) {
            debug!(error = %err, "heartbeat stopped during shutdown");
        } else {
            warn!(error = %err, "Heartbeat failed");
        }

        let Some(inner) = inner.upgrade() else {
            return;
        };
        let manager = SessionManager { inner };
        manager.mark_failed(session_id);
        // 清理会取消并等待本任务，所以放到独立任务里做
        tokio::spawn(async move {
            manager.recover_after_heartbeat(session_id).await;
        });
        return;
    }
}

fn is_quiet_failure(err: &McpError, cancel: &CancellationToken) -> bool {
    cancel.is_cancelled() || err.is_benign_shutdown()
}

async fn refresh_loop(inner: Weak<Inner>, interval: Duration, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("catalog refresh loop cancelled");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        let Some(manager) = inner.upgrade().map(|inner| SessionManager { inner }) else {
            return;
        };
        let Some((session_id, server)) = manager.live_session() else {
            debug!("skip catalog refresh: disconnected");
            continue;
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            r = server.list_tools() => r,
        };
        match result {
            Ok(tools) => {
                debug!(count = tools.len(), "tool catalog refreshed");
                manager.inner.catalog.replace(tools);
            }
            Err(e) => {
                warn!(error = %e, "tool catalog refresh failed");
                if e.is_stream_closed() {
                    manager.mark_failed(session_id);
                }
            }
        }
    }
}
