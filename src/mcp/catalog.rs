//! 工具目录缓存
//!
//! 缓存远程服务器的工具列表（name → ToolDescriptor），刷新时整体替换；读取不会等待刷新任务。

use std::collections::BTreeMap;
use std::sync::RwLock;
use tokio::time::Instant;

use crate::mcp::ToolDescriptor;

#[derive(Default)]
struct CatalogInner {
    tools: BTreeMap<String, ToolDescriptor>,
    refreshed_at: Option<Instant>,
}

/// 工具目录：读多写少，写入只发生在连接、周期刷新与按需拉取时
#[derive(Default)]
pub struct ToolCatalog {
    inner: RwLock<CatalogInner>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 整体替换目录
    pub fn replace(&self, tools: Vec<ToolDescriptor>) {
        let map = tools.into_iter().map(|t| (t.name.clone(), t)).collect();
        if let Ok(mut inner) = self.inner.write() {
            inner.tools = map;
            inner.refreshed_at = Some(Instant::now());
        }
    }

    /// 当前目录快照（按名称排序）
    pub fn snapshot(&self) -> Vec<ToolDescriptor> {
        self.inner
            .read()
            .map(|inner| inner.tools.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, name: &str) -> Option<ToolDescriptor> {
        self.inner.read().ok().and_then(|inner| inner.tools.get(name).cloned())
    }

    pub fn names(&self) -> Vec<String> {
        self.inner
            .read()
            .map(|inner| inner.tools.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|inner| inner.tools.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn refreshed_at(&self) -> Option<Instant> {
        self.inner.read().ok().and_then(|inner| inner.refreshed_at)
    }
}
