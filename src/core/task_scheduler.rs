//! 工具并发调度
//!
//! 用 Semaphore 限制同时在途的远程工具调用数（文档流水线默认 5）；只限制并行度，不保证顺序。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// 工具调用并发限制器，可 clone 共享同一个信号量
#[derive(Clone, Debug)]
pub struct TaskScheduler {
    tool_semaphore: Arc<Semaphore>,
}

impl TaskScheduler {
    pub fn new(max_concurrent_tools: usize) -> Self {
        Self {
            tool_semaphore: Arc::new(Semaphore::new(max_concurrent_tools.max(1))),
        }
    }

    /// 获取工具执行许可；信号量从不关闭，关闭时返回 None
    pub async fn acquire_tool(&self) -> Option<OwnedSemaphorePermit> {
        self.tool_semaphore.clone().acquire_owned().await.ok()
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(5)
    }
}
