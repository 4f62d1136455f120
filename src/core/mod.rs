//! 核心编排层：错误与恢复、任务调度、意图识别、优雅关闭、客户端编排器

pub mod error;
pub mod intent;
pub mod orchestrator;
pub mod recovery;
pub mod shutdown;
pub mod task_scheduler;

pub use error::{AgentError, LlmError, McpError};
pub use intent::{Intent, IntentRoute, IntentRouter, CONFIDENCE_THRESHOLD};
pub use orchestrator::{
    best_match, create_llm_from_config, create_memory_from_config, infer_project_slug, ProjectWiseClient, PIPELINE_TIMEOUT_MESSAGE,
};
pub use recovery::{RecoveryAction, RecoveryEngine, RetryPolicy};
pub use shutdown::{SessionCleanup, ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason};
pub use task_scheduler::TaskScheduler;
