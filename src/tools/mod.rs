//! 工具层：远程工具执行器（超时、审计、并发限制）与结果载荷解析

pub mod executor;
pub mod payload;

pub use executor::ToolExecutor;
pub use payload::ToolPayload;
