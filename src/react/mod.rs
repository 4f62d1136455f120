//! 工具调用编排：通用多轮循环（模型决定调用哪些远程工具，直到给出最终回答）

pub mod loop_;

pub use loop_::{ToolOrchestrator, INTERNAL_FAILURE_MESSAGE, PERSONA_PROMPT, TURN_BUDGET_MESSAGE};
