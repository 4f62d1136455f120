//! 工作流：提案文档生成流水线（状态机 + 每步重试预算）

pub mod proposal;
pub mod types;

pub use proposal::{context_gaps, normalize_project_name, DocGenPipeline, PLACEHOLDERS_INCOMPLETE_MESSAGE};
pub use types::{
    PipelineOutcome, PipelineState, RetryCounters, CONTEXT_STEP, GENERATE_PROPOSAL_DOCX, GET_TEMPLATE_PLACEHOLDERS,
    READ_PROJECT_MARKDOWN,
};
