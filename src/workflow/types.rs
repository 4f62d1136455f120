//! 文档生成流水线类型定义
//!
//! 状态、每个状态首次尝试时强制调用的工具、按步骤计数的重试预算，以及流水线的结束结果。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub const READ_PROJECT_MARKDOWN: &str = "read_project_markdown";
pub const GET_TEMPLATE_PLACEHOLDERS: &str = "get_template_placeholders";
pub const GENERATE_PROPOSAL_DOCX: &str = "generate_proposal_docx";
/// 上下文 JSON 校验步骤（不对应远程工具）
pub const CONTEXT_STEP: &str = "context";

/// 流水线状态；除有限次重试回退外单调前进
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineState {
    /// 尚未读取项目文档
    Initial,
    /// 已读取项目文档原文
    RawReady,
    /// 已获得模板占位符列表
    PlaceholdersObtained,
    /// 完整的上下文 JSON 已交给模型
    ContextSent,
    /// 文档已生成
    DocSaved,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Initial => "INITIAL",
            PipelineState::RawReady => "RAW_READY",
            PipelineState::PlaceholdersObtained => "PLACEHOLDERS_OBTAINED",
            PipelineState::ContextSent => "CONTEXT_SENT",
            PipelineState::DocSaved => "DOC_SAVED",
        }
    }

    /// 该状态首次尝试时强制选择的工具；重试时交由模型自行决定
    pub fn forced_tool(&self) -> Option<&'static str> {
        match self {
            PipelineState::Initial => Some(READ_PROJECT_MARKDOWN),
            PipelineState::RawReady => Some(GET_TEMPLATE_PLACEHOLDERS),
            PipelineState::PlaceholdersObtained | PipelineState::ContextSent => Some(GENERATE_PROPOSAL_DOCX),
            PipelineState::DocSaved => None,
        }
    }
}

/// 单次流水线运行内的重试计数：步骤名 → 失败次数；同一步骤失败两次即终止
#[derive(Debug, Clone, Default)]
pub struct RetryCounters {
    counts: HashMap<String, u32>,
}

impl RetryCounters {
    /// 每个步骤允许的重试次数
    pub const MAX_RETRIES: u32 = 1;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self, step: &str) -> u32 {
        self.counts.get(step).copied().unwrap_or(0)
    }

    /// 记录一次失败，返回是否仍可重试
    pub fn record_failure(&mut self, step: &str) -> bool {
        let count = self.counts.entry(step.to_string()).or_insert(0);
        *count += 1;
        *count <= Self::MAX_RETRIES
    }
}

/// 流水线结束方式
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    /// 文档已生成，message 为模型收尾文本（为空时给出默认提示）
    Completed {
        doc_path: Option<String>,
        message: String,
    },
    /// 某一步骤重试后仍失败，携带面向用户的说明
    Failed(String),
    /// 轮数耗尽；若此前已生成文档则带上路径
    Exhausted { doc_path: Option<String> },
}

impl PipelineOutcome {
    /// 面向用户的文本
    pub fn message(&self) -> String {
        match self {
            PipelineOutcome::Completed { message, .. } => message.clone(),
            PipelineOutcome::Failed(reason) => reason.clone(),
            PipelineOutcome::Exhausted { doc_path: Some(path) } => path.clone(),
            PipelineOutcome::Exhausted { doc_path: None } => {
                "Workflow berhenti: mencapai batas maksimum iterasi.".to_string()
            }
        }
    }

    pub fn doc_path(&self) -> Option<&str> {
        match self {
            PipelineOutcome::Completed { doc_path, .. } | PipelineOutcome::Exhausted { doc_path } => {
                doc_path.as_deref()
            }
            PipelineOutcome::Failed(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forced_tool_table() {
        assert_eq!(PipelineState::Initial.forced_tool(), Some(READ_PROJECT_MARKDOWN));
        assert_eq!(PipelineState::RawReady.forced_tool(), Some(GET_TEMPLATE_PLACEHOLDERS));
        assert_eq!(
            PipelineState::PlaceholdersObtained.forced_tool(),
            Some(GENERATE_PROPOSAL_DOCX)
        );
        assert_eq!(PipelineState::DocSaved.forced_tool(), None);
    }

    #[test]
    fn test_second_failure_is_fatal() {
        let mut retries = RetryCounters::new();
        assert_eq!(retries.attempts(READ_PROJECT_MARKDOWN), 0);
        assert!(retries.record_failure(READ_PROJECT_MARKDOWN));
        assert!(!retries.record_failure(READ_PROJECT_MARKDOWN));
        // 其它步骤独立计数
        assert!(retries.record_failure(CONTEXT_STEP));
    }

    #[test]
    fn test_outcome_messages() {
        let exhausted = PipelineOutcome::Exhausted { doc_path: None };
        assert_eq!(exhausted.message(), "Workflow berhenti: mencapai batas maksimum iterasi.");
        let with_path = PipelineOutcome::Exhausted {
            doc_path: Some("/out.docx".into()),
        };
        assert_eq!(with_path.doc_path(), Some("/out.docx"));
    }
}
