//! 记忆层：短期（对话轮与最近历史）、长期（跨会话检索）、token 预算

pub mod conversation;
pub mod long_term;
pub mod token_budget;

pub use conversation::{ConversationMemory, Message, Role, ToolCallRequest};
pub use long_term::{InMemoryStore, MemoryStore, NoopMemory};
pub use token_budget::{args_preview, truncate_by_tokens, TokenEstimator};
