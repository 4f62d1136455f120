//! Token 预算控制
//!
//! 记忆检索结果注入 system prompt 前按 token 预算截断，避免单条记忆撑爆上下文。

/// Token 估算器（简单的字符计数近似）
pub struct TokenEstimator;

impl TokenEstimator {
    /// 估算文本的 token 数量：ASCII 约 4 字符/token，其它字符约 1.5 字符/token
    pub fn estimate(text: &str) -> usize {
        let mut ascii_chars = 0;
        let mut non_ascii_chars = 0;

        for c in text.chars() {
            if c.is_ascii() {
                ascii_chars += 1;
            } else {
                non_ascii_chars += 1;
            }
        }

        let tokens = ascii_chars / 4 + (non_ascii_chars as f64 / 1.5).ceil() as usize;
        tokens.max(1)
    }
}

/// 按估算 token 数截断文本，超出预算时在末尾追加 "..."
pub fn truncate_by_tokens(text: &str, max_tokens: usize) -> String {
    if TokenEstimator::estimate(text) <= max_tokens {
        return text.to_string();
    }
    let mut out = String::new();
    let mut budget = max_tokens as f64;
    for c in text.chars() {
        let cost = if c.is_ascii() { 0.25 } else { 1.0 / 1.5 };
        if budget < cost {
            break;
        }
        budget -= cost;
        out.push(c);
    }
    format!("{}...", out.trim_end())
}

/// 日志用参数预览：超过 200 字符截断
pub fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
